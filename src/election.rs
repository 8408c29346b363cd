//! Randomised timeouts and vote-grant validation. Kept free of `Replica`
//! state so the grant predicate and majority arithmetic can be unit tested
//! without spinning up a transport.

use rand::Rng;
use std::time::Duration;

pub const ELECTION_TIMEOUT_MIN_MS: u64 = 500;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 800;
pub const HEARTBEAT_INTERVAL_MS: u64 = 150;
pub const APPEND_INTERVAL_MS: u64 = 300;
pub const MAX_ENTRIES_PER_APPEND: usize = 30;

/// Draws a fresh election timeout uniformly from [500ms, 800ms].
pub fn random_election_timeout() -> Duration {
    let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..=ELECTION_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

/// Number of distinct voters (including self) needed for a majority of a
/// cluster with `peer_count` peers besides the candidate.
pub fn majority(peer_count: usize) -> usize {
    #[allow(clippy::manual_div_ceil)]
    {
        (peer_count + 1) / 2 + 1
    }
}

/// Whether a candidate's log is at least as up-to-date as the voter's,
/// per the Raft log-comparison rule.
pub fn log_is_up_to_date(candidate_last_term: u64, candidate_last_index: u64, voter_last_term: u64, voter_last_index: u64) -> bool {
    candidate_last_term > voter_last_term
        || (candidate_last_term == voter_last_term && candidate_last_index >= voter_last_index)
}

/// Whether the voter should grant a vote, given the request already passed
/// term reconciliation (request.term >= current_term) and the voter's role is
/// follower at evaluation time. `voted_for` is `None`/`Some(candidate_id)` to
/// allow the grant.
pub fn should_grant_vote(
    voted_for: Option<&str>,
    candidate_id: &str,
    candidate_last_term: u64,
    candidate_last_index: u64,
    voter_last_term: u64,
    voter_last_index: u64,
) -> bool {
    let already_committed_elsewhere = matches!(voted_for, Some(v) if v != candidate_id);
    if already_committed_elsewhere {
        return false;
    }
    log_is_up_to_date(candidate_last_term, candidate_last_index, voter_last_term, voter_last_index)
}
