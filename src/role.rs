//! The three-way role state machine.
//!
//! Leader-only bookkeeping (`next_index`, `match_index`, heartbeat and
//! per-peer append pacing) lives on [`Role::Leader`]'s payload rather than on
//! a shared record with nullable fields, so it is structurally impossible to
//! read or mutate it while a follower or candidate.

use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

#[derive(Debug)]
pub enum Role {
    Follower,
    Candidate { votes: HashSet<String> },
    Leader(LeaderState),
}

#[derive(Debug)]
pub struct LeaderState {
    /// Index of the next entry to send to each peer.
    pub next_index: HashMap<String, u64>,
    /// Highest index known replicated on each peer.
    pub match_index: HashMap<String, u64>,
    /// Last time a heartbeat was broadcast to all peers.
    pub last_heartbeat: Instant,
    /// Last time a data `AppendEntries` was sent to a given peer.
    pub last_append_sent: HashMap<String, Instant>,
}

impl LeaderState {
    /// Initializes leader-only state on election: `next_index` starts at
    /// `commit_index + 1` (RPC overhead is overwritten by the first reject if
    /// a follower is further behind; this mirrors what the reference
    /// implementation seeds before sending the first heartbeat), and
    /// `match_index` at 0 for every peer.
    pub fn new(peers: &[String], commit_index: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        let mut last_append_sent = HashMap::new();
        let now = Instant::now();
        for peer in peers {
            next_index.insert(peer.clone(), commit_index + 1);
            match_index.insert(peer.clone(), 0);
            last_append_sent.insert(peer.clone(), now);
        }
        LeaderState { next_index, match_index, last_heartbeat: now, last_append_sent }
    }

    pub fn next_index_for(&self, peer: &str) -> u64 {
        *self.next_index.get(peer).unwrap_or(&1)
    }

    pub fn match_index_for(&self, peer: &str) -> u64 {
        *self.match_index.get(peer).unwrap_or(&0)
    }
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn as_leader(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate { .. } => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}
