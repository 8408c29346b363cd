//! The replica: role state machine, election, log replication, follower
//! append handling, and the client request pipeline, all driven by the
//! single event loop in [`Replica::run`].
//!
//! All mutable state lives behind one `Mutex<ReplicaState>`. Per the
//! single-threaded cooperative model (design notes §5), the lock is only ever
//! held across synchronous state mutation, never across an `.await` on the
//! network — exactly the discipline the reference implementation this crate
//! is descended from uses for its own `Arc<Mutex<RaftState>>`.

use crate::election::{self, APPEND_INTERVAL_MS, HEARTBEAT_INTERVAL_MS, MAX_ENTRIES_PER_APPEND};
use crate::message::{Body, Command, LogEntry, Message, Mid, BROADCAST};
use crate::raftlog::Log;
use crate::role::{LeaderState, Role};
use crate::transport::Transport;
use crate::Kv;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How long a single transport poll is allowed to block per event-loop tick.
const POLL_WAIT: Duration = Duration::from_millis(100);

pub struct ReplicaState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: Role,
    pub current_leader: String,
    pub election_deadline: Instant,
    pub log: Log,
    pub commit_index: u64,
    pub last_applied: u64,
    pub kv: Kv,
    /// Client requests deferred while no leader is known, paired with the
    /// socket address to reply to.
    pub pending: VecDeque<(Message, SocketAddr)>,
    /// Leader-only: socket address to reply to once a just-appended MID
    /// commits. Not persisted across a leadership change; a client whose
    /// request commits without an entry here simply gets its `Ok` on retry,
    /// via the duplicate-MID path.
    pub client_acks: HashMap<Mid, SocketAddr>,
}

impl ReplicaState {
    fn new() -> Self {
        ReplicaState {
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            current_leader: BROADCAST.to_string(),
            election_deadline: Instant::now() + election::random_election_timeout(),
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            kv: Kv::new(),
            pending: VecDeque::new(),
            client_acks: HashMap::new(),
        }
    }

    fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + election::random_election_timeout();
    }

    /// Adopts a higher term observed on any incoming message, per the
    /// "any -> follower on higher term" rule. Returns true if it stepped down.
    fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.current_leader = BROADCAST.to_string();
            true
        } else {
            false
        }
    }
}

pub struct Replica {
    pub id: String,
    pub peers: Vec<String>,
    pub state: Mutex<ReplicaState>,
    pub transport: Transport,
    trace: StdMutex<File>,
}

impl Replica {
    pub fn new(id: String, peers: Vec<String>, transport: Transport) -> anyhow::Result<Self> {
        let trace_path = format!("{id}.log");
        let trace_file = OpenOptions::new().create(true).append(true).open(&trace_path)?;
        Ok(Replica { id, peers, state: Mutex::new(ReplicaState::new()), transport, trace: StdMutex::new(trace_file) })
    }

    fn trace(&self, line: &str) {
        if let Ok(mut f) = self.trace.lock() {
            let _ = writeln!(f, "{line}");
        }
    }

    // ---- role transitions ----------------------------------------------

    async fn become_candidate(&self) {
        let (term, last_index, last_term) = {
            let mut state = self.state.lock().await;
            state.current_term += 1;
            state.voted_for = Some(self.id.clone());
            state.role = Role::Candidate { votes: [self.id.clone()].into_iter().collect() };
            state.reset_election_deadline();
            info!("[{}] starting election for term {}", self.id, state.current_term);
            (state.current_term, state.last_log_index(), state.last_log_term())
        };

        let msg = Message::new(
            self.id.clone(),
            BROADCAST,
            BROADCAST,
            Body::RequestVote { term, last_log_index: last_index, last_log_term: last_term },
        );
        self.trace(&format!("send {:?}", msg.body));
        let _ = self.transport.send(BROADCAST, &msg).await;
    }

    async fn become_leader(&self) {
        let (term, commit_index) = {
            let mut state = self.state.lock().await;
            state.role = Role::Leader(LeaderState::new(&self.peers, state.commit_index));
            state.current_leader = self.id.clone();
            info!("[{}] became leader for term {}", self.id, state.current_term);
            (state.current_term, state.commit_index)
        };
        self.send_append_entries(term, commit_index).await;
    }

    // ---- replication (leader) --------------------------------------------

    /// Sends a heartbeat (empty `Append`) or a chunked data `Append` to every
    /// peer, depending on how far behind each peer's `next_index` is.
    async fn send_append_entries(&self, term: u64, leader_commit: u64) {
        let per_peer = {
            let state = self.state.lock().await;
            let Some(leader) = state.role.as_leader() else { return };
            self.peers
                .iter()
                .map(|peer| {
                    let next_index = leader.next_index_for(peer);
                    let prev_index = next_index.saturating_sub(1);
                    let prev_term = state.log.term_at(prev_index).unwrap_or(0);
                    let mut entries: Vec<LogEntry> = state.log.slice_from(next_index).to_vec();
                    entries.truncate(MAX_ENTRIES_PER_APPEND);
                    (peer.clone(), prev_index, prev_term, entries)
                })
                .collect::<Vec<_>>()
        };

        for (peer, prev_index, prev_term, entries) in per_peer {
            let msg = Message::new(
                self.id.clone(),
                peer.clone(),
                self.id.clone(),
                Body::Append { term, prev_log_index: prev_index, prev_log_term: prev_term, entries, leader_commit },
            );
            self.trace(&format!("send {:?} -> {}", msg.body, peer));
            let _ = self.transport.send(&peer, &msg).await;
        }
    }

    /// Only the peers due for a heartbeat or catch-up append this tick.
    async fn send_pending_replication(&self, now: Instant) {
        let is_heartbeat_tick = {
            let mut state = self.state.lock().await;
            let Some(leader) = state.role.as_leader_mut() else { return };
            let due = now.duration_since(leader.last_heartbeat) >= Duration::from_millis(HEARTBEAT_INTERVAL_MS);
            if due {
                leader.last_heartbeat = now;
            }
            due
        };
        if is_heartbeat_tick {
            let (cur_term, commit_index) = {
                let state = self.state.lock().await;
                (state.current_term, state.commit_index)
            };
            self.send_append_entries(cur_term, commit_index).await;
            return;
        }

        // Not a heartbeat tick: still catch up any peer lagging behind the
        // log, paced at one data append per 300ms per peer.
        let last_index = {
            let state = self.state.lock().await;
            state.last_log_index()
        };
        let due_peers = {
            let mut state = self.state.lock().await;
            let Some(leader) = state.role.as_leader_mut() else { return };
            self.peers
                .iter()
                .filter(|peer| {
                    let behind = leader.match_index_for(peer) < last_index;
                    let due = leader
                        .last_append_sent
                        .get(*peer)
                        .map(|t| now.duration_since(*t) >= Duration::from_millis(APPEND_INTERVAL_MS))
                        .unwrap_or(true);
                    behind && due
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        if due_peers.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().await;
            if let Some(leader) = state.role.as_leader_mut() {
                for peer in &due_peers {
                    leader.last_append_sent.insert(peer.clone(), now);
                }
            }
        }

        let (term, per_peer) = {
            let state = self.state.lock().await;
            let Some(leader) = state.role.as_leader() else { return };
            let per_peer = due_peers
                .iter()
                .map(|peer| {
                    let next_index = leader.next_index_for(peer);
                    let prev_index = next_index.saturating_sub(1);
                    let prev_term = state.log.term_at(prev_index).unwrap_or(0);
                    let mut entries: Vec<LogEntry> = state.log.slice_from(next_index).to_vec();
                    entries.truncate(MAX_ENTRIES_PER_APPEND);
                    (peer.clone(), prev_index, prev_term, entries)
                })
                .collect::<Vec<_>>();
            (state.current_term, per_peer)
        };
        let commit_index = {
            let state = self.state.lock().await;
            state.commit_index
        };
        for (peer, prev_index, prev_term, entries) in per_peer {
            let msg = Message::new(
                self.id.clone(),
                peer.clone(),
                self.id.clone(),
                Body::Append { term, prev_log_index: prev_index, prev_log_term: prev_term, entries, leader_commit: commit_index },
            );
            let _ = self.transport.send(&peer, &msg).await;
        }
    }

    /// Sends a single `Append` to one peer using its current `next_index`.
    /// Used to retransmit immediately on a rejected append (spec §4.4).
    async fn send_append_to(&self, peer: &str, term: u64, leader_commit: u64) {
        let sent = {
            let state = self.state.lock().await;
            let Some(leader) = state.role.as_leader() else { return };
            let next_index = leader.next_index_for(peer);
            let prev_index = next_index.saturating_sub(1);
            let prev_term = state.log.term_at(prev_index).unwrap_or(0);
            let mut entries: Vec<LogEntry> = state.log.slice_from(next_index).to_vec();
            entries.truncate(MAX_ENTRIES_PER_APPEND);
            (prev_index, prev_term, entries)
        };
        let (prev_index, prev_term, entries) = sent;
        let msg = Message::new(
            self.id.clone(),
            peer.to_string(),
            self.id.clone(),
            Body::Append { term, prev_log_index: prev_index, prev_log_term: prev_term, entries, leader_commit },
        );
        self.trace(&format!("send {:?} -> {}", msg.body, peer));
        let _ = self.transport.send(peer, &msg).await;
    }

    /// Leader-side handling of a follower's `AppendOk`/`AppendFail`.
    async fn handle_append_response(&self, from: &str, term: u64, body: AppendAck) {
        let mut to_apply = Vec::new();
        let mut acks: Vec<(Mid, SocketAddr)> = Vec::new();
        let mut retransmit = false;
        {
            let mut state = self.state.lock().await;
            if state.observe_term(term) {
                info!("[{}] stepping down: saw higher term {} in append response", self.id, term);
                return;
            }
            if !state.role.is_leader() || term < state.current_term {
                return;
            }

            match body {
                AppendAck::Ok { prev_log_index, entries_len } => {
                    let new_match = prev_log_index + entries_len as u64;
                    let last_index = state.last_log_index();
                    let cluster_size = self.peers.len() + 1;
                    let current_term = state.current_term;
                    let commit_index_before = state.commit_index;

                    if let Some(leader) = state.role.as_leader_mut() {
                        let cur_match = leader.match_index_for(from);
                        if new_match > cur_match {
                            leader.match_index.insert(from.to_string(), new_match);
                        }
                        let desired_next = new_match.saturating_add(1);
                        if desired_next > leader.next_index_for(from) {
                            leader.next_index.insert(from.to_string(), desired_next);
                        }
                    }

                    // Recompute the advanced commit index: sort match_index
                    // over all peers plus the leader's own last index, take
                    // the element at position len - ceil(len/2) (0-indexed).
                    if let Some(leader) = state.role.as_leader() {
                        let mut matches: Vec<u64> = self.peers.iter().map(|p| leader.match_index_for(p)).collect();
                        matches.push(last_index);
                        matches.sort_unstable();
                        let majority_pos = matches.len() - (cluster_size - cluster_size / 2);
                        let candidate_commit = matches[majority_pos];
                        if candidate_commit > commit_index_before
                            && state.log.term_at(candidate_commit) == Some(current_term)
                        {
                            state.commit_index = candidate_commit;
                            info!("[{}] advanced commit_index to {}", self.id, candidate_commit);
                        }
                    }
                }
                AppendAck::Fail { first_index } => {
                    if let Some(leader) = state.role.as_leader_mut() {
                        let floor = leader.match_index_for(from);
                        let next = first_index.max(floor).max(1);
                        leader.next_index.insert(from.to_string(), next);
                        retransmit = true;
                    }
                }
            }

            // Apply newly committed entries to the KV map, in index order.
            while state.last_applied < state.commit_index {
                let idx = state.last_applied + 1;
                if let Some(entry) = state.log.get(idx).cloned() {
                    if let Command::Put { src, mid, key, value } = entry.command {
                        state.kv.put(key.clone(), value.clone());
                        to_apply.push(idx);
                        if let Some(addr) = state.client_acks.remove(&mid) {
                            acks.push((mid, addr));
                        } else {
                            debug!("[{}] committed {} for {} with no pending client addr (retry will get it)", self.id, idx, src);
                        }
                    }
                }
                state.last_applied = idx;
            }
        }
        let (cur_term, commit_index) = {
            let state = self.state.lock().await;
            (state.current_term, state.commit_index)
        };

        if retransmit {
            self.send_append_to(from, cur_term, commit_index).await;
        }
        for (mid, addr) in acks {
            let ok = Message::new(self.id.clone(), BROADCAST, self.id.clone(), Body::Ok { mid, value: None });
            let _ = self.transport.send_reply_to(addr, &ok).await;
        }
        if !to_apply.is_empty() {
            debug!("[{}] applied indices {:?}", self.id, to_apply);
        }
    }

    // ---- follower append handling -----------------------------------------

    async fn handle_append(&self, from: &str, from_addr: SocketAddr, args: AppendArgs) {
        let AppendArgs { term, prev_log_index, prev_log_term, entries, leader_commit } = args;
        let mut replies_to_pending = Vec::new();
        let (reply, to_apply) = {
            let mut state = self.state.lock().await;
            state.observe_term(term);

            if term < state.current_term {
                let fail = Body::AppendFail { term: state.current_term, first_index: state.last_log_index() };
                (fail, Vec::new())
            } else {
                state.role = Role::Follower;
                state.current_leader = from.to_string();
                state.reset_election_deadline();

                if !state.log.matches(prev_log_index, prev_log_term) {
                    let hint = state.log.first_conflict_index(prev_log_index);
                    (Body::AppendFail { term: state.current_term, first_index: hint }, Vec::new())
                } else {
                    // A leader now exists: drain the pending-client queue by
                    // redirecting every queued request.
                    while let Some((msg, addr)) = state.pending.pop_front() {
                        replies_to_pending.push((msg, addr));
                    }

                    let insert_at = prev_log_index + 1;
                    if insert_at <= state.last_log_index() {
                        state.log.truncate_from(insert_at);
                    }
                    let entries_len = entries.len();
                    state.log.append_all(entries);

                    if leader_commit > state.commit_index {
                        state.commit_index = leader_commit.min(state.last_log_index());
                    }

                    let mut to_apply = Vec::new();
                    while state.last_applied < state.commit_index {
                        let idx = state.last_applied + 1;
                        if let Some(entry) = state.log.get(idx).cloned() {
                            if let Command::Put { key, value, .. } = entry.command {
                                state.kv.put(key, value);
                            }
                        }
                        state.last_applied = idx;
                        to_apply.push(idx);
                    }

                    (
                        Body::AppendOk {
                            term: state.current_term,
                            prev_log_index,
                            prev_log_term,
                            entries: state.log.slice_from(prev_log_index + 1).iter().take(entries_len).cloned().collect(),
                        },
                        to_apply,
                    )
                }
            }
        };

        for (msg, addr) in replies_to_pending {
            self.redirect_or_serve(msg, addr).await;
        }
        if !to_apply.is_empty() {
            debug!("[{}] applied indices {:?} from leader {}", self.id, to_apply, from);
        }

        let leader = { self.state.lock().await.current_leader.clone() };
        let reply_msg = Message::new(self.id.clone(), from.to_string(), leader, reply);
        let _ = self.transport.send_reply_to(from_addr, &reply_msg).await;
    }

    // ---- vote handling ------------------------------------------------------

    async fn handle_request_vote(&self, from: &str, from_addr: SocketAddr, term: u64, last_log_index: u64, last_log_term: u64) {
        let (reply, leader) = {
            let mut state = self.state.lock().await;
            state.observe_term(term);
            let current_term = state.current_term;

            let mut vote = false;
            if term >= current_term && state.role.is_follower() {
                let grant = election::should_grant_vote(
                    state.voted_for.as_deref(),
                    from,
                    last_log_term,
                    last_log_index,
                    state.last_log_term(),
                    state.last_log_index(),
                );
                if grant {
                    state.voted_for = Some(from.to_string());
                    state.reset_election_deadline();
                    vote = true;
                    info!("[{}] granted vote to {} for term {}", self.id, from, term);
                } else {
                    debug!("[{}] denied vote to {} for term {}", self.id, from, term);
                }
            }
            (Body::Vote { term: state.current_term, vote }, state.current_leader.clone())
        };
        let msg = Message::new(self.id.clone(), from.to_string(), leader, reply);
        let _ = self.transport.send_reply_to(from_addr, &msg).await;
    }

    async fn handle_vote(&self, from: &str, term: u64, vote: bool) {
        let mut state = self.state.lock().await;
        if state.observe_term(term) {
            return;
        }
        if !vote || term != state.current_term {
            return;
        }
        let became_leader = if let Role::Candidate { votes } = &mut state.role {
            votes.insert(from.to_string());
            votes.len() >= election::majority(self.peers.len())
        } else {
            false
        };
        drop(state);
        if became_leader {
            self.become_leader().await;
        }
    }

    // ---- client request handling --------------------------------------------

    async fn handle_get(&self, src: &str, from_addr: SocketAddr, key: String, mid: Mid) {
        enum Outcome {
            Answer(String),
            Redirect,
            Enqueue,
        }
        let (outcome, leader) = {
            let state = self.state.lock().await;
            let outcome = if state.role.is_leader() {
                Outcome::Answer(state.kv.get(&key))
            } else if matches!(state.role, Role::Candidate { .. }) {
                Outcome::Enqueue
            } else if state.current_leader != BROADCAST {
                Outcome::Redirect
            } else {
                Outcome::Enqueue
            };
            (outcome, state.current_leader.clone())
        };

        match outcome {
            Outcome::Answer(value) => {
                let msg = Message::new(self.id.clone(), src.to_string(), self.id.clone(), Body::Ok { mid, value: Some(value) });
                let _ = self.transport.send_reply_to(from_addr, &msg).await;
            }
            Outcome::Redirect => {
                let msg = Message::new(self.id.clone(), src.to_string(), leader.clone(), Body::Redirect { mid });
                let _ = self.transport.send_reply_to(from_addr, &msg).await;
            }
            Outcome::Enqueue => {
                let get = Message::new(src.to_string(), self.id.clone(), leader, Body::Get { key, mid });
                self.state.lock().await.pending.push_back((get, from_addr));
            }
        }
    }

    async fn handle_put(&self, src: &str, from_addr: SocketAddr, key: String, value: String, mid: Mid) {
        enum Outcome {
            Duplicate,
            Appended,
            Redirect,
            Enqueue,
        }
        let (outcome, leader) = {
            let mut state = self.state.lock().await;
            let outcome = if state.role.is_leader() {
                let already_committed = state
                    .log
                    .committed_slice(state.commit_index)
                    .iter()
                    .any(|e| matches!(&e.command, Command::Put { mid: m, .. } if m == &mid));
                if already_committed {
                    Outcome::Duplicate
                } else {
                    let term = state.current_term;
                    state.log.append(LogEntry {
                        term,
                        command: Command::Put { src: src.to_string(), mid: mid.clone(), key: key.clone(), value: value.clone() },
                    });
                    let last_index = state.log.last_index();
                    if let Some(leader) = state.role.as_leader_mut() {
                        leader.match_index.insert(self.id.clone(), last_index);
                    }
                    state.client_acks.insert(mid.clone(), from_addr);
                    Outcome::Appended
                }
            } else if matches!(state.role, Role::Candidate { .. }) {
                Outcome::Enqueue
            } else if state.current_leader != BROADCAST {
                Outcome::Redirect
            } else {
                Outcome::Enqueue
            };
            (outcome, state.current_leader.clone())
        };

        match outcome {
            Outcome::Duplicate => {
                let msg = Message::new(self.id.clone(), src.to_string(), self.id.clone(), Body::Ok { mid, value: None });
                let _ = self.transport.send_reply_to(from_addr, &msg).await;
            }
            Outcome::Appended => {
                let (term, commit_index) = {
                    let state = self.state.lock().await;
                    (state.current_term, state.commit_index)
                };
                self.send_append_entries(term, commit_index).await;
            }
            Outcome::Redirect => {
                let msg = Message::new(self.id.clone(), src.to_string(), leader.clone(), Body::Redirect { mid });
                let _ = self.transport.send_reply_to(from_addr, &msg).await;
            }
            Outcome::Enqueue => {
                let put = Message::new(src.to_string(), self.id.clone(), leader, Body::Put { key, value, mid });
                self.state.lock().await.pending.push_back((put, from_addr));
            }
        }
    }

    /// Replays a queued client message once a leader is known.
    async fn redirect_or_serve(&self, msg: Message, addr: SocketAddr) {
        match msg.body {
            Body::Get { key, mid } => self.handle_get(&msg.src, addr, key, mid).await,
            Body::Put { key, value, mid } => self.handle_put(&msg.src, addr, key, value, mid).await,
            _ => {}
        }
    }

    // ---- dispatch -----------------------------------------------------------

    async fn dispatch(&self, msg: Message, from_addr: SocketAddr) {
        self.trace(&format!("recv {:?} from {}", msg.body, msg.src));
        let from = msg.src.clone();
        match msg.body {
            Body::Hello => debug!("[{}] hello from {}", self.id, from),
            Body::Get { key, mid } => self.handle_get(&from, from_addr, key, mid).await,
            Body::Put { key, value, mid } => self.handle_put(&from, from_addr, key, value, mid).await,
            Body::Ok { .. } | Body::Redirect { .. } | Body::ClientFail { .. } => {
                warn!("[{}] dropping client-directed message received from {}", self.id, from);
            }
            Body::RequestVote { term, last_log_index, last_log_term } => {
                self.handle_request_vote(&from, from_addr, term, last_log_index, last_log_term).await
            }
            Body::Vote { term, vote } => self.handle_vote(&from, term, vote).await,
            Body::Append { term, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append(&from, from_addr, AppendArgs { term, prev_log_index, prev_log_term, entries, leader_commit }).await
            }
            Body::AppendOk { term, prev_log_index, entries, .. } => {
                self.handle_append_response(&from, term, AppendAck::Ok { prev_log_index, entries_len: entries.len() }).await
            }
            Body::AppendFail { term, first_index } => self.handle_append_response(&from, term, AppendAck::Fail { first_index }).await,
        }
    }

    // ---- event loop -----------------------------------------------------------

    pub async fn run(&self) -> anyhow::Result<()> {
        self.transport.announce_hello().await?;
        loop {
            let now = Instant::now();

            let should_elect = {
                let state = self.state.lock().await;
                !state.role.is_leader() && now >= state.election_deadline
            };
            if should_elect {
                self.become_candidate().await;
            }

            let is_leader = { self.state.lock().await.role.is_leader() };
            if is_leader {
                self.send_pending_replication(now).await;
            }

            if let Some((msg, addr)) = self.transport.recv_timeout(POLL_WAIT).await {
                self.dispatch(msg, addr).await;
            }
        }
    }
}

enum AppendAck {
    Ok { prev_log_index: u64, entries_len: usize },
    Fail { first_index: u64 },
}

struct AppendArgs {
    term: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
}
