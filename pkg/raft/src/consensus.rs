use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::sync::{Mutex, RwLock};
use rand::Rng;

use common::errors::*;

use crate::image::{Image, ImageCell, Role};
use crate::log::{LogEntry, LogEntryKind, RWLog};
use crate::persist::{PersistentState, Persister};
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftTransport, RequestVoteReply, RequestVoteRequest,
};
use crate::state_machine::ApplyMsg;
use crate::PeerId;

const MIN_ELECTION_TIMEOUT_MS: u64 = 150;
const MAX_ELECTION_TIMEOUT_MS: u64 = 300;
const HEARTBEAT_INTERVAL_MS: u64 = 50;

struct LeaderState {
    next_index: HashMap<PeerId, u64>,
    match_index: HashMap<PeerId, u64>,
}

/// The core consensus algorithm for one peer: election, replication, commit
/// advancement, snapshot install, and the apply pump. Owns no network
/// listener of its own; [crate::node::RaftNode] wires this up to a
/// transport and spawns its background loops.
pub struct ConsensusModule {
    pub id: PeerId,
    peers: Vec<PeerId>,
    transport: Arc<dyn RaftTransport>,
    persister: Arc<dyn Persister>,

    log: RwLock<RWLog>,
    image: ImageCell,

    commit_index: AtomicU64,
    last_applied: AtomicU64,
    /// Last log index that was already durable when this process started;
    /// applies at or below this index are replays, not live commits.
    boot_index: u64,

    leader_state: Mutex<Option<LeaderState>>,
    election_reset_at: Mutex<Instant>,

    apply_tx: Sender<ApplyMsg>,
    commit_notify_tx: Sender<()>,
    commit_notify_rx: Mutex<Option<Receiver<()>>>,

    dead: AtomicBool,
}

impl ConsensusModule {
    pub async fn new(
        id: PeerId,
        peers: Vec<PeerId>,
        transport: Arc<dyn RaftTransport>,
        persister: Arc<dyn Persister>,
    ) -> Result<(Arc<Self>, Receiver<ApplyMsg>)> {
        let state = persister.load_state().await?;
        let log = RWLog::new(state.snapshot_index, state.snapshot_term, state.log_tail);
        let boot_index = log.last_index();

        let image = ImageCell::new(Image {
            role: Role::Follower,
            current_term: state.current_term,
            voted_for: state.voted_for,
            done: Image::initial().done,
        });

        let (apply_tx, apply_rx) = unbounded();
        let (commit_notify_tx, commit_notify_rx) = unbounded();

        let commit_index = log.snapshot_index();
        let last_applied = log.snapshot_index();

        let this = Arc::new(Self {
            id,
            peers,
            transport,
            persister,
            log: RwLock::new(log),
            image,
            commit_index: AtomicU64::new(commit_index),
            last_applied: AtomicU64::new(last_applied),
            boot_index,
            leader_state: Mutex::new(None),
            election_reset_at: Mutex::new(Instant::now()),
            apply_tx,
            commit_notify_tx,
            commit_notify_rx: Mutex::new(Some(commit_notify_rx)),
            dead: AtomicBool::new(false),
        });

        Ok((this, apply_rx))
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub async fn is_leader(&self) -> bool {
        self.image.get().await.role == Role::Leader
    }

    pub async fn current_term(&self) -> u64 {
        self.image.get().await.current_term
    }

    async fn persist(&self, log: &RWLog, image: &Image) -> Result<()> {
        let state = PersistentState {
            current_term: image.current_term,
            voted_for: image.voted_for,
            snapshot_index: log.snapshot_index(),
            snapshot_term: log.snapshot_term(),
            log_tail: log.persisted_tail(),
        };
        self.persister.save_state(&state).await
    }

    async fn reset_election_timer(&self) {
        *self.election_reset_at.lock().await = Instant::now();
    }

    fn random_election_timeout() -> Duration {
        let millis = rand::thread_rng().gen_range(MIN_ELECTION_TIMEOUT_MS..=MAX_ELECTION_TIMEOUT_MS);
        Duration::from_millis(millis)
    }

    /// Submits a new command, returning (index, term) if this peer is
    /// currently the leader, or `None` otherwise.
    pub async fn start(&self, payload: Vec<u8>) -> Result<Option<(u64, u64)>> {
        let image = self.image.get().await;
        if image.role != Role::Leader {
            return Ok(None);
        }

        let mut log = self.log.write().await;
        let index = log.append(image.current_term, payload);
        self.persist(&log, &image).await?;

        if let Some(leader_state) = self.leader_state.lock().await.as_mut() {
            leader_state.match_index.insert(self.id, index);
            leader_state.next_index.insert(self.id, index + 1);
        }

        Ok(Some((index, image.current_term)))
    }

    /// Informs the consensus module that the service has captured all state
    /// up to and including `index`; the log prefix is discarded.
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        let image = self.image.get().await;
        let mut log = self.log.write().await;
        if index <= log.snapshot_index() || index > log.last_index() {
            return Ok(());
        }
        let term = log.term_at(index).ok_or_else(|| err_msg("snapshot index not in log"))?;
        log.compact(index, term);
        self.persister.save_state_and_snapshot(
            &PersistentState {
                current_term: image.current_term,
                voted_for: image.voted_for,
                snapshot_index: log.snapshot_index(),
                snapshot_term: log.snapshot_term(),
                log_tail: log.persisted_tail(),
            },
            &data,
        )
        .await
    }

    /// Whether a snapshot received out-of-band (via InstallSnapshot) should
    /// still be installed by the caller, given its own applied cursor. False
    /// if the log's snapshot has already moved past `last_included_index`
    /// (a newer install or local compaction raced ahead of this one).
    pub async fn cond_install_snapshot(&self, _last_included_term: u64, last_included_index: u64) -> bool {
        let log = self.log.read().await;
        last_included_index >= log.snapshot_index()
    }

    // ---- RPC handlers ----

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteReply {
        let mut image = self.image.get().await;

        if req.term > image.current_term {
            image = self
                .image
                .update(|img| Image {
                    role: Role::Follower,
                    current_term: req.term,
                    voted_for: None,
                    done: img.done.clone(),
                })
                .await;
        }

        if req.term < image.current_term {
            return RequestVoteReply {
                term: image.current_term,
                vote_granted: false,
            };
        }

        let already_voted_other = matches!(image.voted_for, Some(v) if v != req.candidate_id);
        let log = self.log.read().await;
        let caller_up_to_date = req.last_log_term > log.last_term()
            || (req.last_log_term == log.last_term() && req.last_log_index >= log.last_index());

        let grant = !already_voted_other && caller_up_to_date;

        if grant {
            let new_image = self
                .image
                .update(|img| Image {
                    role: Role::Follower,
                    current_term: img.current_term,
                    voted_for: Some(req.candidate_id),
                    done: img.done.clone(),
                })
                .await;
            if let Err(e) = self.persist(&log, &new_image).await {
                eprintln!("[raft {}] failed to persist vote for {} in term {}: {:?}", self.id, req.candidate_id, new_image.current_term, e);
                self.kill();
                return RequestVoteReply {
                    term: new_image.current_term,
                    vote_granted: false,
                };
            }
            drop(log);
            self.reset_election_timer().await;
            return RequestVoteReply {
                term: new_image.current_term,
                vote_granted: true,
            };
        }

        RequestVoteReply {
            term: image.current_term,
            vote_granted: false,
        }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesReply {
        let mut image = self.image.get().await;

        if req.term < image.current_term {
            return AppendEntriesReply {
                term: image.current_term,
                success: false,
                valid: true,
                conflict_index: 0,
                conflict_term: None,
            };
        }

        if req.term > image.current_term || image.role != Role::Follower {
            image = self
                .image
                .update(|img| Image {
                    role: Role::Follower,
                    current_term: req.term,
                    voted_for: if req.term > img.current_term {
                        Some(req.leader_id)
                    } else {
                        img.voted_for
                    },
                    done: img.done.clone(),
                })
                .await;
        }
        self.reset_election_timer().await;

        let mut log = self.log.write().await;

        if req.prev_log_index > log.last_index() {
            return AppendEntriesReply {
                term: image.current_term,
                success: false,
                valid: true,
                conflict_index: log.last_index() + 1,
                conflict_term: None,
            };
        }

        if req.prev_log_index >= log.snapshot_index() {
            let prev_term = log.term_at(req.prev_log_index);
            if prev_term != Some(req.prev_log_term) {
                let conflict_term = prev_term;
                let conflict_index = conflict_term
                    .map(|t| log.first_index_with_term(t))
                    .unwrap_or(log.snapshot_index() + 1);
                return AppendEntriesReply {
                    term: image.current_term,
                    success: false,
                    valid: true,
                    conflict_index,
                    conflict_term,
                };
            }
        }

        let new_entries: Vec<LogEntry> = req
            .entries
            .into_iter()
            .filter(|e| e.index > log.snapshot_index())
            .collect();
        let append_from = req.prev_log_index.max(log.snapshot_index()) + 1;
        log.truncate_and_append(append_from, new_entries);

        if let Err(e) = self.persist(&log, &image).await {
            eprintln!("[raft {}] failed to persist entries from leader {} in term {}: {:?}", self.id, req.leader_id, image.current_term, e);
            self.kill();
            return AppendEntriesReply {
                term: image.current_term,
                success: false,
                valid: true,
                conflict_index: 0,
                conflict_term: None,
            };
        }

        let last_new_index = log.last_index();
        if req.leader_commit > self.commit_index.load(Ordering::SeqCst) {
            let new_commit = req.leader_commit.min(last_new_index);
            self.commit_index.store(new_commit, Ordering::SeqCst);
            let _ = self.commit_notify_tx.send(()).await;
        }

        // Our captured Image may have been superseded by a concurrent role
        // or term change while we were persisting; if so the leader must
        // not trust the rest of this reply.
        let valid = !image.done.is_done().await;

        AppendEntriesReply {
            term: image.current_term,
            success: true,
            valid,
            conflict_index: 0,
            conflict_term: None,
        }
    }

    pub async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotReply {
        let mut image = self.image.get().await;

        if req.term < image.current_term {
            return InstallSnapshotReply {
                term: image.current_term,
            };
        }

        if req.term > image.current_term {
            image = self
                .image
                .update(|img| Image {
                    role: Role::Follower,
                    current_term: req.term,
                    voted_for: Some(req.leader_id),
                    done: img.done.clone(),
                })
                .await;
        }
        self.reset_election_timer().await;

        let mut log = self.log.write().await;
        if req.last_included_index <= log.snapshot_index() {
            return InstallSnapshotReply {
                term: image.current_term,
            };
        }

        if log.entry_at(req.last_included_index).map(|e| e.term) == Some(req.last_included_term) {
            log.compact(req.last_included_index, req.last_included_term);
        } else {
            log.install_snapshot(req.last_included_index, req.last_included_term);
        }

        if let Err(e) = self
            .persister
            .save_state_and_snapshot(
                &PersistentState {
                    current_term: image.current_term,
                    voted_for: image.voted_for,
                    snapshot_index: log.snapshot_index(),
                    snapshot_term: log.snapshot_term(),
                    log_tail: log.persisted_tail(),
                },
                &req.data,
            )
            .await
        {
            eprintln!("[raft {}] failed to persist installed snapshot at index {}: {:?}", self.id, req.last_included_index, e);
            self.kill();
            return InstallSnapshotReply {
                term: image.current_term,
            };
        }

        if req.last_included_index > self.commit_index.load(Ordering::SeqCst) {
            self.commit_index.store(req.last_included_index, Ordering::SeqCst);
        }
        if req.last_included_index > self.last_applied.load(Ordering::SeqCst) {
            self.last_applied.store(req.last_included_index, Ordering::SeqCst);
        }
        let _ = self
            .apply_tx
            .send(ApplyMsg::Snapshot {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                data: req.data,
            })
            .await;

        InstallSnapshotReply {
            term: image.current_term,
        }
    }

    // ---- background loops ----

    async fn start_election(self: &Arc<Self>) {
        let image = self
            .image
            .update(|img| Image {
                role: Role::Candidate,
                current_term: img.current_term + 1,
                voted_for: Some(self.id),
                done: img.done.clone(),
            })
            .await;
        {
            let log = self.log.read().await;
            if let Err(e) = self.persist(&log, &image).await {
                eprintln!("[raft {}] failed to persist candidacy for term {}: {:?}", self.id, image.current_term, e);
                self.kill();
                return;
            }
        }
        eprintln!("[raft {}] became candidate for term {}", self.id, image.current_term);
        self.reset_election_timer().await;

        let (last_log_index, last_log_term) = {
            let log = self.log.read().await;
            (log.last_index(), log.last_term())
        };

        let mut votes = 1usize;
        let majority = self.peers.len() / 2 + 1;

        let mut futs = Vec::new();
        for &peer in self.peers.iter().filter(|p| **p != self.id) {
            let transport = self.transport.clone();
            let req = RequestVoteRequest {
                term: image.current_term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            };
            futs.push(async move { transport.request_vote(peer, req).await });
        }

        let results = futures::future::join_all(futs).await;
        for result in results {
            if self.is_dead() {
                return;
            }
            let current = self.image.get().await;
            if current.current_term != image.current_term || current.role != Role::Candidate {
                return;
            }
            match result {
                Ok(reply) => {
                    if reply.term > image.current_term {
                        self.image
                            .update(|img| Image {
                                role: Role::Follower,
                                current_term: reply.term,
                                voted_for: None,
                                done: img.done.clone(),
                            })
                            .await;
                        return;
                    }
                    if reply.vote_granted {
                        votes += 1;
                    }
                }
                Err(_) => continue,
            }
        }

        if votes < majority {
            return;
        }

        let current = self.image.get().await;
        if current.current_term != image.current_term || current.role != Role::Candidate {
            return;
        }
        self.become_leader(image.current_term).await;
    }

    async fn become_leader(self: &Arc<Self>, term: u64) {
        let updated = self
            .image
            .update(|img| {
                if img.current_term != term || img.role != Role::Candidate {
                    img.clone()
                } else {
                    Image {
                        role: Role::Leader,
                        current_term: img.current_term,
                        voted_for: img.voted_for,
                        done: img.done.clone(),
                    }
                }
            })
            .await;
        if updated.role != Role::Leader {
            return;
        }
        eprintln!("[raft {}] became leader for term {}", self.id, term);

        let last_index = self.log.read().await.last_index();
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &peer in &self.peers {
            next_index.insert(peer, last_index + 1);
            match_index.insert(peer, if peer == self.id { last_index } else { 0 });
        }
        *self.leader_state.lock().await = Some(LeaderState {
            next_index,
            match_index,
        });
    }

    /// Runs forever until killed, replicating to `peer` whenever this node
    /// is the leader and otherwise idling.
    pub async fn run_peer_replication(self: Arc<Self>, peer: PeerId) {
        loop {
            if self.is_dead() {
                return;
            }
            if self.is_leader().await {
                self.replicate_to_peer(peer).await;
            }
            async_std::task::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS)).await;
        }
    }

    async fn replicate_to_peer(self: &Arc<Self>, peer: PeerId) {
        let image = self.image.get().await;
        if image.role != Role::Leader {
            return;
        }

        let next_index = match self.leader_state.lock().await.as_ref() {
            Some(ls) => *ls.next_index.get(&peer).unwrap_or(&1),
            None => return,
        };

        let log = self.log.read().await;
        if next_index <= log.snapshot_index() {
            let snapshot_index = log.snapshot_index();
            let snapshot_term = log.snapshot_term();
            drop(log);
            let data = self.persister.load_snapshot().await.unwrap_or_default();
            let req = InstallSnapshotRequest {
                term: image.current_term,
                leader_id: self.id,
                last_included_index: snapshot_index,
                last_included_term: snapshot_term,
                data,
            };
            if let Ok(reply) = self.transport.install_snapshot(peer, req).await {
                if reply.term > image.current_term {
                    self.step_down(reply.term).await;
                    return;
                }
                if let Some(ls) = self.leader_state.lock().await.as_mut() {
                    ls.match_index.insert(peer, snapshot_index);
                    ls.next_index.insert(peer, snapshot_index + 1);
                }
                self.advance_commit_index().await;
            }
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
        let entries = log.entries_after(prev_log_index);
        let leader_commit = self.commit_index.load(Ordering::SeqCst);
        drop(log);

        let req = AppendEntriesRequest {
            term: image.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        let reply = match self.transport.append_entries(peer, req.clone()).await {
            Ok(r) => r,
            Err(_) => return,
        };

        if !reply.valid {
            return;
        }

        if reply.term > image.current_term {
            self.step_down(reply.term).await;
            return;
        }

        let current = self.image.get().await;
        if current.current_term != image.current_term || current.role != Role::Leader {
            return;
        }

        if reply.success {
            let new_match = prev_log_index + req.entries.len() as u64;
            if let Some(ls) = self.leader_state.lock().await.as_mut() {
                let existing = *ls.match_index.get(&peer).unwrap_or(&0);
                if new_match > existing {
                    ls.match_index.insert(peer, new_match);
                    ls.next_index.insert(peer, new_match + 1);
                }
            }
            self.advance_commit_index().await;
        } else if let Some(ls) = self.leader_state.lock().await.as_mut() {
            let next = match reply.conflict_term {
                None => reply.conflict_index.max(1),
                Some(term) => {
                    let log = self.log.try_read();
                    match log {
                        Some(log) => {
                            let candidate = log.first_index_with_term(term);
                            if log.term_at(candidate) == Some(term) {
                                let mut idx = candidate;
                                while log.term_at(idx + 1) == Some(term) {
                                    idx += 1;
                                }
                                idx + 1
                            } else {
                                reply.conflict_index
                            }
                        }
                        None => reply.conflict_index,
                    }
                }
            };
            ls.next_index.insert(peer, next.max(1));
        }
    }

    async fn step_down(self: &Arc<Self>, term: u64) {
        eprintln!("[raft {}] stepping down to follower, observed higher term {}", self.id, term);
        self.image
            .update(|img| Image {
                role: Role::Follower,
                current_term: term,
                voted_for: None,
                done: img.done.clone(),
            })
            .await;
    }

    async fn advance_commit_index(self: &Arc<Self>) {
        let image = self.image.get().await;
        if image.role != Role::Leader {
            return;
        }
        let log = self.log.read().await;
        let last_index = log.last_index();
        let current_commit = self.commit_index.load(Ordering::SeqCst);

        let leader_state = self.leader_state.lock().await;
        let match_index = match leader_state.as_ref() {
            Some(ls) => ls.match_index.clone(),
            None => return,
        };
        drop(leader_state);

        let majority = self.peers.len() / 2 + 1;
        let mut new_commit = current_commit;
        for n in (current_commit + 1)..=last_index {
            if log.term_at(n) != Some(image.current_term) {
                continue;
            }
            let count = match_index.values().filter(|&&m| m >= n).count();
            if count >= majority {
                new_commit = n;
            }
        }

        if new_commit > current_commit {
            self.commit_index.store(new_commit, Ordering::SeqCst);
            let _ = self.commit_notify_tx.send(()).await;
        }
    }

    pub async fn run_election_timer(self: Arc<Self>) {
        loop {
            if self.is_dead() {
                return;
            }
            let timeout = Self::random_election_timeout();
            async_std::task::sleep(timeout).await;
            if self.is_dead() {
                return;
            }

            let last_reset = *self.election_reset_at.lock().await;
            if last_reset.elapsed() < timeout {
                continue;
            }
            if self.is_leader().await {
                continue;
            }
            self.start_election().await;
        }
    }

    pub async fn run_apply_pump(self: Arc<Self>) {
        let rx = self.commit_notify_rx.lock().await.take();
        let rx = match rx {
            Some(rx) => rx,
            None => return,
        };

        loop {
            if self.is_dead() {
                return;
            }

            loop {
                let commit_index = self.commit_index.load(Ordering::SeqCst);
                let last_applied = self.last_applied.load(Ordering::SeqCst);
                if last_applied >= commit_index {
                    break;
                }

                let log = self.log.read().await;
                let next = last_applied + 1;
                if next <= log.snapshot_index() {
                    self.last_applied.store(log.snapshot_index(), Ordering::SeqCst);
                    continue;
                }
                let entry = match log.entry_at(next) {
                    Some(e) => e.clone(),
                    None => break,
                };
                drop(log);

                if entry.kind == LogEntryKind::Command {
                    let replay = entry.index <= self.boot_index;
                    let _ = self
                        .apply_tx
                        .send(ApplyMsg::Command {
                            index: entry.index,
                            term: entry.term,
                            payload: entry.payload,
                            replay,
                        })
                        .await;
                }
                self.last_applied.store(entry.index, Ordering::SeqCst);
            }

            if self.is_dead() {
                return;
            }
            let _ = rx.recv().await;
        }
    }
}
