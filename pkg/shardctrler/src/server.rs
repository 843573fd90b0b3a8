use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_std::sync::Mutex;
use serde::{Deserialize, Serialize};

use ::common::errors::*;
use ::common::task::ChildTask;

use raft::{ApplyMsg, FilePersister, PeerId, Persister, RaftNode, RaftTransport, StateMachine};

use crate::common::{ClientRequest, Command, Identifier, Op, OpKey, Reply};
use crate::configer::ConfigerStateMachine;
use crate::itable::DuplicateTable;
use crate::waiters::WaiterRegistry;

/// How long an RPC handler will wait on its submitted index before giving
/// up and telling the client to retry elsewhere. The Go original relies on
/// the test harness's own timeouts for this; a standalone server needs its
/// own bound.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Application-state snapshot: everything the applier needs to resume from
/// a compacted log without re-executing already-applied commands. The state
/// machine's own contribution is opaque bytes produced by
/// [raft::StateMachine::snapshot]; only `duplicate_table` is this layer's.
#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    state_machine: Vec<u8>,
    duplicate_table: DuplicateTable,
}

/// The shard-configuration service: submits client operations through a
/// [RaftNode], blocks RPC handlers on the [WaiterRegistry] until they
/// commit and apply, and runs the [ConfigerStateMachine] from a single
/// applier task.
pub struct ShardCtrlerServer {
    id: PeerId,
    node: RaftNode,
    state_machine: ConfigerStateMachine,
    duplicate_table: Mutex<DuplicateTable>,
    waiters: WaiterRegistry,
    dead: AtomicBool,
    /// Number of applied command entries since the last snapshot; compared
    /// against `max_raft_state` to decide when to compact. Stands in for
    /// the original's `persister.RaftStateSize()` byte-size check, which
    /// this crate's [Persister] trait doesn't expose directly.
    entries_since_snapshot: AtomicU64,
    max_raft_state: Option<u64>,
    /// Set once, right after construction, to the applier's [ChildTask] so
    /// it stays alive as long as this server does. `None` only transiently
    /// during `start`.
    _applier: Mutex<Option<ChildTask>>,
}

impl ShardCtrlerServer {
    pub async fn start(
        id: PeerId,
        peers: Vec<PeerId>,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn RaftTransport>,
        max_raft_state: Option<u64>,
    ) -> Result<Arc<Self>> {
        let snapshot_bytes = persister.load_snapshot().await?;
        let (node, apply_rx) = RaftNode::start(peers, id, persister, transport).await?;

        let state_machine = ConfigerStateMachine::new();
        let mut duplicate_table = DuplicateTable::new();
        if !snapshot_bytes.is_empty() {
            let blob: SnapshotBlob = bincode::deserialize(&snapshot_bytes)?;
            state_machine.restore(&blob.state_machine).await?;
            duplicate_table = blob.duplicate_table;
        }

        let this = Arc::new(Self {
            id,
            node,
            state_machine,
            duplicate_table: Mutex::new(duplicate_table),
            waiters: WaiterRegistry::new(),
            dead: AtomicBool::new(false),
            entries_since_snapshot: AtomicU64::new(0),
            max_raft_state,
            _applier: Mutex::new(None),
        });

        let applier = ChildTask::spawn({
            let this = this.clone();
            async move {
                this.run_applier(apply_rx).await;
            }
        });
        *this._applier.lock().await = Some(applier);

        Ok(this)
    }

    /// Convenience constructor wiring a [FilePersister] rooted at `dir`.
    pub async fn start_with_dir<P: AsRef<Path>>(
        id: PeerId,
        peers: Vec<PeerId>,
        dir: P,
        transport: Arc<dyn RaftTransport>,
        max_raft_state: Option<u64>,
    ) -> Result<Arc<Self>> {
        let persister = Arc::new(FilePersister::new(dir));
        Self::start(id, peers, persister, transport, max_raft_state).await
    }

    pub async fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.node.kill();
        self.waiters.destroy().await;
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// The underlying consensus engine, for binding a raft-port listener
    /// (`raft::transport::tcp::run_server`) alongside this server's own
    /// client-facing listener.
    pub fn raft_consensus(&self) -> &Arc<raft::ConsensusModule> {
        self.node.consensus()
    }

    /// Single entry point for every client operation RPC; dispatches by
    /// `request.op`'s shape but all four follow the same submit/wait path.
    pub async fn handle_request(&self, request: ClientRequest) -> Reply {
        self.submit(request.id.clerk_id, request.id.seq, request.op).await
    }

    pub async fn join(&self, clerk_id: u64, seq: u64, groups: std::collections::HashMap<u64, Vec<String>>) -> Reply {
        self.submit(clerk_id, seq, Op::Join { groups }).await
    }

    pub async fn leave(&self, clerk_id: u64, seq: u64, gids: Vec<u64>) -> Reply {
        self.submit(clerk_id, seq, Op::Leave { gids }).await
    }

    pub async fn move_shard(&self, clerk_id: u64, seq: u64, shard: usize, gid: u64) -> Reply {
        self.submit(clerk_id, seq, Op::Move { shard, gid }).await
    }

    pub async fn query(&self, clerk_id: u64, seq: u64, num: i64) -> Reply {
        self.submit(clerk_id, seq, Op::Query { num }).await
    }

    async fn submit(&self, clerk_id: u64, seq: u64, op: Op) -> Reply {
        if self.is_dead() {
            return Reply::wrong_leader();
        }

        let command = Command {
            id: Identifier { clerk_id, seq },
            server_id: self.id,
            op: OpKey::from(&op),
        };

        let payload = match bincode::serialize(&command) {
            Ok(p) => p,
            Err(_) => return Reply::wrong_leader(),
        };

        let (index, _term) = match self.node.start_command(payload).await {
            Ok(Some(v)) => v,
            Ok(None) => return Reply::wrong_leader(),
            Err(_) => return Reply::wrong_leader(),
        };

        let reply = match async_std::future::timeout(SUBMIT_TIMEOUT, self.waiters.wait(index)).await {
            Ok(Some((applied_command, reply))) => {
                if applied_command == command {
                    reply
                } else {
                    Reply::wrong_leader()
                }
            }
            Ok(None) => Reply::wrong_leader(),
            Err(_) => Reply::wrong_leader(),
        };

        self.waiters.delete(index).await;
        reply
    }

    async fn run_applier(self: Arc<Self>, apply_rx: async_std::channel::Receiver<ApplyMsg>) {
        while let Ok(msg) = apply_rx.recv().await {
            if self.is_dead() {
                return;
            }

            match msg {
                ApplyMsg::Command {
                    index,
                    payload,
                    replay,
                    ..
                } => {
                    let command: Command = match bincode::deserialize(&payload) {
                        Ok(c) => c,
                        Err(e) => {
                            eprintln!("[shardctrler {}] dropping unreadable command at index {}: {:?}", self.id, index, e);
                            continue;
                        }
                    };
                    self.apply_command(index, command, replay).await;
                }
                ApplyMsg::Snapshot {
                    last_included_index,
                    last_included_term,
                    data,
                } => {
                    if self
                        .node
                        .cond_install_snapshot(last_included_term, last_included_index)
                        .await
                    {
                        match bincode::deserialize::<SnapshotBlob>(&data) {
                            Ok(blob) => {
                                if let Err(e) = self.state_machine.restore(&blob.state_machine).await {
                                    eprintln!("[shardctrler {}] failed to restore state machine from installed snapshot at index {}: {:?}", self.id, last_included_index, e);
                                }
                                *self.duplicate_table.lock().await = blob.duplicate_table;
                            }
                            Err(e) => {
                                eprintln!("[shardctrler {}] failed to decode installed snapshot at index {}: {:?}", self.id, last_included_index, e);
                            }
                        }
                        self.entries_since_snapshot.store(0, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    async fn apply_command(&self, index: u64, command: Command, replay: bool) {
        let already_reply = {
            let table = self.duplicate_table.lock().await;
            table.cached_reply(command.id.clerk_id, command.id.seq)
        };

        let reply = match already_reply {
            Some(reply) => reply,
            None => {
                let op_bytes = match bincode::serialize(&command.op) {
                    Ok(b) => b,
                    Err(e) => {
                        eprintln!("[shardctrler {}] failed to encode op at index {}: {:?}", self.id, index, e);
                        return;
                    }
                };
                let reply = match self.state_machine.apply(index, &op_bytes).await {
                    Ok(reply_bytes) => match bincode::deserialize(&reply_bytes) {
                        Ok(reply) => reply,
                        Err(e) => {
                            eprintln!("[shardctrler {}] failed to decode state machine reply at index {}: {:?}", self.id, index, e);
                            return;
                        }
                    },
                    Err(e) => {
                        eprintln!("[shardctrler {}] state machine apply failed at index {}: {:?}", self.id, index, e);
                        return;
                    }
                };
                self.duplicate_table
                    .lock()
                    .await
                    .record(command.id.clerk_id, command.id.seq, reply.clone());
                reply
            }
        };

        self.maybe_snapshot(index).await;

        let wake = command.server_id == self.id && !replay;
        self.waiters
            .set_and_broadcast(index, command, reply, wake)
            .await;
    }

    async fn maybe_snapshot(&self, applied_index: u64) {
        let max = match self.max_raft_state {
            Some(max) => max,
            None => return,
        };

        let count = self.entries_since_snapshot.fetch_add(1, Ordering::SeqCst) + 1;
        if count < max {
            return;
        }
        self.entries_since_snapshot.store(0, Ordering::SeqCst);

        let state_machine = match self.state_machine.snapshot().await {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("[shardctrler {}] failed to snapshot state machine at index {}: {:?}", self.id, applied_index, e);
                return;
            }
        };
        let blob = SnapshotBlob {
            state_machine,
            duplicate_table: self.duplicate_table.lock().await.clone(),
        };
        let data = match bincode::serialize(&blob) {
            Ok(d) => d,
            Err(_) => return,
        };
        let _ = self.node.snapshot(applied_index, data).await;
    }
}
