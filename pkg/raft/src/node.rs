use std::sync::Arc;

use async_std::channel::Receiver;
use common::errors::*;
use common::task::ChildTask;

use crate::consensus::ConsensusModule;
use crate::persist::Persister;
use crate::rpc::RaftTransport;
use crate::state_machine::ApplyMsg;
use crate::PeerId;

/// Public handle to one peer's consensus engine. Owns the background tasks
/// (election timer, per-peer replication, apply pump); dropping it cancels
/// them, same as calling [RaftNode::kill].
pub struct RaftNode {
    consensus: Arc<ConsensusModule>,
    _tasks: Vec<ChildTask>,
}

impl RaftNode {
    pub async fn start(
        peers: Vec<PeerId>,
        me: PeerId,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Self, Receiver<ApplyMsg>)> {
        let (consensus, apply_rx) = ConsensusModule::new(me, peers.clone(), transport, persister).await?;

        let mut tasks = vec![ChildTask::spawn({
            let consensus = consensus.clone();
            async move {
                consensus.run_election_timer().await;
            }
        })];

        tasks.push(ChildTask::spawn({
            let consensus = consensus.clone();
            async move {
                consensus.run_apply_pump().await;
            }
        }));

        for peer in peers {
            if peer == me {
                continue;
            }
            let consensus = consensus.clone();
            tasks.push(ChildTask::spawn(async move {
                consensus.run_peer_replication(peer).await;
            }));
        }

        Ok((
            Self {
                consensus,
                _tasks: tasks,
            },
            apply_rx,
        ))
    }

    /// Submits `payload` for replication. Returns the index and term it was
    /// assigned if this peer is currently the leader.
    pub async fn start_command(&self, payload: Vec<u8>) -> Result<Option<(u64, u64)>> {
        self.consensus.start(payload).await
    }

    pub async fn is_leader(&self) -> bool {
        self.consensus.is_leader().await
    }

    pub async fn current_term(&self) -> u64 {
        self.consensus.current_term().await
    }

    pub async fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        self.consensus.snapshot(index, data).await
    }

    pub async fn cond_install_snapshot(&self, last_included_term: u64, last_included_index: u64) -> bool {
        self.consensus
            .cond_install_snapshot(last_included_term, last_included_index)
            .await
    }

    pub fn kill(&self) {
        self.consensus.kill();
    }

    pub fn consensus(&self) -> &Arc<ConsensusModule> {
        &self.consensus
    }
}
