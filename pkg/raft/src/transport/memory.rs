use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_std::sync::RwLock;
use async_trait::async_trait;

use common::errors::*;

use crate::consensus::ConsensusModule;
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftTransport, RequestVoteReply, RequestVoteRequest,
};
use crate::PeerId;

struct Network {
    nodes: HashMap<PeerId, Arc<ConsensusModule>>,
    /// Peers that currently refuse to receive or send anything, modeling a
    /// network partition.
    disconnected: HashSet<PeerId>,
}

/// In-memory [RaftTransport] that delivers calls directly to other nodes'
/// [ConsensusModule] handlers in the same process, with the ability to
/// simulate a partition by disconnecting a peer.
pub struct MemoryTransport {
    self_id: PeerId,
    network: Arc<RwLock<Network>>,
}

impl MemoryTransport {
    /// Builds one transport handle per id in `ids`, all sharing the same
    /// underlying network so tests can register nodes incrementally.
    pub fn new_cluster(ids: &[PeerId]) -> Vec<Self> {
        let network = Arc::new(RwLock::new(Network {
            nodes: HashMap::new(),
            disconnected: HashSet::new(),
        }));
        ids.iter()
            .map(|&id| Self {
                self_id: id,
                network: network.clone(),
            })
            .collect()
    }

    pub async fn register(&self, node: Arc<ConsensusModule>) {
        self.network.write().await.nodes.insert(self.self_id, node);
    }

    /// Drops this peer's registered node, so calls addressed to it fail as
    /// "unknown peer" instead of reaching a node that's already been
    /// replaced (e.g. by a restart after a simulated crash).
    pub async fn unregister(&self) {
        self.network.write().await.nodes.remove(&self.self_id);
    }

    pub async fn disconnect(&self, peer: PeerId) {
        self.network.write().await.disconnected.insert(peer);
    }

    pub async fn reconnect(&self, peer: PeerId) {
        self.network.write().await.disconnected.remove(&peer);
    }

    async fn peer_node(&self, peer: PeerId) -> Result<Arc<ConsensusModule>> {
        let network = self.network.read().await;
        if network.disconnected.contains(&self.self_id) || network.disconnected.contains(&peer) {
            return Err(err_msg("peer unreachable"));
        }
        network
            .nodes
            .get(&peer)
            .cloned()
            .ok_or_else(|| format_err!("unknown peer {}", peer))
    }
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn append_entries(
        &self,
        peer: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        let node = self.peer_node(peer).await?;
        Ok(node.handle_append_entries(request).await)
    }

    async fn request_vote(
        &self,
        peer: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply> {
        let node = self.peer_node(peer).await?;
        Ok(node.handle_request_vote(request).await)
    }

    async fn install_snapshot(
        &self,
        peer: PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply> {
        let node = self.peer_node(peer).await?;
        Ok(node.handle_install_snapshot(request).await)
    }
}
