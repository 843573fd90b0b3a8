use async_trait::async_trait;

use ::common::errors::*;

use crate::common::{ClientRequest, Reply};

/// Point-to-point RPC from a [crate::clerk::Clerk] (or a proxying server) to
/// one shardctrler server, addressed by server id. Mirrors
/// [raft::RaftTransport]'s shape but carries client traffic instead of
/// consensus traffic.
#[async_trait]
pub trait ShardCtrlerTransport: Send + Sync {
    async fn call(&self, server: u64, request: ClientRequest) -> Result<Reply>;
}
