use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::errors::*;

use crate::log::LogEntry;
use crate::PeerId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// False if the responder's image changed while handling this call; the
    /// leader must treat the rest of the reply as stale.
    pub valid: bool,
    pub conflict_index: u64,
    pub conflict_term: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: PeerId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Point-to-point unreliable RPC between peers. Implementations may drop,
/// delay or reorder calls, but must never deliver a call to the wrong peer.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn append_entries(
        &self,
        peer: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply>;

    async fn request_vote(
        &self,
        peer: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply>;

    async fn install_snapshot(
        &self,
        peer: PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply>;
}
