use async_trait::async_trait;

use common::errors::*;

/// One delivery from the apply pump to the owning service.
#[derive(Clone, Debug)]
pub enum ApplyMsg {
    Command {
        index: u64,
        term: u64,
        payload: Vec<u8>,
        /// True iff this delivery is reprocessing of log entries that were
        /// already persisted before this process started (i.e. no live
        /// submitter is waiting on it).
        replay: bool,
    },
    Snapshot {
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } => *index,
            ApplyMsg::Snapshot {
                last_included_index, ..
            } => *last_included_index,
        }
    }
}

/// The pluggable application layer driven by the consensus apply pump.
/// Implementations are invoked only from the single applier task for a
/// given service, so they never need to worry about concurrent `apply`
/// calls racing each other.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies one committed, already-deduplicated command and returns
    /// whatever reply bytes the service wants handed back to its caller.
    async fn apply(&self, index: u64, payload: &[u8]) -> Result<Vec<u8>>;

    async fn snapshot(&self) -> Result<Vec<u8>>;

    async fn restore(&self, data: &[u8]) -> Result<()>;
}
