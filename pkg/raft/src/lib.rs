#[macro_use]
extern crate common;

pub mod consensus;
pub mod image;
pub mod log;
pub mod node;
pub mod persist;
pub mod rpc;
pub mod state_machine;
pub mod transport;

pub use consensus::ConsensusModule;
pub use image::{Image, Role};
pub use log::{LogEntry, LogEntryKind, RWLog};
pub use node::RaftNode;
pub use persist::{FilePersister, PersistentState, Persister};
pub use rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftTransport, RequestVoteReply, RequestVoteRequest,
};
pub use state_machine::{ApplyMsg, StateMachine};
pub use transport::{run_server, MemoryTransport, TcpTransport};

pub type PeerId = u64;
