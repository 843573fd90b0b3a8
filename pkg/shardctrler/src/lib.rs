pub mod clerk;
pub mod common;
pub mod configer;
pub mod itable;
pub mod rpc;
pub mod server;
pub mod transport;
pub mod waiters;

pub use clerk::Clerk;
pub use common::{ClientRequest, Command, Config, Err, Identifier, Op, OpKey, Reply, N_SHARDS};
pub use configer::{Configer, ConfigerStateMachine};
pub use itable::DuplicateTable;
pub use rpc::ShardCtrlerTransport;
pub use server::ShardCtrlerServer;
pub use waiters::WaiterRegistry;
