mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::{run_server, TcpTransport};
