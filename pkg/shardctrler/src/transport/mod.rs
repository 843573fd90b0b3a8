mod memory;
mod tcp;

pub use memory::MemoryClientTransport;
pub use tcp::{run_server, TcpClientTransport};
