use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_std::io::prelude::*;
use async_std::net::{TcpListener, TcpStream};
use async_trait::async_trait;

use ::common::errors::*;

use crate::common::{ClientRequest, Reply};
use crate::rpc::ShardCtrlerTransport;
use crate::server::ShardCtrlerServer;

async fn write_frame<W: Write + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: Read + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// [ShardCtrlerTransport] over plain TCP, one fresh connection per call.
pub struct TcpClientTransport {
    addresses: HashMap<u64, SocketAddr>,
}

impl TcpClientTransport {
    pub fn new(addresses: HashMap<u64, SocketAddr>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl ShardCtrlerTransport for TcpClientTransport {
    async fn call(&self, server: u64, request: ClientRequest) -> Result<Reply> {
        let addr = self
            .addresses
            .get(&server)
            .ok_or_else(|| format_err!("no address known for server {}", server))?;
        let mut stream = TcpStream::connect(addr).await?;
        let encoded = bincode::serialize(&request)?;
        write_frame(&mut stream, &encoded).await?;
        let response_bytes = read_frame(&mut stream).await?;
        Ok(bincode::deserialize(&response_bytes)?)
    }
}

/// Accepts connections on `addr` forever, dispatching each decoded
/// [ClientRequest] to `server` and writing back its [Reply]. One task per
/// connection, matching `raft::transport::tcp::run_server`.
pub async fn run_server(addr: SocketAddr, server: Arc<ShardCtrlerServer>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let mut incoming = listener.incoming();
    use futures::stream::StreamExt;

    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("shardctrler tcp transport: failed to accept connection: {:?}", e);
                continue;
            }
        };
        let server = server.clone();
        async_std::task::spawn(async move {
            if let Err(e) = handle_connection(stream, server).await {
                eprintln!("shardctrler tcp transport: connection handler exited: {:?}", e);
            }
        });
    }

    Ok(())
}

async fn handle_connection(mut stream: TcpStream, server: Arc<ShardCtrlerServer>) -> Result<()> {
    loop {
        let request_bytes = match read_frame(&mut stream).await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        let request: ClientRequest = bincode::deserialize(&request_bytes)?;
        let reply = server.handle_request(request).await;
        let encoded = bincode::serialize(&reply)?;
        write_frame(&mut stream, &encoded).await?;
    }
}
