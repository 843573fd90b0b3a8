use std::collections::HashMap;
use std::net::SocketAddr;

use async_std::io::prelude::*;
use async_std::net::{TcpListener, TcpStream};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::errors::*;

use crate::consensus::ConsensusModule;
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftTransport, RequestVoteReply, RequestVoteRequest,
};
use crate::PeerId;
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
enum WireRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

#[derive(Serialize, Deserialize)]
enum WireResponse {
    AppendEntries(AppendEntriesReply),
    RequestVote(RequestVoteReply),
    InstallSnapshot(InstallSnapshotReply),
}

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

/// RaftTransport over plain TCP, one fresh connection per call. Peer
/// addresses are fixed at construction time since this crate has no runtime
/// membership changes.
pub struct TcpTransport {
    addresses: HashMap<PeerId, SocketAddr>,
}

impl TcpTransport {
    pub fn new(addresses: HashMap<PeerId, SocketAddr>) -> Self {
        Self { addresses }
    }

    async fn call(&self, peer: PeerId, request: WireRequest) -> Result<WireResponse> {
        let addr = self
            .addresses
            .get(&peer)
            .ok_or_else(|| format_err!("no address known for peer {}", peer))?;
        let mut stream = TcpStream::connect(addr).await?;
        let encoded = bincode::serialize(&request)?;
        write_frame(&mut stream, &encoded).await?;
        let response_bytes = read_frame(&mut stream).await?;
        Ok(bincode::deserialize(&response_bytes)?)
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn append_entries(
        &self,
        peer: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        match self.call(peer, WireRequest::AppendEntries(request)).await? {
            WireResponse::AppendEntries(reply) => Ok(reply),
            _ => Err(err_msg("mismatched response kind for AppendEntries")),
        }
    }

    async fn request_vote(
        &self,
        peer: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply> {
        match self.call(peer, WireRequest::RequestVote(request)).await? {
            WireResponse::RequestVote(reply) => Ok(reply),
            _ => Err(err_msg("mismatched response kind for RequestVote")),
        }
    }

    async fn install_snapshot(
        &self,
        peer: PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply> {
        match self.call(peer, WireRequest::InstallSnapshot(request)).await? {
            WireResponse::InstallSnapshot(reply) => Ok(reply),
            _ => Err(err_msg("mismatched response kind for InstallSnapshot")),
        }
    }
}

/// Accepts connections on `addr` forever, dispatching each decoded frame to
/// `consensus` and writing back its reply. One task per connection.
pub async fn run_server(addr: SocketAddr, consensus: Arc<ConsensusModule>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let mut incoming = listener.incoming();
    use futures::stream::StreamExt;

    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("raft tcp transport: failed to accept connection: {:?}", e);
                continue;
            }
        };
        let consensus = consensus.clone();
        async_std::task::spawn(async move {
            if let Err(e) = handle_connection(stream, consensus).await {
                eprintln!("raft tcp transport: connection handler exited: {:?}", e);
            }
        });
    }

    Ok(())
}

async fn handle_connection(mut stream: TcpStream, consensus: Arc<ConsensusModule>) -> Result<()> {
    loop {
        let request_bytes = match read_frame(&mut stream).await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        let request: WireRequest = bincode::deserialize(&request_bytes)?;

        let response = match request {
            WireRequest::AppendEntries(req) => {
                WireResponse::AppendEntries(consensus.handle_append_entries(req).await)
            }
            WireRequest::RequestVote(req) => {
                WireResponse::RequestVote(consensus.handle_request_vote(req).await)
            }
            WireRequest::InstallSnapshot(req) => {
                WireResponse::InstallSnapshot(consensus.handle_install_snapshot(req).await)
            }
        };

        let encoded = bincode::serialize(&response)?;
        write_frame(&mut stream, &encoded).await?;
    }
}
