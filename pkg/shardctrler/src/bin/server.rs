use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use common::args::list::CommaSeparated;
use common::args::{parse_args, ArgFieldType, ArgsType, RawArgs};
use common::async_std::task::block_on;
use common::bundle::TaskResultBundle;
use common::errors::*;

use raft::{run_server as run_raft_server, PeerId, TcpTransport};
use shardctrler::transport::run_server as run_client_server;
use shardctrler::ShardCtrlerServer;

/// Parses a comma-separated list of `id=host:port` entries, as given for
/// both `--raft_peers` and `--client_peers`.
fn parse_peer_list(list: &CommaSeparated<String>) -> Result<HashMap<PeerId, SocketAddr>> {
    let mut out = HashMap::new();
    for entry in &list.values {
        let (id_str, addr_str) = entry
            .split_once('=')
            .ok_or_else(|| format_err!("expected id=host:port, got {}", entry))?;
        let id: PeerId = id_str.parse()?;
        let addr: SocketAddr = addr_str.parse()?;
        out.insert(id, addr);
    }
    Ok(out)
}

struct Args {
    /// This server's own peer id. Must be a key in both `raft_peers` and
    /// `client_peers`.
    me: PeerId,
    /// `id=host:port` for every peer's raft (consensus) port, including
    /// this one's.
    raft_peers: CommaSeparated<String>,
    /// `id=host:port` for every peer's client-facing port, including this
    /// one's.
    client_peers: CommaSeparated<String>,
    /// Directory holding this peer's persisted raft state and snapshot.
    dir: std::path::PathBuf,
    /// Approximate number of applied command entries to allow between
    /// snapshots. Unset disables snapshotting.
    max_raft_state: Option<u64>,
}

impl ArgsType for Args {
    fn parse_raw_args(raw_args: &mut RawArgs) -> Result<Self> {
        Ok(Self {
            me: ArgFieldType::parse_raw_arg_field("me", raw_args)?,
            raft_peers: ArgFieldType::parse_raw_arg_field("raft_peers", raw_args)?,
            client_peers: ArgFieldType::parse_raw_arg_field("client_peers", raw_args)?,
            dir: ArgFieldType::parse_raw_arg_field("dir", raw_args)?,
            max_raft_state: ArgFieldType::parse_raw_arg_field("max_raft_state", raw_args)?,
        })
    }
}

async fn run(args: Args) -> Result<()> {
    let raft_addrs = parse_peer_list(&args.raft_peers)?;
    let client_addrs = parse_peer_list(&args.client_peers)?;

    let peers: Vec<PeerId> = raft_addrs.keys().copied().collect();
    let raft_listen_addr = *raft_addrs
        .get(&args.me)
        .ok_or_else(|| format_err!("no raft address for self (id {})", args.me))?;
    let client_listen_addr = *client_addrs
        .get(&args.me)
        .ok_or_else(|| format_err!("no client address for self (id {})", args.me))?;

    let raft_transport = Arc::new(TcpTransport::new(raft_addrs));

    let server = ShardCtrlerServer::start_with_dir(
        args.me,
        peers,
        &args.dir,
        raft_transport,
        args.max_raft_state,
    )
    .await?;

    let mut task_bundle = TaskResultBundle::new();
    task_bundle.add(
        "raft::transport::tcp::run_server",
        run_raft_server(raft_listen_addr, server.raft_consensus().clone()),
    );
    task_bundle.add(
        "shardctrler::transport::tcp::run_server",
        run_client_server(client_listen_addr, server),
    );

    task_bundle.join().await
}

fn main() -> Result<()> {
    let args = parse_args::<Args>()?;
    block_on(run(args))
}
