use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::common::{ClientRequest, Config, Err, Identifier, Op, Reply};
use crate::rpc::ShardCtrlerTransport;

const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Client library for the shard controller, grounded in the same
/// retry-the-known-leader pattern as `MetastoreClient`
/// (`pkg/datastore/src/meta/client.rs`): it owns a client id and a
/// monotonically increasing sequence number, and keeps retrying against
/// servers (starting from whichever one last looked like the leader) until
/// it gets back a reply that isn't `WrongLeader`.
pub struct Clerk {
    transport: Arc<dyn ShardCtrlerTransport>,
    servers: Vec<u64>,
    clerk_id: u64,
    seq: AtomicU64,
    last_leader: AtomicUsize,
}

impl Clerk {
    pub fn new(transport: Arc<dyn ShardCtrlerTransport>, servers: Vec<u64>) -> Self {
        Self {
            transport,
            servers,
            clerk_id: rand::thread_rng().gen(),
            seq: AtomicU64::new(0),
            last_leader: AtomicUsize::new(0),
        }
    }

    pub async fn join(&self, groups: HashMap<u64, Vec<String>>) {
        self.call(Op::Join { groups }).await;
    }

    pub async fn leave(&self, gids: Vec<u64>) {
        self.call(Op::Leave { gids }).await;
    }

    pub async fn move_shard(&self, shard: usize, gid: u64) {
        self.call(Op::Move { shard, gid }).await;
    }

    pub async fn query(&self, num: i64) -> Config {
        self.call(Op::Query { num }).await.config.unwrap_or_else(Config::initial)
    }

    /// Sends `op` to the last known leader first, then round-robins through
    /// the rest of the cluster on `WrongLeader` or a transport error, until
    /// a definitive reply arrives. The sequence number is only advanced
    /// after such a reply, so retries of the same logical call reuse the
    /// same `(clerk_id, seq)` and land on the same duplicate-suppression
    /// entry server-side.
    async fn call(&self, op: Op) -> Reply {
        let seq = self.seq.load(Ordering::SeqCst);
        let request = ClientRequest {
            id: Identifier {
                clerk_id: self.clerk_id,
                seq,
            },
            op,
        };

        let n = self.servers.len();
        let start = self.last_leader.load(Ordering::SeqCst);

        loop {
            for offset in 0..n {
                let i = (start + offset) % n;
                let server = self.servers[i];

                match self.transport.call(server, request.clone()).await {
                    Ok(reply) if reply.err != Err::WrongLeader => {
                        self.last_leader.store(i, Ordering::SeqCst);
                        self.seq.store(seq + 1, Ordering::SeqCst);
                        return reply;
                    }
                    _ => continue,
                }
            }
            async_std::task::sleep(RETRY_BACKOFF).await;
        }
    }
}
