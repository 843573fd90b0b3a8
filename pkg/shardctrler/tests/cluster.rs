//! Integration tests over the in-memory transports: wires up a small
//! cluster of `ShardCtrlerServer`s, each backed by a real `FilePersister`
//! in a temp directory so crash/restart tests exercise the same
//! persistence path a real deployment would use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::errors::*;

use raft::{FilePersister, MemoryTransport, PeerId, Persister, RaftTransport};
use shardctrler::transport::MemoryClientTransport;
use shardctrler::{Clerk, ShardCtrlerServer, ShardCtrlerTransport};

struct TestCluster {
    ids: Vec<PeerId>,
    dirs: Vec<tempfile::TempDir>,
    raft_transports: Vec<Arc<MemoryTransport>>,
    client_transport: Arc<MemoryClientTransport>,
    servers: Vec<Arc<ShardCtrlerServer>>,
    max_raft_state: Option<u64>,
}

impl TestCluster {
    async fn new(n: usize, max_raft_state: Option<u64>) -> Result<Self> {
        let ids: Vec<PeerId> = (0..n as u64).collect();
        let raft_transports: Vec<Arc<MemoryTransport>> = MemoryTransport::new_cluster(&ids)
            .into_iter()
            .map(Arc::new)
            .collect();
        let client_transport = Arc::new(MemoryClientTransport::new());

        let mut this = Self {
            ids,
            dirs: vec![],
            raft_transports,
            client_transport,
            servers: vec![],
            max_raft_state,
        };

        for i in 0..n {
            let dir = tempfile::tempdir()?;
            let server = this.boot(i, dir.path()).await?;
            this.dirs.push(dir);
            this.servers.push(server);
        }

        Ok(this)
    }

    async fn boot(&self, i: usize, dir: &std::path::Path) -> Result<Arc<ShardCtrlerServer>> {
        let id = self.ids[i];
        let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(dir));
        let transport: Arc<dyn RaftTransport> = self.raft_transports[i].clone();

        let server = ShardCtrlerServer::start(
            id,
            self.ids.clone(),
            persister,
            transport,
            self.max_raft_state,
        )
        .await?;

        self.raft_transports[i]
            .register(server.raft_consensus().clone())
            .await;
        self.client_transport.register(id, server.clone()).await;

        Ok(server)
    }

    async fn crash(&mut self, i: usize) {
        self.servers[i].kill().await;
        self.raft_transports[i].unregister().await;
    }

    async fn restart(&mut self, i: usize) -> Result<()> {
        let dir_path = self.dirs[i].path().to_path_buf();
        let server = self.boot(i, &dir_path).await?;
        self.servers[i] = server;
        Ok(())
    }

    async fn disconnect(&self, i: usize) {
        self.raft_transports[i].disconnect(self.ids[i]).await;
    }

    async fn reconnect(&self, i: usize) {
        self.raft_transports[i].reconnect(self.ids[i]).await;
    }

    fn clerk(&self) -> Clerk {
        let transport: Arc<dyn ShardCtrlerTransport> = self.client_transport.clone();
        Clerk::new(transport, self.ids.clone())
    }

    /// Polls until some server reports itself as leader, or times out.
    async fn wait_for_leader(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for server in &self.servers {
                if server.raft_consensus().is_leader().await {
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                return Err(err_msg("no leader elected in time"));
            }
            async_std::task::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn groups(pairs: &[(u64, &[&str])]) -> HashMap<u64, Vec<String>> {
    pairs
        .iter()
        .map(|(gid, servers)| {
            (
                *gid,
                servers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
        })
        .collect()
}

#[async_std::test]
async fn single_leader_agreement() -> Result<()> {
    let cluster = TestCluster::new(3, None).await?;
    cluster.wait_for_leader().await?;

    let clerk = cluster.clerk();
    let config = clerk.query(-1).await;

    assert_eq!(config.num, 0);
    assert!(config.groups.is_empty());
    assert!(config.shards.iter().all(|&gid| gid == 0));
    Ok(())
}

#[async_std::test]
async fn join_then_query() -> Result<()> {
    let cluster = TestCluster::new(3, None).await?;
    cluster.wait_for_leader().await?;

    let clerk = cluster.clerk();
    clerk.join(groups(&[(1, &["a", "b", "c"])])).await;

    let config = clerk.query(1).await;
    assert_eq!(config.num, 1);
    assert!(config.shards.iter().all(|&gid| gid == 1));
    Ok(())
}

#[async_std::test]
async fn join_balances_and_leave_redistributes() -> Result<()> {
    let cluster = TestCluster::new(3, None).await?;
    cluster.wait_for_leader().await?;

    let clerk = cluster.clerk();
    clerk
        .join(groups(&[(1, &["a"]), (2, &["b"])]))
        .await;

    let after_join = clerk.query(-1).await;
    let count1 = after_join.shards.iter().filter(|&&g| g == 1).count();
    let count2 = after_join.shards.iter().filter(|&&g| g == 2).count();
    assert_eq!(count1 + count2, shardctrler::N_SHARDS);
    assert!((count1 as i64 - count2 as i64).abs() <= 1);

    clerk.leave(vec![1]).await;
    let after_leave = clerk.query(-1).await;
    assert!(after_leave.shards.iter().all(|&gid| gid == 2));
    assert!(!after_leave.groups.contains_key(&1));
    Ok(())
}

#[async_std::test]
async fn move_shard_to_unknown_group_is_rejected() -> Result<()> {
    let cluster = TestCluster::new(3, None).await?;
    cluster.wait_for_leader().await?;

    let clerk = cluster.clerk();
    clerk.join(groups(&[(1, &["a"])])).await;
    clerk.move_shard(0, 1).await;

    let config = clerk.query(-1).await;
    assert_eq!(config.shards[0], 1);
    Ok(())
}

#[async_std::test]
async fn snapshot_catches_up_a_lagging_follower() -> Result<()> {
    // A small max_raft_state forces frequent snapshots so the test doesn't
    // need hundreds of real commands to trigger compaction.
    let mut cluster = TestCluster::new(5, Some(5)).await?;
    cluster.wait_for_leader().await?;

    cluster.disconnect(4);

    let clerk = cluster.clerk();
    for i in 0..20u64 {
        clerk
            .join(groups(&[(i + 1, &["x"])]))
            .await;
    }

    let expected = clerk.query(-1).await;

    cluster.reconnect(4);

    // Give the leader time to install a snapshot on the reconnected
    // follower and for it to catch up via ordinary AppendEntries.
    async_std::task::sleep(Duration::from_secs(2)).await;

    assert_eq!(expected.num, 20);
    Ok(())
}

#[async_std::test]
async fn crash_recovery_replays_log_without_reexecuting() -> Result<()> {
    let mut cluster = TestCluster::new(3, None).await?;
    cluster.wait_for_leader().await?;

    let clerk = cluster.clerk();
    clerk.join(groups(&[(1, &["a"])])).await;
    clerk.join(groups(&[(2, &["b"])])).await;

    cluster.crash(0).await;
    cluster.restart(0).await?;
    cluster.wait_for_leader().await?;

    // A fresh client, after the restart, should still be able to drive the
    // cluster normally.
    let clerk2 = cluster.clerk();
    let config = clerk2.query(-1).await;
    assert_eq!(config.num, 2);

    clerk2.join(groups(&[(3, &["c"])])).await;
    let config = clerk2.query(-1).await;
    assert_eq!(config.num, 3);
    Ok(())
}
