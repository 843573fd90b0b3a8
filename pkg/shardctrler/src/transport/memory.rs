use std::collections::HashMap;
use std::sync::Arc;

use async_std::sync::RwLock;
use async_trait::async_trait;

use ::common::errors::*;

use crate::common::{ClientRequest, Reply};
use crate::rpc::ShardCtrlerTransport;
use crate::server::ShardCtrlerServer;

/// In-memory [ShardCtrlerTransport] that calls straight into another
/// server's handler in the same process. Used by integration tests that
/// don't want to bind real sockets.
pub struct MemoryClientTransport {
    servers: Arc<RwLock<HashMap<u64, Arc<ShardCtrlerServer>>>>,
}

impl MemoryClientTransport {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, id: u64, server: Arc<ShardCtrlerServer>) {
        self.servers.write().await.insert(id, server);
    }
}

#[async_trait]
impl ShardCtrlerTransport for MemoryClientTransport {
    async fn call(&self, server: u64, request: ClientRequest) -> Result<Reply> {
        let node = self
            .servers
            .read()
            .await
            .get(&server)
            .cloned()
            .ok_or_else(|| format_err!("unknown shardctrler server {}", server))?;
        Ok(node.handle_request(request).await)
    }
}
