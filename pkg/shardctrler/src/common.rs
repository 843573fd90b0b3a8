use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Number of shards the key space is always divided into.
pub const N_SHARDS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Err {
    Ok,
    NoSuchGroup,
    WrongLeader,
}

/// Identifies one logical client request. A client retries the same
/// (clerk_id, seq) until it gets a definitive, non-WrongLeader reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub clerk_id: u64,
    pub seq: u64,
}

/// One versioned assignment of shards to replica groups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub num: u64,
    pub shards: [u64; N_SHARDS],
    pub groups: HashMap<u64, Vec<String>>,
}

impl Config {
    pub fn initial() -> Self {
        Self {
            num: 0,
            shards: [0; N_SHARDS],
            groups: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Join { groups: HashMap<u64, Vec<String>> },
    Leave { gids: Vec<u64> },
    Move { shard: usize, gid: u64 },
    Query { num: i64 },
}

/// What actually gets replicated through the log. `server_id` identifies
/// the server proxying the request (for waiter wake-up decisions only); it
/// does not participate in the client-visible identity of the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Identifier,
    pub server_id: u64,
    pub op: OpKey,
}

/// A structurally-comparable view of [Op], used to check whether the entry
/// that committed at a waited-on index is really the one this server
/// submitted, or whether a different leader's command landed there instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpKey {
    Join(Vec<(u64, Vec<String>)>),
    Leave(Vec<u64>),
    Move(usize, u64),
    Query(i64),
}

impl From<&Op> for OpKey {
    fn from(op: &Op) -> Self {
        match op {
            Op::Join { groups } => {
                let mut entries: Vec<(u64, Vec<String>)> =
                    groups.iter().map(|(k, v)| (*k, v.clone())).collect();
                entries.sort_by_key(|(k, _)| *k);
                OpKey::Join(entries)
            }
            Op::Leave { gids } => OpKey::Leave(gids.clone()),
            Op::Move { shard, gid } => OpKey::Move(*shard, *gid),
            Op::Query { num } => OpKey::Query(*num),
        }
    }
}

/// What a client sends over the wire. The server stamps its own id onto
/// this before replicating it as a [Command].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: Identifier,
    pub op: Op,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub err: Err,
    pub config: Option<Config>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            err: Err::Ok,
            config: None,
        }
    }

    pub fn wrong_leader() -> Self {
        Self {
            err: Err::WrongLeader,
            config: None,
        }
    }

    pub fn no_such_group() -> Self {
        Self {
            err: Err::NoSuchGroup,
            config: None,
        }
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            err: Err::Ok,
            config: Some(config),
        }
    }
}
