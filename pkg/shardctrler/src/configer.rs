use std::collections::HashMap;

use async_std::sync::Mutex;
use async_trait::async_trait;

use common::errors::*;

use crate::common::{Config, Err as ReplyErr, OpKey, Reply, N_SHARDS};

/// Assigns shards to `groups` so as to minimize the largest shard count held
/// by any one group, and among assignments achieving that minimum, to move
/// as few shards as possible from the previous assignment. Ties are broken
/// by ascending group id. Deterministic: every replica computes the same
/// result from the same inputs.
fn rebalance(shards: &mut [u64; N_SHARDS], groups: &HashMap<u64, Vec<String>>) {
    if groups.is_empty() {
        *shards = [0; N_SHARDS];
        return;
    }

    let mut gids: Vec<u64> = groups.keys().copied().collect();
    gids.sort_unstable();

    let n = gids.len();
    let base = N_SHARDS / n;
    let extra = N_SHARDS % n;
    let desired: HashMap<u64, usize> = gids
        .iter()
        .enumerate()
        .map(|(i, &gid)| (gid, if i < extra { base + 1 } else { base }))
        .collect();

    let mut have: HashMap<u64, usize> = HashMap::new();
    for &s in shards.iter() {
        if groups.contains_key(&s) {
            *have.entry(s).or_insert(0) += 1;
        }
    }

    // Shards belonging to a group that no longer exists are immediately free.
    let mut free: Vec<usize> = shards
        .iter()
        .enumerate()
        .filter(|(_, &gid)| !groups.contains_key(&gid))
        .map(|(i, _)| i)
        .collect();

    // Trim groups that hold more than their fair share.
    for &gid in &gids {
        let want = desired[&gid];
        let cur = *have.get(&gid).unwrap_or(&0);
        if cur > want {
            let mut excess = cur - want;
            for (i, &s) in shards.iter().enumerate() {
                if excess == 0 {
                    break;
                }
                if s == gid && !free.contains(&i) {
                    free.push(i);
                    excess -= 1;
                    *have.get_mut(&gid).unwrap() -= 1;
                }
            }
        }
    }

    free.sort_unstable();

    let mut free_idx = 0;
    for &gid in &gids {
        let want = desired[&gid];
        let cur = *have.get(&gid).unwrap_or(&0);
        let mut need = want.saturating_sub(cur);
        while need > 0 && free_idx < free.len() {
            shards[free[free_idx]] = gid;
            free_idx += 1;
            need -= 1;
        }
    }
}

/// The shard-configuration application state machine: a monotonically
/// growing history of [Config] versions, mutated only by the applier task.
pub struct Configer {
    history: Vec<Config>,
}

impl Configer {
    pub fn new() -> Self {
        Self {
            history: vec![Config::initial()],
        }
    }

    pub fn current(&self) -> &Config {
        self.history.last().unwrap()
    }

    pub fn join(&mut self, groups: HashMap<u64, Vec<String>>) {
        let mut next = self.current().clone();
        next.num += 1;
        for (gid, servers) in groups {
            next.groups.insert(gid, servers);
        }
        rebalance(&mut next.shards, &next.groups);
        self.history.push(next);
    }

    pub fn leave(&mut self, gids: &[u64]) {
        let mut next = self.current().clone();
        next.num += 1;
        for gid in gids {
            next.groups.remove(gid);
        }
        rebalance(&mut next.shards, &next.groups);
        self.history.push(next);
    }

    /// Returns false (and leaves state unchanged) if `gid` is not a known
    /// group, in which case the caller should report NoSuchGroup.
    pub fn move_shard(&mut self, shard: usize, gid: u64) -> bool {
        let current = self.current();
        if !current.groups.contains_key(&gid) || shard >= N_SHARDS {
            return false;
        }
        let mut next = current.clone();
        next.num += 1;
        next.shards[shard] = gid;
        self.history.push(next);
        true
    }

    pub fn query(&self, num: i64) -> Config {
        if num < 0 || num as usize >= self.history.len() {
            self.current().clone()
        } else {
            self.history[num as usize].clone()
        }
    }

    pub fn history(&self) -> &[Config] {
        &self.history
    }

    pub fn restore(&mut self, history: Vec<Config>) {
        self.history = if history.is_empty() {
            vec![Config::initial()]
        } else {
            history
        };
    }
}

/// Executes one already-deduplicated [OpKey] against `configer`, producing
/// the reply that gets cached and returned to the client.
fn execute(configer: &mut Configer, op: &OpKey) -> Reply {
    match op {
        OpKey::Join(entries) => {
            let groups = entries.iter().cloned().collect();
            configer.join(groups);
            Reply::ok()
        }
        OpKey::Leave(gids) => {
            configer.leave(gids);
            Reply::ok()
        }
        OpKey::Move(shard, gid) => {
            if configer.move_shard(*shard, *gid) {
                Reply::ok()
            } else {
                Reply::no_such_group()
            }
        }
        OpKey::Query(num) => Reply::with_config(configer.query(*num)),
    }
}

/// Wraps a [Configer] behind its own lock so it can be driven entirely
/// through the generic [raft::StateMachine] interface: `apply` decodes one
/// already-deduplicated [OpKey] and returns its bincode-serialized [Reply];
/// `snapshot`/`restore` (de)serialize the whole config history. Duplicate
/// suppression and waiter wake-up stay outside this type, since those are
/// service-level concerns the generic consensus-facing interface doesn't
/// know about.
pub struct ConfigerStateMachine {
    inner: Mutex<Configer>,
}

impl ConfigerStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Configer::new()),
        }
    }
}

impl Default for ConfigerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl raft::StateMachine for ConfigerStateMachine {
    async fn apply(&self, _index: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let op: OpKey = bincode::deserialize(payload)?;
        let mut configer = self.inner.lock().await;
        let reply = execute(&mut configer, &op);
        Ok(bincode::serialize(&reply)?)
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let configer = self.inner.lock().await;
        Ok(bincode::serialize(&configer.history().to_vec())?)
    }

    async fn restore(&self, data: &[u8]) -> Result<()> {
        let history: Vec<Config> = bincode::deserialize(data)?;
        self.inner.lock().await.restore(history);
        Ok(())
    }
}

#[cfg(test)]
mod state_machine_tests {
    use super::*;

    #[async_std::test]
    async fn apply_join_then_query_through_trait() {
        use raft::StateMachine;

        let sm = ConfigerStateMachine::new();
        let join = OpKey::Join(vec![(1, vec!["a".to_string()])]);
        let reply_bytes = sm.apply(1, &bincode::serialize(&join).unwrap()).await.unwrap();
        let reply: Reply = bincode::deserialize(&reply_bytes).unwrap();
        assert_eq!(reply.err, ReplyErr::Ok);

        let query = OpKey::Query(-1);
        let reply_bytes = sm.apply(2, &bincode::serialize(&query).unwrap()).await.unwrap();
        let reply: Reply = bincode::deserialize(&reply_bytes).unwrap();
        assert_eq!(reply.config.unwrap().num, 1);
    }

    #[async_std::test]
    async fn snapshot_then_restore_round_trips_history() {
        use raft::StateMachine;

        let sm = ConfigerStateMachine::new();
        let join = OpKey::Join(vec![(1, vec!["a".to_string()])]);
        sm.apply(1, &bincode::serialize(&join).unwrap()).await.unwrap();
        let snapshot = sm.snapshot().await.unwrap();

        let restored = ConfigerStateMachine::new();
        restored.restore(&snapshot).await.unwrap();
        let query = OpKey::Query(-1);
        let reply_bytes = restored.apply(2, &bincode::serialize(&query).unwrap()).await.unwrap();
        let reply: Reply = bincode::deserialize(&reply_bytes).unwrap();
        assert_eq!(reply.config.unwrap().num, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_one_group_gets_all_shards() {
        let mut configer = Configer::new();
        let mut groups = HashMap::new();
        groups.insert(1, vec!["a".to_string(), "b".to_string()]);
        configer.join(groups);

        let config = configer.query(-1);
        assert_eq!(config.num, 1);
        assert!(config.shards.iter().all(|&gid| gid == 1));
    }

    #[test]
    fn join_balances_across_groups() {
        let mut configer = Configer::new();
        let mut g1 = HashMap::new();
        g1.insert(1, vec!["a".to_string()]);
        configer.join(g1);
        let mut g2 = HashMap::new();
        g2.insert(2, vec!["b".to_string()]);
        configer.join(g2);

        let config = configer.query(-1);
        let count1 = config.shards.iter().filter(|&&g| g == 1).count();
        let count2 = config.shards.iter().filter(|&&g| g == 2).count();
        assert_eq!(count1 + count2, N_SHARDS);
        assert!((count1 as i64 - count2 as i64).abs() <= 1);
    }

    #[test]
    fn leave_redistributes_to_remaining_groups() {
        let mut configer = Configer::new();
        let mut groups = HashMap::new();
        groups.insert(1, vec!["a".to_string()]);
        groups.insert(2, vec!["b".to_string()]);
        configer.join(groups);

        configer.leave(&[1]);
        let config = configer.query(-1);
        assert!(config.shards.iter().all(|&gid| gid == 2));
        assert!(!config.groups.contains_key(&1));
    }

    #[test]
    fn move_shard_to_unknown_group_fails() {
        let mut configer = Configer::new();
        let mut groups = HashMap::new();
        groups.insert(1, vec!["a".to_string()]);
        configer.join(groups);

        assert!(!configer.move_shard(0, 99));
        assert!(configer.move_shard(0, 1));
        assert_eq!(configer.query(-1).shards[0], 1);
    }

    #[test]
    fn query_out_of_range_returns_latest() {
        let mut configer = Configer::new();
        let mut groups = HashMap::new();
        groups.insert(1, vec!["a".to_string()]);
        configer.join(groups);
        assert_eq!(configer.query(100).num, configer.query(-1).num);
    }
}
