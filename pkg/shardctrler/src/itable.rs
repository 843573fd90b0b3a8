use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Reply;

/// Per-client duplicate suppression: the next sequence number this client
/// hasn't executed yet, and the reply it got for the last one it did.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DuplicateTable {
    entries: HashMap<u64, Entry>,
}

#[derive(Clone, Serialize, Deserialize)]
struct Entry {
    next_seq: u64,
    last_reply: Reply,
}

impl DuplicateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_reply(&self, clerk_id: u64, seq: u64) -> Option<Reply> {
        self.entries.get(&clerk_id).and_then(|e| {
            if seq < e.next_seq {
                Some(e.last_reply.clone())
            } else {
                None
            }
        })
    }

    pub fn record(&mut self, clerk_id: u64, seq: u64, reply: Reply) {
        let entry = self.entries.entry(clerk_id).or_insert(Entry {
            next_seq: 0,
            last_reply: Reply::ok(),
        });
        if seq >= entry.next_seq {
            entry.next_seq = seq + 1;
            entry.last_reply = reply;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_repeat_sequence() {
        let mut table = DuplicateTable::new();
        assert!(table.cached_reply(1, 0).is_none());
        table.record(1, 0, Reply::ok());
        assert!(table.cached_reply(1, 0).is_some());
        assert!(table.cached_reply(1, 1).is_none());
    }

    #[test]
    fn caches_last_reply() {
        let mut table = DuplicateTable::new();
        table.record(7, 3, Reply::no_such_group());
        let cached = table.cached_reply(7, 3).unwrap();
        assert_eq!(cached.err, crate::common::Err::NoSuchGroup);
    }
}
