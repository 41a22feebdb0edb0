//! Connection registry.
//!
//! Records live in a slab arena addressed by a generation-checked
//! [`ConnectionKey`]. A stale key (one whose slot has since been reused)
//! resolves to nothing instead of to the new occupant. A secondary index maps
//! each record's canonical [`ConnectionId`] to its key, so steady-state
//! packets are routed without a scan.

use std::collections::HashMap;

use slab::Slab;

use crate::engine::ConnectionId;

/// Generation-checked handle to a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionKey {
    index: usize,
    generation: u64,
}

impl ConnectionKey {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Record<T> {
    generation: u64,
    cid: ConnectionId,
    value: T,
}

/// Arena of connection records plus a direct ID index.
pub struct ConnectionTable<T> {
    records: Slab<Record<T>>,
    by_cid: HashMap<ConnectionId, ConnectionKey>,
    next_generation: u64,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self {
            records: Slab::new(),
            by_cid: HashMap::new(),
            next_generation: 0,
        }
    }

    /// The key the next [`insert`](Self::insert) will return.
    pub fn vacant_key(&self) -> ConnectionKey {
        ConnectionKey {
            index: self.records.vacant_key(),
            generation: self.next_generation,
        }
    }

    pub fn insert(&mut self, cid: ConnectionId, value: T) -> ConnectionKey {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.records.insert(Record {
            generation,
            cid: cid.clone(),
            value,
        });
        let key = ConnectionKey { index, generation };
        self.by_cid.insert(cid, key);
        key
    }

    pub fn get(&self, key: ConnectionKey) -> Option<&T> {
        self.records
            .get(key.index)
            .filter(|r| r.generation == key.generation)
            .map(|r| &r.value)
    }

    pub fn contains(&self, key: ConnectionKey) -> bool {
        self.get(key).is_some()
    }

    /// Removes the record. Returns `None` if `key` is stale, so a second
    /// removal of the same connection is a no-op.
    pub fn remove(&mut self, key: ConnectionKey) -> Option<T> {
        match self.records.get(key.index) {
            Some(r) if r.generation == key.generation => {}
            _ => return None,
        }
        let record = self.records.remove(key.index);
        if self.by_cid.get(&record.cid) == Some(&key) {
            self.by_cid.remove(&record.cid);
        }
        Some(record.value)
    }

    /// Direct lookup by canonical connection ID.
    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionKey> {
        self.by_cid
            .get(cid)
            .copied()
            .filter(|key| self.contains(*key))
    }

    pub fn cid(&self, key: ConnectionKey) -> Option<&ConnectionId> {
        self.records
            .get(key.index)
            .filter(|r| r.generation == key.generation)
            .map(|r| &r.cid)
    }

    /// Keys of all live records, in slot order.
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.records
            .iter()
            .map(|(index, r)| ConnectionKey {
                index,
                generation: r.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
