use crate::dedup::{DedupOpener, DedupStore, Result};
use crate::protocol::JobId;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    keys: HashSet<String>,
}

impl DedupStore for MemoryDedupStore {
    fn insert(&mut self, key: &str) -> Result<bool> {
        Ok(self.keys.insert(key.to_string()))
    }

    fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Non-durable opener; every job starts with an empty set.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDedupOpener;

impl DedupOpener for MemoryDedupOpener {
    fn open(&self, _job: &JobId) -> Result<Box<dyn DedupStore>> {
        Ok(Box::new(MemoryDedupStore::default()))
    }
}
