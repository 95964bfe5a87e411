//! Host-side bounded stores for the latency core.
//!
//! Mirror the BPF maps: an LRU wait table of 65536 records and two output
//! tables of 1024 cgroup names that reject new keys once full. Each call takes
//! its own short lock, so the read-then-write in the switch handler stays
//! lossy under concurrent updates, exactly like the in-kernel maps.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Mutex,
};

use lru::LruCache;
use schedlat_common::{
    CGROUP_TABLE_CAPACITY, CgroupName, WAIT_TABLE_CAPACITY,
    latency::{AggregateTable, Tracker, WaitTable},
};

pub struct WaitRecords {
    inner: Mutex<LruCache<u32, u64>>,
}

impl WaitRecords {
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks at a record without touching its recency.
    pub fn peek(&self, owner: u32) -> Option<u64> {
        self.inner.lock().ok()?.peek(&owner).copied()
    }
}

impl Default for WaitRecords {
    fn default() -> Self {
        Self::with_capacity(
            NonZeroUsize::new(WAIT_TABLE_CAPACITY as usize).unwrap_or(NonZeroUsize::MIN),
        )
    }
}

impl WaitTable for WaitRecords {
    fn record(&self, owner: u32, timestamp: u64) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(owner, timestamp);
        }
    }

    fn wait_start(&self, owner: u32) -> Option<u64> {
        self.inner.lock().ok()?.get(&owner).copied()
    }

    fn consume(&self, owner: u32) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.pop(&owner);
        }
    }
}

pub struct CgroupTable {
    capacity: usize,
    inner: Mutex<HashMap<CgroupName, u64>>,
}

impl CgroupTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|table| table.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<CgroupName, u64> {
        self.inner
            .lock()
            .map(|table| table.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut table) = self.inner.lock() {
            table.clear();
        }
    }
}

impl Default for CgroupTable {
    fn default() -> Self {
        Self::with_capacity(CGROUP_TABLE_CAPACITY as usize)
    }
}

impl AggregateTable for CgroupTable {
    fn get(&self, name: &CgroupName) -> Option<u64> {
        self.inner.lock().ok()?.get(name).copied()
    }

    fn set(&self, name: &CgroupName, value: u64) {
        if let Ok(mut table) = self.inner.lock() {
            if table.len() < self.capacity || table.contains_key(name) {
                table.insert(*name, value);
            }
        }
    }
}

/// An isolated set of the three tables.
#[derive(Default)]
pub struct LatencyTables {
    pub waits: WaitRecords,
    pub delay: CgroupTable,
    pub counter: CgroupTable,
}

impl LatencyTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> Tracker<'_, WaitRecords, CgroupTable> {
        Tracker::new(&self.waits, &self.delay, &self.counter)
    }
}

#[cfg(test)]
pub(crate) mod simulated;
