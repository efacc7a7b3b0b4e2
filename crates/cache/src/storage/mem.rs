// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::storage::{AppliedOp, InvokeClosure, Row, RowApplied, RowOp, RowStore};
use ahash::AHashMap;
use ember_core::{CacheError, CacheKey};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Partition = AHashMap<CacheKey, Row>;

/// In-memory row store: latched hash maps, one per `(cache, partition)`.
/// Links are allocated from a single monotonic counter; a `Put` over an
/// existing row whose new value fits the old footprint is rewritten in
/// place, keeping the link.
pub struct MemRowStore {
    partitions: RwLock<AHashMap<(u32, u32), Arc<Mutex<Partition>>>>,
    next_link: AtomicU64,
}

impl Default for MemRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRowStore {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(AHashMap::new()),
            next_link: AtomicU64::new(1),
        }
    }

    fn partition(&self, cache_id: u32, partition: u32) -> Arc<Mutex<Partition>> {
        {
            let parts = self.partitions.read();
            if let Some(p) = parts.get(&(cache_id, partition)) {
                return p.clone();
            }
        }
        // Double-check under the write lock; another thread may have
        // created the partition while we waited.
        let mut parts = self.partitions.write();
        parts
            .entry((cache_id, partition))
            .or_insert_with(|| Arc::new(Mutex::new(AHashMap::new())))
            .clone()
    }

    fn alloc_link(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }
}

impl RowStore for MemRowStore {
    fn invoke(
        &self,
        cache_id: u32,
        key: &CacheKey,
        partition: u32,
        closure: &mut InvokeClosure<'_>,
    ) -> Result<RowApplied, CacheError> {
        let part = self.partition(cache_id, partition);
        let mut rows = part.lock();
        let current = rows.get(key);
        let op = closure(current)?;
        match op {
            RowOp::Noop => Ok(RowApplied {
                op: AppliedOp::Noop,
                link: current.map(|r| r.link),
            }),
            RowOp::Put(data) => {
                let (link, applied) = match rows.get(key) {
                    Some(old) if data.value.len() <= old.value.len() => {
                        (old.link, AppliedOp::InPlace)
                    }
                    _ => (self.alloc_link(), AppliedOp::Put),
                };
                rows.insert(
                    key.clone(),
                    Row {
                        key: key.clone(),
                        value: data.value,
                        version: data.version,
                        expire_time: data.expire_time,
                        link,
                    },
                );
                Ok(RowApplied {
                    op: applied,
                    link: Some(link),
                })
            }
            RowOp::InPlace(data) => {
                let link = rows.get(key).map_or_else(|| self.alloc_link(), |r| r.link);
                rows.insert(
                    key.clone(),
                    Row {
                        key: key.clone(),
                        value: data.value,
                        version: data.version,
                        expire_time: data.expire_time,
                        link,
                    },
                );
                Ok(RowApplied {
                    op: AppliedOp::InPlace,
                    link: Some(link),
                })
            }
            RowOp::Remove => {
                let existed = rows.remove(key).is_some();
                Ok(RowApplied {
                    op: if existed {
                        AppliedOp::Removed
                    } else {
                        AppliedOp::Noop
                    },
                    link: None,
                })
            }
        }
    }

    fn read(&self, cache_id: u32, key: &CacheKey) -> Result<Option<Row>, CacheError> {
        let part = self.partition(cache_id, key.partition());
        let rows = part.lock();
        Ok(rows.get(key).cloned())
    }

    fn row_count(&self, cache_id: u32) -> usize {
        let parts = self.partitions.read();
        parts
            .iter()
            .filter(|((cid, _), _)| *cid == cache_id)
            .map(|(_, p)| p.lock().len())
            .sum()
    }
}
