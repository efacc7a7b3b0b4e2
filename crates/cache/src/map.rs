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

//! The per-cache entry map: per-partition shards of live entries, created
//! lazily on first touch. Also home of the deferred-delete consumer and
//! the obsolete-retry wrappers that callers use instead of handling
//! `EntryRemoved` themselves.

use crate::atomic::{AtomicRequest, AtomicResult};
use crate::context::CacheContext;
use crate::entry::{CacheEntry, GetOptions, GetResult, TierState};
use ahash::AHashMap;
use ember_core::{CacheError, CacheKey};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

struct Shard {
    entries: RwLock<AHashMap<CacheKey, Arc<CacheEntry>>>,
}

/// Map of live entries for one cache.
pub struct EntryMap {
    shards: RwLock<AHashMap<u32, Arc<Shard>>>,
}

impl Default for EntryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryMap {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(AHashMap::new()),
        }
    }

    fn shard(&self, partition: u32) -> Arc<Shard> {
        {
            let shards = self.shards.read();
            if let Some(s) = shards.get(&partition) {
                return s.clone();
            }
        }
        let mut shards = self.shards.write();
        shards
            .entry(partition)
            .or_insert_with(|| {
                Arc::new(Shard {
                    entries: RwLock::new(AHashMap::new()),
                })
            })
            .clone()
    }

    fn tier_for(ctx: &CacheContext) -> TierState {
        if ctx.config.near {
            TierState::Near { dht_version: None }
        } else if ctx.config.dht {
            TierState::Dht {
                readers: SmallVec::new(),
            }
        } else {
            TierState::Plain
        }
    }

    /// The entry for a key, created at the start version on first touch.
    /// An obsolete entry found in the map is unlinked and replaced by a
    /// fresh one.
    pub fn entry(&self, ctx: &CacheContext, key: &CacheKey) -> Arc<CacheEntry> {
        let shard = self.shard(key.partition());
        {
            let entries = shard.entries.read();
            if let Some(e) = entries.get(key) {
                if !e.is_obsolete() {
                    return e.clone();
                }
            }
        }
        let mut entries = shard.entries.write();
        match entries.get(key) {
            Some(e) if !e.is_obsolete() => e.clone(),
            _ => {
                let fresh = Arc::new(CacheEntry::new(key.clone(), Self::tier_for(ctx)));
                entries.insert(key.clone(), fresh.clone());
                fresh
            }
        }
    }

    /// The entry if present, without creating one.
    pub fn peek_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let shard = self.shard(key.partition());
        let entries = shard.entries.read();
        entries.get(key).cloned()
    }

    /// Unlink an obsolete entry. No-op when the mapped entry is live.
    pub fn remove_obsolete(&self, key: &CacheKey) {
        let shard = self.shard(key.partition());
        let mut entries = shard.entries.write();
        if let Some(e) = entries.get(key) {
            if e.is_obsolete() {
                entries.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        let shards = self.shards.read();
        shards.values().map(|s| s.entries.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get with obsolete-retry: a concurrently removed entry is unlinked
    /// and the lookup restarted on a fresh one.
    pub fn get(
        &self,
        ctx: &CacheContext,
        key: &CacheKey,
        opts: &GetOptions,
    ) -> Result<GetResult, CacheError> {
        loop {
            let entry = self.entry(ctx, key);
            match entry.get(ctx, opts) {
                Err(CacheError::EntryRemoved) => {
                    self.remove_obsolete(key);
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Atomic update with obsolete-retry.
    pub fn atomic_update(
        &self,
        ctx: &CacheContext,
        key: &CacheKey,
        req: &AtomicRequest,
    ) -> Result<AtomicResult, CacheError> {
        loop {
            let entry = self.entry(ctx, key);
            match entry.atomic_update(ctx, req) {
                Err(CacheError::EntryRemoved) => {
                    self.remove_obsolete(key);
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Drain the deferred-delete queue, finalizing tombstones. Single
    /// consumer per cache; returns how many entries were made obsolete and
    /// unlinked.
    pub fn process_deferred(&self, ctx: &CacheContext) -> usize {
        let rx = ctx.deferred_receiver();
        let mut finalized = 0;
        for queued in rx.try_iter() {
            let Some(entry) = self.peek_entry(&queued.key) else {
                continue;
            };
            if entry.finalize_deferred(ctx, &queued.version) {
                self.remove_obsolete(&queued.key);
                finalized += 1;
            }
        }
        finalized
    }
}
