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

//! The per-cache context. Entries hold no back-references; every operation
//! receives a `&CacheContext` and resolves stores, hooks, clocks and
//! counters through it.

use crate::config::CacheConfig;
use crate::conflict::ConflictResolver;
use crate::expiry::ExpiryPolicy;
use crate::interceptor::{CacheInterceptor, InterceptorBarrier};
use crate::loader::CacheStore;
use crate::notify::{DrReplicator, EventChannel, ListenerRegistry, PlatformCache};
use crate::stats::PerfStats;
use crate::storage::wal::{MemWal, Wal};
use crate::storage::{MemRowStore, RowStore};
use ahash::AHashMap;
use ember_core::{CacheKey, EntryVersion, TypeRegistry, VersionSource};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use uuid::Uuid;

/// Source of wall-clock milliseconds for TTL arithmetic. Injected so tests
/// can advance time.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock(std::sync::atomic::AtomicU64);

impl ManualClock {
    pub fn at(millis: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(millis))
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A tombstoned entry queued for the deferred-delete consumer.
#[derive(Debug, Clone)]
pub struct DeferredDelete {
    pub key: CacheKey,
    /// Entry version at tombstoning time; the consumer refuses to finalize
    /// an entry that has been rewritten since.
    pub version: EntryVersion,
}

pub struct CacheContext {
    pub cache_id: u32,
    pub name: String,
    pub config: CacheConfig,
    pub node_id: Uuid,
    pub versions: VersionSource,
    pub types: TypeRegistry,
    pub stats: PerfStats,

    time: Arc<dyn TimeSource>,
    rows: Arc<dyn RowStore>,
    wal: Option<Arc<dyn Wal>>,
    store: Option<Arc<dyn CacheStore>>,
    interceptor: Option<InterceptorBarrier>,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    expiry: Option<Arc<dyn ExpiryPolicy>>,
    dr: Option<Arc<dyn DrReplicator>>,
    platform: Option<Arc<dyn PlatformCache>>,

    pub(crate) listeners: RwLock<ListenerRegistry>,
    events: EventChannel,

    deferred_tx: flume::Sender<DeferredDelete>,
    deferred_rx: flume::Receiver<DeferredDelete>,

    update_counters: Mutex<AHashMap<u32, Arc<AtomicI64>>>,
    stopping: AtomicBool,
}

impl CacheContext {
    pub fn new(cache_id: u32, name: impl Into<String>, config: CacheConfig) -> Self {
        let wal: Option<Arc<dyn Wal>> = if config.wal_enabled {
            Some(Arc::new(MemWal::new()))
        } else {
            None
        };
        let (deferred_tx, deferred_rx) = flume::unbounded();
        Self {
            cache_id,
            name: name.into(),
            config,
            node_id: Uuid::new_v4(),
            versions: VersionSource::new(1, 0),
            types: TypeRegistry::new(),
            stats: PerfStats::new(),
            time: Arc::new(SystemClock),
            rows: Arc::new(MemRowStore::new()),
            wal,
            store: None,
            interceptor: None,
            conflict_resolver: None,
            expiry: None,
            dr: None,
            platform: None,
            listeners: RwLock::new(ListenerRegistry::new()),
            events: EventChannel::new(),
            deferred_tx,
            deferred_rx,
            update_counters: Mutex::new(AHashMap::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn with_version_source(mut self, versions: VersionSource) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_row_store(mut self, rows: Arc<dyn RowStore>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_wal(mut self, wal: Arc<dyn Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CacheInterceptor>) -> Self {
        self.interceptor = Some(InterceptorBarrier::new(interceptor));
        self
    }

    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    pub fn with_expiry_policy(mut self, policy: Arc<dyn ExpiryPolicy>) -> Self {
        self.expiry = Some(policy);
        self
    }

    pub fn with_dr(mut self, dr: Arc<dyn DrReplicator>) -> Self {
        self.dr = Some(dr);
        self
    }

    pub fn with_platform_cache(mut self, platform: Arc<dyn PlatformCache>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }

    pub fn next_version(&self) -> EntryVersion {
        self.versions.next()
    }

    pub fn rows(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }

    /// The WAL, when this cache logs at all.
    pub fn wal(&self) -> Option<&Arc<dyn Wal>> {
        self.wal.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    pub fn interceptor(&self) -> Option<&InterceptorBarrier> {
        self.interceptor.as_ref()
    }

    pub fn conflict_resolver(&self) -> Option<&Arc<dyn ConflictResolver>> {
        self.conflict_resolver.as_ref()
    }

    pub fn expiry_policy(&self) -> Option<&Arc<dyn ExpiryPolicy>> {
        self.expiry.as_ref()
    }

    pub fn dr(&self) -> Option<&Arc<dyn DrReplicator>> {
        self.dr.as_ref()
    }

    pub fn platform(&self) -> Option<&Arc<dyn PlatformCache>> {
        self.platform.as_ref()
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Listener registration takes the listener lock in write mode; no
    /// entry lock may be held by the caller.
    pub fn register_continuous_listener(
        &self,
        listener: Arc<dyn crate::notify::ContinuousQueryListener>,
    ) -> u64 {
        self.listeners.write().register_continuous(listener)
    }

    pub fn register_dump_listener(&self, listener: Arc<dyn crate::notify::DumpListener>) -> u64 {
        self.listeners.write().register_dump(listener)
    }

    pub fn unregister_listener(&self, id: u64) -> bool {
        self.listeners.write().unregister(id)
    }

    fn counter(&self, partition: u32) -> Arc<AtomicI64> {
        let mut counters = self.update_counters.lock();
        counters.entry(partition).or_default().clone()
    }

    /// Allocate the next per-partition update counter value.
    pub fn next_update_counter(&self, partition: u32) -> i64 {
        self.counter(partition).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn update_counter(&self, partition: u32) -> i64 {
        self.counter(partition).load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue_deferred(&self, key: CacheKey, version: EntryVersion) {
        self.deferred_tx.send(DeferredDelete { key, version }).ok();
    }

    pub fn deferred_receiver(&self) -> flume::Receiver<DeferredDelete> {
        self.deferred_rx.clone()
    }

    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counters_per_partition() {
        let ctx = CacheContext::new(1, "test", CacheConfig::default());
        assert_eq!(ctx.next_update_counter(0), 1);
        assert_eq!(ctx.next_update_counter(0), 2);
        assert_eq!(ctx.next_update_counter(1), 1);
        assert_eq!(ctx.update_counter(0), 2);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::at(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 1_250);
    }

    #[test]
    fn test_wal_absent_when_disabled() {
        let ctx = CacheContext::new(
            1,
            "nolog",
            CacheConfig {
                wal_enabled: false,
                ..Default::default()
            },
        );
        assert!(ctx.wal().is_none());
    }
}
