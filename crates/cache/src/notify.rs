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

//! Listener fan-out from the entry boundary. Listener (re)configuration
//! takes the per-cache listener lock in write mode; every entry mutation
//! holds it in read mode, which is why notification order matches WAL
//! order: both happen while the entry lock is held.

use ember_core::{CacheEvent, CacheKey, CacheValue, EntryVersion};
use indexmap::IndexMap;
use std::sync::Arc;
use uuid::Uuid;

/// Continuous-query listener: sees every committed update/remove in entry
/// order.
pub trait ContinuousQueryListener: Send + Sync {
    fn on_entry_updated(&self, event: &CacheEvent);
}

/// Data-region dump listener: observes the raw `(key, value, version)`
/// stream, used by region snapshot dumps running alongside live traffic.
pub trait DumpListener: Send + Sync {
    fn on_update(&self, key: &CacheKey, value: Option<&CacheValue>, version: &EntryVersion);
}

/// Cross-datacenter replication hook; runs after lock release with the
/// committed version, preserving causal order per key.
pub trait DrReplicator: Send + Sync {
    fn replicate(
        &self,
        key: &CacheKey,
        value: Option<&CacheValue>,
        version: &EntryVersion,
        topology: u32,
    );
}

/// Optional client-visible mirror of entry values on the hosting platform;
/// best-effort push after lock release.
pub trait PlatformCache: Send + Sync {
    fn update(&self, key: &CacheKey, value: &CacheValue, version: &EntryVersion);
    fn remove(&self, key: &CacheKey, version: &EntryVersion);
}

/// Registered listeners for one cache. Lives behind the cache's listener
/// RwLock; iteration order is registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    continuous: IndexMap<u64, Arc<dyn ContinuousQueryListener>>,
    dump: IndexMap<u64, Arc<dyn DumpListener>>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_continuous(&mut self, listener: Arc<dyn ContinuousQueryListener>) -> u64 {
        self.next_id += 1;
        self.continuous.insert(self.next_id, listener);
        self.next_id
    }

    pub fn register_dump(&mut self, listener: Arc<dyn DumpListener>) -> u64 {
        self.next_id += 1;
        self.dump.insert(self.next_id, listener);
        self.next_id
    }

    pub fn unregister(&mut self, id: u64) -> bool {
        self.continuous.shift_remove(&id).is_some() || self.dump.shift_remove(&id).is_some()
    }

    pub fn has_continuous(&self) -> bool {
        !self.continuous.is_empty()
    }

    /// Deliver an update to every continuous-query and dump listener.
    /// Caller holds the listener lock in read mode and the entry lock.
    pub fn notify_updated(&self, event: &CacheEvent) {
        for listener in self.continuous.values() {
            listener.on_entry_updated(event);
        }
        for listener in self.dump.values() {
            listener.on_update(&event.key, event.new_value.as_ref(), &event.version);
        }
    }
}

/// Fire-and-forget event channel. Sends never block and are dropped when
/// no consumer is attached.
pub struct EventChannel {
    tx: flume::Sender<CacheEvent>,
    rx: flume::Receiver<CacheEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn emit(&self, event: CacheEvent) {
        self.tx.send(event).ok();
    }

    pub fn receiver(&self) -> flume::Receiver<CacheEvent> {
        self.rx.clone()
    }

    /// Drain everything currently queued; test/diagnostic helper.
    pub fn drain(&self) -> Vec<CacheEvent> {
        self.rx.try_iter().collect()
    }
}

/// Make a LOCKED/UNLOCKED event for an MVCC ownership transition.
pub fn lock_event(
    kind: ember_core::EventKind,
    cache_id: u32,
    key: &CacheKey,
    version: EntryVersion,
    node_id: Uuid,
) -> CacheEvent {
    CacheEvent {
        kind,
        cache_id,
        key: key.clone(),
        old_value: None,
        new_value: None,
        version,
        node_id,
    }
}
