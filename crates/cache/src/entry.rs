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

//! The per-key entry state machine. One `CacheEntry` exists per live key
//! per partition; every mutation goes through its lock, and the invariants
//! (tombstone finality, row/memory agreement, version monotonicity) are
//! re-established before each lock release.
//!
//! Locking discipline, kept by every mutator in this module and its
//! `atomic`/`tx` companions: listener lock (read) first, then the entry
//! lock; deferred callbacks (DR, after-hooks, deferred-delete enqueue,
//! platform push) run only after both are released.

use crate::context::CacheContext;
use crate::expiry::{self, TTL_MINIMUM};
use crate::extras::Extras;
use crate::notify::ListenerRegistry;
use crate::storage::wal::{DataRecord, WalOp, record_flags};
use crate::storage::{RowData, RowOp};
use ember_core::{
    CacheError, CacheEvent, CacheKey, CacheValue, EntryVersion, EventKind, FullVersion,
    OperationType,
};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::warn;
use uuid::Uuid;

pub const FLAG_DELETED: u8 = 1 << 0;
pub const FLAG_UNSWAPPED: u8 = 1 << 1;
pub const FLAG_EVICT_DISABLED: u8 = 1 << 2;

/// Tier-specific entry state. Replaces the near/DHT specialization
/// hierarchy with a variant record next to the capability flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierState {
    Plain,
    /// Client-side near entry, mirroring a DHT primary at a recorded
    /// version.
    Near { dht_version: Option<EntryVersion> },
    /// DHT primary/backup entry, optionally tracking near readers.
    Dht { readers: SmallVec<[Uuid; 2]> },
}

/// Visible outcome of a set/remove/atomic update. Business-rule
/// rejections land here, never in `CacheError`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    /// Remove found nothing to remove.
    RemoveNoVal,
    FilterFailed,
    VersionCheckFailed,
    ConflictUseOld,
    /// An entry processor ran and chose not to modify.
    InvokeNoOp,
    InterceptorCancel,
}

impl UpdateOutcome {
    pub fn updated(&self) -> bool {
        matches!(self, UpdateOutcome::Success)
    }
}

/// Result of the transactional set/remove paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub outcome: UpdateOutcome,
    pub old_value: Option<CacheValue>,
    pub new_value: Option<CacheValue>,
    pub version: EntryVersion,
    pub update_counter: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub read_through: bool,
    /// Apply the expiry policy's access rule and persist the new expire
    /// time.
    pub update_ttl: bool,
    pub record_event: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Option<CacheValue>,
    pub version: EntryVersion,
    pub found: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObsoleteMark {
    /// Tombstone installed by this call; the caller performs cleanup.
    Marked,
    AlreadyObsolete,
    /// Eviction disabled or a lock owner at a different version.
    Refused,
}

impl ObsoleteMark {
    pub fn succeeded(&self) -> bool {
        !matches!(self, ObsoleteMark::Refused)
    }
}

/// In-memory entry state, everything behind the entry lock.
#[derive(Debug, Clone)]
pub(crate) struct EntryState {
    pub value: Option<CacheValue>,
    pub version: EntryVersion,
    pub conflict_version: Option<EntryVersion>,
    pub extras: Extras,
    pub flags: u8,
    pub tier: TierState,
}

impl EntryState {
    fn new(tier: TierState) -> Self {
        Self {
            value: None,
            version: EntryVersion::START,
            conflict_version: None,
            extras: Extras::new(),
            flags: 0,
            tier,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn is_obsolete(&self) -> bool {
        self.extras.is_obsolete()
    }

    pub fn ttl(&self) -> u64 {
        self.extras.ttl()
    }

    pub fn expire_time(&self) -> u64 {
        self.extras.expire_time()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        let expire = self.expire_time();
        expire != 0 && expire <= now
    }

    pub fn full_version(&self) -> FullVersion {
        FullVersion {
            version: self.version,
            conflict: self.conflict_version,
        }
    }
}

pub struct CacheEntry {
    key: CacheKey,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    /// A fresh entry at the start version, with no value. Entries are
    /// created lazily, on first touch.
    pub fn new(key: CacheKey, tier: TierState) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::new(tier)),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    pub fn version(&self) -> EntryVersion {
        self.state.lock().version
    }

    pub fn is_obsolete(&self) -> bool {
        self.state.lock().is_obsolete()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().has_flag(FLAG_DELETED)
    }

    pub fn has_value(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Disable/enable obsolete-marking for eviction protection.
    pub fn set_eviction_disabled(&self, disabled: bool) {
        let mut state = self.state.lock();
        if disabled {
            state.set_flag(FLAG_EVICT_DISABLED);
        } else {
            state.clear_flag(FLAG_EVICT_DISABLED);
        }
    }

    /// Value and version without loads, events or TTL updates. An expired
    /// value is not returned, but not expired either; that is the TTL
    /// tracker's or the next `get`'s job.
    pub fn peek(&self, ctx: &CacheContext) -> Result<Option<(CacheValue, EntryVersion)>, CacheError> {
        let state = self.state.lock();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        if state.is_expired(ctx.now_millis()) {
            return Ok(None);
        }
        Ok(state.value.clone().map(|v| (v, state.version)))
    }

    pub fn get(&self, ctx: &CacheContext, opts: &GetOptions) -> Result<GetResult, CacheError> {
        let _timer = ctx.stats.time(OperationType::CacheGet);
        let mut post = PostOps::default();
        let result = self.get_inner(ctx, opts, &mut post);
        post.run(ctx, &self.key)?;
        result
    }

    fn get_inner(
        &self,
        ctx: &CacheContext,
        opts: &GetOptions,
        post: &mut PostOps,
    ) -> Result<GetResult, CacheError> {
        let listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        self.ensure_unswapped(ctx, &mut state)?;

        let now = ctx.now_millis();
        if state.is_expired(now) {
            self.expire_locked(ctx, &listeners, &mut state, post)?;
            return Ok(GetResult {
                value: None,
                version: state.version,
                found: false,
            });
        }

        if state.value.is_none() {
            let (read_through, store) = (opts.read_through, ctx.store().cloned());
            if let (true, Some(store)) = (read_through, store) {
                let observed = state.version;
                drop(state);
                drop(listeners);

                // Loader runs under no locks; anything may happen to the
                // entry in the meantime.
                let loaded = store.load(&self.key)?;

                let listeners = ctx.listeners.read();
                let mut state = self.state.lock();
                if state.is_obsolete() {
                    return Err(CacheError::EntryRemoved);
                }
                let Some(value) = loaded else {
                    return Ok(GetResult {
                        value: None,
                        version: state.version,
                        found: false,
                    });
                };
                if state.version == observed {
                    self.install_loaded(ctx, &mut state, value.clone())?;
                    if opts.record_event {
                        self.emit_read_event(ctx, &state, &value);
                    }
                    return Ok(GetResult {
                        value: Some(value),
                        version: state.version,
                        found: true,
                    });
                }
                // The entry moved on while we were loading; hand the loaded
                // value to our caller but do not install it.
                return Ok(GetResult {
                    value: Some(value),
                    version: state.version,
                    found: true,
                });
            }
            return Ok(GetResult {
                value: None,
                version: state.version,
                found: false,
            });
        }

        // TTL-on-access: persist the refreshed expire time under the lock.
        if opts.update_ttl {
            if let Some(policy) = ctx.expiry_policy() {
                if let Some(resolved) =
                    expiry::resolve_for_access(policy.as_ref(), state.ttl(), state.expire_time(), now)
                {
                    state.extras.set_expiration(resolved.ttl, resolved.expire_time);
                    let data = RowData {
                        value: state.value.clone().unwrap(),
                        version: state.version,
                        expire_time: resolved.expire_time,
                    };
                    ctx.rows().invoke(
                        ctx.cache_id,
                        &self.key,
                        self.key.partition(),
                        &mut |row| {
                            Ok(if row.is_some() {
                                RowOp::InPlace(data.clone())
                            } else {
                                RowOp::Noop
                            })
                        },
                    )?;
                }
            }
        }

        let value = state.value.clone().unwrap();
        if opts.record_event {
            self.emit_read_event(ctx, &state, &value);
        }
        Ok(GetResult {
            value: Some(value),
            version: state.version,
            found: true,
        })
    }

    /// Re-read the value through the external loader. The load happens
    /// under no lock; the result is installed only if the entry version
    /// did not move in the meantime, and is returned to the caller either
    /// way.
    pub fn reload(&self, ctx: &CacheContext) -> Result<Option<CacheValue>, CacheError> {
        let Some(store) = ctx.store().cloned() else {
            return Ok(None);
        };
        let observed = {
            let state = self.state.lock();
            if state.is_obsolete() {
                return Err(CacheError::EntryRemoved);
            }
            state.version
        };

        let loaded = store.load(&self.key)?;

        let _listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        if let Some(value) = &loaded {
            if state.version == observed {
                self.install_loaded(ctx, &mut state, value.clone())?;
            }
        }
        Ok(loaded)
    }

    /// Driven by the TTL tracker. Returns whether the entry expired now.
    /// Errors racing a node shutdown are logged and swallowed.
    pub fn expire(&self, ctx: &CacheContext) -> Result<bool, CacheError> {
        let mut post = PostOps::default();
        let result = {
            let listeners = ctx.listeners.read();
            let mut state = self.state.lock();
            if state.is_obsolete() {
                Ok(false)
            } else if !state.is_expired(ctx.now_millis()) {
                Ok(false)
            } else {
                self.expire_locked(ctx, &listeners, &mut state, &mut post)
                    .map(|_| true)
            }
        };
        match result {
            Err(e) if ctx.is_stopping() => {
                warn!("expiration of entry failed during node stop: {e}");
                Ok(false)
            }
            Err(CacheError::NodeStopping) => {
                warn!("expiration of entry raced node stop");
                Ok(false)
            }
            other => {
                post.run(ctx, &self.key)?;
                other
            }
        }
    }

    /// Install the terminal tombstone. Idempotent: an already-obsolete
    /// entry reports `AlreadyObsolete` and the cleanup side runs at most
    /// once, on the `Marked` transition.
    pub fn mark_obsolete(&self, ctx: &CacheContext, version: &EntryVersion) -> ObsoleteMark {
        let _listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        Self::mark_obsolete_locked(&mut state, version, None)
    }

    /// `permitted_owner` admits the one lock owner allowed to coexist with
    /// the tombstone: the removing transaction itself.
    pub(crate) fn mark_obsolete_locked(
        state: &mut EntryState,
        version: &EntryVersion,
        permitted_owner: Option<&EntryVersion>,
    ) -> ObsoleteMark {
        if state.is_obsolete() {
            return ObsoleteMark::AlreadyObsolete;
        }
        if state.has_flag(FLAG_EVICT_DISABLED) {
            return ObsoleteMark::Refused;
        }
        if let Some(owner) = state.extras.mvcc().and_then(|m| m.owner().cloned()) {
            let permitted =
                owner.version == *version || permitted_owner.is_some_and(|p| owner.version == *p);
            if !permitted {
                return ObsoleteMark::Refused;
            }
        }
        state.extras.set_obsolete(*version);
        state.value = None;
        ObsoleteMark::Marked
    }

    /// Claim the entry for a local transaction. Ownership transitions emit
    /// LOCKED/UNLOCKED events.
    pub fn lock_local(
        &self,
        ctx: &CacheContext,
        version: EntryVersion,
        thread_id: u64,
        near_local: bool,
    ) -> Result<bool, CacheError> {
        let _timer = ctx.stats.time(OperationType::CacheLock);
        let _listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        let node = ctx.node_id;
        let change = state
            .extras
            .with_mvcc(|m| m.add_local(version, node, thread_id, near_local));
        self.emit_owner_change(ctx, &change);
        Ok(state.extras.mvcc().is_some_and(|m| m.is_owned_by(&version)))
    }

    pub fn lock_remote(
        &self,
        ctx: &CacheContext,
        version: EntryVersion,
        node_id: Uuid,
        thread_id: u64,
        other_node_id: Option<Uuid>,
    ) -> Result<bool, CacheError> {
        let _listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        let change = state
            .extras
            .with_mvcc(|m| m.add_remote(version, node_id, thread_id, other_node_id));
        self.emit_owner_change(ctx, &change);
        Ok(state.extras.mvcc().is_some_and(|m| m.is_owned_by(&version)))
    }

    /// Release a lock candidate. Obsolete entries accept unlocks (the
    /// owner may be releasing after a removal it performed itself).
    pub fn unlock(&self, ctx: &CacheContext, version: &EntryVersion) {
        let _listeners = ctx.listeners.read();
        let mut state = self.state.lock();
        let change = state.extras.with_mvcc(|m| m.remove(version));
        self.emit_owner_change(ctx, &change);
    }

    pub fn is_locked_by(&self, version: &EntryVersion) -> bool {
        let state = self.state.lock();
        state.extras.mvcc().is_some_and(|m| m.is_owned_by(version))
    }

    /// Diagnostics stringification. Bounded wait on the entry lock so a
    /// stuck entry never blocks logging.
    pub fn describe(&self, ctx: &CacheContext) -> String {
        match self.state.try_lock_for(ctx.config.lock_wait) {
            Some(state) => format!(
                "CacheEntry[key={:?}, ver=({},{},{}), hasValue={}, deleted={}, obsolete={}, expire={}]",
                String::from_utf8_lossy(self.key.bytes()),
                state.version.topology(),
                state.version.order(),
                state.version.node_order(),
                state.value.is_some(),
                state.has_flag(FLAG_DELETED),
                state.is_obsolete(),
                state.expire_time(),
            ),
            None => format!(
                "CacheEntry[key={:?}, <locked>]",
                String::from_utf8_lossy(self.key.bytes())
            ),
        }
    }

    // -- shared internals, also used by the atomic and tx paths --

    /// Pull the row-store state into memory on the first touch of a
    /// start-version entry.
    pub(crate) fn ensure_unswapped(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
    ) -> Result<(), CacheError> {
        if !state.version.is_start() || state.has_flag(FLAG_UNSWAPPED) {
            if state.version.is_start() {
                state.set_flag(FLAG_UNSWAPPED);
            }
            return Ok(());
        }
        if let Some(row) = ctx.rows().read(ctx.cache_id, &self.key)? {
            state.value = Some(row.value);
            state.version = row.version;
            if row.expire_time != 0 {
                let ttl = row
                    .expire_time
                    .saturating_sub(ctx.now_millis())
                    .max(TTL_MINIMUM);
                state.extras.set_expiration(ttl, row.expire_time);
            }
        }
        state.set_flag(FLAG_UNSWAPPED);
        Ok(())
    }

    /// Expire the entry: EXPIRED event, row removal, then the same
    /// tombstoning discipline as remove. Caller holds both locks and has
    /// established that the expire time has passed.
    pub(crate) fn expire_locked(
        &self,
        ctx: &CacheContext,
        listeners: &ListenerRegistry,
        state: &mut EntryState,
        post: &mut PostOps,
    ) -> Result<(), CacheError> {
        let old_value = state.value.clone();
        let expired_version = state.version;

        ctx.rows()
            .invoke(ctx.cache_id, &self.key, self.key.partition(), &mut |row| {
                Ok(if row.is_some() {
                    RowOp::Remove
                } else {
                    RowOp::Noop
                })
            })?;

        let new_version = ctx.next_version();
        if let Some(wal) = ctx.wal() {
            wal.append(&DataRecord {
                cache_id: ctx.cache_id,
                key: self.key.byte_view(),
                value: None,
                op: WalOp::Delete,
                near_xid: None,
                write_version: new_version,
                expire_time: 0,
                partition: self.key.partition(),
                update_counter: ctx.next_update_counter(self.key.partition()),
                flags: record_flags::PRIMARY,
            })?;
        }

        state.value = None;
        state.extras.set_expiration(0, 0);
        state.version = new_version;

        if ctx.config.deferred_delete {
            state.set_flag(FLAG_DELETED);
            post.deferred_delete = Some(new_version);
        } else {
            Self::mark_obsolete_locked(state, &new_version, None);
        }

        let event = CacheEvent {
            kind: EventKind::Expired,
            cache_id: ctx.cache_id,
            key: self.key.clone(),
            old_value,
            new_value: None,
            version: expired_version,
            node_id: ctx.node_id,
        };
        listeners.notify_updated(&event);
        if ctx.config.record_events {
            ctx.events().emit(event);
        }
        Ok(())
    }

    /// Install a read-through value at a fresh version and persist it.
    fn install_loaded(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
        value: CacheValue,
    ) -> Result<(), CacheError> {
        let now = ctx.now_millis();
        let resolved = expiry::resolve_for_write(
            None,
            None,
            ctx.expiry_policy().map(|p| p.as_ref()),
            false,
            0,
            0,
            now,
        );
        let version = ctx.next_version();
        let applied = ctx
            .rows()
            .invoke(ctx.cache_id, &self.key, self.key.partition(), &mut |_| {
                Ok(RowOp::Put(RowData {
                    value: value.clone(),
                    version,
                    expire_time: resolved.expire_time,
                }))
            })?;
        if let Some(wal) = ctx.wal() {
            wal.append(&DataRecord {
                cache_id: ctx.cache_id,
                key: self.key.byte_view(),
                value: Some(value.byte_view()),
                op: if matches!(applied.op, crate::storage::AppliedOp::InPlace) {
                    WalOp::Update
                } else {
                    WalOp::Create
                },
                near_xid: None,
                write_version: version,
                expire_time: resolved.expire_time as i64,
                partition: self.key.partition(),
                update_counter: ctx.next_update_counter(self.key.partition()),
                flags: record_flags::PRIMARY | record_flags::FROM_STORE,
            })?;
        }
        state.value = Some(value);
        state.version = version;
        state.conflict_version = None;
        state
            .extras
            .set_expiration(resolved.ttl, resolved.expire_time);
        state.clear_flag(FLAG_DELETED);
        Ok(())
    }

    fn emit_read_event(&self, ctx: &CacheContext, state: &EntryState, value: &CacheValue) {
        if !ctx.config.record_events {
            return;
        }
        ctx.events().emit(CacheEvent {
            kind: EventKind::Read,
            cache_id: ctx.cache_id,
            key: self.key.clone(),
            old_value: None,
            new_value: Some(value.clone()),
            version: state.version,
            node_id: ctx.node_id,
        });
    }

    fn emit_owner_change(&self, ctx: &CacheContext, change: &crate::mvcc::OwnerChange) {
        if !change.changed() || !ctx.config.record_events {
            return;
        }
        if let Some(prev) = &change.previous {
            ctx.events().emit(crate::notify::lock_event(
                EventKind::Unlocked,
                ctx.cache_id,
                &self.key,
                prev.version,
                prev.node_id,
            ));
        }
        if let Some(cur) = &change.current {
            ctx.events().emit(crate::notify::lock_event(
                EventKind::Locked,
                ctx.cache_id,
                &self.key,
                cur.version,
                cur.node_id,
            ));
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // No bounded wait here; Debug must never block at all.
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("CacheEntry")
                .field("key", &String::from_utf8_lossy(self.key.bytes()))
                .field("version", &state.version)
                .field("has_value", &state.value.is_some())
                .field("obsolete", &state.is_obsolete())
                .finish(),
            None => f
                .debug_struct("CacheEntry")
                .field("key", &String::from_utf8_lossy(self.key.bytes()))
                .field("state", &"<locked>")
                .finish(),
        }
    }
}

/// Callbacks deferred to after lock release. Running them under the locks
/// risks cross-entry deadlocks, so mutators accumulate them here and the
/// public operation drains them last.
#[derive(Default)]
pub(crate) struct PostOps {
    /// Write-through outside the entry lock (transactional path and
    /// version-check replay).
    pub store_write: Option<(CacheValue, EntryVersion)>,
    pub store_delete: bool,
    pub dr: Option<(Option<CacheValue>, EntryVersion, u32)>,
    pub after_put: Option<(CacheValue, i64)>,
    pub after_remove: Option<Option<CacheValue>>,
    pub platform_update: Option<(CacheValue, EntryVersion)>,
    pub platform_remove: Option<EntryVersion>,
    pub deferred_delete: Option<EntryVersion>,
}

impl PostOps {
    pub fn run(self, ctx: &CacheContext, key: &CacheKey) -> Result<(), CacheError> {
        if let Some((value, version)) = &self.store_write {
            if let Some(store) = ctx.store() {
                store.write(key, value, version)?;
            }
        }
        if self.store_delete {
            if let Some(store) = ctx.store() {
                store.delete(key)?;
            }
        }
        if let Some((value, version, topology)) = &self.dr {
            if let Some(dr) = ctx.dr() {
                dr.replicate(key, value.as_ref(), version, *topology);
            }
        }
        if let Some((value, counter)) = &self.after_put {
            if let Some(interceptor) = ctx.interceptor() {
                interceptor.after_put(key, value, *counter);
            }
        }
        if let Some(old) = &self.after_remove {
            if let Some(interceptor) = ctx.interceptor() {
                interceptor.after_remove(key, old.as_ref());
            }
        }
        if let Some((value, version)) = &self.platform_update {
            if let Some(platform) = ctx.platform() {
                platform.update(key, value, version);
            }
        }
        if let Some(version) = &self.platform_remove {
            if let Some(platform) = ctx.platform() {
                platform.remove(key, version);
            }
        }
        if let Some(version) = self.deferred_delete {
            ctx.enqueue_deferred(key.clone(), version);
        }
        Ok(())
    }
}
