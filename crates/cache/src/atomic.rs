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

//! The atomic update closure: one pass over the entry under the row
//! store's latch with the entry lock held. Conflict resolution, version
//! check, filters, interceptor, TTL computation, write-through, WAL append
//! and the row operation all happen inside; only the downstream pushes
//! (DR, after-hooks, platform) run after lock release.

use crate::conflict::{ConflictContext, ConflictEntryView, ConflictResolution};
use crate::context::CacheContext;
use crate::entry::{
    CacheEntry, EntryState, FLAG_DELETED, FLAG_EVICT_DISABLED, PostOps, UpdateOutcome,
};
use crate::expiry;
use crate::storage::wal::{DataRecord, WalOp, record_flags};
use crate::storage::{RowData, RowOp};
use ember_core::{
    CacheError, CacheEvent, CacheKey, CacheValue, EntryVersion, EventKind, FullVersion,
    OperationType, atomic_cmp,
};
use std::cmp::Ordering;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// A user entry processor, run under the critical section on TRANSFORM.
/// Failures (errors and panics alike) are captured into the result and
/// never abort the operation.
pub trait EntryProcessor: Send + Sync {
    fn process(&self, entry: &mut InvokeEntry<'_>) -> Result<Option<CacheValue>, String>;
}

/// The processor's mutable view of the entry. The value is unwrapped
/// lazily; mutations flip the `modified` flag which decides whether the
/// operation downgrades to UPDATE, DELETE, or no-op.
pub struct InvokeEntry<'a> {
    key: &'a CacheKey,
    value: Option<CacheValue>,
    modified: bool,
}

impl<'a> InvokeEntry<'a> {
    pub fn key(&self) -> &CacheKey {
        self.key
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: CacheValue) {
        self.value = Some(value);
        self.modified = true;
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.modified = true;
    }
}

/// Entry predicate, evaluated atomically against the current value.
pub trait EntryFilter: Send + Sync {
    fn matches(&self, value: Option<&CacheValue>) -> bool;
}

#[derive(Clone)]
pub enum AtomicOp {
    Update(CacheValue),
    Delete,
    Transform(Arc<dyn EntryProcessor>),
}

impl std::fmt::Debug for AtomicOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtomicOp::Update(v) => f.debug_tuple("Update").field(v).finish(),
            AtomicOp::Delete => write!(f, "Delete"),
            AtomicOp::Transform(_) => write!(f, "Transform(..)"),
        }
    }
}

pub struct AtomicRequest {
    pub op: AtomicOp,
    pub new_version: EntryVersion,
    pub conflict_version: Option<EntryVersion>,
    pub version_check: bool,
    pub filters: Vec<Arc<dyn EntryFilter>>,
    pub explicit_ttl: Option<u64>,
    pub explicit_expire_time: Option<u64>,
    pub read_through: bool,
    pub write_through: bool,
    pub primary: bool,
    pub intercept: bool,
    pub preload: bool,
    /// Refresh TTL-on-access when the filter rejects the update.
    pub access_ttl_on_filter_fail: bool,
}

impl AtomicRequest {
    fn base(op: AtomicOp, new_version: EntryVersion) -> Self {
        Self {
            op,
            new_version,
            conflict_version: None,
            version_check: false,
            filters: vec![],
            explicit_ttl: None,
            explicit_expire_time: None,
            read_through: false,
            write_through: false,
            primary: true,
            intercept: true,
            preload: false,
            access_ttl_on_filter_fail: false,
        }
    }

    pub fn update(value: CacheValue, new_version: EntryVersion) -> Self {
        Self::base(AtomicOp::Update(value), new_version)
    }

    pub fn delete(new_version: EntryVersion) -> Self {
        Self::base(AtomicOp::Delete, new_version)
    }

    pub fn transform(processor: Arc<dyn EntryProcessor>, new_version: EntryVersion) -> Self {
        Self::base(AtomicOp::Transform(processor), new_version)
    }
}

#[derive(Debug)]
pub struct AtomicResult {
    pub outcome: UpdateOutcome,
    pub old_value: Option<CacheValue>,
    pub new_value: Option<CacheValue>,
    /// Present when a processor ran: its return value or captured failure.
    pub invoke_result: Option<Result<Option<CacheValue>, String>>,
    pub new_ttl: u64,
    pub new_expire_time: u64,
    /// Version handed to the deferred-delete queue, when a tombstone was
    /// enqueued.
    pub enqueue_version: Option<EntryVersion>,
    pub conflict_ctx: Option<ConflictContext>,
    pub update_counter: i64,
    pub transformed: bool,
}

impl AtomicResult {
    fn rejected(outcome: UpdateOutcome, old_value: Option<CacheValue>) -> Self {
        Self {
            outcome,
            old_value,
            new_value: None,
            invoke_result: None,
            new_ttl: 0,
            new_expire_time: 0,
            enqueue_version: None,
            conflict_ctx: None,
            update_counter: 0,
            transformed: false,
        }
    }
}

/// The closure's working state, filled step by step.
struct Pass {
    result: Option<AtomicResult>,
    events: Vec<CacheEvent>,
    from_store: bool,
    expired_in_pass: bool,
}

impl CacheEntry {
    pub fn atomic_update(
        &self,
        ctx: &CacheContext,
        req: &AtomicRequest,
    ) -> Result<AtomicResult, CacheError> {
        let _timer = ctx.stats.time(match req.op {
            AtomicOp::Update(_) => OperationType::CachePut,
            AtomicOp::Delete => OperationType::CacheRemove,
            AtomicOp::Transform(_) => OperationType::CacheInvoke,
        });
        let mut post = PostOps::default();
        let result = {
            let listeners = ctx.listeners.read();
            let mut state = self.lock_state();
            if state.is_obsolete() {
                return Err(CacheError::EntryRemoved);
            }
            self.ensure_unswapped(ctx, &mut state)?;

            let mut pass = Pass {
                result: None,
                events: vec![],
                from_store: false,
                expired_in_pass: false,
            };
            {
                let state = &mut *state;
                let pass = &mut pass;
                let post = &mut post;
                ctx.rows().invoke(
                    ctx.cache_id,
                    self.key(),
                    self.key().partition(),
                    &mut |row| self.atomic_pass(ctx, req, state, row.is_some(), pass, post),
                )?;
            }

            let result = pass
                .result
                .expect("atomic pass must produce a result on success");

            // Notifications, ordered with the WAL because the entry lock is
            // still held.
            for event in pass.events.drain(..) {
                if matches!(
                    event.kind,
                    EventKind::Put | EventKind::Removed | EventKind::Expired
                ) {
                    listeners.notify_updated(&event);
                }
                if ctx.config.record_events {
                    ctx.events().emit(event);
                }
            }

            if result.outcome.updated() {
                post.dr = Some((
                    result.new_value.clone(),
                    req.new_version,
                    ctx.versions.topology(),
                ));
                match &result.new_value {
                    Some(value) => {
                        post.after_put = Some((value.clone(), result.update_counter));
                        post.platform_update = Some((value.clone(), req.new_version));
                    }
                    None => {
                        post.after_remove = Some(result.old_value.clone());
                        post.platform_remove = Some(req.new_version);
                    }
                }
            }
            result
        };
        post.run(ctx, self.key())?;
        Ok(result)
    }

    /// One pass under the row latch; see the module docs for the step
    /// order. Returns the row operation; everything else is reported
    /// through `pass` and `post`.
    #[allow(clippy::too_many_arguments)]
    fn atomic_pass(
        &self,
        ctx: &CacheContext,
        req: &AtomicRequest,
        state: &mut EntryState,
        row_exists: bool,
        pass: &mut Pass,
        post: &mut PostOps,
    ) -> Result<RowOp, CacheError> {
        let now = ctx.now_millis();

        // 1. Expiry check on the old row: an expired value is treated as
        //    missing for the rest of the pass.
        let mut old_value = state.value.clone();
        if old_value.is_some() && state.is_expired(now) {
            pass.expired_in_pass = true;
            pass.events.push(CacheEvent {
                kind: EventKind::Expired,
                cache_id: ctx.cache_id,
                key: self.key().clone(),
                old_value: old_value.take(),
                new_value: None,
                version: state.version,
                node_id: ctx.node_id,
            });
        }

        // 2. Read-through on a cold entry. The loader call happens inside
        //    the critical section; loaders must not re-enter the store.
        if old_value.is_none() && !pass.expired_in_pass && req.read_through {
            if let Some(store) = ctx.store() {
                old_value = store.load(self.key())?;
                pass.from_store = old_value.is_some();
            }
        }

        // 3. Transform: run the processor, capture failures, downgrade the
        //    op by its modified flag.
        let mut new_value: Option<CacheValue>;
        let mut invoke_result = None;
        let mut transformed = false;
        match &req.op {
            AtomicOp::Update(value) => new_value = Some(value.clone()),
            AtomicOp::Delete => new_value = None,
            AtomicOp::Transform(processor) => {
                if let Some(value) = &old_value {
                    ctx.types.ensure_registered(value)?;
                }
                let mut view = InvokeEntry {
                    key: self.key(),
                    value: old_value.clone(),
                    modified: false,
                };
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| processor.process(&mut view)));
                match outcome {
                    Err(_) => {
                        invoke_result = Some(Err("entry processor panicked".to_string()));
                        let mut result = AtomicResult::rejected(
                            UpdateOutcome::InvokeNoOp,
                            old_value.clone(),
                        );
                        result.invoke_result = invoke_result;
                        return self.finish_rejected(ctx, state, result, pass, post, row_exists);
                    }
                    Ok(Err(e)) => {
                        invoke_result = Some(Err(e));
                        let mut result = AtomicResult::rejected(
                            UpdateOutcome::InvokeNoOp,
                            old_value.clone(),
                        );
                        result.invoke_result = invoke_result;
                        return self.finish_rejected(ctx, state, result, pass, post, row_exists);
                    }
                    Ok(Ok(ret)) => {
                        if !view.modified {
                            let mut result = AtomicResult::rejected(
                                UpdateOutcome::InvokeNoOp,
                                old_value.clone(),
                            );
                            result.invoke_result = Some(Ok(ret));
                            return self.finish_rejected(
                                ctx, state, result, pass, post, row_exists,
                            );
                        }
                        invoke_result = Some(Ok(ret));
                        transformed = true;
                        new_value = view.value;
                    }
                }
            }
        }

        let mut explicit_ttl = req.explicit_ttl;
        let mut explicit_expire = req.explicit_expire_time;
        let mut conflict_ctx = None;
        let mut resolver_ran = false;

        // 4. Conflict resolution, when the update carries a DR stamp.
        if let (Some(resolver), Some(conflict_version)) =
            (ctx.conflict_resolver(), req.conflict_version)
        {
            resolver_ran = true;
            let cctx = ConflictContext {
                old: ConflictEntryView {
                    value: old_value.clone(),
                    version: state.full_version(),
                    ttl: state.ttl(),
                    expire_time: state.expire_time(),
                },
                new: ConflictEntryView {
                    value: new_value.clone(),
                    version: FullVersion::with_conflict(req.new_version, conflict_version),
                    ttl: explicit_ttl.unwrap_or(0),
                    expire_time: explicit_expire.unwrap_or(0),
                },
                version_check: req.version_check,
            };
            match resolver.resolve(&cctx) {
                ConflictResolution::UseOld => {
                    // The losing side may still be written through when
                    // both updates originate in the same DC on the primary.
                    if req.write_through
                        && req.primary
                        && cctx.old.data_center_id() == cctx.new.data_center_id()
                    {
                        if let Some(old) = &old_value {
                            post.store_write = Some((old.clone(), state.version));
                        }
                    }
                    let mut result = AtomicResult::rejected(
                        UpdateOutcome::ConflictUseOld,
                        old_value.clone(),
                    );
                    result.conflict_ctx = Some(cctx);
                    return self.finish_rejected(ctx, state, result, pass, post, row_exists);
                }
                ConflictResolution::UseNew => {
                    conflict_ctx = Some(cctx);
                }
                ConflictResolution::Merge {
                    value,
                    ttl,
                    expire_time,
                } => {
                    new_value = Some(value);
                    if ttl.is_some() {
                        explicit_ttl = ttl;
                    }
                    if expire_time.is_some() {
                        explicit_expire = expire_time;
                    }
                    conflict_ctx = Some(cctx);
                }
            }
        }

        // 5. Version check (only when no resolver ran).
        if !resolver_ran && req.version_check {
            let cmp = atomic_cmp(&req.new_version, &state.version);
            if cmp != Ordering::Greater {
                // Idempotent replay: on an exact tie the external store
                // still receives the write, once.
                if cmp == Ordering::Equal && req.write_through && req.primary {
                    if let Some(value) = &new_value {
                        post.store_write = Some((value.clone(), state.version));
                    }
                }
                let result = AtomicResult::rejected(
                    UpdateOutcome::VersionCheckFailed,
                    old_value.clone(),
                );
                return self.finish_rejected(ctx, state, result, pass, post, row_exists);
            }
        }

        // 6. Filters, evaluated atomically against the current value.
        if !req.filters.iter().all(|f| f.matches(old_value.as_ref())) {
            if req.access_ttl_on_filter_fail && old_value.is_some() {
                if let Some(policy) = ctx.expiry_policy() {
                    if let Some(resolved) = expiry::resolve_for_access(
                        policy.as_ref(),
                        state.ttl(),
                        state.expire_time(),
                        now,
                    ) {
                        state
                            .extras
                            .set_expiration(resolved.ttl, resolved.expire_time);
                        let result = AtomicResult::rejected(
                            UpdateOutcome::FilterFailed,
                            old_value.clone(),
                        );
                        pass.result = Some(result);
                        return Ok(RowOp::InPlace(RowData {
                            value: old_value.unwrap(),
                            version: state.version,
                            expire_time: resolved.expire_time,
                        }));
                    }
                }
            }
            let result =
                AtomicResult::rejected(UpdateOutcome::FilterFailed, old_value.clone());
            return self.finish_rejected(ctx, state, result, pass, post, row_exists);
        }

        // 7. Interceptor.
        if req.intercept {
            if let Some(interceptor) = ctx.interceptor() {
                match &new_value {
                    Some(candidate) => {
                        match interceptor.before_put(old_value.as_ref(), candidate) {
                            None => {
                                let result = AtomicResult::rejected(
                                    UpdateOutcome::InterceptorCancel,
                                    old_value.clone(),
                                );
                                return self.finish_rejected(
                                    ctx, state, result, pass, post, row_exists,
                                );
                            }
                            Some(substituted) => new_value = Some(substituted),
                        }
                    }
                    None => {
                        let decision = interceptor.before_remove(old_value.as_ref());
                        if decision.cancel {
                            let mut result = AtomicResult::rejected(
                                UpdateOutcome::InterceptorCancel,
                                old_value.clone(),
                            );
                            if decision.override_value.is_some() {
                                result.old_value = decision.override_value;
                            }
                            return self.finish_rejected(
                                ctx, state, result, pass, post, row_exists,
                            );
                        }
                    }
                }
            }
        }

        // 8. TTL/expire computation; an already-past expire time turns the
        //    update into a delete.
        let mut resolved = expiry::TtlResolution::ETERNAL;
        if new_value.is_some() {
            resolved = expiry::resolve_for_write(
                explicit_ttl,
                explicit_expire,
                ctx.expiry_policy().map(|p| p.as_ref()),
                old_value.is_some(),
                state.ttl(),
                state.expire_time(),
                now,
            );
            if resolved.expire_time != 0 && resolved.expire_time <= now {
                // Re-enter the delete branch, interceptor included.
                new_value = None;
                if req.intercept {
                    if let Some(interceptor) = ctx.interceptor() {
                        let decision = interceptor.before_remove(old_value.as_ref());
                        if decision.cancel {
                            let result = AtomicResult::rejected(
                                UpdateOutcome::InterceptorCancel,
                                old_value.clone(),
                            );
                            return self.finish_rejected(
                                ctx, state, result, pass, post, row_exists,
                            );
                        }
                    }
                }
            }
        }

        // Removing a value that is not there.
        if new_value.is_none() && old_value.is_none() {
            let mut result =
                AtomicResult::rejected(UpdateOutcome::RemoveNoVal, None);
            result.invoke_result = invoke_result;
            result.transformed = transformed;
            return self.finish_rejected(ctx, state, result, pass, post, row_exists);
        }

        // 9. Write-through, synchronous and inside the section so that the
        //    store and the cache agree by the time notifications fire.
        if req.write_through && req.primary {
            if let Some(store) = ctx.store() {
                match &new_value {
                    Some(value) => store.write(self.key(), value, &req.new_version)?,
                    None => store.delete(self.key())?,
                }
            }
        }

        let update_counter = ctx.next_update_counter(self.key().partition());

        // 10. WAL.
        let wal_op = match (&new_value, row_exists && !pass.expired_in_pass) {
            (None, _) => WalOp::Delete,
            (Some(_), false) => WalOp::Create,
            (Some(_), true) => WalOp::Update,
        };
        if let Some(wal) = ctx.wal() {
            let mut flags = 0u8;
            if req.primary {
                flags |= record_flags::PRIMARY;
            }
            if req.preload {
                flags |= record_flags::PRELOAD;
            }
            if pass.from_store {
                flags |= record_flags::FROM_STORE;
            }
            wal.append(&DataRecord {
                cache_id: ctx.cache_id,
                key: self.key().byte_view(),
                value: new_value.as_ref().map(|v| v.byte_view()),
                op: wal_op,
                near_xid: None,
                write_version: req.new_version,
                expire_time: resolved.expire_time as i64,
                partition: self.key().partition(),
                update_counter,
                flags,
            })?;
        }

        // 11 + 12. Row op and in-memory state.
        let mut enqueue_version = None;
        let row_op = match &new_value {
            Some(value) => {
                state.value = Some(value.clone());
                state.version = req.new_version;
                state.conflict_version = req.conflict_version;
                state
                    .extras
                    .set_expiration(resolved.ttl, resolved.expire_time);
                state.clear_flag(FLAG_DELETED);
                state.clear_flag(FLAG_EVICT_DISABLED);
                RowOp::Put(RowData {
                    value: value.clone(),
                    version: req.new_version,
                    expire_time: resolved.expire_time,
                })
            }
            None => {
                state.value = None;
                state.version = req.new_version;
                state.conflict_version = req.conflict_version;
                state.extras.set_expiration(0, 0);
                if ctx.config.deferred_delete {
                    state.set_flag(FLAG_DELETED);
                    post.deferred_delete = Some(req.new_version);
                    enqueue_version = Some(req.new_version);
                } else {
                    Self::mark_obsolete_locked(state, &req.new_version, None);
                }
                if row_exists {
                    RowOp::Remove
                } else {
                    RowOp::Noop
                }
            }
        };

        pass.events.push(CacheEvent {
            kind: if new_value.is_some() {
                EventKind::Put
            } else {
                EventKind::Removed
            },
            cache_id: ctx.cache_id,
            key: self.key().clone(),
            old_value: old_value.clone(),
            new_value: new_value.clone(),
            version: req.new_version,
            node_id: ctx.node_id,
        });

        pass.result = Some(AtomicResult {
            outcome: UpdateOutcome::Success,
            old_value,
            new_value,
            invoke_result,
            new_ttl: resolved.ttl,
            new_expire_time: resolved.expire_time,
            enqueue_version,
            conflict_ctx,
            update_counter,
            transformed,
        });
        Ok(row_op)
    }

    /// Shared tail for every rejection outcome. An expiry noticed in step 1
    /// still tombstones the entry and removes the row, even though the
    /// update itself did not go through.
    fn finish_rejected(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
        result: AtomicResult,
        pass: &mut Pass,
        post: &mut PostOps,
        row_exists: bool,
    ) -> Result<RowOp, CacheError> {
        let mut row_op = RowOp::Noop;
        if pass.expired_in_pass {
            let new_version = ctx.next_version();
            if let Some(wal) = ctx.wal() {
                wal.append(&DataRecord {
                    cache_id: ctx.cache_id,
                    key: self.key().byte_view(),
                    value: None,
                    op: WalOp::Delete,
                    near_xid: None,
                    write_version: new_version,
                    expire_time: 0,
                    partition: self.key().partition(),
                    update_counter: ctx.next_update_counter(self.key().partition()),
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
            if row_exists {
                row_op = RowOp::Remove;
            }
        }
        pass.result = Some(result);
        Ok(row_op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::ManualClock;
    use crate::entry::TierState;
    use crate::storage::wal::MemWal;
    use ember_core::CacheKey;
    use std::sync::Arc;

    fn ctx() -> (CacheContext, Arc<MemWal>) {
        let wal = Arc::new(MemWal::new());
        let ctx = CacheContext::new(1, "atomic-test", CacheConfig::default())
            .with_time_source(Arc::new(ManualClock::at(1_000)))
            .with_wal(wal.clone());
        (ctx, wal)
    }

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(CacheKey::from_str(key, 0), TierState::Plain)
    }

    struct SetTo(&'static str);

    impl EntryProcessor for SetTo {
        fn process(&self, entry: &mut InvokeEntry<'_>) -> Result<Option<CacheValue>, String> {
            let prior = entry.value().cloned();
            entry.set_value(CacheValue::string(self.0));
            Ok(prior)
        }
    }

    struct ReadOnly;

    impl EntryProcessor for ReadOnly {
        fn process(&self, entry: &mut InvokeEntry<'_>) -> Result<Option<CacheValue>, String> {
            Ok(entry.value().cloned())
        }
    }

    struct Exploding;

    impl EntryProcessor for Exploding {
        fn process(&self, _entry: &mut InvokeEntry<'_>) -> Result<Option<CacheValue>, String> {
            panic!("processor bug");
        }
    }

    #[test]
    fn test_update_success_writes_row_and_wal() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        let v1 = ctx.next_version();
        let r = e
            .atomic_update(&ctx, &AtomicRequest::update(CacheValue::string("a"), v1))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::Success);
        assert_eq!(r.new_value, Some(CacheValue::string("a")));
        assert_eq!(r.old_value, None);
        assert_eq!(r.update_counter, 1);

        let row = ctx.rows().read(1, e.key()).unwrap().unwrap();
        assert_eq!(row.value, CacheValue::string("a"));
        assert_eq!(row.version, v1);

        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, WalOp::Create);
        assert_eq!(records[0].write_version, v1);
    }

    #[test]
    fn test_transform_on_missing_creates() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        let v1 = ctx.next_version();
        let r = e
            .atomic_update(&ctx, &AtomicRequest::transform(Arc::new(SetTo("a")), v1))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::Success);
        assert!(r.transformed);
        assert_eq!(r.new_value, Some(CacheValue::string("a")));
        assert_eq!(r.invoke_result, Some(Ok(None)));
        assert_eq!(e.version(), v1);
        assert!(ctx.rows().read(1, e.key()).unwrap().is_some());
        assert_eq!(wal.replay().unwrap()[0].op, WalOp::Create);
    }

    #[test]
    fn test_transform_without_modification_is_noop() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        e.atomic_update(
            &ctx,
            &AtomicRequest::update(CacheValue::string("a"), ctx.next_version()),
        )
        .unwrap();
        let before = e.version();

        let r = e
            .atomic_update(
                &ctx,
                &AtomicRequest::transform(Arc::new(ReadOnly), ctx.next_version()),
            )
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::InvokeNoOp);
        assert_eq!(r.invoke_result, Some(Ok(Some(CacheValue::string("a")))));
        assert_eq!(e.version(), before);
        assert_eq!(wal.replay().unwrap().len(), 1);
    }

    #[test]
    fn test_processor_panic_is_captured() {
        let (ctx, _) = ctx();
        let e = entry("k");
        let r = e
            .atomic_update(
                &ctx,
                &AtomicRequest::transform(Arc::new(Exploding), ctx.next_version()),
            )
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::InvokeNoOp);
        assert!(matches!(r.invoke_result, Some(Err(_))));
        assert!(!e.has_value());
    }

    #[test]
    fn test_version_check_rejects_stale() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        let v1 = ctx.next_version();
        let v2 = ctx.next_version();
        // Install at the newer version first.
        e.atomic_update(&ctx, &AtomicRequest::update(CacheValue::string("X"), v2))
            .unwrap();

        let mut req = AtomicRequest::update(CacheValue::string("Y"), v1);
        req.version_check = true;
        let r = e.atomic_update(&ctx, &req).unwrap();
        assert_eq!(r.outcome, UpdateOutcome::VersionCheckFailed);

        // Nothing moved.
        assert_eq!(e.version(), v2);
        assert_eq!(
            ctx.rows().read(1, e.key()).unwrap().unwrap().value,
            CacheValue::string("X")
        );
        assert_eq!(wal.replay().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_on_missing_reports_no_val() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        let r = e
            .atomic_update(&ctx, &AtomicRequest::delete(ctx.next_version()))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::RemoveNoVal);
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn test_delete_marks_obsolete_without_deferred_mode() {
        let (ctx, wal) = ctx();
        let e = entry("k");
        e.atomic_update(
            &ctx,
            &AtomicRequest::update(CacheValue::string("a"), ctx.next_version()),
        )
        .unwrap();

        let v2 = ctx.next_version();
        let r = e.atomic_update(&ctx, &AtomicRequest::delete(v2)).unwrap();
        assert_eq!(r.outcome, UpdateOutcome::Success);
        assert_eq!(r.old_value, Some(CacheValue::string("a")));
        assert!(e.is_obsolete());
        assert!(ctx.rows().read(1, e.key()).unwrap().is_none());
        assert_eq!(wal.replay().unwrap().last().unwrap().op, WalOp::Delete);
    }

    #[test]
    fn test_monotone_versions_under_updates() {
        let (ctx, _) = ctx();
        let e = entry("k");
        let mut prev = e.version();
        for i in 0..10 {
            let v = ctx.next_version();
            let r = e
                .atomic_update(
                    &ctx,
                    &AtomicRequest::update(CacheValue::i64(i), v),
                )
                .unwrap();
            assert_eq!(r.outcome, UpdateOutcome::Success);
            assert_eq!(atomic_cmp(&e.version(), &prev), Ordering::Greater);
            prev = e.version();
        }
    }
}
