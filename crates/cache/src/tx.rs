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

//! Transactional set/remove. An external transaction manager drives these;
//! the entry only verifies lock ownership against its MVCC list, applies
//! the write, and reports. In contrast to the atomic closure, write-through
//! runs outside the entry lock (the TM's commit protocol owns ordering),
//! and remote transactions do not append WAL per entry (they are batched
//! at commit time).

use crate::context::CacheContext;
use crate::entry::{
    CacheEntry, EntryState, FLAG_DELETED, FLAG_EVICT_DISABLED, PostOps, TierState, UpdateOutcome,
    UpdateResult,
};
use crate::expiry;
use crate::storage::wal::{DataRecord, WalOp, record_flags};
use crate::storage::{RowData, RowOp};
use ember_core::{
    CacheError, CacheEvent, CacheValue, EntryVersion, EventKind, OperationType, atomic_cmp,
};
use smallvec::SmallVec;
use std::cmp::Ordering;
use uuid::Uuid;

/// Identity of the transaction applying an update. `xid` doubles as the
/// MVCC candidate version and the WAL `near_xid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub xid: EntryVersion,
    pub node_id: Uuid,
    pub thread_id: u64,
    /// One-phase-commit primary applying on behalf of its coordinator; may
    /// mutate without holding the owner slot.
    pub one_phase_commit: bool,
    pub remote: bool,
    /// Topology the transaction was mapped on; 0 means unconstrained.
    pub topology_version: u32,
}

impl TxContext {
    pub fn local(xid: EntryVersion, node_id: Uuid, thread_id: u64) -> Self {
        Self {
            xid,
            node_id,
            thread_id,
            one_phase_commit: false,
            remote: false,
            topology_version: 0,
        }
    }

    pub fn one_phase(xid: EntryVersion, node_id: Uuid, thread_id: u64) -> Self {
        Self {
            one_phase_commit: true,
            ..Self::local(xid, node_id, thread_id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxSetRequest {
    pub value: CacheValue,
    pub ttl: Option<u64>,
    pub expire_time: Option<u64>,
    /// Write version assigned by the transaction manager.
    pub version: EntryVersion,
    pub conflict_version: Option<EntryVersion>,
    /// For near entries: the DHT version this write mirrors.
    pub dht_version: Option<EntryVersion>,
    pub intercept: bool,
    pub write_through: bool,
    pub primary: bool,
}

impl TxSetRequest {
    pub fn new(value: CacheValue, version: EntryVersion) -> Self {
        Self {
            value,
            ttl: None,
            expire_time: None,
            version,
            conflict_version: None,
            dht_version: None,
            intercept: true,
            write_through: false,
            primary: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxRemoveRequest {
    pub version: EntryVersion,
    pub intercept: bool,
    pub write_through: bool,
    pub primary: bool,
}

impl TxRemoveRequest {
    pub fn new(version: EntryVersion) -> Self {
        Self {
            version,
            intercept: true,
            write_through: false,
            primary: true,
        }
    }
}

fn check_tx_owner(state: &EntryState, tx: &TxContext) -> Result<(), CacheError> {
    if tx.one_phase_commit {
        return Ok(());
    }
    if state.extras.mvcc().is_some_and(|m| m.is_owned_by(&tx.xid)) {
        return Ok(());
    }
    Err(CacheError::NotOwner)
}

impl CacheEntry {
    pub fn tx_set(
        &self,
        ctx: &CacheContext,
        tx: &TxContext,
        req: &TxSetRequest,
    ) -> Result<UpdateResult, CacheError> {
        let _timer = ctx.stats.time(OperationType::CachePut);
        let mut post = PostOps::default();
        let result = {
            let listeners = ctx.listeners.read();
            let mut state = self.lock_state();
            if state.is_obsolete() {
                return Err(CacheError::EntryRemoved);
            }
            check_tx_owner(&state, tx)?;
            self.ensure_unswapped(ctx, &mut state)?;
            let old_value = state.value.clone();

            // Near entries mirror a DHT primary; a write carrying a stale
            // DHT version is dropped. A stale mapping topology likewise.
            let cur_version = state.version;
            if let TierState::Near { dht_version } = &mut state.tier {
                if tx.topology_version != 0 && tx.topology_version < ctx.versions.topology() {
                    return Ok(UpdateResult {
                        outcome: UpdateOutcome::VersionCheckFailed,
                        old_value,
                        new_value: None,
                        version: cur_version,
                        update_counter: 0,
                    });
                }
                if let Some(incoming) = req.dht_version {
                    if let Some(recorded) = dht_version {
                        if atomic_cmp(&incoming, recorded) == Ordering::Less {
                            return Ok(UpdateResult {
                                outcome: UpdateOutcome::VersionCheckFailed,
                                old_value,
                                new_value: None,
                                version: cur_version,
                                update_counter: 0,
                            });
                        }
                    }
                    *dht_version = Some(incoming);
                }
            }

            let mut value = req.value.clone();
            if req.intercept {
                if let Some(interceptor) = ctx.interceptor() {
                    match interceptor.before_put(old_value.as_ref(), &value) {
                        None => {
                            return Ok(UpdateResult {
                                outcome: UpdateOutcome::InterceptorCancel,
                                old_value,
                                new_value: None,
                                version: state.version,
                                update_counter: 0,
                            });
                        }
                        Some(substituted) => value = substituted,
                    }
                }
            }

            let resolved = expiry::resolve_for_write(
                req.ttl,
                req.expire_time,
                ctx.expiry_policy().map(|p| p.as_ref()),
                old_value.is_some(),
                state.ttl(),
                state.expire_time(),
                ctx.now_millis(),
            );

            let data = RowData {
                value: value.clone(),
                version: req.version,
                expire_time: resolved.expire_time,
            };
            ctx.rows()
                .invoke(ctx.cache_id, self.key(), self.key().partition(), &mut |_| {
                    Ok(RowOp::Put(data.clone()))
                })?;

            state.clear_flag(FLAG_DELETED);

            let update_counter = ctx.next_update_counter(self.key().partition());
            // Remote tx updates are WAL-batched at commit by the TM.
            if !tx.remote {
                if let Some(wal) = ctx.wal() {
                    let mut flags = 0u8;
                    if req.primary {
                        flags |= record_flags::PRIMARY;
                    }
                    wal.append(&DataRecord {
                        cache_id: ctx.cache_id,
                        key: self.key().byte_view(),
                        value: Some(value.byte_view()),
                        op: if old_value.is_some() {
                            WalOp::Update
                        } else {
                            WalOp::Create
                        },
                        near_xid: Some(tx.xid),
                        write_version: req.version,
                        expire_time: resolved.expire_time as i64,
                        partition: self.key().partition(),
                        update_counter,
                        flags,
                    })?;
                }
            }

            state.value = Some(value.clone());
            state.version = req.version;
            state.conflict_version = req.conflict_version;
            state
                .extras
                .set_expiration(resolved.ttl, resolved.expire_time);
            state.clear_flag(FLAG_EVICT_DISABLED);

            let topology = if tx.topology_version != 0 {
                tx.topology_version
            } else {
                ctx.versions.topology()
            };
            post.dr = Some((Some(value.clone()), req.version, topology));
            post.after_put = Some((value.clone(), update_counter));
            post.platform_update = Some((value.clone(), req.version));
            if req.write_through && req.primary {
                post.store_write = Some((value.clone(), req.version));
            }

            let event = CacheEvent {
                kind: EventKind::Put,
                cache_id: ctx.cache_id,
                key: self.key().clone(),
                old_value: old_value.clone(),
                new_value: Some(value.clone()),
                version: req.version,
                node_id: tx.node_id,
            };
            listeners.notify_updated(&event);
            if ctx.config.record_events {
                ctx.events().emit(event);
            }

            UpdateResult {
                outcome: UpdateOutcome::Success,
                old_value,
                new_value: Some(value),
                version: req.version,
                update_counter,
            }
        };
        post.run(ctx, self.key())?;
        Ok(result)
    }

    pub fn tx_remove(
        &self,
        ctx: &CacheContext,
        tx: &TxContext,
        req: &TxRemoveRequest,
    ) -> Result<UpdateResult, CacheError> {
        let _timer = ctx.stats.time(OperationType::CacheRemove);
        let mut post = PostOps::default();
        let result = {
            let listeners = ctx.listeners.read();
            let mut state = self.lock_state();
            if state.is_obsolete() {
                return Err(CacheError::EntryRemoved);
            }
            check_tx_owner(&state, tx)?;
            self.ensure_unswapped(ctx, &mut state)?;
            let mut old_value = state.value.clone();

            if req.intercept {
                if let Some(interceptor) = ctx.interceptor() {
                    let decision = interceptor.before_remove(old_value.as_ref());
                    if decision.cancel {
                        return Ok(UpdateResult {
                            outcome: UpdateOutcome::InterceptorCancel,
                            old_value: decision.override_value.or(old_value),
                            new_value: None,
                            version: state.version,
                            update_counter: 0,
                        });
                    }
                    if decision.override_value.is_some() {
                        old_value = decision.override_value;
                    }
                }
            }

            if old_value.is_none() {
                return Ok(UpdateResult {
                    outcome: UpdateOutcome::RemoveNoVal,
                    old_value: None,
                    new_value: None,
                    version: state.version,
                    update_counter: 0,
                });
            }

            ctx.rows()
                .invoke(ctx.cache_id, self.key(), self.key().partition(), &mut |row| {
                    Ok(if row.is_some() {
                        RowOp::Remove
                    } else {
                        RowOp::Noop
                    })
                })?;

            let update_counter = ctx.next_update_counter(self.key().partition());
            if !tx.remote {
                if let Some(wal) = ctx.wal() {
                    let mut flags = 0u8;
                    if req.primary {
                        flags |= record_flags::PRIMARY;
                    }
                    wal.append(&DataRecord {
                        cache_id: ctx.cache_id,
                        key: self.key().byte_view(),
                        value: None,
                        op: WalOp::Delete,
                        near_xid: Some(tx.xid),
                        write_version: req.version,
                        expire_time: 0,
                        partition: self.key().partition(),
                        update_counter,
                        flags,
                    })?;
                }
            }

            state.value = None;
            state.version = req.version;
            state.conflict_version = None;
            state.extras.set_expiration(0, 0);

            if ctx.config.deferred_delete {
                state.set_flag(FLAG_DELETED);
                post.deferred_delete = Some(req.version);
            } else {
                // Immediate obsolete; tolerated to fail while other owners
                // wait, in which case the entry lives on valueless.
                Self::mark_obsolete_locked(&mut state, &req.version, Some(&tx.xid));
            }

            // Drop near readers whose node has no transactions left on the
            // entry besides the committing one.
            if ctx.config.track_readers {
                let mvcc = state.extras.mvcc().cloned();
                if let TierState::Dht { readers } = &mut state.tier {
                    readers.retain(|reader| {
                        mvcc.as_ref().is_some_and(|m| {
                            m.versions_for_node(reader)
                                .iter()
                                .any(|v| *v != tx.xid)
                        })
                    });
                }
            }

            post.after_remove = Some(old_value.clone());
            post.platform_remove = Some(req.version);
            if req.write_through && req.primary {
                post.store_delete = true;
            }
            let topology = if tx.topology_version != 0 {
                tx.topology_version
            } else {
                ctx.versions.topology()
            };
            post.dr = Some((None, req.version, topology));

            let event = CacheEvent {
                kind: EventKind::Removed,
                cache_id: ctx.cache_id,
                key: self.key().clone(),
                old_value: old_value.clone(),
                new_value: None,
                version: req.version,
                node_id: tx.node_id,
            };
            listeners.notify_updated(&event);
            if ctx.config.record_events {
                ctx.events().emit(event);
            }

            UpdateResult {
                outcome: UpdateOutcome::Success,
                old_value,
                new_value: None,
                version: req.version,
                update_counter,
            }
        };
        post.run(ctx, self.key())?;
        Ok(result)
    }

    /// Record a near reader on a DHT entry.
    pub fn add_reader(&self, ctx: &CacheContext, node_id: Uuid) -> Result<(), CacheError> {
        let _listeners = ctx.listeners.read();
        let mut state = self.lock_state();
        if state.is_obsolete() {
            return Err(CacheError::EntryRemoved);
        }
        if let TierState::Dht { readers } = &mut state.tier {
            if !readers.contains(&node_id) {
                readers.push(node_id);
            }
        }
        Ok(())
    }

    pub fn readers(&self) -> SmallVec<[Uuid; 2]> {
        match &self.lock_state().tier {
            TierState::Dht { readers } => readers.clone(),
            _ => SmallVec::new(),
        }
    }

    /// Finalize a queued deferred delete. Refuses when the entry has been
    /// resurrected or rewritten since it was tombstoned.
    pub(crate) fn finalize_deferred(&self, ctx: &CacheContext, version: &EntryVersion) -> bool {
        let _listeners = ctx.listeners.read();
        let mut state = self.lock_state();
        if state.is_obsolete() {
            return true;
        }
        if !state.has_flag(FLAG_DELETED) || state.version != *version {
            return false;
        }
        matches!(
            Self::mark_obsolete_locked(&mut state, version, None),
            crate::entry::ObsoleteMark::Marked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::ManualClock;
    use ember_core::CacheKey;
    use std::sync::Arc;

    fn ctx_with(config: CacheConfig) -> CacheContext {
        CacheContext::new(1, "tx-test", config)
            .with_time_source(Arc::new(ManualClock::at(1_000)))
    }

    fn locked_entry(ctx: &CacheContext, key: &str) -> (CacheEntry, TxContext) {
        let entry = CacheEntry::new(CacheKey::from_str(key, 0), TierState::Plain);
        let tx = TxContext::local(ctx.next_version(), ctx.node_id, 7);
        entry.lock_local(ctx, tx.xid, tx.thread_id, false).unwrap();
        (entry, tx)
    }

    #[test]
    fn test_set_requires_ownership() {
        let ctx = ctx_with(CacheConfig::default());
        let entry = CacheEntry::new(CacheKey::from_str("k", 0), TierState::Plain);
        let tx = TxContext::local(ctx.next_version(), ctx.node_id, 7);
        let req = TxSetRequest::new(CacheValue::string("v"), ctx.next_version());
        assert_eq!(entry.tx_set(&ctx, &tx, &req), Err(CacheError::NotOwner));

        // One-phase-commit primaries are exempt.
        let opc = TxContext::one_phase(tx.xid, ctx.node_id, 7);
        assert!(entry.tx_set(&ctx, &opc, &req).is_ok());
    }

    #[test]
    fn test_set_then_remove_round_trip() {
        let ctx = ctx_with(CacheConfig::default());
        let (entry, tx) = locked_entry(&ctx, "k");

        let v1 = ctx.next_version();
        let r = entry
            .tx_set(&ctx, &tx, &TxSetRequest::new(CacheValue::string("v"), v1))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::Success);
        assert_eq!(r.new_value, Some(CacheValue::string("v")));
        assert_eq!(entry.version(), v1);

        let row = ctx.rows().read(1, entry.key()).unwrap().unwrap();
        assert_eq!(row.value, CacheValue::string("v"));

        let v2 = ctx.next_version();
        let r = entry
            .tx_remove(&ctx, &tx, &TxRemoveRequest::new(v2))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::Success);
        assert_eq!(r.old_value, Some(CacheValue::string("v")));
        assert!(ctx.rows().read(1, entry.key()).unwrap().is_none());
        // Non-deferred mode: the tx's own lock does not block obsoletion.
        assert!(entry.is_obsolete());
    }

    #[test]
    fn test_remove_missing_reports_no_val() {
        let ctx = ctx_with(CacheConfig::default());
        let (entry, tx) = locked_entry(&ctx, "k");
        let r = entry
            .tx_remove(&ctx, &tx, &TxRemoveRequest::new(ctx.next_version()))
            .unwrap();
        assert_eq!(r.outcome, UpdateOutcome::RemoveNoVal);
    }

    #[test]
    fn test_deferred_remove_keeps_entry_deleted() {
        let ctx = ctx_with(CacheConfig {
            deferred_delete: true,
            ..Default::default()
        });
        let (entry, tx) = locked_entry(&ctx, "k");
        entry
            .tx_set(
                &ctx,
                &tx,
                &TxSetRequest::new(CacheValue::string("v"), ctx.next_version()),
            )
            .unwrap();

        let v2 = ctx.next_version();
        entry
            .tx_remove(&ctx, &tx, &TxRemoveRequest::new(v2))
            .unwrap();
        assert!(entry.is_deleted());
        assert!(!entry.is_obsolete());
        assert!(!entry.has_value());

        // The tombstone was queued with the removal version.
        let queued = ctx.deferred_receiver().try_recv().unwrap();
        assert_eq!(queued.version, v2);
        assert_eq!(&queued.key, entry.key());
    }

    #[test]
    fn test_wal_carries_near_xid_and_remote_skips_wal() {
        let wal = Arc::new(crate::storage::wal::MemWal::new());
        let ctx = ctx_with(CacheConfig::default()).with_wal(wal.clone());
        let (entry, tx) = locked_entry(&ctx, "k");

        entry
            .tx_set(
                &ctx,
                &tx,
                &TxSetRequest::new(CacheValue::string("v"), ctx.next_version()),
            )
            .unwrap();
        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].near_xid, Some(tx.xid));

        // A remote transaction's update is not logged here.
        let remote = TxContext {
            remote: true,
            one_phase_commit: true,
            ..tx.clone()
        };
        entry
            .tx_set(
                &ctx,
                &remote,
                &TxSetRequest::new(CacheValue::string("w"), ctx.next_version()),
            )
            .unwrap();
        assert_eq!(wal.replay().unwrap().len(), 1);
    }

    #[test]
    fn test_near_stale_dht_version_rejected() {
        let ctx = ctx_with(CacheConfig {
            near: true,
            ..Default::default()
        });
        let entry = CacheEntry::new(
            CacheKey::from_str("k", 0),
            TierState::Near { dht_version: None },
        );
        let tx = TxContext::one_phase(ctx.next_version(), ctx.node_id, 7);

        let dht_new = ctx.next_version();
        let mut req = TxSetRequest::new(CacheValue::string("v1"), ctx.next_version());
        req.dht_version = Some(dht_new);
        assert_eq!(
            entry.tx_set(&ctx, &tx, &req).unwrap().outcome,
            UpdateOutcome::Success
        );

        // An older DHT version must not clobber the newer state.
        let mut stale = TxSetRequest::new(CacheValue::string("v0"), ctx.next_version());
        stale.dht_version = Some(tx.xid);
        let r = entry.tx_set(&ctx, &tx, &stale).unwrap();
        assert_eq!(r.outcome, UpdateOutcome::VersionCheckFailed);
        assert_eq!(
            entry.peek(&ctx).unwrap().unwrap().0,
            CacheValue::string("v1")
        );
    }

    #[test]
    fn test_reader_dropped_when_node_has_no_other_tx() {
        let ctx = ctx_with(CacheConfig {
            dht: true,
            track_readers: true,
            ..Default::default()
        });
        let entry = CacheEntry::new(
            CacheKey::from_str("k", 0),
            TierState::Dht {
                readers: SmallVec::new(),
            },
        );
        let near_node = Uuid::new_v4();
        let tx = TxContext::local(ctx.next_version(), near_node, 7);
        entry
            .lock_remote(&ctx, tx.xid, near_node, 7, None)
            .unwrap();
        entry.add_reader(&ctx, near_node).unwrap();
        entry
            .tx_set(
                &ctx,
                &tx,
                &TxSetRequest::new(CacheValue::string("v"), ctx.next_version()),
            )
            .unwrap();
        assert_eq!(entry.readers().len(), 1);

        entry
            .tx_remove(&ctx, &tx, &TxRemoveRequest::new(ctx.next_version()))
            .unwrap();
        // The only candidate from the near node is the committing tx
        // itself, so its reader goes away.
        assert!(entry.readers().is_empty());
    }

    #[test]
    fn test_reader_kept_while_other_tx_active() {
        let ctx = ctx_with(CacheConfig {
            dht: true,
            track_readers: true,
            ..Default::default()
        });
        let entry = CacheEntry::new(
            CacheKey::from_str("k", 0),
            TierState::Dht {
                readers: SmallVec::new(),
            },
        );
        let near_node = Uuid::new_v4();
        let tx = TxContext::local(ctx.next_version(), near_node, 7);
        entry
            .lock_remote(&ctx, tx.xid, near_node, 7, None)
            .unwrap();
        // A second transaction from the same node also holds a candidate.
        let other = ctx.next_version();
        entry.lock_remote(&ctx, other, near_node, 8, None).unwrap();
        entry.add_reader(&ctx, near_node).unwrap();

        entry
            .tx_set(
                &ctx,
                &tx,
                &TxSetRequest::new(CacheValue::string("v"), ctx.next_version()),
            )
            .unwrap();
        entry
            .tx_remove(&ctx, &tx, &TxRemoveRequest::new(ctx.next_version()))
            .unwrap();
        assert_eq!(entry.readers().len(), 1);
    }
}
