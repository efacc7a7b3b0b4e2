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

//! Invariant checks that hold across every operation mix: row/memory
//! agreement at quiescence, tombstone finality, at-most-once cleanup,
//! event accounting and operation statistics.

use ember_cache::storage::{InvokeClosure, Row, RowApplied, RowStore};
use ember_cache::{
    AtomicRequest, CacheConfig, CacheContext, EntryMap, GetOptions, ManualClock, ObsoleteMark,
    TxContext, TxRemoveRequest, TxSetRequest, UpdateOutcome,
};
use ember_core::{CacheError, CacheKey, CacheValue, EventKind, OperationType};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn engine(config: CacheConfig) -> (CacheContext, EntryMap, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(50_000));
    let ctx = CacheContext::new(9, "invariants", config).with_time_source(clock.clone());
    (ctx, EntryMap::new(), clock)
}

fn key(s: &str) -> CacheKey {
    CacheKey::from_str(s, 0)
}

#[test]
fn test_obsolete_mark_cleanup_runs_once() {
    let (ctx, map, _) = engine(CacheConfig::default());
    let k = key("once");
    let entry = map.entry(&ctx, &k);
    let ver = ctx.next_version();

    let mut cleanups = 0;
    for _ in 0..3 {
        let mark = entry.mark_obsolete(&ctx, &ver);
        assert!(mark.succeeded());
        if mark == ObsoleteMark::Marked {
            // The caller owning the Marked transition unlinks the entry.
            map.remove_obsolete(&k);
            cleanups += 1;
        }
    }
    assert_eq!(cleanups, 1);
    assert!(map.peek_entry(&k).is_none());
}

#[test]
fn test_row_memory_agreement_across_op_mix() {
    let (ctx, map, _) = engine(CacheConfig::default());
    let k = key("mix");
    let entry = map.entry(&ctx, &k);
    let tx = TxContext::one_phase(ctx.next_version(), ctx.node_id, 1);

    // Atomic create, tx overwrite, atomic overwrite, tx remove.
    map.atomic_update(
        &ctx,
        &k,
        &AtomicRequest::update(CacheValue::string("a"), ctx.next_version()),
    )
    .unwrap();
    entry
        .tx_set(
            &ctx,
            &tx,
            &TxSetRequest::new(CacheValue::string("bb"), ctx.next_version()),
        )
        .unwrap();
    map.atomic_update(
        &ctx,
        &k,
        &AtomicRequest::update(CacheValue::string("ccc"), ctx.next_version()),
    )
    .unwrap();

    let row = ctx.rows().read(9, &k).unwrap().unwrap();
    let peeked = entry.peek(&ctx).unwrap().unwrap();
    assert_eq!(row.value, peeked.0);
    assert_eq!(row.version, peeked.1);
    assert_eq!(row.value, CacheValue::string("ccc"));

    entry
        .tx_remove(&ctx, &tx, &TxRemoveRequest::new(ctx.next_version()))
        .unwrap();
    assert!(ctx.rows().read(9, &k).unwrap().is_none());
    assert!(!entry.has_value());
}

#[test]
fn test_obsolete_absorbs_through_stale_handle() {
    let (ctx, map, _) = engine(CacheConfig::default());
    let k = key("stale");
    let stale = map.entry(&ctx, &k);
    stale.mark_obsolete(&ctx, &ctx.next_version());

    // Every operation against the dead handle reports removal...
    assert_eq!(
        stale.get(&ctx, &GetOptions::default()),
        Err(CacheError::EntryRemoved)
    );
    assert_eq!(
        stale
            .atomic_update(
                &ctx,
                &AtomicRequest::update(CacheValue::string("x"), ctx.next_version())
            )
            .unwrap_err(),
        CacheError::EntryRemoved
    );
    assert_eq!(stale.reload(&ctx), Err(CacheError::EntryRemoved));
    // ...and no row was ever created by those attempts.
    assert!(ctx.rows().read(9, &k).unwrap().is_none());

    // The map-level wrapper hides the retry.
    let r = map
        .atomic_update(
            &ctx,
            &k,
            &AtomicRequest::update(CacheValue::string("x"), ctx.next_version()),
        )
        .unwrap();
    assert_eq!(r.outcome, UpdateOutcome::Success);
}

#[test]
fn test_read_events_only_on_hits() {
    let (ctx, map, _) = engine(CacheConfig::default());
    let k = key("reads");
    let events = ctx.events().receiver();
    let opts = GetOptions {
        record_event: true,
        ..Default::default()
    };

    // Miss: no READ event.
    map.get(&ctx, &k, &opts).unwrap();
    map.atomic_update(
        &ctx,
        &k,
        &AtomicRequest::update(CacheValue::string("v"), ctx.next_version()),
    )
    .unwrap();
    // Two hits: two READ events.
    map.get(&ctx, &k, &opts).unwrap();
    map.get(&ctx, &k, &opts).unwrap();
    // A hit with recording off: nothing.
    map.get(&ctx, &k, &GetOptions::default()).unwrap();

    let reads = events
        .try_iter()
        .filter(|e| e.kind == EventKind::Read)
        .count();
    assert_eq!(reads, 2);
}

#[test]
fn test_operation_stats_accumulate() {
    let (ctx, map, _) = engine(CacheConfig::default());
    let k = key("stats");

    map.get(&ctx, &k, &GetOptions::default()).unwrap();
    map.atomic_update(
        &ctx,
        &k,
        &AtomicRequest::update(CacheValue::string("v"), ctx.next_version()),
    )
    .unwrap();
    map.atomic_update(&ctx, &k, &AtomicRequest::delete(ctx.next_version()))
        .unwrap();

    assert_eq!(ctx.stats.count(OperationType::CacheGet), 1);
    assert_eq!(ctx.stats.count(OperationType::CachePut), 1);
    assert_eq!(ctx.stats.count(OperationType::CacheRemove), 1);

    // The persisted snapshot round-trips with the same counts.
    let rows = ember_cache::stats::decode_stats(&ember_cache::stats::encode_stats(&ctx.stats))
        .unwrap();
    assert!(
        rows.iter()
            .any(|(op, count, _)| *op == OperationType::CachePut && *count == 1)
    );
}

/// Row store wrapper that can be switched into a failing mode, for
/// exercising storage-failure handling.
struct FlakyRows {
    inner: Arc<dyn RowStore>,
    failing: AtomicBool,
}

impl RowStore for FlakyRows {
    fn invoke(
        &self,
        cache_id: u32,
        key: &CacheKey,
        partition: u32,
        closure: &mut InvokeClosure<'_>,
    ) -> Result<RowApplied, CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("disk on fire".into()));
        }
        self.inner.invoke(cache_id, key, partition, closure)
    }

    fn read(&self, cache_id: u32, key: &CacheKey) -> Result<Option<Row>, CacheError> {
        self.inner.read(cache_id, key)
    }

    fn row_count(&self, cache_id: u32) -> usize {
        self.inner.row_count(cache_id)
    }
}

#[test]
fn test_storage_failure_surfaces_and_state_holds() {
    let flaky = Arc::new(FlakyRows {
        inner: Arc::new(ember_cache::storage::MemRowStore::new()),
        failing: AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::at(50_000));
    let ctx = CacheContext::new(9, "flaky", CacheConfig::default())
        .with_time_source(clock.clone())
        .with_row_store(flaky.clone());
    let map = EntryMap::new();
    let k = key("flaky");

    map.atomic_update(
        &ctx,
        &k,
        &AtomicRequest::update(CacheValue::string("good"), ctx.next_version()),
    )
    .unwrap();

    flaky.failing.store(true, Ordering::SeqCst);
    let err = map
        .atomic_update(
            &ctx,
            &k,
            &AtomicRequest::update(CacheValue::string("bad"), ctx.next_version()),
        )
        .unwrap_err();
    assert_eq!(err, CacheError::Storage("disk on fire".into()));

    // In-memory state did not move.
    flaky.failing.store(false, Ordering::SeqCst);
    let entry = map.peek_entry(&k).unwrap();
    assert_eq!(entry.peek(&ctx).unwrap().unwrap().0, CacheValue::string("good"));
    assert_eq!(
        ctx.rows().read(9, &k).unwrap().unwrap().value,
        CacheValue::string("good")
    );
}

#[test]
fn test_expiration_failure_swallowed_during_stop() {
    let flaky = Arc::new(FlakyRows {
        inner: Arc::new(ember_cache::storage::MemRowStore::new()),
        failing: AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::at(50_000));
    let ctx = CacheContext::new(9, "stopping", CacheConfig::default())
        .with_time_source(clock.clone())
        .with_row_store(flaky.clone());
    let map = EntryMap::new();
    let k = key("doomed");

    let mut req = AtomicRequest::update(CacheValue::string("v"), ctx.next_version());
    req.explicit_ttl = Some(1_000);
    map.atomic_update(&ctx, &k, &req).unwrap();

    clock.advance(5_000);
    flaky.failing.store(true, Ordering::SeqCst);
    let entry = map.peek_entry(&k).unwrap();

    // Before shutdown the failure surfaces to the TTL tracker...
    assert!(entry.expire(&ctx).is_err());

    // ...during shutdown it is logged and swallowed.
    ctx.begin_stop();
    assert_eq!(entry.expire(&ctx), Ok(false));
}