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

//! Per-operation performance counters, keyed by the stable
//! [`OperationType`] ids, and the fixed-size record codec used when a
//! snapshot of them is persisted to a statistics file.

use ahash::AHashMap;
use binary_layout::{Field, binary_layout};
use ember_core::{CacheError, OperationType};
use minstant::Instant;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Copy, Clone)]
struct OpCell {
    count: u64,
    total_nanos: u64,
}

#[derive(Default)]
pub struct PerfStats {
    ops: Mutex<AHashMap<OperationType, OpCell>>,
}

impl PerfStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: OperationType, elapsed: Duration) {
        let mut ops = self.ops.lock();
        let cell = ops.entry(op).or_default();
        cell.count += 1;
        cell.total_nanos += elapsed.as_nanos() as u64;
    }

    pub fn count(&self, op: OperationType) -> u64 {
        self.ops.lock().get(&op).map_or(0, |c| c.count)
    }

    pub fn total(&self, op: OperationType) -> Duration {
        Duration::from_nanos(self.ops.lock().get(&op).map_or(0, |c| c.total_nanos))
    }

    /// Start timing an operation; recorded when the guard drops.
    pub fn time<'a>(&'a self, op: OperationType) -> OpTimerGuard<'a> {
        OpTimerGuard {
            stats: self,
            op,
            start: Instant::now(),
        }
    }

    /// Counters in stable id order, for persistence.
    pub fn snapshot(&self) -> Vec<(OperationType, u64, u64)> {
        let ops = self.ops.lock();
        let mut rows: Vec<_> = ops
            .iter()
            .map(|(op, cell)| (*op, cell.count, cell.total_nanos))
            .collect();
        rows.sort_by_key(|(op, _, _)| op.id());
        rows
    }
}

/// Format version stamped into the leading `VERSION` record.
pub const STATS_FORMAT_VERSION: u64 = 1;

binary_layout!(stats_record, LittleEndian, {
    // OperationType id.
    op: u8,
    count: u64,
    total_nanos: u64,
});

/// Serialize a snapshot: one `VERSION` record carrying the format version,
/// then one fixed-size record per operation in id order. Record sizes are
/// part of the format; readers index by multiples of `stats_record::SIZE`.
pub fn encode_stats(stats: &PerfStats) -> Vec<u8> {
    let snapshot = stats.snapshot();
    let record_size = stats_record::SIZE.unwrap();
    let mut buf = vec![0u8; record_size * (snapshot.len() + 1)];

    let mut header = stats_record::View::new(&mut buf[..record_size]);
    header.op_mut().write(OperationType::Version.id());
    header.count_mut().write(STATS_FORMAT_VERSION);
    header.total_nanos_mut().write(0);

    for (i, (op, count, total_nanos)) in snapshot.iter().enumerate() {
        let at = (i + 1) * record_size;
        let mut view = stats_record::View::new(&mut buf[at..at + record_size]);
        view.op_mut().write(op.id());
        view.count_mut().write(*count);
        view.total_nanos_mut().write(*total_nanos);
    }
    buf
}

/// Parse a statistics stream back into `(op, count, total)` rows. Rejects
/// unknown op ids and missing/mismatched version markers.
pub fn decode_stats(buf: &[u8]) -> Result<Vec<(OperationType, u64, Duration)>, CacheError> {
    let record_size = stats_record::SIZE.unwrap();
    if buf.len() % record_size != 0 || buf.is_empty() {
        return Err(CacheError::Encoding(format!(
            "statistics stream is not a whole number of {record_size}-byte records"
        )));
    }
    let header = stats_record::View::new(&buf[..record_size]);
    if header.op().read() != OperationType::Version.id()
        || header.count().read() != STATS_FORMAT_VERSION
    {
        return Err(CacheError::Encoding(
            "statistics stream has no valid version marker".to_string(),
        ));
    }

    let mut rows = vec![];
    for chunk in buf[record_size..].chunks_exact(record_size) {
        let view = stats_record::View::new(chunk);
        let op = OperationType::from_id(view.op().read())
            .map_err(|e| CacheError::Encoding(e.to_string()))?;
        rows.push((
            op,
            view.count().read(),
            Duration::from_nanos(view.total_nanos().read()),
        ));
    }
    Ok(rows)
}

pub struct OpTimerGuard<'a> {
    stats: &'a PerfStats,
    op: OperationType,
    start: Instant,
}

impl Drop for OpTimerGuard<'_> {
    fn drop(&mut self) {
        self.stats.record(self.op, self.start.elapsed());
    }
}
