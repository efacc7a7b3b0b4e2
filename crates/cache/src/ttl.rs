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

//! The TTL tracker: an ordered agenda of entry deadlines, swept
//! periodically by a maintenance thread. Expiration itself stays in the
//! entry (`CacheEntry::expire`); the tracker only decides who is due.
//!
//! Deadlines are advisory. An entry rewritten with a longer TTL keeps its
//! old agenda slot, and `expire` simply no-ops when the deadline no longer
//! holds, so stale slots cost one wasted check, never a wrong expiry.

use crate::context::CacheContext;
use crate::map::EntryMap;
use ember_core::CacheKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub struct TtlTracker {
    // Keyed by (deadline, insertion seq) so equal deadlines don't collide.
    deadlines: Mutex<BTreeMap<(u64, u64), CacheKey>>,
    seq: AtomicU64,
}

impl Default for TtlTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlTracker {
    pub fn new() -> Self {
        Self {
            deadlines: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Put a key on the agenda. Eternal entries (`expire_time == 0`) are
    /// not tracked.
    pub fn schedule(&self, key: CacheKey, expire_time: u64) {
        if expire_time == 0 {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.deadlines.lock().insert((expire_time, seq), key);
    }

    pub fn pending(&self) -> usize {
        self.deadlines.lock().len()
    }

    /// Expire everything whose deadline has passed. Returns the number of
    /// entries that actually expired (stale slots and already-gone entries
    /// are skipped). Failures on individual entries are logged and do not
    /// stop the sweep.
    pub fn sweep(&self, ctx: &CacheContext, map: &EntryMap) -> usize {
        let now = ctx.now_millis();
        let due: Vec<CacheKey> = {
            let mut deadlines = self.deadlines.lock();
            let mut due = vec![];
            while let Some((&(deadline, _), _)) = deadlines.first_key_value() {
                if deadline > now {
                    break;
                }
                due.push(deadlines.pop_first().unwrap().1);
            }
            due
        };

        let mut expired = 0;
        for key in due {
            let Some(entry) = map.peek_entry(&key) else {
                continue;
            };
            match entry.expire(ctx) {
                Ok(true) => {
                    expired += 1;
                    if entry.is_obsolete() {
                        map.remove_obsolete(&key);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("failed to expire entry during sweep: {e}");
                }
            }
        }
        expired
    }
}
