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

//! User interceptor hooks at the entry boundary. User code runs behind a
//! panic barrier: a hook that panics must leave the entry consistent, so a
//! panicking before-hook degrades to pass-through and a panicking
//! after-hook is dropped. Hooks are called with the entry lock held (the
//! before hooks) or after release (the after hooks) and must not call back
//! into the cache.

use ember_core::{CacheKey, CacheValue};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Decision of `on_before_remove`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveDecision {
    pub cancel: bool,
    /// Replaces the "previous value" exposed to the caller.
    pub override_value: Option<CacheValue>,
}

pub trait CacheInterceptor: Send + Sync {
    /// Inspect/replace the value about to be written. `None` cancels the
    /// update.
    fn on_before_put(
        &self,
        old: Option<&CacheValue>,
        candidate: &CacheValue,
    ) -> Option<CacheValue> {
        let _ = old;
        Some(candidate.clone())
    }

    fn on_after_put(&self, key: &CacheKey, value: &CacheValue, update_counter: i64) {
        let _ = (key, value, update_counter);
    }

    fn on_before_remove(&self, old: Option<&CacheValue>) -> RemoveDecision {
        let _ = old;
        RemoveDecision::default()
    }

    fn on_after_remove(&self, key: &CacheKey, old: Option<&CacheValue>) {
        let _ = (key, old);
    }
}

/// Panic barrier around a user interceptor.
pub struct InterceptorBarrier {
    inner: Arc<dyn CacheInterceptor>,
    failures: AtomicU64,
}

impl InterceptorBarrier {
    pub fn new(inner: Arc<dyn CacheInterceptor>) -> Self {
        Self {
            inner,
            failures: AtomicU64::new(0),
        }
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn guard<R>(&self, hook: &str, default: R, f: impl FnOnce() -> R) -> R {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(r) => r,
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!("cache interceptor panicked in {hook}");
                default
            }
        }
    }

    /// A panicking before-put passes the candidate through unchanged.
    pub fn before_put(
        &self,
        old: Option<&CacheValue>,
        candidate: &CacheValue,
    ) -> Option<CacheValue> {
        self.guard("on_before_put", Some(candidate.clone()), || {
            self.inner.on_before_put(old, candidate)
        })
    }

    pub fn after_put(&self, key: &CacheKey, value: &CacheValue, update_counter: i64) {
        self.guard("on_after_put", (), || {
            self.inner.on_after_put(key, value, update_counter)
        });
    }

    /// A panicking before-remove does not cancel the removal.
    pub fn before_remove(&self, old: Option<&CacheValue>) -> RemoveDecision {
        self.guard("on_before_remove", RemoveDecision::default(), || {
            self.inner.on_before_remove(old)
        })
    }

    pub fn after_remove(&self, key: &CacheKey, old: Option<&CacheValue>) {
        self.guard("on_after_remove", (), || {
            self.inner.on_after_remove(key, old)
        });
    }
}
