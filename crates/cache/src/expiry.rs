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

//! TTL computation. An injected [`ExpiryPolicy`] answers "what TTL should a
//! create/update/access get"; this module resolves those answers, together
//! with any explicit TTL on the operation, into the `(ttl, expire_time)`
//! pair stored in entry extras and persisted in the row.

/// Smallest representable TTL, used when a policy demands immediate expiry:
/// the entry gets this TTL and an expire time already in the past.
pub const TTL_MINIMUM: u64 = 1;

/// What an expiry policy has to say about one lifecycle point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TtlDecision {
    /// Keep whatever TTL the entry already had.
    NotChanged,
    /// Expire immediately.
    Zero,
    /// Live forever.
    Eternal,
    /// Live this many milliseconds from now.
    Millis(u64),
}

/// User-pluggable expiration policy. All three methods are consulted with
/// no entry lock held by user code; implementations must be pure.
pub trait ExpiryPolicy: Send + Sync {
    fn for_create(&self) -> TtlDecision;
    fn for_update(&self) -> TtlDecision;
    fn for_access(&self) -> TtlDecision;
}

/// Fixed-decision policy; covers the common "created N ms" configurations
/// and doubles as the test policy.
#[derive(Debug, Clone)]
pub struct StaticExpiryPolicy {
    pub create: TtlDecision,
    pub update: TtlDecision,
    pub access: TtlDecision,
}

impl StaticExpiryPolicy {
    /// TTL on create and update, untouched on access.
    pub fn with_ttl(ttl_millis: u64) -> Self {
        Self {
            create: TtlDecision::Millis(ttl_millis),
            update: TtlDecision::Millis(ttl_millis),
            access: TtlDecision::NotChanged,
        }
    }
}

impl ExpiryPolicy for StaticExpiryPolicy {
    fn for_create(&self) -> TtlDecision {
        self.create
    }

    fn for_update(&self) -> TtlDecision {
        self.update
    }

    fn for_access(&self) -> TtlDecision {
        self.access
    }
}

/// Resolved `(ttl, expire_time)` for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TtlResolution {
    pub ttl: u64,
    pub expire_time: u64,
}

impl TtlResolution {
    pub const ETERNAL: TtlResolution = TtlResolution {
        ttl: 0,
        expire_time: 0,
    };
}

fn apply(decision: TtlDecision, prior_ttl: u64, prior_expire: u64, now: u64) -> TtlResolution {
    match decision {
        TtlDecision::NotChanged => TtlResolution {
            ttl: prior_ttl,
            expire_time: prior_expire,
        },
        TtlDecision::Zero => TtlResolution {
            ttl: TTL_MINIMUM,
            expire_time: now - 1,
        },
        TtlDecision::Eternal => TtlResolution::ETERNAL,
        TtlDecision::Millis(ttl) => TtlResolution {
            ttl,
            expire_time: now + ttl,
        },
    }
}

/// Resolve the TTL for a create/update. An explicit TTL on the operation
/// wins over the policy; with neither, the prior state is retained (which
/// for a never-written entry means eternal).
pub fn resolve_for_write(
    explicit_ttl: Option<u64>,
    explicit_expire: Option<u64>,
    policy: Option<&dyn ExpiryPolicy>,
    had_value: bool,
    prior_ttl: u64,
    prior_expire: u64,
    now: u64,
) -> TtlResolution {
    if let Some(ttl) = explicit_ttl {
        if ttl == 0 {
            return TtlResolution::ETERNAL;
        }
        return TtlResolution {
            ttl,
            expire_time: explicit_expire.unwrap_or(now + ttl),
        };
    }
    // Conflict-resolved updates carry the originating DC's expire time.
    if let Some(expire) = explicit_expire {
        return TtlResolution {
            ttl: if expire == 0 {
                0
            } else {
                expire.saturating_sub(now).max(TTL_MINIMUM)
            },
            expire_time: expire,
        };
    }
    let Some(policy) = policy else {
        return TtlResolution {
            ttl: prior_ttl,
            expire_time: prior_expire,
        };
    };
    let decision = if had_value {
        policy.for_update()
    } else {
        policy.for_create()
    };
    apply(decision, prior_ttl, prior_expire, now)
}

/// Resolve a TTL-on-access update. `None` means nothing changed and the row
/// need not be rewritten.
pub fn resolve_for_access(
    policy: &dyn ExpiryPolicy,
    prior_ttl: u64,
    prior_expire: u64,
    now: u64,
) -> Option<TtlResolution> {
    match policy.for_access() {
        TtlDecision::NotChanged => None,
        decision => {
            let resolved = apply(decision, prior_ttl, prior_expire, now);
            (resolved.expire_time != prior_expire || resolved.ttl != prior_ttl).then_some(resolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_ttl_wins() {
        let policy = StaticExpiryPolicy::with_ttl(10);
        let r = resolve_for_write(Some(500), None, Some(&policy), true, 0, 0, 1_000);
        assert_eq!(r, TtlResolution { ttl: 500, expire_time: 1_500 });
    }

    #[test]
    fn test_explicit_zero_ttl_means_eternal() {
        let r = resolve_for_write(Some(0), None, None, true, 7, 77, 1_000);
        assert_eq!(r, TtlResolution::ETERNAL);
    }

    #[test]
    fn test_policy_create_vs_update() {
        let policy = StaticExpiryPolicy {
            create: TtlDecision::Millis(100),
            update: TtlDecision::Millis(200),
            access: TtlDecision::NotChanged,
        };
        let create = resolve_for_write(None, None, Some(&policy), false, 0, 0, 1_000);
        assert_eq!(create.expire_time, 1_100);
        let update = resolve_for_write(None, None, Some(&policy), true, 100, 1_100, 1_000);
        assert_eq!(update.expire_time, 1_200);
    }

    #[test]
    fn test_not_changed_retains_prior() {
        let policy = StaticExpiryPolicy {
            create: TtlDecision::NotChanged,
            update: TtlDecision::NotChanged,
            access: TtlDecision::NotChanged,
        };
        // Start-version entry: retained prior is eternal.
        let r = resolve_for_write(None, None, Some(&policy), false, 0, 0, 1_000);
        assert_eq!(r, TtlResolution::ETERNAL);
        let r = resolve_for_write(None, None, Some(&policy), true, 50, 900, 1_000);
        assert_eq!(r, TtlResolution { ttl: 50, expire_time: 900 });
    }

    #[test]
    fn test_zero_forces_past_expire() {
        let policy = StaticExpiryPolicy {
            create: TtlDecision::Zero,
            update: TtlDecision::Zero,
            access: TtlDecision::NotChanged,
        };
        let r = resolve_for_write(None, None, Some(&policy), false, 0, 0, 1_000);
        assert_eq!(r.ttl, TTL_MINIMUM);
        assert_eq!(r.expire_time, 999);
    }

    #[test]
    fn test_access_resolution() {
        let touch = StaticExpiryPolicy {
            create: TtlDecision::NotChanged,
            update: TtlDecision::NotChanged,
            access: TtlDecision::Millis(300),
        };
        let r = resolve_for_access(&touch, 300, 1_100, 1_000).unwrap();
        assert_eq!(r.expire_time, 1_300);

        let no_touch = StaticExpiryPolicy::with_ttl(10);
        assert!(resolve_for_access(&no_touch, 10, 1_010, 1_000).is_none());
    }

    #[test]
    fn test_conflict_expire_time_passthrough() {
        let r = resolve_for_write(None, Some(5_000), None, true, 0, 0, 1_000);
        assert_eq!(r.expire_time, 5_000);
        assert_eq!(r.ttl, 4_000);
    }
}
