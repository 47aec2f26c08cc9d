//! Windowed rate limiting
//!
//! Each limit tracks a [`UsageWindow`] per subject (usually the sender account):
//!
//! - **Rolling** - once a window has elapsed the next admission re-anchors it at `now`
//! - **Fixed** - windows sit on a grid starting at first use; the start advances by
//!   whole periods to the last crossed boundary
//!
//! Windows roll lazily on the next check. All limits checked together are evaluated
//! and incremented under one lock, so an admission is all-or-nothing.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rail_core::{AccessControl, EventBus, Metrics, Principal, Role, SettlementEvent, SharedClock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// Longest accepted window (ten years)
pub const MAX_WINDOW_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// Rate limit identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitId(String);

impl LimitId {
    /// Create new limit ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LimitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a limit constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    /// Number of admissions
    Count,
    /// Summed amount
    Volume,
    /// Both count and volume
    Both,
}

/// Window semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    /// Re-anchored at the first admission after expiry
    Rolling,
    /// Aligned to whole periods since first use
    Fixed,
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDefinition {
    /// Maximum admissions per window
    #[serde(default)]
    pub max_count: u64,

    /// Maximum summed amount per window
    #[serde(default)]
    pub max_volume: Decimal,

    /// Window length in seconds
    pub window_secs: u64,

    /// Constrained dimension
    pub limit_kind: LimitKind,

    /// Window semantics
    pub window_kind: WindowKind,

    /// Inactive limits admit everything without tracking
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RateLimitDefinition {
    /// Count-only limit
    pub fn count(max_count: u64, window_secs: u64, window_kind: WindowKind) -> Self {
        Self {
            max_count,
            max_volume: Decimal::ZERO,
            window_secs,
            limit_kind: LimitKind::Count,
            window_kind,
            active: true,
        }
    }

    /// Volume-only limit
    pub fn volume(max_volume: Decimal, window_secs: u64, window_kind: WindowKind) -> Self {
        Self {
            max_count: 0,
            max_volume,
            window_secs,
            limit_kind: LimitKind::Volume,
            window_kind,
            active: true,
        }
    }

    /// Count and volume limit
    pub fn both(
        max_count: u64,
        max_volume: Decimal,
        window_secs: u64,
        window_kind: WindowKind,
    ) -> Self {
        Self {
            max_count,
            max_volume,
            window_secs,
            limit_kind: LimitKind::Both,
            window_kind,
            active: true,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 || self.window_secs > MAX_WINDOW_SECS {
            return Err(Error::InvalidConfig(format!(
                "window_secs must be in 1..={}, got {}",
                MAX_WINDOW_SECS, self.window_secs
            )));
        }
        if self.max_volume.is_sign_negative() {
            return Err(Error::InvalidConfig("max_volume must not be negative".to_string()));
        }
        Ok(())
    }

    fn window(&self) -> Option<Duration> {
        i64::try_from(self.window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .filter(|window| *window > Duration::zero())
    }

    /// Whether one more admission of `amount` fits in `usage`
    pub fn admits(&self, usage: &UsageWindow, amount: Decimal) -> bool {
        let count_ok = usage.count < self.max_count;
        let volume_ok = usage.volume + amount <= self.max_volume;
        match self.limit_kind {
            LimitKind::Count => count_ok,
            LimitKind::Volume => volume_ok,
            LimitKind::Both => count_ok && volume_ok,
        }
    }
}

/// Usage of one subject within the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Admissions in the window
    pub count: u64,
    /// Amount admitted in the window
    pub volume: Decimal,
    /// Start of the window
    pub window_start: DateTime<Utc>,
    /// Last admission
    pub last_update: DateTime<Utc>,
}

impl UsageWindow {
    /// Empty window anchored at `now`
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            volume: Decimal::ZERO,
            window_start: now,
            last_update: now,
        }
    }

    /// The window as seen at `now`; a new empty window once the period has elapsed
    pub fn rolled(&self, definition: &RateLimitDefinition, now: DateTime<Utc>) -> Self {
        // A window that cannot be represented never elapses
        let Some(window) = definition.window() else {
            return self.clone();
        };
        match self.window_start.checked_add_signed(window) {
            Some(end) if now >= end => {}
            _ => return self.clone(),
        }

        match definition.window_kind {
            WindowKind::Rolling => Self::fresh(now),
            WindowKind::Fixed => {
                let window_ms = window.num_milliseconds();
                let periods = (now - self.window_start).num_milliseconds() / window_ms;
                let start = self.window_start + Duration::milliseconds(periods * window_ms);
                Self {
                    count: 0,
                    volume: Decimal::ZERO,
                    window_start: start,
                    last_update: self.last_update,
                }
            }
        }
    }
}

/// Per-limit, per-subject usage tracker
#[derive(Debug)]
pub struct RateLimiter {
    limits: RwLock<HashMap<LimitId, RateLimitDefinition>>,
    usage: Mutex<HashMap<(LimitId, String), UsageWindow>>,
    access: AccessControl,
    clock: SharedClock,
    events: EventBus,
    metrics: Metrics,
}

impl RateLimiter {
    /// Create a limiter with no limits
    pub fn new(access: AccessControl, clock: SharedClock, events: EventBus, metrics: Metrics) -> Self {
        Self {
            limits: RwLock::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
            access,
            clock,
            events,
            metrics,
        }
    }

    /// Register a limit (admin only)
    pub fn create_limit(
        &self,
        caller: &Principal,
        id: LimitId,
        definition: RateLimitDefinition,
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        definition.validate()?;

        let mut limits = self.limits.write();
        if limits.contains_key(&id) {
            return Err(Error::LimitExists(id));
        }
        info!(limit = %id, kind = ?definition.limit_kind, window = ?definition.window_kind, "Rate limit created");
        limits.insert(id, definition);
        Ok(())
    }

    /// Replace a limit's configuration (admin only). Current windows are kept.
    pub fn update_limit(
        &self,
        caller: &Principal,
        id: &LimitId,
        definition: RateLimitDefinition,
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        definition.validate()?;

        let mut limits = self.limits.write();
        let slot = limits
            .get_mut(id)
            .ok_or_else(|| Error::LimitNotFound(id.clone()))?;
        *slot = definition;
        info!(limit = %id, "Rate limit updated");
        Ok(())
    }

    /// Enable or disable a limit (admin only)
    pub fn set_active(&self, caller: &Principal, id: &LimitId, active: bool) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        let mut limits = self.limits.write();
        let definition = limits
            .get_mut(id)
            .ok_or_else(|| Error::LimitNotFound(id.clone()))?;
        definition.active = active;
        info!(limit = %id, active, "Rate limit toggled");
        Ok(())
    }

    /// Configured limit
    pub fn limit(&self, id: &LimitId) -> Option<RateLimitDefinition> {
        self.limits.read().get(id).cloned()
    }

    /// All limit IDs
    pub fn limit_ids(&self) -> Vec<LimitId> {
        let mut ids: Vec<_> = self.limits.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Admit one `amount` for `subject` against a single limit
    pub fn check_limit(&self, id: &LimitId, subject: &str, amount: Decimal) -> Result<()> {
        self.check_limits(std::slice::from_ref(id), subject, amount)
    }

    /// Admit one `amount` for `subject` against every limit in `ids`, all or nothing
    pub fn check_limits(&self, ids: &[LimitId], subject: &str, amount: Decimal) -> Result<()> {
        self.admit_batch(ids, &[(subject.to_string(), amount)])
    }

    /// Admit a batch of `(subject, amount)` entries against every limit in `ids`.
    ///
    /// Entries for the same subject accumulate. Either every entry is admitted or
    /// nothing is recorded.
    pub fn admit_batch(&self, ids: &[LimitId], entries: &[(String, Decimal)]) -> Result<()> {
        let limits = self.limits.read();
        let mut active = Vec::with_capacity(ids.len());
        for id in ids {
            let definition = limits
                .get(id)
                .ok_or_else(|| Error::LimitNotFound(id.clone()))?;
            if definition.active {
                active.push((id, definition));
            }
        }
        if active.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut usage = self.usage.lock();
        let mut staged: HashMap<(LimitId, String), UsageWindow> = HashMap::new();

        for (subject, amount) in entries {
            for (id, definition) in &active {
                let key = ((*id).clone(), subject.clone());
                let window = staged.entry(key.clone()).or_insert_with(|| {
                    usage
                        .get(&key)
                        .map(|current| current.rolled(definition, now))
                        .unwrap_or_else(|| UsageWindow::fresh(now))
                });

                if !definition.admits(window, *amount) {
                    warn!(limit = %id, subject = %subject, amount = %amount, count = window.count, volume = %window.volume, "Rate limit exceeded");
                    self.metrics.limit_rejections.inc();
                    self.events.publish(SettlementEvent::LimitRejected {
                        limit_id: id.to_string(),
                        subject: subject.clone(),
                        at: now,
                    });
                    return Err(Error::LimitExceeded {
                        limit: (*id).clone(),
                        subject: subject.clone(),
                    });
                }

                window.count += 1;
                window.volume += *amount;
                window.last_update = now;
            }
        }

        usage.extend(staged);
        Ok(())
    }

    /// Current usage for `subject` under limit `id`, as of now
    pub fn usage(&self, id: &LimitId, subject: &str) -> Option<UsageWindow> {
        let definition = self.limit(id)?;
        let now = self.clock.now();
        self.usage
            .lock()
            .get(&(id.clone(), subject.to_string()))
            .map(|window| window.rolled(&definition, now))
    }
}
