//! Per-(alert, instance) cooldown tracking.
//!
//! The limiter is process-local and in-memory. Losing it on restart only
//! means the first firing after a restart is admitted again.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Source of "now" for the limiter, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Identifies what a cooldown applies to. Severity and any other labels are
/// deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub alert_name: String,
    pub instance: String,
}

impl RateLimitKey {
    pub fn new(alert_name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            alert_name: alert_name.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.alert_name, self.instance)
    }
}

pub struct RateLimiter {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    last_execution: Mutex<HashMap<RateLimitKey, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_clock(cooldown, Arc::new(SystemClock))
    }

    pub fn with_clock(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown,
            clock,
            last_execution: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Atomically decides whether `key` may run now and, if so, records the
    /// admission. A denied call leaves the stored timestamp untouched.
    pub fn admit(&self, key: &RateLimitKey) -> Result<bool> {
        let now = self.clock.now();
        let mut last_execution = self
            .last_execution
            .lock()
            .map_err(|_| Error::Internal("rate limiter lock poisoned".to_string()))?;

        if let Some(last) = last_execution.get(key) {
            if self.within_cooldown(*last, now) {
                debug!(key = %key, last = %last, "Admission denied, cooling down");
                return Ok(false);
            }
        }

        last_execution.insert(key.clone(), now);
        Ok(true)
    }

    /// Drops keys whose cooldown has fully elapsed. Such keys would be
    /// admitted on their next firing anyway, so this never changes a
    /// decision. Returns how many entries were removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut last_execution = self
            .last_execution
            .lock()
            .map_err(|_| Error::Internal("rate limiter lock poisoned".to_string()))?;

        let before = last_execution.len();
        last_execution.retain(|_, last| self.within_cooldown(*last, now));
        Ok(before - last_execution.len())
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.last_execution
            .lock()
            .map(|map| map.len())
            .unwrap_or_default()
    }

    // A timestamp in the future (clock stepped backwards) counts as cooling down.
    fn within_cooldown(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.cooldown,
            Err(_) => true,
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("cooldown", &self.cooldown)
            .field("tracked", &self.tracked())
            .finish()
    }
}
