use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Default, Clone)]
struct Entry {
    consecutive_failures: u32,
    down_until: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
}

/// Snapshot of one provider's health, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub available: bool,
    pub down: bool,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
}

/// Circuit breaker keyed by provider name.
///
/// `unhealthy_after` consecutive transient failures take a provider down
/// for `cooldown`. Any success closes the circuit again.
#[derive(Debug)]
pub struct HealthTracker {
    unhealthy_after: u32,
    cooldown: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl HealthTracker {
    pub fn new(unhealthy_after: u32, cooldown: Duration) -> Self {
        Self {
            unhealthy_after: unhealthy_after.max(1),
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&mut Entry) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(entries.entry(name.to_string()).or_default())
    }

    pub fn is_down(&self, name: &str) -> bool {
        self.with_entry(name, |e| match e.down_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed: half-open, let one call through.
                e.down_until = None;
                false
            }
            None => false,
        })
    }

    pub fn record_success(&self, name: &str) {
        self.with_entry(name, |e| {
            e.total_calls += 1;
            e.consecutive_failures = 0;
            e.down_until = None;
        });
    }

    /// Returns `true` when this failure took the provider down.
    pub fn record_failure(&self, name: &str) -> bool {
        let threshold = self.unhealthy_after;
        let cooldown = self.cooldown;
        self.with_entry(name, |e| {
            e.total_calls += 1;
            e.total_failures += 1;
            e.consecutive_failures += 1;
            if e.consecutive_failures >= threshold && e.down_until.is_none() {
                e.down_until = Some(Instant::now() + cooldown);
                return true;
            }
            false
        })
    }

    /// Calls that finished without a transport-level failure, e.g. a
    /// low-confidence answer, still count toward the totals.
    pub fn record_call(&self, name: &str) {
        self.with_entry(name, |e| e.total_calls += 1);
    }

    pub fn snapshot(&self, name: &str, available: bool) -> ProviderHealth {
        let down = self.is_down(name);
        self.with_entry(name, |e| ProviderHealth {
            name: name.to_string(),
            available,
            down,
            consecutive_failures: e.consecutive_failures,
            total_calls: e.total_calls,
            total_failures: e.total_failures,
        })
    }
}
