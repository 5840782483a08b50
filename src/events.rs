use std::time::{Duration, Instant};

/// Maintenance tasks driven by the timer registry. The server matches on the
/// kind to run the handler; the registry only tracks when each is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    AdmissionSweep,
    CleanupSweep,
    BackgroundSave,
    DurabilityFlush,
    DeferredRelease,
    DrainClients,
    DrainAgents,
}

#[derive(Debug)]
struct Entry {
    kind: Maintenance,
    interval: Duration,
    last_fire: Option<Instant>,
}

/// Ordered registry of periodic maintenance entries.
///
/// An entry fires when `now >= last_fire + interval` and its `last_fire` is
/// stamped with the time *after* the handler returned, so a slow handler
/// delays its own next firing instead of bursting to catch up. Interval 0
/// fires on every tick. An entry that has never fired is due immediately.
#[derive(Debug, Default)]
pub struct EventRegistry {
    entries: Vec<Entry>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: Maintenance, interval_ms: u64) {
        self.entries.push(Entry {
            kind,
            interval: Duration::from_millis(interval_ms),
            last_fire: None,
        });
    }

    /// Entries due at `now`, in registration order.
    pub fn due(&self, now: Instant) -> Vec<Maintenance> {
        self.entries
            .iter()
            .filter(|e| match e.last_fire {
                None => true,
                Some(last) => now >= last + e.interval,
            })
            .map(|e| e.kind)
            .collect()
    }

    /// Record that `kind`'s handler returned at `completed_at`.
    pub fn fired(&mut self, kind: Maintenance, completed_at: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.kind == kind) {
            entry.last_fire = Some(completed_at);
        }
    }

    /// The shortest registered non-zero interval, used to size the tick.
    pub fn min_interval(&self) -> Option<Duration> {
        self.entries
            .iter()
            .map(|e| e.interval)
            .filter(|i| !i.is_zero())
            .min()
    }
}
