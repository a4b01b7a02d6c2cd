use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for session and worker outcomes.
///
/// Sessions receive the aggregator by reference instead of touching
/// process-wide state, so tests can swap in a recording double.
pub trait Counters: Send + Sync {
    fn registration_succeeded(&self);
    fn registration_failed(&self);
    fn game_joined(&self);
    fn all_in(&self);
    fn fold(&self);
    fn request_sent(&self);
    fn request_succeeded(&self);
    fn request_failed(&self);
}

/// Lock-free counters shared by every task of a run.
#[derive(Debug, Default)]
pub struct FleetCounters {
    successful_registrations: AtomicU64,
    failed_registrations: AtomicU64,
    games_joined: AtomicU64,
    all_ins: AtomicU64,
    folds: AtomicU64,
    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
}

impl FleetCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            successful_registrations: self.successful_registrations.load(Ordering::Relaxed),
            failed_registrations: self.failed_registrations.load(Ordering::Relaxed),
            games_joined: self.games_joined.load(Ordering::Relaxed),
            all_ins: self.all_ins.load(Ordering::Relaxed),
            folds: self.folds.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

impl Counters for FleetCounters {
    fn registration_succeeded(&self) {
        self.successful_registrations.fetch_add(1, Ordering::Relaxed);
    }

    fn registration_failed(&self) {
        self.failed_registrations.fetch_add(1, Ordering::Relaxed);
    }

    fn game_joined(&self) {
        self.games_joined.fetch_add(1, Ordering::Relaxed);
    }

    fn all_in(&self) {
        self.all_ins.fetch_add(1, Ordering::Relaxed);
    }

    fn fold(&self) {
        self.folds.fetch_add(1, Ordering::Relaxed);
    }

    fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn request_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`FleetCounters`], read once after all tasks join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub successful_registrations: u64,
    pub failed_registrations: u64,
    pub games_joined: u64,
    pub all_ins: u64,
    pub folds: u64,
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
}

impl CounterSnapshot {
    /// Sessions that reached a registration verdict, either way.
    pub fn registrations_attempted(&self) -> u64 {
        self.successful_registrations + self.failed_registrations
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Successful registrations: {}", self.successful_registrations)?;
        writeln!(f, "Failed registrations: {}", self.failed_registrations)?;
        writeln!(f, "Games joined: {}", self.games_joined)?;
        writeln!(f, "All-in bets made: {}", self.all_ins)?;
        writeln!(f, "Folds made: {}", self.folds)?;
        writeln!(f, "Requests sent: {}", self.requests_sent)?;
        writeln!(f, "Requests succeeded: {}", self.requests_succeeded)?;
        write!(f, "Requests failed: {}", self.requests_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = FleetCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_each_counter_is_independent() {
        let counters = FleetCounters::new();
        counters.registration_succeeded();
        counters.registration_succeeded();
        counters.registration_failed();
        counters.game_joined();
        counters.all_in();
        counters.fold();
        counters.fold();
        counters.fold();
        counters.request_sent();
        counters.request_failed();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.successful_registrations, 2);
        assert_eq!(snapshot.failed_registrations, 1);
        assert_eq!(snapshot.registrations_attempted(), 3);
        assert_eq!(snapshot.games_joined, 1);
        assert_eq!(snapshot.all_ins, 1);
        assert_eq!(snapshot.folds, 3);
        assert_eq!(snapshot.requests_sent, 1);
        assert_eq!(snapshot.requests_succeeded, 0);
        assert_eq!(snapshot.requests_failed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(FleetCounters::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let counters = Arc::clone(&counters);
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    counters.fold();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counters.snapshot().folds, 16_000);
    }

    #[test]
    fn test_summary_lists_every_counter() {
        let summary = CounterSnapshot {
            all_ins: 7,
            ..Default::default()
        }
        .to_string();
        assert!(summary.contains("All-in bets made: 7"));
        assert!(summary.contains("Failed registrations: 0"));
        assert_eq!(summary.lines().count(), 8);
    }
}
