use crate::counters::Counters;
use crate::session::{run_session, Credentials, EndReason, SessionOutcome, SessionSettings};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Total sessions to launch.
    pub players: u64,
    /// Id of the first session; later sessions count up from here.
    pub first_id: u64,
    /// Admission ceiling for simultaneously active sessions.
    pub max_concurrency: usize,
    pub username_prefix: String,
    pub password_prefix: String,
    /// Log progress every this many launches. Zero disables it.
    pub progress_every: u64,
    pub session: SessionSettings,
}

/// How many sessions ended in each way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub connect_failed: u64,
    pub registration_failed: u64,
    pub registered: u64,
    pub join_failed: u64,
    pub game_over: u64,
    pub leaderboard_end: u64,
    pub activity_timeout: u64,
    pub connection_lost: u64,
    pub send_failed: u64,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: SessionOutcome) {
        let slot = match outcome {
            SessionOutcome::ConnectFailed => &mut self.connect_failed,
            SessionOutcome::RegistrationFailed => &mut self.registration_failed,
            SessionOutcome::Registered => &mut self.registered,
            SessionOutcome::JoinFailed => &mut self.join_failed,
            SessionOutcome::Finished(EndReason::GameOver) => &mut self.game_over,
            SessionOutcome::Finished(EndReason::LeaderboardEntryEnd) => &mut self.leaderboard_end,
            SessionOutcome::Finished(EndReason::ActivityTimeout) => &mut self.activity_timeout,
            SessionOutcome::Finished(EndReason::ConnectionLost) => &mut self.connection_lost,
            SessionOutcome::Finished(EndReason::SendFailed) => &mut self.send_failed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.connect_failed
            + self.registration_failed
            + self.registered
            + self.join_failed
            + self.game_over
            + self.leaderboard_end
            + self.activity_timeout
            + self.connection_lost
            + self.send_failed
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub launched: u64,
    pub completed: u64,
    /// Session tasks that panicked instead of returning an outcome.
    pub panicked: u64,
    pub peak_active: usize,
    /// Admission stopped early because the stop signal fired.
    pub interrupted: bool,
    pub elapsed: Duration,
    pub outcomes: OutcomeTally,
}

impl FleetReport {
    fn record(&mut self, result: Result<SessionOutcome, JoinError>) {
        match result {
            Ok(outcome) => {
                self.completed += 1;
                self.outcomes.record(outcome);
            }
            Err(e) => {
                self.panicked += 1;
                error!("Session task failed: {}", e);
            }
        }
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Duration: {:?}", self.elapsed)?;
        writeln!(f, "Total player sessions attempted: {}", self.launched)?;
        writeln!(f, "Sessions completed: {}", self.completed)?;
        writeln!(f, "Sessions panicked: {}", self.panicked)?;
        write!(f, "Peak active sessions: {}", self.peak_active)?;
        if self.interrupted {
            write!(f, "\nRun interrupted before all sessions were launched")?;
        }
        Ok(())
    }
}

/// Counts sessions holding an admission permit and remembers the maximum.
#[derive(Debug, Default)]
struct ActiveGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveGauge {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<ActiveGauge>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves once the stop signal reads `true`. Never resolves if the sender
/// is gone without having signalled.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let signalled = stop.wait_for(|stopped| *stopped).await.map(|_| ());
    if signalled.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Launch `settings.players` sessions with at most `max_concurrency` active
/// at once, then wait for every one of them.
///
/// Launching blocks while the bound is saturated. When `stop` fires, no
/// further sessions are admitted but those already running are still joined.
pub async fn run_fleet(
    settings: FleetSettings,
    counters: Arc<dyn Counters>,
    mut stop: watch::Receiver<bool>,
) -> FleetReport {
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
    let gauge = Arc::new(ActiveGauge::default());
    let session_settings = Arc::new(settings.session.clone());
    let mut tasks = JoinSet::new();
    let mut report = FleetReport::default();

    info!(
        "Launching {} sessions against {} with concurrency {}",
        settings.players, session_settings.address, settings.max_concurrency
    );

    for offset in 0..settings.players {
        if *stop.borrow() {
            report.interrupted = true;
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Admission semaphore closed: {}", e);
                    break;
                }
            },
            _ = wait_for_stop(&mut stop) => {
                report.interrupted = true;
                break;
            }
        };

        let credentials = Credentials::derive(
            settings.first_id + offset,
            &settings.username_prefix,
            &settings.password_prefix,
        );
        let counters = Arc::clone(&counters);
        let session_settings = Arc::clone(&session_settings);
        let gauge = Arc::clone(&gauge);

        tasks.spawn(async move {
            let _permit = permit;
            let _active = gauge.enter();
            run_session(credentials, &session_settings, counters.as_ref()).await
        });
        report.launched += 1;

        if settings.progress_every > 0 && report.launched % settings.progress_every == 0 {
            info!("Launched session {}...", report.launched);
        }

        while let Some(result) = tasks.try_join_next() {
            report.record(result);
        }
    }

    if report.interrupted {
        warn!(
            "Stop requested after {} launches, waiting for {} active sessions",
            report.launched,
            tasks.len()
        );
    }

    while let Some(result) = tasks.join_next().await {
        report.record(result);
    }

    report.peak_active = gauge.peak();
    report.elapsed = started.elapsed();
    info!(
        "All {} session attempts completed in {:?}",
        report.launched, report.elapsed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::FleetCounters;
    use tokio::net::TcpListener;

    fn unreachable_settings(address: String, players: u64, max_concurrency: usize) -> FleetSettings {
        FleetSettings {
            players,
            first_id: 0,
            max_concurrency,
            username_prefix: "p".to_string(),
            password_prefix: "pw".to_string(),
            progress_every: 0,
            session: SessionSettings {
                address,
                connect_timeout: Duration::from_secs(2),
                io_timeout: Duration::from_secs(2),
                activity_timeout: Duration::from_secs(2),
                register_only: false,
            },
        }
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[test]
    fn test_tally_totals_every_outcome() {
        let mut tally = OutcomeTally::default();
        tally.record(SessionOutcome::ConnectFailed);
        tally.record(SessionOutcome::Finished(EndReason::GameOver));
        tally.record(SessionOutcome::Finished(EndReason::GameOver));
        tally.record(SessionOutcome::Registered);
        assert_eq!(tally.game_over, 2);
        assert_eq!(tally.total(), 4);
    }

    #[test]
    fn test_gauge_tracks_peak() {
        let gauge = Arc::new(ActiveGauge::default());
        let a = gauge.enter();
        let b = gauge.enter();
        drop(a);
        let c = gauge.enter();
        assert_eq!(gauge.peak(), 2);
        drop(b);
        drop(c);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_failed_connect_is_accounted_for() {
        let counters = Arc::new(FleetCounters::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = run_fleet(
            unreachable_settings(closed_port().await, 25, 4),
            counters.clone(),
            stop_rx,
        )
        .await;

        assert_eq!(report.launched, 25);
        assert_eq!(report.completed, 25);
        assert_eq!(report.outcomes.connect_failed, 25);
        assert!(report.peak_active <= 4);
        assert_eq!(counters.snapshot().failed_registrations, 25);
        assert_eq!(counters.snapshot().registrations_attempted(), 25);
    }

    #[tokio::test]
    async fn test_zero_players_launches_nothing() {
        let counters = Arc::new(FleetCounters::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = run_fleet(unreachable_settings(closed_port().await, 0, 4), counters, stop_rx).await;

        assert_eq!(report.launched, 0);
        assert_eq!(report.peak_active, 0);
        assert!(!report.interrupted);
    }

    #[tokio::test]
    async fn test_stop_before_start_admits_nothing() {
        let counters = Arc::new(FleetCounters::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let report = run_fleet(unreachable_settings(closed_port().await, 10, 2), counters, stop_rx).await;

        assert!(report.interrupted);
        assert_eq!(report.launched, 0);
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_does_not_interrupt() {
        let counters = Arc::new(FleetCounters::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        let report = run_fleet(unreachable_settings(closed_port().await, 6, 1), counters, stop_rx).await;

        assert!(!report.interrupted);
        assert_eq!(report.launched, 6);
        assert_eq!(report.outcomes.total(), 6);
    }
}
