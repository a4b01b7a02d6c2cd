use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tableload::counters::FleetCounters;
use tableload::harness::{run_fleet, FleetSettings};
use tableload::session::SessionSettings;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// How the mock server treats each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Reject every fifth player, play one hand with the rest.
    FullGame,
    /// Accept registration, then expect the client to hang up.
    RegisterOnly,
    /// Never answer the registration.
    Silent,
    /// Accept the join, then go quiet without closing.
    StallAfterJoin,
}

struct MockGameServer {
    address: String,
    connections: Arc<AtomicU64>,
    violations: Arc<AtomicU64>,
}

impl MockGameServer {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicU64::new(0));
        let violations = Arc::new(AtomicU64::new(0));

        let accepted = Arc::clone(&connections);
        let broken = Arc::clone(&violations);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let broken = Arc::clone(&broken);
                tokio::spawn(async move {
                    if !serve(stream, script).await {
                        broken.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        Self {
            address,
            connections,
            violations,
        }
    }

    fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    fn violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: Value) {
    let mut line = message.to_string();
    line.push('\n');
    let _ = writer.write_all(line.as_bytes()).await;
}

fn bet_turn(player_id: &str, chips: i64) -> Value {
    json!({
        "type": "action_player_bet",
        "stage": "preflop",
        "minimum_bet": 10,
        "state": {"player": {"player_id": player_id, "chips": chips, "hand": ["Ah", "Kh"]}}
    })
}

/// Returns false when the client broke the protocol.
async fn serve(stream: TcpStream, script: Script) -> bool {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let registration = match lines.next_line().await {
        Ok(Some(line)) => line,
        _ => return false,
    };
    let registration: Value = match serde_json::from_str(&registration) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let username = registration["username"].as_str().unwrap_or_default().to_string();
    let id: u64 = username.trim_start_matches("bot").parse().unwrap_or(0);
    if registration["password"] != json!(format!("secret{}", id)) {
        return false;
    }

    if script == Script::Silent {
        tokio::time::sleep(Duration::from_secs(10)).await;
        return true;
    }

    if script == Script::FullGame && id % 5 == 0 {
        send(&mut writer, json!({"code": 409, "message": "exists"})).await;
        // A rejected client must not try to join.
        return matches!(lines.next_line().await, Ok(None) | Err(_));
    }

    send(&mut writer, json!({"type": "event_player_leaderboard_entry_start"})).await;

    if script == Script::RegisterOnly {
        return matches!(lines.next_line().await, Ok(None) | Err(_));
    }

    match lines.next_line().await {
        Ok(Some(line)) if line == r#"{"action":"join"}"# => {}
        _ => return false,
    }

    if script == Script::StallAfterJoin {
        // Hold the socket until the client gives up.
        let _ = lines.next_line().await;
        return true;
    }

    send(&mut writer, bet_turn("someone-else", 900)).await;
    send(&mut writer, bet_turn(&username, 100)).await;
    match lines.next_line().await {
        Ok(Some(line)) if line == r#"{"action":"bet","amount":100}"# => {}
        _ => return false,
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    send(&mut writer, json!({"code": 500, "message": "slow down"})).await;
    send(&mut writer, json!({"type": "event_pot_won", "event": {"amount": 200}})).await;
    send(&mut writer, bet_turn(&username, 40)).await;
    match lines.next_line().await {
        Ok(Some(line)) if line == r#"{"action":"bet","amount":-1}"# => {}
        _ => return false,
    }

    send(
        &mut writer,
        json!({"type": "event_game_over", "game_id": "g1", "event": {"winners": [username]}}),
    )
    .await;
    true
}

fn fleet_settings(address: &str, players: u64, max_concurrency: usize) -> FleetSettings {
    FleetSettings {
        players,
        first_id: 0,
        max_concurrency,
        username_prefix: "bot".to_string(),
        password_prefix: "secret".to_string(),
        progress_every: 10,
        session: SessionSettings {
            address: address.to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            activity_timeout: Duration::from_secs(10),
            register_only: false,
        },
    }
}

#[tokio::test]
async fn test_fleet_plays_full_games_within_bound() {
    let server = MockGameServer::start(Script::FullGame).await;
    let counters = Arc::new(FleetCounters::new());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let report = run_fleet(
        fleet_settings(&server.address, 30, 4),
        counters.clone(),
        stop_rx,
    )
    .await;

    assert_eq!(report.launched, 30);
    assert_eq!(report.completed, 30);
    assert_eq!(report.panicked, 0);
    assert!(report.peak_active <= 4, "peak {} exceeds bound", report.peak_active);
    assert!(report.peak_active > 1);
    assert_eq!(report.outcomes.registration_failed, 6);
    assert_eq!(report.outcomes.game_over, 24);
    assert_eq!(report.outcomes.total(), 30);

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.successful_registrations, 24);
    assert_eq!(snapshot.failed_registrations, 6);
    assert_eq!(snapshot.registrations_attempted(), 30);
    assert_eq!(snapshot.games_joined, 24);
    assert_eq!(snapshot.all_ins, 24);
    assert_eq!(snapshot.folds, 24);

    assert_eq!(server.connections(), 30);
    assert_eq!(server.violations(), 0);
}

#[tokio::test]
async fn test_bound_of_one_runs_sessions_one_at_a_time() {
    let server = MockGameServer::start(Script::FullGame).await;
    let counters = Arc::new(FleetCounters::new());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let mut settings = fleet_settings(&server.address, 6, 1);
    settings.first_id = 1;
    let report = run_fleet(settings, counters.clone(), stop_rx).await;

    assert_eq!(report.peak_active, 1);
    // Ids 1..=6 contain one rejected player, id 5.
    assert_eq!(counters.snapshot().failed_registrations, 1);
    assert_eq!(counters.snapshot().successful_registrations, 5);
    assert_eq!(server.violations(), 0);
}

#[tokio::test]
async fn test_register_only_fleet_never_joins() {
    let server = MockGameServer::start(Script::RegisterOnly).await;
    let counters = Arc::new(FleetCounters::new());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let mut settings = fleet_settings(&server.address, 12, 3);
    settings.session.register_only = true;
    let report = run_fleet(settings, counters.clone(), stop_rx).await;

    assert_eq!(report.outcomes.registered, 12);
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.successful_registrations, 12);
    assert_eq!(snapshot.games_joined, 0);

    // Give the server a moment to observe the last hang-ups.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.violations(), 0);
}

#[tokio::test]
async fn test_silent_server_times_out_every_registration() {
    let server = MockGameServer::start(Script::Silent).await;
    let counters = Arc::new(FleetCounters::new());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let mut settings = fleet_settings(&server.address, 5, 5);
    settings.session.io_timeout = Duration::from_millis(100);
    let report = run_fleet(settings, counters.clone(), stop_rx).await;

    assert_eq!(report.outcomes.registration_failed, 5);
    assert_eq!(counters.snapshot().failed_registrations, 5);
    assert_eq!(counters.snapshot().games_joined, 0);
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stalled_games_end_at_activity_timeout() {
    let server = MockGameServer::start(Script::StallAfterJoin).await;
    let counters = Arc::new(FleetCounters::new());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let mut settings = fleet_settings(&server.address, 4, 4);
    settings.session.activity_timeout = Duration::from_millis(200);
    let report = run_fleet(settings, counters.clone(), stop_rx).await;

    assert_eq!(report.outcomes.activity_timeout, 4);
    assert_eq!(counters.snapshot().games_joined, 4);
    assert_eq!(counters.snapshot().all_ins, 0);
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stop_signal_joins_in_flight_sessions() {
    let server = MockGameServer::start(Script::StallAfterJoin).await;
    let counters = Arc::new(FleetCounters::new());
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut settings = fleet_settings(&server.address, 1000, 2);
    settings.session.activity_timeout = Duration::from_millis(300);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop_tx.send(true);
    });
    let report = run_fleet(settings, counters.clone(), stop_rx).await;

    assert!(report.interrupted);
    assert!(report.launched < 1000);
    assert_eq!(report.completed, report.launched);
    assert_eq!(
        counters.snapshot().registrations_attempted(),
        report.launched
    );
}
