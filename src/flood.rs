use crate::counters::Counters;
use crate::harness::wait_for_stop;
use crate::protocol::null_as_default;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum FloodError {
    #[error("Invalid target URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("Unsupported URL scheme in '{0}', only http is supported")]
    UnsupportedScheme(String),
    #[error("Failed to build request: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("Request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("Failed to read response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Received status {0}")]
    Status(u16),
    #[error("Failed to decode game list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Game list is empty")]
    NoGames,
    #[error("Could not find player {player_id} in any game after {attempts} attempts")]
    PlayerNotFound { player_id: String, attempts: u32 },
}

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

fn parse_http_uri(url: &str) -> Result<Uri, FloodError> {
    let uri: Uri = url.parse().map_err(|source| FloodError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    if uri.scheme_str() != Some("http") || uri.authority().is_none() {
        return Err(FloodError::UnsupportedScheme(url.to_string()));
    }
    Ok(uri)
}

/// Result of one request that reached the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    /// The target answered with something other than 200.
    Rejected(u16),
}

/// One stateless request against a fixed target.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = Result<ProbeOutcome, FloodError>> + Send;
}

/// `GET` against a fixed plain-HTTP URL over a pooled client.
#[derive(Clone)]
pub struct HttpProbe {
    client: HttpClient,
    uri: Uri,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, FloodError> {
        Ok(Self {
            client: http_client(),
            uri: parse_http_uri(url)?,
            request_timeout,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    async fn get(&self) -> Result<ProbeOutcome, FloodError> {
        let request = Request::get(self.uri.clone()).body(Empty::<Bytes>::new())?;
        let response = self.client.request(request).await?;
        let status = response.status();
        // Drain the body so the pooled connection can be reused.
        response.into_body().collect().await?;

        if status == StatusCode::OK {
            Ok(ProbeOutcome::Success)
        } else {
            Ok(ProbeOutcome::Rejected(status.as_u16()))
        }
    }
}

impl Probe for HttpProbe {
    async fn probe(&self) -> Result<ProbeOutcome, FloodError> {
        tokio::time::timeout(self.request_timeout, self.get())
            .await
            .map_err(|_| FloodError::Timeout(self.request_timeout))?
    }
}

// --- Game discovery ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedPlayer {
    #[serde(default, deserialize_with = "null_as_default")]
    pub player_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chips: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedGameState {
    #[serde(default, deserialize_with = "null_as_default")]
    pub game_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub players: Vec<ListedPlayer>,
}

/// One entry of the game listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedGame {
    #[serde(default, deserialize_with = "null_as_default")]
    pub game_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub game_state: ListedGameState,
}

impl ListedGame {
    fn id(&self) -> &str {
        if self.game_id.is_empty() {
            &self.game_state.game_id
        } else {
            &self.game_id
        }
    }

    fn seats(&self, player_id: &str) -> bool {
        self.game_state
            .players
            .iter()
            .any(|player| player.player_id == player_id)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub player_id: String,
    /// Listing polls before giving up.
    pub attempts: u32,
    /// Pause between polls.
    pub delay: Duration,
}

/// Finds the game a player sits in by polling the game listing.
pub struct GameLocator {
    client: HttpClient,
    games_uri: Uri,
    request_timeout: Duration,
}

impl GameLocator {
    pub fn new(games_url: &str, request_timeout: Duration) -> Result<Self, FloodError> {
        Ok(Self {
            client: http_client(),
            games_uri: parse_http_uri(games_url)?,
            request_timeout,
        })
    }

    async fn fetch_games(&self) -> Result<Vec<ListedGame>, FloodError> {
        let request = Request::get(self.games_uri.clone()).body(Empty::<Bytes>::new())?;
        let response = self.client.request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if status != StatusCode::OK {
            return Err(FloodError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Look through the current listing once.
    pub async fn find_player_game(&self, player_id: &str) -> Result<Option<String>, FloodError> {
        let games = tokio::time::timeout(self.request_timeout, self.fetch_games())
            .await
            .map_err(|_| FloodError::Timeout(self.request_timeout))??;
        if games.is_empty() {
            return Err(FloodError::NoGames);
        }

        Ok(games
            .iter()
            .find(|game| game.seats(player_id))
            .map(|game| game.id().to_string()))
    }

    /// Poll until the player shows up or the attempts run out.
    pub async fn locate(&self, settings: &DiscoverySettings) -> Result<String, FloodError> {
        for attempt in 1..=settings.attempts {
            debug!(
                "Attempt {}/{} to find player {}",
                attempt, settings.attempts, settings.player_id
            );
            match self.find_player_game(&settings.player_id).await {
                Ok(Some(game_id)) => {
                    info!("Found player {} in game {}", settings.player_id, game_id);
                    return Ok(game_id);
                }
                Ok(None) => info!(
                    "Player {} not in current game list ({}/{})",
                    settings.player_id, attempt, settings.attempts
                ),
                Err(e) => warn!("Error during attempt {} to find player's game: {}", attempt, e),
            }

            if attempt < settings.attempts {
                tokio::time::sleep(settings.delay).await;
            }
        }

        Err(FloodError::PlayerNotFound {
            player_id: settings.player_id.clone(),
            attempts: settings.attempts,
        })
    }
}

/// URL of one game under the listing URL.
pub fn game_url(games_url: &str, game_id: &str) -> String {
    format!("{}/{}", games_url.trim_end_matches('/'), game_id)
}

/// The URL to flood: `http_url` itself, or the game the configured player
/// sits in when discovery is enabled.
pub async fn resolve_target(
    http_url: &str,
    discovery: Option<&DiscoverySettings>,
    request_timeout: Duration,
) -> Result<String, FloodError> {
    let Some(settings) = discovery else {
        return Ok(http_url.to_string());
    };

    let game_id = GameLocator::new(http_url, request_timeout)?
        .locate(settings)
        .await?;
    Ok(game_url(http_url, &game_id))
}

// --- Flood ---

#[derive(Debug, Clone)]
pub struct FloodSettings {
    pub workers: usize,
    /// Wall-clock length of the run.
    pub duration: Duration,
    /// Pause after a failed request before the next one.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FloodReport {
    pub workers: usize,
    pub panicked: u64,
    /// The stop signal fired before the deadline.
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl fmt::Display for FloodReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Duration: {:?}", self.elapsed)?;
        writeln!(f, "Workers: {}", self.workers)?;
        write!(f, "Workers panicked: {}", self.panicked)?;
        if self.interrupted {
            write!(f, "\nRun interrupted before the deadline")?;
        }
        Ok(())
    }
}

async fn flood_worker<P: Probe>(
    probe: Arc<P>,
    counters: Arc<dyn Counters>,
    stop: watch::Receiver<bool>,
    retry_delay: Duration,
) {
    let mut sent = 0u64;

    while !*stop.borrow() {
        counters.request_sent();
        sent += 1;

        match probe.probe().await {
            Ok(ProbeOutcome::Success) => counters.request_succeeded(),
            Ok(ProbeOutcome::Rejected(status)) => {
                debug!("Target answered {}", status);
                counters.request_failed();
            }
            Err(e) => {
                debug!("Request error: {}", e);
                counters.request_failed();
                tokio::time::sleep(retry_delay).await;
            }
        }

        // A probe that never suspends must not starve the coordinator.
        tokio::task::yield_now().await;
    }

    debug!("Worker stopping after {} requests", sent);
}

/// Run `settings.workers` probe loops until `settings.duration` elapses or
/// `stop` fires, then wait for every worker to finish its in-flight request.
pub async fn run_flood<P: Probe>(
    probe: Arc<P>,
    settings: FloodSettings,
    counters: Arc<dyn Counters>,
    mut stop: watch::Receiver<bool>,
) -> FloodReport {
    let started = Instant::now();
    let (halt_tx, halt_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut report = FloodReport {
        workers: settings.workers,
        ..Default::default()
    };

    info!(
        "Starting {} workers for {:?}",
        settings.workers, settings.duration
    );

    for worker in 0..settings.workers {
        let span = info_span!("worker", id = worker);
        tasks.spawn(
            flood_worker(
                Arc::clone(&probe),
                Arc::clone(&counters),
                halt_rx.clone(),
                settings.retry_delay,
            )
            .instrument(span),
        );
    }

    tokio::select! {
        _ = tokio::time::sleep(settings.duration) => {
            info!("Flood duration ended, waiting for workers to finish");
        }
        _ = wait_for_stop(&mut stop) => {
            report.interrupted = true;
            warn!("Stop requested, waiting for workers to finish");
        }
    }

    // Receivers are held by the workers, so the send cannot fail while any
    // worker is still running.
    let _ = halt_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            report.panicked += 1;
            error!("Flood worker failed: {}", e);
        }
    }

    report.elapsed = started.elapsed();
    info!("Flood finished in {:?}", report.elapsed);
    report
}
