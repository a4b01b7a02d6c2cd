use crate::counters::Counters;
use crate::protocol::{decode, encode, Action, ProtocolError, Request, Response, ServerEvent};
use crate::transport::{Connection, TransportError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

// --- Session State ---

/// Lifecycle of one simulated player. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Registering,
    Joining,
    Interacting,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Registering => write!(f, "Registering"),
            SessionState::Joining => write!(f, "Joining"),
            SessionState::Interacting => write!(f, "Interacting"),
            SessionState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Deterministic credentials for session `id`.
    pub fn derive(id: u64, username_prefix: &str, password_prefix: &str) -> Self {
        Self {
            username: format!("{}{}", username_prefix, id),
            password: format!("{}{}", password_prefix, id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub address: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Longest time a session may spend in [`SessionState::Interacting`].
    pub activity_timeout: Duration,
    /// Stop after the registration verdict instead of joining a game.
    pub register_only: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Registration rejected: code {code}, message: {message}")]
    Rejected { code: i64, message: String },
    #[error("Unexpected registration response: type '{kind}'")]
    UnexpectedResponse { kind: String },
}

/// Why an interacting session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    GameOver,
    LeaderboardEntryEnd,
    ActivityTimeout,
    /// Read failure, EOF, per-read timeout or undecodable line.
    ConnectionLost,
    SendFailed,
}

/// Terminal outcome of a session, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    ConnectFailed,
    RegistrationFailed,
    /// Registered in register-only mode.
    Registered,
    JoinFailed,
    Finished(EndReason),
}

// --- Betting ---

/// One maximal bet, then fold at every later decision point.
///
/// A fold forced by a non-positive stack does not count as the all-in, so the
/// next turn with chips still bets everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllInPolicy {
    all_in: bool,
}

impl AllInPolicy {
    pub fn has_gone_all_in(&self) -> bool {
        self.all_in
    }

    pub fn choose(&self, chips: i64) -> Action {
        if self.all_in {
            return Action::Fold;
        }
        match u64::try_from(chips) {
            Ok(stack) if stack > 0 => Action::Bet(stack),
            _ => Action::Fold,
        }
    }

    /// Record an action the server has accepted for delivery.
    pub fn commit(&mut self, action: Action) {
        if let Action::Bet(_) = action {
            self.all_in = true;
        }
    }
}

// --- Session ---

/// A connected player session, starting in [`SessionState::Registering`].
pub struct PlayerSession<S> {
    credentials: Credentials,
    conn: Connection<S>,
    state: SessionState,
    policy: AllInPolicy,
    activity_timeout: Duration,
    register_only: bool,
}

impl<S> PlayerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(credentials: Credentials, conn: Connection<S>, settings: &SessionSettings) -> Self {
        Self {
            credentials,
            conn,
            state: SessionState::Registering,
            policy: AllInPolicy::default(),
            activity_timeout: settings.activity_timeout,
            register_only: settings.register_only,
        }
    }

    pub fn has_gone_all_in(&self) -> bool {
        self.policy.has_gone_all_in()
    }

    /// Drive the session to [`SessionState::Terminated`] and release the
    /// connection.
    pub async fn run(mut self, counters: &dyn Counters) -> SessionOutcome {
        let outcome = self.drive(counters).await;
        self.advance(SessionState::Terminated);
        self.conn.close().await;
        debug!("Session ended: {:?}", outcome);
        outcome
    }

    async fn drive(&mut self, counters: &dyn Counters) -> SessionOutcome {
        if let Err(e) = self.register().await {
            warn!("Registration failed: {}", e);
            counters.registration_failed();
            return SessionOutcome::RegistrationFailed;
        }
        counters.registration_succeeded();
        debug!("Successfully registered");

        if self.register_only {
            return SessionOutcome::Registered;
        }

        self.advance(SessionState::Joining);
        if let Err(e) = self.join().await {
            debug!("Failed to send join action: {}", e);
            return SessionOutcome::JoinFailed;
        }
        counters.game_joined();
        debug!("Sent join action, waiting for game events");

        self.advance(SessionState::Interacting);
        SessionOutcome::Finished(self.interact(counters).await)
    }

    pub async fn register(&mut self) -> Result<(), SessionError> {
        let request = Request::Registration {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
        };
        self.send(&request).await?;

        let response = self.receive().await?;
        if response.classify() == ServerEvent::LeaderboardEntryStart {
            return Ok(());
        }
        if response.code != 0 {
            return Err(SessionError::Rejected {
                code: response.code,
                message: response.message,
            });
        }
        Err(SessionError::UnexpectedResponse {
            kind: response.kind,
        })
    }

    /// Ask to be seated. The server answers asynchronously with game events.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        self.send(&Request::Action(Action::Join)).await
    }

    /// Play until a terminal event, a connection failure or the activity
    /// deadline, whichever comes first.
    pub async fn interact(&mut self, counters: &dyn Counters) -> EndReason {
        let deadline = Instant::now() + self.activity_timeout;

        loop {
            // A peer that always has a line buffered must not outlive the deadline.
            if Instant::now() >= deadline {
                debug!("Game activity timeout, ending session");
                return EndReason::ActivityTimeout;
            }

            let response = match tokio::time::timeout_at(deadline, self.receive()).await {
                Err(_) => {
                    debug!("Game activity timeout, ending session");
                    return EndReason::ActivityTimeout;
                }
                Ok(Err(e)) => {
                    debug!("Exiting game loop: {}", e);
                    return EndReason::ConnectionLost;
                }
                Ok(Ok(response)) => response,
            };

            match response.classify() {
                ServerEvent::BetTurn {
                    player_id,
                    chips,
                    stage,
                    ..
                } if player_id == self.credentials.username => {
                    debug!("My turn to bet. Stage: {}, chips: {}", stage, chips);
                    if let Err(e) = self.take_turn(chips, counters).await {
                        debug!("Failed to send bet action: {}", e);
                        return EndReason::SendFailed;
                    }
                }
                ServerEvent::GameOver => {
                    if let Some(event) = &response.event {
                        debug!("Game over event data: {}", event);
                    }
                    debug!("Received terminal event {}", response.kind);
                    return EndReason::GameOver;
                }
                ServerEvent::LeaderboardEntryEnd => {
                    debug!("Received terminal event {}", response.kind);
                    return EndReason::LeaderboardEntryEnd;
                }
                ServerEvent::BareError { code, message } => {
                    debug!("Received error from server: code {}, message: {}", code, message);
                }
                ServerEvent::Unclassified => {
                    debug!("Received message with empty type and no error code: {:?}", response);
                }
                ServerEvent::BetTurn { .. }
                | ServerEvent::LeaderboardEntryStart
                | ServerEvent::Other(_) => {}
            }
        }
    }

    async fn take_turn(&mut self, chips: i64, counters: &dyn Counters) -> Result<(), SessionError> {
        let action = self.policy.choose(chips);
        match action {
            Action::Bet(stack) => debug!("Going all-in with {} chips", stack),
            Action::Fold if self.policy.has_gone_all_in() => debug!("Already went all-in, folding"),
            Action::Fold => debug!("Chips are {}, folding instead of going all-in", chips),
            Action::Join => {}
        }

        self.send(&Request::Action(action)).await?;

        self.policy.commit(action);
        match action {
            Action::Bet(_) => counters.all_in(),
            _ => counters.fold(),
        }
        Ok(())
    }

    async fn send(&mut self, request: &Request) -> Result<(), SessionError> {
        let line = encode(request)?;
        debug!("Sending: {}", line);
        self.conn.send_line(&line).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response, SessionError> {
        let line = self.conn.read_line().await?;
        debug!("Received: {}", line.trim_end());
        Ok(decode(&line)?)
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{} cannot follow {}", next, self.state);
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

/// Run one session end to end over TCP, starting from
/// [`SessionState::Connecting`].
pub async fn run_session(
    credentials: Credentials,
    settings: &SessionSettings,
    counters: &dyn Counters,
) -> SessionOutcome {
    let span = info_span!("player", name = %credentials.username);

    async move {
        let conn = match Connection::open(
            &settings.address,
            settings.connect_timeout,
            settings.io_timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Error dialing server: {}", e);
                counters.registration_failed();
                return SessionOutcome::ConnectFailed;
            }
        };

        PlayerSession::new(credentials, conn, settings)
            .run(counters)
            .await
    }
    .instrument(span)
    .await
}
