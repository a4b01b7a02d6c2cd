use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

// --- Event names ---
pub const EVENT_LEADERBOARD_ENTRY_START: &str = "event_player_leaderboard_entry_start";
pub const EVENT_LEADERBOARD_ENTRY_END: &str = "event_player_leaderboard_entry_end";
pub const EVENT_GAME_OVER: &str = "event_game_over";
pub const ACTION_PLAYER_BET: &str = "action_player_bet";

/// Amount the server interprets as a fold.
pub const FOLD_AMOUNT: i64 = -1;

const MAX_QUOTED_LINE: usize = 256;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode '{line}': {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

// --- Client to Server Messages ---

/// Player action inside a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Join,
    /// Bet of a strictly positive chip count.
    Bet(u64),
    Fold,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Join => "join",
            Action::Bet(_) | Action::Fold => "bet",
        }
    }

    pub fn amount(&self) -> Option<i64> {
        match self {
            Action::Join => None,
            Action::Bet(chips) => Some(i64::try_from(*chips).unwrap_or(i64::MAX)),
            Action::Fold => Some(FOLD_AMOUNT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Registration { username: String, password: String },
    Action(Action),
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireRequest<'a> {
    Registration {
        username: &'a str,
        password: &'a str,
    },
    Action {
        action: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        amount: Option<i64>,
    },
}

impl<'a> From<&'a Request> for WireRequest<'a> {
    fn from(request: &'a Request) -> Self {
        match request {
            Request::Registration { username, password } => WireRequest::Registration {
                username,
                password,
            },
            Request::Action(action) => WireRequest::Action {
                action: action.name(),
                amount: action.amount(),
            },
        }
    }
}

/// Encode a request as one JSON line, without the trailing newline.
pub fn encode(request: &Request) -> Result<String, ProtocolError> {
    serde_json::to_string(&WireRequest::from(request)).map_err(ProtocolError::Encode)
}

// --- Server to Client Messages ---

/// Every field the server may send. Absent or `null` fields decode to their
/// zero value and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub game_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stage: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: TurnState,
    #[serde(default, deserialize_with = "null_as_default")]
    pub minimum_bet: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnState {
    #[serde(default, deserialize_with = "null_as_default")]
    pub player: PlayerSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlayerSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub player_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chips: i64,
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// What a decoded response means to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent<'a> {
    LeaderboardEntryStart,
    LeaderboardEntryEnd,
    GameOver,
    BetTurn {
        player_id: &'a str,
        chips: i64,
        stage: &'a str,
        minimum_bet: i64,
    },
    /// Empty `type` with a non-zero `code`.
    BareError { code: i64, message: &'a str },
    /// Empty `type` and zero `code`.
    Unclassified,
    Other(&'a str),
}

impl Response {
    pub fn classify(&self) -> ServerEvent<'_> {
        match self.kind.as_str() {
            "" if self.code != 0 => ServerEvent::BareError {
                code: self.code,
                message: &self.message,
            },
            "" => ServerEvent::Unclassified,
            EVENT_LEADERBOARD_ENTRY_START => ServerEvent::LeaderboardEntryStart,
            EVENT_LEADERBOARD_ENTRY_END => ServerEvent::LeaderboardEntryEnd,
            EVENT_GAME_OVER => ServerEvent::GameOver,
            ACTION_PLAYER_BET => ServerEvent::BetTurn {
                player_id: &self.state.player.player_id,
                chips: self.state.player.chips,
                stage: &self.stage,
                minimum_bet: self.minimum_bet,
            },
            other => ServerEvent::Other(other),
        }
    }
}

/// Decode one line received from the server. A bare `null` is an envelope
/// with every field at its zero value.
pub fn decode(line: &str) -> Result<Response, ProtocolError> {
    let line = line.trim();
    serde_json::from_str::<Option<Response>>(line)
        .map(Option::unwrap_or_default)
        .map_err(|source| ProtocolError::Decode {
            line: quote(line),
            source,
        })
}

fn quote(line: &str) -> String {
    match line.char_indices().nth(MAX_QUOTED_LINE) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}
