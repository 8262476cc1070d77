//! Telemetry pushed by capture clients about the game they observe

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of event a capture client reports. The numeric values are part of the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureEventKind {
    Connection,
    Lobby,
    State,
    Player,
    GameOver,
}

impl CaptureEventKind {
    pub const ALL: [Self; 5] = [
        Self::Connection,
        Self::Lobby,
        Self::State,
        Self::Player,
        Self::GameOver,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Lobby => "lobby",
            Self::State => "state",
            Self::Player => "player",
            Self::GameOver => "gameover",
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::Connection => 0,
            Self::Lobby => 1,
            Self::State => 2,
            Self::Player => 3,
            Self::GameOver => 4,
        }
    }
}

impl fmt::Display for CaptureEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown capture event type {0:?}")]
pub struct UnknownEventKind(String);

/// Accepts either the numeric code or the name
impl FromStr for CaptureEventKind {
    type Err = UnknownEventKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.code().to_string() == raw || kind.name().eq_ignore_ascii_case(raw))
            .ok_or_else(|| UnknownEventKind(raw.to_owned()))
    }
}

impl Serialize for CaptureEventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for CaptureEventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown capture event type {}", code)))
    }
}

/// Event as stored on a connect code's event queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    #[serde(rename = "eventType")]
    pub kind: CaptureEventKind,
    pub payload: String,
}

impl CaptureEvent {
    pub fn new(kind: CaptureEventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn connection(connected: bool) -> Self {
        Self::new(CaptureEventKind::Connection, connected.to_string())
    }
}

/// Lobby details reported when a capture client sees a new game lobby
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLobby {
    #[serde(rename = "LobbyCode")]
    pub lobby_code: String,
    #[serde(rename = "Region")]
    pub region: i64,
    #[serde(rename = "Map")]
    pub map: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parses_code_or_name() {
        assert_eq!("1".parse::<CaptureEventKind>(), Ok(CaptureEventKind::Lobby));
        assert_eq!("gameover".parse::<CaptureEventKind>(), Ok(CaptureEventKind::GameOver));
        assert_eq!("GameOver".parse::<CaptureEventKind>(), Ok(CaptureEventKind::GameOver));
        assert!("7".parse::<CaptureEventKind>().is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let event = CaptureEvent::connection(true);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"eventType": 0, "payload": "true"})
        );
        let parsed: CaptureEvent =
            serde_json::from_str(r#"{"eventType": 2, "payload": "1"}"#).unwrap();
        assert_eq!(parsed.kind, CaptureEventKind::State);
        assert!(serde_json::from_str::<CaptureEvent>(r#"{"eventType": 9, "payload": ""}"#).is_err());
    }

    #[test]
    fn test_lobby_parses() {
        let lobby: GameLobby =
            serde_json::from_str(r#"{"LobbyCode": "ABCDEF", "Region": 1, "Map": 0}"#).unwrap();
        assert_eq!(lobby.lobby_code, "ABCDEF");
    }
}
