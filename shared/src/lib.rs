//! Wire types, line codec and connection framing shared by the relay server
//! and client.
//!
//! Every message is a single JSON object terminated by `\n`. Clients send
//! `state` records, the server answers with `batch` records holding the
//! latest state of every known participant.

pub mod error;
pub mod framing;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

pub use error::{DecodeError, EncodeError, FrameError, RelayError};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// One participant's latest self-reported kinematic state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateMessage {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub ang: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
}

impl StateMessage {
    pub fn new(id: impl Into<String>, x: f64, y: f64, ang: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            ang,
            vx: None,
            vy: None,
        }
    }

    pub fn with_velocity(mut self, vx: f64, vy: f64) -> Self {
        self.vx = Some(vx);
        self.vy = Some(vy);
        self
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.ang.is_finite()
            && self.vx.map_or(true, f64::is_finite)
            && self.vy.map_or(true, f64::is_finite)
    }
}

/// Server-to-client fan-out of the latest state per participant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct BatchMessage {
    #[serde(serialize_with = "serialize_tagged_states")]
    pub messages: Vec<StateMessage>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    State(StateMessage),
    Batch(BatchMessage),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedState<'a> {
    State(&'a StateMessage),
}

// Nested batch entries carry their own `"type":"state"` tag on the wire.
#[allow(clippy::ptr_arg)]
fn serialize_tagged_states<S: Serializer>(
    states: &Vec<StateMessage>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(states.iter().map(TaggedState::State))
}

/// Encodes a message as one line of JSON terminated by `\n`.
pub fn encode(message: &WireMessage) -> Result<Bytes, EncodeError> {
    let finite = match message {
        WireMessage::State(state) => state.is_finite(),
        WireMessage::Batch(batch) => batch.messages.iter().all(StateMessage::is_finite),
    };
    if !finite {
        return Err(EncodeError::NonFinite);
    }

    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decodes a single line, with or without its line terminator.
pub fn decode(line: &[u8]) -> Result<WireMessage, DecodeError> {
    let text = std::str::from_utf8(line)?.trim();
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_str(text)?)
}
