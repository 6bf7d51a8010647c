//! Inbound client commands.
//!
//! Clients drive the stream with `{"type": "start" | "stop" | "ping", ...}`
//! frames. `start` carries the session key and task input; a `start` with an
//! existing key and *empty* input is the reconnection form ("attach to the
//! existing stream, replay history"). `stop` and `ping` carry no payload.

use serde::{Deserialize, Serialize};

/// A command received from a client connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a new generation, or attach to an existing stream when the
    /// input is empty.
    Start {
        /// The session this stream belongs to.
        session_key: String,
        /// The user's query; empty on reconnect.
        #[serde(default)]
        input: String,
        /// Attached file references; empty on reconnect.
        #[serde(default)]
        files: Vec<String>,
    },
    /// Cancel the caller's current job.
    Stop,
    /// Liveness check; answered with a low-priority `pong`.
    Ping,
}

impl ClientCommand {
    /// Parse a wire frame into a command.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether this is a reconnection-style `start` (no new query, no
    /// files), meaning "attach to the existing stream" rather than
    /// launching a new task.
    #[must_use]
    pub fn is_attach(&self) -> bool {
        matches!(
            self,
            Self::Start { input, files, .. } if input.trim().is_empty() && files.is_empty()
        )
    }
}
