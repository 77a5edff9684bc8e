//! Wire Protocol Layer
//!
//! Responsibilities:
//! - Frame encoding/decoding for each router protocol
//! - NO IO, NO state beyond a parser buffer
//!
//! Each codec is fed raw bytes from the socket and produces zero or more
//! decoded updates, keeping any incomplete tail internally. The controller
//! owns the socket; codecs never see it.

pub mod gvnative;
pub mod swp08;
pub mod videohub;

pub use gvnative::GvNativeCodec;
pub use swp08::SwP08Codec;
pub use videohub::VideoHubCodec;

use serde::{Deserialize, Serialize};

use crate::common::{LockCommand, LockState, Result, RouteTally};
use crate::error::Error;

/// The three supported router protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    VideoHub,
    SwP08,
    GvNative,
}

impl ProtocolKind {
    /// Conventional TCP port for each protocol.
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::VideoHub => 9990,
            ProtocolKind::SwP08 => 8910,
            ProtocolKind::GvNative => 12345,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::VideoHub => "videohub",
            ProtocolKind::SwP08 => "swp08",
            ProtocolKind::GvNative => "gvnative",
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "videohub" => Ok(ProtocolKind::VideoHub),
            "swp08" | "sw-p-08" => Ok(ProtocolKind::SwP08),
            "gvnative" | "gv-native" => Ok(ProtocolKind::GvNative),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A request the controller can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask for the full state dump
    InterrogateAll,
    /// Route `input` to `output` on breakaway `level`
    SetRoute { output: u16, input: u16, level: u8 },
    SetInputLabel { index: u16, text: String },
    SetOutputLabel { index: u16, text: String },
    SetLock { output: u16, state: LockCommand },
    Ping,
}

/// A decoded message from the router.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Protocol banner (VideoHub preamble, GV hello reply)
    Preamble { version: String },
    /// Matrix dimensions
    Dimensions { inputs: u16, outputs: u16 },
    /// Crosspoint tallies, solicited or not
    Routing(Vec<RouteTally>),
    InputLabels(Vec<(u16, String)>),
    OutputLabels(Vec<(u16, String)>),
    Locks(Vec<(u16, LockState)>),
    /// Positive acknowledge of the pending request
    Ack,
    /// Negative acknowledge of the pending request
    Nak,
    /// The initial state dump is complete
    DumpComplete,
}

/// How a command is acknowledged on a given protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// An explicit ACK/NAK frame follows
    Explicit,
    /// The echoed crosspoint tally is the acknowledge
    RouteEcho,
    /// No wire acknowledge; complete as soon as written (best-effort)
    Immediate,
}

/// Unified codec trait
///
/// Implementations are sans-IO: `feed` consumes bytes as they arrive and
/// returns every update that became complete; partial frames are carried
/// over internally.
pub trait WireCodec: Send {
    /// Protocol name for logging
    fn name(&self) -> &'static str;

    /// Bytes to send immediately after the TCP connect.
    ///
    /// Takes `&mut self` because some codecs arm dump-completion tracking
    /// here.
    fn greeting(&mut self) -> Vec<u8>;

    /// Consume received bytes, producing completed updates.
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Update>>;

    /// Encode a command. An empty result means the protocol cannot express
    /// the command; the controller completes it locally (best-effort).
    fn encode(&self, command: &Command) -> Result<Vec<u8>>;

    /// How the router acknowledges this command.
    fn ack_mode(&self, command: &Command) -> AckMode;
}

/// Build a codec for a protocol.
///
/// `matrix_hint` supplies dimensions for protocols without wire-level
/// discovery (SW-P-08).
pub fn create_codec(kind: ProtocolKind, matrix_hint: Option<(u16, u16)>) -> Box<dyn WireCodec> {
    match kind {
        ProtocolKind::VideoHub => Box::new(VideoHubCodec::new()),
        ProtocolKind::SwP08 => Box::new(SwP08Codec::new(matrix_hint)),
        ProtocolKind::GvNative => Box::new(GvNativeCodec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_protocol_kind_from_str() {
        assert_eq!(
            ProtocolKind::from_str("videohub").unwrap(),
            ProtocolKind::VideoHub
        );
        assert_eq!(
            ProtocolKind::from_str("SW-P-08").unwrap(),
            ProtocolKind::SwP08
        );
        assert!(ProtocolKind::from_str("probel").is_err());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(ProtocolKind::VideoHub.default_port(), 9990);
        assert_eq!(ProtocolKind::SwP08.default_port(), 8910);
        assert_eq!(ProtocolKind::GvNative.default_port(), 12345);
    }
}
