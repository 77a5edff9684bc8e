//! GV Native protocol
//!
//! Length-prefixed binary: a big-endian u32 frame length followed by a
//! JSON payload. The payload structure is proprietary; this codec speaks
//! the operation set the controller needs (hello, interrogate, route
//! request/tally, labels). The hello reply carries matrix dimensions, and
//! an echoed route tally acknowledges a route request.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::common::{Result, RouteTally};
use crate::error::Error;

use super::{AckMode, Command, Update, WireCodec};

/// Upper bound on a single frame; anything larger is a framing error.
const MAX_FRAME_LEN: usize = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Wire messages, both directions.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum GvMessage {
    Hello,
    HelloReply {
        version: String,
        inputs: u16,
        outputs: u16,
    },
    Interrogate,
    Routing {
        tallies: Vec<GvTally>,
    },
    RouteRequest {
        output: u16,
        input: u16,
        level: u8,
    },
    RouteTally {
        output: u16,
        input: u16,
        level: u8,
    },
    InputLabels {
        labels: Vec<(u16, String)>,
    },
    OutputLabels {
        labels: Vec<(u16, String)>,
    },
    SetInputLabel {
        index: u16,
        text: String,
    },
    SetOutputLabel {
        index: u16,
        text: String,
    },
    DumpComplete,
    Ack,
    Nak,
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
struct GvTally {
    output: u16,
    input: u16,
}

/// GV Native codec
#[derive(Default)]
pub struct GvNativeCodec {
    buffer: BytesMut,
}

impl GvNativeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_message(&self, message: GvMessage) -> Option<Update> {
        match message {
            GvMessage::HelloReply {
                inputs, outputs, ..
            } => Some(Update::Dimensions { inputs, outputs }),
            GvMessage::Routing { tallies } => Some(Update::Routing(
                tallies
                    .into_iter()
                    .map(|t| RouteTally::new(t.output, t.input))
                    .collect(),
            )),
            GvMessage::RouteTally { output, input, .. } => {
                Some(Update::Routing(vec![RouteTally::new(output, input)]))
            }
            GvMessage::InputLabels { labels } => Some(Update::InputLabels(labels)),
            GvMessage::OutputLabels { labels } => Some(Update::OutputLabels(labels)),
            GvMessage::DumpComplete => Some(Update::DumpComplete),
            GvMessage::Ack => Some(Update::Ack),
            GvMessage::Nak => Some(Update::Nak),
            // Requests flowing the other way are not ours to answer.
            _ => None,
        }
    }
}

fn encode_message(message: &GvMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::Protocol(format!("GV encode failed: {}", e)))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

impl WireCodec for GvNativeCodec {
    fn name(&self) -> &'static str {
        "gvnative"
    }

    fn greeting(&mut self) -> Vec<u8> {
        let mut bytes = encode_message(&GvMessage::Hello).unwrap_or_default();
        bytes.extend(encode_message(&GvMessage::Interrogate).unwrap_or_default());
        bytes
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Update>> {
        self.buffer.extend_from_slice(bytes);
        let mut updates = Vec::new();

        loop {
            if self.buffer.len() < LENGTH_PREFIX {
                break;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(Error::Protocol(format!("GV frame too large: {}", len)));
            }
            if self.buffer.len() < LENGTH_PREFIX + len {
                break;
            }
            self.buffer.advance(LENGTH_PREFIX);
            let body = self.buffer.split_to(len);
            let message: GvMessage = serde_json::from_slice(&body)
                .map_err(|e| Error::Protocol(format!("GV decode failed: {}", e)))?;
            if let Some(update) = self.decode_message(message) {
                updates.push(update);
            }
        }

        Ok(updates)
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        let message = match command {
            Command::InterrogateAll => GvMessage::Interrogate,
            Command::SetRoute {
                output,
                input,
                level,
            } => GvMessage::RouteRequest {
                output: *output,
                input: *input,
                level: *level,
            },
            Command::SetInputLabel { index, text } => GvMessage::SetInputLabel {
                index: *index,
                text: text.clone(),
            },
            Command::SetOutputLabel { index, text } => GvMessage::SetOutputLabel {
                index: *index,
                text: text.clone(),
            },
            // No lock concept on this protocol; best-effort no-op.
            Command::SetLock { .. } => return Ok(Vec::new()),
            Command::Ping => GvMessage::Ping,
        };
        encode_message(&message)
    }

    fn ack_mode(&self, command: &Command) -> AckMode {
        match command {
            Command::SetRoute { .. } => AckMode::RouteEcho,
            Command::SetInputLabel { .. } | Command::SetOutputLabel { .. } | Command::Ping => {
                AckMode::Explicit
            }
            Command::InterrogateAll | Command::SetLock { .. } => AckMode::Immediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: &GvMessage) -> Vec<u8> {
        encode_message(message).unwrap()
    }

    #[test]
    fn test_hello_reply_yields_dimensions() {
        let mut codec = GvNativeCodec::new();
        let updates = codec
            .feed(&frame(&GvMessage::HelloReply {
                version: "1.0".to_string(),
                inputs: 32,
                outputs: 16,
            }))
            .unwrap();
        assert_eq!(
            updates,
            vec![Update::Dimensions {
                inputs: 32,
                outputs: 16
            }]
        );
    }

    #[test]
    fn test_routing_batch() {
        let mut codec = GvNativeCodec::new();
        let updates = codec
            .feed(&frame(&GvMessage::Routing {
                tallies: vec![
                    GvTally {
                        output: 0,
                        input: 3,
                    },
                    GvTally {
                        output: 1,
                        input: 4,
                    },
                ],
            }))
            .unwrap();
        assert_eq!(
            updates,
            vec![Update::Routing(vec![
                RouteTally::new(0, 3),
                RouteTally::new(1, 4),
            ])]
        );
    }

    #[test]
    fn test_split_length_prefix() {
        let bytes = frame(&GvMessage::DumpComplete);
        let mut codec = GvNativeCodec::new();
        assert!(codec.feed(&bytes[..2]).unwrap().is_empty());
        let updates = codec.feed(&bytes[2..]).unwrap();
        assert_eq!(updates, vec![Update::DumpComplete]);
    }

    #[test]
    fn test_two_frames_one_feed() {
        let mut bytes = frame(&GvMessage::Ack);
        bytes.extend(frame(&GvMessage::RouteTally {
            output: 5,
            input: 2,
            level: 0,
        }));
        let mut codec = GvNativeCodec::new();
        let updates = codec.feed(&bytes).unwrap();
        assert_eq!(
            updates,
            vec![
                Update::Ack,
                Update::Routing(vec![RouteTally::new(5, 2)]),
            ]
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = GvNativeCodec::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(u32::MAX).to_be_bytes());
        assert!(codec.feed(&bytes).is_err());
    }

    #[test]
    fn test_route_request_wire_shape() {
        let codec = GvNativeCodec::new();
        let bytes = codec
            .encode(&Command::SetRoute {
                output: 2,
                input: 7,
                level: 1,
            })
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(body["type"], "routeRequest");
        assert_eq!(body["output"], 2);
        assert_eq!(body["input"], 7);
        assert_eq!(body["level"], 1);
    }
}
