//! Blackmagic VideoHub protocol
//!
//! Newline-terminated ASCII. Messages are blocks: a section header ending
//! in `:`, one `index value` row per line, then a blank line. `ACK`/`NAK`
//! (followed by a blank line) acknowledge the preceding request. The
//! device talks first, sending the preamble and a full state dump.
//!
//! This module carries both directions of the dialect: the client codec
//! used by the controller, and the block/dump encoders used by the
//! northbound bridge, which re-exports the same protocol.

use bytes::BytesMut;

use crate::common::{LockState, Result, RouteTally};
use crate::error::Error;

use super::{AckMode, Command, Update, WireCodec};

pub const PREAMBLE_VERSION: &str = "2.8";

pub const SECTION_PREAMBLE: &str = "PROTOCOL PREAMBLE:";
pub const SECTION_DEVICE: &str = "VIDEOHUB DEVICE:";
pub const SECTION_INPUT_LABELS: &str = "INPUT LABELS:";
pub const SECTION_OUTPUT_LABELS: &str = "OUTPUT LABELS:";
pub const SECTION_ROUTING: &str = "VIDEO OUTPUT ROUTING:";
pub const SECTION_LOCKS: &str = "VIDEO OUTPUT LOCKS:";
pub const SECTION_PING: &str = "PING:";

pub const ACK: &str = "ACK\n\n";
pub const NAK: &str = "NAK\n\n";

// ============================================================================
// Block scanner
// ============================================================================

/// One blank-line-terminated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Section header, including the trailing `:` (or `ACK`/`NAK`)
    pub header: String,
    pub rows: Vec<String>,
}

/// Incremental scanner for the block grammar.
///
/// Shared by the controller-side codec and the bridge's client sessions;
/// only the interpretation of the blocks differs between the two.
#[derive(Debug, Default)]
pub struct BlockScanner {
    buffer: BytesMut,
    header: Option<String>,
    rows: Vec<String>,
}

impl BlockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every block completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Block> {
        self.buffer.extend_from_slice(bytes);
        let mut blocks = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(header) = self.header.take() {
                    blocks.push(Block {
                        header,
                        rows: std::mem::take(&mut self.rows),
                    });
                }
                // Stray blank lines between blocks are ignored.
                continue;
            }

            match &self.header {
                None => {
                    self.header = Some(line.to_string());
                }
                Some(_) => self.rows.push(line.to_string()),
            }
        }

        blocks
    }
}

// ============================================================================
// Client codec
// ============================================================================

/// Controller-side VideoHub codec
pub struct VideoHubCodec {
    scanner: BlockScanner,
    /// Routing is the last section needed before the mirror is usable;
    /// the first routing block completes the initial dump.
    saw_routing: bool,
}

impl VideoHubCodec {
    pub fn new() -> Self {
        Self {
            scanner: BlockScanner::new(),
            saw_routing: false,
        }
    }

    fn decode_block(&mut self, block: Block) -> Result<Vec<Update>> {
        let mut updates = Vec::new();

        match block.header.as_str() {
            "ACK" => updates.push(Update::Ack),
            "NAK" => updates.push(Update::Nak),
            SECTION_PREAMBLE => {
                let version = find_field(&block.rows, "Version:").unwrap_or_default();
                updates.push(Update::Preamble { version });
            }
            SECTION_DEVICE => {
                let inputs = parse_field(&block.rows, "Video inputs:")?;
                let outputs = parse_field(&block.rows, "Video outputs:")?;
                updates.push(Update::Dimensions { inputs, outputs });
            }
            SECTION_INPUT_LABELS => {
                updates.push(Update::InputLabels(parse_label_rows(&block.rows)?));
            }
            SECTION_OUTPUT_LABELS => {
                updates.push(Update::OutputLabels(parse_label_rows(&block.rows)?));
            }
            SECTION_ROUTING => {
                let mut tallies = Vec::with_capacity(block.rows.len());
                for row in &block.rows {
                    let (output, input) = parse_index_pair(row)?;
                    tallies.push(RouteTally::new(output, input));
                }
                updates.push(Update::Routing(tallies));
                if !self.saw_routing {
                    self.saw_routing = true;
                    updates.push(Update::DumpComplete);
                }
            }
            SECTION_LOCKS => {
                let mut locks = Vec::with_capacity(block.rows.len());
                for row in &block.rows {
                    let (output, value) = split_row(row)?;
                    let state = value
                        .chars()
                        .next()
                        .and_then(LockState::from_char)
                        .ok_or_else(|| {
                            Error::Protocol(format!("bad lock state in row: {}", row))
                        })?;
                    locks.push((output, state));
                }
                updates.push(Update::Locks(locks));
            }
            // Sections we do not track (e.g. VIDEO INPUT STATUS) are skipped.
            _ => {}
        }

        Ok(updates)
    }
}

impl Default for VideoHubCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for VideoHubCodec {
    fn name(&self) -> &'static str {
        "videohub"
    }

    fn greeting(&mut self) -> Vec<u8> {
        // The device talks first; there is nothing to send.
        self.saw_routing = false;
        Vec::new()
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Update>> {
        let mut updates = Vec::new();
        for block in self.scanner.feed(bytes) {
            updates.extend(self.decode_block(block)?);
        }
        Ok(updates)
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        let text = match command {
            // The device dumps unprompted on connect; a PING nudges a
            // reply without changing anything.
            Command::InterrogateAll => format!("{}\n\n", SECTION_PING),
            Command::SetRoute { output, input, .. } => {
                format!("{}\n{} {}\n\n", SECTION_ROUTING, output, input)
            }
            Command::SetInputLabel { index, text } => {
                format!("{}\n{} {}\n\n", SECTION_INPUT_LABELS, index, text)
            }
            Command::SetOutputLabel { index, text } => {
                format!("{}\n{} {}\n\n", SECTION_OUTPUT_LABELS, index, text)
            }
            Command::SetLock { output, state } => {
                format!("{}\n{} {}\n\n", SECTION_LOCKS, output, state.as_char())
            }
            Command::Ping => format!("{}\n\n", SECTION_PING),
        };
        Ok(text.into_bytes())
    }

    fn ack_mode(&self, _command: &Command) -> AckMode {
        AckMode::Explicit
    }
}

// ============================================================================
// Server-side encoding (used by the northbound bridge)
// ============================================================================

/// Preamble block sent to every new client.
pub fn encode_preamble() -> String {
    format!("{}\nVersion: {}\n\n", SECTION_PREAMBLE, PREAMBLE_VERSION)
}

/// Device block advertising the matrix dimensions.
pub fn encode_device(name: &str, inputs: u16, outputs: u16) -> String {
    format!(
        "{}\nDevice present: true\nModel name: {}\nVideo inputs: {}\nVideo outputs: {}\n\n",
        SECTION_DEVICE, name, inputs, outputs
    )
}

/// A section block from `index value` rows.
pub fn encode_rows(header: &str, rows: &[(u16, String)]) -> String {
    let mut out = String::from(header);
    out.push('\n');
    for (index, value) in rows {
        out.push_str(&format!("{} {}\n", index, value));
    }
    out.push('\n');
    out
}

// ============================================================================
// Row parsing helpers
// ============================================================================

fn split_row(row: &str) -> Result<(u16, &str)> {
    let mut parts = row.splitn(2, ' ');
    let index = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad index in row: {}", row)))?;
    Ok((index, parts.next().unwrap_or("").trim()))
}

fn parse_index_pair(row: &str) -> Result<(u16, u16)> {
    let (index, rest) = split_row(row)?;
    let value = rest
        .parse()
        .map_err(|_| Error::Protocol(format!("bad value in row: {}", row)))?;
    Ok((index, value))
}

fn parse_label_rows(rows: &[String]) -> Result<Vec<(u16, String)>> {
    rows.iter()
        .map(|row| split_row(row).map(|(i, text)| (i, text.to_string())))
        .collect()
}

fn find_field(rows: &[String], key: &str) -> Option<String> {
    rows.iter()
        .find_map(|r| r.strip_prefix(key).map(|v| v.trim().to_string()))
}

fn parse_field(rows: &[String], key: &str) -> Result<u16> {
    find_field(rows, key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing field: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LockCommand;

    const DUMP: &str = "PROTOCOL PREAMBLE:\nVersion: 2.8\n\n\
        VIDEOHUB DEVICE:\nDevice present: true\nModel name: Smart Videohub\n\
        Video inputs: 8\nVideo outputs: 8\n\n\
        INPUT LABELS:\n0 Cam 1\n1 Cam 2\n\n\
        OUTPUT LABELS:\n0 Monitor\n\n\
        VIDEO OUTPUT ROUTING:\n0 3\n1 0\n\n\
        VIDEO OUTPUT LOCKS:\n0 U\n1 L\n\n";

    #[test]
    fn test_full_dump() {
        let mut codec = VideoHubCodec::new();
        let updates = codec.feed(DUMP.as_bytes()).unwrap();

        assert!(updates.contains(&Update::Preamble {
            version: "2.8".to_string()
        }));
        assert!(updates.contains(&Update::Dimensions {
            inputs: 8,
            outputs: 8
        }));
        assert!(updates.contains(&Update::Routing(vec![
            RouteTally::new(0, 3),
            RouteTally::new(1, 0),
        ])));
        assert!(updates.contains(&Update::Locks(vec![
            (0, LockState::Unlocked),
            (1, LockState::Locked),
        ])));
        assert!(updates.contains(&Update::DumpComplete));
    }

    #[test]
    fn test_dump_complete_emitted_once() {
        let mut codec = VideoHubCodec::new();
        let updates = codec.feed(DUMP.as_bytes()).unwrap();
        assert_eq!(
            updates.iter().filter(|u| **u == Update::DumpComplete).count(),
            1
        );
        let updates = codec
            .feed(b"VIDEO OUTPUT ROUTING:\n2 5\n\n")
            .unwrap();
        assert_eq!(
            updates,
            vec![Update::Routing(vec![RouteTally::new(2, 5)])]
        );
    }

    #[test]
    fn test_split_feed_carries_tail() {
        let mut codec = VideoHubCodec::new();
        let (head, tail) = DUMP.split_at(37);
        let mut updates = codec.feed(head.as_bytes()).unwrap();
        updates.extend(codec.feed(tail.as_bytes()).unwrap());
        assert!(updates.contains(&Update::Dimensions {
            inputs: 8,
            outputs: 8
        }));
        assert!(updates.contains(&Update::DumpComplete));
    }

    #[test]
    fn test_ack_nak() {
        let mut codec = VideoHubCodec::new();
        assert_eq!(codec.feed(b"ACK\n\n").unwrap(), vec![Update::Ack]);
        assert_eq!(codec.feed(b"NAK\n\n").unwrap(), vec![Update::Nak]);
    }

    #[test]
    fn test_encode_route() {
        let codec = VideoHubCodec::new();
        let bytes = codec
            .encode(&Command::SetRoute {
                output: 2,
                input: 7,
                level: 0,
            })
            .unwrap();
        assert_eq!(bytes, b"VIDEO OUTPUT ROUTING:\n2 7\n\n");
    }

    #[test]
    fn test_encode_lock() {
        let codec = VideoHubCodec::new();
        let bytes = codec
            .encode(&Command::SetLock {
                output: 4,
                state: LockCommand::Force,
            })
            .unwrap();
        assert_eq!(bytes, b"VIDEO OUTPUT LOCKS:\n4 F\n\n");
    }

    #[test]
    fn test_label_with_spaces() {
        let mut codec = VideoHubCodec::new();
        let updates = codec.feed(b"INPUT LABELS:\n3 VTR play out 2\n\n").unwrap();
        assert_eq!(
            updates,
            vec![Update::InputLabels(vec![(3, "VTR play out 2".to_string())])]
        );
    }

    #[test]
    fn test_unknown_section_ignored() {
        let mut codec = VideoHubCodec::new();
        let updates = codec.feed(b"VIDEO INPUT STATUS:\n0 BNC\n\n").unwrap();
        assert!(updates.is_empty());
    }
}
