//! SW-P-08 protocol (Pro-Bel / Snell general switcher protocol)
//!
//! Binary frames delimited by DLE/STX ... DLE/ETX with DLE byte-stuffing.
//! Payload layout: `CMD DATA... BTC CHK` where BTC is the data byte count
//! and CHK the two's-complement of the byte sum. Ports are 0-based; above
//! 127 the extended message variants (CMD | 0x80) carry each port as a
//! (high, low) pair of 7-bit bytes.
//!
//! The protocol has no wire-level size discovery; dimensions come from
//! configuration and the codec interrogates every output at connect. A
//! crosspoint connect is acknowledged by the echoed tally (the interlock
//! reply). Label and lock writes do not exist on this protocol and are
//! completed locally as best-effort.

use std::collections::HashSet;

use crate::common::{Result, RouteTally};
use crate::error::Error;

use super::{AckMode, Command, Update, WireCodec};

const DLE: u8 = 0x10;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;

const CMD_INTERROGATE: u8 = 0x01;
const CMD_CONNECT: u8 = 0x02;
const CMD_TALLY: u8 = 0x03;
const CMD_CONNECTED: u8 = 0x04;
const CMD_SRC_NAMES_REQUEST: u8 = 0x64;
const CMD_DEST_NAMES_REQUEST: u8 = 0x66;
const CMD_SRC_NAMES_RESPONSE: u8 = 0x6A;
const CMD_DEST_NAMES_RESPONSE: u8 = 0x6B;

/// Extended-port variant marker
const EXTENDED: u8 = 0x80;

/// Largest port expressible in the single-byte form
const MAX_SHORT_PORT: u16 = 127;

/// SW-P-08 codec
pub struct SwP08Codec {
    /// Matrix dimensions from configuration (no wire discovery)
    inputs: u16,
    outputs: u16,
    /// Dimensions queued for emission on the next feed
    pending_dimensions: bool,
    /// Outputs not yet tallied during the initial interrogation
    dump_pending: HashSet<u16>,
    dump_active: bool,
    // Frame reassembly
    in_frame: bool,
    saw_dle: bool,
    frame: Vec<u8>,
}

impl SwP08Codec {
    pub fn new(matrix_hint: Option<(u16, u16)>) -> Self {
        let (inputs, outputs) = matrix_hint.unwrap_or((0, 0));
        Self {
            inputs,
            outputs,
            pending_dimensions: false,
            dump_pending: HashSet::new(),
            dump_active: false,
            in_frame: false,
            saw_dle: false,
            frame: Vec::new(),
        }
    }

    fn decode_payload(&mut self, payload: &[u8]) -> Result<Vec<Update>> {
        if payload.len() < 3 {
            return Err(Error::Protocol("SW-P-08 frame too short".into()));
        }

        let cmd = payload[0];
        let btc = payload[payload.len() - 2] as usize;
        let chk = payload[payload.len() - 1];
        let data = &payload[1..payload.len() - 2];

        if btc != data.len() {
            return Err(Error::Protocol(format!(
                "SW-P-08 byte count mismatch: declared {}, got {}",
                btc,
                data.len()
            )));
        }

        let sum: u8 = payload[..payload.len() - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum.wrapping_add(chk) != 0 {
            return Err(Error::Protocol("SW-P-08 checksum mismatch".into()));
        }

        let mut updates = Vec::new();
        match cmd {
            CMD_TALLY | CMD_CONNECTED => {
                if data.len() < 3 {
                    return Err(Error::Protocol("SW-P-08 tally too short".into()));
                }
                let output = data[1] as u16;
                let input = data[2] as u16;
                self.push_tally(&mut updates, output, input);
            }
            c if c == CMD_TALLY | EXTENDED || c == CMD_CONNECTED | EXTENDED => {
                if data.len() < 5 {
                    return Err(Error::Protocol("SW-P-08 extended tally too short".into()));
                }
                let output = wide_port(data[1], data[2]);
                let input = wide_port(data[3], data[4]);
                self.push_tally(&mut updates, output, input);
            }
            CMD_SRC_NAMES_RESPONSE => {
                updates.push(Update::InputLabels(decode_names(data)?));
            }
            CMD_DEST_NAMES_RESPONSE => {
                updates.push(Update::OutputLabels(decode_names(data)?));
            }
            // Requests echoed back by simple matrices are ignored.
            _ => {}
        }

        Ok(updates)
    }

    fn push_tally(&mut self, updates: &mut Vec<Update>, output: u16, input: u16) {
        updates.push(Update::Routing(vec![RouteTally::new(output, input)]));
        if self.dump_active {
            self.dump_pending.remove(&output);
            if self.dump_pending.is_empty() {
                self.dump_active = false;
                updates.push(Update::DumpComplete);
            }
        }
    }
}

impl WireCodec for SwP08Codec {
    fn name(&self) -> &'static str {
        "swp08"
    }

    fn greeting(&mut self) -> Vec<u8> {
        self.pending_dimensions = true;
        self.dump_pending = (0..self.outputs).collect();
        self.dump_active = self.outputs > 0;

        let mut bytes = Vec::new();
        for output in 0..self.outputs {
            bytes.extend(encode_frame(interrogate_payload(output, 0)));
        }
        bytes.extend(encode_frame(vec![CMD_SRC_NAMES_REQUEST]));
        bytes.extend(encode_frame(vec![CMD_DEST_NAMES_REQUEST]));
        bytes
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Update>> {
        let mut updates = Vec::new();

        if self.pending_dimensions {
            self.pending_dimensions = false;
            updates.push(Update::Dimensions {
                inputs: self.inputs,
                outputs: self.outputs,
            });
            // A zero-sized matrix has nothing to interrogate.
            if !self.dump_active {
                updates.push(Update::DumpComplete);
            }
        }

        for &byte in bytes {
            if self.saw_dle {
                self.saw_dle = false;
                match byte {
                    STX => {
                        self.in_frame = true;
                        self.frame.clear();
                    }
                    ETX => {
                        if self.in_frame {
                            self.in_frame = false;
                            let payload = std::mem::take(&mut self.frame);
                            updates.extend(self.decode_payload(&payload)?);
                        }
                    }
                    DLE => {
                        // Stuffed data byte
                        if self.in_frame {
                            self.frame.push(DLE);
                        }
                    }
                    _ => {
                        // DLE followed by anything else aborts the frame.
                        self.in_frame = false;
                    }
                }
            } else if byte == DLE {
                self.saw_dle = true;
            } else if self.in_frame {
                self.frame.push(byte);
            }
        }

        Ok(updates)
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        let bytes = match command {
            Command::InterrogateAll => {
                let mut bytes = Vec::new();
                for output in 0..self.outputs {
                    bytes.extend(encode_frame(interrogate_payload(output, 0)));
                }
                bytes
            }
            Command::SetRoute {
                output,
                input,
                level,
            } => encode_frame(connect_payload(*output, *input, *level)),
            // No label or lock write exists on SW-P-08; best-effort no-op.
            Command::SetInputLabel { .. }
            | Command::SetOutputLabel { .. }
            | Command::SetLock { .. }
            | Command::Ping => Vec::new(),
        };
        Ok(bytes)
    }

    fn ack_mode(&self, command: &Command) -> AckMode {
        match command {
            Command::SetRoute { .. } => AckMode::RouteEcho,
            _ => AckMode::Immediate,
        }
    }
}

// ============================================================================
// Frame construction
// ============================================================================

fn matrix_level(level: u8) -> u8 {
    level & 0x0F
}

fn wide_port(high: u8, low: u8) -> u16 {
    (high as u16) * 128 + (low as u16)
}

fn split_port(port: u16) -> (u8, u8) {
    ((port / 128) as u8, (port % 128) as u8)
}

fn interrogate_payload(output: u16, level: u8) -> Vec<u8> {
    if output <= MAX_SHORT_PORT {
        vec![CMD_INTERROGATE, matrix_level(level), output as u8]
    } else {
        let (hi, lo) = split_port(output);
        vec![CMD_INTERROGATE | EXTENDED, matrix_level(level), hi, lo]
    }
}

fn connect_payload(output: u16, input: u16, level: u8) -> Vec<u8> {
    if output <= MAX_SHORT_PORT && input <= MAX_SHORT_PORT {
        vec![
            CMD_CONNECT,
            matrix_level(level),
            output as u8,
            input as u8,
        ]
    } else {
        let (oh, ol) = split_port(output);
        let (ih, il) = split_port(input);
        vec![CMD_CONNECT | EXTENDED, matrix_level(level), oh, ol, ih, il]
    }
}

/// Wrap `cmd + data` with byte count, checksum, stuffing, and delimiters.
fn encode_frame(cmd_and_data: Vec<u8>) -> Vec<u8> {
    let mut payload = cmd_and_data;
    let btc = (payload.len() - 1) as u8;
    payload.push(btc);
    let sum: u8 = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    payload.push(0u8.wrapping_sub(sum));

    let mut framed = vec![DLE, STX];
    for byte in payload {
        framed.push(byte);
        if byte == DLE {
            framed.push(DLE);
        }
    }
    framed.push(DLE);
    framed.push(ETX);
    framed
}

/// Decode a simplified chunked name response:
/// `start_hi start_lo count (len bytes...)*count`
fn decode_names(data: &[u8]) -> Result<Vec<(u16, String)>> {
    if data.len() < 3 {
        return Err(Error::Protocol("SW-P-08 name response too short".into()));
    }
    let start = wide_port(data[0], data[1]);
    let count = data[2] as usize;
    let mut names = Vec::with_capacity(count);
    let mut cursor = 3;
    for i in 0..count {
        let len = *data
            .get(cursor)
            .ok_or_else(|| Error::Protocol("SW-P-08 name response truncated".into()))?
            as usize;
        cursor += 1;
        let end = cursor + len;
        let raw = data
            .get(cursor..end)
            .ok_or_else(|| Error::Protocol("SW-P-08 name response truncated".into()))?;
        names.push((
            start + i as u16,
            String::from_utf8_lossy(raw).trim().to_string(),
        ));
        cursor = end;
    }
    Ok(names)
}
