//! Mirrored router state
//!
//! Each controller maintains a live mirror of its router's matrix. The
//! mirror is a plain value type; the controller keeps it behind a lock and
//! hands out snapshots.

use std::collections::HashMap;

use super::types::{LockState, RouteTally};

/// Snapshot of one physical router's matrix state.
#[derive(Debug, Clone, Default)]
pub struct RouterState {
    /// Input count discovered on connect
    pub inputs: u16,
    /// Output count discovered on connect
    pub outputs: u16,
    /// Sparse routing table: output index -> input index. Absent = unknown.
    pub routing: HashMap<u16, u16>,
    /// Input labels by port index
    pub input_labels: HashMap<u16, String>,
    /// Output labels by port index
    pub output_labels: HashMap<u16, String>,
    /// Output lock states (VideoHub only; others stay Unlocked)
    pub locks: HashMap<u16, LockState>,
    /// Socket up and initial dump received
    pub connected: bool,
}

impl RouterState {
    /// Label for an input port, defaulting to `Input {i+1}` when absent.
    ///
    /// Absence and the default label are treated identically everywhere.
    pub fn input_label(&self, index: u16) -> String {
        self.input_labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("Input {}", index + 1))
    }

    /// Label for an output port, defaulting to `Output {i+1}` when absent.
    pub fn output_label(&self, index: u16) -> String {
        self.output_labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("Output {}", index + 1))
    }

    /// Lock state of an output, `Unlocked` when never reported.
    pub fn lock(&self, output: u16) -> LockState {
        self.locks.get(&output).copied().unwrap_or_default()
    }

    /// Input currently routed to an output, if known.
    pub fn route(&self, output: u16) -> Option<u16> {
        self.routing.get(&output).copied()
    }

    /// Apply a batch of crosspoint tallies.
    pub fn apply_routing(&mut self, tallies: &[RouteTally]) {
        for t in tallies {
            self.routing.insert(t.output, t.input);
        }
    }

    pub fn apply_input_labels(&mut self, labels: &[(u16, String)]) {
        for (index, text) in labels {
            self.input_labels.insert(*index, text.clone());
        }
    }

    pub fn apply_output_labels(&mut self, labels: &[(u16, String)]) {
        for (index, text) in labels {
            self.output_labels.insert(*index, text.clone());
        }
    }

    pub fn apply_locks(&mut self, locks: &[(u16, LockState)]) {
        for (output, state) in locks {
            self.locks.insert(*output, *state);
        }
    }

    /// Forget everything learned from the wire, keeping nothing but zeros.
    ///
    /// Used when a connection drops so a reconnect repopulates from the
    /// fresh full dump.
    pub fn clear(&mut self) {
        *self = RouterState::default();
    }
}
