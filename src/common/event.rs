//! Controller events
//!
//! Controllers emit events over a broadcast channel; the orchestrator is
//! the primary consumer but never the assumed-only one.

use super::types::RouteTally;

/// Event emitted by a router controller.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Connected and initial dump received
    Connected,
    /// Socket closed (gracefully or not)
    Disconnected,
    /// About to start reconnect attempt `n`
    Reconnecting(u32),
    /// Crosspoints changed (solicited or tally)
    RoutingChanged(Vec<RouteTally>),
    InputLabelsChanged,
    OutputLabelsChanged,
    LocksChanged,
    /// Any mirror change (coarse-grained companion to the above)
    StateUpdated,
    /// Non-fatal error, by kind name
    Error(String),
}
