//! tielink - two broadcast routers, one virtual matrix
//!
//! # Architecture (Layered)
//!
//! ```text
//! Wire protocols (VideoHub / SW-P-08 / GV Native)
//! → Controller (state mirror, reconnect, write queue)
//! → Virtual Matrix (pure projection, tie-line hiding)
//! → Tie-Line Engine (allocate / reuse / release)
//! → Orchestrator (single-writer coordination)
//! → Northbound Bridge (VideoHub re-export)
//! ```
//!
//! ## Core Principles
//!
//! - Codecs are sans-IO: bytes in, frames out, no socket in sight
//! - The projection is a pure function and never mutated in place
//! - The engine is the only owner of tie-line state; one route at a time
//! - Controllers emit events; they never know who consumes them
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/      # Core types: RouterId, RouterState, events
//! ├── protocol/    # Wire codecs for the three router protocols
//! ├── controller/  # Per-router protocol clients
//! ├── matrix/      # Virtual router projection
//! ├── engine/      # Tie-line allocator
//! ├── bridge/      # Northbound VideoHub server
//! └── app/         # Orchestrator, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod protocol;
pub mod controller;
pub mod matrix;
pub mod engine;
pub mod bridge;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{ControllerEvent, LockCommand, LockState, RouteTally, RouterId, RouterState};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::{AppEvent, Orchestrator};
pub use bridge::{BridgeServer, BridgeStatus};
pub use controller::{Controller, ControllerConfig, RouterPort};
pub use engine::{RouteOutcome, TieLineEngine, TieLineState};
pub use matrix::VirtualMatrix;
pub use protocol::ProtocolKind;
