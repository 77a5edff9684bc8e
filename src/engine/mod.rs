//! Tie-Line Engine
//!
//! Responsibilities:
//! - Execute virtual routes by issuing one or two physical routes
//! - Allocate, reuse, and release tie-lines
//! - Rebuild runtime state from observed routing after reconnects
//!
//! The engine is the only component upstream code relies on for atomic
//! semantics: route-level failures come back as structured outcomes,
//! never as panics or escaped errors. All mutation happens from the
//! orchestrator dispatch, one virtual route at a time.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::common::{RouterId, RouterState};
use crate::config::{TieLineConfig, TieLinePort};
use crate::controller::RouterPort;
use crate::error::{Error, Result};
use crate::matrix::VirtualMatrix;

const STATE_CHANNEL_DEPTH: usize = 64;

/// Lifecycle of one tie-line cable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieLineStatus {
    #[default]
    Free,
    InUse,
}

/// Runtime record for one configured tie-line.
///
/// Invariant: `status == InUse` exactly when `destinations` is nonempty,
/// exactly when `source_input` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TieLine {
    pub status: TieLineStatus,
    /// Physical input on the source-side router the cable carries
    pub source_input: Option<u16>,
    /// Physical outputs on the destination-side router tapping the cable
    pub destinations: Vec<u16>,
}

impl TieLine {
    pub fn free() -> Self {
        Self::default()
    }

    pub fn in_use(source_input: u16, destinations: Vec<u16>) -> Self {
        Self {
            status: TieLineStatus::InUse,
            source_input: Some(source_input),
            destinations,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == TieLineStatus::Free
    }

    /// Drop one destination, freeing the record when the set empties.
    fn remove_destination(&mut self, port: u16) -> bool {
        let Some(position) = self.destinations.iter().position(|d| *d == port) else {
            return false;
        };
        self.destinations.remove(position);
        if self.destinations.is_empty() {
            *self = TieLine::free();
        }
        true
    }
}

/// Runtime state of both pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TieLineState {
    pub a_to_b: Vec<TieLine>,
    pub b_to_a: Vec<TieLine>,
}

impl TieLineState {
    fn sized_to(config: &TieLineConfig) -> Self {
        Self {
            a_to_b: vec![TieLine::free(); config.a_to_b.len()],
            b_to_a: vec![TieLine::free(); config.b_to_a.len()],
        }
    }
}

/// Structured result of one virtual route.
#[derive(Debug)]
pub struct RouteOutcome {
    pub success: bool,
    /// An already-carried tie-line source was tapped instead of
    /// allocating a fresh line
    pub reused: bool,
    /// The source leg committed but the destination leg failed
    pub partial_failure: bool,
    pub error: Option<Error>,
}

impl RouteOutcome {
    fn ok(reused: bool) -> Self {
        Self {
            success: true,
            reused,
            partial_failure: false,
            error: None,
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            success: false,
            reused: false,
            partial_failure: false,
            error: Some(error),
        }
    }

    fn partial(error: Error) -> Self {
        Self {
            success: false,
            reused: false,
            partial_failure: true,
            error: Some(error),
        }
    }
}

/// Engine policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Un-route the source leg when the destination leg of an
    /// inter-router route fails. Off by default: the half-committed
    /// tie-line is reused by the next attempt.
    pub rollback_source_leg: bool,
}

/// The tie-line allocator.
pub struct TieLineEngine {
    config: TieLineConfig,
    state: TieLineState,
    router_a: Arc<dyn RouterPort>,
    router_b: Arc<dyn RouterPort>,
    options: EngineOptions,
    events: broadcast::Sender<TieLineState>,
}

impl TieLineEngine {
    pub fn new(
        config: TieLineConfig,
        router_a: Arc<dyn RouterPort>,
        router_b: Arc<dyn RouterPort>,
    ) -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_DEPTH);
        let state = TieLineState::sized_to(&config);
        Self {
            config,
            state,
            router_a,
            router_b,
            options: EngineOptions::default(),
            events,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &TieLineConfig {
        &self.config
    }

    pub fn state(&self) -> TieLineState {
        self.state.clone()
    }

    /// Subscribe to state snapshots emitted after every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<TieLineState> {
        self.events.subscribe()
    }

    fn router(&self, id: RouterId) -> &Arc<dyn RouterPort> {
        match id {
            RouterId::A => &self.router_a,
            RouterId::B => &self.router_b,
        }
    }

    fn emit(&self) {
        let _ = self.events.send(self.state.clone());
    }

    /// The pool whose destinations live on `router`.
    fn pool_into_mut(&mut self, router: RouterId) -> &mut Vec<TieLine> {
        match router {
            RouterId::A => &mut self.state.b_to_a,
            RouterId::B => &mut self.state.a_to_b,
        }
    }

    /// Release a destination that is about to be re-routed elsewhere.
    ///
    /// No physical un-route is issued: the cable's carriage is simply
    /// orphaned and overwritten by the next allocation.
    fn release_destination(&mut self, into: RouterId, port: u16, keep: Option<usize>) -> bool {
        let pool = self.pool_into_mut(into);
        let mut changed = false;
        for (index, tie) in pool.iter_mut().enumerate() {
            if keep == Some(index) {
                continue;
            }
            if tie.remove_destination(port) {
                debug!("released {} output {} from tie-line {}", into, port, index);
                changed = true;
            }
        }
        changed
    }

    /// Execute one virtual route.
    ///
    /// Atomic with respect to other virtual routes: the orchestrator
    /// serializes calls, and this method does not return until both
    /// physical legs have been acknowledged or one has failed.
    pub async fn execute_virtual_route(
        &mut self,
        v_out: u16,
        v_in: u16,
        level: u8,
        matrix: &VirtualMatrix,
    ) -> RouteOutcome {
        let Some((src_router, src_port)) = matrix.resolve_input(v_in) else {
            return RouteOutcome::failed(Error::InvalidIndex(format!(
                "virtual input {}",
                v_in
            )));
        };
        let Some((dst_router, dst_port)) = matrix.resolve_output(v_out) else {
            return RouteOutcome::failed(Error::InvalidIndex(format!(
                "virtual output {}",
                v_out
            )));
        };

        if !self.router(src_router).is_connected() {
            return RouteOutcome::failed(Error::RouterNotConnected(src_router));
        }
        if !self.router(dst_router).is_connected() {
            return RouteOutcome::failed(Error::RouterNotConnected(dst_router));
        }

        let outcome = if src_router == dst_router {
            self.route_intra(src_router, dst_port, src_port, level).await
        } else {
            self.route_inter(src_router, src_port, dst_router, dst_port, level)
                .await
        };

        if let Some(error) = &outcome.error {
            warn!(
                "virtual route {} <- {} failed: {}",
                v_out, v_in, error
            );
        }
        outcome
    }

    /// Both ends on the same router: plain crosspoint, but the
    /// destination must first give up any tie-line claim on it.
    async fn route_intra(
        &mut self,
        router: RouterId,
        dst_port: u16,
        src_port: u16,
        level: u8,
    ) -> RouteOutcome {
        let released = self.release_destination(router, dst_port, None);
        if released {
            self.emit();
        }

        match self.router(router).set_route(dst_port, src_port, level).await {
            Ok(()) => RouteOutcome::ok(false),
            Err(e) => RouteOutcome::failed(route_error(e)),
        }
    }

    /// Cross-router path: reuse a cable already carrying the source, or
    /// allocate the first free one.
    ///
    /// Releases of a previously claimed destination happen at commit
    /// time: a failed leg leaves both the pools and the physical claim
    /// exactly as they were.
    async fn route_inter(
        &mut self,
        src_router: RouterId,
        src_port: u16,
        dst_router: RouterId,
        dst_port: u16,
        level: u8,
    ) -> RouteOutcome {
        // src=A routes over A->B, src=B over B->A; that same pool is the
        // one directed into the destination router.
        let cables = match src_router {
            RouterId::A => self.config.a_to_b.clone(),
            RouterId::B => self.config.b_to_a.clone(),
        };
        let (reuse, first_free, in_use, total) = {
            let pool = match src_router {
                RouterId::A => &self.state.a_to_b,
                RouterId::B => &self.state.b_to_a,
            };
            // Reuse: a cable already carrying this source is always
            // tapped instead of allocating, even when free lines remain.
            let reuse = pool
                .iter()
                .position(|tie| !tie.is_free() && tie.source_input == Some(src_port));
            let first_free = pool.iter().position(|tie| tie.is_free());
            let in_use = pool.iter().filter(|tie| !tie.is_free()).count();
            (reuse, first_free, in_use, pool.len())
        };

        if let Some(index) = reuse {
            let cable = cables[index];
            return match self
                .router(dst_router)
                .set_route(dst_port, cable.input, level)
                .await
            {
                Ok(()) => {
                    self.release_destination(dst_router, dst_port, Some(index));
                    let tie = &mut self.pool_into_mut(dst_router)[index];
                    if !tie.destinations.contains(&dst_port) {
                        tie.destinations.push(dst_port);
                        tie.destinations.sort_unstable();
                    }
                    info!(
                        "reused tie-line {} for {} output {}",
                        index, dst_router, dst_port
                    );
                    self.emit();
                    RouteOutcome::ok(true)
                }
                Err(e) => RouteOutcome::failed(route_error(e)),
            };
        }

        // Allocate: the pools are consulted as they stand; a destination
        // claim never frees a line to make room for its own re-route.
        let Some(index) = first_free else {
            return RouteOutcome::failed(Error::NoTieLinesAvailable { in_use, total });
        };
        let cable = cables[index];

        // Remember the orphaned carriage in case rollback is enabled.
        let previous_source = self.router(src_router).state().route(cable.output);

        if let Err(e) = self
            .router(src_router)
            .set_route(cable.output, src_port, level)
            .await
        {
            return RouteOutcome::failed(route_error(e));
        }

        if let Err(e) = self
            .router(dst_router)
            .set_route(dst_port, cable.input, level)
            .await
        {
            if self.options.rollback_source_leg {
                if let Some(previous) = previous_source {
                    let _ = self
                        .router(src_router)
                        .set_route(cable.output, previous, level)
                        .await;
                }
            }
            return RouteOutcome::partial(Error::PartialFailure(e.to_string()));
        }

        // Commit: move the destination's claim onto the fresh cable.
        self.release_destination(dst_router, dst_port, None);
        self.pool_into_mut(dst_router)[index] = TieLine::in_use(src_port, vec![dst_port]);
        info!(
            "allocated tie-line {} ({} {} -> {} {})",
            index, src_router, cable.output, dst_router, cable.input
        );
        self.emit();
        RouteOutcome::ok(false)
    }

    /// Rebuild runtime state from observed physical routing.
    ///
    /// Run after either controller reconnects so in-flight sessions are
    /// not lost. Idempotent: a second run over the same routing yields
    /// the same state.
    pub fn reconstruct(&mut self) {
        let state_a = self.router_a.state();
        let state_b = self.router_b.state();

        self.state.a_to_b =
            reconstruct_pool(&self.config.a_to_b, &state_a, &state_b, &self.config.b_to_a);
        self.state.b_to_a =
            reconstruct_pool(&self.config.b_to_a, &state_b, &state_a, &self.config.a_to_b);

        debug!(
            "reconstructed tie-line state: {} A->B, {} B->A in use",
            self.state.a_to_b.iter().filter(|t| !t.is_free()).count(),
            self.state.b_to_a.iter().filter(|t| !t.is_free()).count(),
        );
        self.emit();
    }

    /// Swap in a new cabling plan.
    ///
    /// All records reinitialize to free, then reconstruction recovers
    /// whatever the physical routing still shows. Physical routing is
    /// never touched.
    pub fn update_config(&mut self, config: TieLineConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.state = TieLineState::sized_to(&self.config);

        if self.router_a.is_connected() && self.router_b.is_connected() {
            self.reconstruct();
        } else {
            self.emit();
        }
        Ok(())
    }
}

/// One pool of the reconstruction pass.
///
/// For each cable: the source leg's current input, and every
/// destination-side output routed to the sink. Outputs that are
/// themselves tie-line sources in the reverse direction are skipped, as
/// is the `output == sink input` case (default 1:1 passthrough many
/// routers exhibit at power-on).
fn reconstruct_pool(
    cables: &[TieLinePort],
    src_state: &RouterState,
    dst_state: &RouterState,
    reverse_cables: &[TieLinePort],
) -> Vec<TieLine> {
    cables
        .iter()
        .map(|cable| {
            let source = src_state.route(cable.output);

            let mut destinations: Vec<u16> = dst_state
                .routing
                .iter()
                .filter(|(_, input)| **input == cable.input)
                .map(|(output, _)| *output)
                .filter(|output| !reverse_cables.iter().any(|r| r.output == *output))
                .filter(|output| {
                    if *output == cable.input {
                        // May also suppress a legitimate same-index route
                        // made before connect; surfaced rather than
                        // silently accepted.
                        warn!(
                            "reconstruction: suppressing 1:1 passthrough on output {}",
                            output
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect();
            destinations.sort_unstable();

            match (source, destinations.is_empty()) {
                (Some(source), false) => TieLine::in_use(source, destinations),
                _ => TieLine::free(),
            }
        })
        .collect()
}

/// Map a controller error into the engine's route-failure vocabulary.
fn route_error(error: Error) -> Error {
    match error {
        e @ Error::RouterNotConnected(_) => e,
        other => Error::RouteFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::common::{LockCommand, RouteTally};

    /// In-memory router: applies routes to its own state, optionally
    /// failing on demand.
    struct FakeRouter {
        id: RouterId,
        state: Mutex<RouterState>,
        connected: AtomicBool,
        fail_routes: AtomicBool,
    }

    impl FakeRouter {
        fn new(id: RouterId, inputs: u16, outputs: u16) -> Arc<Self> {
            let state = RouterState {
                inputs,
                outputs,
                connected: true,
                ..Default::default()
            };
            Arc::new(Self {
                id,
                state: Mutex::new(state),
                connected: AtomicBool::new(true),
                fail_routes: AtomicBool::new(false),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.fail_routes.store(failing, Ordering::SeqCst);
        }

        fn route(&self, output: u16) -> Option<u16> {
            self.state.lock().route(output)
        }

        fn set_physical_route(&self, output: u16, input: u16) {
            self.state
                .lock()
                .apply_routing(&[RouteTally::new(output, input)]);
        }
    }

    #[async_trait]
    impl RouterPort for FakeRouter {
        fn id(&self) -> RouterId {
            self.id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn state(&self) -> RouterState {
            self.state.lock().clone()
        }

        async fn set_route(&self, output: u16, input: u16, _level: u8) -> Result<()> {
            if self.fail_routes.load(Ordering::SeqCst) {
                return Err(Error::Rejected);
            }
            self.set_physical_route(output, input);
            Ok(())
        }

        async fn set_input_label(&self, _index: u16, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn set_output_label(&self, _index: u16, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn set_lock(&self, _output: u16, _state: LockCommand) -> Result<()> {
            Ok(())
        }
    }

    fn one_tie_config() -> TieLineConfig {
        TieLineConfig {
            a_to_b: vec![TieLinePort { output: 7, input: 0 }],
            b_to_a: vec![],
        }
    }

    struct Rig {
        a: Arc<FakeRouter>,
        b: Arc<FakeRouter>,
        engine: TieLineEngine,
    }

    fn rig(config: TieLineConfig) -> Rig {
        let a = FakeRouter::new(RouterId::A, 8, 8);
        let b = FakeRouter::new(RouterId::B, 8, 8);
        let engine = TieLineEngine::new(config, a.clone(), b.clone());
        Rig { a, b, engine }
    }

    fn project(rig: &Rig) -> VirtualMatrix {
        VirtualMatrix::project(
            &rig.a.state(),
            &rig.b.state(),
            rig.engine.config(),
            &rig.engine.state(),
        )
    }

    /// Status, source, and destinations must stay mutually consistent.
    fn assert_consistent(state: &TieLineState) {
        for tie in state.a_to_b.iter().chain(state.b_to_a.iter()) {
            match tie.status {
                TieLineStatus::Free => {
                    assert!(tie.destinations.is_empty());
                    assert!(tie.source_input.is_none());
                }
                TieLineStatus::InUse => {
                    assert!(!tie.destinations.is_empty());
                    assert!(tie.source_input.is_some());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_direct_intra_router() {
        // No tie-lines configured: a route within A is a plain crosspoint.
        let mut rig = rig(TieLineConfig::default());
        let matrix = project(&rig);

        let outcome = rig.engine.execute_virtual_route(2, 3, 0, &matrix).await;
        assert!(outcome.success);
        assert!(!outcome.reused);
        assert_eq!(rig.a.route(2), Some(3));

        let matrix = project(&rig);
        assert_eq!(matrix.route(2), Some(3));
        assert_consistent(&rig.engine.state());
    }

    #[tokio::test]
    async fn test_allocate_inter_router() {
        // B output 0 (virtual 7) fed from A input 0 allocates the cable.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        assert_eq!(matrix.inputs, 15);
        assert_eq!(matrix.outputs, 15);

        let outcome = rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;
        assert!(outcome.success);
        assert!(!outcome.reused);

        assert_eq!(rig.a.route(7), Some(0));
        assert_eq!(rig.b.route(0), Some(0));
        let state = rig.engine.state();
        assert_eq!(state.a_to_b[0], TieLine::in_use(0, vec![0]));
        assert_consistent(&state);
    }

    #[tokio::test]
    async fn test_reuse_fans_out() {
        // A second far-side destination taps the same cable.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;

        let in_use_before = rig
            .engine
            .state()
            .a_to_b
            .iter()
            .filter(|t| !t.is_free())
            .count();

        let matrix = project(&rig);
        let outcome = rig.engine.execute_virtual_route(8, 0, 0, &matrix).await;
        assert!(outcome.success);
        assert!(outcome.reused);

        assert_eq!(rig.a.route(7), Some(0));
        assert_eq!(rig.b.route(1), Some(0));
        let state = rig.engine.state();
        assert_eq!(state.a_to_b[0], TieLine::in_use(0, vec![0, 1]));

        // Reuse never changes the number of in-use lines.
        let in_use_after = state.a_to_b.iter().filter(|t| !t.is_free()).count();
        assert_eq!(in_use_before, in_use_after);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        // The only cable carries a different source: nothing to allocate.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;

        let a_routing_before = rig.a.state().routing;
        let b_routing_before = rig.b.state().routing;
        let state_before = rig.engine.state();

        let matrix = project(&rig);
        let outcome = rig.engine.execute_virtual_route(7, 1, 0, &matrix).await;
        assert!(!outcome.success);
        match outcome.error {
            Some(Error::NoTieLinesAvailable { in_use: 1, total: 1 }) => {}
            other => panic!("expected NoTieLinesAvailable(1/1), got {:?}", other),
        }

        assert_eq!(rig.a.state().routing, a_routing_before);
        assert_eq!(rig.b.state().routing, b_routing_before);
        assert_eq!(rig.engine.state(), state_before);
    }

    #[tokio::test]
    async fn test_release_on_retarget() {
        // Virtual output 8 (B output 1) moves from the
        // tie-line source to B's own input 5; the claim is released but
        // the cable stays in use for its remaining destination.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(8, 0, 0, &matrix).await;

        // B's input 5 is virtual 12 (B input 0 is cabled away, so B's
        // visible inputs 1..=7 map to virtual 8..=14).
        let matrix = project(&rig);
        assert_eq!(matrix.resolve_input(12), Some((RouterId::B, 5)));

        let outcome = rig.engine.execute_virtual_route(8, 12, 0, &matrix).await;
        assert!(outcome.success);

        assert_eq!(rig.b.route(1), Some(5));
        let state = rig.engine.state();
        assert_eq!(state.a_to_b[0], TieLine::in_use(0, vec![0]));
        assert_consistent(&state);
    }

    #[tokio::test]
    async fn test_release_frees_cable_without_unrouting() {
        // Retargeting the last destination frees the record but issues
        // no physical un-route on the source side.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;

        let matrix = project(&rig);
        let outcome = rig.engine.execute_virtual_route(7, 12, 0, &matrix).await;
        assert!(outcome.success);

        // The cable still carries A input 0; nothing consumes it.
        assert_eq!(rig.a.route(7), Some(0));
        assert!(rig.engine.state().a_to_b[0].is_free());
    }

    #[tokio::test]
    async fn test_reconstruction() {
        // Rebuild from routing observed after a reconnect.
        let rig_parts = rig(one_tie_config());
        let Rig { a, b, mut engine } = rig_parts;
        a.set_physical_route(7, 3);
        b.set_physical_route(4, 0);
        b.set_physical_route(5, 0);
        b.set_physical_route(0, 0); // default 1:1 passthrough, suppressed

        engine.reconstruct();
        let state = engine.state();
        assert_eq!(state.a_to_b[0], TieLine::in_use(3, vec![4, 5]));

        // Running reconstruction again yields the same state.
        engine.reconstruct();
        assert_eq!(engine.state(), state);
    }

    #[tokio::test]
    async fn test_reconstruction_skips_reverse_sources() {
        // A destination-side output that is itself a tie-line source in
        // the reverse direction never joins a destination set.
        let config = TieLineConfig {
            a_to_b: vec![TieLinePort { output: 7, input: 0 }],
            b_to_a: vec![TieLinePort { output: 4, input: 7 }],
        };
        let Rig { a, b, mut engine } = rig(config);
        a.set_physical_route(7, 2);
        b.set_physical_route(4, 0); // B output 4 is the B->A source port
        b.set_physical_route(5, 0);

        engine.reconstruct();
        assert_eq!(engine.state().a_to_b[0], TieLine::in_use(2, vec![5]));
    }

    #[tokio::test]
    async fn test_reconstruction_source_without_destinations_is_free() {
        let Rig { a, mut engine, .. } = rig(one_tie_config());
        a.set_physical_route(7, 3);
        engine.reconstruct();
        assert!(engine.state().a_to_b[0].is_free());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_source_leg() {
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);

        rig.b.set_failing(true);
        let outcome = rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;

        assert!(!outcome.success);
        assert!(outcome.partial_failure);
        assert!(matches!(outcome.error, Some(Error::PartialFailure(_))));

        // The source leg stays committed; the record stays free.
        assert_eq!(rig.a.route(7), Some(0));
        assert!(rig.engine.state().a_to_b[0].is_free());
    }

    #[tokio::test]
    async fn test_partial_failure_rollback_when_enabled() {
        let a = FakeRouter::new(RouterId::A, 8, 8);
        let b = FakeRouter::new(RouterId::B, 8, 8);
        a.set_physical_route(7, 6); // prior carriage to restore
        let mut engine = TieLineEngine::new(one_tie_config(), a.clone(), b.clone())
            .with_options(EngineOptions {
                rollback_source_leg: true,
            });

        let matrix = VirtualMatrix::project(&a.state(), &b.state(), engine.config(), &engine.state());
        b.set_failing(true);
        let outcome = engine.execute_virtual_route(7, 0, 0, &matrix).await;

        assert!(outcome.partial_failure);
        assert_eq!(a.route(7), Some(6));
    }

    #[tokio::test]
    async fn test_source_leg_failure_mutates_nothing() {
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);

        rig.a.set_failing(true);
        let outcome = rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;

        assert!(!outcome.success);
        assert!(!outcome.partial_failure);
        assert!(matches!(outcome.error, Some(Error::RouteFailed(_))));
        assert!(rig.engine.state().a_to_b[0].is_free());
        assert!(rig.b.state().routing.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_indices() {
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);

        let outcome = rig.engine.execute_virtual_route(99, 0, 0, &matrix).await;
        assert!(matches!(outcome.error, Some(Error::InvalidIndex(_))));

        let outcome = rig.engine.execute_virtual_route(0, 99, 0, &matrix).await;
        assert!(matches!(outcome.error, Some(Error::InvalidIndex(_))));
    }

    #[tokio::test]
    async fn test_disconnected_router_refuses() {
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.b.connected.store(false, Ordering::SeqCst);

        let outcome = rig.engine.execute_virtual_route(7, 0, 0, &matrix).await;
        assert!(matches!(
            outcome.error,
            Some(Error::RouterNotConnected(RouterId::B))
        ));
    }

    #[tokio::test]
    async fn test_destination_exclusive_across_records() {
        // Moving a destination between cables keeps it in exactly
        // one destination set.
        let config = TieLineConfig {
            a_to_b: vec![
                TieLinePort { output: 7, input: 0 },
                TieLinePort { output: 6, input: 1 },
            ],
            b_to_a: vec![],
        };
        let mut rig = rig(config);

        let matrix = project(&rig);
        rig.engine.execute_virtual_route(6, 0, 0, &matrix).await; // B output 0 <- A input 0
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(6, 1, 0, &matrix).await; // retarget to A input 1

        let state = rig.engine.state();
        let claims: usize = state
            .a_to_b
            .iter()
            .map(|t| t.destinations.iter().filter(|d| **d == 0).count())
            .sum();
        assert_eq!(claims, 1);
        assert!(state.a_to_b[0].is_free());
        assert_eq!(state.a_to_b[1], TieLine::in_use(1, vec![0]));
    }

    #[tokio::test]
    async fn test_update_config_reinitializes_and_reconstructs() {
        // Use B output 1 as the destination: output 0 would equal the
        // sink input and be suppressed as presumed 1:1 passthrough.
        let mut rig = rig(one_tie_config());
        let matrix = project(&rig);
        rig.engine.execute_virtual_route(8, 0, 0, &matrix).await;

        let new_config = TieLineConfig {
            a_to_b: vec![
                TieLinePort { output: 7, input: 0 },
                TieLinePort { output: 6, input: 1 },
            ],
            b_to_a: vec![],
        };
        rig.engine.update_config(new_config).unwrap();

        let state = rig.engine.state();
        assert_eq!(state.a_to_b.len(), 2);
        // The in-flight session on cable 0 was recovered, not lost.
        assert_eq!(state.a_to_b[0], TieLine::in_use(0, vec![1]));
        assert!(state.a_to_b[1].is_free());

        // Physical routing untouched.
        assert_eq!(rig.a.route(7), Some(0));
        assert_eq!(rig.b.route(1), Some(0));
    }

    #[tokio::test]
    async fn test_update_config_rejects_duplicates() {
        let mut rig = rig(one_tie_config());
        let bad = TieLineConfig {
            a_to_b: vec![
                TieLinePort { output: 7, input: 0 },
                TieLinePort { output: 7, input: 1 },
            ],
            b_to_a: vec![],
        };
        assert!(rig.engine.update_config(bad).is_err());
        // Previous configuration stands.
        assert_eq!(rig.engine.config().a_to_b.len(), 1);
    }
}
