//! Orchestrator - single-writer coordination of the whole stack
//!
//! Owns the two controller slots, the tie-line engine, the virtual
//! projection, and the northbound bridge. Controller events are coalesced
//! per dispatch tick into one rebuild; engine access is serialized so a
//! virtual route is atomic with respect to every other virtual route.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeCommand, BridgeServer, BridgeStatus};
use crate::common::{ControllerEvent, LockCommand, RouterId, RouterState};
use crate::config::{Config, RouterConfig, SalvoEntry, TieLineConfig, TieLineDirection, TieLinePort};
use crate::controller::{Controller, ControllerConfig, RouterPort};
use crate::engine::{RouteOutcome, TieLineEngine, TieLineState};
use crate::error::{Error, Result};
use crate::matrix::VirtualMatrix;

use super::metrics;

const EVENT_CHANNEL_DEPTH: usize = 256;
const REBUILD_QUEUE_DEPTH: usize = 64;
const BRIDGE_COMMAND_DEPTH: usize = 64;

/// Event pushed to the upstream UI collaborator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Router {
        router: RouterId,
        event: ControllerEvent,
    },
    VirtualStateUpdated(Arc<VirtualMatrix>),
    TieLineStateUpdated(TieLineState),
}

/// A controller slot that outlives the controllers placed in it.
///
/// The engine holds these for its whole life; an empty slot behaves as a
/// disconnected router.
struct RouterSlot {
    id: RouterId,
    inner: RwLock<Option<Arc<Controller>>>,
}

impl RouterSlot {
    fn new(id: RouterId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: RwLock::new(None),
        })
    }

    fn set(&self, controller: Option<Arc<Controller>>) {
        *self.inner.write() = controller;
    }

    fn get(&self) -> Option<Arc<Controller>> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl RouterPort for RouterSlot {
    fn id(&self) -> RouterId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.inner
            .read()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    fn state(&self) -> RouterState {
        self.inner
            .read()
            .as_ref()
            .map(|c| c.state())
            .unwrap_or_default()
    }

    async fn set_route(&self, output: u16, input: u16, level: u8) -> Result<()> {
        let Some(controller) = self.get() else {
            return Err(Error::RouterNotConnected(self.id));
        };
        controller.set_route(output, input, level).await
    }

    async fn set_input_label(&self, index: u16, text: &str) -> Result<()> {
        let Some(controller) = self.get() else {
            return Err(Error::RouterNotConnected(self.id));
        };
        controller.set_input_label(index, text).await
    }

    async fn set_output_label(&self, index: u16, text: &str) -> Result<()> {
        let Some(controller) = self.get() else {
            return Err(Error::RouterNotConnected(self.id));
        };
        controller.set_output_label(index, text).await
    }

    async fn set_lock(&self, output: u16, state: LockCommand) -> Result<()> {
        let Some(controller) = self.get() else {
            return Err(Error::RouterNotConnected(self.id));
        };
        controller.set_lock(output, state).await
    }
}

struct BridgeHandle {
    server: Arc<BridgeServer>,
    shutdown: broadcast::Sender<()>,
}

struct Inner {
    slot_a: Arc<RouterSlot>,
    slot_b: Arc<RouterSlot>,
    engine: tokio::sync::Mutex<TieLineEngine>,
    config: RwLock<Config>,
    virtual_tx: watch::Sender<Arc<VirtualMatrix>>,
    virtual_rx: watch::Receiver<Arc<VirtualMatrix>>,
    events: broadcast::Sender<AppEvent>,
    rebuild_tx: mpsc::Sender<()>,
    bridge: Mutex<Option<BridgeHandle>>,
}

impl Inner {
    fn slot(&self, id: RouterId) -> &Arc<RouterSlot> {
        match id {
            RouterId::A => &self.slot_a,
            RouterId::B => &self.slot_b,
        }
    }

    fn both_connected(&self) -> bool {
        self.slot_a.is_connected() && self.slot_b.is_connected()
    }

    /// Ask for a rebuild; multiple ticks in one dispatch coalesce.
    fn tick(&self) {
        let _ = self.rebuild_tx.try_send(());
    }

    fn project_with(&self, engine: &TieLineEngine) -> VirtualMatrix {
        VirtualMatrix::project(
            &self.slot_a.state(),
            &self.slot_b.state(),
            engine.config(),
            &engine.state(),
        )
    }

    async fn rebuild(&self) {
        let engine = self.engine.lock().await;
        let matrix = Arc::new(self.project_with(&engine));
        let tie_state = engine.state();
        drop(engine);

        metrics::REBUILDS_TOTAL.inc();
        metrics::set_tie_line_gauges(&tie_state);

        self.virtual_tx.send_replace(Arc::clone(&matrix));
        let _ = self.events.send(AppEvent::VirtualStateUpdated(matrix));
    }
}

/// The application facade handed to the UI collaborator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        metrics::init_metrics();

        let slot_a = RouterSlot::new(RouterId::A);
        let slot_b = RouterSlot::new(RouterId::B);

        let engine = TieLineEngine::new(
            config.tie_lines.clone(),
            slot_a.clone() as Arc<dyn RouterPort>,
            slot_b.clone() as Arc<dyn RouterPort>,
        );
        let tie_events = engine.subscribe();

        let (virtual_tx, virtual_rx) = watch::channel(Arc::new(VirtualMatrix::default()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (rebuild_tx, mut rebuild_rx) = mpsc::channel(REBUILD_QUEUE_DEPTH);

        let inner = Arc::new(Inner {
            slot_a,
            slot_b,
            engine: tokio::sync::Mutex::new(engine),
            config: RwLock::new(config),
            virtual_tx,
            virtual_rx,
            events,
            rebuild_tx,
            bridge: Mutex::new(None),
        });

        // Rebuild dispatcher: drain every queued tick, rebuild once.
        let rebuild_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while rebuild_rx.recv().await.is_some() {
                while rebuild_rx.try_recv().is_ok() {}
                rebuild_inner.rebuild().await;
            }
        });

        // Tie-line state events out to the UI.
        let tie_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut tie_events = tie_events;
            loop {
                match tie_events.recv().await {
                    Ok(state) => {
                        metrics::set_tie_line_gauges(&state);
                        let _ = tie_inner.events.send(AppEvent::TieLineStateUpdated(state));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                }
            }
        });

        Self { inner }
    }

    /// Subscribe to upstream events.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.inner.events.subscribe()
    }

    /// Watch channel carrying the latest projection (used by the bridge).
    pub fn virtual_state_watch(&self) -> watch::Receiver<Arc<VirtualMatrix>> {
        self.inner.virtual_rx.clone()
    }

    // ========================================================================
    // Router lifecycle
    // ========================================================================

    /// Create and connect the controller for one router slot.
    pub async fn connect_router(&self, id: RouterId, router_config: RouterConfig) -> Result<()> {
        if self.inner.slot(id).get().is_some() {
            self.disconnect_router(id).await;
        }

        let auto_reconnect = self.inner.config.read().auto_reconnect;
        let controller_config =
            ControllerConfig::from_router_config(id, &router_config, auto_reconnect);
        let controller = Arc::new(Controller::new(controller_config));

        controller.connect().await?;

        // Forward events from here on; the initial Connected already
        // happened inside connect().
        let event_rx = controller.subscribe();
        tokio::spawn(pump_controller_events(
            Arc::clone(&self.inner),
            id,
            event_rx,
        ));

        self.inner.slot(id).set(Some(controller));
        metrics::CONTROLLER_CONNECTED
            .with_label_values(&[&id.to_string()])
            .set(1);

        {
            let mut config = self.inner.config.write();
            match id {
                RouterId::A => config.router_a = Some(router_config),
                RouterId::B => config.router_b = Some(router_config),
            }
        }

        if self.inner.both_connected() {
            self.inner.engine.lock().await.reconstruct();
        }
        self.inner.tick();
        info!("Router {} connected", id);
        Ok(())
    }

    pub async fn disconnect_router(&self, id: RouterId) {
        if let Some(controller) = self.inner.slot(id).get() {
            controller.disconnect();
        }
        self.inner.slot(id).set(None);
        metrics::CONTROLLER_CONNECTED
            .with_label_values(&[&id.to_string()])
            .set(0);
        self.inner.tick();
        info!("Router {} disconnected", id);
    }

    // ========================================================================
    // State queries
    // ========================================================================

    pub fn get_virtual_state(&self) -> Arc<VirtualMatrix> {
        self.inner.virtual_rx.borrow().clone()
    }

    pub fn get_router_state(&self, id: RouterId) -> RouterState {
        self.inner.slot(id).state()
    }

    pub async fn get_tie_line_state(&self) -> TieLineState {
        self.inner.engine.lock().await.state()
    }

    pub async fn get_tie_line_config(&self) -> TieLineConfig {
        self.inner.engine.lock().await.config().clone()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Execute one virtual route. Atomic with respect to other routes.
    pub async fn set_virtual_route(&self, v_out: u16, v_in: u16, level: u8) -> RouteOutcome {
        let mut engine = self.inner.engine.lock().await;
        let matrix = self.inner.project_with(&engine);
        let outcome = engine.execute_virtual_route(v_out, v_in, level, &matrix).await;
        drop(engine);

        metrics::record_route_outcome(&outcome);
        self.inner.tick();
        outcome
    }

    /// Apply a salvo: an ordered batch of routes executed under one
    /// engine acquisition so no other virtual route interleaves.
    pub async fn execute_salvo(&self, routes: &[SalvoEntry]) -> Vec<RouteOutcome> {
        let mut engine = self.inner.engine.lock().await;
        let mut outcomes = Vec::with_capacity(routes.len());
        for entry in routes {
            let matrix = self.inner.project_with(&engine);
            let outcome = engine
                .execute_virtual_route(entry.output, entry.input, entry.level, &matrix)
                .await;
            metrics::record_route_outcome(&outcome);
            outcomes.push(outcome);
        }
        drop(engine);

        self.inner.tick();
        outcomes
    }

    /// Apply a named salvo from the configuration.
    pub async fn execute_salvo_by_name(&self, name: &str) -> Result<Vec<RouteOutcome>> {
        let routes = {
            let config = self.inner.config.read();
            config
                .salvos
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.routes.clone())
        };
        let routes =
            routes.ok_or_else(|| Error::InvalidIndex(format!("unknown salvo: {}", name)))?;
        Ok(self.execute_salvo(&routes).await)
    }

    // ========================================================================
    // Labels and locks
    // ========================================================================

    pub async fn set_input_label(&self, v_in: u16, text: &str) -> Result<()> {
        let matrix = self.get_virtual_state();
        let (router, port) = matrix
            .resolve_input(v_in)
            .ok_or_else(|| Error::InvalidIndex(format!("virtual input {}", v_in)))?;
        self.inner.slot(router).set_input_label(port, text).await
    }

    pub async fn set_output_label(&self, v_out: u16, text: &str) -> Result<()> {
        let matrix = self.get_virtual_state();
        let (router, port) = matrix
            .resolve_output(v_out)
            .ok_or_else(|| Error::InvalidIndex(format!("virtual output {}", v_out)))?;
        self.inner.slot(router).set_output_label(port, text).await
    }

    /// Forward a lock change to the physical router owning the output.
    pub async fn set_virtual_lock(&self, v_out: u16, state: LockCommand) -> Result<()> {
        let matrix = self.get_virtual_state();
        let (router, port) = matrix
            .resolve_output(v_out)
            .ok_or_else(|| Error::InvalidIndex(format!("virtual output {}", v_out)))?;
        self.inner.slot(router).set_lock(port, state).await
    }

    // ========================================================================
    // Tie-line configuration
    // ========================================================================

    pub async fn set_tie_line_config(&self, config: TieLineConfig) -> Result<()> {
        self.inner
            .engine
            .lock()
            .await
            .update_config(config.clone())?;
        self.inner.config.write().tie_lines = config;
        self.inner.tick();
        Ok(())
    }

    pub async fn add_tie_line(&self, direction: TieLineDirection, port: TieLinePort) -> Result<()> {
        let mut config = self.get_tie_line_config().await;
        match direction {
            TieLineDirection::AToB => config.a_to_b.push(port),
            TieLineDirection::BToA => config.b_to_a.push(port),
        }
        self.set_tie_line_config(config).await
    }

    pub async fn remove_tie_line(&self, direction: TieLineDirection, index: usize) -> Result<()> {
        let mut config = self.get_tie_line_config().await;
        let pool = match direction {
            TieLineDirection::AToB => &mut config.a_to_b,
            TieLineDirection::BToA => &mut config.b_to_a,
        };
        if index >= pool.len() {
            return Err(Error::InvalidIndex(format!("tie-line {}", index)));
        }
        pool.remove(index);
        self.set_tie_line_config(config).await
    }

    // ========================================================================
    // Bridge lifecycle
    // ========================================================================

    pub fn start_bridge(&self) -> Result<BridgeStatus> {
        let mut slot = self.inner.bridge.lock();
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.server.status());
        }

        let listen = self.inner.config.read().bridge.listen.clone();
        let (command_tx, command_rx) = mpsc::channel(BRIDGE_COMMAND_DEPTH);
        let server = Arc::new(BridgeServer::new(
            listen,
            command_tx,
            self.inner.virtual_rx.clone(),
        ));
        let shutdown = server.shutdown_handle();

        tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(e) = server.run().await {
                    warn!("Bridge server failed: {}", e);
                }
            }
        });
        tokio::spawn(pump_bridge_commands(self.clone(), command_rx));

        let status = server.status();
        *slot = Some(BridgeHandle { server, shutdown });
        Ok(status)
    }

    pub fn stop_bridge(&self) {
        if let Some(handle) = self.inner.bridge.lock().take() {
            let _ = handle.shutdown.send(());
            info!("Bridge stopped");
        }
    }

    pub fn bridge_status(&self) -> BridgeStatus {
        match self.inner.bridge.lock().as_ref() {
            Some(handle) => handle.server.status(),
            None => BridgeStatus {
                running: false,
                listen: self.inner.config.read().bridge.listen.clone(),
                clients: 0,
            },
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Connect configured routers (when `autoConnect` is set) and start
    /// the bridge. Connection failures are logged, not fatal: the
    /// reconnect cycle or the operator can pick them up later.
    pub async fn bootstrap(&self) {
        let (auto_connect, router_a, router_b) = {
            let config = self.inner.config.read();
            (
                config.auto_connect,
                config.router_a.clone(),
                config.router_b.clone(),
            )
        };

        if auto_connect {
            for (id, router_config) in [(RouterId::A, router_a), (RouterId::B, router_b)] {
                let Some(router_config) = router_config else {
                    continue;
                };
                if let Err(e) = self.connect_router(id, router_config).await {
                    warn!("Auto-connect of router {} failed: {}", id, e);
                }
            }
        }

        if let Err(e) = self.start_bridge() {
            warn!("Bridge failed to start: {}", e);
        }
    }
}

/// Forward one controller's events upstream, coalescing rebuilds.
async fn pump_controller_events(
    inner: Arc<Inner>,
    id: RouterId,
    mut events: broadcast::Receiver<ControllerEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Router {} event stream lagged by {}", id, n);
                continue;
            }
            Err(_) => return,
        };

        match &event {
            ControllerEvent::Connected => {
                metrics::CONTROLLER_CONNECTED
                    .with_label_values(&[&id.to_string()])
                    .set(1);
                // A reconnect landed: recover tie-line sessions from the
                // freshly dumped routing.
                if inner.both_connected() {
                    inner.engine.lock().await.reconstruct();
                }
            }
            ControllerEvent::Disconnected => {
                metrics::CONTROLLER_CONNECTED
                    .with_label_values(&[&id.to_string()])
                    .set(0);
            }
            ControllerEvent::Reconnecting(_) => {
                metrics::CONTROLLER_RECONNECTS
                    .with_label_values(&[&id.to_string()])
                    .inc();
            }
            _ => {}
        }

        let _ = inner.events.send(AppEvent::Router { router: id, event });
        inner.tick();
    }
}

/// Serve the bridge's forwarded commands through the engine.
async fn pump_bridge_commands(orchestrator: Orchestrator, mut commands: mpsc::Receiver<BridgeCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            BridgeCommand::Route {
                output,
                input,
                reply,
            } => {
                metrics::BRIDGE_COMMANDS_TOTAL
                    .with_label_values(&["routing"])
                    .inc();
                let outcome = orchestrator.set_virtual_route(output, input, 0).await;
                let _ = reply.send(outcome.success);
            }
            BridgeCommand::SetInputLabel { index, text, reply } => {
                metrics::BRIDGE_COMMANDS_TOTAL
                    .with_label_values(&["input-labels"])
                    .inc();
                let ok = orchestrator.set_input_label(index, &text).await.is_ok();
                let _ = reply.send(ok);
            }
            BridgeCommand::SetOutputLabel { index, text, reply } => {
                metrics::BRIDGE_COMMANDS_TOTAL
                    .with_label_values(&["output-labels"])
                    .inc();
                let ok = orchestrator.set_output_label(index, &text).await.is_ok();
                let _ = reply.send(ok);
            }
            BridgeCommand::SetLock { output, state } => {
                metrics::BRIDGE_COMMANDS_TOTAL
                    .with_label_values(&["locks"])
                    .inc();
                if let Err(e) = orchestrator.set_virtual_lock(output, state).await {
                    debug!("Bridge lock forward failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieLinePort;

    #[tokio::test]
    async fn test_route_without_routers_is_invalid_index() {
        let orchestrator = Orchestrator::new(Config::default());
        let outcome = orchestrator.set_virtual_route(0, 0, 0).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(Error::InvalidIndex(_))));
    }

    #[tokio::test]
    async fn test_tie_line_config_round_trip() {
        let orchestrator = Orchestrator::new(Config::default());

        orchestrator
            .add_tie_line(
                TieLineDirection::AToB,
                TieLinePort { output: 7, input: 0 },
            )
            .await
            .unwrap();

        let config = orchestrator.get_tie_line_config().await;
        assert_eq!(config.a_to_b, vec![TieLinePort { output: 7, input: 0 }]);

        let state = orchestrator.get_tie_line_state().await;
        assert_eq!(state.a_to_b.len(), 1);
        assert!(state.a_to_b[0].is_free());

        orchestrator
            .remove_tie_line(TieLineDirection::AToB, 0)
            .await
            .unwrap();
        assert!(orchestrator.get_tie_line_config().await.a_to_b.is_empty());
    }

    #[tokio::test]
    async fn test_remove_tie_line_out_of_range() {
        let orchestrator = Orchestrator::new(Config::default());
        let err = orchestrator
            .remove_tie_line(TieLineDirection::BToA, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIndex(_)));
    }

    #[tokio::test]
    async fn test_duplicate_tie_line_rejected_previous_stands() {
        let orchestrator = Orchestrator::new(Config::default());
        orchestrator
            .add_tie_line(
                TieLineDirection::AToB,
                TieLinePort { output: 7, input: 0 },
            )
            .await
            .unwrap();

        let err = orchestrator
            .add_tie_line(
                TieLineDirection::AToB,
                TieLinePort { output: 7, input: 1 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(orchestrator.get_tie_line_config().await.a_to_b.len(), 1);
    }

    #[tokio::test]
    async fn test_bridge_status_not_running() {
        let orchestrator = Orchestrator::new(Config::default());
        let status = orchestrator.bridge_status();
        assert!(!status.running);
        assert_eq!(status.clients, 0);
    }

    #[tokio::test]
    async fn test_salvo_by_name_unknown() {
        let orchestrator = Orchestrator::new(Config::default());
        assert!(orchestrator.execute_salvo_by_name("nope").await.is_err());
    }
}
