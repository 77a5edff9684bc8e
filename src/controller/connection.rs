//! Controller connection task
//!
//! One task per controller owns the socket for its whole life: initial
//! connect, the read/ack loop, and the reconnect-with-backoff cycle. The
//! controller front end only touches the shared mirror and the command
//! channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::common::{ControllerEvent, RouterState};
use crate::error::{Error, Result};
use crate::protocol::{create_codec, AckMode, Command, Update, WireCodec};

use super::ControllerConfig;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A queued write with its completion slot.
pub(crate) struct Request {
    pub command: Command,
    pub respond: oneshot::Sender<Result<()>>,
}

/// State shared between the controller front end and its connection task.
#[derive(Clone)]
pub(crate) struct ConnectionShared {
    pub mirror: Arc<RwLock<RouterState>>,
    pub connected: Arc<AtomicBool>,
    pub events: broadcast::Sender<ControllerEvent>,
}

impl ConnectionShared {
    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut mirror = self.mirror.write();
        mirror.connected = false;
    }
}

enum SessionEnd {
    /// Deliberate close
    Shutdown,
    /// Transport lost after a completed handshake
    Lost(Error),
}

/// Drive the connection for its whole life.
///
/// `first_result` resolves the initial `connect()` call: `Ok` once the
/// first full dump has landed, `Err` if the first attempt fails. An
/// initial failure does not enter the reconnect cycle.
pub(crate) async fn run_connection_loop(
    config: ControllerConfig,
    shared: ConnectionShared,
    mut commands: mpsc::Receiver<Request>,
    mut shutdown: broadcast::Receiver<()>,
    first_result: oneshot::Sender<Result<()>>,
) {
    let label = config.label();
    let mut first = Some(first_result);

    let outcome = establish_and_run(&config, &shared, &mut commands, &mut shutdown, &mut first)
        .await;
    shared.mark_disconnected();
    fail_queued(&mut commands);

    match outcome {
        Ok(SessionEnd::Shutdown) => {
            info!("[{}] Disconnected", label);
            shared.emit(ControllerEvent::Disconnected);
            return;
        }
        Ok(SessionEnd::Lost(e)) => {
            warn!("[{}] Connection lost: {}", label, e);
            if matches!(e, Error::Protocol(_)) {
                shared.emit(ControllerEvent::Error(e.kind().to_string()));
            }
            shared.emit(ControllerEvent::Disconnected);
        }
        Err(e) => {
            // The first handshake never completed; surface it to the
            // caller instead of entering the reconnect cycle.
            if let Some(tx) = first.take() {
                let _ = tx.send(Err(e));
            }
            return;
        }
    }

    if !config.auto_reconnect {
        return;
    }

    // Reconnect cycle: emit the attempt number, back off, try again.
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        shared.emit(ControllerEvent::Reconnecting(attempt));
        let delay = backoff_delay(attempt, config.initial_backoff, config.max_backoff);
        debug!("[{}] Reconnect attempt {} in {:?}", label, attempt, delay);

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => {
                shared.emit(ControllerEvent::Disconnected);
                return;
            }
        }

        let outcome =
            establish_and_run(&config, &shared, &mut commands, &mut shutdown, &mut first).await;
        shared.mark_disconnected();
        fail_queued(&mut commands);

        match outcome {
            Ok(SessionEnd::Shutdown) => {
                shared.emit(ControllerEvent::Disconnected);
                return;
            }
            Ok(SessionEnd::Lost(e)) => {
                warn!("[{}] Connection lost: {}", label, e);
                shared.emit(ControllerEvent::Disconnected);
                attempt = 0;
            }
            Err(e) => {
                warn!("[{}] Reconnect attempt {} failed: {}", label, attempt, e);
            }
        }
    }
}

/// Open the socket, run the handshake, then the session loop.
///
/// `Err` means the handshake never completed; `Ok(SessionEnd)` reports how
/// an established session ended.
async fn establish_and_run(
    config: &ControllerConfig,
    shared: &ConnectionShared,
    commands: &mut mpsc::Receiver<Request>,
    shutdown: &mut broadcast::Receiver<()>,
    first: &mut Option<oneshot::Sender<Result<()>>>,
) -> Result<SessionEnd> {
    let target = format!("{}:{}", config.host, config.port);
    let stream = timeout(config.connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::UnreachableHost(format!("{}: {}", target, e)))?;
    stream.set_nodelay(true)?;

    info!("[{}] Connected to {} ({})", config.label(), target, config.protocol);

    let mut session = Session {
        config,
        shared,
        stream,
        codec: create_codec(config.protocol, config.matrix_hint),
        pending: None,
        queue: VecDeque::new(),
        dump_complete: false,
    };
    session.run(commands, shutdown, first).await
}

struct Session<'a> {
    config: &'a ControllerConfig,
    shared: &'a ConnectionShared,
    stream: TcpStream,
    codec: Box<dyn WireCodec>,
    /// The single in-flight request
    pending: Option<Pending>,
    /// FIFO of requests waiting behind it
    queue: VecDeque<Request>,
    dump_complete: bool,
}

struct Pending {
    command: Command,
    respond: oneshot::Sender<Result<()>>,
    mode: AckMode,
    deadline: Instant,
}

impl Session<'_> {
    async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<Request>,
        shutdown: &mut broadcast::Receiver<()>,
        first: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<SessionEnd> {
        // Handshake: greet, then flush codec-internal updates (SW-P-08
        // emits its configured dimensions here).
        let greeting = self.codec.greeting();
        if !greeting.is_empty() {
            self.stream.write_all(&greeting).await?;
        }
        let initial = self.codec.feed(&[])?;
        self.apply_updates(initial, first);

        let dump_deadline = Instant::now() + self.config.request_timeout;
        let far_future = Instant::now() + Duration::from_secs(86400);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let ack_deadline = self
                .pending
                .as_ref()
                .map(|p| p.deadline)
                .unwrap_or(far_future);

            tokio::select! {
                result = self.stream.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => return self.end(Error::ConnectionClosed),
                        Ok(n) => n,
                        Err(e) => return self.end(e.into()),
                    };
                    let updates = match self.codec.feed(&buf[..n]) {
                        Ok(updates) => updates,
                        Err(e) => return self.end(e),
                    };
                    self.apply_updates(updates, first);
                    if let Err(e) = self.dispatch_next().await {
                        return self.end(e);
                    }
                }
                request = commands.recv() => {
                    match request {
                        Some(request) => {
                            self.queue.push_back(request);
                            if let Err(e) = self.dispatch_next().await {
                                return self.end(e);
                            }
                        }
                        // Controller dropped; treat as shutdown.
                        None => return Ok(SessionEnd::Shutdown),
                    }
                }
                _ = sleep_until(ack_deadline), if self.pending.is_some() => {
                    let pending = self.pending.take().expect("guarded");
                    warn!(
                        "[{}] Request timed out awaiting ack: {:?}",
                        self.config.label(),
                        pending.command
                    );
                    let _ = pending.respond.send(Err(Error::Timeout));
                    if let Err(e) = self.dispatch_next().await {
                        return self.end(e);
                    }
                }
                _ = sleep_until(dump_deadline), if !self.dump_complete => {
                    return Err(Error::Timeout);
                }
                _ = shutdown.recv() => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Transport loss before the dump completes is a handshake failure.
    fn end(&mut self, error: Error) -> Result<SessionEnd> {
        self.fail_outstanding();
        if self.dump_complete {
            Ok(SessionEnd::Lost(error))
        } else {
            Err(error)
        }
    }

    /// Queued writes never survive a connection; they fail with Timeout.
    fn fail_outstanding(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.respond.send(Err(Error::Timeout));
        }
        for request in self.queue.drain(..) {
            let _ = request.respond.send(Err(Error::Timeout));
        }
    }

    fn apply_updates(
        &mut self,
        updates: Vec<Update>,
        first: &mut Option<oneshot::Sender<Result<()>>>,
    ) {
        for update in updates {
            self.match_ack(&update);

            match update {
                Update::Preamble { version } => {
                    debug!("[{}] Preamble version {}", self.config.label(), version);
                }
                Update::Dimensions { inputs, outputs } => {
                    let mut mirror = self.shared.mirror.write();
                    mirror.inputs = inputs;
                    mirror.outputs = outputs;
                    drop(mirror);
                    self.shared.emit(ControllerEvent::StateUpdated);
                }
                Update::Routing(tallies) => {
                    self.shared.mirror.write().apply_routing(&tallies);
                    self.shared.emit(ControllerEvent::RoutingChanged(tallies));
                    self.shared.emit(ControllerEvent::StateUpdated);
                }
                Update::InputLabels(labels) => {
                    self.shared.mirror.write().apply_input_labels(&labels);
                    self.shared.emit(ControllerEvent::InputLabelsChanged);
                    self.shared.emit(ControllerEvent::StateUpdated);
                }
                Update::OutputLabels(labels) => {
                    self.shared.mirror.write().apply_output_labels(&labels);
                    self.shared.emit(ControllerEvent::OutputLabelsChanged);
                    self.shared.emit(ControllerEvent::StateUpdated);
                }
                Update::Locks(locks) => {
                    self.shared.mirror.write().apply_locks(&locks);
                    self.shared.emit(ControllerEvent::LocksChanged);
                    self.shared.emit(ControllerEvent::StateUpdated);
                }
                Update::DumpComplete => {
                    self.dump_complete = true;
                    self.shared.connected.store(true, Ordering::SeqCst);
                    self.shared.mirror.write().connected = true;
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    info!("[{}] Initial state dump complete", self.config.label());
                    self.shared.emit(ControllerEvent::Connected);
                }
                Update::Ack | Update::Nak => {}
            }
        }
    }

    /// Complete the in-flight request if this update acknowledges it.
    ///
    /// Unsolicited tallies must not consume an Explicit-mode ack, and
    /// ACK/NAK frames never complete a RouteEcho-mode request.
    fn match_ack(&mut self, update: &Update) {
        let Some(pending) = &self.pending else {
            return;
        };

        let verdict = match (pending.mode, update) {
            (AckMode::Explicit, Update::Ack) => Some(Ok(())),
            (AckMode::Explicit, Update::Nak) => Some(Err(Error::Rejected)),
            (AckMode::RouteEcho, Update::Routing(tallies)) => {
                if let Command::SetRoute { output, input, .. } = &pending.command {
                    let echoed = tallies
                        .iter()
                        .any(|t| t.output == *output && t.input == *input);
                    echoed.then_some(Ok(()))
                } else {
                    None
                }
            }
            _ => None,
        };

        if let Some(result) = verdict {
            let pending = self.pending.take().expect("checked above");
            let _ = pending.respond.send(result);
        }
    }

    /// Put the next queued request on the wire if nothing is in flight.
    async fn dispatch_next(&mut self) -> Result<()> {
        while self.pending.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return Ok(());
            };

            let bytes = match self.codec.encode(&request.command) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = request.respond.send(Err(e));
                    continue;
                }
            };
            let mode = self.codec.ack_mode(&request.command);

            if !bytes.is_empty() {
                self.stream.write_all(&bytes).await?;
            }

            match mode {
                AckMode::Immediate => {
                    // Best-effort: completed as soon as written.
                    let _ = request.respond.send(Ok(()));
                }
                _ => {
                    self.pending = Some(Pending {
                        command: request.command,
                        respond: request.respond,
                        mode,
                        deadline: Instant::now() + self.config.request_timeout,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fail anything still sitting in the command channel.
fn fail_queued(commands: &mut mpsc::Receiver<Request>) {
    while let Ok(request) = commands.try_recv() {
        let _ = request.respond.send(Err(Error::Timeout));
    }
}

/// Exponential backoff with ±20% jitter: 1 s doubling to a 30 s cap.
fn backoff_delay(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let base = initial
        .saturating_mul(1u32 << shift)
        .min(cap)
        .as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_and_jitters() {
        let initial = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        for attempt in 1..20 {
            let delay = backoff_delay(attempt, initial, cap);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(36_000));
        }
        // Attempt 1 stays near the initial delay.
        let first = backoff_delay(1, initial, cap);
        assert!(first <= Duration::from_millis(1200));
    }
}
