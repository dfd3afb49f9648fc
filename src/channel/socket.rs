//! The duplex event stream: connection loop, reconnection and the pump that
//! multiplexes outbound lines with inbound pushes.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::clock::{ClockEstimator, DRIFT_LIMIT};
use super::protocol::{merge_json, parse_inbound, ConnectionState, Inbound, MachineState};
use super::rest::RestClient;
use crate::annotations::AnnotationLedger;
use crate::config::ConnectionConfig;
use crate::error::CommError;
use crate::events::{EventSink, SessionEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Running count of acknowledgements seen on the stream. A line is
/// acknowledged once the count moves past the value read before sending.
#[derive(Clone, Debug, Default)]
pub(super) struct AckMark {
    pub count: u64,
    pub error: Option<String>,
}

/// Highest-priority outbound text, drained ahead of ordinary lines.
pub(super) struct PriorityCommand {
    pub epoch: u64,
    pub text: String,
    pub sent: Option<oneshot::Sender<()>>,
}

/// State written only by the stream task and read by everyone else.
pub(super) struct Shared {
    pub connection: watch::Sender<ConnectionState>,
    pub machine: watch::Sender<MachineState>,
    pub acks: watch::Sender<AckMark>,
    raw: Mutex<Map<String, Value>>,
    lines: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pub priority_tx: mpsc::UnboundedSender<PriorityCommand>,
    pub priority_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PriorityCommand>>,
    /// Bumped when an estop is cleared so queued stop commands go stale.
    pub estop_epoch: AtomicU64,
    pub ledger: Arc<AnnotationLedger>,
    pub events: EventSink,
}

impl Shared {
    pub fn new(ledger: Arc<AnnotationLedger>, events: EventSink) -> Self {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        Self {
            connection: watch::Sender::new(ConnectionState::Disconnected),
            machine: watch::Sender::new(MachineState::default()),
            acks: watch::Sender::new(AckMark::default()),
            raw: Mutex::new(Map::new()),
            lines: Mutex::new(None),
            priority_tx,
            priority_rx: tokio::sync::Mutex::new(priority_rx),
            estop_epoch: AtomicU64::new(0),
            ledger,
            events,
        }
    }

    pub fn set_connection(&self, state: ConnectionState) {
        let changed = self.connection.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!("controller connection: {state:?}");
            self.events.emit(SessionEvent::ConnectionChanged { state });
        }
    }

    pub fn line_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        match self.lines.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_line_sender(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        match self.lines.lock() {
            Ok(mut guard) => *guard = tx,
            Err(poisoned) => *poisoned.into_inner() = tx,
        }
    }

    pub fn raw_state(&self) -> Map<String, Value> {
        match self.raw.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Merge a state delta. Returns whether it was applied (not stale).
    pub fn apply_state(&self, delta: &Map<String, Value>) -> bool {
        let mut applied = false;
        self.machine.send_if_modified(|state| {
            applied = state.apply(delta);
            applied
        });
        if !applied {
            tracing::debug!("dropping stale state delta");
            return false;
        }
        match self.raw.lock() {
            Ok(mut raw) => merge_json(&mut raw, delta),
            Err(poisoned) => merge_json(&mut poisoned.into_inner(), delta),
        }
        self.events.emit(SessionEvent::StateUpdate {
            state: self.machine.borrow().clone(),
        });
        true
    }

    fn bump_ack(&self, error: Option<String>) {
        self.acks.send_modify(|mark| {
            mark.count += 1;
            mark.error = error;
        });
    }

    /// Route one text frame from the controller.
    pub fn handle_text(&self, raw: &str) {
        self.events.emit(SessionEvent::Inbound { raw: raw.to_string() });

        match parse_inbound(raw) {
            Inbound::Empty | Inbound::Heartbeat(_) => {}
            Inbound::StateDelta(delta) => {
                if self.apply_state(&delta) {
                    self.bump_ack(None);
                }
            }
            Inbound::Log { level, message } => {
                if self.ledger.consume_echo(&message) {
                    tracing::debug!("suppressing echoed annotation {message:?}");
                    return;
                }
                let ok = level != "error";
                if !ok {
                    tracing::warn!("controller error: {message}");
                    self.bump_ack(Some(message.clone()));
                }
                self.events.emit(SessionEvent::CommandResult { line: None, ok, message });
            }
            Inbound::Text(text) => {
                if self.ledger.consume_echo(&text) {
                    return;
                }
                self.events.emit(SessionEvent::CommandResult {
                    line: None,
                    ok: true,
                    message: text,
                });
            }
            Inbound::Malformed { reason } => {
                tracing::warn!("malformed controller payload: {reason}");
                self.events.emit(SessionEvent::Malformed {
                    raw: raw.to_string(),
                    reason,
                });
            }
        }
    }
}

/// `min(base * 2^attempt, cap)` scaled by a random factor in [0.8, 1.2].
pub fn backoff_delay<R: Rng>(attempt: u32, base: Duration, cap: Duration, rng: &mut R) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    let delay = base.saturating_mul(factor).min(cap);
    delay.mul_f64(rng.gen_range(0.8..=1.2))
}

// ── Connection loop ─────────────────────────────────────────────────

pub(super) struct LoopContext {
    pub config: ConnectionConfig,
    pub shared: Arc<Shared>,
    pub rest: Arc<RestClient>,
    pub clock: Arc<ClockEstimator>,
}

enum PumpExit {
    Dropped(String),
}

async fn open(config: &ConnectionConfig) -> Result<Socket, String> {
    let mut request = config
        .ws_url()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    let origin = HeaderValue::from_str(&config.origin()).map_err(|e| e.to_string())?;
    request.headers_mut().insert("Origin", origin);

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(socket)
}

/// Runs until the first attempt fails, the retry budget is spent, or the
/// task is aborted. `first` learns how the initial attempt went.
pub(super) async fn run(ctx: LoopContext, first: oneshot::Sender<Result<(), CommError>>) {
    let shared = &ctx.shared;
    let mut first = Some(first);
    let mut attempt: u32 = 0;
    let mut priority = shared.priority_rx.lock().await;

    shared.set_connection(ConnectionState::Connecting);

    loop {
        match open(&ctx.config).await {
            Ok(socket) => {
                attempt = 0;
                let (line_tx, line_rx) = mpsc::unbounded_channel();
                shared.set_line_sender(Some(line_tx));
                shared.set_connection(ConnectionState::Connected);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                tokio::spawn(after_connect(ctx.shared.clone(), ctx.rest.clone(), ctx.clock.clone()));

                let PumpExit::Dropped(reason) = pump(socket, line_rx, &mut priority, &ctx).await;
                shared.set_line_sender(None);
                tracing::warn!("controller stream dropped: {reason}");

                if !ctx.config.auto_reconnect {
                    shared.set_connection(ConnectionState::Disconnected);
                    shared.events.emit(SessionEvent::Error {
                        message: format!("connection lost: {reason}"),
                    });
                    return;
                }
            }
            Err(reason) => {
                if let Some(tx) = first.take() {
                    shared.set_connection(ConnectionState::Disconnected);
                    let _ = tx.send(Err(CommError::Unavailable(reason)));
                    return;
                }
                tracing::debug!("reconnect attempt {attempt} failed: {reason}");
            }
        }

        if attempt >= ctx.config.max_reconnect_attempts {
            shared.set_connection(ConnectionState::Disconnected);
            shared.events.emit(SessionEvent::Error {
                message: format!("gave up reconnecting after {attempt} attempts"),
            });
            return;
        }

        shared.set_connection(ConnectionState::Reconnecting);
        let delay = backoff_delay(
            attempt,
            Duration::from_millis(ctx.config.reconnect_base_ms),
            Duration::from_millis(ctx.config.reconnect_cap_ms),
            &mut rand::thread_rng(),
        );
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

async fn after_connect(shared: Arc<Shared>, rest: Arc<RestClient>, clock: Arc<ClockEstimator>) {
    match clock.measure(rest.as_ref()).await {
        Ok(offset) => {
            let exceeds_limit = offset.exceeds(DRIFT_LIMIT);
            if exceeds_limit {
                tracing::warn!("controller clock offset {offset} exceeds {DRIFT_LIMIT:?}");
            }
            shared.events.emit(SessionEvent::ClockOffset {
                offset_ms: offset.as_millis(),
                exceeds_limit,
            });
        }
        Err(e) => {
            tracing::warn!("clock offset unavailable: {e}");
            shared.events.emit(SessionEvent::Warning {
                message: format!("clock offset unavailable: {e}"),
            });
        }
    }

    match rest.state().await {
        Ok(state) => {
            shared.apply_state(&state);
        }
        Err(e) => tracing::warn!("initial state fetch failed: {e}"),
    }
}

async fn pump(
    socket: Socket,
    mut lines: mpsc::UnboundedReceiver<String>,
    priority: &mut mpsc::UnboundedReceiver<PriorityCommand>,
    ctx: &LoopContext,
) -> PumpExit {
    let shared = &ctx.shared;
    let (mut sink, mut stream) = socket.split();
    let mut keepalive = tokio::time::interval(ctx.config.keepalive_check());
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_traffic = Instant::now();

    loop {
        tokio::select! {
            biased;

            Some(cmd) = priority.recv() => {
                if cmd.epoch < shared.estop_epoch.load(Ordering::SeqCst) {
                    tracing::debug!("dropping stale priority command {:?}", cmd.text);
                    continue;
                }
                if let Err(e) = sink.send(Message::Text(cmd.text)).await {
                    return PumpExit::Dropped(e.to_string());
                }
                if let Some(sent) = cmd.sent {
                    let _ = sent.send(());
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    last_traffic = Instant::now();
                    shared.handle_text(&text);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    last_traffic = Instant::now();
                    shared.handle_text(&String::from_utf8_lossy(&bytes));
                }
                Some(Ok(Message::Close(_))) => return PumpExit::Dropped("closed by controller".into()),
                Some(Ok(_)) => last_traffic = Instant::now(),
                Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                None => return PumpExit::Dropped("stream ended".into()),
            },

            Some(line) = lines.recv() => {
                tracing::debug!("send {:?}", line.trim_end());
                if let Err(e) = sink.send(Message::Text(line)).await {
                    return PumpExit::Dropped(e.to_string());
                }
            }

            _ = keepalive.tick() => {
                if last_traffic.elapsed() >= ctx.config.keepalive_idle() {
                    if let Err(e) = sink.send(Message::Ping(b"keepalive".to_vec())).await {
                        return PumpExit::Dropped(format!("keepalive failed: {e}"));
                    }
                    last_traffic = Instant::now();
                }
            }
        }
    }
}
