use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::annotations::AnnotationKind;
use crate::channel::{ConnectionState, MachineState};
use crate::engine::EngineState;
use crate::logs::SessionLogger;
use crate::macros::SyncReport;

// ── Events ──────────────────────────────────────────────────────────

/// Everything the core reports outward. Each event is a finished value; the
/// observer owns it once delivered.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum SessionEvent {
    ConnectionChanged { state: ConnectionState },
    StateUpdate { state: MachineState },
    CommandResult { line: Option<usize>, ok: bool, message: String },
    /// Event-stream payload exactly as received.
    Inbound { raw: String },
    Malformed { raw: String, reason: String },
    Annotation { line: usize, kind: AnnotationKind, text: String },
    LineChanged { index: usize },
    LineEdited { index: usize, text: String },
    EngineState { state: EngineState },
    BreakpointHit { index: usize },
    Warning { message: String },
    Error { message: String },
    EmergencyStopFailed { message: String },
    #[serde(rename_all = "camelCase")]
    ClockOffset { offset_ms: i64, exceeds_limit: bool },
    SyncStarted,
    SyncCompleted { report: SyncReport },
}

impl SessionEvent {
    /// Prefix and text for the session transcript.
    pub fn transcript(&self) -> (&'static str, String) {
        match self {
            SessionEvent::ConnectionChanged { state } => ("conn", format!("{state:?}")),
            SessionEvent::StateUpdate { state } => (
                "state",
                format!(
                    "X{} Y{} Z{} status={}",
                    state.position.x,
                    state.position.y,
                    state.position.z,
                    state.status.as_deref().unwrap_or("-")
                ),
            ),
            SessionEvent::CommandResult { line, ok, message } => {
                let at = line.map(|l| format!("line {l}: ")).unwrap_or_default();
                (if *ok { "ctrl" } else { "ctrl-err" }, format!("{at}{message}"))
            }
            SessionEvent::Inbound { raw } => ("recv", raw.clone()),
            SessionEvent::Malformed { raw, reason } => ("malformed", format!("{reason}: {raw}")),
            SessionEvent::Annotation { line, kind, text } => {
                let tag = match kind {
                    AnnotationKind::Message => "MSG",
                    AnnotationKind::Debug => "DEBUG",
                };
                ("note", format!("line {line} {tag}: {text}"))
            }
            SessionEvent::LineChanged { index } => ("engine", format!("at line {index}")),
            SessionEvent::LineEdited { index, text } => ("engine", format!("line {index} edited: {text}")),
            SessionEvent::EngineState { state } => ("engine", format!("state {state:?}")),
            SessionEvent::BreakpointHit { index } => ("engine", format!("breakpoint at line {index}")),
            SessionEvent::Warning { message } => ("warn", message.clone()),
            SessionEvent::Error { message } => ("error", message.clone()),
            SessionEvent::EmergencyStopFailed { message } => ("ESTOP", message.clone()),
            SessionEvent::ClockOffset { offset_ms, exceeds_limit } => (
                "clock",
                format!("offset {offset_ms}ms{}", if *exceeds_limit { " (exceeds limit)" } else { "" }),
            ),
            SessionEvent::SyncStarted => ("sync", "started".to_string()),
            SessionEvent::SyncCompleted { report } => ("sync", report.summary()),
        }
    }
}

/// Cloneable sending half handed to every producer. A disabled sink drops
/// everything, which is what tests and one-shot commands usually want.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

// ── Observer ────────────────────────────────────────────────────────

/// Receives events from the dispatcher task. Implementations must not assume
/// which thread they are called on.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_event(&self, event: &SessionEvent);
}

/// Single consumer loop: every event goes to the transcript (if any) and then
/// to the observer. Returns when all senders are gone.
pub async fn dispatch<O>(
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    observer: &O,
    logger: Option<SessionLogger>,
) where
    O: Observer + ?Sized,
{
    while let Some(event) = rx.recv().await {
        if let Some(logger) = &logger {
            let (prefix, line) = event.transcript();
            logger.log(prefix, &line);
        }
        observer.on_event(&event).await;
    }
}
