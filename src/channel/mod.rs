//! Link to the controller: a WebSocket event stream for lines and state
//! pushes, plus a REST track for files, time and out-of-band commands.

pub mod clock;
pub mod protocol;
pub mod rest;
mod socket;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};

use crate::annotations::AnnotationLedger;
use crate::config::ConnectionConfig;
use crate::error::CommError;
use crate::events::EventSink;
use crate::macros::{Macro, MacroRef};
use crate::time::{ClockOffset, Timestamp};

pub use clock::{ClockEstimator, TimeSource, DRIFT_LIMIT};
pub use protocol::{
    ConnectionState, DistanceMode, MachineState, Position, Spindle, SpindleDirection, Units,
};
pub use rest::RestClient;
pub use socket::backoff_delay;

use socket::{LoopContext, PriorityCommand, Shared};

const ESTOP_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Acknowledgement of one transmitted line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ack {
    /// Error the controller reported while the line was outstanding.
    pub controller_error: Option<String>,
}

/// What the execution engine and the macro sync need from a controller.
#[async_trait]
pub trait Controller: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    fn machine_state(&self) -> MachineState;

    /// Transmit one line and wait for it to be acknowledged.
    async fn send_line(&self, line: &str) -> Result<Ack, CommError>;

    /// Bypasses the line queue. Succeeds if either delivery path worked.
    async fn emergency_stop(&self) -> Result<(), CommError>;

    async fn clear_estop(&self) -> Result<(), CommError>;

    async fn pause_feed(&self) -> Result<(), CommError>;

    async fn resume_feed(&self) -> Result<(), CommError>;

    async fn stop_program(&self) -> Result<(), CommError>;

    async fn controller_time(&self) -> Result<Timestamp, CommError>;

    fn current_offset(&self) -> Option<ClockOffset>;

    async fn measure_offset(&self) -> Result<ClockOffset, CommError>;

    async fn list_macros(&self) -> Result<Vec<MacroRef>, CommError>;

    async fn download_macro(&self, name: &str) -> Result<Macro, CommError>;

    async fn upload_macro(&self, name: &str, content: &str) -> Result<(), CommError>;

    async fn delete_macro(&self, name: &str) -> Result<(), CommError>;
}

pub struct Channel {
    config: ConnectionConfig,
    rest: Arc<RestClient>,
    clock: Arc<ClockEstimator>,
    shared: Arc<Shared>,
    handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    active: Arc<AtomicBool>,
}

impl Channel {
    pub fn new(
        config: ConnectionConfig,
        clock: Arc<ClockEstimator>,
        ledger: Arc<AnnotationLedger>,
        events: EventSink,
    ) -> Result<Self, CommError> {
        let rest = Arc::new(RestClient::new(&config)?);
        Ok(Self {
            config,
            rest,
            clock,
            shared: Arc::new(Shared::new(ledger, events)),
            handle: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open the event stream. Resolves once the first attempt has either
    /// connected or failed; later drops are handled by the background loop.
    pub async fn connect(&self) -> Result<(), CommError> {
        self.stop().await;

        let (first_tx, first_rx) = oneshot::channel();
        let ctx = LoopContext {
            config: self.config.clone(),
            shared: self.shared.clone(),
            rest: self.rest.clone(),
            clock: self.clock.clone(),
        };
        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            socket::run(ctx, first_tx).await;
            active.store(false, Ordering::SeqCst);
        });
        *self.handle.lock().await = Some(handle);

        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(CommError::Disconnected),
        }
    }

    /// Whether the connection loop is still running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        self.teardown();
    }

    /// Abort the connection loop synchronously (for shutdown paths that
    /// cannot await).
    pub fn kill_sync(&self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.shared.set_line_sender(None);
        self.shared.set_connection(ConnectionState::Disconnected);
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    /// Full merged controller state, including keys the typed state ignores.
    pub fn raw_state(&self) -> Map<String, Value> {
        self.shared.raw_state()
    }

    /// Re-read `/api/state` and merge it.
    pub async fn refresh_state(&self) -> Result<MachineState, CommError> {
        let state = self.rest.state().await?;
        self.shared.apply_state(&state);
        Ok(self.machine_state())
    }

    async fn estop_over_stream(&self) -> Result<(), CommError> {
        let connected = self.connection_state() == ConnectionState::Connected;
        let (sent_tx, sent_rx) = oneshot::channel();
        let command = PriorityCommand {
            epoch: self.shared.estop_epoch.load(Ordering::SeqCst),
            text: "!".into(),
            sent: connected.then_some(sent_tx),
        };
        // Stays queued across a reconnect if the stream is down right now.
        self.shared
            .priority_tx
            .send(command)
            .map_err(|_| CommError::Disconnected)?;
        if !connected {
            return Err(CommError::NotConnected);
        }
        match tokio::time::timeout(self.config.ack_timeout(), sent_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CommError::Disconnected),
            Err(_) => Err(CommError::Timeout),
        }
    }

    async fn estop_over_rest(&self) -> Result<(), CommError> {
        let mut last = CommError::Unavailable("no attempt made".into());
        for attempt in 0..=self.config.estop_retries {
            if attempt > 0 {
                tokio::time::sleep(ESTOP_RETRY_DELAY).await;
            }
            match self.rest.estop().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("estop request attempt {} failed: {e}", attempt + 1);
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

#[async_trait]
impl Controller for Channel {
    fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    fn machine_state(&self) -> MachineState {
        self.shared.machine.borrow().clone()
    }

    async fn send_line(&self, line: &str) -> Result<Ack, CommError> {
        let mut connection = self.shared.connection.subscribe();
        if *connection.borrow_and_update() != ConnectionState::Connected {
            return Err(CommError::NotConnected);
        }
        let mut acks = self.shared.acks.subscribe();
        let baseline = acks.borrow_and_update().count;

        let tx = self.shared.line_sender().ok_or(CommError::NotConnected)?;
        tx.send(format!("{}\n", line.trim_end()))
            .map_err(|_| CommError::NotConnected)?;

        let wait = async {
            loop {
                tokio::select! {
                    changed = acks.changed() => {
                        if changed.is_err() {
                            return Err(CommError::Disconnected);
                        }
                        let mark = acks.borrow_and_update().clone();
                        if mark.count > baseline {
                            return Ok(Ack { controller_error: mark.error });
                        }
                    }
                    changed = connection.changed() => {
                        if changed.is_err() || *connection.borrow_and_update() != ConnectionState::Connected {
                            return Err(CommError::Disconnected);
                        }
                    }
                }
            }
        };

        tokio::time::timeout(self.config.ack_timeout(), wait)
            .await
            .map_err(|_| CommError::Timeout)?
    }

    async fn emergency_stop(&self) -> Result<(), CommError> {
        let (stream, rest) = tokio::join!(self.estop_over_stream(), self.estop_over_rest());
        match (stream, rest) {
            (Ok(()), _) | (_, Ok(())) => {
                tracing::warn!("emergency stop delivered");
                Ok(())
            }
            (Err(stream_err), Err(rest_err)) => {
                tracing::error!("emergency stop failed: stream {stream_err}, rest {rest_err}");
                Err(rest_err)
            }
        }
    }

    async fn clear_estop(&self) -> Result<(), CommError> {
        self.shared.estop_epoch.fetch_add(1, Ordering::SeqCst);
        self.rest.clear().await
    }

    async fn pause_feed(&self) -> Result<(), CommError> {
        self.rest.pause().await
    }

    async fn resume_feed(&self) -> Result<(), CommError> {
        self.rest.unpause().await
    }

    async fn stop_program(&self) -> Result<(), CommError> {
        self.rest.stop().await
    }

    async fn controller_time(&self) -> Result<Timestamp, CommError> {
        self.rest.time().await
    }

    fn current_offset(&self) -> Option<ClockOffset> {
        self.clock.current()
    }

    async fn measure_offset(&self) -> Result<ClockOffset, CommError> {
        self.clock.measure(self.rest.as_ref()).await
    }

    async fn list_macros(&self) -> Result<Vec<MacroRef>, CommError> {
        self.rest.list_macros().await
    }

    async fn download_macro(&self, name: &str) -> Result<Macro, CommError> {
        self.rest.download_macro(name).await
    }

    async fn upload_macro(&self, name: &str, content: &str) -> Result<(), CommError> {
        self.rest.upload_macro(name, content).await
    }

    async fn delete_macro(&self, name: &str) -> Result<(), CommError> {
        self.rest.delete_macro(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEvent;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type Peer = WebSocketStream<TcpStream>;

    const WAIT: Duration = Duration::from_secs(3);

    /// A local stand-in for the controller. Every completed WebSocket
    /// handshake is handed to the test; the REST calls made after connecting
    /// fail their handshake and are dropped.
    async fn controller() -> (u16, mpsc::UnboundedReceiver<Peer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(peer) = tokio_tungstenite::accept_async(stream).await {
                        let _ = tx.send(peer);
                    }
                });
            }
        });
        (port, rx)
    }

    async fn connected(port: u16) -> (Arc<Channel>, mpsc::UnboundedReceiver<SessionEvent>) {
        let config = ConnectionConfig {
            host: "127.0.0.1".into(),
            port,
            ack_timeout_ms: 500,
            request_timeout_ms: 200,
            reconnect_base_ms: 50,
            reconnect_cap_ms: 100,
            max_reconnect_attempts: 20,
            estop_retries: 0,
            ..ConnectionConfig::default()
        };
        let (events, rx) = EventSink::channel();
        let channel = Channel::new(
            config,
            Arc::new(ClockEstimator::new()),
            Arc::new(AnnotationLedger::new()),
            events,
        )
        .unwrap();
        channel.connect().await.unwrap();
        (Arc::new(channel), rx)
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
        tokio::time::timeout(WAIT, peers.recv()).await.unwrap().unwrap()
    }

    async fn next_text(peer: &mut Peer) -> String {
        loop {
            match tokio::time::timeout(WAIT, peer.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("stream ended early: {other:?}"),
            }
        }
    }

    fn send_in_background(channel: &Arc<Channel>, line: &'static str) -> tokio::task::JoinHandle<Result<Ack, CommError>> {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send_line(line).await })
    }

    fn offline_channel() -> Channel {
        let config = ConnectionConfig {
            host: "127.0.0.1".into(),
            port: 9,
            ack_timeout_ms: 200,
            request_timeout_ms: 200,
            estop_retries: 1,
            ..ConnectionConfig::default()
        };
        Channel::new(
            config,
            Arc::new(ClockEstimator::new()),
            Arc::new(AnnotationLedger::new()),
            EventSink::disabled(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_line_requires_connection() {
        let channel = offline_channel();
        assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
        assert_eq!(channel.send_line("G0 X1").await, Err(CommError::NotConnected));
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_reported() {
        let channel = offline_channel();
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, CommError::Unavailable(_)));
        assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_estop_fails_loudly_when_unreachable() {
        let channel = offline_channel();
        assert!(channel.emergency_stop().await.is_err());
    }

    #[test]
    fn test_offset_unknown_before_measurement() {
        assert!(offline_channel().current_offset().is_none());
    }

    #[tokio::test]
    async fn test_state_push_acknowledges_line() {
        let (port, mut peers) = controller().await;
        let (channel, _events) = connected(port).await;
        let mut peer = next_peer(&mut peers).await;
        assert_eq!(channel.connection_state(), ConnectionState::Connected);
        assert!(channel.is_active());

        let send = send_in_background(&channel, "G0 X1");
        assert_eq!(next_text(&mut peer).await, "G0 X1\n");
        peer.send(Message::Text(r#"{"xp": 1.0, "xx": "RUNNING"}"#.into())).await.unwrap();

        let ack = tokio::time::timeout(WAIT, send).await.unwrap().unwrap().unwrap();
        assert_eq!(ack, Ack::default());
        assert_eq!(channel.machine_state().position.x, 1.0);
        assert_eq!(channel.raw_state()["xx"], "RUNNING");

        channel.stop().await;
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_error_log_acknowledges_with_message() {
        let (port, mut peers) = controller().await;
        let (channel, _events) = connected(port).await;
        let mut peer = next_peer(&mut peers).await;

        let send = send_in_background(&channel, "G38.2 Z-5");
        assert_eq!(next_text(&mut peer).await, "G38.2 Z-5\n");
        peer.send(Message::Text(r#"{"log": {"level": "error", "msg": "Unsupported G-code"}}"#.into()))
            .await
            .unwrap();

        let ack = tokio::time::timeout(WAIT, send).await.unwrap().unwrap().unwrap();
        assert_eq!(ack.controller_error.as_deref(), Some("Unsupported G-code"));
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (port, mut peers) = controller().await;
        let (channel, _events) = connected(port).await;
        let mut peer = next_peer(&mut peers).await;

        let send = send_in_background(&channel, "G4 P10");
        assert_eq!(next_text(&mut peer).await, "G4 P10\n");
        // Heartbeats keep the link alive but acknowledge nothing
        peer.send(Message::Text(r#"{"heartbeat": 1}"#.into())).await.unwrap();

        let result = tokio::time::timeout(WAIT, send).await.unwrap().unwrap();
        assert_eq!(result, Err(CommError::Timeout));
        assert_eq!(channel.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_drop_fails_line_in_flight_then_reconnects() {
        let (port, mut peers) = controller().await;
        let (channel, mut events) = connected(port).await;
        let mut peer = next_peer(&mut peers).await;

        let send = send_in_background(&channel, "G0 X2");
        assert_eq!(next_text(&mut peer).await, "G0 X2\n");
        drop(peer);

        let result = tokio::time::timeout(WAIT, send).await.unwrap().unwrap();
        assert_eq!(result, Err(CommError::Disconnected));

        let _again = next_peer(&mut peers).await;
        let mut connection = channel.subscribe_connection();
        tokio::time::timeout(WAIT, connection.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ConnectionChanged { state } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
        assert!(channel.is_active());
    }

    #[tokio::test]
    async fn test_emergency_stop_jumps_queued_lines() {
        let (port, mut peers) = controller().await;
        let (channel, _events) = connected(port).await;
        let mut peer = next_peer(&mut peers).await;

        // Queue lines without giving the stream task a chance to run
        let lines = channel.shared.line_sender().unwrap();
        lines.send("G0 X1\n".to_string()).unwrap();
        lines.send("G0 X2\n".to_string()).unwrap();
        channel.emergency_stop().await.unwrap();

        assert_eq!(next_text(&mut peer).await, "!");
        assert_eq!(next_text(&mut peer).await, "G0 X1\n");
        assert_eq!(next_text(&mut peer).await, "G0 X2\n");
    }
}
