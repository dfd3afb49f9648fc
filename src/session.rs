use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::annotations::AnnotationLedger;
use crate::channel::{Channel, ClockEstimator, ConnectionState, Controller};
use crate::config::DebuggerConfig;
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::events::{EventSink, SessionEvent};
use crate::macros::{LocalStore, MacroSync, SyncOptions};

pub use crate::events::{dispatch, Observer};

/// One debugging session against one controller. Collaborators share the
/// channel through `Arc` handles; nothing here is global.
pub struct Session {
    config: DebuggerConfig,
    channel: Arc<Channel>,
    engine: Arc<Engine<Channel>>,
    sync: Arc<MacroSync<Channel>>,
    clock: Arc<ClockEstimator>,
    events: EventSink,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    watching: Arc<AtomicBool>,
}

impl Session {
    /// Build the session and hand back the event stream for `dispatch`.
    pub fn new(config: DebuggerConfig) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let (events, rx) = EventSink::channel();
        let clock = Arc::new(ClockEstimator::new());
        let ledger = Arc::new(AnnotationLedger::new());

        let channel = Arc::new(Channel::new(
            config.connection.clone(),
            clock.clone(),
            ledger.clone(),
            events.clone(),
        )?);
        let engine = Arc::new(Engine::new(
            channel.clone(),
            config.debugger.clone(),
            ledger,
            events.clone(),
        )?);
        let store = LocalStore::new(config.macros.directory_path(), &config.macros.extensions);
        let sync = Arc::new(MacroSync::new(
            channel.clone(),
            store,
            config.macros.backup_limit,
            events.clone(),
        ));

        let session = Self {
            config,
            channel,
            engine,
            sync,
            clock,
            events,
            watcher: Arc::new(Mutex::new(None)),
            watching: Arc::new(AtomicBool::new(false)),
        };
        Ok((session, rx))
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn engine(&self) -> Arc<Engine<Channel>> {
        self.engine.clone()
    }

    pub fn macros(&self) -> Arc<MacroSync<Channel>> {
        self.sync.clone()
    }

    pub fn clock(&self) -> Arc<ClockEstimator> {
        self.clock.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state()
    }

    /// Connect, arming the sync-on-connect watcher first so the initial
    /// connection is seen too.
    pub async fn connect(&self) -> Result<()> {
        if self.config.macros.sync_on_connect {
            self.start_watcher().await;
        }
        self.channel.connect().await?;
        Ok(())
    }

    async fn start_watcher(&self) {
        let mut guard = self.watcher.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let mut connection = self.channel.subscribe_connection();
        let sync = self.sync.clone();
        let events = self.events.clone();
        let watching = self.watching.clone();
        watching.store(true, Ordering::SeqCst);

        *guard = Some(tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                if !watching.load(Ordering::SeqCst) {
                    break;
                }
                if *connection.borrow_and_update() != ConnectionState::Connected {
                    continue;
                }
                match sync.sync(SyncOptions::default()).await {
                    Ok(report) => tracing::debug!("sync on connect: {}", report.summary()),
                    Err(SyncError::InProgress) => {}
                    Err(e @ SyncError::ClockDriftWarning { .. }) => {
                        events.emit(SessionEvent::Warning {
                            message: format!("macro sync skipped: {e}"),
                        });
                    }
                    Err(e) => {
                        tracing::warn!("sync on connect failed: {e}");
                        events.emit(SessionEvent::Error {
                            message: format!("macro sync failed: {e}"),
                        });
                    }
                }
            }
        }));
    }

    /// Tear down the watcher and the connection loop.
    pub async fn shutdown(&self) {
        self.watching.store(false, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
        self.channel.stop().await;
    }

    fn kill_sync(&self) {
        self.watching.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.watcher.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.channel.kill_sync();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::program::Program;
    use crate::engine::EngineState;

    fn offline_config(dir: &std::path::Path) -> DebuggerConfig {
        let mut config = DebuggerConfig::default();
        config.connection.host = "127.0.0.1".into();
        config.connection.port = 9;
        config.connection.request_timeout_ms = 200;
        config.connection.ack_timeout_ms = 200;
        config.macros.directory = dir.to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_offline_session_still_shows_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = Session::new(offline_config(dir.path())).unwrap();
        assert!(session.connect().await.is_err());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let engine = session.engine();
        engine.load(Program::parse("(MSG, Hello)\nG0 X1")).unwrap();
        engine.step_over().await.unwrap();
        assert!(engine.step_over().await.is_err());
        assert_eq!(engine.state(), EngineState::Paused);
        assert_eq!(engine.current_index(), 1);

        let mut saw_message = false;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Annotation { text, .. } = event {
                saw_message |= text == "Hello";
            }
        }
        assert!(saw_message);
        session.shutdown().await;
    }
}
