//! In-memory controller for engine and sync tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::channel::{
    Ack, ConnectionState, Controller, DistanceMode, MachineState, SpindleDirection, Units,
};
use crate::engine::program::{strip_comments, words};
use crate::error::CommError;
use crate::macros::{Macro, MacroRef, Origin};
use crate::time::{ClockOffset, Timestamp};

#[derive(Default)]
struct Link {
    connected: bool,
    /// Lines still allowed through before the link drops.
    budget: Option<usize>,
}

#[derive(Default)]
pub struct FakeController {
    link: Mutex<Link>,
    state: Mutex<MachineState>,
    sent: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
    ack_delay: Mutex<Option<Duration>>,

    estop_fails: AtomicBool,
    estops: AtomicUsize,
    estop_cleared: AtomicBool,
    feed_holds: AtomicUsize,

    offset: Mutex<Option<ClockOffset>>,
    measured: Mutex<Option<ClockOffset>>,
    clock: Mutex<Timestamp>,
    macros: Mutex<BTreeMap<String, (String, Timestamp)>>,
    failing: Mutex<HashSet<String>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

impl FakeController {
    pub fn new() -> Self {
        let fake = Self::default();
        lock(&fake.link).connected = true;
        *lock(&fake.clock) = Timestamp::from_unix_millis(1_700_000_000_000);
        fake
    }

    // ── Link ──

    pub fn set_connected(&self, connected: bool) {
        let mut link = lock(&self.link);
        link.connected = connected;
        link.budget = None;
    }

    pub fn disconnect_after(&self, lines: usize) {
        lock(&self.link).budget = Some(lines);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *lock(&self.ack_delay) = Some(delay);
    }

    pub fn reject_lines_containing(&self, needle: &str) {
        lock(&self.rejected).push(needle.to_string());
    }

    pub fn set_feed(&self, feed: f64) {
        lock(&self.state).feed = Some(feed);
    }

    pub fn sent_lines(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn fail_estop(&self, fail: bool) {
        self.estop_fails.store(fail, Ordering::SeqCst);
    }

    pub fn estop_count(&self) -> usize {
        self.estops.load(Ordering::SeqCst)
    }

    pub fn estop_cleared(&self) -> bool {
        self.estop_cleared.load(Ordering::SeqCst)
    }

    pub fn feed_hold_count(&self) -> usize {
        self.feed_holds.load(Ordering::SeqCst)
    }

    // ── Clock and macros ──

    pub fn set_offset(&self, offset: Option<ClockOffset>) {
        *lock(&self.offset) = offset;
    }

    /// What the next `measure_offset` returns; `None` makes it fail.
    pub fn set_measured_offset(&self, offset: Option<ClockOffset>) {
        *lock(&self.measured) = offset;
    }

    pub fn put_macro(&self, name: &str, content: &str, modified_at: Timestamp) {
        lock(&self.macros).insert(name.to_string(), (content.to_string(), modified_at));
    }

    pub fn remote_macro(&self, name: &str) -> Option<(String, Timestamp)> {
        lock(&self.macros).get(name).cloned()
    }

    pub fn fail_transfers_of(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    fn reachable(&self) -> Result<(), CommError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(CommError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn simulate(&self, line: &str) {
        let command = strip_comments(line);
        let mut state = lock(&self.state);
        let words = words(&command);
        let motion = words.iter().any(|w| w.letter == 'G' && (w.value == 0.0 || w.value == 1.0));
        for w in &words {
            match (w.letter, w.value as i64) {
                ('G', 20) => state.units = Units::Imperial,
                ('G', 21) => state.units = Units::Metric,
                ('G', 90) => state.distance = DistanceMode::Absolute,
                ('G', 91) => state.distance = DistanceMode::Incremental,
                ('M', 3) => state.spindle.direction = SpindleDirection::Clockwise,
                ('M', 4) => state.spindle.direction = SpindleDirection::CounterClockwise,
                ('M', 5) => state.spindle.direction = SpindleDirection::Off,
                _ => {}
            }
        }
        for w in &words {
            match w.letter {
                'F' => state.feed = Some(w.value),
                'S' => state.spindle.speed = w.value,
                'X' | 'Y' | 'Z' if motion => {
                    let incremental = state.distance == DistanceMode::Incremental;
                    let slot = match w.letter {
                        'X' => &mut state.position.x,
                        'Y' => &mut state.position.y,
                        _ => &mut state.position.z,
                    };
                    if incremental {
                        *slot += w.value;
                    } else {
                        *slot = w.value;
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Controller for FakeController {
    fn connection_state(&self) -> ConnectionState {
        if lock(&self.link).connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn machine_state(&self) -> MachineState {
        lock(&self.state).clone()
    }

    async fn send_line(&self, line: &str) -> Result<Ack, CommError> {
        {
            let mut link = lock(&self.link);
            if !link.connected {
                return Err(CommError::NotConnected);
            }
            if let Some(budget) = link.budget.as_mut() {
                if *budget == 0 {
                    link.connected = false;
                    link.budget = None;
                    return Err(CommError::Disconnected);
                }
                *budget -= 1;
            }
        }
        let delay = *lock(&self.ack_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.sent).push(line.to_string());
        let rejected = lock(&self.rejected).iter().any(|needle| line.contains(needle.as_str()));
        if rejected {
            return Ok(Ack {
                controller_error: Some(format!("unsupported command: {line}")),
            });
        }
        self.simulate(line);
        Ok(Ack::default())
    }

    async fn emergency_stop(&self) -> Result<(), CommError> {
        if self.estop_fails.load(Ordering::SeqCst) {
            return Err(CommError::Unavailable("connection refused".into()));
        }
        self.estops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_estop(&self) -> Result<(), CommError> {
        self.estop_cleared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause_feed(&self) -> Result<(), CommError> {
        self.feed_holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_feed(&self) -> Result<(), CommError> {
        Ok(())
    }

    async fn stop_program(&self) -> Result<(), CommError> {
        Ok(())
    }

    async fn controller_time(&self) -> Result<Timestamp, CommError> {
        self.reachable()?;
        Ok(*lock(&self.clock))
    }

    fn current_offset(&self) -> Option<ClockOffset> {
        *lock(&self.offset)
    }

    async fn measure_offset(&self) -> Result<ClockOffset, CommError> {
        let measured = *lock(&self.measured);
        match measured {
            Some(offset) => {
                *lock(&self.offset) = Some(offset);
                Ok(offset)
            }
            None => Err(CommError::Timeout),
        }
    }

    async fn list_macros(&self) -> Result<Vec<MacroRef>, CommError> {
        self.reachable()?;
        Ok(lock(&self.macros)
            .iter()
            .map(|(name, (_, modified_at))| MacroRef {
                name: name.clone(),
                modified_at: *modified_at,
            })
            .collect())
    }

    async fn download_macro(&self, name: &str) -> Result<Macro, CommError> {
        self.reachable()?;
        if lock(&self.failing).contains(name) {
            return Err(CommError::Rejected("HTTP 500: read error".into()));
        }
        let (content, modified_at) = lock(&self.macros)
            .get(name)
            .cloned()
            .ok_or_else(|| CommError::Rejected(format!("HTTP 404: {name}")))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(Macro {
            name: name.to_string(),
            content,
            origin: Origin::Controller,
            modified_at,
        })
    }

    async fn upload_macro(&self, name: &str, content: &str) -> Result<(), CommError> {
        self.reachable()?;
        if lock(&self.failing).contains(name) {
            return Err(CommError::Rejected("HTTP 507: storage full".into()));
        }
        let now = *lock(&self.clock);
        lock(&self.macros).insert(name.to_string(), (content.to_string(), now));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_macro(&self, name: &str) -> Result<(), CommError> {
        self.reachable()?;
        lock(&self.macros).remove(name);
        lock(&self.deleted).push(name.to_string());
        Ok(())
    }
}
