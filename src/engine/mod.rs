//! Line-by-line execution against a controller, with breakpoints, skips,
//! edits and reversible steps.

pub mod history;
pub mod program;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::annotations::{AnnotationLedger, AnnotationParser};
use crate::channel::Controller;
use crate::config::EngineConfig;
use crate::error::{CommError, DebuggerError, ExecError};
use crate::events::{EventSink, SessionEvent};
use crate::time::Timestamp;

pub use history::{restore_commands, History, Snapshot};
pub use program::{Line, Program, ProgramStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "target")]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    SteppingTo(usize),
    Stopped,
    EmergencyStopped,
}

impl EngineState {
    fn label(self) -> String {
        match self {
            EngineState::SteppingTo(n) => format!("stepping to line {n}"),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepResult {
    pub index: usize,
    pub transmitted: bool,
    /// Non-fatal error the controller reported for this line.
    pub controller_error: Option<String>,
}

/// Why a `continue` or `step_to` run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    BreakpointHit(usize),
    /// Ran off the end of the program; the engine is paused there.
    Finished,
    Paused(usize),
    Reached(usize),
    Stopped,
    EmergencyStopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GoBack {
    Restored { index: usize, commands: Vec<String> },
    /// Nothing to undo; the cursor did not move.
    NoHistory,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub index: usize,
    pub total_lines: usize,
    pub history_depth: usize,
    pub breakpoints: Vec<usize>,
    pub progress_percent: f64,
    pub program: ProgramStats,
    /// Set when an emergency stop could not be delivered.
    pub estop_failure: Option<String>,
}

struct Inner {
    program: Option<Program>,
    state: EngineState,
    index: usize,
    breakpoints: BTreeSet<usize>,
    history: History,
    /// Lines transmitted in the current pass.
    sent: HashSet<usize>,
    /// Breakpoint the last run halted on. Only a run starting there again
    /// may pass it; any other cursor move forgets it.
    resume_from: Option<usize>,
    estop_failure: Option<String>,
}

/// Clears the busy flag when the operation holding it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Engine<C: Controller + ?Sized> {
    controller: Arc<C>,
    config: EngineConfig,
    events: EventSink,
    ledger: Arc<AnnotationLedger>,
    parser: AnnotationParser,
    inner: Mutex<Inner>,
    busy: AtomicBool,
    pause_requested: AtomicBool,
    feed_held: AtomicBool,
}

impl<C: Controller + ?Sized> Engine<C> {
    pub fn new(
        controller: Arc<C>,
        config: EngineConfig,
        ledger: Arc<AnnotationLedger>,
        events: EventSink,
    ) -> Result<Self, DebuggerError> {
        let history = History::new(config.max_history);
        Ok(Self {
            controller,
            config,
            events,
            ledger,
            parser: AnnotationParser::new()?,
            inner: Mutex::new(Inner {
                program: None,
                state: EngineState::Idle,
                index: 0,
                breakpoints: BTreeSet::new(),
                history,
                sent: HashSet::new(),
                resume_from: None,
                estop_failure: None,
            }),
            busy: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            feed_held: AtomicBool::new(false),
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// One command at a time; a second caller is turned away, not queued.
    fn acquire(&self) -> Result<BusyGuard<'_>, ExecError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ExecError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    fn set_state(&self, state: EngineState) {
        let changed = {
            let mut inner = self.inner();
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            tracing::debug!("engine {}", state.label());
            self.events.emit(SessionEvent::EngineState { state });
        }
    }

    /// Move to `Paused` unless a stop of either kind got there first.
    fn settle_paused(&self) {
        let state = self.inner().state;
        if !matches!(state, EngineState::Stopped | EngineState::EmergencyStopped) {
            self.set_state(EngineState::Paused);
        }
    }

    fn require(&self, allowed: &[EngineState]) -> Result<(), ExecError> {
        let inner = self.inner();
        if inner.program.is_none() {
            return Err(ExecError::NoProgram);
        }
        if allowed.contains(&inner.state) {
            Ok(())
        } else {
            Err(ExecError::InvalidState(inner.state.label()))
        }
    }

    fn move_to(&self, index: usize) {
        {
            let mut inner = self.inner();
            inner.index = index;
            inner.resume_from = None;
        }
        self.events.emit(SessionEvent::LineChanged { index });
    }

    fn dangerous_move(&self, command: &str) -> Option<String> {
        let words = program::words(command);
        let rapid = words.iter().any(|w| w.letter == 'G' && w.value == 0.0);
        if rapid && words.iter().any(|w| w.letter == 'Z' && w.value < 0.0) {
            return Some(format!("rapid move to negative Z: {command}"));
        }
        words
            .iter()
            .find(|w| w.letter == 'F' && w.value > self.config.max_feed)
            .map(|w| format!("feed F{} exceeds the {} limit: {command}", w.value, self.config.max_feed))
    }

    async fn release_feed_hold(&self) {
        if self.feed_held.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.controller.resume_feed().await {
                tracing::warn!("could not release feed hold: {e}");
                self.events.emit(SessionEvent::Warning {
                    message: format!("could not release feed hold: {e}"),
                });
            }
        }
    }

    /// Execute the line under the cursor. The caller holds the busy flag and
    /// has checked the state.
    async fn step_once(&self) -> Result<StepResult, ExecError> {
        let (index, line) = {
            let inner = self.inner();
            let program = inner.program.as_ref().ok_or(ExecError::NoProgram)?;
            let line = program
                .get(inner.index)
                .cloned()
                .ok_or(ExecError::LineOutOfRange(inner.index))?;
            (inner.index, line)
        };

        // Shown before transmission and whether or not the link is up.
        for annotation in self.parser.extract(&line.text) {
            if self.ledger.record(index, &annotation.text) {
                self.events.emit(SessionEvent::Annotation {
                    line: index,
                    kind: annotation.kind,
                    text: annotation.text,
                });
            }
        }

        let command = line.command();
        let transmitted = !command.is_empty();
        if transmitted {
            if let Some(warning) = self.dangerous_move(&command) {
                tracing::warn!("line {index}: {warning}");
                self.events.emit(SessionEvent::Warning { message: warning });
            }
        }

        self.inner().history.push(Snapshot {
            line_index: index,
            machine_state: self.controller.machine_state(),
            timestamp: Timestamp::now(),
            transmitted,
        });

        if !transmitted {
            self.move_to(index + 1);
            return Ok(StepResult {
                index,
                transmitted,
                controller_error: None,
            });
        }

        match self.controller.send_line(line.text.trim()).await {
            Err(e) => {
                self.inner().history.pop();
                self.settle_paused();
                tracing::warn!("line {index} not delivered: {e}");
                self.events.emit(SessionEvent::Error {
                    message: format!("line {index} not delivered: {e}"),
                });
                Err(ExecError::Comm(e))
            }
            Ok(ack) => {
                if let Some(message) = ack.controller_error.clone() {
                    if self.config.fatal_controller_errors {
                        {
                            let mut inner = self.inner();
                            inner.history.pop();
                            inner.sent.insert(index);
                        }
                        self.settle_paused();
                        self.events.emit(SessionEvent::Error {
                            message: format!("line {index} rejected: {message}"),
                        });
                        return Err(ExecError::ControllerRejected { index, message });
                    }
                    tracing::info!("line {index}: controller reported {message}");
                }
                self.inner().sent.insert(index);
                self.move_to(index + 1);
                Ok(StepResult {
                    index,
                    transmitted,
                    controller_error: ack.controller_error,
                })
            }
        }
    }

    async fn run_until(&self, target: Option<usize>) -> Result<RunOutcome, ExecError> {
        let mut resume_from = self.inner().resume_from.take();
        loop {
            let (state, index, len, at_breakpoint) = {
                let inner = self.inner();
                let len = inner.program.as_ref().map(Program::len).unwrap_or(0);
                (inner.state, inner.index, len, inner.breakpoints.contains(&inner.index))
            };

            match state {
                EngineState::Stopped => return Ok(RunOutcome::Stopped),
                EngineState::EmergencyStopped => return Ok(RunOutcome::EmergencyStopped),
                _ => {}
            }
            if target == Some(index) {
                self.set_state(EngineState::Paused);
                return Ok(RunOutcome::Reached(index));
            }
            if index >= len {
                self.set_state(EngineState::Paused);
                return Ok(RunOutcome::Finished);
            }
            if self.pause_requested.swap(false, Ordering::SeqCst) {
                self.set_state(EngineState::Paused);
                return Ok(RunOutcome::Paused(index));
            }
            if at_breakpoint && resume_from != Some(index) {
                self.inner().resume_from = Some(index);
                self.set_state(EngineState::Paused);
                self.events.emit(SessionEvent::BreakpointHit { index });
                return Ok(RunOutcome::BreakpointHit(index));
            }
            resume_from = None;

            self.step_once().await?;

            if self.config.line_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.line_delay_ms)).await;
            }
        }
    }

    // ── Program ─────────────────────────────────────────────────────

    /// Install a program and pause at its first line. Breakpoints, history
    /// and the sent set start empty.
    pub fn load(&self, program: Program) -> Result<(), ExecError> {
        let _busy = self.acquire()?;
        {
            let mut inner = self.inner();
            if matches!(
                inner.state,
                EngineState::Running | EngineState::SteppingTo(_) | EngineState::EmergencyStopped
            ) {
                return Err(ExecError::InvalidState(inner.state.label()));
            }
            tracing::info!("loaded program with {} lines", program.len());
            inner.program = Some(program);
            inner.index = 0;
            inner.breakpoints.clear();
            inner.history.clear();
            inner.sent.clear();
            inner.resume_from = None;
        }
        self.ledger.clear();
        self.set_state(EngineState::Paused);
        self.events.emit(SessionEvent::LineChanged { index: 0 });
        Ok(())
    }

    pub fn program(&self) -> Option<Program> {
        self.inner().program.clone()
    }

    pub fn line(&self, index: usize) -> Option<Line> {
        self.inner().program.as_ref().and_then(|p| p.get(index).cloned())
    }

    /// Rewrite a line. Lines already sent in this pass must be re-queued
    /// first.
    pub fn edit_line(&self, index: usize, text: &str) -> Result<(), ExecError> {
        {
            let mut inner = self.inner();
            if inner.sent.contains(&index) {
                return Err(ExecError::EditConflict(index));
            }
            let program = inner.program.as_mut().ok_or(ExecError::NoProgram)?;
            if !program.edit(index, text) {
                return Err(ExecError::LineOutOfRange(index));
            }
        }
        self.ledger.forget_line(index);
        self.events.emit(SessionEvent::LineEdited {
            index,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Returns whether the line had been sent.
    pub fn requeue_line(&self, index: usize) -> Result<bool, ExecError> {
        let mut inner = self.inner();
        let len = inner.program.as_ref().ok_or(ExecError::NoProgram)?.len();
        if index >= len {
            return Err(ExecError::LineOutOfRange(index));
        }
        Ok(inner.sent.remove(&index))
    }

    // ── Breakpoints ─────────────────────────────────────────────────

    fn check_line(&self, index: usize) -> Result<(), ExecError> {
        let inner = self.inner();
        let len = inner.program.as_ref().ok_or(ExecError::NoProgram)?.len();
        if index < len {
            Ok(())
        } else {
            Err(ExecError::LineOutOfRange(index))
        }
    }

    /// Returns whether a breakpoint is now set at `index`.
    pub fn toggle_breakpoint(&self, index: usize) -> Result<bool, ExecError> {
        self.check_line(index)?;
        let mut inner = self.inner();
        if inner.breakpoints.remove(&index) {
            Ok(false)
        } else {
            inner.breakpoints.insert(index);
            if inner.resume_from == Some(index) {
                inner.resume_from = None;
            }
            Ok(true)
        }
    }

    pub fn set_breakpoint(&self, index: usize) -> Result<(), ExecError> {
        self.check_line(index)?;
        let mut inner = self.inner();
        if inner.breakpoints.insert(index) && inner.resume_from == Some(index) {
            inner.resume_from = None;
        }
        Ok(())
    }

    pub fn clear_breakpoint(&self, index: usize) -> bool {
        self.inner().breakpoints.remove(&index)
    }

    pub fn breakpoints(&self) -> Vec<usize> {
        self.inner().breakpoints.iter().copied().collect()
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Execute exactly one line.
    pub async fn step_over(&self) -> Result<StepResult, ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;
        self.release_feed_hold().await;
        self.inner().resume_from = None;
        self.step_once().await
    }

    /// Run until a breakpoint, the end of the program, or a pause/stop.
    pub async fn continue_run(&self) -> Result<RunOutcome, ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;
        self.pause_requested.store(false, Ordering::SeqCst);
        self.release_feed_hold().await;
        self.set_state(EngineState::Running);
        self.run_until(None).await
    }

    /// Like `continue_run`, but also halts on reaching `target`.
    pub async fn step_to(&self, target: usize) -> Result<RunOutcome, ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;
        {
            let inner = self.inner();
            let len = inner.program.as_ref().map(Program::len).unwrap_or(0);
            if target > len {
                return Err(ExecError::LineOutOfRange(target));
            }
            if target < inner.index {
                return Err(ExecError::InvalidState(format!(
                    "line {target} is behind the cursor at {}",
                    inner.index
                )));
            }
        }
        self.pause_requested.store(false, Ordering::SeqCst);
        self.release_feed_hold().await;
        self.set_state(EngineState::SteppingTo(target));
        self.run_until(Some(target)).await
    }

    /// Undo the most recent step: restore the machine state captured before
    /// it and move the cursor back to that line.
    pub async fn go_back(&self) -> Result<GoBack, ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;

        let Some(snapshot) = self.inner().history.pop() else {
            return Ok(GoBack::NoHistory);
        };

        let commands = if snapshot.transmitted {
            restore_commands(&snapshot.machine_state, self.config.safe_z)
        } else {
            Vec::new()
        };

        for command in &commands {
            match self.controller.send_line(command).await {
                Ok(ack) => {
                    if let Some(message) = ack.controller_error {
                        tracing::warn!("restore {command:?}: controller reported {message}");
                    }
                }
                Err(e) => {
                    self.inner().history.push(snapshot);
                    self.events.emit(SessionEvent::Error {
                        message: format!("go back interrupted at {command:?}: {e}"),
                    });
                    return Err(ExecError::Comm(e));
                }
            }
        }

        let index = snapshot.line_index;
        self.inner().sent.remove(&index);
        self.ledger.forget_line(index);
        self.move_to(index);
        Ok(GoBack::Restored { index, commands })
    }

    /// Advance past the current line without sending it.
    pub fn skip_line(&self) -> Result<usize, ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;
        let (index, len) = {
            let inner = self.inner();
            (inner.index, inner.program.as_ref().map(Program::len).unwrap_or(0))
        };
        if index >= len {
            return Err(ExecError::LineOutOfRange(index));
        }
        self.move_to(index + 1);
        Ok(index + 1)
    }

    /// Advance to `target` without sending anything in between.
    pub fn skip_to(&self, target: usize) -> Result<(), ExecError> {
        let _busy = self.acquire()?;
        self.require(&[EngineState::Paused])?;
        {
            let inner = self.inner();
            let len = inner.program.as_ref().map(Program::len).unwrap_or(0);
            if target > len {
                return Err(ExecError::LineOutOfRange(target));
            }
            if target < inner.index {
                return Err(ExecError::InvalidState(format!(
                    "line {target} is behind the cursor at {}",
                    inner.index
                )));
            }
        }
        self.move_to(target);
        Ok(())
    }

    /// Ask a running `continue`/`step_to` to halt before its next line, and
    /// put the controller into feed hold.
    pub async fn pause(&self) -> Result<(), ExecError> {
        let state = self.inner().state;
        if !matches!(state, EngineState::Running | EngineState::SteppingTo(_)) {
            return Ok(());
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        match self.controller.pause_feed().await {
            Ok(()) => self.feed_held.store(true, Ordering::SeqCst),
            Err(e) => {
                tracing::warn!("feed hold failed: {e}");
                self.events.emit(SessionEvent::Warning {
                    message: format!("feed hold failed: {e}"),
                });
            }
        }
        Ok(())
    }

    /// End the session's transmission. Only `reset` leaves `Stopped`.
    pub async fn stop(&self) -> Result<(), ExecError> {
        let state = self.inner().state;
        if !matches!(
            state,
            EngineState::Running | EngineState::Paused | EngineState::SteppingTo(_)
        ) {
            return Err(ExecError::InvalidState(state.label()));
        }
        self.set_state(EngineState::Stopped);
        self.pause_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.controller.stop_program().await {
            tracing::warn!("controller stop request failed: {e}");
            self.events.emit(SessionEvent::Warning {
                message: format!("controller stop request failed: {e}"),
            });
        }
        Ok(())
    }

    /// Always available, never waits for the line in flight. A failure to
    /// deliver is recorded and stays visible in `status()` until a reset.
    pub async fn emergency_stop(&self) -> Result<(), ExecError> {
        self.set_state(EngineState::EmergencyStopped);
        self.pause_requested.store(true, Ordering::SeqCst);
        tracing::warn!("emergency stop requested");

        match self.controller.emergency_stop().await {
            Ok(()) => {
                self.inner().estop_failure = None;
                Ok(())
            }
            Err(e) => {
                let message = format!("EMERGENCY STOP NOT DELIVERED: {e}");
                tracing::error!("{message}");
                self.inner().estop_failure = Some(message.clone());
                self.events.emit(SessionEvent::EmergencyStopFailed { message });
                Err(ExecError::EmergencyStopFailed(e))
            }
        }
    }

    /// Start a new pass at line 0. Leaving an emergency stop clears it on
    /// the controller first.
    pub async fn reset(&self) -> Result<(), ExecError> {
        let _busy = self.acquire()?;
        let state = self.inner().state;
        if state == EngineState::EmergencyStopped {
            self.controller.clear_estop().await.map_err(|e: CommError| {
                self.events.emit(SessionEvent::Error {
                    message: format!("could not clear emergency stop: {e}"),
                });
                ExecError::Comm(e)
            })?;
        }

        let has_program = {
            let mut inner = self.inner();
            inner.index = 0;
            inner.history.clear();
            inner.sent.clear();
            inner.resume_from = None;
            inner.estop_failure = None;
            inner.program.is_some()
        };
        self.ledger.clear();
        self.pause_requested.store(false, Ordering::SeqCst);
        self.feed_held.store(false, Ordering::SeqCst);
        self.set_state(if has_program {
            EngineState::Paused
        } else {
            EngineState::Idle
        });
        self.events.emit(SessionEvent::LineChanged { index: 0 });
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.inner().state
    }

    pub fn current_index(&self) -> usize {
        self.inner().index
    }

    pub fn history_depth(&self) -> usize {
        self.inner().history.len()
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.inner();
        let (total_lines, program) = inner
            .program
            .as_ref()
            .map(|p| (p.len(), p.stats()))
            .unwrap_or_default();
        let progress_percent = if total_lines == 0 {
            0.0
        } else {
            inner.index as f64 / total_lines as f64 * 100.0
        };
        EngineStatus {
            state: inner.state,
            index: inner.index,
            total_lines,
            history_depth: inner.history.len(),
            breakpoints: inner.breakpoints.iter().copied().collect(),
            progress_percent,
            program,
            estop_failure: inner.estop_failure.clone(),
        }
    }
}
