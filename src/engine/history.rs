use serde::Serialize;
use std::collections::VecDeque;

use crate::channel::{DistanceMode, MachineState, SpindleDirection, Units};
use crate::time::Timestamp;

/// Controller state captured right before a line was sent.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub line_index: usize,
    pub machine_state: MachineState,
    pub timestamp: Timestamp,
    /// Comment-only lines are stepped without transmission; undoing them
    /// needs no motion.
    pub transmitted: bool,
}

/// The go-back stack. With a limit set, the oldest entries fall off.
#[derive(Debug, Default)]
pub struct History {
    stack: VecDeque<Snapshot>,
    limit: Option<usize>,
}

impl History {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            stack: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.stack.push_back(snapshot);
        if let Some(limit) = self.limit {
            while self.stack.len() > limit.max(1) {
                self.stack.pop_front();
            }
        }
    }

    pub fn pop(&mut self) -> Option<Snapshot> {
        self.stack.pop_back()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

/// Commands that bring the machine back to `state`: units and absolute mode
/// first, then up to `safe_z`, across in X/Y, down to Z, and finally feed,
/// spindle and the original distance mode.
pub fn restore_commands(state: &MachineState, safe_z: f64) -> Vec<String> {
    let mut commands = Vec::with_capacity(8);
    commands.push(
        match state.units {
            Units::Imperial => "G20",
            Units::Metric => "G21",
        }
        .to_string(),
    );
    commands.push("G90".to_string());
    commands.push(format!("G0 Z{}", num(safe_z)));
    commands.push(format!(
        "G0 X{} Y{}",
        num(state.position.x),
        num(state.position.y)
    ));
    commands.push(format!("G0 Z{}", num(state.position.z)));
    if let Some(feed) = state.feed {
        commands.push(format!("F{}", num(feed)));
    }
    let speed = num(state.spindle.speed);
    commands.push(match state.spindle.direction {
        SpindleDirection::Clockwise => format!("M3 S{speed}"),
        SpindleDirection::CounterClockwise => format!("M4 S{speed}"),
        SpindleDirection::Off => format!("M5 S{speed}"),
    });
    if state.distance == DistanceMode::Incremental {
        commands.push("G91".to_string());
    }
    commands
}

/// Up to four decimals without trailing zeros.
fn num(value: f64) -> String {
    let s = format!("{value:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}
