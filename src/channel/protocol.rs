//! Message shapes on the controller's event stream and the machine state
//! they are merged into.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpindleDirection {
    #[default]
    Off,
    Clockwise,
    CounterClockwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spindle {
    pub direction: SpindleDirection,
    pub speed: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

/// Last known controller state. Only the channel writes it; everyone else
/// gets clones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub position: Position,
    pub feed: Option<f64>,
    pub spindle: Spindle,
    pub units: Units,
    pub distance: DistanceMode,
    pub feed_mode: Option<String>,
    pub plane: Option<String>,
    pub cycle: Option<String>,
    /// Controller status word (`xx`), e.g. `READY`, `RUNNING`, `ESTOPPED`.
    pub status: Option<String>,
    pub line: Option<i64>,
    pub sequence: Option<u64>,
}

impl MachineState {
    /// Merge a state delta. Returns `false` (and changes nothing) when the
    /// delta carries a sequence number older than the one already applied.
    pub fn apply(&mut self, delta: &Map<String, Value>) -> bool {
        let seq = delta
            .get("seq")
            .or_else(|| delta.get("id"))
            .and_then(Value::as_u64);
        if let (Some(incoming), Some(current)) = (seq, self.sequence) {
            if incoming < current {
                return false;
            }
        }

        for (key, value) in delta {
            match key.as_str() {
                "xp" | "posx" => set_f64(&mut self.position.x, value),
                "yp" | "posy" => set_f64(&mut self.position.y, value),
                "zp" | "posz" => set_f64(&mut self.position.z, value),
                "feed" => self.feed = value.as_f64(),
                "speed" => set_f64(&mut self.spindle.speed, value),
                "spindle" => {
                    if let Some(direction) = parse_spindle(value) {
                        self.spindle.direction = direction;
                    }
                }
                "imperial" => {
                    if let Some(imperial) = as_flag(value) {
                        self.units = if imperial { Units::Imperial } else { Units::Metric };
                    }
                }
                "distance_mode" => {
                    if let Some(mode) = value.as_str().and_then(parse_distance) {
                        self.distance = mode;
                    }
                }
                "feed_mode" => self.feed_mode = as_text(value),
                "plane" => self.plane = as_text(value),
                "cycle" => self.cycle = as_text(value),
                "xx" => self.status = as_text(value),
                "line" => self.line = value.as_i64(),
                _ => {}
            }
        }

        if seq.is_some() {
            self.sequence = seq;
        }
        true
    }

    pub fn is_estopped(&self) -> bool {
        self.status.as_deref() == Some("ESTOPPED")
    }
}

fn set_f64(slot: &mut f64, value: &Value) {
    if let Some(v) = value.as_f64() {
        *slot = v;
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn parse_spindle(value: &Value) -> Option<SpindleDirection> {
    match value {
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "off" | "m5" => Some(SpindleDirection::Off),
            "cw" | "m3" | "clockwise" => Some(SpindleDirection::Clockwise),
            "ccw" | "m4" | "counterclockwise" => Some(SpindleDirection::CounterClockwise),
            _ => None,
        },
        Value::Number(n) => match n.as_i64()? {
            0 => Some(SpindleDirection::Off),
            d if d > 0 => Some(SpindleDirection::Clockwise),
            _ => Some(SpindleDirection::CounterClockwise),
        },
        Value::Bool(false) => Some(SpindleDirection::Off),
        _ => None,
    }
}

fn parse_distance(s: &str) -> Option<DistanceMode> {
    match s.to_ascii_uppercase().as_str() {
        "G90" | "ABSOLUTE" => Some(DistanceMode::Absolute),
        "G91" | "INCREMENTAL" => Some(DistanceMode::Incremental),
        _ => None,
    }
}

/// Recursive merge used for the raw controller state: nested objects are
/// merged key by key, anything else replaces the old value.
pub fn merge_json(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, value) in delta {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_json(existing, incoming),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// One decoded event-stream message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Empty,
    Heartbeat(u64),
    StateDelta(Map<String, Value>),
    Log { level: String, message: String },
    /// Valid JSON that is not an object (plain log strings and the like).
    Text(String),
    Malformed { reason: String },
}

pub fn parse_inbound(raw: &str) -> Inbound {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Inbound::Empty;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return Inbound::Malformed { reason: e.to_string() },
    };

    match value {
        Value::Object(map) => {
            if let Some(log) = map.get("log") {
                let level = log
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let message = log
                    .get("msg")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| log.to_string());
                return Inbound::Log { level, message };
            }
            if map.len() == 1 {
                if let Some(beat) = map.get("heartbeat") {
                    return Inbound::Heartbeat(beat.as_u64().unwrap_or(0));
                }
            }
            Inbound::StateDelta(map)
        }
        Value::String(s) => Inbound::Text(s),
        other => Inbound::Text(other.to_string()),
    }
}
