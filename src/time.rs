//! Wall-clock timestamps and signed clock offsets.
//!
//! Everything is unix milliseconds with pure calendar arithmetic, so no date
//! library is pulled in for the two formats the controller speaks (ISO 8601
//! from `/api/time` and the HTTP `Date` header).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time as unix milliseconds. Which clock it was read from is up
/// to the holder; controller-side values only become comparable to local
/// ones after adding a [`ClockOffset`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_unix_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// `None` for NaN, infinities and instants outside years 0001-9999.
    pub fn from_unix_millis_f64(ms: f64) -> Option<Self> {
        let ms = ms.round();
        if ms.is_finite() && (MIN_MILLIS as f64..=MAX_MILLIS as f64).contains(&ms) {
            Some(Self(ms as i64))
        } else {
            None
        }
    }

    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(d.as_millis() as i64),
            Err(e) => Self(-(e.duration().as_millis() as i64)),
        }
    }

    /// Clamped to years 0001-9999.
    pub fn to_system_time(self) -> SystemTime {
        let ms = self.0.clamp(MIN_MILLIS, MAX_MILLIS);
        if ms >= 0 {
            UNIX_EPOCH + Duration::from_millis(ms as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
        }
    }

    /// Shift a controller-clock reading onto the local clock.
    pub fn corrected(self, offset: ClockOffset) -> Self {
        Self(self.0.saturating_add(offset.as_millis()))
    }

    /// Signed distance `self - earlier` in milliseconds.
    pub fn millis_since(self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Parse ISO 8601 as the controller prints it: `YYYY-MM-DD[T ]HH:MM:SS`
    /// with optional fractional seconds and an optional `Z` or `±HH:MM`
    /// suffix. Values without a zone are taken as UTC.
    pub fn parse_iso8601(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() < 19 || !s.is_char_boundary(19) {
            return None;
        }
        let bytes = s.as_bytes();
        if bytes[4] != b'-' || bytes[7] != b'-' || bytes[13] != b':' || bytes[16] != b':' {
            return None;
        }
        if bytes[10] != b'T' && bytes[10] != b't' && bytes[10] != b' ' {
            return None;
        }
        if !s[0..4].bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year: i64 = s[0..4].parse().ok()?;
        let month: i64 = s[5..7].parse().ok()?;
        let day: i64 = s[8..10].parse().ok()?;
        let hour: i64 = s[11..13].parse().ok()?;
        let min: i64 = s[14..16].parse().ok()?;
        let sec: i64 = s[17..19].parse().ok()?;

        let mut rest = &s[19..];
        let mut millis = 0i64;
        if let Some(frac) = rest.strip_prefix('.') {
            let digits = frac.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            // Only the first three digits matter at millisecond resolution.
            let mut scaled = frac[..digits.min(3)].to_string();
            while scaled.len() < 3 {
                scaled.push('0');
            }
            millis = scaled.parse().ok()?;
            rest = &frac[digits..];
        }

        let zone_secs = match rest {
            "" | "Z" | "z" => 0,
            zone if zone.len() == 6 && zone.as_bytes()[3] == b':' => {
                let sign = match zone.as_bytes()[0] {
                    b'+' => 1,
                    b'-' => -1,
                    _ => return None,
                };
                let zh: i64 = zone[1..3].parse().ok()?;
                let zm: i64 = zone[4..6].parse().ok()?;
                sign * (zh * 3600 + zm * 60)
            }
            _ => return None,
        };

        let secs = civil_seconds(year, month, day, hour, min, sec)? - zone_secs;
        Some(Self(secs * 1000 + millis))
    }

    /// Parse an HTTP `Date` header (IMF-fixdate, e.g.
    /// `Sun, 06 Nov 1994 08:49:37 GMT`).
    pub fn parse_http_date(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 6 || parts[5] != "GMT" {
            return None;
        }
        let day: i64 = parts[1].parse().ok()?;
        let month = match parts[2] {
            "Jan" => 1,
            "Feb" => 2,
            "Mar" => 3,
            "Apr" => 4,
            "May" => 5,
            "Jun" => 6,
            "Jul" => 7,
            "Aug" => 8,
            "Sep" => 9,
            "Oct" => 10,
            "Nov" => 11,
            "Dec" => 12,
            _ => return None,
        };
        if parts[3].len() != 4 {
            return None;
        }
        let year: i64 = parts[3].parse().ok()?;
        let mut clock = parts[4].splitn(3, ':');
        let hour: i64 = clock.next()?.parse().ok()?;
        let min: i64 = clock.next()?.parse().ok()?;
        let sec: i64 = clock.next()?.parse().ok()?;

        Some(Self(civil_seconds(year, month, day, hour, min, sec)? * 1000))
    }

    /// Format as ISO 8601 UTC with second precision (e.g. "2025-06-15T10:30:00Z").
    pub fn to_iso8601(self) -> String {
        let secs = self.0.div_euclid(1000);
        let days = secs.div_euclid(86400);
        let rem = secs.rem_euclid(86400);
        let (year, month, day) = civil_from_days(days);
        format!(
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
            rem / 3600,
            (rem / 60) % 60,
            rem % 60
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Signed difference `local_time - controller_time`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockOffset(i64);

impl ClockOffset {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn exceeds(self, limit: Duration) -> bool {
        u128::from(self.0.unsigned_abs()) > limit.as_millis()
    }
}

impl fmt::Display for ClockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { '-' } else { '+' };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:03}s", abs / 1000, abs % 1000)
    }
}

/// 0001-01-01T00:00:00Z
const MIN_MILLIS: i64 = -62_135_596_800_000;
/// 9999-12-31T23:59:59.999Z
const MAX_MILLIS: i64 = 253_402_300_799_999;

/// Seconds since the epoch for a calendar time in years 0001-9999, or
/// `None` if any field is out of range.
fn civil_seconds(year: i64, month: i64, day: i64, hour: i64, min: i64, sec: i64) -> Option<i64> {
    let valid = (1..=9999).contains(&year)
        && (1..=12).contains(&month)
        && (1..=31).contains(&day)
        && (0..=23).contains(&hour)
        && (0..=59).contains(&min)
        && (0..=60).contains(&sec);
    valid.then(|| days_from_civil(year, month, day) * 86_400 + hour * 3600 + min * 60 + sec)
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
