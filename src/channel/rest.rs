//! Request/response track: everything that goes over `/api/...`.

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde_json::{Map, Value};

use super::clock::TimeSource;
use crate::config::ConnectionConfig;
use crate::error::CommError;
use crate::macros::{Macro, MacroRef, Origin};
use crate::time::Timestamp;

pub struct RestClient {
    http: reqwest::Client,
    base: Url,
}

impl RestClient {
    pub fn new(config: &ConnectionConfig) -> Result<Self, CommError> {
        let base = Url::parse(&config.base_url())
            .map_err(|e| CommError::Unavailable(format!("bad controller address: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("gcode-debugger/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(transport)?;
        Ok(Self { http, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, CommError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CommError::Unavailable("controller URL cannot carry a path".into()))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    async fn put_empty(&self, segments: &[&str]) -> Result<(), CommError> {
        let response = self.http.put(self.url(segments)?).send().await.map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    /// Full controller state, merged into the channel after (re)connect.
    pub async fn state(&self) -> Result<Map<String, Value>, CommError> {
        let response = self.http.get(self.url(&["api", "state"])?).send().await.map_err(transport)?;
        let value: Value = check(response).await?.json().await.map_err(transport)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(CommError::Rejected(format!("unexpected state payload: {other}"))),
        }
    }

    /// `/api/time`, falling back to the `Date` header of `HEAD /`.
    pub async fn time(&self) -> Result<Timestamp, CommError> {
        let primary = match self.http.get(self.url(&["api", "time"])?).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                parse_time_body(&body).ok_or_else(|| format!("unparseable time {body:?}"))
            }
            Ok(response) => Err(format!("HTTP {}", response.status().as_u16())),
            Err(e) => Err(e.to_string()),
        };
        let primary_err = match primary {
            Ok(ts) => return Ok(ts),
            Err(e) => e,
        };
        tracing::debug!("time query failed ({primary_err}), trying Date header");

        let response = self
            .http
            .head(self.url(&[])?)
            .send()
            .await
            .map_err(|e| CommError::Unavailable(format!("{primary_err}; fallback: {e}")))?;
        response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Timestamp::parse_http_date)
            .ok_or_else(|| {
                CommError::Unavailable(format!("{primary_err}; fallback: no usable Date header"))
            })
    }

    pub async fn list_macros(&self) -> Result<Vec<MacroRef>, CommError> {
        let response = self.http.get(self.url(&["api", "macros"])?).send().await.map_err(transport)?;
        let value: Value = check(response).await?.json().await.map_err(transport)?;
        Ok(normalize_listing(&value))
    }

    pub async fn download_macro(&self, name: &str) -> Result<Macro, CommError> {
        let response = self
            .http
            .get(self.url(&["api", "macros", name])?)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response).await?;
        let header_time = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(Timestamp::parse_http_date);
        let body = response.text().await.map_err(transport)?;
        Ok(parse_macro_body(name, &body, header_time))
    }

    pub async fn upload_macro(&self, name: &str, content: &str) -> Result<(), CommError> {
        let response = self
            .http
            .put(self.url(&["api", "macros", name])?)
            .json(&serde_json::json!({ "name": name, "content": content }))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    pub async fn delete_macro(&self, name: &str) -> Result<(), CommError> {
        let response = self
            .http
            .delete(self.url(&["api", "macros", name])?)
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    pub async fn estop(&self) -> Result<(), CommError> {
        self.put_empty(&["api", "estop"]).await
    }

    pub async fn clear(&self) -> Result<(), CommError> {
        self.put_empty(&["api", "clear"]).await
    }

    pub async fn pause(&self) -> Result<(), CommError> {
        self.put_empty(&["api", "pause"]).await
    }

    pub async fn unpause(&self) -> Result<(), CommError> {
        self.put_empty(&["api", "unpause"]).await
    }

    pub async fn stop(&self) -> Result<(), CommError> {
        self.put_empty(&["api", "stop"]).await
    }
}

#[async_trait]
impl TimeSource for RestClient {
    async fn controller_time(&self) -> Result<Timestamp, CommError> {
        self.time().await
    }
}

fn transport(e: reqwest::Error) -> CommError {
    if e.is_timeout() {
        CommError::Timeout
    } else {
        CommError::Unavailable(e.to_string())
    }
}

async fn check(response: Response) -> Result<Response, CommError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    Err(CommError::Rejected(if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {body}", status.as_u16())
    }))
}

// ── Payload normalization ──────────────────────────────────────────

/// Accepts a JSON array of entries, an object wrapping one under
/// `files`/`macros`, or an object keyed by macro name.
pub fn normalize_listing(value: &Value) -> Vec<MacroRef> {
    match value {
        Value::Array(items) => items.iter().filter_map(|item| listing_entry(item, None)).collect(),
        Value::Object(map) => {
            for key in ["files", "macros"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.iter().filter_map(|item| listing_entry(item, None)).collect();
                }
            }
            map.iter()
                .filter_map(|(name, item)| listing_entry(item, Some(name)))
                .collect()
        }
        _ => Vec::new(),
    }
}

fn listing_entry(item: &Value, key: Option<&str>) -> Option<MacroRef> {
    match item {
        Value::Object(fields) => {
            if fields.get("type").and_then(Value::as_str) == Some("directory") {
                return None;
            }
            let name = fields.get("name").and_then(Value::as_str).or(key)?;
            let modified_at = match ["modified", "modified_at", "mtime"]
                .iter()
                .find_map(|k| fields.get(*k))
            {
                Some(value) => parse_modified(value).unwrap_or_else(|| {
                    tracing::warn!("macro {name}: unusable modification time {value}");
                    Timestamp::default()
                }),
                None => Timestamp::default(),
            };
            Some(MacroRef { name: name.to_string(), modified_at })
        }
        Value::String(name) if key.is_none() => Some(MacroRef {
            name: name.clone(),
            modified_at: Timestamp::default(),
        }),
        other => key.map(|name| MacroRef {
            name: name.to_string(),
            modified_at: parse_modified(other).unwrap_or_default(),
        }),
    }
}

// Unix seconds and milliseconds overlap nowhere near the present day.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Unix seconds (int or float), unix milliseconds, or ISO-8601 text.
pub fn parse_modified(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            let ms = if n.abs() >= MILLIS_THRESHOLD { n } else { n * 1000.0 };
            Timestamp::from_unix_millis_f64(ms)
        }
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => parse_modified(&Value::from(n)),
            Err(_) => Timestamp::parse_iso8601(s),
        },
        _ => None,
    }
}

fn parse_time_body(body: &str) -> Option<Timestamp> {
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(Value::Object(map)) => map.get("time").and_then(parse_modified),
        Ok(other) => parse_modified(&other),
        Err(_) => Timestamp::parse_iso8601(body),
    }
}

/// Download bodies are raw text, `{content}`, or `{commands: [...]}`.
pub fn parse_macro_body(name: &str, body: &str, header_time: Option<Timestamp>) -> Macro {
    let mut content = body.to_string();
    let mut modified_at = header_time;

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            if let Some(text) = map.get("content").and_then(Value::as_str) {
                content = text.to_string();
            } else if let Some(Value::Array(commands)) = map.get("commands") {
                content = commands
                    .iter()
                    .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            if let Some(ts) = map.get("modified").and_then(parse_modified) {
                modified_at = Some(ts);
            }
        }
        Ok(Value::String(text)) => content = text,
        _ => {}
    }

    Macro {
        name: name.to_string(),
        content,
        origin: Origin::Controller,
        modified_at: modified_at.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ClockOffset;
    use serde_json::json;

    fn names(refs: &[MacroRef]) -> Vec<&str> {
        let mut names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_listing_array_shape() {
        let refs = normalize_listing(&json!([
            {"name": "probe", "modified": 1_700_000_000},
            {"name": "park", "modified": 1_700_000_000_500i64},
            {"name": "sub", "type": "directory"},
            "bare"
        ]));
        assert_eq!(names(&refs), vec!["bare", "park", "probe"]);
        let probe = refs.iter().find(|r| r.name == "probe").unwrap();
        assert_eq!(probe.modified_at.as_unix_millis(), 1_700_000_000_000);
        let park = refs.iter().find(|r| r.name == "park").unwrap();
        assert_eq!(park.modified_at.as_unix_millis(), 1_700_000_000_500);
    }

    #[test]
    fn test_listing_wrapped_and_keyed_shapes() {
        let wrapped = normalize_listing(&json!({"macros": [{"name": "a", "modified": "2025-01-01T00:00:00Z"}]}));
        assert_eq!(wrapped[0].modified_at.as_unix_millis(), 1_735_689_600_000);

        let keyed = normalize_listing(&json!({
            "home": {"modified": 1_700_000_000.25},
            "zero": 1_700_000_100
        }));
        assert_eq!(names(&keyed), vec!["home", "zero"]);
        let home = keyed.iter().find(|r| r.name == "home").unwrap();
        assert_eq!(home.modified_at.as_unix_millis(), 1_700_000_000_250);
    }

    #[test]
    fn test_listing_with_absurd_time_is_not_fatal() {
        let refs = normalize_listing(&json!([
            {"name": "m", "modified": 1e300},
            {"name": "n", "modified": "99999-01-01T00:00:00Z"}
        ]));
        assert_eq!(names(&refs), vec!["m", "n"]);
        for entry in &refs {
            assert_eq!(entry.modified_at, Timestamp::default());
            assert_eq!(entry.modified_at.corrected(ClockOffset::from_millis(5)).as_unix_millis(), 5);
        }
        assert!(parse_modified(&json!(-1e300)).is_none());
        assert!(parse_modified(&json!("1e300")).is_none());
    }

    #[test]
    fn test_macro_body_shapes() {
        assert_eq!(parse_macro_body("m", "G0 X1\nG0 Y1", None).content, "G0 X1\nG0 Y1");
        assert_eq!(parse_macro_body("m", r#"{"content": "M5"}"#, None).content, "M5");
        let from_commands = parse_macro_body("m", r#"{"commands": ["G21", "G90"], "modified": 1700000000}"#, None);
        assert_eq!(from_commands.content, "G21\nG90");
        assert_eq!(from_commands.modified_at.as_unix_millis(), 1_700_000_000_000);
        assert_eq!(from_commands.origin, Origin::Controller);
    }

    #[test]
    fn test_time_body() {
        assert_eq!(
            parse_time_body("2025-01-01T00:00:00Z").map(Timestamp::as_unix_millis),
            Some(1_735_689_600_000)
        );
        assert_eq!(
            parse_time_body(r#""2025-01-01T00:00:00Z""#).map(Timestamp::as_unix_millis),
            Some(1_735_689_600_000)
        );
        assert_eq!(
            parse_time_body(r#"{"time": 1735689600}"#).map(Timestamp::as_unix_millis),
            Some(1_735_689_600_000)
        );
        assert!(parse_time_body("soon").is_none());
    }

    #[test]
    fn test_urls_encode_names() {
        let client = RestClient::new(&ConnectionConfig {
            host: "cnc".into(),
            ..ConnectionConfig::default()
        })
        .unwrap();
        let url = client.url(&["api", "macros", "tool change"]).unwrap();
        assert_eq!(url.as_str(), "http://cnc/api/macros/tool%20change");
    }
}
