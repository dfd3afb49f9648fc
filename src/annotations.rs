//! Inline `(MSG, ...)` and `(DEBUG, ...)` directives.
//!
//! They are shown to the operator as soon as the line is reached. The
//! controller may or may not echo them back later; the ledger remembers what
//! was shown so an echo is not displayed twice.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    Message,
    Debug,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub text: String,
    /// `#5`, `#<tool_dia>` style references found in debug text.
    pub variables: Vec<String>,
}

pub struct AnnotationParser {
    message: Regex,
    debug: Regex,
    variable: Regex,
}

impl AnnotationParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            message: Regex::new(r"(?i)\(\s*MSG\s*,\s*([^)]*)\)")?,
            debug: Regex::new(r"(?i)\(\s*DEBUG\s*,\s*([^)]*)\)")?,
            variable: Regex::new(r"#(\d+|<[^>]+>)")?,
        })
    }

    /// Directives in source order.
    pub fn extract(&self, line: &str) -> Vec<Annotation> {
        let mut found: Vec<(usize, Annotation)> = Vec::new();

        for cap in self.message.captures_iter(line) {
            if let (Some(whole), Some(text)) = (cap.get(0), cap.get(1)) {
                found.push((
                    whole.start(),
                    Annotation {
                        kind: AnnotationKind::Message,
                        text: text.as_str().trim().to_string(),
                        variables: Vec::new(),
                    },
                ));
            }
        }
        for cap in self.debug.captures_iter(line) {
            if let (Some(whole), Some(text)) = (cap.get(0), cap.get(1)) {
                let text = text.as_str().trim().to_string();
                let variables = self
                    .variable
                    .find_iter(&text)
                    .map(|m| m.as_str().to_string())
                    .collect();
                found.push((
                    whole.start(),
                    Annotation {
                        kind: AnnotationKind::Debug,
                        text,
                        variables,
                    },
                ));
            }
        }

        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, a)| a).collect()
    }
}

/// Record of annotations already displayed, keyed by line index and text.
#[derive(Default)]
pub struct AnnotationLedger {
    // value: whether the controller has echoed it yet
    shown: Mutex<HashMap<(usize, String), bool>>,
}

impl AnnotationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<(usize, String), bool>) -> R) -> R {
        match self.shown.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Returns `true` the first time a (line, text) pair is seen.
    pub fn record(&self, line: usize, text: &str) -> bool {
        self.with(|shown| {
            if shown.contains_key(&(line, text.to_string())) {
                false
            } else {
                shown.insert((line, text.to_string()), false);
                true
            }
        })
    }

    /// If `message` echoes an annotation that was shown and not echoed yet,
    /// mark it echoed and return `true`.
    pub fn consume_echo(&self, message: &str) -> bool {
        let text = strip_directive_prefix(message);
        self.with(|shown| {
            let hit = shown
                .iter_mut()
                .filter(|((_, shown_text), echoed)| !**echoed && shown_text == text)
                .min_by_key(|((line, _), _)| *line);
            match hit {
                Some((_, echoed)) => {
                    *echoed = true;
                    true
                }
                None => false,
            }
        })
    }

    /// Going back over a line re-arms its annotations.
    pub fn forget_line(&self, line: usize) {
        self.with(|shown| shown.retain(|(l, _), _| *l != line));
    }

    pub fn clear(&self) {
        self.with(|shown| shown.clear());
    }
}

fn strip_directive_prefix(message: &str) -> &str {
    let trimmed = message.trim();
    for prefix in ["MSG", "DEBUG"] {
        if trimmed.len() >= prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            let rest = trimmed[prefix.len()..].trim_start();
            if let Some(rest) = rest.strip_prefix(':').or_else(|| rest.strip_prefix(',')) {
                return rest.trim();
            }
        }
    }
    trimmed
}
