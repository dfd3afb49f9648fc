pub mod backup;
pub mod store;
pub mod sync;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

pub use store::LocalStore;
pub use sync::{FailureKind, MacroSync, SyncFailure, SyncOptions, SyncReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Local,
    Controller,
}

/// A named block of program text. `modified_at` is on the clock of the side
/// it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Macro {
    pub name: String,
    pub content: String,
    pub origin: Origin,
    pub modified_at: Timestamp,
}

/// Canonical listing entry. Controller listings come in several shapes and
/// are normalized into this at the REST boundary. A missing modification
/// time reads as the unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroRef {
    pub name: String,
    pub modified_at: Timestamp,
}

/// Macro names become file names locally and path segments remotely.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.starts_with('.')
        && !name.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_names() {
        assert!(is_valid_name("probe_z"));
        assert!(is_valid_name("tool change 2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("sub/dir"));
        assert!(!is_valid_name(".hidden"));
    }
}
