use serde::Serialize;

use crate::time::ClockOffset;

/// Failures of the controller link, on either the event stream or the
/// request/response track.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    #[error("not connected to controller")]
    NotConnected,

    #[error("no acknowledgement from controller before the deadline")]
    Timeout,

    #[error("connection to controller dropped")]
    Disconnected,

    #[error("controller unavailable: {0}")]
    Unavailable(String),

    #[error("controller rejected request: {0}")]
    Rejected(String),
}

/// Outcome of a macro synchronization run, or of a single macro within one.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("controller unreachable: {0}")]
    Unreachable(CommError),

    #[error("clock offset {offset} exceeds the drift limit; confirm to continue")]
    ClockDriftWarning { offset: ClockOffset },

    #[error("clock offset to controller is unknown")]
    OffsetUnknown,

    #[error("a macro sync is already running")]
    InProgress,

    #[error("local macro storage: {0}")]
    Local(#[from] std::io::Error),

    #[error("backup failed: {0}")]
    Backup(String),
}

impl SyncError {
    pub(crate) fn upload(err: CommError) -> Self {
        match err {
            CommError::Rejected(reason) => SyncError::UploadFailed(reason),
            other => SyncError::Unreachable(other),
        }
    }

    pub(crate) fn download(err: CommError) -> Self {
        match err {
            CommError::Rejected(reason) => SyncError::DownloadFailed(reason),
            other => SyncError::Unreachable(other),
        }
    }

    pub(crate) fn delete(err: CommError) -> Self {
        match err {
            CommError::Rejected(reason) => SyncError::DeleteFailed(reason),
            other => SyncError::Unreachable(other),
        }
    }
}

/// Errors raised by the execution engine.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("no execution history to go back to")]
    NoHistory,

    #[error("breakpoint hit at line {0}")]
    BreakpointHit(usize),

    #[error("line {0} was already sent in this pass; re-queue it before editing")]
    EditConflict(usize),

    #[error("another command is still in flight")]
    Busy,

    #[error("operation not allowed while {0}")]
    InvalidState(String),

    #[error("no program loaded")]
    NoProgram,

    #[error("line {0} is out of range")]
    LineOutOfRange(usize),

    #[error("controller reported an error for line {index}: {message}")]
    ControllerRejected { index: usize, message: String },

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("EMERGENCY STOP NOT DELIVERED: {0}")]
    EmergencyStopFailed(CommError),
}

/// Crate-level error used by the session, configuration and storage layers.
#[derive(Debug, thiserror::Error)]
pub enum DebuggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{0}")]
    Custom(String),
}

// Errors travel inside observer events as plain strings.
macro_rules! serialize_as_display {
    ($($ty:ty),*) => {
        $(impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        })*
    };
}

serialize_as_display!(CommError, SyncError, ExecError, DebuggerError);

pub type Result<T> = std::result::Result<T, DebuggerError>;
