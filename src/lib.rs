//! Line-by-line G-code debugging and macro synchronization for networked
//! CNC controllers.

pub mod annotations;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logs;
pub mod macros;
pub mod session;
pub mod time;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CommError, DebuggerError, ExecError, Result, SyncError};
pub use session::Session;
