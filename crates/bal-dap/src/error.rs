use dap::prelude::Command;
use thiserror::Error;

use crate::session::Phase;

#[derive(Error, Debug)]
pub enum BalAdapterError {
    #[error("Unhandled command: {0:?}")]
    UnhandledCommand(Command),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Failed to deserialize launch arguments: {0}")]
    LaunchArgumentsError(serde_json::Error),
    #[error("Missing launch arguments")]
    MissingLaunchArguments,
    #[error("File I/O error: {0}")]
    FileError(String),
    /// A required launch setting is missing.
    #[error("{0}")]
    Configuration(String),
    /// The debug server could not be started or did not compile.
    #[error("{0}")]
    Launch(String),
    #[error("{0}")]
    PortAllocation(String),
    #[error("Debug server connection error: {0}")]
    Connection(String),
    #[error("Unknown thread: {0}")]
    UnknownThread(i64),
    #[error("Unknown variables reference: {0}")]
    UnknownHandle(i64),
    #[error("Frame {frame} is beyond the limit of {limit} frames per thread")]
    FrameLimitExceeded { frame: i64, limit: i64 },
    #[error("No thread is stopped")]
    NoSnapshot,
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },
}

impl BalAdapterError {
    /// Errors that end the debug session instead of failing a single request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BalAdapterError::Configuration(_)
                | BalAdapterError::Launch(_)
                | BalAdapterError::PortAllocation(_)
        )
    }
}
