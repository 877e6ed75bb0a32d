//! Error types for the acquisition pipeline

use std::{fmt, io};

/// Failures escalated to the caller of a control operation.
#[derive(Debug)]
pub enum Error {
    /// The device capability layer never initialized
    Unavailable(String),
    /// No device answered the open request
    NotFound(String),
    /// The device refused a parameter outright
    Rejected { param: &'static str, reason: String },
    /// The device was configured but its stream would not start
    StreamStart(String),
    /// The worker thread could not be spawned
    Spawn(io::Error),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unavailable(why) => write!(f, "device capability unavailable: {why}"),
            Error::NotFound(what) => write!(f, "device not found: {what}"),
            Error::Rejected { param, reason } => write!(f, "device rejected {param}: {reason}"),
            Error::StreamStart(why) => write!(f, "failed to start device stream: {why}"),
            Error::Spawn(e) => write!(f, "failed to spawn acquisition worker: {e}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Json(e) => write!(f, "malformed configuration: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn(e) | Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

/// Why a single blocking read produced no samples. These never leave the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The device timeout elapsed before a full batch arrived
    Timeout,
    /// The stream is halted (or was halted while we were blocked)
    NotStreaming,
    /// Anything else the transport reported
    Transport(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Timeout => write!(f, "read timed out"),
            ReadError::NotStreaming => write!(f, "device not streaming"),
            ReadError::Transport(why) => write!(f, "transport error: {why}"),
        }
    }
}

impl std::error::Error for ReadError {}

pub type Result<T, E = Error> = std::result::Result<T, E>;
