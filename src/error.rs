use crate::recorder::CollectorRecorder;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("IO error in metrics collector: {0}")]
    Io(#[from] std::io::Error),
    #[error("collector has already been started")]
    AlreadyStarted,
    #[error("collector has not been started")]
    NotStarted,
    #[error("collector did not become ready within {0:?}")]
    Timeout(Duration),
    #[error("collector failed to start: {0}")]
    StartFailed(String),
    #[error("collector has been stopped")]
    Stopped,
    #[error("counter amounts must be non-negative, got {0}")]
    InvalidAmount(f64),
    #[error("invalid metric name {0:?}")]
    InvalidName(String),
    #[error("invalid label name {0:?}")]
    InvalidLabel(String),
    #[error("{0} must not contain line breaks, got {1:?}")]
    InvalidField(&'static str, String),
    #[error("connection to the collector leader is closed")]
    Disconnected,
    #[error("failed to set CollectorRecorder: {0}")]
    Recorder(#[from] metrics::SetRecorderError<CollectorRecorder>),
}

/// Framing failures are fatal to the connection they arrived on, never to the process.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
}
