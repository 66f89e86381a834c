use std::sync::Arc;

use thiserror::Error;

/// Failures of the identity generator.
///
/// Any of these at startup, or once initialised, means the process
/// must not serve traffic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("machine id {0} is out of range, it must be between 0 and {max}", max = crate::ids::MAX_MACHINE_ID)]
    InvalidMachineId(u16),

    #[error("the system clock is set before the id epoch")]
    ClockBeforeEpoch,

    #[error("the system clock moved backwards by {0}ms")]
    ClockMovedBackwards(u64),

    #[error("the system clock did not advance within {0}ms of exhausting the sequence")]
    ClockStalled(u64),

    #[error("the id timestamp space is exhausted")]
    TimestampOverflow,

    #[error("the id generator state is poisoned")]
    Poisoned,
}

/// Errors surfaced by the media retrieval service.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media not found")]
    NotFound,

    #[error("media is {size} bytes which exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors surfaced by the thumbnail service.
///
/// This is cheaply cloneable as a single derivation outcome is shared
/// between every caller waiting on the same derivation key.
#[derive(Debug, Error, Clone)]
pub enum ThumbnailError {
    #[error(transparent)]
    BadInput(#[from] BadInput),

    #[error("media is too large to thumbnail: {0}")]
    TooLargeForDerivation(String),

    #[error("{0:#}")]
    Internal(Arc<anyhow::Error>),
}

impl ThumbnailError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for ThumbnailError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(Arc::new(err))
    }
}

/// A malformed request parameter supplied by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BadInput(pub String);

/// The error telemetry collaborator.
///
/// Internal errors are handed to this before being surfaced to the caller
/// as a generic failure.
pub trait ErrorReporter: Send + Sync + 'static {
    fn capture(&self, err: &anyhow::Error, context: &[(&str, &str)]);
}

/// Reports errors through the tracing subscriber.
#[derive(Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, err: &anyhow::Error, context: &[(&str, &str)]) {
        let context = context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");

        error!(context = %context, "Captured internal error: {:?}", err);
    }
}
