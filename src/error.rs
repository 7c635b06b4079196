use std::io;

use thiserror::Error;

use crate::capture::{CaptureError, SourceId};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("source {id} unavailable: {reason}")]
    SourceUnavailable {
        id: SourceId,
        #[source]
        reason: CaptureError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("another lifecycle operation is in progress")]
    Busy,

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Invalid(#[from] StreamError),
}
