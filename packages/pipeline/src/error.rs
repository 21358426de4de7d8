//! Top-level pipeline errors and process exit codes.

use crime_stream_aggregate::{EngineError, InvariantViolation};
use crime_stream_channel::ChannelError;
use crime_stream_producer::ProducerError;
use crime_stream_reference::ReferenceError;
use crime_stream_sink::SinkError;

use crate::config::ConfigError;

/// Exit code for configuration, reference data, and sink setup failures.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code for unrecoverable channel failures.
pub const EXIT_CHANNEL: u8 = 3;
/// Exit code for broken engine invariants.
pub const EXIT_INVARIANT: u8 = 4;
/// Exit code for anything else, such as a panicked task.
pub const EXIT_INTERNAL: u8 = 1;

/// Errors that stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The disposition reference file could not be loaded.
    #[error("failed to load reference data: {0}")]
    Reference(#[from] ReferenceError),

    /// The sink could not be opened.
    #[error("failed to open sink: {0}")]
    Sink(#[from] SinkError),

    /// The channel failed permanently or exhausted its retries.
    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// Replaying records onto the channel failed.
    #[error(transparent)]
    Producer(#[from] ProducerError),

    /// The engine rejected its parameters or broke an invariant.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A pipeline task panicked or was cancelled.
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<InvariantViolation> for PipelineError {
    fn from(violation: InvariantViolation) -> Self {
        Self::Engine(EngineError::Invariant(violation))
    }
}

impl PipelineError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_)
            | Self::Reference(_)
            | Self::Sink(_)
            | Self::Engine(EngineError::Config { .. }) => EXIT_CONFIG,
            Self::Channel(_) | Self::Producer(ProducerError::Channel(_)) => EXIT_CHANNEL,
            Self::Producer(_) => EXIT_CONFIG,
            Self::Engine(EngineError::Invariant(_)) => EXIT_INVARIANT,
            Self::Task(_) => EXIT_INTERNAL,
        }
    }

    /// Returns `true` for broken engine invariants.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Invariant(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_distinct_exit_codes() {
        let config = PipelineError::from(ConfigError::Invalid {
            message: "bad".to_string(),
        });
        let channel = PipelineError::from(ChannelError::Connection {
            message: "refused".to_string(),
        });
        let invariant = PipelineError::from(InvariantViolation::WatermarkRegressed {
            previous: chrono::DateTime::<chrono::Utc>::MAX_UTC,
            proposed: chrono::DateTime::<chrono::Utc>::MIN_UTC,
        });

        assert_eq!(config.exit_code(), EXIT_CONFIG);
        assert_eq!(channel.exit_code(), EXIT_CHANNEL);
        assert_eq!(invariant.exit_code(), EXIT_INVARIANT);
        assert!(invariant.is_invariant_violation());
        assert!(invariant.to_string().contains("watermark regressed"));
    }
}
