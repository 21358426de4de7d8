//! Pipeline configuration.
//!
//! Settings are read from a TOML file (by default `crime_stream.toml` in the
//! working directory) and then overridden from the command line. Every field
//! has a default, so an empty or missing file yields a runnable
//! configuration:
//!
//! ```toml
//! [channel]
//! address = "file://data/channel"
//! topic = "department.police.service.call"
//! starting_offsets = "earliest"
//!
//! [window]
//! size_minutes = 60
//! allowed_lateness_minutes = 60
//! output_mode = "append"
//!
//! [trigger]
//! interval_ms = 60000
//!
//! [reference]
//! path = "radio_code.json"
//!
//! [sink]
//! kind = "console"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use crime_stream_aggregate::EngineConfig;
use crime_stream_aggregate_models::OutputMode;
use crime_stream_channel::retry::RetryPolicy;
use crime_stream_channel_models::{ChannelAddress, InvalidChannelAddress, StartPosition};
use crime_stream_event_models::SERVICE_CALL_TOPIC;
use crime_stream_ingest::IngestOptions;
use crime_stream_sink::{SinkKind, SinkOptions};
use serde::{Deserialize, Serialize};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "crime_stream.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`PipelineConfig`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The configuration could not be rendered as TOML.
    #[error(transparent)]
    Render(#[from] toml::ser::Error),

    /// The channel address is malformed.
    #[error(transparent)]
    Address(#[from] InvalidChannelAddress),

    /// A value is out of range or inconsistent with another.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}

/// Where to read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// `memory://`, `file://<dir>`, or `kafka://<bootstrap servers>`.
    pub address: String,
    /// Topic carrying service-call messages.
    pub topic: String,
    /// Consumer group used for committed offsets.
    pub group: String,
    /// Identifies this process to the transport.
    pub client_id: String,
    /// Where a new subscription starts reading.
    pub starting_offsets: StartPosition,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            address: "file://data/channel".to_string(),
            topic: SERVICE_CALL_TOPIC.to_string(),
            group: "crime-stream".to_string(),
            client_id: "police_call".to_string(),
            starting_offsets: StartPosition::Earliest,
        }
    }
}

/// Polling limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// At most this many messages are pulled per poll.
    pub max_records_per_trigger: usize,
    /// How long one poll may wait for data.
    pub poll_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_records_per_trigger: 45_000,
            poll_timeout_ms: 500,
        }
    }
}

/// Windowing and output semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Tumbling window length.
    pub size_minutes: i64,
    /// How far the watermark trails the newest event time.
    pub allowed_lateness_minutes: i64,
    /// `append` emits each window once; `complete` re-emits every window
    /// on every trigger.
    pub output_mode: OutputMode,
    /// Group by disposition code as well as category. Always on when a
    /// reference file is configured.
    pub group_by_disposition: bool,
    /// Skip redelivered messages by offset.
    pub dedup_offsets: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_minutes: 60,
            allowed_lateness_minutes: 60,
            output_mode: OutputMode::Append,
            group_by_disposition: false,
            dedup_offsets: true,
        }
    }
}

/// How often finalized windows are drained to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Time between drains.
    pub interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

/// Disposition reference data. The join is enabled when `path` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// JSON array of reference rows keyed by `disposition_code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Output destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Which sink rows are written to.
    pub kind: SinkKind,
    /// Output file for the `json-lines` sink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Shorten long console cells.
    pub truncate: bool,
}

/// Backoff for transient channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Replay settings for the `produce` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// JSON array of service-call records.
    pub input: PathBuf,
    /// Pause between records.
    pub interval_ms: u64,
    /// Publish at most this many records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("police-department-calls-for-service.json"),
            interval_ms: 200,
            limit: None,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `[channel]`
    pub channel: ChannelConfig,
    /// `[ingest]`
    pub ingest: IngestConfig,
    /// `[window]`
    pub window: WindowConfig,
    /// `[trigger]`
    pub trigger: TriggerConfig,
    /// `[reference]`
    pub reference: ReferenceConfig,
    /// `[sink]`
    pub sink: SinkConfig,
    /// `[retry]`
    pub retry: RetryConfig,
    /// `[producer]`
    pub producer: ProducerConfig,
}

impl PipelineConfig {
    /// Loads configuration.
    ///
    /// With an explicit `path` the file must exist. Without one,
    /// [`DEFAULT_CONFIG_FILE`] is used if present and defaults otherwise.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read
    /// * If the file is not valid TOML for this structure
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    log::debug!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the document does not match this structure.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Render`] if a value cannot be represented.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every value that would otherwise fail once the stream is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel_address()?;

        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if self.channel.topic.is_empty() {
            return invalid("channel.topic must not be empty");
        }
        if self.channel.group.is_empty() {
            return invalid("channel.group must not be empty");
        }
        if self.window.size_minutes <= 0 {
            return invalid("window.size_minutes must be positive");
        }
        if self.window.allowed_lateness_minutes < 0 {
            return invalid("window.allowed_lateness_minutes must not be negative");
        }
        if self.ingest.max_records_per_trigger == 0 {
            return invalid("ingest.max_records_per_trigger must be positive");
        }
        if self.ingest.poll_timeout_ms == 0 {
            return invalid("ingest.poll_timeout_ms must be positive");
        }
        if self.trigger.interval_ms == 0 {
            return invalid("trigger.interval_ms must be positive");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }
        if self.sink.kind == SinkKind::JsonLines && self.sink.path.is_none() {
            return invalid("sink.path is required for the json-lines sink");
        }
        if TimeDelta::try_minutes(self.window.size_minutes).is_none()
            || TimeDelta::try_minutes(self.window.allowed_lateness_minutes).is_none()
        {
            return invalid("window durations are out of range");
        }

        Ok(())
    }

    /// Parsed channel address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] if the address is malformed.
    pub fn channel_address(&self) -> Result<ChannelAddress, ConfigError> {
        Ok(self.channel.address.parse()?)
    }

    /// Engine parameters.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            window_size: TimeDelta::try_minutes(self.window.size_minutes).unwrap_or(TimeDelta::zero()),
            allowed_lateness: TimeDelta::try_minutes(self.window.allowed_lateness_minutes)
                .unwrap_or(TimeDelta::zero()),
            output_mode: self.window.output_mode,
            group_by_disposition: self.window.group_by_disposition
                || self.reference.path.is_some(),
            dedup_offsets: self.window.dedup_offsets,
        }
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    #[must_use]
    pub const fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_records_per_trigger: self.ingest.max_records_per_trigger,
            poll_timeout: Duration::from_millis(self.ingest.poll_timeout_ms),
            retry: self.retry_policy(),
        }
    }

    #[must_use]
    pub const fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.trigger.interval_ms)
    }

    #[must_use]
    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            kind: self.sink.kind,
            path: self.sink.path.clone(),
            truncate: self.sink.truncate,
        }
    }
}

#[cfg(test)]
mod tests {
    use crime_stream_channel_models::TransportKind;

    use super::*;

    #[test]
    fn defaults_mirror_the_reference_job() {
        let config = PipelineConfig::default();
        assert_eq!(config.channel.topic, "department.police.service.call");
        assert_eq!(config.channel.starting_offsets, StartPosition::Earliest);
        assert_eq!(config.ingest.max_records_per_trigger, 45_000);
        assert_eq!(config.trigger_interval(), Duration::from_secs(60));

        let engine = config.engine_config();
        assert_eq!(engine.window_size, TimeDelta::minutes(60));
        assert_eq!(engine.allowed_lateness, TimeDelta::minutes(60));
        assert_eq!(engine.output_mode, OutputMode::Append);
        assert!(!engine.group_by_disposition);
        assert!(engine.dedup_offsets);

        config.validate().unwrap();
    }

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(
            PipelineConfig::from_toml_str("").unwrap(),
            PipelineConfig::default()
        );
    }

    #[test]
    fn parses_partial_documents() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [channel]
            address = "memory://"
            starting_offsets = "offset:42"

            [window]
            size_minutes = 15
            output_mode = "complete"

            [reference]
            path = "radio_code.json"

            [sink]
            kind = "json-lines"
            path = "out/aggregates.jsonl"
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.starting_offsets, StartPosition::Offset(42));
        assert_eq!(config.channel.topic, SERVICE_CALL_TOPIC);
        assert_eq!(config.channel_address().unwrap().kind, TransportKind::Memory);
        assert_eq!(config.window.allowed_lateness_minutes, 60);

        let engine = config.engine_config();
        assert_eq!(engine.window_size, TimeDelta::minutes(15));
        assert_eq!(engine.output_mode, OutputMode::Complete);
        assert!(engine.group_by_disposition);

        assert_eq!(config.sink.kind, SinkKind::JsonLines);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.window.size_minutes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));

        let mut config = PipelineConfig::default();
        config.sink.kind = SinkKind::JsonLines;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.channel.address = "carrier-pigeon://coop".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Address(_))
        ));

        assert!(PipelineConfig::from_toml_str("[window]\noutput_mode = \"update\"").is_err());
    }

    #[test]
    fn renders_back_to_equivalent_toml() {
        let mut config = PipelineConfig::default();
        config.reference.path = Some(PathBuf::from("radio_code.json"));
        config.channel.starting_offsets = StartPosition::Committed;
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("starting_offsets = \"committed\""));
        assert_eq!(PipelineConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("crime_stream_{}.toml", uuid::Uuid::new_v4()));
        assert!(matches!(
            PipelineConfig::load(Some(&path)),
            Err(ConfigError::Io { .. })
        ));

        std::fs::write(&path, "[trigger]\ninterval_ms = 250\n").unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.trigger_interval(), Duration::from_millis(250));
        std::fs::remove_file(&path).unwrap();
    }
}
