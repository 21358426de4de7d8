#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the crime stream pipeline.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use crime_stream_aggregate_models::OutputMode;
use crime_stream_channel::Channel;
use crime_stream_channel_models::{StartPosition, TransportKind};
use crime_stream_cli_utils::{IndicatifProgress, MultiProgress};
use crime_stream_pipeline::{Pipeline, PipelineConfig, PipelineError, Shutdown};
use crime_stream_producer::progress::PublishProgress;
use crime_stream_producer::{EventPublisher, PublishOptions};
use crime_stream_sink::{SinkKind, open_sink};

#[derive(Parser)]
#[command(
    name = "crime_stream",
    about = "Windowed aggregation of police service calls"
)]
struct Cli {
    /// Configuration file (defaults to `crime_stream.toml` when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the service-call channel and emit windowed counts until
    /// interrupted
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Also replay this JSON array file onto the channel while running
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Publish a JSON array of service calls onto the channel, one record
    /// per interval
    Produce {
        #[command(flatten)]
        overrides: Overrides,
        /// JSON array of service-call records
        #[arg(long)]
        input: Option<PathBuf>,
        /// Pause between records in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Publish at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the effective configuration as TOML
    ShowConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line values that take precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    /// Channel address (`memory://`, `file://<dir>`, `kafka://<servers>`)
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    /// Consumer group
    #[arg(long)]
    group: Option<String>,
    /// `earliest`, `latest`, `committed`, or `offset:<n>`
    #[arg(long)]
    starting_offsets: Option<StartPosition>,
    #[arg(long)]
    window_minutes: Option<i64>,
    #[arg(long)]
    lateness_minutes: Option<i64>,
    /// Trigger interval in milliseconds
    #[arg(long)]
    trigger_ms: Option<u64>,
    #[arg(long)]
    poll_timeout_ms: Option<u64>,
    #[arg(long)]
    max_records_per_trigger: Option<usize>,
    /// `append` or `complete`
    #[arg(long)]
    output_mode: Option<OutputMode>,
    /// Disposition reference file; enables the join
    #[arg(long)]
    reference: Option<PathBuf>,
    /// `console` or `json-lines`
    #[arg(long)]
    sink: Option<SinkKind>,
    /// Output file for the json-lines sink
    #[arg(long)]
    sink_path: Option<PathBuf>,
    /// Shorten long console cells
    #[arg(long)]
    truncate: bool,
}

impl Overrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(address) = self.channel {
            config.channel.address = address;
        }
        if let Some(topic) = self.topic {
            config.channel.topic = topic;
        }
        if let Some(group) = self.group {
            config.channel.group = group;
        }
        if let Some(start) = self.starting_offsets {
            config.channel.starting_offsets = start;
        }
        if let Some(minutes) = self.window_minutes {
            config.window.size_minutes = minutes;
        }
        if let Some(minutes) = self.lateness_minutes {
            config.window.allowed_lateness_minutes = minutes;
        }
        if let Some(ms) = self.trigger_ms {
            config.trigger.interval_ms = ms;
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.ingest.poll_timeout_ms = ms;
        }
        if let Some(max) = self.max_records_per_trigger {
            config.ingest.max_records_per_trigger = max;
        }
        if let Some(mode) = self.output_mode {
            config.window.output_mode = mode;
        }
        if let Some(path) = self.reference {
            config.reference.path = Some(path);
        }
        if let Some(kind) = self.sink {
            config.sink.kind = kind;
        }
        if let Some(path) = self.sink_path {
            config.sink.path = Some(path);
        }
        if self.truncate {
            config.sink.truncate = true;
        }
    }
}

fn publisher(
    channel: &Channel,
    config: &PipelineConfig,
) -> Result<EventPublisher, PipelineError> {
    let options = PublishOptions {
        interval: Duration::from_millis(config.producer.interval_ms),
        limit: config.producer.limit,
        retry: config.retry_policy(),
        ..PublishOptions::new(config.channel.topic.clone())
    };
    Ok(EventPublisher::new(channel.producer()?, options))
}

async fn run_pipeline(
    config: PipelineConfig,
    replay: Option<PathBuf>,
    multi: &MultiProgress,
) -> Result<(), PipelineError> {
    let sink = open_sink(&config.sink_options()).await?;
    let pipeline = Pipeline::open(config).await?;

    let shutdown = Shutdown::new();
    let _ctrl_c = shutdown.on_ctrl_c();

    if let Some(path) = replay {
        let publisher = publisher(pipeline.channel(), pipeline.config())?;
        let progress = IndicatifProgress::publish_bar(multi, "Replaying records");
        tokio::spawn(async move {
            if let Err(e) = publisher.publish_file(&path, &progress).await {
                log::error!("Replay of {} failed: {e}", path.display());
            }
        });
    }

    log::info!("Pipeline started, press Ctrl+C to stop");
    pipeline.run(sink, &shutdown).await?;
    log::info!("Pipeline stopped after final flush");

    Ok(())
}

async fn produce(config: PipelineConfig, multi: &MultiProgress) -> Result<(), PipelineError> {
    let address = config.channel_address()?;
    if address.kind == TransportKind::Memory {
        log::warn!("Publishing to an in-process channel; records are lost when this command exits");
    }
    let channel = Channel::open(&address, &config.channel.client_id).await?;
    let publisher = publisher(&channel, &config)?;
    let progress = IndicatifProgress::publish_bar(multi, "Reading records");

    tokio::select! {
        result = publisher.publish_file(&config.producer.input, &progress) => {
            result?;
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("Failed to listen for Ctrl+C: {e}");
            }
            PublishProgress::interrupted(progress.as_ref());
            log::info!("Interrupted, stopped publishing");
        }
    }

    Ok(())
}

async fn execute(cli: Cli, multi: &MultiProgress) -> Result<(), PipelineError> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { overrides, replay } => {
            overrides.apply(&mut config);
            run_pipeline(config, replay, multi).await
        }
        Commands::Produce {
            overrides,
            input,
            interval_ms,
            limit,
        } => {
            overrides.apply(&mut config);
            if let Some(input) = input {
                config.producer.input = input;
            }
            if let Some(ms) = interval_ms {
                config.producer.interval_ms = ms;
            }
            if limit.is_some() {
                config.producer.limit = limit;
            }
            produce(config, multi).await
        }
        Commands::ShowConfig { overrides } => {
            overrides.apply(&mut config);
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let multi = crime_stream_cli_utils::init_logger();
    let cli = Cli::parse();

    match execute(cli, &multi).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
