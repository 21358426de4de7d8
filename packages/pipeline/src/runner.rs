//! The streaming job.
//!
//! A run is three tasks sharing one [`AggregationEngine`] behind a mutex:
//!
//! * the ingest task polls the channel, applies each decoded batch under a
//!   single lock acquisition, and commits the batch's offsets afterwards;
//! * the trigger task wakes on a fixed interval, drains ready windows under
//!   a single lock acquisition, and forwards them;
//! * the sink task writes forwarded batches, reached through a bounded
//!   queue.
//!
//! On shutdown the ingest task finishes its in-flight batch, the trigger
//! task stops, every remaining window is force-flushed, and the sink queue
//! is closed and drained.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crime_stream_aggregate::AggregationEngine;
use crime_stream_aggregate_models::{EmittedRecord, EngineStats};
use crime_stream_channel::Channel;
use crime_stream_ingest::{DecodeStats, Ingestion};
use crime_stream_reference::ReferenceTable;
use crime_stream_sink::{OutputRow, Sink, reference_column_name};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::shutdown::{Shutdown, ShutdownSignal};

/// Batches that may wait for the sink before triggers block.
pub const SINK_QUEUE_DEPTH: usize = 16;

/// Engine shared between the ingest and trigger tasks.
pub type SharedEngine = Arc<Mutex<AggregationEngine>>;

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    /// Messages received, decoded, and dropped as undecodable.
    pub decode: DecodeStats,
    /// Events counted, late, and skipped as redeliveries.
    pub engine: EngineStats,
    /// Watermark when the run stopped.
    pub watermark: Option<DateTime<Utc>>,
    /// Aggregates with no matching reference row.
    pub join_misses: u64,
    /// Batches the sink accepted.
    pub batches_written: u64,
    /// Rows the sink accepted.
    pub rows_written: u64,
    /// Batches the sink failed to write.
    pub sink_errors: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct EmitStats {
    join_misses: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SinkStats {
    batches: u64,
    rows: u64,
    errors: u64,
}

/// A configured job, ready to run.
pub struct Pipeline {
    config: PipelineConfig,
    channel: Channel,
    reference: Option<Arc<ReferenceTable>>,
}

impl Pipeline {
    /// Validates `config`, opens its channel, and loads reference data.
    ///
    /// # Errors
    ///
    /// * If the configuration is invalid
    /// * If the channel cannot be opened
    /// * If the reference file cannot be loaded
    pub async fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let address = config.channel_address()?;
        let channel = Channel::open(&address, &config.channel.client_id).await?;
        Self::new(config, channel)
    }

    /// Builds a job on an already-open channel.
    ///
    /// # Errors
    ///
    /// * If the configuration is invalid
    /// * If the reference file cannot be loaded
    pub fn new(config: PipelineConfig, channel: Channel) -> Result<Self, PipelineError> {
        config.validate()?;
        let reference = match &config.reference.path {
            Some(path) => {
                let table = ReferenceTable::load(path)?;
                warn_shadowed_columns(&table);
                Some(Arc::new(table))
            }
            None => None,
        };
        Ok(Self {
            config,
            channel,
            reference,
        })
    }

    /// Joins aggregates against `table` instead of the configured file.
    #[must_use]
    pub fn with_reference(mut self, table: ReferenceTable) -> Self {
        warn_shadowed_columns(&table);
        self.reference = Some(Arc::new(table));
        self
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Runs until `shutdown` fires or a fatal error occurs, writing
    /// aggregates to `sink`.
    ///
    /// Every window still open at shutdown is flushed as final before this
    /// returns, unless the run stopped on a broken engine invariant.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Channel`] once channel failures exhaust retries
    /// * [`PipelineError::Engine`] on a broken engine invariant
    pub async fn run(
        &self,
        sink: Box<dyn Sink>,
        shutdown: &Shutdown,
    ) -> Result<PipelineReport, PipelineError> {
        let mut engine_config = self.config.engine_config();
        engine_config.group_by_disposition |= self.reference.is_some();
        let engine: SharedEngine = Arc::new(Mutex::new(AggregationEngine::new(engine_config)?));

        let ingestion = Ingestion::subscribe(
            &self.channel,
            &self.config.channel.topic,
            &self.config.channel.group,
            self.config.channel.starting_offsets,
            self.config.ingest_options(),
        )
        .await?;

        log::info!(
            "Aggregating {} in {}-minute windows (lateness {} minutes, {} mode, trigger every {:?})",
            self.config.channel.topic,
            self.config.window.size_minutes,
            self.config.window.allowed_lateness_minutes,
            engine_config.output_mode,
            self.config.trigger_interval(),
        );

        let (rows_tx, rows_rx) = mpsc::channel(SINK_QUEUE_DEPTH);
        let (decode_tx, decode_rx) = watch::channel(DecodeStats::default());

        let sink_task = tokio::spawn(write_batches(sink, rows_rx));

        let trigger_task = tokio::spawn(trigger_loop(
            engine.clone(),
            self.reference.clone(),
            self.config.trigger_interval(),
            rows_tx.clone(),
            decode_rx,
            shutdown.clone(),
        ));

        let ingest_task = tokio::spawn(ingest_loop(
            ingestion,
            engine.clone(),
            decode_tx,
            shutdown.clone(),
        ));

        let ingest_joined = ingest_task.await;
        shutdown.trigger();
        let trigger_joined = trigger_task.await;

        let (decode, ingest_result) = ingest_joined?;
        let (mut emitted, trigger_result) = trigger_joined?;

        let mut error = ingest_result.err().or(trigger_result.err());

        if error
            .as_ref()
            .is_some_and(PipelineError::is_invariant_violation)
        {
            log::error!("Skipping final flush after invariant violation");
        } else {
            let flushed = engine.lock().await.drain_all();
            match flushed {
                Ok(records) => {
                    log::info!("Final flush: {} windows", records.len());
                    emit(&rows_tx, records, self.reference.as_deref(), &mut emitted).await;
                }
                Err(e) => {
                    error.get_or_insert(e.into());
                }
            }
        }

        drop(rows_tx);
        let written = sink_task.await?;

        let engine = engine.lock().await;
        let report = PipelineReport {
            decode,
            engine: engine.stats(),
            watermark: engine.watermark(),
            join_misses: emitted.join_misses,
            batches_written: written.batches,
            rows_written: written.rows,
            sink_errors: written.errors,
        };
        drop(engine);

        log_report(&report);

        match error {
            Some(e) => {
                log::error!("Pipeline stopped: {e}");
                Err(e)
            }
            None => Ok(report),
        }
    }
}

fn warn_shadowed_columns(table: &ReferenceTable) {
    for column in table.columns() {
        if let Cow::Owned(renamed) = reference_column_name(column) {
            log::warn!("Reference column {column:?} is named like an output column, writing it as {renamed:?}");
        }
    }
}

async fn ingest_loop(
    mut ingestion: Ingestion,
    engine: SharedEngine,
    stats: watch::Sender<DecodeStats>,
    shutdown: Shutdown,
) -> (DecodeStats, Result<(), PipelineError>) {
    let signal = shutdown.signal();
    let result = ingest_batches(&mut ingestion, &engine, &stats, &signal).await;
    if result.is_err() {
        shutdown.trigger();
    }
    (ingestion.stats(), result)
}

async fn ingest_batches(
    ingestion: &mut Ingestion,
    engine: &SharedEngine,
    stats: &watch::Sender<DecodeStats>,
    signal: &ShutdownSignal,
) -> Result<(), PipelineError> {
    while !signal.is_triggered() {
        let batch = ingestion.next_batch().await?;
        if batch.is_empty() {
            continue;
        }

        {
            let mut engine = engine.lock().await;
            for event in &batch.events {
                engine.ingest_at(event.position, &event.call)?;
            }
        }

        ingestion.commit(&batch.offsets).await?;
        stats.send_replace(ingestion.stats());

        log::debug!(
            "Applied batch of {} messages ({} undecodable)",
            batch.received,
            batch.decode_errors
        );
    }

    log::info!("Ingestion stopped");
    Ok(())
}

async fn trigger_loop(
    engine: SharedEngine,
    reference: Option<Arc<ReferenceTable>>,
    interval: Duration,
    rows: mpsc::Sender<Vec<OutputRow>>,
    decode: watch::Receiver<DecodeStats>,
    shutdown: Shutdown,
) -> (EmitStats, Result<(), PipelineError>) {
    let mut emitted = EmitStats::default();
    let mut signal = shutdown.signal();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = signal.wait() => break,
            _ = ticker.tick() => {
                let drained = {
                    let mut engine = engine.lock().await;
                    engine
                        .drain_ready()
                        .map(|records| (records, engine.watermark(), engine.stats(), engine.open_windows()))
                };

                let (records, watermark, stats, open) = match drained {
                    Ok(drained) => drained,
                    Err(e) => {
                        shutdown.trigger();
                        return (emitted, Err(e.into()));
                    }
                };

                let decoded = *decode.borrow();
                if records.is_empty() {
                    log::debug!("Trigger: nothing ready (watermark {watermark:?}, {open} open windows)");
                    continue;
                }

                log::info!(
                    "Trigger: emitting {} windows (watermark {}, {open} open, {} counted, {} late, {} duplicates, {} decode errors)",
                    records.len(),
                    watermark.map_or_else(|| "unset".to_string(), |w| w.to_rfc3339()),
                    stats.counted,
                    stats.late,
                    stats.duplicates,
                    decoded.decode_errors,
                );
                emit(&rows, records, reference.as_deref(), &mut emitted).await;
            }
        }
    }

    (emitted, Ok(()))
}

/// Converts drained records to rows, joining them when reference data is
/// loaded, and queues them for the sink.
async fn emit(
    rows: &mpsc::Sender<Vec<OutputRow>>,
    records: Vec<EmittedRecord>,
    reference: Option<&ReferenceTable>,
    stats: &mut EmitStats,
) {
    if records.is_empty() {
        return;
    }

    let batch: Vec<OutputRow> = match reference {
        Some(table) => records
            .into_iter()
            .map(|record| {
                let joined = table.join(record);
                if joined.is_miss() {
                    stats.join_misses += 1;
                }
                OutputRow::from(joined)
            })
            .collect(),
        None => records.into_iter().map(OutputRow::from).collect(),
    };

    if rows.send(batch).await.is_err() {
        log::error!("Sink task is gone, dropping output batch");
    }
}

async fn write_batches(
    mut sink: Box<dyn Sink>,
    mut rows: mpsc::Receiver<Vec<OutputRow>>,
) -> SinkStats {
    let mut stats = SinkStats::default();

    while let Some(batch) = rows.recv().await {
        match sink.emit_batch(&batch).await {
            Ok(()) => {
                stats.batches += 1;
                stats.rows += batch.len() as u64;
            }
            Err(e) => {
                stats.errors += 1;
                log::error!("Sink failed to write {} rows: {e}", batch.len());
            }
        }
    }

    if let Err(e) = sink.close().await {
        stats.errors += 1;
        log::error!("Sink failed to close: {e}");
    }

    stats
}

fn log_report(report: &PipelineReport) {
    log::info!(
        "Decoded {} of {} messages ({} decode errors)",
        report.decode.decoded,
        report.decode.received,
        report.decode.decode_errors
    );
    log::info!(
        "Counted {} events ({} late, {} duplicates) into {} finalized windows",
        report.engine.counted,
        report.engine.late,
        report.engine.duplicates,
        report.engine.windows_finalized
    );
    log::info!(
        "Wrote {} rows in {} batches ({} join misses, {} sink errors)",
        report.rows_written,
        report.batches_written,
        report.join_misses,
        report.sink_errors
    );
}

#[cfg(test)]
mod tests {
    use crime_stream_aggregate_models::OutputMode;
    use crime_stream_channel::ChannelProducer;
    use crime_stream_channel::memory::MemoryBroker;
    use crime_stream_channel_models::StartPosition;
    use crime_stream_sink::CollectingSink;
    use serde_json::json;

    use super::*;
    use crate::error::EXIT_CHANNEL;

    const TOPIC: &str = "calls";
    const GROUP: &str = "pipeline-test";

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.channel.address = "memory://".to_string();
        config.channel.topic = TOPIC.to_string();
        config.channel.group = GROUP.to_string();
        config.ingest.poll_timeout_ms = 10;
        config.trigger.interval_ms = 20;
        config.retry.max_retries = 3;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config
    }

    fn call(category: &str, disposition: &str, time: &str) -> String {
        json!({
            "crime_id": "183653763",
            "original_crime_type_name": category,
            "disposition": disposition,
            "call_date_time": time,
        })
        .to_string()
    }

    async fn publish(broker: &MemoryBroker, payloads: &[String]) {
        let producer = broker.producer();
        for payload in payloads {
            producer.send(TOPIC, None, payload.as_bytes()).await.unwrap();
        }
    }

    async fn wait_for_commit(broker: &MemoryBroker, offset: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed(TOPIC, GROUP, 0).await != Some(offset) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Runs `pipeline` until `offset` is committed, then shuts it down.
    async fn run_until(
        pipeline: Pipeline,
        broker: &MemoryBroker,
        offset: i64,
    ) -> (Result<PipelineReport, PipelineError>, CollectingSink) {
        let collector = CollectingSink::new();
        let shutdown = Shutdown::new();
        let handle = {
            let sink = Box::new(collector.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pipeline.run(sink, &shutdown).await })
        };
        wait_for_commit(broker, offset).await;
        shutdown.trigger();
        (handle.await.unwrap(), collector)
    }

    #[tokio::test]
    async fn theft_window_is_emitted_once_with_count_three() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:05:00"),
                call("Theft", "HAN", "2018-12-31T10:40:00"),
                r#"{"original_crime_type_name": "Theft"}"#.to_string(),
                call("Theft", "HAN", "2018-12-31T10:58:00"),
                call("Assault", "ADV", "2018-12-31T12:00:00"),
            ],
        )
        .await;

        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone())).unwrap();
        let (report, collector) = run_until(pipeline, &broker, 5).await;
        let report = report.unwrap();

        let rows = collector.rows().await;
        let theft: Vec<_> = rows
            .iter()
            .filter(|r| r.category_label == "Theft")
            .collect();
        assert_eq!(theft.len(), 1);
        assert_eq!(theft[0].count, 3);
        assert!(theft[0].is_final);
        assert_eq!(theft[0].window_start.to_rfc3339(), "2018-12-31T10:00:00+00:00");

        assert!(rows.iter().any(|r| r.category_label == "Assault" && r.count == 1));
        assert_eq!(report.decode.decode_errors, 1);
        assert_eq!(report.engine.counted, 4);
        assert_eq!(report.engine.finalized_count, 4);
        assert_eq!(report.rows_written, 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_every_open_window() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:05:00"),
                call("Theft", "HAN", "2018-12-31T11:05:00"),
            ],
        )
        .await;

        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone())).unwrap();
        let (report, collector) = run_until(pipeline, &broker, 2).await;
        report.unwrap();

        let rows = collector.rows().await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.is_final && r.count == 1));
    }

    #[tokio::test]
    async fn unknown_disposition_passes_through_the_join() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:05:00"),
                call("Theft", "ADV", "2018-12-31T10:06:00"),
                call("Theft", "ADV", "2018-12-31T10:07:00"),
            ],
        )
        .await;

        let table = ReferenceTable::from_json_str(
            r#"[{"disposition_code": "HAN", "description": "Handled"}]"#,
        )
        .unwrap();
        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone()))
            .unwrap()
            .with_reference(table);
        let (report, collector) = run_until(pipeline, &broker, 3).await;
        let report = report.unwrap();

        let rows = collector.rows().await;
        assert_eq!(rows.len(), 2);
        let advised = rows
            .iter()
            .find(|r| r.disposition.as_deref() == Some("ADV"))
            .unwrap();
        assert_eq!(advised.count, 2);
        assert!(advised.reference.is_empty());
        let handled = rows
            .iter()
            .find(|r| r.disposition.as_deref() == Some("HAN"))
            .unwrap();
        assert_eq!(handled.reference["description"], "Handled");
        assert_eq!(report.join_misses, 1);
    }

    #[tokio::test]
    async fn reference_columns_cannot_overwrite_the_count() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:05:00"),
                call("Theft", "HAN", "2018-12-31T10:06:00"),
                call("Theft", "HAN", "2018-12-31T10:07:00"),
            ],
        )
        .await;

        let table = ReferenceTable::from_json_str(
            r#"[{"disposition_code": "HAN", "count": "lots", "description": "Handled"}]"#,
        )
        .unwrap();
        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone()))
            .unwrap()
            .with_reference(table);
        let (report, collector) = run_until(pipeline, &broker, 3).await;
        report.unwrap();

        let rows = collector.rows().await;
        assert_eq!(rows.len(), 1);
        let line = serde_json::to_string(&rows[0]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["count"], 3);
        assert_eq!(value["reference_count"], "lots");
        assert_eq!(value["description"], "Handled");
    }

    #[tokio::test]
    async fn restart_resumes_from_committed_offsets() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:05:00"),
                call("Theft", "HAN", "2018-12-31T10:06:00"),
                call("Theft", "HAN", "2018-12-31T10:07:00"),
            ],
        )
        .await;

        let mut config = config();
        config.channel.starting_offsets = StartPosition::Committed;

        let first = Pipeline::new(config.clone(), Channel::Memory(broker.clone())).unwrap();
        let (report, _) = run_until(first, &broker, 3).await;
        assert_eq!(report.unwrap().engine.counted, 3);

        publish(
            &broker,
            &[
                call("Theft", "HAN", "2018-12-31T10:08:00"),
                call("Theft", "HAN", "2018-12-31T10:09:00"),
            ],
        )
        .await;

        let second = Pipeline::new(config, Channel::Memory(broker.clone())).unwrap();
        let (report, _) = run_until(second, &broker, 5).await;
        let report = report.unwrap();
        assert_eq!(report.decode.received, 2);
        assert_eq!(report.engine.counted, 2);
    }

    #[tokio::test]
    async fn transient_poll_failures_are_retried() {
        let broker = MemoryBroker::default();
        publish(&broker, &[call("Theft", "HAN", "2018-12-31T10:05:00")]).await;
        broker.fail_next_polls(2).await;

        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone())).unwrap();
        let (report, _) = run_until(pipeline, &broker, 1).await;
        assert_eq!(report.unwrap().engine.counted, 1);
    }

    #[tokio::test]
    async fn persistent_channel_failure_stops_the_run() {
        let broker = MemoryBroker::default();
        broker.fail_next_polls(100).await;

        let pipeline = Pipeline::new(config(), Channel::Memory(broker.clone())).unwrap();
        let shutdown = Shutdown::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run(Box::new(CollectingSink::new()), &shutdown),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Channel(_)));
        assert_eq!(err.exit_code(), EXIT_CHANNEL);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn complete_mode_emits_non_final_snapshots() {
        let broker = MemoryBroker::default();
        publish(&broker, &[call("Theft", "HAN", "2018-12-31T10:05:00")]).await;

        let mut config = config();
        config.window.output_mode = OutputMode::Complete;
        let pipeline = Pipeline::new(config, Channel::Memory(broker.clone())).unwrap();

        let collector = CollectingSink::new();
        let shutdown = Shutdown::new();
        let handle = {
            let sink = Box::new(collector.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pipeline.run(sink, &shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.batches().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.trigger();
        handle.await.unwrap().unwrap();

        let batches = collector.batches().await;
        assert!(!batches[0][0].is_final);
        assert_eq!(batches[0][0].count, 1);
        let last = batches.last().unwrap();
        assert!(last[0].is_final);
        assert_eq!(last[0].count, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_configuration_before_starting() {
        let mut config = config();
        config.window.size_minutes = -5;
        let result = Pipeline::new(config, Channel::Memory(MemoryBroker::default()));
        assert!(matches!(result, Err(PipelineError::Config(_))));

        let mut config = self::config();
        config.reference.path = Some(std::env::temp_dir().join(format!(
            "crime_stream_missing_{}.json",
            uuid::Uuid::new_v4()
        )));
        let result = Pipeline::new(config, Channel::Memory(MemoryBroker::default()));
        assert!(matches!(result, Err(PipelineError::Reference(_))));
    }
}
