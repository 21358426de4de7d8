//! Windowed count state.
//!
//! State is a sorted map from [`WindowId`] to count. Because identities sort
//! by window start first and every window has the same length, the windows
//! that are ready to finalize always form a prefix of the map.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use crime_stream_aggregate_models::{EmittedRecord, EngineStats, GroupKey, OutputMode, WindowId};
use crime_stream_channel_models::MessagePosition;
use crime_stream_event_models::ServiceCall;

use crate::dedup::OffsetDeduplicator;
use crate::watermark::Watermark;
use crate::window::WindowAssigner;
use crate::{EngineError, InvariantViolation};

/// Engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Tumbling window length.
    pub window_size: TimeDelta,
    /// How far the watermark trails the newest event time.
    pub allowed_lateness: TimeDelta,
    /// Append or complete output.
    pub output_mode: OutputMode,
    /// Add the disposition code to the group key.
    pub group_by_disposition: bool,
    /// Skip messages whose position was already applied.
    pub dedup_offsets: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: TimeDelta::minutes(60),
            allowed_lateness: TimeDelta::minutes(60),
            output_mode: OutputMode::Append,
            group_by_disposition: false,
            dedup_offsets: true,
        }
    }
}

/// What happened to one ingested event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Counted into the window.
    Counted(WindowId),
    /// Dropped because the window had already been finalized.
    Late(WindowId),
    /// Dropped because the message was already applied.
    Duplicate(MessagePosition),
}

/// Per-window counters plus the watermark that decides when they finalize.
#[derive(Debug)]
pub struct AggregationEngine {
    config: EngineConfig,
    assigner: WindowAssigner,
    watermark: Watermark,
    state: BTreeMap<WindowId, u64>,
    dedup: Option<OffsetDeduplicator>,
    finalized_through: Option<DateTime<Utc>>,
    stats: EngineStats,
}

impl AggregationEngine {
    /// Creates an empty engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for a non-positive window size or a
    /// negative lateness.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            assigner: WindowAssigner::new(config.window_size)?,
            watermark: Watermark::new(config.allowed_lateness)?,
            state: BTreeMap::new(),
            dedup: config.dedup_offsets.then(OffsetDeduplicator::new),
            finalized_through: None,
            stats: EngineStats::default(),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Current watermark, `None` before the first event.
    #[must_use]
    pub const fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.current()
    }

    /// Number of windows currently holding state.
    #[must_use]
    pub fn open_windows(&self) -> usize {
        self.state.len()
    }

    /// Current count for `id`, if the window holds state.
    #[must_use]
    pub fn count(&self, id: &WindowId) -> Option<u64> {
        self.state.get(id).copied()
    }

    /// Group key for `call` under the configured grouping.
    #[must_use]
    pub fn key_for(&self, call: &ServiceCall) -> GroupKey {
        GroupKey {
            category: call.category_label().to_string(),
            disposition: if self.config.group_by_disposition {
                call.disposition.clone()
            } else {
                None
            },
        }
    }

    /// Window identity `call` belongs to.
    #[must_use]
    pub fn assign(&self, call: &ServiceCall) -> WindowId {
        self.assigner.assign(call.event_time(), self.key_for(call))
    }

    /// Ingests a message read from `position`, skipping it if that position
    /// was already applied.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] on counter overflow or watermark
    /// regression.
    pub fn ingest_at(
        &mut self,
        position: MessagePosition,
        call: &ServiceCall,
    ) -> Result<IngestOutcome, EngineError> {
        if let Some(dedup) = &mut self.dedup {
            if !dedup.first_delivery(position) {
                self.stats.duplicates += 1;
                log::trace!("Skipping redelivered message {position}");
                return Ok(IngestOutcome::Duplicate(position));
            }
        }
        self.ingest(call)
    }

    /// Counts `call` into its window and advances the watermark.
    ///
    /// In append mode an event whose window has already been finalized is
    /// counted as late and leaves state untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] on counter overflow or watermark
    /// regression.
    pub fn ingest(&mut self, call: &ServiceCall) -> Result<IngestOutcome, EngineError> {
        let id = self.assign(call);

        let outcome = if self.is_finalized(&id) {
            self.stats.late += 1;
            log::debug!("Late event for finalized window {id}");
            IngestOutcome::Late(id)
        } else {
            let count = self.state.entry(id.clone()).or_insert(0);
            *count = count
                .checked_add(1)
                .ok_or_else(|| InvariantViolation::CounterOverflow { id: id.clone() })?;
            self.stats.counted += 1;
            IngestOutcome::Counted(id)
        };

        self.watermark.advance(call.event_time())?;

        Ok(outcome)
    }

    fn is_finalized(&self, id: &WindowId) -> bool {
        match self.config.output_mode {
            OutputMode::Append => {
                self.watermark.has_passed(&id.window)
                    || self.finalized_through.is_some_and(|t| id.window.end <= t)
            }
            OutputMode::Complete => self.finalized_through.is_some_and(|t| id.window.end <= t),
        }
    }

    /// Emits every window the watermark has passed.
    ///
    /// In append mode finalized windows are removed from state and emitted
    /// once. In complete mode every window is emitted with its current count,
    /// marked non-final, and kept.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::WindowRefinalized`] if state exists for
    /// a window that was already emitted as final.
    pub fn drain_ready(&mut self) -> Result<Vec<EmittedRecord>, EngineError> {
        match self.config.output_mode {
            OutputMode::Append => {
                let Some(watermark) = self.watermark.current() else {
                    return Ok(vec![]);
                };
                let ready: Vec<WindowId> = self
                    .state
                    .keys()
                    .take_while(|id| id.window.end <= watermark)
                    .cloned()
                    .collect();
                self.finalize(ready, watermark)
            }
            OutputMode::Complete => Ok(self
                .state
                .iter()
                .map(|(id, count)| EmittedRecord {
                    id: id.clone(),
                    count: *count,
                    is_final: false,
                })
                .collect()),
        }
    }

    /// Emits every remaining window as final, regardless of the watermark.
    ///
    /// Used on shutdown. Events arriving afterwards for any flushed window
    /// are treated as late.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::WindowRefinalized`] if state exists for
    /// a window that was already emitted as final.
    pub fn drain_all(&mut self) -> Result<Vec<EmittedRecord>, EngineError> {
        let ids: Vec<WindowId> = self.state.keys().cloned().collect();
        let horizon = ids
            .iter()
            .map(|id| id.window.end)
            .max()
            .into_iter()
            .chain(self.watermark.current())
            .max();
        let Some(horizon) = horizon else {
            return Ok(vec![]);
        };
        self.finalize(ids, horizon)
    }

    fn finalize(
        &mut self,
        ids: Vec<WindowId>,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<EmittedRecord>, EngineError> {
        let mut records = Vec::with_capacity(ids.len());

        for id in ids {
            if self.finalized_through.is_some_and(|t| id.window.end <= t) {
                return Err(InvariantViolation::WindowRefinalized { id }.into());
            }
            let Some(count) = self.state.remove(&id) else {
                continue;
            };
            self.stats.windows_finalized += 1;
            self.stats.finalized_count = self
                .stats
                .finalized_count
                .checked_add(count)
                .ok_or_else(|| InvariantViolation::CounterOverflow { id: id.clone() })?;
            records.push(EmittedRecord {
                id,
                count,
                is_final: true,
            });
        }

        self.finalized_through = Some(self.finalized_through.map_or(horizon, |t| t.max(horizon)));

        Ok(records)
    }
}
