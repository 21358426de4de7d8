//! In-memory collecting sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{OutputRow, Sink, SinkError};

/// Collects every emitted batch. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<Vec<OutputRow>>>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch received so far, in order.
    pub async fn batches(&self) -> Vec<Vec<OutputRow>> {
        self.batches.lock().await.clone()
    }

    /// Every row received so far, flattened.
    pub async fn rows(&self) -> Vec<OutputRow> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    async fn emit_batch(&mut self, rows: &[OutputRow]) -> Result<(), SinkError> {
        self.batches.lock().await.push(rows.to_vec());
        Ok(())
    }
}
