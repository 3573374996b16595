//! Sample batches and the sinks that apply them to storage.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::store::{AttributeStore, AttributeValue};
use crate::types::{DataValue, ReadValueId, StatusCode, Variant};

/// One value posted by a data source.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledValue {
    pub target: ReadValueId,
    pub value: Variant,
    pub status: Option<StatusCode>,
    pub source_time: Option<DateTime<Utc>>,
}

impl SampledValue {
    pub fn new(target: ReadValueId, value: impl Into<Variant>) -> Self {
        Self {
            target,
            value: value.into(),
            status: None,
            source_time: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source_time(mut self, time: DateTime<Utc>) -> Self {
        self.source_time = Some(time);
        self
    }
}

/// A batch of values taken at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<SampledValue>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: Vec::new(),
        }
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn push(&mut self, value: SampledValue) {
        self.values.push(value);
    }

    pub fn with(mut self, value: SampledValue) -> Self {
        self.values.push(value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Receives sample batches from data sources.
pub trait SampleSink: Send + Sync {
    fn post(&self, sample: Sample);
}

/// Write every value of a batch to storage. Returns how many values were applied.
///
/// Targets that disappeared or name an invalid attribute are skipped; nodes
/// may be deleted while they are being sampled.
pub fn apply_sample(store: &dyn AttributeStore, sample: &Sample) -> usize {
    let mut applied = 0;

    for sv in &sample.values {
        let value = if sv.target.attribute_id.is_value() {
            AttributeValue::Value(DataValue {
                value: sv.value.clone(),
                status: sv.status.unwrap_or(StatusCode::GOOD),
                source_timestamp: Some(sv.source_time.unwrap_or(sample.timestamp)),
                server_timestamp: Some(Utc::now()),
            })
        } else {
            AttributeValue::Raw(sv.value.clone())
        };

        match store.write(&sv.target.node_id, sv.target.attribute_id, value) {
            Ok(()) => applied += 1,
            Err(e) if e.is_missing_target() => {
                tracing::debug!("SampleSink: Skipping {}: {}", sv.target, e);
            }
            Err(e) => {
                tracing::warn!("SampleSink: Failed to write {}: {}", sv.target, e);
            }
        }
    }

    applied
}

/// Applies each batch before `post` returns.
pub struct BlockingSink {
    store: Arc<dyn AttributeStore>,
}

impl BlockingSink {
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self { store }
    }
}

impl SampleSink for BlockingSink {
    fn post(&self, sample: Sample) {
        apply_sample(self.store.as_ref(), &sample);
    }
}

enum SinkMessage {
    Apply(Sample),
    Flush(oneshot::Sender<()>),
}

/// Batches the `AsyncSink` queue holds before new posts are dropped.
pub const ASYNC_SINK_CAPACITY: usize = 1000;

/// Queues batches and applies them on a single consumer task.
///
/// Any number of producers may post concurrently; batches are applied one at
/// a time in the order they were posted. When the queue is full, the posted
/// batch is dropped with a warning.
#[derive(Clone)]
pub struct AsyncSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl AsyncSink {
    /// Create the sink and spawn its consumer on the current runtime.
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self::spawn_on(store, &tokio::runtime::Handle::current())
    }

    pub fn spawn_on(store: Arc<dyn AttributeStore>, runtime: &tokio::runtime::Handle) -> Self {
        Self::with_capacity(store, runtime, ASYNC_SINK_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn AttributeStore>, runtime: &tokio::runtime::Handle, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        runtime.spawn(run_sink_consumer(rx, store));
        Self { tx }
    }

    /// Wait until every batch posted before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl SampleSink for AsyncSink {
    fn post(&self, sample: Sample) {
        match self.tx.try_send(SinkMessage::Apply(sample)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(SinkMessage::Apply(sample))) => {
                tracing::warn!("AsyncSink: Queue full, dropping batch of {} values", sample.len());
            }
            Err(_) => {
                tracing::error!("AsyncSink: Consumer stopped, dropping sample");
            }
        }
    }
}

/// Drain the sink queue, applying one batch at a time.
async fn run_sink_consumer(mut rx: mpsc::Receiver<SinkMessage>, store: Arc<dyn AttributeStore>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMessage::Apply(sample) => {
                let applied = apply_sample(store.as_ref(), &sample);
                tracing::trace!("AsyncSink: Applied {}/{} values", applied, sample.len());
            }
            SinkMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
