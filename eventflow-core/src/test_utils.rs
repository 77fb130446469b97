use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use eventflow_shared::stream::ConsumerRecord;

use crate::handler::{EventHandler, HandlerError};
use crate::observer::{Observer, ProcessorEvent};

/// Handler remembering every record it confirmed, with scripted failures and stalls.
#[derive(Clone, Default)]
pub(crate) struct CollectingHandler {
    processed: Arc<Mutex<Vec<ConsumerRecord>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    attempts: Arc<Mutex<HashMap<(String, i64), usize>>>,
    /// Remaining failures of batches containing (partition id, sequence number).
    failures: Arc<Mutex<HashMap<(String, i64), usize>>>,
    /// Batches reaching this sequence number never complete.
    stall_from: Arc<Mutex<Option<i64>>>,
}

impl CollectingHandler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(&self, partition_id: &str, sequence_number: i64, times: usize) {
        self.failures
            .lock()
            .insert((partition_id.to_string(), sequence_number), times);
    }

    pub(crate) fn stall_from(&self, sequence_number: i64) {
        *self.stall_from.lock() = Some(sequence_number);
    }

    pub(crate) fn processed(&self) -> Vec<ConsumerRecord> {
        self.processed.lock().clone()
    }

    /// Sequence numbers confirmed for one partition, in delivery order.
    pub(crate) fn sequences(&self, partition_id: &str) -> Vec<i64> {
        self.processed
            .lock()
            .iter()
            .filter(|r| r.partition.partition_id == partition_id)
            .map(|r| r.sequence_number)
            .collect()
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// How often a batch containing the record was handed to the handler.
    pub(crate) fn attempts(&self, partition_id: &str, sequence_number: i64) -> usize {
        self.attempts
            .lock()
            .get(&(partition_id.to_string(), sequence_number))
            .copied()
            .unwrap_or(0)
    }
}

impl EventHandler for CollectingHandler {
    async fn process(&self, batch: &[ConsumerRecord]) -> Result<(), HandlerError> {
        {
            let mut attempts = self.attempts.lock();
            for record in batch {
                *attempts
                    .entry((record.partition.partition_id.clone(), record.sequence_number))
                    .or_default() += 1;
            }
        }

        let stall_from = *self.stall_from.lock();
        if let Some(from) = stall_from
            && batch.iter().any(|r| r.sequence_number >= from)
        {
            std::future::pending::<()>().await;
        }

        {
            let mut failures = self.failures.lock();
            for record in batch {
                let key = (record.partition.partition_id.clone(), record.sequence_number);
                if let Some(remaining) = failures.get_mut(&key)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return Err(HandlerError::new(format!(
                        "cannot process {}",
                        record.sequence_number
                    )));
                }
            }
        }

        self.batch_sizes.lock().push(batch.len());
        self.processed.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Observer keeping every event.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<ProcessorEvent>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<ProcessorEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn any(&self, predicate: impl Fn(&ProcessorEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, event: &ProcessorEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether it held.
pub(crate) async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
