use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eventflow_shared::stream::{ConsumerRecord, StreamPartition};

use super::Shared;
use crate::checkpoint::{Checkpoint, CheckpointWrite};
use crate::consumer::{PartitionConsumer, ReadExit};
use crate::handler::{EventHandler, FailurePolicy};
use crate::lease::{Acquire, LeaseStore, PartitionLease};
use crate::observer::{Observers, ProcessorEvent};

/// Why delivery of a partition ended.
#[derive(Debug)]
enum Exit {
    /// Stopped from the outside: shutdown, rebalance or lease loss.
    Cancelled,
    /// The handler gave up on a batch and the failure policy stops the partition.
    HandlerStopped,
    Faulted(String),
}

enum BatchOutcome {
    Processed,
    Skipped,
    Stop,
    Cancelled,
}

/// Owns one leased partition: keeps the lease alive and feeds the handler.
pub(super) struct PartitionWorker<H> {
    shared: Arc<Shared<H>>,
    lease: PartitionLease,
    cancel: CancellationToken,
    /// Set once ownership is gone. Nothing is written for the partition afterwards.
    lost: Arc<AtomicBool>,
}

impl<H: EventHandler> PartitionWorker<H> {
    pub(super) fn new(
        shared: Arc<Shared<H>>,
        lease: PartitionLease,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            lease,
            cancel,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(super) async fn run(self) {
        let partition = self.lease.partition.clone();
        let renewal_done = CancellationToken::new();
        let renewal = Renewal {
            leases: self.shared.leases.clone(),
            lease: self.lease.clone(),
            interval: self.shared.config.renew_interval,
            timeout: self.shared.config.renew_timeout,
            done: renewal_done.clone(),
            worker: self.cancel.clone(),
            lost: Arc::clone(&self.lost),
            observers: self.shared.observers.clone(),
        };

        // renewal and delivery share the task so that aborting the worker stops both
        let (renewed, exit) = tokio::join!(renewal.run(), async {
            let exit = self.deliver().await;
            renewal_done.cancel();
            exit
        });

        match &exit {
            Exit::Faulted(reason) => {
                self.shared.observers.notify(ProcessorEvent::PartitionFaulted {
                    partition: partition.clone(),
                    reason: reason.clone(),
                });
            }
            Exit::HandlerStopped | Exit::Cancelled => {
                debug!(%partition, ?exit, "Partition delivery ended");
            }
        }

        if self.lost.load(Ordering::SeqCst) {
            return;
        }
        let Some(lease) = renewed else {
            return;
        };
        match self.shared.leases.release(&lease).await {
            Ok(()) => self
                .shared
                .observers
                .notify(ProcessorEvent::LeaseReleased { partition }),
            Err(e) => self
                .shared
                .observers
                .notify(ProcessorEvent::LeaseAbandoned {
                    partition,
                    reason: format!("release failed: {e}"),
                }),
        }
    }

    async fn deliver(&self) -> Exit {
        let config = &self.shared.config;
        let partition = &self.lease.partition;

        let position = match self.shared.checkpoints.read(partition).await {
            Ok(Some(checkpoint)) => checkpoint.resume_position(),
            Ok(None) => config.default_start_position.clone(),
            Err(e) => return Exit::Faulted(format!("reading checkpoint: {e}")),
        };

        let consumer = PartitionConsumer::new(
            partition.clone(),
            Arc::clone(&self.shared.source),
            config,
            &self.cancel,
        );
        let (records, reader) = match consumer.start(position).await {
            Ok(started) => started,
            Err(_) if self.cancel.is_cancelled() => return Exit::Cancelled,
            Err(e) => return Exit::Faulted(e.to_string()),
        };

        let batches = records.chunks_timeout(config.max_batch_size, config.max_wait_time);
        tokio::pin!(batches);

        let mut pending: Option<Checkpoint> = None;
        let mut uncommitted = 0usize;

        let exit = loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Exit::Cancelled,
                batch = batches.next() => batch,
            };
            let Some(batch) = batch else {
                // the reader is done, find out why
                break match reader.await {
                    Ok(Ok(ReadExit::EndOfPartition)) => {
                        info!(%partition, "Partition fully read, holding on to it");
                        self.flush(&mut pending).await;
                        self.cancel.cancelled().await;
                        Exit::Cancelled
                    }
                    Ok(Ok(_)) => Exit::Cancelled,
                    Ok(Err(e)) => Exit::Faulted(e.to_string()),
                    Err(e) => Exit::Faulted(format!("reader task failed: {e}")),
                };
            };

            match self.handle_batch(&batch).await {
                BatchOutcome::Processed | BatchOutcome::Skipped => {}
                BatchOutcome::Stop => break Exit::HandlerStopped,
                BatchOutcome::Cancelled => break Exit::Cancelled,
            }

            if let Some(last) = batch.last() {
                pending = Some(Checkpoint::for_record(last, Some(&config.instance_id)));
                uncommitted += 1;
            }
            if uncommitted >= config.checkpoint_every {
                self.flush(&mut pending).await;
                if pending.is_none() {
                    uncommitted = 0;
                }
            }
            if self.lost.load(Ordering::SeqCst) {
                break Exit::Cancelled;
            }
        };

        consumer.stop();
        self.flush(&mut pending).await;
        exit
    }

    /// Runs the handler on `batch`, retrying with backoff. Gives up according to the failure
    /// policy.
    async fn handle_batch(&self, batch: &[ConsumerRecord]) -> BatchOutcome {
        let config = &self.shared.config;
        let mut backoff = config.handler_retry.backoff();
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            let reason = match tokio::time::timeout(
                config.handler_timeout,
                self.shared.handler.process(batch),
            )
            .await
            {
                Ok(Ok(())) => return BatchOutcome::Processed,
                Ok(Err(e)) => e.reason,
                Err(_) => format!("handler timed out after {:?}", config.handler_timeout),
            };

            if let Some(delay) = backoff.next()
                && !self.lost.load(Ordering::SeqCst)
            {
                warn!(
                    partition = %self.lease.partition,
                    attempts,
                    reason = %reason,
                    ?delay,
                    "Handler failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return BatchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            let skipped = config.failure_policy == FailurePolicy::SkipAndCheckpoint;
            self.shared.observers.notify(ProcessorEvent::HandlerFailed {
                partition: self.lease.partition.clone(),
                first_sequence_number: batch.first().map_or(0, |r| r.sequence_number),
                last_sequence_number: batch.last().map_or(0, |r| r.sequence_number),
                attempts,
                reason,
                skipped,
            });
            return if skipped {
                BatchOutcome::Skipped
            } else {
                BatchOutcome::Stop
            };
        }
    }

    /// Commits the pending checkpoint. It stays pending if the write failed.
    async fn flush(&self, pending: &mut Option<Checkpoint>) {
        if self.lost.load(Ordering::SeqCst) {
            return;
        }
        let Some(checkpoint) = pending.as_ref() else {
            return;
        };
        let partition = &checkpoint.partition;

        match self.shared.checkpoints.write(checkpoint).await {
            Ok(CheckpointWrite::Committed) => {
                self.shared
                    .observers
                    .notify(ProcessorEvent::CheckpointCommitted {
                        partition: partition.clone(),
                        offset: checkpoint.offset,
                        sequence_number: checkpoint.sequence_number,
                    });
                *pending = None;
            }
            Ok(CheckpointWrite::Unchanged) => *pending = None,
            Ok(CheckpointWrite::Rejected { current }) => {
                self.mark_lost(
                    partition,
                    format!("checkpoint at sequence {current} written by a newer owner"),
                );
                *pending = None;
            }
            Err(e) => {
                error!(%partition, error = %e, "Failed to commit checkpoint");
                self.shared
                    .observers
                    .notify(ProcessorEvent::CheckpointFailed {
                        partition: partition.clone(),
                        sequence_number: checkpoint.sequence_number,
                        reason: e.to_string(),
                    });
            }
        }
    }

    fn mark_lost(&self, partition: &StreamPartition, reason: String) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.observers.notify(ProcessorEvent::LeaseLost {
            partition: partition.clone(),
            reason,
        });
        self.cancel.cancel();
    }
}

/// Keeps a lease alive until `done` fires. Ownership is considered lost as soon as one renewal
/// fails or times out.
struct Renewal {
    leases: LeaseStore,
    lease: PartitionLease,
    interval: Duration,
    timeout: Duration,
    done: CancellationToken,
    worker: CancellationToken,
    lost: Arc<AtomicBool>,
    observers: Observers,
}

impl Renewal {
    /// Returns the latest lease, or `None` if it was lost.
    async fn run(mut self) -> Option<PartitionLease> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => return Some(self.lease),
                _ = ticker.tick() => {}
            }
            if self.lost.load(Ordering::SeqCst) {
                return None;
            }

            let reason = match tokio::time::timeout(self.timeout, self.leases.renew(&self.lease))
                .await
            {
                Ok(Acquire::Granted(renewed)) => {
                    self.lease = renewed;
                    continue;
                }
                Ok(Acquire::Denied(denial)) => denial.to_string(),
                Err(_) => format!("renewal timed out after {:?}", self.timeout),
            };

            if !self.lost.swap(true, Ordering::SeqCst) {
                self.observers.notify(ProcessorEvent::LeaseLost {
                    partition: self.lease.partition.clone(),
                    reason,
                });
            }
            self.worker.cancel();
            return None;
        }
    }
}
