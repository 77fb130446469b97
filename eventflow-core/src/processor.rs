//! Top-level coordinator of one processor instance.
//!
//! ```text
//!                      balance loop (every balance interval)
//!                        |  register presence
//!                        |  reconcile ownership
//!                        v
//!   acquired/adopted lease ---> partition worker ---> renewal (every renew interval)
//!                                     |
//!                                     +--> consumer --records--> handler --> checkpoint
//! ```
//!
//! Each partition worker runs under a child of the processor's cancellation token and is
//! stopped when its lease is lost, when the balancer gives the partition away, when the
//! failure policy says so, or when the processor stops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eventflow_shared::kv::DurableStore;
use eventflow_shared::stream::{StreamPartition, StreamSource};

use crate::balancer::{BalanceStrategy, GreedyBalancer, LoadBalancer};
use crate::checkpoint::CheckpointStore;
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::handler::EventHandler;
use crate::lease::{LeaseStore, PartitionLease};
use crate::observer::{LoggingObserver, Observer, Observers, ProcessorEvent};

/// Delivery to the handler, checkpointing and lease renewal of one owned partition.
mod partition;

pub struct EventProcessorBuilder<H> {
    config: ProcessorConfig,
    source: Arc<dyn StreamSource>,
    store: Arc<dyn DurableStore>,
    handler: H,
    observers: Vec<Arc<dyn Observer>>,
    strategy: Arc<dyn BalanceStrategy>,
}

impl<H: EventHandler> EventProcessorBuilder<H> {
    /// Registers an observer in addition to the built-in logging one.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replaces the default [`GreedyBalancer`].
    pub fn balance_strategy(mut self, strategy: Arc<dyn BalanceStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> Result<EventProcessor<H>> {
        self.config.validate()?;

        let leases = LeaseStore::from_config(Arc::clone(&self.store), &self.config);
        let checkpoints = CheckpointStore::from_config(Arc::clone(&self.store), &self.config);
        let balancer = LoadBalancer::new(
            self.config.stream_id.clone(),
            self.config.instance_id.clone(),
            Arc::clone(&self.source),
            leases.clone(),
            self.strategy,
        );

        Ok(EventProcessor {
            shared: Arc::new(Shared {
                config: self.config,
                source: self.source,
                leases,
                checkpoints,
                balancer,
                handler: self.handler,
                observers: Observers::new(self.observers),
                workers: Mutex::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }
}

enum Lifecycle {
    Created,
    Starting,
    Running { balance: JoinHandle<()> },
    Stopped,
}

/// One member of a consumer group. Single use: once stopped it cannot be started again.
pub struct EventProcessor<H> {
    shared: Arc<Shared<H>>,
    lifecycle: Mutex<Lifecycle>,
}

struct Shared<H> {
    config: ProcessorConfig,
    source: Arc<dyn StreamSource>,
    leases: LeaseStore,
    checkpoints: CheckpointStore,
    balancer: LoadBalancer,
    handler: H,
    observers: Observers,
    workers: Mutex<BTreeMap<StreamPartition, Worker>>,
    cancel: CancellationToken,
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<H: EventHandler> EventProcessor<H> {
    pub fn builder(
        config: ProcessorConfig,
        source: Arc<dyn StreamSource>,
        store: Arc<dyn DurableStore>,
        handler: H,
    ) -> EventProcessorBuilder<H> {
        EventProcessorBuilder {
            config,
            source,
            store,
            handler,
            observers: vec![Arc::new(LoggingObserver)],
            strategy: Arc::new(GreedyBalancer),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.config.instance_id
    }

    /// Announces the instance and starts balancing. Partitions are picked up by the balance
    /// loop, the first round runs right away.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running { .. } => {
                    return Err(Error::Processor("Processor is already running".to_string()));
                }
                Lifecycle::Stopped => {
                    return Err(Error::Processor(
                        "Processor was stopped and cannot be restarted".to_string(),
                    ));
                }
            }
        }

        let config = &self.shared.config;
        if let Err(e) = self.shared.leases.register_presence(&config.instance_id).await {
            *self.lifecycle.lock() = Lifecycle::Created;
            return Err(e);
        }

        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Starting) {
            return Err(Error::Processor(
                "Processor was stopped while starting".to_string(),
            ));
        }
        let shared = Arc::clone(&self.shared);
        *lifecycle = Lifecycle::Running {
            balance: tokio::spawn(async move { shared.balance_loop().await }),
        };
        info!(
            instance = %config.instance_id,
            stream = %config.stream_id,
            group = %config.consumer_group,
            "Processor started"
        );
        Ok(())
    }

    /// Stops balancing, drains every partition, flushes checkpoints and releases the leases.
    /// Workers still busy when the shutdown timeout elapses are aborted.
    pub async fn stop(&self) -> Result<()> {
        let balance = match std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped) {
            Lifecycle::Running { balance } => balance,
            Lifecycle::Starting | Lifecycle::Created | Lifecycle::Stopped => {
                self.shared.cancel.cancel();
                return Ok(());
            }
        };

        let config = &self.shared.config;
        info!(instance = %config.instance_id, "Stopping processor");
        let deadline = tokio::time::Instant::now() + config.shutdown_timeout;
        self.shared.cancel.cancel();

        let balance_abort = balance.abort_handle();
        if tokio::time::timeout_at(deadline, balance).await.is_err() {
            balance_abort.abort();
        }

        let workers = std::mem::take(&mut *self.shared.workers.lock());
        let aborts: Vec<_> = workers
            .iter()
            .map(|(partition, w)| (partition.clone(), w.task.abort_handle()))
            .collect();
        let drained = futures::future::join_all(workers.into_values().map(|w| w.task));
        if tokio::time::timeout_at(deadline, drained).await.is_err() {
            warn!(
                instance = %config.instance_id,
                timeout = ?config.shutdown_timeout,
                "Partitions did not drain in time, aborting"
            );
            for (partition, abort) in aborts {
                if abort.is_finished() {
                    continue;
                }
                abort.abort();
                self.shared
                    .observers
                    .notify(ProcessorEvent::LeaseAbandoned {
                        partition,
                        reason: "aborted at the shutdown deadline".to_string(),
                    });
            }
        }

        if let Err(e) = self.shared.leases.remove_presence(&config.instance_id).await {
            warn!(instance = %config.instance_id, error = %e, "Failed to remove presence");
        }
        info!(instance = %config.instance_id, "Processor stopped");
        Ok(())
    }

    /// Partitions with a running worker.
    pub fn owned_partitions(&self) -> Vec<StreamPartition> {
        self.shared.working()
    }

    /// Simulates a crash: every task is dropped on the spot, nothing is released or flushed.
    #[cfg(test)]
    pub(crate) fn kill(&self) {
        if let Lifecycle::Running { balance } =
            std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped)
        {
            balance.abort();
        }
        for (_, worker) in std::mem::take(&mut *self.shared.workers.lock()) {
            worker.task.abort();
        }
    }
}

impl<H> Drop for EventProcessor<H> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<H: EventHandler> Shared<H> {
    async fn balance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.balance_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // a round in flight runs to completion so the leases it acquired are not left behind
            self.balance_once().await;
        }
        debug!(instance = %self.config.instance_id, "Balance loop stopped");
    }

    async fn balance_once(self: &Arc<Self>) {
        self.workers.lock().retain(|_, w| !w.task.is_finished());

        if let Err(e) = self.leases.register_presence(&self.config.instance_id).await {
            self.observers.notify(ProcessorEvent::BalanceFailed {
                reason: format!("presence: {e}"),
            });
        }

        let working: BTreeSet<StreamPartition> = self.working().into_iter().collect();
        let reconciliation = match self.balancer.reconcile(&working).await {
            Ok(reconciliation) => reconciliation,
            Err(e) => {
                self.observers.notify(ProcessorEvent::BalanceFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        if self.cancel.is_cancelled() {
            for lease in reconciliation
                .acquired
                .into_iter()
                .chain(reconciliation.adopted)
            {
                let partition = lease.partition.clone();
                match self.leases.release(&lease).await {
                    Ok(()) => debug!(%partition, "Released lease acquired while stopping"),
                    Err(e) => {
                        warn!(%partition, error = %e, "Failed to release lease acquired while stopping")
                    }
                }
            }
            return;
        }

        for lease in reconciliation
            .acquired
            .into_iter()
            .chain(reconciliation.adopted)
        {
            self.spawn_worker(lease);
        }

        let workers = self.workers.lock();
        for partition in reconciliation.release {
            if let Some(worker) = workers.get(&partition) {
                info!(%partition, "Giving up partition for rebalancing");
                worker.cancel.cancel();
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, lease: PartitionLease) {
        let mut workers = self.workers.lock();
        if let Some(existing) = workers.get(&lease.partition)
            && !existing.task.is_finished()
        {
            // the running worker still holds the previous lease, the new one is adopted once it
            // finished
            debug!(partition = %lease.partition, "Partition worker still running");
            return;
        }

        self.observers.notify(ProcessorEvent::LeaseAcquired {
            partition: lease.partition.clone(),
            instance_id: self.config.instance_id.clone(),
        });

        let partition = lease.partition.clone();
        let cancel = self.cancel.child_token();
        let worker = partition::PartitionWorker::new(Arc::clone(self), lease, cancel.clone());
        workers.insert(
            partition,
            Worker {
                cancel,
                task: tokio::spawn(worker.run()),
            },
        );
    }

    fn working(&self) -> Vec<StreamPartition> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, w)| !w.task.is_finished())
            .map(|(p, _)| p.clone())
            .collect()
    }
}
