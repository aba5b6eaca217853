//! Load balancer update engine
//!
//! A fixed pool of workers pops entries from the reconcile queue,
//! serializes on the per-service lock, re-queries the node registry for
//! the freshest backing set, and drives the LB adapter. Failures emit a
//! Warning event and re-enqueue the entry with backoff; the engine never
//! gives up on a service. Shutdown is two-phase: signal stop, then wait
//! for every worker to drain.

use crate::error::Result;
use crate::events::{EventSink, REASON_UPDATE_LB_FAILED};
use crate::load_balancer::{LoadBalancerAdapter, ManageOutcome};
use crate::metrics;
use crate::queue::{QueueEntry, ReconcileQueue};
use crate::registry::{ids_for_nodes, node_names, NodeRegistry};
use crate::service_lock::ServiceLockTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine tuning. Only the worker count is exposed in configuration;
/// the backoff and poll intervals are operational constants.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Number of concurrent update workers
    pub workers: usize,
    /// Delay before a failed entry may run again
    pub failure_backoff: Duration,
    /// Sleep between polls when the queue has nothing ready
    pub idle_poll: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: crate::config::DEFAULT_UPDATE_LB_WORKERS,
            failure_backoff: Duration::from_secs(15),
            idle_poll: Duration::from_secs(1),
        }
    }
}

/// Handle returned by [`UpdateEngine::start`]; owns the stop signal and
/// the worker tasks.
pub struct EngineHandle {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal stop and wait for all workers. Workers finish their
    /// current item and drain the queue before exiting.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "update worker panicked");
            }
        }
    }
}

pub struct UpdateEngine {
    registry: Arc<NodeRegistry>,
    queue: Arc<ReconcileQueue>,
    adapter: Arc<dyn LoadBalancerAdapter>,
    events: Arc<dyn EventSink>,
    locks: ServiceLockTable,
    settings: EngineSettings,
}

impl UpdateEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        queue: Arc<ReconcileQueue>,
        adapter: Arc<dyn LoadBalancerAdapter>,
        events: Arc<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            adapter,
            events,
            locks: ServiceLockTable::new(),
            settings,
        }
    }

    /// Spawn the worker pool. Workers exit when `cancel` trips (dropping
    /// any popped item) or, after [`EngineHandle::shutdown`] is called,
    /// once the queue is drained.
    pub fn start(self: &Arc<Self>, cancel: watch::Receiver<bool>) -> EngineHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.settings.workers);
        info!(workers = self.settings.workers, "starting load balancer update workers");

        for worker in 0..self.settings.workers {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            let stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker, cancel, stop).await;
            }));
        }

        EngineHandle {
            stop: stop_tx,
            handles,
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        mut cancel: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut exit_when_done = false;
        let mut wait = Duration::ZERO;

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    debug!(worker, "update worker cancelled");
                    return;
                }
                _ = stop.changed(), if !exit_when_done => {
                    exit_when_done = true;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.queue.pop() {
                Some(item) => {
                    wait = Duration::ZERO;
                    self.handle_item(item).await;
                }
                None => {
                    if exit_when_done && self.queue.is_empty() {
                        debug!(worker, "update worker drained, exiting");
                        return;
                    }
                    wait = self.settings.idle_poll;
                }
            }
        }
    }

    /// Run one queue entry and account for the outcome: processed and
    /// duration series always, and on failure the failure counter, a
    /// Warning event on the Service, and a backoff re-push.
    async fn handle_item(&self, item: QueueEntry) {
        let key = item.key();
        let outcome = self.process_entry(&item).await;

        metrics::record_processed(&key.namespace, &key.name);
        metrics::record_item_duration(&key.namespace, &key.name, item.start.elapsed());

        if let Err(err) = outcome {
            let msg = format!("Error updating load balancer with new hosts: {}", err);
            error!(service = %key, error = %err, "load balancer update failed");
            metrics::record_failure(&key.namespace, &key.name);
            self.events
                .warning(&item.service, REASON_UPDATE_LB_FAILED, &msg)
                .await;
            if let Err(push_err) = self
                .queue
                .push_with_backoff(item, self.settings.failure_backoff)
            {
                // The service lost its nodes while the attempt ran; the
                // next service or node event will re-enqueue it.
                warn!(service = %key, error = %push_err, "dropping failed entry");
            }
        }
    }

    async fn process_entry(&self, entry: &QueueEntry) -> Result<()> {
        let key = entry.key();
        let _guard = self.locks.lock(key.clone()).await;

        let nodes = self.registry.nodes_for_service(&entry.service)?;
        debug!(
            service = %key,
            nodes = ?node_names(&nodes),
            "processing lb update"
        );

        let (host_ids, network_ids, project_id) = ids_for_nodes(&nodes);

        let lb = match &entry.lb {
            Some(lb) => lb.clone(),
            None => {
                let lb = self
                    .adapter
                    .get_load_balancer(&entry.service, &project_id, &network_ids)
                    .await?;

                if lb.rule.is_none() {
                    debug!(service = %key, "no load balancer rule yet, nothing to sync");
                    return Ok(());
                }

                match self.adapter.should_manage(&lb) {
                    ManageOutcome::Manage => {}
                    ManageOutcome::Skip(reason) => {
                        info!(service = %key, reason = %reason, "skipping load balancer update");
                        return Ok(());
                    }
                }
                lb
            }
        };

        self.adapter.sync_nodes(&lb, &host_ids, &network_ids).await?;

        if entry.update_pool {
            self.adapter.update_pool(&lb).await?;
        }

        Ok(())
    }
}
