//! Event intake
//!
//! Thin wiring between Kubernetes watches and the engine: LoadBalancer
//! Services are cached and enqueued, Node events update the registry and
//! re-enqueue every cached Service the node's pool backs. Enqueue-time
//! validation failures (no matching nodes) are logged and dropped here;
//! the next relevant event re-enqueues the service.

use crate::config::GlobalConfig;
use crate::instances::node_info_from_kube;
use crate::queue::{QueueEntry, ReconcileQueue};
use crate::registry::{NodeEvent, NodeRegistry, ServiceKey};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::watcher::{self, watcher};
use kube::{Api, Client};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch as signal;
use tracing::{debug, warn};

const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shared sink for Service and Node watch events.
pub struct EventIntake {
    registry: Arc<NodeRegistry>,
    queue: Arc<ReconcileQueue>,
    labels: GlobalConfig,
    services: Mutex<HashMap<ServiceKey, Service>>,
    known_nodes: Mutex<HashSet<String>>,
}

impl EventIntake {
    pub fn new(
        registry: Arc<NodeRegistry>,
        queue: Arc<ReconcileQueue>,
        labels: GlobalConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            labels,
            services: Mutex::new(HashMap::new()),
            known_nodes: Mutex::new(HashSet::new()),
        }
    }

    pub fn handle_service_event(&self, event: watcher::Event<Service>) {
        match event {
            watcher::Event::Apply(service) | watcher::Event::InitApply(service) => {
                self.on_service_applied(service);
            }
            watcher::Event::Delete(service) => {
                let key = ServiceKey::from_service(&service);
                debug!(service = %key, "service removed");
                self.services.lock().expect("service cache poisoned").remove(&key);
                self.registry.forget_service(&key);
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    pub fn handle_node_event(&self, event: watcher::Event<Node>) {
        match event {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                self.on_node_applied(&node);
            }
            watcher::Event::Delete(node) => {
                self.on_node_deleted(&node);
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    fn on_service_applied(&self, service: Service) {
        let key = ServiceKey::from_service(&service);
        if !is_load_balancer(&service) {
            // A type change away from LoadBalancer stops tracking; the
            // provider-side teardown belongs to the deletion path.
            if self
                .services
                .lock()
                .expect("service cache poisoned")
                .remove(&key)
                .is_some()
            {
                self.registry.forget_service(&key);
            }
            return;
        }

        self.services
            .lock()
            .expect("service cache poisoned")
            .insert(key.clone(), service.clone());

        // Service changes may touch ports/pool settings, not only
        // membership.
        self.enqueue(QueueEntry::new(service, true));
    }

    fn on_node_applied(&self, node: &Node) {
        let info = match node_info_from_kube(node, &self.labels) {
            Ok(info) => info,
            Err(e) => {
                warn!(node = ?node.metadata.name, error = %e, "ignoring node");
                return;
            }
        };

        let event = if self
            .known_nodes
            .lock()
            .expect("node set poisoned")
            .insert(info.name.clone())
        {
            NodeEvent::Add
        } else {
            NodeEvent::Update
        };

        let pool = info.pool.clone();
        self.registry.observe(info, event);
        self.requeue_pool_services(&pool);
    }

    fn on_node_deleted(&self, node: &Node) {
        match node_info_from_kube(node, &self.labels) {
            Ok(info) => {
                let pool = info.pool.clone();
                self.known_nodes
                    .lock()
                    .expect("node set poisoned")
                    .remove(&info.name);
                self.registry.observe(info, NodeEvent::Delete);
                self.requeue_pool_services(&pool);
            }
            Err(_) => {
                // Labels may already be gone on delete; fall back to the
                // Kubernetes name.
                if let Some(name) = &node.metadata.name {
                    self.known_nodes
                        .lock()
                        .expect("node set poisoned")
                        .remove(name);
                    self.registry.remove_named(name);
                }
            }
        }
    }

    fn requeue_pool_services(&self, pool: &str) {
        let keys = self.registry.service_keys_for_pool(pool);
        let services = self.services.lock().expect("service cache poisoned");
        for key in keys {
            if let Some(service) = services.get(&key) {
                self.enqueue(QueueEntry::new(service.clone(), false));
            }
        }
    }

    fn enqueue(&self, entry: QueueEntry) {
        let key = entry.key();
        if let Err(e) = self.queue.push(entry) {
            warn!(service = %key, error = %e, "not enqueueing load balancer update");
        }
    }

    #[cfg(test)]
    fn cached_services(&self) -> usize {
        self.services.lock().unwrap().len()
    }
}

fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

/// Watch Services cluster-wide until `cancel` trips.
pub async fn run_service_watcher(
    client: Client,
    intake: Arc<EventIntake>,
    mut cancel: signal::Receiver<bool>,
) {
    let api: Api<Service> = Api::all(client);
    let stream = watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            item = stream.next() => match item {
                Some(Ok(event)) => intake.handle_service_event(event),
                Some(Err(e)) => {
                    warn!(error = %e, "service watch error");
                    tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                }
                None => return,
            },
        }
    }
}

/// Watch Nodes cluster-wide until `cancel` trips.
pub async fn run_node_watcher(
    client: Client,
    intake: Arc<EventIntake>,
    mut cancel: signal::Receiver<bool>,
) {
    let api: Api<Node> = Api::all(client);
    let stream = watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            item = stream.next() => match item {
                Some(Ok(event)) => intake.handle_node_event(event),
                Some(Err(e)) => {
                    warn!(error = %e, "node watch error");
                    tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                }
                None => return,
            },
        }
    }
}
