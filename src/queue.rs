//! Reconcile queue
//!
//! A keyed queue of pending load balancer updates: at most one live entry
//! per service, guarded by a single mutex. Pushes onto an existing key
//! coalesce into it; pops pick the ready entry whose backing nodes
//! changed most recently, so services provoked by fresh node churn
//! reconverge before stale work. The set of live keys is bounded by the
//! number of LoadBalancer services, so a linear scan per pop is fine.

use crate::error::Result;
use crate::load_balancer::LoadBalancer;
use crate::registry::{NodeRegistry, ServiceKey};
use k8s_openapi::api::core::v1::Service;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A unit of reconciliation work for one service.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Snapshot of the service at push time
    pub service: Service,
    /// Cached LB view from a previous fetch; cleared on coalesce and
    /// re-push
    pub lb: Option<LoadBalancer>,
    /// Whether the reconciliation must also refresh the backend pool
    pub update_pool: bool,
    /// When this entry entered the queue in its current attempt
    pub start: Instant,
    /// Earliest time the entry may be popped
    pub backoff_until: Option<Instant>,
}

impl QueueEntry {
    pub fn new(service: Service, update_pool: bool) -> Self {
        Self {
            service,
            lb: None,
            update_pool,
            start: Instant::now(),
            backoff_until: None,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::from_service(&self.service)
    }

    /// Strictly-future `backoff_until` counts as backed off; equal to now
    /// counts as ready.
    fn backed_off(&self, now: Instant) -> bool {
        self.backoff_until.map_or(false, |until| until > now)
    }
}

struct Candidate {
    key: ServiceKey,
    top_revision: u64,
    start: Instant,
    backed_off: bool,
}

/// Ready entries before backed-off ones; among ready, highest node
/// revision first, then FIFO by start.
fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    match (a.backed_off, b.backed_off) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => b
            .top_revision
            .cmp(&a.top_revision)
            .then_with(|| a.start.cmp(&b.start)),
    }
}

pub struct ReconcileQueue {
    registry: Arc<NodeRegistry>,
    entries: Mutex<HashMap<ServiceKey, QueueEntry>>,
}

impl ReconcileQueue {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue an entry. A push onto a live key coalesces: the service
    /// snapshot is replaced, the cached LB view is dropped,
    /// `update_pool` is OR-combined, and the existing entry's start and
    /// backoff are preserved. A push onto a fresh key is validated
    /// against the registry first so work with no feasible action is
    /// rejected instead of queued.
    pub fn push(&self, entry: QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let key = entry.key();

        if let Some(existing) = entries.get_mut(&key) {
            existing.service = entry.service;
            existing.lb = None;
            existing.update_pool |= entry.update_pool;
            return Ok(());
        }

        // Validate that nodes exist now; workers fetch the live set from
        // the registry again when the entry runs.
        self.registry.nodes_for_service(&entry.service)?;

        entries.insert(key, entry);
        Ok(())
    }

    /// Re-enqueue a failed entry, not poppable for `backoff`. If a
    /// fresher push already re-created the key, the coalescing in
    /// [`push`](Self::push) keeps that entry's state and this backoff
    /// delay is discarded: the fresher intent wins.
    pub fn push_with_backoff(&self, mut entry: QueueEntry, backoff: Duration) -> Result<()> {
        let now = Instant::now();
        entry.backoff_until = Some(now + backoff);
        entry.start = now;
        entry.lb = None;
        self.push(entry)
    }

    /// Remove and return the highest-priority ready entry, or `None`
    /// when nothing is ready. Node revisions are a dynamic property, so
    /// each pop recomputes every entry's top revision from the registry.
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let now = Instant::now();

        let mut candidates: Vec<Candidate> = entries
            .iter()
            .map(|(key, entry)| {
                let top_revision = self
                    .registry
                    .nodes_containing_service(key)
                    .iter()
                    .map(|node| node.revision)
                    .max()
                    .unwrap_or(0);
                Candidate {
                    key: key.clone(),
                    top_revision,
                    start: entry.start,
                    backed_off: entry.backed_off(now),
                }
            })
            .collect();

        candidates.sort_by(compare);

        let head = candidates.first()?;
        if head.backed_off {
            return None;
        }

        tracing::debug!(
            service = %head.key,
            revision = head.top_revision,
            "popping queued service"
        );
        entries.remove(&head.key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::registry::{NodeEvent, NodeInfo};
    use serde_json::json;

    fn labels() -> GlobalConfig {
        crate::config::read_config(Some(
            r#"
[global]
service-label = "csccm.io/app-pool"
node-label = "csccm.io/pool"
"#,
        ))
        .unwrap()
        .global
    }

    fn node(name: &str, pool: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            environment: "prod".to_string(),
            project_id: "project-1".to_string(),
            pool: pool.to_string(),
            host_id: format!("host-{}", name),
            network_id: "net-1".to_string(),
            revision: 0,
        }
    }

    fn service(namespace: &str, name: &str, pool: &str) -> Service {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {"csccm.io/app-pool": pool}
            },
            "spec": {"type": "LoadBalancer"}
        }))
        .unwrap()
    }

    fn setup(pools: &[(&str, &str)]) -> (Arc<NodeRegistry>, ReconcileQueue) {
        let registry = Arc::new(NodeRegistry::new(labels()));
        for (name, pool) in pools {
            registry.observe(node(name, pool), NodeEvent::Add);
        }
        let queue = ReconcileQueue::new(Arc::clone(&registry));
        (registry, queue)
    }

    #[test]
    fn test_push_rejects_when_no_nodes() {
        let (_registry, queue) = setup(&[("n1", "batch")]);
        let err = queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap_err();
        assert!(err.is_no_nodes());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_pop_basic() {
        let (_registry, queue) = setup(&[("n1", "web")]);
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();
        assert_eq!(queue.len(), 1);

        let entry = queue.pop().expect("entry should be ready");
        assert_eq!(entry.key(), ServiceKey::new("a", "x"));
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_coalesce_keeps_one_entry_with_merged_state() {
        let (_registry, queue) = setup(&[("n1", "web")]);

        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();

        // Fresher snapshot for the same key, now asking for a pool update
        let mut fresher = service("a", "x", "web");
        fresher
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("generation".to_string(), "2".to_string());
        let mut entry = QueueEntry::new(fresher, true);
        entry.lb = Some(LoadBalancer {
            name: "x-a".to_string(),
            environment: "prod".to_string(),
            project_id: "p1".to_string(),
            network_ids: vec![],
            rule: None,
        });
        queue.push(entry).unwrap();

        assert_eq!(queue.len(), 1, "pushes to one key must coalesce");
        let popped = queue.pop().unwrap();
        assert!(popped.update_pool, "update_pool is OR-combined");
        assert!(popped.lb.is_none(), "cached lb view is dropped on coalesce");
        assert_eq!(
            popped
                .service
                .metadata
                .annotations
                .unwrap()
                .get("generation")
                .map(String::as_str),
            Some("2"),
            "surviving snapshot is the last pushed"
        );
        assert!(queue.pop().is_none(), "a second pop sees an empty queue");
    }

    #[test]
    fn test_pop_prefers_higher_node_revision() {
        let (registry, queue) = setup(&[("n1", "web")]);
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();

        // Nodes in "batch" churn after x was queued, so y outranks x.
        registry.observe(node("n2", "batch"), NodeEvent::Add);
        queue
            .push(QueueEntry::new(service("a", "y", "batch"), false))
            .unwrap();

        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "y"));
        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "x"));
    }

    #[test]
    fn test_pop_is_fifo_on_equal_revision() {
        let (_registry, queue) = setup(&[("n1", "web")]);
        let mut first = QueueEntry::new(service("a", "x", "web"), false);
        let mut second = QueueEntry::new(service("a", "y", "web"), false);
        let now = Instant::now();
        first.start = now - Duration::from_secs(5);
        second.start = now;

        queue.push(second).unwrap();
        queue.push(first).unwrap();

        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "x"));
        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "y"));
    }

    #[test]
    fn test_revision_is_recomputed_on_every_pop() {
        let (registry, queue) = setup(&[("n1", "web"), ("n2", "batch")]);
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();
        queue
            .push(QueueEntry::new(service("a", "y", "batch"), false))
            .unwrap();

        // x was pushed first, but its node churns after both pushes.
        registry.observe(node("n1", "web"), NodeEvent::Update);

        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "x"));
    }

    #[test]
    fn test_backoff_respected() {
        let (_registry, queue) = setup(&[("n1", "web")]);
        queue
            .push_with_backoff(
                QueueEntry::new(service("a", "x", "web"), false),
                Duration::from_millis(60),
            )
            .unwrap();

        assert!(queue.pop().is_none(), "entry must not pop during backoff");
        assert_eq!(queue.len(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert!(queue.pop().is_some(), "entry pops once backoff elapsed");
    }

    #[test]
    fn test_ready_entry_outranks_backed_off_higher_revision() {
        let (registry, queue) = setup(&[("n1", "web")]);

        // y's nodes are fresher, but y is in backoff; the ready x wins.
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();
        registry.observe(node("n2", "batch"), NodeEvent::Add);
        queue
            .push_with_backoff(
                QueueEntry::new(service("a", "y", "batch"), false),
                Duration::from_secs(30),
            )
            .unwrap();

        assert_eq!(queue.pop().unwrap().key(), ServiceKey::new("a", "x"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_coalesce_preserves_backoff() {
        let (_registry, queue) = setup(&[("n1", "web")]);
        queue
            .push_with_backoff(
                QueueEntry::new(service("a", "x", "web"), false),
                Duration::from_millis(80),
            )
            .unwrap();

        // A fresh push during backoff merges into the held entry without
        // making it poppable early.
        queue
            .push(QueueEntry::new(service("a", "x", "web"), true))
            .unwrap();
        assert!(queue.pop().is_none(), "coalescing must not clear backoff");

        std::thread::sleep(Duration::from_millis(100));
        let popped = queue.pop().unwrap();
        assert!(popped.update_pool, "merged update_pool flag survives backoff");
    }

    #[test]
    fn test_fresh_push_discards_repush_backoff() {
        let (_registry, queue) = setup(&[("n1", "web")]);
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();

        // A worker takes the entry, and a fresh push lands while it runs.
        let taken = queue.pop().unwrap();
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();

        // The worker fails and re-pushes with backoff; the fresher entry
        // already owns the key, so the delay is discarded.
        queue
            .push_with_backoff(taken, Duration::from_secs(30))
            .unwrap();

        assert!(
            queue.pop().is_some(),
            "backoff from the stale attempt must not delay the fresh entry"
        );
    }

    #[test]
    fn test_entry_with_vanished_nodes_still_pops() {
        let (registry, queue) = setup(&[("n1", "web")]);
        queue
            .push(QueueEntry::new(service("a", "x", "web"), false))
            .unwrap();

        // The backing node disappears after the push; the worker will see
        // the NoNodes error on its own re-query.
        registry.observe(node("n1", "web"), NodeEvent::Delete);

        assert!(queue.pop().is_some());
    }
}
