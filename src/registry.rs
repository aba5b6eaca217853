//! Node registry
//!
//! The registry is the single source of truth for node-set decisions
//! during reconciliation. Every observed node mutation bumps a
//! process-wide monotonic revision counter, which the reconcile queue
//! uses to prioritize services whose underlying nodes changed most
//! recently. Workers re-query the registry immediately before acting so
//! the node set is never the one captured at enqueue time.

use crate::config::GlobalConfig;
use crate::error::{CloudError, Result};
use crate::instances::get_label_or_annotation;
use k8s_openapi::api::core::v1::Service;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Identifies a Service by (namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(service: &Service) -> Self {
        Self {
            namespace: service
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: service.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The engine's view of a cluster node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Provider-side node name
    pub name: String,
    /// CloudStack environment the node lives in
    pub environment: String,
    /// CloudStack project owning the node's VM
    pub project_id: String,
    /// Pool the node belongs to; paired against the service pool label
    pub pool: String,
    /// Provider-side host id used for LB backend membership
    pub host_id: String,
    /// Network the node's NIC is attached to
    pub network_id: String,
    /// Assigned by the registry on every observed mutation; strictly
    /// increases across the process lifetime
    pub revision: u64,
}

/// Node lifecycle events fed into [`NodeRegistry::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Add,
    Update,
    Delete,
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, NodeInfo>,
    /// Last pool binding observed per service; `None` means the service
    /// carries no pool label and matches every node.
    service_pools: HashMap<ServiceKey, Option<String>>,
    revision_counter: u64,
}

/// Tracks the current set of cluster nodes and which pool each service
/// draws its backends from.
pub struct NodeRegistry {
    labels: GlobalConfig,
    state: RwLock<RegistryState>,
}

impl NodeRegistry {
    pub fn new(labels: GlobalConfig) -> Self {
        Self {
            labels,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Apply a node event. Add and update bump the revision counter and
    /// stamp the node with it; delete drops the node.
    pub fn observe(&self, mut node: NodeInfo, event: NodeEvent) {
        let mut state = self.state.write().expect("registry lock poisoned");
        match event {
            NodeEvent::Add | NodeEvent::Update => {
                state.revision_counter += 1;
                node.revision = state.revision_counter;
                tracing::debug!(
                    node = %node.name,
                    pool = %node.pool,
                    revision = node.revision,
                    "observed node"
                );
                state.nodes.insert(node.name.clone(), node);
            }
            NodeEvent::Delete => {
                tracing::debug!(node = %node.name, "removing node");
                state.nodes.remove(&node.name);
            }
        }
    }

    /// Drop a node by name. Used when a delete event arrives for a node
    /// whose metadata no longer derives a full [`NodeInfo`].
    pub fn remove_named(&self, name: &str) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.nodes.remove(name);
    }

    /// Nodes matching the service's pool selection, or
    /// [`CloudError::NoNodesAvailable`] when none do. Records the
    /// service→pool binding for later inverse lookups.
    pub fn nodes_for_service(&self, service: &Service) -> Result<Vec<NodeInfo>> {
        let key = ServiceKey::from_service(service);
        let pool = if self.labels.service_filter_label.is_empty() {
            None
        } else {
            get_label_or_annotation(&service.metadata, &self.labels.service_filter_label)
        };

        let mut state = self.state.write().expect("registry lock poisoned");
        state.service_pools.insert(key.clone(), pool.clone());

        let nodes = Self::matching_nodes(&state, pool.as_deref());
        if nodes.is_empty() {
            return Err(CloudError::NoNodesAvailable(key.to_string()));
        }
        Ok(nodes)
    }

    /// Inverse index used only for priority computation: the nodes backing
    /// a queued service, per its last recorded pool binding. Empty when
    /// the binding or the nodes are unknown.
    pub fn nodes_containing_service(&self, key: &ServiceKey) -> Vec<NodeInfo> {
        let state = self.state.read().expect("registry lock poisoned");
        match state.service_pools.get(key) {
            Some(pool) => Self::matching_nodes(&state, pool.as_deref()),
            None => Vec::new(),
        }
    }

    /// Services whose recorded pool binding selects the given pool.
    /// Drives re-enqueueing when a node in that pool churns.
    pub fn service_keys_for_pool(&self, pool: &str) -> Vec<ServiceKey> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .service_pools
            .iter()
            .filter(|(_, binding)| match binding {
                Some(p) => p == pool,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Forget a service's pool binding after it is deleted.
    pub fn forget_service(&self, key: &ServiceKey) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.service_pools.remove(key);
    }

    fn matching_nodes(state: &RegistryState, pool: Option<&str>) -> Vec<NodeInfo> {
        state
            .nodes
            .values()
            .filter(|node| match pool {
                Some(p) => node.pool == p,
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// Collapse a node set into the identifiers the LB adapter consumes:
/// host ids, deduplicated network ids, and the project id shared by the
/// pool.
pub fn ids_for_nodes(nodes: &[NodeInfo]) -> (Vec<String>, Vec<String>, String) {
    let mut host_ids = Vec::with_capacity(nodes.len());
    let mut network_ids: Vec<String> = Vec::new();
    for node in nodes {
        host_ids.push(node.host_id.clone());
        if !node.network_id.is_empty() && !network_ids.contains(&node.network_id) {
            network_ids.push(node.network_id.clone());
        }
    }
    let project_id = nodes
        .first()
        .map(|n| n.project_id.clone())
        .unwrap_or_default();
    (host_ids, network_ids, project_id)
}

/// Node names for log lines.
pub fn node_names(nodes: &[NodeInfo]) -> Vec<&str> {
    nodes.iter().map(|n| n.name.as_str()).collect()
}
