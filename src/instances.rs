//! Node metadata derivation
//!
//! Turns Kubernetes `Node` objects into the engine's [`NodeInfo`] view.
//! All provider-facing attributes come from labels, with annotation
//! fallback, so the same key works whichever place a provisioner wrote it.

use crate::config::GlobalConfig;
use crate::error::{CloudError, Result};
use crate::registry::NodeInfo;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Scheme prefix on `spec.providerID` for CloudStack-managed nodes
const PROVIDER_ID_PREFIX: &str = "cloudstack://";

/// Look up a key in the object's labels, falling back to annotations.
/// An empty key name never matches.
pub fn get_label_or_annotation(meta: &ObjectMeta, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if let Some(value) = meta.labels.as_ref().and_then(|labels| labels.get(name)) {
        return Some(value.clone());
    }
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(name))
        .cloned()
}

/// Derive a [`NodeInfo`] from a Kubernetes node. The project id is
/// mandatory; everything else degrades to sensible defaults. The revision
/// is left at zero, the registry stamps it on observe.
pub fn node_info_from_kube(node: &Node, cfg: &GlobalConfig) -> Result<NodeInfo> {
    let kube_name = node.metadata.name.clone().unwrap_or_default();
    let name = get_label_or_annotation(&node.metadata, &cfg.node_name_label)
        .unwrap_or_else(|| kube_name.clone());

    let project_id = get_label_or_annotation(&node.metadata, &cfg.project_id_label)
        .ok_or_else(|| {
            CloudError::Configuration(format!(
                "failed to retrieve project id from node {:?}",
                kube_name
            ))
        })?;

    let environment =
        get_label_or_annotation(&node.metadata, &cfg.environment_label).unwrap_or_default();
    let pool = get_label_or_annotation(&node.metadata, &cfg.node_filter_label).unwrap_or_default();
    let network_id =
        get_label_or_annotation(&node.metadata, cfg.network_id_key()).unwrap_or_default();

    Ok(NodeInfo {
        host_id: host_id_for(node, &name),
        name,
        environment,
        project_id,
        pool,
        network_id,
        revision: 0,
    })
}

/// The provider-side VM id: `spec.providerID` with the scheme stripped,
/// or the (possibly label-overridden) node name when unset.
fn host_id_for(node: &Node, fallback: &str) -> String {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_ref())
        .map(|id| id.strip_prefix(PROVIDER_ID_PREFIX).unwrap_or(id).to_string())
        .unwrap_or_else(|| fallback.to_string())
}
