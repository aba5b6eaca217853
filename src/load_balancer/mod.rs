//! Load balancer views and the adapter seam
//!
//! The reconcile engine treats the provider as an opaque collaborator
//! behind [`LoadBalancerAdapter`]: fetch the LB view, decide whether we
//! manage it, sync backend membership, optionally update the pool. The
//! view types normalize CloudStack's habit of returning numeric fields as
//! strings in some codepaths (ports, job status) at the deserialization
//! boundary so the engine only ever sees typed values.

mod cloudstack;

pub use cloudstack::{CloudStackAdapter, CloudStackClient};

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Deserializer};

/// Tag key marking an LB rule as managed by a controller
pub const MANAGED_TAG_KEY: &str = "cloudprovider";
/// Tag value claiming a rule for this controller
pub const MANAGED_TAG_VALUE: &str = "cloudstack-ccm";

/// A provider-side tag attached to an LB rule.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Tag {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// A CloudStack load balancer rule, as returned by
/// `listLoadBalancerRules`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "publicip")]
    pub public_ip: String,
    #[serde(default)]
    pub algorithm: String,
    #[serde(default, rename = "publicport", deserialize_with = "port_value")]
    pub public_port: u16,
    #[serde(default, rename = "privateport", deserialize_with = "port_value")]
    pub private_port: u16,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl LoadBalancerRule {
    /// Value of a tag by key, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// The engine's view of a service's load balancer. `rule` is absent when
/// no LB rule exists yet, which the engine treats as "nothing to sync".
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    /// Derived rule name (`<service>-<namespace>.<lb-domain>`)
    pub name: String,
    /// CloudStack environment the rule lives in
    pub environment: String,
    pub project_id: String,
    pub network_ids: Vec<String>,
    pub rule: Option<LoadBalancerRule>,
}

/// Outcome of the ownership check before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageOutcome {
    /// The rule is ours; reconciliation may proceed
    Manage,
    /// Owned by another controller or otherwise ineligible; end the
    /// reconciliation successfully without mutating
    Skip(String),
}

/// Provider operations consumed by the reconcile engine, in the order it
/// commits to calling them: `get_load_balancer`, then `should_manage`,
/// and only on [`ManageOutcome::Manage`] the mutating `sync_nodes` and
/// (when flagged) `update_pool`. The mutating operations are idempotent
/// and tolerate replay after partial failure.
#[async_trait]
pub trait LoadBalancerAdapter: Send + Sync {
    /// Fetch (or construct) the LB view for a service.
    async fn get_load_balancer(
        &self,
        service: &Service,
        project_id: &str,
        network_ids: &[String],
    ) -> Result<LoadBalancer>;

    /// Whether this controller owns the LB rule.
    fn should_manage(&self, lb: &LoadBalancer) -> ManageOutcome {
        should_manage_lb(lb)
    }

    /// Reconcile the rule's backend host set to exactly `host_ids` over
    /// the given networks.
    async fn sync_nodes(
        &self,
        lb: &LoadBalancer,
        host_ids: &[String],
        network_ids: &[String],
    ) -> Result<()>;

    /// Refresh the rule's pool settings.
    async fn update_pool(&self, lb: &LoadBalancer) -> Result<()>;
}

/// Derive the provider-side rule name for a service.
pub fn lb_name_for_service(service: &Service, lb_domain: &str) -> String {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
    if lb_domain.is_empty() {
        format!("{}-{}", name, namespace).to_lowercase()
    } else {
        format!("{}-{}.{}", name, namespace, lb_domain).to_lowercase()
    }
}

/// Tag-based ownership check: a rule is ours only when tagged
/// `cloudprovider = cloudstack-ccm`. Untagged rules were created by hand
/// or by another controller and are left alone.
pub fn should_manage_lb(lb: &LoadBalancer) -> ManageOutcome {
    let rule = match &lb.rule {
        Some(rule) => rule,
        None => return ManageOutcome::Skip("load balancer has no rule".to_string()),
    };
    match rule.tag(MANAGED_TAG_KEY) {
        Some(MANAGED_TAG_VALUE) => ManageOutcome::Manage,
        Some(other) => ManageOutcome::Skip(format!(
            "rule {} is managed by {:?}",
            rule.name, other
        )),
        None => ManageOutcome::Skip(format!("rule {} carries no controller tag", rule.name)),
    }
}

/// Deserialize a port that the provider may encode as a number or a
/// string.
fn port_value<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Str(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Num(n) => Ok(n),
        Port::Str(s) => s.parse::<u16>().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule_from(value: serde_json::Value) -> LoadBalancerRule {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_port_accepts_number_and_string() {
        let rule = rule_from(json!({
            "id": "lb-1",
            "publicport": 80,
            "privateport": "8080"
        }));
        assert_eq!(rule.public_port, 80);
        assert_eq!(rule.private_port, 8080);
    }

    #[test]
    fn test_port_rejects_garbage_string() {
        let result: std::result::Result<LoadBalancerRule, _> =
            serde_json::from_value(json!({"id": "lb-1", "publicport": "eighty"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_lb_name_for_service() {
        let service: Service = serde_json::from_value(json!({
            "metadata": {"name": "Web", "namespace": "prod"}
        }))
        .unwrap();
        assert_eq!(
            lb_name_for_service(&service, "cs-router.com"),
            "web-prod.cs-router.com"
        );
        assert_eq!(lb_name_for_service(&service, ""), "web-prod");
    }

    #[test]
    fn test_should_manage_ours() {
        let lb = LoadBalancer {
            name: "web-prod.cs-router.com".to_string(),
            environment: "prod".to_string(),
            project_id: "p1".to_string(),
            network_ids: vec![],
            rule: Some(rule_from(json!({
                "id": "lb-1",
                "name": "web-prod.cs-router.com",
                "tags": [{"key": "cloudprovider", "value": "cloudstack-ccm"}]
            }))),
        };
        assert_eq!(should_manage_lb(&lb), ManageOutcome::Manage);
    }

    #[test]
    fn test_should_skip_foreign_and_untagged() {
        let mut lb = LoadBalancer {
            name: "web-prod".to_string(),
            environment: "prod".to_string(),
            project_id: "p1".to_string(),
            network_ids: vec![],
            rule: Some(rule_from(json!({
                "id": "lb-1",
                "name": "web-prod",
                "tags": [{"key": "cloudprovider", "value": "someone-else"}]
            }))),
        };
        assert!(matches!(should_manage_lb(&lb), ManageOutcome::Skip(_)));

        lb.rule = Some(rule_from(json!({"id": "lb-1", "name": "web-prod"})));
        assert!(matches!(should_manage_lb(&lb), ManageOutcome::Skip(_)));

        lb.rule = None;
        assert!(matches!(should_manage_lb(&lb), ManageOutcome::Skip(_)));
    }

    #[test]
    fn test_rule_tag_lookup() {
        let rule = rule_from(json!({
            "id": "lb-1",
            "tags": [{"key": "a", "value": "1"}, {"key": "b", "value": "2"}]
        }));
        assert_eq!(rule.tag("b"), Some("2"));
        assert_eq!(rule.tag("c"), None);
    }
}
