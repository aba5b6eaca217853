//! Kubernetes event emission
//!
//! Reconciliation failures surface to users as Warning events on the
//! affected Service. The sink is a trait so the engine can run against a
//! no-op (or recording) implementation in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Event reason attached to failed load balancer updates
pub const REASON_UPDATE_LB_FAILED: &str = "UpdateLoadBalancerFailed";

const REPORTING_CONTROLLER: &str = "cloudstack-ccm";

/// Emits user-visible events for a Service.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warning(&self, service: &Service, reason: &str, message: &str);
}

/// Publishes events through the Kubernetes events API.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warning(&self, service: &Service, reason: &str, message: &str) {
        let reference = service.object_ref(&());
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "UpdateLoadBalancer".to_string(),
            secondary: None,
        };
        // Event delivery is best-effort; a failed publish must not fail
        // the reconciliation that reported it.
        if let Err(e) = recorder.publish(event).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

/// Discards all events.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn warning(&self, _service: &Service, _reason: &str, _message: &str) {}
}
