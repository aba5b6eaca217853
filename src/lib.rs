//! CloudStack cloud controller manager
//!
//! Integrates a Kubernetes cluster with CloudStack to keep provider-side
//! load balancers in sync with `Service` objects of type `LoadBalancer`.
//!
//! At the center is a reconcile engine: Service and Node events feed a
//! keyed, coalescing work queue; a fixed pool of workers pops the entry
//! whose backing nodes changed most recently, serializes on a
//! per-service lock, and drives the CloudStack adapter. Failures emit
//! Warning events on the Service and retry with backoff.
//!
//! ## Example
//!
//! ```bash
//! # Run against the current kubeconfig
//! cloudstack-ccm --cloud-config /etc/kubernetes/cloudstack.toml
//!
//! # With debug logging
//! RUST_LOG=debug cloudstack-ccm --cloud-config ./cloudstack.toml
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod instances;
pub mod leader_election;
pub mod load_balancer;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod service_lock;
pub mod watch;

pub use config::{CloudConfig, GlobalConfig};
pub use engine::{EngineSettings, UpdateEngine};
pub use error::{CloudError, Result};
pub use load_balancer::{CloudStackAdapter, LoadBalancer, LoadBalancerAdapter, ManageOutcome};
pub use queue::{QueueEntry, ReconcileQueue};
pub use registry::{NodeInfo, NodeRegistry, ServiceKey};
