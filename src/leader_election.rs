//! Lease-based leader election
//!
//! Two controller replicas mutating the same provider-side load balancer
//! would defeat the per-service serialization, so only the holder of the
//! `cloudstack-ccm-leader` Lease runs the engine. Standby replicas block
//! in [`LeaderElector::acquire`] until the current holder's lease
//! expires.

use crate::error::{CloudError, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "cloudstack-ccm-leader";
const LEASE_DURATION_SECS: i32 = 30;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Namespace for the election Lease: explicit flag, then the mounted
/// service account namespace, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

enum Claim {
    Acquired,
    HeldByOther,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("ccm-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "initialized leader elector");
        Self {
            lease_api,
            identity,
        }
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, "waiting to acquire lease {:?}", LEASE_NAME);
        loop {
            match self.claim().await {
                Ok(Claim::Acquired) => {
                    info!(identity = %self.identity, "acquired leader lease");
                    return Ok(());
                }
                Ok(Claim::HeldByOther) => {
                    debug!("lease held elsewhere, retrying in {:?}", RETRY_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "lease claim failed, retrying in {:?}", RETRY_INTERVAL);
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Refresh the lease. `Ok(false)` means leadership was lost.
    pub async fn renew(&self) -> Result<bool> {
        match self.claim().await? {
            Claim::Acquired => Ok(true),
            Claim::HeldByOther => Ok(false),
        }
    }

    /// Clear the holder so a standby can take over immediately.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "unable to read lease for release");
                return;
            }
        };
        if holder_of(&lease) != Some(self.identity.as_str()) {
            return;
        }

        let mut updated = lease.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("released leader lease"),
            Err(e) => warn!(error = %e, "unable to release leader lease"),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    /// One claim attempt: create the lease if absent, renew if ours, take
    /// over if expired. A 409 anywhere means another replica won the
    /// race.
    async fn claim(&self) -> Result<Claim> {
        let now = MicroTime(Utc::now());
        let existing = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.lease_spec(&now, None, 0)),
                };
                return match self.lease_api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(Claim::Acquired),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Claim::HeldByOther),
                    Err(e) => Err(CloudError::from(e)),
                };
            }
            Err(e) => return Err(CloudError::from(e)),
        };

        let ours = holder_of(&existing) == Some(self.identity.as_str());
        if !ours && !is_expired(existing.spec.as_ref()) {
            return Ok(Claim::HeldByOther);
        }

        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
        let mut updated = existing.clone();
        updated.spec = Some(self.lease_spec(
            &now,
            if ours {
                prev.and_then(|s| s.acquire_time.clone())
            } else {
                Some(now.clone())
            },
            if ours { transitions } else { transitions + 1 },
        ));

        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(Claim::Acquired),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Claim::HeldByOther),
            Err(e) => Err(CloudError::from(e)),
        }
    }

    fn lease_spec(
        &self,
        now: &MicroTime,
        acquire_time: Option<MicroTime>,
        transitions: i32,
    ) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: acquire_time.or_else(|| Some(now.clone())),
            renew_time: Some(now.clone()),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_namespace_explicit() {
        assert_eq!(detect_namespace("kube-system"), "kube-system");
    }

    #[test]
    fn test_expired_without_renew_time() {
        assert!(is_expired(None));
        assert!(is_expired(Some(&LeaseSpec::default())));
    }

    #[test]
    fn test_fresh_renew_time_is_not_expired() {
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now())),
            lease_duration_seconds: Some(30),
            ..Default::default()
        };
        assert!(!is_expired(Some(&spec)));
    }

    #[test]
    fn test_stale_renew_time_is_expired() {
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(120))),
            lease_duration_seconds: Some(30),
            ..Default::default()
        };
        assert!(is_expired(Some(&spec)));
    }
}
