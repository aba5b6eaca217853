//! CloudStack-backed load balancer adapter
//!
//! A compact, hand-written client for the handful of CloudStack API
//! commands the adapter issues: keyed HMAC-SHA1 query signing, JSON
//! responses, and async-job polling. Mutations go through async jobs;
//! `sync_nodes` diffs the rule's current backend set against the desired
//! one so replays after partial failure converge instead of erroring.

use super::{lb_name_for_service, LoadBalancer, LoadBalancerAdapter, LoadBalancerRule};
use crate::config::{CloudConfig, CustomCommandConfig, EnvironmentConfig};
use crate::error::{CloudError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use k8s_openapi::api::core::v1::Service;
use serde::Deserialize;
use sha1::Sha1;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Service annotation naming the CloudStack environment its LB lives in.
/// Optional when only one environment is configured.
pub const LB_ENVIRONMENT_ANNOTATION: &str = "csccm.cloudprovider/lb-environment";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const ASYNC_JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ASYNC_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Signed HTTP client for one CloudStack environment.
pub struct CloudStackClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    secret_key: String,
}

impl CloudStackClient {
    pub fn new(env: &EnvironmentConfig) -> Result<Self> {
        if env.api_url.is_empty() {
            return Err(CloudError::Configuration(
                "environment has no api-url".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(env.ssl_no_verify)
            .build()?;
        Ok(Self {
            http,
            api_url: env.api_url.clone(),
            api_key: env.api_key.clone(),
            secret_key: env.secret_key.clone(),
        })
    }

    /// Issue a command and return the unwrapped `<command>response` body.
    pub async fn call(
        &self,
        command: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let url = self.signed_url(command, params)?;
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            CloudError::CloudStackApi(format!("{}: invalid response body: {}", command, e))
        })?;

        let payload = unwrap_response(command, &body);
        if let Some(text) = error_text(&payload) {
            return Err(CloudError::CloudStackApi(format!("{}: {}", command, text)));
        }
        if !status.is_success() {
            return Err(CloudError::CloudStackApi(format!(
                "{}: unexpected HTTP status {}",
                command, status
            )));
        }
        Ok(payload)
    }

    /// Issue a command that spawns an async job and wait for the job to
    /// finish.
    pub async fn call_job(&self, command: &str, params: &[(&str, String)]) -> Result<()> {
        let payload = self.call(command, params).await?;
        match payload.get("jobid").and_then(string_value) {
            Some(jobid) => self.wait_for_job(command, &jobid).await,
            None => Ok(()),
        }
    }

    async fn wait_for_job(&self, command: &str, jobid: &str) -> Result<()> {
        let deadline = Instant::now() + ASYNC_JOB_TIMEOUT;
        loop {
            let result = self
                .call("queryAsyncJobResult", &[("jobid", jobid.to_string())])
                .await?;
            match int_value(result.get("jobstatus")) {
                Some(0) => {
                    if Instant::now() >= deadline {
                        return Err(CloudError::CloudStackApi(format!(
                            "{}: async job {} still pending after {:?}",
                            command, jobid, ASYNC_JOB_TIMEOUT
                        )));
                    }
                    tokio::time::sleep(ASYNC_JOB_POLL_INTERVAL).await;
                }
                Some(1) => return Ok(()),
                _ => {
                    let text = result
                        .get("jobresult")
                        .and_then(|r| error_text(r))
                        .unwrap_or_else(|| "unknown job failure".to_string());
                    return Err(CloudError::CloudStackApi(format!(
                        "{}: async job {} failed: {}",
                        command, jobid, text
                    )));
                }
            }
        }
    }

    fn signed_url(&self, command: &str, params: &[(&str, String)]) -> Result<String> {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        pairs.push(("command".to_string(), command.to_string()));
        pairs.push(("apiKey".to_string(), self.api_key.clone()));
        pairs.push(("response".to_string(), "json".to_string()));
        pairs.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

        let query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        // CloudStack signs the lowercased query string.
        let signature = self.sign(&query.to_lowercase())?;
        Ok(format!(
            "{}?{}&signature={}",
            self.api_url,
            query,
            urlencoding::encode(&signature)
        ))
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| CloudError::Configuration(format!("invalid secret key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// Pull the `<command>response` object out of a CloudStack envelope,
/// falling back to the generic `errorresponse` or the raw body.
fn unwrap_response(command: &str, body: &serde_json::Value) -> serde_json::Value {
    let key = format!("{}response", command.to_lowercase());
    if let Some(payload) = body.get(&key) {
        return payload.clone();
    }
    if let Some(payload) = body.get("errorresponse") {
        return payload.clone();
    }
    body.clone()
}

fn error_text(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("errortext")
        .and_then(string_value)
        .map(|text| match int_value(payload.get("errorcode")) {
            Some(code) => format!("{} (error {})", text, code),
            None => text,
        })
}

/// CloudStack encodes some numbers as strings depending on the codepath.
fn int_value(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn string_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Hosts to assign and remove to turn `current` into `desired`.
fn diff_hosts(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let to_assign = desired
        .iter()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect();
    let to_remove = current
        .iter()
        .filter(|id| !desired.contains(id))
        .cloned()
        .collect();
    (to_assign, to_remove)
}

#[derive(Deserialize)]
struct ListLoadBalancerRulesResponse {
    #[serde(default, rename = "loadbalancerrule")]
    rules: Vec<LoadBalancerRule>,
}

#[derive(Deserialize)]
struct ListRuleInstancesResponse {
    #[serde(default, rename = "loadbalancerruleinstance")]
    instances: Vec<RuleInstance>,
}

#[derive(Deserialize)]
struct RuleInstance {
    id: String,
}

struct EnvHandle {
    client: CloudStackClient,
    config: EnvironmentConfig,
}

/// Production [`LoadBalancerAdapter`] over per-environment signed
/// clients.
pub struct CloudStackAdapter {
    environments: HashMap<String, EnvHandle>,
    commands: CustomCommandConfig,
}

impl CloudStackAdapter {
    pub fn from_config(cfg: &CloudConfig) -> Result<Self> {
        let mut environments = HashMap::new();
        for (name, env) in &cfg.environment {
            environments.insert(
                name.clone(),
                EnvHandle {
                    client: CloudStackClient::new(env)?,
                    config: env.clone(),
                },
            );
        }
        Ok(Self {
            environments,
            commands: cfg.command.clone(),
        })
    }

    /// Resolve which environment a service's LB lives in: the
    /// `csccm.cloudprovider/lb-environment` annotation when present,
    /// otherwise the sole configured environment.
    fn environment_for(&self, service: &Service) -> Result<(&str, &EnvHandle)> {
        let annotated = service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LB_ENVIRONMENT_ANNOTATION));

        if let Some(name) = annotated {
            return self
                .environments
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| {
                    CloudError::Configuration(format!("unknown lb environment {:?}", name))
                });
        }

        if self.environments.len() == 1 {
            if let Some((name, handle)) = self.environments.iter().next() {
                return Ok((name.as_str(), handle));
            }
        }

        Err(CloudError::Configuration(format!(
            "service has no {} annotation and {} environments are configured",
            LB_ENVIRONMENT_ANNOTATION,
            self.environments.len()
        )))
    }

    fn handle(&self, environment: &str) -> Result<&EnvHandle> {
        self.environments.get(environment).ok_or_else(|| {
            CloudError::Configuration(format!("unknown environment {:?}", environment))
        })
    }

    async fn current_backends(
        &self,
        client: &CloudStackClient,
        rule_id: &str,
    ) -> Result<Vec<String>> {
        let payload = client
            .call(
                "listLoadBalancerRuleInstances",
                &[("id", rule_id.to_string()), ("listall", "true".to_string())],
            )
            .await?;
        let parsed: ListRuleInstancesResponse = serde_json::from_value(payload)?;
        Ok(parsed.instances.into_iter().map(|i| i.id).collect())
    }
}

#[async_trait]
impl LoadBalancerAdapter for CloudStackAdapter {
    async fn get_load_balancer(
        &self,
        service: &Service,
        project_id: &str,
        network_ids: &[String],
    ) -> Result<LoadBalancer> {
        let (env_name, handle) = self.environment_for(service)?;
        let name = lb_name_for_service(service, &handle.config.lb_domain);

        let mut params = vec![
            ("keyword", name.clone()),
            ("listall", "true".to_string()),
        ];
        if !project_id.is_empty() {
            params.push(("projectid", project_id.to_string()));
        }

        let payload = handle.client.call("listLoadBalancerRules", &params).await?;
        let parsed: ListLoadBalancerRulesResponse = serde_json::from_value(payload)?;
        let rule = parsed.rules.into_iter().find(|r| r.name == name);

        debug!(
            lb = %name,
            environment = env_name,
            rule_found = rule.is_some(),
            "fetched load balancer"
        );

        Ok(LoadBalancer {
            name,
            environment: env_name.to_string(),
            project_id: project_id.to_string(),
            network_ids: network_ids.to_vec(),
            rule,
        })
    }

    async fn sync_nodes(
        &self,
        lb: &LoadBalancer,
        host_ids: &[String],
        network_ids: &[String],
    ) -> Result<()> {
        let rule = match &lb.rule {
            Some(rule) => rule,
            None => return Ok(()),
        };
        let handle = self.handle(&lb.environment)?;

        let current = self.current_backends(&handle.client, &rule.id).await?;
        let (to_assign, to_remove) = diff_hosts(&current, host_ids);

        if to_assign.is_empty() && to_remove.is_empty() {
            debug!(lb = %lb.name, "backend set already converged");
        }

        if !to_assign.is_empty() {
            handle
                .client
                .call_job(
                    "assignToLoadBalancerRule",
                    &[
                        ("id", rule.id.clone()),
                        ("virtualmachineids", to_assign.join(",")),
                    ],
                )
                .await?;
        }

        if !to_remove.is_empty() {
            handle
                .client
                .call_job(
                    "removeFromLoadBalancerRule",
                    &[
                        ("id", rule.id.clone()),
                        ("virtualmachineids", to_remove.join(",")),
                    ],
                )
                .await?;
        }

        // Installations that route pools across networks expose a custom
        // command for re-binding the rule's networks.
        if !self.commands.assign_networks.is_empty() && !network_ids.is_empty() {
            handle
                .client
                .call_job(
                    &self.commands.assign_networks,
                    &[
                        ("lbruleid", rule.id.clone()),
                        ("networkids", network_ids.join(",")),
                    ],
                )
                .await?;
        }

        Ok(())
    }

    async fn update_pool(&self, lb: &LoadBalancer) -> Result<()> {
        let rule = match &lb.rule {
            Some(rule) => rule,
            None => return Ok(()),
        };
        let handle = self.handle(&lb.environment)?;

        let mut params = vec![("id", rule.id.clone())];
        if !rule.algorithm.is_empty() {
            params.push(("algorithm", rule.algorithm.clone()));
        }
        handle.client.call_job("updateLoadBalancerRule", &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::read_config;
    use serde_json::json;

    fn client() -> CloudStackClient {
        CloudStackClient::new(&EnvironmentConfig {
            api_url: "https://cloudstack.test/client/api".to_string(),
            api_key: "test-api-key".to_string(),
            secret_key: "test-secret-key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_signed_url_sorts_params_and_appends_signature() {
        let url = client()
            .signed_url(
                "listLoadBalancerRules",
                &[("keyword", "web-prod".to_string()), ("listall", "true".to_string())],
            )
            .unwrap();

        let query = url.split('?').nth(1).unwrap();
        let keys: Vec<&str> = query
            .split('&')
            .map(|pair| pair.split('=').next().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec!["apiKey", "command", "keyword", "listall", "response", "signature"]
        );
    }

    #[test]
    fn test_signature_is_deterministic_and_keyed() {
        let a = client();
        let params = [("keyword", "web-prod".to_string())];
        let first = a.signed_url("listLoadBalancerRules", &params).unwrap();
        let second = a.signed_url("listLoadBalancerRules", &params).unwrap();
        assert_eq!(first, second);

        let other = CloudStackClient::new(&EnvironmentConfig {
            api_url: "https://cloudstack.test/client/api".to_string(),
            api_key: "test-api-key".to_string(),
            secret_key: "another-secret".to_string(),
            ..Default::default()
        })
        .unwrap();
        let third = other.signed_url("listLoadBalancerRules", &params).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_unwrap_response_and_errors() {
        let body = json!({
            "listloadbalancerrulesresponse": {"count": 1, "loadbalancerrule": []}
        });
        let payload = unwrap_response("listLoadBalancerRules", &body);
        assert_eq!(payload["count"], 1);

        let err_body = json!({
            "errorresponse": {"errorcode": 431, "errortext": "Unable to find rule"}
        });
        let payload = unwrap_response("assignToLoadBalancerRule", &err_body);
        let text = error_text(&payload).unwrap();
        assert!(text.contains("Unable to find rule"));
        assert!(text.contains("431"));
    }

    #[test]
    fn test_int_value_handles_stringly_numbers() {
        assert_eq!(int_value(Some(&json!(1))), Some(1));
        assert_eq!(int_value(Some(&json!("2"))), Some(2));
        assert_eq!(int_value(Some(&json!("nope"))), None);
        assert_eq!(int_value(None), None);
    }

    #[test]
    fn test_diff_hosts() {
        let current = vec!["a".to_string(), "b".to_string()];
        let desired = vec!["b".to_string(), "c".to_string()];
        let (assign, remove) = diff_hosts(&current, &desired);
        assert_eq!(assign, vec!["c"]);
        assert_eq!(remove, vec!["a"]);

        let (assign, remove) = diff_hosts(&desired, &desired);
        assert!(assign.is_empty());
        assert!(remove.is_empty());
    }

    fn adapter(config: &str) -> CloudStackAdapter {
        CloudStackAdapter::from_config(&read_config(Some(config)).unwrap()).unwrap()
    }

    fn service(annotations: serde_json::Value) -> Service {
        serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "prod", "annotations": annotations}
        }))
        .unwrap()
    }

    #[test]
    fn test_environment_for_sole_environment() {
        let adapter = adapter(
            r#"
[environment.prod]
api-url = "https://cloudstack.prod.url"
"#,
        );
        let (name, _) = adapter.environment_for(&service(json!({}))).unwrap();
        assert_eq!(name, "prod");
    }

    #[test]
    fn test_environment_for_annotation() {
        let adapter = adapter(
            r#"
[environment.prod]
api-url = "https://cloudstack.prod.url"

[environment.dev]
api-url = "https://cloudstack.dev.url"
"#,
        );

        let (name, _) = adapter
            .environment_for(&service(
                json!({"csccm.cloudprovider/lb-environment": "dev"}),
            ))
            .unwrap();
        assert_eq!(name, "dev");

        // Ambiguous without the annotation
        assert!(adapter.environment_for(&service(json!({}))).is_err());

        // Unknown environment name
        assert!(adapter
            .environment_for(&service(
                json!({"csccm.cloudprovider/lb-environment": "qa"}),
            ))
            .is_err());
    }

    #[test]
    fn test_rules_response_parses_stringly_ports() {
        let parsed: ListLoadBalancerRulesResponse = serde_json::from_value(json!({
            "count": 1,
            "loadbalancerrule": [{
                "id": "rule-1",
                "name": "web-prod.cs-router.com",
                "publicip": "10.0.0.9",
                "publicport": "80",
                "privateport": 30080,
                "algorithm": "roundrobin",
                "tags": [{"key": "cloudprovider", "value": "cloudstack-ccm"}]
            }]
        }))
        .unwrap();
        assert_eq!(parsed.rules[0].public_port, 80);
        assert_eq!(parsed.rules[0].private_port, 30080);
    }
}
