//! Error types for the CloudStack cloud controller manager

use std::fmt;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, CloudError>;

/// Errors that can occur while reconciling load balancers
#[derive(Debug)]
pub enum CloudError {
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error
    Configuration(String),
    /// CloudStack API error
    CloudStackApi(String),
    /// Load balancer state error
    LoadBalancer(String),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// No nodes match the service's pool selection
    NoNodesAvailable(String),
}

impl CloudError {
    /// Whether this error is the enqueue-time "no matching nodes" rejection.
    pub fn is_no_nodes(&self) -> bool {
        matches!(self, CloudError::NoNodesAvailable(_))
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            CloudError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            CloudError::CloudStackApi(msg) => write!(f, "CloudStack API error: {}", msg),
            CloudError::LoadBalancer(msg) => write!(f, "Load balancer error: {}", msg),
            CloudError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CloudError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            CloudError::NoNodesAvailable(svc) => {
                write!(f, "No nodes available for service: {}", svc)
            }
        }
    }
}

impl std::error::Error for CloudError {}

impl From<kube::Error> for CloudError {
    fn from(err: kube::Error) -> Self {
        CloudError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CloudError {
    fn from(err: toml::de::Error) -> Self {
        CloudError::Configuration(err.to_string())
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        CloudError::CloudStackApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CloudError::CloudStackApi("test error".to_string());
        assert!(err.to_string().contains("CloudStack API error"));
    }

    #[test]
    fn test_is_no_nodes() {
        assert!(CloudError::NoNodesAvailable("ns/svc".to_string()).is_no_nodes());
        assert!(!CloudError::KubeApi("api".to_string()).is_no_nodes());
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            CloudError::KubeApi("api".to_string()),
            CloudError::Configuration("config".to_string()),
            CloudError::CloudStackApi("cs".to_string()),
            CloudError::LoadBalancer("lb".to_string()),
            CloudError::Serialization("serde".to_string()),
            CloudError::NotFound("resource".to_string()),
            CloudError::NoNodesAvailable("ns/svc".to_string()),
        ];

        for err in errors {
            // Ensure Display is implemented
            let _ = format!("{}", err);
        }
    }
}
