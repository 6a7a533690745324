//! # Cluster Access
//!
//! The executor, graph builder and resync scan only talk to the cluster
//! through [`ClusterApi`]. Two implementations exist:
//!
//! - [`KubeCluster`]: `kube` client over `DynamicObject` with a static kind table
//! - [`InMemoryCluster`]: object map used by `dry-run` and the test suites
//!
//! Write access is limited to the kinds in [`kinds::KNOWN_KINDS`].

pub mod client;
pub mod health;
pub mod kinds;
pub mod memory;

use crate::patterns::Propagation;
use crate::resource::ResourceKey;
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::time::Duration;
use thiserror::Error;

pub use client::KubeCluster;
pub use health::{assess, Health};
pub use memory::{ClusterOp, InMemoryCluster};

/// Errors from cluster operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("cluster unreachable: {0}")]
    Connectivity(String),

    #[error("kind '{0}' is not managed by the recovery controller")]
    UnknownKind(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ClusterError::Connectivity(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Api { code: 404, .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Api { code: 409, .. })
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => ClusterError::Api {
                code: response.code,
                message: response.message,
            },
            kube::Error::InferConfig(e) => ClusterError::Connectivity(e.to_string()),
            kube::Error::HyperError(e) => ClusterError::Connectivity(e.to_string()),
            kube::Error::Service(e) => ClusterError::Connectivity(e.to_string()),
            other => ClusterError::Other(other.to_string()),
        }
    }
}

/// Options for a graceful delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub grace_period: Duration,
    pub propagation: Propagation,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            propagation: Propagation::Background,
        }
    }
}

/// Least-privilege view of the cluster used by the recovery engine
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError>;

    /// List objects of a kind, cluster-wide when `namespace` is `None`.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Request deletion. Returns `false` if the object was already gone.
    async fn delete(&self, key: &ResourceKey, options: &DeleteOptions) -> Result<bool, ClusterError>;

    /// Create an object from a full manifest.
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(ClusterError::Connectivity("refused".to_string()).is_connectivity());
        assert!(ClusterError::Api {
            code: 404,
            message: "not found".to_string()
        }
        .is_not_found());
        assert!(ClusterError::Api {
            code: 409,
            message: "exists".to_string()
        }
        .is_conflict());
        assert!(!ClusterError::UnknownKind("Widget".to_string()).is_not_found());
    }
}
