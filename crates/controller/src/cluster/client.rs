//! `kube`-backed implementation of [`ClusterApi`].

use super::kinds::{self, KindInfo};
use super::{ClusterApi, ClusterError, DeleteOptions};
use crate::patterns::Propagation;
use crate::resource::ResourceKey;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::debug;

/// Cluster access through the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster or kubeconfig defaults.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn kind_info(kind: &str) -> Result<&'static KindInfo, ClusterError> {
        kinds::lookup(kind).ok_or_else(|| ClusterError::UnknownKind(kind.to_string()))
    }

    fn api(&self, info: &KindInfo, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = info.api_resource();
        match namespace {
            Some(ns) if info.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn delete_params(options: &DeleteOptions) -> DeleteParams {
    let propagation = match options.propagation {
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Orphan => PropagationPolicy::Orphan,
    };
    DeleteParams {
        grace_period_seconds: Some(u32::try_from(options.grace_period.as_secs()).unwrap_or(u32::MAX)),
        propagation_policy: Some(propagation),
        ..DeleteParams::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError> {
        let info = Self::kind_info(&key.kind)?;
        let api = self.api(info, key.namespace());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let info = Self::kind_info(kind)?;
        let api = self.api(info, namespace);
        let list = api.list(&ListParams::default()).await?;

        // DynamicObject lists come back without per-item type metadata
        let types = kube::core::TypeMeta {
            api_version: info.api_version(),
            kind: info.kind.to_string(),
        };
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                if obj.types.is_none() {
                    obj.types = Some(types.clone());
                }
                obj
            })
            .collect())
    }

    async fn delete(&self, key: &ResourceKey, options: &DeleteOptions) -> Result<bool, ClusterError> {
        let info = Self::kind_info(&key.kind)?;
        let api = self.api(info, key.namespace());
        match api.delete(&key.name, &delete_params(options)).await {
            Ok(_) => {
                debug!(resource = %key, "Delete accepted by API server");
                Ok(true)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let key = ResourceKey::from_object(object)
            .ok_or_else(|| ClusterError::InvalidObject("object has no kind or name".to_string()))?;
        let info = Self::kind_info(&key.kind)?;
        let api = self.api(info, key.namespace());
        Ok(api.create(&PostParams::default(), object).await?)
    }
}
