//! Cluster client: a thin, retrying capability surface over the Kubernetes
//! object API
//!
//! Every reconciler and the lifecycle orchestrator talk to clusters through
//! [`ClusterClient`]. The trait keeps the surface mockable; the real
//! implementation wraps a [`kube::Client`], retries transient failures with
//! bounded backoff, and treats 404s as `None`. The client is safe for
//! concurrent use and holds no locks across API calls.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::api::{Api, DynamicObject, ListParams, ObjectList, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capi::{BmcMachine, CapiCluster, EtcdadmCluster, KubeadmControlPlane, Machine, MachineDeployment};
use crate::manifest;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::spec::Cluster;
use crate::{Error, Result};

/// Field manager for server-side applies
pub const FIELD_MANAGER: &str = "foundry";

/// Static description of a resource the client addresses dynamically
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceSpec {
    /// API group
    pub group: &'static str,
    /// API version
    pub version: &'static str,
    /// Kind
    pub kind: &'static str,
    /// Plural name
    pub plural: &'static str,
}

impl ResourceSpec {
    /// The kube ApiResource for this spec
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: if self.group.is_empty() {
                self.version.to_string()
            } else {
                format!("{}/{}", self.group, self.version)
            },
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

/// CAPI KubeadmControlPlane
pub const KUBEADM_CONTROL_PLANE: ResourceSpec = ResourceSpec {
    group: "controlplane.cluster.x-k8s.io",
    version: "v1beta1",
    kind: "KubeadmControlPlane",
    plural: "kubeadmcontrolplanes",
};

/// CAPI MachineDeployment
pub const MACHINE_DEPLOYMENT: ResourceSpec = ResourceSpec {
    group: "cluster.x-k8s.io",
    version: "v1beta1",
    kind: "MachineDeployment",
    plural: "machinedeployments",
};

/// CAPI Machine
pub const MACHINE: ResourceSpec = ResourceSpec {
    group: "cluster.x-k8s.io",
    version: "v1beta1",
    kind: "Machine",
    plural: "machines",
};

/// CAPI Cluster
pub const CAPI_CLUSTER: ResourceSpec = ResourceSpec {
    group: "cluster.x-k8s.io",
    version: "v1beta1",
    kind: "Cluster",
    plural: "clusters",
};

/// Etcdadm-managed external etcd cluster
pub const ETCDADM_CLUSTER: ResourceSpec = ResourceSpec {
    group: "etcdcluster.cluster.x-k8s.io",
    version: "v1beta1",
    kind: "EtcdadmCluster",
    plural: "etcdadmclusters",
};

/// Bare-metal hardware inventory record
pub const HARDWARE: ResourceSpec = ResourceSpec {
    group: "tinkerbell.org",
    version: "v1alpha1",
    kind: "Hardware",
    plural: "hardware",
};

/// BMC machine (out-of-band controller)
pub const BMC_MACHINE: ResourceSpec = ResourceSpec {
    group: "bmc.tinkerbell.org",
    version: "v1alpha1",
    kind: "Machine",
    plural: "machines",
};

/// A page of cluster objects plus the continue token for the next page
pub type ClusterPage = (Vec<Cluster>, Option<String>);

/// Capability surface over a cluster's object API
///
/// Multiple reconcilers may hold the same client concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server-side apply a YAML document stream with force ownership
    async fn apply(&self, bytes: &[u8]) -> Result<()>;

    /// Get a KubeadmControlPlane, None when absent
    async fn get_kubeadm_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KubeadmControlPlane>>;

    /// Get a MachineDeployment, None when absent
    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>>;

    /// List MachineDeployments belonging to a cluster
    async fn list_machine_deployments(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineDeployment>>;

    /// Delete a MachineDeployment
    async fn delete_machine_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// List Machines belonging to a cluster
    async fn list_machines(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>>;

    /// Get a CAPI Cluster, None when absent
    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>>;

    /// List CAPI Clusters in a namespace
    async fn list_capi_clusters(&self, namespace: &str) -> Result<Vec<CapiCluster>>;

    /// Get an EtcdadmCluster, None when absent
    async fn get_etcdadm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EtcdadmCluster>>;

    /// Delete a CAPI Cluster to trigger infrastructure teardown; absent is
    /// success
    async fn delete_capi_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge annotations onto an arbitrary resource
    async fn update_annotations(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Remove an annotation from an arbitrary resource
    async fn remove_annotation(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<()>;

    /// List raw objects of a resource type (backup, hardware ingestion)
    async fn list_raw(&self, resource: ResourceSpec, namespace: &str)
        -> Result<Vec<DynamicObject>>;

    /// List BMC machines in a namespace
    async fn list_bmc_machines(&self, namespace: &str) -> Result<Vec<BmcMachine>>;

    /// Fetch a workload cluster's kubeconfig bytes from its secret
    async fn get_kubeconfig(&self, namespace: &str, cluster_name: &str)
        -> Result<Option<Vec<u8>>>;

    /// Get a managed cluster object, None when absent
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Page through managed cluster objects
    async fn list_clusters(
        &self,
        namespace: &str,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<ClusterPage>;

    /// Merge annotations onto a managed cluster object
    async fn annotate_cluster(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Remove an annotation from a managed cluster object
    async fn remove_cluster_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<()>;

    /// Delete a managed cluster object; absent is success
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the first fatal error of a reconcile to the cluster status
    async fn set_failure_message(&self, namespace: &str, name: &str, message: &str) -> Result<()>;
}

/// Real client over a [`kube::Client`]
pub struct KubeClusterClient {
    client: Client,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl KubeClusterClient {
    /// Wrap a kube client with the default retry policy
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn dynamic_api(&self, resource: ResourceSpec, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &resource.api_resource())
    }

    async fn get_dynamic(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(resource, namespace);
        let name = name.to_string();
        retry_with_backoff(&self.retry, resource.kind, &self.cancel, || {
            let api = api.clone();
            let name = name.clone();
            async move {
                match api.get(&name).await {
                    Ok(obj) => Ok(Some(obj)),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
                    Err(e) => Err(Error::Kube(e)),
                }
            }
        })
        .await
    }

    async fn list_dynamic(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        params: ListParams,
    ) -> Result<ObjectList<DynamicObject>> {
        let api = self.dynamic_api(resource, namespace);
        retry_with_backoff(&self.retry, resource.kind, &self.cancel, || {
            let api = api.clone();
            let params = params.clone();
            async move { api.list(&params).await.map_err(Error::Kube) }
        })
        .await
    }

    fn resource_for_manifest(m: &manifest::Manifest) -> ApiResource {
        let (group, version) = match m.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), m.api_version.clone()),
        };
        ApiResource {
            group: group.clone(),
            version: version.clone(),
            api_version: m.api_version.clone(),
            kind: m.kind.clone(),
            plural: pluralize(&m.kind),
        }
    }
}

/// Naive kind pluralization, sufficient for the resource kinds we render
fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if lower.ends_with("hardware") {
        lower
    } else {
        format!("{lower}s")
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, bytes: &[u8]) -> Result<()> {
        let manifests = manifest::parse_yaml_stream(bytes)?;
        for m in &manifests {
            let ar = Self::resource_for_manifest(m);
            let namespace = m
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &ar);
            let value = serde_json::to_value(m).map_err(|e| Error::serialization(e.to_string()))?;
            let name = m.metadata.name.clone();

            debug!(kind = %m.kind, name = %name, namespace = %namespace, "applying manifest");
            retry_with_backoff(&self.retry, "apply", &self.cancel, || {
                let api = api.clone();
                let value = value.clone();
                let name = name.clone();
                async move {
                    api.patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(&value),
                    )
                    .await
                    .map_err(Error::Kube)?;
                    Ok(())
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn get_kubeadm_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KubeadmControlPlane>> {
        self.get_dynamic(KUBEADM_CONTROL_PLANE, namespace, name)
            .await?
            .map(|obj| KubeadmControlPlane::from_dynamic(&obj))
            .transpose()
    }

    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>> {
        self.get_dynamic(MACHINE_DEPLOYMENT, namespace, name)
            .await?
            .map(|obj| MachineDeployment::from_dynamic(&obj))
            .transpose()
    }

    async fn list_machine_deployments(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineDeployment>> {
        let params = ListParams::default()
            .labels(&format!("cluster.x-k8s.io/cluster-name={cluster_name}"));
        let list = self.list_dynamic(MACHINE_DEPLOYMENT, namespace, params).await?;
        list.items
            .iter()
            .map(MachineDeployment::from_dynamic)
            .collect()
    }

    async fn delete_machine_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.dynamic_api(MACHINE_DEPLOYMENT, namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn list_machines(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>> {
        let params = ListParams::default()
            .labels(&format!("cluster.x-k8s.io/cluster-name={cluster_name}"));
        let list = self.list_dynamic(MACHINE, namespace, params).await?;
        list.items.iter().map(Machine::from_dynamic).collect()
    }

    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>> {
        self.get_dynamic(CAPI_CLUSTER, namespace, name)
            .await?
            .map(|obj| CapiCluster::from_dynamic(&obj))
            .transpose()
    }

    async fn list_capi_clusters(&self, namespace: &str) -> Result<Vec<CapiCluster>> {
        let list = self
            .list_dynamic(CAPI_CLUSTER, namespace, ListParams::default())
            .await?;
        list.items.iter().map(CapiCluster::from_dynamic).collect()
    }

    async fn get_etcdadm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EtcdadmCluster>> {
        self.get_dynamic(ETCDADM_CLUSTER, namespace, name)
            .await?
            .map(|obj| EtcdadmCluster::from_dynamic(&obj))
            .transpose()
    }

    async fn delete_capi_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.dynamic_api(CAPI_CLUSTER, namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn update_annotations(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api = self.dynamic_api(resource, namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        retry_with_backoff(&self.retry, "updateAnnotations", &self.cancel, || {
            let api = api.clone();
            let patch = patch.clone();
            let name = name.to_string();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(Error::Kube)?;
                Ok(())
            }
        })
        .await
    }

    async fn remove_annotation(
        &self,
        resource: ResourceSpec,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<()> {
        let api = self.dynamic_api(resource, namespace);
        // Merge-patching a null value deletes the key.
        let patch = serde_json::json!({ "metadata": { "annotations": { key: null } } });
        retry_with_backoff(&self.retry, "removeAnnotation", &self.cancel, || {
            let api = api.clone();
            let patch = patch.clone();
            let name = name.to_string();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(Error::Kube)?;
                Ok(())
            }
        })
        .await
    }

    async fn list_raw(
        &self,
        resource: ResourceSpec,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        let list = self
            .list_dynamic(resource, namespace, ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_bmc_machines(&self, namespace: &str) -> Result<Vec<BmcMachine>> {
        let list = self
            .list_dynamic(BMC_MACHINE, namespace, ListParams::default())
            .await?;
        list.items.iter().map(BmcMachine::from_dynamic).collect()
    }

    async fn get_kubeconfig(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<Vec<u8>>> {
        use k8s_openapi::api::core::v1::Secret;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = format!("{cluster_name}-kubeconfig");
        let secret = retry_with_backoff(&self.retry, "getKubeconfig", &self.cancel, || {
            let api = api.clone();
            let name = name.clone();
            async move {
                match api.get(&name).await {
                    Ok(secret) => Ok(Some(secret)),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
                    Err(e) => Err(Error::Kube(e)),
                }
            }
        })
        .await?;

        let Some(secret) = secret else {
            return Ok(None);
        };

        // Secret data arrives base64-decoded through k8s-openapi's ByteString,
        // but stringData fallbacks show up base64-encoded in some dumps.
        if let Some(data) = secret.data.and_then(|mut d| d.remove("value")) {
            return Ok(Some(data.0));
        }
        if let Some(value) = secret.string_data.and_then(|mut d| d.remove("value")) {
            let decoded = BASE64
                .decode(value.as_bytes())
                .unwrap_or_else(|_| value.into_bytes());
            return Ok(Some(decoded));
        }
        Ok(None)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn list_clusters(
        &self,
        namespace: &str,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<ClusterPage> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            params = params.continue_token(&token);
        }
        let list = api.list(&params).await.map_err(Error::Kube)?;
        let next = list.metadata.continue_.clone().filter(|t| !t.is_empty());
        Ok((list.items, next))
    }

    async fn annotate_cluster(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }

    async fn remove_cluster_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": { key: null } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn set_failure_message(&self, namespace: &str, name: &str, message: &str) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": { "failureMessage": message } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_spec_api_resource() {
        let ar = KUBEADM_CONTROL_PLANE.api_resource();
        assert_eq!(ar.api_version, "controlplane.cluster.x-k8s.io/v1beta1");
        assert_eq!(ar.plural, "kubeadmcontrolplanes");

        let ar = HARDWARE.api_resource();
        assert_eq!(ar.plural, "hardware");
    }

    #[test]
    fn test_pluralize_common_kinds() {
        assert_eq!(pluralize("MachineDeployment"), "machinedeployments");
        assert_eq!(pluralize("KubeadmControlPlane"), "kubeadmcontrolplanes");
        assert_eq!(pluralize("Cluster"), "clusters");
        assert_eq!(pluralize("Hardware"), "hardware");
    }

    #[test]
    fn test_resource_for_manifest_core_group() {
        let m = crate::manifest::Manifest::new("v1", "Secret", "creds", "eksa-system");
        let ar = KubeClusterClient::resource_for_manifest(&m);
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "secrets");
    }

    #[test]
    fn test_resource_for_manifest_grouped() {
        let m = crate::manifest::Manifest::new(
            "cluster.x-k8s.io/v1beta1",
            "MachineDeployment",
            "mgmt-md-0",
            "eksa-system",
        );
        let ar = KubeClusterClient::resource_for_manifest(&m);
        assert_eq!(ar.group, "cluster.x-k8s.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.kind, "MachineDeployment");
    }
}
