//! vSphere provider: virtualization platform clusters
//!
//! Placement (datastore, folder, resource pool, OVA template, sizing, tags)
//! comes from the machine configs; datacenter-level connection settings come
//! from the datacenter config. Provider credentials are read from the
//! environment at render time and applied as a secret next to the control
//! plane.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::ClusterClient;
use crate::config;
use crate::manifest::Manifest;
use crate::spec::{DatacenterConfig, DatacenterKind, Spec, VspherePlacement, WorkerNodeGroupConfig};
use crate::template::renderer::str_value;
use crate::template::{InfraTemplates, MachineRole, NowFn, Values};
use crate::{ClusterHandle, Error, Result};

use super::{
    render_create_with, render_upgrade_with, ProviderReconciler, RenderedSpecs, UpgradeRender,
};

/// vSphere infrastructure API version
const VSPHERE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// Infrastructure rendering surface for vSphere clusters
#[derive(Debug, Default, Clone)]
pub struct VSphereTemplates;

impl VSphereTemplates {
    fn datacenter_values(spec: &Spec, values: &mut Values) -> Result<()> {
        let DatacenterConfig::VSphere {
            server,
            datacenter,
            network,
            thumbprint,
            insecure,
        } = &spec.datacenter
        else {
            return Err(Error::validation(
                "vsphere reconciler received a non-vsphere datacenter config",
            ));
        };

        values.insert("vsphereServer".into(), json!(server));
        values.insert("vsphereDatacenter".into(), json!(datacenter));
        values.insert("vsphereNetwork".into(), json!(network));
        values.insert("thumbprint".into(), json!(thumbprint));
        values.insert("insecure".into(), json!(insecure));
        Ok(())
    }

    fn placement_values(values: &mut Values, prefix: &str, placement: &VspherePlacement) {
        values.insert(format!("{prefix}Datastore"), json!(placement.datastore));
        values.insert(format!("{prefix}Folder"), json!(placement.folder));
        values.insert(
            format!("{prefix}ResourcePool"),
            json!(placement.resource_pool),
        );
        values.insert(format!("{prefix}Template"), json!(placement.template));
        values.insert(format!("{prefix}MemoryMiB"), json!(placement.memory_mi_b));
        values.insert(format!("{prefix}NumCPUs"), json!(placement.num_cpus));
        values.insert(format!("{prefix}DiskGiB"), json!(placement.disk_gi_b));
        values.insert(
            format!("{prefix}StoragePolicyName"),
            json!(placement.storage_policy_name),
        );
        values.insert(format!("{prefix}TagIDs"), json!(placement.tag_ids));
    }

    fn placement_for<'s>(spec: &'s Spec, role: &str, name: &str) -> Result<&'s VspherePlacement> {
        spec.machine_configs
            .get(name)
            .and_then(|mc| mc.placement.vsphere())
            .ok_or_else(|| {
                Error::validation(format!(
                    "{role} machine config {name} has no vsphere placement"
                ))
            })
    }
}

impl InfraTemplates for VSphereTemplates {
    fn api_version(&self) -> &str {
        VSPHERE_API_VERSION
    }

    fn cluster_kind(&self) -> &str {
        "VSphereCluster"
    }

    fn machine_template_kind(&self) -> &str {
        "VSphereMachineTemplate"
    }

    fn cluster_spec(&self, values: &Values) -> Result<Value> {
        Ok(json!({
            "server": values.get("vsphereServer").cloned().unwrap_or(json!("")),
            "thumbprint": values.get("thumbprint").cloned().unwrap_or(json!("")),
            "controlPlaneEndpoint": {
                "host": values.get("controlPlaneEndpointIp").cloned().unwrap_or(json!("")),
                "port": 6443,
            },
            "identityRef": {
                "kind": "Secret",
                "name": format!("{}-vsphere-credentials", str_value(values, "clusterName")?),
            },
        }))
    }

    fn machine_template_spec(&self, values: &Values, role: MachineRole) -> Result<Value> {
        let prefix = match role {
            MachineRole::ControlPlane => "controlPlaneVsphere",
            MachineRole::Etcd => "etcdVsphere",
            MachineRole::Worker => "workerVsphere",
        };
        let get = |suffix: &str| {
            values
                .get(&format!("{prefix}{suffix}"))
                .cloned()
                .unwrap_or(Value::Null)
        };

        Ok(json!({
            "template": {
                "spec": {
                    "datacenter": values.get("vsphereDatacenter").cloned().unwrap_or(json!("")),
                    "server": values.get("vsphereServer").cloned().unwrap_or(json!("")),
                    "thumbprint": values.get("thumbprint").cloned().unwrap_or(json!("")),
                    "datastore": get("Datastore"),
                    "folder": get("Folder"),
                    "resourcePool": get("ResourcePool"),
                    "storagePolicyName": get("StoragePolicyName"),
                    "template": get("Template"),
                    "memoryMiB": get("MemoryMiB"),
                    "numCPUs": get("NumCPUs"),
                    "diskGiB": get("DiskGiB"),
                    "tagIDs": get("TagIDs"),
                    "network": {
                        "devices": [{
                            "networkName": values.get("vsphereNetwork").cloned().unwrap_or(json!("")),
                            "dhcp4": true,
                        }],
                    },
                },
            },
        }))
    }

    fn augment_cp_values(&self, spec: &Spec, values: &mut Values) -> Result<()> {
        Self::datacenter_values(spec, values)?;

        let cp_ref = &spec.cluster.spec.control_plane.machine_group_ref.name;
        let placement = Self::placement_for(spec, "control plane", cp_ref)?;
        Self::placement_values(values, "controlPlaneVsphere", placement);

        if let Some(etcd) = &spec.cluster.spec.external_etcd {
            let placement = Self::placement_for(spec, "etcd", &etcd.machine_group_ref.name)?;
            Self::placement_values(values, "etcdVsphere", placement);
        }

        let creds = config::read_provider_credentials("VSPHERE").map_err(|e| {
            Error::serialization(format!("reading vsphere credentials: {e}"))
        })?;
        values.insert("eksaVsphereUsername".into(), json!(creds.username));
        values.insert("eksaVspherePassword".into(), json!(creds.password));

        Ok(())
    }

    fn augment_worker_values(
        &self,
        spec: &Spec,
        group: &WorkerNodeGroupConfig,
        values: &mut Values,
    ) -> Result<()> {
        Self::datacenter_values(spec, values)?;
        let placement = Self::placement_for(spec, &group.name, &group.machine_group_ref.name)?;
        Self::placement_values(values, "workerVsphere", placement);
        Ok(())
    }

    fn other_control_plane_manifests(&self, values: &Values) -> Result<Vec<Manifest>> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;

        let secret = Manifest::new(
            "v1",
            "Secret",
            format!("{cluster_name}-vsphere-credentials"),
            namespace,
        )
        .with_field("type", json!("Opaque"))
        .with_field(
            "stringData",
            json!({
                "username": values.get("eksaVsphereUsername").cloned().unwrap_or(json!("")),
                "password": values.get("eksaVspherePassword").cloned().unwrap_or(json!("")),
            }),
        );

        Ok(vec![secret])
    }
}

/// Reconciler for the vSphere provider
pub struct VSphereReconciler {
    client: Arc<dyn ClusterClient>,
    templates: VSphereTemplates,
    now: NowFn,
}

impl VSphereReconciler {
    /// Create a vSphere reconciler over the shared cluster client
    pub fn new(client: Arc<dyn ClusterClient>, now: NowFn) -> Self {
        Self {
            client,
            templates: VSphereTemplates,
            now,
        }
    }
}

#[async_trait]
impl ProviderReconciler for VSphereReconciler {
    fn kind(&self) -> DatacenterKind {
        DatacenterKind::VSphere
    }

    fn machine_template_kind(&self) -> String {
        self.templates.machine_template_kind().to_string()
    }

    async fn render_for_create(&self, spec: &Spec) -> Result<RenderedSpecs> {
        render_create_with(&self.templates, &self.now, spec)
    }

    async fn render_for_upgrade(
        &self,
        _bootstrap: &ClusterHandle,
        _workload: &ClusterHandle,
        current: &Spec,
        new: &Spec,
    ) -> Result<UpgradeRender> {
        render_upgrade_with(&self.templates, &self.client, &self.now, current, new).await
    }

    fn storage_class_manifest(&self, _spec: &Spec) -> Result<Option<Vec<u8>>> {
        let manifest = Manifest::new("storage.k8s.io/v1", "StorageClass", "standard", "default")
            .with_annotations(std::collections::BTreeMap::from([(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )]))
            .with_field("provisioner", json!("csi.vsphere.vmware.com"));
        Ok(Some(manifest.to_yaml()?.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::manifest::parse_yaml_stream;
    use crate::spec::{MachineConfig, OsFamily, Placement, UserConfig};
    use crate::template::names::fixed_now;
    use chrono::TimeZone;

    fn now() -> NowFn {
        fixed_now(chrono::Utc.timestamp_opt(1_680_000_000, 0).unwrap())
    }

    fn vsphere_machine(name: &str) -> MachineConfig {
        MachineConfig {
            name: name.to_string(),
            os_family: OsFamily::Ubuntu,
            users: vec![UserConfig {
                name: "capv".to_string(),
                ssh_authorized_keys: vec!["ssh-rsa AAAA comment".to_string()],
            }],
            host_os_configuration: None,
            placement: Placement::VSphere(VspherePlacement {
                datastore: "/dc1/datastore/ds1".to_string(),
                folder: "/dc1/vm/clusters".to_string(),
                resource_pool: "/dc1/host/cluster/Resources".to_string(),
                template: "/dc1/vm/templates/ubuntu-2204".to_string(),
                memory_mi_b: 8192,
                num_cpus: 2,
                disk_gi_b: 25,
                storage_policy_name: String::new(),
                tag_ids: vec!["urn:vmomi:tag:1".to_string()],
            }),
        }
    }

    fn vsphere_spec() -> Spec {
        let mut spec = crate::provider::test_fixtures::docker_spec("prod", "1.23", 3, &[("md-0", 2)]);
        spec.datacenter = DatacenterConfig::VSphere {
            server: "vcenter.internal".to_string(),
            datacenter: "dc1".to_string(),
            network: "/dc1/network/vm".to_string(),
            thumbprint: "AB:CD".to_string(),
            insecure: false,
        };
        spec.machine_configs
            .insert("cp".to_string(), vsphere_machine("cp"));
        spec.machine_configs
            .insert("workers".to_string(), vsphere_machine("workers"));
        spec
    }

    fn set_credentials() {
        std::env::set_var("EKSA_VSPHERE_USERNAME", "administrator@vsphere.local");
        std::env::set_var("EKSA_VSPHERE_PASSWORD", "hunter2");
    }

    #[tokio::test]
    async fn test_create_renders_vsphere_placement_and_credentials_secret() {
        set_credentials();
        let client: Arc<dyn ClusterClient> = Arc::new(MockClusterClient::new());
        let reconciler = VSphereReconciler::new(client, now());
        let spec = vsphere_spec();

        let rendered = reconciler.render_for_create(&spec).await.unwrap();
        let cp_docs = parse_yaml_stream(&rendered.control_plane).unwrap();

        let template = cp_docs
            .iter()
            .find(|d| d.kind == "VSphereMachineTemplate")
            .unwrap();
        let template_spec = &template.spec.as_ref().unwrap()["template"]["spec"];
        assert_eq!(template_spec["datastore"], json!("/dc1/datastore/ds1"));
        assert_eq!(template_spec["memoryMiB"], json!(8192));
        assert_eq!(template_spec["numCPUs"], json!(2));
        assert_eq!(
            template_spec["network"]["devices"][0]["networkName"],
            json!("/dc1/network/vm")
        );

        let secret = cp_docs.iter().find(|d| d.kind == "Secret").unwrap();
        assert_eq!(secret.metadata.name, "prod-vsphere-credentials");
        assert_eq!(
            secret.extra["stringData"]["username"],
            json!("administrator@vsphere.local")
        );

        let vsphere_cluster = cp_docs.iter().find(|d| d.kind == "VSphereCluster").unwrap();
        assert_eq!(
            vsphere_cluster.spec.as_ref().unwrap()["identityRef"]["name"],
            json!("prod-vsphere-credentials")
        );
    }

    #[tokio::test]
    async fn test_worker_templates_use_worker_placement() {
        set_credentials();
        let client: Arc<dyn ClusterClient> = Arc::new(MockClusterClient::new());
        let reconciler = VSphereReconciler::new(client, now());
        let spec = vsphere_spec();

        let rendered = reconciler.render_for_create(&spec).await.unwrap();
        let worker_docs = parse_yaml_stream(&rendered.workers).unwrap();

        let template = worker_docs
            .iter()
            .find(|d| d.kind == "VSphereMachineTemplate")
            .unwrap();
        assert!(template.metadata.name.starts_with("prod-md-0-"));
        let template_spec = &template.spec.as_ref().unwrap()["template"]["spec"];
        assert_eq!(template_spec["diskGiB"], json!(25));
        assert_eq!(template_spec["tagIDs"], json!(["urn:vmomi:tag:1"]));
    }

    #[tokio::test]
    async fn test_non_vsphere_datacenter_is_rejected() {
        set_credentials();
        let client: Arc<dyn ClusterClient> = Arc::new(MockClusterClient::new());
        let reconciler = VSphereReconciler::new(client, now());
        let mut spec = vsphere_spec();
        spec.datacenter = DatacenterConfig::Docker {};

        let err = reconciler.render_for_create(&spec).await.unwrap_err();
        assert!(err.to_string().contains("non-vsphere"));
    }

    #[test]
    fn test_storage_class_manifest_is_default_class() {
        let client: Arc<dyn ClusterClient> = Arc::new(MockClusterClient::new());
        let reconciler = VSphereReconciler::new(client, now());
        let spec = vsphere_spec();

        let bytes = reconciler.storage_class_manifest(&spec).unwrap().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("kind: StorageClass"));
        assert!(text.contains("csi.vsphere.vmware.com"));
        assert!(text.contains("is-default-class"));
    }
}
