//! CAPI manifest rendering
//!
//! The renderer turns value maps into manifest documents. Providers supply
//! the infrastructure-specific pieces through [`InfraTemplates`]; everything
//! shared between providers (Cluster, KubeadmControlPlane, EtcdadmCluster,
//! MachineDeployment, KubeadmConfigTemplate) is generated here. Output is
//! deterministic: the only non-determinism a caller can introduce is the
//! template-name timestamps it injects through build options.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::manifest::{self, Manifest};
use crate::spec::{Spec, WorkerNodeGroupConfig};
use crate::{Error, Result};

use super::names;
use super::values::{build_cp_values, build_worker_values, BuildOption, Values};

/// CAPI core API version
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
/// CAPI control plane API version
pub const CAPI_CONTROLPLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";
/// CAPI bootstrap API version
pub const CAPI_BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";
/// Etcdadm cluster API version
pub const ETCD_CLUSTER_API_VERSION: &str = "etcdcluster.cluster.x-k8s.io/v1beta1";

/// Role a machine template is rendered for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineRole {
    /// Control plane machines
    ControlPlane,
    /// External etcd machines
    Etcd,
    /// Worker group machines
    Worker,
}

/// Infrastructure-specific rendering surface implemented per provider
pub trait InfraTemplates: Send + Sync {
    /// Infrastructure API version (e.g. "infrastructure.cluster.x-k8s.io/v1beta1")
    fn api_version(&self) -> &str;

    /// Provider cluster kind (e.g. "VSphereCluster")
    fn cluster_kind(&self) -> &str;

    /// Provider machine template kind (e.g. "VSphereMachineTemplate")
    fn machine_template_kind(&self) -> &str;

    /// Provider cluster spec body
    fn cluster_spec(&self, values: &Values) -> Result<Value>;

    /// Provider machine template spec body for the given role
    fn machine_template_spec(&self, values: &Values, role: MachineRole) -> Result<Value>;

    /// Provider-specific control-plane value-map entries
    fn augment_cp_values(&self, _spec: &Spec, _values: &mut Values) -> Result<()> {
        Ok(())
    }

    /// Provider-specific worker value-map entries
    fn augment_worker_values(
        &self,
        _spec: &Spec,
        _group: &WorkerNodeGroupConfig,
        _values: &mut Values,
    ) -> Result<()> {
        Ok(())
    }

    /// Additional provider documents applied with the control plane (secrets,
    /// identity resources)
    fn other_control_plane_manifests(&self, _values: &Values) -> Result<Vec<Manifest>> {
        Ok(Vec::new())
    }
}

/// Renders a spec model into CAPI manifest byte streams
pub struct TemplateRenderer<'a> {
    infra: &'a dyn InfraTemplates,
}

impl<'a> TemplateRenderer<'a> {
    /// Create a renderer over the given infrastructure surface
    pub fn new(infra: &'a dyn InfraTemplates) -> Self {
        Self { infra }
    }

    /// Render the control plane document stream
    ///
    /// Build options run after the value map is assembled; callers use them
    /// to inject template names (`controlPlaneTemplateName`,
    /// `etcdTemplateName`) and any overrides.
    pub fn render_control_plane(&self, spec: &Spec, opts: &[BuildOption<'_>]) -> Result<Vec<u8>> {
        let mut values = build_cp_values(spec)?;
        self.infra.augment_cp_values(spec, &mut values)?;
        for opt in opts {
            opt(&mut values);
        }

        let mut docs = vec![
            self.generate_cluster(&values)?,
            self.generate_provider_cluster(&values)?,
            self.generate_kubeadm_control_plane(&values)?,
            self.generate_machine_template(
                &values,
                MachineRole::ControlPlane,
                str_value(&values, "controlPlaneTemplateName")?.to_string(),
            )?,
        ];

        if bool_value(&values, "externalEtcd") {
            docs.push(self.generate_etcdadm_cluster(&values)?);
            docs.push(self.generate_machine_template(
                &values,
                MachineRole::Etcd,
                str_value(&values, "etcdTemplateName")?.to_string(),
            )?);
        }

        docs.extend(self.infra.other_control_plane_manifests(&values)?);

        manifest::to_yaml_stream(&docs)
    }

    /// Render the workers document stream
    ///
    /// Output is the concatenation of per-group documents in spec order. Both
    /// name maps must contain every group; a missing entry is a programming
    /// error in the caller and is rejected.
    pub fn render_workers(
        &self,
        spec: &Spec,
        workload_template_names: &BTreeMap<String, String>,
        kubeadm_config_template_names: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>> {
        let mut group_docs = Vec::new();

        for group in &spec.cluster.spec.worker_node_groups {
            let workload_template_name =
                workload_template_names.get(&group.name).ok_or_else(|| {
                    Error::serialization(format!(
                        "no workload template name for worker group {}",
                        group.name
                    ))
                })?;
            let kubeadm_template_name =
                kubeadm_config_template_names.get(&group.name).ok_or_else(|| {
                    Error::serialization(format!(
                        "no kubeadm config template name for worker group {}",
                        group.name
                    ))
                })?;

            let mut values = build_worker_values(spec, group)?;
            self.infra.augment_worker_values(spec, group, &mut values)?;
            values.insert("workloadTemplateName".into(), json!(workload_template_name));
            values.insert(
                "workloadkubeadmconfigTemplateName".into(),
                json!(kubeadm_template_name),
            );

            group_docs.push(self.generate_machine_deployment(&values)?);
            group_docs.push(self.generate_kubeadm_config_template(&values)?);
            group_docs.push(self.generate_machine_template(
                &values,
                MachineRole::Worker,
                workload_template_name.clone(),
            )?);
        }

        manifest::to_yaml_stream(&group_docs)
    }

    fn labels(&self, values: &Values) -> Result<BTreeMap<String, String>> {
        let cluster_name = str_value(values, "clusterName")?;
        Ok(BTreeMap::from([
            (
                "cluster.x-k8s.io/cluster-name".to_string(),
                cluster_name.to_string(),
            ),
            (
                "app.kubernetes.io/managed-by".to_string(),
                "foundry".to_string(),
            ),
        ]))
    }

    fn generate_cluster(&self, values: &Values) -> Result<Manifest> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;

        let mut spec = json!({
            "clusterNetwork": {
                "pods": { "cidrBlocks": values.get("podCidrs").cloned().unwrap_or(json!([])) },
                "services": { "cidrBlocks": values.get("serviceCidrs").cloned().unwrap_or(json!([])) },
            },
            "controlPlaneEndpoint": {
                "host": values.get("controlPlaneEndpointIp").cloned().unwrap_or(json!("")),
                "port": 6443,
            },
            "controlPlaneRef": {
                "apiVersion": CAPI_CONTROLPLANE_API_VERSION,
                "kind": "KubeadmControlPlane",
                "name": names::kubeadm_control_plane_name(cluster_name),
            },
            "infrastructureRef": {
                "apiVersion": self.infra.api_version(),
                "kind": self.infra.cluster_kind(),
                "name": cluster_name,
            },
        });

        if bool_value(values, "externalEtcd") {
            spec["managedExternalEtcdRef"] = json!({
                "apiVersion": ETCD_CLUSTER_API_VERSION,
                "kind": "EtcdadmCluster",
                "name": names::etcdadm_cluster_name(cluster_name),
            });
        }

        Ok(Manifest::new(CAPI_API_VERSION, "Cluster", cluster_name, namespace)
            .with_labels(self.labels(values)?)
            .with_spec(spec))
    }

    fn generate_provider_cluster(&self, values: &Values) -> Result<Manifest> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;
        Ok(Manifest::new(
            self.infra.api_version(),
            self.infra.cluster_kind(),
            cluster_name,
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(self.infra.cluster_spec(values)?))
    }

    fn generate_kubeadm_control_plane(&self, values: &Values) -> Result<Manifest> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;

        let etcd = if bool_value(values, "externalEtcd") {
            // Endpoints are filled in by the external etcd controller once
            // members report ready.
            json!({
                "external": {
                    "endpoints": [],
                    "caFile": "/etc/kubernetes/pki/etcd/ca.crt",
                    "certFile": "/etc/kubernetes/pki/apiserver-etcd-client.crt",
                    "keyFile": "/etc/kubernetes/pki/apiserver-etcd-client.key",
                }
            })
        } else {
            json!({
                "local": {
                    "imageRepository": values.get("etcdRepository").cloned().unwrap_or(json!("")),
                    "imageTag": values.get("etcdImageTag").cloned().unwrap_or(json!("")),
                    "extraArgs": values.get("etcdExtraArgs").cloned().unwrap_or(json!({})),
                }
            })
        };

        let mut node_registration = json!({
            "kubeletExtraArgs": values.get("kubeletExtraArgs").cloned().unwrap_or(json!({})),
        });
        if let Some(taints) = values.get("controlPlaneTaints") {
            node_registration["taints"] = taints.clone();
        }

        let mut kubeadm_config_spec = json!({
            "clusterConfiguration": {
                "imageRepository": values.get("kubernetesRepository").cloned().unwrap_or(json!("")),
                "etcd": etcd,
                "dns": {
                    "imageRepository": values.get("corednsRepository").cloned().unwrap_or(json!("")),
                    "imageTag": values.get("corednsVersion").cloned().unwrap_or(json!("")),
                },
                "apiServer": {
                    "extraArgs": values.get("apiserverExtraArgs").cloned().unwrap_or(json!({})),
                },
                "controllerManager": {
                    "extraArgs": values.get("controllerManagerExtraArgs").cloned().unwrap_or(json!({})),
                },
                "scheduler": {
                    "extraArgs": values.get("schedulerExtraArgs").cloned().unwrap_or(json!({})),
                },
            },
            "initConfiguration": { "nodeRegistration": node_registration.clone() },
            "joinConfiguration": { "nodeRegistration": node_registration },
            "format": values.get("format").cloned().unwrap_or(json!("cloud-config")),
        });

        if let Some(username) = values.get("controlPlaneSshUsername") {
            kubeadm_config_spec["users"] = json!([{
                "name": username,
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "sshAuthorizedKeys": [values.get("controlPlaneSshAuthorizedKey").cloned().unwrap_or(json!(""))],
            }]);
        }
        if let Some(ntp) = values.get("cpNtpServers") {
            kubeadm_config_spec["ntp"] = json!({ "enabled": true, "servers": ntp });
        }
        if let Some(settings) = values.get("bottlerocketSettings") {
            kubeadm_config_spec["bottlerocket"] = settings.clone();
        }

        let mut spec = json!({
            "machineTemplate": {
                "infrastructureRef": {
                    "apiVersion": self.infra.api_version(),
                    "kind": self.infra.machine_template_kind(),
                    "name": str_value(values, "controlPlaneTemplateName")?,
                },
            },
            "replicas": values.get("controlPlaneReplicas").cloned().unwrap_or(json!(0)),
            "version": values.get("kubernetesVersion").cloned().unwrap_or(json!("")),
            "kubeadmConfigSpec": kubeadm_config_spec,
        });

        if bool_value(values, "upgradeRolloutStrategy") {
            spec["rolloutStrategy"] = json!({
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxSurge": values.get("maxSurge").cloned().unwrap_or(json!(1)),
                },
            });
        }

        Ok(Manifest::new(
            CAPI_CONTROLPLANE_API_VERSION,
            "KubeadmControlPlane",
            names::kubeadm_control_plane_name(cluster_name),
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(spec))
    }

    fn generate_etcdadm_cluster(&self, values: &Values) -> Result<Manifest> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;

        let mut etcdadm_config_spec = json!({
            "etcdadmBuiltin": true,
            "format": values.get("format").cloned().unwrap_or(json!("cloud-config")),
            "cipherSuites": values.get("etcdCipherSuites").cloned().unwrap_or(json!("")),
            "version": values.get("externalEtcdVersion").cloned().unwrap_or(json!("")),
        });
        if let Some(username) = values.get("etcdSshUsername") {
            etcdadm_config_spec["users"] = json!([{
                "name": username,
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "sshAuthorizedKeys": [values.get("etcdSshAuthorizedKey").cloned().unwrap_or(json!(""))],
            }]);
        }
        if let Some(ntp) = values.get("etcdNtpServers") {
            etcdadm_config_spec["ntp"] = json!({ "enabled": true, "servers": ntp });
        }

        let spec = json!({
            "replicas": values.get("externalEtcdReplicas").cloned().unwrap_or(json!(0)),
            "etcdadmConfigSpec": etcdadm_config_spec,
            "infrastructureTemplate": {
                "apiVersion": self.infra.api_version(),
                "kind": self.infra.machine_template_kind(),
                "name": str_value(values, "etcdTemplateName")?,
            },
        });

        Ok(Manifest::new(
            ETCD_CLUSTER_API_VERSION,
            "EtcdadmCluster",
            names::etcdadm_cluster_name(cluster_name),
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(spec))
    }

    fn generate_machine_deployment(&self, values: &Values) -> Result<Manifest> {
        let cluster_name = str_value(values, "clusterName")?;
        let namespace = str_value(values, "eksaSystemNamespace")?;
        let group_name = str_value(values, "workerNodeGroupName")?;

        let mut spec = json!({
            "clusterName": cluster_name,
            "replicas": values.get("workerReplicas").cloned().unwrap_or(json!(0)),
            "selector": { "matchLabels": {} },
            "template": {
                "metadata": {
                    "labels": { "cluster.x-k8s.io/cluster-name": cluster_name },
                },
                "spec": {
                    "clusterName": cluster_name,
                    "version": values.get("kubernetesVersion").cloned().unwrap_or(json!("")),
                    "bootstrap": {
                        "configRef": {
                            "apiVersion": CAPI_BOOTSTRAP_API_VERSION,
                            "kind": "KubeadmConfigTemplate",
                            "name": str_value(values, "workloadkubeadmconfigTemplateName")?,
                        },
                    },
                    "infrastructureRef": {
                        "apiVersion": self.infra.api_version(),
                        "kind": self.infra.machine_template_kind(),
                        "name": str_value(values, "workloadTemplateName")?,
                    },
                },
            },
        });

        if bool_value(values, "upgradeRolloutStrategy") {
            spec["strategy"] = json!({
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxSurge": values.get("maxSurge").cloned().unwrap_or(json!(1)),
                    "maxUnavailable": values.get("maxUnavailable").cloned().unwrap_or(json!(0)),
                },
            });
        }

        let mut md = Manifest::new(
            CAPI_API_VERSION,
            "MachineDeployment",
            names::machine_deployment_name(cluster_name, group_name),
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(spec);

        // Autoscaled groups advertise their bounds; the replica field then
        // belongs to the autoscaler.
        if let Some(autoscaling) = values.get("autoscalingConfig") {
            md = md.with_annotations(BTreeMap::from([
                (
                    "cluster.x-k8s.io/cluster-api-autoscaler-node-group-min-size".to_string(),
                    autoscaling["minCount"].to_string(),
                ),
                (
                    "cluster.x-k8s.io/cluster-api-autoscaler-node-group-max-size".to_string(),
                    autoscaling["maxCount"].to_string(),
                ),
            ]));
        }

        Ok(md)
    }

    fn generate_kubeadm_config_template(&self, values: &Values) -> Result<Manifest> {
        let namespace = str_value(values, "eksaSystemNamespace")?;

        let mut node_registration = json!({
            "kubeletExtraArgs": values.get("kubeletExtraArgs").cloned().unwrap_or(json!({})),
        });
        if let Some(taints) = values.get("workerNodeGroupTaints") {
            node_registration["taints"] = taints.clone();
        }
        if bool_value(values, "cgroupDriverSystemd") {
            node_registration["kubeletExtraArgs"]["cgroup-driver"] = json!("systemd");
        }

        let mut template_spec = json!({
            "joinConfiguration": { "nodeRegistration": node_registration },
            "format": values.get("format").cloned().unwrap_or(json!("cloud-config")),
        });
        if let Some(username) = values.get("workerSshUsername") {
            template_spec["users"] = json!([{
                "name": username,
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "sshAuthorizedKeys": [values.get("workerSshAuthorizedKey").cloned().unwrap_or(json!(""))],
            }]);
        }
        if let Some(ntp) = values.get("ntpServers") {
            template_spec["ntp"] = json!({ "enabled": true, "servers": ntp });
        }
        if let Some(settings) = values.get("bottlerocketSettings") {
            template_spec["bottlerocket"] = settings.clone();
        }

        Ok(Manifest::new(
            CAPI_BOOTSTRAP_API_VERSION,
            "KubeadmConfigTemplate",
            str_value(values, "workloadkubeadmconfigTemplateName")?,
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(json!({ "template": { "spec": template_spec } })))
    }

    fn generate_machine_template(
        &self,
        values: &Values,
        role: MachineRole,
        name: String,
    ) -> Result<Manifest> {
        let namespace = str_value(values, "eksaSystemNamespace")?;
        Ok(Manifest::new(
            self.infra.api_version(),
            self.infra.machine_template_kind(),
            name,
            namespace,
        )
        .with_labels(self.labels(values)?)
        .with_spec(self.infra.machine_template_spec(values, role)?))
    }
}

/// Read a required string value from the map
pub fn str_value<'v>(values: &'v Values, key: &str) -> Result<&'v str> {
    values
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization(format!("value map is missing {key}")))
}

/// Read an optional bool value, defaulting to false
pub fn bool_value(values: &Values, key: &str) -> bool {
    values.get(key).and_then(Value::as_bool).unwrap_or(false)
}
