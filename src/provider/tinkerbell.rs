//! Tinkerbell provider: bare-metal clusters
//!
//! Machines land on physical hardware selected by label-map selectors, so
//! every reconciliation validates inventory before templates are applied:
//! selector mutual exclusion, per-operation availability, and a BMC
//! contactability pre-flight.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::ClusterClient;
use crate::hardware::{
    selector_requirements, validate_bmcs_contactable, validate_hardware_for_operation, Catalogue,
    DEFAULT_BMC_TIMEOUT,
};
use crate::spec::{DatacenterConfig, DatacenterKind, Spec, WorkerNodeGroupConfig};
use crate::template::names::machine_deployment_name;
use crate::template::values::substitute_registry;
use crate::template::{InfraTemplates, MachineRole, NowFn, Values};
use crate::{ClusterHandle, Error, Result};

use super::{
    render_create_with, render_upgrade_with, Operation, ProviderReconciler, RenderedSpecs,
    UpgradeRender,
};

/// Tinkerbell infrastructure API version
const TINKERBELL_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// Default provisioning workflow template, parameterized by the OS image URL.
/// The default registry host is rewritten when a mirror is configured.
const DEFAULT_WORKFLOW_TEMPLATE: &str = r#"version: "0.1"
name: {{.clusterName}}
global_timeout: 6000
tasks:
  - name: {{.clusterName}}-provision
    worker: "{{.device_1}}"
    volumes:
      - /dev:/dev
      - /dev/console:/dev/console
      - /lib/firmware:/lib/firmware:ro
    actions:
      - name: stream-image
        image: public.ecr.aws/eks-anywhere/image2disk:v1
        timeout: 600
        environment:
          DEST_DISK: "{{ index .Hardware.Disks 0 }}"
          IMG_URL: "{{.imageUrl}}"
          COMPRESSED: true
      - name: write-netplan
        image: public.ecr.aws/eks-anywhere/writefile:v1
        timeout: 90
        environment:
          DEST_DISK: "{{ formatPartition ( index .Hardware.Disks 0 ) 2 }}"
          DEST_PATH: /etc/netplan/config.yaml
          DIRMODE: "0755"
          FS_TYPE: ext4
          MODE: "0644"
          STATIC_NETPLAN: true
      - name: reboot
        image: public.ecr.aws/eks-anywhere/reboot:v1
        timeout: 90
        pid: host
"#;

/// Infrastructure rendering surface for bare-metal clusters
#[derive(Debug, Default, Clone)]
pub struct TinkerbellTemplates;

impl TinkerbellTemplates {
    fn datacenter_values(spec: &Spec, values: &mut Values) -> Result<()> {
        let DatacenterConfig::Tinkerbell {
            tinkerbell_ip,
            os_image_url,
            skip_load_balancer_deployment,
        } = &spec.datacenter
        else {
            return Err(Error::validation(
                "tinkerbell reconciler received a non-tinkerbell datacenter config",
            ));
        };

        values.insert("tinkerbellIP".into(), json!(tinkerbell_ip));
        values.insert("osImageUrl".into(), json!(os_image_url));
        values.insert(
            "skipLoadBalancerDeployment".into(),
            json!(skip_load_balancer_deployment),
        );
        Ok(())
    }

    fn selector_for<'s>(
        spec: &'s Spec,
        role: &str,
        name: &str,
    ) -> Result<&'s BTreeMap<String, String>> {
        spec.machine_configs
            .get(name)
            .and_then(|mc| mc.placement.hardware_selector())
            .ok_or_else(|| {
                Error::validation(format!(
                    "{role} machine config {name} has no hardware selector"
                ))
            })
    }
}

impl InfraTemplates for TinkerbellTemplates {
    fn api_version(&self) -> &str {
        TINKERBELL_API_VERSION
    }

    fn cluster_kind(&self) -> &str {
        "TinkerbellCluster"
    }

    fn machine_template_kind(&self) -> &str {
        "TinkerbellMachineTemplate"
    }

    fn cluster_spec(&self, values: &Values) -> Result<Value> {
        Ok(json!({
            "imageLookupBaseRegistry": values.get("publicMirror").cloned().unwrap_or(json!("")),
            "controlPlaneEndpoint": {
                "host": values.get("controlPlaneEndpointIp").cloned().unwrap_or(json!("")),
                "port": 6443,
            },
        }))
    }

    fn machine_template_spec(&self, values: &Values, role: MachineRole) -> Result<Value> {
        let (selector_key, override_key) = match role {
            MachineRole::ControlPlane => ("hardwareSelector", "controlPlaneTemplateOverride"),
            MachineRole::Etcd => ("etcdHardwareSelector", "etcdTemplateOverride"),
            MachineRole::Worker => ("hardwareSelector", "workerTemplateOverride"),
        };

        Ok(json!({
            "template": {
                "spec": {
                    "hardwareAffinity": {
                        "required": [{
                            "labelSelector": {
                                "matchLabels": values.get(selector_key).cloned().unwrap_or(json!({})),
                            },
                        }],
                    },
                    "templateOverride": values.get(override_key).cloned().unwrap_or(json!("")),
                },
            },
        }))
    }

    fn augment_cp_values(&self, spec: &Spec, values: &mut Values) -> Result<()> {
        Self::datacenter_values(spec, values)?;

        let cp_ref = &spec.cluster.spec.control_plane.machine_group_ref.name;
        let selector = Self::selector_for(spec, "control plane", cp_ref)?;
        values.insert("hardwareSelector".into(), json!(selector));

        if let Some(etcd) = &spec.cluster.spec.external_etcd {
            let selector = Self::selector_for(spec, "etcd", &etcd.machine_group_ref.name)?;
            values.insert("etcdHardwareSelector".into(), json!(selector));
        }

        // Embedded workflow overrides honor a configured registry mirror.
        let override_text = substitute_registry(DEFAULT_WORKFLOW_TEMPLATE, values);
        values.insert("controlPlaneTemplateOverride".into(), json!(override_text));
        if spec.cluster.spec.external_etcd.is_some() {
            values.insert("etcdTemplateOverride".into(), json!(override_text));
        }

        Ok(())
    }

    fn augment_worker_values(
        &self,
        spec: &Spec,
        group: &WorkerNodeGroupConfig,
        values: &mut Values,
    ) -> Result<()> {
        Self::datacenter_values(spec, values)?;
        let selector = Self::selector_for(spec, &group.name, &group.machine_group_ref.name)?;
        values.insert("hardwareSelector".into(), json!(selector));

        let override_text = substitute_registry(DEFAULT_WORKFLOW_TEMPLATE, values);
        values.insert("workerTemplateOverride".into(), json!(override_text));
        Ok(())
    }
}

/// Reconciler for the bare-metal provider
pub struct TinkerbellReconciler {
    client: Arc<dyn ClusterClient>,
    templates: TinkerbellTemplates,
    now: NowFn,
    bmc_timeout: Duration,
    cancel: CancellationToken,
}

impl TinkerbellReconciler {
    /// Create a bare-metal reconciler over the shared cluster client
    pub fn new(client: Arc<dyn ClusterClient>, now: NowFn) -> Self {
        Self {
            client,
            templates: TinkerbellTemplates,
            now,
            bmc_timeout: DEFAULT_BMC_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Override the BMC contactable wait bound
    pub fn with_bmc_timeout(mut self, timeout: Duration) -> Self {
        self.bmc_timeout = timeout;
        self
    }

    /// Attach a cancellation token for the pre-flight waits
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate inventory against a pre-built catalogue (CSV ingestion path)
    pub async fn validate_catalogue(
        &self,
        catalogue: &Catalogue,
        spec: &Spec,
        operation: &Operation,
    ) -> Result<()> {
        let groups = selector_requirements(spec)?;
        let current_counts = self.observed_group_counts(spec).await?;
        validate_hardware_for_operation(catalogue, &groups, operation, &current_counts)
    }

    async fn observed_group_counts(&self, spec: &Spec) -> Result<BTreeMap<String, i32>> {
        let mut counts = BTreeMap::new();
        for group in &spec.cluster.spec.worker_node_groups {
            let md_name = machine_deployment_name(spec.name(), &group.name);
            if let Some(md) = self
                .client
                .get_machine_deployment(crate::SYSTEM_NAMESPACE, &md_name)
                .await?
            {
                counts.insert(group.name.clone(), md.spec.replicas.unwrap_or(0));
            }
        }
        if let Some(kcp) = self
            .client
            .get_kubeadm_control_plane(crate::SYSTEM_NAMESPACE, spec.name())
            .await?
        {
            counts.insert("control-plane".to_string(), kcp.spec.replicas.unwrap_or(0));
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProviderReconciler for TinkerbellReconciler {
    fn kind(&self) -> DatacenterKind {
        DatacenterKind::Tinkerbell
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

    /// Bare-metal pre-flight: rebuild the catalogue from the cluster, run the
    /// per-operation availability assertions, then wait for every BMC to
    /// report contactable.
    async fn preflight(&self, spec: &Spec, operation: &Operation) -> Result<()> {
        // A fresh catalogue per reconciliation; inventory is never cached.
        let catalogue =
            crate::hardware::read_cluster(self.client.as_ref(), crate::SYSTEM_NAMESPACE).await?;
        info!(
            cluster = %spec.name(),
            hardware = catalogue.len(),
            operation = %operation,
            "validating bare-metal inventory"
        );

        self.validate_catalogue(&catalogue, spec, operation).await?;

        validate_bmcs_contactable(
            self.client.as_ref(),
            crate::SYSTEM_NAMESPACE,
            self.bmc_timeout,
            &self.cancel,
        )
        .await
    }
}
