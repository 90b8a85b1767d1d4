//! Docker provider: local container-based sandbox clusters
//!
//! Used for development and ephemeral bootstrap clusters. Machines are
//! containers, so placement collapses to a docker-socket mount and there is
//! no hardware or credential surface.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::ClusterClient;
use crate::spec::{DatacenterKind, Spec};
use crate::template::{InfraTemplates, MachineRole, NowFn, Values};
use crate::{ClusterHandle, Result};

use super::{
    render_create_with, render_upgrade_with, ProviderReconciler, RenderedSpecs, UpgradeRender,
};

/// Docker infrastructure API version
const DOCKER_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// Infrastructure rendering surface for docker clusters
#[derive(Debug, Default, Clone)]
pub struct DockerTemplates;

impl InfraTemplates for DockerTemplates {
    fn api_version(&self) -> &str {
        DOCKER_API_VERSION
    }

    fn cluster_kind(&self) -> &str {
        "DockerCluster"
    }

    fn machine_template_kind(&self) -> &str {
        "DockerMachineTemplate"
    }

    fn cluster_spec(&self, _values: &Values) -> Result<Value> {
        // DockerCluster needs no spec; the Cluster resource carries the
        // network configuration.
        Ok(json!({}))
    }

    fn machine_template_spec(&self, _values: &Values, _role: MachineRole) -> Result<Value> {
        Ok(json!({
            "template": {
                "spec": {
                    "extraMounts": [{
                        "containerPath": "/var/run/docker.sock",
                        "hostPath": "/var/run/docker.sock",
                    }],
                },
            },
        }))
    }
}

/// Reconciler for the docker sandbox provider
pub struct DockerReconciler {
    client: Arc<dyn ClusterClient>,
    templates: DockerTemplates,
    now: NowFn,
}

impl DockerReconciler {
    /// Create a docker reconciler over the shared cluster client
    pub fn new(client: Arc<dyn ClusterClient>, now: NowFn) -> Self {
        Self {
            client,
            templates: DockerTemplates,
            now,
        }
    }
}

#[async_trait]
impl ProviderReconciler for DockerReconciler {
    fn kind(&self) -> DatacenterKind {
        DatacenterKind::Docker
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
}
