//! Lazy, idempotent dependency assembly
//!
//! The factory encodes the dependency DAG as an append-only list of deferred
//! build steps. Each step is guarded by an already-built check on the
//! artifact it constructs: registering the same dependency twice is
//! harmless, and ordering falls out of registration order. Cyclic ownership
//! (a reconciler needs a client, waits need the same client) is resolved by
//! injecting the client once and handing every dependent a handle.

use std::sync::Arc;

use tracing::info;

use crate::client::ClusterClient;
use crate::lifecycle::{
    ArtifactWriter, ClusterctlMoveRunner, KubeconfigClientRegistry, NoopNetworking, Orchestrator,
    Timeouts,
};
use crate::provider::{DockerReconciler, TinkerbellReconciler, VSphereReconciler};
use crate::registry::{ReconcilerRegistry, ReconcilerRegistryBuilder};
use crate::spec::DatacenterKind;
use crate::template::{system_now, NowFn};
use crate::Result;

type BuildStep = Box<dyn FnOnce(&mut Artifacts) -> Result<()> + Send>;

/// Everything the factory can construct
#[derive(Default)]
struct Artifacts {
    docker: Option<Arc<DockerReconciler>>,
    vsphere: Option<Arc<VSphereReconciler>>,
    tinkerbell: Option<Arc<TinkerbellReconciler>>,
    registry_builder: Option<ReconcilerRegistryBuilder>,
    registry: Option<Arc<ReconcilerRegistry>>,
    orchestrator: Option<Arc<Orchestrator>>,
}

/// The assembled reconciler set
pub struct Reconcilers {
    /// Provider dispatch table
    pub registry: Arc<ReconcilerRegistry>,
    /// Lifecycle orchestrator
    pub orchestrator: Arc<Orchestrator>,
}

/// Deferred-build dependency factory
pub struct Factory {
    client: Arc<dyn ClusterClient>,
    now: NowFn,
    artifact_base: std::path::PathBuf,
    timeouts: Timeouts,
    steps: Vec<BuildStep>,
    artifacts: Artifacts,
}

impl Factory {
    /// Factory over the shared management-cluster client
    pub fn new(client: Arc<dyn ClusterClient>, artifact_base: impl Into<std::path::PathBuf>) -> Self {
        Self {
            client,
            now: system_now(),
            artifact_base: artifact_base.into(),
            timeouts: Timeouts::default(),
            steps: Vec::new(),
            artifacts: Artifacts::default(),
        }
    }

    /// Override the clock (deterministic template names in tests)
    pub fn with_now(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    /// Override the wait bounds
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Register the docker reconciler
    pub fn with_docker_reconciler(mut self) -> Self {
        let client = self.client.clone();
        let now = self.now.clone();
        self.steps.push(Box::new(move |artifacts| {
            if artifacts.docker.is_some() {
                return Ok(());
            }
            artifacts.docker = Some(Arc::new(DockerReconciler::new(client, now)));
            Ok(())
        }));
        self.with_registry_entry(DatacenterKind::Docker)
    }

    /// Register the vSphere reconciler
    pub fn with_vsphere_reconciler(mut self) -> Self {
        let client = self.client.clone();
        let now = self.now.clone();
        self.steps.push(Box::new(move |artifacts| {
            if artifacts.vsphere.is_some() {
                return Ok(());
            }
            artifacts.vsphere = Some(Arc::new(VSphereReconciler::new(client, now)));
            Ok(())
        }));
        self.with_registry_entry(DatacenterKind::VSphere)
    }

    /// Register the bare-metal reconciler
    pub fn with_tinkerbell_reconciler(mut self) -> Self {
        let client = self.client.clone();
        let now = self.now.clone();
        self.steps.push(Box::new(move |artifacts| {
            if artifacts.tinkerbell.is_some() {
                return Ok(());
            }
            artifacts.tinkerbell = Some(Arc::new(TinkerbellReconciler::new(client, now)));
            Ok(())
        }));
        self.with_registry_entry(DatacenterKind::Tinkerbell)
    }

    /// Register reconcilers for the infrastructure providers installed on
    /// the management cluster; unknown provider names are logged and ignored
    pub fn with_provider_reconcilers(mut self, capi_providers: &[String]) -> Self {
        for provider in capi_providers {
            self = match provider.as_str() {
                "docker" => self.with_docker_reconciler(),
                "vsphere" => self.with_vsphere_reconciler(),
                "tinkerbell" => self.with_tinkerbell_reconciler(),
                unknown => {
                    info!(provider = unknown, "found unknown CAPI provider, ignoring");
                    self
                }
            };
        }
        self
    }

    /// Register the lifecycle orchestrator
    pub fn with_orchestrator(mut self) -> Self {
        let client = self.client.clone();
        let base = self.artifact_base.clone();
        let timeouts = self.timeouts.clone();
        self.steps.push(Box::new(move |artifacts| {
            if artifacts.orchestrator.is_some() {
                return Ok(());
            }
            artifacts.orchestrator = Some(Arc::new(
                Orchestrator::new(
                    client,
                    Arc::new(KubeconfigClientRegistry),
                    Arc::new(NoopNetworking),
                    Arc::new(ClusterctlMoveRunner),
                    ArtifactWriter::new(base),
                )
                .with_timeouts(timeouts),
            ));
            Ok(())
        }));
        self
    }

    fn with_registry_entry(mut self, kind: DatacenterKind) -> Self {
        self.steps.push(Box::new(move |artifacts| {
            let builder = artifacts
                .registry_builder
                .take()
                .unwrap_or_else(ReconcilerRegistry::builder);
            let builder = match kind {
                DatacenterKind::Docker => match &artifacts.docker {
                    Some(reconciler) => builder.add(kind, reconciler.clone()),
                    None => builder,
                },
                DatacenterKind::VSphere => match &artifacts.vsphere {
                    Some(reconciler) => builder.add(kind, reconciler.clone()),
                    None => builder,
                },
                DatacenterKind::Tinkerbell => match &artifacts.tinkerbell {
                    Some(reconciler) => builder.add(kind, reconciler.clone()),
                    None => builder,
                },
                _ => builder,
            };
            artifacts.registry_builder = Some(builder);
            Ok(())
        }));
        self
    }

    /// Run every registered step once, in registration order
    pub fn build(mut self) -> Result<Reconcilers> {
        self = self.with_orchestrator();

        for step in std::mem::take(&mut self.steps) {
            step(&mut self.artifacts)?;
        }

        let builder = self
            .artifacts
            .registry_builder
            .take()
            .unwrap_or_else(ReconcilerRegistry::builder);
        let registry = self
            .artifacts
            .registry
            .take()
            .unwrap_or_else(|| Arc::new(builder.build()));

        let orchestrator = self
            .artifacts
            .orchestrator
            .take()
            .expect("orchestrator step always registered");

        Ok(Reconcilers {
            registry,
            orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::template::names::fixed_now;
    use chrono::TimeZone;

    fn factory() -> Factory {
        Factory::new(Arc::new(MockClusterClient::new()), "/tmp/foundry-test").with_now(fixed_now(
            chrono::Utc.timestamp_opt(1_680_000_000, 0).unwrap(),
        ))
    }

    #[test]
    fn test_build_wires_requested_reconcilers() {
        let reconcilers = factory()
            .with_docker_reconciler()
            .with_tinkerbell_reconciler()
            .build()
            .unwrap();

        assert!(reconcilers.registry.get(DatacenterKind::Docker).is_some());
        assert!(reconcilers
            .registry
            .get(DatacenterKind::Tinkerbell)
            .is_some());
        assert!(reconcilers.registry.get(DatacenterKind::VSphere).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        let reconcilers = factory()
            .with_docker_reconciler()
            .with_docker_reconciler()
            .build()
            .unwrap();

        assert_eq!(reconcilers.registry.kinds(), [DatacenterKind::Docker]);
    }

    #[test]
    fn test_provider_names_drive_wiring_and_unknown_is_ignored() {
        let providers = vec![
            "docker".to_string(),
            "vsphere".to_string(),
            "openstack".to_string(),
        ];
        let reconcilers = factory().with_provider_reconcilers(&providers).build().unwrap();

        let mut kinds = reconcilers.registry.kinds();
        kinds.sort_by_key(|k| format!("{k}"));
        assert_eq!(kinds, [DatacenterKind::Docker, DatacenterKind::VSphere]);
    }

    #[test]
    fn test_build_always_produces_an_orchestrator() {
        let reconcilers = factory().build().unwrap();
        // No providers registered: empty registry, but lifecycle operations
        // are still available.
        assert!(reconcilers.registry.kinds().is_empty());
        let _ = reconcilers.orchestrator;
    }
}
