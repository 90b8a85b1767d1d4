//! Cluster lifecycle orchestration
//!
//! The orchestrator sequences the multi-step operations that create,
//! upgrade, move, back up, and delete clusters. Steps inside one operation
//! run strictly in order; every long wait is bounded and cancellable; error
//! context carries the phase name so a failure mid-sequence is attributable.
//! Recovery is forward-only: nothing here rolls back, the next reconcile
//! picks up from observed state.

mod files;
pub mod wait;

pub use files::ArtifactWriter;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{
    ClusterClient, CAPI_CLUSTER, ETCDADM_CLUSTER, KUBEADM_CONTROL_PLANE, MACHINE,
    MACHINE_DEPLOYMENT,
};
use crate::manifest::Manifest;
use crate::provider::{Operation, ProviderReconciler};
use crate::spec::Spec;
use crate::template::names::{etcdadm_cluster_name, machine_deployment_name};
use crate::{ClusterHandle, Error, Result, SYSTEM_NAMESPACE};

/// Annotation switching a cluster's controller reconciliation off
pub const PAUSED_ANNOTATION: &str = "anywhere.foundry.dev/paused";

/// Annotation marking a cluster as driven by the CLI; controllers must not
/// touch it while present
pub const MANAGED_BY_CLI_ANNOTATION: &str = "anywhere.foundry.dev/managed-by-cli";

/// Page size used when pausing or resuming a management cluster's fleet
const CLUSTER_PAGE_SIZE: u32 = 100;

/// Bounds for every wait the orchestrator performs; all configurable
#[derive(Clone, Debug)]
pub struct Timeouts {
    /// Control plane Available wait
    pub control_plane_wait: Duration,
    /// Observation window for a control plane roll start
    pub control_plane_not_ready_wait: Duration,
    /// Managed external etcd ready wait
    pub external_etcd_wait: Duration,
    /// Per-MachineDeployment readiness wait
    pub deployment_wait: Duration,
    /// Machine NodeRef + NodeHealthy wait
    pub machine_wait: Duration,
    /// Minimum per-attempt delay in the machine wait
    pub machine_backoff_min: Duration,
    /// Maximum per-attempt delay in the machine wait
    pub machine_backoff_max: Duration,
    /// Machine health check unhealthy timeout
    pub unhealthy_machine: Duration,
    /// Machine health check node startup timeout
    pub node_startup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control_plane_wait: Duration::from_secs(60 * 60),
            control_plane_not_ready_wait: Duration::from_secs(5 * 60),
            external_etcd_wait: Duration::from_secs(60 * 60),
            deployment_wait: Duration::from_secs(30 * 60),
            machine_wait: Duration::from_secs(30 * 60),
            machine_backoff_min: Duration::from_secs(1),
            machine_backoff_max: Duration::from_secs(60),
            unhealthy_machine: Duration::from_secs(10 * 60),
            node_startup: Duration::from_secs(20 * 60),
        }
    }
}

impl Timeouts {
    /// Disable machine health check timeouts by pinning them to the maximum
    /// representable duration
    pub fn without_machine_health_timeouts(mut self) -> Self {
        self.unhealthy_machine = Duration::MAX;
        self.node_startup = Duration::MAX;
        self
    }
}

/// Networking capability installed after the control plane is ready
///
/// The CNI itself is an external collaborator; the orchestrator only knows
/// when to invoke it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Networking: Send + Sync {
    /// Install networking on a workload cluster
    async fn install(&self, workload: &ClusterHandle, spec: &Spec) -> Result<()>;
}

/// No-op networking for providers whose tooling installs CNI out of band
pub struct NoopNetworking;

#[async_trait]
impl Networking for NoopNetworking {
    async fn install(&self, workload: &ClusterHandle, _spec: &Spec) -> Result<()> {
        debug!(cluster = %workload.name, "networking installation delegated externally");
        Ok(())
    }
}

/// AWS-IAM authenticator rotation during upgrades
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AwsIamAuth: Send + Sync {
    /// Rotate the authenticator on a workload cluster
    async fn upgrade(&self, workload: &ClusterHandle, spec: &Spec) -> Result<()>;
}

/// Output of an external move invocation
#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// Whether the command succeeded
    pub success: bool,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Executes the underlying CAPI move (external process)
#[cfg_attr(test, automock)]
pub trait MoveRunner: Send + Sync {
    /// Run the move from one kubeconfig to another
    fn run_move(
        &self,
        from_kubeconfig: Option<PathBuf>,
        to_kubeconfig: Option<PathBuf>,
        namespace: &str,
    ) -> Result<CommandOutput>;
}

/// Real move runner shelling out to `clusterctl move`
#[derive(Default, Clone)]
pub struct ClusterctlMoveRunner;

impl MoveRunner for ClusterctlMoveRunner {
    fn run_move(
        &self,
        from_kubeconfig: Option<PathBuf>,
        to_kubeconfig: Option<PathBuf>,
        namespace: &str,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("clusterctl");
        cmd.arg("move").arg("--namespace").arg(namespace);
        if let Some(from) = from_kubeconfig {
            cmd.arg("--kubeconfig").arg(from);
        }
        if let Some(to) = to_kubeconfig {
            cmd.arg("--to-kubeconfig").arg(to);
        }

        debug!(command = ?cmd, "executing capi move");
        let output = cmd
            .output()
            .map_err(|e| Error::external(format!("failed to execute clusterctl move: {e}")))?;
        Ok(CommandOutput::from(output))
    }
}

/// Produces a cluster client for a cluster handle
///
/// The orchestrator exclusively owns bootstrap/workload/management handles
/// during a pivot; clients themselves stay shareable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Client connected to the given cluster
    async fn client_for(&self, cluster: &ClusterHandle) -> Result<Arc<dyn ClusterClient>>;
}

/// Registry building clients from kubeconfig files on disk
pub struct KubeconfigClientRegistry;

#[async_trait]
impl ClientRegistry for KubeconfigClientRegistry {
    async fn client_for(&self, cluster: &ClusterHandle) -> Result<Arc<dyn ClusterClient>> {
        let config = match &cluster.kubeconfig_path {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)
                    .map_err(|e| Error::external(format!("reading kubeconfig: {e}")))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                    .await
                    .map_err(|e| Error::external(format!("building kube config: {e}")))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::external(format!("inferring kube config: {e}")))?,
        };
        let client = kube::Client::try_from(config)
            .map_err(|e| Error::external(format!("building kube client: {e}")))?;
        Ok(Arc::new(crate::client::KubeClusterClient::new(client)))
    }
}

/// Whether an upgrade has anything to do
///
/// A versions-bundle change counts as a spec change even when the cluster
/// fields are identical.
pub fn cluster_spec_changed(current: &Spec, new: &Spec) -> bool {
    current.cluster.spec != new.cluster.spec
        || current.bundle != new.bundle
        || current.machine_configs != new.machine_configs
        || current.datacenter != new.datacenter
        || current.oidc_config != new.oidc_config
        || current.aws_iam_config != new.aws_iam_config
}

/// The lifecycle orchestrator
pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    clients: Arc<dyn ClientRegistry>,
    networking: Arc<dyn Networking>,
    move_runner: Arc<dyn MoveRunner>,
    aws_iam: Option<Arc<dyn AwsIamAuth>>,
    artifacts: ArtifactWriter,
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator bound to the management cluster client
    pub fn new(
        client: Arc<dyn ClusterClient>,
        clients: Arc<dyn ClientRegistry>,
        networking: Arc<dyn Networking>,
        move_runner: Arc<dyn MoveRunner>,
        artifacts: ArtifactWriter,
    ) -> Self {
        Self {
            client,
            clients,
            networking,
            move_runner,
            aws_iam: None,
            artifacts,
            timeouts: Timeouts::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the wait bounds
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Attach an AWS-IAM authenticator rotation hook
    pub fn with_aws_iam_auth(mut self, aws_iam: Arc<dyn AwsIamAuth>) -> Self {
        self.aws_iam = Some(aws_iam);
        self
    }

    /// Attach a cancellation token covering every wait
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn cluster_namespace(spec: &Spec) -> String {
        spec.cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Create a workload cluster end to end
    ///
    /// Render, apply with server-side force, wait for etcd (when external)
    /// then the control plane, fetch and rewrite the kubeconfig, wait for
    /// every machine to carry a healthy node, install networking, install
    /// the provider storage class.
    pub async fn create_workload_cluster(
        &self,
        spec: &Spec,
        reconciler: &dyn ProviderReconciler,
    ) -> Result<ClusterHandle> {
        let cluster_name = spec.name().to_string();
        info!(cluster = %cluster_name, "creating workload cluster");

        reconciler
            .preflight(spec, &Operation::NewCluster)
            .await
            .map_err(|e| e.with_phase("preflight"))?;

        let rendered = reconciler
            .render_for_create(spec)
            .await
            .map_err(|e| e.with_phase("render"))?;

        self.artifacts
            .write_capi_templates(&cluster_name, &rendered.control_plane, &rendered.workers)
            .map_err(|e| e.with_phase("writeTemplates"))?;

        self.client
            .apply(&rendered.control_plane)
            .await
            .map_err(|e| e.with_phase("applyControlPlane"))?;
        if !rendered.workers.is_empty() {
            self.client
                .apply(&rendered.workers)
                .await
                .map_err(|e| e.with_phase("applyWorkers"))?;
        }

        if spec.cluster.spec.external_etcd.is_some() {
            wait::wait_for_external_etcd_ready(
                self.client.as_ref(),
                SYSTEM_NAMESPACE,
                &etcdadm_cluster_name(&cluster_name),
                self.timeouts.external_etcd_wait,
                &self.cancel,
            )
            .await
            .map_err(|e| e.with_phase("waitForExternalEtcd"))?;
        }

        wait::wait_for_control_plane_available(
            self.client.as_ref(),
            SYSTEM_NAMESPACE,
            &cluster_name,
            self.timeouts.control_plane_wait,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("waitForControlPlane"))?;

        let kubeconfig = wait::wait_for_kubeconfig(
            self.client.as_ref(),
            SYSTEM_NAMESPACE,
            &cluster_name,
            self.timeouts.machine_wait,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("fetchKubeconfig"))?;
        let kubeconfig = reconciler
            .update_kubeconfig(spec, kubeconfig)
            .await
            .map_err(|e| e.with_phase("updateKubeconfig"))?;
        let kubeconfig_path = self
            .artifacts
            .write_kubeconfig(&cluster_name, &kubeconfig)
            .map_err(|e| e.with_phase("writeKubeconfig"))?;

        let workload = ClusterHandle::new(&cluster_name).with_kubeconfig(kubeconfig_path);

        let expected_machines = expected_machine_count(spec);
        wait::wait_for_machines_ready(
            self.client.as_ref(),
            SYSTEM_NAMESPACE,
            &cluster_name,
            expected_machines,
            self.timeouts.machine_wait,
            self.timeouts.machine_backoff_min,
            self.timeouts.machine_backoff_max,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("waitForMachines"))?;

        self.networking
            .install(&workload, spec)
            .await
            .map_err(|e| e.with_phase("installNetworking"))?;

        if let Some(storage_class) = reconciler
            .storage_class_manifest(spec)
            .map_err(|e| e.with_phase("renderStorageClass"))?
        {
            let workload_client = self
                .clients
                .client_for(&workload)
                .await
                .map_err(|e| e.with_phase("installStorageClass"))?;
            workload_client
                .apply(&storage_class)
                .await
                .map_err(|e| e.with_phase("installStorageClass"))?;
        }

        info!(cluster = %cluster_name, "workload cluster created");
        Ok(workload)
    }

    /// Upgrade a workload cluster
    ///
    /// Adds to the create sequence: observation of the control plane roll
    /// start, the post-control-plane provider hook, per-group deployment
    /// waits with one-cycle zero tolerance, removal of vanished worker
    /// groups, optional AWS-IAM rotation, and the post-upgrade CNI-drift
    /// hook.
    pub async fn upgrade_workload_cluster(
        &self,
        management: &ClusterHandle,
        workload: &ClusterHandle,
        current: &Spec,
        new: &Spec,
        reconciler: &dyn ProviderReconciler,
    ) -> Result<()> {
        let cluster_name = new.name().to_string();

        if !cluster_spec_changed(current, new) {
            info!(cluster = %cluster_name, "cluster spec unchanged, nothing to upgrade");
            return Ok(());
        }

        let rendered = reconciler
            .render_for_upgrade(management, workload, current, new)
            .await
            .map_err(|e| e.with_phase("render"))?;

        if rendered.operation == Operation::NoChange {
            info!(cluster = %cluster_name, "no operation detected, nothing to upgrade");
            return Ok(());
        }
        info!(cluster = %cluster_name, operation = %rendered.operation, "upgrading workload cluster");

        reconciler
            .preflight(new, &rendered.operation)
            .await
            .map_err(|e| e.with_phase("preflight"))?;

        self.artifacts
            .write_capi_templates(&cluster_name, &rendered.control_plane, &rendered.workers)
            .map_err(|e| e.with_phase("writeTemplates"))?;

        self.client
            .apply(&rendered.control_plane)
            .await
            .map_err(|e| e.with_phase("applyControlPlane"))?;

        if new.cluster.spec.external_etcd.is_some() {
            wait::wait_for_external_etcd_ready(
                self.client.as_ref(),
                SYSTEM_NAMESPACE,
                &etcdadm_cluster_name(&cluster_name),
                self.timeouts.external_etcd_wait,
                &self.cancel,
            )
            .await
            .map_err(|e| e.with_phase("waitForExternalEtcd"))?;
        }

        if rendered.operation == Operation::VersionUpgrade {
            // Observe the roll start; never seeing it is tolerated (the roll
            // may complete between polls).
            wait::wait_for_control_plane_not_ready(
                self.client.as_ref(),
                SYSTEM_NAMESPACE,
                &cluster_name,
                self.timeouts.control_plane_not_ready_wait,
                &self.cancel,
            )
            .await
            .map_err(|e| e.with_phase("waitForControlPlaneNotReady"))?;
        }

        wait::wait_for_control_plane_available(
            self.client.as_ref(),
            SYSTEM_NAMESPACE,
            &cluster_name,
            self.timeouts.control_plane_wait,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("waitForControlPlane"))?;

        reconciler
            .run_post_control_plane_upgrade(new)
            .await
            .map_err(|e| e.with_phase("postControlPlaneUpgrade"))?;

        if !rendered.workers.is_empty() {
            self.client
                .apply(&rendered.workers)
                .await
                .map_err(|e| e.with_phase("applyWorkers"))?;
        }

        for group in &new.cluster.spec.worker_node_groups {
            wait::wait_for_deployment_ready(
                self.client.as_ref(),
                SYSTEM_NAMESPACE,
                &machine_deployment_name(&cluster_name, &group.name),
                self.timeouts.deployment_wait,
                &self.cancel,
            )
            .await
            .map_err(|e| e.with_phase("waitForMachineDeployments"))?;
        }

        self.remove_old_worker_groups(current, new)
            .await
            .map_err(|e| e.with_phase("removeOldWorkerGroups"))?;

        if new.aws_iam_config.is_some() {
            if let Some(aws_iam) = &self.aws_iam {
                aws_iam
                    .upgrade(workload, new)
                    .await
                    .map_err(|e| e.with_phase("upgradeAwsIamAuth"))?;
            }
        }

        reconciler
            .run_post_control_plane_upgrade_setup(new)
            .await
            .map_err(|e| e.with_phase("postUpgradeSetup"))?;

        let expected_machines = expected_machine_count(new);
        wait::wait_for_machines_ready(
            self.client.as_ref(),
            SYSTEM_NAMESPACE,
            &cluster_name,
            expected_machines,
            self.timeouts.machine_wait,
            self.timeouts.machine_backoff_min,
            self.timeouts.machine_backoff_max,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("waitForMachines"))?;

        info!(cluster = %cluster_name, "workload cluster upgraded");
        Ok(())
    }

    /// Delete MachineDeployments for worker groups no longer in the spec
    async fn remove_old_worker_groups(&self, current: &Spec, new: &Spec) -> Result<()> {
        let remaining: std::collections::BTreeSet<&str> = new
            .cluster
            .spec
            .worker_node_groups
            .iter()
            .map(|g| g.name.as_str())
            .collect();

        for group in &current.cluster.spec.worker_node_groups {
            if !remaining.contains(group.name.as_str()) {
                let md_name = machine_deployment_name(current.name(), &group.name);
                info!(deployment = %md_name, "removing worker group no longer in spec");
                self.client
                    .delete_machine_deployment(SYSTEM_NAMESPACE, &md_name)
                    .await?;
            }
        }
        Ok(())
    }

    /// Move CAPI ownership of a cluster between management clusters
    ///
    /// The move itself runs at most once; failure is fatal with no partial
    /// rollback.
    pub async fn move_capi(
        &self,
        from: &ClusterHandle,
        to: &ClusterHandle,
        cluster_name: &str,
    ) -> Result<()> {
        info!(cluster = %cluster_name, from = %from.name, to = %to.name, "moving capi management");

        // Snapshot the source so the destination can be re-validated.
        let source = self
            .clients
            .client_for(from)
            .await
            .map_err(|e| e.with_phase("snapshotSource"))?;
        let source_kcp = source
            .get_kubeadm_control_plane(SYSTEM_NAMESPACE, cluster_name)
            .await
            .map_err(|e| e.with_phase("snapshotSource"))?;
        let source_mds = source
            .list_machine_deployments(SYSTEM_NAMESPACE, cluster_name)
            .await
            .map_err(|e| e.with_phase("snapshotSource"))?;
        source
            .list_machines(SYSTEM_NAMESPACE, cluster_name)
            .await
            .map_err(|e| e.with_phase("snapshotSource"))?;
        source
            .list_capi_clusters(SYSTEM_NAMESPACE)
            .await
            .map_err(|e| e.with_phase("snapshotSource"))?;

        wait::wait_for_capi_cluster_ready(
            source.as_ref(),
            SYSTEM_NAMESPACE,
            cluster_name,
            self.timeouts.control_plane_wait,
            &self.cancel,
        )
        .await
        .map_err(|e| e.with_phase("waitForSourceReady"))?;

        // The external move runs exactly once. A failure here leaves the
        // resources wherever the mover left them; the operator recovers
        // forward, never by replaying the move.
        let runner = self.move_runner.clone();
        let from_kubeconfig = from.kubeconfig_path.clone();
        let to_kubeconfig = to.kubeconfig_path.clone();
        let output = tokio::task::spawn_blocking(move || {
            runner.run_move(from_kubeconfig, to_kubeconfig, SYSTEM_NAMESPACE)
        })
        .await
        .map_err(|e| Error::external(format!("move task failed: {e}")))?
        .map_err(|e| e.with_phase("moveManagement"))?;

        if !output.success {
            return Err(Error::external(format!(
                "moveManagement: capi move failed: {}",
                output.stderr
            )));
        }

        // Destination must observe the moved cluster and report it ready.
        let destination = self
            .clients
            .client_for(to)
            .await
            .map_err(|e| e.with_phase("validateDestination"))?;
        let moved = destination
            .list_capi_clusters(SYSTEM_NAMESPACE)
            .await
            .map_err(|e| e.with_phase("validateDestination"))?;
        for cluster in &moved {
            wait::wait_for_capi_cluster_ready(
                destination.as_ref(),
                SYSTEM_NAMESPACE,
                &cluster.metadata.name,
                self.timeouts.control_plane_wait,
                &self.cancel,
            )
            .await
            .map_err(|e| e.with_phase("waitForDestinationReady"))?;
        }

        let dest_kcp = destination
            .get_kubeadm_control_plane(SYSTEM_NAMESPACE, cluster_name)
            .await
            .map_err(|e| e.with_phase("validateDestination"))?;
        if let (Some(src), Some(dst)) = (&source_kcp, &dest_kcp) {
            if src.spec.replicas != dst.spec.replicas {
                return Err(Error::external(format!(
                    "validateDestination: control plane replicas changed during move: {:?} != {:?}",
                    src.spec.replicas, dst.spec.replicas
                )));
            }
        }
        for src_md in &source_mds {
            let dst_md = destination
                .get_machine_deployment(SYSTEM_NAMESPACE, &src_md.metadata.name)
                .await
                .map_err(|e| e.with_phase("validateDestination"))?;
            match dst_md {
                Some(dst) if dst.spec.replicas == src_md.spec.replicas => {}
                Some(dst) => {
                    return Err(Error::external(format!(
                        "validateDestination: {} replicas changed during move: {:?} != {:?}",
                        src_md.metadata.name, src_md.spec.replicas, dst.spec.replicas
                    )));
                }
                None => {
                    return Err(Error::external(format!(
                        "validateDestination: {} missing on destination",
                        src_md.metadata.name
                    )));
                }
            }
        }

        info!(cluster = %cluster_name, "capi move complete");
        Ok(())
    }

    /// Dump all CAPI-scoped resources into a timestamped backup directory
    pub async fn backup_capi(
        &self,
        cluster: &ClusterHandle,
        at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let client = self
            .clients
            .client_for(cluster)
            .await
            .map_err(|e| e.with_phase("backup"))?;
        let dir = self.artifacts.backup_dir(at);

        for resource in [
            CAPI_CLUSTER,
            KUBEADM_CONTROL_PLANE,
            MACHINE_DEPLOYMENT,
            MACHINE,
            ETCDADM_CLUSTER,
        ] {
            let objects = client
                .list_raw(resource, SYSTEM_NAMESPACE)
                .await
                .map_err(|e| e.with_phase("backup"))?;
            let rendered = serde_yaml::to_string(&objects)
                .map_err(|e| Error::serialization(format!("backup: serializing {}: {e}", resource.kind)))?;
            self.artifacts
                .write_backup_file(&dir, resource.plural, rendered.as_bytes())
                .map_err(|e| e.with_phase("backup"))?;
        }

        info!(cluster = %cluster.name, dir = %dir.display(), "capi state backed up");
        Ok(dir)
    }

    /// Delete a cluster
    ///
    /// Managed clusters: pause reconciliation, delete the cluster object,
    /// then tear down the CAPI cluster. Self-managed clusters: tear down
    /// CAPI and run the provider's post-delete validation.
    pub async fn delete_cluster(
        &self,
        spec: &Spec,
        reconciler: &dyn ProviderReconciler,
    ) -> Result<()> {
        let cluster_name = spec.name().to_string();
        let namespace = Self::cluster_namespace(spec);
        info!(cluster = %cluster_name, managed = spec.is_managed(), "deleting cluster");

        if spec.is_managed() {
            self.pause_cluster_reconcile(spec)
                .await
                .map_err(|e| e.with_phase("pauseReconcile"))?;

            self.client
                .delete_cluster(&namespace, &cluster_name)
                .await
                .map_err(|e| e.with_phase("deleteClusterObject"))?;

            self.client
                .delete_capi_cluster(SYSTEM_NAMESPACE, &cluster_name)
                .await
                .map_err(|e| e.with_phase("deleteCapiCluster"))?;
        } else {
            self.client
                .delete_capi_cluster(SYSTEM_NAMESPACE, &cluster_name)
                .await
                .map_err(|e| e.with_phase("deleteCapiCluster"))?;

            reconciler
                .post_cluster_delete_validate(spec)
                .await
                .map_err(|e| e.with_phase("postClusterDeleteValidate"))?;
        }

        info!(cluster = %cluster_name, "cluster deleted");
        Ok(())
    }

    /// Pause controller reconciliation
    ///
    /// A management cluster pages through every cluster it manages and
    /// pauses each; a workload cluster pauses only itself. Idempotent.
    pub async fn pause_cluster_reconcile(&self, spec: &Spec) -> Result<()> {
        let namespace = Self::cluster_namespace(spec);
        let annotations = BTreeMap::from([
            (PAUSED_ANNOTATION.to_string(), "true".to_string()),
            (MANAGED_BY_CLI_ANNOTATION.to_string(), "true".to_string()),
        ]);

        if spec.is_managed() {
            self.client
                .annotate_cluster(&namespace, spec.name(), annotations)
                .await?;
            info!(cluster = %spec.name(), "reconciliation paused");
            return Ok(());
        }

        // Management cluster: pause the whole fleet it manages, itself
        // included.
        let mut continue_token = None;
        loop {
            let (clusters, next) = self
                .client
                .list_clusters(&namespace, CLUSTER_PAGE_SIZE, continue_token)
                .await?;
            for cluster in &clusters {
                if !self.manages(spec, cluster) {
                    continue;
                }
                self.client
                    .annotate_cluster(&namespace, &cluster.spec.name, annotations.clone())
                    .await?;
                debug!(cluster = %cluster.spec.name, "reconciliation paused");
            }
            match next {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }
        info!(cluster = %spec.name(), "fleet reconciliation paused");
        Ok(())
    }

    /// Resume controller reconciliation; symmetric to pause and idempotent
    pub async fn resume_cluster_reconcile(&self, spec: &Spec) -> Result<()> {
        let namespace = Self::cluster_namespace(spec);

        if spec.is_managed() {
            self.remove_pause_annotations(&namespace, spec.name()).await?;
            info!(cluster = %spec.name(), "reconciliation resumed");
            return Ok(());
        }

        let mut continue_token = None;
        loop {
            let (clusters, next) = self
                .client
                .list_clusters(&namespace, CLUSTER_PAGE_SIZE, continue_token)
                .await?;
            for cluster in &clusters {
                if !self.manages(spec, cluster) {
                    continue;
                }
                self.remove_pause_annotations(&namespace, &cluster.spec.name)
                    .await?;
                debug!(cluster = %cluster.spec.name, "reconciliation resumed");
            }
            match next {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }
        info!(cluster = %spec.name(), "fleet reconciliation resumed");
        Ok(())
    }

    fn manages(&self, management: &Spec, cluster: &crate::spec::Cluster) -> bool {
        cluster.spec.name == management.name()
            || cluster
                .spec
                .management_cluster
                .as_ref()
                .is_some_and(|m| m.name == management.name())
    }

    async fn remove_pause_annotations(&self, namespace: &str, name: &str) -> Result<()> {
        self.client
            .remove_cluster_annotation(namespace, name, PAUSED_ANNOTATION)
            .await?;
        self.client
            .remove_cluster_annotation(namespace, name, MANAGED_BY_CLI_ANNOTATION)
            .await
    }

    /// Render and apply machine health checks for the control plane and each
    /// worker group
    pub async fn install_machine_health_checks(&self, spec: &Spec) -> Result<()> {
        let cluster_name = spec.name();
        let mut docs = vec![health_check_manifest(
            cluster_name,
            &format!("{cluster_name}-kcp-unhealthy"),
            serde_json::json!({ "cluster.x-k8s.io/control-plane": "" }),
            &self.timeouts,
        )];
        for group in &spec.cluster.spec.worker_node_groups {
            let md_name = machine_deployment_name(cluster_name, &group.name);
            docs.push(health_check_manifest(
                cluster_name,
                &format!("{md_name}-worker-unhealthy"),
                serde_json::json!({ "cluster.x-k8s.io/deployment-name": md_name }),
                &self.timeouts,
            ));
        }

        let bytes = crate::manifest::to_yaml_stream(&docs)?;
        self.client
            .apply(&bytes)
            .await
            .map_err(|e| e.with_phase("installMachineHealthChecks"))
    }
}

/// Expected machine count for readiness polling: control plane plus workers
fn expected_machine_count(spec: &Spec) -> usize {
    let workers: i32 = spec
        .cluster
        .spec
        .worker_node_groups
        .iter()
        .map(|g| g.replicas())
        .sum();
    (spec.cluster.spec.control_plane.count + workers).max(0) as usize
}

/// Kubernetes duration string for MHC fields
fn k8s_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

fn health_check_manifest(
    cluster_name: &str,
    name: &str,
    match_labels: serde_json::Value,
    timeouts: &Timeouts,
) -> Manifest {
    Manifest::new(
        "cluster.x-k8s.io/v1beta1",
        "MachineHealthCheck",
        name,
        SYSTEM_NAMESPACE,
    )
    .with_spec(serde_json::json!({
        "clusterName": cluster_name,
        "maxUnhealthy": "100%",
        "nodeStartupTimeout": k8s_duration(timeouts.node_startup),
        "selector": { "matchLabels": match_labels },
        "unhealthyConditions": [
            {
                "type": "Ready",
                "status": "Unknown",
                "timeout": k8s_duration(timeouts.unhealthy_machine),
            },
            {
                "type": "Ready",
                "status": "False",
                "timeout": k8s_duration(timeouts.unhealthy_machine),
            },
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::{Condition, KubeadmControlPlane, KubeadmControlPlaneStatus};
    use crate::client::MockClusterClient;
    use crate::provider::test_fixtures::docker_spec;
    use crate::provider::DockerReconciler;
    use crate::spec::ManagementClusterRef;
    use crate::template::names::fixed_now;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now_fn() -> crate::template::NowFn {
        fixed_now(Utc.timestamp_opt(1_680_000_000, 0).unwrap())
    }

    fn available_kcp() -> KubeadmControlPlane {
        KubeadmControlPlane {
            status: KubeadmControlPlaneStatus {
                conditions: vec![Condition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    message: String::new(),
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ready_machines(count: usize) -> Vec<crate::capi::Machine> {
        (0..count)
            .map(|i| crate::capi::Machine {
                metadata: crate::capi::MetadataView {
                    name: format!("machine-{i}"),
                    ..Default::default()
                },
                status: crate::capi::MachineStatus {
                    node_ref: Some(crate::capi::ObjectRef {
                        kind: "Node".to_string(),
                        name: format!("node-{i}"),
                    }),
                    conditions: vec![Condition {
                        type_: "NodeHealthy".to_string(),
                        status: "True".to_string(),
                        message: String::new(),
                    }],
                },
            })
            .collect()
    }

    fn orchestrator(
        client: MockClusterClient,
        registry: MockClientRegistry,
        tmp: &std::path::Path,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::new(client),
            Arc::new(registry),
            Arc::new(NoopNetworking),
            Arc::new(MockMoveRunner::new()),
            ArtifactWriter::new(tmp),
        )
        .with_timeouts(Timeouts {
            machine_backoff_min: Duration::from_millis(1),
            machine_backoff_max: Duration::from_millis(5),
            ..Timeouts::default()
        })
    }

    // ==========================================================================
    // Story: Create Workload Cluster
    // ==========================================================================

    #[tokio::test]
    async fn story_create_applies_templates_then_waits_then_installs_networking() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("w0", "1.23", 1, &[("md-0", 2)]);

        let mut client = MockClusterClient::new();
        let applies = Arc::new(AtomicU32::new(0));
        let a = applies.clone();
        client.expect_apply().returning(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        client
            .expect_get_kubeadm_control_plane()
            .returning(|_, _| Ok(Some(available_kcp())));
        client
            .expect_get_kubeconfig()
            .returning(|_, _| Ok(Some(b"apiVersion: v1\nkind: Config\n".to_vec())));
        client
            .expect_list_machines()
            .returning(|_, _| Ok(ready_machines(3)));

        let registry = MockClientRegistry::new();
        let orchestrator = orchestrator(client, registry, tmp.path());

        let reconciler = DockerReconciler::new(Arc::new(MockClusterClient::new()), now_fn());
        let workload = orchestrator
            .create_workload_cluster(&spec, &reconciler)
            .await
            .unwrap();

        // Control plane and workers both applied
        assert_eq!(applies.load(Ordering::SeqCst), 2);
        // Kubeconfig written at the persisted-state layout path
        assert_eq!(
            workload.kubeconfig_path.as_ref().unwrap(),
            &tmp.path().join("w0/w0-eks-a-cluster.kubeconfig")
        );
        assert!(workload.kubeconfig_path.as_ref().unwrap().exists());
        // Rendered templates written for support
        assert!(tmp.path().join("w0/generated/w0-control-plane.yaml").exists());
    }

    #[tokio::test]
    async fn story_create_fails_with_phase_name_when_apply_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("w0", "1.23", 1, &[("md-0", 2)]);

        let mut client = MockClusterClient::new();
        client
            .expect_apply()
            .returning(|_| Err(Error::external("webhook denied the request")));

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        let reconciler = DockerReconciler::new(Arc::new(MockClusterClient::new()), now_fn());

        let err = orchestrator
            .create_workload_cluster(&spec, &reconciler)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("applyControlPlane"));
        assert_eq!(err.category(), crate::ErrorCategory::External);
    }

    // ==========================================================================
    // Story: Upgrade
    // ==========================================================================

    #[tokio::test]
    async fn story_upgrade_is_noop_when_spec_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("w0", "1.23", 1, &[("md-0", 2)]);

        // No client expectations: nothing may be called.
        let orchestrator =
            orchestrator(MockClusterClient::new(), MockClientRegistry::new(), tmp.path());
        let reconciler = DockerReconciler::new(Arc::new(MockClusterClient::new()), now_fn());

        orchestrator
            .upgrade_workload_cluster(
                &ClusterHandle::new("mgmt"),
                &ClusterHandle::new("w0"),
                &spec,
                &spec,
                &reconciler,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_upgrade_removes_vanished_worker_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let current = docker_spec("w0", "1.23", 1, &[("md-0", 2), ("md-legacy", 1)]);
        let new = docker_spec("w0", "1.24", 1, &[("md-0", 2)]);

        // Reconciler-side state reads: no KCP -> NewCluster render path
        // without preserved names.
        let mut reconciler_client = MockClusterClient::new();
        reconciler_client
            .expect_get_kubeadm_control_plane()
            .returning(|_, _| Ok(None));
        reconciler_client
            .expect_get_machine_deployment()
            .returning(|_, _| Ok(None));

        let mut client = MockClusterClient::new();
        client.expect_apply().returning(|_| Ok(()));
        client
            .expect_get_kubeadm_control_plane()
            .returning(|_, _| Ok(Some(available_kcp())));
        client.expect_get_machine_deployment().returning(|_, name| {
            Ok(Some(crate::capi::MachineDeployment {
                metadata: crate::capi::MetadataView {
                    name: name.to_string(),
                    ..Default::default()
                },
                spec: crate::capi::MachineDeploymentSpec {
                    replicas: Some(2),
                    ..Default::default()
                },
                status: crate::capi::MachineDeploymentStatus {
                    replicas: Some(2),
                    ready_replicas: Some(2),
                },
            }))
        });
        client
            .expect_delete_machine_deployment()
            .with(eq(SYSTEM_NAMESPACE), eq("w0-md-legacy"))
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_list_machines()
            .returning(|_, _| Ok(ready_machines(3)));

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        let reconciler = DockerReconciler::new(Arc::new(reconciler_client), now_fn());

        orchestrator
            .upgrade_workload_cluster(
                &ClusterHandle::new("mgmt"),
                &ClusterHandle::new("w0"),
                &current,
                &new,
                &reconciler,
            )
            .await
            .unwrap();
    }

    // ==========================================================================
    // Story: Pause / Resume
    // ==========================================================================

    #[tokio::test]
    async fn story_pause_workload_cluster_annotates_itself_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = docker_spec("w0", "1.23", 1, &[]);
        spec.cluster.spec.management_cluster = Some(ManagementClusterRef {
            name: "mgmt".to_string(),
        });

        let mut client = MockClusterClient::new();
        client
            .expect_annotate_cluster()
            .withf(|_, name, annotations| {
                name == "w0"
                    && annotations.get(PAUSED_ANNOTATION) == Some(&"true".to_string())
                    && annotations.get(MANAGED_BY_CLI_ANNOTATION) == Some(&"true".to_string())
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        orchestrator.pause_cluster_reconcile(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn story_pause_management_cluster_pages_through_fleet() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("mgmt", "1.23", 1, &[]);

        let mut client = MockClusterClient::new();

        // Two pages: first returns a continue token, second ends the listing.
        let mut w1 = docker_spec("w1", "1.23", 1, &[]).cluster;
        w1.spec.management_cluster = Some(ManagementClusterRef {
            name: "mgmt".to_string(),
        });
        let mgmt = docker_spec("mgmt", "1.23", 1, &[]).cluster;
        let mut w2 = docker_spec("w2", "1.23", 1, &[]).cluster;
        w2.spec.management_cluster = Some(ManagementClusterRef {
            name: "mgmt".to_string(),
        });
        // A cluster managed elsewhere is left alone.
        let mut other = docker_spec("other", "1.23", 1, &[]).cluster;
        other.spec.management_cluster = Some(ManagementClusterRef {
            name: "someone-else".to_string(),
        });

        let page_one = vec![mgmt, w1];
        let page_two = vec![w2, other];
        client
            .expect_list_clusters()
            .returning(move |_, _, token| match token {
                None => Ok((page_one.clone(), Some("page-2".to_string()))),
                Some(_) => Ok((page_two.clone(), None)),
            });

        let annotated = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = annotated.clone();
        client.expect_annotate_cluster().returning(move |_, name, _| {
            a.lock().unwrap().push(name.to_string());
            Ok(())
        });

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        orchestrator.pause_cluster_reconcile(&spec).await.unwrap();

        let annotated = annotated.lock().unwrap();
        assert_eq!(annotated.as_slice(), ["mgmt", "w1", "w2"]);
    }

    #[tokio::test]
    async fn story_resume_removes_both_annotations() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = docker_spec("w0", "1.23", 1, &[]);
        spec.cluster.spec.management_cluster = Some(ManagementClusterRef {
            name: "mgmt".to_string(),
        });

        let removed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = removed.clone();

        let mut client = MockClusterClient::new();
        client
            .expect_remove_cluster_annotation()
            .returning(move |_, name, key| {
                r.lock().unwrap().push((name.to_string(), key.to_string()));
                Ok(())
            });

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        orchestrator.resume_cluster_reconcile(&spec).await.unwrap();

        let removed = removed.lock().unwrap();
        assert!(removed.contains(&("w0".to_string(), PAUSED_ANNOTATION.to_string())));
        assert!(removed.contains(&("w0".to_string(), MANAGED_BY_CLI_ANNOTATION.to_string())));
    }

    // ==========================================================================
    // Story: Move
    // ==========================================================================

    fn move_source_client() -> MockClusterClient {
        let mut source = MockClusterClient::new();
        source
            .expect_get_kubeadm_control_plane()
            .returning(|_, _| Ok(Some(available_kcp())));
        source
            .expect_list_machine_deployments()
            .returning(|_, _| Ok(Vec::new()));
        source.expect_list_machines().returning(|_, _| Ok(Vec::new()));
        source.expect_list_capi_clusters().returning(|_| {
            Ok(vec![crate::capi::CapiCluster {
                metadata: crate::capi::MetadataView {
                    name: "w0".to_string(),
                    ..Default::default()
                },
                status: crate::capi::CapiClusterStatus {
                    conditions: vec![Condition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        message: String::new(),
                    }],
                },
            }])
        });
        source.expect_get_capi_cluster().returning(|_, _| {
            Ok(Some(crate::capi::CapiCluster {
                metadata: crate::capi::MetadataView {
                    name: "w0".to_string(),
                    ..Default::default()
                },
                status: crate::capi::CapiClusterStatus {
                    conditions: vec![Condition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        message: String::new(),
                    }],
                },
            }))
        });
        source
    }

    #[tokio::test]
    async fn story_move_runs_external_move_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();

        let mut registry = MockClientRegistry::new();
        registry.expect_client_for().returning(|_| {
            let client: Arc<dyn ClusterClient> = Arc::new(move_source_client());
            Ok(client)
        });

        let mut runner = MockMoveRunner::new();
        runner
            .expect_run_move()
            .times(1)
            .returning(|_, _, _| {
                Ok(CommandOutput {
                    success: true,
                    stdout: "Moving Cluster w0".to_string(),
                    stderr: String::new(),
                })
            });

        let orchestrator = Orchestrator::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(registry),
            Arc::new(NoopNetworking),
            Arc::new(runner),
            ArtifactWriter::new(tmp.path()),
        );

        orchestrator
            .move_capi(
                &ClusterHandle::new("bootstrap"),
                &ClusterHandle::new("w0"),
                "w0",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_move_failure_is_fatal_external() {
        let tmp = tempfile::tempdir().unwrap();

        let mut registry = MockClientRegistry::new();
        registry.expect_client_for().returning(|_| {
            let client: Arc<dyn ClusterClient> = Arc::new(move_source_client());
            Ok(client)
        });

        let mut runner = MockMoveRunner::new();
        runner.expect_run_move().times(1).returning(|_, _, _| {
            Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: "connection refused".to_string(),
            })
        });

        let orchestrator = Orchestrator::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(registry),
            Arc::new(NoopNetworking),
            Arc::new(runner),
            ArtifactWriter::new(tmp.path()),
        );

        let err = orchestrator
            .move_capi(
                &ClusterHandle::new("bootstrap"),
                &ClusterHandle::new("w0"),
                "w0",
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::External);
        assert!(err.to_string().contains("connection refused"));
    }

    // ==========================================================================
    // Story: Backup and Delete
    // ==========================================================================

    #[tokio::test]
    async fn story_backup_writes_one_file_per_resource_kind() {
        let tmp = tempfile::tempdir().unwrap();

        let mut registry = MockClientRegistry::new();
        registry.expect_client_for().returning(|_| {
            let mut client = MockClusterClient::new();
            client.expect_list_raw().returning(|_, _| Ok(Vec::new()));
            let client: Arc<dyn ClusterClient> = Arc::new(client);
            Ok(client)
        });

        let orchestrator = Orchestrator::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(registry),
            Arc::new(NoopNetworking),
            Arc::new(MockMoveRunner::new()),
            ArtifactWriter::new(tmp.path()),
        );

        let at = Utc.with_ymd_and_hms(2023, 3, 28, 12, 0, 0).unwrap();
        let dir = orchestrator
            .backup_capi(&ClusterHandle::new("mgmt"), at)
            .await
            .unwrap();

        assert!(dir.ends_with("cluster-state-backup-2023-03-28T12:00:00Z"));
        for file in [
            "clusters.yaml",
            "kubeadmcontrolplanes.yaml",
            "machinedeployments.yaml",
            "machines.yaml",
            "etcdadmclusters.yaml",
        ] {
            assert!(dir.join(file).exists(), "missing backup file {file}");
        }
    }

    #[tokio::test]
    async fn story_delete_managed_cluster_pauses_before_deleting() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = docker_spec("w0", "1.23", 1, &[]);
        spec.cluster.spec.management_cluster = Some(ManagementClusterRef {
            name: "mgmt".to_string(),
        });

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut client = MockClusterClient::new();
        let o = order.clone();
        client.expect_annotate_cluster().returning(move |_, _, _| {
            o.lock().unwrap().push("pause");
            Ok(())
        });
        let o = order.clone();
        client.expect_delete_cluster().returning(move |_, _| {
            o.lock().unwrap().push("deleteClusterObject");
            Ok(())
        });
        let o = order.clone();
        client.expect_delete_capi_cluster().returning(move |_, _| {
            o.lock().unwrap().push("deleteCapiCluster");
            Ok(())
        });

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        let reconciler = DockerReconciler::new(Arc::new(MockClusterClient::new()), now_fn());

        orchestrator.delete_cluster(&spec, &reconciler).await.unwrap();

        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["pause", "deleteClusterObject", "deleteCapiCluster"]
        );
    }

    #[tokio::test]
    async fn story_delete_self_managed_runs_post_delete_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("mgmt", "1.23", 1, &[]);

        let mut client = MockClusterClient::new();
        client
            .expect_delete_capi_cluster()
            .times(1)
            .returning(|_, _| Ok(()));

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        let reconciler = DockerReconciler::new(Arc::new(MockClusterClient::new()), now_fn());

        orchestrator.delete_cluster(&spec, &reconciler).await.unwrap();
    }

    // ==========================================================================
    // Machine health checks
    // ==========================================================================

    #[tokio::test]
    async fn test_machine_health_checks_rendered_per_group() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = docker_spec("w0", "1.23", 1, &[("md-0", 2)]);

        let mut client = MockClusterClient::new();
        client
            .expect_apply()
            .withf(|bytes| {
                let docs = crate::manifest::parse_yaml_stream(bytes).unwrap();
                docs.len() == 2
                    && docs.iter().all(|d| d.kind == "MachineHealthCheck")
                    && docs.iter().any(|d| d.metadata.name == "w0-kcp-unhealthy")
                    && docs
                        .iter()
                        .any(|d| d.metadata.name == "w0-md-0-worker-unhealthy")
                    && docs[0].spec.as_ref().unwrap()["nodeStartupTimeout"] == "1200s"
                    && docs[0].spec.as_ref().unwrap()["unhealthyConditions"][0]["timeout"]
                        == "600s"
            })
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(client, MockClientRegistry::new(), tmp.path());
        orchestrator.install_machine_health_checks(&spec).await.unwrap();
    }

    #[test]
    fn test_no_timeouts_pins_maximum_durations() {
        let timeouts = Timeouts::default().without_machine_health_timeouts();
        assert_eq!(timeouts.unhealthy_machine, Duration::MAX);
        assert_eq!(timeouts.node_startup, Duration::MAX);
    }

    #[test]
    fn test_cluster_spec_changed_detects_bundle_change() {
        let a = docker_spec("w0", "1.23", 1, &[("md-0", 2)]);
        let mut b = a.clone();
        assert!(!cluster_spec_changed(&a, &b));

        b.bundle.kube_distro.kubernetes.tag = "v1.24.1".to_string();
        assert!(cluster_spec_changed(&a, &b));
    }

    #[test]
    fn test_expected_machine_count_excludes_etcd() {
        let mut spec = docker_spec("w0", "1.23", 3, &[("md-0", 2), ("md-1", 1)]);
        assert_eq!(expected_machine_count(&spec), 6);

        spec.cluster.spec.external_etcd = Some(crate::spec::ExternalEtcdConfig {
            count: 3,
            machine_group_ref: crate::spec::Ref::new("MachineConfig", "cp"),
        });
        assert_eq!(expected_machine_count(&spec), 6);
    }
}
