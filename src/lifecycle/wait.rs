//! Bounded wait loops over CAPI resources
//!
//! Every wait yields between polls, accepts a cancellation token, and is
//! bounded by a wall-clock timeout. Transient read errors inside a wait are
//! tolerated until the bound; fatal conditions (an unhealthy node, a BMC
//! refusing auth) fail fast.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::{Error, Result};

/// Fixed poll interval for condition waits
const POLL_INTERVAL: Duration = Duration::from_secs(10);

async fn sleep_or_cancel(interval: Duration, cancel: &CancellationToken, what: &str) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(format!("{what} cancelled"))),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Wait for the KubeadmControlPlane to report Available
pub async fn wait_for_control_plane_available(
    client: &dyn ClusterClient,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        match client
            .get_kubeadm_control_plane(namespace, cluster_name)
            .await
        {
            Ok(Some(kcp)) if kcp.is_available() => {
                info!(cluster = %cluster_name, "control plane available");
                return Ok(());
            }
            Ok(_) => debug!(cluster = %cluster_name, "control plane not yet available"),
            Err(e) if e.is_transient() => {
                warn!(cluster = %cluster_name, error = %e, "transient error waiting for control plane")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for control plane of {cluster_name} to become available"
            )));
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForControlPlane").await?;
    }
}

/// Observe the start of a control plane roll
///
/// Returns `Ok(true)` once the control plane is seen not-ready, `Ok(false)`
/// when the bound elapses without observing it (the roll may have completed
/// between polls; that is not a failure).
pub async fn wait_for_control_plane_not_ready(
    client: &dyn ClusterClient,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let start = tokio::time::Instant::now();
    loop {
        match client
            .get_kubeadm_control_plane(namespace, cluster_name)
            .await
        {
            Ok(Some(kcp)) if !kcp.is_ready() => {
                debug!(cluster = %cluster_name, "observed control plane roll start");
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!(cluster = %cluster_name, error = %e, "transient error observing roll start")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            debug!(cluster = %cluster_name, "control plane never observed not-ready; continuing");
            return Ok(false);
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForControlPlaneNotReady").await?;
    }
}

/// Wait for the managed external etcd cluster to report ready
pub async fn wait_for_external_etcd_ready(
    client: &dyn ClusterClient,
    namespace: &str,
    etcd_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        match client.get_etcdadm_cluster(namespace, etcd_name).await {
            Ok(Some(etcd)) if etcd.status.ready => {
                info!(etcd = %etcd_name, "external etcd ready");
                return Ok(());
            }
            Ok(_) => debug!(etcd = %etcd_name, "external etcd not yet ready"),
            Err(e) if e.is_transient() => {
                warn!(etcd = %etcd_name, error = %e, "transient error waiting for external etcd")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::external(format!(
                "timed out waiting for external etcd {etcd_name} to become ready"
            )));
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForExternalEtcd").await?;
    }
}

/// Wait for a CAPI Cluster to report Ready=True
pub async fn wait_for_capi_cluster_ready(
    client: &dyn ClusterClient,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        match client.get_capi_cluster(namespace, cluster_name).await {
            Ok(Some(cluster)) if cluster.is_ready() => {
                info!(cluster = %cluster_name, "capi cluster ready");
                return Ok(());
            }
            Ok(_) => debug!(cluster = %cluster_name, "capi cluster not yet ready"),
            Err(e) if e.is_transient() => {
                warn!(cluster = %cluster_name, error = %e, "transient error waiting for capi cluster")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for cluster {cluster_name} to become ready"
            )));
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForClusterReady").await?;
    }
}

/// Wait for all of a MachineDeployment's replicas to report ready
///
/// A transient 0-of-N reading is tolerated for one cycle (controllers
/// briefly report zero while rotating status); a second consecutive zero
/// after replicas were expected fails the wait.
pub async fn wait_for_deployment_ready(
    client: &dyn ClusterClient,
    namespace: &str,
    md_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let mut consecutive_zero = 0u32;

    loop {
        match client.get_machine_deployment(namespace, md_name).await {
            Ok(Some(md)) => {
                let desired = md.spec.replicas.unwrap_or(0);
                let ready = md.status.ready_replicas.unwrap_or(0);

                if desired == 0 || ready >= desired {
                    info!(deployment = %md_name, ready, desired, "machine deployment ready");
                    return Ok(());
                }

                if ready == 0 {
                    consecutive_zero += 1;
                    if consecutive_zero > 1 {
                        return Err(Error::transient(format!(
                            "machine deployment {md_name} reports 0 of {desired} replicas ready"
                        )));
                    }
                    debug!(deployment = %md_name, "tolerating transient 0-ready reading");
                } else {
                    consecutive_zero = 0;
                    debug!(deployment = %md_name, ready, desired, "machine deployment not yet ready");
                }
            }
            Ok(None) => debug!(deployment = %md_name, "machine deployment not found yet"),
            Err(e) if e.is_transient() => {
                warn!(deployment = %md_name, error = %e, "transient error waiting for deployment")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for machine deployment {md_name}"
            )));
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForDeployment").await?;
    }
}

/// Poll machines until every expected machine has a NodeRef and a healthy
/// node
///
/// Fails fast when any machine reports NodeHealthy=False; retries transient
/// errors and empty machine lists with backoff between `backoff_min` and
/// `backoff_max` until the ceiling.
pub async fn wait_for_machines_ready(
    client: &dyn ClusterClient,
    namespace: &str,
    cluster_name: &str,
    expected: usize,
    timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let mut delay = backoff_min;

    loop {
        match client.list_machines(namespace, cluster_name).await {
            Ok(machines) if !machines.is_empty() => {
                // Fail fast on an explicitly unhealthy node.
                for machine in &machines {
                    if let Some(condition) = machine.node_healthy() {
                        if condition.status == "False" {
                            return Err(Error::transient(format!(
                                "machine {} reports unhealthy node: {}",
                                machine.metadata.name, condition.message
                            )));
                        }
                    }
                }

                let ready = machines
                    .iter()
                    .filter(|m| {
                        m.has_node_ref()
                            && m.node_healthy().is_some_and(|c| c.status == "True")
                    })
                    .count();

                if ready >= expected && machines.len() >= expected {
                    info!(cluster = %cluster_name, ready, expected, "all machines ready");
                    return Ok(());
                }
                debug!(cluster = %cluster_name, ready, expected, "machines not yet ready");
            }
            Ok(_) => debug!(cluster = %cluster_name, "no machines reported yet"),
            Err(e) if e.is_transient() => {
                warn!(cluster = %cluster_name, error = %e, "transient error listing machines")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for machines of {cluster_name} to become ready"
            )));
        }

        sleep_or_cancel(delay, cancel, "waitForMachines").await?;
        delay = (delay * 2).min(backoff_max);
    }
}

/// Wait for the workload kubeconfig secret to appear and return its bytes
pub async fn wait_for_kubeconfig(
    client: &dyn ClusterClient,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let start = tokio::time::Instant::now();
    loop {
        match client.get_kubeconfig(namespace, cluster_name).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => debug!(cluster = %cluster_name, "kubeconfig secret not present yet"),
            Err(e) if e.is_transient() => {
                warn!(cluster = %cluster_name, error = %e, "transient error fetching kubeconfig")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for kubeconfig of {cluster_name}"
            )));
        }
        sleep_or_cancel(POLL_INTERVAL, cancel, "waitForKubeconfig").await?;
    }
}
