//! Reconcile shell: single-flight per cluster, dispatch by provider kind
//!
//! Runs inside a controller-manager process. Each cluster object is
//! reconciled by at most one task at a time; reconciles queued behind a
//! running one collapse (the requeued attempt observes the latest desired
//! state). The first fatal error of a reconcile is written to
//! `status.FailureMessage` exactly once; transient errors requeue with
//! backoff and never touch status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ClusterClient;
use crate::lifecycle::{MANAGED_BY_CLI_ANNOTATION, PAUSED_ANNOTATION};
use crate::provider::Operation;
use crate::registry::ReconcilerRegistry;
use crate::spec::{Cluster, Spec};
use crate::{ClusterHandle, Error, ErrorCategory, Result};

/// Requeue interval after a successful reconcile
const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Requeue interval when a reconcile collapses behind a running one
const COLLAPSE_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves a cluster object into a full spec model
///
/// Resolution reads the referenced datacenter config, machine configs, and
/// versions bundle. Trait-shaped so the reconcile shell can be exercised
/// without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpecResolver: Send + Sync {
    /// Build the desired spec model for a cluster object
    async fn resolve(&self, cluster: &Cluster) -> Result<Spec>;

    /// Build the last-applied spec model, when one is recorded
    async fn resolve_current(&self, cluster: &Cluster) -> Result<Option<Spec>>;
}

/// Shared context for the reconcile shell
pub struct Context {
    /// Management cluster client
    pub client: Arc<dyn ClusterClient>,
    /// Provider dispatch table
    pub registry: Arc<ReconcilerRegistry>,
    /// Spec resolution
    pub resolver: Arc<dyn SpecResolver>,
    /// Per-cluster serialization locks
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Context {
    /// Create a reconcile context
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: Arc<ReconcilerRegistry>,
        resolver: Arc<dyn SpecResolver>,
    ) -> Self {
        Self {
            client,
            registry,
            resolver,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Whether the cluster carries either pause annotation
fn is_paused(cluster: &Cluster) -> bool {
    cluster.metadata.annotations.as_ref().is_some_and(|a| {
        a.get(PAUSED_ANNOTATION).map(String::as_str) == Some("true")
            || a.get(MANAGED_BY_CLI_ANNOTATION).map(String::as_str) == Some("true")
    })
}

/// Reconcile one cluster object
///
/// Observes current state through the provider reconciler, applies the
/// rendered documents, and surfaces the first fatal error on status.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    if is_paused(&cluster) {
        debug!("cluster reconciliation is paused");
        return Ok(Action::await_change());
    }

    // Single-flight: a reconcile already running for this cluster makes this
    // one collapse into a short requeue; the requeued attempt reads the
    // latest desired state.
    let lock = ctx.lock_for(&name);
    let Ok(_guard) = lock.try_lock() else {
        debug!("reconcile already in flight, collapsing");
        return Ok(Action::requeue(COLLAPSE_INTERVAL));
    };

    info!("reconciling cluster");

    match run_reconcile(&cluster, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_transient() => {
            warn!(error = %e, "transient reconcile failure, requeueing");
            Err(e)
        }
        Err(e) => {
            // One FailureMessage write per reconcile, from the first fatal
            // error seen.
            error!(error = %e, "fatal reconcile failure");
            if let Err(patch_err) = ctx
                .client
                .set_failure_message(&namespace, &name, &e.to_string())
                .await
            {
                warn!(error = %patch_err, "failed to write failure message");
            }
            match e.category() {
                // User must edit the spec; do not requeue.
                ErrorCategory::Validation | ErrorCategory::Policy => Ok(Action::await_change()),
                // Retried at the next reconcile tick.
                _ => Ok(Action::requeue(SYNC_INTERVAL)),
            }
        }
    }
}

async fn run_reconcile(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let spec = ctx.resolver.resolve(cluster).await?;
    let kind = spec.datacenter.kind();

    let Some(reconciler) = ctx.registry.get(kind) else {
        // Forward-compatible: a kind this process is not wired for is
        // skipped, not failed.
        return Ok(Action::await_change());
    };

    let current = ctx
        .resolver
        .resolve_current(cluster)
        .await?
        .unwrap_or_else(|| spec.clone());

    let handle = ClusterHandle::new(spec.name());
    let rendered = reconciler
        .render_for_upgrade(&handle, &handle, &current, &spec)
        .await?;

    if rendered.operation == Operation::NoChange {
        debug!("no operation detected");
        return Ok(Action::requeue(SYNC_INTERVAL));
    }

    info!(operation = %rendered.operation, "applying rendered cluster state");
    reconciler.preflight(&spec, &rendered.operation).await?;

    ctx.client.apply(&rendered.control_plane).await?;
    if !rendered.workers.is_empty() {
        ctx.client.apply(&rendered.workers).await?;
    }

    Ok(Action::requeue(SYNC_INTERVAL))
}

/// Error policy for the controller runtime: transient failures requeue with
/// backoff
pub fn error_policy(cluster: Arc<Cluster>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(cluster = %cluster.name_any(), error = %err, "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}
