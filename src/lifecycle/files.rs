//! Persisted cluster artifacts
//!
//! Layout, relative to the writer's base directory:
//!
//! ```text
//! <clusterName>/<clusterName>-eks-a-cluster.yaml        rendered spec
//! <clusterName>/<clusterName>-eks-a-cluster.kubeconfig  workload kubeconfig
//! <clusterName>/generated/                              rendered CAPI templates
//! cluster-state-backup-<RFC3339>/                       CAPI snapshot
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::Result;

/// Writes cluster artifacts under a base directory
#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    base: PathBuf,
}

impl ArtifactWriter {
    /// Writer rooted at the given directory
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Path of the rendered cluster spec file
    pub fn cluster_spec_path(&self, cluster_name: &str) -> PathBuf {
        self.base
            .join(cluster_name)
            .join(format!("{cluster_name}-eks-a-cluster.yaml"))
    }

    /// Path of the workload kubeconfig file
    pub fn kubeconfig_path(&self, cluster_name: &str) -> PathBuf {
        self.base
            .join(cluster_name)
            .join(format!("{cluster_name}-eks-a-cluster.kubeconfig"))
    }

    /// Write the rendered cluster spec
    pub fn write_cluster_spec(&self, cluster_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.cluster_spec_path(cluster_name);
        write_file(&path, bytes)?;
        Ok(path)
    }

    /// Write the workload kubeconfig
    pub fn write_kubeconfig(&self, cluster_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.kubeconfig_path(cluster_name);
        write_file(&path, bytes)?;
        Ok(path)
    }

    /// Write the rendered CAPI template streams for support and debugging
    pub fn write_capi_templates(
        &self,
        cluster_name: &str,
        control_plane: &[u8],
        workers: &[u8],
    ) -> Result<(PathBuf, PathBuf)> {
        let dir = self.base.join(cluster_name).join("generated");
        let cp_path = dir.join(format!("{cluster_name}-control-plane.yaml"));
        let workers_path = dir.join(format!("{cluster_name}-workers.yaml"));
        write_file(&cp_path, control_plane)?;
        write_file(&workers_path, workers)?;
        Ok((cp_path, workers_path))
    }

    /// Timestamped backup directory for a CAPI snapshot
    pub fn backup_dir(&self, at: DateTime<Utc>) -> PathBuf {
        self.base.join(format!(
            "cluster-state-backup-{}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ))
    }

    /// Write one resource-kind dump into a backup directory
    pub fn write_backup_file(&self, dir: &Path, kind: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = dir.join(format!("{}.yaml", kind.to_lowercase()));
        write_file(&path, bytes)?;
        Ok(path)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}
