//! Untyped Kubernetes manifest documents
//!
//! Rendered cluster specs are streams of YAML documents. [`Manifest`] holds a
//! single document with enough structure to address it (apiVersion, kind,
//! metadata) while leaving the spec untyped; streams are concatenated and
//! re-parsed with the standard `---` separator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single Kubernetes manifest document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// API version (e.g. "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Resource kind (e.g. "Cluster", "MachineDeployment")
    pub kind: String,
    /// Resource metadata
    pub metadata: ManifestMetadata,
    /// Untyped spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
    /// Fields outside apiVersion/kind/metadata/spec (e.g. Secret data)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Metadata for a manifest document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestMetadata {
    /// Resource name
    pub name: String,
    /// Namespace (absent for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Create a manifest with name and namespace
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ManifestMetadata {
                name: name.into(),
                namespace: Some(namespace.into()),
                labels: None,
                annotations: None,
            },
            spec: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the spec
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Add labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.metadata.labels = Some(labels);
        self
    }

    /// Add annotations
    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.metadata.annotations = Some(annotations);
        self
    }

    /// Add a top-level field outside apiVersion/kind/metadata/spec
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Serialize to a single YAML document
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Serialize manifests into a `---`-separated YAML stream
pub fn to_yaml_stream(manifests: &[Manifest]) -> Result<Vec<u8>> {
    let mut docs = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        docs.push(manifest.to_yaml()?);
    }
    Ok(join_documents(&docs).into_bytes())
}

/// Join already-rendered YAML fragments with the document separator
///
/// Empty fragments are dropped so repeated joins stay canonical.
pub fn join_documents(docs: &[String]) -> String {
    docs.iter()
        .map(|d| d.trim_matches('\n'))
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Parse a `---`-separated YAML stream into manifests
///
/// Documents that are not objects with apiVersion/kind are rejected; empty
/// documents are skipped.
pub fn parse_yaml_stream(bytes: &[u8]) -> Result<Vec<Manifest>> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| Error::serialization(format!("not utf-8: {e}")))?;

    let mut manifests = Vec::new();
    for doc in split_documents(text) {
        let manifest: Manifest = serde_yaml::from_str(doc)
            .map_err(|e| Error::serialization(format!("invalid manifest document: {e}")))?;
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Remove every document of the given kind from a YAML stream
///
/// Used on the scale-only path to drop machine-template documents so a
/// replica change cannot trigger a node rotation.
pub fn strip_kind(bytes: &[u8], kind: &str) -> Result<Vec<u8>> {
    let manifests = parse_yaml_stream(bytes)?;
    let kept: Vec<Manifest> = manifests.into_iter().filter(|m| m.kind != kind).collect();
    to_yaml_stream(&kept)
}

fn split_documents(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n---")
        .map(|d| d.trim_start_matches("---"))
        .map(str::trim)
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine_template(name: &str) -> Manifest {
        Manifest::new(
            "infrastructure.cluster.x-k8s.io/v1beta1",
            "TinkerbellMachineTemplate",
            name,
            "eksa-system",
        )
        .with_spec(json!({"template": {"spec": {"hardwareAffinity": {}}}}))
    }

    fn machine_deployment(name: &str, replicas: i32) -> Manifest {
        Manifest::new("cluster.x-k8s.io/v1beta1", "MachineDeployment", name, "eksa-system")
            .with_spec(json!({"replicas": replicas}))
    }

    #[test]
    fn test_to_yaml_contains_addressing_fields() {
        let yaml = machine_deployment("mgmt-md-0", 2).to_yaml().unwrap();
        assert!(yaml.contains("apiVersion: cluster.x-k8s.io/v1beta1"));
        assert!(yaml.contains("kind: MachineDeployment"));
        assert!(yaml.contains("name: mgmt-md-0"));
        assert!(yaml.contains("namespace: eksa-system"));
        assert!(yaml.contains("replicas: 2"));
    }

    #[test]
    fn test_stream_round_trip_is_structurally_equal() {
        let manifests = vec![
            machine_deployment("mgmt-md-0", 2),
            machine_template("mgmt-md-0-1680000000000"),
        ];

        let bytes = to_yaml_stream(&manifests).unwrap();
        let parsed = parse_yaml_stream(&bytes).unwrap();
        assert_eq!(parsed, manifests);

        // Re-marshal of the parse equals the first marshal
        let bytes2 = to_yaml_stream(&parsed).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn test_parse_skips_empty_documents() {
        let text = "---\n\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n---\n";
        let parsed = parse_yaml_stream(text.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, "Secret");
    }

    #[test]
    fn test_strip_kind_removes_only_matching_documents() {
        let manifests = vec![
            machine_deployment("mgmt-md-0", 2),
            machine_template("mgmt-md-0-1680000000000"),
            machine_deployment("mgmt-md-1", 1),
        ];
        let bytes = to_yaml_stream(&manifests).unwrap();

        let stripped = strip_kind(&bytes, "TinkerbellMachineTemplate").unwrap();
        let remaining = parse_yaml_stream(&stripped).unwrap();

        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|m| m.kind == "MachineDeployment"));
    }

    #[test]
    fn test_strip_kind_on_stream_without_matches_is_identity() {
        let manifests = vec![machine_deployment("mgmt-md-0", 2)];
        let bytes = to_yaml_stream(&manifests).unwrap();
        let stripped = strip_kind(&bytes, "VSphereMachineTemplate").unwrap();
        assert_eq!(bytes, stripped);
    }

    #[test]
    fn test_extra_fields_survive_round_trip() {
        let secret = Manifest::new("v1", "Secret", "vsphere-creds", "eksa-system")
            .with_field("type", json!("Opaque"))
            .with_field("stringData", json!({"username": "admin"}));

        let yaml = secret.to_yaml().unwrap();
        assert!(yaml.contains("type: Opaque"));

        let parsed: Manifest = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, secret);
    }

    #[test]
    fn test_join_documents_drops_empties() {
        let joined = join_documents(&[
            "a: 1".to_string(),
            String::new(),
            "b: 2\n".to_string(),
        ]);
        assert_eq!(joined, "a: 1\n---\nb: 2");
    }
}
