//! Spec model invariants
//!
//! Validation runs once when the spec model is assembled. A failure here is a
//! user error: it is surfaced as `FailureMessage` and never retried. Mirror
//! credential presence is checked at render time, where the credentials are
//! actually read.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::{Error, Result};

use super::{Spec, WorkerNodeGroupConfig};

/// Validate every spec-model invariant
pub fn validate_spec(spec: &Spec) -> Result<()> {
    let cluster = &spec.cluster.spec;

    validate_dns_label(&cluster.name)?;

    if cluster.control_plane.count <= 0 {
        return Err(Error::validation(format!(
            "control plane count must be positive, got {}",
            cluster.control_plane.count
        )));
    }

    validate_machine_ref(spec, &cluster.control_plane.machine_group_ref.name, "control plane")?;

    let mut seen_groups = BTreeSet::new();
    for group in &cluster.worker_node_groups {
        if !seen_groups.insert(group.name.as_str()) {
            return Err(Error::validation(format!(
                "worker group name {} is not unique",
                group.name
            )));
        }
        validate_machine_ref(spec, &group.machine_group_ref.name, &group.name)?;
        validate_worker_rollout_strategy(group)?;

        if let Some(count) = group.count {
            if count < 0 {
                return Err(Error::validation(format!(
                    "worker group {} count must not be negative",
                    group.name
                )));
            }
        }
        if let Some(autoscaling) = &group.auto_scaling_configuration {
            if autoscaling.min_count < 0 || autoscaling.max_count < autoscaling.min_count {
                return Err(Error::validation(format!(
                    "worker group {} autoscaling bounds are invalid: min {} max {}",
                    group.name, autoscaling.min_count, autoscaling.max_count
                )));
            }
        }
    }

    if let Some(etcd) = &cluster.external_etcd {
        if etcd.count < 1 || etcd.count % 2 == 0 {
            return Err(Error::validation(format!(
                "external etcd count must be odd and at least 1, got {}",
                etcd.count
            )));
        }
        validate_machine_ref(spec, &etcd.machine_group_ref.name, "external etcd")?;
    }

    validate_cidrs_disjoint(
        &cluster.cluster_network.pods.cidr_blocks,
        &cluster.cluster_network.services.cidr_blocks,
    )?;

    Ok(())
}

fn validate_machine_ref(spec: &Spec, name: &str, role: &str) -> Result<()> {
    if !spec.machine_configs.contains_key(name) {
        return Err(Error::validation(format!(
            "{role} machine group ref {name} does not resolve to a machine config"
        )));
    }
    Ok(())
}

fn validate_worker_rollout_strategy(group: &WorkerNodeGroupConfig) -> Result<()> {
    if let Some(strategy) = &group.upgrade_rollout_strategy {
        if strategy.max_surge.is_none() || strategy.max_unavailable.is_none() {
            return Err(Error::validation(format!(
                "worker group {} rollout strategy must define both maxSurge and maxUnavailable",
                group.name
            )));
        }
    }
    Ok(())
}

/// RFC 1123 DNS label: lowercase alphanumeric and '-', alphanumeric at both
/// ends, at most 63 characters.
pub fn validate_dns_label(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if !valid {
        return Err(Error::validation(format!(
            "cluster name {name} is not a valid DNS label"
        )));
    }
    Ok(())
}

fn validate_cidrs_disjoint(pods: &[String], services: &[String]) -> Result<()> {
    for pod_cidr in pods {
        let pod = parse_cidr(pod_cidr)?;
        for service_cidr in services {
            let service = parse_cidr(service_cidr)?;
            if cidrs_overlap(pod, service) {
                return Err(Error::validation(format!(
                    "pod CIDR {pod_cidr} overlaps service CIDR {service_cidr}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::validation(format!("invalid CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::validation(format!("invalid CIDR: {cidr}")))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| Error::validation(format!("invalid CIDR prefix: {cidr}")))?;
    Ok((u32::from(addr), prefix))
}

fn cidrs_overlap(a: (u32, u8), b: (u32, u8)) -> bool {
    let prefix = a.1.min(b.1);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (a.0 & mask) == (b.0 & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{
        AutoScalingConfig, CidrBlocks, Cluster, ClusterNetwork, ClusterSpec, ControlPlaneConfig,
        DatacenterConfig, Endpoint, ExternalEtcdConfig, MachineConfig, OsFamily, Placement, Ref,
        RolloutStrategy, Spec, UserConfig, VersionsBundle, WorkerNodeGroupConfig,
    };
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn machine_config(name: &str) -> MachineConfig {
        MachineConfig {
            name: name.to_string(),
            os_family: OsFamily::Ubuntu,
            users: vec![UserConfig {
                name: "ec2-user".to_string(),
                ssh_authorized_keys: vec!["ssh-rsa AAAA test".to_string()],
            }],
            host_os_configuration: None,
            placement: Placement::None {},
        }
    }

    fn base_spec() -> Spec {
        let cluster_spec = ClusterSpec {
            name: "mgmt".to_string(),
            kubernetes_version: "1.23".to_string(),
            control_plane: ControlPlaneConfig {
                count: 1,
                endpoint: Endpoint {
                    host: "10.0.0.10".to_string(),
                },
                machine_group_ref: Ref::new("MachineConfig", "cp"),
                taints: Vec::new(),
                labels: BTreeMap::new(),
                upgrade_rollout_strategy: None,
            },
            worker_node_groups: vec![WorkerNodeGroupConfig {
                name: "md-0".to_string(),
                count: Some(2),
                machine_group_ref: Ref::new("MachineConfig", "workers"),
                labels: BTreeMap::new(),
                taints: Vec::new(),
                auto_scaling_configuration: None,
                upgrade_rollout_strategy: None,
            }],
            external_etcd: None,
            cluster_network: ClusterNetwork {
                pods: CidrBlocks {
                    cidr_blocks: vec!["192.168.0.0/16".to_string()],
                },
                services: CidrBlocks {
                    cidr_blocks: vec!["10.96.0.0/12".to_string()],
                },
                dns: None,
            },
            datacenter_ref: Ref::new("DockerDatacenterConfig", "mgmt"),
            proxy_configuration: None,
            registry_mirror_configuration: None,
            identity_provider_refs: Vec::new(),
            pod_iam_config: None,
            management_cluster: None,
        };

        Spec {
            cluster: Cluster {
                metadata: ObjectMeta {
                    name: Some("mgmt".to_string()),
                    ..Default::default()
                },
                spec: cluster_spec,
                status: None,
            },
            datacenter: DatacenterConfig::Docker {},
            machine_configs: BTreeMap::from([
                ("cp".to_string(), machine_config("cp")),
                ("workers".to_string(), machine_config("workers")),
                ("etcd".to_string(), machine_config("etcd")),
            ]),
            bundle: VersionsBundle::for_kubernetes_version("v1.23.7"),
            oidc_config: None,
            aws_iam_config: None,
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(validate_spec(&base_spec()).is_ok());
    }

    #[test]
    fn test_cluster_name_must_be_dns_label() {
        let mut spec = base_spec();
        spec.cluster.spec.name = "My Cluster!".to_string();
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("DNS label"));

        spec.cluster.spec.name = "-leading".to_string();
        assert!(validate_spec(&spec).is_err());

        spec.cluster.spec.name = "a".repeat(64);
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_machine_group_refs_must_resolve() {
        let mut spec = base_spec();
        spec.cluster.spec.control_plane.machine_group_ref = Ref::new("MachineConfig", "ghost");
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_external_etcd_count_must_be_odd() {
        let mut spec = base_spec();
        spec.cluster.spec.external_etcd = Some(ExternalEtcdConfig {
            count: 2,
            machine_group_ref: Ref::new("MachineConfig", "etcd"),
        });
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("odd"));

        spec.cluster.spec.external_etcd = Some(ExternalEtcdConfig {
            count: 3,
            machine_group_ref: Ref::new("MachineConfig", "etcd"),
        });
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn test_worker_group_names_must_be_unique() {
        let mut spec = base_spec();
        let duplicate = spec.cluster.spec.worker_node_groups[0].clone();
        spec.cluster.spec.worker_node_groups.push(duplicate);
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("not unique"));
    }

    #[test]
    fn test_worker_rollout_strategy_requires_both_fields() {
        let mut spec = base_spec();
        spec.cluster.spec.worker_node_groups[0].upgrade_rollout_strategy =
            Some(RolloutStrategy {
                max_surge: Some(1),
                max_unavailable: None,
            });
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("maxUnavailable"));

        spec.cluster.spec.worker_node_groups[0].upgrade_rollout_strategy =
            Some(RolloutStrategy {
                max_surge: Some(1),
                max_unavailable: Some(0),
            });
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn test_pod_and_service_cidrs_must_be_disjoint() {
        let mut spec = base_spec();
        spec.cluster.spec.cluster_network.services.cidr_blocks =
            vec!["192.168.128.0/18".to_string()];
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_invalid_cidr_is_rejected() {
        let mut spec = base_spec();
        spec.cluster.spec.cluster_network.pods.cidr_blocks = vec!["not-a-cidr".to_string()];
        assert!(validate_spec(&spec).is_err());

        spec.cluster.spec.cluster_network.pods.cidr_blocks = vec!["10.0.0.0/40".to_string()];
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_autoscaling_bounds_must_be_ordered() {
        let mut spec = base_spec();
        spec.cluster.spec.worker_node_groups[0].auto_scaling_configuration =
            Some(AutoScalingConfig {
                min_count: 5,
                max_count: 2,
            });
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_cidr_overlap_math() {
        let a = parse_cidr("192.168.0.0/16").unwrap();
        let b = parse_cidr("192.168.128.0/18").unwrap();
        assert!(cidrs_overlap(a, b));

        let c = parse_cidr("10.96.0.0/12").unwrap();
        assert!(!cidrs_overlap(a, c));
    }
}
