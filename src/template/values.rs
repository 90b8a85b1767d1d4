//! Template value maps
//!
//! The value map is the rendering contract: providers build a control-plane
//! map and one map per worker group, optionally mutate them through build
//! options, and hand them to the manifest generators. Keys are camelCase to
//! match the rendered manifest fields they feed.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::config;
use crate::spec::{DatacenterConfig, KubeVersion, Spec, WorkerNodeGroupConfig};
use crate::{Error, Result};

use super::extra_args::{
    aws_iam_auth_extra_args, control_plane_node_labels_extra_args, feature_gates_extra_args,
    node_cidr_mask_extra_args, oidc_extra_args, pod_iam_auth_extra_args, resolv_conf_extra_args,
    secure_etcd_tls_cipher_suites, secure_tls_cipher_suites, worker_node_labels_extra_args,
    SECURE_CIPHER_SUITES,
};

/// A rendering value map
pub type Values = BTreeMap<String, Value>;

/// Map-mutator applied to a value map before manifest generation
pub type BuildOption<'a> = &'a dyn Fn(&mut Values);

/// Default upstream registry replaced by a configured mirror
pub const DEFAULT_REGISTRY: &str = "public.ecr.aws";

/// Built-in noProxy entries appended after user entries
pub const NO_PROXY_DEFAULTS: &[&str] = &["localhost", "127.0.0.1", ".svc"];

/// The minimum supported Kubernetes minor
///
/// Exactly this minor gets the LoadBalancerClass feature gate and the worker
/// cgroup-driver pin.
pub const MIN_SUPPORTED_VERSION: KubeVersion = KubeVersion {
    major: 1,
    minor: 21,
};

/// Whether the spec targets the minimum supported minor
pub fn is_min_supported_version(spec: &Spec) -> bool {
    KubeVersion::parse(&spec.cluster.spec.kubernetes_version)
        .map(|v| v == MIN_SUPPORTED_VERSION)
        .unwrap_or(false)
}

/// Build the control-plane value map
pub fn build_cp_values(spec: &Spec) -> Result<Values> {
    let cluster = &spec.cluster.spec;
    let bundle = &spec.bundle;

    let etcd_args = secure_etcd_tls_cipher_suites();
    let shared_args = secure_tls_cipher_suites();
    let kubelet_args = secure_tls_cipher_suites()
        .append(resolv_conf_extra_args(&cluster.cluster_network))
        .append(control_plane_node_labels_extra_args(&cluster.control_plane));
    let mut apiserver_args = oidc_extra_args(spec.oidc_config.as_ref())
        .append(aws_iam_auth_extra_args(spec.aws_iam_config.as_ref()))
        .append(pod_iam_auth_extra_args(cluster.pod_iam_config.as_ref()))
        .append(shared_args.clone());

    // LoadBalancerClass is gated at the minimum supported minor and needs
    // enabling manually.
    if is_min_supported_version(spec) {
        apiserver_args =
            apiserver_args.append(feature_gates_extra_args(&["ServiceLoadBalancerClass=true"]));
    }

    let controller_manager_args =
        secure_tls_cipher_suites().append(node_cidr_mask_extra_args(&cluster.cluster_network));

    let mut values = Values::new();
    values.insert("clusterName".into(), json!(cluster.name));
    values.insert(
        "controlPlaneEndpointIp".into(),
        json!(cluster.control_plane.endpoint.host),
    );
    values.insert(
        "controlPlaneReplicas".into(),
        json!(cluster.control_plane.count),
    );
    values.insert(
        "kubernetesRepository".into(),
        json!(bundle.kube_distro.kubernetes.repository),
    );
    values.insert(
        "kubernetesVersion".into(),
        json!(bundle.kube_distro.kubernetes.tag),
    );
    values.insert(
        "etcdRepository".into(),
        json!(bundle.kube_distro.etcd.repository),
    );
    values.insert("etcdImageTag".into(), json!(bundle.kube_distro.etcd.tag));
    values.insert(
        "corednsRepository".into(),
        json!(bundle.kube_distro.core_dns.repository),
    );
    values.insert(
        "corednsVersion".into(),
        json!(bundle.kube_distro.core_dns.tag),
    );
    values.insert("kubeVipImage".into(), json!(bundle.kube_vip.versioned()));
    values.insert("format".into(), json!("cloud-config"));
    values.insert("eksaSystemNamespace".into(), json!(crate::SYSTEM_NAMESPACE));
    values.insert(
        "podCidrs".into(),
        json!(cluster.cluster_network.pods.cidr_blocks),
    );
    values.insert(
        "serviceCidrs".into(),
        json!(cluster.cluster_network.services.cidr_blocks),
    );
    values.insert("etcdExtraArgs".into(), etcd_args.to_partial_yaml());
    values.insert("etcdCipherSuites".into(), json!(SECURE_CIPHER_SUITES));
    values.insert("apiserverExtraArgs".into(), apiserver_args.to_partial_yaml());
    values.insert(
        "controllerManagerExtraArgs".into(),
        controller_manager_args.to_partial_yaml(),
    );
    values.insert("schedulerExtraArgs".into(), shared_args.to_partial_yaml());
    values.insert("kubeletExtraArgs".into(), kubelet_args.to_partial_yaml());
    values.insert(
        "externalEtcdVersion".into(),
        json!(bundle.kube_distro.etcd_version),
    );
    values.insert(
        "etcdImage".into(),
        json!(bundle.kube_distro.etcd_image.versioned()),
    );

    if let Some(cp_machine) = spec.control_plane_machine_config() {
        if let Some(username) = cp_machine.ssh_username() {
            values.insert("controlPlaneSshUsername".into(), json!(username));
            values.insert(
                "controlPlaneSshAuthorizedKey".into(),
                json!(cp_machine.ssh_authorized_key().map_err(|e| {
                    Error::serialization(format!("formatting control plane ssh key: {e}"))
                })?),
            );
        }
        if let Some(servers) = cp_machine.ntp_servers() {
            values.insert("cpNtpServers".into(), json!(servers));
        }
        apply_os_family(&mut values, spec, cp_machine)?;
    }

    if !cluster.control_plane.taints.is_empty() {
        values.insert(
            "controlPlaneTaints".into(),
            json!(cluster.control_plane.taints),
        );
    }

    if spec.aws_iam_config.is_some() {
        values.insert("awsIamAuth".into(), json!(true));
    }

    if let Some(strategy) = &cluster.control_plane.upgrade_rollout_strategy {
        values.insert("upgradeRolloutStrategy".into(), json!(true));
        if let Some(surge) = strategy.max_surge {
            values.insert("maxSurge".into(), json!(surge));
        }
    }

    if let Some(etcd) = &cluster.external_etcd {
        values.insert("externalEtcd".into(), json!(true));
        values.insert("externalEtcdReplicas".into(), json!(etcd.count));

        if let Some(etcd_machine) = spec.etcd_machine_config() {
            if let Some(username) = etcd_machine.ssh_username() {
                values.insert("etcdSshUsername".into(), json!(username));
                values.insert(
                    "etcdSshAuthorizedKey".into(),
                    json!(etcd_machine.ssh_authorized_key().map_err(|e| {
                        Error::serialization(format!("formatting etcd ssh key: {e}"))
                    })?),
                );
            }
            if let Some(servers) = etcd_machine.ntp_servers() {
                values.insert("etcdNtpServers".into(), json!(servers));
            }
        }
    }

    populate_registry_mirror_values(spec, &mut values)?;
    populate_proxy_values(spec, &mut values);

    Ok(values)
}

/// Build the value map for one worker group
pub fn build_worker_values(spec: &Spec, group: &WorkerNodeGroupConfig) -> Result<Values> {
    let cluster = &spec.cluster.spec;
    let bundle = &spec.bundle;

    let kubelet_args = secure_tls_cipher_suites()
        .append(worker_node_labels_extra_args(group))
        .append(resolv_conf_extra_args(&cluster.cluster_network));

    let mut values = Values::new();
    values.insert("clusterName".into(), json!(cluster.name));
    values.insert(
        "kubernetesVersion".into(),
        json!(bundle.kube_distro.kubernetes.tag),
    );
    values.insert("format".into(), json!("cloud-config"));
    values.insert("eksaSystemNamespace".into(), json!(crate::SYSTEM_NAMESPACE));
    values.insert("kubeletExtraArgs".into(), kubelet_args.to_partial_yaml());
    values.insert("workerReplicas".into(), json!(group.replicas()));
    values.insert("workerNodeGroupName".into(), json!(group.name));

    if !group.taints.is_empty() {
        values.insert("workerNodeGroupTaints".into(), json!(group.taints));
    }

    if let Some(machine) = spec.worker_machine_config(group) {
        if let Some(username) = machine.ssh_username() {
            values.insert("workerSshUsername".into(), json!(username));
            values.insert(
                "workerSshAuthorizedKey".into(),
                json!(machine.ssh_authorized_key().map_err(|e| {
                    Error::serialization(format!("formatting worker ssh key: {e}"))
                })?),
            );
        }
        if let Some(servers) = machine.ntp_servers() {
            values.insert("ntpServers".into(), json!(servers));
        }
        apply_os_family(&mut values, spec, machine)?;
    }

    if let Some(autoscaling) = &group.auto_scaling_configuration {
        values.insert(
            "autoscalingConfig".into(),
            json!({
                "minCount": autoscaling.min_count,
                "maxCount": autoscaling.max_count,
            }),
        );
    }

    if let Some(strategy) = &group.upgrade_rollout_strategy {
        values.insert("upgradeRolloutStrategy".into(), json!(true));
        if let Some(surge) = strategy.max_surge {
            values.insert("maxSurge".into(), json!(surge));
        }
        if let Some(unavailable) = strategy.max_unavailable {
            values.insert("maxUnavailable".into(), json!(unavailable));
        }
    }

    // Pin cgroupDriver to systemd on the minimum supported minor.
    // TODO(upgrade-ordering): remove once ordered upgrade (etcd, control
    // plane, then workers) covers the kubelet default flip.
    if is_min_supported_version(spec) {
        values.insert("cgroupDriverSystemd".into(), json!(true));
    }

    populate_registry_mirror_values(spec, &mut values)?;
    populate_proxy_values(spec, &mut values);

    Ok(values)
}

/// Bottlerocket flips the bootstrap format and carries its own images
fn apply_os_family(
    values: &mut Values,
    spec: &Spec,
    machine: &crate::spec::MachineConfig,
) -> Result<()> {
    if machine.os_family == crate::spec::OsFamily::Bottlerocket {
        let bundle = &spec.bundle;
        values.insert("format".into(), json!("bottlerocket"));
        values.insert(
            "pauseRepository".into(),
            json!(bundle.kube_distro.pause.repository),
        );
        values.insert("pauseVersion".into(), json!(bundle.kube_distro.pause.tag));
        values.insert(
            "bottlerocketBootstrapRepository".into(),
            json!(bundle.bottlerocket_host_containers.kubeadm_bootstrap.repository),
        );
        values.insert(
            "bottlerocketBootstrapVersion".into(),
            json!(bundle.bottlerocket_host_containers.kubeadm_bootstrap.tag),
        );
    }

    if let Some(host_os) = &machine.host_os_configuration {
        if let Some(settings) = &host_os.bottlerocket_configuration {
            let rendered = serde_yaml::to_string(settings).map_err(|e| {
                Error::serialization(format!("serializing bottlerocket settings: {e}"))
            })?;
            values.insert("bottlerocketSettings".into(), json!(rendered));
        }
    }
    Ok(())
}

/// The ordered noProxy list
///
/// Order is part of the contract for downstream consumers: pod CIDRs, service
/// CIDRs, user entries, built-in defaults, datacenter endpoint, control-plane
/// endpoint, and the bare-metal boot IP last. Duplicates are preserved.
pub fn build_no_proxy_list(spec: &Spec) -> Vec<String> {
    let cluster = &spec.cluster.spec;
    let user_entries = cluster
        .proxy_configuration
        .as_ref()
        .map(|p| p.no_proxy.as_slice())
        .unwrap_or_default();

    let mut list = Vec::with_capacity(
        cluster.cluster_network.pods.cidr_blocks.len()
            + cluster.cluster_network.services.cidr_blocks.len()
            + user_entries.len()
            + NO_PROXY_DEFAULTS.len()
            + 3,
    );

    list.extend(cluster.cluster_network.pods.cidr_blocks.iter().cloned());
    list.extend(cluster.cluster_network.services.cidr_blocks.iter().cloned());
    list.extend(user_entries.iter().cloned());
    list.extend(NO_PROXY_DEFAULTS.iter().map(|s| s.to_string()));

    if let Some(endpoint) = spec.datacenter.endpoint() {
        list.push(endpoint.to_string());
    }
    list.push(cluster.control_plane.endpoint.host.clone());

    if let DatacenterConfig::Tinkerbell { tinkerbell_ip, .. } = &spec.datacenter {
        list.push(tinkerbell_ip.clone());
    }

    list
}

fn populate_proxy_values(spec: &Spec, values: &mut Values) {
    let Some(proxy) = &spec.cluster.spec.proxy_configuration else {
        return;
    };
    values.insert("proxyConfig".into(), json!(true));
    values.insert("httpProxy".into(), json!(proxy.http_proxy));
    values.insert("httpsProxy".into(), json!(proxy.https_proxy));
    values.insert("noProxy".into(), json!(build_no_proxy_list(spec)));
}

fn populate_registry_mirror_values(spec: &Spec, values: &mut Values) -> Result<()> {
    let Some(mirror) = &spec.cluster.spec.registry_mirror_configuration else {
        return Ok(());
    };

    let base = mirror.base_registry();
    let mut mirror_map = BTreeMap::new();
    for ns in &mirror.ocinamespaces {
        mirror_map.insert(ns.registry.clone(), format!("{}/{}", base, ns.namespace));
    }
    let public_mirror = mirror_map
        .get(DEFAULT_REGISTRY)
        .cloned()
        .unwrap_or_else(|| base.clone());

    values.insert("registryMirrorMap".into(), json!(mirror_map));
    values.insert("mirrorBase".into(), json!(base));
    values.insert("publicMirror".into(), json!(public_mirror));

    if !mirror.ca_cert_content.is_empty() {
        values.insert("registryCACert".into(), json!(mirror.ca_cert_content));
    }

    if mirror.authenticate {
        values.insert("registryAuth".into(), json!(true));
        let creds = config::read_credentials().map_err(|e| {
            Error::serialization(format!("reading registry mirror credentials: {e}"))
        })?;
        values.insert("registryUsername".into(), json!(creds.username));
        values.insert("registryPassword".into(), json!(creds.password));
    }
    Ok(())
}

/// Replace the default upstream registry inside an embedded template override
/// with the configured public mirror, when one is set
pub fn substitute_registry(text: &str, values: &Values) -> String {
    match values.get("publicMirror").and_then(Value::as_str) {
        Some(mirror) => text.replace(DEFAULT_REGISTRY, mirror),
        None => text.to_string(),
    }
}
