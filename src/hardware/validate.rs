//! Hardware availability and BMC validation
//!
//! Three questions get answered per reconciliation: is there enough matching
//! hardware for the intended operation, does every record match at most one
//! group selector, and is every BMC contactable. Failures are fatal
//! infrastructure errors carrying the validator's message.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capi::BmcMachine;
use crate::client::ClusterClient;
use crate::provider::Operation;
use crate::spec::Spec;
use crate::{Error, Result};

use super::Catalogue;

/// Default bound for the BMC contactable pre-flight
pub const DEFAULT_BMC_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const BMC_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Hardware demand for one machine group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRequirement {
    /// Group name (control-plane, etcd, or worker group name)
    pub name: String,
    /// Hardware selector for the group
    pub selector: BTreeMap<String, String>,
    /// Desired machine count
    pub count: i32,
    /// Effective surge for a rolling replacement
    pub max_surge: i32,
}

/// Derive the per-group hardware requirements from a spec model
pub fn selector_requirements(spec: &Spec) -> Result<Vec<GroupRequirement>> {
    let mut groups = Vec::new();
    let cluster = &spec.cluster.spec;

    let cp_machine = spec.control_plane_machine_config().ok_or_else(|| {
        Error::validation("control plane machine group ref does not resolve")
    })?;
    groups.push(GroupRequirement {
        name: "control-plane".to_string(),
        selector: cp_machine.placement.hardware_selector().cloned().unwrap_or_default(),
        count: cluster.control_plane.count,
        max_surge: cluster
            .control_plane
            .upgrade_rollout_strategy
            .as_ref()
            .and_then(|s| s.max_surge)
            .unwrap_or(1),
    });

    if let Some(etcd) = &cluster.external_etcd {
        let etcd_machine = spec
            .etcd_machine_config()
            .ok_or_else(|| Error::validation("etcd machine group ref does not resolve"))?;
        groups.push(GroupRequirement {
            name: "etcd".to_string(),
            selector: etcd_machine
                .placement
                .hardware_selector()
                .cloned()
                .unwrap_or_default(),
            count: etcd.count,
            max_surge: 1,
        });
    }

    for group in &cluster.worker_node_groups {
        let machine = spec
            .worker_machine_config(group)
            .ok_or_else(|| Error::validation(format!("worker group {} ref does not resolve", group.name)))?;
        groups.push(GroupRequirement {
            name: group.name.clone(),
            selector: machine
                .placement
                .hardware_selector()
                .cloned()
                .unwrap_or_default(),
            count: group.replicas(),
            max_surge: group
                .upgrade_rollout_strategy
                .as_ref()
                .and_then(|s| s.max_surge)
                .unwrap_or(1),
        });
    }

    Ok(groups)
}

/// Run the assertion set appropriate for the detected operation
///
/// `current_counts` carries the observed replica count per group (keyed by
/// requirement name) and is only consulted on the scale path.
pub fn validate_hardware_for_operation(
    catalogue: &Catalogue,
    groups: &[GroupRequirement],
    operation: &Operation,
    current_counts: &BTreeMap<String, i32>,
) -> Result<()> {
    assert_single_selector_match(catalogue, groups)?;

    match operation {
        Operation::NewCluster => assert_minimum_available_for_create(catalogue, groups),
        Operation::VersionUpgrade => assert_extra_available_for_rolling(catalogue, groups),
        Operation::WorkloadTemplateChange { .. } | Operation::KubeadmConfigChange { .. } => {
            assert_extra_available_for_rolling(catalogue, groups)
        }
        Operation::ScaleOnly => assert_available_for_scale(catalogue, groups, current_counts),
        Operation::NoChange => Ok(()),
    }
}

/// Every hardware record must satisfy at most one group selector
pub fn assert_single_selector_match(
    catalogue: &Catalogue,
    groups: &[GroupRequirement],
) -> Result<()> {
    let selectors: Vec<(&str, &BTreeMap<String, String>)> = groups
        .iter()
        .map(|g| (g.name.as_str(), &g.selector))
        .collect();

    for (id, count) in catalogue.selector_match_counts(&selectors) {
        if count > 1 {
            return Err(Error::infrastructure(format!(
                "hardware {id} matches {count} group selectors; every record may satisfy at most one"
            )));
        }
    }
    Ok(())
}

/// Create path: matching hardware per group must cover the desired count
pub fn assert_minimum_available_for_create(
    catalogue: &Catalogue,
    groups: &[GroupRequirement],
) -> Result<()> {
    for group in groups {
        let available = catalogue.count_matching(&group.selector) as i32;
        if available < group.count {
            return Err(Error::infrastructure(format!(
                "insufficient hardware for {}: requested {}, have {}",
                group.name, group.count, available
            )));
        }
    }
    Ok(())
}

/// Rolling path: free hardware per group must cover max(1, maxSurge)
pub fn assert_extra_available_for_rolling(
    catalogue: &Catalogue,
    groups: &[GroupRequirement],
) -> Result<()> {
    for group in groups {
        let needed = group.max_surge.max(1);
        let free = catalogue.count_free_matching(&group.selector) as i32;
        if free < needed {
            return Err(Error::infrastructure(format!(
                "insufficient free hardware for rolling replacement of {}: need {}, have {}",
                group.name, needed, free
            )));
        }
    }
    Ok(())
}

/// Scale path: delta-aware; decreases need no hardware
pub fn assert_available_for_scale(
    catalogue: &Catalogue,
    groups: &[GroupRequirement],
    current_counts: &BTreeMap<String, i32>,
) -> Result<()> {
    for group in groups {
        let current = current_counts.get(&group.name).copied().unwrap_or(0);
        let delta = group.count - current;
        if delta <= 0 {
            continue;
        }
        let free = catalogue.count_free_matching(&group.selector) as i32;
        if free < delta {
            return Err(Error::infrastructure(format!(
                "insufficient free hardware to scale {} by {}: have {}",
                group.name, delta, free
            )));
        }
    }
    Ok(())
}

/// Check a BMC's Contactable condition
///
/// `False` fails with the reported message verbatim; absent or `Unknown` is
/// not a failure here (the bounded wait treats it as transient).
pub fn check_contactable(bmc: &BmcMachine) -> Result<()> {
    match bmc.contactable() {
        Some(condition) if condition.status == "False" => {
            Err(Error::infrastructure(condition.message.clone()))
        }
        _ => Ok(()),
    }
}

/// BMC pre-flight: wait until every BMC machine reports Contactable=True
///
/// `Contactable=False` fails immediately with the reported message; absent or
/// `Unknown` conditions are treated as transient until the bound elapses.
pub async fn validate_bmcs_contactable(
    client: &dyn ClusterClient,
    namespace: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("bmc contactable wait cancelled"));
        }

        let bmcs = client.list_bmc_machines(namespace).await?;
        let mut pending = Vec::new();

        for bmc in &bmcs {
            match bmc.contactable() {
                Some(condition) if condition.status == "True" => {}
                Some(condition) if condition.status == "False" => {
                    return Err(Error::infrastructure(condition.message.clone()));
                }
                _ => pending.push(bmc.metadata.name.clone()),
            }
        }

        if pending.is_empty() {
            info!(count = bmcs.len(), "all BMCs contactable");
            return Ok(());
        }

        if start.elapsed() >= timeout {
            return Err(Error::transient(format!(
                "timed out waiting for BMCs to become contactable: {}",
                pending.join(", ")
            )));
        }

        debug!(?pending, "waiting for BMCs to report contactable");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled("bmc contactable wait cancelled"));
            }
            _ = tokio::time::sleep(BMC_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::{BmcMachineStatus, Condition, MetadataView};
    use crate::client::MockClusterClient;
    use crate::hardware::Hardware;

    fn hardware(id: &str, labels: &[(&str, &str)], owner: Option<&str>) -> Hardware {
        Hardware {
            id: id.to_string(),
            hostname: id.to_string(),
            bmc_ip: String::new(),
            bmc_username: String::new(),
            bmc_password: String::new(),
            mac: format!("aa:{id}"),
            ip_address: String::new(),
            gateway: String::new(),
            nameservers: Vec::new(),
            netmask: String::new(),
            disk: String::new(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            owner: owner.map(str::to_string),
        }
    }

    fn requirement(name: &str, labels: &[(&str, &str)], count: i32, surge: i32) -> GroupRequirement {
        GroupRequirement {
            name: name.to_string(),
            selector: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            count,
            max_surge: surge,
        }
    }

    fn catalogue(records: Vec<Hardware>) -> Catalogue {
        let mut cat = Catalogue::new();
        for record in records {
            cat.insert(record).unwrap();
        }
        cat
    }

    fn bmc(name: &str, status: Option<(&str, &str)>) -> BmcMachine {
        BmcMachine {
            metadata: MetadataView {
                name: name.to_string(),
                ..Default::default()
            },
            status: BmcMachineStatus {
                conditions: status
                    .map(|(s, m)| {
                        vec![Condition {
                            type_: "Contactable".to_string(),
                            status: s.to_string(),
                            message: m.to_string(),
                        }]
                    })
                    .unwrap_or_default(),
            },
        }
    }

    #[test]
    fn test_single_selector_match_accepts_disjoint_selectors() {
        let cat = catalogue(vec![
            hardware("a", &[("type", "cp")], None),
            hardware("b", &[("type", "worker")], None),
        ]);
        let groups = vec![
            requirement("control-plane", &[("type", "cp")], 1, 1),
            requirement("md-0", &[("type", "worker")], 1, 1),
        ];
        assert!(assert_single_selector_match(&cat, &groups).is_ok());
    }

    #[test]
    fn test_single_selector_match_rejects_overlap() {
        let cat = catalogue(vec![hardware("a", &[("type", "cp"), ("rack", "r1")], None)]);
        let groups = vec![
            requirement("control-plane", &[("type", "cp")], 1, 1),
            requirement("md-0", &[("rack", "r1")], 1, 1),
        ];
        let err = assert_single_selector_match(&cat, &groups).unwrap_err();
        assert!(err.to_string().contains("at most one"));
        assert_eq!(err.category(), crate::ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_create_requires_count_per_group() {
        let cat = catalogue(vec![
            hardware("a", &[("type", "worker")], None),
            hardware("b", &[("type", "worker")], None),
        ]);
        let ok = vec![requirement("md-0", &[("type", "worker")], 2, 1)];
        assert!(assert_minimum_available_for_create(&cat, &ok).is_ok());

        let short = vec![requirement("md-0", &[("type", "worker")], 3, 1)];
        let err = assert_minimum_available_for_create(&cat, &short).unwrap_err();
        assert!(err.to_string().contains("requested 3, have 2"));
    }

    #[test]
    fn test_rolling_requires_free_surge_capacity() {
        // Two bound, one free
        let cat = catalogue(vec![
            hardware("a", &[("type", "worker")], Some("m1")),
            hardware("b", &[("type", "worker")], Some("m2")),
            hardware("c", &[("type", "worker")], None),
        ]);

        let surge_one = vec![requirement("md-0", &[("type", "worker")], 2, 1)];
        assert!(assert_extra_available_for_rolling(&cat, &surge_one).is_ok());

        let surge_two = vec![requirement("md-0", &[("type", "worker")], 2, 2)];
        let err = assert_extra_available_for_rolling(&cat, &surge_two).unwrap_err();
        assert!(err.to_string().contains("need 2, have 1"));
    }

    #[test]
    fn test_rolling_requires_at_least_one_even_with_zero_surge() {
        let cat = catalogue(vec![hardware("a", &[("type", "worker")], Some("m1"))]);
        let groups = vec![requirement("md-0", &[("type", "worker")], 1, 0)];
        assert!(assert_extra_available_for_rolling(&cat, &groups).is_err());
    }

    #[test]
    fn test_scale_is_delta_aware() {
        let cat = catalogue(vec![
            hardware("a", &[("type", "worker")], Some("m1")),
            hardware("b", &[("type", "worker")], None),
        ]);
        let groups = vec![requirement("md-0", &[("type", "worker")], 2, 1)];

        // 1 -> 2: one free record needed, one available
        let current = BTreeMap::from([("md-0".to_string(), 1)]);
        assert!(assert_available_for_scale(&cat, &groups, &current).is_ok());

        // 0 -> 2: two needed, one available
        let current = BTreeMap::from([("md-0".to_string(), 0)]);
        assert!(assert_available_for_scale(&cat, &groups, &current).is_err());

        // 3 -> 2: decrease, no check
        let current = BTreeMap::from([("md-0".to_string(), 3)]);
        assert!(assert_available_for_scale(&cat, &groups, &current).is_ok());
    }

    #[test]
    fn test_check_contactable_false_carries_message_verbatim() {
        let err = check_contactable(&bmc("bmc-0", Some(("False", "auth-failed")))).unwrap_err();
        assert_eq!(err.to_string(), "infrastructure error: auth-failed");

        assert!(check_contactable(&bmc("bmc-1", Some(("True", "")))).is_ok());
        // Unknown is transient, not a failure
        assert!(check_contactable(&bmc("bmc-2", Some(("Unknown", "probing")))).is_ok());
        assert!(check_contactable(&bmc("bmc-3", None)).is_ok());
    }

    #[tokio::test]
    async fn test_bmc_wait_succeeds_when_all_contactable() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_bmc_machines()
            .returning(|_| Ok(vec![bmc("bmc-0", Some(("True", ""))), bmc("bmc-1", Some(("True", "")))]));

        let cancel = CancellationToken::new();
        let result =
            validate_bmcs_contactable(&client, "eksa-system", Duration::from_secs(1), &cancel)
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bmc_wait_fails_fast_on_false() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_bmc_machines()
            .returning(|_| Ok(vec![bmc("bmc-0", Some(("False", "auth-failed")))]));

        let cancel = CancellationToken::new();
        let err =
            validate_bmcs_contactable(&client, "eksa-system", Duration::from_secs(5), &cancel)
                .await
                .unwrap_err();
        assert_eq!(err.to_string(), "infrastructure error: auth-failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bmc_wait_times_out_on_unknown() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_bmc_machines()
            .returning(|_| Ok(vec![bmc("bmc-0", Some(("Unknown", "probing")))]));

        let cancel = CancellationToken::new();
        let err = validate_bmcs_contactable(
            &client,
            "eksa-system",
            Duration::from_millis(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("bmc-0"));
    }
}
