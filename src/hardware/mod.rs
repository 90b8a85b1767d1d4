//! Bare-metal hardware inventory
//!
//! Inventory comes from one of two places: a CSV file handed to the CLI at
//! create time, or `Hardware` resources already living in the management
//! cluster. Both feed the same [`Catalogue`], which is rebuilt at the start
//! of every reconciliation and never cached across reconciles.

mod catalogue;
mod validate;

pub use catalogue::Catalogue;
pub use validate::{
    check_contactable, selector_requirements, validate_bmcs_contactable,
    validate_hardware_for_operation, GroupRequirement, DEFAULT_BMC_TIMEOUT,
};

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde::Deserialize;

use crate::client::{ClusterClient, HARDWARE};
use crate::{Error, Result};

/// Label set by the bare-metal controller on hardware bound to a machine
pub const OWNER_NAME_LABEL: &str = "v1alpha1.tinkerbell.org/ownerName";

/// Expected CSV header
pub const CSV_HEADER: &str =
    "hostname,bmc_ip,bmc_username,bmc_password,mac,ip_address,gateway,nameservers,netmask,disk,labels";

/// One hardware inventory record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hardware {
    /// Record ID (hostname)
    pub id: String,
    /// Hostname
    pub hostname: String,
    /// BMC address
    pub bmc_ip: String,
    /// BMC username
    pub bmc_username: String,
    /// BMC password
    pub bmc_password: String,
    /// Primary interface MAC
    pub mac: String,
    /// Static IP address
    pub ip_address: String,
    /// Gateway
    pub gateway: String,
    /// DNS nameservers
    pub nameservers: Vec<String>,
    /// Netmask
    pub netmask: String,
    /// Target disk
    pub disk: String,
    /// Labels used for selector matching
    pub labels: BTreeMap<String, String>,
    /// Machine currently bound to this hardware, if any
    pub owner: Option<String>,
}

impl Hardware {
    /// Whether this record satisfies a selector (subset match)
    ///
    /// An empty selector matches every record.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }

    /// Whether this record is free to receive a new machine
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    hostname: String,
    bmc_ip: String,
    bmc_username: String,
    bmc_password: String,
    mac: String,
    ip_address: String,
    gateway: String,
    nameservers: String,
    netmask: String,
    disk: String,
    labels: String,
}

/// Read an inventory from CSV bytes
///
/// Rows with duplicate MACs are rejected (case-insensitive); labels are
/// semicolon-separated `k=v` pairs; nameservers are `|`-separated.
pub fn read_csv(bytes: &[u8]) -> Result<Catalogue> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| Error::validation(format!("reading hardware csv header: {e}")))?
        .clone();
    let expected: Vec<&str> = CSV_HEADER.split(',').collect();
    let got: Vec<&str> = headers.iter().collect();
    if got != expected {
        return Err(Error::validation(format!(
            "hardware csv header mismatch: expected {CSV_HEADER}, got {}",
            got.join(",")
        )));
    }

    let mut catalogue = Catalogue::new();
    for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.map_err(|e| {
            Error::validation(format!("reading hardware csv row {}: {e}", index + 2))
        })?;
        let hardware = Hardware {
            id: row.hostname.clone(),
            hostname: row.hostname,
            bmc_ip: row.bmc_ip,
            bmc_username: row.bmc_username,
            bmc_password: row.bmc_password,
            mac: row.mac,
            ip_address: row.ip_address,
            gateway: row.gateway,
            nameservers: row
                .nameservers
                .split('|')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            netmask: row.netmask,
            disk: row.disk,
            labels: parse_labels(&row.labels)?,
            owner: None,
        };
        catalogue.insert(hardware)?;
    }
    Ok(catalogue)
}

/// Parse semicolon-separated `k=v` label pairs
fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::validation(format!("invalid hardware label: {pair}")))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

/// Build a catalogue from the `Hardware` resources in the management cluster
///
/// Callers construct a fresh catalogue per reconciliation; nothing is cached
/// across reconciles.
pub async fn read_cluster(client: &dyn ClusterClient, namespace: &str) -> Result<Catalogue> {
    let objects = client.list_raw(HARDWARE, namespace).await?;
    let mut catalogue = Catalogue::new();
    for obj in &objects {
        catalogue.insert(hardware_from_dynamic(obj)?)?;
    }
    Ok(catalogue)
}

fn hardware_from_dynamic(obj: &DynamicObject) -> Result<Hardware> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::serialization("hardware resource has no name"))?;
    let labels: BTreeMap<String, String> = obj
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let owner = labels.get(OWNER_NAME_LABEL).cloned();

    let first_interface = obj.data["spec"]["interfaces"]
        .as_array()
        .and_then(|i| i.first())
        .cloned()
        .unwrap_or_default();
    let mac = first_interface["dhcp"]["mac"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let ip_address = first_interface["dhcp"]["ip"]["address"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    Ok(Hardware {
        id: name.clone(),
        hostname: name,
        bmc_ip: String::new(),
        bmc_username: String::new(),
        bmc_password: String::new(),
        mac,
        ip_address,
        gateway: String::new(),
        nameservers: Vec::new(),
        netmask: String::new(),
        disk: String::new(),
        labels,
        owner,
    })
}
