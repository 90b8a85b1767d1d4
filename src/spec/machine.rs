//! Machine configuration types

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Machine-level configuration for a machine group
///
/// One machine config may back multiple machine groups (control plane,
/// workers, etcd). The placement variant must match the cluster's datacenter
/// provider.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    /// Machine config name, the target of machine-group refs
    pub name: String,

    /// Operating system family
    pub os_family: OsFamily,

    /// Machine users; the first user carries the SSH authorized key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,

    /// Host OS configuration (NTP, Bottlerocket settings)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_os_configuration: Option<HostOsConfig>,

    /// Provider-specific placement
    #[serde(flatten)]
    pub placement: Placement,
}

impl MachineConfig {
    /// First user's first SSH authorized key, comment-stripped
    pub fn ssh_authorized_key(&self) -> Result<String> {
        let user = self
            .users
            .first()
            .ok_or_else(|| Error::validation(format!("machine config {} has no users", self.name)))?;
        let key = user.ssh_authorized_keys.first().ok_or_else(|| {
            Error::validation(format!(
                "machine config {} user {} has no ssh authorized keys",
                self.name, user.name
            ))
        })?;
        strip_ssh_key_comment(key)
    }

    /// First user's name, when present
    pub fn ssh_username(&self) -> Option<&str> {
        self.users.first().map(|u| u.name.as_str())
    }

    /// NTP servers from the host OS configuration
    pub fn ntp_servers(&self) -> Option<&[String]> {
        self.host_os_configuration
            .as_ref()?
            .ntp_configuration
            .as_ref()
            .map(|n| n.servers.as_slice())
    }
}

/// Supported operating system families
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Ubuntu (cloud-config bootstrap format)
    #[default]
    Ubuntu,
    /// Bottlerocket (settings-based bootstrap format)
    Bottlerocket,
    /// Red Hat Enterprise Linux (cloud-config bootstrap format)
    #[serde(rename = "redhat")]
    RedHat,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ubuntu => write!(f, "ubuntu"),
            Self::Bottlerocket => write!(f, "bottlerocket"),
            Self::RedHat => write!(f, "redhat"),
        }
    }
}

/// A machine user
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Login name
    pub name: String,
    /// SSH authorized keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

/// Host OS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostOsConfig {
    /// NTP configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_configuration: Option<NtpConfig>,
    /// Bottlerocket settings (bottlerocket OS family only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottlerocket_configuration: Option<BottlerocketSettings>,
}

/// NTP servers for the host OS
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NtpConfig {
    /// NTP server addresses
    pub servers: Vec<String>,
}

/// Bottlerocket host settings rendered into machine templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BottlerocketSettings {
    /// Kernel sysctl settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kernel_sysctl: BTreeMap<String, String>,
    /// Maximum concurrent image pulls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i32>,
}

/// Provider-specific machine placement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum Placement {
    /// Virtualization platform placement
    VSphere(VspherePlacement),
    /// Bare-metal hardware selector
    #[serde(rename_all = "camelCase")]
    Tinkerbell {
        /// Label map binding hardware to this machine group
        #[serde(default)]
        hardware_selector: BTreeMap<String, String>,
    },
    /// No placement configuration (docker sandbox)
    None {},
}

impl Default for Placement {
    fn default() -> Self {
        Self::None {}
    }
}

impl Placement {
    /// Bare-metal hardware selector, when this is a tinkerbell placement
    pub fn hardware_selector(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Tinkerbell { hardware_selector } => Some(hardware_selector),
            _ => None,
        }
    }

    /// Virtualization placement, when this is a vsphere placement
    pub fn vsphere(&self) -> Option<&VspherePlacement> {
        match self {
            Self::VSphere(p) => Some(p),
            _ => None,
        }
    }
}

/// Virtualization platform machine placement and sizing
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VspherePlacement {
    /// Datastore path
    pub datastore: String,
    /// VM folder
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
    /// Resource pool path
    pub resource_pool: String,
    /// OVA template path
    pub template: String,
    /// Memory in MiB
    pub memory_mi_b: i64,
    /// Virtual CPU count
    pub num_cpus: i32,
    /// Disk size in GiB
    pub disk_gi_b: i32,
    /// Storage policy name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_policy_name: String,
    /// Tag IDs attached to created VMs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,
}

/// Strip the comment field from an SSH authorized key
///
/// Authorized keys are `<type> <base64> [comment]`; the rendered machine
/// templates carry only type and key material.
pub fn strip_ssh_key_comment(key: &str) -> Result<String> {
    let mut parts = key.split_whitespace();
    let key_type = parts
        .next()
        .ok_or_else(|| Error::validation("ssh authorized key is empty"))?;
    let material = parts.next().ok_or_else(|| {
        Error::validation(format!("ssh authorized key has no key material: {key}"))
    })?;
    Ok(format!("{key_type} {material}"))
}
