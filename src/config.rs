//! Environment-backed configuration contracts
//!
//! Credentials never live in the cluster spec. Registry-mirror and provider
//! credentials are read from the environment at render time, and the license
//! token is read once at CLI startup.

use crate::{Error, Result};

/// Env var carrying the registry-mirror username
pub const REGISTRY_USERNAME_ENV_VAR: &str = "REGISTRY_USERNAME";
/// Env var carrying the registry-mirror password
pub const REGISTRY_PASSWORD_ENV_VAR: &str = "REGISTRY_PASSWORD";
/// Env var carrying the license token
pub const LICENSE_ENV_VAR: &str = "EKSA_LICENSE";

/// Registry mirror credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Mirror username
    pub username: String,
    /// Mirror password
    pub password: String,
}

/// Read registry-mirror credentials from the environment
///
/// Both variables must be present; an authenticated mirror with missing
/// credentials is a validation failure the user has to fix.
pub fn read_credentials() -> Result<RegistryCredentials> {
    let username = required_env(REGISTRY_USERNAME_ENV_VAR)?;
    let password = required_env(REGISTRY_PASSWORD_ENV_VAR)?;
    Ok(RegistryCredentials { username, password })
}

/// Provider credentials read from `EKSA_<PROVIDER>_USERNAME` / `..._PASSWORD`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderCredentials {
    /// Provider API username
    pub username: String,
    /// Provider API password
    pub password: String,
}

/// Read credentials for the named provider (e.g. `VSPHERE`, `CLOUDSTACK`)
pub fn read_provider_credentials(provider: &str) -> Result<ProviderCredentials> {
    let upper = provider.to_uppercase();
    let username = required_env(&format!("EKSA_{upper}_USERNAME"))?;
    let password = required_env(&format!("EKSA_{upper}_PASSWORD"))?;
    Ok(ProviderCredentials { username, password })
}

/// Read the license token, if one is set
pub fn read_license() -> Option<String> {
    std::env::var(LICENSE_ENV_VAR).ok().filter(|v| !v.is_empty())
}

fn required_env(var: &str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation(format!("environment variable {var} is not set")))
}
