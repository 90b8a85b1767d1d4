//! Process-wide feature gates
//!
//! Features are toggled through environment variables (`FEATURE_<NAME>`) or a
//! comma-separated gate list (`FEATURE_GATES=name=bool,…`). Lookups are
//! cached in a process-wide table: the first read of a feature pins its value
//! for the life of the process, and the gate list is parsed exactly once.
//! Tests reset the cache explicitly.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::debug;

/// Env var gating full lifecycle support for bare-metal in-place upgrades
pub const IN_PLACE_UPGRADES_ENV_VAR: &str = "FEATURE_IN_PLACE_UPGRADES";
/// Gate name matching [`IN_PLACE_UPGRADES_ENV_VAR`] in the gate list
pub const IN_PLACE_UPGRADES_GATE: &str = "InPlaceUpgrades";

/// Env var list consumed on first read, e.g. `FEATURE_GATES=InPlaceUpgrades=true`
pub const FEATURE_GATES_ENV_VAR: &str = "FEATURE_GATES";

/// A named feature whose activation is decided by the global table
pub struct Feature {
    /// Human-readable feature name for logs
    pub name: &'static str,
    /// Env var that activates the feature
    pub env_var: &'static str,
    /// Optional gate-list entry that also activates it
    pub gate: Option<&'static str>,
}

/// Bare-metal in-place upgrade support
pub fn in_place_upgrades() -> Feature {
    Feature {
        name: "In-place upgrades",
        env_var: IN_PLACE_UPGRADES_ENV_VAR,
        gate: Some(IN_PLACE_UPGRADES_GATE),
    }
}

/// Whether the given feature is active for this process
pub fn is_active(feature: Feature) -> bool {
    let active = global().is_active(&feature);
    debug!(feature = feature.name, active, "feature gate evaluated");
    active
}

/// Clear the cache and gate state. Test-only: production code relies on the
/// one-shot semantics.
#[cfg(test)]
pub fn clear_cache() {
    let g = global();
    g.cache.lock().expect("feature cache poisoned").clear();
    *g.gates.lock().expect("feature gates poisoned") = None;
}

struct FeatureTable {
    /// Feature env var -> pinned activation
    cache: Mutex<HashMap<String, bool>>,
    /// Parsed FEATURE_GATES entries; None until first read
    gates: Mutex<Option<HashMap<String, bool>>>,
}

static GLOBAL: OnceLock<FeatureTable> = OnceLock::new();

fn global() -> &'static FeatureTable {
    GLOBAL.get_or_init(|| FeatureTable {
        cache: Mutex::new(HashMap::new()),
        gates: Mutex::new(None),
    })
}

impl FeatureTable {
    fn is_active(&self, feature: &Feature) -> bool {
        if let Some(&cached) = self
            .cache
            .lock()
            .expect("feature cache poisoned")
            .get(feature.env_var)
        {
            return cached;
        }

        let active =
            self.env_var_true(feature.env_var) || feature.gate.is_some_and(|g| self.gate_true(g));

        self.cache
            .lock()
            .expect("feature cache poisoned")
            .insert(feature.env_var.to_string(), active);
        active
    }

    fn env_var_true(&self, var: &str) -> bool {
        std::env::var(var).map(|v| v == "true").unwrap_or(false)
    }

    fn gate_true(&self, gate: &str) -> bool {
        let mut gates = self.gates.lock().expect("feature gates poisoned");
        let parsed = gates.get_or_insert_with(|| {
            parse_gates(&std::env::var(FEATURE_GATES_ENV_VAR).unwrap_or_default())
        });
        parsed.get(gate).copied().unwrap_or(false)
    }
}

/// Parse a `name=bool,…` gate list. Malformed entries are skipped.
fn parse_gates(raw: &str) -> HashMap<String, bool> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value == "true"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns a distinct env var, and the cache-touching tests run
    // serialized so a reset in one cannot interleave with a read in another.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_inactive_when_env_var_unset() {
        let _guard = TEST_LOCK.lock().unwrap();
        clear_cache();
        let feature = Feature {
            name: "unset",
            env_var: "FEATURE_TEST_UNSET",
            gate: None,
        };
        std::env::remove_var(feature.env_var);
        assert!(!is_active(feature));
    }

    #[test]
    fn test_env_var_false_is_inactive() {
        let _guard = TEST_LOCK.lock().unwrap();
        clear_cache();
        let feature = Feature {
            name: "false",
            env_var: "FEATURE_TEST_FALSE",
            gate: None,
        };
        std::env::set_var(feature.env_var, "false");
        assert!(!is_active(feature));
        std::env::remove_var("FEATURE_TEST_FALSE");
    }

    #[test]
    fn test_env_var_true_is_active() {
        let _guard = TEST_LOCK.lock().unwrap();
        clear_cache();
        let feature = Feature {
            name: "true",
            env_var: "FEATURE_TEST_TRUE",
            gate: None,
        };
        std::env::set_var(feature.env_var, "true");
        assert!(is_active(feature));
        std::env::remove_var("FEATURE_TEST_TRUE");
    }

    #[test]
    fn test_first_read_pins_value() {
        let _guard = TEST_LOCK.lock().unwrap();
        clear_cache();
        std::env::set_var("FEATURE_TEST_PINNED", "true");
        assert!(is_active(Feature {
            name: "pinned",
            env_var: "FEATURE_TEST_PINNED",
            gate: None,
        }));

        // Changing the env after the first read must not change the answer.
        std::env::set_var("FEATURE_TEST_PINNED", "false");
        assert!(is_active(Feature {
            name: "pinned",
            env_var: "FEATURE_TEST_PINNED",
            gate: None,
        }));
        std::env::remove_var("FEATURE_TEST_PINNED");
    }

    #[test]
    fn test_parse_gates_skips_malformed_entries() {
        let gates = parse_gates("a=true,,=true,b,c=false");
        assert_eq!(gates.get("a"), Some(&true));
        assert_eq!(gates.get("c"), Some(&false));
        assert!(!gates.contains_key("b"));
        assert!(!gates.contains_key(""));
    }

    #[test]
    fn test_gate_list_entry_activates_feature() {
        // Exercise the parsed-gate path directly to stay independent of the
        // process-wide FEATURE_GATES variable.
        let gates = parse_gates("gate1=,gate2=false,TestGate=true,");
        assert_eq!(gates.get("TestGate"), Some(&true));
        assert_eq!(gates.get("gate2"), Some(&false));
        assert_eq!(gates.get("gate1"), Some(&false));
    }
}
