//! Hardware catalogue: the indexed inventory a reconciliation validates
//! against

use std::collections::BTreeMap;

use crate::{Error, Result};

use super::Hardware;

/// An indexed set of hardware records keyed by ID
///
/// Inserts reject duplicate MACs and duplicate IDs; lookups answer the
/// selector-count questions the validators ask.
#[derive(Clone, Debug, Default)]
pub struct Catalogue {
    records: Vec<Hardware>,
}

impl Catalogue {
    /// Empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, rejecting duplicate IDs and MACs
    pub fn insert(&mut self, hardware: Hardware) -> Result<()> {
        if self.records.iter().any(|h| h.id == hardware.id) {
            return Err(Error::validation(format!(
                "duplicate hardware id: {}",
                hardware.id
            )));
        }
        let mac = hardware.mac.to_lowercase();
        if !mac.is_empty() && self.records.iter().any(|h| h.mac.to_lowercase() == mac) {
            return Err(Error::validation(format!(
                "duplicate mac address: {}",
                hardware.mac
            )));
        }
        self.records.push(hardware);
        Ok(())
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the catalogue is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record by ID
    pub fn get(&self, id: &str) -> Option<&Hardware> {
        self.records.iter().find(|h| h.id == id)
    }

    /// All records
    pub fn all(&self) -> &[Hardware] {
        &self.records
    }

    /// Records matching a selector
    pub fn matching<'c>(
        &'c self,
        selector: &'c BTreeMap<String, String>,
    ) -> impl Iterator<Item = &'c Hardware> {
        self.records.iter().filter(move |h| h.matches(selector))
    }

    /// Count of records matching a selector
    pub fn count_matching(&self, selector: &BTreeMap<String, String>) -> usize {
        self.matching(selector).count()
    }

    /// Count of free (machine-unbound) records matching a selector
    pub fn count_free_matching(&self, selector: &BTreeMap<String, String>) -> usize {
        self.matching(selector).filter(|h| h.is_free()).count()
    }

    /// How many of the given selectors each record matches, keyed by record ID
    ///
    /// The mutual-exclusion assertion fails any record whose count exceeds
    /// one.
    pub fn selector_match_counts(
        &self,
        selectors: &[(&str, &BTreeMap<String, String>)],
    ) -> BTreeMap<String, usize> {
        self.records
            .iter()
            .map(|h| {
                let count = selectors.iter().filter(|(_, s)| h.matches(s)).count();
                (h.id.clone(), count)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware(id: &str, mac: &str, labels: &[(&str, &str)], owner: Option<&str>) -> Hardware {
        Hardware {
            id: id.to_string(),
            hostname: id.to_string(),
            bmc_ip: String::new(),
            bmc_username: String::new(),
            bmc_password: String::new(),
            mac: mac.to_string(),
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

    fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut cat = Catalogue::new();
        cat.insert(hardware("a", "aa:00", &[], None)).unwrap();
        let err = cat.insert(hardware("a", "bb:00", &[], None)).unwrap_err();
        assert!(err.to_string().contains("duplicate hardware id"));
    }

    #[test]
    fn test_insert_rejects_duplicate_mac_case_insensitive() {
        let mut cat = Catalogue::new();
        cat.insert(hardware("a", "AA:BB:00", &[], None)).unwrap();
        let err = cat.insert(hardware("b", "aa:bb:00", &[], None)).unwrap_err();
        assert!(err.to_string().contains("duplicate mac"));
    }

    #[test]
    fn test_count_matching_and_free() {
        let mut cat = Catalogue::new();
        cat.insert(hardware("a", "aa:01", &[("type", "cp")], None))
            .unwrap();
        cat.insert(hardware("b", "aa:02", &[("type", "worker")], None))
            .unwrap();
        cat.insert(hardware("c", "aa:03", &[("type", "worker")], Some("mgmt-md-0-x")))
            .unwrap();

        let workers = selector(&[("type", "worker")]);
        assert_eq!(cat.count_matching(&workers), 2);
        assert_eq!(cat.count_free_matching(&workers), 1);
    }

    #[test]
    fn test_selector_match_counts_flags_overlap() {
        let mut cat = Catalogue::new();
        cat.insert(hardware("a", "aa:01", &[("type", "cp"), ("rack", "r1")], None))
            .unwrap();

        let cp = selector(&[("type", "cp")]);
        let r1 = selector(&[("rack", "r1")]);
        let counts = cat.selector_match_counts(&[("cp", &cp), ("md-0", &r1)]);
        assert_eq!(counts["a"], 2);
    }
}
