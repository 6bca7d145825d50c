//! Keyed finding storage with merge-on-duplicate upsert.
//!
//! Findings are keyed by (host address, port or host-level, identifier). A
//! second finding under the same key is merged into the first: outputs are
//! joined with [`OUTPUT_SEPARATOR`] and the earliest source is kept. Ordered
//! maps keep every iteration deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::Serialize;

use crate::models::finding::{Finding, StoredFinding};
use crate::models::host::{Host, Port, PortKey};
use crate::services::fingerprint;

/// Joins outputs of merged findings.
pub const OUTPUT_SEPARATOR: &str = "\n";

type FindingKey = (Option<PortKey>, String);

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Merged,
    Unchanged,
}

/// Totals from absorbing a staging store into a longer-lived one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsorbOutcome {
    pub touched: BTreeSet<IpAddr>,
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
}

impl AbsorbOutcome {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Merged => self.merged += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct HostEntry {
    host: Host,
    ports: BTreeMap<PortKey, Port>,
    findings: BTreeMap<FindingKey, StoredFinding>,
}

/// Findings accumulated for one import session or one project.
#[derive(Debug, Clone, Default)]
pub struct FindingStore {
    hosts: BTreeMap<IpAddr, HostEntry>,
}

impl FindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host entry for `host`, created on first reference. The first-seen
    /// hostname is kept.
    fn entry(&mut self, host: &Host) -> &mut HostEntry {
        let entry = self.hosts.entry(host.address).or_insert_with(|| HostEntry {
            host: host.clone(),
            ports: BTreeMap::new(),
            findings: BTreeMap::new(),
        });
        if entry.host.hostname.is_none() && host.hostname.is_some() {
            entry.host.hostname = host.hostname.clone();
        }
        entry
    }

    /// Record a port on a host. A service name fills in a port that had none.
    pub fn add_port(&mut self, host: &Host, port: &Port) {
        register_port(self.entry(host), port);
    }

    /// Insert or merge a finding under its (host, port, identifier) key.
    pub fn add(&mut self, host: &Host, port: Option<&Port>, finding: Finding) -> UpsertOutcome {
        let entry = self.entry(host);
        if let Some(port) = port {
            register_port(entry, port);
        }
        let port_key = port.map(Port::key);
        let fingerprint = fingerprint::compute(host.address, port_key, &finding.identifier);
        upsert(
            entry,
            StoredFinding {
                port: port_key,
                fingerprint,
                finding,
            },
        )
    }

    /// Merge every host, port and finding of `staging` into this store.
    pub fn absorb(&mut self, staging: FindingStore) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();
        for (address, incoming) in staging.hosts {
            outcome.touched.insert(address);
            let entry = self.entry(&incoming.host);
            for port in incoming.ports.values() {
                register_port(entry, port);
            }
            for stored in incoming.findings.into_values() {
                outcome.record(upsert(entry, stored));
            }
        }
        outcome
    }

    /// Every finding stored for a host, ordered by port then identifier.
    pub fn findings_for(&self, address: IpAddr) -> impl Iterator<Item = &StoredFinding> + '_ {
        self.hosts
            .get(&address)
            .into_iter()
            .flat_map(|entry| entry.findings.values())
    }

    pub fn host(&self, address: IpAddr) -> Option<&Host> {
        self.hosts.get(&address).map(|entry| &entry.host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> + '_ {
        self.hosts.values().map(|entry| &entry.host)
    }

    pub fn ports(&self, address: IpAddr) -> impl Iterator<Item = &Port> + '_ {
        self.hosts
            .get(&address)
            .into_iter()
            .flat_map(|entry| entry.ports.values())
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Total number of stored findings.
    pub fn len(&self) -> usize {
        self.hosts.values().map(|entry| entry.findings.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn register_port(entry: &mut HostEntry, port: &Port) {
    let existing = entry.ports.entry(port.key()).or_insert_with(|| port.clone());
    if existing.service.is_none() {
        existing.service = port.service.clone();
    }
}

fn upsert(entry: &mut HostEntry, stored: StoredFinding) -> UpsertOutcome {
    let key = (stored.port, stored.finding.identifier.clone());
    match entry.findings.get_mut(&key) {
        None => {
            entry.findings.insert(key, stored);
            UpsertOutcome::Inserted
        }
        Some(existing) => match merge_output(&existing.finding.output, &stored.finding.output) {
            Some(merged) => {
                existing.finding.output = merged;
                UpsertOutcome::Merged
            }
            None => UpsertOutcome::Unchanged,
        },
    }
}

/// Merge an incoming output into an existing one.
///
/// Returns `None` when the incoming output adds nothing: it is empty, or it
/// already appears in the existing output as a whole separator-delimited
/// segment. Merging is therefore idempotent.
pub fn merge_output(existing: &str, incoming: &str) -> Option<String> {
    if incoming.is_empty() || contains_segment(existing, incoming) {
        return None;
    }
    if existing.is_empty() {
        return Some(incoming.to_string());
    }
    Some(format!("{existing}{OUTPUT_SEPARATOR}{incoming}"))
}

fn contains_segment(haystack: &str, segment: &str) -> bool {
    if haystack == segment {
        return true;
    }
    let sep = OUTPUT_SEPARATOR;
    haystack.starts_with(&format!("{segment}{sep}"))
        || haystack.ends_with(&format!("{sep}{segment}"))
        || haystack.contains(&format!("{sep}{segment}{sep}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::finding::ScanSource;
    use crate::models::host::Protocol;

    fn host(ip: &str) -> Host {
        Host::new(ip.parse().unwrap())
    }

    fn finding(id: &str, output: &str, source: ScanSource) -> Finding {
        Finding::new(id, Some(output.to_string()), source).unwrap()
    }

    fn smb() -> Port {
        Port::new(445, Protocol::Tcp)
    }

    fn snapshot(store: &FindingStore) -> Vec<StoredFinding> {
        store
            .hosts()
            .flat_map(|h| store.findings_for(h.address))
            .cloned()
            .collect()
    }

    #[test]
    fn insert_then_merge_then_unchanged() {
        let mut store = FindingStore::new();
        let h = host("10.0.0.5");
        let p = smb();

        let nessus = |output| finding("57608", output, ScanSource::Nessus);

        let first = store.add(&h, Some(&p), nessus("signing disabled"));
        let second = store.add(&h, Some(&p), nessus("not required"));
        let third = store.add(&h, Some(&p), nessus("not required"));

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Merged);
        assert_eq!(third, UpsertOutcome::Unchanged);
        assert_eq!(store.len(), 1);

        let stored: Vec<_> = store.findings_for(h.address).collect();
        assert_eq!(stored[0].finding.output, "signing disabled\nnot required");
    }

    #[test]
    fn merge_keeps_earliest_source() {
        let mut store = FindingStore::new();
        let h = host("10.0.0.5");
        store.add(&h, None, finding("os", "Windows", ScanSource::Nmap));
        store.add(&h, None, finding("os", "Server 2016", ScanSource::Nessus));

        let stored: Vec<_> = store.findings_for(h.address).collect();
        assert_eq!(stored[0].finding.source, ScanSource::Nmap);
    }

    #[test]
    fn host_level_and_port_level_are_distinct_keys() {
        let mut store = FindingStore::new();
        let h = host("10.0.0.5");
        store.add(&h, None, finding("smb-os-discovery", "a", ScanSource::Nmap));
        store.add(&h, Some(&smb()), finding("smb-os-discovery", "a", ScanSource::Nmap));
        store.add(
            &h,
            Some(&Port::new(445, Protocol::Udp)),
            finding("smb-os-discovery", "a", ScanSource::Nmap),
        );
        assert_eq!(store.len(), 3);
        assert_eq!(store.ports(h.address).count(), 2);
    }

    #[test]
    fn empty_output_never_adds_a_separator() {
        let mut store = FindingStore::new();
        let h = host("10.0.0.5");
        store.add(&h, None, finding("19506", "", ScanSource::Nessus));
        assert_eq!(
            store.add(&h, None, finding("19506", "", ScanSource::Nessus)),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.add(&h, None, finding("19506", "scan info", ScanSource::Nessus)),
            UpsertOutcome::Merged
        );
        let stored: Vec<_> = store.findings_for(h.address).collect();
        assert_eq!(stored[0].finding.output, "scan info");
    }

    #[test]
    fn merge_output_segments() {
        assert_eq!(merge_output("a", "b").as_deref(), Some("a\nb"));
        assert_eq!(merge_output("a\nb\nc", "b"), None);
        assert_eq!(merge_output("a\nb", "a"), None);
        assert_eq!(merge_output("a\nb", "b"), None);
        assert_eq!(merge_output("ab", "b").as_deref(), Some("ab\nb"));
        assert_eq!(merge_output("line1\nline2", "line1\nline2"), None);
    }

    #[test]
    fn absorb_is_idempotent() {
        let build = || {
            let mut staging = FindingStore::new();
            let h = host("10.0.0.5").with_hostname(Some("dc01".to_string()));
            staging.add(&h, Some(&smb()), finding("57608", "one", ScanSource::Nessus));
            staging.add(&h, Some(&smb()), finding("57608", "two", ScanSource::Nessus));
            staging.add(&host("10.0.0.9"), None, finding("19506", "", ScanSource::Nessus));
            staging
        };

        let mut project = FindingStore::new();
        let first = project.absorb(build());
        assert_eq!(first.inserted, 2);
        assert_eq!(first.touched.len(), 2);

        let before = snapshot(&project);
        let second = project.absorb(build());
        let after = snapshot(&project);

        assert_eq!(second.inserted, 0);
        assert_eq!(second.merged, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(before, after);
    }

    #[test]
    fn first_hostname_and_service_are_kept() {
        let mut store = FindingStore::new();
        let addr = "10.0.0.5";
        store.add_port(&host(addr), &smb());
        store.add_port(
            &host(addr).with_hostname(Some("dc01".to_string())),
            &smb().with_service(Some("microsoft-ds".to_string())),
        );
        store.add_port(
            &host(addr).with_hostname(Some("other".to_string())),
            &smb().with_service(Some("cifs".to_string())),
        );

        let ip = addr.parse().unwrap();
        assert_eq!(store.host(ip).unwrap().hostname.as_deref(), Some("dc01"));
        let port = store.ports(ip).next().unwrap();
        assert_eq!(port.service.as_deref(), Some("microsoft-ds"));
    }

    #[test]
    fn fingerprint_is_assigned_on_insert() {
        let mut store = FindingStore::new();
        let h = host("10.0.0.5");
        store.add(&h, Some(&smb()), finding("57608", "x", ScanSource::Nessus));
        let stored = store.findings_for(h.address).next().unwrap();
        assert_eq!(
            stored.fingerprint,
            fingerprint::compute(h.address, Some(smb().key()), "57608")
        );
    }

    #[test]
    fn unknown_host_has_no_findings() {
        let store = FindingStore::new();
        assert!(store.is_empty());
        assert_eq!(store.findings_for("10.0.0.1".parse().unwrap()).count(), 0);
    }
}
