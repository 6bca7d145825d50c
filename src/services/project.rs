//! Per-project state: the accumulated finding store, the current host/attack
//! associations, and the ledger of imported files.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::models::association::{AssociationChange, ChangeKind, HostAttack};
use crate::models::finding::StoredFinding;
use crate::models::host::{Host, Protocol};
use crate::models::summary::{HostDetails, ProjectSummary};
use crate::services::finding_store::{AbsorbOutcome, FindingStore};

#[derive(Debug, Clone)]
pub struct ProjectSession {
    name: String,
    store: FindingStore,
    associations: BTreeMap<IpAddr, Vec<HostAttack>>,
    imported_files: Vec<String>,
}

impl ProjectSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: FindingStore::new(),
            associations: BTreeMap::new(),
            imported_files: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &FindingStore {
        &self.store
    }

    /// Merge one import's staging store and record the file in the ledger.
    pub fn absorb(&mut self, file_name: &str, staging: FindingStore) -> AbsorbOutcome {
        let outcome = self.store.absorb(staging);
        self.imported_files.push(file_name.to_string());
        outcome
    }

    /// Owned copy of a host's findings, for correlation off the session lock.
    pub fn corpus(&self, address: IpAddr) -> Vec<StoredFinding> {
        self.store.findings_for(address).cloned().collect()
    }

    /// Replace a host's associations with fresh correlation results.
    ///
    /// Returns the associations that are new or whose evidence changed;
    /// identical associations are not reported.
    pub fn apply_correlation(
        &mut self,
        address: IpAddr,
        results: Vec<HostAttack>,
    ) -> Vec<AssociationChange> {
        let previous = self.associations.remove(&address).unwrap_or_default();
        let changes = results
            .iter()
            .filter_map(|current| {
                let change = match previous.iter().find(|p| p.attack == current.attack) {
                    None => ChangeKind::New,
                    Some(old) if old != current => ChangeKind::Updated,
                    Some(_) => return None,
                };
                Some(AssociationChange {
                    change,
                    association: current.clone(),
                })
            })
            .collect();

        if !results.is_empty() {
            self.associations.insert(address, results);
        }
        changes
    }

    /// Every association, ordered by host address then catalog order.
    pub fn associations(&self) -> impl Iterator<Item = &HostAttack> + '_ {
        self.associations.values().flatten()
    }

    pub fn imported_files(&self) -> &[String] {
        &self.imported_files
    }

    pub fn summary(&self) -> ProjectSummary {
        let mut tcp_ports = BTreeSet::new();
        let mut udp_ports = BTreeSet::new();
        let hosts: Vec<&Host> = self.store.hosts().collect();

        for host in &hosts {
            for port in self.store.ports(host.address) {
                match port.protocol {
                    Protocol::Tcp => tcp_ports.insert(port.number),
                    Protocol::Udp => udp_ports.insert(port.number),
                };
            }
        }

        let attacks: BTreeSet<&str> = self.associations().map(|a| a.attack.as_str()).collect();

        ProjectSummary {
            project: self.name.clone(),
            hosts: hosts.len(),
            attacks: attacks.len(),
            ips: hosts.iter().map(|h| h.address).collect(),
            tcp_ports: tcp_ports.into_iter().collect(),
            udp_ports: udp_ports.into_iter().collect(),
            imported_files: self.imported_files.clone(),
        }
    }

    pub fn host_details(&self, address: IpAddr) -> Option<HostDetails> {
        let host = self.store.host(address)?;
        Some(HostDetails {
            host: host.clone(),
            ports: self.store.ports(address).cloned().collect(),
            findings: self.corpus(address),
            attacks: self.associations.get(&address).cloned().unwrap_or_default(),
        })
    }
}
