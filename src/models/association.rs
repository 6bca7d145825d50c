//! Host-to-attack associations produced by correlation, and the two views
//! callers read them through (by host, by attack).

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::models::attack::Keyword;
use crate::models::finding::{ScanSource, StoredFinding};
use crate::models::host::{Host, PortKey};

/// A finding that satisfied an attack's query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportingFinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PortKey>,
    pub identifier: String,
    pub fingerprint: String,
    pub output: String,
    pub source: ScanSource,
    /// First keyword that matched; identifier keywords take precedence.
    pub matched_by: Keyword,
}

impl SupportingFinding {
    pub fn from_stored(stored: &StoredFinding, matched_by: Keyword) -> Self {
        Self {
            port: stored.port,
            identifier: stored.finding.identifier.clone(),
            fingerprint: stored.fingerprint.clone(),
            output: stored.finding.output.clone(),
            source: stored.finding.source,
            matched_by,
        }
    }
}

/// A host that appears vulnerable to an attack, with the evidence.
///
/// The evidence list is never empty: [`HostAttack::new`] refuses to build one
/// without supporting findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostAttack {
    pub host: Host,
    pub attack: String,
    pub description: String,
    evidence: Vec<SupportingFinding>,
}

impl HostAttack {
    pub fn new(
        host: Host,
        attack: &str,
        description: &str,
        evidence: Vec<SupportingFinding>,
    ) -> Option<Self> {
        if evidence.is_empty() {
            return None;
        }
        Some(Self {
            host,
            attack: attack.to_string(),
            description: description.to_string(),
            evidence,
        })
    }

    pub fn evidence(&self) -> &[SupportingFinding] {
        &self.evidence
    }

    /// Ports referenced by the evidence, deduplicated and ordered.
    pub fn ports(&self) -> Vec<PortKey> {
        let mut ports: Vec<PortKey> = self.evidence.iter().filter_map(|e| e.port).collect();
        ports.sort();
        ports.dedup();
        ports
    }
}

/// Whether an association returned from an import is new or replaces an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
}

/// An association that changed as a result of an import or re-correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationChange {
    pub change: ChangeKind,
    #[serde(flatten)]
    pub association: HostAttack,
}

/// Group associations by host address.
pub fn group_by_host<'a, I>(associations: I) -> BTreeMap<IpAddr, Vec<&'a HostAttack>>
where
    I: IntoIterator<Item = &'a HostAttack>,
{
    let mut grouped: BTreeMap<IpAddr, Vec<&HostAttack>> = BTreeMap::new();
    for association in associations {
        grouped
            .entry(association.host.address)
            .or_default()
            .push(association);
    }
    grouped
}

/// Group associations by attack name.
pub fn group_by_attack<'a, I>(associations: I) -> BTreeMap<String, Vec<&'a HostAttack>>
where
    I: IntoIterator<Item = &'a HostAttack>,
{
    let mut grouped: BTreeMap<String, Vec<&HostAttack>> = BTreeMap::new();
    for association in associations {
        grouped
            .entry(association.attack.clone())
            .or_default()
            .push(association);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host::Protocol;

    fn evidence(port: Option<u16>, identifier: &str) -> SupportingFinding {
        SupportingFinding {
            port: port.map(|number| PortKey {
                number,
                protocol: Protocol::Tcp,
            }),
            identifier: identifier.to_string(),
            fingerprint: "f".repeat(64),
            output: String::new(),
            source: ScanSource::Nessus,
            matched_by: Keyword::Identifier(identifier.to_string()),
        }
    }

    fn association(ip: &str, attack: &str) -> HostAttack {
        HostAttack::new(
            Host::new(ip.parse().unwrap()),
            attack,
            "desc",
            vec![evidence(Some(445), "57608")],
        )
        .unwrap()
    }

    #[test]
    fn association_requires_evidence() {
        let host = Host::new("10.0.0.5".parse().unwrap());
        assert!(HostAttack::new(host, "SMB Relay", "desc", vec![]).is_none());
    }

    #[test]
    fn ports_are_deduplicated() {
        let a = HostAttack::new(
            Host::new("10.0.0.5".parse().unwrap()),
            "SMB Relay",
            "desc",
            vec![
                evidence(Some(445), "57608"),
                evidence(Some(139), "11011"),
                evidence(Some(445), "11011"),
                evidence(None, "10394"),
            ],
        )
        .unwrap();
        let ports: Vec<u16> = a.ports().iter().map(|p| p.number).collect();
        assert_eq!(ports, vec![139, 445]);
    }

    #[test]
    fn groups_by_host_and_attack() {
        let all = vec![
            association("10.0.0.7", "SMB Relay"),
            association("10.0.0.5", "SMB Relay"),
            association("10.0.0.5", "Anonymous FTP"),
        ];

        let by_host = group_by_host(&all);
        assert_eq!(by_host.len(), 2);
        let first = by_host.keys().next().unwrap();
        assert_eq!(first.to_string(), "10.0.0.5");
        assert_eq!(by_host[first].len(), 2);

        let by_attack = group_by_attack(&all);
        assert_eq!(by_attack["SMB Relay"].len(), 2);
        assert_eq!(by_attack["Anonymous FTP"].len(), 1);
    }

    #[test]
    fn change_serializes_flat() {
        let change = AssociationChange {
            change: ChangeKind::New,
            association: association("10.0.0.5", "SMB Relay"),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["change"], "new");
        assert_eq!(json["attack"], "SMB Relay");
        assert_eq!(json["evidence"][0]["identifier"], "57608");
    }
}
