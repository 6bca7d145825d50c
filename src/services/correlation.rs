//! Correlation engine linking hosts to the attacks their findings suggest.
//!
//! Pure matching logic over a read-only finding corpus and a read-only
//! catalog. Each attack's keyword list is compiled once per catalog and
//! reused across hosts. Callers own storage of the resulting associations.

use crate::models::association::{HostAttack, SupportingFinding};
use crate::models::attack::AttackDefinition;
use crate::models::finding::StoredFinding;
use crate::models::host::Host;
use crate::services::catalog::AttackCatalog;
use crate::services::finding_store::FindingStore;
use crate::services::query::{self, CompiledQuery};

/// Every attack of a catalog with its compiled predicate, in catalog order.
#[derive(Debug, Clone)]
pub struct CompiledCatalog {
    version: u64,
    attacks: Vec<(AttackDefinition, CompiledQuery)>,
}

impl CompiledCatalog {
    pub fn new(catalog: &AttackCatalog) -> Self {
        let attacks = catalog
            .all()
            .iter()
            .map(|definition| (definition.clone(), query::compile(&definition.keywords)))
            .collect();
        Self {
            version: catalog.version(),
            attacks,
        }
    }

    /// Version of the catalog this was compiled from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.attacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attacks.is_empty()
    }
}

/// Correlate one host's findings against every compiled attack.
///
/// An association is produced only when at least one finding matches; its
/// evidence holds exactly the matching findings, each once, in corpus order.
pub fn correlate_host(
    host: &Host,
    corpus: &[StoredFinding],
    catalog: &CompiledCatalog,
) -> Vec<HostAttack> {
    catalog
        .attacks
        .iter()
        .filter_map(|(definition, compiled)| {
            let evidence: Vec<SupportingFinding> = corpus
                .iter()
                .filter_map(|stored| {
                    compiled
                        .match_keyword(&stored.finding)
                        .map(|keyword| SupportingFinding::from_stored(stored, keyword.clone()))
                })
                .collect();
            HostAttack::new(host.clone(), &definition.name, &definition.description, evidence)
        })
        .collect()
}

/// Correlate a host held in `store` against `catalog`.
///
/// Returns no associations for a host the store has never seen.
pub fn correlate(host: &Host, catalog: &AttackCatalog, store: &FindingStore) -> Vec<HostAttack> {
    let corpus: Vec<StoredFinding> = store.findings_for(host.address).cloned().collect();
    correlate_host(host, &corpus, &CompiledCatalog::new(catalog))
}
