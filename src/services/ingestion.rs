//! Import orchestrator: parse → store → correlate for one scan file.
//!
//! Selects the parser for the declared scan type, parses into a fresh
//! staging store off the async runtime, merges the staging store into the
//! project under the project's lock, then correlates every host the import
//! touched. Imports into the same project queue behind each other; imports
//! into different projects run independently.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::association::{AssociationChange, HostAttack};
use crate::models::summary::{HostDetails, ProjectSummary};
use crate::parsers::{parser_for, ParseWarning, ScanItem, ScanType};
use crate::services::catalog::CatalogHandle;
use crate::services::correlation::{self, CompiledCatalog};
use crate::services::finding_store::FindingStore;
use crate::services::project::ProjectSession;

/// Correlation stopped early because the caller's deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeadlineSignal {
    pub correlated: usize,
    pub remaining: usize,
}

impl From<DeadlineSignal> for EngineError {
    fn from(signal: DeadlineSignal) -> Self {
        EngineError::DeadlineExceeded {
            correlated: signal.correlated,
            remaining: signal.remaining,
        }
    }
}

/// Outcome of correlating a set of hosts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationReport {
    pub catalog_version: u64,
    pub hosts_correlated: usize,
    /// Associations that are new or whose evidence changed.
    pub changes: Vec<AssociationChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_exceeded: Option<DeadlineSignal>,
}

impl CorrelationReport {
    /// The deadline signal as an error, when correlation was cut short.
    pub fn deadline_error(&self) -> Option<EngineError> {
        self.deadline_exceeded.map(EngineError::from)
    }
}

/// Summary of one import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub import_id: Uuid,
    pub project: String,
    pub file_name: String,
    pub scan_type: ScanType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub findings_parsed: usize,
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub warnings: Vec<ParseWarning>,
    pub hosts_touched: usize,
    #[serde(flatten)]
    pub correlation: CorrelationReport,
}

/// Result of parsing one file into a staging store.
#[derive(Debug, Default)]
struct Staged {
    store: FindingStore,
    findings_parsed: usize,
    warnings: Vec<ParseWarning>,
}

/// Drain the parser for `scan_type` into a fresh staging store.
///
/// A fatal parse error discards the staging store, so the project is never
/// left holding part of an unusable file. The error itself carries the
/// records parsed and skipped before the failure.
fn stage(scan_type: ScanType, data: &[u8]) -> Result<Staged, EngineError> {
    let parser = parser_for(scan_type);
    let mut staged = Staged::default();

    for item in parser.items(data) {
        match item? {
            ScanItem::Finding(parsed) => {
                staged.findings_parsed += 1;
                staged
                    .store
                    .add(&parsed.host, parsed.port.as_ref(), parsed.finding);
            }
            ScanItem::Port(host, port) => staged.store.add_port(&host, &port),
            ScanItem::Skipped(warning) => staged.warnings.push(warning),
        }
    }
    Ok(staged)
}

/// Drives imports and owns the per-project sessions.
#[derive(Debug)]
pub struct ImportOrchestrator {
    catalog: Arc<CatalogHandle>,
    projects: Mutex<HashMap<String, Arc<Mutex<ProjectSession>>>>,
    concurrency: usize,
}

impl ImportOrchestrator {
    pub fn new(catalog: Arc<CatalogHandle>, concurrency: usize) -> Self {
        Self {
            catalog,
            projects: Mutex::new(HashMap::new()),
            concurrency: concurrency.max(1),
        }
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    /// Session for `project`, created on first use.
    async fn session(&self, project: &str) -> Arc<Mutex<ProjectSession>> {
        let mut projects = self.projects.lock().await;
        Arc::clone(
            projects
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProjectSession::new(project)))),
        )
    }

    /// Import one scan file into `project`.
    ///
    /// Fails with `UnsupportedScanType` for an unknown `declared_type` and
    /// with `MalformedScanData` when the file is unusable as a whole; in both
    /// cases the project is left untouched. Skipped records are reported as
    /// warnings. When `deadline` passes during correlation, the report holds
    /// the associations computed so far plus a deadline signal.
    pub async fn import(
        &self,
        project: &str,
        file_name: &str,
        data: Vec<u8>,
        declared_type: &str,
        deadline: Option<Instant>,
    ) -> Result<ImportReport, EngineError> {
        let scan_type: ScanType = declared_type.parse()?;
        let import_id = Uuid::new_v4();
        let started_at = Utc::now();

        tracing::info!(
            %import_id,
            project,
            file_name,
            %scan_type,
            bytes = data.len(),
            "Import started"
        );

        let staged = tokio::task::spawn_blocking(move || stage(scan_type, &data))
            .await?
            .inspect_err(|e| {
                tracing::warn!(%import_id, project, file_name, error = %e, "Import rejected");
            })?;

        let session = self.session(project).await;
        let mut session = session.lock().await;

        let absorbed = session.absorb(file_name, staged.store);
        let touched: Vec<IpAddr> = absorbed.touched.iter().copied().collect();
        let correlation = self.correlate_hosts(&mut session, &touched, deadline).await?;

        let report = ImportReport {
            import_id,
            project: project.to_string(),
            file_name: file_name.to_string(),
            scan_type,
            started_at,
            finished_at: Utc::now(),
            findings_parsed: staged.findings_parsed,
            inserted: absorbed.inserted,
            merged: absorbed.merged,
            unchanged: absorbed.unchanged,
            warnings: staged.warnings,
            hosts_touched: touched.len(),
            correlation,
        };

        tracing::info!(
            %import_id,
            project,
            findings = report.findings_parsed,
            inserted = report.inserted,
            merged = report.merged,
            warnings = report.warnings.len(),
            hosts = report.hosts_touched,
            changes = report.correlation.changes.len(),
            "Import finished"
        );

        Ok(report)
    }

    /// Session for `project` if it has been imported into.
    async fn existing(&self, project: &str) -> Option<Arc<Mutex<ProjectSession>>> {
        self.projects.lock().await.get(project).map(Arc::clone)
    }

    /// Re-run correlation for every host in `project` against the current
    /// catalog, e.g. after a catalog reload.
    pub async fn recorrelate(
        &self,
        project: &str,
        deadline: Option<Instant>,
    ) -> Result<CorrelationReport, EngineError> {
        let Some(session) = self.existing(project).await else {
            return Ok(CorrelationReport {
                catalog_version: self.catalog.snapshot().version(),
                ..CorrelationReport::default()
            });
        };
        let mut session = session.lock().await;
        let hosts: Vec<IpAddr> = session.store().hosts().map(|h| h.address).collect();
        self.correlate_hosts(&mut session, &hosts, deadline).await
    }

    /// Correlate `hosts` in parallel over snapshots of their findings and
    /// apply the results to the session in address order.
    async fn correlate_hosts(
        &self,
        session: &mut ProjectSession,
        hosts: &[IpAddr],
        deadline: Option<Instant>,
    ) -> Result<CorrelationReport, EngineError> {
        let catalog = self.catalog.snapshot();
        let compiled = Arc::new(CompiledCatalog::new(&catalog));
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut deadline_exceeded = None;

        for (scheduled, &address) in hosts.iter().enumerate() {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Internal(format!("Correlation scheduler closed: {e}")))?;

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let signal = DeadlineSignal {
                    correlated: scheduled,
                    remaining: hosts.len() - scheduled,
                };
                tracing::warn!(
                    project = session.name(),
                    correlated = signal.correlated,
                    remaining = signal.remaining,
                    "Import deadline reached, not scheduling further hosts"
                );
                deadline_exceeded = Some(signal);
                break;
            }

            let Some(host) = session.store().host(address).cloned() else {
                continue;
            };
            let corpus = session.corpus(address);
            let compiled = Arc::clone(&compiled);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let results = correlation::correlate_host(&host, &corpus, &compiled);
                (address, results)
            });
        }

        let mut results: BTreeMap<IpAddr, Vec<HostAttack>> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (address, attacks) = joined?;
            results.insert(address, attacks);
        }

        let hosts_correlated = results.len();
        let changes = results
            .into_iter()
            .flat_map(|(address, attacks)| session.apply_correlation(address, attacks))
            .collect();

        Ok(CorrelationReport {
            catalog_version: compiled.version(),
            hosts_correlated,
            changes,
            deadline_exceeded,
        })
    }

    /// Every association in `project`, ordered by host then catalog order.
    pub async fn associations(&self, project: &str) -> Vec<HostAttack> {
        match self.existing(project).await {
            Some(session) => session.lock().await.associations().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Summary of `project`; an unknown project summarizes as empty.
    pub async fn summary(&self, project: &str) -> ProjectSummary {
        match self.existing(project).await {
            Some(session) => session.lock().await.summary(),
            None => ProjectSession::new(project).summary(),
        }
    }

    pub async fn host_details(&self, project: &str, address: IpAddr) -> Option<HostDetails> {
        let session = self.existing(project).await?;
        let session = session.lock().await;
        session.host_details(address)
    }
}
