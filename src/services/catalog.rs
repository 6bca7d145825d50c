//! Attack catalog: validated, immutable attack definitions plus a handle
//! that swaps whole catalogs atomically on reload.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::EngineError;
use crate::models::attack::{AttackDefinition, AttackRecord, Keyword};

/// An immutable set of attack definitions in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AttackCatalog {
    version: u64,
    definitions: Vec<AttackDefinition>,
}

impl AttackCatalog {
    /// Validate and classify catalog records.
    ///
    /// Fails on the first entry that lacks a name, a description, or a
    /// non-empty keyword list, has an invalid keyword, or repeats a name.
    pub fn load<I>(records: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = AttackRecord>,
    {
        let mut definitions = Vec::new();
        let mut seen = HashSet::new();

        for (idx, record) in records.into_iter().enumerate() {
            let definition = validate(idx + 1, record)?;
            if !seen.insert(definition.name.clone()) {
                return Err(EngineError::InvalidAttackDefinition {
                    entry: definition.name,
                    reason: "duplicate attack name".to_string(),
                });
            }
            definitions.push(definition);
        }

        Ok(Self {
            version: 0,
            definitions,
        })
    }

    /// Parse a JSON array of `{name, description, keywords}` records.
    pub fn from_json(data: &[u8]) -> Result<Self, EngineError> {
        let records: Vec<AttackRecord> = serde_json::from_slice(data)
            .map_err(|e| EngineError::CatalogSource(format!("Invalid catalog JSON: {e}")))?;
        Self::load(records)
    }

    /// Read and parse a JSON catalog file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            EngineError::CatalogSource(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Definitions in declaration order.
    pub fn all(&self) -> &[AttackDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&AttackDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn validate(ordinal: usize, record: AttackRecord) -> Result<AttackDefinition, EngineError> {
    let entry = record
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let invalid = |reason: &str| EngineError::InvalidAttackDefinition {
        entry: entry.clone().unwrap_or_else(|| format!("entry #{ordinal}")),
        reason: reason.to_string(),
    };

    let Some(name) = entry.clone() else {
        return Err(invalid("missing name"));
    };
    let description = record
        .description
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| invalid("missing description"))?;
    let raw_keywords = record.keywords.ok_or_else(|| invalid("missing keywords"))?;
    if raw_keywords.is_empty() {
        return Err(invalid("keywords must not be empty"));
    }

    let keywords = raw_keywords
        .iter()
        .map(|raw| Keyword::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| invalid(&reason))?;

    Ok(AttackDefinition {
        name,
        description,
        keywords,
    })
}

/// Shared, swappable reference to the current catalog.
///
/// Readers take an `Arc` snapshot and never observe a partially replaced
/// catalog. A failed reload leaves the previous catalog in place.
#[derive(Debug)]
pub struct CatalogHandle {
    current: RwLock<Arc<AttackCatalog>>,
    next_version: AtomicU64,
}

impl CatalogHandle {
    pub fn new(mut catalog: AttackCatalog) -> Self {
        catalog.version = 1;
        Self {
            current: RwLock::new(Arc::new(catalog)),
            next_version: AtomicU64::new(2),
        }
    }

    /// The catalog as of now.
    pub fn snapshot(&self) -> Arc<AttackCatalog> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the whole catalog, returning the new version number.
    pub fn replace(&self, mut catalog: AttackCatalog) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        catalog.version = version;
        let entries = catalog.len();
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(catalog);
        tracing::info!(version, entries, "Attack catalog replaced");
        version
    }

    /// Reload from a JSON file, validating the full set before swapping.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<u64, EngineError> {
        match AttackCatalog::from_path(path.as_ref()) {
            Ok(catalog) => Ok(self.replace(catalog)),
            Err(e) => {
                tracing::warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Attack catalog reload rejected, keeping current catalog"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(name: Option<&str>, description: Option<&str>, keywords: Option<&[&str]>) -> AttackRecord {
        AttackRecord {
            name: name.map(String::from),
            description: description.map(String::from),
            keywords: keywords.map(|k| k.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn entry_of(err: EngineError) -> (String, String) {
        match err {
            EngineError::InvalidAttackDefinition { entry, reason } => (entry, reason),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loads_in_declaration_order() {
        let catalog = AttackCatalog::load(vec![
            record(Some("SMB Relay"), Some("Relay NTLM auth"), Some(&["--57608--"])),
            record(Some("Anonymous FTP"), Some("Log in as anonymous"), Some(&["--ftp-anon--", "Anonymous FTP login allowed"])),
        ])
        .unwrap();

        let names: Vec<&str> = catalog.all().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["SMB Relay", "Anonymous FTP"]);
        assert_eq!(
            catalog.get("Anonymous FTP").unwrap().keywords[1],
            Keyword::Text("Anonymous FTP login allowed".to_string())
        );
    }

    #[test]
    fn empty_keywords_names_the_attack() {
        let err = AttackCatalog::load(vec![record(Some("Null Session"), Some("d"), Some(&[]))]).unwrap_err();
        let (entry, reason) = entry_of(err);
        assert_eq!(entry, "Null Session");
        assert!(reason.contains("empty"));
    }

    #[test]
    fn missing_fields_are_reported() {
        let (entry, reason) = entry_of(AttackCatalog::load(vec![record(Some("A"), None, Some(&["x"]))]).unwrap_err());
        assert_eq!((entry.as_str(), reason.as_str()), ("A", "missing description"));

        let (_, reason) = entry_of(AttackCatalog::load(vec![record(Some("A"), Some("d"), None)]).unwrap_err());
        assert_eq!(reason, "missing keywords");

        let (entry, reason) = entry_of(
            AttackCatalog::load(vec![
                record(Some("A"), Some("d"), Some(&["x"])),
                record(None, Some("d"), Some(&["x"])),
            ])
            .unwrap_err(),
        );
        assert_eq!(entry, "entry #2");
        assert_eq!(reason, "missing name");
    }

    #[test]
    fn empty_identifier_keyword_fails_at_load() {
        let err = AttackCatalog::load(vec![record(Some("Bad"), Some("d"), Some(&["ok", "----"]))]).unwrap_err();
        assert!(err.is_invalid_definition());
        assert_eq!(entry_of(err).0, "Bad");
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = AttackCatalog::load(vec![
            record(Some("A"), Some("d"), Some(&["x"])),
            record(Some("A"), Some("d2"), Some(&["y"])),
        ])
        .unwrap_err();
        assert_eq!(entry_of(err).1, "duplicate attack name");
    }

    #[test]
    fn duplicate_keywords_across_attacks_allowed() {
        let catalog = AttackCatalog::load(vec![
            record(Some("A"), Some("d"), Some(&["--445--"])),
            record(Some("B"), Some("d"), Some(&["--445--"])),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn from_json_reports_bad_documents() {
        let err = AttackCatalog::from_json(b"{not json").unwrap_err();
        assert_eq!(err.code(), "CATALOG_SOURCE");

        let catalog = AttackCatalog::from_json(
            br#"[{"name": "A", "description": "d", "keywords": ["--11011--"]}]"#,
        )
        .unwrap();
        assert_eq!(catalog.all()[0].keywords, vec![Keyword::Identifier("11011".to_string())]);
    }

    #[test]
    fn handle_reload_swaps_atomically() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "A", "description": "d", "keywords": ["x"]}}]"#).unwrap();

        let handle = CatalogHandle::new(AttackCatalog::default());
        let before = handle.snapshot();
        assert_eq!(before.version(), 1);
        assert!(before.is_empty());

        let version = handle.reload(file.path()).unwrap();
        assert_eq!(version, 2);
        let after = handle.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after.version(), 2);
        // Old snapshots stay valid
        assert!(before.is_empty());
    }

    #[test]
    fn failed_reload_keeps_current_catalog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "A", "description": "d", "keywords": []}}]"#).unwrap();

        let initial = AttackCatalog::load(vec![record(Some("Keep"), Some("d"), Some(&["x"]))]).unwrap();
        let handle = CatalogHandle::new(initial);

        assert!(handle.reload(file.path()).is_err());
        assert!(handle.reload("/nonexistent/attacks.json").is_err());
        let current = handle.snapshot();
        assert_eq!(current.version(), 1);
        assert!(current.get("Keep").is_some());
    }
}
