//! Normalized scanner finding shared by every parser.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::host::PortKey;

/// Scanner that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanSource {
    Nessus,
    Nmap,
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nessus => write!(f, "nessus"),
            Self::Nmap => write!(f, "nmap"),
        }
    }
}

/// One plugin or script result.
///
/// `identifier` is the Nessus plugin ID or the Nmap script name and is never
/// empty. `output` is always defined; a missing body is stored as `""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub identifier: String,
    pub output: String,
    pub source: ScanSource,
}

impl Finding {
    /// Build a finding, normalizing an absent output to the empty string.
    ///
    /// Returns `None` when the identifier is blank.
    pub fn new(identifier: &str, output: Option<String>, source: ScanSource) -> Option<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        Some(Self {
            identifier: identifier.to_string(),
            output: output.unwrap_or_default(),
            source,
        })
    }
}

/// A finding as held by the store: the finding plus where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PortKey>,
    pub fingerprint: String,
    #[serde(flatten)]
    pub finding: Finding,
}
