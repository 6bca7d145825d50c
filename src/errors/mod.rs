//! Engine error taxonomy and the JSON envelope handed to external callers.

use std::net::IpAddr;

use serde::Serialize;

use crate::parsers::{ParseWarning, ScanType};

/// Error detail in the response envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Consistent JSON envelope for everything the engine hands to callers.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> Envelope<T> {
    /// Wrap a successful result in the envelope.
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// Wrap an engine error in the envelope.
    pub fn failure(err: &EngineError) -> Self {
        Self {
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                details: err.details(),
            }),
        }
    }
}

/// Everything that can abort an engine operation.
///
/// Record-level parse problems are not represented here; they are recovered
/// locally and surface as [`crate::parsers::ParseWarning`] values.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Malformed {scan_type} scan data{}: {reason} ({records_parsed} records parsed before failure, {} skipped)", .offset.map(|o| format!(" at byte {o}")).unwrap_or_default(), .warnings.len())]
    MalformedScanData {
        scan_type: ScanType,
        offset: Option<u64>,
        records_parsed: usize,
        /// Hosts that had at least one finding parsed before the failure.
        hosts_parsed: Vec<IpAddr>,
        /// Records skipped before the failure.
        warnings: Vec<ParseWarning>,
        reason: String,
    },

    #[error("Cannot read scan file '{path}': {reason}")]
    ScanFileUnreadable { path: String, reason: String },

    #[error("Unsupported scan type '{0}'. Supported: nessus, nmap")]
    UnsupportedScanType(String),

    #[error("Invalid attack definition '{entry}': {reason}")]
    InvalidAttackDefinition { entry: String, reason: String },

    #[error("Deadline exceeded after correlating {correlated} hosts ({remaining} not scheduled)")]
    DeadlineExceeded { correlated: usize, remaining: usize },

    #[error("Attack catalog source error: {0}")]
    CatalogSource(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedScanData { .. } => "MALFORMED_SCAN_DATA",
            Self::UnsupportedScanType(_) => "UNSUPPORTED_SCAN_TYPE",
            Self::ScanFileUnreadable { .. } => "SCAN_FILE_UNREADABLE",
            Self::InvalidAttackDefinition { .. } => "INVALID_ATTACK_DEFINITION",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::CatalogSource(_) => "CATALOG_SOURCE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Structured context for the envelope. A malformed file reports what
    /// was parsed and skipped before the failure.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MalformedScanData {
                records_parsed,
                hosts_parsed,
                warnings,
                ..
            } => Some(serde_json::json!({
                "records_parsed": records_parsed,
                "hosts_parsed": hosts_parsed,
                "warnings": warnings,
            })),
            _ => None,
        }
    }

    /// Check if this error means the scan file was unusable.
    pub fn is_malformed_scan(&self) -> bool {
        matches!(self, Self::MalformedScanData { .. })
    }

    /// Check if this error came from attack catalog validation.
    pub fn is_invalid_definition(&self) -> bool {
        matches!(self, Self::InvalidAttackDefinition { .. })
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        tracing::error!(error = %e, "Worker task failed");
        Self::Internal(format!("worker task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success() {
        let response = Envelope::success("hello");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["data"], "hello");
        assert!(json["error"].is_null());
    }

    #[test]
    fn envelope_failure() {
        let err = EngineError::UnsupportedScanType("qualys".to_string());
        let response = Envelope::<()>::failure(&err);
        let json = serde_json::to_value(&response).unwrap();
        assert!(json["data"].is_null());
        assert_eq!(json["error"]["code"], "UNSUPPORTED_SCAN_TYPE");
        assert_eq!(
            json["error"]["message"],
            "Unsupported scan type 'qualys'. Supported: nessus, nmap"
        );
    }

    #[test]
    fn malformed_display_includes_offset() {
        let err = EngineError::MalformedScanData {
            scan_type: ScanType::Nessus,
            offset: Some(120),
            records_parsed: 3,
            hosts_parsed: vec!["10.0.0.5".parse().unwrap()],
            warnings: Vec::new(),
            reason: "unexpected end of file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed nessus scan data at byte 120: unexpected end of file (3 records parsed before failure, 0 skipped)"
        );
        assert!(err.is_malformed_scan());
        assert!(!err.is_invalid_definition());
    }

    #[test]
    fn malformed_display_without_offset() {
        let err = EngineError::MalformedScanData {
            scan_type: ScanType::Nmap,
            offset: None,
            records_parsed: 0,
            hosts_parsed: Vec::new(),
            warnings: Vec::new(),
            reason: "empty document".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed nmap scan data: empty document (0 records parsed before failure, 0 skipped)"
        );
    }

    #[test]
    fn malformed_envelope_lists_skipped_records() {
        let err = EngineError::MalformedScanData {
            scan_type: ScanType::Nessus,
            offset: Some(410),
            records_parsed: 1,
            hosts_parsed: vec!["10.0.0.5".parse().unwrap()],
            warnings: vec![ParseWarning {
                scan_type: ScanType::Nessus,
                element: "ReportItem".to_string(),
                record_index: 2,
                offset: Some(88),
                message: "missing pluginID".to_string(),
            }],
            reason: "unexpected end of file inside an open element".to_string(),
        };
        let json = serde_json::to_value(Envelope::<()>::failure(&err)).unwrap();
        let details = &json["error"]["details"];
        assert_eq!(details["records_parsed"], 1);
        assert_eq!(details["hosts_parsed"][0], "10.0.0.5");
        assert_eq!(details["warnings"][0]["record_index"], 2);
        assert_eq!(details["warnings"][0]["message"], "missing pluginID");
        let message = json["error"]["message"].as_str().unwrap();
        assert!(message.ends_with("(1 records parsed before failure, 1 skipped)"));
    }

    #[test]
    fn unreadable_file_has_no_details() {
        let err = EngineError::ScanFileUnreadable {
            path: "missing.nessus".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(err.code(), "SCAN_FILE_UNREADABLE");
        let json = serde_json::to_value(Envelope::<()>::failure(&err)).unwrap();
        assert!(json["error"].get("details").is_none());
    }

    #[test]
    fn invalid_definition_display() {
        let err = EngineError::InvalidAttackDefinition {
            entry: "SMB Relay".to_string(),
            reason: "keywords must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid attack definition 'SMB Relay': keywords must not be empty"
        );
        assert!(err.is_invalid_definition());
        assert_eq!(err.code(), "INVALID_ATTACK_DEFINITION");
    }
}
