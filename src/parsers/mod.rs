//! Scanner output parsers for normalizing findings from Nessus and Nmap.
//!
//! Each parser implements the `ScanParser` trait, producing a lazy stream of
//! `ScanItem` records from the tool's XML export. Parsing is pure: parsers
//! never touch the finding store.

pub mod nessus;
pub mod nmap;
pub mod xml;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::finding::{Finding, ScanSource};
use crate::models::host::{Host, Port};

/// Declared type of an uploaded scan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Nessus,
    Nmap,
}

impl ScanType {
    pub fn source(&self) -> ScanSource {
        match self {
            Self::Nessus => ScanSource::Nessus,
            Self::Nmap => ScanSource::Nmap,
        }
    }

    /// Guess the scan type from a file name, the way an upload form would.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "nessus" => Some(Self::Nessus),
            "xml" => Some(Self::Nmap),
            _ => None,
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nessus => write!(f, "nessus"),
            Self::Nmap => write!(f, "nmap"),
        }
    }
}

impl FromStr for ScanType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nessus" => Ok(Self::Nessus),
            "nmap" => Ok(Self::Nmap),
            _ => Err(EngineError::UnsupportedScanType(s.to_string())),
        }
    }
}

/// A normalized finding with the host and port it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFinding {
    pub host: Host,
    /// `None` for host-level findings.
    pub port: Option<Port>,
    pub finding: Finding,
}

/// A record that could not be used and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub scan_type: ScanType,
    /// Element kind the record came from (`ReportItem`, `script`, `port`, `host`).
    pub element: String,
    /// 1-based ordinal of the record among elements of the same kind.
    pub record_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} #{}", self.scan_type, self.element, self.record_index)?;
        if let Some(offset) = self.offset {
            write!(f, " (byte {offset})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// One item of a parser's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    Finding(ParsedFinding),
    /// A port seen on a host, whether or not any finding references it.
    Port(Host, Port),
    Skipped(ParseWarning),
}

/// Stream of parsed items. A fatal error is yielded once as `Err`, after
/// which the stream ends.
pub type ScanItems<'a> = Box<dyn Iterator<Item = Result<ScanItem, EngineError>> + Send + 'a>;

/// Trait for pluggable scanner output parsers.
pub trait ScanParser: Send + Sync {
    /// Lazily parse raw scanner output into normalized items.
    fn items<'a>(&self, data: &'a [u8]) -> ScanItems<'a>;

    /// The scan type this parser handles.
    fn scan_type(&self) -> ScanType;
}

/// Select the parser for a declared scan type.
pub fn parser_for(scan_type: ScanType) -> Box<dyn ScanParser> {
    match scan_type {
        ScanType::Nessus => Box::new(nessus::NessusParser::new()),
        ScanType::Nmap => Box::new(nmap::NmapParser::new()),
    }
}

/// Fully materialized output of a parser.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub findings: Vec<ParsedFinding>,
    pub ports: Vec<(Host, Port)>,
    pub warnings: Vec<ParseWarning>,
}

/// Drain a parser into memory, stopping at the first fatal error.
pub fn parse_all(parser: &dyn ScanParser, data: &[u8]) -> Result<ParseResult, EngineError> {
    let mut result = ParseResult::default();
    for item in parser.items(data) {
        match item? {
            ScanItem::Finding(f) => result.findings.push(f),
            ScanItem::Port(host, port) => result.ports.push((host, port)),
            ScanItem::Skipped(w) => result.warnings.push(w),
        }
    }
    Ok(result)
}

/// Read a scan file from disk. Failures name the file so a caller can report
/// it and move on to the next one.
pub async fn read_scan_file(path: &Path) -> Result<Vec<u8>, EngineError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| EngineError::ScanFileUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Tracks the state every XML parser shares: nesting depth, root check,
/// the pending output queue, and what has been emitted or skipped so far.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub scan_type: ScanType,
    pub root: &'static str,
    pub depth: usize,
    pub saw_root: bool,
    pub emitted: usize,
    pub finished: bool,
    pub pending: std::collections::VecDeque<Result<ScanItem, EngineError>>,
    hosts_parsed: std::collections::BTreeSet<IpAddr>,
    skipped: Vec<ParseWarning>,
}

impl StreamState {
    pub fn new(scan_type: ScanType, root: &'static str) -> Self {
        Self {
            scan_type,
            root,
            depth: 0,
            saw_root: false,
            emitted: 0,
            finished: false,
            pending: std::collections::VecDeque::new(),
            hosts_parsed: std::collections::BTreeSet::new(),
            skipped: Vec::new(),
        }
    }

    /// Check the document element. Returns false after queueing a fatal error.
    pub fn open_element(&mut self, name: &str, offset: u64) -> bool {
        if self.depth == 0 {
            if self.saw_root || name != self.root {
                self.fail(
                    Some(offset),
                    format!("expected a single <{}> document element, found <{name}>", self.root),
                );
                return false;
            }
            self.saw_root = true;
        }
        true
    }

    pub fn emit(&mut self, item: ScanItem) {
        if let ScanItem::Finding(parsed) = &item {
            self.emitted += 1;
            self.hosts_parsed.insert(parsed.host.address);
        }
        self.pending.push_back(Ok(item));
    }

    pub fn warn(&mut self, element: &str, record_index: usize, offset: Option<u64>, message: String) {
        let warning = ParseWarning {
            scan_type: self.scan_type,
            element: element.to_string(),
            record_index,
            offset,
            message,
        };
        tracing::warn!(warning = %warning, "Skipping scan record");
        self.skipped.push(warning.clone());
        self.pending.push_back(Ok(ScanItem::Skipped(warning)));
    }

    pub fn fail(&mut self, offset: Option<u64>, reason: String) {
        self.finished = true;
        self.pending.push_back(Err(EngineError::MalformedScanData {
            scan_type: self.scan_type,
            offset,
            records_parsed: self.emitted,
            hosts_parsed: std::mem::take(&mut self.hosts_parsed).into_iter().collect(),
            warnings: std::mem::take(&mut self.skipped),
            reason,
        }));
    }

    /// Handle end of input: unclosed elements or a missing root are fatal.
    pub fn end_of_input(&mut self, offset: u64) {
        if !self.saw_root {
            self.fail(Some(offset), format!("no <{}> document element found", self.root));
        } else if self.depth > 0 {
            self.fail(Some(offset), "unexpected end of file inside an open element".to_string());
        } else {
            self.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_type_parses_declared_tags() {
        assert_eq!("nessus".parse::<ScanType>().unwrap(), ScanType::Nessus);
        assert_eq!("NMAP".parse::<ScanType>().unwrap(), ScanType::Nmap);
    }

    #[test]
    fn unknown_scan_type_is_unsupported() {
        let err = "qualys".parse::<ScanType>().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedScanType(ref t) if t == "qualys"));
    }

    #[tokio::test]
    async fn unreadable_scan_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.nessus");
        let err = read_scan_file(&missing).await.unwrap_err();
        assert_eq!(err.code(), "SCAN_FILE_UNREADABLE");
        assert!(err.to_string().contains("gone.nessus"));

        let present = dir.path().join("scan.xml");
        std::fs::write(&present, b"<nmaprun/>").unwrap();
        assert_eq!(read_scan_file(&present).await.unwrap(), b"<nmaprun/>");
    }

    #[test]
    fn scan_type_from_file_name() {
        assert_eq!(ScanType::from_file_name("corp.nessus"), Some(ScanType::Nessus));
        assert_eq!(ScanType::from_file_name("dmz-scan.XML"), Some(ScanType::Nmap));
        assert_eq!(ScanType::from_file_name("notes.txt"), None);
        assert_eq!(ScanType::from_file_name("noext"), None);
    }

    #[test]
    fn scan_type_serialization() {
        let t: ScanType = serde_json::from_str("\"nmap\"").unwrap();
        assert_eq!(t, ScanType::Nmap);
        assert_eq!(t.source(), ScanSource::Nmap);
    }

    #[test]
    fn warning_display_names_position() {
        let warning = ParseWarning {
            scan_type: ScanType::Nessus,
            element: "ReportItem".to_string(),
            record_index: 250,
            offset: Some(40_960),
            message: "missing pluginID".to_string(),
        };
        assert_eq!(
            warning.to_string(),
            "nessus ReportItem #250 (byte 40960): missing pluginID"
        );
    }
}
