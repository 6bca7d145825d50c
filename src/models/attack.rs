//! Attack definitions and their keyword rules.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Delimiter wrapping an identifier keyword, e.g. `--11011--`.
pub const IDENTIFIER_DELIMITER: &str = "--";

/// Identifier keywords are the identifier wrapped in the delimiter on both sides.
static IDENTIFIER_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^--(?P<identifier>.*)--$").expect("identifier keyword pattern is valid")
});

/// A declarative catalog record as read from the catalog source.
///
/// Every field is optional at this layer so a missing field can be reported
/// by name instead of as a generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AttackRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
}

/// A keyword rule, classified once when the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Keyword {
    /// Matches a finding whose identifier equals the value exactly.
    Identifier(String),
    /// Matches a finding whose output contains the value.
    Text(String),
}

impl Keyword {
    /// Classify a raw catalog keyword.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Err("keywords must not be blank".to_string());
        }

        if let Some(caps) = IDENTIFIER_KEYWORD.captures(raw) {
            let identifier = caps.name("identifier").map_or("", |m| m.as_str());
            if identifier.trim().is_empty() {
                return Err(format!("identifier keyword '{raw}' wraps an empty identifier"));
            }
            return Ok(Self::Identifier(identifier.to_string()));
        }

        Ok(Self::Text(raw.to_string()))
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Identifier(v) | Self::Text(v) => v,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self, Self::Identifier(_))
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier(v) => write!(f, "{IDENTIFIER_DELIMITER}{v}{IDENTIFIER_DELIMITER}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A validated attack: immutable once the catalog is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackDefinition {
    pub name: String,
    pub description: String,
    pub keywords: Vec<Keyword>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_value_is_identifier() {
        assert_eq!(
            Keyword::parse("--11011--").unwrap(),
            Keyword::Identifier("11011".to_string())
        );
        assert_eq!(
            Keyword::parse("--smb-os-discovery--").unwrap(),
            Keyword::Identifier("smb-os-discovery".to_string())
        );
    }

    #[test]
    fn inner_delimiters_stay_in_identifier() {
        assert_eq!(
            Keyword::parse("--a--b--").unwrap(),
            Keyword::Identifier("a--b".to_string())
        );
    }

    #[test]
    fn everything_else_is_text() {
        assert_eq!(
            Keyword::parse("Windows Server").unwrap(),
            Keyword::Text("Windows Server".to_string())
        );
        assert_eq!(Keyword::parse("--half").unwrap(), Keyword::Text("--half".to_string()));
        assert_eq!(Keyword::parse("---").unwrap(), Keyword::Text("---".to_string()));
        assert_eq!(Keyword::parse("--").unwrap(), Keyword::Text("--".to_string()));
    }

    #[test]
    fn empty_identifier_rejected() {
        assert!(Keyword::parse("----").is_err());
        assert!(Keyword::parse("--  --").is_err());
    }

    #[test]
    fn blank_keyword_rejected() {
        assert!(Keyword::parse("").is_err());
        assert!(Keyword::parse("   ").is_err());
    }

    #[test]
    fn display_restores_catalog_form() {
        assert_eq!(Keyword::Identifier("11011".to_string()).to_string(), "--11011--");
        assert_eq!(Keyword::Text("anonymous".to_string()).to_string(), "anonymous");
    }

    #[test]
    fn keyword_serialization() {
        let json = serde_json::to_value(Keyword::Identifier("11011".to_string())).unwrap();
        assert_eq!(json["kind"], "identifier");
        assert_eq!(json["value"], "11011");
    }

    #[test]
    fn record_tolerates_missing_fields() {
        let record: AttackRecord = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert_eq!(record.name.as_deref(), Some("x"));
        assert!(record.description.is_none());
        assert!(record.keywords.is_none());
    }
}
