//! Query builder: compiles an attack's keyword list into a match predicate.
//!
//! Keywords are OR-combined. An identifier keyword matches a finding whose
//! identifier is exactly equal to it. A text keyword matches a finding whose
//! output contains it, ignoring ASCII case (the same semantics as a SQL
//! `LIKE '%keyword%'`). Non-ASCII characters compare exactly.

use std::collections::HashMap;

use crate::models::attack::Keyword;
use crate::models::finding::Finding;

/// A compiled, reusable predicate for one keyword list.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Identifier value to the keyword it came from.
    identifiers: HashMap<String, Keyword>,
    /// Text keywords with their ASCII-lowercased needle, in declaration order.
    texts: Vec<(String, Keyword)>,
}

/// Compile a keyword list into a predicate.
pub fn compile(keywords: &[Keyword]) -> CompiledQuery {
    let mut identifiers = HashMap::new();
    let mut texts = Vec::new();

    for keyword in keywords {
        match keyword {
            Keyword::Identifier(value) => {
                identifiers
                    .entry(value.clone())
                    .or_insert_with(|| keyword.clone());
            }
            Keyword::Text(value) => texts.push((value.to_ascii_lowercase(), keyword.clone())),
        }
    }

    CompiledQuery { identifiers, texts }
}

impl CompiledQuery {
    pub fn matches(&self, finding: &Finding) -> bool {
        self.match_keyword(finding).is_some()
    }

    /// The keyword that satisfied the query. Identifier keywords take
    /// precedence over text keywords; among text keywords the first declared wins.
    pub fn match_keyword(&self, finding: &Finding) -> Option<&Keyword> {
        if let Some(keyword) = self.identifiers.get(&finding.identifier) {
            return Some(keyword);
        }
        if self.texts.is_empty() || finding.output.is_empty() {
            return None;
        }
        let haystack = finding.output.to_ascii_lowercase();
        self.texts
            .iter()
            .find(|(needle, _)| haystack.contains(needle.as_str()))
            .map(|(_, keyword)| keyword)
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty() && self.texts.is_empty()
    }
}
