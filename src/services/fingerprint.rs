//! Fingerprint computation for finding deduplication.
//!
//! A finding's identity is its host address, its port (or the host-level
//! marker), and the plugin/script identifier. Output text is excluded so a
//! re-scan that produces different output still lands on the same record.

use std::net::IpAddr;

use sha2::{Digest, Sha256};

use crate::models::host::PortKey;

/// Compute the fingerprint for a finding on `host`, optionally on `port`.
pub fn compute(host: IpAddr, port: Option<PortKey>, identifier: &str) -> String {
    let location = match port {
        Some(port) => port.to_string(),
        None => "host".to_string(),
    };
    hash(&format!("{host}:{location}:{identifier}"))
}

/// SHA-256 hash a string and return hex-encoded digest.
fn hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
