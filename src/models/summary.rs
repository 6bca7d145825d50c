//! Read-only project views for the annotation layer.

use std::net::IpAddr;

use serde::Serialize;

use crate::models::association::HostAttack;
use crate::models::finding::StoredFinding;
use crate::models::host::{Host, Port};

/// Project-wide counts plus the distinct addresses and ports seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub project: String,
    pub hosts: usize,
    pub attacks: usize,
    pub ips: Vec<IpAddr>,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub imported_files: Vec<String>,
}

/// Everything known about a single host.
#[derive(Debug, Clone, Serialize)]
pub struct HostDetails {
    pub host: Host,
    pub ports: Vec<Port>,
    pub findings: Vec<StoredFinding>,
    pub attacks: Vec<HostAttack>,
}
