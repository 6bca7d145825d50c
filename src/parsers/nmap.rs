//! Nmap XML output parser (`-oX`).
//!
//! Emits one finding per NSE `<script>` result: scripts under `<port>` are
//! port-level, scripts under `<hostscript>` are host-level. Open ports are
//! emitted as `ScanItem::Port` even when no script ran against them.
//! Pre- and post-scan scripts are not tied to a host and are ignored.

use std::collections::HashMap;
use std::net::IpAddr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::errors::EngineError;
use crate::models::finding::{Finding, ScanSource};
use crate::models::host::{Host, Port, Protocol};
use crate::parsers::xml::{attributes, element_name};
use crate::parsers::{ParsedFinding, ScanItem, ScanItems, ScanParser, ScanType, StreamState};

const ROOT: &str = "nmaprun";

/// Parser for Nmap XML exports.
#[derive(Debug, Default)]
pub struct NmapParser;

impl NmapParser {
    pub fn new() -> Self {
        Self
    }
}

impl ScanParser for NmapParser {
    fn items<'a>(&self, data: &'a [u8]) -> ScanItems<'a> {
        Box::new(NmapItems::new(data))
    }

    fn scan_type(&self) -> ScanType {
        ScanType::Nmap
    }
}

#[derive(Debug)]
struct ScriptResult {
    ordinal: usize,
    offset: u64,
    attrs: Result<HashMap<String, String>, String>,
}

#[derive(Debug)]
struct PortBlock {
    ordinal: usize,
    offset: u64,
    attrs: Result<HashMap<String, String>, String>,
    state: Option<String>,
    service: Option<String>,
    scripts: Vec<ScriptResult>,
}

#[derive(Debug)]
struct HostBlock {
    ordinal: usize,
    offset: u64,
    addresses: Vec<(String, Option<String>)>,
    hostname: Option<String>,
    ports: Vec<PortBlock>,
    scripts: Vec<ScriptResult>,
}

struct NmapItems<'a> {
    reader: Reader<&'a [u8]>,
    state: StreamState,
    host: Option<HostBlock>,
    port: Option<PortBlock>,
    in_hostscript: bool,
    host_ordinal: usize,
    port_ordinal: usize,
    script_ordinal: usize,
}

impl<'a> NmapItems<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            reader: Reader::from_reader(data),
            state: StreamState::new(ScanType::Nmap, ROOT),
            host: None,
            port: None,
            in_hostscript: false,
            host_ordinal: 0,
            port_ordinal: 0,
            script_ordinal: 0,
        }
    }

    fn byte_offset(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Advance the reader by one event.
    fn step(&mut self) {
        let offset = self.byte_offset();
        match self.reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                if self.state.open_element(&name, offset) {
                    self.state.depth += 1;
                    self.on_open(&name, &e, offset, false);
                }
            }
            Ok(Event::Empty(e)) => {
                let name = element_name(&e);
                if self.state.open_element(&name, offset) {
                    self.on_open(&name, &e, offset, true);
                }
            }
            Ok(Event::End(e)) => {
                self.state.depth = self.state.depth.saturating_sub(1);
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                self.on_close(&name);
            }
            Ok(Event::Eof) => {
                let end = self.byte_offset();
                self.state.end_of_input(end);
            }
            // Script output lives in attributes; element text is not needed
            Ok(_) => {}
            Err(e) => {
                let at = self.byte_offset();
                self.state.fail(Some(at), e.to_string());
            }
        }
    }

    fn on_open(&mut self, name: &str, e: &BytesStart<'_>, offset: u64, empty: bool) {
        match name {
            "host" => {
                self.host_ordinal += 1;
                self.host = Some(HostBlock {
                    ordinal: self.host_ordinal,
                    offset,
                    addresses: Vec::new(),
                    hostname: None,
                    ports: Vec::new(),
                    scripts: Vec::new(),
                });
                if empty {
                    self.finish_host();
                }
            }
            "address" => {
                if let (Some(host), Ok(mut attrs)) = (self.host.as_mut(), attributes(e)) {
                    if let Some(addr) = attrs.remove("addr") {
                        host.addresses.push((addr, attrs.remove("addrtype")));
                    }
                }
            }
            "hostname" => {
                if let (Some(host), Ok(mut attrs)) = (self.host.as_mut(), attributes(e)) {
                    if host.hostname.is_none() {
                        host.hostname = attrs.remove("name");
                    }
                }
            }
            "port" if self.host.is_some() => {
                self.port_ordinal += 1;
                let block = PortBlock {
                    ordinal: self.port_ordinal,
                    offset,
                    attrs: attributes(e),
                    state: None,
                    service: None,
                    scripts: Vec::new(),
                };
                if empty {
                    if let Some(host) = self.host.as_mut() {
                        host.ports.push(block);
                    }
                } else {
                    self.port = Some(block);
                }
            }
            "state" => {
                if let (Some(port), Ok(mut attrs)) = (self.port.as_mut(), attributes(e)) {
                    port.state = attrs.remove("state");
                }
            }
            "service" => {
                if let (Some(port), Ok(mut attrs)) = (self.port.as_mut(), attributes(e)) {
                    port.service = attrs.remove("name");
                }
            }
            "hostscript" if self.host.is_some() && !empty => self.in_hostscript = true,
            "script" => {
                let script = |ordinal| ScriptResult {
                    ordinal,
                    offset,
                    attrs: attributes(e),
                };
                if let Some(port) = self.port.as_mut() {
                    self.script_ordinal += 1;
                    port.scripts.push(script(self.script_ordinal));
                } else if self.in_hostscript {
                    if let Some(host) = self.host.as_mut() {
                        self.script_ordinal += 1;
                        host.scripts.push(script(self.script_ordinal));
                    }
                }
            }
            _ => {}
        }
    }

    fn on_close(&mut self, name: &str) {
        match name {
            "port" => {
                if let (Some(port), Some(host)) = (self.port.take(), self.host.as_mut()) {
                    host.ports.push(port);
                }
            }
            "hostscript" => self.in_hostscript = false,
            "host" => self.finish_host(),
            _ => {}
        }
    }

    /// Resolve the host address and release its ports and script findings.
    fn finish_host(&mut self) {
        self.port = None;
        self.in_hostscript = false;
        let Some(block) = self.host.take() else {
            return;
        };

        let address = block
            .addresses
            .iter()
            .filter(|(_, kind)| matches!(kind.as_deref(), None | Some("ipv4") | Some("ipv6")))
            .find_map(|(addr, _)| addr.trim().parse::<IpAddr>().ok());

        let Some(address) = address else {
            let message = "host has no usable IP address".to_string();
            let script_count = block.scripts.len()
                + block.ports.iter().map(|p| p.scripts.len()).sum::<usize>();
            if script_count == 0 {
                self.state
                    .warn("host", block.ordinal, Some(block.offset), message);
                return;
            }
            let scripts = block
                .scripts
                .iter()
                .chain(block.ports.iter().flat_map(|p| p.scripts.iter()));
            let positions: Vec<(usize, u64)> = scripts.map(|s| (s.ordinal, s.offset)).collect();
            for (ordinal, offset) in positions {
                self.state.warn("script", ordinal, Some(offset), message.clone());
            }
            return;
        };

        let host = Host::new(address).with_hostname(block.hostname);

        for script in block.scripts {
            self.emit_script(&host, None, script);
        }

        for port_block in block.ports {
            let port = match port_from_block(&port_block) {
                Ok(port) => port,
                Err(message) => {
                    let skipped = port_block.scripts.len();
                    let message = if skipped > 0 {
                        format!("{message} ({skipped} scripts skipped)")
                    } else {
                        message
                    };
                    self.state
                        .warn("port", port_block.ordinal, Some(port_block.offset), message);
                    continue;
                }
            };

            if is_open(port_block.state.as_deref()) {
                self.state.emit(ScanItem::Port(host.clone(), port.clone()));
            }
            for script in port_block.scripts {
                self.emit_script(&host, Some(&port), script);
            }
        }
    }

    fn emit_script(&mut self, host: &Host, port: Option<&Port>, script: ScriptResult) {
        match convert_script(host, port, script.attrs) {
            Ok(parsed) => self.state.emit(ScanItem::Finding(parsed)),
            Err(message) => self
                .state
                .warn("script", script.ordinal, Some(script.offset), message),
        }
    }
}

impl Iterator for NmapItems<'_> {
    type Item = Result<ScanItem, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.state.pending.pop_front() {
                return Some(item);
            }
            if self.state.finished {
                return None;
            }
            self.step();
        }
    }
}

/// Port states that count as a reachable service.
fn is_open(state: Option<&str>) -> bool {
    matches!(state, Some("open") | Some("open|filtered"))
}

fn port_from_block(block: &PortBlock) -> Result<Port, String> {
    let attrs = block.attrs.as_ref().map_err(String::clone)?;
    let raw_number = attrs.get("portid").map(|p| p.trim()).unwrap_or("");
    let number: u16 = raw_number
        .parse()
        .ok()
        .filter(|n| *n != 0)
        .ok_or_else(|| format!("invalid portid '{raw_number}'"))?;
    let protocol = attrs
        .get("protocol")
        .map(String::as_str)
        .unwrap_or("")
        .parse::<Protocol>()?;
    Ok(Port::new(number, protocol).with_service(block.service.clone()))
}

/// Convert a single script result into a normalized finding.
fn convert_script(
    host: &Host,
    port: Option<&Port>,
    attrs: Result<HashMap<String, String>, String>,
) -> Result<ParsedFinding, String> {
    let mut attrs = attrs?;
    let id = attrs.remove("id").unwrap_or_default();
    let finding = Finding::new(&id, attrs.remove("output"), ScanSource::Nmap)
        .ok_or_else(|| "missing script id".to_string())?;
    Ok(ParsedFinding {
        host: host.clone(),
        port: port.cloned(),
        finding,
    })
}
