//! Nessus v2 report parser (`.nessus` XML).
//!
//! Walks `ReportHost` blocks, resolving the host address from the
//! `host-ip` property (falling back to the `name` attribute), and emits one
//! finding per `ReportItem` keyed by its `pluginID`. Items on port 0 are
//! host-level. Host properties are collected before any item is emitted, so
//! findings for a host are released when its `</ReportHost>` is reached.

use std::collections::HashMap;
use std::net::IpAddr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::models::finding::{Finding, ScanSource};
use crate::models::host::{Host, Port, Protocol};
use crate::parsers::xml::{attributes, element_name, TextCapture};
use crate::parsers::{ParsedFinding, ScanItem, ScanItems, ScanParser, ScanType, StreamState};

const ROOT: &str = "NessusClientData_v2";

/// Parser for Nessus v2 XML exports.
#[derive(Debug, Default)]
pub struct NessusParser;

impl NessusParser {
    pub fn new() -> Self {
        Self
    }
}

impl ScanParser for NessusParser {
    fn items<'a>(&self, data: &'a [u8]) -> ScanItems<'a> {
        Box::new(NessusItems::new(data))
    }

    fn scan_type(&self) -> ScanType {
        ScanType::Nessus
    }
}

#[derive(Debug)]
struct ReportHost {
    name: String,
    properties: HashMap<String, String>,
    items: Vec<ReportItem>,
}

#[derive(Debug)]
struct ReportItem {
    ordinal: usize,
    offset: u64,
    attrs: Result<HashMap<String, String>, String>,
    plugin_output: Option<String>,
}

#[derive(Debug)]
enum Capture {
    HostTag(String),
    PluginOutput,
}

struct NessusItems<'a> {
    reader: Reader<&'a [u8]>,
    state: StreamState,
    host: Option<ReportHost>,
    item: Option<ReportItem>,
    item_ordinal: usize,
    capture: Option<Capture>,
    text: TextCapture,
}

impl<'a> NessusItems<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            reader: Reader::from_reader(data),
            state: StreamState::new(ScanType::Nessus, ROOT),
            host: None,
            item: None,
            item_ordinal: 0,
            capture: None,
            text: TextCapture::default(),
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
            Ok(Event::Text(e)) => self.text.push_raw(&e),
            Ok(Event::CData(e)) => self.text.push_cdata(&e),
            Ok(Event::GeneralRef(e)) => self.text.push_reference(&e),
            Ok(Event::Eof) => {
                let end = self.byte_offset();
                self.state.end_of_input(end);
            }
            Ok(_) => {}
            Err(e) => {
                let at = self.byte_offset();
                self.state.fail(Some(at), e.to_string());
            }
        }
    }

    fn on_open(&mut self, name: &str, e: &BytesStart<'_>, offset: u64, empty: bool) {
        match name {
            "ReportHost" => {
                let host_name = attributes(e)
                    .ok()
                    .and_then(|mut attrs| attrs.remove("name"))
                    .unwrap_or_default();
                self.host = Some(ReportHost {
                    name: host_name,
                    properties: HashMap::new(),
                    items: Vec::new(),
                });
                if empty {
                    self.finish_host();
                }
            }
            "tag" if self.host.is_some() && self.item.is_none() && !empty => {
                if let Some(tag) = attributes(e).ok().and_then(|mut attrs| attrs.remove("name")) {
                    self.capture = Some(Capture::HostTag(tag));
                    self.text.start();
                }
            }
            "ReportItem" => {
                self.item_ordinal += 1;
                let item = ReportItem {
                    ordinal: self.item_ordinal,
                    offset,
                    attrs: attributes(e),
                    plugin_output: None,
                };
                if empty {
                    self.finish_item(item);
                } else {
                    self.item = Some(item);
                }
            }
            "plugin_output" if self.item.is_some() && !empty => {
                self.capture = Some(Capture::PluginOutput);
                self.text.start();
            }
            _ => {}
        }
    }

    fn on_close(&mut self, name: &str) {
        match name {
            "tag" => {
                if let Some(Capture::HostTag(tag)) = self.capture.take() {
                    let value = self.text.finish().unwrap_or_default();
                    if let Some(host) = self.host.as_mut() {
                        host.properties.insert(tag, value);
                    }
                }
            }
            "plugin_output" => {
                if matches!(self.capture, Some(Capture::PluginOutput)) {
                    self.capture = None;
                    let output = self.text.finish();
                    if let Some(item) = self.item.as_mut() {
                        item.plugin_output = output;
                    }
                }
            }
            "ReportItem" => {
                if let Some(item) = self.item.take() {
                    self.finish_item(item);
                }
            }
            "ReportHost" => self.finish_host(),
            _ => {}
        }
    }

    fn finish_item(&mut self, item: ReportItem) {
        match self.host.as_mut() {
            Some(host) => host.items.push(item),
            None => self.state.warn(
                "ReportItem",
                item.ordinal,
                Some(item.offset),
                "ReportItem outside of a ReportHost".to_string(),
            ),
        }
    }

    /// Resolve the host identity and release its buffered items.
    fn finish_host(&mut self) {
        let Some(report_host) = self.host.take() else {
            return;
        };

        let address = report_host
            .properties
            .get("host-ip")
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
            .or_else(|| report_host.name.trim().parse::<IpAddr>().ok());

        let Some(address) = address else {
            for item in report_host.items {
                self.state.warn(
                    "ReportItem",
                    item.ordinal,
                    Some(item.offset),
                    format!("ReportHost '{}' has no usable IP address", report_host.name),
                );
            }
            return;
        };

        let properties = &report_host.properties;
        let hostname = property(properties, "host-fqdn")
            .or_else(|| property(properties, "hostname"))
            .map(str::to_string)
            .or_else(|| {
                let name = report_host.name.trim();
                (!name.is_empty() && name.parse::<IpAddr>().is_err()).then(|| name.to_string())
            });
        let host = Host::new(address).with_hostname(hostname);

        for item in report_host.items {
            let (ordinal, offset) = (item.ordinal, item.offset);
            match convert_item(&host, item) {
                Ok(parsed) => self.state.emit(ScanItem::Finding(parsed)),
                Err(message) => self.state.warn("ReportItem", ordinal, Some(offset), message),
            }
        }
    }
}

impl Iterator for NessusItems<'_> {
    type Item = Result<ScanItem, crate::errors::EngineError>;

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

/// Non-blank host property value.
fn property<'a>(properties: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Convert a single ReportItem into a normalized finding.
fn convert_item(host: &Host, item: ReportItem) -> Result<ParsedFinding, String> {
    let attrs = item.attrs?;

    let plugin_id = attrs.get("pluginID").map(String::as_str).unwrap_or("");
    if plugin_id.trim().is_empty() {
        return Err("missing pluginID".to_string());
    }

    let port_number: u16 = match attrs.get("port").map(|p| p.trim()) {
        None | Some("") => 0,
        Some(p) => p.parse().map_err(|_| format!("invalid port '{p}'"))?,
    };

    // Port 0 carries host-level findings
    let port = if port_number == 0 {
        None
    } else {
        let protocol = attrs
            .get("protocol")
            .map(String::as_str)
            .unwrap_or("")
            .parse::<Protocol>()
            .map_err(|e| format!("{e} on port {port_number}"))?;
        Some(Port::new(port_number, protocol).with_service(attrs.get("svc_name").cloned()))
    };

    let finding = Finding::new(plugin_id, item.plugin_output, ScanSource::Nessus)
        .ok_or_else(|| "missing pluginID".to_string())?;

    Ok(ParsedFinding {
        host: host.clone(),
        port,
        finding,
    })
}
