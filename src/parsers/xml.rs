//! Small helpers over the quick-xml pull reader shared by the scan parsers.

use std::collections::HashMap;

use quick_xml::events::BytesStart;

/// Lossy UTF-8 decode of raw element content, with entity references resolved.
///
/// Unknown entities are left as written rather than failing the record.
pub fn decode_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match quick_xml::escape::unescape(&text) {
        Ok(unescaped) => unescaped.into_owned(),
        Err(_) => text.into_owned(),
    }
}

/// Resolve a general or character reference name (without `&` and `;`).
pub fn resolve_reference(name: &str) -> Option<String> {
    if let Some(code) = name.strip_prefix('#') {
        let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => code.parse::<u32>().ok()?,
        };
        return char::from_u32(value).map(String::from);
    }

    let resolved = match name {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "apos" => "'",
        "quot" => "\"",
        _ => return None,
    };
    Some(resolved.to_string())
}

/// Element local name as an owned string.
pub fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Collect an element's attributes into a map, decoding entity references.
///
/// A syntactically broken attribute list is reported as an error so the
/// caller can skip the record it belongs to.
pub fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| format!("invalid attribute: {err}"))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        map.insert(key, decode_text(&attr.value));
    }
    Ok(map)
}

/// Accumulates the text content of one element across text, CDATA and
/// reference events.
#[derive(Debug, Default)]
pub struct TextCapture {
    buf: Option<String>,
}

impl TextCapture {
    pub fn start(&mut self) {
        self.buf = Some(String::new());
    }

    pub fn is_active(&self) -> bool {
        self.buf.is_some()
    }

    pub fn push_raw(&mut self, raw: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.push_str(&decode_text(raw));
        }
    }

    pub fn push_cdata(&mut self, raw: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.push_str(&String::from_utf8_lossy(raw));
        }
    }

    pub fn push_reference(&mut self, name: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            let name = String::from_utf8_lossy(name);
            match resolve_reference(&name) {
                Some(resolved) => buf.push_str(&resolved),
                None => {
                    buf.push('&');
                    buf.push_str(&name);
                    buf.push(';');
                }
            }
        }
    }

    /// Finish the capture, returning the trimmed text.
    pub fn finish(&mut self) -> Option<String> {
        self.buf.take().map(|s| s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_predefined_entities() {
        assert_eq!(decode_text(b"a &amp; b &lt;c&gt;"), "a & b <c>");
    }

    #[test]
    fn keeps_unknown_entities_verbatim() {
        assert_eq!(decode_text(b"a &nbsp; b"), "a &nbsp; b");
    }

    #[test]
    fn resolves_character_references() {
        assert_eq!(resolve_reference("#10").as_deref(), Some("\n"));
        assert_eq!(resolve_reference("#xA").as_deref(), Some("\n"));
        assert_eq!(resolve_reference("quot").as_deref(), Some("\""));
        assert_eq!(resolve_reference("nbsp"), None);
        assert_eq!(resolve_reference("#xZZ"), None);
    }

    #[test]
    fn capture_only_records_while_active() {
        let mut capture = TextCapture::default();
        capture.push_raw(b"ignored");
        assert!(!capture.is_active());

        capture.start();
        capture.push_raw(b"  SMB signing ");
        capture.push_reference(b"amp");
        capture.push_cdata(b" <raw> ");
        capture.push_reference(b"bogus");
        assert_eq!(
            capture.finish().as_deref(),
            Some("SMB signing & <raw> &bogus;")
        );
        assert!(capture.finish().is_none());
    }
}
