//! ABC header fields and the per-tune container.

use std::collections::HashMap;
use std::time::Duration;

/// One information field, like `K:Gm` or `T:Some Title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Upper-cased single-letter identifier.
    pub id: char,
    pub text: String,
}

impl FieldInfo {
    /// Parses a header line of the form `X:text`. Returns `None` for
    /// anything else.
    pub fn parse(line: &str) -> Option<FieldInfo> {
        let bytes = line.as_bytes();
        if bytes.len() < 2 || bytes[1] != b':' {
            return None;
        }
        let id = (bytes[0] as char).to_ascii_uppercase();
        if !id.is_ascii_uppercase() {
            return None;
        }
        Some(FieldInfo {
            id,
            text: line.get(2..).unwrap_or("").to_string(),
        })
    }
}

/// Header fields of one tune. Fields may legitimately repeat, so each
/// identifier keeps its values in order; the last value wins when the
/// player applies them.
#[derive(Debug, Clone, Default)]
pub struct TuneHeader {
    fields: HashMap<char, Vec<String>>,
}

impl TuneHeader {
    pub fn add(&mut self, info: FieldInfo) {
        self.fields.entry(info.id).or_default().push(info.text);
    }

    /// The last value seen for an identifier.
    pub fn last(&self, id: char) -> Option<&str> {
        self.fields
            .get(&id)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    pub fn contains(&self, id: char) -> bool {
        self.fields.contains_key(&id)
    }

    /// The number of distinct field identifiers seen so far.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// One tune out of an ABC source, which may hold several (a tune book).
/// Index 0 of a player's tune list is the implicit file header.
#[derive(Debug, Clone, Default)]
pub struct Tune {
    pub header: TuneHeader,
    /// Accumulated raw body text, built up line by line until a blank
    /// line ends the tune.
    pub raw_code: String,
    pub tokens: Vec<String>,
    /// Filled by the duration precomputation pass at load time.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_fields() {
        let info = FieldInfo::parse("K:Gm").unwrap();
        assert_eq!(info.id, 'K');
        assert_eq!(info.text, "Gm");

        let info = FieldInfo::parse("w:lyric line").unwrap();
        assert_eq!(info.id, 'W');
    }

    #[test]
    fn rejects_non_fields() {
        assert_eq!(FieldInfo::parse(""), None);
        assert_eq!(FieldInfo::parse("CDEF"), None);
        assert_eq!(FieldInfo::parse("1:X"), None);
        assert_eq!(FieldInfo::parse("K"), None);
    }

    #[test]
    fn empty_text_is_allowed() {
        let info = FieldInfo::parse("K:").unwrap();
        assert_eq!(info.text, "");
    }

    #[test]
    fn repeated_fields_keep_order() {
        let mut header = TuneHeader::default();
        header.add(FieldInfo::parse("L:1/4").unwrap());
        header.add(FieldInfo::parse("L:1/8").unwrap());
        assert_eq!(header.last('L'), Some("1/8"));
        assert_eq!(header.field_count(), 1);
    }
}
