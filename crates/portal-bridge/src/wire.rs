//! Decoder for the portal's grid payload.
//!
//! Grid data arrives as a flat, XML-like fragment of positional records:
//!
//! ```text
//! <r><f0>CAMPO GRANDE</f0><f1>P</f1><f2/>...</r><r>...</r>
//! ```
//!
//! It is not a well-formed document (no root, stray text between records is
//! common), so it is scanned rather than handed to an XML parser. Each record
//! must carry exactly the expected number of sub-fields, numbered from `f0`
//! without gaps. A record that does not is still returned, carrying its
//! error, so that the ordinal position of every following record stays
//! correct.

use std::fmt;

/// A record's shape did not match the screen's wire layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralParseError {
    #[error("record {record}: expected {expected} fields, found {found}")]
    FieldCount {
        record: usize,
        expected: usize,
        found: usize,
    },

    #[error("record {record}: found <f{found}> where <f{expected}> was expected")]
    FieldOrder {
        record: usize,
        expected: usize,
        found: usize,
    },

    #[error("record {record}: unterminated <{tag}>")]
    Unterminated { record: usize, tag: String },

    #[error("record {record}: unexpected content '{snippet}'")]
    UnexpectedContent { record: usize, snippet: String },
}

/// One `<r>...</r>` record with its positional sub-fields `f0..fN`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    fields: Vec<String>,
}

impl RawRecord {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Sub-field `f{index}`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<r>")?;
        for (i, v) in self.fields.iter().enumerate() {
            write!(f, "<f{i}>{}</f{i}>", encode_text(v))?;
        }
        f.write_str("</r>")
    }
}

/// A record as found on the wire, at its ordinal position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// 0-based position in the payload.
    pub index: usize,
    /// Whatever sub-fields could be read.
    pub record: RawRecord,
    /// Set when the record does not match the expected layout.
    pub error: Option<StructuralParseError>,
}

impl RawEntry {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// The record's display name, if the name sub-field could be read.
    pub fn name(&self, name_field: usize) -> Option<&str> {
        self.record.get(name_field).map(str::trim)
    }
}

/// A parsed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPayload {
    entries: Vec<RawEntry>,
}

impl RawPayload {
    /// Parse `body` expecting `expected_fields` sub-fields per record.
    pub fn parse(body: &str, expected_fields: usize) -> Self {
        Self {
            entries: parse_payload(body, expected_fields),
        }
    }

    pub fn entries(&self) -> &[RawEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of records that failed structural checks.
    pub fn malformed(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_valid()).count()
    }
}

/// Scan every `<r>` record in `body`.
pub fn parse_payload(body: &str, expected_fields: usize) -> Vec<RawEntry> {
    let mut entries = Vec::new();
    let mut rest = body;

    while let Some(open) = find_open(rest, "r") {
        let index = entries.len();
        let after_open = &rest[open.content_start..];
        if open.self_closing {
            // an empty record still holds its ordinal position
            entries.push(parse_record("", index, expected_fields));
            rest = after_open;
            continue;
        }
        match find_close(after_open, "</r>") {
            Some(end) => {
                entries.push(parse_record(&after_open[..end], index, expected_fields));
                rest = &after_open[end + "</r>".len()..];
            }
            None => {
                let mut entry = parse_record(after_open, index, expected_fields);
                entry.error = Some(StructuralParseError::Unterminated {
                    record: index,
                    tag: "r".into(),
                });
                entries.push(entry);
                break;
            }
        }
    }

    entries
}

/// Parse the inside of one `<r>` element.
pub fn parse_record(inner: &str, index: usize, expected_fields: usize) -> RawEntry {
    let mut fields = Vec::new();
    let mut rest = inner;

    let error = loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break None;
        }
        if !rest.starts_with("<f") {
            break Some(StructuralParseError::UnexpectedContent {
                record: index,
                snippet: snippet(rest),
            });
        }

        let digits: String = rest[2..].chars().take_while(|c| c.is_ascii_digit()).collect();
        let Ok(number) = digits.parse::<usize>() else {
            break Some(StructuralParseError::UnexpectedContent {
                record: index,
                snippet: snippet(rest),
            });
        };
        if number != fields.len() {
            break Some(StructuralParseError::FieldOrder {
                record: index,
                expected: fields.len(),
                found: number,
            });
        }

        let tail = &rest[2 + digits.len()..];
        if let Some(after) = tail.strip_prefix("/>") {
            fields.push(String::new());
            rest = after;
            continue;
        }
        let Some(after) = tail.strip_prefix('>') else {
            break Some(StructuralParseError::UnexpectedContent {
                record: index,
                snippet: snippet(rest),
            });
        };

        let close = format!("</f{}>", number);
        let Some(end) = find_close(after, &close) else {
            break Some(StructuralParseError::Unterminated {
                record: index,
                tag: format!("f{}", number),
            });
        };
        fields.push(decode_text(&after[..end]));
        rest = &after[end + close.len()..];
    };

    let error = error.or_else(|| {
        (fields.len() != expected_fields).then(|| StructuralParseError::FieldCount {
            record: index,
            expected: expected_fields,
            found: fields.len(),
        })
    });

    RawEntry {
        index,
        record: RawRecord::new(fields),
        error,
    }
}

struct OpenTag {
    content_start: usize,
    self_closing: bool,
}

/// Find `<tag>`, `<tag attr...>` or `<tag/>`.
fn find_open(hay: &str, tag: &str) -> Option<OpenTag> {
    let pattern = format!("<{}", tag);
    let mut from = 0;
    while let Some(pos) = hay[from..].find(&pattern) {
        let after = from + pos + pattern.len();
        match hay[after..].chars().next() {
            Some('>') => {
                return Some(OpenTag {
                    content_start: after + 1,
                    self_closing: false,
                })
            }
            Some('/') if hay[after + 1..].starts_with('>') => {
                return Some(OpenTag {
                    content_start: after + 2,
                    self_closing: true,
                })
            }
            Some(c) if c.is_whitespace() => {
                let gt = after + hay[after..].find('>')?;
                return Some(OpenTag {
                    content_start: gt + 1,
                    self_closing: hay[..gt].ends_with('/'),
                });
            }
            _ => from = after,
        }
    }
    None
}

/// Position of `close` in `hay`, skipping over CDATA sections.
fn find_close(hay: &str, close: &str) -> Option<usize> {
    let mut from = 0;
    loop {
        let close_at = hay[from..].find(close).map(|p| from + p);
        let cdata_at = hay[from..].find("<![CDATA[").map(|p| from + p);
        match (close_at, cdata_at) {
            (Some(c), Some(d)) if d < c => {
                let end = hay[d..].find("]]>")?;
                from = d + end + 3;
            }
            (Some(c), _) => return Some(c),
            (None, _) => return None,
        }
    }
}

/// Unwrap CDATA sections and decode character references elsewhere.
pub fn decode_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<![CDATA[") {
        out.push_str(&decode_entities(&rest[..start]));
        let body = &rest[start + 9..];
        match body.find("]]>") {
            Some(end) => {
                out.push_str(&body[..end]);
                rest = &body[end + 3..];
            }
            None => {
                out.push_str(body);
                rest = "";
            }
        }
    }
    out.push_str(&decode_entities(rest));
    out
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let name = &tail[1..semi];
            let ch = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => name.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(&['x', 'X'][..]) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn encode_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn snippet(s: &str) -> String {
    s.chars().take(24).collect()
}
