//! Single index terms.
//!
//! Layout: `[header][escaped path][encoded value]`. The header carries the
//! descending and truncated flags and the term kind. For descending terms
//! every byte after the header is complemented, which reverses the
//! lexicographic order of the self-delimiting path and value encodings.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::compare::compare_values;
use crate::error::DecodeError;
use crate::key::{decode_value, encode_value, encoded_len};
use crate::sortable::{escaped_len, read_escaped, write_escaped};

pub const TERM_TRUNCATED: u8 = 0x01;
pub const TERM_METADATA: u8 = 0x02;
pub const TERM_VALUE_UNDEFINED: u8 = 0x08;
pub const TERM_MAYBE_UNDEFINED: u8 = 0x0C;
pub const TERM_DESCENDING: u8 = 0x80;

const KIND_MASK: u8 = 0x7E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Value,
    Metadata,
    /// The path resolved to nothing.
    ValueUndefined,
    /// The path resolved to nothing in one branch of a document that has
    /// other values for it (empty arrays, sparse array elements).
    MaybeUndefined,
}

impl TermKind {
    fn bits(self) -> u8 {
        match self {
            TermKind::Value => 0,
            TermKind::Metadata => TERM_METADATA,
            TermKind::ValueUndefined => TERM_VALUE_UNDEFINED,
            TermKind::MaybeUndefined => TERM_MAYBE_UNDEFINED,
        }
    }

    fn from_header(header: u8) -> Result<TermKind, DecodeError> {
        match header & KIND_MASK {
            0 => Ok(TermKind::Value),
            TERM_METADATA => Ok(TermKind::Metadata),
            TERM_VALUE_UNDEFINED => Ok(TermKind::ValueUndefined),
            TERM_MAYBE_UNDEFINED => Ok(TermKind::MaybeUndefined),
            other => Err(DecodeError::Malformed(format!("term kind {other:#x}"))),
        }
    }
}

/// Markers carried by document-level metadata terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RootMetadata {
    MultiKey = 1,
    Truncated = 2,
    CorrelatedRootArray = 3,
}

impl RootMetadata {
    fn from_i32(n: i32) -> Option<RootMetadata> {
        match n {
            1 => Some(RootMetadata::MultiKey),
            2 => Some(RootMetadata::Truncated),
            3 => Some(RootMetadata::CorrelatedRootArray),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexTerm {
    pub path: String,
    pub value: Bson,
    pub kind: TermKind,
    pub descending: bool,
    pub truncated: bool,
}

impl IndexTerm {
    pub fn new(path: impl Into<String>, value: Bson) -> Self {
        IndexTerm {
            path: path.into(),
            value,
            kind: TermKind::Value,
            descending: false,
            truncated: false,
        }
    }

    pub fn undefined(path: impl Into<String>) -> Self {
        IndexTerm {
            kind: TermKind::ValueUndefined,
            ..IndexTerm::new(path, Bson::Undefined)
        }
    }

    pub fn maybe_undefined(path: impl Into<String>) -> Self {
        IndexTerm {
            kind: TermKind::MaybeUndefined,
            ..IndexTerm::new(path, Bson::Undefined)
        }
    }

    pub fn root(marker: RootMetadata) -> Self {
        IndexTerm {
            kind: TermKind::Metadata,
            ..IndexTerm::new("", Bson::Int32(marker as i32))
        }
    }

    /// The root truncation term doubles as the "any truncated" probe.
    pub fn root_truncated() -> Self {
        IndexTerm {
            truncated: true,
            ..IndexTerm::root(RootMetadata::Truncated)
        }
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == TermKind::Metadata
    }

    pub fn root_marker(&self) -> Option<RootMetadata> {
        match (&self.kind, &self.value) {
            (TermKind::Metadata, Bson::Int32(n)) => RootMetadata::from_i32(*n),
            _ => None,
        }
    }

    pub fn is_root_truncation(&self) -> bool {
        self.root_marker() == Some(RootMetadata::Truncated)
    }

    pub fn is_value_undefined(&self) -> bool {
        self.kind == TermKind::ValueUndefined
    }

    /// Undefined, or undefined on some branch.
    pub fn is_maybe_undefined(&self) -> bool {
        matches!(
            self.kind,
            TermKind::ValueUndefined | TermKind::MaybeUndefined
        )
    }

    fn header(&self) -> u8 {
        let mut header = self.kind.bits();
        if self.truncated {
            header |= TERM_TRUNCATED;
        }
        if self.descending {
            header |= TERM_DESCENDING;
        }
        header
    }

    /// Encode the term for storage. The header byte carries the
    /// truncation flag, so raw byte order only agrees with
    /// [`compare_terms`] between terms that are both untruncated. Use
    /// [`compare_serialized_terms`] to order stored terms in general.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.path.len() + encoded_len(&self.value));
        buf.push(self.header());
        write_escaped(&mut buf, self.path.as_bytes());
        encode_value(&self.value, &mut buf);
        if self.descending {
            for b in &mut buf[1..] {
                *b = !*b;
            }
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<IndexTerm, DecodeError> {
        let header = *bytes.first().ok_or(DecodeError::UnexpectedEnd)?;
        let descending = header & TERM_DESCENDING != 0;
        let body: std::borrow::Cow<'_, [u8]> = if descending {
            bytes[1..].iter().map(|b| !b).collect::<Vec<u8>>().into()
        } else {
            (&bytes[1..]).into()
        };
        let mut pos = 0;
        let path = read_escaped(&body, &mut pos).ok_or(DecodeError::UnexpectedEnd)?;
        let path =
            String::from_utf8(path).map_err(|_| DecodeError::Malformed("path is not utf-8".into()))?;
        let value = decode_value(&body, &mut pos)?;
        if pos != body.len() {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after term",
                body.len() - pos
            )));
        }
        Ok(IndexTerm {
            path,
            value,
            kind: TermKind::from_header(header)?,
            descending,
            truncated: header & TERM_TRUNCATED != 0,
        })
    }
}

/// Read the truncation flag without decoding the term.
pub fn is_serialized_truncated(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|h| h & TERM_TRUNCATED != 0)
}

pub fn is_serialized_metadata(bytes: &[u8]) -> bool {
    bytes
        .first()
        .is_some_and(|h| h & KIND_MASK == TERM_METADATA)
}

// ── Ordering ───────────────────────────────────────────────────

/// Total order over decoded terms: path, then value, with a truncated
/// term sorting after an untruncated one holding the same prefix.
/// Descending terms reverse the whole comparison.
pub fn compare_terms(a: &IndexTerm, b: &IndexTerm) -> Ordering {
    let ord = a
        .path
        .as_bytes()
        .cmp(b.path.as_bytes())
        .then_with(|| compare_values(&a.value, &b.value))
        .then(a.truncated.cmp(&b.truncated));
    if a.descending { ord.reverse() } else { ord }
}

/// Order two stored terms by decoding them first. Unlike raw byte
/// comparison this is correct for truncated terms.
pub fn compare_serialized_terms(a: &[u8], b: &[u8]) -> Result<Ordering, DecodeError> {
    Ok(compare_terms(
        &IndexTerm::deserialize(a)?,
        &IndexTerm::deserialize(b)?,
    ))
}

// ── Truncation ─────────────────────────────────────────────────

/// Serialize `term`, truncating its value so the whole term fits in
/// `limit` bytes. Returns the bytes and whether truncation happened.
pub fn serialize_with_limit(term: &IndexTerm, limit: Option<usize>) -> (Vec<u8>, bool) {
    let Some(limit) = limit else {
        return (term.serialize(), term.truncated);
    };
    let fixed = 1 + escaped_len(term.path.as_bytes());
    if term.kind != TermKind::Value || fixed + encoded_len(&term.value) <= limit {
        return (term.serialize(), term.truncated);
    }
    let budget = limit.saturating_sub(fixed);
    let (value, truncated) = truncate_value(&term.value, budget);
    let out = IndexTerm {
        value,
        truncated: term.truncated || truncated,
        ..term.clone()
    };
    (out.serialize(), out.truncated)
}

/// Shrink `value` so its encoding fits in `budget` bytes, keeping a prefix
/// of strings, binaries and containers. Fixed-width values are returned
/// unchanged.
pub fn truncate_value(value: &Bson, budget: usize) -> (Bson, bool) {
    if encoded_len(value) <= budget {
        return (value.clone(), false);
    }
    let truncated = match value {
        Bson::String(s) => Bson::String(truncate_str(s, budget)),
        Bson::Symbol(s) => Bson::Symbol(truncate_str(s, budget)),
        Bson::JavaScriptCode(s) => Bson::JavaScriptCode(truncate_str(s, budget)),
        Bson::Binary(bin) => {
            let keep = budget.saturating_sub(6).min(bin.bytes.len());
            Bson::Binary(bson::Binary {
                subtype: bin.subtype,
                bytes: bin.bytes[..keep].to_vec(),
            })
        }
        Bson::Document(doc) => Bson::Document(truncate_document(doc, budget.saturating_sub(1))),
        Bson::Array(items) => {
            // rank byte and end marker
            let mut remaining = budget.saturating_sub(2);
            let mut out = Vec::new();
            for item in items {
                let len = encoded_len(item);
                if len <= remaining {
                    remaining -= len;
                    out.push(item.clone());
                    continue;
                }
                if remaining > 1 {
                    let (partial, _) = truncate_value(item, remaining);
                    if encoded_len(&partial) <= remaining {
                        out.push(partial);
                    }
                }
                break;
            }
            Bson::Array(out)
        }
        Bson::RegularExpression(re) => {
            let options_len = escaped_len(re.options.as_str().as_bytes());
            let pattern = truncate_str(
                re.pattern.as_str(),
                budget.saturating_sub(options_len),
            );
            crate::key::regex_value(&pattern, re.options.as_str()).unwrap_or_else(|| value.clone())
        }
        _ => return (value.clone(), false),
    };
    (truncated, true)
}

fn truncate_str(s: &str, budget: usize) -> String {
    // rank byte plus terminator
    let mut remaining = budget.saturating_sub(3);
    let mut end = 0;
    for (idx, ch) in s.char_indices() {
        let width = ch.len_utf8() + usize::from(ch == '\0');
        if width > remaining {
            break;
        }
        remaining -= width;
        end = idx + ch.len_utf8();
    }
    s[..end].to_string()
}

fn truncate_document(doc: &Document, budget: usize) -> Document {
    // end marker
    let mut remaining = budget.saturating_sub(1);
    let mut out = Document::new();
    for (key, value) in doc {
        let key_len = escaped_len(key.as_bytes());
        let len = key_len + encoded_len(value);
        if len <= remaining {
            remaining -= len;
            out.insert(key.clone(), value.clone());
            continue;
        }
        if remaining > key_len + 1 {
            let (partial, _) = truncate_value(value, remaining - key_len);
            if key_len + encoded_len(&partial) <= remaining {
                out.insert(key.clone(), partial);
            }
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use bson::{Bson, doc};

    use super::*;

    #[test]
    fn serialize_round_trip() {
        let term = IndexTerm::new("a.b", Bson::Document(doc! { "x": [1, 2] })).descending(true);
        let decoded = IndexTerm::deserialize(&term.serialize()).unwrap();
        assert_eq!(decoded.path, "a.b");
        assert!(decoded.descending);
        assert_eq!(decoded.value, term.value);
    }

    #[test]
    fn descending_reverses_byte_order() {
        let lo = IndexTerm::new("", Bson::Int32(1)).descending(true).serialize();
        let hi = IndexTerm::new("", Bson::Int32(2)).descending(true).serialize();
        assert!(lo > hi);
        let lo = IndexTerm::new("", Bson::String("a".into())).descending(true).serialize();
        let hi = IndexTerm::new("", Bson::String("ab".into())).descending(true).serialize();
        assert!(lo > hi);
    }

    #[test]
    fn oversized_strings_truncate() {
        let long = "x".repeat(500);
        let term = IndexTerm::new("", Bson::String(long.clone()));
        let (bytes, truncated) = serialize_with_limit(&term, Some(64));
        assert!(truncated);
        assert!(bytes.len() <= 64);
        assert!(is_serialized_truncated(&bytes));

        let decoded = IndexTerm::deserialize(&bytes).unwrap();
        match &decoded.value {
            Bson::String(s) => assert!(long.starts_with(s.as_str())),
            other => panic!("unexpected {other:?}"),
        }
        // A truncated prefix sorts after the same untruncated prefix.
        let plain = IndexTerm {
            truncated: false,
            ..decoded.clone()
        };
        assert_eq!(compare_terms(&decoded, &plain), Ordering::Greater);
    }

    #[test]
    fn truncated_documents_keep_a_prefix() {
        let doc = doc! { "a": 1, "b": "y".repeat(100), "c": 3 };
        let (value, truncated) = truncate_value(&Bson::Document(doc), 60);
        assert!(truncated);
        assert!(encoded_len(&value) <= 60);
        let Bson::Document(kept) = value else {
            panic!("expected document")
        };
        assert_eq!(kept.get_i32("a").unwrap(), 1);
        assert!(!kept.contains_key("c"));
    }

    #[test]
    fn metadata_terms() {
        let term = IndexTerm::root(RootMetadata::MultiKey);
        let bytes = term.serialize();
        assert!(is_serialized_metadata(&bytes));
        let decoded = IndexTerm::deserialize(&bytes).unwrap();
        assert_eq!(decoded.root_marker(), Some(RootMetadata::MultiKey));
        assert!(IndexTerm::root_truncated().is_root_truncation());
        assert!(IndexTerm::undefined("a").is_maybe_undefined());
    }
}
