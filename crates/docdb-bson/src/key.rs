//! Order-preserving value encoding.
//!
//! `encode_value` writes a value as `[rank][payload]` where lexicographic
//! comparison of two encodings agrees with [`compare_values`]. Every
//! encoding is self-delimiting, which keeps the byte-complement used for
//! descending terms order-reversing.
//!
//! [`compare_values`]: crate::compare::compare_values

use bson::spec::BinarySubtype;
use bson::{Bson, Document};

use crate::compare::{NumericKey, TypeRank};
use crate::error::DecodeError;
use crate::sortable::{
    decode_f64_sortable, decode_i64_sortable, encode_f64_sortable, encode_i64_sortable,
    escaped_len, read_escaped, write_escaped,
};

const NUMBER_NAN: u8 = 0x00;
const NUMBER_VALUE: u8 = 0x01;
const END_OF_CONTAINER: u8 = 0x00;

pub fn encode_value(value: &Bson, buf: &mut Vec<u8>) {
    let rank = TypeRank::of(value);
    buf.push(rank as u8);
    encode_payload(value, buf);
}

pub fn encoded_value(value: &Bson) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}

fn encode_payload(value: &Bson, buf: &mut Vec<u8>) {
    match value {
        Bson::MinKey | Bson::MaxKey | Bson::Null | Bson::Undefined | Bson::DbPointer(_) => {}
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => {
            match NumericKey::of(value) {
                Some(NumericKey::Value { approx, remainder }) => {
                    buf.push(NUMBER_VALUE);
                    buf.extend_from_slice(&encode_f64_sortable(approx));
                    buf.extend_from_slice(&encode_i64_sortable(remainder));
                }
                _ => buf.push(NUMBER_NAN),
            }
        }
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => {
            write_escaped(buf, s.as_bytes())
        }
        Bson::Document(doc) => encode_document(doc, buf),
        Bson::Array(items) => {
            for item in items {
                encode_value(item, buf);
            }
            buf.push(END_OF_CONTAINER);
        }
        Bson::Binary(bin) => {
            buf.extend_from_slice(&(bin.bytes.len() as u32).to_be_bytes());
            buf.push(u8::from(bin.subtype));
            buf.extend_from_slice(&bin.bytes);
        }
        Bson::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => buf.push(u8::from(*b)),
        Bson::DateTime(dt) => buf.extend_from_slice(&encode_i64_sortable(dt.timestamp_millis())),
        Bson::Timestamp(ts) => {
            buf.extend_from_slice(&ts.time.to_be_bytes());
            buf.extend_from_slice(&ts.increment.to_be_bytes());
        }
        Bson::RegularExpression(re) => {
            write_escaped(buf, re.pattern.as_str().as_bytes());
            write_escaped(buf, re.options.as_str().as_bytes());
        }
        Bson::JavaScriptCodeWithScope(code) => {
            write_escaped(buf, code.code.as_bytes());
            encode_document(&code.scope, buf);
        }
    }
}

fn encode_document(doc: &Document, buf: &mut Vec<u8>) {
    for (key, value) in doc {
        buf.push(TypeRank::of(value) as u8);
        write_escaped(buf, key.as_bytes());
        encode_payload(value, buf);
    }
    buf.push(END_OF_CONTAINER);
}

/// Encoded size of a value without materializing it.
pub fn encoded_len(value: &Bson) -> usize {
    1 + payload_len(value)
}

fn payload_len(value: &Bson) -> usize {
    match value {
        Bson::MinKey | Bson::MaxKey | Bson::Null | Bson::Undefined | Bson::DbPointer(_) => 0,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => {
            match NumericKey::of(value) {
                Some(NumericKey::Value { .. }) => 17,
                _ => 1,
            }
        }
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => escaped_len(s.as_bytes()),
        Bson::Document(doc) => document_len(doc),
        Bson::Array(items) => items.iter().map(encoded_len).sum::<usize>() + 1,
        Bson::Binary(bin) => 5 + bin.bytes.len(),
        Bson::ObjectId(_) => 12,
        Bson::Boolean(_) => 1,
        Bson::DateTime(_) | Bson::Timestamp(_) => 8,
        Bson::RegularExpression(re) => {
            escaped_len(re.pattern.as_str().as_bytes()) + escaped_len(re.options.as_str().as_bytes())
        }
        Bson::JavaScriptCodeWithScope(code) => {
            escaped_len(code.code.as_bytes()) + document_len(&code.scope)
        }
    }
}

fn document_len(doc: &Document) -> usize {
    doc.iter()
        .map(|(k, v)| 1 + escaped_len(k.as_bytes()) + payload_len(v))
        .sum::<usize>()
        + 1
}

// ── Decoding ───────────────────────────────────────────────────

pub fn decode_value(bytes: &[u8], pos: &mut usize) -> Result<Bson, DecodeError> {
    let rank_byte = take_byte(bytes, pos)?;
    let rank = TypeRank::from_byte(rank_byte).ok_or(DecodeError::UnknownRank(rank_byte))?;
    decode_payload(rank, bytes, pos)
}

fn decode_payload(rank: TypeRank, bytes: &[u8], pos: &mut usize) -> Result<Bson, DecodeError> {
    let value = match rank {
        TypeRank::MinKey => Bson::MinKey,
        TypeRank::MaxKey => Bson::MaxKey,
        TypeRank::Null => Bson::Null,
        TypeRank::Undefined => Bson::Undefined,
        TypeRank::DbPointer => return Err(DecodeError::Unsupported("dbPointer")),
        TypeRank::Number => match take_byte(bytes, pos)? {
            NUMBER_NAN => NumericKey::NaN.to_bson(),
            NUMBER_VALUE => {
                let approx = decode_f64_sortable(take_array(bytes, pos)?);
                let remainder = decode_i64_sortable(take_array(bytes, pos)?);
                NumericKey::Value { approx, remainder }.to_bson()
            }
            other => return Err(DecodeError::Malformed(format!("number tag {other:#x}"))),
        },
        TypeRank::String => Bson::String(read_string(bytes, pos)?),
        TypeRank::JavaScript => Bson::JavaScriptCode(read_string(bytes, pos)?),
        TypeRank::Document => Bson::Document(decode_document(bytes, pos)?),
        TypeRank::Array => {
            let mut items = Vec::new();
            while peek_byte(bytes, *pos)? != END_OF_CONTAINER {
                items.push(decode_value(bytes, pos)?);
            }
            *pos += 1;
            Bson::Array(items)
        }
        TypeRank::Binary => {
            let len = u32::from_be_bytes(take_array(bytes, pos)?) as usize;
            let subtype = BinarySubtype::from(take_byte(bytes, pos)?);
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or(DecodeError::UnexpectedEnd)?;
            let data = bytes[*pos..end].to_vec();
            *pos = end;
            Bson::Binary(bson::Binary {
                subtype,
                bytes: data,
            })
        }
        TypeRank::ObjectId => Bson::ObjectId(bson::oid::ObjectId::from_bytes(take_array(
            bytes, pos,
        )?)),
        TypeRank::Boolean => Bson::Boolean(take_byte(bytes, pos)? != 0),
        TypeRank::DateTime => Bson::DateTime(bson::DateTime::from_millis(decode_i64_sortable(
            take_array(bytes, pos)?,
        ))),
        TypeRank::Timestamp => {
            let time = u32::from_be_bytes(take_array(bytes, pos)?);
            let increment = u32::from_be_bytes(take_array(bytes, pos)?);
            Bson::Timestamp(bson::Timestamp { time, increment })
        }
        TypeRank::Regex => {
            let pattern = read_string(bytes, pos)?;
            let options = read_string(bytes, pos)?;
            regex_value(&pattern, &options)
                .ok_or_else(|| DecodeError::Malformed("regex contains NUL".into()))?
        }
        TypeRank::JavaScriptWithScope => {
            let code = read_string(bytes, pos)?;
            let scope = decode_document(bytes, pos)?;
            Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope { code, scope })
        }
    };
    Ok(value)
}

fn decode_document(bytes: &[u8], pos: &mut usize) -> Result<Document, DecodeError> {
    let mut doc = Document::new();
    loop {
        let rank_byte = take_byte(bytes, pos)?;
        if rank_byte == END_OF_CONTAINER {
            return Ok(doc);
        }
        let rank = TypeRank::from_byte(rank_byte).ok_or(DecodeError::UnknownRank(rank_byte))?;
        let key = read_string(bytes, pos)?;
        let value = decode_payload(rank, bytes, pos)?;
        doc.insert(key, value);
    }
}

/// Build a regular-expression value from its parts.
pub fn regex_value(pattern: &str, options: &str) -> Option<Bson> {
    let pattern = bson::raw::CString::try_from(pattern).ok()?;
    let options = bson::raw::CString::try_from(options).ok()?;
    Some(Bson::RegularExpression(bson::Regex { pattern, options }))
}

fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String, DecodeError> {
    let raw = read_escaped(bytes, pos).ok_or(DecodeError::UnexpectedEnd)?;
    String::from_utf8(raw).map_err(|_| DecodeError::Malformed("invalid utf-8".into()))
}

fn take_byte(bytes: &[u8], pos: &mut usize) -> Result<u8, DecodeError> {
    let b = peek_byte(bytes, *pos)?;
    *pos += 1;
    Ok(b)
}

fn peek_byte(bytes: &[u8], pos: usize) -> Result<u8, DecodeError> {
    bytes.get(pos).copied().ok_or(DecodeError::UnexpectedEnd)
}

fn take_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N], DecodeError> {
    let end = *pos + N;
    let slice = bytes.get(*pos..end).ok_or(DecodeError::UnexpectedEnd)?;
    *pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}
