use std::cmp::Ordering;

use bson::{Bson, Document};

/// Canonical BSON sort classes. The discriminant is the leading byte of a
/// value's order-preserving encoding, so the numbering is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypeRank {
    MinKey = 0x01,
    Undefined = 0x02,
    Null = 0x03,
    Number = 0x10,
    String = 0x20,
    Document = 0x30,
    Array = 0x40,
    Binary = 0x50,
    ObjectId = 0x60,
    Boolean = 0x70,
    DateTime = 0x80,
    Timestamp = 0x90,
    Regex = 0xA0,
    DbPointer = 0xB0,
    JavaScript = 0xC0,
    JavaScriptWithScope = 0xD0,
    MaxKey = 0xF0,
}

impl TypeRank {
    pub const ALL: [TypeRank; 17] = [
        TypeRank::MinKey,
        TypeRank::Undefined,
        TypeRank::Null,
        TypeRank::Number,
        TypeRank::String,
        TypeRank::Document,
        TypeRank::Array,
        TypeRank::Binary,
        TypeRank::ObjectId,
        TypeRank::Boolean,
        TypeRank::DateTime,
        TypeRank::Timestamp,
        TypeRank::Regex,
        TypeRank::DbPointer,
        TypeRank::JavaScript,
        TypeRank::JavaScriptWithScope,
        TypeRank::MaxKey,
    ];

    pub fn from_byte(b: u8) -> Option<TypeRank> {
        Self::ALL.iter().copied().find(|r| *r as u8 == b)
    }

    pub fn of(value: &Bson) -> TypeRank {
        match value {
            Bson::MinKey => TypeRank::MinKey,
            Bson::Undefined => TypeRank::Undefined,
            Bson::Null => TypeRank::Null,
            Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => {
                TypeRank::Number
            }
            Bson::String(_) | Bson::Symbol(_) => TypeRank::String,
            Bson::Document(_) => TypeRank::Document,
            Bson::Array(_) => TypeRank::Array,
            Bson::Binary(_) => TypeRank::Binary,
            Bson::ObjectId(_) => TypeRank::ObjectId,
            Bson::Boolean(_) => TypeRank::Boolean,
            Bson::DateTime(_) => TypeRank::DateTime,
            Bson::Timestamp(_) => TypeRank::Timestamp,
            Bson::RegularExpression(_) => TypeRank::Regex,
            Bson::DbPointer(_) => TypeRank::DbPointer,
            Bson::JavaScriptCode(_) => TypeRank::JavaScript,
            Bson::JavaScriptCodeWithScope(_) => TypeRank::JavaScriptWithScope,
            Bson::MaxKey => TypeRank::MaxKey,
        }
    }

    /// The rank that immediately follows this one, or `None` for MaxKey.
    pub fn next(self) -> Option<TypeRank> {
        let idx = Self::ALL.iter().position(|r| *r == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Smallest value in this sort class.
    pub fn min_value(self) -> Bson {
        match self {
            TypeRank::MinKey => Bson::MinKey,
            TypeRank::Undefined => Bson::Undefined,
            TypeRank::Null => Bson::Null,
            TypeRank::Number => Bson::Double(f64::NAN),
            TypeRank::String => Bson::String(String::new()),
            TypeRank::Document => Bson::Document(Document::new()),
            TypeRank::Array => Bson::Array(Vec::new()),
            TypeRank::Binary => Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: Vec::new(),
            }),
            TypeRank::ObjectId => Bson::ObjectId(bson::oid::ObjectId::from_bytes([0; 12])),
            TypeRank::Boolean => Bson::Boolean(false),
            TypeRank::DateTime => Bson::DateTime(bson::DateTime::from_millis(i64::MIN)),
            TypeRank::Timestamp => Bson::Timestamp(bson::Timestamp {
                time: 0,
                increment: 0,
            }),
            TypeRank::Regex => crate::key::regex_value("", "").unwrap_or(Bson::Null),
            // DbPointer has no public constructor; JavaScript code is the
            // nearest expressible value above every pointer.
            TypeRank::DbPointer => Bson::JavaScriptCode(String::new()),
            TypeRank::JavaScript => Bson::JavaScriptCode(String::new()),
            TypeRank::JavaScriptWithScope => {
                Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope {
                    code: String::new(),
                    scope: Document::new(),
                })
            }
            TypeRank::MaxKey => Bson::MaxKey,
        }
    }

    /// Largest value in this sort class, when one is expressible.
    pub fn max_value(self) -> Option<Bson> {
        match self {
            TypeRank::MinKey => Some(Bson::MinKey),
            TypeRank::Undefined => Some(Bson::Undefined),
            TypeRank::Null => Some(Bson::Null),
            TypeRank::Number => Some(Bson::Double(f64::INFINITY)),
            TypeRank::ObjectId => Some(Bson::ObjectId(bson::oid::ObjectId::from_bytes(
                [0xFF; 12],
            ))),
            TypeRank::Boolean => Some(Bson::Boolean(true)),
            TypeRank::DateTime => Some(Bson::DateTime(bson::DateTime::from_millis(i64::MAX))),
            TypeRank::Timestamp => Some(Bson::Timestamp(bson::Timestamp {
                time: u32::MAX,
                increment: u32::MAX,
            })),
            TypeRank::MaxKey => Some(Bson::MaxKey),
            _ => None,
        }
    }
}

// ── Numbers ────────────────────────────────────────────────────

/// Normalized numeric key shared by comparison, encoding and hashing.
///
/// Every finite number is `(approx, remainder)`: its nearest double plus
/// the integer error for int64 values a double cannot hold exactly. NaN
/// sorts below every other number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericKey {
    NaN,
    Value { approx: f64, remainder: i64 },
}

impl NumericKey {
    pub fn of(value: &Bson) -> Option<NumericKey> {
        let key = match value {
            Bson::Int32(n) => NumericKey::Value {
                approx: f64::from(*n),
                remainder: 0,
            },
            Bson::Int64(n) => {
                let approx = *n as f64;
                let remainder = i128::from(*n) - approx as i128;
                NumericKey::Value {
                    approx,
                    remainder: remainder as i64,
                }
            }
            Bson::Double(f) => Self::from_f64(*f),
            Bson::Decimal128(d) => Self::from_f64(decimal128_to_f64(&d.bytes())),
            _ => return None,
        };
        Some(key)
    }

    fn from_f64(f: f64) -> NumericKey {
        if f.is_nan() {
            NumericKey::NaN
        } else {
            NumericKey::Value {
                approx: if f == 0.0 { 0.0 } else { f },
                remainder: 0,
            }
        }
    }

    pub fn cmp(&self, other: &NumericKey) -> Ordering {
        match (self, other) {
            (NumericKey::NaN, NumericKey::NaN) => Ordering::Equal,
            (NumericKey::NaN, _) => Ordering::Less,
            (_, NumericKey::NaN) => Ordering::Greater,
            (
                NumericKey::Value {
                    approx: a,
                    remainder: ra,
                },
                NumericKey::Value {
                    approx: b,
                    remainder: rb,
                },
            ) => a.total_cmp(b).then(ra.cmp(rb)),
        }
    }

    /// The exact integer this key denotes, if it is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            NumericKey::NaN => None,
            NumericKey::Value { approx, remainder } => {
                if approx.fract() != 0.0 || !approx.is_finite() {
                    return None;
                }
                if approx < -9.223_372_036_854_776e18 || approx > 9.223_372_036_854_776e18 {
                    return None;
                }
                let exact = approx as i128 + i128::from(remainder);
                i64::try_from(exact).ok()
            }
        }
    }

    /// Rebuild a value from a key. Integral values become int32 when they
    /// fit, then int64; everything else is a double.
    pub fn to_bson(&self) -> Bson {
        match *self {
            NumericKey::NaN => Bson::Double(f64::NAN),
            NumericKey::Value { approx, remainder } => match self.as_i64() {
                Some(n) if remainder != 0 || approx.abs() < 9.007_199_254_740_992e15 => {
                    match i32::try_from(n) {
                        Ok(small) => Bson::Int32(small),
                        Err(_) => Bson::Int64(n),
                    }
                }
                _ => Bson::Double(approx),
            },
        }
    }
}

/// Approximate an IEEE 754-2008 BID decimal128 as a double.
pub fn decimal128_to_f64(bytes: &[u8; 16]) -> f64 {
    let bits = u128::from_le_bytes(*bytes);
    let negative = (bits >> 127) & 1 == 1;
    let combination = (bits >> 122) & 0x1F;
    let magnitude = if combination == 0x1F {
        return f64::NAN;
    } else if combination == 0x1E {
        f64::INFINITY
    } else {
        let (exponent, coefficient) = if (bits >> 125) & 0b11 == 0b11 {
            let exponent = (bits >> 111) & 0x3FFF;
            let coefficient = (0b100u128 << 111) | (bits & ((1u128 << 111) - 1));
            (exponent, coefficient)
        } else {
            let exponent = (bits >> 113) & 0x3FFF;
            let coefficient = bits & ((1u128 << 113) - 1);
            (exponent, coefficient)
        };
        // Non-canonical coefficients are zero.
        let coefficient = if coefficient > 9_999_999_999_999_999_999_999_999_999_999_999 {
            0
        } else {
            coefficient
        };
        let scale = exponent as i32 - 6176;
        coefficient as f64 * 10f64.powi(scale)
    };
    if negative { -magnitude } else { magnitude }
}

// ── Canonical comparison ───────────────────────────────────────

/// Total order over BSON values following the canonical type ordering.
pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (TypeRank::of(a), TypeRank::of(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        _ if ra == TypeRank::Number => match (NumericKey::of(a), NumericKey::of(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
        _ if ra == TypeRank::String => string_bytes(a).cmp(string_bytes(b)),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => compare_arrays(x, y),
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then(x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .as_str()
            .cmp(y.pattern.as_str())
            .then(x.options.as_str().cmp(y.options.as_str())),
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::JavaScriptCodeWithScope(x), Bson::JavaScriptCodeWithScope(y)) => x
            .code
            .as_bytes()
            .cmp(y.code.as_bytes())
            .then_with(|| compare_documents(&x.scope, &y.scope)),
        _ => Ordering::Equal,
    }
}

/// Numeric-aware equality (`1 == 1.0 == 1i64`).
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare_values(a, b) == Ordering::Equal
}

pub fn compare_documents(a: &Document, b: &Document) -> Ordering {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = TypeRank::of(va)
                    .cmp(&TypeRank::of(vb))
                    .then(ka.as_bytes().cmp(kb.as_bytes()))
                    .then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

pub fn compare_arrays(a: &[Bson], b: &[Bson]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = compare_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn string_bytes(value: &Bson) -> &[u8] {
    match value {
        Bson::String(s) | Bson::Symbol(s) => s.as_bytes(),
        _ => &[],
    }
}

pub fn is_nan(value: &Bson) -> bool {
    matches!(NumericKey::of(value), Some(NumericKey::NaN))
}
