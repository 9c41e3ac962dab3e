use bson::Bson;
use bson::spec::ElementType;
use docdb_bson::TypeRank;

use crate::error::{Error, Result};

/// A `$type` operand: a concrete element type or the `number` alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSelector {
    Element(ElementType),
    Number,
}

impl TypeSelector {
    pub fn parse(value: &Bson) -> Result<TypeSelector> {
        match value {
            Bson::String(name) => Self::from_name(name)
                .ok_or_else(|| Error::bad_value(format!("Unknown type name alias: {name}"))),
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                let code = match value {
                    Bson::Int32(n) => i64::from(*n),
                    Bson::Int64(n) => *n,
                    Bson::Double(f) if f.fract() == 0.0 => *f as i64,
                    _ => return Err(Error::bad_value("Invalid numerical type code")),
                };
                Self::from_code(code)
                    .ok_or_else(|| Error::bad_value(format!("Invalid numerical type code: {code}")))
            }
            _ => Err(Error::type_mismatch(
                "type must be represented as a number or a string",
            )),
        }
    }

    fn from_code(code: i64) -> Option<TypeSelector> {
        let byte = match code {
            -1 => 0xFF,
            127 => 0x7F,
            1..=19 => code as u8,
            _ => return None,
        };
        ElementType::from(byte).map(TypeSelector::Element)
    }

    pub fn from_name(name: &str) -> Option<TypeSelector> {
        let element = match name {
            "number" => return Some(TypeSelector::Number),
            "double" => ElementType::Double,
            "string" => ElementType::String,
            "object" => ElementType::EmbeddedDocument,
            "array" => ElementType::Array,
            "binData" => ElementType::Binary,
            "undefined" => ElementType::Undefined,
            "objectId" => ElementType::ObjectId,
            "bool" => ElementType::Boolean,
            "date" => ElementType::DateTime,
            "null" => ElementType::Null,
            "regex" => ElementType::RegularExpression,
            "dbPointer" => ElementType::DbPointer,
            "javascript" => ElementType::JavaScriptCode,
            "symbol" => ElementType::Symbol,
            "javascriptWithScope" => ElementType::JavaScriptCodeWithScope,
            "int" => ElementType::Int32,
            "timestamp" => ElementType::Timestamp,
            "long" => ElementType::Int64,
            "decimal" => ElementType::Decimal128,
            "minKey" => ElementType::MinKey,
            "maxKey" => ElementType::MaxKey,
            _ => return None,
        };
        Some(TypeSelector::Element(element))
    }

    pub fn matches(self, value: &Bson) -> bool {
        match self {
            TypeSelector::Number => TypeRank::of(value) == TypeRank::Number,
            TypeSelector::Element(t) => value.element_type() == t,
        }
    }

    pub fn is_array(self) -> bool {
        self == TypeSelector::Element(ElementType::Array)
    }

    /// The sort class holding values of this type.
    pub fn rank(self) -> TypeRank {
        match self {
            TypeSelector::Number => TypeRank::Number,
            TypeSelector::Element(t) => match t {
                ElementType::Double
                | ElementType::Int32
                | ElementType::Int64
                | ElementType::Decimal128 => TypeRank::Number,
                ElementType::String | ElementType::Symbol => TypeRank::String,
                ElementType::EmbeddedDocument => TypeRank::Document,
                ElementType::Array => TypeRank::Array,
                ElementType::Binary => TypeRank::Binary,
                ElementType::Undefined => TypeRank::Undefined,
                ElementType::ObjectId => TypeRank::ObjectId,
                ElementType::Boolean => TypeRank::Boolean,
                ElementType::DateTime => TypeRank::DateTime,
                ElementType::Null => TypeRank::Null,
                ElementType::RegularExpression => TypeRank::Regex,
                ElementType::DbPointer => TypeRank::DbPointer,
                ElementType::JavaScriptCode => TypeRank::JavaScript,
                ElementType::JavaScriptCodeWithScope => TypeRank::JavaScriptWithScope,
                ElementType::Timestamp => TypeRank::Timestamp,
                ElementType::MinKey => TypeRank::MinKey,
                ElementType::MaxKey => TypeRank::MaxKey,
                #[allow(unreachable_patterns)]
                _ => TypeRank::MaxKey,
            },
        }
    }
}
