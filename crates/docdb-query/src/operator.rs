use serde::{Deserialize, Serialize};

/// Comparison operators a predicate can carry, including the negated
/// range forms produced by `$not`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Exists,
    Type,
    Size,
    Mod,
    Regex,
    ElemMatch,
    BitsAllSet,
    BitsAnySet,
    BitsAllClear,
    BitsAnyClear,
    Range,
    NotGt,
    NotGte,
    NotLt,
    NotLte,
    OrderBy,
    OrderByReverse,
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Operator> {
        let op = match name {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$all" => Operator::All,
            "$exists" => Operator::Exists,
            "$type" => Operator::Type,
            "$size" => Operator::Size,
            "$mod" => Operator::Mod,
            "$regex" => Operator::Regex,
            "$elemMatch" => Operator::ElemMatch,
            "$bitsAllSet" => Operator::BitsAllSet,
            "$bitsAnySet" => Operator::BitsAnySet,
            "$bitsAllClear" => Operator::BitsAllClear,
            "$bitsAnyClear" => Operator::BitsAnyClear,
            "$range" => Operator::Range,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
            Operator::All => "$all",
            Operator::Exists => "$exists",
            Operator::Type => "$type",
            Operator::Size => "$size",
            Operator::Mod => "$mod",
            Operator::Regex => "$regex",
            Operator::ElemMatch => "$elemMatch",
            Operator::BitsAllSet => "$bitsAllSet",
            Operator::BitsAnySet => "$bitsAnySet",
            Operator::BitsAllClear => "$bitsAllClear",
            Operator::BitsAnyClear => "$bitsAnyClear",
            Operator::Range => "$range",
            Operator::NotGt => "$not.$gt",
            Operator::NotGte => "$not.$gte",
            Operator::NotLt => "$not.$lt",
            Operator::NotLte => "$not.$lte",
            Operator::OrderBy => "$orderBy",
            Operator::OrderByReverse => "$orderByReverse",
        }
    }

    /// The operator `$not` turns this one into, when it has a direct form.
    pub fn negated(self) -> Option<Operator> {
        match self {
            Operator::Gt => Some(Operator::NotGt),
            Operator::Gte => Some(Operator::NotGte),
            Operator::Lt => Some(Operator::NotLt),
            Operator::Lte => Some(Operator::NotLte),
            Operator::Eq => Some(Operator::Ne),
            Operator::In => Some(Operator::Nin),
            _ => None,
        }
    }

    /// Operators whose match set includes documents missing the path or
    /// holding values outside the operand's type.
    pub fn is_negation(self) -> bool {
        matches!(
            self,
            Operator::Ne
                | Operator::Nin
                | Operator::NotGt
                | Operator::NotGte
                | Operator::NotLt
                | Operator::NotLte
        )
    }
}
