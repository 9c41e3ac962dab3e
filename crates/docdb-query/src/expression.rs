use bson::Bson;
use serde::{Deserialize, Serialize};

use crate::operator::Operator;

/// A single `path <op> value` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPredicate {
    pub path: String,
    pub operator: Operator,
    pub value: Bson,
}

impl QueryPredicate {
    pub fn new(path: impl Into<String>, operator: Operator, value: Bson) -> Self {
        QueryPredicate {
            path: path.into(),
            operator,
            value,
        }
    }
}

/// Parsed filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// The empty filter.
    True,
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Nor(Vec<Expression>),
    /// `$not` around an operator with no direct negated form.
    Not(Box<Expression>),
    Condition(QueryPredicate),
    /// An aggregation expression (`$expr`), evaluated by the runtime.
    Expr(Bson),
}

impl Expression {
    pub fn is_true(&self) -> bool {
        matches!(self, Expression::True)
    }

    /// `true` when `$expr` appears anywhere under `$and`/`$or`/`$nor`.
    pub fn contains_expr(&self) -> bool {
        match self {
            Expression::Expr(_) => true,
            Expression::And(children) | Expression::Or(children) | Expression::Nor(children) => {
                children.iter().any(Expression::contains_expr)
            }
            Expression::Not(inner) => inner.contains_expr(),
            Expression::True | Expression::Condition(_) => false,
        }
    }

    /// Top-level conjuncts: the predicates every matching document satisfies.
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self {
            Expression::And(children) => children.iter().flat_map(|c| c.conjuncts()).collect(),
            Expression::True => Vec::new(),
            other => vec![other],
        }
    }

    /// Conditions that appear as top-level conjuncts.
    pub fn conjunct_predicates(&self) -> Vec<&QueryPredicate> {
        self.conjuncts()
            .into_iter()
            .filter_map(|e| match e {
                Expression::Condition(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn and(children: Vec<Expression>) -> Expression {
        let mut flat: Vec<Expression> = children.into_iter().filter(|c| !c.is_true()).collect();
        match flat.len() {
            0 => Expression::True,
            1 => flat.remove(0),
            _ => Expression::And(flat),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::Bson;

    use super::*;

    #[test]
    fn and_flattens_trivial_children() {
        let p = Expression::Condition(QueryPredicate::new("a", Operator::Eq, Bson::Int32(1)));
        assert_eq!(Expression::and(vec![Expression::True, p.clone()]), p);
        assert!(Expression::and(vec![]).is_true());
    }

    #[test]
    fn finds_nested_expr() {
        let e = Expression::Or(vec![
            Expression::True,
            Expression::And(vec![Expression::Expr(Bson::Boolean(true))]),
        ]);
        assert!(e.contains_expr());
        assert!(!Expression::True.contains_expr());
    }
}
