mod error;
mod expression;
mod interrupt;
pub mod matcher;
mod operator;
mod parse_filter;
mod range;
mod type_name;

pub use error::{Error, ErrorCode, ErrorKind, Result};
pub use expression::{Expression, QueryPredicate};
pub use interrupt::Interrupt;
pub use matcher::{matches, matches_predicate};
pub use operator::Operator;
pub use parse_filter::parse_filter;
pub use range::RangeParams;
pub use type_name::TypeSelector;
