//! BSON value ordering, hashing and index-term serialization.

pub mod compare;
pub mod composite;
mod error;
pub mod hash;
pub mod key;
pub mod path;
pub mod sortable;
pub mod term;

pub use compare::{NumericKey, TypeRank, compare_values, values_equal};
pub use composite::{CompositeTermRef, serialize_composite};
pub use error::{DecodeError, TermError};
pub use hash::{hash_value, hash_values};
pub use path::{collect_path_values, collect_terminal_values, get_path, is_path_prefix};
pub use term::{IndexTerm, RootMetadata, TermKind, compare_terms};
