//! Support for the `docdb-explain` binary: catalog loading and one-shot
//! planning of a JSON command.

pub mod catalog;
pub mod error;
pub mod explain;
