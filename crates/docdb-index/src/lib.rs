//! Composite index engine: term generation for stored documents, bounds
//! solving for queries, and the scan callbacks a storage layer drives.

pub mod bounds;
mod config;
pub mod generator;
mod memory;
mod opclass;
pub mod scan;
pub mod solver;
mod spec;

pub use config::IndexConfig;
pub use generator::{GeneratedTerms, PathTerms, TermGenerator};
pub use memory::{Candidate, DocId, MemoryIndex, ScanOutput, ScanStep};
pub use opclass::{
    CompositeOpClass, CompositeQuery, ExtractedQuery, IndexOpClass, IndexQuery, SharedOpClass,
    Strategy,
};
pub use scan::{Consistency, PartialMatch, SkipTarget};
pub use solver::{BoundsSolver, MAX_SCAN_KEYS, QueryKey, QueryKeys, QueryMetaInfo, SolveOptions};
pub use spec::{Direction, IndexDefinition, IndexPath, PathSpec, PathSpecKind};
