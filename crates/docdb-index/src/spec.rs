//! Index key patterns.

use std::fmt;

use bson::{Bson, Document};
use docdb_bson::is_path_prefix;
use docdb_query::{Error, Result};

const WILDCARD_SUFFIX: &str = "$**";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn is_descending(self) -> bool {
        self == Direction::Descending
    }

    fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

/// One column of an index. For a wildcard column `path` is the subtree
/// prefix (empty for `$**`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPath {
    pub path: String,
    pub direction: Direction,
    pub wildcard: bool,
}

impl IndexPath {
    pub fn new(path: impl Into<String>, direction: Direction) -> Self {
        IndexPath {
            path: path.into(),
            direction,
            wildcard: false,
        }
    }

    pub fn wildcard(prefix: impl Into<String>, direction: Direction) -> Self {
        IndexPath {
            path: prefix.into(),
            direction,
            wildcard: true,
        }
    }

    /// The key as written in an index definition.
    pub fn key_name(&self) -> String {
        match (self.wildcard, self.path.is_empty()) {
            (true, true) => WILDCARD_SUFFIX.to_string(),
            (true, false) => format!("{}.{WILDCARD_SUFFIX}", self.path),
            (false, _) => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSpecKind {
    Single,
    Composite,
    Wildcard,
}

/// Ordered index columns with at most one wildcard position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    paths: Vec<IndexPath>,
    wildcard_index: Option<usize>,
}

impl PathSpec {
    pub fn new(paths: Vec<IndexPath>) -> Result<PathSpec> {
        if paths.is_empty() {
            return Err(Error::bad_value("Index keys cannot be empty."));
        }
        if paths.len() > u8::MAX as usize {
            return Err(Error::bad_value(format!(
                "Index has too many paths: {}",
                paths.len()
            )));
        }
        let mut wildcard_index = None;
        for (i, path) in paths.iter().enumerate() {
            if path.wildcard {
                if wildcard_index.is_some() {
                    return Err(Error::bad_value(
                        "An index can have at most one wildcard path",
                    ));
                }
                wildcard_index = Some(i);
            }
            if paths[..i].iter().any(|p| p.key_name() == path.key_name()) {
                return Err(Error::bad_value(format!(
                    "Index key path '{}' is specified more than once",
                    path.key_name()
                )));
            }
        }
        Ok(PathSpec {
            paths,
            wildcard_index,
        })
    }

    pub fn kind(&self) -> PathSpecKind {
        if self.wildcard_index.is_some() {
            PathSpecKind::Wildcard
        } else if self.paths.len() == 1 {
            PathSpecKind::Single
        } else {
            PathSpecKind::Composite
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[IndexPath] {
        &self.paths
    }

    pub fn path(&self, column: usize) -> Option<&IndexPath> {
        self.paths.get(column)
    }

    pub fn wildcard_index(&self) -> Option<usize> {
        self.wildcard_index
    }

    pub fn is_descending(&self, column: usize) -> bool {
        self.paths
            .get(column)
            .is_some_and(|p| p.direction.is_descending())
    }

    /// The column a query path is served by: an exact match on a regular
    /// column wins over the wildcard subtree.
    pub fn column_for(&self, query_path: &str) -> Option<usize> {
        self.paths
            .iter()
            .position(|p| !p.wildcard && p.path == query_path)
            .or_else(|| {
                self.wildcard_index
                    .filter(|&i| is_path_prefix(&self.paths[i].path, query_path))
            })
    }
}

/// A parsed `{key, name, unique, enableCompositeTerm, ...}` index spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub spec: PathSpec,
    pub unique: bool,
    pub enable_composite_term: bool,
    pub enable_reduced_correlated_terms: bool,
}

impl IndexDefinition {
    pub fn parse(definition: &Document) -> Result<IndexDefinition> {
        let key = match definition.get("key") {
            Some(Bson::Document(key)) => key,
            Some(_) => {
                return Err(Error::type_mismatch(
                    "The field 'key' must be an object",
                ));
            }
            None => {
                return Err(Error::failed_to_parse(
                    "The 'key' field is a required property of an index specification",
                ));
            }
        };
        let spec = parse_key_pattern(key)?;

        let name = match definition.get("name") {
            Some(Bson::String(name)) if !name.is_empty() => name.clone(),
            Some(Bson::String(_)) => return Err(Error::bad_value("index name cannot be empty")),
            Some(_) => {
                return Err(Error::type_mismatch("The field 'name' must be a string"));
            }
            None => default_name(&spec),
        };

        let flag = |field: &str, default: bool| -> Result<bool> {
            match definition.get(field) {
                None => Ok(default),
                Some(Bson::Boolean(b)) => Ok(*b),
                Some(Bson::Int32(n)) => Ok(*n != 0),
                Some(Bson::Int64(n)) => Ok(*n != 0),
                Some(Bson::Double(f)) => Ok(*f != 0.0),
                Some(_) => Err(Error::type_mismatch(format!(
                    "The field '{field}' must be a boolean"
                ))),
            }
        };

        Ok(IndexDefinition {
            name,
            unique: flag("unique", false)?,
            enable_composite_term: flag("enableCompositeTerm", true)?,
            enable_reduced_correlated_terms: flag("enableReducedCorrelatedTerms", false)?,
            spec,
        })
    }

    pub fn key_document(&self) -> Document {
        self.spec
            .paths()
            .iter()
            .map(|p| (p.key_name(), Bson::Int32(p.direction.as_i32())))
            .collect()
    }
}

fn parse_key_pattern(key: &Document) -> Result<PathSpec> {
    let mut paths = Vec::with_capacity(key.len());
    for (name, value) in key {
        let direction = match value {
            Bson::Int32(n) if *n != 0 => signed(i64::from(*n)),
            Bson::Int64(n) if *n != 0 => signed(*n),
            Bson::Double(f) if *f != 0.0 && !f.is_nan() => {
                if *f > 0.0 {
                    Direction::Ascending
                } else {
                    Direction::Descending
                }
            }
            Bson::String(kind) => {
                return Err(Error::not_supported(format!(
                    "Index type '{kind}' is not supported for composite indexes"
                )));
            }
            other => {
                return Err(Error::bad_value(format!(
                    "Values in the index key pattern must be non-zero numbers, found {other}"
                )));
            }
        };
        paths.push(parse_key_path(name, direction)?);
    }
    PathSpec::new(paths)
}

fn signed(n: i64) -> Direction {
    if n > 0 {
        Direction::Ascending
    } else {
        Direction::Descending
    }
}

fn parse_key_path(name: &str, direction: Direction) -> Result<IndexPath> {
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(Error::bad_value(format!(
            "Index key contains an empty field name: '{name}'"
        )));
    }
    if name == WILDCARD_SUFFIX {
        return Ok(IndexPath::wildcard("", direction));
    }
    if let Some(prefix) = name.strip_suffix(".$**") {
        if prefix.contains(WILDCARD_SUFFIX) {
            return Err(Error::bad_value(format!(
                "Index key contains an illegal field name: '{name}'"
            )));
        }
        return Ok(IndexPath::wildcard(prefix, direction));
    }
    if name.split('.').any(|seg| seg.starts_with('$')) {
        return Err(Error::bad_value(format!(
            "Index key contains an illegal field name: '{name}'"
        )));
    }
    Ok(IndexPath::new(name, direction))
}

fn default_name(spec: &PathSpec) -> String {
    spec.paths()
        .iter()
        .map(|p| format!("{}_{}", p.key_name(), p.direction.as_i32()))
        .collect::<Vec<_>>()
        .join("_")
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, path) in self.paths.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", path.key_name(), path.direction.as_i32())?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use docdb_query::ErrorCode;

    use super::*;

    #[test]
    fn parses_composite_with_wildcard() {
        let def = IndexDefinition::parse(&doc! {
            "key": { "a": 1, "b.$**": -1 },
            "name": "a_b",
            "enableReducedCorrelatedTerms": true,
        })
        .unwrap();
        assert_eq!(def.name, "a_b");
        assert_eq!(def.spec.kind(), PathSpecKind::Wildcard);
        assert_eq!(def.spec.wildcard_index(), Some(1));
        assert!(def.spec.is_descending(1));
        assert!(def.enable_reduced_correlated_terms);
        assert_eq!(def.key_document(), doc! { "a": 1, "b.$**": -1 });
    }

    #[test]
    fn column_lookup_prefers_exact_paths() {
        let spec = PathSpec::new(vec![
            IndexPath::new("a.x", Direction::Ascending),
            IndexPath::wildcard("a", Direction::Ascending),
        ])
        .unwrap();
        assert_eq!(spec.column_for("a.x"), Some(0));
        assert_eq!(spec.column_for("a.y.z"), Some(1));
        assert_eq!(spec.column_for("b"), None);
    }

    #[test]
    fn default_name_joins_keys() {
        let def = IndexDefinition::parse(&doc! { "key": { "a": 1, "b": -1 } }).unwrap();
        assert_eq!(def.name, "a_1_b_-1");
        assert_eq!(def.spec.kind(), PathSpecKind::Composite);
        assert!(def.enable_composite_term);
    }

    #[test]
    fn rejects_bad_patterns() {
        let err = IndexDefinition::parse(&doc! { "name": "x" }).unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedToParse);
        assert!(IndexDefinition::parse(&doc! { "key": {} }).is_err());
        assert!(IndexDefinition::parse(&doc! { "key": { "a": 0 } }).is_err());
        assert!(IndexDefinition::parse(&doc! { "key": { "a..b": 1 } }).is_err());
        assert!(IndexDefinition::parse(&doc! { "key": { "$**": 1, "a.$**": 1 } }).is_err());
        let err = IndexDefinition::parse(&doc! { "key": { "a": "text" } }).unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandNotSupported);
    }
}
