//! Wire command documents parsed into typed requests.

use bson::spec::BinarySubtype;
use bson::{Bson, Document, Uuid};
use docdb_query::{Error, ErrorCode, Result};

use crate::stage::as_number;
use crate::stages::type_name;

/// Fields any command may carry and the planner never looks at.
const IGNORED_FIELDS: &[&str] = &[
    "$clusterTime",
    "$readPreference",
    "apiDeprecationErrors",
    "apiStrict",
    "apiVersion",
    "autocommit",
    "comment",
    "lsid",
    "readConcern",
    "startTransaction",
    "txnNumber",
    "writeConcern",
];

fn is_ignored_field(name: &str) -> bool {
    IGNORED_FIELDS.contains(&name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Aggregate(AggregateRequest),
    Find(FindRequest),
    Count(CountRequest),
    Distinct(DistinctRequest),
    GetMore(GetMoreRequest),
}

impl Command {
    /// Parse a command by its first field. `database` takes precedence over
    /// a `$db` field in the document.
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<Command> {
        let Some(name) = spec.keys().next() else {
            return Err(Error::failed_to_parse("Command document must not be empty"));
        };
        match name.as_str() {
            "aggregate" => AggregateRequest::parse(spec, database).map(Command::Aggregate),
            "find" => FindRequest::parse(spec, database).map(Command::Find),
            "count" => CountRequest::parse(spec, database).map(Command::Count),
            "distinct" => DistinctRequest::parse(spec, database).map(Command::Distinct),
            "getMore" => GetMoreRequest::parse(spec, database).map(Command::GetMore),
            other => Err(Error::new(
                ErrorCode::UnrecognizedCommand,
                format!("no such command: '{other}'"),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Aggregate(_) => "aggregate",
            Command::Find(_) => "find",
            Command::Count(_) => "count",
            Command::Distinct(_) => "distinct",
            Command::GetMore(_) => "getMore",
        }
    }
}

// ── Field helpers ──────────────────────────────────────────────

fn wrong_type(field: &str, value: &Bson, expected: &str) -> Error {
    Error::type_mismatch(format!(
        "BSON field '{field}' is the wrong type '{}', expected type '{expected}'",
        type_name(value)
    ))
}

fn expect_str<'v>(field: &str, value: &'v Bson) -> Result<&'v str> {
    match value {
        Bson::String(s) => Ok(s),
        other => Err(wrong_type(field, other, "string")),
    }
}

fn expect_doc<'v>(field: &str, value: &'v Bson) -> Result<&'v Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        other => Err(wrong_type(field, other, "object")),
    }
}

fn expect_bool(field: &str, value: &Bson) -> Result<bool> {
    match value {
        Bson::Boolean(b) => Ok(*b),
        other => Err(wrong_type(field, other, "bool")),
    }
}

fn number_like(field: &str, value: &Bson) -> Result<i64> {
    match as_number(value) {
        Some(n) => Ok(n as i64),
        None => Err(Error::type_mismatch(format!(
            "BSON field '{field}' is the wrong type '{}', expected types '[long, int, decimal, double]'",
            type_name(value)
        ))),
    }
}

/// Batch sizes may be doubles; they truncate toward zero.
fn batch_size(field: &str, value: &Bson) -> Result<i64> {
    let size = number_like(field, value)?;
    if size < 0 {
        return Err(Error::bad_value(format!(
            "BatchSize value must be non-negative, but received: {size}"
        )));
    }
    Ok(size)
}

fn hint(value: &Bson) -> Result<Bson> {
    match value {
        Bson::String(_) | Bson::Document(_) => Ok(value.clone()),
        other => Err(wrong_type("hint", other, "string")),
    }
}

/// `let` accepts null and undefined as "no variables".
fn let_spec(field: &str, value: &Bson) -> Result<Option<Document>> {
    match value {
        Bson::Null | Bson::Undefined => Ok(None),
        Bson::Document(doc) if doc.is_empty() => Ok(None),
        Bson::Document(doc) => Ok(Some(doc.clone())),
        other => Err(wrong_type(field, other, "object")),
    }
}

fn collection_uuid(value: &Bson) -> Result<String> {
    let Bson::Binary(binary) = value else {
        return Err(wrong_type("collectionUUID", value, "binData"));
    };
    let bytes: Option<[u8; 16]> = binary.bytes.as_slice().try_into().ok();
    match bytes {
        Some(bytes) if binary.subtype == BinarySubtype::Uuid => {
            Ok(Uuid::from_bytes(bytes).to_string())
        }
        _ => Err(Error::bad_value("field collectionUUID must be a UUID")),
    }
}

/// The explicit database, else `$db`.
fn resolve_database(database: Option<&str>, from_spec: Option<String>) -> Result<String> {
    database
        .map(str::to_string)
        .or(from_spec)
        .ok_or_else(|| Error::bad_value("Required field database must be valid"))
}

fn read_db(value: &Bson) -> Result<String> {
    expect_str("$db", value).map(str::to_string)
}

// ── aggregate ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateRequest {
    pub database: String,
    /// `None` for `aggregate: 1`.
    pub collection: Option<String>,
    pub pipeline: Vec<Bson>,
    pub has_cursor: bool,
    pub batch_size: Option<i64>,
    pub single_batch: bool,
    pub explain: bool,
    pub hint: Option<Bson>,
    pub let_spec: Option<Document>,
    pub collection_uuid: Option<String>,
    pub collation: Option<Document>,
    pub max_time_ms: Option<i64>,
}

impl AggregateRequest {
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<AggregateRequest> {
        let mut request = AggregateRequest::default();
        let mut agnostic = false;
        let mut pipeline = None;
        let mut db = None;
        for (key, value) in spec {
            match key.as_str() {
                "aggregate" => match as_number(value) {
                    Some(n) if n == 1.0 => agnostic = true,
                    _ => request.collection = Some(expect_str("aggregate", value)?.to_string()),
                },
                "pipeline" => match value {
                    Bson::Array(stages) => pipeline = Some(stages.clone()),
                    other => return Err(wrong_type("pipeline", other, "array")),
                },
                "cursor" => {
                    request.has_cursor = true;
                    for (field, option) in expect_doc("cursor", value)? {
                        match field.as_str() {
                            "batchSize" => {
                                request.batch_size = Some(batch_size("cursor.batchSize", option)?)
                            }
                            "singleBatch" => {
                                request.single_batch = expect_bool("cursor.singleBatch", option)?
                            }
                            other => {
                                return Err(Error::failed_to_parse(format!(
                                    "Field not recognized: {other}"
                                )));
                            }
                        }
                    }
                }
                "allowDiskUse" => {
                    expect_bool("allowDiskUse", value)?;
                }
                "explain" => request.explain = expect_bool("explain", value)?,
                "hint" => request.hint = Some(hint(value)?),
                "let" => request.let_spec = let_spec("let", value)?,
                "collectionUUID" => request.collection_uuid = Some(collection_uuid(value)?),
                "collation" => request.collation = Some(expect_doc("collation", value)?.clone()),
                "maxTimeMS" => request.max_time_ms = Some(number_like("aggregate.maxTimeMS", value)?),
                "$db" => db = Some(read_db(value)?),
                other if is_ignored_field(other) => {}
                other => {
                    return Err(Error::bad_value(format!("{other} is not a recognized field")));
                }
            }
        }

        request.database = resolve_database(database, db)?;
        let Some(pipeline) = pipeline else {
            return Err(Error::bad_value("Required variable pipeline must be valid"));
        };
        request.pipeline = pipeline;
        if agnostic {
            request.collection = None;
        } else if request.collection.as_deref().is_none_or(str::is_empty) {
            return Err(Error::bad_value("Required variables aggregate must be valid"));
        }
        Ok(request)
    }
}

// ── find ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindRequest {
    pub database: String,
    pub collection: String,
    pub filter: Option<Document>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<Bson>,
    /// Negative limits are made positive; zero means no limit.
    pub limit: Option<Bson>,
    pub batch_size: Option<i64>,
    pub single_batch: bool,
    pub hint: Option<Bson>,
    pub let_spec: Option<Document>,
    pub collation: Option<Document>,
    pub max_time_ms: Option<i64>,
}

/// Fields `find` accepts and does nothing with.
const FIND_IGNORED: &[&str] = &[
    "allowDiskUse",
    "allowPartialResults",
    "max",
    "min",
    "noCursorTimeout",
    "ntoreturn",
    "oplogReplay",
    "readOnce",
    "tailable",
    "awaitData",
];

impl FindRequest {
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<FindRequest> {
        let mut request = FindRequest::default();
        let mut has_find = false;
        let mut db = None;
        for (key, value) in spec {
            match key.as_str() {
                "find" => {
                    has_find = true;
                    request.collection = expect_str("find", value)?.to_string();
                }
                "filter" => request.filter = Some(expect_doc("filter", value)?.clone()),
                "sort" => request.sort = Some(expect_doc("sort", value)?.clone()),
                "projection" => request.projection = Some(expect_doc("projection", value)?.clone()),
                "skip" => request.skip = Some(value.clone()),
                "limit" => request.limit = Some(value.clone()),
                "batchSize" => request.batch_size = Some(batch_size("batchSize", value)?),
                "singleBatch" => request.single_batch = expect_bool("singleBatch", value)?,
                "hint" => request.hint = Some(hint(value)?),
                "let" => request.let_spec = let_spec("let", value)?,
                "collation" => request.collation = Some(expect_doc("collation", value)?.clone()),
                "maxTimeMS" => request.max_time_ms = Some(number_like("find.maxTimeMS", value)?),
                "returnKey" | "showRecordId" => {
                    if matches!(value, Bson::Boolean(true)) {
                        return Err(Error::not_supported(format!(
                            "The key {key} is currently not supported"
                        )));
                    }
                }
                "$db" => db = Some(read_db(value)?),
                other if FIND_IGNORED.contains(&other) || is_ignored_field(other) => {}
                other => return Err(Error::bad_value(format!("{other} is an unknown field"))),
            }
        }

        request.database = resolve_database(database, db)?;
        if !has_find {
            return Err(Error::failed_to_parse("Required element \"find\" missing."));
        }
        if request.collection.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                "Collection name must not be left empty.",
            ));
        }
        request.limit = normalize_limit(request.limit.take());
        Ok(request)
    }
}

/// `find` and `count` accept negative limits as their absolute value and
/// treat zero as no limit.
fn normalize_limit(limit: Option<Bson>) -> Option<Bson> {
    let limit = limit?;
    match as_number(&limit) {
        Some(n) if n < 0.0 => Some(Bson::Int64((n as i64).saturating_abs())),
        Some(n) if n as i64 == 0 => None,
        _ => Some(limit),
    }
}

// ── count ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CountRequest {
    pub database: String,
    pub collection: String,
    pub query: Option<Document>,
    pub skip: Option<Bson>,
    pub limit: Option<Bson>,
    pub hint: Option<Bson>,
    pub collation: Option<Document>,
    pub max_time_ms: Option<i64>,
    /// Set when any of `query`, `skip` or `limit` was given.
    pub has_modifier: bool,
}

impl CountRequest {
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<CountRequest> {
        let mut request = CountRequest::default();
        let mut db = None;
        for (key, value) in spec {
            match key.as_str() {
                "count" => request.collection = expect_str("count", value)?.to_string(),
                "query" => {
                    request.query = Some(expect_doc("query", value)?.clone());
                    request.has_modifier = true;
                }
                "limit" => {
                    request.limit = Some(value.clone());
                    request.has_modifier = true;
                }
                "skip" => {
                    request.skip = Some(value.clone());
                    request.has_modifier = true;
                }
                "hint" => request.hint = Some(hint(value)?),
                "collation" => request.collation = Some(expect_doc("collation", value)?.clone()),
                "fields" => {}
                "maxTimeMS" => request.max_time_ms = Some(number_like("count.maxTimeMS", value)?),
                "$db" => db = Some(read_db(value)?),
                other if is_ignored_field(other) => {}
                other => return Err(Error::bad_value(format!("{other} is an unknown field"))),
            }
        }

        request.database = resolve_database(database, db)?;
        if request.collection.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                "Collection name must not be left empty.",
            ));
        }
        if let Some(skip) = &request.skip {
            if !matches!(skip, Bson::Null) {
                let Some(n) = as_number(skip) else {
                    return Err(Error::type_mismatch(format!(
                        "The BSON field 'skip' has an incorrect type '{}'; it should be one of the following types: [long, int, decimal, double].",
                        type_name(skip)
                    )));
                };
                if n < 0.0 {
                    return Err(Error::location(
                        51024,
                        format!(
                            "The BSON field 'skip' requires a value greater than or equal to 0, but the given value is '{}'.",
                            n as i64
                        ),
                    ));
                }
            }
        }
        request.limit = normalize_limit(request.limit.take());
        Ok(request)
    }
}

// ── distinct ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DistinctRequest {
    pub database: String,
    pub collection: String,
    pub key: String,
    pub query: Option<Document>,
    pub max_time_ms: Option<i64>,
}

impl DistinctRequest {
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<DistinctRequest> {
        let mut request = DistinctRequest::default();
        let mut has_distinct = false;
        let mut db = None;
        for (key, value) in spec {
            match key.as_str() {
                "distinct" => {
                    has_distinct = true;
                    request.collection = expect_str("distinct", value)?.to_string();
                }
                "query" => {
                    if !matches!(value, Bson::Null) {
                        request.query = Some(expect_doc("query", value)?.clone());
                    }
                }
                "key" => request.key = expect_str("key", value)?.to_string(),
                "maxTimeMS" => {
                    request.max_time_ms = Some(number_like("distinct.maxTimeMS", value)?)
                }
                "$db" => db = Some(read_db(value)?),
                other if is_ignored_field(other) => {}
                other => return Err(Error::bad_value(format!("{other} is an unknown field"))),
            }
        }

        request.database = resolve_database(database, db)?;
        if !has_distinct {
            return Err(Error::failed_to_parse("Required element \"distinct\" missing."));
        }
        if request.collection.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                "Collection name must not be left empty.",
            ));
        }
        if request.key.is_empty() {
            return Err(Error::bad_value("A distinct key value must not be left empty."));
        }
        if request.key.contains('\0') {
            return Err(Error::bad_value(
                "A distinct key value cannot contain any embedded null characters",
            ));
        }
        Ok(request)
    }
}

// ── getMore ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetMoreRequest {
    pub database: String,
    pub collection: String,
    pub cursor_id: i64,
    pub batch_size: Option<i64>,
    pub max_time_ms: Option<i64>,
}

impl GetMoreRequest {
    pub fn parse(spec: &Document, database: Option<&str>) -> Result<GetMoreRequest> {
        let mut request = GetMoreRequest::default();
        let mut db = None;
        for (key, value) in spec {
            match key.as_str() {
                "getMore" => match value {
                    Bson::Int64(id) => request.cursor_id = *id,
                    other => return Err(wrong_type("getMore", other, "long")),
                },
                "batchSize" => request.batch_size = Some(batch_size("batchSize", value)?),
                "collection" => request.collection = expect_str("collection", value)?.to_string(),
                "maxTimeMS" => request.max_time_ms = Some(number_like("getMore.maxTimeMS", value)?),
                "$db" => db = Some(read_db(value)?),
                other if is_ignored_field(other) => {}
                other => {
                    return Err(Error::bad_value(format!(
                        "{other} is an unrecognized field name"
                    )));
                }
            }
        }

        if request.collection.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                "Collection name must not be left empty.",
            ));
        }
        request.database = database
            .map(str::to_string)
            .or(db)
            .ok_or_else(|| Error::failed_to_parse("Required element \"$db\" missing."))?;
        if request.cursor_id == 0 {
            return Err(Error::failed_to_parse("Required element \"getMore\" missing."));
        }
        Ok(request)
    }

    /// `db.collection`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}
