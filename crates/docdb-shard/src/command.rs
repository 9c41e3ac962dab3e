use bson::{Bson, Document};
use docdb_query::{Error, ErrorCode, Result};
use serde::Deserialize;
use tracing::info;

use crate::key::ShardKey;

/// Command fields every command tolerates and ignores.
const IGNORED_FIELDS: &[&str] = &[
    "$clusterTime",
    "$db",
    "$readPreference",
    "apiDeprecationErrors",
    "apiStrict",
    "apiVersion",
    "comment",
    "lsid",
    "maxTimeMS",
    "txnNumber",
    "writeConcern",
];

fn is_ignored_field(name: &str) -> bool {
    IGNORED_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Upper bound accepted for `numInitialChunks`.
    pub max_chunks: i32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        ShardingConfig { max_chunks: 8192 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    /// Split a fully qualified `<db>.<collection>` name.
    pub fn parse(name: &str) -> Result<Namespace> {
        let (database, collection) = name
            .split_once('.')
            .filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
            .ok_or_else(|| {
                Error::bad_value("name needs to be fully qualified <db>.<collection>")
            })?;
        if database.contains(['/', '\\', ' ', '"', '$']) {
            return Err(Error::new(
                ErrorCode::InvalidNamespace,
                format!("Invalid database name: {database}"),
            ));
        }
        Ok(Namespace {
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingMode {
    Shard,
    Reshard,
    Unshard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardCollectionRequest {
    pub namespace: Namespace,
    pub mode: ShardingMode,
    /// `None` for unshard.
    pub key: Option<ShardKey>,
    pub num_chunks: Option<i32>,
    pub force_redistribution: bool,
}

impl ShardCollectionRequest {
    /// Parse `{shardCollection: "db.coll", key: {...}, ...}`.
    pub fn parse_shard(command: &Document, config: &ShardingConfig) -> Result<Self> {
        Self::parse(command, ShardingMode::Shard, config)
    }

    /// Parse `{reshardCollection: "db.coll", key: {...}, forceRedistribution}`.
    pub fn parse_reshard(command: &Document, config: &ShardingConfig) -> Result<Self> {
        Self::parse(command, ShardingMode::Reshard, config)
    }

    /// Parse `{unshardCollection: "db.coll"}`.
    pub fn parse_unshard(command: &Document, config: &ShardingConfig) -> Result<Self> {
        Self::parse(command, ShardingMode::Unshard, config)
    }

    fn parse(command: &Document, mode: ShardingMode, config: &ShardingConfig) -> Result<Self> {
        let command_name = match mode {
            ShardingMode::Shard => "shardCollection",
            ShardingMode::Reshard => "reshardCollection",
            ShardingMode::Unshard => "unshardCollection",
        };
        let mut namespace = None;
        let mut key_doc = None;
        let mut num_chunks = None;
        let mut force_redistribution = false;

        for (field, value) in command {
            match field.as_str() {
                f if f == command_name => {
                    let Bson::String(name) = value else {
                        return Err(type_error(command_name, "string", value));
                    };
                    namespace = Some(Namespace::parse(name)?);
                }
                "key" if mode != ShardingMode::Unshard => {
                    let Bson::Document(doc) = value else {
                        return Err(type_error("key", "object", value));
                    };
                    key_doc = Some(doc.clone());
                }
                "unique" if mode != ShardingMode::Unshard => {
                    if as_bool(field, value)? {
                        return Err(Error::bad_value(
                            "hashed shard keys cannot be declared unique.",
                        ));
                    }
                }
                "numInitialChunks" if mode != ShardingMode::Unshard => {
                    let n = as_i32(field, value)?;
                    if n <= 0 {
                        return Err(Error::bad_value(
                            "numInitialChunks must be a positive number",
                        ));
                    }
                    if n > config.max_chunks {
                        return Err(Error::failed_to_parse(format!(
                            "numInitialChunks must be less than {}.",
                            config.max_chunks
                        )));
                    }
                    num_chunks = Some(n);
                }
                "collation" if mode != ShardingMode::Unshard => {
                    return Err(Error::feature_not_supported(
                        "Collation for sharded collections is currently unsupported",
                    ));
                }
                "timeseries" if mode == ShardingMode::Shard => {
                    return Err(Error::feature_not_supported(
                        "timeseries on shard collection is not supported yet",
                    ));
                }
                "presplitHashedZones" if mode == ShardingMode::Shard => {}
                "zones" if mode == ShardingMode::Reshard => {}
                "forceRedistribution" if mode == ShardingMode::Reshard => {
                    force_redistribution = as_bool(field, value)?;
                }
                "toShard" if mode == ShardingMode::Unshard => {
                    return Err(Error::not_supported(
                        "unshardCollection with toShard not supported yet",
                    ));
                }
                f if is_ignored_field(f) => {}
                other => {
                    return Err(Error::failed_to_parse(format!("Unrecognized key {other}")));
                }
            }
        }

        let namespace = namespace.ok_or_else(|| {
            Error::failed_to_parse(format!("{command_name} is a required field."))
        })?;
        let key = match mode {
            ShardingMode::Unshard => None,
            _ => {
                let doc = key_doc
                    .ok_or_else(|| Error::failed_to_parse("The key parameter is required."))?;
                Some(ShardKey::parse(&doc)?)
            }
        };

        Ok(ShardCollectionRequest {
            namespace,
            mode,
            key,
            num_chunks,
            force_redistribution,
        })
    }
}

fn type_error(field: &str, expected: &str, value: &Bson) -> Error {
    Error::type_mismatch(format!(
        "BSON field '{field}' is the wrong type '{:?}', expected type '{expected}'",
        value.element_type()
    ))
}

fn as_bool(field: &str, value: &Bson) -> Result<bool> {
    match value {
        Bson::Boolean(b) => Ok(*b),
        Bson::Int32(n) => Ok(*n != 0),
        Bson::Int64(n) => Ok(*n != 0),
        Bson::Double(f) => Ok(*f != 0.0),
        Bson::Null | Bson::Undefined => Ok(false),
        other => Err(type_error(field, "bool", other)),
    }
}

fn as_i32(field: &str, value: &Bson) -> Result<i32> {
    match value {
        Bson::Int32(n) => Ok(*n),
        Bson::Int64(n) => Ok(i32::try_from(*n).unwrap_or(if *n < 0 { i32::MIN } else { i32::MAX })),
        Bson::Double(f) => Ok(f.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32),
        other => Err(type_error(field, "number", other)),
    }
}

/// Physical distribution requested for the new table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLayout {
    /// Default shard count for the cluster.
    Default,
    /// One shard holding every row; keeps joins local.
    SingleShard,
    Chunks(u32),
    /// Colocated with the database's unsharded collections.
    Colocated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShardDecision {
    NoOp,
    Shard {
        key: ShardKey,
        layout: ShardLayout,
        create_collection: bool,
    },
    Reshard {
        key: ShardKey,
        layout: ShardLayout,
    },
    Unshard {
        layout: ShardLayout,
    },
}

/// What the catalog knows about the target collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionShardState {
    Missing,
    Unsharded,
    Sharded(ShardKey),
}

/// Decide what a (re/un)shard request does to a collection in `state`.
pub fn plan_sharding(
    request: &ShardCollectionRequest,
    state: &CollectionShardState,
) -> Result<ShardDecision> {
    let not_sharded = || {
        Error::new(
            ErrorCode::NamespaceNotSharded,
            format!("Collection {} is not sharded", request.namespace),
        )
    };

    let current = match state {
        CollectionShardState::Missing if request.mode != ShardingMode::Shard => {
            return Err(not_sharded());
        }
        CollectionShardState::Unsharded if request.mode != ShardingMode::Shard => {
            return Err(not_sharded());
        }
        CollectionShardState::Sharded(key) => Some(key),
        _ => None,
    };

    if !request.force_redistribution {
        if let (Some(current), Some(requested)) = (current, request.key.as_ref()) {
            if current.definition() == requested.definition() {
                info!(
                    namespace = %request.namespace,
                    "skipping sharding, the same options were passed in"
                );
                return Ok(ShardDecision::NoOp);
            }
        }
    }

    if let (Some(_), ShardingMode::Shard, Some(requested)) =
        (current, request.mode, request.key.as_ref())
    {
        return Err(Error::new(
            ErrorCode::AlreadyInitialized,
            format!(
                "Sharding already enabled for collection {ns} with options {{ \"_id\": \"{ns}\", \"dropped\" : false, \"key\" : {key}, \"unique\": false }}.",
                ns = request.namespace,
                key = requested.definition()
            ),
        ));
    }

    let layout = match (request.mode, request.num_chunks) {
        (ShardingMode::Unshard, _) => ShardLayout::Colocated,
        (_, Some(1)) => ShardLayout::SingleShard,
        (_, Some(n)) => ShardLayout::Chunks(n as u32),
        (_, None) => ShardLayout::Default,
    };

    let decision = match (request.mode, request.key.clone()) {
        (ShardingMode::Shard, Some(key)) => ShardDecision::Shard {
            key,
            layout,
            create_collection: matches!(state, CollectionShardState::Missing),
        },
        (ShardingMode::Reshard, Some(key)) => ShardDecision::Reshard { key, layout },
        (ShardingMode::Unshard, _) => ShardDecision::Unshard { layout },
        (_, None) => return Err(Error::failed_to_parse("The key parameter is required.")),
    };
    info!(namespace = %request.namespace, ?decision, "sharding decision");
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn config() -> ShardingConfig {
        ShardingConfig::default()
    }

    #[test]
    fn parses_shard_collection() {
        let req = ShardCollectionRequest::parse_shard(
            &doc! { "shardCollection": "db.c", "key": { "a": "hashed" }, "numInitialChunks": 4, "$db": "admin" },
            &config(),
        )
        .unwrap();
        assert_eq!(req.namespace.to_string(), "db.c");
        assert_eq!(req.num_chunks, Some(4));
        assert_eq!(req.mode, ShardingMode::Shard);
    }

    #[test]
    fn rejects_invalid_requests() {
        let cfg = config();
        let unique = ShardCollectionRequest::parse_shard(
            &doc! { "shardCollection": "db.c", "key": { "a": "hashed" }, "unique": true },
            &cfg,
        )
        .unwrap_err();
        assert_eq!(unique.message, "hashed shard keys cannot be declared unique.");

        let chunks = ShardCollectionRequest::parse_shard(
            &doc! { "shardCollection": "db.c", "key": { "a": "hashed" }, "numInitialChunks": 9000 },
            &cfg,
        )
        .unwrap_err();
        assert_eq!(chunks.code, ErrorCode::FailedToParse);

        let ns = ShardCollectionRequest::parse_shard(
            &doc! { "shardCollection": "nodot", "key": { "a": "hashed" } },
            &cfg,
        )
        .unwrap_err();
        assert_eq!(ns.code, ErrorCode::BadValue);

        let missing_key =
            ShardCollectionRequest::parse_shard(&doc! { "shardCollection": "db.c" }, &cfg)
                .unwrap_err();
        assert_eq!(missing_key.message, "The key parameter is required.");

        let to_shard = ShardCollectionRequest::parse_unshard(
            &doc! { "unshardCollection": "db.c", "toShard": "s1" },
            &cfg,
        )
        .unwrap_err();
        assert_eq!(to_shard.code, ErrorCode::CommandNotSupported);
    }

    #[test]
    fn decisions_follow_current_state() {
        let cfg = config();
        let shard = ShardCollectionRequest::parse_shard(
            &doc! { "shardCollection": "db.c", "key": { "a": "hashed" } },
            &cfg,
        )
        .unwrap();
        let key = shard.key.clone().unwrap();

        assert!(matches!(
            plan_sharding(&shard, &CollectionShardState::Missing).unwrap(),
            ShardDecision::Shard { create_collection: true, .. }
        ));
        assert_eq!(
            plan_sharding(&shard, &CollectionShardState::Sharded(key.clone())).unwrap(),
            ShardDecision::NoOp
        );

        let other = ShardKey::parse(&doc! { "b": "hashed" }).unwrap();
        let err = plan_sharding(&shard, &CollectionShardState::Sharded(other)).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyInitialized);

        let reshard = ShardCollectionRequest::parse_reshard(
            &doc! { "reshardCollection": "db.c", "key": { "a": "hashed" }, "forceRedistribution": true },
            &cfg,
        )
        .unwrap();
        assert!(matches!(
            plan_sharding(&reshard, &CollectionShardState::Sharded(key)).unwrap(),
            ShardDecision::Reshard { .. }
        ));

        let unshard =
            ShardCollectionRequest::parse_unshard(&doc! { "unshardCollection": "db.c" }, &cfg)
                .unwrap();
        let err = plan_sharding(&unshard, &CollectionShardState::Unsharded).unwrap_err();
        assert_eq!(err.code, ErrorCode::NamespaceNotSharded);
    }
}
