//! Hashed shard keys: document routing, query-to-shard filter extraction
//! and the (re/un)shard collection commands.

mod command;
mod key;
mod router;

pub use command::{
    CollectionShardState, Namespace, ShardCollectionRequest, ShardDecision, ShardLayout,
    ShardingConfig, ShardingMode, plan_sharding,
};
pub use key::ShardKey;
pub use router::{
    MAX_IN_EXPANSION, ShardKeyExtraction, ShardKeyFilter, compute_shard_key_hash,
    extract_shard_key_filter, is_collation_aware, shard_key_hash_for_query,
};
