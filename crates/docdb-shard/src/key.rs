use bson::{Bson, Document};
use docdb_query::{Error, Result};

/// A hashed shard key: the ordered list of dotted paths whose values are
/// folded into `shard_key_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardKey {
    definition: Document,
    fields: Vec<String>,
}

impl ShardKey {
    /// Parse `{a: "hashed", "b.c": "hashed"}`. Only hashed keys are accepted.
    pub fn parse(definition: &Document) -> Result<ShardKey> {
        let mut fields = Vec::with_capacity(definition.len());
        for (path, kind) in definition {
            match kind {
                Bson::String(s) if s == "hashed" => {}
                Bson::String(s) => {
                    return Err(Error::bad_value(format!(
                        "Shard key value provided is invalid: {s}"
                    )));
                }
                _ => {
                    return Err(Error::bad_value(
                        "only shard keys that use hashed are supported",
                    ));
                }
            }
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(Error::new(
                    docdb_query::ErrorCode::InvalidShardKey,
                    format!("Invalid shard key path: '{path}'"),
                ));
            }
            fields.push(path.clone());
        }
        Ok(ShardKey {
            definition: definition.clone(),
            fields,
        })
    }

    /// The unsharded key: documents route by collection id.
    pub fn none() -> ShardKey {
        ShardKey {
            definition: Document::new(),
            fields: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_index(&self, path: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == path)
    }

    pub fn definition(&self) -> &Document {
        &self.definition
    }
}
