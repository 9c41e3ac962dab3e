use bson::{Bson, Document};
use docdb_bson::hash_value;
use docdb_query::{Error, ErrorCode, Result};
use tracing::debug;

use crate::key::ShardKey;

/// Compute `shard_key_value` for a document.
///
/// Unsharded collections (empty key) route by `collection_id`. Otherwise
/// each key path is resolved in declaration order, missing paths count as
/// `null`, and the hashes are folded with the previous hash as seed.
pub fn compute_shard_key_hash(key: &ShardKey, collection_id: u64, doc: &Document) -> Result<i64> {
    if key.is_empty() {
        return Ok(collection_id as i64);
    }
    let mut hash = 0i64;
    for path in key.fields() {
        let value = find_shard_key_value(doc, path)?;
        hash = hash_value(&value, hash);
    }
    Ok(hash)
}

fn find_shard_key_value(doc: &Document, path: &str) -> Result<Bson> {
    let (field, rest) = match path.split_once('.') {
        Some((field, rest)) => (field, Some(rest)),
        None => (path, None),
    };
    let Some(value) = doc.get(field) else {
        return Ok(Bson::Null);
    };
    match (rest, value) {
        (None, Bson::Array(_)) => Err(invalid_key(
            "A shard key is not permitted to include any array elements.",
        )),
        (None, Bson::RegularExpression(_)) => Err(invalid_key(
            "A shard key is not allowed to include any regular expression pattern.",
        )),
        (None, Bson::Undefined) => Err(invalid_key("Shard key cannot be undefined.")),
        (None, v) => Ok(v.clone()),
        (Some(_), Bson::Array(_)) => Err(invalid_key(
            "Shard key is not allowed to include array values or any array-derived elements.",
        )),
        (Some(rest), Bson::Document(child)) => find_shard_key_value(child, rest),
        (Some(_), _) => Ok(Bson::Null),
    }
}

fn invalid_key(message: &str) -> Error {
    Error::new(ErrorCode::InvalidShardKey, message)
}

/// Predicate over the `shard_key_value` column of the relation at `varno`.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardKeyFilter {
    Equals { varno: u32, value: i64 },
    Or(Vec<ShardKeyFilter>),
    And(Vec<ShardKeyFilter>),
}

impl ShardKeyFilter {
    /// The hash when the filter pins exactly one shard key value.
    pub fn single_value(&self) -> Option<i64> {
        match self {
            ShardKeyFilter::Equals { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Every hash the filter admits, when it is a disjunction of equalities.
    pub fn values(&self) -> Option<Vec<i64>> {
        match self {
            ShardKeyFilter::Equals { value, .. } => Some(vec![*value]),
            ShardKeyFilter::Or(arms) => {
                let mut out = Vec::with_capacity(arms.len());
                for arm in arms {
                    out.extend(arm.values()?);
                }
                Some(out)
            }
            ShardKeyFilter::And(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardKeyExtraction {
    pub filter: ShardKeyFilter,
    /// Some bound value compares differently under a collation.
    pub collation_aware: bool,
}

/// Derive a `shard_key_value` predicate from a query filter, if the filter
/// pins every shard key path.
///
/// Bindings are tried in order: required equalities (top level and under
/// `$and`), then the cartesian product of `$in` lists, then top-level `$or`
/// clauses whose every arm completes the key.
pub fn extract_shard_key_filter(
    key: &ShardKey,
    collection_id: u64,
    query: &Document,
    varno: u32,
) -> Result<Option<ShardKeyExtraction>> {
    if key.is_empty() {
        return Ok(Some(ShardKeyExtraction {
            filter: ShardKeyFilter::Equals {
                varno,
                value: collection_id as i64,
            },
            collation_aware: false,
        }));
    }

    let mut bindings = Bindings::new(key.fields().len(), true);
    bindings.collect(key, query)?;
    let mut collation_aware = false;

    if let Some(value) = hash_assignment(&bindings.required, &mut collation_aware) {
        return Ok(Some(finish(
            ShardKeyFilter::Equals { varno, value },
            collation_aware,
        )));
    }

    if let Some(filter) = in_clause_filter(&bindings, varno, &mut collation_aware) {
        return Ok(Some(finish(filter, collation_aware)));
    }

    let filter = or_clause_filter(key, &bindings, varno, &mut collation_aware)?;
    Ok(filter.map(|f| finish(f, collation_aware)))
}

/// The single shard key hash implied by required equalities, if complete.
pub fn shard_key_hash_for_query(
    key: &ShardKey,
    collection_id: u64,
    query: &Document,
) -> Result<Option<(i64, bool)>> {
    if key.is_empty() {
        return Ok(Some((collection_id as i64, false)));
    }
    let mut bindings = Bindings::new(key.fields().len(), false);
    bindings.collect(key, query)?;
    let mut collation_aware = false;
    Ok(hash_assignment(&bindings.required, &mut collation_aware).map(|h| (h, collation_aware)))
}

fn finish(filter: ShardKeyFilter, collation_aware: bool) -> ShardKeyExtraction {
    if collation_aware {
        debug!(?filter, "shard key filter binds collation-sensitive values");
    }
    ShardKeyExtraction {
        filter,
        collation_aware,
    }
}

struct Bindings {
    required: Vec<Option<Bson>>,
    in_lists: Vec<Option<Bson>>,
    in_counts: Vec<usize>,
    or_clauses: Vec<Bson>,
    collect_alternatives: bool,
}

impl Bindings {
    fn new(fields: usize, collect_alternatives: bool) -> Self {
        Bindings {
            required: vec![None; fields],
            in_lists: vec![None; fields],
            in_counts: vec![0; fields],
            or_clauses: Vec::new(),
            collect_alternatives,
        }
    }

    fn collect(&mut self, key: &ShardKey, query: &Document) -> Result<()> {
        for (field, value) in query {
            if field == "$and" {
                let Bson::Array(items) = value else {
                    return Err(Error::bad_value(
                        "Could not iterate through query document $and.",
                    ));
                };
                for item in items {
                    let Bson::Document(inner) = item else {
                        return Err(Error::bad_value(
                            "Could not iterate through elements within $and query.",
                        ));
                    };
                    self.collect(key, inner)?;
                }
            } else if field == "$or" && self.collect_alternatives {
                self.or_clauses.push(value.clone());
            } else if field.starts_with('$') {
                continue;
            } else if let Some(index) = key.field_index(field) {
                self.bind_field(index, value);
            }
        }
        Ok(())
    }

    fn bind_field(&mut self, index: usize, value: &Bson) {
        if let Bson::Document(ops) = value {
            if ops.keys().next().is_some_and(|k| k.starts_with('$')) {
                for (op, operand) in ops {
                    if op == "$eq" {
                        self.required[index] = Some(operand.clone());
                    } else if op == "$in" && self.collect_alternatives {
                        self.in_lists[index] = Some(operand.clone());
                        self.in_counts[index] += 1;
                    }
                }
                return;
            }
        }
        self.required[index] = Some(value.clone());
    }
}

/// Most shard-key combinations an `$in` query is expanded into; larger
/// products go unrouted.
pub const MAX_IN_EXPANSION: usize = 4096;

/// Hash a complete assignment. `None` when a path is unbound or bound to a
/// regex, which matches more than its own value.
fn hash_assignment(values: &[Option<Bson>], collation_aware: &mut bool) -> Option<i64> {
    let mut hash = 0i64;
    let mut aware = false;
    for value in values {
        let value = value.as_ref()?;
        if matches!(value, Bson::RegularExpression(_)) {
            return None;
        }
        aware |= is_collation_aware(value);
        hash = hash_value(value, hash);
    }
    *collation_aware |= aware;
    Some(hash)
}

/// Values whose equality depends on the collation in effect.
pub fn is_collation_aware(value: &Bson) -> bool {
    matches!(
        value,
        Bson::String(_) | Bson::Symbol(_) | Bson::Document(_) | Bson::Array(_)
    )
}

fn in_clause_filter(bindings: &Bindings, varno: u32, collation_aware: &mut bool) -> Option<ShardKeyFilter> {
    let mut alternatives: Vec<Vec<Bson>> = Vec::with_capacity(bindings.required.len());
    for i in 0..bindings.required.len() {
        if let Some(required) = &bindings.required[i] {
            alternatives.push(vec![required.clone()]);
            continue;
        }
        if bindings.in_counts[i] > 1 {
            return None;
        }
        match &bindings.in_lists[i] {
            Some(Bson::Array(items)) if !items.is_empty() => alternatives.push(items.clone()),
            _ => return None,
        }
    }

    let total = alternatives
        .iter()
        .try_fold(1usize, |acc, options| acc.checked_mul(options.len()))
        .filter(|total| *total <= MAX_IN_EXPANSION);
    let Some(total) = total else {
        debug!("$in expansion over the shard key is too large to route");
        return None;
    };
    let mut arms = Vec::with_capacity(total);
    let mut assignment = vec![None; alternatives.len()];
    for combo in 0..total {
        let mut rest = combo;
        for (slot, options) in assignment.iter_mut().zip(&alternatives) {
            *slot = Some(options[rest % options.len()].clone());
            rest /= options.len();
        }
        // a combination that cannot be hashed matches documents on any
        // shard, so the whole $in expansion is unusable
        let value = hash_assignment(&assignment, collation_aware)?;
        arms.push(ShardKeyFilter::Equals { varno, value });
    }

    match arms.len() {
        0 => None,
        1 => arms.pop(),
        _ => Some(ShardKeyFilter::Or(arms)),
    }
}

fn or_clause_filter(
    key: &ShardKey,
    bindings: &Bindings,
    varno: u32,
    collation_aware: &mut bool,
) -> Result<Option<ShardKeyFilter>> {
    let mut clauses = Vec::new();
    for clause in &bindings.or_clauses {
        let Bson::Array(arms) = clause else {
            return Err(Error::bad_value(
                "Could not iterate through elements within $or query.",
            ));
        };
        let mut filters = Vec::with_capacity(arms.len());
        for arm in arms {
            let Bson::Document(arm) = arm else {
                return Err(Error::bad_value(
                    "Could not iterate through elements within $or query.",
                ));
            };
            let mut arm_bindings = Bindings::new(key.fields().len(), false);
            arm_bindings.required = bindings.required.clone();
            arm_bindings.collect(key, arm)?;
            match hash_assignment(&arm_bindings.required, collation_aware) {
                Some(value) => filters.push(ShardKeyFilter::Equals { varno, value }),
                None => {
                    filters.clear();
                    break;
                }
            }
        }
        if !filters.is_empty() {
            clauses.push(ShardKeyFilter::Or(filters));
        }
    }

    Ok(match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(ShardKeyFilter::And(clauses)),
    })
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use docdb_bson::hash_values;

    use super::*;

    fn key(def: Document) -> ShardKey {
        ShardKey::parse(&def).unwrap()
    }

    #[test]
    fn unsharded_routes_by_collection_id() {
        let h = compute_shard_key_hash(&ShardKey::none(), 42, &doc! { "a": 1 }).unwrap();
        assert_eq!(h, 42);
    }

    #[test]
    fn missing_paths_hash_as_null() {
        let k = key(doc! { "a.b": "hashed" });
        let missing = compute_shard_key_hash(&k, 1, &doc! { "c": 1 }).unwrap();
        let null = compute_shard_key_hash(&k, 1, &doc! { "a": { "b": null } }).unwrap();
        let scalar_parent = compute_shard_key_hash(&k, 1, &doc! { "a": 5 }).unwrap();
        assert_eq!(missing, null);
        assert_eq!(missing, scalar_parent);
        assert_eq!(missing, hash_values([&Bson::Null]));
    }

    #[test]
    fn forbidden_values_fail() {
        let k = key(doc! { "a.b": "hashed" });
        for bad in [
            doc! { "a": [{ "b": 1 }] },
            doc! { "a": { "b": [1] } },
            doc! { "a": { "b": Bson::Undefined } },
        ] {
            let err = compute_shard_key_hash(&k, 1, &bad).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidShardKey);
        }
    }

    #[test]
    fn required_equalities_under_and() {
        let k = key(doc! { "a": "hashed", "b": "hashed" });
        let q = doc! { "$and": [{ "a": { "$eq": 1 } }, { "b": "x" }] };
        let out = extract_shard_key_filter(&k, 1, &q, 1).unwrap().unwrap();
        let expected = hash_values([&Bson::Int32(1), &Bson::String("x".into())]);
        assert_eq!(out.filter.single_value(), Some(expected));
        assert!(out.collation_aware);
    }

    #[test]
    fn regex_binding_is_not_routable() {
        let k = key(doc! { "a": "hashed" });
        let q = doc! { "a": { "$regex": "^x" } };
        assert!(extract_shard_key_filter(&k, 1, &q, 1).unwrap().is_none());
        let re = docdb_bson::key::regex_value("x", "").unwrap();
        let q = doc! { "a": { "$in": [1, re] } };
        assert!(extract_shard_key_filter(&k, 1, &q, 1).unwrap().is_none());
    }

    #[test]
    fn or_requires_every_arm() {
        let k = key(doc! { "a": "hashed" });
        let q = doc! { "$or": [{ "a": 1 }, { "a": 2 }] };
        let out = extract_shard_key_filter(&k, 1, &q, 1).unwrap().unwrap();
        assert_eq!(out.filter.values().unwrap().len(), 2);

        let q = doc! { "$or": [{ "a": 1 }, { "b": 2 }] };
        assert!(extract_shard_key_filter(&k, 1, &q, 1).unwrap().is_none());
    }

    #[test]
    fn duplicate_in_on_one_path_bails() {
        let k = key(doc! { "a": "hashed" });
        let q = doc! { "$and": [{ "a": { "$in": [1, 2] } }, { "a": { "$in": [2, 3] } }] };
        assert!(extract_shard_key_filter(&k, 1, &q, 1).unwrap().is_none());
    }

    #[test]
    fn malformed_and_is_rejected() {
        let k = key(doc! { "a": "hashed" });
        let err = extract_shard_key_filter(&k, 1, &doc! { "$and": 1 }, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadValue);
    }
}
