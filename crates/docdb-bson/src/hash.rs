use bson::Bson;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::key::encode_value;

/// Stable 64-bit hash of a value under `seed`.
///
/// Hashes the order-preserving encoding, so numerically equal values hash
/// alike whatever their numeric tag.
pub fn hash_value(value: &Bson, seed: i64) -> i64 {
    let mut buf = Vec::with_capacity(32);
    encode_value(value, &mut buf);
    xxh3_64_with_seed(&buf, seed as u64) as i64
}

/// Fold a sequence of values left to right, each hash seeding the next.
/// The fold starts from zero.
pub fn hash_values<'a>(values: impl IntoIterator<Item = &'a Bson>) -> i64 {
    values
        .into_iter()
        .fold(0i64, |seed, value| hash_value(value, seed))
}

#[cfg(test)]
mod tests {
    use bson::{Bson, doc};

    use super::*;

    #[test]
    fn numeric_tags_hash_alike() {
        let h = hash_value(&Bson::Int32(1), 0);
        assert_eq!(h, hash_value(&Bson::Int64(1), 0));
        assert_eq!(h, hash_value(&Bson::Double(1.0), 0));
        assert_ne!(h, hash_value(&Bson::Double(1.5), 0));
    }

    #[test]
    fn seed_changes_hash() {
        let v = Bson::String("abc".into());
        assert_ne!(hash_value(&v, 0), hash_value(&v, 1));
        assert_eq!(hash_value(&v, 7), hash_value(&v, 7));
    }

    #[test]
    fn fold_seeds_with_previous_hash() {
        let a = Bson::Int32(1);
        let b = Bson::Document(doc! { "x": 5 });
        let folded = hash_values([&a, &b]);
        assert_eq!(folded, hash_value(&b, hash_value(&a, 0)));
    }
}
