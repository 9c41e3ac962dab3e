#![allow(dead_code)]

use bson::{Bson, Document, doc};
use docdb_shard::ShardKey;
use rand::Rng;
use rand::rngs::StdRng;

pub fn hashed_key(fields: &[&str]) -> ShardKey {
    let mut def = Document::new();
    for f in fields {
        def.insert(*f, "hashed");
    }
    ShardKey::parse(&def).expect("valid shard key")
}

/// Small value domain so that random filters frequently match.
pub fn random_key_value(rng: &mut StdRng) -> Bson {
    match rng.gen_range(0..5) {
        0 => Bson::Int32(rng.gen_range(0..3)),
        1 => Bson::Int64(rng.gen_range(0..3)),
        2 => Bson::Double(f64::from(rng.gen_range(0..3))),
        3 => Bson::String(["x", "y"][rng.gen_range(0..2)].to_string()),
        _ => Bson::Null,
    }
}

/// A document with optional `a`, `b` and nested `c.d` fields.
pub fn random_document(rng: &mut StdRng) -> Document {
    let mut doc = doc! { "_id": rng.gen_range(0..1000) };
    if rng.gen_bool(0.9) {
        doc.insert("a", random_key_value(rng));
    }
    if rng.gen_bool(0.9) {
        doc.insert("b", random_key_value(rng));
    }
    if rng.gen_bool(0.5) {
        doc.insert("c", doc! { "d": random_key_value(rng) });
    }
    doc
}

/// A filter built from equality, `$in`, `$and` and `$or` over the key paths.
pub fn random_filter(rng: &mut StdRng, depth: u32) -> Document {
    let mut filter = Document::new();
    for path in ["a", "b", "c.d"] {
        match rng.gen_range(0..5) {
            0 => {
                filter.insert(path, random_key_value(rng));
            }
            1 => {
                filter.insert(path, doc! { "$eq": random_key_value(rng) });
            }
            2 => {
                let n = rng.gen_range(1..4);
                let values: Vec<Bson> = (0..n).map(|_| random_key_value(rng)).collect();
                filter.insert(path, doc! { "$in": values });
            }
            3 => {
                filter.insert(path, doc! { "$gt": random_key_value(rng) });
            }
            _ => {}
        }
    }
    if depth > 0 && rng.gen_bool(0.4) {
        let arms: Vec<Bson> = (0..rng.gen_range(1..3))
            .map(|_| Bson::Document(random_filter(rng, depth - 1)))
            .collect();
        let op = if rng.gen_bool(0.5) { "$or" } else { "$and" };
        filter.insert(op, arms);
    }
    filter
}
