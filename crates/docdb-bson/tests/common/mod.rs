#![allow(dead_code)]

use bson::{Bson, Document};
use rand::Rng;
use rand::rngs::StdRng;

/// A random scalar drawn from a small domain so that ties are common.
pub fn random_scalar(rng: &mut StdRng) -> Bson {
    match rng.gen_range(0..9) {
        0 => Bson::Int32(rng.gen_range(-5..5)),
        1 => Bson::Int64(rng.gen_range(-5..5)),
        2 => Bson::Double(f64::from(rng.gen_range(-10..10)) / 2.0),
        3 => Bson::String(random_string(rng)),
        4 => Bson::Boolean(rng.gen_bool(0.5)),
        5 => Bson::Null,
        6 => Bson::DateTime(bson::DateTime::from_millis(rng.gen_range(-1000..1000))),
        7 => Bson::MinKey,
        _ => Bson::MaxKey,
    }
}

pub fn random_string(rng: &mut StdRng) -> String {
    let len = rng.gen_range(0..4);
    (0..len)
        .map(|_| ['a', 'b', '\0', 'é'][rng.gen_range(0..4)])
        .collect()
}

/// A random value, nesting documents and arrays up to `depth`.
pub fn random_value(rng: &mut StdRng, depth: u32) -> Bson {
    if depth == 0 || rng.gen_bool(0.6) {
        return random_scalar(rng);
    }
    if rng.gen_bool(0.5) {
        let len = rng.gen_range(0..3);
        Bson::Array((0..len).map(|_| random_value(rng, depth - 1)).collect())
    } else {
        let mut doc = Document::new();
        for _ in 0..rng.gen_range(0..3) {
            doc.insert(random_string(rng), random_value(rng, depth - 1));
        }
        Bson::Document(doc)
    }
}
