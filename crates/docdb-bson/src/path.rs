use bson::{Bson, Document};

/// Resolve a dotted path through nested documents.
///
/// Numeric segments index into arrays. Arrays are not otherwise expanded;
/// use [`collect_path_values`] for multikey semantics.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if path.is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for seg in segments {
        current = step(current, seg)?;
    }
    Some(current)
}

fn step<'a>(value: &'a Bson, seg: &str) -> Option<&'a Bson> {
    match value {
        Bson::Document(d) => d.get(seg),
        Bson::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Collect every value reachable at `path`, expanding arrays met along the
/// way. A terminal array contributes itself and each of its elements.
pub fn collect_path_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut out = Vec::new();
    for value in collect_terminal_values(doc, path) {
        out.push(value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

/// Like [`collect_path_values`] but terminal arrays are returned whole.
pub fn collect_terminal_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*first) {
            collect_from_value(value, rest, &mut out);
        }
    }
    out
}

fn collect_from_value<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(d) => {
            if let Some(next) = d.get(*seg) {
                collect_from_value(next, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Some(item) = seg.parse::<usize>().ok().and_then(|i| items.get(i)) {
                collect_from_value(item, rest, out);
            }
            for item in items {
                if let Bson::Document(d) = item {
                    if let Some(next) = d.get(*seg) {
                        collect_from_value(next, rest, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// `true` when `path` equals `prefix` or lies beneath it.
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.')
}
