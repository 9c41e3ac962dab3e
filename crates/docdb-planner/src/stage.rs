//! The table of pipeline stages and the rules attached to each.

use bson::{Bson, Document, doc};
use docdb_query::{Error, ErrorCode, Result, parse_filter};

use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::stages;
use crate::tree::QueryTree;

pub type MutateFn = fn(&Bson, &mut QueryTree, &mut PipelineContext<'_>) -> Result<()>;
pub type InlineFn = fn(&Bson, &str, bool) -> bool;
pub type PrecheckFn = fn(&Bson, &EngineConfig) -> Result<()>;

/// Stages allowed after `$changeStream`.
pub const CHANGE_STREAM_STAGES: [&str; 8] = [
    "$match",
    "$project",
    "$addFields",
    "$replaceRoot",
    "$replaceWith",
    "$set",
    "$unset",
    "$redact",
];

pub struct StageDefinition {
    pub name: &'static str,
    /// `None` for stages that are recognized but not planned natively.
    pub mutate: Option<MutateFn>,
    pub requires_persistent_cursor: fn(&Bson) -> bool,
    /// Whether the stage may run on the joined side before a `$lookup`.
    pub can_inline_into_lookup: Option<InlineFn>,
    pub preserves_sort_order: bool,
    pub can_handle_collectionless: bool,
    /// Rewrites only the row's document expression.
    pub is_project_transform: bool,
    pub is_output_stage: bool,
    pub precheck: Option<PrecheckFn>,
    /// The stage may run against a shard table directly.
    pub allow_shard_base_table: bool,
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("native", &self.mutate.is_some())
            .finish()
    }
}

const BASE: StageDefinition = StageDefinition {
    name: "",
    mutate: None,
    requires_persistent_cursor: always,
    can_inline_into_lookup: None,
    preserves_sort_order: false,
    can_handle_collectionless: false,
    is_project_transform: false,
    is_output_stage: false,
    precheck: None,
    allow_shard_base_table: true,
};

/// Sorted by name; looked up by binary search.
static STAGES: [StageDefinition; 40] = [
    StageDefinition {
        name: "$_internalInhibitOptimization",
        mutate: Some(stages::project::handle_inhibit_optimization),
        can_inline_into_lookup: Some(inline_always),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$addFields",
        mutate: Some(stages::project::handle_add_fields),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(can_inline_projection),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$bucket",
        mutate: Some(stages::group::handle_bucket),
        ..BASE
    },
    StageDefinition {
        name: "$bucketAuto",
        ..BASE
    },
    StageDefinition {
        name: "$changeStream",
        mutate: Some(stages::source::handle_change_stream),
        requires_persistent_cursor: never,
        can_handle_collectionless: true,
        precheck: Some(stages::source::precheck_change_stream),
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$collStats",
        mutate: Some(stages::source::handle_coll_stats),
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$count",
        mutate: Some(stages::group::handle_count),
        ..BASE
    },
    StageDefinition {
        name: "$currentOp",
        mutate: Some(stages::source::handle_current_op),
        can_handle_collectionless: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$densify",
        ..BASE
    },
    StageDefinition {
        name: "$documents",
        mutate: Some(stages::source::handle_documents),
        can_handle_collectionless: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$facet",
        mutate: Some(stages::nested::handle_facet),
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$fill",
        mutate: Some(stages::window::handle_fill),
        ..BASE
    },
    StageDefinition {
        name: "$geoNear",
        ..BASE
    },
    StageDefinition {
        name: "$graphLookup",
        preserves_sort_order: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$group",
        mutate: Some(stages::group::handle_group),
        ..BASE
    },
    StageDefinition {
        name: "$indexStats",
        mutate: Some(stages::source::handle_index_stats),
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$inverseMatch",
        mutate: Some(stages::filter::handle_inverse_match),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(inline_always),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$limit",
        mutate: Some(stages::paging::handle_limit),
        requires_persistent_cursor: limit_requires_persistence,
        preserves_sort_order: true,
        ..BASE
    },
    StageDefinition {
        name: "$listLocalSessions",
        can_handle_collectionless: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$listSessions",
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$lookup",
        mutate: Some(stages::nested::handle_lookup),
        can_inline_into_lookup: Some(can_inline_lookup),
        preserves_sort_order: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$match",
        mutate: Some(stages::filter::handle_match),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(can_inline_match),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$merge",
        mutate: Some(stages::source::handle_merge),
        is_output_stage: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$out",
        mutate: Some(stages::source::handle_out),
        is_output_stage: true,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$project",
        mutate: Some(stages::project::handle_project),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(can_inline_projection),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$redact",
        mutate: Some(stages::project::handle_redact),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$replaceRoot",
        mutate: Some(stages::project::handle_replace_root),
        requires_persistent_cursor: never,
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$replaceWith",
        mutate: Some(stages::project::handle_replace_with),
        requires_persistent_cursor: never,
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$sample",
        mutate: Some(stages::paging::handle_sample),
        ..BASE
    },
    StageDefinition {
        name: "$search",
        can_inline_into_lookup: Some(inline_always),
        ..BASE
    },
    StageDefinition {
        name: "$searchMeta",
        ..BASE
    },
    StageDefinition {
        name: "$set",
        mutate: Some(stages::project::handle_add_fields),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(can_inline_projection),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$setWindowFields",
        mutate: Some(stages::window::handle_set_window_fields),
        ..BASE
    },
    StageDefinition {
        name: "$skip",
        mutate: Some(stages::paging::handle_skip),
        requires_persistent_cursor: skip_requires_persistence,
        preserves_sort_order: true,
        ..BASE
    },
    StageDefinition {
        name: "$sort",
        mutate: Some(stages::sort::handle_sort),
        can_inline_into_lookup: Some(inline_always),
        preserves_sort_order: true,
        ..BASE
    },
    StageDefinition {
        name: "$sortByCount",
        mutate: Some(stages::sort::handle_sort_by_count),
        ..BASE
    },
    StageDefinition {
        name: "$unionWith",
        mutate: Some(stages::nested::handle_union_with),
        requires_persistent_cursor: never,
        allow_shard_base_table: false,
        ..BASE
    },
    StageDefinition {
        name: "$unset",
        mutate: Some(stages::project::handle_unset),
        requires_persistent_cursor: never,
        can_inline_into_lookup: Some(can_inline_unset),
        preserves_sort_order: true,
        is_project_transform: true,
        ..BASE
    },
    StageDefinition {
        name: "$unwind",
        mutate: Some(stages::unwind::handle_unwind),
        can_inline_into_lookup: Some(can_inline_unwind),
        preserves_sort_order: true,
        ..BASE
    },
    StageDefinition {
        name: "$vectorSearch",
        allow_shard_base_table: false,
        ..BASE
    },
];

/// `$lookup` directly followed by an `$unwind` of its `as` field.
pub static LOOKUP_UNWIND: StageDefinition = StageDefinition {
    name: "$lookupUnwind",
    mutate: Some(stages::nested::handle_lookup_unwind),
    can_inline_into_lookup: Some(can_inline_lookup),
    preserves_sort_order: true,
    allow_shard_base_table: false,
    ..BASE
};

pub fn stage_definitions() -> &'static [StageDefinition] {
    &STAGES
}

pub fn find_stage(name: &str) -> Option<&'static StageDefinition> {
    STAGES
        .binary_search_by(|d| d.name.cmp(name))
        .ok()
        .map(|i| &STAGES[i])
}

/// A parsed pipeline entry.
#[derive(Debug, Clone)]
pub struct Stage {
    pub definition: &'static StageDefinition,
    pub value: Bson,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        self.definition.name
    }

    /// Build a stage from a known name; used by command front-ends.
    pub fn of(name: &str, value: Bson) -> Result<Stage> {
        let definition = find_stage(name).ok_or_else(|| {
            Error::new(
                ErrorCode::UnrecognizedCommand,
                format!("Pipeline stage name not recognized: {name}"),
            )
        })?;
        Ok(Stage { definition, value })
    }
}

/// Parse a `pipeline` array into stages, validating shape and placement.
pub fn extract_stages(pipeline: &[Bson], config: &EngineConfig) -> Result<Vec<Stage>> {
    let mut stages = Vec::with_capacity(pipeline.len());
    for (index, item) in pipeline.iter().enumerate() {
        let Bson::Document(spec) = item else {
            return Err(Error::type_mismatch(
                "Every item within the 'pipeline' array is required to be an object.",
            ));
        };
        let mut fields = spec.iter();
        let (name, value) = match (fields.next(), fields.next()) {
            (Some(field), None) => field,
            _ => {
                return Err(Error::location(
                    40323,
                    "A pipeline stage specification object is required to have one and only one field.",
                ));
            }
        };
        let definition = find_stage(name).ok_or_else(|| {
            Error::new(
                ErrorCode::UnrecognizedCommand,
                format!("Pipeline stage name not recognized: {name}"),
            )
        })?;
        if definition.is_output_stage && index + 1 != pipeline.len() {
            return Err(Error::location(
                40601,
                format!("{name} must appear exclusively as the last stage in the pipeline"),
            ));
        }
        if let Some(precheck) = definition.precheck {
            precheck(value, config)?;
        }
        if definition.mutate.is_none() {
            return Err(Error::not_supported(format!(
                "Stage {name} is not supported yet in native pipeline"
            )));
        }
        stages.push(Stage {
            definition,
            value: value.clone(),
        });
    }

    if stages.len() > config.max_pipeline_stages {
        return Err(Error::location(
            7749501,
            format!(
                "The pipeline length cannot exceed a maximum of {} stages.",
                config.max_pipeline_stages
            ),
        ));
    }

    if stages.first().is_some_and(|s| s.name() == "$changeStream") {
        if let Some(bad) = stages[1..]
            .iter()
            .find(|s| !CHANGE_STREAM_STAGES.contains(&s.name()))
        {
            return Err(Error::new(
                ErrorCode::IllegalOperation,
                format!(
                    "Stage {} is not permitted in a $changeStream pipeline",
                    bad.name()
                ),
            ));
        }
    }
    Ok(stages)
}

/// Fuse `$lookup` + `$unwind` pairs and report whether every stage may run
/// against shard tables directly.
pub fn optimize_stages(stages: Vec<Stage>) -> (Vec<Stage>, bool) {
    let mut allow_shard_base_table = true;
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    let mut iter = stages.into_iter().peekable();
    while let Some(stage) = iter.next() {
        allow_shard_base_table &= stage.definition.allow_shard_base_table;
        if stage.name() == "$lookup" {
            if let Some(next) = iter.peek() {
                if next.name() == "$unwind" {
                    if let Some(preserve) = lookup_unwind_fusion(&stage.value, &next.value) {
                        iter.next();
                        out.push(Stage {
                            definition: &LOOKUP_UNWIND,
                            value: Bson::Document(doc! {
                                "preserveNullAndEmptyArrays": preserve,
                                "lookup": stage.value,
                            }),
                        });
                        continue;
                    }
                }
            }
        }
        out.push(stage);
    }
    (out, allow_shard_base_table)
}

/// `Some(preserveNullAndEmptyArrays)` when the `$unwind` only flattens the
/// `$lookup` output field.
fn lookup_unwind_fusion(lookup: &Bson, unwind: &Bson) -> Option<bool> {
    let Bson::Document(lookup) = lookup else {
        return None;
    };
    let as_path = lookup.get_str("as").ok()?;
    let (path, preserve) = match unwind {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(spec) => {
            if spec.contains_key("includeArrayIndex") {
                return None;
            }
            let preserve = match spec.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Bson::Boolean(b)) => *b,
                Some(_) => return None,
            };
            (spec.get_str("path").ok()?, preserve)
        }
        _ => return None,
    };
    (path.strip_prefix('$') == Some(as_path)).then_some(preserve)
}

// ── Cursor persistence ─────────────────────────────────────────

fn always(_: &Bson) -> bool {
    true
}

fn never(_: &Bson) -> bool {
    false
}

fn limit_requires_persistence(value: &Bson) -> bool {
    match as_number(value) {
        Some(n) => n != 0.0 && n != 1.0,
        None => true,
    }
}

fn skip_requires_persistence(value: &Bson) -> bool {
    match as_number(value) {
        Some(n) => n != 0.0,
        None => true,
    }
}

pub(crate) fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        Bson::Decimal128(d) => d.to_string().parse().ok(),
        _ => None,
    }
}

// ── Lookup inlining ────────────────────────────────────────────

fn inline_always(_: &Bson, _: &str, _: bool) -> bool {
    true
}

/// Without `let` a filter never sees the outer row; with it only `$expr`
/// can.
fn can_inline_match(value: &Bson, _path: &str, has_let: bool) -> bool {
    if !has_let {
        return true;
    }
    let Bson::Document(filter) = value else {
        return false;
    };
    match parse_filter(filter) {
        Ok(expr) => !expr.contains_expr(),
        Err(_) => false,
    }
}

fn can_inline_projection(value: &Bson, path: &str, has_let: bool) -> bool {
    let Bson::Document(spec) = value else {
        return false;
    };
    if has_let {
        return false;
    }
    spec.keys()
        .all(|key| !key.starts_with(path) && !path.starts_with(key.as_str()))
}

fn can_inline_unset(value: &Bson, path: &str, _has_let: bool) -> bool {
    match value {
        Bson::String(field) => !field.starts_with(path),
        Bson::Array(fields) => fields.iter().all(|f| match f {
            Bson::String(field) => !field.starts_with(path),
            _ => false,
        }),
        _ => false,
    }
}

fn can_inline_unwind(value: &Bson, path: &str, _has_let: bool) -> bool {
    let unwind_path = match value {
        Bson::String(p) => p.as_str(),
        Bson::Document(spec) => match spec.get_str("path") {
            Ok(p) => p,
            Err(_) => return false,
        },
        _ => return false,
    };
    let field = unwind_path.strip_prefix('$').unwrap_or(unwind_path);
    !field.starts_with(path)
}

/// A nested `$lookup` moves with the joined side when neither its join
/// field nor its output field touch `path`.
fn can_inline_lookup(value: &Bson, path: &str, has_let: bool) -> bool {
    let spec = match value {
        Bson::Document(spec) => match spec.get_document("lookup") {
            Ok(inner) => inner,
            Err(_) => spec,
        },
        _ => return false,
    };
    if has_let {
        return false;
    }
    let touches = |field: &str| field.starts_with(path) || path.starts_with(field);
    match (spec.get_str("localField"), spec.get_str("as")) {
        (Ok(local), Ok(as_field)) => !touches(local) && !touches(as_field),
        _ => false,
    }
}

/// Whether `stage` can be evaluated on the joined collection before a
/// `$lookup` whose join path is `path`.
pub fn can_inline_into_lookup(stage: &Document, path: &str, has_let: bool) -> bool {
    let mut fields = stage.iter();
    let (Some((name, value)), None) = (fields.next(), fields.next()) else {
        return false;
    };
    find_stage(name)
        .and_then(|d| d.can_inline_into_lookup)
        .is_some_and(|inline| inline(value, path, has_let))
}

/// Split a `$lookup` sub-pipeline into the leading stages that can be
/// pulled into the joined relation and the rest.
pub fn split_inlinable(pipeline: &[Bson], path: &str, has_let: bool) -> (Vec<Bson>, Vec<Bson>) {
    let mut inlined = Vec::new();
    let mut rest = Vec::new();
    for item in pipeline {
        let can = rest.is_empty()
            && matches!(item, Bson::Document(stage) if can_inline_into_lookup(stage, path, has_let));
        if can {
            inlined.push(item.clone());
        } else {
            rest.push(item.clone());
        }
    }
    (inlined, rest)
}
