//! How the rows of a plan are handed back to the client.

use std::fmt;

use docdb_query::{Error, ErrorCode, Result};
use tracing::debug;

use crate::context::PipelineContext;
use crate::tree::{Expr, QueryTree, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Resumed from a continuation token carried by each row.
    Streamable,
    /// Materialized server side and drained across `getMore`s.
    Persistent,
    /// Everything is returned in the first batch.
    SingleBatch,
    /// Stays open past the end of the data (`$changeStream`).
    Tailable,
    /// A single `_id` lookup on one shard.
    PointRead,
}

impl CursorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CursorKind::Streamable => "streamable",
            CursorKind::Persistent => "persistent",
            CursorKind::SingleBatch => "singleBatch",
            CursorKind::Tailable => "tailable",
            CursorKind::PointRead => "pointRead",
        }
    }
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cursor choice for an `aggregate`. `requested` is set when the command
/// itself asked for a single batch.
pub fn classify_aggregate(ctx: &PipelineContext<'_>, requested: Option<CursorKind>) -> CursorKind {
    let kind = if ctx.requires_tailable_cursor {
        CursorKind::Tailable
    } else if ctx.has_output_stage {
        CursorKind::SingleBatch
    } else if let Some(kind) = requested {
        kind
    } else if ctx.requires_persistent_cursor || ctx.is_agnostic {
        CursorKind::Persistent
    } else {
        CursorKind::Streamable
    };
    debug!(
        cursor = %kind,
        persistent = ctx.requires_persistent_cursor,
        agnostic = ctx.is_agnostic,
        "classified aggregate cursor"
    );
    kind
}

/// Cursor choice for a `find`.
pub fn classify_find(
    ctx: &PipelineContext<'_>,
    tree: &QueryTree,
    requested: Option<CursorKind>,
    batch_size: Option<i64>,
) -> CursorKind {
    let mut kind = requested.unwrap_or(if ctx.requires_persistent_cursor {
        CursorKind::Persistent
    } else {
        CursorKind::Streamable
    });

    // a promoted plan no longer reads the table by _id
    let on_relation = tree.depth() == 0 && ctx.collection.is_some();
    let point_read = ctx.config.use_point_read
        && ctx.point_read_id.is_some()
        && on_relation
        && ctx.allow_shard_base_table
        && batch_size.unwrap_or(ctx.config.batch_size) >= 1;
    if point_read {
        kind = CursorKind::PointRead;
    }
    debug!(cursor = %kind, point_read, "classified find cursor");
    kind
}

/// Attach the plan fragments the chosen cursor needs. Returns the kind
/// actually used, which is `Persistent` when a streamable cursor cannot
/// resume the plan.
pub fn attach_cursor(kind: CursorKind, tree: &mut QueryTree) -> Result<CursorKind> {
    match kind {
        CursorKind::Streamable => {
            let base = tree.base_node();
            if base != tree.root() || !tree.root_node().joins.is_empty() {
                debug!(depth = tree.depth(), "plan is nested, streaming demoted to persistent");
                return Ok(CursorKind::Persistent);
            }
            let node = tree.root_node_mut();
            node.quals.push(Expr::func(
                "cursor_state",
                vec![Expr::Document, Expr::Param("continuation")],
            ));
            node.targets.push(Target::new(
                "continuation",
                Expr::func("current_cursor_state", vec![Expr::Document]),
            ));
            Ok(kind)
        }
        CursorKind::Tailable => {
            let node = tree.root_node_mut();
            if node.targets.last().map(|t| t.name.as_str()) != Some("continuation") {
                return Err(Error::new(
                    ErrorCode::InvalidOptions,
                    "The last target entry in the query must be the document",
                ));
            }
            if !node.quals.is_empty() {
                // continuations flow even when the change does not match
                let mut quals = std::mem::take(&mut node.quals);
                let filtered = if quals.len() == 1 {
                    quals.remove(0)
                } else {
                    Expr::And(quals)
                };
                node.quals
                    .push(Expr::Or(vec![Expr::IsNull(Box::new(Expr::Document)), filtered]));
            }
            Ok(kind)
        }
        other => Ok(other),
    }
}
