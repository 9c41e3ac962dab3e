//! Relational plan produced from a pipeline. Nodes live in a per-query
//! arena and refer to their inputs by [`NodeId`].

use std::fmt::{self, Write as _};

use bson::{Bson, Document};
use docdb_shard::ShardKeyFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Scalar and aggregate expressions over the current row.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The `document` column of the node's input relation.
    Document,
    /// A named column of the input relation (`shard_key_value`, `object_id`,
    /// or an output column of a subquery).
    Column(String),
    /// The `document` column of a joined relation.
    JoinDocument(String),
    Const(Bson),
    /// A value bound at execution time.
    Param(&'static str),
    Func {
        name: &'static str,
        args: Vec<Expr>,
    },
    Op {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    IsNull(Box<Expr>),
    Coalesce(Vec<Expr>),
    Aggregate {
        name: &'static str,
        args: Vec<Expr>,
        order_by: Vec<SortClause>,
    },
    /// An aggregate evaluated over the node's window.
    Window {
        name: &'static str,
        args: Vec<Expr>,
    },
    Random,
}

impl Expr {
    pub fn func(name: &'static str, args: Vec<Expr>) -> Expr {
        Expr::Func { name, args }
    }

    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn konst(value: impl Into<Bson>) -> Expr {
        Expr::Const(value.into())
    }

    pub fn document(doc: Document) -> Expr {
        Expr::Const(Bson::Document(doc))
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Op {
            op: "=",
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn aggregate(name: &'static str, args: Vec<Expr>) -> Expr {
        Expr::Aggregate {
            name,
            args,
            order_by: Vec::new(),
        }
    }

    /// `shard_key_value` predicate for a router filter.
    pub fn from_shard_filter(filter: &ShardKeyFilter) -> Expr {
        match filter {
            ShardKeyFilter::Equals { value, .. } => Expr::eq(
                Expr::column("shard_key_value"),
                Expr::Const(Bson::Int64(*value)),
            ),
            ShardKeyFilter::Or(arms) => Expr::Or(arms.iter().map(Expr::from_shard_filter).collect()),
            ShardKeyFilter::And(arms) => {
                Expr::And(arms.iter().map(Expr::from_shard_filter).collect())
            }
        }
    }

    pub fn is_shard_key_equality(&self) -> bool {
        matches!(self, Expr::Op { op: "=", left, .. } if **left == Expr::column("shard_key_value"))
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Func { args, .. } | Expr::Window { args, .. } => {
                args.iter().any(Expr::contains_aggregate)
            }
            Expr::And(items) | Expr::Or(items) | Expr::Coalesce(items) => {
                items.iter().any(Expr::contains_aggregate)
            }
            Expr::Op { left, right, .. } => left.contains_aggregate() || right.contains_aggregate(),
            Expr::IsNull(inner) => inner.contains_aggregate(),
            _ => false,
        }
    }

    /// Name of the outermost function, if this is a call.
    pub fn function_name(&self) -> Option<&'static str> {
        match self {
            Expr::Func { name, .. } | Expr::Aggregate { name, .. } | Expr::Window { name, .. } => {
                Some(*name)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Document => f.write_str("document"),
            Expr::Column(name) => f.write_str(name),
            Expr::JoinDocument(alias) => write!(f, "{alias}.document"),
            Expr::Const(value) => f.write_str(&render_bson(value)),
            Expr::Param(name) => write!(f, "${name}"),
            Expr::Func { name, args } => write!(f, "{name}({})", join(args, ", ")),
            Expr::Op { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::And(items) => write!(f, "({})", join(items, " AND ")),
            Expr::Or(items) => write!(f, "({})", join(items, " OR ")),
            Expr::IsNull(inner) => write!(f, "{inner} IS NULL"),
            Expr::Coalesce(items) => write!(f, "COALESCE({})", join(items, ", ")),
            Expr::Aggregate {
                name,
                args,
                order_by,
            } => {
                write!(f, "{name}({}", join(args, ", "))?;
                if !order_by.is_empty() {
                    write!(f, " ORDER BY {}", join(order_by, ", "))?;
                }
                f.write_str(")")
            }
            Expr::Window { name, args } => write!(f, "{name}({}) OVER w", join(args, ", ")),
            Expr::Random => f.write_str("random()"),
        }
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Compact, stable rendering used by plan output.
pub fn render_bson(value: &Bson) -> String {
    match value {
        Bson::Int32(v) => v.to_string(),
        Bson::Int64(v) => v.to_string(),
        Bson::Double(v) => format!("{v:?}"),
        Bson::Boolean(v) => v.to_string(),
        Bson::Null => "null".to_string(),
        Bson::String(s) => format!("'{s}'"),
        Bson::Array(items) => format!(
            "[{}]",
            items.iter().map(render_bson).collect::<Vec<_>>().join(", ")
        ),
        Bson::Document(doc) => render_document(doc),
        other => other.to_string(),
    }
}

pub fn render_document(doc: &Document) -> String {
    let fields: Vec<String> = doc
        .iter()
        .map(|(k, v)| format!("\"{k}\": {}", render_bson(v)))
        .collect();
    format!("{{{}}}", fields.join(", "))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortClause {
    pub expr: Expr,
    pub descending: bool,
}

impl fmt::Display for SortClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.descending {
            f.write_str(" DESC")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub expr: Expr,
}

impl Target {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Target {
            name: name.into(),
            expr,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    /// A collection's backing table.
    Collection {
        database: String,
        name: String,
        collection_id: u64,
        alias: String,
        /// `TABLESAMPLE system_rows(n)`
        sample_rows: Option<i64>,
    },
    /// Stand-in for a collection that does not exist.
    Empty { alias: String },
    /// No input at all (`aggregate: 1`).
    Agnostic,
    Subquery { node: NodeId, alias: String },
    /// A set-returning function.
    Function {
        name: &'static str,
        args: Vec<Expr>,
        alias: String,
    },
    UnionAll {
        left: NodeId,
        right: NodeId,
        alias: String,
    },
}

impl Relation {
    /// Name other relations use to refer to this one's rows.
    pub fn alias(&self) -> Option<&str> {
        match self {
            Relation::Collection { alias, .. }
            | Relation::Empty { alias }
            | Relation::Subquery { alias, .. }
            | Relation::Function { alias, .. }
            | Relation::UnionAll { alias, .. } => Some(alias),
            Relation::Agnostic => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub right: NodeId,
    pub alias: String,
    pub lateral: bool,
    pub condition: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<SortClause>,
}

/// One `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    pub source: Relation,
    pub joins: Vec<Join>,
    /// The first target is always the row's document.
    pub targets: Vec<Target>,
    pub quals: Vec<Expr>,
    /// `SELECT DISTINCT`
    pub distinct: bool,
    pub group_by: Vec<Expr>,
    pub window: Option<WindowSpec>,
    pub sort: Vec<SortClause>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl QueryNode {
    pub fn new(source: Relation) -> Self {
        QueryNode {
            source,
            joins: Vec::new(),
            targets: vec![Target::new("document", Expr::Document)],
            quals: Vec::new(),
            distinct: false,
            group_by: Vec::new(),
            window: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn document(&self) -> &Expr {
        &self.targets[0].expr
    }

    pub fn set_document(&mut self, expr: Expr) {
        self.targets[0].expr = expr;
    }

    pub fn has_aggregates(&self) -> bool {
        self.targets.iter().any(|t| t.expr.contains_aggregate())
    }

    fn shift(&mut self, offset: usize) {
        let bump = |id: &mut NodeId| id.0 += offset;
        match &mut self.source {
            Relation::Subquery { node, .. } => bump(node),
            Relation::UnionAll { left, right, .. } => {
                bump(left);
                bump(right);
            }
            _ => {}
        }
        for join in &mut self.joins {
            bump(&mut join.right);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTree {
    nodes: Vec<QueryNode>,
    root: NodeId,
}

impl QueryTree {
    pub fn new(source: Relation) -> Self {
        QueryTree {
            nodes: vec![QueryNode::new(source)],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    pub fn node(&self, id: NodeId) -> &QueryNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut QueryNode {
        &mut self.nodes[id.0]
    }

    pub fn root_node(&self) -> &QueryNode {
        self.node(self.root)
    }

    pub fn root_node_mut(&mut self) -> &mut QueryNode {
        let root = self.root;
        self.node_mut(root)
    }

    pub fn push(&mut self, node: QueryNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wrap the current root as the input of a new root that selects its
    /// document.
    pub fn wrap_root(&mut self, alias: String) -> NodeId {
        let child = self.root;
        let id = self.push(QueryNode::new(Relation::Subquery { node: child, alias }));
        self.root = id;
        id
    }

    /// Move another tree's nodes into this arena; returns the id its root
    /// now has.
    pub fn graft(&mut self, other: QueryTree) -> NodeId {
        let offset = self.nodes.len();
        for mut node in other.nodes {
            node.shift(offset);
            self.nodes.push(node);
        }
        NodeId(other.root.0 + offset)
    }

    /// The node reading the collection, following the first input of each
    /// subquery from the root.
    pub fn base_node(&self) -> NodeId {
        let mut current = self.root;
        while let Relation::Subquery { node, .. } = &self.node(current).source {
            current = *node;
        }
        current
    }

    /// Number of subquery levels between the root and the base node.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.root;
        while let Relation::Subquery { node, .. } = &self.node(current).source {
            depth += 1;
            current = *node;
        }
        depth
    }

    /// `true` while the root still reads the raw collection rows with
    /// nothing applied but filters.
    pub fn on_base_table(&self) -> bool {
        let node = self.root_node();
        matches!(node.source, Relation::Collection { .. })
            && node.joins.is_empty()
            && !node.distinct
            && node.group_by.is_empty()
            && node.window.is_none()
            && node.limit.is_none()
            && node.offset.is_none()
            && *node.document() == Expr::Document
    }

    /// Stable text form of the plan.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_node(self.root, 0, &mut out);
        out
    }

    fn explain_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        let node = self.node(id);
        let targets: Vec<String> = node
            .targets
            .iter()
            .map(|t| format!("{} AS {}", t.expr, t.name))
            .collect();
        let distinct = if node.distinct { "DISTINCT " } else { "" };
        let _ = writeln!(out, "{pad}SELECT {distinct}{}", targets.join(", "));

        match &node.source {
            Relation::Collection {
                database,
                name,
                collection_id,
                alias,
                sample_rows,
            } => {
                let _ = write!(out, "{pad}FROM {database}.{name} [{collection_id}] AS {alias}");
                if let Some(rows) = sample_rows {
                    let _ = write!(out, " TABLESAMPLE system_rows({rows})");
                }
                out.push('\n');
            }
            Relation::Empty { alias } => {
                let _ = writeln!(out, "{pad}FROM empty_data_table() AS {alias}");
            }
            Relation::Agnostic => {}
            Relation::Subquery { node, alias } => {
                let _ = writeln!(out, "{pad}FROM (");
                self.explain_node(*node, depth + 1, out);
                let _ = writeln!(out, "{pad}) AS {alias}");
            }
            Relation::Function { name, args, alias } => {
                let _ = writeln!(out, "{pad}FROM {} AS {alias}", Expr::func(*name, args.clone()));
            }
            Relation::UnionAll { left, right, alias } => {
                let _ = writeln!(out, "{pad}FROM (");
                self.explain_node(*left, depth + 1, out);
                let _ = writeln!(out, "{pad}  UNION ALL");
                self.explain_node(*right, depth + 1, out);
                let _ = writeln!(out, "{pad}) AS {alias}");
            }
        }

        for join in &node.joins {
            let kind = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::LeftOuter => "LEFT JOIN",
            };
            let lateral = if join.lateral { " LATERAL" } else { "" };
            let _ = writeln!(out, "{pad}{kind}{lateral} (");
            self.explain_node(join.right, depth + 1, out);
            let _ = write!(out, "{pad}) AS {}", join.alias);
            match &join.condition {
                Some(cond) => {
                    let _ = writeln!(out, " ON {cond}");
                }
                None => out.push_str(" ON true\n"),
            }
        }

        if !node.quals.is_empty() {
            let _ = writeln!(out, "{pad}WHERE {}", join(&node.quals, " AND "));
        }
        if !node.group_by.is_empty() {
            let _ = writeln!(out, "{pad}GROUP BY {}", join(&node.group_by, ", "));
        }
        if let Some(window) = &node.window {
            let _ = write!(out, "{pad}WINDOW w AS (");
            if !window.partition_by.is_empty() {
                let _ = write!(out, "PARTITION BY {}", join(&window.partition_by, ", "));
            }
            if !window.order_by.is_empty() {
                if !window.partition_by.is_empty() {
                    out.push(' ');
                }
                let _ = write!(out, "ORDER BY {}", join(&window.order_by, ", "));
            }
            out.push_str(")\n");
        }
        if !node.sort.is_empty() {
            let _ = writeln!(out, "{pad}ORDER BY {}", join(&node.sort, ", "));
        }
        if let Some(limit) = node.limit {
            let _ = writeln!(out, "{pad}LIMIT {limit}");
        }
        if let Some(offset) = node.offset {
            let _ = writeln!(out, "{pad}OFFSET {offset}");
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn collection() -> Relation {
        Relation::Collection {
            database: "db".into(),
            name: "c".into(),
            collection_id: 4,
            alias: "collection".into(),
            sample_rows: None,
        }
    }

    #[test]
    fn wrapping_keeps_base_reachable() {
        let mut tree = QueryTree::new(collection());
        assert!(tree.on_base_table());
        tree.wrap_root("agg_stage_0".into());
        tree.wrap_root("agg_stage_1".into());
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.base_node().index(), 0);
        assert!(!tree.on_base_table());
    }

    #[test]
    fn graft_renumbers_inputs() {
        let mut inner = QueryTree::new(collection());
        inner.wrap_root("inner".into());

        let mut outer = QueryTree::new(Relation::Agnostic);
        let grafted = outer.graft(inner);
        assert_eq!(grafted.index(), 2);
        match &outer.node(grafted).source {
            Relation::Subquery { node, .. } => assert_eq!(node.index(), 1),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn explain_renders_clauses() {
        let mut tree = QueryTree::new(collection());
        let node = tree.root_node_mut();
        node.quals.push(Expr::func(
            "bson_dollar_match",
            vec![Expr::Document, Expr::document(doc! { "a": 1 })],
        ));
        node.quals.push(Expr::eq(
            Expr::column("shard_key_value"),
            Expr::konst(Bson::Int64(-12)),
        ));
        node.sort.push(SortClause {
            expr: Expr::func(
                "bson_orderby",
                vec![Expr::Document, Expr::document(doc! { "b": 1 })],
            ),
            descending: false,
        });
        node.limit = Some(5);

        let text = tree.explain();
        assert_eq!(
            text,
            "SELECT document AS document\n\
             FROM db.c [4] AS collection\n\
             WHERE bson_dollar_match(document, {\"a\": 1}) AND shard_key_value = -12\n\
             ORDER BY bson_orderby(document, {\"b\": 1})\n\
             LIMIT 5\n"
        );
    }
}
