//! # Query definitions
//!
//! A [`Query`] is built fluently and kept as a plain AST ([`QueryDef`]).
//! [`compile_query`] resolves it against the compiled schema into a
//! numeric [`QueryPlan`] plus the [`ReaderSchema`](crate::reader::ReaderSchema)
//! that decodes its response.
//!
//! ```text
//! Query::new("user")
//!     .include(["name", "friends.name"])
//!     .filter("age", Operator::Gt, 30u32)
//!     .or(|f| f.filter("name", Operator::Eq, "youzi"))
//!     .sort("age", Order::Desc)
//!     .range(0, 10)
//! ```

mod aggregate;
mod encode;
mod filter;
mod plan;
mod subscription;

pub use aggregate::{agg_layout, AggKind, AggLayout, AggSlot};
pub use encode::{decode_batch, decode_body, encode_batch, encode_body, query_id};
pub use filter::{Condition, Filter, FilterTree, Operator};
pub use plan::{
    compile_query, AggPlan, CompiledQuery, Distance, EdgeSelect, FieldRef, FilterPlan, GroupEntry, GroupPlan,
    MainSelect, PlanTarget, QueryPlan, RefPlan, SearchPlan, SortPlan, StepPlan, ID_PROP,
};
pub use subscription::{Interest, SubHeader};

use basedb_core::timestamp::CalendarInterval;
use basedb_core::{NodeId, Value};

/// Which nodes of the type a query reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    All,
    Id(NodeId),
    Ids(Vec<NodeId>),
    Alias { path: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncludeItem {
    /// A property path, `*` (direct scalars) or `**` (references).
    Path(String),
    /// Checksum, size and compression flag of a string field.
    Meta(String),
    /// A reference with its own projection, filter, sort and range.
    Ref(String, Box<RefQuery>),
}

/// Nested query over the targets of a reference.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefQuery {
    pub include: Vec<IncludeItem>,
    pub filter: Filter,
    pub sort: Option<(String, Order)>,
    pub range: Option<(u32, u32)>,
}

impl RefQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(paths.into_iter().map(|p| IncludeItem::Path(p.into())));
        self
    }

    pub fn filter(mut self, path: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.filter = self.filter.filter(path, op, value);
        self
    }

    pub fn sort(mut self, path: impl Into<String>, order: Order) -> Self {
        self.sort = Some((path.into(), order));
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.range = Some((offset, limit));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchDef {
    /// Tokenized match; fields without a weight get one by name.
    Lexical { query: String, fields: Vec<(String, Option<u8>)> },
    Vector {
        path: String,
        vector: Vec<f32>,
        distance: Distance,
        threshold: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Fixed(i64),
    Calendar(CalendarInterval),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggDef {
    pub group_by: Option<(String, Option<Step>)>,
    /// `(kind, path)`; count has an empty path.
    pub fns: Vec<(AggKind, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDef {
    pub type_name: String,
    pub target: Target,
    pub include: Vec<IncludeItem>,
    pub filter: Filter,
    pub sort: Option<(String, Order)>,
    pub range: Option<(u32, u32)>,
    pub search: Option<SearchDef>,
    pub agg: Option<AggDef>,
    pub locale: Option<String>,
}

/// Fluent builder of a [`QueryDef`].
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    def: QueryDef,
}

impl Query {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            def: QueryDef {
                type_name: type_name.into(),
                target: Target::All,
                include: Vec::new(),
                filter: Filter::default(),
                sort: None,
                range: None,
                search: None,
                agg: None,
                locale: None,
            },
        }
    }

    pub fn id(mut self, id: NodeId) -> Self {
        self.def.target = Target::Id(id);
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        self.def.target = Target::Ids(ids.into_iter().collect());
        self
    }

    pub fn alias(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.def.target = Target::Alias {
            path: path.into(),
            value: value.into(),
        };
        self
    }

    pub fn include<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.def
            .include
            .extend(paths.into_iter().map(|p| IncludeItem::Path(p.into())));
        self
    }

    pub fn include_meta(mut self, path: impl Into<String>) -> Self {
        self.def.include.push(IncludeItem::Meta(path.into()));
        self
    }

    pub fn include_ref(mut self, path: impl Into<String>, build: impl FnOnce(RefQuery) -> RefQuery) -> Self {
        self.def
            .include
            .push(IncludeItem::Ref(path.into(), Box::new(build(RefQuery::new()))));
        self
    }

    /// Add a condition; consecutive filters form one group.
    pub fn filter(mut self, path: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.def.filter = self.def.filter.filter(path, op, value);
        self
    }

    /// `current OR group`, evaluated in call order.
    pub fn or(mut self, build: impl FnOnce(Filter) -> Filter) -> Self {
        self.def.filter = self.def.filter.or(build);
        self
    }

    /// `current AND group`, evaluated in call order.
    pub fn and(mut self, build: impl FnOnce(Filter) -> Filter) -> Self {
        self.def.filter = self.def.filter.and(build);
        self
    }

    pub fn sort(mut self, path: impl Into<String>, order: Order) -> Self {
        self.def.sort = Some((path.into(), order));
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.def.range = Some((offset, limit));
        self
    }

    pub fn search<I, S>(mut self, query: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.def.search = Some(SearchDef::Lexical {
            query: query.into(),
            fields: fields.into_iter().map(|f| (f.into(), None)).collect(),
        });
        self
    }

    pub fn search_weighted(mut self, query: impl Into<String>, fields: Vec<(String, u8)>) -> Self {
        self.def.search = Some(SearchDef::Lexical {
            query: query.into(),
            fields: fields.into_iter().map(|(f, w)| (f, Some(w))).collect(),
        });
        self
    }

    pub fn search_vector(mut self, path: impl Into<String>, vector: Vec<f32>, distance: Distance, threshold: f64) -> Self {
        self.def.search = Some(SearchDef::Vector {
            path: path.into(),
            vector,
            distance,
            threshold,
        });
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.def.locale = Some(locale.into());
        self
    }

    fn agg(mut self, kind: AggKind, path: &str) -> Self {
        self.def
            .agg
            .get_or_insert_with(AggDef::default)
            .fns
            .push((kind, path.to_string()));
        self
    }

    pub fn count(self) -> Self {
        self.agg(AggKind::Count, "")
    }

    pub fn sum(self, path: &str) -> Self {
        self.agg(AggKind::Sum, path)
    }

    pub fn min(self, path: &str) -> Self {
        self.agg(AggKind::Min, path)
    }

    pub fn max(self, path: &str) -> Self {
        self.agg(AggKind::Max, path)
    }

    pub fn avg(self, path: &str) -> Self {
        self.agg(AggKind::Avg, path)
    }

    pub fn stddev(self, path: &str) -> Self {
        self.agg(AggKind::Stddev, path)
    }

    pub fn cardinality(self, path: &str) -> Self {
        self.agg(AggKind::Cardinality, path)
    }

    pub fn group_by(mut self, path: impl Into<String>) -> Self {
        self.def.agg.get_or_insert_with(AggDef::default).group_by = Some((path.into(), None));
        self
    }

    pub fn group_by_step(mut self, path: impl Into<String>, step: Step) -> Self {
        self.def.agg.get_or_insert_with(AggDef::default).group_by = Some((path.into(), Some(step)));
        self
    }

    pub fn def(&self) -> &QueryDef {
        &self.def
    }

    pub fn into_def(self) -> QueryDef {
        self.def
    }
}

impl From<Query> for QueryDef {
    fn from(q: Query) -> Self {
        q.def
    }
}
