//! QueryDef → QueryPlan.
//!
//! The plan only holds numbers the backend can act on: type ids, prop ids
//! and main offsets. Everything name-based is resolved here, against the
//! same compiled schema the reader uses.

use std::collections::BTreeMap;

use basedb_core::string::{normalize, search_tokens};
use basedb_core::timestamp::{now_ms, resolve, CalendarInterval};
use basedb_core::{Error, PropDef, PropKind, Result, TypeDef, TypeDefs, Value};

use super::aggregate::{agg_layout, AggKind};
use super::filter::{Condition, FilterTree, Operator};
use super::subscription::SubHeader;
use super::*;
use crate::reader::{AggReader, ReaderSchema, RefReader};

/// Pseudo prop id addressing the node id.
pub const ID_PROP: u8 = 254;

/// Where a value lives: a main slice (`prop == 0`), a separate field or the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub prop: u8,
    pub start: u16,
    pub len: u16,
    pub kind: PropKind,
}

impl FieldRef {
    pub fn of(p: &PropDef) -> Self {
        Self {
            prop: if p.separate { p.prop } else { 0 },
            start: p.start as u16,
            len: p.len as u16,
            kind: p.kind,
        }
    }

    pub fn id() -> Self {
        Self {
            prop: ID_PROP,
            start: 0,
            len: 4,
            kind: PropKind::Uint32,
        }
    }

    pub fn is_id(&self) -> bool {
        self.prop == ID_PROP
    }

    pub fn is_main(&self) -> bool {
        self.prop == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanTarget {
    All,
    Id(u32),
    Ids(Vec<u32>),
    Alias { prop: u8, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainSelect {
    None,
    /// The full main record.
    All,
    /// `(start, len)` slices, concatenated in this order in the response.
    Slices(Vec<(u16, u16)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSelect {
    pub type_id: u16,
    pub main: MainSelect,
    pub fields: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefPlan {
    pub prop: u8,
    pub plan: QueryPlan,
    pub edge: Option<EdgeSelect>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupEntry {
    /// Conditions on one field, OR'd.
    Field { field: FieldRef, conds: Vec<(Operator, Value)> },
    /// Nested filter on the nodes a reference points at.
    Ref { prop: u8, filter: Box<FilterPlan> },
}

/// Entries are AND'd.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupPlan {
    pub entries: Vec<GroupEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterPlan {
    Group(GroupPlan),
    And(Box<FilterPlan>, Box<FilterPlan>),
    Or(Box<FilterPlan>, Box<FilterPlan>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortPlan {
    pub field: FieldRef,
    pub desc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Distance {
    Cosine = 1,
    Euclidean = 2,
    DotProduct = 3,
    Manhattan = 4,
}

impl Distance {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Distance::Cosine,
            2 => Distance::Euclidean,
            3 => Distance::DotProduct,
            4 => Distance::Manhattan,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchPlan {
    Lexical {
        tokens: Vec<String>,
        fields: Vec<(FieldRef, u8)>,
    },
    Vector {
        field: FieldRef,
        vector: Vec<f32>,
        distance: Distance,
        threshold: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepPlan {
    None,
    Fixed(i64),
    Calendar(CalendarInterval),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggPlan {
    pub group_by: Option<(FieldRef, StepPlan)>,
    pub fns: Vec<(AggKind, FieldRef)>,
    /// Plain `count()` over the whole type: answered from the node count.
    pub root_count_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub type_id: u16,
    pub target: PlanTarget,
    pub main: MainSelect,
    pub fields: Vec<u8>,
    pub meta: Vec<u8>,
    pub refs: Vec<RefPlan>,
    pub filter: Option<FilterPlan>,
    pub sort: Option<SortPlan>,
    pub range: Option<(u32, u32)>,
    pub search: Option<SearchPlan>,
    pub agg: Option<AggPlan>,
    pub locale: Option<String>,
    pub schema_hash: u64,
}

impl QueryPlan {
    fn new(type_id: u16, schema_hash: u64) -> Self {
        Self {
            type_id,
            target: PlanTarget::All,
            main: MainSelect::None,
            fields: Vec::new(),
            meta: Vec::new(),
            refs: Vec::new(),
            filter: None,
            sort: None,
            range: None,
            search: None,
            agg: None,
            locale: None,
            schema_hash,
        }
    }

    /// Whether the query addresses at most one node.
    pub fn is_single(&self) -> bool {
        matches!(self.target, PlanTarget::Id(_) | PlanTarget::Alias { .. })
    }
}

/// A query ready to send, with everything needed to read its response and
/// to match it against changes.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub reader: ReaderSchema,
    pub sub: SubHeader,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidQuery {
        message: message.into(),
    }
}

pub fn compile_query(def: &QueryDef, defs: &TypeDefs) -> Result<CompiledQuery> {
    let type_def = defs.require(&def.type_name)?;
    if let Some(locale) = &def.locale {
        if !defs.locales.iter().any(|l| l == locale) {
            return Err(invalid(format!("unknown locale {:?}", locale)));
        }
    }

    let mut plan = QueryPlan::new(type_def.id, defs.hash);
    plan.locale = def.locale.clone();
    plan.target = compile_target(type_def, &def.target)?;
    plan.filter = compile_filter(defs, type_def, def.filter.tree())?;
    plan.sort = def
        .sort
        .as_ref()
        .map(|(path, order)| compile_sort(type_def, path, *order))
        .transpose()?;
    plan.range = def.range;
    plan.search = def.search.as_ref().map(|s| compile_search(type_def, s)).transpose()?;

    if let Some(agg) = &def.agg {
        let (mut agg, agg_reader) = compile_agg(type_def, agg)?;
        agg.root_count_only = agg.group_by.is_none()
            && plan.filter.is_none()
            && plan.search.is_none()
            && plan.target == PlanTarget::All
            && agg.fns.len() == 1
            && agg.fns[0].0 == AggKind::Count;
        // Aggregates always cover the full filtered set.
        plan.range = None;
        plan.agg = Some(agg);
        let mut reader = ReaderSchema::new(type_def, plan.locale.clone(), defs.locales.clone());
        reader.agg = Some(agg_reader);
        let sub = SubHeader::from_plan(&plan, defs);
        return Ok(CompiledQuery { plan, reader, sub });
    }

    let mut reader = ReaderSchema::new(type_def, plan.locale.clone(), defs.locales.clone());
    reader.single = plan.is_single();
    compile_include(defs, type_def, &def.include, &mut plan, &mut reader)?;
    let sub = SubHeader::from_plan(&plan, defs);
    Ok(CompiledQuery { plan, reader, sub })
}

fn compile_target(def: &TypeDef, target: &Target) -> Result<PlanTarget> {
    Ok(match target {
        Target::All => PlanTarget::All,
        Target::Id(id) => PlanTarget::Id(*id),
        Target::Ids(ids) => PlanTarget::Ids(ids.clone()),
        Target::Alias { path, value } => {
            let p = def.require_prop(path)?;
            if p.kind != PropKind::Alias {
                return Err(invalid(format!("{}.{} is not an alias", def.name, path)));
            }
            PlanTarget::Alias {
                prop: p.prop,
                value: normalize(value),
            }
        }
    })
}

/// Split `a.b.c` at the first segment that is a reference of `def`.
fn split_ref<'a>(def: &'a TypeDef, path: &'a str) -> Option<(&'a PropDef, &'a str)> {
    path.match_indices('.').find_map(|(i, _)| {
        let head = &path[..i];
        def.prop(head)
            .filter(|p| p.kind.is_reference())
            .map(|p| (p, &path[i + 1..]))
    })
}

fn ref_target<'a>(defs: &'a TypeDefs, def: &TypeDef, prop: &PropDef) -> Result<&'a TypeDef> {
    let r = prop
        .reference
        .as_ref()
        .ok_or_else(|| invalid(format!("{}.{} is not resolved", def.name, prop.path)))?;
    defs.require_id(r.target_type_id)
}

// Filters

fn compile_filter(defs: &TypeDefs, def: &TypeDef, tree: Option<&FilterTree>) -> Result<Option<FilterPlan>> {
    tree.map(|t| compile_tree(defs, def, t)).transpose()
}

fn compile_tree(defs: &TypeDefs, def: &TypeDef, tree: &FilterTree) -> Result<FilterPlan> {
    Ok(match tree {
        FilterTree::Group(conds) => FilterPlan::Group(compile_group(defs, def, conds)?),
        FilterTree::And(a, b) => FilterPlan::And(
            Box::new(compile_tree(defs, def, a)?),
            Box::new(compile_tree(defs, def, b)?),
        ),
        FilterTree::Or(a, b) => FilterPlan::Or(
            Box::new(compile_tree(defs, def, a)?),
            Box::new(compile_tree(defs, def, b)?),
        ),
    })
}

fn compile_group(defs: &TypeDefs, def: &TypeDef, conds: &[Condition]) -> Result<GroupPlan> {
    let mut entries: Vec<GroupEntry> = Vec::new();
    // Conditions that cross a reference, per reference prop, in order.
    let mut nested: Vec<(u8, &PropDef, Vec<Condition>)> = Vec::new();

    for cond in conds {
        if let Some((ref_prop, rest)) = split_ref(def, &cond.path) {
            let sub = Condition {
                path: rest.to_string(),
                op: cond.op,
                value: cond.value.clone(),
            };
            match nested.iter_mut().find(|(p, _, _)| *p == ref_prop.prop) {
                Some((_, _, list)) => list.push(sub),
                None => nested.push((ref_prop.prop, ref_prop, vec![sub])),
            }
            continue;
        }

        let field = if cond.path == "id" {
            FieldRef::id()
        } else {
            FieldRef::of(def.require_prop(&cond.path)?)
        };
        let value = match def.prop(&cond.path) {
            Some(p) => filter_value(def, p, cond.op, &cond.value)?,
            None => cond.value.clone(),
        };
        match entries.iter_mut().find_map(|e| match e {
            GroupEntry::Field { field: f, conds } if *f == field => Some(conds),
            _ => None,
        }) {
            Some(list) => list.push((cond.op, value)),
            None => entries.push(GroupEntry::Field {
                field,
                conds: vec![(cond.op, value)],
            }),
        }
    }

    for (prop, ref_prop, conds) in nested {
        let target = ref_target(defs, def, ref_prop)?;
        let group = compile_group(defs, target, &conds)?;
        entries.push(GroupEntry::Ref {
            prop,
            filter: Box::new(FilterPlan::Group(group)),
        });
    }
    Ok(GroupPlan { entries })
}

/// Bring a condition value into the domain the backend compares in.
fn filter_value(def: &TypeDef, prop: &PropDef, op: Operator, value: &Value) -> Result<Value> {
    if matches!(op, Operator::Exists | Operator::NotExists) {
        return Ok(Value::Null);
    }
    if op == Operator::Range {
        let bounds = value
            .as_list()
            .filter(|l| l.len() == 2)
            .ok_or_else(|| invalid(format!("range on {} needs [low, high]", prop.path)))?;
        let low = scalar_filter_value(def, prop, op, &bounds[0])?;
        let high = scalar_filter_value(def, prop, op, &bounds[1])?;
        return Ok(Value::List(vec![low, high]));
    }
    if let Value::List(items) = value {
        // Any of the listed values.
        let items = items
            .iter()
            .map(|v| scalar_filter_value(def, prop, op, v))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::List(items));
    }
    scalar_filter_value(def, prop, op, value)
}

fn scalar_filter_value(def: &TypeDef, prop: &PropDef, op: Operator, value: &Value) -> Result<Value> {
    if op.is_ordering() && !(prop.kind.is_numeric() || prop.kind.is_stringy()) {
        return Err(invalid(format!("{} cannot compare {}.{}", op, def.name, prop.path)));
    }
    Ok(match (prop.kind, value) {
        (PropKind::Timestamp, Value::String(expr)) => Value::Timestamp(resolve(expr, now_ms())?),
        (k, Value::String(s)) if k.is_stringy() => Value::String(normalize(s)),
        (PropKind::Enum, Value::String(s)) => {
            if prop.enum_index(s).is_none() {
                return Err(invalid(format!("{:?} is not a member of {}.{}", s, def.name, prop.path)));
            }
            Value::String(s.clone())
        }
        (k, v @ (Value::Int(_) | Value::Number(_) | Value::Timestamp(_))) if k.is_numeric() || k.is_reference() => {
            v.clone()
        }
        (PropKind::Boolean, Value::Bool(_)) => value.clone(),
        (PropKind::Cardinality | PropKind::Json | PropKind::Binary, v) => v.clone(),
        (k, v) if k.is_stringy() => {
            return Err(invalid(format!("{}.{} compares strings, got {}", def.name, prop.path, v.kind_name())))
        }
        (k, v) => {
            return Err(invalid(format!(
                "{}.{} is {}, cannot filter by {}",
                def.name,
                prop.path,
                k,
                v.kind_name()
            )))
        }
    })
}

fn compile_sort(def: &TypeDef, path: &str, order: Order) -> Result<SortPlan> {
    let field = if path == "id" {
        FieldRef::id()
    } else {
        let p = def.require_prop(path)?;
        if p.kind.is_reference() || matches!(p.kind, PropKind::Vector | PropKind::Json | PropKind::Binary) {
            return Err(invalid(format!("cannot sort by {} {}.{}", p.kind, def.name, path)));
        }
        FieldRef::of(p)
    };
    Ok(SortPlan {
        field,
        desc: order == Order::Desc,
    })
}

/// Weight of a search field nobody gave a weight to.
fn default_weight(path: &str) -> u8 {
    match path.rsplit('.').next().unwrap_or(path) {
        "title" | "name" | "headline" => 3,
        _ => 1,
    }
}

fn compile_search(def: &TypeDef, search: &SearchDef) -> Result<SearchPlan> {
    match search {
        SearchDef::Lexical { query, fields } => {
            let tokens = search_tokens(query);
            if tokens.is_empty() {
                return Err(invalid("empty search query"));
            }
            let fields: Vec<(String, Option<u8>)> = if fields.is_empty() {
                def.props
                    .iter()
                    .filter(|p| p.kind.is_stringy())
                    .map(|p| (p.path.clone(), None))
                    .collect()
            } else {
                fields.clone()
            };
            let mut out = Vec::with_capacity(fields.len());
            for (path, weight) in fields {
                let p = def.require_prop(&path)?;
                if !p.kind.is_stringy() {
                    return Err(invalid(format!("cannot search {} {}.{}", p.kind, def.name, path)));
                }
                out.push((FieldRef::of(p), weight.unwrap_or_else(|| default_weight(&path))));
            }
            Ok(SearchPlan::Lexical { tokens, fields: out })
        }
        SearchDef::Vector {
            path,
            vector,
            distance,
            threshold,
        } => {
            let p = def.require_prop(path)?;
            if p.kind != PropKind::Vector {
                return Err(invalid(format!("{}.{} is not a vector", def.name, path)));
            }
            if let Some(size) = p.validation.size {
                if size != vector.len() {
                    return Err(invalid(format!("{}.{} has {} dimensions, got {}", def.name, path, size, vector.len())));
                }
            }
            Ok(SearchPlan::Vector {
                field: FieldRef::of(p),
                vector: vector.clone(),
                distance: *distance,
                threshold: *threshold,
            })
        }
    }
}

fn compile_agg(def: &TypeDef, agg: &AggDef) -> Result<(AggPlan, AggReader)> {
    let group_by = match &agg.group_by {
        None => None,
        Some((path, step)) => {
            let p = def.require_prop(path)?;
            if p.kind.is_reference() || matches!(p.kind, PropKind::Vector | PropKind::Json | PropKind::Binary) {
                return Err(invalid(format!("cannot group by {} {}.{}", p.kind, def.name, path)));
            }
            let step = match step {
                None => StepPlan::None,
                Some(_) if !p.kind.is_numeric() => {
                    return Err(invalid(format!("step grouping needs a number, {}.{} is {}", def.name, path, p.kind)))
                }
                Some(Step::Fixed(n)) if *n <= 0 => return Err(invalid("group step must be positive")),
                Some(Step::Fixed(n)) => StepPlan::Fixed(*n),
                Some(Step::Calendar(c)) => StepPlan::Calendar(*c),
            };
            Some((FieldRef::of(p), step))
        }
    };

    let mut fns = Vec::with_capacity(agg.fns.len());
    let mut names = Vec::with_capacity(agg.fns.len());
    for (kind, path) in &agg.fns {
        if *kind == AggKind::Count {
            fns.push((AggKind::Count, FieldRef::id()));
            names.push("count".to_string());
            continue;
        }
        let p = def.require_prop(path)?;
        if kind.needs_numeric() && !p.kind.is_numeric() {
            return Err(invalid(format!("{} needs a number, {}.{} is {}", kind.name(), def.name, path, p.kind)));
        }
        if p.kind.is_reference() {
            return Err(invalid(format!("cannot aggregate reference {}.{}", def.name, path)));
        }
        fns.push((*kind, FieldRef::of(p)));
        names.push(format!("{}.{}", path, kind.name()));
    }
    if fns.is_empty() {
        return Err(invalid("group by without an aggregate function"));
    }

    let reader = AggReader {
        layout: agg_layout(fns.iter().map(|(k, _)| *k)),
        names,
        grouped: group_by.is_some(),
    };
    Ok((
        AggPlan {
            group_by,
            fns,
            root_count_only: false,
        },
        reader,
    ))
}

// Includes

#[derive(Default)]
struct RefAccum<'a> {
    query: RefQuery,
    prop: Option<&'a PropDef>,
}

fn compile_include(
    defs: &TypeDefs,
    def: &TypeDef,
    include: &[IncludeItem],
    plan: &mut QueryPlan,
    reader: &mut ReaderSchema,
) -> Result<()> {
    let default_include = [IncludeItem::Path("*".to_string())];
    let include = if include.is_empty() { &default_include[..] } else { include };

    let mut scalars: Vec<&PropDef> = Vec::new();
    let mut meta: Vec<&PropDef> = Vec::new();
    let mut refs: BTreeMap<u8, RefAccum> = BTreeMap::new();

    for item in include {
        match item {
            IncludeItem::Path(path) if path == "*" => {
                for p in def.props.iter().filter(|p| !p.kind.is_reference()) {
                    push_unique(&mut scalars, p);
                }
            }
            IncludeItem::Path(path) if path == "**" => {
                for p in def.reference_props() {
                    refs.entry(p.prop).or_default().prop = Some(p);
                }
            }
            IncludeItem::Path(path) if path == "id" => {}
            IncludeItem::Path(path) => {
                if let Some(p) = def.prop(path) {
                    if p.kind.is_reference() {
                        refs.entry(p.prop).or_default().prop = Some(p);
                    } else {
                        push_unique(&mut scalars, p);
                    }
                } else if let Some((p, rest)) = split_ref(def, path) {
                    let acc = refs.entry(p.prop).or_default();
                    acc.prop = Some(p);
                    acc.query.include.push(IncludeItem::Path(rest.to_string()));
                } else {
                    // Object prefix: every leaf below it.
                    let prefix = format!("{}.", path);
                    let leaves: Vec<&PropDef> = def.props.iter().filter(|p| p.path.starts_with(&prefix)).collect();
                    if leaves.is_empty() {
                        return Err(Error::PropertyNotFound {
                            type_name: def.name.clone(),
                            path: path.clone(),
                        });
                    }
                    for p in leaves {
                        if p.kind.is_reference() {
                            refs.entry(p.prop).or_default().prop = Some(p);
                        } else {
                            push_unique(&mut scalars, p);
                        }
                    }
                }
            }
            IncludeItem::Meta(path) => {
                let p = def.require_prop(path)?;
                if !p.separate || !p.kind.is_stringy() {
                    return Err(invalid(format!("meta is only available for string fields, {}.{} is {}", def.name, path, p.kind)));
                }
                if !meta.iter().any(|m| m.prop == p.prop) {
                    meta.push(p);
                }
            }
            IncludeItem::Ref(path, query) => {
                let p = def.require_prop(path)?;
                if !p.kind.is_reference() {
                    return Err(invalid(format!("{}.{} is not a reference", def.name, path)));
                }
                let acc = refs.entry(p.prop).or_default();
                acc.prop = Some(p);
                acc.query.include.extend(query.include.iter().cloned());
                acc.query.filter = query.filter.clone();
                acc.query.sort = query.sort.clone();
                acc.query.range = query.range;
            }
        }
    }

    let (main, main_props) = main_select(def, scalars.iter().filter(|p| !p.separate).copied());
    plan.main = main;
    reader.main = main_props;
    for p in scalars.iter().filter(|p| p.separate) {
        plan.fields.push(p.prop);
        reader.fields.insert(p.prop, (*p).clone());
    }
    for p in meta {
        plan.meta.push(p.prop);
        reader.meta.insert(p.prop, p.clone());
    }

    for (prop_id, acc) in refs {
        let Some(prop) = acc.prop else { continue };
        let target = ref_target(defs, def, prop)?;

        let mut edge_paths = Vec::new();
        let mut target_include = Vec::new();
        for item in &acc.query.include {
            match item {
                IncludeItem::Path(p) if p.starts_with('$') => edge_paths.push(p.clone()),
                other => target_include.push(other.clone()),
            }
        }

        let mut nested = QueryPlan::new(target.id, defs.hash);
        nested.locale = plan.locale.clone();
        nested.filter = compile_filter(defs, target, acc.query.filter.tree())?;
        nested.sort = acc
            .query
            .sort
            .as_ref()
            .map(|(path, order)| compile_sort(target, path, *order))
            .transpose()?;
        nested.range = acc.query.range;

        let mut nested_reader = ReaderSchema::new(target, plan.locale.clone(), defs.locales.clone());
        nested_reader.single = prop.kind == PropKind::Reference;
        compile_include(defs, target, &target_include, &mut nested, &mut nested_reader)?;

        let (edge, edge_reader) = if edge_paths.is_empty() {
            (None, None)
        } else {
            let edge_def = defs
                .edge_def(prop)
                .ok_or_else(|| invalid(format!("{}.{} has no edge properties", def.name, prop.path)))?;
            let mut edge_scalars = Vec::new();
            for path in &edge_paths {
                edge_scalars.push(edge_def.require_prop(path)?);
            }
            let (main, main_props) = main_select(edge_def, edge_scalars.iter().filter(|p| !p.separate).copied());
            let mut edge_reader = ReaderSchema::new(edge_def, plan.locale.clone(), defs.locales.clone());
            edge_reader.main = main_props;
            let mut fields = Vec::new();
            for p in edge_scalars.iter().filter(|p| p.separate) {
                fields.push(p.prop);
                edge_reader.fields.insert(p.prop, (*p).clone());
            }
            (
                Some(EdgeSelect {
                    type_id: edge_def.id,
                    main,
                    fields,
                }),
                Some(edge_reader),
            )
        };

        plan.refs.push(RefPlan {
            prop: prop_id,
            plan: nested,
            edge,
        });
        reader.refs.insert(
            prop_id,
            RefReader {
                path: prop.path.clone(),
                single: prop.kind == PropKind::Reference,
                schema: Box::new(nested_reader),
                edge: edge_reader.map(Box::new),
            },
        );
    }
    Ok(())
}

fn push_unique<'a>(list: &mut Vec<&'a PropDef>, p: &'a PropDef) {
    if !list.iter().any(|s| s.path == p.path) {
        list.push(p);
    }
}

/// Pick the main header: the full record when every main field is wanted,
/// otherwise one slice per field. Returns the props as the reader sees
/// them, with `start` relative to the returned main bytes.
fn main_select<'a>(def: &TypeDef, selected: impl Iterator<Item = &'a PropDef>) -> (MainSelect, Vec<PropDef>) {
    let mut selected: Vec<&PropDef> = selected.collect();
    if selected.is_empty() {
        return (MainSelect::None, Vec::new());
    }
    if selected.len() == def.main_props().count() {
        return (MainSelect::All, selected.into_iter().cloned().collect());
    }
    selected.sort_by_key(|p| p.start);
    let mut slices = Vec::with_capacity(selected.len());
    let mut props = Vec::with_capacity(selected.len());
    let mut offset = 0;
    for p in selected {
        slices.push((p.start as u16, p.len as u16));
        let mut remapped = p.clone();
        remapped.start = offset;
        offset += p.len;
        props.push(remapped);
    }
    (MainSelect::Slices(slices), props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedb_core::config::SchemaConfig;
    use basedb_core::{compile, PropSchema as P, Schema, TypeSchema as T};

    fn defs() -> TypeDefs {
        let schema = Schema::new()
            .locale("en")
            .with_type(
                T::new("user")
                    .prop(P::string("name"))
                    .prop(P::uint32("flap"))
                    .prop(P::uint8("age"))
                    .prop(P::alias("email"))
                    .prop(P::reference("bestFriend", "user", "bestFriendOf")),
            )
            .with_type(
                T::new("article")
                    .prop(P::string("title"))
                    .prop(P::references("contributors", "user", "articles").edge(P::uint32("$rating"))),
            );
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    #[test]
    fn test_full_main_include_uses_default_header() {
        let defs = defs();
        let q = compile_query(Query::new("user").include(["flap", "age"]).def(), &defs).unwrap();
        assert_eq!(q.plan.main, MainSelect::All);
        let q = compile_query(Query::new("user").include(["age"]).def(), &defs).unwrap();
        let age = defs.get("user").unwrap().prop("age").unwrap();
        assert_eq!(q.plan.main, MainSelect::Slices(vec![(age.start as u16, 1)]));
        assert_eq!(q.reader.main[0].start, 0);
    }

    #[test]
    fn test_wildcards() {
        let defs = defs();
        let scalars = compile_query(Query::new("user").include(["*"]).def(), &defs).unwrap();
        assert!(scalars.plan.refs.is_empty());
        assert_eq!(scalars.plan.fields.len(), 2);

        let refs = compile_query(Query::new("user").include(["**"]).def(), &defs).unwrap();
        assert_eq!(refs.plan.main, MainSelect::None);
        assert!(refs.plan.fields.is_empty());
        assert_eq!(refs.plan.refs.len(), 3);

        let both = compile_query(Query::new("user").include(["*", "**"]).def(), &defs).unwrap();
        assert_eq!(both.plan.main, MainSelect::All);
        assert_eq!(both.plan.refs.len(), 3);
    }

    #[test]
    fn test_edge_include() {
        let defs = defs();
        let q = compile_query(
            Query::new("article").include(["contributors.name", "contributors.$rating"]).def(),
            &defs,
        )
        .unwrap();
        let r = &q.plan.refs[0];
        assert!(r.edge.is_some());
        assert_eq!(r.plan.main, MainSelect::None);
        assert_eq!(r.plan.fields.len(), 1);
    }

    #[test]
    fn test_reference_filter_is_nested() {
        let defs = defs();
        let q = compile_query(
            Query::new("user")
                .filter("bestFriend.age", Operator::Gt, 10u8)
                .filter("flap", Operator::Eq, 1u32)
                .filter("flap", Operator::Eq, 2u32)
                .def(),
            &defs,
        )
        .unwrap();
        let Some(FilterPlan::Group(group)) = q.plan.filter else { panic!("expected group") };
        assert_eq!(group.entries.len(), 2);
        assert!(matches!(&group.entries[0], GroupEntry::Field { conds, .. } if conds.len() == 2));
        assert!(matches!(&group.entries[1], GroupEntry::Ref { .. }));
    }

    #[test]
    fn test_root_count_only() {
        let defs = defs();
        let q = compile_query(Query::new("user").count().def(), &defs).unwrap();
        assert!(q.plan.agg.as_ref().unwrap().root_count_only);
        let q = compile_query(Query::new("user").filter("age", Operator::Gt, 1u8).count().def(), &defs).unwrap();
        assert!(!q.plan.agg.as_ref().unwrap().root_count_only);
        let q = compile_query(Query::new("user").count().sum("flap").def(), &defs).unwrap();
        assert!(!q.plan.agg.as_ref().unwrap().root_count_only);
    }

    #[test]
    fn test_range_is_dropped_for_aggregates() {
        let defs = defs();
        let q = compile_query(Query::new("user").sum("flap").range(0, 2).def(), &defs).unwrap();
        assert_eq!(q.plan.range, None);
    }

    #[test]
    fn test_rejections() {
        let defs = defs();
        assert!(compile_query(Query::new("nope").def(), &defs).is_err());
        assert!(compile_query(Query::new("user").sum("name").def(), &defs).is_err());
        assert!(compile_query(Query::new("user").locale("fr").def(), &defs).is_err());
        assert!(compile_query(Query::new("user").include(["missing"]).def(), &defs).is_err());
        assert!(compile_query(Query::new("user").sort("bestFriend", Order::Asc).def(), &defs).is_err());
        assert!(compile_query(Query::new("user").include_meta("flap").def(), &defs).is_err());
    }

    #[test]
    fn test_search_default_weights() {
        let defs = defs();
        let q = compile_query(Query::new("article").search("Hello World", Vec::<String>::new()).def(), &defs).unwrap();
        let Some(SearchPlan::Lexical { tokens, fields }) = q.plan.search else { panic!("expected lexical") };
        assert_eq!(tokens, vec!["hello", "world"]);
        assert_eq!(fields[0].1, 3);
    }
}
