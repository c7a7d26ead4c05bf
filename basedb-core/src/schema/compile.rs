//! Schema → layout compilation.
//!
//! Compilation is a pure function of the declarative [`Schema`] and the
//! [`SchemaConfig`]: compiling the same input twice yields the same main
//! lengths, prop ids and edge type names. Structural problems are collected
//! and returned together as [`Error::Schema`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::kind::PropKind;
use super::validate::Validation;
use super::{PropSchema, Schema, TypeSchema, MAX_PROP_ID};
use crate::config::SchemaConfig;
use crate::error::{Error, Result, SchemaError};
use crate::value::{Row, Value};

/// Edge types live in their own id range so user type ids stay dense.
const EDGE_TYPE_ID_BASE: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMode {
    None,
    Deflate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoTimestamp {
    Create,
    Update,
}

/// Compiled relation descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RefDef {
    pub target: String,
    pub target_type_id: u16,
    /// Name of the counterpart property on the target type.
    pub inverse_prop: String,
    pub inverse_prop_id: u8,
    /// Synthesized `$owner_prop` type holding edge properties.
    pub edge_type: Option<String>,
    pub edge_type_id: Option<u16>,
}

/// Compiled property descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PropDef {
    /// Separate field id (1..=250); `0` for main fields.
    pub prop: u8,
    pub kind: PropKind,
    /// Dotted path for nested object members.
    pub path: String,
    pub separate: bool,
    /// Offset in the main record.
    pub start: usize,
    pub len: usize,
    pub enum_values: Vec<String>,
    pub default: Option<Value>,
    pub validation: Validation,
    pub compression: CompressionMode,
    /// String packed into a fixed main slot.
    pub fixed_string: bool,
    pub reference: Option<RefDef>,
    pub on: Option<AutoTimestamp>,
}

impl PropDef {
    /// Default substituted when the field is absent from a node.
    pub fn empty_value(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match self.kind {
            PropKind::String | PropKind::Alias => Value::String(String::new()),
            PropKind::Binary => Value::Binary(Vec::new()),
            PropKind::Text => Value::Text(BTreeMap::new()),
            PropKind::References => Value::List(Vec::new()),
            PropKind::Cardinality => Value::Int(0),
            PropKind::Boolean => Value::Bool(false),
            PropKind::Number => Value::Number(0.0),
            PropKind::Timestamp => Value::Timestamp(0),
            k if k.is_numeric() => Value::Int(0),
            _ => Value::Null,
        }
    }

    pub fn enum_index(&self, member: &str) -> Option<u8> {
        self.enum_values
            .iter()
            .position(|v| v == member)
            .map(|i| (i + 1) as u8)
    }

    pub fn allows_compression(&self) -> bool {
        self.compression == CompressionMode::Deflate
    }
}

/// Compiled type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub id: u16,
    pub name: String,
    pub main_len: usize,
    pub block_capacity: u32,
    /// Leaf properties in declaration order.
    pub props: Vec<PropDef>,
    pub locales: Vec<String>,
    pub is_edge: bool,
    paths: HashMap<String, usize>,
    prop_ids: HashMap<u8, usize>,
}

impl TypeDef {
    pub fn prop(&self, path: &str) -> Option<&PropDef> {
        self.paths.get(path).map(|&i| &self.props[i])
    }

    pub fn require_prop(&self, path: &str) -> Result<&PropDef> {
        self.prop(path).ok_or_else(|| Error::PropertyNotFound {
            type_name: self.name.clone(),
            path: path.to_string(),
        })
    }

    pub fn by_prop_id(&self, prop: u8) -> Option<&PropDef> {
        self.prop_ids.get(&prop).map(|&i| &self.props[i])
    }

    pub fn main_props(&self) -> impl Iterator<Item = &PropDef> {
        self.props.iter().filter(|p| !p.separate)
    }

    pub fn separate_props(&self) -> impl Iterator<Item = &PropDef> {
        self.props.iter().filter(|p| p.separate)
    }

    pub fn reference_props(&self) -> impl Iterator<Item = &PropDef> {
        self.props.iter().filter(|p| p.kind.is_reference())
    }

    pub fn alias_props(&self) -> impl Iterator<Item = &PropDef> {
        self.props.iter().filter(|p| p.kind == PropKind::Alias)
    }

    pub fn auto_timestamps(&self, trigger: AutoTimestamp) -> impl Iterator<Item = &PropDef> {
        self.props.iter().filter(move |p| match (p.on, trigger) {
            (Some(AutoTimestamp::Update), _) => true,
            (Some(AutoTimestamp::Create), AutoTimestamp::Create) => true,
            _ => false,
        })
    }

    /// Every path a query `include("*")` expands to: scalars and
    /// non-reference separate fields.
    pub fn scalar_paths(&self) -> Vec<String> {
        self.props
            .iter()
            .filter(|p| !p.kind.is_reference())
            .map(|p| p.path.clone())
            .collect()
    }

    /// Build a row holding every property at its default.
    pub fn default_row(&self) -> Row {
        let mut row = Row::new();
        for p in &self.props {
            crate::value::set_path(&mut row, &p.path, p.empty_value());
        }
        row
    }
}

/// Compiled schema.
#[derive(Debug, Clone)]
pub struct TypeDefs {
    /// The declarative schema with ids assigned.
    pub schema: Schema,
    pub hash: u64,
    pub locales: Vec<String>,
    types: BTreeMap<u16, TypeDef>,
    names: HashMap<String, u16>,
}

impl TypeDefs {
    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.names.get(name).and_then(|id| self.types.get(id))
    }

    pub fn by_id(&self, id: u16) -> Option<&TypeDef> {
        self.types.get(&id)
    }

    pub fn require(&self, name: &str) -> Result<&TypeDef> {
        self.get(name).ok_or_else(|| Error::type_not_found(name))
    }

    pub fn require_id(&self, id: u16) -> Result<&TypeDef> {
        self.by_id(id).ok_or_else(|| Error::type_not_found(id))
    }

    /// User types, edge types excluded.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values().filter(|t| !t.is_edge)
    }

    pub fn all(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Edge type of a relation, the same from either side.
    pub fn edge_def(&self, prop: &PropDef) -> Option<&TypeDef> {
        prop.reference
            .as_ref()
            .and_then(|r| r.edge_type_id)
            .and_then(|id| self.by_id(id))
    }

    pub fn empty() -> Self {
        Self {
            schema: Schema::default(),
            hash: Schema::default().hash(),
            locales: Vec::new(),
            types: BTreeMap::new(),
            names: HashMap::new(),
        }
    }
}

/// Compile a declarative schema into per-type layouts.
pub fn compile(schema: &Schema, config: &SchemaConfig) -> Result<TypeDefs> {
    let mut schema = schema.clone();
    schema.assign_ids();

    let mut errors = Vec::new();
    let mut expanded = schema.clone();
    check_names(&expanded, &mut errors);
    synthesize_inverses(&mut expanded, &mut errors);

    let edges = collect_edge_types(&expanded, &mut errors);

    let mut types = BTreeMap::new();
    let mut names = HashMap::new();
    for t in expanded.types.iter().chain(edges.iter().map(|(_, t)| t)) {
        let Some(id) = t.id else { continue };
        let is_edge = t.name.starts_with('$');
        let def = compile_type(t, id, is_edge, &expanded.locales, config, &mut errors);
        names.insert(def.name.clone(), id);
        types.insert(id, def);
    }

    link_references(&expanded, &edges, &mut types, &names);

    if !errors.is_empty() {
        return Err(Error::Schema { errors });
    }

    debug!(types = types.len(), hash = schema.hash(), "compiled schema");
    Ok(TypeDefs {
        hash: schema.hash(),
        locales: schema.locales.clone(),
        schema,
        types,
        names,
    })
}

fn check_names(schema: &Schema, errors: &mut Vec<SchemaError>) {
    let mut seen = std::collections::HashSet::new();
    for t in &schema.types {
        if t.name.is_empty() || t.name.starts_with('$') || t.name.contains('.') || !seen.insert(&t.name) {
            errors.push(SchemaError::InvalidName { name: t.name.clone() });
        }
        for p in &t.props {
            if p.name.is_empty() || p.name.starts_with('$') || p.name.contains('.') {
                errors.push(SchemaError::InvalidName {
                    name: format!("{}.{}", t.name, p.name),
                });
            }
        }
    }
}

/// Add the missing counterpart of every reference to its target type.
fn synthesize_inverses(schema: &mut Schema, errors: &mut Vec<SchemaError>) {
    let mut additions: Vec<(String, PropSchema, String)> = Vec::new();

    for t in &schema.types {
        for p in &t.props {
            let path = format!("{}.{}", t.name, p.name);
            let Some(kind) = PropKind::from_name(&p.kind) else { continue };
            if !kind.is_reference() {
                if p.target.is_some() {
                    errors.push(SchemaError::MixedReferenceTypes { path });
                }
                continue;
            }
            let (Some(target), Some(inverse)) = (&p.target, &p.inverse) else {
                errors.push(SchemaError::InverseMismatch {
                    path,
                    message: "reference needs both ref and prop".to_string(),
                });
                continue;
            };
            let Some(target_type) = schema.get_type(target) else {
                errors.push(SchemaError::UnknownReferenceTarget {
                    path,
                    target: target.clone(),
                });
                continue;
            };
            match target_type.props.iter().find(|q| &q.name == inverse) {
                Some(counter) => {
                    let counter_kind = PropKind::from_name(&counter.kind);
                    if !counter_kind.map(|k| k.is_reference()).unwrap_or(false) {
                        errors.push(SchemaError::MixedReferenceTypes {
                            path: format!("{}.{}", target, inverse),
                        });
                    } else if counter.target.as_deref() != Some(t.name.as_str())
                        || counter.inverse.as_deref() != Some(p.name.as_str())
                    {
                        errors.push(SchemaError::InverseMismatch {
                            path,
                            message: format!(
                                "{}.{} does not point back to {}.{}",
                                target, inverse, t.name, p.name
                            ),
                        });
                    } else if !p.edges.is_empty() && !counter.edges.is_empty() {
                        if t.name < *target || (t.name == *target && p.name < *inverse) {
                            errors.push(SchemaError::EdgesOnBothSides { path });
                        }
                    }
                }
                None => {
                    if additions.iter().any(|(ty, q, _)| ty == target && &q.name == inverse) {
                        errors.push(SchemaError::DuplicateInverse {
                            path,
                            inverse: format!("{}.{}", target, inverse),
                        });
                        continue;
                    }
                    let mut counter = PropSchema::references(inverse.clone(), t.name.clone(), p.name.clone());
                    counter.edges = Vec::new();
                    additions.push((target.clone(), counter, path));
                }
            }
        }
    }

    for (target, prop, _) in additions {
        if let Some(t) = schema.types.iter_mut().find(|t| t.name == target) {
            t.props.push(prop);
        }
    }
}

/// Synthesize one type per relation carrying edge properties.
fn collect_edge_types(schema: &Schema, errors: &mut Vec<SchemaError>) -> Vec<((String, String), TypeSchema)> {
    let mut out = Vec::new();
    let mut next = EDGE_TYPE_ID_BASE;
    for t in &schema.types {
        for p in &t.props {
            if p.edges.is_empty() {
                continue;
            }
            let path = format!("{}.{}", t.name, p.name);
            for e in &p.edges {
                if !e.name.starts_with('$') || e.name.len() < 2 {
                    errors.push(SchemaError::InvalidEdgeName {
                        path: path.clone(),
                        name: e.name.clone(),
                    });
                }
                if matches!(PropKind::from_name(&e.kind), Some(k) if k.is_reference()) {
                    errors.push(SchemaError::InvalidType {
                        path: format!("{}.{}", path, e.name),
                        kind: e.kind.clone(),
                    });
                }
            }
            let mut edge = TypeSchema::new(edge_type_name(&t.name, &p.name));
            edge.id = Some(next);
            edge.props = p.edges.clone();
            next += 1;
            out.push(((t.name.clone(), p.name.clone()), edge));
        }
    }
    out
}

pub(crate) fn edge_type_name(owner: &str, prop: &str) -> String {
    format!("${}_{}", owner, prop)
}

/// Resolve the edge type of a relation, looking at both sides.
fn edge_of<'a>(
    edges: &'a [((String, String), TypeSchema)],
    owner: &str,
    prop: &PropSchema,
) -> Option<&'a TypeSchema> {
    edges
        .iter()
        .find(|((o, p), _)| o == owner && p == &prop.name)
        .or_else(|| {
            let (target, inverse) = (prop.target.as_deref()?, prop.inverse.as_deref()?);
            edges.iter().find(|((o, p), _)| o == target && p == inverse)
        })
        .map(|(_, t)| t)
}

struct LayoutState {
    next_prop: u8,
    offset: usize,
    props: Vec<PropDef>,
    overflow: bool,
}

fn compile_type(
    t: &TypeSchema,
    id: u16,
    is_edge: bool,
    locales: &[String],
    config: &SchemaConfig,
    errors: &mut Vec<SchemaError>,
) -> TypeDef {
    let mut state = LayoutState {
        next_prop: 1,
        offset: 0,
        props: Vec::new(),
        overflow: false,
    };
    for p in &t.props {
        compile_prop(t, p, "", is_edge, locales, config, &mut state, errors);
    }
    if state.overflow {
        errors.push(SchemaError::TooManyProps {
            type_name: t.name.clone(),
        });
    }
    // Main offsets and lengths travel as u16.
    if state.offset > u16::MAX as usize {
        errors.push(SchemaError::MainTooWide {
            type_name: t.name.clone(),
            len: state.offset,
        });
    }

    let paths = state
        .props
        .iter()
        .enumerate()
        .map(|(i, p)| (p.path.clone(), i))
        .collect();
    let prop_ids = state
        .props
        .iter()
        .enumerate()
        .filter(|(_, p)| p.separate)
        .map(|(i, p)| (p.prop, i))
        .collect();

    TypeDef {
        id,
        name: t.name.clone(),
        main_len: state.offset,
        block_capacity: t.block_capacity.unwrap_or(config.default_block_capacity).max(1),
        props: state.props,
        locales: locales.to_vec(),
        is_edge,
        paths,
        prop_ids,
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_prop(
    t: &TypeSchema,
    p: &PropSchema,
    prefix: &str,
    is_edge: bool,
    locales: &[String],
    config: &SchemaConfig,
    state: &mut LayoutState,
    errors: &mut Vec<SchemaError>,
) {
    let path = if prefix.is_empty() {
        p.name.clone()
    } else {
        format!("{}.{}", prefix, p.name)
    };
    let full = format!("{}.{}", t.name, path);

    let Some(kind) = PropKind::from_name(&p.kind) else {
        errors.push(SchemaError::InvalidType {
            path: full,
            kind: p.kind.clone(),
        });
        return;
    };

    if kind == PropKind::Object {
        for nested in &p.props {
            compile_prop(t, nested, &path, is_edge, locales, config, state, errors);
        }
        return;
    }
    if kind.is_reference() && (!prefix.is_empty() || is_edge) {
        errors.push(SchemaError::InvalidType {
            path: full,
            kind: "nested reference".to_string(),
        });
        return;
    }
    if kind == PropKind::Text && locales.is_empty() {
        errors.push(SchemaError::TextWithoutLocales { path: full.clone() });
    }
    if kind == PropKind::Enum && p.values.is_empty() {
        errors.push(SchemaError::InvalidType {
            path: full.clone(),
            kind: "enum without values".to_string(),
        });
    }

    let on = match p.on.as_deref() {
        None => None,
        Some(trigger) => {
            let parsed = match trigger {
                "create" => Some(AutoTimestamp::Create),
                "update" => Some(AutoTimestamp::Update),
                _ => None,
            };
            if parsed.is_none() || kind != PropKind::Timestamp {
                errors.push(SchemaError::InvalidType {
                    path: full.clone(),
                    kind: format!("on: {}", trigger),
                });
            }
            parsed
        }
    };

    let compression = match p.compression.as_deref() {
        None | Some("deflate") if matches!(kind, PropKind::String | PropKind::Text) => CompressionMode::Deflate,
        _ => CompressionMode::None,
    };

    let fixed_string = kind == PropKind::String
        && compression == CompressionMode::None
        && matches!(p.max_bytes, Some(n) if n > 0 && n <= config.fixed_string_max);

    let mut def = PropDef {
        prop: 0,
        kind,
        path: path.clone(),
        separate: false,
        start: 0,
        len: 0,
        enum_values: p.values.clone(),
        default: None,
        validation: Validation {
            min: p.min,
            max: p.max,
            step: p.step,
            max_bytes: p.max_bytes.map(|n| n as usize),
            size: p.size.map(|n| n as usize),
        },
        compression,
        fixed_string,
        reference: None,
        on,
    };

    let main_size = if fixed_string {
        p.max_bytes.map(|n| n as usize + 1).unwrap_or(0)
    } else {
        kind.main_size()
    };
    if main_size > 0 {
        def.start = state.offset;
        def.len = main_size;
        state.offset += main_size;
    } else {
        def.separate = true;
        if state.next_prop > MAX_PROP_ID {
            state.overflow = true;
        } else {
            def.prop = state.next_prop;
            state.next_prop = state.next_prop.saturating_add(1);
        }
    }

    if let Some(raw) = &p.default {
        match default_value(&def, raw, locales) {
            Ok(v) => def.default = Some(v),
            Err(message) => errors.push(SchemaError::InvalidDefault { path: full, message }),
        }
    }

    state.props.push(def);
}

fn link_references(
    schema: &Schema,
    edges: &[((String, String), TypeSchema)],
    types: &mut BTreeMap<u16, TypeDef>,
    names: &HashMap<String, u16>,
) {
    let mut links = Vec::new();
    for t in &schema.types {
        let Some(owner_id) = t.id else { continue };
        for p in &t.props {
            let (Some(target), Some(inverse)) = (&p.target, &p.inverse) else { continue };
            let Some(target_def) = names.get(target).and_then(|id| types.get(id)) else { continue };
            let edge = edge_of(edges, &t.name, p);
            links.push((
                owner_id,
                p.name.clone(),
                RefDef {
                    target: target.clone(),
                    target_type_id: target_def.id,
                    inverse_prop: inverse.clone(),
                    inverse_prop_id: target_def.prop(inverse).map(|q| q.prop).unwrap_or(0),
                    edge_type: edge.map(|e| e.name.clone()),
                    edge_type_id: edge.and_then(|e| e.id),
                },
            ));
        }
    }
    for (owner_id, name, link) in links {
        if let Some(owner) = types.get_mut(&owner_id) {
            if let Some(&i) = owner.paths.get(&name) {
                owner.props[i].reference = Some(link);
            }
        }
    }
}

fn default_value(def: &PropDef, raw: &serde_json::Value, locales: &[String]) -> std::result::Result<Value, String> {
    let value = match (def.kind, raw) {
        (PropKind::Boolean, serde_json::Value::Bool(b)) => Value::Bool(*b),
        (PropKind::Number, serde_json::Value::Number(n)) => Value::Number(n.as_f64().unwrap_or(0.0)),
        (PropKind::Timestamp, serde_json::Value::Number(n)) => Value::Timestamp(n.as_i64().ok_or("timestamp must be an integer")?),
        (PropKind::Timestamp, serde_json::Value::String(s)) => {
            Value::Timestamp(crate::timestamp::resolve(s, 0).map_err(|e| e.to_string())?)
        }
        (k, serde_json::Value::Number(n)) if k.int_bounds().is_some() => {
            Value::Int(n.as_i64().ok_or("expected an integer")?)
        }
        (PropKind::Enum | PropKind::String | PropKind::Alias, serde_json::Value::String(s)) => Value::String(s.clone()),
        (PropKind::Text, serde_json::Value::String(s)) => {
            Value::Text(locales.iter().map(|l| (l.clone(), s.clone())).collect())
        }
        (PropKind::Json, v) => Value::Json(v.clone()),
        (kind, v) => return Err(format!("{} is not a valid {} default", v, kind)),
    };
    def.check(&value)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropSchema as P, TypeSchema as T};

    fn config() -> SchemaConfig {
        SchemaConfig::default()
    }

    #[test]
    fn test_main_layout_and_prop_ids() {
        let schema = Schema::new().with_type(
            T::new("user")
                .prop(P::string("name"))
                .prop(P::uint32("flap"))
                .prop(P::boolean("active"))
                .prop(P::object("address", vec![P::string("city"), P::int16("floor")]))
                .prop(P::number("score")),
        );
        let defs = compile(&schema, &config()).unwrap();
        let user = defs.get("user").unwrap();
        assert_eq!(user.id, 1);
        assert_eq!(user.main_len, 4 + 1 + 2 + 8);
        assert_eq!(user.prop("flap").unwrap().start, 0);
        assert_eq!(user.prop("active").unwrap().start, 4);
        assert_eq!(user.prop("address.floor").unwrap().start, 5);
        assert_eq!(user.prop("score").unwrap().start, 7);
        assert_eq!(user.prop("name").unwrap().prop, 1);
        assert_eq!(user.prop("address.city").unwrap().prop, 2);
        assert_eq!(user.prop("flap").unwrap().prop, 0);
        assert_eq!(user.by_prop_id(2).unwrap().path, "address.city");
        assert_eq!(user.block_capacity, 100_000);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let schema = Schema::new()
            .with_type(T::new("user").prop(P::string("name")))
            .with_type(T::new("article").prop(
                P::references("contributors", "user", "articles").edge(P::uint32("$rating")),
            ));
        let a = compile(&schema, &config()).unwrap();
        let b = compile(&schema, &config()).unwrap();
        assert_eq!(a.hash, b.hash);
        for t in a.all() {
            assert_eq!(Some(t), b.by_id(t.id));
        }
        assert!(a.get("$article_contributors").is_some());
    }

    #[test]
    fn test_inverse_is_synthesized_with_edges() {
        let schema = Schema::new()
            .with_type(T::new("user").prop(P::string("name")))
            .with_type(T::new("article").prop(
                P::references("contributors", "user", "articles").edge(P::uint32("$rating")),
            ));
        let defs = compile(&schema, &config()).unwrap();
        let user = defs.get("user").unwrap();
        let article = defs.get("article").unwrap();
        let articles = user.prop("articles").unwrap();
        let contributors = article.prop("contributors").unwrap();
        assert_eq!(articles.kind, PropKind::References);

        let r = contributors.reference.as_ref().unwrap();
        assert_eq!(r.target_type_id, user.id);
        assert_eq!(r.inverse_prop_id, articles.prop);
        let back = articles.reference.as_ref().unwrap();
        assert_eq!(back.inverse_prop_id, contributors.prop);
        assert_eq!(r.edge_type_id, back.edge_type_id);

        let edge = defs.edge_def(contributors).unwrap();
        assert!(edge.is_edge);
        assert_eq!(edge.prop("$rating").unwrap().len, 4);
        assert_eq!(defs.types().count(), 2);
    }

    #[test]
    fn test_errors_are_collected() {
        let schema = Schema::new().with_type(
            T::new("thing")
                .prop(P::new("weird", "float128"))
                .prop(P::enumeration("color", ["red", "blue"]).default(serde_json::json!("green")))
                .prop(P::uint8("level").min(1.0).max(10.0).default(serde_json::json!(11)))
                .prop(P::number("ratio").step(0.5).default(serde_json::json!(0.3)))
                .prop(P::text("body"))
                .prop(P::reference("owner", "nobody", "things")),
        );
        let Err(Error::Schema { errors }) = compile(&schema, &config()) else {
            panic!("expected schema errors");
        };
        assert_eq!(errors.len(), 6);
        assert!(matches!(errors[0], SchemaError::UnknownReferenceTarget { .. }));
        assert!(errors.iter().any(|e| matches!(e, SchemaError::InvalidType { kind, .. } if kind == "float128")));
        assert!(errors.iter().any(|e| matches!(e, SchemaError::TextWithoutLocales { .. })));
        assert_eq!(
            errors.iter().filter(|e| matches!(e, SchemaError::InvalidDefault { .. })).count(),
            3
        );
    }

    #[test]
    fn test_main_record_must_fit_u16_offsets() {
        let wide = (0..8_192).fold(T::new("wide"), |t, i| t.prop(P::number(format!("n{}", i))));
        let Err(Error::Schema { errors }) = compile(&Schema::new().with_type(wide), &config()) else {
            panic!("expected schema errors");
        };
        assert!(matches!(&errors[..], [SchemaError::MainTooWide { len: 65_536, .. }]));

        let fits = (0..8_191).fold(T::new("wide"), |t, i| t.prop(P::number(format!("n{}", i))));
        assert_eq!(compile(&Schema::new().with_type(fits), &config()).unwrap().get("wide").unwrap().main_len, 65_528);
    }

    #[test]
    fn test_duplicate_auto_inverse() {
        let schema = Schema::new()
            .with_type(T::new("user"))
            .with_type(
                T::new("article")
                    .prop(P::reference("author", "user", "written"))
                    .prop(P::reference("editor", "user", "written")),
            );
        let Err(Error::Schema { errors }) = compile(&schema, &config()) else {
            panic!("expected schema errors");
        };
        assert!(matches!(errors[0], SchemaError::DuplicateInverse { .. }));
    }

    #[test]
    fn test_edges_on_both_sides_rejected() {
        let schema = Schema::new()
            .with_type(T::new("user").prop(
                P::references("articles", "article", "contributors").edge(P::uint8("$a")),
            ))
            .with_type(T::new("article").prop(
                P::references("contributors", "user", "articles").edge(P::uint8("$b")),
            ));
        let Err(Error::Schema { errors }) = compile(&schema, &config()) else {
            panic!("expected schema errors");
        };
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SchemaError::EdgesOnBothSides { .. }));
    }

    #[test]
    fn test_fixed_string_goes_to_main() {
        let schema = Schema::new().with_type(
            T::new("country")
                .prop(P::string("code").max_bytes(2).compression("none"))
                .prop(P::string("name")),
        );
        let defs = compile(&schema, &config()).unwrap();
        let country = defs.get("country").unwrap();
        let code = country.prop("code").unwrap();
        assert!(code.fixed_string);
        assert!(!code.separate);
        assert_eq!(code.len, 3);
        assert_eq!(country.prop("name").unwrap().prop, 1);
    }
}
