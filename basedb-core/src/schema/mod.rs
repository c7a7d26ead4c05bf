//! # Schema
//!
//! A declarative schema (JSON-compatible, persisted as `schema.json`) and its
//! compiled form.
//!
//! ```text
//! Schema ──compile──> TypeDefs
//!   types[]             name → TypeDef { id, main_len, props, separate, block_capacity }
//!     props[]                    PropDef { prop, kind, start, len, default, ... }
//!       edges[] ($...)   ──>  synthesized edge TypeDef "$owner_prop"
//! ```

mod compile;
mod kind;
mod layout;
mod validate;

pub use compile::{compile, CompressionMode, PropDef, RefDef, TypeDef, TypeDefs, AutoTimestamp};
pub use kind::PropKind;
pub use layout::{decode_main, default_main, encode_main};
pub use validate::Validation;

use serde::{Deserialize, Serialize};

use crate::hash::hash64;

/// Highest separate property id; 255 is the `count` pseudo field.
pub const MAX_PROP_ID: u8 = 250;
pub const COUNT_PROP_ID: u8 = 255;

/// Declarative schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub locales: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    /// Assigned by the server when the schema is installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_capacity: Option<u32>,
    #[serde(default)]
    pub props: Vec<PropSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Enum members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u16>,
    /// `"deflate"` (compress long strings) or `"none"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Vector dimension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Reference target type
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Inverse property on the target type
    #[serde(default, rename = "prop", skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    /// Edge properties, names prefixed with `$`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<PropSchema>,
    /// Nested properties of an `object`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<PropSchema>,
    /// Auto timestamp trigger: `"create"` or `"update"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locales.push(locale.into());
        self
    }

    pub fn with_type(mut self, t: TypeSchema) -> Self {
        self.types.push(t);
        self
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeSchema> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Content identity of the schema (xxHash64 of its canonical JSON).
    pub fn hash(&self) -> u64 {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hash64(&json)
    }

    /// Merge `incoming` into `self`: types and props named in `incoming`
    /// replace or extend existing ones, everything else is kept. Declaration
    /// order of existing entries is preserved and new entries are appended.
    pub fn merge(&self, incoming: &Schema) -> Schema {
        let mut out = self.clone();
        for locale in &incoming.locales {
            if !out.locales.contains(locale) {
                out.locales.push(locale.clone());
            }
        }
        for t in &incoming.types {
            match out.types.iter_mut().find(|e| e.name == t.name) {
                Some(existing) => {
                    if t.block_capacity.is_some() {
                        existing.block_capacity = t.block_capacity;
                    }
                    for p in &t.props {
                        match existing.props.iter_mut().find(|e| e.name == p.name) {
                            Some(ep) => *ep = p.clone(),
                            None => existing.props.push(p.clone()),
                        }
                    }
                }
                None => {
                    let mut t = t.clone();
                    t.id = None;
                    out.types.push(t);
                }
            }
        }
        out.assign_ids();
        out
    }

    /// Give every type without an id the next free one.
    pub fn assign_ids(&mut self) {
        let mut next = self.types.iter().filter_map(|t| t.id).max().unwrap_or(0) + 1;
        for t in &mut self.types {
            if t.id.is_none() {
                t.id = Some(next);
                next += 1;
            }
        }
    }
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            block_capacity: None,
            props: Vec::new(),
        }
    }

    pub fn prop(mut self, p: PropSchema) -> Self {
        self.props.push(p);
        self
    }

    pub fn block_capacity(mut self, capacity: u32) -> Self {
        self.block_capacity = Some(capacity);
        self
    }
}

macro_rules! prop_ctor {
    ($($fn_name:ident => $kind:literal),* $(,)?) => {
        $(pub fn $fn_name(name: impl Into<String>) -> Self {
            Self::new(name, $kind)
        })*
    };
}

impl PropSchema {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            default: None,
            min: None,
            max: None,
            step: None,
            values: Vec::new(),
            max_bytes: None,
            compression: None,
            size: None,
            target: None,
            inverse: None,
            edges: Vec::new(),
            props: Vec::new(),
            on: None,
        }
    }

    prop_ctor! {
        boolean => "boolean",
        int8 => "int8",
        uint8 => "uint8",
        int16 => "int16",
        uint16 => "uint16",
        int32 => "int32",
        uint32 => "uint32",
        number => "number",
        timestamp => "timestamp",
        string => "string",
        binary => "binary",
        alias => "alias",
        cardinality => "cardinality",
        text => "text",
        json => "json",
    }

    pub fn enumeration<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        let mut p = Self::new(name, "enum");
        p.values = values.into_iter().map(Into::into).collect();
        p
    }

    pub fn vector(name: impl Into<String>, size: u32) -> Self {
        let mut p = Self::new(name, "vector");
        p.size = Some(size);
        p
    }

    pub fn object(name: impl Into<String>, props: Vec<PropSchema>) -> Self {
        let mut p = Self::new(name, "object");
        p.props = props;
        p
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>, inverse: impl Into<String>) -> Self {
        let mut p = Self::new(name, "reference");
        p.target = Some(target.into());
        p.inverse = Some(inverse.into());
        p
    }

    pub fn references(name: impl Into<String>, target: impl Into<String>, inverse: impl Into<String>) -> Self {
        let mut p = Self::new(name, "references");
        p.target = Some(target.into());
        p.inverse = Some(inverse.into());
        p
    }

    pub fn default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn max_bytes(mut self, max_bytes: u16) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn compression(mut self, mode: impl Into<String>) -> Self {
        self.compression = Some(mode.into());
        self
    }

    pub fn edge(mut self, edge: PropSchema) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn on(mut self, trigger: impl Into<String>) -> Self {
        self.on = Some(trigger.into());
        self
    }
}
