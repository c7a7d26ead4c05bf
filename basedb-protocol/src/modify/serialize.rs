//! Payload → modify instructions.
//!
//! Every function appends to the batch in `ctx`. On error nothing is
//! rolled back here: callers take a [`ModifyMark`](super::ModifyMark) first
//! and roll back so a rejected operation leaves the batch untouched.

use std::collections::BTreeSet;

use bytes::{BufMut, BytesMut};

use basedb_core::codec::LenPatch;
use basedb_core::hash::hash64;
use basedb_core::schema::{default_main, encode_main, AutoTimestamp};
use basedb_core::string::normalize;
use basedb_core::timestamp::{now_ms, resolve};
use basedb_core::{Error, NodeId, PropDef, PropKind, Result, TypeDef, TypeDefs, Value};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Update,
    Edge,
}

fn invalid(def: &TypeDef, path: &str, message: impl Into<String>) -> Error {
    Error::InvalidValue {
        type_name: def.name.clone(),
        path: path.to_string(),
        message: message.into(),
    }
}

fn invalid_ref(def: &TypeDef, path: &str, message: impl Into<String>) -> Error {
    Error::InvalidReference {
        type_name: def.name.clone(),
        path: path.to_string(),
        message: message.into(),
    }
}

/// Fill in the type name of errors raised below the type level.
fn in_type(def: &TypeDef, err: Error) -> Error {
    match err {
        Error::InvalidValue { path, message, .. } => Error::InvalidValue {
            type_name: def.name.clone(),
            path,
            message,
        },
        other => other,
    }
}

/// Append a create; returns the client-local id of the new node.
pub fn serialize_create(ctx: &mut ModifyCtx, type_name: &str, payload: &Payload) -> Result<NodeId> {
    let defs = ctx.defs.clone();
    let def = defs.require(type_name)?;
    let payload = with_timestamps(def, payload, AutoTimestamp::Create);

    ctx.switch_type(def);
    let id = ctx.next_id(def);
    ctx.buf.put_u8(CREATE);
    ctx.buf.put_u32_le(id);
    write_props(ctx, def, &payload, Mode::Create)?;
    ctx.buf.put_u8(NODE_END);
    ctx.mark_dirty(def, id);
    ctx.op_done();
    Ok(id)
}

pub fn serialize_update(ctx: &mut ModifyCtx, type_name: &str, id: NodeId, payload: &Payload) -> Result<()> {
    let defs = ctx.defs.clone();
    let def = defs.require(type_name)?;
    if id == 0 {
        return Err(invalid(def, "id", "node id 0 is reserved"));
    }
    let payload = with_timestamps(def, payload, AutoTimestamp::Update);

    ctx.switch_type(def);
    ctx.buf.put_u8(UPDATE);
    ctx.buf.put_u32_le(id);
    write_props(ctx, def, &payload, Mode::Update)?;
    ctx.buf.put_u8(NODE_END);
    ctx.mark_dirty(def, id);
    ctx.op_done();
    Ok(())
}

pub fn serialize_delete(ctx: &mut ModifyCtx, type_name: &str, id: NodeId) -> Result<()> {
    let defs = ctx.defs.clone();
    let def = defs.require(type_name)?;
    ctx.switch_type(def);
    ctx.buf.put_u8(DELETE);
    ctx.buf.put_u32_le(id);
    ctx.mark_dirty(def, id);
    ctx.op_done();
    Ok(())
}

/// Update the node whose alias matches the payload, or create it.
/// Returns the client-local id used if the node gets created.
pub fn serialize_upsert(ctx: &mut ModifyCtx, type_name: &str, payload: &Payload) -> Result<NodeId> {
    write_alias_op(ctx, type_name, payload, UPSERT)
}

/// Create the node unless one with the payload's alias exists.
pub fn serialize_insert(ctx: &mut ModifyCtx, type_name: &str, payload: &Payload) -> Result<NodeId> {
    write_alias_op(ctx, type_name, payload, INSERT)
}

fn write_alias_op(ctx: &mut ModifyCtx, type_name: &str, payload: &Payload, op: u8) -> Result<NodeId> {
    let defs = ctx.defs.clone();
    let def = defs.require(type_name)?;

    let (alias_prop, alias) = def
        .alias_props()
        .find_map(|p| match payload.get(&p.path) {
            Some(Input::Value(Value::String(s))) if !s.is_empty() => Some((p.prop, normalize(s))),
            _ => None,
        })
        .ok_or_else(|| invalid(def, "", "upsert and insert need a non-empty alias in the payload"))?;
    if alias.len() > u16::MAX as usize {
        return Err(invalid(def, "", "alias too long"));
    }
    // An insert only ever creates. An upsert is written as an update and the
    // backend stamps `on: create` timestamps when the alias is new.
    let (trigger, mode) = match op {
        INSERT => (AutoTimestamp::Create, Mode::Create),
        _ => (AutoTimestamp::Update, Mode::Update),
    };
    let payload = with_timestamps(def, payload, trigger);

    ctx.switch_type(def);
    let id = ctx.next_id(def);
    ctx.buf.put_u8(op);
    ctx.buf.put_u8(alias_prop);
    ctx.buf.put_u16_le(alias.len() as u16);
    ctx.buf.put_slice(alias.as_bytes());
    ctx.buf.put_u32_le(id);
    write_props(ctx, def, &payload, mode)?;
    ctx.buf.put_u8(NODE_END);
    ctx.mark_dirty(def, id);
    ctx.op_done();
    Ok(id)
}

/// Add `now` for auto timestamps the caller did not set.
fn with_timestamps(def: &TypeDef, payload: &Payload, trigger: AutoTimestamp) -> Payload {
    let mut out = payload.clone();
    let mut now = None;
    for p in def.auto_timestamps(trigger) {
        if !out.contains(&p.path) {
            let ts = *now.get_or_insert_with(now_ms);
            out.insert(p.path.clone(), Input::Value(Value::Timestamp(ts)));
        }
    }
    out
}

/// Coerce timestamp expressions and resolve strings on timestamp props.
fn main_value(def: &TypeDef, prop: &PropDef, input: &Input) -> Result<Value> {
    match (prop.kind, input) {
        (PropKind::Timestamp, Input::Timestamp(expr)) | (PropKind::Timestamp, Input::Value(Value::String(expr))) => {
            resolve(expr, now_ms())
                .map(Value::Timestamp)
                .map_err(|e| in_type(def, with_path(e, &prop.path)))
        }
        (_, Input::Value(v)) => Ok(v.clone()),
        (_, other) => Err(invalid(def, &prop.path, format!("{:?} is not valid for {}", other, prop.kind))),
    }
}

fn with_path(err: Error, path: &str) -> Error {
    match err {
        Error::InvalidValue { type_name, message, .. } => Error::InvalidValue {
            type_name,
            path: path.to_string(),
            message,
        },
        other => other,
    }
}

fn write_props(ctx: &mut ModifyCtx, def: &TypeDef, payload: &Payload, mode: Mode) -> Result<()> {
    let mut main_sets: Vec<(&PropDef, Value)> = Vec::new();
    let mut increments: Vec<(&PropDef, f64)> = Vec::new();

    for (path, input) in payload.iter() {
        let prop = def.require_prop(path)?;
        if prop.separate {
            continue;
        }
        match input {
            Input::Increment(delta) => {
                if !prop.kind.is_numeric() {
                    return Err(invalid(def, path, format!("cannot increment {}", prop.kind)));
                }
                if mode == Mode::Create {
                    // Nothing to add to yet: an increment on create sets.
                    main_sets.push((prop, increment_as_value(prop, *delta)));
                } else {
                    increments.push((prop, *delta));
                }
            }
            input => main_sets.push((prop, main_value(def, prop, input)?)),
        }
    }

    write_main(def, &main_sets, mode, &mut ctx.buf)?;

    for (prop, delta) in increments {
        ctx.buf.put_u8(INCREMENT);
        ctx.buf.put_u16_le(prop.start as u16);
        ctx.buf.put_u8(prop.kind as u8);
        ctx.buf.put_f64_le(delta);
    }

    for (path, input) in payload.iter() {
        let prop = def.require_prop(path)?;
        if !prop.separate {
            continue;
        }
        if mode == Mode::Edge && prop.kind.is_reference() {
            return Err(invalid_ref(def, path, "edges cannot hold references"));
        }
        write_separate(ctx, def, prop, input)?;
    }
    Ok(())
}

fn increment_as_value(prop: &PropDef, delta: f64) -> Value {
    match prop.kind {
        PropKind::Number => Value::Number(delta),
        PropKind::Timestamp => Value::Timestamp(delta as i64),
        _ => Value::Int(delta as i64),
    }
}

fn write_main(def: &TypeDef, sets: &[(&PropDef, Value)], mode: Mode, buf: &mut BytesMut) -> Result<()> {
    if sets.is_empty() {
        return Ok(());
    }
    let mut main = default_main(def);
    for (prop, value) in sets {
        if value.is_null() {
            // Reset to the default already present in `main`.
            continue;
        }
        encode_main(prop, value, &mut main).map_err(|e| in_type(def, e))?;
    }

    if mode == Mode::Create {
        buf.put_u8(MAIN);
        buf.put_u16_le(main.len() as u16);
        buf.put_slice(&main);
        return Ok(());
    }

    let slices: BTreeSet<(usize, usize)> = sets.iter().map(|(p, _)| (p.start, p.len)).collect();
    buf.put_u8(PARTIAL_MAIN);
    buf.put_u16_le(slices.len() as u16);
    for (start, len) in &slices {
        buf.put_u16_le(*start as u16);
        buf.put_u16_le(*len as u16);
    }
    for (start, len) in &slices {
        buf.put_slice(&main[*start..*start + *len]);
    }
    Ok(())
}

fn write_separate(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, input: &Input) -> Result<()> {
    let path = prop.path.as_str();
    match (prop.kind, input) {
        (PropKind::Reference, Input::Ref(None)) | (_, Input::Value(Value::Null)) => {
            if prop.kind == PropKind::References {
                return write_references(ctx, def, prop, &RefsInput::Set(Vec::new()));
            }
            ctx.buf.put_u8(DELETE_FIELD);
            ctx.buf.put_u8(prop.prop);
            Ok(())
        }
        (PropKind::Reference, Input::Ref(Some(item))) => write_reference(ctx, def, prop, item),
        (PropKind::Reference, Input::Value(Value::Int(id))) => {
            let id = node_id(def, path, *id)?;
            write_reference(ctx, def, prop, &RefItem::Id(id))
        }
        (PropKind::References, Input::Refs(refs)) => write_references(ctx, def, prop, refs),
        (PropKind::References, Input::Value(Value::List(items))) => {
            let ids = items
                .iter()
                .map(|v| match v {
                    Value::Int(n) => node_id(def, path, *n).map(RefItem::Id),
                    other => Err(invalid_ref(def, path, format!("{} is not a node id", other.kind_name()))),
                })
                .collect::<Result<Vec<_>>>()?;
            write_references(ctx, def, prop, &RefsInput::Set(ids))
        }
        (kind, Input::Ref(_) | Input::Refs(_)) if !kind.is_reference() => {
            Err(invalid(def, path, format!("{} is not a reference", kind)))
        }
        (kind, Input::Ref(_) | Input::Refs(_) | Input::Value(_)) if kind.is_reference() => Err(invalid_ref(
            def,
            path,
            "expected a node id, a tmp id or an id with edge properties",
        )),
        (_, Input::Increment(_)) | (_, Input::Timestamp(_)) => {
            Err(invalid(def, path, format!("not supported on {}", prop.kind)))
        }
        (_, Input::Value(value)) => {
            prop.check(value).map_err(|m| invalid(def, path, m))?;
            write_value(ctx, def, prop, value)
        }
        _ => Err(invalid(def, path, "unsupported input")),
    }
}

fn node_id(def: &TypeDef, path: &str, n: i64) -> Result<NodeId> {
    if n <= 0 || n > u32::MAX as i64 {
        return Err(invalid_ref(def, path, format!("{} is not a node id", n)));
    }
    Ok(n as NodeId)
}

fn write_value(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, value: &Value) -> Result<()> {
    let path = prop.path.as_str();
    match (prop.kind, value) {
        (PropKind::String | PropKind::Alias, Value::String(s)) => {
            let encoded = ctx.codec.encode(s, prop.allows_compression())?;
            put_field(&mut ctx.buf, prop.prop, &encoded);
        }
        (PropKind::Binary, Value::Binary(b)) => put_field(&mut ctx.buf, prop.prop, b),
        (PropKind::Vector, Value::Vector(v)) => {
            let mut bytes = Vec::with_capacity(v.len() * 4);
            for x in v {
                bytes.put_f32_le(*x);
            }
            put_field(&mut ctx.buf, prop.prop, &bytes);
        }
        (PropKind::Json, v) => {
            let json = match v {
                Value::Json(j) => serde_json::to_string(j)?,
                other => serde_json::to_string(other)?,
            };
            let encoded = ctx.codec.encode(&json, true)?;
            put_field(&mut ctx.buf, prop.prop, &encoded);
        }
        (PropKind::Text, Value::String(s)) => {
            let locale = ctx
                .locale
                .clone()
                .or_else(|| def.locales.first().cloned())
                .ok_or_else(|| invalid(def, path, "no locale for text value"))?;
            put_text(ctx, def, prop, &locale, s)?;
        }
        (PropKind::Text, Value::Text(map)) => {
            for (locale, s) in map {
                put_text(ctx, def, prop, locale, s)?;
            }
        }
        (PropKind::Cardinality, v) => {
            let items: Vec<&Value> = match v {
                Value::List(items) => items.iter().collect(),
                single => vec![single],
            };
            let mut hashes = BTreeSet::new();
            for item in items {
                hashes.insert(cardinality_hash(def, path, item)?);
            }
            ctx.buf.put_u8(CARDINALITY);
            ctx.buf.put_u8(prop.prop);
            ctx.buf.put_u32_le(hashes.len() as u32);
            for h in hashes {
                ctx.buf.put_u64_le(h);
            }
        }
        (kind, other) => {
            return Err(invalid(def, path, format!("expected {}, got {}", kind, other.kind_name())));
        }
    }
    Ok(())
}

/// 64-bit hash of a cardinality item; 8-byte binaries are taken as
/// pre-hashed.
fn cardinality_hash(def: &TypeDef, path: &str, item: &Value) -> Result<u64> {
    match item {
        Value::String(s) => Ok(hash64(s.as_bytes())),
        Value::Binary(b) if b.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(u64::from_le_bytes(raw))
        }
        other => Err(invalid(
            def,
            path,
            format!("cardinality item must be a string or 8-byte hash, got {}", other.kind_name()),
        )),
    }
}

fn put_field(buf: &mut BytesMut, prop: u8, data: &[u8]) {
    buf.put_u8(FIELD);
    buf.put_u8(prop);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn put_text(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, locale: &str, s: &str) -> Result<()> {
    if !def.locales.iter().any(|l| l == locale) || locale.len() > u8::MAX as usize {
        return Err(invalid(def, &prop.path, format!("unknown locale {:?}", locale)));
    }
    let encoded = ctx.codec.encode(s, prop.allows_compression())?;
    ctx.buf.put_u8(TEXT);
    ctx.buf.put_u8(prop.prop);
    ctx.buf.put_u8(locale.len() as u8);
    ctx.buf.put_slice(locale.as_bytes());
    ctx.buf.put_u32_le(encoded.len() as u32);
    ctx.buf.put_slice(&encoded);
    Ok(())
}

fn target_type<'a>(defs: &'a TypeDefs, def: &TypeDef, prop: &PropDef) -> Result<&'a TypeDef> {
    let r = prop
        .reference
        .as_ref()
        .ok_or_else(|| invalid_ref(def, &prop.path, "unresolved reference"))?;
    defs.require_id(r.target_type_id)
}

/// `(is_tmp, id)` of a reference target, checking tmp ids belong to this batch.
fn resolve_target(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, target: RefTarget) -> Result<(bool, NodeId)> {
    let defs = ctx.defs.clone();
    let target_def = target_type(&defs, def, prop)?;
    match target {
        RefTarget::Id(0) => Err(invalid_ref(def, &prop.path, "node id 0 is reserved")),
        RefTarget::Id(id) => {
            // The inverse side changes too.
            ctx.mark_dirty(target_def, id);
            Ok((false, id))
        }
        RefTarget::Tmp(tmp) => {
            if tmp.batch != ctx.batch {
                return Err(invalid_ref(
                    def,
                    &prop.path,
                    "tmp id belongs to an already flushed batch",
                ));
            }
            if tmp.type_id != target_def.id {
                return Err(invalid_ref(
                    def,
                    &prop.path,
                    format!("tmp id is a {} node, expected {}", tmp.type_id, target_def.name),
                ));
            }
            Ok((true, tmp.local))
        }
    }
}

fn write_reference(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, item: &RefItem) -> Result<()> {
    let (is_tmp, id) = resolve_target(ctx, def, prop, item.target())?;
    ctx.buf.put_u8(REFERENCE);
    ctx.buf.put_u8(prop.prop);
    let len_pos = ctx.buf.reserve_len();
    ctx.buf.put_u8(is_tmp as u8);
    ctx.buf.put_u32_le(id);
    let edges = match item {
        RefItem::WithEdges { edges, .. } | RefItem::WithIndex { edges, .. } => Some(edges),
        _ => None,
    };
    write_edges(ctx, def, prop, edges)?;
    ctx.buf.patch_len(len_pos);
    Ok(())
}

/// `edge_len:u32 blocks`, back-patched so a reader can skip it.
fn write_edges(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, edges: Option<&Payload>) -> Result<()> {
    let pos = ctx.buf.reserve_len();
    if let Some(edges) = edges.filter(|e| !e.is_empty()) {
        let defs = ctx.defs.clone();
        let edge_def = defs
            .edge_def(prop)
            .ok_or_else(|| invalid_ref(def, &prop.path, "relation has no edge properties"))?;
        for (path, _) in edges.iter() {
            if !path.starts_with('$') {
                return Err(invalid_ref(def, &prop.path, format!("edge property {:?} must start with $", path)));
            }
        }
        write_props(ctx, edge_def, edges, Mode::Edge)?;
    }
    ctx.buf.patch_len(pos);
    Ok(())
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Shape {
    Ids,
    Tmp,
    Meta,
}

fn shape(item: &RefItem) -> Shape {
    match item {
        RefItem::Id(_) => Shape::Ids,
        RefItem::Tmp(_) => Shape::Tmp,
        RefItem::WithEdges { .. } | RefItem::WithIndex { .. } => Shape::Meta,
    }
}

fn write_references(ctx: &mut ModifyCtx, def: &TypeDef, prop: &PropDef, refs: &RefsInput) -> Result<()> {
    ctx.buf.put_u8(REFERENCES);
    ctx.buf.put_u8(prop.prop);
    let len_pos = ctx.buf.reserve_len();

    let add = match refs {
        RefsInput::Set(items) => {
            put_ref_op(&mut ctx.buf, REF_CLEAR, |_| {});
            items
        }
        RefsInput::Ops { add, delete } => {
            if !delete.is_empty() {
                let defs = ctx.defs.clone();
                let target_def = target_type(&defs, def, prop)?;
                for id in delete {
                    ctx.mark_dirty(target_def, *id);
                }
                put_ref_op(&mut ctx.buf, REF_DEL_IDS, |b| {
                    b.put_u32_le(delete.len() as u32);
                    for id in delete {
                        b.put_u32_le(*id);
                    }
                });
            }
            add
        }
    };

    // A new block starts whenever the item shape changes.
    let mut i = 0;
    while i < add.len() {
        let run_shape = shape(&add[i]);
        let end = add[i..]
            .iter()
            .position(|item| shape(item) != run_shape)
            .map(|n| i + n)
            .unwrap_or(add.len());
        let run = &add[i..end];

        let op = match run_shape {
            Shape::Ids => REF_IDS,
            Shape::Tmp => REF_TMP_IDS,
            Shape::Meta => REF_IDS_WITH_META,
        };
        ctx.buf.put_u8(op);
        let op_pos = ctx.buf.reserve_len();
        ctx.buf.put_u32_le(run.len() as u32);
        for item in run {
            let (is_tmp, id) = resolve_target(ctx, def, prop, item.target())?;
            match item {
                RefItem::Id(_) | RefItem::Tmp(_) => ctx.buf.put_u32_le(id),
                RefItem::WithEdges { edges, .. } => {
                    ctx.buf.put_u32_le(id);
                    ctx.buf.put_u8(is_tmp as u8);
                    ctx.buf.put_u8(0);
                    write_edges(ctx, def, prop, Some(edges))?;
                }
                RefItem::WithIndex { index, edges, .. } => {
                    ctx.buf.put_u32_le(id);
                    ctx.buf.put_u8(is_tmp as u8);
                    ctx.buf.put_u8(1);
                    ctx.buf.put_u32_le(*index);
                    write_edges(ctx, def, prop, Some(edges))?;
                }
            }
        }
        ctx.buf.patch_len(op_pos);
        i = end;
    }

    ctx.buf.patch_len(len_pos);
    Ok(())
}

fn put_ref_op(buf: &mut BytesMut, op: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(op);
    let pos = buf.reserve_len();
    body(buf);
    buf.patch_len(pos);
}
