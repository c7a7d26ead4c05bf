//! QueryPlan ⇄ bytes.
//!
//! ```text
//! batch   := count:u16 (len:u32 query_id:u32 body)*
//! body    := (section:u8 len:u32 payload)*      SCHEMA last, top level only
//! ```
//!
//! `query_id` is the CRC32 of the body. Unknown sections are skipped.

use bytes::{BufMut, BytesMut};

use basedb_core::codec::{ByteReader, LenPatch};
use basedb_core::hash::crc32;
use basedb_core::timestamp::CalendarInterval;
use basedb_core::{Error, PropKind, Result, Value};

use super::aggregate::AggKind;
use super::filter::Operator;
use super::plan::*;

const WHAT: &str = "query";

pub const SECTION_HEADER: u8 = 1;
pub const SECTION_INCLUDE: u8 = 2;
pub const SECTION_FILTER: u8 = 3;
pub const SECTION_SORT: u8 = 4;
pub const SECTION_SEARCH: u8 = 5;
pub const SECTION_AGG: u8 = 6;
pub const SECTION_SCHEMA: u8 = 255;

const TARGET_ALL: u8 = 0;
const TARGET_ID: u8 = 1;
const TARGET_IDS: u8 = 2;
const TARGET_ALIAS: u8 = 3;

const MAIN_NONE: u8 = 0;
const MAIN_ALL: u8 = 1;
const MAIN_SLICES: u8 = 2;

const FILTER_GROUP: u8 = 0;
const FILTER_AND: u8 = 1;
const FILTER_OR: u8 = 2;

const ENTRY_FIELD: u8 = 0;
const ENTRY_REF: u8 = 1;

const SEARCH_LEXICAL: u8 = 1;
const SEARCH_VECTOR: u8 = 2;

const VALUE_NULL: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_NUMBER: u8 = 3;
const VALUE_TIMESTAMP: u8 = 4;
const VALUE_STRING: u8 = 5;
const VALUE_BINARY: u8 = 6;
const VALUE_LIST: u8 = 7;

pub fn query_id(body: &[u8]) -> u32 {
    crc32(body)
}

/// Encode many plans into one batch.
pub fn encode_batch<'a>(plans: impl IntoIterator<Item = &'a QueryPlan>) -> Result<BytesMut> {
    let plans: Vec<&QueryPlan> = plans.into_iter().collect();
    if plans.len() > u16::MAX as usize {
        return Err(Error::InvalidQuery {
            message: format!("{} queries in one batch", plans.len()),
        });
    }
    let mut buf = BytesMut::with_capacity(64 * plans.len());
    buf.put_u16_le(plans.len() as u16);
    for plan in plans {
        let body = encode_body(plan);
        buf.put_u32_le(body.len() as u32 + 4);
        buf.put_u32_le(query_id(&body));
        buf.put_slice(&body);
    }
    Ok(buf)
}

/// `(query_id, plan)` for each query of a batch; bodies with a bad id are rejected.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<(u32, QueryPlan)>> {
    let mut r = ByteReader::new(buf, WHAT);
    let count = r.u16()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut q = ByteReader::new(r.section()?, WHAT);
        let id = q.u32()?;
        let body = q.rest();
        let actual = query_id(body);
        if actual != id {
            return Err(Error::Checksum {
                what: "query body".to_string(),
                expected: id,
                actual,
            });
        }
        out.push((id, decode_body(body)?));
    }
    Ok(out)
}

pub fn encode_body(plan: &QueryPlan) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    put_body(&mut buf, plan, true);
    buf
}

fn section(buf: &mut BytesMut, tag: u8, write: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let pos = buf.reserve_len();
    write(buf);
    buf.patch_len(pos);
}

fn put_body(buf: &mut BytesMut, plan: &QueryPlan, top: bool) {
    section(buf, SECTION_HEADER, |b| put_header(b, plan));
    if plan.main != MainSelect::None || !plan.fields.is_empty() || !plan.meta.is_empty() || !plan.refs.is_empty() {
        section(buf, SECTION_INCLUDE, |b| put_include(b, plan));
    }
    if let Some(filter) = &plan.filter {
        section(buf, SECTION_FILTER, |b| put_filter(b, filter));
    }
    if let Some(sort) = &plan.sort {
        section(buf, SECTION_SORT, |b| {
            put_field(b, &sort.field);
            b.put_u8(sort.desc as u8);
        });
    }
    if let Some(search) = &plan.search {
        section(buf, SECTION_SEARCH, |b| put_search(b, search));
    }
    if let Some(agg) = &plan.agg {
        section(buf, SECTION_AGG, |b| put_agg(b, agg));
    }
    if top {
        section(buf, SECTION_SCHEMA, |b| b.put_u64_le(plan.schema_hash));
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_header(buf: &mut BytesMut, plan: &QueryPlan) {
    buf.put_u16_le(plan.type_id);
    match &plan.target {
        PlanTarget::All => buf.put_u8(TARGET_ALL),
        PlanTarget::Id(id) => {
            buf.put_u8(TARGET_ID);
            buf.put_u32_le(*id);
        }
        PlanTarget::Ids(ids) => {
            buf.put_u8(TARGET_IDS);
            buf.put_u32_le(ids.len() as u32);
            for id in ids {
                buf.put_u32_le(*id);
            }
        }
        PlanTarget::Alias { prop, value } => {
            buf.put_u8(TARGET_ALIAS);
            buf.put_u8(*prop);
            put_str(buf, value);
        }
    }
    let locale = plan.locale.as_deref().unwrap_or("");
    buf.put_u8(locale.len() as u8);
    buf.put_slice(locale.as_bytes());
    match plan.range {
        Some((offset, limit)) => {
            buf.put_u8(1);
            buf.put_u32_le(offset);
            buf.put_u32_le(limit);
        }
        None => buf.put_u8(0),
    }
}

fn put_main(buf: &mut BytesMut, main: &MainSelect) {
    match main {
        MainSelect::None => buf.put_u8(MAIN_NONE),
        MainSelect::All => buf.put_u8(MAIN_ALL),
        MainSelect::Slices(slices) => {
            buf.put_u8(MAIN_SLICES);
            buf.put_u16_le(slices.len() as u16);
            for (start, len) in slices {
                buf.put_u16_le(*start);
                buf.put_u16_le(*len);
            }
        }
    }
}

fn put_props(buf: &mut BytesMut, props: &[u8]) {
    buf.put_u8(props.len() as u8);
    buf.put_slice(props);
}

fn put_include(buf: &mut BytesMut, plan: &QueryPlan) {
    put_main(buf, &plan.main);
    put_props(buf, &plan.fields);
    put_props(buf, &plan.meta);
    buf.put_u8(plan.refs.len() as u8);
    for r in &plan.refs {
        buf.put_u8(r.prop);
        let pos = buf.reserve_len();
        put_body(buf, &r.plan, false);
        buf.patch_len(pos);
        match &r.edge {
            None => buf.put_u8(0),
            Some(edge) => {
                buf.put_u8(1);
                buf.put_u16_le(edge.type_id);
                put_main(buf, &edge.main);
                put_props(buf, &edge.fields);
            }
        }
    }
}

fn put_field(buf: &mut BytesMut, f: &FieldRef) {
    buf.put_u8(f.prop);
    buf.put_u16_le(f.start);
    buf.put_u16_le(f.len);
    buf.put_u8(f.kind as u8);
}

pub(crate) fn put_value(buf: &mut BytesMut, v: &Value) {
    match v {
        Value::Null => buf.put_u8(VALUE_NULL),
        Value::Bool(b) => {
            buf.put_u8(VALUE_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int(i) => {
            buf.put_u8(VALUE_INT);
            buf.put_u64_le(*i as u64);
        }
        Value::Number(n) => {
            buf.put_u8(VALUE_NUMBER);
            buf.put_f64_le(*n);
        }
        Value::Timestamp(t) => {
            buf.put_u8(VALUE_TIMESTAMP);
            buf.put_u64_le(*t as u64);
        }
        Value::String(s) => {
            buf.put_u8(VALUE_STRING);
            put_str(buf, s);
        }
        Value::Binary(b) => {
            buf.put_u8(VALUE_BINARY);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(VALUE_LIST);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        // Filter values are normalized to the variants above.
        other => {
            buf.put_u8(VALUE_STRING);
            put_str(buf, &other.key_string());
        }
    }
}

fn put_filter(buf: &mut BytesMut, filter: &FilterPlan) {
    match filter {
        FilterPlan::Group(group) => {
            buf.put_u8(FILTER_GROUP);
            buf.put_u16_le(group.entries.len() as u16);
            for entry in &group.entries {
                match entry {
                    GroupEntry::Field { field, conds } => {
                        buf.put_u8(ENTRY_FIELD);
                        put_field(buf, field);
                        buf.put_u16_le(conds.len() as u16);
                        for (op, value) in conds {
                            buf.put_u8(*op as u8);
                            put_value(buf, value);
                        }
                    }
                    GroupEntry::Ref { prop, filter } => {
                        buf.put_u8(ENTRY_REF);
                        buf.put_u8(*prop);
                        put_filter(buf, filter);
                    }
                }
            }
        }
        FilterPlan::And(a, b) | FilterPlan::Or(a, b) => {
            buf.put_u8(if matches!(filter, FilterPlan::And(..)) { FILTER_AND } else { FILTER_OR });
            put_filter(buf, a);
            put_filter(buf, b);
        }
    }
}

fn put_search(buf: &mut BytesMut, search: &SearchPlan) {
    match search {
        SearchPlan::Lexical { tokens, fields } => {
            buf.put_u8(SEARCH_LEXICAL);
            buf.put_u8(fields.len() as u8);
            for (field, weight) in fields {
                put_field(buf, field);
                buf.put_u8(*weight);
            }
            buf.put_u16_le(tokens.len() as u16);
            for t in tokens {
                put_str(buf, t);
            }
        }
        SearchPlan::Vector {
            field,
            vector,
            distance,
            threshold,
        } => {
            buf.put_u8(SEARCH_VECTOR);
            put_field(buf, field);
            buf.put_u8(*distance as u8);
            buf.put_f64_le(*threshold);
            buf.put_u32_le(vector.len() as u32);
            for x in vector {
                buf.put_f32_le(*x);
            }
        }
    }
}

fn put_agg(buf: &mut BytesMut, agg: &AggPlan) {
    match &agg.group_by {
        None => buf.put_u8(0),
        Some((field, step)) => {
            buf.put_u8(1);
            put_field(buf, field);
            match step {
                StepPlan::None => buf.put_u8(0),
                StepPlan::Fixed(n) => {
                    buf.put_u8(1);
                    buf.put_u64_le(*n as u64);
                }
                StepPlan::Calendar(c) => {
                    buf.put_u8(2);
                    buf.put_u8(*c as u8);
                }
            }
        }
    }
    buf.put_u8(agg.root_count_only as u8);
    buf.put_u8(agg.fns.len() as u8);
    for (kind, field) in &agg.fns {
        buf.put_u8(*kind as u8);
        put_field(buf, field);
    }
}

// Decoding

fn bad(message: impl Into<String>) -> Error {
    Error::malformed(WHAT, message)
}

pub fn decode_body(body: &[u8]) -> Result<QueryPlan> {
    read_body(body, true)
}

fn read_body(body: &[u8], top: bool) -> Result<QueryPlan> {
    let mut r = ByteReader::new(body, WHAT);
    let mut plan: Option<QueryPlan> = None;
    let mut schema_hash = None;

    while !r.is_empty() {
        let tag = r.u8()?;
        let mut s = ByteReader::new(r.section()?, WHAT);
        match tag {
            SECTION_HEADER => plan = Some(read_header(&mut s)?),
            SECTION_SCHEMA => schema_hash = Some(s.u64()?),
            SECTION_INCLUDE | SECTION_FILTER | SECTION_SORT | SECTION_SEARCH | SECTION_AGG => {
                let p = plan.as_mut().ok_or_else(|| bad("section before header"))?;
                match tag {
                    SECTION_INCLUDE => read_include(&mut s, p)?,
                    SECTION_FILTER => p.filter = Some(read_filter(&mut s)?),
                    SECTION_SORT => {
                        p.sort = Some(SortPlan {
                            field: read_field(&mut s)?,
                            desc: s.u8()? != 0,
                        })
                    }
                    SECTION_SEARCH => p.search = Some(read_search(&mut s)?),
                    _ => p.agg = Some(read_agg(&mut s)?),
                }
            }
            // Newer sections are skipped.
            _ => {}
        }
    }

    let mut plan = plan.ok_or_else(|| bad("missing header"))?;
    match (top, schema_hash) {
        (true, None) => return Err(bad("missing schema section")),
        (_, Some(hash)) => set_schema_hash(&mut plan, hash),
        (false, None) => {}
    }
    Ok(plan)
}

fn set_schema_hash(plan: &mut QueryPlan, hash: u64) {
    plan.schema_hash = hash;
    for r in &mut plan.refs {
        set_schema_hash(&mut r.plan, hash);
    }
}

fn read_str<'a>(r: &mut ByteReader<'a>) -> Result<String> {
    let bytes = r.section()?;
    String::from_utf8(bytes.to_vec()).map_err(|e| bad(e.to_string()))
}

fn read_header(r: &mut ByteReader<'_>) -> Result<QueryPlan> {
    let type_id = r.u16()?;
    let target = match r.u8()? {
        TARGET_ALL => PlanTarget::All,
        TARGET_ID => PlanTarget::Id(r.u32()?),
        TARGET_IDS => {
            let n = r.u32()? as usize;
            let mut ids = Vec::with_capacity(n.min(r.remaining() / 4));
            for _ in 0..n {
                ids.push(r.u32()?);
            }
            PlanTarget::Ids(ids)
        }
        TARGET_ALIAS => {
            let prop = r.u8()?;
            PlanTarget::Alias {
                prop,
                value: read_str(r)?,
            }
        }
        other => return Err(bad(format!("unknown target {}", other))),
    };
    let locale_len = r.u8()? as usize;
    let locale = String::from_utf8(r.bytes(locale_len)?.to_vec()).map_err(|e| bad(e.to_string()))?;
    let range = match r.u8()? {
        0 => None,
        _ => Some((r.u32()?, r.u32()?)),
    };
    Ok(QueryPlan {
        type_id,
        target,
        main: MainSelect::None,
        fields: Vec::new(),
        meta: Vec::new(),
        refs: Vec::new(),
        filter: None,
        sort: None,
        range,
        search: None,
        agg: None,
        locale: (!locale.is_empty()).then_some(locale),
        schema_hash: 0,
    })
}

fn read_main(r: &mut ByteReader<'_>) -> Result<MainSelect> {
    Ok(match r.u8()? {
        MAIN_NONE => MainSelect::None,
        MAIN_ALL => MainSelect::All,
        MAIN_SLICES => {
            let n = r.u16()? as usize;
            let mut slices = Vec::with_capacity(n);
            for _ in 0..n {
                slices.push((r.u16()?, r.u16()?));
            }
            MainSelect::Slices(slices)
        }
        other => return Err(bad(format!("unknown main select {}", other))),
    })
}

fn read_props(r: &mut ByteReader<'_>) -> Result<Vec<u8>> {
    let n = r.u8()? as usize;
    Ok(r.bytes(n)?.to_vec())
}

fn read_include(r: &mut ByteReader<'_>, plan: &mut QueryPlan) -> Result<()> {
    plan.main = read_main(r)?;
    plan.fields = read_props(r)?;
    plan.meta = read_props(r)?;
    let n = r.u8()?;
    for _ in 0..n {
        let prop = r.u8()?;
        let nested = read_body(r.section()?, false)?;
        let edge = match r.u8()? {
            0 => None,
            _ => Some(EdgeSelect {
                type_id: r.u16()?,
                main: read_main(r)?,
                fields: read_props(r)?,
            }),
        };
        plan.refs.push(RefPlan {
            prop,
            plan: nested,
            edge,
        });
    }
    Ok(())
}

fn read_field(r: &mut ByteReader<'_>) -> Result<FieldRef> {
    let prop = r.u8()?;
    let start = r.u16()?;
    let len = r.u16()?;
    let kind = r.u8()?;
    let kind = PropKind::from_u8(kind).ok_or_else(|| bad(format!("unknown property kind {}", kind)))?;
    Ok(FieldRef { prop, start, len, kind })
}

pub(crate) fn read_value(r: &mut ByteReader<'_>) -> Result<Value> {
    Ok(match r.u8()? {
        VALUE_NULL => Value::Null,
        VALUE_BOOL => Value::Bool(r.u8()? != 0),
        VALUE_INT => Value::Int(r.u64()? as i64),
        VALUE_NUMBER => Value::Number(r.f64()?),
        VALUE_TIMESTAMP => Value::Timestamp(r.u64()? as i64),
        VALUE_STRING => Value::String(read_str(r)?),
        VALUE_BINARY => Value::Binary(r.section()?.to_vec()),
        VALUE_LIST => {
            let n = r.u32()? as usize;
            let mut items = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                items.push(read_value(r)?);
            }
            Value::List(items)
        }
        other => return Err(bad(format!("unknown value tag {}", other))),
    })
}

fn read_filter(r: &mut ByteReader<'_>) -> Result<FilterPlan> {
    Ok(match r.u8()? {
        FILTER_GROUP => {
            let n = r.u16()? as usize;
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                entries.push(match r.u8()? {
                    ENTRY_FIELD => {
                        let field = read_field(r)?;
                        let count = r.u16()? as usize;
                        let mut conds = Vec::with_capacity(count);
                        for _ in 0..count {
                            let op = r.u8()?;
                            let op = Operator::from_u8(op).ok_or_else(|| bad(format!("unknown operator {}", op)))?;
                            conds.push((op, read_value(r)?));
                        }
                        GroupEntry::Field { field, conds }
                    }
                    ENTRY_REF => {
                        let prop = r.u8()?;
                        GroupEntry::Ref {
                            prop,
                            filter: Box::new(read_filter(r)?),
                        }
                    }
                    other => return Err(bad(format!("unknown filter entry {}", other))),
                });
            }
            FilterPlan::Group(GroupPlan { entries })
        }
        FILTER_AND => FilterPlan::And(Box::new(read_filter(r)?), Box::new(read_filter(r)?)),
        FILTER_OR => FilterPlan::Or(Box::new(read_filter(r)?), Box::new(read_filter(r)?)),
        other => return Err(bad(format!("unknown filter node {}", other))),
    })
}

fn read_search(r: &mut ByteReader<'_>) -> Result<SearchPlan> {
    Ok(match r.u8()? {
        SEARCH_LEXICAL => {
            let n = r.u8()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                fields.push((read_field(r)?, r.u8()?));
            }
            let n = r.u16()?;
            let mut tokens = Vec::with_capacity(n as usize);
            for _ in 0..n {
                tokens.push(read_str(r)?);
            }
            SearchPlan::Lexical { tokens, fields }
        }
        SEARCH_VECTOR => {
            let field = read_field(r)?;
            let distance = r.u8()?;
            let distance = Distance::from_u8(distance).ok_or_else(|| bad(format!("unknown distance {}", distance)))?;
            let threshold = r.f64()?;
            let n = r.u32()? as usize;
            let mut vector = Vec::with_capacity(n.min(r.remaining() / 4));
            for _ in 0..n {
                vector.push(r.f32()?);
            }
            SearchPlan::Vector {
                field,
                vector,
                distance,
                threshold,
            }
        }
        other => return Err(bad(format!("unknown search kind {}", other))),
    })
}

fn read_agg(r: &mut ByteReader<'_>) -> Result<AggPlan> {
    let group_by = match r.u8()? {
        0 => None,
        _ => {
            let field = read_field(r)?;
            let step = match r.u8()? {
                0 => StepPlan::None,
                1 => StepPlan::Fixed(r.u64()? as i64),
                2 => {
                    let c = r.u8()?;
                    StepPlan::Calendar(
                        CalendarInterval::from_u8(c).ok_or_else(|| bad(format!("unknown interval {}", c)))?,
                    )
                }
                other => return Err(bad(format!("unknown step {}", other))),
            };
            Some((field, step))
        }
    };
    let root_count_only = r.u8()? != 0;
    let n = r.u8()?;
    let mut fns = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let kind = r.u8()?;
        let kind = AggKind::from_u8(kind).ok_or_else(|| bad(format!("unknown aggregate {}", kind)))?;
        fns.push((kind, read_field(r)?));
    }
    Ok(AggPlan {
        group_by,
        fns,
        root_count_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{compile_query, Distance, Operator, Order, Query};
    use basedb_core::config::SchemaConfig;
    use basedb_core::{compile, PropSchema as P, Schema, TypeDefs, TypeSchema as T};

    fn defs() -> TypeDefs {
        let schema = Schema::new().locale("en").with_type(
            T::new("doc")
                .prop(P::string("title"))
                .prop(P::uint32("score"))
                .prop(P::timestamp("at"))
                .prop(P::vector("embedding", 3))
                .prop(P::references("related", "doc", "relatedTo")),
        );
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    fn roundtrip(q: Query) {
        let defs = defs();
        let plan = compile_query(q.def(), &defs).unwrap().plan;
        let batch = encode_batch([&plan]).unwrap();
        let decoded = decode_batch(&batch).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].1, plan);
        assert_eq!(decoded[0].0, query_id(&encode_body(&plan)));
    }

    #[test]
    fn test_plans_survive_the_wire() {
        roundtrip(
            Query::new("doc")
                .include(["title", "related.score"])
                .filter("score", Operator::Range, Value::List(vec![Value::Int(1), Value::Int(9)]))
                .or(|f| f.filter("title", Operator::Has, "rust"))
                .sort("score", Order::Desc)
                .range(5, 10),
        );
        roundtrip(Query::new("doc").id(3).locale("en"));
        roundtrip(Query::new("doc").search("Fast databases", ["title"]));
        roundtrip(Query::new("doc").search_vector("embedding", vec![1.0, 0.0, 0.5], Distance::Cosine, 0.5));
        roundtrip(Query::new("doc").group_by("score").sum("score").avg("score").count());
    }

    #[test]
    fn test_corrupt_body_is_rejected() {
        let defs = defs();
        let plan = compile_query(Query::new("doc").def(), &defs).unwrap().plan;
        let mut batch = encode_batch([&plan]).unwrap();
        let last = batch.len() - 1;
        batch[last] ^= 0xff;
        assert!(matches!(decode_batch(&batch), Err(Error::Checksum { .. })));
    }

    #[test]
    fn test_unknown_section_is_skipped() {
        let defs = defs();
        let plan = compile_query(Query::new("doc").def(), &defs).unwrap().plan;
        let mut body = BytesMut::new();
        section(&mut body, 77, |b| b.put_u64_le(1));
        body.extend_from_slice(&encode_body(&plan));
        assert_eq!(decode_body(&body).unwrap(), plan);
    }
}
