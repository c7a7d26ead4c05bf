//! # Result reader
//!
//! Decodes a query response with the [`ReaderSchema`] compiled alongside the
//! query. Every row of a result carries the same keys: properties the
//! backend did not send are backfilled with their defaults when the record
//! ends. Unknown blocks are skipped by length.

use std::collections::{BTreeMap, HashMap};

use basedb_core::codec::{read_f64, read_u32, ByteReader};
use basedb_core::schema::decode_main;
use basedb_core::string::StringCodec;
use basedb_core::value::{get_path, set_path};
use basedb_core::{Error, PropDef, PropKind, Result, Row, TypeDef, Value};
use tracing::trace;

use crate::query::{AggKind, AggLayout};
use crate::response::*;

const WHAT: &str = "response";

/// Decoded strings kept by `(crc, stored size)`.
const STRING_CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct RefReader {
    pub path: String,
    pub single: bool,
    pub schema: Box<ReaderSchema>,
    /// Edge properties returned on the target rows.
    pub edge: Option<Box<ReaderSchema>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggReader {
    pub layout: AggLayout,
    /// `count` or `path.fn`, per slot.
    pub names: Vec<String>,
    pub grouped: bool,
}

/// Decode-side mirror of a query's include layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSchema {
    pub type_id: u16,
    /// Main props with `start` relative to the MAIN block as sent.
    pub main: Vec<PropDef>,
    pub fields: BTreeMap<u8, PropDef>,
    pub meta: BTreeMap<u8, PropDef>,
    pub refs: BTreeMap<u8, RefReader>,
    pub locale: Option<String>,
    pub locales: Vec<String>,
    pub agg: Option<AggReader>,
    /// Result is one node or none.
    pub single: bool,
}

impl ReaderSchema {
    pub fn new(def: &TypeDef, locale: Option<String>, locales: Vec<String>) -> Self {
        Self {
            type_id: def.id,
            main: Vec::new(),
            fields: BTreeMap::new(),
            meta: BTreeMap::new(),
            refs: BTreeMap::new(),
            locale,
            locales,
            agg: None,
            single: false,
        }
    }

    fn empty_text(&self) -> Value {
        match &self.locale {
            Some(_) => Value::String(String::new()),
            None => Value::Text(self.locales.iter().map(|l| (l.clone(), String::new())).collect()),
        }
    }

    /// Give every included path a value.
    fn backfill(&self, row: &mut Row) {
        for p in &self.main {
            if get_path(row, &p.path).is_none() {
                set_path(row, &p.path, p.empty_value());
            }
        }
        for p in self.fields.values() {
            match (p.kind, get_path(row, &p.path)) {
                (PropKind::Text, None) => set_path(row, &p.path, self.empty_text()),
                (PropKind::Text, Some(Value::Text(map))) if self.locale.is_none() => {
                    let mut map = map.clone();
                    for l in &self.locales {
                        map.entry(l.clone()).or_default();
                    }
                    set_path(row, &p.path, Value::Text(map));
                }
                (_, None) => set_path(row, &p.path, p.empty_value()),
                _ => {}
            }
        }
        for p in self.meta.values() {
            if get_path(row, &p.path).is_none() {
                set_path(row, &p.path, meta_value(false, 0, 0, 0));
            }
        }
        for r in self.refs.values() {
            if get_path(row, &r.path).is_none() {
                let empty = if r.single { Value::Null } else { Value::List(Vec::new()) };
                set_path(row, &r.path, empty);
            }
        }
    }
}

fn meta_value(compressed: bool, raw_len: u32, size: u32, crc: u32) -> Value {
    let mut row = Row::new();
    row.insert("checksum".to_string(), Value::Int(crc as i64));
    row.insert("compressed".to_string(), Value::Bool(compressed));
    row.insert("rawSize".to_string(), Value::Int(raw_len as i64));
    row.insert("size".to_string(), Value::Int(size as i64));
    Value::Object(row)
}

/// Decoded result of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Rows(Vec<Row>),
    /// Query by id or alias.
    Row(Option<Row>),
    Aggregate(Row),
}

impl QueryResult {
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Row(Some(row)) | QueryResult::Aggregate(row) => std::slice::from_ref(row),
            QueryResult::Row(None) => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Row(row) => row.into_iter().collect(),
            QueryResult::Aggregate(row) => vec![row],
        }
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// Value at a dotted path of the first row.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.rows().first().and_then(|r| get_path(r, path))
    }
}

/// Stateful decoder: keeps decompressed strings so repeated reads of the
/// same field content skip inflating.
#[derive(Debug)]
pub struct ResultReader {
    codec: StringCodec,
    /// `(crc, size)` → (encoded bytes, decoded string). A hit only counts
    /// when the encoded bytes are equal.
    cache: HashMap<(u32, u32), (Box<[u8]>, String)>,
}

impl ResultReader {
    pub fn new(codec: StringCodec) -> Self {
        Self {
            codec,
            cache: HashMap::new(),
        }
    }

    /// Decode a whole response; `schemas[i]` reads result `i`.
    pub fn read_response(&mut self, schemas: &[&ReaderSchema], buf: &[u8]) -> Result<Vec<QueryResult>> {
        let mut r = ByteReader::new(buf, WHAT);
        let count = r.u16()? as usize;
        if count != schemas.len() {
            return Err(Error::malformed(
                WHAT,
                format!("{} results for {} queries", count, schemas.len()),
            ));
        }
        let mut out = Vec::with_capacity(count);
        for schema in schemas {
            out.push(self.read_result(schema, r.section()?)?);
        }
        Ok(out)
    }

    pub fn read_result(&mut self, schema: &ReaderSchema, buf: &[u8]) -> Result<QueryResult> {
        let mut r = ByteReader::new(buf, WHAT);
        match r.u8()? {
            RESULT_NODES => {
                let count = r.u32()? as usize;
                let mut rows = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    rows.push(self.read_node(schema, None, &mut r)?);
                }
                if schema.single {
                    return Ok(QueryResult::Row(rows.into_iter().next()));
                }
                Ok(QueryResult::Rows(rows))
            }
            RESULT_AGGREGATE => {
                let agg = schema
                    .agg
                    .as_ref()
                    .ok_or_else(|| Error::malformed(WHAT, "aggregate result for a node query"))?;
                read_aggregate(agg, &mut r).map(QueryResult::Aggregate)
            }
            other => Err(Error::malformed(WHAT, format!("unknown result kind {}", other))),
        }
    }

    fn read_node(&mut self, schema: &ReaderSchema, edge: Option<&ReaderSchema>, r: &mut ByteReader<'_>) -> Result<Row> {
        let op = r.u8()?;
        if op != NODE {
            return Err(Error::malformed(WHAT, format!("expected node, got {}", op)));
        }
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Int(r.u32()? as i64));

        loop {
            let op = r.u8()?;
            if op == END {
                break;
            }
            let payload = r.section()?;
            if op == EDGE {
                if let Some(edge) = edge {
                    let mut e = ByteReader::new(payload, WHAT);
                    while !e.is_empty() {
                        let op = e.u8()?;
                        let payload = e.section()?;
                        self.apply_block(edge, op, payload, &mut row)?;
                    }
                    edge.backfill(&mut row);
                }
                continue;
            }
            self.apply_block(schema, op, payload, &mut row)?;
        }

        schema.backfill(&mut row);
        Ok(row)
    }

    fn apply_block(&mut self, schema: &ReaderSchema, op: u8, payload: &[u8], row: &mut Row) -> Result<()> {
        match op {
            MAIN => {
                for p in &schema.main {
                    set_path(row, &p.path, decode_main(p, payload)?);
                }
            }
            FIELD => {
                let (prop, data) = split_prop(payload)?;
                if let Some(p) = schema.fields.get(&prop) {
                    let value = self.decode_field(p, data)?;
                    set_path(row, &p.path, value);
                }
            }
            TEXT => {
                let mut r = ByteReader::new(payload, WHAT);
                let prop = r.u8()?;
                let len = r.u8()? as usize;
                let locale = std::str::from_utf8(r.bytes(len)?).map_err(|e| Error::malformed(WHAT, e.to_string()))?;
                let text = self.decode_string(r.rest())?;
                if let Some(p) = schema.fields.get(&prop) {
                    if schema.locale.is_some() {
                        set_path(row, &p.path, Value::String(text));
                    } else {
                        let mut map = match get_path(row, &p.path) {
                            Some(Value::Text(map)) => map.clone(),
                            _ => BTreeMap::new(),
                        };
                        map.insert(locale.to_string(), text);
                        set_path(row, &p.path, Value::Text(map));
                    }
                }
            }
            META => {
                let mut r = ByteReader::new(payload, WHAT);
                let prop = r.u8()?;
                let compressed = r.u8()? != 0;
                let (raw_len, size, crc) = (r.u32()?, r.u32()?, r.u32()?);
                if let Some(p) = schema.meta.get(&prop) {
                    set_path(row, &p.path, meta_value(compressed, raw_len, size, crc));
                }
            }
            REF => {
                let mut r = ByteReader::new(payload, WHAT);
                let prop = r.u8()?;
                if let Some(rr) = schema.refs.get(&prop) {
                    let value = if r.is_empty() {
                        Value::Null
                    } else {
                        Value::Object(self.read_node(&rr.schema, rr.edge.as_deref(), &mut r)?)
                    };
                    set_path(row, &rr.path, value);
                }
            }
            REFS => {
                let mut r = ByteReader::new(payload, WHAT);
                let prop = r.u8()?;
                if let Some(rr) = schema.refs.get(&prop) {
                    let count = r.u32()? as usize;
                    let mut items = Vec::with_capacity(count.min(1 << 16));
                    for _ in 0..count {
                        items.push(Value::Object(self.read_node(&rr.schema, rr.edge.as_deref(), &mut r)?));
                    }
                    set_path(row, &rr.path, Value::List(items));
                }
            }
            other => trace!(op = other, "skipping unknown response block"),
        }
        Ok(())
    }

    fn decode_field(&mut self, p: &PropDef, data: &[u8]) -> Result<Value> {
        Ok(match p.kind {
            PropKind::String | PropKind::Alias => Value::String(self.decode_string(data)?),
            PropKind::Json => {
                let s = self.decode_string(data)?;
                Value::Json(serde_json::from_str(&s)?)
            }
            PropKind::Binary => Value::Binary(data.to_vec()),
            PropKind::Vector => Value::Vector(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            PropKind::Cardinality => {
                if data.len() < 4 {
                    return Err(Error::malformed(WHAT, "short cardinality field"));
                }
                Value::Int(read_u32(data, 0) as i64)
            }
            other => {
                return Err(Error::malformed(WHAT, format!("{} is not a separate field", other)));
            }
        })
    }

    fn decode_string(&mut self, data: &[u8]) -> Result<String> {
        let meta = StringCodec::meta(data)?;
        if !meta.compressed {
            return self.codec.decode(data);
        }
        let key = (meta.crc, meta.size);
        if let Some((encoded, s)) = self.cache.get(&key) {
            if encoded.as_ref() == data {
                return Ok(s.clone());
            }
        }
        let s = self.codec.decode(data)?;
        if self.cache.len() >= STRING_CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.insert(key, (data.into(), s.clone()));
        Ok(s)
    }

    pub fn cached_strings(&self) -> usize {
        self.cache.len()
    }
}

fn split_prop(payload: &[u8]) -> Result<(u8, &[u8])> {
    payload
        .split_first()
        .map(|(p, rest)| (*p, rest))
        .ok_or_else(|| Error::malformed(WHAT, "empty field block"))
}

fn read_aggregate(agg: &AggReader, r: &mut ByteReader<'_>) -> Result<Row> {
    let groups = r.u32()? as usize;
    let mut out = Row::new();
    for _ in 0..groups {
        let key_len = r.u16()? as usize;
        let key = String::from_utf8(r.bytes(key_len)?.to_vec()).map_err(|e| Error::malformed(WHAT, e.to_string()))?;
        let slots = r.bytes(agg.layout.result_size)?;

        let mut values = Row::new();
        for (slot, name) in agg.layout.slots.iter().zip(&agg.names) {
            let value = match slot.kind {
                AggKind::Count => Value::Int(read_u32(slots, slot.result_offset) as i64),
                AggKind::Cardinality => Value::Int(read_f64(slots, slot.result_offset) as i64),
                _ => Value::Number(read_f64(slots, slot.result_offset)),
            };
            set_path(&mut values, name, value);
        }
        if agg.grouped {
            out.insert(key, Value::Object(values));
        } else {
            out.extend(values);
        }
    }
    if !agg.grouped && groups == 0 {
        // Nothing matched: zeroes, as an empty set aggregates to.
        for (slot, name) in agg.layout.slots.iter().zip(&agg.names) {
            let value = match slot.kind {
                AggKind::Count | AggKind::Cardinality => Value::Int(0),
                _ => Value::Number(0.0),
            };
            set_path(&mut out, name, value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    use crate::query::{compile_query, Query};
    use basedb_core::config::SchemaConfig;
    use basedb_core::schema::{default_main, encode_main};
    use basedb_core::{compile, PropSchema as P, Schema, TypeDefs, TypeSchema as T};

    fn defs() -> TypeDefs {
        let schema = Schema::new().locale("en").locale("nl").with_type(
            T::new("post")
                .prop(P::string("title"))
                .prop(P::uint32("likes"))
                .prop(P::text("body"))
                .prop(P::references("tags", "tag", "posts")),
        )
        .with_type(T::new("tag").prop(P::string("label")));
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    #[test]
    fn test_missing_fields_are_backfilled() {
        let defs = defs();
        let post = defs.get("post").unwrap();
        let q = compile_query(Query::new("post").include(["title", "likes", "body", "tags"]).def(), &defs).unwrap();

        let mut main = default_main(post);
        encode_main(post.prop("likes").unwrap(), &Value::Int(7), &mut main).unwrap();
        let mut nodes = NodesWriter::new();
        let buf = nodes.node(3);
        put_main(buf, &main);
        put_block(buf, 99, |b| b.put_u64_le(0));
        put_node_end(buf);
        let result = nodes.finish();

        let mut reader = ResultReader::new(StringCodec::default());
        let rows = reader.read_result(&q.reader, &result).unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["id"], Value::Int(3));
        assert_eq!(row["likes"], Value::Int(7));
        assert_eq!(row["title"], Value::String(String::new()));
        assert_eq!(row["tags"], Value::List(Vec::new()));
        let Value::Text(body) = &row["body"] else { panic!("expected text") };
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_compressed_strings_are_cached() {
        let defs = defs();
        let post = defs.get("post").unwrap();
        let title = post.prop("title").unwrap();
        let q = compile_query(Query::new("post").include(["title"]).def(), &defs).unwrap();
        let codec = StringCodec::default();
        let text = "a long and very repetitive title ".repeat(30);
        let encoded = codec.encode(&text, true).unwrap();

        let mut nodes = NodesWriter::new();
        for id in 1..=2 {
            let buf = nodes.node(id);
            put_field(buf, title.prop, &encoded);
            put_node_end(buf);
        }
        let mut reader = ResultReader::new(codec);
        let rows = reader.read_result(&q.reader, &nodes.finish()).unwrap().into_rows();
        assert_eq!(rows[1]["title"], Value::String(text));
        assert_eq!(reader.cached_strings(), 1);
    }

    #[test]
    fn test_cached_string_needs_equal_bytes() {
        let defs = defs();
        let title = defs.get("post").unwrap().prop("title").unwrap().clone();
        let q = compile_query(Query::new("post").include(["title"]).def(), &defs).unwrap();
        let codec = StringCodec::default();
        let text = "another long and repetitive title ".repeat(30);
        let encoded = codec.encode(&text, true).unwrap();
        let meta = StringCodec::meta(&encoded).unwrap();
        assert!(meta.compressed);

        // Same checksum and size, different content.
        let mut reader = ResultReader::new(codec);
        let mut other = encoded.clone();
        let last = other.len() - 5;
        other[last] ^= 1;
        reader
            .cache
            .insert((meta.crc, meta.size), (other.into_boxed_slice(), "wrong".to_string()));

        let mut nodes = NodesWriter::new();
        let buf = nodes.node(1);
        put_field(buf, title.prop, &encoded);
        put_node_end(buf);
        let rows = reader.read_result(&q.reader, &nodes.finish()).unwrap().into_rows();
        assert_eq!(rows[0]["title"], Value::String(text));
    }

    #[test]
    fn test_single_result() {
        let defs = defs();
        let q = compile_query(Query::new("post").id(9).def(), &defs).unwrap();
        let mut reader = ResultReader::new(StringCodec::default());
        let empty = NodesWriter::new().finish();
        assert_eq!(reader.read_result(&q.reader, &empty).unwrap(), QueryResult::Row(None));
    }

    #[test]
    fn test_ungrouped_aggregate() {
        let defs = defs();
        let q = compile_query(Query::new("post").sum("likes").count().def(), &defs).unwrap();
        let layout = &q.reader.agg.as_ref().unwrap().layout;
        let mut slots = vec![0u8; layout.result_size];
        slots[..8].copy_from_slice(&15.0f64.to_le_bytes());
        slots[8..12].copy_from_slice(&5u32.to_le_bytes());
        let buf = aggregate_result(&[(String::new(), slots)]);

        let mut reader = ResultReader::new(StringCodec::default());
        let result = reader.read_result(&q.reader, &buf).unwrap();
        assert_eq!(result.get("likes.sum"), Some(&Value::Number(15.0)));
        assert_eq!(result.get("count"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_response_count_must_match() {
        let defs = defs();
        let q = compile_query(Query::new("post").def(), &defs).unwrap();
        let mut w = ResponseWriter::new();
        w.push(&NodesWriter::new().finish());
        w.push(&NodesWriter::new().finish());
        let mut reader = ResultReader::new(StringCodec::default());
        assert!(reader.read_response(&[&q.reader], &w.finish()).is_err());
    }
}
