//! End-to-end tests of `DbServer` through its hooks: modify batches in,
//! query responses out, dumps on disk.

use std::collections::BTreeMap;
use std::path::Path;

use tempfile::TempDir;

use basedb_core::string::StringCodec;
use basedb_core::{Config, FlushResult, Hooks, PropSchema as P, Result, Schema, TypeSchema as T, Value};
use basedb_protocol::modify::{serialize_create, serialize_delete, serialize_update, ModifyCtx};
use basedb_protocol::query::encode_batch;
use basedb_protocol::reader::QueryResult;
use basedb_protocol::{compile_query, Operator, Payload, Query, RefItem, ResultReader};
use basedb_storage::DbServer;

struct Harness {
    server: DbServer,
    last_ids: BTreeMap<u16, u32>,
    batch: u64,
}

impl Harness {
    async fn open(dir: &Path, no_load_dumps: bool) -> Self {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config.storage.no_load_dumps = no_load_dumps;
        let server = DbServer::open(config).await.unwrap();
        let last_ids = server.with_db(|db| db.last_ids());
        Self {
            server,
            last_ids,
            batch: 0,
        }
    }

    async fn modify(&mut self, build: impl FnOnce(&mut ModifyCtx) -> Result<()>) -> FlushResult {
        self.batch += 1;
        let mut ctx = ModifyCtx::new(self.server.defs(), StringCodec::default(), self.batch, self.last_ids.clone());
        build(&mut ctx).unwrap();
        let last_ids = ctx.last_ids().clone();
        let result = self.server.flush_modify(ctx.finish()).await.unwrap();
        self.last_ids = last_ids;
        for (type_id, offset) in result.offsets.clone().expect("batch matches the schema") {
            *self.last_ids.entry(type_id).or_default() += offset;
        }
        result
    }

    async fn query(&self, query: Query) -> QueryResult {
        let compiled = compile_query(query.def(), &self.server.defs()).unwrap();
        let buf = encode_batch([&compiled.plan]).unwrap();
        let out = self.server.get_query_buf(buf.freeze()).await.unwrap();
        let mut reader = ResultReader::new(StringCodec::default());
        reader.read_response(&[&compiled.reader], &out).unwrap().remove(0)
    }
}

fn user_schema() -> Schema {
    Schema::new().with_type(T::new("user").prop(P::string("name")).prop(P::uint32("flap")))
}

#[tokio::test]
async fn test_sum_is_order_independent() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::open(dir.path(), false).await;
    h.server.set_schema(user_schema()).await.unwrap();

    let flaps = [30u32, 1, 7, 100, 12];
    h.modify(|ctx| {
        for (i, flap) in flaps.iter().rev().enumerate() {
            let p = Payload::new().set("name", format!("user {}", i)).set("flap", *flap);
            serialize_create(ctx, "user", &p)?;
        }
        Ok(())
    })
    .await;

    let result = h.query(Query::new("user").sum("flap")).await;
    assert_eq!(result.get("flap.sum"), Some(&Value::Number(150.0)));

    let count = h.query(Query::new("user").count()).await;
    assert_eq!(count.get("count"), Some(&Value::Int(5)));

    // Range does not narrow an aggregate.
    let filtered = h.query(Query::new("user").filter("flap", Operator::Gt, 10u32).sum("flap")).await;
    let ranged = h
        .query(Query::new("user").filter("flap", Operator::Gt, 10u32).sum("flap").range(0, 1))
        .await;
    assert_eq!(filtered.get("flap.sum"), Some(&Value::Number(142.0)));
    assert_eq!(filtered, ranged);
}

#[tokio::test]
async fn test_edge_properties_follow_their_reference() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::open(dir.path(), false).await;
    h.server
        .set_schema(
            user_schema().with_type(
                T::new("article")
                    .prop(P::string("title"))
                    .prop(P::references("contributors", "user", "articles").edge(P::uint32("$rating"))),
            ),
        )
        .await
        .unwrap();

    let mut users = Vec::new();
    h.modify(|ctx| {
        for name in ["ann", "bob"] {
            users.push(serialize_create(ctx, "user", &Payload::new().set("name", name))?);
        }
        Ok(())
    })
    .await;
    let (ann, bob) = (users[0], users[1]);

    let mut article = 0;
    h.modify(|ctx| {
        let p = Payload::new().set("title", "hello").references(
            "contributors",
            [
                RefItem::edges(ann, Payload::new().set("$rating", 1u32)),
                RefItem::edges(bob, Payload::new().set("$rating", 2u32)),
            ],
        );
        article = serialize_create(ctx, "article", &p)?;
        Ok(())
    })
    .await;

    let ratings = |result: &QueryResult| -> Vec<(Value, Value)> {
        let Some(Value::List(items)) = result.get("contributors") else { panic!("no contributors") };
        items
            .iter()
            .map(|item| {
                let row = item.as_row().unwrap();
                (row["name"].clone(), row["$rating"].clone())
            })
            .collect()
    };
    let q = || Query::new("article").id(article).include(["contributors.name", "contributors.$rating"]);

    let result = h.query(q()).await;
    assert_eq!(
        ratings(&result),
        vec![
            (Value::String("ann".into()), Value::Int(1)),
            (Value::String("bob".into()), Value::Int(2)),
        ]
    );

    // Removing ann drops her edge only; adding her back starts from defaults.
    h.modify(|ctx| serialize_update(ctx, "article", article, &Payload::new().delete_references("contributors", [ann])))
        .await;
    assert_eq!(ratings(&h.query(q()).await), vec![(Value::String("bob".into()), Value::Int(2))]);

    h.modify(|ctx| serialize_update(ctx, "article", article, &Payload::new().add_references("contributors", [ann])))
        .await;
    assert_eq!(
        ratings(&h.query(q()).await),
        vec![
            (Value::String("bob".into()), Value::Int(2)),
            (Value::String("ann".into()), Value::Int(0)),
        ]
    );

    // The inverse side is maintained.
    let ann_row = h.query(Query::new("user").id(ann).include(["articles.title"])).await;
    let Some(Value::List(articles)) = ann_row.get("articles") else { panic!("no inverse") };
    assert_eq!(articles.len(), 1);
}

#[tokio::test]
async fn test_offloaded_blocks_are_invisible_until_loaded() {
    let dir = TempDir::new().unwrap();
    let root = {
        let mut h = Harness::open(dir.path(), false).await;
        h.server
            .set_schema(Schema::new().with_type(T::new("item").prop(P::uint32("value"))))
            .await
            .unwrap();
        h.modify(|ctx| {
            for i in 0..400_000u32 {
                serialize_create(ctx, "item", &Payload::new().set("value", i))?;
            }
            Ok(())
        })
        .await;
        assert_eq!(h.server.save().await.unwrap(), 4);
        let root = h.server.root_hash();
        h.server.stop().await.unwrap();
        root
    };

    let dumps = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            let name = name.to_string_lossy();
            name.ends_with(".sdb") && name != "common.sdb"
        })
        .count();
    assert_eq!(dumps, 4);

    let h = Harness::open(dir.path(), true).await;
    assert_eq!(h.server.root_hash(), root);
    assert_eq!(h.server.count("item").unwrap(), 0);
    assert_eq!(h.query(Query::new("item").count()).await.get("count"), Some(&Value::Int(0)));
    assert!(h.query(Query::new("item").include(["value"])).await.is_empty());

    assert_eq!(h.server.load_block("item", 150_000).unwrap(), 100_000);
    let rows = h.query(Query::new("item").include(["value"])).await.into_rows();
    assert_eq!(rows.len(), 100_000);
    assert_eq!(rows.first().unwrap()["id"], Value::Int(100_001));
    assert_eq!(rows.last().unwrap()["id"], Value::Int(200_000));
    assert_eq!(rows.last().unwrap()["value"], Value::Int(199_999));
    assert!(h.server.verify().unwrap().is_ok());
}

#[tokio::test]
async fn test_dirty_set_tracks_one_update() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::open(dir.path(), false).await;
    h.server.set_schema(user_schema()).await.unwrap();
    let user_type = h.server.defs().get("user").unwrap().id;

    let mut ids = Vec::new();
    h.modify(|ctx| {
        for i in 0..3u32 {
            ids.push(serialize_create(ctx, "user", &Payload::new().set("flap", i))?);
        }
        Ok(())
    })
    .await;
    h.server.save().await.unwrap();
    assert!(h.server.dirty_blocks().is_empty());

    h.modify(|ctx| serialize_update(ctx, "user", ids[1], &Payload::new().set("flap", 42u32)))
        .await;
    assert_eq!(h.server.dirty_blocks().len(), 1);
    assert_eq!(h.server.dirty_types(), vec![user_type]);

    assert_eq!(h.server.save().await.unwrap(), 1);
    assert!(h.server.dirty_blocks().is_empty());
    assert!(h.server.dirty_types().is_empty());
}

#[tokio::test]
async fn test_compressed_strings_read_back_exactly() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::open(dir.path(), false).await;
    h.server
        .set_schema(Schema::new().with_type(T::new("doc").prop(P::string("body")).prop(P::string("raw").compression("none"))))
        .await
        .unwrap();

    let body = "all work and no play makes jack a dull boy. ".repeat(40);
    let mut id = 0;
    let mut written = 0;
    h.modify(|ctx| {
        let mark = ctx.mark();
        id = serialize_create(ctx, "doc", &Payload::new().set("body", body.as_str()).set("raw", "short"))?;
        written = ctx.since(&mark);
        Ok(())
    })
    .await;
    assert!(written < body.len());

    let result = h.query(Query::new("doc").id(id).include(["body", "raw"])).await;
    assert_eq!(result.get("body"), Some(&Value::String(body.clone())));
    assert_eq!(result.get("raw"), Some(&Value::String("short".into())));

    let meta = h.query(Query::new("doc").id(id).include_meta("body")).await;
    let meta = meta.get("body").and_then(Value::as_row).unwrap();
    assert_eq!(meta["compressed"], Value::Bool(true));
    assert_eq!(meta["rawSize"], Value::Int(body.len() as i64));
}

#[tokio::test]
async fn test_stale_batches_are_discarded() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::open(dir.path(), false).await;
    h.server.set_schema(user_schema()).await.unwrap();
    let old_defs = h.server.defs();

    h.server
        .set_schema(Schema::new().with_type(T::new("user").prop(P::uint8("age"))))
        .await
        .unwrap();

    let mut ctx = ModifyCtx::new(old_defs, StringCodec::default(), 1, BTreeMap::new());
    serialize_create(&mut ctx, "user", &Payload::new().set("flap", 1u32)).unwrap();
    let result = h.server.flush_modify(ctx.finish()).await.unwrap();
    assert_eq!(result.offsets, None);
    assert_eq!(h.server.count("user").unwrap(), 0);
    assert_eq!(h.server.metrics().schema_mismatches, 1);

    // The merged schema keeps the old fields.
    h.modify(|ctx| serialize_create(ctx, "user", &Payload::new().set("flap", 5u32).set("age", 3u8)).map(|_| ()))
        .await;
    let rows = h.query(Query::new("user").include(["flap", "age"])).await.into_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["flap"], Value::Int(5));
    assert_eq!(rows[0]["age"], Value::Int(3));
}

#[tokio::test]
async fn test_deleted_nodes_disappear_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut h = Harness::open(dir.path(), false).await;
        h.server.set_schema(user_schema()).await.unwrap();
        let mut ids = Vec::new();
        h.modify(|ctx| {
            for name in ["a", "b", "c"] {
                ids.push(serialize_create(ctx, "user", &Payload::new().set("name", name))?);
            }
            Ok(())
        })
        .await;
        h.modify(|ctx| serialize_delete(ctx, "user", ids[1])).await;
        h.server.stop().await.unwrap();
    }

    let mut h = Harness::open(dir.path(), false).await;
    let rows = h.query(Query::new("user").include(["name"])).await.into_rows();
    let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![Value::String("a".into()), Value::String("c".into())]);

    // Ids keep counting from the persisted counter.
    let mut id = 0;
    h.modify(|ctx| {
        id = serialize_create(ctx, "user", &Payload::new().set("name", "d"))?;
        Ok(())
    })
    .await;
    assert_eq!(id, 4);
}
