//! # Client Scenarios
//!
//! Sessions on an embedded database driving the full path: payloads into
//! modify batches, batches through the hooks, queries back out.
//! 1. Batching, tmp ids and alias operations
//! 2. Concurrent schema changes from two sessions
//! 3. Stale batches
//! 4. Live queries

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use rand::rngs::StdRng;
use rand::{distributions::Alphanumeric, Rng, SeedableRng};

use basedb_api::{BasedDb, DbClient, Operator, Order, Payload, Query, QueryResult, RefItem, Subscription};
use basedb_core::{Config, Error, PropSchema as P, Schema, TypeSchema as T, Value};

fn schema() -> Schema {
    Schema::new()
        .with_type(
            T::new("user")
                .prop(P::string("name"))
                .prop(P::alias("email"))
                .prop(P::string("country"))
                .prop(P::uint8("age"))
                .prop(P::number("score")),
        )
        .with_type(
            T::new("article")
                .prop(P::string("title"))
                .prop(P::references("contributors", "user", "articles")),
        )
}

async fn open(dir: &TempDir) -> BasedDb {
    let db = BasedDb::open(dir.path()).await.unwrap();
    db.set_schema(schema()).await.unwrap();
    db
}

fn names(rows: &[basedb_core::Row]) -> Vec<String> {
    rows.iter()
        .map(|r| r["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ============================================================================
// SCENARIO 1: Batching, tmp ids and alias operations
// ============================================================================

#[tokio::test]
async fn test_create_filter_sort() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    for (name, age) in [("ann", 31u8), ("bob", 25), ("cid", 47), ("dee", 19)] {
        let id = db
            .create("user", Payload::new().set("name", name).set("age", age))
            .await
            .unwrap();
        assert!(id.is_some());
    }

    let result = db
        .query(
            Query::new("user")
                .filter("age", Operator::Gt, 20u8)
                .sort("age", Order::Desc)
                .include(["name", "age"]),
        )
        .await
        .unwrap();
    assert_eq!(names(result.rows()), vec!["cid", "ann", "bob"]);

    let paged = db
        .query(Query::new("user").sort("age", Order::Asc).range(1, 2).include(["name"]))
        .await
        .unwrap();
    assert_eq!(names(paged.rows()), vec!["bob", "ann"]);
}

#[tokio::test]
async fn test_ops_before_a_flush_share_one_batch() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    // Nothing is awaited between these, so they land in one batch and the
    // article can point at users that have no real id yet.
    let ann = db.create_deferred("user", &Payload::new().set("name", "ann")).unwrap();
    let bob = db.create_deferred("user", &Payload::new().set("name", "bob")).unwrap();
    assert_eq!(ann.tmp().batch, bob.tmp().batch);
    let article = db
        .create_deferred(
            "article",
            &Payload::new()
                .set("title", "batched")
                .references("contributors", [RefItem::from(ann.tmp()), RefItem::from(bob.tmp())]),
        )
        .unwrap();

    let article = article.resolve().await.unwrap().unwrap();
    let ann = ann.resolve().await.unwrap().unwrap();
    let bob = bob.resolve().await.unwrap().unwrap();
    assert_ne!(ann, bob);

    let result = db
        .query(Query::new("article").id(article).include(["title", "contributors.name"]))
        .await
        .unwrap();
    let contributors = result.get("contributors").and_then(Value::as_list).unwrap();
    let ids: Vec<_> = contributors
        .iter()
        .map(|c| c.as_row().unwrap()["id"].as_i64().unwrap() as u32)
        .collect();
    assert_eq!(ids, vec![ann, bob]);
}

#[tokio::test]
async fn test_large_batches_split() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.client.max_modify_size = 256;
    let db = BasedDb::open_with_config(config).await.unwrap();
    db.set_schema(schema()).await.unwrap();

    let pending: Vec<_> = (0..50u8)
        .map(|i| db.create_deferred("user", &Payload::new().set("age", i)).unwrap())
        .collect();
    let batches: std::collections::BTreeSet<_> = pending.iter().map(|p| p.tmp().batch).collect();
    assert!(batches.len() > 1);

    let mut ids = Vec::new();
    for p in pending {
        ids.push(p.resolve().await.unwrap().unwrap());
    }
    assert_eq!(ids, (1..=50).collect::<Vec<u32>>());

    let count = db.query(Query::new("user").count()).await.unwrap();
    assert_eq!(count.get("count"), Some(&Value::Int(50)));

    // One operation that can never fit is rejected outright.
    let noise: String = StdRng::seed_from_u64(7)
        .sample_iter(&Alphanumeric)
        .take(2048)
        .map(char::from)
        .collect();
    let err = db
        .create("user", Payload::new().set("name", noise))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BufferOverflow { .. }));
}

#[tokio::test]
async fn test_upsert_and_insert_by_alias() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    let first = db
        .upsert("user", Payload::new().set("email", "ann@based.io").set("age", 30u8))
        .await
        .unwrap()
        .unwrap();
    let second = db
        .upsert("user", Payload::new().set("email", "ann@based.io").set("age", 31u8))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    let third = db
        .insert("user", Payload::new().set("email", "ann@based.io").set("age", 99u8))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third, first);

    let row = db.query(Query::new("user").alias("email", "ann@based.io")).await.unwrap();
    assert_eq!(row.get("age"), Some(&Value::Int(31)));
    assert_eq!(db.server().count("user").unwrap(), 1);
}

#[tokio::test]
async fn test_alias_creates_stamp_create_timestamps() {
    let dir = TempDir::new().unwrap();
    let db = BasedDb::open(dir.path()).await.unwrap();
    db.set_schema(
        Schema::new().with_type(
            T::new("session")
                .prop(P::alias("key"))
                .prop(P::uint8("hits"))
                .prop(P::timestamp("createdAt").on("create"))
                .prop(P::timestamp("updatedAt").on("update")),
        ),
    )
    .await
    .unwrap();

    let stamp = |row: &QueryResult, field: &str| match row.get(field) {
        Some(Value::Timestamp(ms)) => *ms,
        other => panic!("{} is {:?}", field, other),
    };

    db.upsert("session", Payload::new().set("key", "a").set("hits", 1u8))
        .await
        .unwrap()
        .unwrap();
    let row = db.query(Query::new("session").alias("key", "a")).await.unwrap();
    let created = stamp(&row, "createdAt");
    assert!(created > 0);
    assert!(stamp(&row, "updatedAt") > 0);

    db.upsert("session", Payload::new().set("key", "a").set("hits", 2u8))
        .await
        .unwrap()
        .unwrap();
    let row = db.query(Query::new("session").alias("key", "a")).await.unwrap();
    assert_eq!(stamp(&row, "createdAt"), created);
    assert_eq!(row.get("hits"), Some(&Value::Int(2)));

    db.insert("session", Payload::new().set("key", "b"))
        .await
        .unwrap()
        .unwrap();
    let row = db.query(Query::new("session").alias("key", "b")).await.unwrap();
    assert!(stamp(&row, "createdAt") > 0);
}

#[tokio::test]
async fn test_increment_round_trips() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    let id = db
        .create("user", Payload::new().set("score", 10.0))
        .await
        .unwrap()
        .unwrap();
    assert!(db.update("user", id, Payload::new().increment("score", 2.5)).await.unwrap());
    let row = db.query(Query::new("user").id(id).include(["score"])).await.unwrap();
    assert_eq!(row.get("score"), Some(&Value::Number(12.5)));

    assert!(db.update("user", id, Payload::new().increment("score", -2.5)).await.unwrap());
    let row = db.query(Query::new("user").id(id).include(["score"])).await.unwrap();
    assert_eq!(row.get("score"), Some(&Value::Number(10.0)));
}

#[tokio::test]
async fn test_group_by_counts() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    for (country, age) in [("nl", 20u8), ("nl", 40), ("de", 30)] {
        db.create("user", Payload::new().set("country", country).set("age", age))
            .await
            .unwrap();
    }
    let result = db
        .query(Query::new("user").group_by("country").count().avg("age"))
        .await
        .unwrap();
    assert_eq!(result.get("nl.count"), Some(&Value::Int(2)));
    assert_eq!(result.get("nl.age.avg"), Some(&Value::Number(30.0)));
    assert_eq!(result.get("de.count"), Some(&Value::Int(1)));
}

#[tokio::test]
async fn test_aggregates_ignore_include() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    for (name, score) in [("ann", 1.5), ("bob", 2.0), ("cid", 4.5)] {
        db.create("user", Payload::new().set("name", name).set("score", score))
            .await
            .unwrap();
    }
    let plain = db.query(Query::new("user").sum("score").count()).await.unwrap();
    let narrowed = db
        .query(Query::new("user").include(["name"]).sum("score").count())
        .await
        .unwrap();
    assert_eq!(plain.get("score.sum"), Some(&Value::Number(8.0)));
    assert_eq!(plain.get("count"), Some(&Value::Int(3)));
    assert_eq!(narrowed.get("score.sum"), plain.get("score.sum"));
    assert_eq!(narrowed.get("count"), plain.get("count"));
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let db = open(&dir).await;
        let id = db.create("user", Payload::new().set("name", "ann")).await.unwrap().unwrap();
        db.stop().await.unwrap();
        id
    };

    let db = BasedDb::open(dir.path()).await.unwrap();
    let row = db.query(Query::new("user").id(id).include(["name"])).await.unwrap();
    assert_eq!(row.get("name"), Some(&Value::String("ann".into())));

    let next = db.create("user", Payload::new().set("name", "bob")).await.unwrap().unwrap();
    assert_eq!(next, id + 1);
}

// ============================================================================
// SCENARIO 2: Concurrent schema changes from two sessions
// ============================================================================

#[tokio::test]
async fn test_concurrent_additive_schemas_merge() {
    let dir = TempDir::new().unwrap();
    let db = BasedDb::open(dir.path()).await.unwrap();
    let a = db.client().unwrap();
    let b = db.client().unwrap();

    let (ra, rb) = tokio::join!(
        a.set_schema(Schema::new().with_type(T::new("thing").prop(P::uint32("size")))),
        b.set_schema(Schema::new().with_type(T::new("thing").prop(P::string("label")))),
    );
    ra.unwrap();
    rb.unwrap();

    let x = a.create("thing", Payload::new().set("size", 7u32)).await.unwrap().unwrap();
    let y = b.create("thing", Payload::new().set("label", "y")).await.unwrap().unwrap();

    let rows = a
        .query(Query::new("thing").include(["size", "label"]))
        .await
        .unwrap()
        .into_rows();
    assert_eq!(rows.len(), 2);
    let by_id = |id: u32| rows.iter().find(|r| r["id"] == Value::Int(id as i64)).unwrap();
    assert_eq!(by_id(x)["size"], Value::Int(7));
    assert_eq!(by_id(x)["label"], Value::String(String::new()));
    assert_eq!(by_id(y)["size"], Value::Int(0));
    assert_eq!(by_id(y)["label"], Value::String("y".into()));
}

// ============================================================================
// SCENARIO 3: Stale batches
// ============================================================================

#[tokio::test]
async fn test_batch_on_old_schema_resolves_to_none() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    let mut config = db.server().config().clone();
    config.client.flush_delay = Duration::from_secs(3600);
    let slow = DbClient::with_config(Arc::new(db.server().clone()), &config).unwrap();

    let pending = slow.create_deferred("user", &Payload::new().set("name", "late")).unwrap();
    db.set_schema(Schema::new().with_type(T::new("user").prop(P::boolean("active"))))
        .await
        .unwrap();

    slow.drain().await.unwrap();
    assert_eq!(pending.resolve().await.unwrap(), None);
    assert_eq!(db.server().count("user").unwrap(), 0);
    assert_eq!(db.server().metrics().schema_mismatches, 1);

    // The session picked up the new schema; its next batch goes through.
    let id = slow.create_deferred("user", &Payload::new().set("active", true)).unwrap();
    slow.drain().await.unwrap();
    assert!(id.resolve().await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalid_payload_leaves_batch_intact() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    let ok = db.create_deferred("user", &Payload::new().set("name", "ann")).unwrap();
    let err = db.create_deferred("user", &Payload::new().set("age", 300u32)).unwrap_err();
    assert!(err.is_recoverable());
    assert!(db.create_deferred("nope", &Payload::new()).is_err());

    assert!(ok.resolve().await.unwrap().is_some());
    assert_eq!(db.server().count("user").unwrap(), 1);
}

// ============================================================================
// SCENARIO 4: Live queries
// ============================================================================

async fn next(sub: &mut Subscription) -> QueryResult {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("subscription update")
        .expect("backend alive")
        .unwrap()
}

#[tokio::test]
async fn test_subscription_follows_relevant_changes() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;
    let mut sub = db.subscribe(Query::new("user").include(["name"]));

    assert!(next(&mut sub).await.is_empty());

    db.create("user", Payload::new().set("name", "ann")).await.unwrap();
    assert_eq!(names(next(&mut sub).await.rows()), vec!["ann"]);

    // An article does not touch the user query; the next update is bob.
    db.create("article", Payload::new().set("title", "unrelated")).await.unwrap();
    db.create("user", Payload::new().set("name", "bob")).await.unwrap();
    assert_eq!(names(next(&mut sub).await.rows()), vec!["ann", "bob"]);
}
