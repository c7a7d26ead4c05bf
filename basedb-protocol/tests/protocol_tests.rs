//! Integration tests for basedb-protocol: builders against parsers.

use std::collections::BTreeMap;
use std::sync::Arc;

use basedb_core::{compile, config::SchemaConfig, string::StringCodec, PropSchema as P, Schema, TypeDefs, TypeSchema as T, Value};
use basedb_protocol::modify::*;
use basedb_protocol::query::*;

fn defs() -> Arc<TypeDefs> {
    let schema = Schema::new()
        .locale("en")
        .locale("de")
        .with_type(
            T::new("user")
                .prop(P::string("name"))
                .prop(P::uint32("flap"))
                .prop(P::number("score"))
                .prop(P::alias("email"))
                .prop(P::text("bio"))
                .prop(P::cardinality("visitors"))
                .prop(P::reference("bestFriend", "user", "bestFriendOf")),
        )
        .with_type(
            T::new("article")
                .prop(P::string("title"))
                .prop(P::references("contributors", "user", "articles").edge(P::uint32("$rating"))),
        );
    Arc::new(compile(&schema, &SchemaConfig::default()).unwrap())
}

fn ctx(defs: &Arc<TypeDefs>) -> ModifyCtx {
    ModifyCtx::new(defs.clone(), StringCodec::default(), 1, BTreeMap::new())
}

mod modify_tests {
    use super::*;

    #[test]
    fn test_create_update_delete_parse_back() {
        let defs = defs();
        let user = defs.get("user").unwrap();
        let mut ctx = ctx(&defs);

        let id = serialize_create(
            &mut ctx,
            "user",
            &Payload::new().set("name", "youzi").set("flap", 10u32).set("visitors", Value::List(vec!["a".into(), "b".into()])),
        )
        .unwrap();
        assert_eq!(id, 1);
        serialize_update(&mut ctx, "user", id, &Payload::new().increment("flap", 2.0)).unwrap();
        serialize_delete(&mut ctx, "user", 7).unwrap();
        let buf = ctx.finish();

        let batch = parse_batch(&buf).unwrap();
        assert_eq!(batch.schema_hash, defs.hash);
        assert_eq!(batch.trailer.created(user.id), Some((0, 1)));

        let instrs: Vec<Instr> = batch.iter().collect::<basedb_core::Result<_>>().unwrap();
        assert_eq!(instrs[0], Instr::SwitchType(user.id));
        let Instr::Create { id, blocks } = &instrs[1] else { panic!("expected create") };
        assert_eq!(*id, 1);
        assert!(matches!(blocks[0], Block::Main(m) if m.len() == user.main_len));
        assert!(blocks.iter().any(|b| matches!(b, Block::Field { .. })));
        assert!(blocks.iter().any(|b| matches!(b, Block::Cardinality { hashes, .. } if hashes.len() == 2)));

        let Instr::Update { blocks, .. } = &instrs[2] else { panic!("expected update") };
        let flap = user.prop("flap").unwrap();
        assert_eq!(
            blocks[0],
            Block::Increment {
                start: flap.start as u16,
                kind: flap.kind,
                delta: 2.0
            }
        );
        assert_eq!(instrs[3], Instr::Delete { id: 7 });
    }

    #[test]
    fn test_partial_main_only_carries_set_fields() {
        let defs = defs();
        let user = defs.get("user").unwrap();
        let mut ctx = ctx(&defs);
        serialize_update(&mut ctx, "user", 3, &Payload::new().set("score", 1.5)).unwrap();
        let buf = ctx.finish();
        let batch = parse_batch(&buf).unwrap();
        let instrs: Vec<Instr> = batch.iter().collect::<basedb_core::Result<_>>().unwrap();
        let Instr::Update { blocks, .. } = &instrs[1] else { panic!("expected update") };
        let Block::PartialMain(slices) = &blocks[0] else { panic!("expected partial main") };
        let score = user.prop("score").unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].0 as usize, score.start);
        assert_eq!(slices[0].1, &1.5f64.to_le_bytes()[..]);
    }

    #[test]
    fn test_tmp_ids_and_edges() {
        let defs = defs();
        let mut ctx = ctx(&defs);
        let user = defs.get("user").unwrap();
        let local = serialize_create(&mut ctx, "user", &Payload::new().set("name", "a")).unwrap();
        let tmp = TmpId {
            batch: ctx.batch(),
            type_id: user.id,
            local,
        };
        serialize_create(
            &mut ctx,
            "article",
            &Payload::new().references(
                "contributors",
                vec![RefItem::edges(tmp, Payload::new().set("$rating", 5u32)), RefItem::Id(9)],
            ),
        )
        .unwrap();
        let buf = ctx.finish();
        let batch = parse_batch(&buf).unwrap();
        let instrs: Vec<Instr> = batch.iter().collect::<basedb_core::Result<_>>().unwrap();
        let Instr::Create { blocks, .. } = instrs.last().unwrap() else { panic!("expected create") };
        let Block::References { ops, .. } = blocks.last().unwrap() else { panic!("expected references") };
        assert_eq!(ops[0], RefOp::Clear);
        let RefOp::WithMeta(items) = &ops[1] else { panic!("expected meta run") };
        assert!(items[0].is_tmp);
        assert_eq!(items[0].id, local);
        assert!(matches!(items[0].edges[0], Block::PartialMain(_)));
        assert_eq!(ops[2], RefOp::Ids(vec![9]));
    }

    #[test]
    fn test_rejected_operation_rolls_back() {
        let defs = defs();
        let mut ctx = ctx(&defs);
        serialize_create(&mut ctx, "user", &Payload::new().set("name", "ok")).unwrap();
        let before = ctx.len();
        let mark = ctx.mark();
        let err = serialize_create(&mut ctx, "user", &Payload::new().set("flap", -1i32)).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_VALUE");
        ctx.rollback(mark);
        assert_eq!(ctx.len(), before);
        assert_eq!(ctx.ops(), 1);
        assert_eq!(ctx.last_ids().get(&defs.get("user").unwrap().id), Some(&1));
    }

    #[test]
    fn test_stale_tmp_id_is_rejected() {
        let defs = defs();
        let user = defs.get("user").unwrap();
        let mut ctx = ctx(&defs);
        let stale = TmpId {
            batch: 0,
            type_id: user.id,
            local: 1,
        };
        assert!(serialize_create(&mut ctx, "user", &Payload::new().reference("bestFriend", stale)).is_err());
    }

    #[test]
    fn test_upsert_carries_normalized_alias() {
        let defs = defs();
        let mut ctx = ctx(&defs);
        serialize_upsert(&mut ctx, "user", &Payload::new().set("email", "a@b.c").set("flap", 1u32)).unwrap();
        assert!(serialize_upsert(&mut ctx, "user", &Payload::new().set("flap", 1u32)).is_err());
    }
}

mod query_tests {
    use super::*;

    #[test]
    fn test_batch_roundtrip_keeps_plans() {
        let defs = defs();
        let a = compile_query(
            Query::new("user")
                .include(["name", "bestFriend.flap"])
                .filter("flap", Operator::Gt, 3u32)
                .or(|f| f.filter("name", Operator::Eq, "youzi"))
                .sort("score", Order::Desc)
                .range(0, 10)
                .def(),
            &defs,
        )
        .unwrap();
        let b = compile_query(Query::new("article").sum("contributors.$rating").def(), &defs);
        assert!(b.is_err());
        let c = compile_query(Query::new("user").group_by("name").avg("score").def(), &defs).unwrap();

        let buf = encode_batch([&a.plan, &c.plan]).unwrap();
        let decoded = decode_batch(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].1, a.plan);
        assert_eq!(decoded[1].1, c.plan);
        assert_eq!(decoded[0].0, query_id(&encode_body(&a.plan)));
    }

    #[test]
    fn test_vector_search_checks_dimensions() {
        let schema = Schema::new().with_type(T::new("doc").prop(P::vector("embedding", 3)));
        let defs = compile(&schema, &SchemaConfig::default()).unwrap();
        assert!(compile_query(
            Query::new("doc").search_vector("embedding", vec![1.0, 0.0, 0.0], Distance::Cosine, 0.5).def(),
            &defs
        )
        .is_ok());
        assert!(compile_query(
            Query::new("doc").search_vector("embedding", vec![1.0, 0.0], Distance::Cosine, 0.5).def(),
            &defs
        )
        .is_err());
    }
}
