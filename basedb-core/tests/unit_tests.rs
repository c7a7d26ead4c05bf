//! Unit tests for basedb-core

use basedb_core::{
    compile,
    config::SchemaConfig,
    schema::{decode_main, default_main, encode_main},
    string::StringCodec,
    Error, PropKind, PropSchema as P, Schema, SchemaError, TypeSchema as T, Value,
};

fn article_schema() -> Schema {
    Schema::new()
        .locale("en")
        .locale("nl")
        .with_type(
            T::new("user")
                .prop(P::string("name"))
                .prop(P::uint32("flap"))
                .prop(P::alias("email")),
        )
        .with_type(
            T::new("article")
                .prop(P::string("title"))
                .prop(P::text("body"))
                .prop(P::timestamp("createdAt").on("create"))
                .prop(P::timestamp("updatedAt").on("update"))
                .prop(P::references("contributors", "user", "articles").edge(P::uint32("$rating")))
                .prop(P::reference("author", "user", "authored")),
        )
}

mod schema_tests {
    use super::*;

    #[test]
    fn test_type_ids_are_stable_across_merge() {
        let mut active = article_schema();
        active.assign_ids();
        let merged = active.merge(&Schema::new().with_type(T::new("tag").prop(P::string("label"))));
        let a = compile(&active, &SchemaConfig::default()).unwrap();
        let b = compile(&merged, &SchemaConfig::default()).unwrap();
        assert_eq!(a.get("user").unwrap().id, b.get("user").unwrap().id);
        assert_eq!(a.get("article").unwrap().main_len, b.get("article").unwrap().main_len);
        assert_eq!(b.get("tag").unwrap().id, 3);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_auto_timestamps() {
        let defs = compile(&article_schema(), &SchemaConfig::default()).unwrap();
        let article = defs.get("article").unwrap();
        let on_create: Vec<_> = article
            .auto_timestamps(basedb_core::schema::AutoTimestamp::Create)
            .map(|p| p.path.as_str())
            .collect();
        let on_update: Vec<_> = article
            .auto_timestamps(basedb_core::schema::AutoTimestamp::Update)
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(on_create, vec!["createdAt", "updatedAt"]);
        assert_eq!(on_update, vec!["updatedAt"]);
    }

    #[test]
    fn test_single_and_multi_references_get_inverses() {
        let defs = compile(&article_schema(), &SchemaConfig::default()).unwrap();
        let user = defs.get("user").unwrap();
        assert_eq!(user.prop("authored").unwrap().kind, PropKind::References);
        assert_eq!(user.prop("articles").unwrap().kind, PropKind::References);
        let author = defs.get("article").unwrap().prop("author").unwrap();
        assert_eq!(author.kind, PropKind::Reference);
        assert!(defs.edge_def(author).is_none());
    }

    #[test]
    fn test_on_requires_timestamp() {
        let schema = Schema::new().with_type(T::new("t").prop(P::uint32("n").on("create")));
        match compile(&schema, &SchemaConfig::default()) {
            Err(Error::Schema { errors }) => {
                assert!(matches!(&errors[0], SchemaError::InvalidType { .. }))
            }
            other => panic!("unexpected {:?}", other.map(|d| d.hash)),
        }
    }

    #[test]
    fn test_block_capacity_override() {
        let schema = Schema::new().with_type(T::new("t").block_capacity(3).prop(P::uint8("n")));
        let defs = compile(&schema, &SchemaConfig::default()).unwrap();
        assert_eq!(defs.get("t").unwrap().block_capacity, 3);
    }
}

mod layout_tests {
    use super::*;

    #[test]
    fn test_edge_type_has_own_layout() {
        let defs = compile(&article_schema(), &SchemaConfig::default()).unwrap();
        let contributors = defs.get("article").unwrap().prop("contributors").unwrap();
        let edge = defs.edge_def(contributors).unwrap();
        assert_eq!(edge.name, "$article_contributors");
        assert_eq!(edge.main_len, 4);

        let rating = edge.prop("$rating").unwrap();
        let mut main = default_main(edge);
        encode_main(rating, &Value::Int(1), &mut main).unwrap();
        assert_eq!(decode_main(rating, &main).unwrap(), Value::Int(1));
    }
}

mod string_tests {
    use super::*;

    #[test]
    fn test_compressed_field_is_shorter_and_exact() {
        let codec = StringCodec::default();
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(20);
        let encoded = codec.encode(&text, true).unwrap();
        assert!(encoded.len() < text.len());
        assert_eq!(codec.decode(&encoded).unwrap(), text);
    }

    #[test]
    fn test_nfkd_normalisation() {
        let codec = StringCodec::default();
        let encoded = codec.encode("ﬁ", false).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), "fi");
    }
}
