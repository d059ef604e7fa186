use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use schema_registry_server::error::RegistryError;
use schema_registry_server::model::{CompatibilityLevel, SchemaType};
use schema_registry_server::registry::{Registry, VersionSpec, GLOBAL_SCOPE};
use schema_registry_server::storage::MemoryKeyValue;

const JSON_NAME_ONLY: &str = r#"{"type": "object", "properties": {"name": {"type": "string"}}}"#;
const JSON_AGE_ONLY: &str = r#"{"type": "object", "properties": {"age": {"type": "integer"}}}"#;
const AVRO_USER: &str =
    r#"{"type": "record", "name": "User", "fields": [{"name": "name", "type": "string"}]}"#;

fn stores() -> (Arc<MemoryKeyValue>, Arc<MemoryKeyValue>) {
    (
        Arc::new(MemoryKeyValue::new("schemas")),
        Arc::new(MemoryKeyValue::new("config")),
    )
}

async fn setup() -> Registry {
    let (kv_schemas, kv_config) = stores();
    let registry = Registry::new(kv_schemas, kv_config);
    registry.wait_ready(Duration::from_secs(2)).await.unwrap();
    registry
}

#[tokio::test]
async fn register_and_fetch_schemas() {
    let registry = setup().await;

    let id = registry
        .register("test-subject", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert!(id > 0);
    let stored = registry.get_schema(id).await.unwrap();
    assert_eq!(stored.schema, JSON_NAME_ONLY);
    assert_eq!(stored.schema_type, SchemaType::Json);

    let id2 = registry
        .register("avro-subject", AVRO_USER, SchemaType::Avro, None)
        .await
        .unwrap();
    let stored = registry.get_schema(id2).await.unwrap();
    assert_eq!(stored.schema_type, SchemaType::Avro);
}

#[tokio::test]
async fn register_rejects_unparseable_schema() {
    let registry = setup().await;
    let result = registry
        .register("test-subject", r#"{"invalid": "schema"#, SchemaType::Json, None)
        .await;
    assert!(matches!(result, Err(RegistryError::InvalidSchema(_))));
}

#[tokio::test]
async fn ids_and_versions_are_monotonic() {
    let registry = setup().await;
    let id1 = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let id2 = registry
        .register("s", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert!(id2 > id1);
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![1, 2]);

    let v1 = registry
        .get_schema_by_subject_version("s", VersionSpec::Number(1))
        .await
        .unwrap();
    let v2 = registry
        .get_schema_by_subject_version("s", VersionSpec::Latest)
        .await
        .unwrap();
    assert_eq!(v1.id, id1);
    assert_eq!(v2.id, id2);
    assert_eq!(v2.version, 2);
}

#[tokio::test]
async fn idempotent_reregistration_creates_no_version() {
    let registry = setup().await;
    let id1 = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let id2 = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert_eq!(id1, id2);
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![1]);
}

#[tokio::test]
async fn identical_content_shares_one_id_across_subjects() {
    let registry = setup().await;
    let id_a = registry
        .register("subject-a", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    // A second version under subject-a so the two subjects' version counters
    // diverge.
    registry
        .register("subject-a", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let id_b = registry
        .register("subject-b", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert_eq!(id_a, id_b);

    let in_a = registry
        .get_schema_by_subject_version("subject-a", VersionSpec::Number(1))
        .await
        .unwrap();
    let in_b = registry
        .get_schema_by_subject_version("subject-b", VersionSpec::Number(1))
        .await
        .unwrap();
    assert_eq!(in_a.id, in_b.id);
    assert_eq!(in_b.version, 1);
}

#[tokio::test]
async fn same_text_different_format_gets_a_fresh_id() {
    let registry = setup().await;
    // A JSON object that is both a valid JSON Schema and a valid (trivial)
    // Avro-parseable document would be contrived; distinct formats with
    // distinct texts must never share IDs.
    let id_json = registry
        .register("j", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let id_avro = registry
        .register("a", AVRO_USER, SchemaType::Avro, None)
        .await
        .unwrap();
    assert_ne!(id_json, id_avro);
}

#[tokio::test]
async fn missing_subject_and_version_report_not_found() {
    let registry = setup().await;
    assert!(matches!(
        registry.get_versions("nope").await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry
            .get_schema_by_subject_version("nope", VersionSpec::Number(1))
            .await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.get_schema(99).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn version_spec_parsing() {
    assert_eq!(VersionSpec::parse("latest").unwrap(), VersionSpec::Latest);
    assert_eq!(VersionSpec::parse("3").unwrap(), VersionSpec::Number(3));
    assert!(VersionSpec::parse("0").is_err());
    assert!(VersionSpec::parse("two").is_err());
}

#[tokio::test]
async fn compatibility_level_resolution_order() {
    let registry = setup().await;

    // Nothing configured: the default.
    assert_eq!(
        registry.compatibility_level("s").await.unwrap(),
        CompatibilityLevel::Backward
    );

    registry
        .set_compatibility_level(GLOBAL_SCOPE, CompatibilityLevel::Full)
        .await
        .unwrap();
    assert_eq!(
        registry.compatibility_level("s").await.unwrap(),
        CompatibilityLevel::Full
    );

    registry
        .set_compatibility_level("s", CompatibilityLevel::None)
        .await
        .unwrap();
    assert_eq!(
        registry.compatibility_level("s").await.unwrap(),
        CompatibilityLevel::None
    );
    // Other subjects still see the global value.
    assert_eq!(
        registry.compatibility_level("other").await.unwrap(),
        CompatibilityLevel::Full
    );
}

#[tokio::test]
async fn incompatible_registration_leaves_subject_unchanged() {
    let registry = setup().await;
    registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    // name flips string -> integer, breaking the default BACKWARD contract
    let breaking = r#"{"type": "object", "properties": {"name": {"type": "integer"}}}"#;
    let result = registry.register("s", breaking, SchemaType::Json, None).await;
    assert!(matches!(result, Err(RegistryError::Incompatible(_))));
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![1]);
}

#[tokio::test]
async fn level_none_accepts_everything() {
    let registry = setup().await;
    registry
        .set_compatibility_level("s", CompatibilityLevel::None)
        .await
        .unwrap();
    registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let breaking = r#"{"type": "object", "properties": {"name": {"type": "integer"}}}"#;
    registry
        .register("s", breaking, SchemaType::Json, None)
        .await
        .unwrap();
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn delete_version_keeps_the_by_id_entry() {
    let registry = setup().await;
    let id = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    registry
        .register("s", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();

    let deleted = registry
        .delete_schema_version("s", VersionSpec::Number(1))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    // The version is gone but the ID remains resolvable.
    assert!(matches!(
        registry
            .get_schema_by_subject_version("s", VersionSpec::Number(1))
            .await,
        Err(RegistryError::NotFound(_))
    ));
    assert_eq!(registry.get_schema(id).await.unwrap().id, id);
    // Deletion leaves a gap, never renumbers.
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![2]);
}

#[tokio::test]
async fn deleting_missing_version_reports_not_found() {
    let registry = setup().await;
    registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert!(matches!(
        registry.delete_schema_version("s", VersionSpec::Number(5)).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_subject_returns_ids_and_spares_shared_ones() {
    let registry = setup().await;
    let shared_id = registry
        .register("a", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let own_id = registry
        .register("a", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    registry
        .register("b", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();

    let deleted = registry.delete_subject("a").await.unwrap();
    assert_eq!(deleted, vec![shared_id, own_id]);
    assert!(matches!(
        registry.get_versions("a").await,
        Err(RegistryError::NotFound(_))
    ));

    // subject-b still references the shared text, so its ID must survive.
    assert_eq!(registry.get_schema(shared_id).await.unwrap().id, shared_id);
    // The ID unique to subject-a is gone.
    assert!(matches!(
        registry.get_schema(own_id).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleted_ids_never_regress() {
    let registry = setup().await;
    let id1 = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    registry.delete_subject("s").await.unwrap();
    let id2 = registry
        .register("s", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    // Even after every schema entry is purged, the allocator's high-water
    // mark keeps IDs strictly increasing.
    assert!(id2 > id1);
}

#[tokio::test]
async fn lookup_schema_by_content() {
    let registry = setup().await;
    registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();

    let found = registry
        .lookup_schema("s", JSON_NAME_ONLY, SchemaType::Json, false)
        .await
        .unwrap();
    assert_eq!(found.version, 1);

    assert!(matches!(
        registry
            .lookup_schema("s", JSON_AGE_ONLY, SchemaType::Json, false)
            .await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn normalized_lookup_ignores_whitespace() {
    let registry = setup().await;
    registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();

    let spaced = r#"{
        "type":    "object",
        "properties": {"name": {"type": "string"}}
    }"#;
    // Raw comparison misses, normalized comparison matches.
    assert!(registry
        .lookup_schema("s", spaced, SchemaType::Json, false)
        .await
        .is_err());
    let found = registry
        .lookup_schema("s", spaced, SchemaType::Json, true)
        .await
        .unwrap();
    assert_eq!(found.version, 1);
}

#[tokio::test]
async fn subjects_lists_live_subjects() {
    let registry = setup().await;
    registry
        .register("beta", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    registry
        .register("alpha", JSON_AGE_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert_eq!(
        registry.subjects().await.unwrap(),
        vec!["alpha".to_string(), "beta".to_string()]
    );

    registry.delete_subject("alpha").await.unwrap();
    assert_eq!(registry.subjects().await.unwrap(), vec!["beta".to_string()]);
}

#[tokio::test]
async fn envelope_round_trip_for_every_format() {
    let registry = setup().await;

    let avro_id = registry
        .register("avro", AVRO_USER, SchemaType::Avro, None)
        .await
        .unwrap();
    let data = json!({"name": "ada"});
    let bytes = registry.serialize(&data, avro_id).await.unwrap();
    assert_eq!(bytes[0], 0x00);
    assert_eq!(registry.deserialize(&bytes).await.unwrap(), data);

    let json_id = registry
        .register("json", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    let data = json!({"name": "bo"});
    let bytes = registry.serialize(&data, json_id).await.unwrap();
    assert_eq!(registry.deserialize(&bytes).await.unwrap(), data);

    let proto = r#"{
        "name": "user.proto", "syntax": "proto3",
        "messageType": [{
            "name": "User",
            "field": [
                {"name": "id", "number": 1, "type": "TYPE_INT32", "label": "LABEL_OPTIONAL"},
                {"name": "name", "number": 2, "type": "TYPE_STRING", "label": "LABEL_OPTIONAL"}
            ]
        }]
    }"#;
    let proto_id = registry
        .register("proto", proto, SchemaType::Protobuf, None)
        .await
        .unwrap();
    let data = json!({"id": 3, "name": "cy"});
    let bytes = registry.serialize(&data, proto_id).await.unwrap();
    assert_eq!(registry.deserialize(&bytes).await.unwrap(), data);
}

#[tokio::test]
async fn deserialize_rejects_bad_envelopes() {
    let registry = setup().await;
    assert!(matches!(
        registry.deserialize(&[0x00, 0x01]).await,
        Err(RegistryError::BadRequest(_))
    ));
    assert!(matches!(
        registry.deserialize(&[0x07, 0, 0, 0, 1, 2]).await,
        Err(RegistryError::BadRequest(_))
    ));
    // Valid envelope, unknown schema ID.
    assert!(matches!(
        registry.deserialize(&[0x00, 0, 0, 0, 42, 1]).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn watcher_propagates_deletes_across_registries() {
    let (kv_schemas, kv_config) = stores();
    let writer = Registry::new(kv_schemas.clone(), kv_config.clone());
    let reader = Registry::new(kv_schemas, kv_config);
    writer.wait_ready(Duration::from_secs(2)).await.unwrap();
    reader.wait_ready(Duration::from_secs(2)).await.unwrap();

    let id = writer
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    // Warm the reader's cache.
    assert_eq!(reader.get_schema(id).await.unwrap().id, id);

    writer.delete_subject("s").await.unwrap();

    // The reader's watch loop must evict the cached entry.
    let mut evicted = false;
    for _ in 0..100 {
        if reader.get_schema(id).await.is_err() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(evicted, "reader cache kept a deleted schema");

    writer.shutdown().await;
    reader.shutdown().await;
}

#[tokio::test]
async fn watcher_propagates_config_across_registries() {
    let (kv_schemas, kv_config) = stores();
    let writer = Registry::new(kv_schemas.clone(), kv_config.clone());
    let reader = Registry::new(kv_schemas, kv_config);
    writer.wait_ready(Duration::from_secs(2)).await.unwrap();
    reader.wait_ready(Duration::from_secs(2)).await.unwrap();

    // Warm the reader's config cache with the default.
    assert_eq!(
        reader.compatibility_level("s").await.unwrap(),
        CompatibilityLevel::Backward
    );

    writer
        .set_compatibility_level("s", CompatibilityLevel::FullTransitive)
        .await
        .unwrap();

    let mut observed = false;
    for _ in 0..100 {
        if reader.compatibility_level("s").await.unwrap() == CompatibilityLevel::FullTransitive {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed, "reader never observed the config change");

    writer.shutdown().await;
    reader.shutdown().await;
}

#[tokio::test]
async fn watchless_store_still_serves_requests() {
    let kv_schemas = Arc::new(MemoryKeyValue::without_watch("schemas"));
    let kv_config = Arc::new(MemoryKeyValue::without_watch("config"));
    let registry = Registry::new(kv_schemas, kv_config);

    // Readiness must not hang when the store has no change feed.
    registry.wait_ready(Duration::from_secs(2)).await.unwrap();

    let id = registry
        .register("s", JSON_NAME_ONLY, SchemaType::Json, None)
        .await
        .unwrap();
    assert_eq!(registry.get_schema(id).await.unwrap().id, id);
    assert_eq!(registry.get_versions("s").await.unwrap(), vec![1]);
}
