//! SQLite backend integration tests: CRUD, versioning, history and
//! conditional operations.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use helios_clinical_store::backends::sqlite::SqliteBackend;
use helios_clinical_store::core::{
    ConditionalCreateResult, ConditionalDeleteResult, ConditionalPatchResult, ConditionalStorage,
    ConditionalUpdateResult, HistoryParams, InstanceHistoryProvider, PatchFormat,
    ResourceStorage, SearchProvider, TypeHistoryProvider, VersionedStorage,
};
use helios_clinical_store::error::{
    ConcurrencyError, ResourceError, StorageError, ValidationError,
};
use helios_clinical_store::events::{ChangeKind, CollectingPublisher};
use helios_clinical_store::types::{Pagination, ResourceMethod};

// ============================================================================
// Create / Read
// ============================================================================

macro_rules! round_trip_test {
    ($name:ident, $resource_type:literal, $doc:expr) => {
        paste::paste! {
            #[tokio::test]
            async fn [<test_round_trip_ $name>]() {
                let backend = create_backend();
                let doc = $doc;

                let created = backend.create($resource_type, doc.clone()).await.unwrap();
                let read = backend.read($resource_type, created.id()).await.unwrap();

                let mut stored = read.content().clone();
                let meta = stored.as_object_mut().unwrap().remove("meta").unwrap();
                stored.as_object_mut().unwrap().remove("id");
                assert_eq!(stored, doc);
                assert_eq!(meta["versionId"], "1");
                assert!(meta["lastUpdated"].is_string());
            }
        }
    };
}

round_trip_test!(patient, "Patient", PatientFixture::new("Alpha").with_given(&["Ann"]).to_json());
round_trip_test!(
    observation,
    "Observation",
    ObservationFixture::new("8867-4", "Patient/p1")
        .with_effective("2024-01-15T10:30:00Z")
        .with_quantity(72.0, "/min")
        .to_json()
);
round_trip_test!(condition, "Condition", condition("Patient/p1", "active"));
round_trip_test!(
    encounter,
    "Encounter",
    json!({
        "resourceType": "Encounter",
        "status": "finished",
        "class": {"system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": "AMB"},
        "period": {"start": "2024-02-01T09:00:00Z", "end": "2024-02-01T09:30:00Z"}
    })
);

#[tokio::test]
async fn test_create_assigns_id_and_version() {
    let backend = create_backend();

    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();

    assert!(!created.id().is_empty());
    assert_eq!(created.version_id(), "1");
    assert_eq!(created.method(), Some(ResourceMethod::Post));
    assert_eq!(created.content()["meta"]["versionId"], "1");
}

#[tokio::test]
async fn test_create_keeps_supplied_id() {
    let backend = create_backend();

    let created = backend
        .create("Patient", PatientFixture::new("Smith").with_id("p-100").to_json())
        .await
        .unwrap();

    assert_eq!(created.id(), "p-100");
    assert_eq!(created.url(), "Patient/p-100");
}

#[tokio::test]
async fn test_create_duplicate_id_fails() {
    let backend = create_backend();
    let doc = PatientFixture::new("Smith").with_id("dup").to_json();

    backend.create("Patient", doc.clone()).await.unwrap();
    let result = backend.create("Patient", doc).await;

    assert!(matches!(
        result,
        Err(StorageError::Resource(ResourceError::AlreadyExists { .. }))
    ));
}

#[tokio::test]
async fn test_create_rejects_malformed_documents() {
    let backend = create_backend();

    let wrong_type = backend
        .create("Patient", json!({"resourceType": "Observation"}))
        .await;
    assert!(matches!(wrong_type, Err(StorageError::Validation(_))));

    let unknown = backend
        .create("Spaceship", json!({"resourceType": "Spaceship"}))
        .await;
    assert!(matches!(
        unknown,
        Err(StorageError::Validation(ValidationError::UnsupportedResourceType { .. }))
    ));

    let bad_id = backend
        .create("Patient", json!({"resourceType": "Patient", "id": "no spaces allowed"}))
        .await;
    assert!(matches!(bad_id, Err(StorageError::Validation(_))));

    let missing = backend.create("Patient", json!({"name": []})).await;
    assert!(matches!(
        missing,
        Err(StorageError::Validation(ValidationError::MissingRequiredField { .. }))
    ));
}

#[tokio::test]
async fn test_read_missing_is_not_found() {
    let backend = create_backend();

    let err = backend.read("Patient", "nope").await.unwrap_err();

    assert!(matches!(
        err,
        StorageError::Resource(ResourceError::NotFound { .. })
    ));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn test_exists_count_and_read_batch() {
    let backend = create_backend();
    for id in ["a", "b", "c"] {
        backend
            .create("Patient", PatientFixture::new("Smith").with_id(id).to_json())
            .await
            .unwrap();
    }
    backend
        .create("Organization", organization("org-1", "Acme"))
        .await
        .unwrap();
    backend.delete("Patient", "c").await.unwrap();

    assert!(backend.exists("Patient", "a").await.unwrap());
    assert!(!backend.exists("Patient", "c").await.unwrap());
    assert_eq!(backend.count(Some("Patient")).await.unwrap(), 2);
    assert_eq!(backend.count(None).await.unwrap(), 3);

    let batch = backend
        .read_batch("Patient", &["a", "c", "zzz", "b"])
        .await
        .unwrap();
    let ids: Vec<&str> = batch.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

// ============================================================================
// Update / Delete
// ============================================================================

#[tokio::test]
async fn test_update_increments_version() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Before").to_json())
        .await
        .unwrap();

    let updated = backend
        .update(
            "Patient",
            created.id(),
            PatientFixture::new("After").to_json(),
            Some("1"),
        )
        .await
        .unwrap();

    assert_eq!(updated.version_id(), "2");
    let read = backend.read("Patient", created.id()).await.unwrap();
    assert_eq!(read.content()["name"][0]["family"], "After");
    assert_eq!(read.version_id(), "2");
}

#[tokio::test]
async fn test_update_with_stale_version_conflicts() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();
    backend
        .update("Patient", created.id(), PatientFixture::new("Jones").to_json(), None)
        .await
        .unwrap();

    let err = backend
        .update(
            "Patient",
            created.id(),
            PatientFixture::new("Brown").to_json(),
            Some("W/\"1\""),
        )
        .await
        .unwrap_err();

    match err {
        StorageError::Concurrency(ConcurrencyError::VersionConflict {
            expected_version,
            actual_version,
            ..
        }) => {
            assert_eq!(expected_version, "1");
            assert_eq!(actual_version, "2");
        }
        other => panic!("expected version conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_update_missing_is_not_found() {
    let backend = create_backend();

    let result = backend
        .update("Patient", "ghost", PatientFixture::new("Smith").to_json(), None)
        .await;

    assert!(matches!(result, Err(e) if e.is_not_found()));
}

#[tokio::test]
async fn test_create_or_update() {
    let backend = create_backend();

    let (first, created) = backend
        .create_or_update("Patient", "chosen", PatientFixture::new("One").to_json())
        .await
        .unwrap();
    assert!(created);
    assert_eq!(first.version_id(), "1");

    let (second, created) = backend
        .create_or_update("Patient", "chosen", PatientFixture::new("Two").to_json())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.version_id(), "2");
}

#[tokio::test]
async fn test_delete_visibility() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();
    let id = created.id().to_string();
    backend
        .update("Patient", &id, PatientFixture::new("Smyth").to_json(), None)
        .await
        .unwrap();

    let tombstone = backend.delete("Patient", &id).await.unwrap();
    assert_eq!(tombstone.version_id(), "3");
    assert!(tombstone.is_deleted());

    let read = backend.read("Patient", &id).await.unwrap_err();
    assert!(read.is_not_found());
    assert_eq!(read.http_status(), 410);

    let last = backend.vread("Patient", &id, "3").await.unwrap();
    assert!(last.is_deleted());
    assert!(last.content().is_null());

    let before = backend.vread("Patient", &id, "2").await.unwrap();
    assert_eq!(before.content()["name"][0]["family"], "Smyth");

    // Deleting again changes nothing.
    let again = backend.delete("Patient", &id).await.unwrap();
    assert_eq!(again.version_id(), "3");
    assert_eq!(
        backend.history_instance_count("Patient", &id).await.unwrap(),
        3
    );

    let found = backend
        .search_params("Patient", &params(&[("family", "smyth")]))
        .await
        .unwrap();
    assert!(found.resources.is_empty());
}

#[tokio::test]
async fn test_update_revives_deleted_resource() {
    let backend = create_backend();
    backend
        .create("Patient", PatientFixture::new("Smith").with_id("lazarus").to_json())
        .await
        .unwrap();
    backend.delete("Patient", "lazarus").await.unwrap();

    let revived = backend
        .update("Patient", "lazarus", PatientFixture::new("Smith").to_json(), None)
        .await
        .unwrap();

    assert_eq!(revived.version_id(), "3");
    assert!(backend.exists("Patient", "lazarus").await.unwrap());
}

#[tokio::test]
async fn test_delete_with_match() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();

    let stale = backend.delete_with_match("Patient", created.id(), "9").await;
    assert!(matches!(stale, Err(e) if e.is_conflict()));

    backend
        .delete_with_match("Patient", created.id(), "1")
        .await
        .unwrap();
    assert!(!backend.exists("Patient", created.id()).await.unwrap());
}

#[tokio::test]
async fn test_patch_formats() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").with_gender("male").to_json())
        .await
        .unwrap();

    let patched = backend
        .patch(
            "Patient",
            created.id(),
            &PatchFormat::JsonPatch(json!([
                {"op": "replace", "path": "/name/0/family", "value": "Jones"}
            ])),
            Some("1"),
        )
        .await
        .unwrap();
    assert_eq!(patched.version_id(), "2");
    assert_eq!(patched.content()["name"][0]["family"], "Jones");

    let merged = backend
        .patch(
            "Patient",
            created.id(),
            &PatchFormat::MergePatch(json!({"gender": null, "active": true})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(merged.version_id(), "3");
    assert!(merged.content().get("gender").is_none());
    assert_eq!(merged.content()["active"], true);

    let id_change = backend
        .patch(
            "Patient",
            created.id(),
            &PatchFormat::MergePatch(json!({"id": "other"})),
            None,
        )
        .await;
    assert!(matches!(id_change, Err(StorageError::Validation(_))));
}

// ============================================================================
// Versioning / History
// ============================================================================

#[tokio::test]
async fn test_history_has_n_plus_one_entries_newest_first() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("V0").to_json())
        .await
        .unwrap();
    let id = created.id().to_string();
    for i in 1..=4 {
        backend
            .update("Patient", &id, PatientFixture::new(format!("V{}", i)).to_json(), None)
            .await
            .unwrap();
    }

    let page = backend
        .history_instance("Patient", &id, &HistoryParams::new())
        .await
        .unwrap();

    let versions: Vec<&str> = page.items.iter().map(|e| e.resource.version_id()).collect();
    assert_eq!(versions, vec!["5", "4", "3", "2", "1"]);
    assert_eq!(page.items[4].method, ResourceMethod::Post);
    assert_eq!(page.items[0].method, ResourceMethod::Put);
    assert_eq!(
        backend.list_versions("Patient", &id).await.unwrap(),
        vec!["1", "2", "3", "4", "5"]
    );
    assert_eq!(
        backend.current_version("Patient", &id).await.unwrap(),
        Some("5".to_string())
    );
}

#[tokio::test]
async fn test_history_pages_with_cursor() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("V").to_json())
        .await
        .unwrap();
    let id = created.id().to_string();
    for _ in 0..4 {
        backend
            .update("Patient", &id, PatientFixture::new("V").to_json(), None)
            .await
            .unwrap();
    }

    let first = backend
        .history_instance("Patient", &id, &HistoryParams::new().count(2))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    let cursor = first.page_info.next_cursor.clone().unwrap();

    let second = backend
        .history_instance(
            "Patient",
            &id,
            &HistoryParams::new().cursor(Pagination::from_cursor(2, &cursor).unwrap()),
        )
        .await
        .unwrap();
    let versions: Vec<&str> = second.items.iter().map(|e| e.resource.version_id()).collect();
    assert_eq!(versions, vec!["3", "2"]);
}

#[tokio::test]
async fn test_history_of_deleted_resource_keeps_tombstone() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();
    backend.delete("Patient", created.id()).await.unwrap();

    let all = backend
        .history_instance("Patient", created.id(), &HistoryParams::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.items[0].method, ResourceMethod::Delete);
    assert!(all.items[0].resource.is_deleted());

    let live_only = backend
        .history_instance(
            "Patient",
            created.id(),
            &HistoryParams::new().include_deleted(false),
        )
        .await
        .unwrap();
    assert_eq!(live_only.len(), 1);
}

#[tokio::test]
async fn test_type_history_spans_resources() {
    let backend = create_backend();
    let a = backend
        .create("Patient", PatientFixture::new("A").to_json())
        .await
        .unwrap();
    backend
        .create("Patient", PatientFixture::new("B").to_json())
        .await
        .unwrap();
    backend
        .update("Patient", a.id(), PatientFixture::new("A2").to_json(), None)
        .await
        .unwrap();
    backend
        .create("Organization", organization("o1", "Acme"))
        .await
        .unwrap();

    let page = backend
        .history_type("Patient", &HistoryParams::new())
        .await
        .unwrap();

    assert_eq!(page.len(), 3);
    assert_eq!(page.items[0].resource.id(), a.id());
    assert_eq!(page.items[0].resource.version_id(), "2");
    assert_eq!(backend.history_type_count("Patient").await.unwrap(), 3);
}

#[tokio::test]
async fn test_vread_unknown_version() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();

    let result = backend.vread("Patient", created.id(), "7").await;

    assert!(matches!(
        result,
        Err(StorageError::Resource(ResourceError::VersionNotFound { .. }))
    ));
}

// ============================================================================
// Conditional operations
// ============================================================================

#[tokio::test]
async fn test_conditional_create_is_idempotent() {
    let backend = create_backend();
    let doc = PatientFixture::new("Smith")
        .with_identifier("http://hospital.example/mrn", "12345")
        .to_json();
    let criteria = "identifier=http://hospital.example/mrn|12345";

    let first = backend
        .conditional_create("Patient", doc.clone(), criteria)
        .await
        .unwrap();
    let second = backend
        .conditional_create("Patient", doc, criteria)
        .await
        .unwrap();

    assert!(first.is_created());
    assert!(matches!(second, ConditionalCreateResult::Exists(_)));
    assert_eq!(first.resource().id(), second.resource().id());
    assert_eq!(backend.count(Some("Patient")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_conditional_create_concurrent_requests_create_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::open(dir.path().join("conditional.db")).unwrap();
    backend.init_schema().unwrap();
    let backend = Arc::new(backend);
    let criteria = "identifier=http://hospital.example/mrn|777";

    let mut handles = Vec::new();
    for _ in 0..4 {
        let backend = Arc::clone(&backend);
        handles.push(tokio::spawn(async move {
            let doc = PatientFixture::new("Race")
                .with_identifier("http://hospital.example/mrn", "777")
                .to_json();
            backend
                .conditional_create("Patient", doc, criteria)
                .await
                .unwrap()
                .resource()
                .id()
                .to_string()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(backend.count(Some("Patient")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_conditional_update() {
    let backend = create_backend();
    let criteria = "identifier=http://hospital.example/mrn|1";
    let doc = PatientFixture::new("Smith")
        .with_identifier("http://hospital.example/mrn", "1")
        .to_json();

    let created = backend
        .conditional_update("Patient", doc.clone(), criteria)
        .await
        .unwrap();
    assert!(matches!(created, ConditionalUpdateResult::Created(_)));

    let updated = backend
        .conditional_update("Patient", doc, criteria)
        .await
        .unwrap();
    match updated {
        ConditionalUpdateResult::Updated(r) => {
            assert_eq!(r.id(), created.resource().id());
            assert_eq!(r.version_id(), "2");
        }
        other => panic!("expected update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_conditional_operations_reject_ambiguous_matches() {
    let backend = create_backend();
    for _ in 0..2 {
        backend
            .create("Patient", PatientFixture::new("Twin").to_json())
            .await
            .unwrap();
    }

    let update = backend
        .conditional_update("Patient", PatientFixture::new("Twin").to_json(), "family=Twin")
        .await;
    let delete = backend.conditional_delete("Patient", "family=Twin").await;

    for result in [update.map(|_| ()), delete.map(|_| ())] {
        match result {
            Err(StorageError::Resource(ResourceError::AmbiguousConditionalMatch {
                count, ..
            })) => assert_eq!(count, 2),
            other => panic!("expected ambiguous match, got {:?}", other),
        }
    }
    assert_eq!(backend.count(Some("Patient")).await.unwrap(), 2);
}

#[tokio::test]
async fn test_conditional_delete_and_patch() {
    let backend = create_backend();
    backend
        .create(
            "Patient",
            PatientFixture::new("Solo")
                .with_identifier("http://hospital.example/mrn", "9")
                .to_json(),
        )
        .await
        .unwrap();

    let patched = backend
        .conditional_patch(
            "Patient",
            "identifier=http://hospital.example/mrn|9",
            &PatchFormat::MergePatch(json!({"active": false})),
        )
        .await
        .unwrap();
    assert!(matches!(patched, ConditionalPatchResult::Patched(ref r) if r.version_id() == "2"));

    let deleted = backend
        .conditional_delete("Patient", "identifier=http://hospital.example/mrn|9")
        .await
        .unwrap();
    assert!(matches!(deleted, ConditionalDeleteResult::Deleted(_)));

    let none = backend
        .conditional_delete("Patient", "identifier=http://hospital.example/mrn|9")
        .await
        .unwrap();
    assert!(matches!(none, ConditionalDeleteResult::NoMatch));
}

// ============================================================================
// Events and cache
// ============================================================================

#[tokio::test]
async fn test_change_events_follow_writes() {
    let publisher = Arc::new(CollectingPublisher::new());
    let backend = create_backend().with_publisher(publisher.clone());

    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();
    backend
        .update("Patient", created.id(), PatientFixture::new("Jones").to_json(), None)
        .await
        .unwrap();
    backend.delete("Patient", created.id()).await.unwrap();
    let _ = backend
        .update("Patient", "missing", PatientFixture::new("X").to_json(), Some("1"))
        .await;

    let kinds: Vec<ChangeKind> = publisher.take().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted]
    );
}

#[tokio::test]
async fn test_reads_go_through_cache_and_writes_invalidate() {
    let backend = create_backend();
    let created = backend
        .create("Patient", PatientFixture::new("Smith").to_json())
        .await
        .unwrap();

    backend.read("Patient", created.id()).await.unwrap();
    backend.read("Patient", created.id()).await.unwrap();
    let stats = backend.cache().stats();
    assert!(stats.hits >= 1);

    backend
        .update("Patient", created.id(), PatientFixture::new("Jones").to_json(), None)
        .await
        .unwrap();
    let fresh = backend.read("Patient", created.id()).await.unwrap();
    assert_eq!(fresh.version_id(), "2");
    assert_eq!(fresh.content()["name"][0]["family"], "Jones");
}

#[tokio::test]
async fn test_file_backed_database_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
        let backend = SqliteBackend::open(&path).unwrap();
        backend.init_schema().unwrap();
        backend
            .create("Patient", PatientFixture::new("Durable").with_id("keep").to_json())
            .await
            .unwrap();
    }

    let reopened = SqliteBackend::open(&path).unwrap();
    reopened.init_schema().unwrap();
    let read = reopened.read("Patient", "keep").await.unwrap();
    assert_eq!(read.content()["name"][0]["family"], "Durable");
}
