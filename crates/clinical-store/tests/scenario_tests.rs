//! End-to-end flows across storage, search, bundles and events.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use helios_clinical_store::core::{
    BundleEntry, BundleMethod, BundleProvider, ResourceStorage, SearchProvider, VersionedStorage,
};
use helios_clinical_store::events::{BroadcastPublisher, ChangeKind};

async fn condition_ids(
    backend: &helios_clinical_store::SqliteBackend,
    pairs: &[(&str, &str)],
) -> Vec<String> {
    let mut ids: Vec<String> = backend
        .search_params("Condition", &params(pairs))
        .await
        .unwrap()
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_patient_condition_lifecycle() {
    let publisher = Arc::new(BroadcastPublisher::new(16));
    let mut events = publisher.subscribe();
    let backend = create_backend().with_publisher(publisher.clone());

    let patient = backend
        .create("Patient", PatientFixture::new("Rivera").with_id("p-100").to_json())
        .await
        .unwrap();
    assert_eq!(patient.id(), "p-100");

    let condition = backend
        .create("Condition", condition("Patient/p-100", "active"))
        .await
        .unwrap();
    assert!(condition.warnings().is_empty());
    assert_eq!(condition.version_id(), "1");

    // Another patient's condition must not show up.
    backend
        .create("Patient", PatientFixture::new("Other").with_id("p-200").to_json())
        .await
        .unwrap();
    backend
        .create("Condition", common::condition("Patient/p-200", "active"))
        .await
        .unwrap();

    assert_eq!(
        condition_ids(&backend, &[("patient", "p-100")]).await,
        vec![condition.id().to_string()]
    );

    let mut resolved = condition.content().clone();
    resolved["clinicalStatus"]["coding"][0]["code"] = json!("resolved");
    let updated = backend
        .update("Condition", condition.id(), resolved, Some("1"))
        .await
        .unwrap();
    assert_eq!(updated.version_id(), "2");

    assert_eq!(
        condition_ids(&backend, &[("patient", "p-100"), ("clinical-status", "resolved")]).await,
        vec![condition.id().to_string()]
    );
    assert!(
        condition_ids(&backend, &[("patient", "p-100"), ("clinical-status", "active")])
            .await
            .is_empty()
    );

    let v1 = backend.vread("Condition", condition.id(), "1").await.unwrap();
    assert_eq!(v1.content()["clinicalStatus"]["coding"][0]["code"], "active");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.resource_type, event.kind));
    }
    assert_eq!(kinds.len(), 5);
    assert_eq!(kinds[4], ("Condition".to_string(), ChangeKind::Updated));
}

#[tokio::test]
async fn test_transaction_and_batch_with_an_invalid_entry() {
    let entries = || {
        vec![
            BundleEntry::new(BundleMethod::Post, "Patient")
                .with_resource(PatientFixture::new("Valid").with_id("ok-1").to_json()),
            BundleEntry::new(BundleMethod::Post, "Condition")
                .with_resource(condition("Patient/ok-1", "active")),
            BundleEntry::new(BundleMethod::Post, "Patient")
                .with_resource(json!({"resourceType": "Patient", "id": "not valid!"})),
        ]
    };

    let transactional = create_backend();
    assert!(transactional.process_transaction(entries()).await.is_err());
    assert_eq!(transactional.count(None).await.unwrap(), 0);

    let batched = create_backend();
    let result = batched.process_batch(entries()).await.unwrap();
    let statuses: Vec<u16> = result.entries.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![201, 201, 400]);
    assert_eq!(batched.count(None).await.unwrap(), 2);
    assert!(batched.exists("Patient", "ok-1").await.unwrap());
}

#[tokio::test]
async fn test_referrers_outlive_a_deleted_target() {
    let backend = create_backend();
    backend
        .create("Patient", PatientFixture::new("Short").with_id("p-1").to_json())
        .await
        .unwrap();
    let observation = backend
        .create(
            "Observation",
            ObservationFixture::new("8867-4", "Patient/p-1").to_json(),
        )
        .await
        .unwrap();

    backend.delete("Patient", "p-1").await.unwrap();

    // The observation still matches by reference, but the include finds nothing.
    let result = backend
        .search_params(
            "Observation",
            &params(&[("subject", "Patient/p-1"), ("_include", "Observation:subject")]),
        )
        .await
        .unwrap();
    assert_eq!(result.ids(), vec![observation.id()]);
    assert!(result.included.is_empty());
    assert!(
        backend
            .search_params("Patient", &params(&[("_has:Observation:subject:code", "8867-4")]))
            .await
            .unwrap()
            .resources
            .is_empty()
    );
    assert_eq!(
        backend.current_version("Patient", "p-1").await.unwrap(),
        None
    );
}
