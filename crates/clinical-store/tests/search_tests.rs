//! Search integration tests against the SQLite backend.

mod common;

use std::collections::BTreeSet;

use serde_json::json;

use common::*;
use helios_clinical_store::backends::sqlite::SqliteBackend;
use helios_clinical_store::core::{ResourceStorage, SearchProvider, SearchResult};
use helios_clinical_store::error::{SearchError, StorageError};

async fn search(backend: &SqliteBackend, resource_type: &str, pairs: &[(&str, &str)]) -> SearchResult {
    backend
        .search_params(resource_type, &params(pairs))
        .await
        .unwrap()
}

async fn ids(backend: &SqliteBackend, resource_type: &str, pairs: &[(&str, &str)]) -> BTreeSet<String> {
    search(backend, resource_type, pairs)
        .await
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn seed_patients(backend: &SqliteBackend) {
    let patients = [
        PatientFixture::new("Alpha")
            .with_id("p1")
            .with_given(&["Ann"])
            .with_gender("female")
            .with_birth_date("1980-05-06")
            .with_identifier("http://hospital.example/mrn", "100"),
        PatientFixture::new("Smith")
            .with_id("p2")
            .with_given(&["John"])
            .with_gender("male")
            .with_birth_date("1995-11-20"),
        PatientFixture::new("Smithers")
            .with_id("p3")
            .with_gender("male")
            .with_birth_date("1971"),
        PatientFixture::new("Brown").with_id("p4").with_gender("female"),
    ];
    for patient in patients {
        backend.create("Patient", patient.to_json()).await.unwrap();
    }
}

// ============================================================================
// String
// ============================================================================

#[tokio::test]
async fn test_string_matching_rules() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", &[("family", "alp")]).await, set(&["p1"]));
    assert_eq!(ids(&backend, "Patient", &[("family:exact", "Alpha")]).await, set(&["p1"]));
    assert!(ids(&backend, "Patient", &[("family:exact", "alp")]).await.is_empty());
    assert!(ids(&backend, "Patient", &[("family:exact", "alpha")]).await.is_empty());
    assert_eq!(
        ids(&backend, "Patient", &[("family", "SMITH")]).await,
        set(&["p2", "p3"])
    );
    assert_eq!(ids(&backend, "Patient", &[("family:contains", "ither")]).await, set(&["p3"]));
    assert_eq!(ids(&backend, "Patient", &[("name", "joh")]).await, set(&["p2"]));
}

#[tokio::test]
async fn test_comma_ors_and_repeats_and() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(
        ids(&backend, "Patient", &[("family", "alpha,brown")]).await,
        set(&["p1", "p4"])
    );
    assert_eq!(
        ids(&backend, "Patient", &[("family", "smith"), ("gender", "male"), ("birthdate", "gt1990")]).await,
        set(&["p2"])
    );
}

// ============================================================================
// Token
// ============================================================================

#[tokio::test]
async fn test_token_forms() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", &[("gender", "female")]).await, set(&["p1", "p4"]));
    assert_eq!(ids(&backend, "Patient", &[("gender:not", "female")]).await, set(&["p2", "p3"]));
    assert_eq!(
        ids(&backend, "Patient", &[("identifier", "http://hospital.example/mrn|100")]).await,
        set(&["p1"])
    );
    assert_eq!(
        ids(&backend, "Patient", &[("identifier", "http://hospital.example/mrn|")]).await,
        set(&["p1"])
    );
    assert!(ids(&backend, "Patient", &[("identifier", "http://elsewhere|100")]).await.is_empty());
    assert_eq!(ids(&backend, "Patient", &[("identifier", "100")]).await, set(&["p1"]));
}

#[tokio::test]
async fn test_token_text_modifier() {
    let backend = create_backend();
    backend
        .create(
            "Observation",
            json!({
                "resourceType": "Observation",
                "id": "hr",
                "status": "final",
                "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4", "display": "Heart rate"}]}
            }),
        )
        .await
        .unwrap();

    assert_eq!(ids(&backend, "Observation", &[("code:text", "heart")]).await, set(&["hr"]));
    assert!(ids(&backend, "Observation", &[("code:text", "blood")]).await.is_empty());
}

// ============================================================================
// Date
// ============================================================================

#[tokio::test]
async fn test_date_prefixes_and_precision() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", &[("birthdate", "1980-05-06")]).await, set(&["p1"]));
    assert_eq!(ids(&backend, "Patient", &[("birthdate", "1980")]).await, set(&["p1"]));
    assert_eq!(ids(&backend, "Patient", &[("birthdate", "1980-05")]).await, set(&["p1"]));
    assert_eq!(ids(&backend, "Patient", &[("birthdate", "gt1990-01-01")]).await, set(&["p2"]));
    assert_eq!(
        ids(&backend, "Patient", &[("birthdate", "lt1990-01-01")]).await,
        set(&["p1", "p3"])
    );
    assert_eq!(
        ids(&backend, "Patient", &[("birthdate", "ge1980-05-06")]).await,
        set(&["p1", "p2"])
    );
    assert_eq!(ids(&backend, "Patient", &[("birthdate", "sa1990")]).await, set(&["p2"]));
    assert_eq!(ids(&backend, "Patient", &[("birthdate", "eb1975")]).await, set(&["p3"]));
    assert_eq!(
        ids(&backend, "Patient", &[("birthdate", "ne1980-05-06"), ("birthdate:missing", "false")]).await,
        set(&["p2", "p3"])
    );
}

#[tokio::test]
async fn test_imprecise_stored_date_matches_range() {
    let backend = create_backend();
    seed_patients(&backend).await;

    // p3 was born "1971": the whole year is covered.
    assert_eq!(
        ids(&backend, "Patient", &[("birthdate", "ge1971-06-01"), ("birthdate", "le1971-06-30")]).await,
        set(&["p3"])
    );
    assert!(ids(&backend, "Patient", &[("birthdate", "1971-06-15")]).await.is_empty());
}

#[tokio::test]
async fn test_period_dates() {
    let backend = create_backend();
    backend
        .create(
            "Encounter",
            json!({
                "resourceType": "Encounter",
                "id": "e1",
                "status": "finished",
                "period": {"start": "2024-02-01T09:00:00Z", "end": "2024-02-03T17:00:00Z"}
            }),
        )
        .await
        .unwrap();

    assert_eq!(ids(&backend, "Encounter", &[("date", "2024-02")]).await, set(&["e1"]));
    assert_eq!(ids(&backend, "Encounter", &[("date", "gt2024-02-02")]).await, set(&["e1"]));
    assert!(ids(&backend, "Encounter", &[("date", "2024-02-02")]).await.is_empty());
    assert_eq!(ids(&backend, "Encounter", &[("date", "sa2024-01-31")]).await, set(&["e1"]));
}

// ============================================================================
// Number / Quantity
// ============================================================================

async fn seed_vitals(backend: &SqliteBackend) {
    for (id, value, day) in [("o1", 72.0, 11), ("o2", 88.5, 12), ("o3", 120.0, 13)] {
        backend
            .create(
                "Observation",
                ObservationFixture::new("8867-4", "Patient/p1")
                    .with_id(id)
                    .with_quantity(value, "/min")
                    .with_effective(format!("2024-01-{}T08:00:00Z", day))
                    .to_json(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_quantity_comparisons() {
    let backend = create_backend();
    seed_vitals(&backend).await;

    assert_eq!(ids(&backend, "Observation", &[("value-quantity", "72")]).await, set(&["o1"]));
    assert_eq!(
        ids(&backend, "Observation", &[("value-quantity", "gt80")]).await,
        set(&["o2", "o3"])
    );
    assert_eq!(
        ids(&backend, "Observation", &[("value-quantity", "lt100|http://unitsofmeasure.org|/min")]).await,
        set(&["o1", "o2"])
    );
    assert!(ids(&backend, "Observation", &[("value-quantity", "72|http://unitsofmeasure.org|mg")]).await.is_empty());
    assert_eq!(ids(&backend, "Observation", &[("value-quantity", "88.5")]).await, set(&["o2"]));
}

#[tokio::test]
async fn test_invalid_values_are_rejected() {
    let backend = create_backend();

    let bad_date = backend
        .search_params("Patient", &params(&[("birthdate", "yesterday")]))
        .await;
    assert!(matches!(bad_date, Err(StorageError::Search(_))));

    let unknown = backend
        .search_params("Patient", &params(&[("shoe-size", "9")]))
        .await;
    assert!(matches!(
        unknown,
        Err(StorageError::Search(SearchError::UnknownParameter { .. }))
    ));

    let bad_modifier = backend
        .search_params("Patient", &params(&[("gender:exact", "male")]))
        .await;
    assert!(matches!(bad_modifier, Err(StorageError::Search(_))));
}

// ============================================================================
// Reference
// ============================================================================

#[tokio::test]
async fn test_reference_form_equivalence() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let subjects = [
        ("typed", json!({"reference": "Patient/p1"})),
        ("bare", json!({"reference": "p1", "type": "Patient"})),
        ("absolute", json!({"reference": "http://example.org/fhir/Patient/p1"})),
    ];
    for (id, subject) in subjects {
        backend
            .create(
                "Observation",
                ObservationFixture::new("8867-4", "")
                    .with_id(id)
                    .with_subject(subject)
                    .to_json(),
            )
            .await
            .unwrap();
    }
    backend
        .create(
            "Observation",
            ObservationFixture::new("8867-4", "Patient/p2").with_id("other").to_json(),
        )
        .await
        .unwrap();

    let expected = set(&["absolute", "bare", "typed"]);
    for query in ["Patient/p1", "http://other.example/base/Patient/p1"] {
        assert_eq!(ids(&backend, "Observation", &[("subject", query)]).await, expected, "{}", query);
    }
    for query in ["p1", "Patient/p1"] {
        assert_eq!(ids(&backend, "Observation", &[("patient", query)]).await, expected, "{}", query);
    }
    assert_eq!(ids(&backend, "Observation", &[("subject:Patient", "p1")]).await, expected);
}

#[tokio::test]
async fn test_dangling_reference_is_stored_with_warning() {
    let backend = create_backend();

    let stored = backend
        .create(
            "Observation",
            ObservationFixture::new("8867-4", "Patient/not-there").to_json(),
        )
        .await
        .unwrap();

    assert!(!stored.warnings().is_empty());
    assert_eq!(stored.warnings()[0].reference, "Patient/not-there");
    assert_eq!(
        ids(&backend, "Observation", &[("subject", "Patient/not-there")]).await.len(),
        1
    );
}

#[tokio::test]
async fn test_missing_modifier() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", &[("birthdate:missing", "true")]).await, set(&["p4"]));
    assert_eq!(
        ids(&backend, "Patient", &[("organization:missing", "true")]).await.len(),
        4
    );
}

// ============================================================================
// Special parameters
// ============================================================================

#[tokio::test]
async fn test_id_and_last_updated() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", &[("_id", "p1,p3")]).await, set(&["p1", "p3"]));
    assert_eq!(ids(&backend, "Patient", &[("_lastUpdated", "gt2000-01-01")]).await.len(), 4);
    assert!(ids(&backend, "Patient", &[("_lastUpdated", "lt2000-01-01")]).await.is_empty());
}

// ============================================================================
// Chains
// ============================================================================

#[tokio::test]
async fn test_chained_search_matches_manual_join() {
    let backend = create_backend();
    seed_patients(&backend).await;
    for (id, subject) in [("o1", "Patient/p1"), ("o2", "Patient/p2"), ("o3", "Patient/p3"), ("o4", "Patient/p4")] {
        backend
            .create(
                "Observation",
                ObservationFixture::new("8867-4", subject).with_id(id).to_json(),
            )
            .await
            .unwrap();
    }

    let chained = ids(&backend, "Observation", &[("subject.name", "Smith")]).await;

    let smiths = ids(&backend, "Patient", &[("name", "Smith")]).await;
    let refs: Vec<String> = smiths.iter().map(|id| format!("Patient/{}", id)).collect();
    let manual = ids(&backend, "Observation", &[("subject", refs.join(",").as_str())]).await;

    assert_eq!(chained, manual);
    assert_eq!(chained, set(&["o2", "o3"]));
    assert_eq!(
        ids(&backend, "Observation", &[("subject:Patient.gender", "female")]).await,
        set(&["o1", "o4"])
    );
}

#[tokio::test]
async fn test_two_hop_chain() {
    let backend = create_backend();
    backend.create("Organization", organization("org-1", "General Hospital")).await.unwrap();
    backend.create("Organization", organization("org-2", "Clinic")).await.unwrap();
    backend
        .create("Patient", PatientFixture::new("A").with_id("pa").with_organization("Organization/org-1").to_json())
        .await
        .unwrap();
    backend
        .create("Patient", PatientFixture::new("B").with_id("pb").with_organization("Organization/org-2").to_json())
        .await
        .unwrap();
    backend
        .create("Observation", ObservationFixture::new("1", "Patient/pa").with_id("oa").to_json())
        .await
        .unwrap();
    backend
        .create("Observation", ObservationFixture::new("1", "Patient/pb").with_id("ob").to_json())
        .await
        .unwrap();

    assert_eq!(
        ids(&backend, "Observation", &[("patient.organization.name", "general")]).await,
        set(&["oa"])
    );
}

#[tokio::test]
async fn test_reverse_chain() {
    let backend = create_backend();
    seed_patients(&backend).await;
    backend
        .create("Observation", ObservationFixture::new("8867-4", "Patient/p1").to_json())
        .await
        .unwrap();
    backend
        .create("Observation", ObservationFixture::new("2339-0", "Patient/p2").to_json())
        .await
        .unwrap();

    assert_eq!(
        ids(&backend, "Patient", &[("_has:Observation:patient:code", "8867-4")]).await,
        set(&["p1"])
    );
    assert_eq!(
        ids(&backend, "Patient", &[("_has:Observation:patient:code", "8867-4,2339-0"), ("gender", "male")]).await,
        set(&["p2"])
    );
}

// ============================================================================
// Include / Revinclude
// ============================================================================

#[tokio::test]
async fn test_include_and_revinclude() {
    let backend = create_backend();
    seed_patients(&backend).await;
    for (id, subject) in [("o1", "Patient/p1"), ("o2", "Patient/p1"), ("o3", "Patient/p2")] {
        backend
            .create("Observation", ObservationFixture::new("8867-4", subject).with_id(id).to_json())
            .await
            .unwrap();
    }

    let forward = search(&backend, "Observation", &[("_id", "o1,o2"), ("_include", "Observation:subject")]).await;
    assert_eq!(forward.resources.len(), 2);
    let included: Vec<&str> = forward.included.iter().map(|r| r.id()).collect();
    assert_eq!(included, vec!["p1"]);

    let reverse = search(&backend, "Patient", &[("_id", "p1"), ("_revinclude", "Observation:subject")]).await;
    let mut rev: Vec<&str> = reverse.included.iter().map(|r| r.id()).collect();
    rev.sort();
    assert_eq!(rev, vec!["o1", "o2"]);
    assert!(!reverse.included_truncated);

    let bundle = reverse.to_bundle("http://example.org/fhir", "Patient?_id=p1");
    assert_eq!(bundle["type"], "searchset");
    let modes: Vec<&str> = bundle["entry"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["search"]["mode"].as_str().unwrap())
        .collect();
    assert_eq!(modes, vec!["match", "include", "include"]);
}

#[tokio::test]
async fn test_include_iterate() {
    let backend = create_backend();
    backend.create("Organization", organization("org-1", "Hospital")).await.unwrap();
    backend
        .create("Patient", PatientFixture::new("A").with_id("pa").with_organization("Organization/org-1").to_json())
        .await
        .unwrap();
    backend
        .create("Observation", ObservationFixture::new("1", "Patient/pa").with_id("oa").to_json())
        .await
        .unwrap();

    let result = search(
        &backend,
        "Observation",
        &[
            ("_include", "Observation:patient"),
            ("_include:iterate", "Patient:organization"),
        ],
    )
    .await;

    let included: BTreeSet<&str> = result.included.iter().map(|r| r.id()).collect();
    assert_eq!(included, ["org-1", "pa"].into_iter().collect());
}

// ============================================================================
// Sorting, paging, totals, shaping
// ============================================================================

#[tokio::test]
async fn test_sort_orders() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let by_family = search(&backend, "Patient", &[("_sort", "family")]).await;
    assert_eq!(by_family.ids(), vec!["p1", "p4", "p2", "p3"]);

    let by_birth_desc = search(&backend, "Patient", &[("_sort", "-birthdate"), ("birthdate:missing", "false")]).await;
    assert_eq!(by_birth_desc.ids(), vec!["p2", "p1", "p3"]);

    let by_id_desc = search(&backend, "Patient", &[("_sort", "-_id")]).await;
    assert_eq!(by_id_desc.ids(), vec!["p4", "p3", "p2", "p1"]);
}

#[tokio::test]
async fn test_cursor_paging_is_consistent_with_total() {
    let backend = create_backend();
    for i in 0..7 {
        backend
            .create(
                "Patient",
                PatientFixture::new(format!("Family{}", i)).with_id(format!("p{}", i)).to_json(),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let mut pairs = vec![("_count", "3"), ("_sort", "family")];
        if let Some(ref c) = cursor {
            pairs.push(("_cursor", c.as_str()));
        }
        let page = search(&backend, "Patient", &pairs).await;
        assert_eq!(page.total, Some(7));
        seen.extend(page.ids().into_iter().map(str::to_string));
        match page.resources.page_info.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let expected: Vec<String> = (0..7).map(|i| format!("p{}", i)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_offset_paging() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let page = search(&backend, "Patient", &[("_sort", "_id"), ("_count", "2"), ("_offset", "2")]).await;

    assert_eq!(page.ids(), vec!["p3", "p4"]);
}

#[tokio::test]
async fn test_invalid_cursor() {
    let backend = create_backend();

    let result = backend
        .search_params("Patient", &params(&[("_cursor", "not-a-cursor")]))
        .await;

    assert!(matches!(
        result,
        Err(StorageError::Search(SearchError::InvalidCursor { .. }))
    ));
}

#[tokio::test]
async fn test_totals_and_summary() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let count_only = search(&backend, "Patient", &[("gender", "male"), ("_summary", "count")]).await;
    assert!(count_only.resources.is_empty());
    assert_eq!(count_only.total, Some(2));

    let no_total = search(&backend, "Patient", &[("_total", "none")]).await;
    assert_eq!(no_total.total, None);
    assert_eq!(no_total.resources.len(), 4);

    let elements = search(&backend, "Patient", &[("_id", "p1"), ("_elements", "gender")]).await;
    let doc = elements.resources.items[0].content();
    assert_eq!(doc["gender"], "female");
    assert!(doc.get("name").is_none());
    assert!(doc.get("birthDate").is_none());
    assert_eq!(doc["id"], "p1");

    let summary = search(&backend, "Patient", &[("_id", "p1"), ("_summary", "true")]).await;
    let doc = summary.resources.items[0].content();
    assert_eq!(doc["resourceType"], "Patient");
    assert!(doc.get("name").is_some());

    assert_eq!(
        backend
            .search_count(&backend.parse_query("Patient", &params(&[("family", "smith")])).unwrap())
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_count_clamped_to_max_page_size() {
    let backend = create_backend_with(helios_clinical_store::SqliteBackendConfig {
        max_page_size: 2,
        ..Default::default()
    });
    seed_patients(&backend).await;

    let page = search(&backend, "Patient", &[("_count", "50")]).await;

    assert_eq!(page.resources.len(), 2);
    assert!(page.resources.page_info.next_cursor.is_some());
    assert_eq!(page.total, Some(4));
}

#[tokio::test]
async fn test_slow_search_times_out_instead_of_returning_a_partial_page() {
    let backend = create_backend_with(helios_clinical_store::SqliteBackendConfig {
        query_timeout: "1ns".to_string(),
        ..Default::default()
    });
    for i in 0..40 {
        backend
            .create(
                "Patient",
                PatientFixture::new(format!("Family{}", i)).with_gender("male").to_json(),
            )
            .await
            .unwrap();
    }

    let result = backend
        .search_params(
            "Patient",
            &params(&[("family", "fam"), ("gender", "male"), ("_sort", "-family")]),
        )
        .await;

    assert!(
        matches!(result, Err(StorageError::Search(SearchError::Timeout { .. }))),
        "{:?}",
        result.map(|r| r.resources.len())
    );
}
