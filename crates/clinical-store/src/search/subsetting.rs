//! Document subsetting for `_summary` and `_elements`.
//!
//! Subsetted documents are marked with the `SUBSETTED` tag in `meta.tag`
//! so they are never mistaken for the stored version.

use serde_json::{Map, Value, json};

use crate::types::SummaryMode;

/// Elements that survive every subsetting mode.
const ALWAYS_INCLUDED: &[&str] = &["resourceType", "id", "meta"];

const SUBSETTED_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ObservationValue";
const SUBSETTED_CODE: &str = "SUBSETTED";

/// Top-level summary elements of a resource type.
///
/// Choice elements are listed by their root (`value`, `onset`), which
/// matches every typed variant (`valueQuantity`, `onsetDateTime`).
fn summary_elements(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "Patient" => &[
            "identifier",
            "active",
            "name",
            "telecom",
            "gender",
            "birthDate",
            "deceased",
            "address",
            "managingOrganization",
            "link",
        ],
        "Observation" => &[
            "identifier",
            "status",
            "category",
            "code",
            "subject",
            "encounter",
            "effective",
            "issued",
            "value",
            "dataAbsentReason",
            "interpretation",
            "hasMember",
            "derivedFrom",
            "component",
        ],
        "Condition" => &[
            "identifier",
            "clinicalStatus",
            "verificationStatus",
            "category",
            "severity",
            "code",
            "bodySite",
            "subject",
            "encounter",
            "onset",
            "abatement",
            "recordedDate",
        ],
        "Encounter" => &[
            "identifier",
            "status",
            "class",
            "type",
            "serviceType",
            "subject",
            "participant",
            "period",
            "length",
            "location",
        ],
        "Procedure" => &[
            "identifier",
            "status",
            "code",
            "subject",
            "encounter",
            "performed",
            "performer",
        ],
        "MedicationRequest" => &[
            "identifier",
            "status",
            "intent",
            "medication",
            "subject",
            "encounter",
            "authoredOn",
            "requester",
        ],
        "AllergyIntolerance" => &[
            "identifier",
            "clinicalStatus",
            "verificationStatus",
            "type",
            "category",
            "criticality",
            "code",
            "patient",
            "onset",
        ],
        "DiagnosticReport" => &[
            "identifier",
            "status",
            "category",
            "code",
            "subject",
            "encounter",
            "effective",
            "issued",
            "performer",
            "result",
            "conclusion",
        ],
        "Immunization" => &[
            "identifier",
            "status",
            "vaccineCode",
            "patient",
            "occurrence",
            "primarySource",
        ],
        "Practitioner" => &[
            "identifier",
            "active",
            "name",
            "telecom",
            "address",
            "gender",
            "birthDate",
        ],
        "Organization" => &["identifier", "active", "type", "name", "alias", "telecom", "address"],
        "Location" => &[
            "identifier",
            "status",
            "operationalStatus",
            "name",
            "alias",
            "description",
            "type",
            "telecom",
            "address",
        ],
        "Medication" => &["identifier", "code", "status", "manufacturer"],
        _ => &["identifier", "status", "name", "code", "subject", "patient"],
    }
}

/// Applies `_summary` to a document.
pub fn apply_summary(resource: &Value, mode: SummaryMode) -> Value {
    match mode {
        SummaryMode::False => resource.clone(),
        SummaryMode::Count => mark_subsetted(keep_elements(resource, ALWAYS_INCLUDED)),
        SummaryMode::Text => {
            let mut elements = ALWAYS_INCLUDED.to_vec();
            elements.push("text");
            mark_subsetted(keep_elements(resource, &elements))
        }
        SummaryMode::Data => mark_subsetted(drop_elements(resource, &["text"])),
        SummaryMode::True => {
            let Some(resource_type) = resource.get("resourceType").and_then(Value::as_str) else {
                return resource.clone();
            };
            let mut elements = ALWAYS_INCLUDED.to_vec();
            elements.extend_from_slice(summary_elements(resource_type));
            mark_subsetted(keep_elements(resource, &elements))
        }
    }
}

/// Applies `_elements` to a document.
///
/// Only top-level names are honored; `name.family` keeps all of `name`.
pub fn apply_elements(resource: &Value, elements: &[String]) -> Value {
    if elements.is_empty() {
        return resource.clone();
    }
    let mut keep: Vec<&str> = ALWAYS_INCLUDED.to_vec();
    for element in elements {
        let root = element.split('.').next().unwrap_or(element).trim();
        if !root.is_empty() && !keep.contains(&root) {
            keep.push(root);
        }
    }
    mark_subsetted(keep_elements(resource, &keep))
}

/// Whether `key` is `element` or one of its typed choice variants.
fn matches_element(key: &str, element: &str) -> bool {
    match key.strip_prefix(element) {
        Some("") => true,
        Some(rest) => rest.starts_with(|c: char| c.is_ascii_uppercase()),
        None => false,
    }
}

fn keep_elements(resource: &Value, elements: &[&str]) -> Value {
    match resource {
        Value::Object(obj) => {
            let kept: Map<String, Value> = obj
                .iter()
                .filter(|(key, _)| elements.iter().any(|e| matches_element(key, e)))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(kept)
        }
        other => other.clone(),
    }
}

fn drop_elements(resource: &Value, elements: &[&str]) -> Value {
    match resource {
        Value::Object(obj) => {
            let kept: Map<String, Value> = obj
                .iter()
                .filter(|(key, _)| !elements.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(kept)
        }
        other => other.clone(),
    }
}

fn mark_subsetted(mut resource: Value) -> Value {
    let Some(obj) = resource.as_object_mut() else {
        return resource;
    };
    let meta = obj.entry("meta").or_insert_with(|| json!({}));
    let Some(meta) = meta.as_object_mut() else {
        return resource;
    };
    let tags = meta.entry("tag").or_insert_with(|| json!([]));
    if let Some(tags) = tags.as_array_mut() {
        let present = tags
            .iter()
            .any(|t| t.get("code").and_then(Value::as_str) == Some(SUBSETTED_CODE));
        if !present {
            tags.push(json!({"system": SUBSETTED_SYSTEM, "code": SUBSETTED_CODE}));
        }
    }
    resource
}
