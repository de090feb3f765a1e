//! Standard search parameter table.
//!
//! One row per `(base type, code)`: the parameter type, the extraction path
//! and the shape of the element the path lands on. Polymorphic slots leave
//! the shape open; the populated variant decides it at extraction time.
//! Reference rows list the target types the parameter accepts.

use crate::types::SearchParamType;

use super::converters::ValueShape;
use super::registry::{SearchParameterDefinition, SearchParameterSource};

use ValueShape::{
    Address, CodeableConcept, Coding, ContactPoint, HumanName, Identifier, Period, Primitive,
    Quantity,
};

struct StandardParam {
    base: &'static str,
    code: &'static str,
    param_type: SearchParamType,
    path: &'static str,
    shape: Option<ValueShape>,
    targets: &'static [&'static str],
}

const fn param(
    base: &'static str,
    code: &'static str,
    param_type: SearchParamType,
    path: &'static str,
    shape: Option<ValueShape>,
) -> StandardParam {
    StandardParam {
        base,
        code,
        param_type,
        path,
        shape,
        targets: &[],
    }
}

const fn string(base: &'static str, code: &'static str, path: &'static str, shape: ValueShape) -> StandardParam {
    param(base, code, SearchParamType::String, path, Some(shape))
}

const fn token(base: &'static str, code: &'static str, path: &'static str, shape: ValueShape) -> StandardParam {
    param(base, code, SearchParamType::Token, path, Some(shape))
}

const fn date(base: &'static str, code: &'static str, path: &'static str, shape: Option<ValueShape>) -> StandardParam {
    param(base, code, SearchParamType::Date, path, shape)
}

const fn reference(
    base: &'static str,
    code: &'static str,
    path: &'static str,
    targets: &'static [&'static str],
) -> StandardParam {
    StandardParam {
        base,
        code,
        param_type: SearchParamType::Reference,
        path,
        shape: Some(ValueShape::Reference),
        targets,
    }
}

const PRIMITIVE: Option<ValueShape> = Some(Primitive);
const PERIOD: Option<ValueShape> = Some(Period);

static STANDARD_PARAMS: &[StandardParam] = &[
    // Resource
    param("Resource", "_id", SearchParamType::Token, "", None),
    param("Resource", "_lastUpdated", SearchParamType::Date, "", None),
    token("Resource", "_tag", "Resource.meta.tag", Coding),
    param("Resource", "_profile", SearchParamType::Uri, "Resource.meta.profile", PRIMITIVE),
    // Patient
    token("Patient", "identifier", "Patient.identifier", Identifier),
    string("Patient", "name", "Patient.name", HumanName),
    string("Patient", "family", "Patient.name.family", Primitive),
    string("Patient", "given", "Patient.name.given", Primitive),
    date("Patient", "birthdate", "Patient.birthDate", PRIMITIVE),
    token("Patient", "gender", "Patient.gender", Primitive),
    token("Patient", "active", "Patient.active", Primitive),
    string("Patient", "address", "Patient.address", Address),
    string("Patient", "address-city", "Patient.address.city", Primitive),
    string("Patient", "address-postalcode", "Patient.address.postalCode", Primitive),
    token("Patient", "telecom", "Patient.telecom", ContactPoint),
    token("Patient", "phone", "Patient.telecom.where(system='phone')", ContactPoint),
    token("Patient", "email", "Patient.telecom.where(system='email')", ContactPoint),
    date("Patient", "death-date", "Patient.deceased[x]:DateTime", None),
    reference("Patient", "general-practitioner", "Patient.generalPractitioner", &["Practitioner", "Organization"]),
    reference("Patient", "organization", "Patient.managingOrganization", &["Organization"]),
    // Practitioner
    token("Practitioner", "identifier", "Practitioner.identifier", Identifier),
    string("Practitioner", "name", "Practitioner.name", HumanName),
    string("Practitioner", "family", "Practitioner.name.family", Primitive),
    string("Practitioner", "given", "Practitioner.name.given", Primitive),
    token("Practitioner", "active", "Practitioner.active", Primitive),
    token("Practitioner", "gender", "Practitioner.gender", Primitive),
    token("Practitioner", "telecom", "Practitioner.telecom", ContactPoint),
    // Organization
    token("Organization", "identifier", "Organization.identifier", Identifier),
    string("Organization", "name", "Organization.name | Organization.alias", Primitive),
    token("Organization", "active", "Organization.active", Primitive),
    token("Organization", "type", "Organization.type", CodeableConcept),
    string("Organization", "address-city", "Organization.address.city", Primitive),
    reference("Organization", "partof", "Organization.partOf", &["Organization"]),
    // Location
    string("Location", "name", "Location.name | Location.alias", Primitive),
    string("Location", "address", "Location.address", Address),
    token("Location", "status", "Location.status", Primitive),
    reference("Location", "organization", "Location.managingOrganization", &["Organization"]),
    // Medication
    token("Medication", "code", "Medication.code", CodeableConcept),
    token("Medication", "status", "Medication.status", Primitive),
    // Encounter
    token("Encounter", "identifier", "Encounter.identifier", Identifier),
    token("Encounter", "status", "Encounter.status", Primitive),
    token("Encounter", "class", "Encounter.class", Coding),
    token("Encounter", "type", "Encounter.type", CodeableConcept),
    token("Encounter", "reason-code", "Encounter.reasonCode", CodeableConcept),
    date("Encounter", "date", "Encounter.period", PERIOD),
    param("Encounter", "length", SearchParamType::Quantity, "Encounter.length", Some(Quantity)),
    reference("Encounter", "subject", "Encounter.subject", &["Patient", "Group"]),
    reference("Encounter", "patient", "Encounter.subject", &["Patient"]),
    reference("Encounter", "participant", "Encounter.participant.individual", &["Practitioner", "RelatedPerson"]),
    reference("Encounter", "service-provider", "Encounter.serviceProvider", &["Organization"]),
    reference("Encounter", "location", "Encounter.location.location", &["Location"]),
    // Observation
    token("Observation", "identifier", "Observation.identifier", Identifier),
    token("Observation", "status", "Observation.status", Primitive),
    token("Observation", "code", "Observation.code", CodeableConcept),
    token("Observation", "category", "Observation.category", CodeableConcept),
    date(
        "Observation",
        "date",
        "Observation.effective[x]:DateTime | Observation.effective[x]:Period | Observation.effective[x]:Instant",
        None,
    ),
    param("Observation", "value-quantity", SearchParamType::Quantity, "Observation.value[x]:Quantity", None),
    token("Observation", "value-concept", "Observation.value[x]:CodeableConcept", CodeableConcept),
    param("Observation", "value-string", SearchParamType::String, "Observation.value[x]:String", None),
    date("Observation", "value-date", "Observation.value[x]:DateTime | Observation.value[x]:Period", None),
    token("Observation", "component-code", "Observation.component.code", CodeableConcept),
    param(
        "Observation",
        "component-value-quantity",
        SearchParamType::Quantity,
        "Observation.component.value[x]:Quantity",
        None,
    ),
    reference("Observation", "subject", "Observation.subject", &["Patient", "Group", "Device", "Location"]),
    reference("Observation", "patient", "Observation.subject", &["Patient"]),
    reference("Observation", "encounter", "Observation.encounter", &["Encounter"]),
    reference("Observation", "performer", "Observation.performer", &["Practitioner", "Organization", "Patient", "RelatedPerson"]),
    reference("Observation", "has-member", "Observation.hasMember", &["Observation"]),
    reference("Observation", "derived-from", "Observation.derivedFrom", &["Observation", "DiagnosticReport"]),
    // Condition
    token("Condition", "identifier", "Condition.identifier", Identifier),
    token("Condition", "clinical-status", "Condition.clinicalStatus", CodeableConcept),
    token("Condition", "verification-status", "Condition.verificationStatus", CodeableConcept),
    token("Condition", "category", "Condition.category", CodeableConcept),
    token("Condition", "code", "Condition.code", CodeableConcept),
    token("Condition", "severity", "Condition.severity", CodeableConcept),
    token("Condition", "body-site", "Condition.bodySite", CodeableConcept),
    date("Condition", "onset-date", "Condition.onset[x]:DateTime | Condition.onset[x]:Period", None),
    param("Condition", "onset-age", SearchParamType::Quantity, "Condition.onset[x]:Age", None),
    param("Condition", "onset-info", SearchParamType::String, "Condition.onset[x]:String", None),
    date("Condition", "abatement-date", "Condition.abatement[x]:DateTime | Condition.abatement[x]:Period", None),
    date("Condition", "recorded-date", "Condition.recordedDate", PRIMITIVE),
    reference("Condition", "subject", "Condition.subject", &["Patient", "Group"]),
    reference("Condition", "patient", "Condition.subject", &["Patient"]),
    reference("Condition", "encounter", "Condition.encounter", &["Encounter"]),
    reference("Condition", "asserter", "Condition.asserter", &["Practitioner", "Patient", "RelatedPerson"]),
    // MedicationRequest
    token("MedicationRequest", "identifier", "MedicationRequest.identifier", Identifier),
    token("MedicationRequest", "status", "MedicationRequest.status", Primitive),
    token("MedicationRequest", "intent", "MedicationRequest.intent", Primitive),
    token("MedicationRequest", "priority", "MedicationRequest.priority", Primitive),
    token("MedicationRequest", "category", "MedicationRequest.category", CodeableConcept),
    token("MedicationRequest", "code", "MedicationRequest.medication[x]:CodeableConcept", CodeableConcept),
    reference("MedicationRequest", "medication", "MedicationRequest.medication[x]:Reference", &["Medication"]),
    date("MedicationRequest", "authoredon", "MedicationRequest.authoredOn", PRIMITIVE),
    reference("MedicationRequest", "subject", "MedicationRequest.subject", &["Patient", "Group"]),
    reference("MedicationRequest", "patient", "MedicationRequest.subject", &["Patient"]),
    reference("MedicationRequest", "encounter", "MedicationRequest.encounter", &["Encounter"]),
    reference("MedicationRequest", "requester", "MedicationRequest.requester", &["Practitioner", "Organization", "Patient", "RelatedPerson", "Device"]),
    // AllergyIntolerance
    token("AllergyIntolerance", "identifier", "AllergyIntolerance.identifier", Identifier),
    token("AllergyIntolerance", "clinical-status", "AllergyIntolerance.clinicalStatus", CodeableConcept),
    token("AllergyIntolerance", "verification-status", "AllergyIntolerance.verificationStatus", CodeableConcept),
    token("AllergyIntolerance", "type", "AllergyIntolerance.type", Primitive),
    token("AllergyIntolerance", "category", "AllergyIntolerance.category", Primitive),
    token("AllergyIntolerance", "criticality", "AllergyIntolerance.criticality", Primitive),
    token(
        "AllergyIntolerance",
        "code",
        "AllergyIntolerance.code | AllergyIntolerance.reaction.substance",
        CodeableConcept,
    ),
    token("AllergyIntolerance", "manifestation", "AllergyIntolerance.reaction.manifestation", CodeableConcept),
    date("AllergyIntolerance", "date", "AllergyIntolerance.recordedDate", PRIMITIVE),
    date(
        "AllergyIntolerance",
        "onset",
        "AllergyIntolerance.onset[x]:DateTime | AllergyIntolerance.onset[x]:Period",
        None,
    ),
    reference("AllergyIntolerance", "patient", "AllergyIntolerance.patient", &["Patient"]),
    reference("AllergyIntolerance", "recorder", "AllergyIntolerance.recorder", &["Practitioner", "Patient", "RelatedPerson"]),
    reference("AllergyIntolerance", "asserter", "AllergyIntolerance.asserter", &["Practitioner", "Patient", "RelatedPerson"]),
    // Procedure
    token("Procedure", "identifier", "Procedure.identifier", Identifier),
    token("Procedure", "status", "Procedure.status", Primitive),
    token("Procedure", "code", "Procedure.code", CodeableConcept),
    token("Procedure", "category", "Procedure.category", CodeableConcept),
    token("Procedure", "reason-code", "Procedure.reasonCode", CodeableConcept),
    date("Procedure", "date", "Procedure.performed[x]:DateTime | Procedure.performed[x]:Period", None),
    reference("Procedure", "subject", "Procedure.subject", &["Patient", "Group"]),
    reference("Procedure", "patient", "Procedure.subject", &["Patient"]),
    reference("Procedure", "encounter", "Procedure.encounter", &["Encounter"]),
    reference("Procedure", "performer", "Procedure.performer.actor", &["Practitioner", "Organization", "Patient", "RelatedPerson", "Device"]),
    reference("Procedure", "location", "Procedure.location", &["Location"]),
    // DiagnosticReport
    token("DiagnosticReport", "identifier", "DiagnosticReport.identifier", Identifier),
    token("DiagnosticReport", "status", "DiagnosticReport.status", Primitive),
    token("DiagnosticReport", "code", "DiagnosticReport.code", CodeableConcept),
    token("DiagnosticReport", "category", "DiagnosticReport.category", CodeableConcept),
    token("DiagnosticReport", "conclusion", "DiagnosticReport.conclusionCode", CodeableConcept),
    date(
        "DiagnosticReport",
        "date",
        "DiagnosticReport.effective[x]:DateTime | DiagnosticReport.effective[x]:Period",
        None,
    ),
    date("DiagnosticReport", "issued", "DiagnosticReport.issued", PRIMITIVE),
    reference("DiagnosticReport", "subject", "DiagnosticReport.subject", &["Patient", "Group", "Device", "Location"]),
    reference("DiagnosticReport", "patient", "DiagnosticReport.subject", &["Patient"]),
    reference("DiagnosticReport", "encounter", "DiagnosticReport.encounter", &["Encounter"]),
    reference("DiagnosticReport", "result", "DiagnosticReport.result", &["Observation"]),
    reference("DiagnosticReport", "performer", "DiagnosticReport.performer", &["Practitioner", "Organization"]),
    // Immunization
    token("Immunization", "identifier", "Immunization.identifier", Identifier),
    token("Immunization", "status", "Immunization.status", Primitive),
    token("Immunization", "vaccine-code", "Immunization.vaccineCode", CodeableConcept),
    token("Immunization", "reason-code", "Immunization.reasonCode", CodeableConcept),
    date("Immunization", "date", "Immunization.occurrence[x]:DateTime", None),
    string("Immunization", "lot-number", "Immunization.lotNumber", Primitive),
    param(
        "Immunization",
        "dose-number",
        SearchParamType::Number,
        "Immunization.protocolApplied.doseNumber[x]:PositiveInt",
        None,
    ),
    reference("Immunization", "patient", "Immunization.patient", &["Patient"]),
    reference("Immunization", "performer", "Immunization.performer.actor", &["Practitioner", "Organization"]),
    reference("Immunization", "location", "Immunization.location", &["Location"]),
];

/// Builds the standard definitions.
pub fn standard_definitions() -> Vec<SearchParameterDefinition> {
    STANDARD_PARAMS
        .iter()
        .map(|p| {
            let mut def = SearchParameterDefinition::new(
                format!("http://hl7.org/fhir/SearchParameter/{}-{}", p.base, p.code),
                p.code,
                p.param_type,
                p.path,
            )
            .with_base([p.base])
            .with_source(SearchParameterSource::Embedded);
            if let Some(shape) = p.shape {
                def = def.with_shape(shape);
            }
            if !p.targets.is_empty() {
                def = def.with_targets(p.targets.iter().copied());
            }
            def
        })
        .collect()
}
