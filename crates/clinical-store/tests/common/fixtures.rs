//! Document builders for integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};

/// A patient document builder.
#[derive(Debug, Clone)]
pub struct PatientFixture {
    /// Patient id, left out of the document when `None`.
    pub id: Option<String>,
    /// Family name.
    pub family: String,
    /// Given names.
    pub given: Vec<String>,
    /// Birth date (YYYY, YYYY-MM or YYYY-MM-DD).
    pub birth_date: Option<String>,
    /// Administrative gender.
    pub gender: Option<String>,
    /// Identifiers as (system, value) pairs.
    pub identifiers: Vec<(String, String)>,
    /// Managing organization reference.
    pub organization_ref: Option<String>,
}

impl PatientFixture {
    /// Creates a patient with just a family name.
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            id: None,
            family: family.into(),
            given: vec![],
            birth_date: None,
            gender: None,
            identifiers: vec![],
            organization_ref: None,
        }
    }

    /// Sets the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets given names.
    pub fn with_given(mut self, given: &[&str]) -> Self {
        self.given = given.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Sets the birth date.
    pub fn with_birth_date(mut self, date: impl Into<String>) -> Self {
        self.birth_date = Some(date.into());
        self
    }

    /// Sets the gender.
    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = Some(gender.into());
        self
    }

    /// Adds an identifier.
    pub fn with_identifier(mut self, system: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.push((system.into(), value.into()));
        self
    }

    /// Sets the managing organization reference.
    pub fn with_organization(mut self, reference: impl Into<String>) -> Self {
        self.organization_ref = Some(reference.into());
        self
    }

    /// Renders the document.
    pub fn to_json(&self) -> Value {
        let mut patient = json!({
            "resourceType": "Patient",
            "name": [{"family": self.family, "given": self.given}],
        });
        if let Some(id) = &self.id {
            patient["id"] = json!(id);
        }
        if let Some(birth_date) = &self.birth_date {
            patient["birthDate"] = json!(birth_date);
        }
        if let Some(gender) = &self.gender {
            patient["gender"] = json!(gender);
        }
        if !self.identifiers.is_empty() {
            patient["identifier"] = self
                .identifiers
                .iter()
                .map(|(system, value)| json!({"system": system, "value": value}))
                .collect();
        }
        if let Some(reference) = &self.organization_ref {
            patient["managingOrganization"] = json!({"reference": reference});
        }
        patient
    }
}

/// An observation document builder.
#[derive(Debug, Clone)]
pub struct ObservationFixture {
    /// Observation id.
    pub id: Option<String>,
    /// Status code.
    pub status: String,
    /// LOINC code.
    pub code: String,
    /// Subject reference, as written in the document.
    pub subject: Value,
    /// effectiveDateTime.
    pub effective: Option<String>,
    /// valueQuantity as (value, UCUM code).
    pub quantity: Option<(f64, String)>,
}

impl ObservationFixture {
    /// Creates a final observation with a LOINC code about `subject_ref`.
    pub fn new(code: impl Into<String>, subject_ref: impl Into<String>) -> Self {
        Self {
            id: None,
            status: "final".to_string(),
            code: code.into(),
            subject: json!({"reference": subject_ref.into()}),
            effective: None,
            quantity: None,
        }
    }

    /// Sets the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Replaces the whole subject element.
    pub fn with_subject(mut self, subject: Value) -> Self {
        self.subject = subject;
        self
    }

    /// Sets effectiveDateTime.
    pub fn with_effective(mut self, effective: impl Into<String>) -> Self {
        self.effective = Some(effective.into());
        self
    }

    /// Sets valueQuantity.
    pub fn with_quantity(mut self, value: f64, code: impl Into<String>) -> Self {
        self.quantity = Some((value, code.into()));
        self
    }

    /// Renders the document.
    pub fn to_json(&self) -> Value {
        let mut obs = json!({
            "resourceType": "Observation",
            "status": self.status,
            "code": {"coding": [{"system": "http://loinc.org", "code": self.code}]},
            "subject": self.subject,
        });
        if let Some(id) = &self.id {
            obs["id"] = json!(id);
        }
        if let Some(effective) = &self.effective {
            obs["effectiveDateTime"] = json!(effective);
        }
        if let Some((value, code)) = &self.quantity {
            obs["valueQuantity"] = json!({
                "value": value,
                "unit": code,
                "system": "http://unitsofmeasure.org",
                "code": code,
            });
        }
        obs
    }
}

/// A condition document about a patient.
pub fn condition(patient_ref: &str, clinical_status: &str) -> Value {
    json!({
        "resourceType": "Condition",
        "clinicalStatus": {
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/condition-clinical",
                "code": clinical_status,
            }],
        },
        "code": {"coding": [{"system": "http://snomed.info/sct", "code": "44054006"}]},
        "subject": {"reference": patient_ref},
        "onsetDateTime": "2021-03-14",
    })
}

/// An organization document.
pub fn organization(id: &str, name: &str) -> Value {
    json!({
        "resourceType": "Organization",
        "id": id,
        "name": name,
        "active": true,
    })
}
