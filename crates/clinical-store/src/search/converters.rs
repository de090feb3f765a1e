//! Value Converters for Search Index.
//!
//! Converts path evaluation results into index-friendly values.
//! Each element shape is mapped to the index columns of its parameter type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DateRange, SearchParamType};

use super::errors::ExtractionError;
use super::path::PathMatch;
use super::reference::{ReferenceResolver, ReferenceTarget};
use super::registry::SearchParameterDefinition;

/// The shape of the element a path lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueShape {
    /// A JSON string, number or boolean.
    Primitive,
    /// `HumanName`
    HumanName,
    /// `Address`
    Address,
    /// `ContactPoint`
    ContactPoint,
    /// `Coding`
    Coding,
    /// `CodeableConcept`
    CodeableConcept,
    /// `Identifier`
    Identifier,
    /// `Period`
    Period,
    /// `Quantity` and its profiles (`Age`, `Duration`, ...)
    Quantity,
    /// `Reference`
    Reference,
}

impl ValueShape {
    /// Maps the type name of a polymorphic variant to its shape.
    ///
    /// Returns `None` for types the index has no use for.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "String" | "Boolean" | "Integer" | "PositiveInt" | "UnsignedInt" | "Decimal"
            | "Date" | "DateTime" | "Instant" | "Time" | "Code" | "Uri" | "Url"
            | "Canonical" => Some(ValueShape::Primitive),
            "Period" => Some(ValueShape::Period),
            "Quantity" | "SimpleQuantity" | "Age" | "Duration" | "Distance" | "Count"
            | "Money" => Some(ValueShape::Quantity),
            "CodeableConcept" => Some(ValueShape::CodeableConcept),
            "Coding" => Some(ValueShape::Coding),
            "Reference" => Some(ValueShape::Reference),
            "Identifier" => Some(ValueShape::Identifier),
            "HumanName" => Some(ValueShape::HumanName),
            "Address" => Some(ValueShape::Address),
            "ContactPoint" => Some(ValueShape::ContactPoint),
            _ => None,
        }
    }

    /// Guesses the shape of an element from its content.
    ///
    /// Only used for runtime-registered parameters that declare no shape.
    pub fn infer(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return ValueShape::Primitive;
        };
        let has = |key: &str| obj.contains_key(key);
        if has("coding") {
            ValueShape::CodeableConcept
        } else if has("reference") || (has("identifier") && !has("value")) {
            ValueShape::Reference
        } else if has("family") || has("given") {
            ValueShape::HumanName
        } else if has("line") || has("city") || has("postalCode") {
            ValueShape::Address
        } else if has("start") || has("end") {
            ValueShape::Period
        } else if obj.get("value").is_some_and(Value::is_number) {
            ValueShape::Quantity
        } else if has("value") {
            ValueShape::Identifier
        } else {
            ValueShape::Coding
        }
    }
}

/// A value extracted and converted for the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// String value: lowercased for prefix matching, raw for `:exact`.
    String {
        /// Lowercased value.
        normalized: String,
        /// Value as written.
        raw: String,
    },

    /// Token value (code with optional system).
    Token {
        /// Code system URI (e.g., "http://loinc.org").
        system: Option<String>,
        /// Code value. Empty for display-only entries.
        code: String,
        /// Display text (Coding.display or CodeableConcept.text) for :text modifier.
        display: Option<String>,
    },

    /// Date value as the closed range of instants it denotes.
    Date(DateRange),

    /// Numeric value.
    Number {
        /// The value.
        value: f64,
        /// The literal as written.
        raw: String,
    },

    /// Quantity value with optional unit.
    Quantity {
        /// Numeric value.
        value: f64,
        /// Unit string (e.g., "kg", "mmHg").
        unit: Option<String>,
        /// Unit system URI (e.g., "http://unitsofmeasure.org").
        system: Option<String>,
        /// Unit code (e.g., "kg").
        code: Option<String>,
    },

    /// Reference to another resource.
    Reference {
        /// Reference string as written.
        raw: Option<String>,
        /// Resolved target.
        target: ReferenceTarget,
    },

    /// URI value.
    Uri(String),
}

impl IndexValue {
    /// Creates a string index value.
    pub fn string(s: impl Into<String>) -> Self {
        let raw = s.into();
        IndexValue::String {
            normalized: raw.to_lowercase(),
            raw,
        }
    }

    /// Creates a token index value with system and code.
    pub fn token(system: Option<String>, code: impl Into<String>) -> Self {
        IndexValue::Token {
            system,
            code: code.into(),
            display: None,
        }
    }

    /// Creates a token index value with display text for :text modifier.
    pub fn token_with_display(
        system: Option<String>,
        code: impl Into<String>,
        display: Option<String>,
    ) -> Self {
        IndexValue::Token {
            system,
            code: code.into(),
            display,
        }
    }

    /// Creates a token index value for display-only text (e.g., CodeableConcept.text).
    pub fn token_display_only(display: impl Into<String>) -> Self {
        IndexValue::Token {
            system: None,
            code: String::new(),
            display: Some(display.into()),
        }
    }

    /// Returns the parameter type this value is appropriate for.
    pub fn param_type(&self) -> SearchParamType {
        match self {
            IndexValue::String { .. } => SearchParamType::String,
            IndexValue::Token { .. } => SearchParamType::Token,
            IndexValue::Date(_) => SearchParamType::Date,
            IndexValue::Number { .. } => SearchParamType::Number,
            IndexValue::Quantity { .. } => SearchParamType::Quantity,
            IndexValue::Reference { .. } => SearchParamType::Reference,
            IndexValue::Uri(_) => SearchParamType::Uri,
        }
    }
}

/// Converter for transforming path matches to index values.
pub struct ValueConverter;

impl ValueConverter {
    /// Converts one path match for a parameter.
    ///
    /// The shape comes from the polymorphic variant when there is one, then
    /// from the definition, and is inferred from content only as a last
    /// resort. A variant whose type the index does not use yields nothing.
    pub fn convert(
        m: &PathMatch<'_>,
        param: &SearchParameterDefinition,
        resolver: &ReferenceResolver,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        let shape = match m.variant {
            Some(variant) => match ValueShape::from_type_name(variant) {
                Some(shape) => shape,
                None => return Ok(Vec::new()),
            },
            None => param.shape.unwrap_or_else(|| ValueShape::infer(m.value)),
        };

        let value = m.value;
        match param.param_type {
            SearchParamType::String => Ok(Self::convert_to_string(value, shape)),
            SearchParamType::Token => Ok(Self::convert_to_token(value, shape)),
            SearchParamType::Date => Self::convert_to_date(value, shape, &param.code),
            SearchParamType::Number => Self::convert_to_number(value, shape, &param.code),
            SearchParamType::Quantity => Ok(Self::convert_to_quantity(value, shape)),
            SearchParamType::Reference => {
                Ok(Self::convert_to_reference(value, shape, param, resolver))
            }
            SearchParamType::Uri => Ok(Self::convert_to_uri(value, shape)),
        }
    }

    fn convert_to_string(value: &Value, shape: ValueShape) -> Vec<IndexValue> {
        let mut results = Vec::new();
        let mut push = |v: Option<&Value>| match v {
            Some(Value::String(s)) if !s.is_empty() => results.push(IndexValue::string(s.clone())),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str().filter(|s| !s.is_empty()) {
                        results.push(IndexValue::string(s));
                    }
                }
            }
            _ => {}
        };

        match shape {
            ValueShape::Primitive => push(Some(value)),
            ValueShape::HumanName => {
                for key in ["family", "given", "prefix", "suffix", "text"] {
                    push(value.get(key));
                }
            }
            ValueShape::Address => {
                for key in [
                    "line",
                    "city",
                    "district",
                    "state",
                    "postalCode",
                    "country",
                    "text",
                ] {
                    push(value.get(key));
                }
            }
            ValueShape::CodeableConcept | ValueShape::Coding => {
                push(value.get("text"));
                push(value.get("display"));
            }
            _ => {}
        }
        results
    }

    fn convert_to_token(value: &Value, shape: ValueShape) -> Vec<IndexValue> {
        let text = |v: Option<&Value>| v.and_then(|v| v.as_str()).map(String::from);
        let mut results = Vec::new();

        match shape {
            ValueShape::Primitive => match value {
                Value::String(s) => results.push(IndexValue::token(None, s.clone())),
                Value::Bool(b) => results.push(IndexValue::token(None, b.to_string())),
                Value::Number(n) => results.push(IndexValue::token(None, n.to_string())),
                _ => {}
            },
            ValueShape::Coding => {
                if let Some(code) = value.get("code").and_then(|v| v.as_str()) {
                    results.push(IndexValue::token_with_display(
                        text(value.get("system")),
                        code,
                        text(value.get("display")),
                    ));
                }
            }
            ValueShape::CodeableConcept => {
                if let Some(coding) = value.get("coding").and_then(|v| v.as_array()) {
                    for c in coding {
                        if let Some(code) = c.get("code").and_then(|v| v.as_str()) {
                            results.push(IndexValue::token_with_display(
                                text(c.get("system")),
                                code,
                                text(c.get("display")),
                            ));
                        }
                    }
                }
                if let Some(t) = value.get("text").and_then(|v| v.as_str()) {
                    if !t.is_empty() {
                        results.push(IndexValue::token_display_only(t));
                    }
                }
            }
            ValueShape::Identifier | ValueShape::ContactPoint => {
                if let Some(v) = value.get("value").and_then(|v| v.as_str()) {
                    if !v.is_empty() {
                        results.push(IndexValue::token(text(value.get("system")), v));
                    }
                }
            }
            _ => {}
        }
        results
    }

    fn convert_to_date(
        value: &Value,
        shape: ValueShape,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        match (shape, value) {
            (ValueShape::Primitive, Value::String(s)) => DateRange::parse(s)
                .map(|range| vec![IndexValue::Date(range)])
                .ok_or_else(|| ExtractionError::ConversionFailed {
                    param_name: param_name.to_string(),
                    expected_type: "date".to_string(),
                    actual_value: s.clone(),
                }),
            (ValueShape::Period, Value::Object(obj)) => {
                let start = obj.get("start").and_then(|v| v.as_str());
                let end = obj.get("end").and_then(|v| v.as_str());
                Ok(DateRange::from_period(start, end)
                    .map(IndexValue::Date)
                    .into_iter()
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn convert_to_number(
        value: &Value,
        shape: ValueShape,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        if shape != ValueShape::Primitive {
            return Ok(Vec::new());
        }
        match value {
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(|| ExtractionError::ConversionFailed {
                    param_name: param_name.to_string(),
                    expected_type: "number".to_string(),
                    actual_value: n.to_string(),
                })?;
                Ok(vec![IndexValue::Number {
                    value: f,
                    raw: n.to_string(),
                }])
            }
            Value::String(s) => {
                let f: f64 = s.parse().map_err(|_| ExtractionError::ConversionFailed {
                    param_name: param_name.to_string(),
                    expected_type: "number".to_string(),
                    actual_value: s.clone(),
                })?;
                Ok(vec![IndexValue::Number {
                    value: f,
                    raw: s.clone(),
                }])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn convert_to_quantity(value: &Value, shape: ValueShape) -> Vec<IndexValue> {
        if shape != ValueShape::Quantity {
            return Vec::new();
        }
        let Some(obj) = value.as_object() else {
            return Vec::new();
        };
        let Some(val) = obj.get("value").and_then(|v| v.as_f64()) else {
            return Vec::new();
        };
        let field = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(String::from);
        let code = field("code");
        vec![IndexValue::Quantity {
            value: val,
            unit: field("unit").or_else(|| code.clone()),
            system: field("system"),
            code,
        }]
    }

    fn convert_to_reference(
        value: &Value,
        shape: ValueShape,
        param: &SearchParameterDefinition,
        resolver: &ReferenceResolver,
    ) -> Vec<IndexValue> {
        if !matches!(shape, ValueShape::Reference | ValueShape::Primitive) {
            return Vec::new();
        }
        let Some(resolved) = resolver.resolve_value(value, param.targets()) else {
            return Vec::new();
        };

        let disallowed = match &resolved.target {
            ReferenceTarget::Contained(_) => return Vec::new(),
            ReferenceTarget::Local {
                resource_type: Some(rt),
                ..
            } if !param.allows_target(rt) => Some(rt.clone()),
            _ => None,
        };
        if let Some(rt) = disallowed {
            tracing::warn!(
                parameter = %param.code,
                reference = resolved.raw.as_deref().unwrap_or_default(),
                target_type = %rt,
                "reference target type not allowed for parameter, not indexed"
            );
            return Vec::new();
        }

        vec![IndexValue::Reference {
            raw: resolved.raw,
            target: resolved.target,
        }]
    }

    fn convert_to_uri(value: &Value, shape: ValueShape) -> Vec<IndexValue> {
        match (shape, value) {
            (ValueShape::Primitive, Value::String(s)) => vec![IndexValue::Uri(s.clone())],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(code: &str, param_type: SearchParamType, shape: Option<ValueShape>) -> SearchParameterDefinition {
        let mut def = SearchParameterDefinition::new(
            format!("http://example.org/sp/{}", code),
            code,
            param_type,
            "Resource.x",
        )
        .with_base(["Patient"]);
        if let Some(shape) = shape {
            def = def.with_shape(shape);
        }
        def
    }

    fn convert(value: &Value, variant: Option<&str>, param: &SearchParameterDefinition) -> Vec<IndexValue> {
        let m = PathMatch { value, variant };
        ValueConverter::convert(&m, param, &ReferenceResolver::new()).unwrap()
    }

    #[test]
    fn test_convert_string_keeps_raw_and_lowercases() {
        let results = convert(&json!("Smith"), None, &def("family", SearchParamType::String, Some(ValueShape::Primitive)));
        assert_eq!(
            results,
            vec![IndexValue::String {
                normalized: "smith".to_string(),
                raw: "Smith".to_string(),
            }]
        );
    }

    #[test]
    fn test_convert_human_name() {
        let value = json!({"family": "Smith", "given": ["John", "Jane"], "prefix": ["Dr"]});
        let results = convert(&value, None, &def("name", SearchParamType::String, Some(ValueShape::HumanName)));
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_convert_codeable_concept_with_text() {
        let value = json!({
            "coding": [
                {"system": "http://snomed.info/sct", "code": "123", "display": "Asthma"},
                {"system": "http://hl7.org/fhir/sid/icd-10", "code": "J45"}
            ],
            "text": "Asthma, mild"
        });
        let results = convert(&value, None, &def("code", SearchParamType::Token, Some(ValueShape::CodeableConcept)));
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            IndexValue::token_with_display(
                Some("http://snomed.info/sct".to_string()),
                "123",
                Some("Asthma".to_string())
            )
        );
        assert_eq!(results[2], IndexValue::token_display_only("Asthma, mild"));
    }

    #[test]
    fn test_convert_identifier_and_boolean_tokens() {
        let id = json!({"system": "http://hospital.org/mrn", "value": "12345"});
        let results = convert(&id, None, &def("identifier", SearchParamType::Token, Some(ValueShape::Identifier)));
        assert_eq!(
            results,
            vec![IndexValue::token(Some("http://hospital.org/mrn".to_string()), "12345")]
        );

        let results = convert(&json!(true), None, &def("active", SearchParamType::Token, Some(ValueShape::Primitive)));
        assert_eq!(results, vec![IndexValue::token(None, "true")]);
    }

    #[test]
    fn test_date_variant_switches_shape() {
        let param = def("onset-date", SearchParamType::Date, None);

        let results = convert(&json!("2024-01-15"), Some("DateTime"), &param);
        assert!(matches!(&results[0], IndexValue::Date(r) if r.start_key() == "2024-01-15T00:00:00.000"));

        let period = json!({"start": "2024-01-01", "end": "2024-01-31"});
        let results = convert(&period, Some("Period"), &param);
        let IndexValue::Date(range) = &results[0] else {
            panic!("expected a date");
        };
        assert_eq!(range.start_key(), "2024-01-01T00:00:00.000");
        assert_eq!(range.end_key(), "2024-01-31T23:59:59.999");

        // An Age variant is not a date.
        assert!(convert(&json!({"value": 40}), Some("Age"), &param).is_empty());
    }

    #[test]
    fn test_unparseable_date_is_an_error() {
        let m = PathMatch {
            value: &json!("sometime"),
            variant: None,
        };
        let param = def("date", SearchParamType::Date, Some(ValueShape::Primitive));
        assert!(ValueConverter::convert(&m, &param, &ReferenceResolver::new()).is_err());
    }

    #[test]
    fn test_convert_quantity() {
        let value = json!({
            "value": 120.5,
            "unit": "mmHg",
            "system": "http://unitsofmeasure.org",
            "code": "mm[Hg]"
        });
        let results = convert(&value, Some("Quantity"), &def("value-quantity", SearchParamType::Quantity, None));
        assert_eq!(
            results,
            vec![IndexValue::Quantity {
                value: 120.5,
                unit: Some("mmHg".to_string()),
                system: Some("http://unitsofmeasure.org".to_string()),
                code: Some("mm[Hg]".to_string()),
            }]
        );
    }

    #[test]
    fn test_reference_type_restriction() {
        let param = def("patient", SearchParamType::Reference, Some(ValueShape::Reference))
            .with_targets(["Patient"]);

        let ok = convert(&json!({"reference": "Patient/1"}), None, &param);
        assert_eq!(ok.len(), 1);

        let rejected = convert(&json!({"reference": "Group/1"}), None, &param);
        assert!(rejected.is_empty());

        let contained = convert(&json!({"reference": "#p1"}), None, &param);
        assert!(contained.is_empty());
    }

    #[test]
    fn test_infer_shape() {
        assert_eq!(ValueShape::infer(&json!("x")), ValueShape::Primitive);
        assert_eq!(ValueShape::infer(&json!({"coding": []})), ValueShape::CodeableConcept);
        assert_eq!(ValueShape::infer(&json!({"reference": "Patient/1"})), ValueShape::Reference);
        assert_eq!(ValueShape::infer(&json!({"value": 1, "unit": "kg"})), ValueShape::Quantity);
        assert_eq!(ValueShape::infer(&json!({"system": "s", "value": "1"})), ValueShape::Identifier);
    }
}
