//! Reference resolution.
//!
//! A reference may reach the store in several encodings:
//!
//! | Form | Example |
//! |------|---------|
//! | typed path | `Patient/p-100` |
//! | versioned path | `Patient/p-100/_history/2` |
//! | absolute URL | `http://example.org/fhir/Patient/p-100` |
//! | bare id | `p-100` (type from the parameter or `Reference.type`) |
//! | placeholder | `urn:uuid:6a1c...` |
//! | contained | `#med1` |
//! | identifier only | `{"identifier": {"system": "...", "value": "..."}}` |
//!
//! [`ReferenceResolver`] turns each of these into a [`ReferenceTarget`]. The
//! typed, versioned, absolute and bare forms all collapse to the same
//! canonical `(type, id)` pair, which is what the index stores and what
//! queries compare against.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static TYPED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:https?://.*/)?)([A-Z][A-Za-z]+)/([A-Za-z0-9\-\.]{1,64})(?:/_history/([A-Za-z0-9\-\.]{1,64}))?$")
        .expect("typed reference pattern")
});

/// A logical id: `[A-Za-z0-9\-\.]{1,64}`.
pub(crate) static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").expect("id pattern"));

/// The resolved form of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget {
    /// A canonical pair. The type is `None` only for a bare id whose
    /// declaring parameter allows several target types.
    Local {
        /// Target resource type.
        resource_type: Option<String>,
        /// Target logical id.
        id: String,
        /// Pinned version, when the reference was versioned.
        version: Option<String>,
    },

    /// A `urn:uuid:` or `urn:oid:` placeholder not yet substituted.
    Placeholder(String),

    /// A reference to a contained resource (`#id`).
    Contained(String),

    /// A logical reference through a business identifier.
    Identifier {
        /// Identifier system.
        system: Option<String>,
        /// Identifier value.
        value: String,
    },

    /// An absolute URL that does not name a `Type/id`.
    External(String),
}

impl ReferenceTarget {
    /// The target type, when known.
    pub fn resource_type(&self) -> Option<&str> {
        match self {
            ReferenceTarget::Local { resource_type, .. } => resource_type.as_deref(),
            _ => None,
        }
    }

    /// The target id, when the reference names one.
    pub fn id(&self) -> Option<&str> {
        match self {
            ReferenceTarget::Local { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The canonical `Type/id` string, when both halves are known.
    pub fn canonical(&self) -> Option<String> {
        match self {
            ReferenceTarget::Local {
                resource_type: Some(rt),
                id,
                ..
            } => Some(format!("{}/{}", rt, id)),
            _ => None,
        }
    }
}

/// A reference found in a document: the original text plus its resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    /// The reference string exactly as written, if there was one.
    pub raw: Option<String>,
    /// The resolved target.
    pub target: ReferenceTarget,
}

/// Normalizes reference encodings into canonical targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceResolver;

impl ReferenceResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Resolves a reference string.
    ///
    /// `type_hint` is the `Reference.type` element when present.
    /// `declared_targets` are the target types the declaring parameter
    /// allows; a bare id takes the type from the hint or, failing that, from
    /// a single declared target.
    pub fn resolve(
        &self,
        reference: &str,
        type_hint: Option<&str>,
        declared_targets: &[String],
    ) -> ReferenceTarget {
        let reference = reference.trim();

        if let Some(id) = reference.strip_prefix('#') {
            return ReferenceTarget::Contained(id.to_string());
        }
        if reference.starts_with("urn:uuid:") || reference.starts_with("urn:oid:") {
            return ReferenceTarget::Placeholder(reference.to_string());
        }

        if let Some(caps) = TYPED_PATH.captures(reference) {
            return ReferenceTarget::Local {
                resource_type: Some(caps[1].to_string()),
                id: caps[2].to_string(),
                version: caps.get(3).map(|m| m.as_str().to_string()),
            };
        }

        if ID_PATTERN.is_match(reference) {
            let resource_type = type_hint.map(str::to_string).or_else(|| {
                if declared_targets.len() == 1 {
                    Some(declared_targets[0].clone())
                } else {
                    None
                }
            });
            return ReferenceTarget::Local {
                resource_type,
                id: reference.to_string(),
                version: None,
            };
        }

        ReferenceTarget::External(reference.to_string())
    }

    /// Resolves a `Reference` element or a bare reference string.
    ///
    /// Returns `None` when the value carries neither a `reference` nor an
    /// `identifier`.
    pub fn resolve_value(
        &self,
        value: &Value,
        declared_targets: &[String],
    ) -> Option<ResolvedReference> {
        match value {
            Value::String(s) => Some(ResolvedReference {
                raw: Some(s.clone()),
                target: self.resolve(s, None, declared_targets),
            }),
            Value::Object(obj) => {
                let type_hint = obj.get("type").and_then(|v| v.as_str());
                if let Some(reference) = obj.get("reference").and_then(|v| v.as_str()) {
                    return Some(ResolvedReference {
                        raw: Some(reference.to_string()),
                        target: self.resolve(reference, type_hint, declared_targets),
                    });
                }
                let identifier = obj.get("identifier")?;
                let value = identifier.get("value").and_then(|v| v.as_str())?;
                Some(ResolvedReference {
                    raw: None,
                    target: ReferenceTarget::Identifier {
                        system: identifier
                            .get("system")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        value: value.to_string(),
                    },
                })
            }
            _ => None,
        }
    }

    /// Rewrites every `reference` string found in `document` through
    /// `placeholders` (fullUrl to `Type/id`). Returns the number of rewrites.
    pub fn rewrite_placeholders(
        &self,
        document: &mut Value,
        placeholders: &HashMap<String, String>,
    ) -> usize {
        if placeholders.is_empty() {
            return 0;
        }
        match document {
            Value::Object(obj) => {
                let mut count = 0;
                for (key, child) in obj.iter_mut() {
                    if key == "reference" {
                        if let Value::String(s) = child {
                            if let Some(replacement) = placeholders.get(s.as_str()) {
                                *s = replacement.clone();
                                count += 1;
                            }
                        }
                    } else {
                        count += self.rewrite_placeholders(child, placeholders);
                    }
                }
                count
            }
            Value::Array(items) => items
                .iter_mut()
                .map(|item| self.rewrite_placeholders(item, placeholders))
                .sum(),
            _ => 0,
        }
    }

    /// Rewrites placeholder values inside conditional criteria such as
    /// `subject=urn:uuid:...&code=x`.
    pub fn rewrite_criteria(
        &self,
        criteria: &str,
        placeholders: &HashMap<String, String>,
    ) -> String {
        criteria
            .split('&')
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => match placeholders.get(value) {
                    Some(replacement) => format!("{}={}", name, replacement),
                    None => pair.to_string(),
                },
                None => pair.to_string(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}
