//! Extraction path interpreter.
//!
//! Search parameter definitions locate their values with a small path
//! language:
//!
//! ```text
//! Patient.name.family                       field walk (arrays are flattened)
//! Condition.onset[x]                        polymorphic slot, any variant
//! Observation.value[x]:Quantity             polymorphic slot, one variant
//! Patient.telecom.where(system='phone')     equality filter
//! Condition.onset[x]:DateTime | Condition.onset[x]:Period
//!                                           union
//! ```
//!
//! A polymorphic slot `onset[x]` matches the single populated key made of
//! the slot name followed by a capitalized type name (`onsetDateTime`,
//! `onsetPeriod`). The matched type name travels with the value so the
//! converter can switch on it instead of guessing from the JSON shape.

use serde_json::Value;

use super::errors::ExtractionError;

/// A compiled extraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    branches: Vec<Vec<Step>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Field(String),
    Choice {
        name: String,
        variant: Option<String>,
    },
    Where {
        field: String,
        equals: String,
    },
}

/// A value reached by a path, with the variant it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathMatch<'a> {
    /// The value.
    pub value: &'a Value,
    /// The type name of the polymorphic variant, e.g. `Period`.
    pub variant: Option<&'a str>,
}

impl PathExpr {
    /// Compiles a path expression.
    ///
    /// An empty expression compiles to a path that matches nothing; it is
    /// used by parameters answered from resource metadata.
    pub fn parse(expression: &str) -> Result<Self, ExtractionError> {
        let mut branches = Vec::new();
        for branch in split_outside_quotes(expression, '|') {
            let branch = branch.trim();
            if branch.is_empty() {
                continue;
            }
            branches.push(parse_branch(branch, expression)?);
        }
        Ok(Self { branches })
    }

    /// Returns true if the path matches nothing.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Evaluates the path against a resource.
    pub fn evaluate<'a>(&self, resource: &'a Value) -> Vec<PathMatch<'a>> {
        let mut results = Vec::new();
        for branch in &self.branches {
            let mut current = vec![PathMatch {
                value: resource,
                variant: None,
            }];
            for step in branch {
                current = apply_step(step, current);
                if current.is_empty() {
                    break;
                }
            }
            results.extend(current);
        }
        results
    }
}

fn parse_branch(branch: &str, expression: &str) -> Result<Vec<Step>, ExtractionError> {
    let invalid = |message: &str| ExtractionError::InvalidPath {
        path: expression.to_string(),
        message: message.to_string(),
    };

    let mut segments = split_outside_quotes(branch, '.').into_iter().peekable();

    // Leading resource type (`Patient.`, `Resource.`).
    if let Some(first) = segments.peek() {
        if first.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            segments.next();
        }
    }

    let mut steps = Vec::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }

        if let Some(args) = segment
            .strip_prefix("where(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let (field, literal) = args
                .split_once('=')
                .ok_or_else(|| invalid("where() expects field='value'"))?;
            let equals = literal
                .trim()
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| invalid("where() value must be quoted"))?;
            steps.push(Step::Where {
                field: field.trim().to_string(),
                equals: equals.to_string(),
            });
            continue;
        }

        if let Some(pos) = segment.find("[x]") {
            let name = &segment[..pos];
            let rest = &segment[pos + 3..];
            let variant = match rest.strip_prefix(':') {
                Some(v) if !v.is_empty() => Some(v.to_string()),
                Some(_) => return Err(invalid("missing variant type after ':'")),
                None if rest.is_empty() => None,
                None => return Err(invalid("unexpected text after [x]")),
            };
            if name.is_empty() {
                return Err(invalid("polymorphic slot without a name"));
            }
            steps.push(Step::Choice {
                name: name.to_string(),
                variant,
            });
            continue;
        }

        if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("unsupported path syntax"));
        }
        steps.push(Step::Field(segment.to_string()));
    }

    if steps.is_empty() {
        return Err(invalid("path selects no element"));
    }
    Ok(steps)
}

fn apply_step<'a>(step: &Step, current: Vec<PathMatch<'a>>) -> Vec<PathMatch<'a>> {
    let mut next = Vec::new();
    for m in current {
        match step {
            Step::Field(name) => {
                if let Some(child) = m.value.get(name) {
                    push_flattened(&mut next, child, None);
                }
            }
            Step::Choice { name, variant } => {
                let Some(obj) = m.value.as_object() else {
                    continue;
                };
                let populated: Vec<(&'a str, &'a Value)> = obj
                    .iter()
                    .filter_map(|(key, child)| {
                        let suffix = key.strip_prefix(name.as_str())?;
                        suffix
                            .chars()
                            .next()
                            .filter(char::is_ascii_uppercase)
                            .map(|_| (suffix, child))
                    })
                    .collect();

                if populated.len() > 1 {
                    tracing::warn!(
                        slot = %name,
                        variants = populated.len(),
                        "polymorphic slot has more than one populated variant"
                    );
                }

                for (suffix, child) in populated {
                    if variant.as_deref().is_none_or(|v| v == suffix) {
                        push_flattened(&mut next, child, Some(suffix));
                    }
                }
            }
            Step::Where { field, equals } => {
                if m.value.get(field).and_then(|v| v.as_str()) == Some(equals.as_str()) {
                    next.push(m);
                }
            }
        }
    }
    next
}

fn push_flattened<'a>(out: &mut Vec<PathMatch<'a>>, value: &'a Value, variant: Option<&'a str>) {
    match value {
        Value::Array(items) => out.extend(items.iter().map(|value| PathMatch { value, variant })),
        Value::Null => {}
        _ => out.push(PathMatch { value, variant }),
    }
}

/// Splits on `sep` outside single quotes and parentheses.
fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == sep && !in_quotes && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}
