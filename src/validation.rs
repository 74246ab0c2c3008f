//! Input validation.
//!
//! Validates a raw input map against a workflow's declared input specs:
//! unexpected keys, required fields, defaults, string-to-primitive coercion
//! and per-spec constraints. All failures are collected and returned together
//! so clients see every problem in one response.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::FieldError;
use crate::types::workflow::{InputSpec, InputType};

/// Result of validating one input map.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Inputs after coercion and default filling. Validating this map again
    /// is the identity.
    pub processed: Map<String, Value>,
    pub errors: Vec<FieldError>,
}

/// Validate `raw` against `specs`.
///
/// Rule order per field: unexpected-key check, required/default resolution,
/// type coercion, then constraint checks on well-typed values only.
pub fn validate_inputs(
    specs: &HashMap<String, InputSpec>,
    raw: &Map<String, Value>,
) -> ValidationOutcome {
    let mut errors = Vec::new();
    let mut processed = Map::new();

    for key in raw.keys() {
        if !specs.contains_key(key) {
            errors.push(
                FieldError::new(key, "unexpected input field").with_value(raw[key].clone()),
            );
        }
    }

    // Deterministic ordering keeps error lists stable across runs.
    let mut names: Vec<&String> = specs.keys().collect();
    names.sort();

    for name in names {
        let spec = &specs[name];
        let candidate = match raw.get(name) {
            Some(value) => value.clone(),
            None => {
                if let Some(default) = &spec.default {
                    default.clone()
                } else {
                    if spec.required {
                        errors.push(FieldError::new(name, "required field is missing"));
                    }
                    continue;
                }
            }
        };

        let coerced = match coerce(&candidate, spec.input_type) {
            Some(value) => value,
            None => {
                errors.push(FieldError::new(name, "invalid type").with_value(candidate));
                continue;
            }
        };

        errors.extend(check_constraints(name, &coerced, spec));
        processed.insert(name.clone(), coerced);
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        processed,
        errors,
    }
}

/// Coerce `value` to `target`, or `None` when the value cannot represent it.
///
/// Only strings coerce (to integer, number and boolean, when parseable);
/// arrays and objects never do. Integers accept floats with a zero fraction.
fn coerce(value: &Value, target: InputType) -> Option<Value> {
    match target {
        InputType::String => value.is_string().then(|| value.clone()),
        InputType::Integer => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::from(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::from(f as i64))
                }
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        InputType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(|f| {
                serde_json::Number::from_f64(f).map(Value::Number)
            }),
            _ => None,
        },
        InputType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => s.trim().parse::<bool>().ok().map(Value::from),
            _ => None,
        },
        InputType::Array => value.is_array().then(|| value.clone()),
        InputType::Object => value.is_object().then(|| value.clone()),
    }
}

/// Constraint checks over an already well-typed value.
///
/// Also used at workflow load time to reject declared defaults that violate
/// their own constraints.
pub fn check_constraints(name: &str, value: &Value, spec: &InputSpec) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Some(allowed) = &spec.enum_values {
        if !allowed.contains(value) {
            let options = allowed
                .iter()
                .map(render_enum_option)
                .collect::<Vec<_>>()
                .join(", ");
            errors.push(
                FieldError::new(name, format!("must be one of {options}"))
                    .with_value(value.clone()),
            );
        }
    }

    if let (Some(pattern), Some(s)) = (&spec.pattern, value.as_str()) {
        match full_match_regex(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    errors.push(
                        FieldError::new(name, "does not match required pattern")
                            .with_value(value.clone()),
                    );
                }
            }
            Err(err) => {
                errors.push(FieldError::new(name, format!("invalid pattern: {err}")));
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(minimum) = spec.minimum {
            if n < minimum {
                errors.push(FieldError::new(name, "less than minimum").with_value(value.clone()));
            }
        }
        if let Some(maximum) = spec.maximum {
            if n > maximum {
                errors
                    .push(FieldError::new(name, "greater than maximum").with_value(value.clone()));
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min_items) = spec.min_items {
            if items.len() < min_items {
                errors.push(
                    FieldError::new(name, format!("minimum required is {min_items}"))
                        .with_value(value.clone()),
                );
            }
        }
        if let Some(max_items) = spec.max_items {
            if items.len() > max_items {
                errors.push(
                    FieldError::new(name, format!("maximum allowed is {max_items}"))
                        .with_value(value.clone()),
                );
            }
        }
    }

    errors
}

fn render_enum_option(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Anchor a user pattern so it must match the full string.
fn full_match_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let anchored = format!("^(?:{pattern})$");
    Regex::new(&anchored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs_one(name: &str, spec: InputSpec) -> HashMap<String, InputSpec> {
        HashMap::from([(name.to_string(), spec)])
    }

    fn raw(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_unexpected_field_collected() {
        let outcome = validate_inputs(&HashMap::new(), &raw(&[("ghost", json!(1))]));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].message, "unexpected input field");
    }

    #[test]
    fn test_missing_required() {
        let specs = specs_one("name", InputSpec::new(InputType::String).required());
        let outcome = validate_inputs(&specs, &Map::new());
        assert_eq!(outcome.errors[0].field, "name");
        assert_eq!(outcome.errors[0].message, "required field is missing");
    }

    #[test]
    fn test_default_fills_missing_optional() {
        let specs = specs_one(
            "topic",
            InputSpec::new(InputType::String).with_default(json!("news")),
        );
        let outcome = validate_inputs(&specs, &Map::new());
        assert!(outcome.valid);
        assert_eq!(outcome.processed["topic"], json!("news"));
    }

    #[test]
    fn test_default_must_pass_constraints() {
        let mut spec = InputSpec::new(InputType::Integer).with_default(json!(3));
        spec.minimum = Some(10.0);
        let specs = specs_one("count", spec);
        let outcome = validate_inputs(&specs, &Map::new());
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].message, "less than minimum");
    }

    #[test]
    fn test_string_coercion() {
        let specs = HashMap::from([
            ("age".to_string(), InputSpec::new(InputType::Integer)),
            ("score".to_string(), InputSpec::new(InputType::Number)),
            ("flag".to_string(), InputSpec::new(InputType::Boolean)),
        ]);
        let outcome = validate_inputs(
            &specs,
            &raw(&[
                ("age", json!("42")),
                ("score", json!("2.5")),
                ("flag", json!("false")),
            ]),
        );
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.processed["age"], json!(42));
        assert_eq!(outcome.processed["score"], json!(2.5));
        assert_eq!(outcome.processed["flag"], json!(false));
    }

    #[test]
    fn test_coercion_failure_echoes_value() {
        let specs = specs_one("age", InputSpec::new(InputType::Integer));
        let outcome = validate_inputs(&specs, &raw(&[("age", json!("not a number"))]));
        assert_eq!(outcome.errors[0].message, "invalid type");
        assert_eq!(outcome.errors[0].value, Some(json!("not a number")));
    }

    #[test]
    fn test_arrays_never_coerce() {
        let specs = specs_one("items", InputSpec::new(InputType::Array));
        let outcome = validate_inputs(&specs, &raw(&[("items", json!("[1,2]"))]));
        assert_eq!(outcome.errors[0].message, "invalid type");
    }

    #[test]
    fn test_enum_membership() {
        let mut spec = InputSpec::new(InputType::String);
        spec.enum_values = Some(vec![json!("admin"), json!("user")]);
        let specs = specs_one("role", spec);
        let outcome = validate_inputs(&specs, &raw(&[("role", json!("superuser"))]));
        assert_eq!(outcome.errors[0].message, "must be one of admin, user");
    }

    #[test]
    fn test_pattern_is_full_string_match() {
        let mut spec = InputSpec::new(InputType::String);
        spec.pattern = Some("[a-z]+".to_string());
        let specs = specs_one("slug", spec);

        let ok = validate_inputs(&specs, &raw(&[("slug", json!("alpha"))]));
        assert!(ok.valid);

        let bad = validate_inputs(&specs, &raw(&[("slug", json!("Alpha123"))]));
        assert_eq!(bad.errors[0].message, "does not match required pattern");
    }

    #[test]
    fn test_numeric_bounds() {
        let mut spec = InputSpec::new(InputType::Integer);
        spec.minimum = Some(18.0);
        spec.maximum = Some(99.0);
        let specs = specs_one("age", spec);

        let low = validate_inputs(&specs, &raw(&[("age", json!(15))]));
        assert_eq!(low.errors[0].message, "less than minimum");

        let high = validate_inputs(&specs, &raw(&[("age", json!(120))]));
        assert_eq!(high.errors[0].message, "greater than maximum");
    }

    #[test]
    fn test_min_items_boundaries() {
        let mut zero = InputSpec::new(InputType::Array);
        zero.min_items = Some(0);
        let outcome = validate_inputs(&specs_one("xs", zero), &raw(&[("xs", json!([]))]));
        assert!(outcome.valid, "min_items = 0 must accept empty arrays");

        let mut one = InputSpec::new(InputType::Array);
        one.min_items = Some(1);
        let outcome = validate_inputs(&specs_one("xs", one), &raw(&[("xs", json!([]))]));
        assert_eq!(outcome.errors[0].message, "minimum required is 1");
    }

    #[test]
    fn test_max_items() {
        let mut spec = InputSpec::new(InputType::Array);
        spec.max_items = Some(2);
        let outcome = validate_inputs(
            &specs_one("xs", spec),
            &raw(&[("xs", json!([1, 2, 3]))]),
        );
        assert_eq!(outcome.errors[0].message, "maximum allowed is 2");
    }

    #[test]
    fn test_all_errors_collected() {
        let mut name = InputSpec::new(InputType::String).required();
        name.pattern = Some("[A-Za-z ]+".to_string());
        let mut age = InputSpec::new(InputType::Integer);
        age.minimum = Some(18.0);
        let mut email = InputSpec::new(InputType::String);
        email.pattern = Some(r"[^@]+@[^@]+\.[^@]+".to_string());
        let mut skills = InputSpec::new(InputType::Array);
        skills.min_items = Some(1);
        let mut role = InputSpec::new(InputType::String);
        role.enum_values = Some(vec![json!("admin"), json!("user")]);

        let specs = HashMap::from([
            ("name".to_string(), name),
            ("age".to_string(), age),
            ("email".to_string(), email),
            ("skills".to_string(), skills),
            ("role".to_string(), role),
        ]);

        let outcome = validate_inputs(
            &specs,
            &raw(&[
                ("name", json!("Alice123")),
                ("age", json!(15)),
                ("email", json!("invalid")),
                ("skills", json!([])),
                ("role", json!("superuser")),
                ("unexpected", json!("x")),
            ]),
        );

        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 6, "errors: {:?}", outcome.errors);
        let fields: std::collections::HashSet<&str> =
            outcome.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields.len(), 6);
    }

    #[test]
    fn test_processed_inputs_revalidate_to_identity() {
        let mut age = InputSpec::new(InputType::Integer);
        age.minimum = Some(0.0);
        let specs = HashMap::from([
            ("age".to_string(), age),
            (
                "topic".to_string(),
                InputSpec::new(InputType::String).with_default(json!("news")),
            ),
        ]);

        let first = validate_inputs(&specs, &raw(&[("age", json!("30"))]));
        assert!(first.valid);

        let second = validate_inputs(&specs, &first.processed);
        assert!(second.valid);
        assert_eq!(second.processed, first.processed);
    }
}
