//! Structural validation of canonical payloads.
//!
//! The contract lives in `schemas/normalized_payload.v1.json` and is consumed
//! by a generic one-pass routine, so adding a source system never touches
//! validation logic. Every violation is collected, not just the first;
//! unknown keys are rejected everywhere except inside `metadata`/`profile`
//! bags, which are deliberate pass-through extension points.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use lmx_core::domain::NormalizedPayload;

use crate::observability::metrics;

static SCHEMA_JSON: Lazy<Value> = Lazy::new(|| {
    serde_json::from_str(include_str!("../../schemas/normalized_payload.v1.json"))
        .expect("embedded payload schema is valid JSON")
});

static COMPILED: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::options()
        .compile(&SCHEMA_JSON)
        .expect("embedded payload schema compiles")
});

/// Outcome of a validation pass. `errors` is empty iff `valid`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate a typed payload. The single gate every adapter output passes
/// before being forwarded downstream, agnostic to which adapter built it.
pub fn validate(payload: &NormalizedPayload) -> ValidationReport {
    match payload.to_value() {
        Ok(value) => validate_value(&value),
        Err(e) => ValidationReport {
            valid: false,
            errors: vec![format!("$ payload failed to serialize: {e}")],
        },
    }
}

/// Validate an untyped JSON value against the canonical contract, collecting
/// every violation in one pass as `<jsonPath> <message>` strings.
pub fn validate_value(instance: &Value) -> ValidationReport {
    let errors: Vec<String> = match COMPILED.validate(instance) {
        Ok(()) => Vec::new(),
        Err(violations) => violations
            .map(|error| format!("{} {}", json_path(&error.instance_path.to_string()), error))
            .collect(),
    };

    if errors.is_empty() {
        metrics::validate::payload_valid();
        ValidationReport {
            valid: true,
            errors,
        }
    } else {
        metrics::validate::payload_invalid(errors.len() as u64);
        debug!(violations = errors.len(), "payload failed structural validation");
        ValidationReport {
            valid: false,
            errors,
        }
    }
}

/// Render a JSON pointer (`/learners/0/email`) as the `$.learners[0].email`
/// path form used in error strings.
fn json_path(pointer: &str) -> String {
    if pointer.is_empty() {
        return "$".to_string();
    }
    let mut path = String::from("$");
    for segment in pointer.trim_start_matches('/').split('/') {
        let unescaped = segment.replace("~1", "/").replace("~0", "~");
        if !unescaped.is_empty() && unescaped.chars().all(|c| c.is_ascii_digit()) {
            path.push('[');
            path.push_str(&unescaped);
            path.push(']');
        } else {
            path.push('.');
            path.push_str(&unescaped);
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_payload() -> Value {
        json!({
            "source": {"lms": "canvas", "rawCourseId": "1234", "fetchedAt": "2025-09-10T14:23:00Z"},
            "course": {"id": "1234"}
        })
    }

    #[test]
    fn minimal_payload_is_valid() {
        let report = validate_value(&minimal_payload());
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn collects_all_violations_in_one_pass() {
        let instance = json!({
            "source": {"lms": "canvas", "fetchedAt": "2025-09-10T14:23:00Z"},
            "course": {},
            "learners": [{
                "assignments": [{
                    "id": "a1",
                    "submissions": [{"grades": [{"score": "eighteen"}]}]
                }]
            }]
        });
        let report = validate_value(&instance);
        assert!(!report.valid);
        assert!(report.errors.len() >= 2, "got: {:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.starts_with("$.course ")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("learners[0].assignments[0].submissions[0].grades[0].score")));
    }

    #[test]
    fn unknown_keys_inside_metadata_are_permitted() {
        let mut instance = minimal_payload();
        instance["course"]["metadata"] = json!({"sis_export_batch": 42, "anything": {"nested": true}});
        let report = validate_value(&instance);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn unknown_keys_elsewhere_are_rejected() {
        let mut instance = minimal_payload();
        instance["course"]["colour"] = json!("green");
        let report = validate_value(&instance);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("$.course ")));
    }

    #[test]
    fn unknown_lms_is_rejected() {
        let mut instance = minimal_payload();
        instance["source"]["lms"] = json!("chalkboard");
        let report = validate_value(&instance);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("$.source.lms ")));
    }

    #[test]
    fn empty_course_id_is_rejected() {
        let mut instance = minimal_payload();
        instance["course"]["id"] = json!("");
        let report = validate_value(&instance);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("$.course.id ")));
    }

    #[test]
    fn null_score_is_valid_but_missing_score_key_is_not() {
        let mut instance = minimal_payload();
        instance["learners"] = json!([{
            "id": "7",
            "assignments": [{"id": "a1", "submissions": [{"grades": [{"score": null}]}]}]
        }]);
        assert!(validate_value(&instance).valid);

        instance["learners"][0]["assignments"][0]["submissions"][0]["grades"][0] = json!({});
        let report = validate_value(&instance);
        assert!(!report.valid);
    }

    #[test]
    fn malformed_timestamp_strings_are_rejected() {
        let mut instance = minimal_payload();
        instance["course"]["startDate"] = json!("sometime in fall");
        let report = validate_value(&instance);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("$.course.startDate ")));
    }

    #[test]
    fn json_path_rendering() {
        assert_eq!(json_path(""), "$");
        assert_eq!(json_path("/course/id"), "$.course.id");
        assert_eq!(json_path("/learners/0/email"), "$.learners[0].email");
    }
}
