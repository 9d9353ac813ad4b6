//! Shared plumbing for the per-source adapters.
//!
//! Each adapter is a free function mapping one source system's export shape
//! into a [`NormalizedPayload`]; the caller picks the function, nothing here
//! dispatches at runtime. The helpers in this module are the pieces every
//! adapter needs: id stringification, percentage parsing, the auxiliary
//! fragment index, and `SourceMeta` stamping.

pub mod adapters;

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use lmx_core::domain::{Lms, Percentage, SourceMeta};

pub use adapters::{
    normalize_blackboard, normalize_canvas, normalize_google_classroom, normalize_moodle,
};

/// Trimmed, non-empty string out of a JSON value.
pub(crate) fn string_of(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Deterministic decimal rendering of a source identifier. Strings pass
/// through trimmed; integers (and integral floats) print base-10 with no
/// leading zeros or locale formatting.
pub(crate) fn stringify_id(value: &Value) -> Option<String> {
    match value {
        Value::String(_) => string_of(value),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| format!("{}", f as i64))
            }
        }
        _ => None,
    }
}

pub(crate) fn number_of(value: &Value) -> Option<f64> {
    value.as_f64()
}

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*%?\s*$").expect("percentage pattern"));

/// Parse a raw percentage field already on the 0–100 convention. Formatted
/// strings like `"90.00 %"` become numbers; non-numeric strings pass through
/// as text rather than being dropped.
pub(crate) fn parse_percentage(value: &Value) -> Option<Percentage> {
    match value {
        Value::Number(n) => n.as_f64().map(Percentage::Number),
        Value::String(s) => {
            if let Some(caps) = PERCENT_RE.captures(s) {
                if let Ok(n) = caps[1].parse::<f64>() {
                    return Some(Percentage::Number(n));
                }
            }
            let t = s.trim();
            (!t.is_empty()).then(|| Percentage::Text(t.to_string()))
        }
        _ => None,
    }
}

/// Scale a fractional grade (0–1) to the canonical 0–100 convention.
pub(crate) fn percent_from_fraction(fraction: f64) -> f64 {
    fraction * 100.0
}

/// Stamp the payload's provenance. `fetched_at` is the normalization
/// wall-clock time, never a value read from the raw export.
pub(crate) fn source_meta(lms: Lms, raw_course_id: Option<String>) -> SourceMeta {
    SourceMeta {
        lms,
        raw_course_id,
        fetched_at: Utc::now(),
    }
}

/// Lookup table over an auxiliary raw fragment, built once per adapter call
/// and consulted while submissions are constructed. Keyed on
/// `(learner id, assignment id)`; entries missing either key are skipped —
/// auxiliary data is best-effort enrichment, never a failure source.
pub(crate) struct AuxIndex<'a> {
    entries: HashMap<(String, String), &'a Value>,
}

impl<'a> AuxIndex<'a> {
    pub fn build(
        aux: Option<&'a Value>,
        list_key: &str,
        learner_key: &str,
        assignment_key: &str,
    ) -> Self {
        let mut entries = HashMap::new();
        if let Some(items) = aux.and_then(|a| a.get(list_key)).and_then(Value::as_array) {
            for item in items {
                let learner = item.get(learner_key).and_then(stringify_id);
                let assignment = item.get(assignment_key).and_then(stringify_id);
                match (learner, assignment) {
                    (Some(l), Some(a)) => {
                        entries.insert((l, a), item);
                    }
                    _ => {
                        debug!(
                            list_key,
                            "skipping auxiliary entry without a learner/assignment key pair"
                        );
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn get(&self, learner: &str, assignment: &str) -> Option<&'a Value> {
        self.entries
            .get(&(learner.to_string(), assignment.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
