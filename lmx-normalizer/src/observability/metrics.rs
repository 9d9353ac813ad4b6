//! Metric recording helpers for the normalization core.
//!
//! Names follow Prometheus conventions; recording is a no-op until the
//! embedding process installs a recorder.

use std::fmt;

/// All metric names used by the crate, so call sites never carry magic
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    NormalizePayloads,
    NormalizeMissingCourseId,
    NormalizeAuxEntriesMerged,
    ValidatePayloadsValid,
    ValidatePayloadsInvalid,
    ValidateViolations,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NormalizePayloads => "lmx_normalize_payloads_total",
            MetricName::NormalizeMissingCourseId => "lmx_normalize_missing_course_id_total",
            MetricName::NormalizeAuxEntriesMerged => "lmx_normalize_aux_entries_merged_total",
            MetricName::ValidatePayloadsValid => "lmx_validate_payloads_valid_total",
            MetricName::ValidatePayloadsInvalid => "lmx_validate_payloads_invalid_total",
            MetricName::ValidateViolations => "lmx_validate_violations_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod normalize {
    use super::MetricName;

    pub fn payload_normalized(source: &str) {
        ::metrics::counter!(
            MetricName::NormalizePayloads.as_str(),
            "source" => source.to_string()
        )
        .increment(1);
    }

    pub fn missing_course_id(source: &str) {
        ::metrics::counter!(
            MetricName::NormalizeMissingCourseId.as_str(),
            "source" => source.to_string()
        )
        .increment(1);
    }

    pub fn aux_entries_merged(source: &str, count: u64) {
        ::metrics::counter!(
            MetricName::NormalizeAuxEntriesMerged.as_str(),
            "source" => source.to_string()
        )
        .increment(count);
    }
}

pub mod validate {
    use super::MetricName;

    pub fn payload_valid() {
        ::metrics::counter!(MetricName::ValidatePayloadsValid.as_str()).increment(1);
    }

    pub fn payload_invalid(violations: u64) {
        ::metrics::counter!(MetricName::ValidatePayloadsInvalid.as_str()).increment(1);
        ::metrics::counter!(MetricName::ValidateViolations.as_str()).increment(violations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        assert_eq!(
            MetricName::NormalizePayloads.as_str(),
            "lmx_normalize_payloads_total"
        );
        assert_eq!(
            MetricName::ValidateViolations.to_string(),
            "lmx_validate_violations_total"
        );
    }
}
