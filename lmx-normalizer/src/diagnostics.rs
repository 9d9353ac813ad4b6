use lmx_core::domain::{Diagnostics, Person};

/// Default note attached when at least one learner has no usable email.
pub const MISSING_EMAIL_NOTE: &str =
    "Some learners are missing an email address; downstream matching may be incomplete";

/// Derive data-quality signals from the final learner list.
///
/// A learner counts as missing an email when the field is absent or blank.
/// `notes` carries exactly one entry (the caller's `note`, or the default)
/// iff the count is positive.
pub fn build_diagnostics(learners: &[Person], note: Option<&str>) -> Diagnostics {
    let missing_email_count = learners
        .iter()
        .filter(|p| p.email.as_deref().map_or(true, |e| e.trim().is_empty()))
        .count() as u64;

    let mut notes = Vec::new();
    if missing_email_count > 0 {
        notes.push(note.unwrap_or(MISSING_EMAIL_NOTE).to_string());
    }

    Diagnostics {
        missing_email_count,
        notes,
    }
}
