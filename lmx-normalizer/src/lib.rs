//! Normalization layer reconciling four LMS export formats into one
//! canonical payload.
//!
//! Each source system gets a pure adapter function; every adapter output is
//! expected to pass [`validate`] before being forwarded downstream. All
//! operations are synchronous, share no state, and construct every entity
//! fresh per call, so concurrent invocations need no coordination.

pub mod diagnostics;
pub mod normalize;
pub mod observability;
pub mod timestamp;
pub mod validate;

// The canonical types and error surface, re-exported so callers only depend
// on this crate.
pub use lmx_core::common::error::{NormalizeError, Result};
pub use lmx_core::domain::{
    Assessment, AssessmentItem, AssessmentResult, Assignment, ChatChannel, ChatMessage, Course,
    Diagnostics, Grade, Institution, Lms, Metadata, NormalizedPayload, Percentage, Person,
    SourceMeta, Submission, TranscriptRecord,
};

pub use diagnostics::build_diagnostics;
pub use normalize::{
    normalize_blackboard, normalize_canvas, normalize_google_classroom, normalize_moodle,
};
pub use timestamp::{normalize_opt, normalize_timestamp};
pub use validate::{validate, validate_value, ValidationReport};
