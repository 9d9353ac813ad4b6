use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::error::Result;

/// Open key/value extension bag. Adapters park source-specific fields here
/// instead of widening the canonical schema.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lms {
    Canvas,
    Moodle,
    GoogleClassroom,
    Blackboard,
}

impl Lms {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lms::Canvas => "canvas",
            Lms::Moodle => "moodle",
            Lms::GoogleClassroom => "google_classroom",
            Lms::Blackboard => "blackboard",
        }
    }
}

impl std::fmt::Display for Lms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a payload came from. `fetched_at` is stamped with the normalization
/// wall-clock time, never copied out of the raw export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub lms: Lms,
    #[serde(rename = "rawCourseId", skip_serializing_if = "Option::is_none")]
    pub raw_course_id: Option<String>,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Institution {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// Canonical course. `id` is the join key consumers use across sources and is
/// always derived from the source's stable identifier, never a display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "startDate", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// Instructors and learners share one shape; learners additionally carry the
/// per-person `assignments` tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Person {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_enrolled: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub profile: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "maxScore", skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_quiz_assignment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiz_id: Option<String>,
    pub submissions: Vec<Submission>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_state: Option<String>,
    pub grades: Vec<Grade>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// Percentage values arrive as numbers from some sources and formatted
/// strings from others; both survive serialization unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Percentage {
    Number(f64),
    Text(String),
}

impl From<f64> for Percentage {
    fn from(value: f64) -> Self {
        Percentage::Number(value)
    }
}

/// A `score` of `None` serializes as JSON `null`: "no score recorded", which
/// is distinct from a recorded zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grade {
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totalscore: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<Percentage>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// Quiz-style content kept separate from the gradebook assignment tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "maxScore", skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<AssessmentItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<AssessmentResult>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChannel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

/// Data-quality signals derived from the final learner list. Future
/// diagnostics are additive fields on this struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    #[serde(rename = "missingEmailCount")]
    pub missing_email_count: u64,
    pub notes: Vec<String>,
}

/// The root canonical artifact every adapter produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub source: SourceMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution: Option<Institution>,
    pub course: Course,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructors: Option<Vec<Person>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructor: Option<Person>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learners: Option<Vec<Person>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessments: Option<Vec<Assessment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignments: Option<Vec<Assignment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Vec<TranscriptRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<Vec<ChatChannel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
}

impl NormalizedPayload {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_score_survives_serialization() {
        let grade = Grade {
            score: None,
            totalscore: Some(20.0),
            percentage: None,
            metadata: Metadata::new(),
        };
        let value = serde_json::to_value(&grade).unwrap();
        assert_eq!(value, json!({"score": null, "totalscore": 20.0}));
    }

    #[test]
    fn absent_optional_keys_are_omitted() {
        let course = Course {
            id: "42".to_string(),
            name: None,
            start_date: None,
            end_date: None,
            metadata: Metadata::new(),
        };
        let value = serde_json::to_value(&course).unwrap();
        assert_eq!(value, json!({"id": "42"}));
    }

    #[test]
    fn lms_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_value(Lms::GoogleClassroom).unwrap(),
            json!("google_classroom")
        );
        assert_eq!(Lms::Canvas.as_str(), "canvas");
    }

    #[test]
    fn percentage_is_untagged() {
        assert_eq!(
            serde_json::to_value(Percentage::Number(50.0)).unwrap(),
            json!(50.0)
        );
        assert_eq!(
            serde_json::to_value(Percentage::Text("A-".to_string())).unwrap(),
            json!("A-")
        );
    }
}
