use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use lmx_core::common::error::{NormalizeError, Result};
use lmx_core::domain::{
    Assignment, Course, Grade, Lms, Metadata, NormalizedPayload, Person, Submission,
};

use crate::diagnostics::build_diagnostics;
use crate::normalize::{number_of, source_meta, string_of, stringify_id, AuxIndex};
use crate::observability::metrics;
use crate::timestamp::normalize_opt;

/// Normalize a Google Classroom course export.
///
/// Classroom nests identity under `profile` objects and routinely withholds
/// learner email addresses, which is what the diagnostics counter exists to
/// surface. Turned-in instants live in the submission history rather than on
/// the submission row, so the optional `aux` fragment
/// (`{"submissionHistory": [{userId, courseWorkId, turnedInAt}]}`) is the
/// only source of `submitted_at`.
pub fn normalize_google_classroom(raw: &Value, aux: Option<&Value>) -> Result<NormalizedPayload> {
    let course_obj = raw.get("course").unwrap_or(raw);
    let course_id = course_obj.get("id").and_then(stringify_id).ok_or_else(|| {
        metrics::normalize::missing_course_id(Lms::GoogleClassroom.as_str());
        NormalizeError::MissingField("course.id".to_string())
    })?;

    let mut course_metadata = Metadata::new();
    for key in ["section", "courseState", "enrollmentCode", "ownerId"] {
        if let Some(v) = course_obj.get(key).and_then(string_of) {
            course_metadata.insert(key.to_string(), Value::String(v));
        }
    }
    if let Some(created) = normalize_opt(course_obj.get("creationTime")) {
        course_metadata.insert("creationTime".to_string(), Value::String(created));
    }
    let course = Course {
        id: course_id.clone(),
        name: course_obj.get("name").and_then(string_of),
        // Classroom has no term window on the course resource.
        start_date: None,
        end_date: None,
        metadata: course_metadata,
    };

    let templates = assignment_templates(raw);

    let mut primary: HashMap<(String, String), Vec<&Value>> = HashMap::new();
    for row in raw
        .get("studentSubmissions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let user = row.get("userId").and_then(stringify_id);
        let work = row.get("courseWorkId").and_then(stringify_id);
        if let (Some(u), Some(w)) = (user, work) {
            primary.entry((u, w)).or_default().push(row);
        }
    }

    let aux_index = AuxIndex::build(aux, "submissionHistory", "userId", "courseWorkId");
    if aux_index.len() > 0 {
        metrics::normalize::aux_entries_merged(Lms::GoogleClassroom.as_str(), aux_index.len() as u64);
    }

    let instructors: Vec<Person> = raw
        .get("teachers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(person_from_member)
        .collect();

    let mut learners: Vec<Person> = Vec::new();
    let mut rostered: BTreeSet<String> = BTreeSet::new();
    for student in raw
        .get("students")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let mut person = person_from_member(student);
        if let Some(id) = person.id.clone() {
            rostered.insert(id.clone());
            person.assignments = assignments_for(&id, &templates, &primary, &aux_index);
        }
        learners.push(person);
    }

    let extra_ids: BTreeSet<String> = primary
        .keys()
        .map(|(user, _)| user.clone())
        .filter(|user| !rostered.contains(user))
        .collect();
    for id in extra_ids {
        debug!(user_id = %id, "synthesizing learner referenced only by submissions");
        learners.push(Person {
            id: Some(id.clone()),
            assignments: assignments_for(&id, &templates, &primary, &aux_index),
            ..Person::default()
        });
    }

    let diagnostics = build_diagnostics(&learners, None);
    metrics::normalize::payload_normalized(Lms::GoogleClassroom.as_str());
    debug!(
        course_id = %course_id,
        learners = learners.len(),
        assignments = templates.len(),
        "normalized google classroom payload"
    );

    Ok(NormalizedPayload {
        source: source_meta(Lms::GoogleClassroom, Some(course_id)),
        institution: None,
        course,
        instructors: Some(instructors),
        instructor: None,
        learners: Some(learners),
        assessments: None,
        assignments: Some(templates),
        transcript: None,
        chat: None,
        diagnostics: Some(diagnostics),
    })
}

fn assignment_templates(raw: &Value) -> Vec<Assignment> {
    let mut templates = Vec::new();
    for work in raw
        .get("courseWork")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(id) = work.get("id").and_then(stringify_id) else {
            warn!("skipping classroom courseWork without an id");
            continue;
        };

        let mut metadata = Metadata::new();
        for key in ["state", "alternateLink"] {
            if let Some(v) = work.get(key).and_then(string_of) {
                metadata.insert(key.to_string(), Value::String(v));
            }
        }
        if let Some(due) = compose_due_date(work) {
            metadata.insert("due_at".to_string(), Value::String(due));
        }

        templates.push(Assignment {
            id,
            kind: work
                .get("workType")
                .and_then(string_of)
                .map(|t| t.to_lowercase()),
            title: work.get("title").and_then(string_of),
            max_score: work.get("maxPoints").and_then(number_of),
            question_count: None,
            total_questions: None,
            is_quiz_assignment: None,
            quiz_id: None,
            submissions: Vec::new(),
            metadata,
        });
    }
    templates
}

/// `dueDate`/`dueTime` arrive as structured calendar parts; recompose them
/// into one normalized instant.
fn compose_due_date(work: &Value) -> Option<String> {
    let date = work.get("dueDate")?;
    let year = date.get("year").and_then(Value::as_u64)?;
    let month = date.get("month").and_then(Value::as_u64)?;
    let day = date.get("day").and_then(Value::as_u64)?;
    let hours = work
        .get("dueTime")
        .and_then(|t| t.get("hours"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let minutes = work
        .get("dueTime")
        .and_then(|t| t.get("minutes"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let literal = format!("{year:04}-{month:02}-{day:02} {hours:02}:{minutes:02}:00");
    crate::timestamp::normalize_timestamp(&Value::String(literal))
}

fn assignments_for(
    learner_id: &str,
    templates: &[Assignment],
    primary: &HashMap<(String, String), Vec<&Value>>,
    aux_index: &AuxIndex<'_>,
) -> Vec<Assignment> {
    templates
        .iter()
        .map(|template| {
            let mut assignment = template.clone();
            let key = (learner_id.to_string(), assignment.id.clone());
            if let Some(rows) = primary.get(&key) {
                assignment.submissions = rows
                    .iter()
                    .map(|row| submission_from_row(row, assignment.max_score))
                    .collect();
            }
            if let Some(entry) = aux_index.get(learner_id, &assignment.id) {
                if let Some(ts) = normalize_opt(entry.get("turnedInAt")) {
                    if let Some(first) = assignment.submissions.first_mut() {
                        first.submitted_at = Some(ts);
                    } else {
                        assignment.submissions.push(Submission {
                            submitted_at: Some(ts),
                            workflow_state: None,
                            grades: Vec::new(),
                            metadata: Metadata::new(),
                        });
                    }
                }
            }
            assignment
        })
        .collect()
}

fn submission_from_row(row: &Value, max_points: Option<f64>) -> Submission {
    let mut metadata = Metadata::new();
    if let Some(late) = row.get("late").and_then(Value::as_bool) {
        metadata.insert("late".to_string(), Value::Bool(late));
    }
    if let Some(updated) = normalize_opt(row.get("updateTime")) {
        metadata.insert("updateTime".to_string(), Value::String(updated));
    }
    if let Some(draft) = row.get("draftGrade").and_then(number_of) {
        metadata.insert("draftGrade".to_string(), Value::from(draft));
    }
    Submission {
        // The turned-in instant only exists in the submission history; the
        // aux merge supplies it when the caller fetched that feed.
        submitted_at: None,
        workflow_state: row.get("state").and_then(string_of),
        grades: vec![Grade {
            score: row.get("assignedGrade").and_then(number_of),
            totalscore: max_points,
            percentage: None,
            metadata: Metadata::new(),
        }],
        metadata,
    }
}

fn person_from_member(member: &Value) -> Person {
    let profile_obj = member.get("profile");
    let mut profile = Metadata::new();
    if let Some(photo) = profile_obj
        .and_then(|p| p.get("photoUrl"))
        .and_then(string_of)
    {
        profile.insert("photoUrl".to_string(), Value::String(photo));
    }
    Person {
        id: member
            .get("userId")
            .and_then(stringify_id)
            .or_else(|| profile_obj.and_then(|p| p.get("id")).and_then(stringify_id)),
        email: profile_obj
            .and_then(|p| p.get("emailAddress"))
            .and_then(string_of),
        username: None,
        name: profile_obj
            .and_then(|p| p.get("name"))
            .and_then(|n| n.get("fullName"))
            .and_then(string_of),
        time_enrolled: None,
        profile,
        assignments: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "course": {
                "id": "647382910",
                "name": "Algebra II",
                "section": "Period 3",
                "courseState": "ACTIVE",
                "creationTime": "2025-01-10T08:00:00.000Z",
                "ownerId": "t9"
            },
            "teachers": [
                {"userId": "t9", "profile": {"id": "t9", "name": {"fullName": "Ana Reyes"},
                 "emailAddress": "areyes@example.edu"}}
            ],
            "students": [
                {"userId": "s1", "profile": {"id": "s1", "name": {"fullName": "Ben Ito"},
                 "emailAddress": "bito@example.edu"}},
                {"userId": "s2", "profile": {"id": "s2", "name": {"fullName": "Cho Lin"}}}
            ],
            "courseWork": [
                {"id": "cw1", "title": "Worksheet 4", "maxPoints": 100.0, "workType": "ASSIGNMENT",
                 "state": "PUBLISHED",
                 "dueDate": {"year": 2025, "month": 9, "day": 15},
                 "dueTime": {"hours": 23, "minutes": 59}}
            ],
            "studentSubmissions": [
                {"id": "sub1", "userId": "s1", "courseWorkId": "cw1", "state": "RETURNED",
                 "late": false, "assignedGrade": 88.0, "updateTime": "2025-09-16T04:10:00.000Z"},
                {"id": "sub2", "userId": "s2", "courseWorkId": "cw1", "state": "TURNED_IN"}
            ]
        })
    }

    #[test]
    fn course_id_comes_from_the_stable_identifier() {
        let payload = normalize_google_classroom(&fixture(), None).unwrap();
        assert_eq!(payload.course.id, "647382910");
        // Display name stays a name, never the join key.
        assert_eq!(payload.course.name.as_deref(), Some("Algebra II"));
    }

    #[test]
    fn withheld_emails_surface_in_diagnostics() {
        let payload = normalize_google_classroom(&fixture(), None).unwrap();
        let diag = payload.diagnostics.unwrap();
        assert_eq!(diag.missing_email_count, 1);
        assert_eq!(diag.notes.len(), 1);
    }

    #[test]
    fn profile_fields_map_onto_person() {
        let payload = normalize_google_classroom(&fixture(), None).unwrap();
        let learners = payload.learners.unwrap();
        let ben = learners.iter().find(|p| p.id.as_deref() == Some("s1")).unwrap();
        assert_eq!(ben.name.as_deref(), Some("Ben Ito"));
        assert_eq!(ben.email.as_deref(), Some("bito@example.edu"));
    }

    #[test]
    fn ungraded_submission_keeps_null_score() {
        let payload = normalize_google_classroom(&fixture(), None).unwrap();
        let learners = payload.learners.unwrap();
        let cho = learners.iter().find(|p| p.id.as_deref() == Some("s2")).unwrap();
        let work = &cho.assignments[0];
        assert_eq!(work.submissions[0].workflow_state.as_deref(), Some("TURNED_IN"));
        assert_eq!(work.submissions[0].grades[0].score, None);
    }

    #[test]
    fn submission_history_aux_supplies_submitted_at() {
        let aux = json!({"submissionHistory": [
            {"userId": "s1", "courseWorkId": "cw1", "turnedInAt": "2025-09-15T22:41:00.000Z"}
        ]});
        let payload = normalize_google_classroom(&fixture(), Some(&aux)).unwrap();
        let learners = payload.learners.unwrap();
        let ben = learners.iter().find(|p| p.id.as_deref() == Some("s1")).unwrap();
        assert_eq!(
            ben.assignments[0].submissions[0].submitted_at.as_deref(),
            Some("2025-09-15T22:41:00Z")
        );
        // Primary row data is still intact after the merge.
        assert_eq!(ben.assignments[0].submissions[0].grades[0].score, Some(88.0));
    }

    #[test]
    fn due_date_parts_compose_into_metadata() {
        let payload = normalize_google_classroom(&fixture(), None).unwrap();
        let assignments = payload.assignments.unwrap();
        assert_eq!(
            assignments[0].metadata.get("due_at"),
            Some(&Value::String("2025-09-15T23:59:00Z".to_string()))
        );
    }

    #[test]
    fn missing_course_id_fails() {
        let err =
            normalize_google_classroom(&json!({"course": {"name": "No Id"}}), None).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField(_)));
    }
}
