use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use lmx_core::common::error::{NormalizeError, Result};
use lmx_core::domain::{
    Assignment, Course, Grade, Lms, Metadata, NormalizedPayload, Percentage, Person, Submission,
    TranscriptRecord,
};

use crate::diagnostics::build_diagnostics;
use crate::normalize::{
    number_of, percent_from_fraction, source_meta, string_of, stringify_id, AuxIndex,
};
use crate::observability::metrics;
use crate::timestamp::normalize_opt;

/// Normalize a Blackboard Learn course export.
///
/// Blackboard reports grade percentages as fractions on 0–1; they are scaled
/// here to the canonical 0–100 convention so downstream consumers see one
/// convention regardless of source. Timestamps arrive as epoch milliseconds.
/// The roster is a membership list with the user resource embedded, the
/// instructor is a single person, and a course transcript may ride along.
/// The optional `aux` fragment is an attempt feed
/// (`{"attempts": [{userId, columnId, attemptDate}]}`).
pub fn normalize_blackboard(raw: &Value, aux: Option<&Value>) -> Result<NormalizedPayload> {
    let course_obj = raw.get("course").unwrap_or(raw);
    let course_id = course_obj.get("id").and_then(stringify_id).ok_or_else(|| {
        metrics::normalize::missing_course_id(Lms::Blackboard.as_str());
        NormalizeError::MissingField("course.id".to_string())
    })?;

    let mut course_metadata = Metadata::new();
    if let Some(term) = course_obj.get("termId").and_then(string_of) {
        course_metadata.insert("termId".to_string(), Value::String(term));
    }
    if let Some(created) = normalize_opt(course_obj.get("created")) {
        course_metadata.insert("created".to_string(), Value::String(created));
    }
    let course = Course {
        id: course_id.clone(),
        name: course_obj.get("name").and_then(string_of),
        start_date: normalize_opt(course_obj.get("startDate")),
        end_date: normalize_opt(course_obj.get("endDate")),
        metadata: course_metadata,
    };

    let templates = assignment_templates(raw);
    let possible_by_column: HashMap<String, f64> = templates
        .iter()
        .filter_map(|t| t.max_score.map(|p| (t.id.clone(), p)))
        .collect();

    let mut primary: HashMap<(String, String), Vec<&Value>> = HashMap::new();
    for row in raw
        .get("grades")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let user = row.get("userId").and_then(stringify_id);
        let column = row.get("columnId").and_then(stringify_id);
        if let (Some(u), Some(c)) = (user, column) {
            primary.entry((u, c)).or_default().push(row);
        }
    }

    let aux_index = AuxIndex::build(aux, "attempts", "userId", "columnId");
    if aux_index.len() > 0 {
        metrics::normalize::aux_entries_merged(Lms::Blackboard.as_str(), aux_index.len() as u64);
    }

    let instructor = raw.get("instructor").map(person_from_user);

    let mut learners: Vec<Person> = Vec::new();
    let mut rostered: BTreeSet<String> = BTreeSet::new();
    for membership in raw
        .get("memberships")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        if membership.get("courseRoleId").and_then(Value::as_str) != Some("Student") {
            debug!("skipping non-student blackboard membership");
            continue;
        }
        let mut person = membership
            .get("user")
            .map(person_from_user)
            .unwrap_or_default();
        if person.id.is_none() {
            person.id = membership.get("userId").and_then(stringify_id);
        }
        person.time_enrolled = normalize_opt(membership.get("created"));
        if let Some(id) = person.id.clone() {
            rostered.insert(id.clone());
            person.assignments =
                assignments_for(&id, &templates, &primary, &aux_index, &possible_by_column);
        }
        learners.push(person);
    }

    let extra_ids: BTreeSet<String> = primary
        .keys()
        .map(|(user, _)| user.clone())
        .filter(|user| !rostered.contains(user))
        .collect();
    for id in extra_ids {
        debug!(user_id = %id, "synthesizing learner referenced only by grade rows");
        learners.push(Person {
            id: Some(id.clone()),
            assignments: assignments_for(&id, &templates, &primary, &aux_index, &possible_by_column),
            ..Person::default()
        });
    }

    let transcript: Vec<TranscriptRecord> = raw
        .get("transcript")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(transcript_record)
        .collect();

    let diagnostics = build_diagnostics(&learners, None);
    metrics::normalize::payload_normalized(Lms::Blackboard.as_str());
    debug!(
        course_id = %course_id,
        learners = learners.len(),
        assignments = templates.len(),
        "normalized blackboard payload"
    );

    Ok(NormalizedPayload {
        source: source_meta(
            Lms::Blackboard,
            course_obj
                .get("courseId")
                .and_then(string_of)
                .or(Some(course_id)),
        ),
        institution: None,
        course,
        instructors: None,
        instructor,
        learners: Some(learners),
        assessments: None,
        assignments: Some(templates),
        transcript: if transcript.is_empty() {
            None
        } else {
            Some(transcript)
        },
        chat: None,
        diagnostics: Some(diagnostics),
    })
}

fn assignment_templates(raw: &Value) -> Vec<Assignment> {
    let mut templates = Vec::new();
    for column in raw
        .get("columns")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(id) = column.get("id").and_then(stringify_id) else {
            warn!("skipping blackboard grade column without an id");
            continue;
        };
        let mut metadata = Metadata::new();
        if let Some(grading) = column
            .get("grading")
            .and_then(|g| g.get("type"))
            .and_then(string_of)
        {
            metadata.insert("gradingType".to_string(), Value::String(grading));
        }
        if let Some(due) = normalize_opt(column.get("grading").and_then(|g| g.get("due"))) {
            metadata.insert("due_at".to_string(), Value::String(due));
        }
        templates.push(Assignment {
            id,
            kind: Some("column".to_string()),
            title: column.get("name").and_then(string_of),
            max_score: column
                .get("score")
                .and_then(|s| s.get("possible"))
                .and_then(number_of),
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

fn assignments_for(
    learner_id: &str,
    templates: &[Assignment],
    primary: &HashMap<(String, String), Vec<&Value>>,
    aux_index: &AuxIndex<'_>,
    possible_by_column: &HashMap<String, f64>,
) -> Vec<Assignment> {
    templates
        .iter()
        .map(|template| {
            let mut assignment = template.clone();
            let key = (learner_id.to_string(), assignment.id.clone());
            if let Some(rows) = primary.get(&key) {
                assignment.submissions = rows
                    .iter()
                    .map(|row| submission_from_row(row, possible_by_column.get(&assignment.id)))
                    .collect();
            }
            if let Some(entry) = aux_index.get(learner_id, &assignment.id) {
                if let Some(ts) = normalize_opt(entry.get("attemptDate")) {
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

fn submission_from_row(row: &Value, possible: Option<&f64>) -> Submission {
    // Source convention is a 0–1 fraction; canonical is 0–100.
    let percentage = row
        .get("percentage")
        .and_then(number_of)
        .map(|f| Percentage::Number(percent_from_fraction(f)));
    let mut metadata = Metadata::new();
    if let Some(display) = row.get("displayGrade").and_then(string_of) {
        metadata.insert("displayGrade".to_string(), Value::String(display));
    }
    Submission {
        submitted_at: normalize_opt(row.get("attemptDate")),
        workflow_state: row.get("status").and_then(string_of),
        grades: vec![Grade {
            score: row.get("score").and_then(number_of),
            totalscore: possible.copied(),
            percentage,
            metadata: Metadata::new(),
        }],
        metadata,
    }
}

fn person_from_user(user: &Value) -> Person {
    let given = user
        .get("name")
        .and_then(|n| n.get("given"))
        .and_then(string_of);
    let family = user
        .get("name")
        .and_then(|n| n.get("family"))
        .and_then(string_of);
    let name = match (given, family) {
        (Some(g), Some(f)) => Some(format!("{g} {f}")),
        (g, f) => g.or(f),
    };
    Person {
        id: user.get("id").and_then(stringify_id),
        email: user
            .get("contact")
            .and_then(|c| c.get("email"))
            .and_then(string_of),
        username: user.get("userName").and_then(string_of),
        name,
        time_enrolled: None,
        profile: Metadata::new(),
        assignments: Vec::new(),
    }
}

fn transcript_record(entry: &Value) -> TranscriptRecord {
    TranscriptRecord {
        learner_id: entry.get("userId").and_then(stringify_id),
        course_id: entry.get("courseId").and_then(stringify_id),
        grade: entry.get("grade").and_then(string_of),
        score: entry.get("score").and_then(number_of),
        completed_at: normalize_opt(entry.get("completed")),
        metadata: Metadata::new(),
    }
}
