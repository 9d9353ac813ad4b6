use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use lmx_core::common::error::{NormalizeError, Result};
use lmx_core::domain::{
    Assessment, Assignment, Course, Grade, Institution, Lms, Metadata, NormalizedPayload, Person,
    Submission,
};

use crate::diagnostics::build_diagnostics;
use crate::normalize::{number_of, source_meta, string_of, stringify_id, AuxIndex};
use crate::observability::metrics;
use crate::timestamp::normalize_opt;

/// Normalize a Canvas course export.
///
/// Canvas models quizzes as gradebook assignments distinguished only by
/// `is_quiz_assignment` and `quiz_id`, so both flags are carried onto the
/// canonical assignment and the quiz catalog additionally lands in
/// `assessments`. The optional `aux` fragment is the per-course submissions
/// feed (`{"submissions": [{user_id, assignment_id, submitted_at, ...}]}`)
/// used to backfill `submitted_at`.
pub fn normalize_canvas(raw: &Value, aux: Option<&Value>) -> Result<NormalizedPayload> {
    let course_obj = raw.get("course").unwrap_or(raw);
    let course_id = course_obj.get("id").and_then(stringify_id).ok_or_else(|| {
        metrics::normalize::missing_course_id(Lms::Canvas.as_str());
        NormalizeError::MissingField("course.id".to_string())
    })?;

    let mut course_metadata = Metadata::new();
    for key in ["course_code", "sis_course_id", "workflow_state"] {
        if let Some(v) = course_obj.get(key).and_then(string_of) {
            course_metadata.insert(key.to_string(), Value::String(v));
        }
    }
    let course = Course {
        id: course_id.clone(),
        name: course_obj.get("name").and_then(string_of),
        start_date: normalize_opt(course_obj.get("start_at")),
        end_date: normalize_opt(course_obj.get("end_at")),
        metadata: course_metadata,
    };

    // Quiz catalog, keyed by stringified quiz id so assignment rows can pick
    // up their question counts.
    let quizzes = raw
        .get("quizzes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut question_counts: HashMap<String, u64> = HashMap::new();
    for quiz in quizzes {
        if let (Some(id), Some(count)) = (
            quiz.get("id").and_then(stringify_id),
            quiz.get("question_count").and_then(Value::as_u64),
        ) {
            question_counts.insert(id, count);
        }
    }

    let templates = assignment_templates(raw, &question_counts);

    // Primary submission rows grouped by (user, assignment).
    let mut primary: HashMap<(String, String), Vec<&Value>> = HashMap::new();
    for row in raw
        .get("submissions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let user = row.get("user_id").and_then(stringify_id);
        let assignment = row.get("assignment_id").and_then(stringify_id);
        if let (Some(u), Some(a)) = (user, assignment) {
            primary.entry((u, a)).or_default().push(row);
        }
    }

    let aux_index = AuxIndex::build(aux, "submissions", "user_id", "assignment_id");
    if aux_index.len() > 0 {
        metrics::normalize::aux_entries_merged(Lms::Canvas.as_str(), aux_index.len() as u64);
    }

    let instructors: Vec<Person> = raw
        .get("teachers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(person_from_user)
        .collect();

    let mut learners: Vec<Person> = Vec::new();
    let mut rostered: BTreeSet<String> = BTreeSet::new();
    for student in raw
        .get("students")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let mut person = person_from_user(student);
        if let Some(id) = person.id.clone() {
            rostered.insert(id.clone());
            person.assignments = assignments_for(&id, &templates, &primary, &aux_index);
        }
        learners.push(person);
    }

    // Submission rows can reference users the roster export never delivered;
    // they still get a learner entry with the fields we know.
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

    let assessments: Vec<Assessment> = quizzes.iter().map(assessment_from_quiz).collect();

    let institution = course_obj
        .get("account_id")
        .and_then(stringify_id)
        .map(|id| Institution {
            id: Some(id),
            name: raw
                .get("account")
                .and_then(|a| a.get("name"))
                .and_then(string_of),
            metadata: Metadata::new(),
        });

    let diagnostics = build_diagnostics(&learners, None);
    metrics::normalize::payload_normalized(Lms::Canvas.as_str());
    debug!(
        course_id = %course_id,
        learners = learners.len(),
        assignments = templates.len(),
        "normalized canvas payload"
    );

    Ok(NormalizedPayload {
        source: source_meta(Lms::Canvas, Some(course_id)),
        institution,
        course,
        instructors: Some(instructors),
        instructor: None,
        learners: Some(learners),
        assessments: Some(assessments),
        assignments: Some(templates),
        transcript: None,
        chat: None,
        diagnostics: Some(diagnostics),
    })
}

fn assignment_templates(raw: &Value, question_counts: &HashMap<String, u64>) -> Vec<Assignment> {
    let mut templates = Vec::new();
    for entry in raw
        .get("assignments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(id) = entry.get("id").and_then(stringify_id) else {
            warn!("skipping canvas assignment without an id");
            continue;
        };
        let quiz_id = entry.get("quiz_id").and_then(stringify_id);
        let is_quiz = entry
            .get("is_quiz_assignment")
            .and_then(Value::as_bool)
            .or(Some(quiz_id.is_some()));

        let mut metadata = Metadata::new();
        if let Some(due) = normalize_opt(entry.get("due_at")) {
            metadata.insert("due_at".to_string(), Value::String(due));
        }
        if let Some(types) = entry.get("submission_types") {
            if !types.is_null() {
                metadata.insert("submission_types".to_string(), types.clone());
            }
        }

        templates.push(Assignment {
            id,
            kind: Some("assignment".to_string()),
            title: entry.get("name").and_then(string_of),
            max_score: entry.get("points_possible").and_then(number_of),
            question_count: quiz_id
                .as_deref()
                .and_then(|qid| question_counts.get(qid).copied()),
            total_questions: None,
            is_quiz_assignment: is_quiz,
            quiz_id,
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
            merge_aux_timestamp(&mut assignment.submissions, aux_index, learner_id, &assignment.id);
            assignment
        })
        .collect()
}

fn submission_from_row(row: &Value, points_possible: Option<f64>) -> Submission {
    let mut metadata = Metadata::new();
    if let Some(late) = row.get("late").and_then(Value::as_bool) {
        metadata.insert("late".to_string(), Value::Bool(late));
    }
    if let Some(attempt) = row.get("attempt").and_then(Value::as_u64) {
        metadata.insert("attempt".to_string(), Value::from(attempt));
    }
    Submission {
        submitted_at: normalize_opt(row.get("submitted_at")),
        workflow_state: row.get("workflow_state").and_then(string_of),
        // An ungraded row keeps score null; null is "no score recorded",
        // never a zero.
        grades: vec![Grade {
            score: row.get("score").and_then(number_of),
            totalscore: points_possible,
            percentage: None,
            metadata: Metadata::new(),
        }],
        metadata,
    }
}

fn merge_aux_timestamp(
    submissions: &mut Vec<Submission>,
    aux_index: &AuxIndex<'_>,
    learner_id: &str,
    assignment_id: &str,
) {
    let Some(entry) = aux_index.get(learner_id, assignment_id) else {
        return;
    };
    let Some(ts) = normalize_opt(entry.get("submitted_at")) else {
        return;
    };
    if let Some(first) = submissions.first_mut() {
        first.submitted_at = Some(ts);
    } else {
        submissions.push(Submission {
            submitted_at: Some(ts),
            workflow_state: entry.get("workflow_state").and_then(string_of),
            grades: Vec::new(),
            metadata: Metadata::new(),
        });
    }
}

fn person_from_user(user: &Value) -> Person {
    let mut profile = Metadata::new();
    for key in ["sortable_name", "avatar_url", "sis_user_id"] {
        if let Some(v) = user.get(key).and_then(string_of) {
            profile.insert(key.to_string(), Value::String(v));
        }
    }
    Person {
        id: user.get("id").and_then(stringify_id),
        email: user.get("email").and_then(string_of),
        username: user.get("login_id").and_then(string_of),
        name: user
            .get("display_name")
            .or_else(|| user.get("name"))
            .and_then(string_of),
        time_enrolled: normalize_opt(
            user.get("enrollments")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("enrolled_at")),
        ),
        profile,
        assignments: Vec::new(),
    }
}

fn assessment_from_quiz(quiz: &Value) -> Assessment {
    let mut metadata = Metadata::new();
    if let Some(count) = quiz.get("question_count").and_then(Value::as_u64) {
        metadata.insert("question_count".to_string(), Value::from(count));
    }
    Assessment {
        id: quiz.get("id").and_then(stringify_id),
        kind: Some(
            quiz.get("quiz_type")
                .and_then(string_of)
                .unwrap_or_else(|| "quiz".to_string()),
        ),
        title: quiz.get("title").and_then(string_of),
        max_score: quiz.get("points_possible").and_then(number_of),
        items: None,
        results: None,
        metadata,
    }
}
