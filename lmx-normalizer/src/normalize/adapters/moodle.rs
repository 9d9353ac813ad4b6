use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use lmx_core::common::error::{NormalizeError, Result};
use lmx_core::domain::{
    Assessment, AssessmentItem, AssessmentResult, Assignment, ChatChannel, ChatMessage, Course,
    Grade, Institution, Lms, Metadata, NormalizedPayload, Person, Submission,
};

use crate::diagnostics::build_diagnostics;
use crate::normalize::{number_of, parse_percentage, source_meta, string_of, stringify_id, AuxIndex};
use crate::observability::metrics;
use crate::timestamp::normalize_opt;

/// Normalize a Moodle course export.
///
/// Moodle's quirks: every timestamp is epoch seconds, the course identifier
/// is a bare numeric id (stringified decimal here), and grade percentages
/// arrive pre-formatted ("90.00 %") already on the 0–100 convention. The
/// gradebook is per-user (`usergrades[].gradeitems[]`), so the course-level
/// assignment list is reconstructed from the union of grade items. The
/// optional `aux` fragment is a quiz-attempt feed
/// (`{"attempts": [{userid, itemid, timefinish}]}`).
pub fn normalize_moodle(raw: &Value, aux: Option<&Value>) -> Result<NormalizedPayload> {
    let course_obj = raw.get("course").unwrap_or(raw);
    let course_id = course_obj.get("id").and_then(stringify_id).ok_or_else(|| {
        metrics::normalize::missing_course_id(Lms::Moodle.as_str());
        NormalizeError::MissingField("course.id".to_string())
    })?;

    let mut course_metadata = Metadata::new();
    if let Some(shortname) = course_obj.get("shortname").and_then(string_of) {
        course_metadata.insert("shortname".to_string(), Value::String(shortname));
    }
    let course = Course {
        id: course_id.clone(),
        name: course_obj
            .get("fullname")
            .or_else(|| course_obj.get("displayname"))
            .and_then(string_of),
        start_date: normalize_opt(course_obj.get("startdate")),
        end_date: normalize_opt(course_obj.get("enddate")),
        metadata: course_metadata,
    };

    let users = raw
        .get("users")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut instructors: Vec<Person> = Vec::new();
    let mut learners: Vec<Person> = Vec::new();
    let mut rostered: BTreeSet<String> = BTreeSet::new();
    for user in users {
        let person = person_from_user(user);
        if is_teacher(user) {
            instructors.push(person);
        } else if is_student(user) {
            if let Some(id) = &person.id {
                rostered.insert(id.clone());
            }
            learners.push(person);
        } else {
            debug!(
                user_id = ?user.get("id"),
                "skipping moodle user with a non-course role"
            );
        }
    }

    let aux_index = AuxIndex::build(aux, "attempts", "userid", "itemid");
    if aux_index.len() > 0 {
        metrics::normalize::aux_entries_merged(Lms::Moodle.as_str(), aux_index.len() as u64);
    }

    // The gradebook is the assignment source of truth; collect each user's
    // items and the deduplicated course-level template list in one pass.
    let mut templates: BTreeMap<String, Assignment> = BTreeMap::new();
    let mut per_user: BTreeMap<String, Vec<Assignment>> = BTreeMap::new();
    for usergrade in raw
        .get("grades")
        .and_then(|g| g.get("usergrades"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let Some(userid) = usergrade.get("userid").and_then(stringify_id) else {
            warn!("skipping moodle usergrade without a userid");
            continue;
        };
        let items = usergrade
            .get("gradeitems")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut assignments = Vec::new();
        for item in items {
            // The course-total row is an aggregate, not an assignment.
            if item.get("itemtype").and_then(Value::as_str) == Some("course") {
                continue;
            }
            let Some(assignment) = assignment_from_item(item, &userid, &aux_index) else {
                continue;
            };
            templates
                .entry(assignment.id.clone())
                .or_insert_with(|| Assignment {
                    submissions: Vec::new(),
                    ..assignment.clone()
                });
            assignments.push(assignment);
        }
        per_user.insert(userid, assignments);
    }

    for learner in learners.iter_mut() {
        if let Some(id) = &learner.id {
            if let Some(assignments) = per_user.remove(id) {
                learner.assignments = assignments;
            }
        }
    }
    // Whatever is left in per_user references users the roster never listed.
    for (id, assignments) in per_user {
        if rostered.contains(&id) {
            continue;
        }
        debug!(user_id = %id, "synthesizing learner referenced only by the gradebook");
        learners.push(Person {
            id: Some(id),
            assignments,
            ..Person::default()
        });
    }

    let assessments: Vec<Assessment> = raw
        .get("quizzes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(assessment_from_quiz)
        .collect();

    let chat: Vec<ChatChannel> = raw
        .get("forums")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(channel_from_forum)
        .collect();

    let institution = raw.get("site_info").map(|site| {
        let mut metadata = Metadata::new();
        if let Some(url) = site.get("siteurl").and_then(string_of) {
            metadata.insert("siteurl".to_string(), Value::String(url));
        }
        Institution {
            id: None,
            name: site.get("sitename").and_then(string_of),
            metadata,
        }
    });

    let diagnostics = build_diagnostics(&learners, None);
    metrics::normalize::payload_normalized(Lms::Moodle.as_str());
    debug!(
        course_id = %course_id,
        learners = learners.len(),
        assignments = templates.len(),
        "normalized moodle payload"
    );

    Ok(NormalizedPayload {
        source: source_meta(Lms::Moodle, Some(course_id)),
        institution,
        course,
        instructors: Some(instructors),
        instructor: None,
        learners: Some(learners),
        assessments: Some(assessments),
        assignments: Some(templates.into_values().collect()),
        transcript: None,
        chat: if chat.is_empty() { None } else { Some(chat) },
        diagnostics: Some(diagnostics),
    })
}

fn is_teacher(user: &Value) -> bool {
    roles(user).any(|r| r.contains("teacher"))
}

fn is_student(user: &Value) -> bool {
    let mut it = roles(user).peekable();
    // No role information at all: keep the person on the learner roster
    // rather than dropping them.
    if it.peek().is_none() {
        return true;
    }
    it.any(|r| r == "student")
}

fn roles(user: &Value) -> impl Iterator<Item = String> + '_ {
    user.get("roles")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|role| role.get("shortname").and_then(string_of))
}

fn person_from_user(user: &Value) -> Person {
    let mut profile = Metadata::new();
    for key in ["department", "lastaccess"] {
        if let Some(v) = user.get(key) {
            if !v.is_null() {
                profile.insert(key.to_string(), v.clone());
            }
        }
    }
    Person {
        id: user.get("id").and_then(stringify_id),
        email: user.get("email").and_then(string_of),
        username: user.get("username").and_then(string_of),
        name: user.get("fullname").and_then(string_of),
        time_enrolled: normalize_opt(user.get("firstaccess")),
        profile,
        assignments: Vec::new(),
    }
}

fn assignment_from_item(item: &Value, userid: &str, aux_index: &AuxIndex<'_>) -> Option<Assignment> {
    let id = item.get("id").and_then(stringify_id)?;
    let module = item.get("itemmodule").and_then(string_of);
    let is_quiz = module.as_deref() == Some("quiz");
    let quiz_id = if is_quiz {
        item.get("iteminstance").and_then(stringify_id)
    } else {
        None
    };

    let score = item.get("graderaw").and_then(number_of);
    let grademax = item.get("grademax").and_then(number_of);
    let mut submitted_at = normalize_opt(item.get("gradedatesubmitted"));
    if let Some(entry) = aux_index.get(userid, &id) {
        if let Some(ts) = normalize_opt(entry.get("timefinish")) {
            submitted_at = Some(ts);
        }
    }

    // A grade item only turns into a submission when the learner actually
    // interacted with it; an untouched item keeps an empty submissions list.
    let has_activity = score.is_some()
        || submitted_at.is_some()
        || item.get("gradedategraded").map_or(false, |v| !v.is_null());
    let submissions = if has_activity {
        vec![Submission {
            submitted_at,
            workflow_state: item.get("status").and_then(string_of),
            grades: vec![Grade {
                score,
                totalscore: grademax,
                percentage: item.get("percentageformatted").and_then(parse_percentage),
                metadata: Metadata::new(),
            }],
            metadata: Metadata::new(),
        }]
    } else {
        Vec::new()
    };

    Some(Assignment {
        id,
        kind: module.clone(),
        title: item.get("itemname").and_then(string_of),
        max_score: grademax,
        question_count: None,
        total_questions: None,
        is_quiz_assignment: Some(is_quiz),
        quiz_id,
        submissions,
        metadata: Metadata::new(),
    })
}

fn assessment_from_quiz(quiz: &Value) -> Assessment {
    let items: Vec<AssessmentItem> = quiz
        .get("questions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|q| AssessmentItem {
            id: q.get("id").and_then(stringify_id),
            title: q.get("name").and_then(string_of),
            kind: q.get("qtype").and_then(string_of),
            points: q.get("defaultmark").and_then(number_of),
            metadata: Metadata::new(),
        })
        .collect();
    let results: Vec<AssessmentResult> = quiz
        .get("attempts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|a| AssessmentResult {
            person_id: a.get("userid").and_then(stringify_id),
            score: a.get("sumgrades").and_then(number_of),
            submitted_at: normalize_opt(a.get("timefinish")),
            metadata: Metadata::new(),
        })
        .collect();

    Assessment {
        id: quiz.get("id").and_then(stringify_id),
        kind: Some("quiz".to_string()),
        title: quiz.get("name").and_then(string_of),
        max_score: quiz.get("sumgrades").and_then(number_of),
        items: if items.is_empty() { None } else { Some(items) },
        results: if results.is_empty() { None } else { Some(results) },
        metadata: Metadata::new(),
    }
}

fn channel_from_forum(forum: &Value) -> ChatChannel {
    let messages: Vec<ChatMessage> = forum
        .get("discussions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|d| ChatMessage {
            id: d.get("id").and_then(stringify_id),
            author_id: d.get("userid").and_then(stringify_id),
            body: d
                .get("message")
                .or_else(|| d.get("subject"))
                .and_then(string_of),
            sent_at: normalize_opt(d.get("created")),
            metadata: Metadata::new(),
        })
        .collect();
    ChatChannel {
        id: forum.get("id").and_then(stringify_id),
        name: forum.get("name").and_then(string_of),
        messages,
        metadata: Metadata::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmx_core::domain::Percentage;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "site_info": {"sitename": "Acme University", "siteurl": "https://moodle.example.edu"},
            "course": {
                "id": 501,
                "fullname": "World History",
                "shortname": "HIST-200",
                "startdate": 1_693_526_400,
                "enddate": 1_701_388_800
            },
            "users": [
                {"id": 2, "fullname": "Sam Chalk", "email": "chalk@example.edu", "username": "schalk",
                 "roles": [{"shortname": "editingteacher"}]},
                {"id": 9, "fullname": "Lee Park", "email": "lpark@example.edu", "username": "lpark",
                 "roles": [{"shortname": "student"}], "firstaccess": 1_693_530_000},
                {"id": 10, "fullname": "Kim Voss", "username": "kvoss",
                 "roles": [{"shortname": "student"}]}
            ],
            "grades": {"usergrades": [
                {"userid": 9, "gradeitems": [
                    {"id": 77, "itemname": "Essay", "itemmodule": "assign", "iteminstance": 12,
                     "graderaw": 18.0, "grademax": 20.0, "percentageformatted": "90.00 %",
                     "gradedatesubmitted": 1_695_000_000},
                    {"id": 78, "itemname": "Unit Quiz", "itemmodule": "quiz", "iteminstance": 31,
                     "graderaw": null, "grademax": 10.0, "percentageformatted": "-"},
                    {"id": 99, "itemtype": "course", "graderaw": 18.0, "grademax": 30.0}
                ]},
                {"userid": 77, "gradeitems": [
                    {"id": 77, "itemname": "Essay", "itemmodule": "assign", "iteminstance": 12,
                     "graderaw": 11.0, "grademax": 20.0}
                ]}
            ]},
            "quizzes": [
                {"id": 31, "name": "Unit Quiz", "sumgrades": 10.0,
                 "questions": [{"id": 410, "name": "Q1", "qtype": "multichoice", "defaultmark": 5.0}],
                 "attempts": [{"userid": 9, "sumgrades": 8.0, "timefinish": 1_695_003_600}]}
            ],
            "forums": [
                {"id": 3, "name": "Announcements", "discussions": [
                    {"id": 70, "userid": 2, "message": "Welcome to class", "created": 1_693_530_000}
                ]}
            ]
        })
    }

    #[test]
    fn numeric_course_id_is_stringified() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        assert_eq!(payload.course.id, "501");
        assert_eq!(payload.source.raw_course_id.as_deref(), Some("501"));
    }

    #[test]
    fn epoch_seconds_become_iso_strings() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        assert_eq!(payload.course.start_date.as_deref(), Some("2023-09-01T00:00:00Z"));
        let learners = payload.learners.as_ref().unwrap();
        let lee = learners.iter().find(|p| p.id.as_deref() == Some("9")).unwrap();
        assert_eq!(lee.time_enrolled.as_deref(), Some("2023-09-01T01:00:00Z"));
    }

    #[test]
    fn percentage_strings_parse_to_numbers() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        let learners = payload.learners.unwrap();
        let lee = learners.iter().find(|p| p.id.as_deref() == Some("9")).unwrap();
        let essay = lee.assignments.iter().find(|a| a.id == "77").unwrap();
        assert_eq!(
            essay.submissions[0].grades[0].percentage,
            Some(Percentage::Number(90.0))
        );
    }

    #[test]
    fn ungraded_quiz_item_has_no_submission() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        let learners = payload.learners.unwrap();
        let lee = learners.iter().find(|p| p.id.as_deref() == Some("9")).unwrap();
        let quiz = lee.assignments.iter().find(|a| a.id == "78").unwrap();
        assert_eq!(quiz.is_quiz_assignment, Some(true));
        assert_eq!(quiz.quiz_id.as_deref(), Some("31"));
        assert!(quiz.submissions.is_empty());
        // Course-total aggregate row never becomes an assignment.
        assert!(lee.assignments.iter().all(|a| a.id != "99"));
    }

    #[test]
    fn aux_attempts_fill_submitted_at() {
        let aux = json!({"attempts": [{"userid": 9, "itemid": 78, "timefinish": 1_695_003_600}]});
        let payload = normalize_moodle(&fixture(), Some(&aux)).unwrap();
        let learners = payload.learners.unwrap();
        let lee = learners.iter().find(|p| p.id.as_deref() == Some("9")).unwrap();
        let quiz = lee.assignments.iter().find(|a| a.id == "78").unwrap();
        assert_eq!(
            quiz.submissions[0].submitted_at.as_deref(),
            Some("2023-09-18T02:20:00Z")
        );
    }

    #[test]
    fn gradebook_only_user_is_synthesized() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        let learners = payload.learners.unwrap();
        let ghost = learners.iter().find(|p| p.id.as_deref() == Some("77")).unwrap();
        assert_eq!(ghost.assignments.len(), 1);
        assert!(ghost.email.is_none());
    }

    #[test]
    fn forums_map_to_chat_and_quizzes_to_assessments() {
        let payload = normalize_moodle(&fixture(), None).unwrap();
        let chat = payload.chat.unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].messages.len(), 1);
        assert_eq!(chat[0].messages[0].sent_at.as_deref(), Some("2023-09-01T01:00:00Z"));

        let assessments = payload.assessments.unwrap();
        assert_eq!(assessments[0].id.as_deref(), Some("31"));
        assert_eq!(assessments[0].items.as_ref().unwrap().len(), 1);
        assert_eq!(assessments[0].results.as_ref().unwrap()[0].score, Some(8.0));
    }

    #[test]
    fn missing_course_id_fails() {
        let err = normalize_moodle(&json!({"course": {"fullname": "No Id"}}), None).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField(_)));
    }
}
