use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;

/// Longest allowed window between test creation and expiry.
pub const MAX_EXPIRY_DAYS: i64 = 7;
pub const MAX_QUESTION_POINTS: f64 = 100.0;

const DEFAULT_CHOICE_ALPHABET: &[char] = &['A', 'B', 'C', 'D'];
const EXTENDED_CHOICE_ALPHABET: &[char] = &['A', 'B', 'C', 'D', 'E', 'F'];

/// Question numbers reserved for six-letter choice questions.
pub const EXTENDED_CHOICE_RANGE: RangeInclusive<u32> = 33..=35;

pub fn choice_alphabet(question_number: u32) -> &'static [char] {
    if EXTENDED_CHOICE_RANGE.contains(&question_number) {
        EXTENDED_CHOICE_ALPHABET
    } else {
        DEFAULT_CHOICE_ALPHABET
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Choice,
    Writing,
    Manual,
}

/// Tagged answer key. Choice holds one letter, writing holds ordered parts,
/// each part an ordered list of acceptable alternatives. Manual questions
/// carry no key at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AnswerKey {
    Choice { letter: String },
    Writing { parts: Vec<Vec<String>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub number: u32,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<AnswerKey>,
    pub points: f64,
}

/// A student's raw answer to one question: a scalar for choice and
/// single-part writing, an ordered list for multi-part writing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawAnswer {
    One(String),
    Many(Vec<String>),
}

/// Submitted answers keyed by question number.
pub type AnswerSheet = BTreeMap<u32, RawAnswer>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMode {
    Single,
    Multiple,
}

/// Teacher-entered test definition, before it is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct TestDraft {
    pub title: String,
    pub subject: String,
    pub submission_mode: SubmissionMode,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self { field: field.into(), issue: issue.into() }
    }
}

pub fn validate_test(draft: &TestDraft, now: DateTime<Utc>) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if draft.title.trim().is_empty() {
        issues.push(ValidationIssue::new("title", "must not be empty"));
    }
    if draft.subject.trim().is_empty() {
        issues.push(ValidationIssue::new("subject", "must not be empty"));
    }
    if let Some(expires_at) = draft.expires_at {
        if expires_at <= now {
            issues.push(ValidationIssue::new("expires_at", "must be in the future"));
        } else if expires_at > now + Duration::days(MAX_EXPIRY_DAYS) {
            issues.push(ValidationIssue::new(
                "expires_at",
                format!("must be within {MAX_EXPIRY_DAYS} days"),
            ));
        }
    }
    if draft.questions.is_empty() {
        issues.push(ValidationIssue::new("questions", "must contain at least one question"));
    }

    let mut numbers = HashSet::new();
    for (i, q) in draft.questions.iter().enumerate() {
        if q.number == 0 {
            issues.push(ValidationIssue::new(format!("questions[{i}].number"), "must be positive"));
        }
        if !numbers.insert(q.number) {
            issues.push(ValidationIssue::new(format!("questions[{i}].number"), "must be unique"));
        }
        if !q.points.is_finite() || q.points < 0.0 {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].points"),
                "must be a non-negative number",
            ));
        } else if q.points > MAX_QUESTION_POINTS {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].points"),
                format!("must not exceed {MAX_QUESTION_POINTS}"),
            ));
        }

        match q.kind {
            QuestionKind::Choice => match &q.answer {
                Some(AnswerKey::Choice { letter }) => {
                    let normalized: Vec<char> = letter.trim().to_uppercase().chars().collect();
                    let allowed = choice_alphabet(q.number);
                    if normalized.len() != 1 || !allowed.contains(&normalized[0]) {
                        issues.push(ValidationIssue::new(
                            format!("questions[{i}].answer.letter"),
                            format!("must be one letter of {}", allowed.iter().collect::<String>()),
                        ));
                    }
                }
                _ => issues.push(ValidationIssue::new(
                    format!("questions[{i}].answer"),
                    "answer required: a single choice letter",
                )),
            },
            QuestionKind::Writing => match &q.answer {
                Some(AnswerKey::Writing { parts }) => {
                    if parts.is_empty() {
                        issues.push(ValidationIssue::new(
                            format!("questions[{i}].answer.parts"),
                            "must contain at least one part",
                        ));
                    }
                    for (p, alternatives) in parts.iter().enumerate() {
                        if !alternatives.iter().any(|a| !a.trim().is_empty()) {
                            issues.push(ValidationIssue::new(
                                format!("questions[{i}].answer.parts[{p}]"),
                                "must contain at least one non-empty alternative",
                            ));
                        }
                    }
                }
                _ => issues.push(ValidationIssue::new(
                    format!("questions[{i}].answer"),
                    "answer required: parts with acceptable alternatives",
                )),
            },
            QuestionKind::Manual => {
                if q.answer.is_some() {
                    issues.push(ValidationIssue::new(
                        format!("questions[{i}].answer"),
                        "must be absent for manually graded questions",
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(questions: Vec<Question>) -> TestDraft {
        TestDraft {
            title: "Fizika 1-variant".into(),
            subject: "Fizika".into(),
            submission_mode: SubmissionMode::Single,
            expires_at: None,
            questions,
        }
    }

    fn choice(number: u32, letter: &str) -> Question {
        Question {
            number,
            kind: QuestionKind::Choice,
            text: None,
            answer: Some(AnswerKey::Choice { letter: letter.into() }),
            points: 1.0,
        }
    }

    #[test]
    fn validate_test_ok() {
        let d = draft(vec![
            choice(1, "B"),
            Question {
                number: 36,
                kind: QuestionKind::Writing,
                text: Some("Hisoblang".into()),
                answer: Some(AnswerKey::Writing {
                    parts: vec![vec!["12".into(), "12.0".into()], vec!["5".into()]],
                }),
                points: 2.0,
            },
            Question {
                number: 41,
                kind: QuestionKind::Manual,
                text: Some("Isbotlang".into()),
                answer: None,
                points: 5.0,
            },
        ]);
        assert!(validate_test(&d, Utc::now()).is_ok());
    }

    #[test]
    fn duplicate_numbers_and_bad_letters_are_reported_per_field() {
        let d = draft(vec![choice(1, "B"), choice(1, "E")]);
        let issues = validate_test(&d, Utc::now()).unwrap_err();
        assert!(issues.iter().any(|i| i.field == "questions[1].number"));
        // E is only valid inside the extended range.
        assert!(issues.iter().any(|i| i.field == "questions[1].answer.letter"));
    }

    #[test]
    fn extended_range_accepts_six_letters() {
        let d = draft(vec![choice(33, "F")]);
        assert!(validate_test(&d, Utc::now()).is_ok());
        let d = draft(vec![choice(32, "F")]);
        assert!(validate_test(&d, Utc::now()).is_err());
    }

    #[test]
    fn expiry_must_fall_inside_the_window() {
        let now = Utc::now();
        let mut d = draft(vec![choice(1, "A")]);
        d.expires_at = Some(now - Duration::hours(1));
        assert!(validate_test(&d, now).is_err());
        d.expires_at = Some(now + Duration::days(8));
        assert!(validate_test(&d, now).is_err());
        d.expires_at = Some(now + Duration::days(3));
        assert!(validate_test(&d, now).is_ok());
    }

    #[test]
    fn writing_key_needs_a_non_empty_alternative() {
        let d = draft(vec![Question {
            number: 36,
            kind: QuestionKind::Writing,
            text: None,
            answer: Some(AnswerKey::Writing { parts: vec![vec!["  ".into()]] }),
            points: 2.0,
        }]);
        let issues = validate_test(&d, Utc::now()).unwrap_err();
        assert!(issues.iter().any(|i| i.field == "questions[0].answer.parts[0]"));
    }

    #[test]
    fn zero_points_are_allowed_but_negative_are_not() {
        let mut q = choice(1, "A");
        q.points = 0.0;
        assert!(validate_test(&draft(vec![q.clone()]), Utc::now()).is_ok());
        q.points = -1.0;
        assert!(validate_test(&draft(vec![q]), Utc::now()).is_err());
    }

    #[test]
    fn raw_answer_accepts_scalar_and_list() {
        let sheet: AnswerSheet = serde_json::from_str(r#"{"1": "B", "36": ["12.0", "5"]}"#).unwrap();
        assert_eq!(sheet.get(&1), Some(&RawAnswer::One("B".into())));
        assert_eq!(sheet.get(&36), Some(&RawAnswer::Many(vec!["12.0".into(), "5".into()])));
    }
}
