//! Pure scoring engine: answer normalization, per-question scoring,
//! grade banding and whole-submission aggregation. No IO, no clocks,
//! no shared state; malformed input degrades to zero points instead of
//! failing the submission.

use crate::models::{choice_alphabet, AnswerKey, AnswerSheet, Question, QuestionKind, RawAnswer};
use serde::{Deserialize, Serialize};

/// Normalize a raw choice answer: trim, uppercase, and require a single
/// letter from the alphabet allowed at this question number. Anything
/// else counts as "no answer".
pub fn normalize_choice(raw: &str, question_number: u32) -> Option<char> {
    let normalized: Vec<char> = raw.trim().to_uppercase().chars().collect();
    match normalized.as_slice() {
        [letter] if choice_alphabet(question_number).contains(letter) => Some(*letter),
        _ => None,
    }
}

/// Decode the writing key into parts-of-alternatives. A mismatched key
/// (a choice letter stored on a writing question) degrades to a single
/// part with that letter as the only alternative; a missing key yields
/// no gradable parts. Blank alternatives are dropped here so they can
/// never satisfy a part.
fn writing_parts(question: &Question) -> Vec<Vec<String>> {
    let parts = match &question.answer {
        Some(AnswerKey::Writing { parts }) => parts.clone(),
        Some(AnswerKey::Choice { letter }) => vec![vec![letter.clone()]],
        None => return Vec::new(),
    };
    parts
        .into_iter()
        .map(|alternatives| {
            alternatives
                .into_iter()
                .filter(|a| !a.trim().is_empty())
                .collect()
        })
        .collect()
}

/// The student's answer for part `index`. A scalar answer is only ever
/// compared against part 0; a short list leaves later parts unanswered.
fn part_answer(raw: Option<&RawAnswer>, index: usize) -> Option<&str> {
    match raw {
        Some(RawAnswer::One(value)) if index == 0 => Some(value.as_str()),
        Some(RawAnswer::Many(values)) => values.get(index).map(String::as_str),
        _ => None,
    }
}

fn part_matches(alternatives: &[String], answer: Option<&str>) -> bool {
    let Some(answer) = answer else { return false };
    let answer = answer.trim();
    if answer.is_empty() {
        return false;
    }
    alternatives.iter().any(|alt| alt.trim() == answer)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOutcome {
    pub number: u32,
    pub awarded: f64,
    pub correct: bool,
}

/// Score one question against the student's raw answer. Pure and total:
/// malformed or missing answers award zero, never an error.
pub fn score_question(question: &Question, raw: Option<&RawAnswer>) -> QuestionOutcome {
    let (awarded, correct) = match question.kind {
        QuestionKind::Choice => {
            let key = match &question.answer {
                Some(AnswerKey::Choice { letter }) => normalize_choice(letter, question.number),
                _ => None,
            };
            let submitted = match raw {
                Some(RawAnswer::One(value)) => normalize_choice(value, question.number),
                _ => None,
            };
            match (key, submitted) {
                (Some(key), Some(submitted)) if key == submitted => (question.points, true),
                _ => (0.0, false),
            }
        }
        QuestionKind::Writing => {
            let parts = writing_parts(question);
            if parts.is_empty() {
                (0.0, false)
            } else {
                let share = question.points / parts.len() as f64;
                let matched = parts
                    .iter()
                    .enumerate()
                    .filter(|(i, alternatives)| part_matches(alternatives, part_answer(raw, *i)))
                    .count();
                (share * matched as f64, matched == parts.len())
            }
        }
        // Awarded later by a human reviewer; contributes nothing here.
        QuestionKind::Manual => (0.0, false),
    };
    QuestionOutcome { number: question.number, awarded, correct }
}

/// Letter grades in ascending band order, so `Ord` follows grade quality.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Grade {
    F,
    C,
    #[serde(rename = "C+")]
    CPlus,
    B,
    #[serde(rename = "B+")]
    BPlus,
    A,
    #[serde(rename = "A+")]
    APlus,
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::F => "F",
        };
        f.write_str(label)
    }
}

/// National-certificate bands over the score percentage. Covers the whole
/// range with no gaps; a zero maximum grades as F.
pub fn grade_for(score: f64, max_score: f64) -> Grade {
    let pct = if max_score > 0.0 { score / max_score * 100.0 } else { 0.0 };
    if pct >= 70.0 {
        Grade::APlus
    } else if pct >= 65.0 {
        Grade::A
    } else if pct >= 60.0 {
        Grade::BPlus
    } else if pct >= 55.0 {
        Grade::B
    } else if pct >= 50.0 {
        Grade::CPlus
    } else if pct >= 46.0 {
        Grade::C
    } else {
        Grade::F
    }
}

/// Maximum attainable score, manual maxima included.
pub fn max_score(questions: &[Question]) -> f64 {
    questions.iter().map(|q| q.points).sum()
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub outcomes: Vec<QuestionOutcome>,
    pub score: f64,
    pub max_score: f64,
    pub grade: Grade,
}

/// Grade a full answer sheet against the question set.
pub fn score_submission(questions: &[Question], answers: &AnswerSheet) -> ScoreReport {
    let outcomes: Vec<QuestionOutcome> = questions
        .iter()
        .map(|q| score_question(q, answers.get(&q.number)))
        .collect();
    let score = outcomes.iter().map(|o| o.awarded).sum();
    let max_score = max_score(questions);
    ScoreReport { grade: grade_for(score, max_score), outcomes, score, max_score }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuestionKind;

    fn choice(number: u32, letter: &str, points: f64) -> Question {
        Question {
            number,
            kind: QuestionKind::Choice,
            text: None,
            answer: Some(AnswerKey::Choice { letter: letter.into() }),
            points,
        }
    }

    fn writing(number: u32, parts: Vec<Vec<&str>>, points: f64) -> Question {
        Question {
            number,
            kind: QuestionKind::Writing,
            text: None,
            answer: Some(AnswerKey::Writing {
                parts: parts
                    .into_iter()
                    .map(|p| p.into_iter().map(String::from).collect())
                    .collect(),
            }),
            points,
        }
    }

    fn one(value: &str) -> RawAnswer {
        RawAnswer::One(value.into())
    }

    fn many(values: &[&str]) -> RawAnswer {
        RawAnswer::Many(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn choice_normalization_trims_and_uppercases() {
        let q = choice(1, "B", 1.0);
        assert_eq!(score_question(&q, Some(&one(" b "))).awarded, 1.0);
        assert_eq!(score_question(&q, Some(&one("C"))).awarded, 0.0);
        assert_eq!(score_question(&q, Some(&one(""))).awarded, 0.0);
        assert_eq!(score_question(&q, Some(&one("BB"))).awarded, 0.0);
        assert_eq!(score_question(&q, None).awarded, 0.0);
    }

    #[test]
    fn choice_letter_outside_alphabet_counts_as_unanswered() {
        // E is acceptable at 33 but not at 1.
        assert_eq!(score_question(&choice(33, "E", 1.0), Some(&one("e"))).awarded, 1.0);
        assert_eq!(score_question(&choice(1, "B", 1.0), Some(&one("E"))).awarded, 0.0);
    }

    #[test]
    fn writing_awards_equal_share_per_part() {
        let q = writing(36, vec![vec!["12", "12.0"], vec!["5"]], 2.0);
        let full = score_question(&q, Some(&many(&["12.0", "5"])));
        assert_eq!(full.awarded, 2.0);
        assert!(full.correct);

        let half = score_question(&q, Some(&many(&["7", "5"])));
        assert_eq!(half.awarded, 1.0);
        assert!(!half.correct);

        let none = score_question(&q, Some(&many(&["7", "8"])));
        assert_eq!(none.awarded, 0.0);
    }

    #[test]
    fn writing_short_or_scalar_answers_never_panic() {
        let q = writing(36, vec![vec!["12"], vec!["5"]], 2.0);
        // Shorter list than the key: missing part scores 0.
        assert_eq!(score_question(&q, Some(&many(&["12"]))).awarded, 1.0);
        // A scalar is compared against part 0 only.
        assert_eq!(score_question(&q, Some(&one("12"))).awarded, 1.0);
        assert_eq!(score_question(&q, Some(&one("5"))).awarded, 0.0);
    }

    #[test]
    fn writing_match_is_case_sensitive_and_ignores_blank_alternatives() {
        let q = writing(36, vec![vec!["Ohm", ""]], 1.0);
        assert_eq!(score_question(&q, Some(&one("Ohm"))).awarded, 1.0);
        assert_eq!(score_question(&q, Some(&one("ohm"))).awarded, 0.0);
        // A blank answer must not satisfy the blank alternative.
        assert_eq!(score_question(&q, Some(&one(""))).awarded, 0.0);
    }

    #[test]
    fn alternative_order_does_not_change_the_award() {
        let a = writing(36, vec![vec!["12", "12.0"]], 1.0);
        let b = writing(36, vec![vec!["12.0", "12"]], 1.0);
        let answer = one("12.0");
        assert_eq!(score_question(&a, Some(&answer)).awarded, score_question(&b, Some(&answer)).awarded);
    }

    #[test]
    fn zero_point_writing_question_divides_cleanly() {
        let q = writing(36, vec![vec!["12"], vec!["5"]], 0.0);
        assert_eq!(score_question(&q, Some(&many(&["12", "5"]))).awarded, 0.0);
    }

    #[test]
    fn degraded_key_still_grades() {
        // A choice key stored on a writing question collapses to one part.
        let q = Question {
            number: 36,
            kind: QuestionKind::Writing,
            text: None,
            answer: Some(AnswerKey::Choice { letter: "42".into() }),
            points: 2.0,
        };
        assert_eq!(score_question(&q, Some(&one("42"))).awarded, 2.0);

        // No key at all: nothing gradable, zero points, no error.
        let keyless = Question {
            number: 37,
            kind: QuestionKind::Writing,
            text: None,
            answer: None,
            points: 2.0,
        };
        assert_eq!(score_question(&keyless, Some(&one("42"))).awarded, 0.0);
    }

    #[test]
    fn manual_questions_award_zero_automatically() {
        let q = Question {
            number: 41,
            kind: QuestionKind::Manual,
            text: None,
            answer: None,
            points: 5.0,
        };
        let outcome = score_question(&q, Some(&one("essay text")));
        assert_eq!(outcome.awarded, 0.0);
        assert!(!outcome.correct);
    }

    #[test]
    fn scoring_is_idempotent() {
        let q = writing(36, vec![vec!["12", "12.0"], vec!["5"]], 2.0);
        let answer = many(&["12.0", "7"]);
        let first = score_question(&q, Some(&answer));
        let second = score_question(&q, Some(&answer));
        assert_eq!(first, second);
    }

    #[test]
    fn full_submission_scenarios() {
        let questions = vec![
            choice(1, "B", 1.0),
            writing(2, vec![vec!["12", "12.0"], vec!["5"]], 2.0),
        ];

        let sheet: AnswerSheet = serde_json::from_str(r#"{"1": "B", "2": ["12.0", "5"]}"#).unwrap();
        let report = score_submission(&questions, &sheet);
        assert_eq!(report.score, 3.0);
        assert_eq!(report.max_score, 3.0);
        assert_eq!(report.grade, Grade::APlus);

        let sheet: AnswerSheet = serde_json::from_str(r#"{"1": "C", "2": ["7", "5"]}"#).unwrap();
        let report = score_submission(&questions, &sheet);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.grade, Grade::F);
    }

    #[test]
    fn grade_bands_are_monotonic_and_gapless() {
        let mut previous = Grade::F;
        for tenth in 0..=1000 {
            let grade = grade_for(tenth as f64 / 10.0, 100.0);
            assert!(grade >= previous, "grade dropped at {tenth}");
            previous = grade;
        }
        assert_eq!(grade_for(70.0, 100.0), Grade::APlus);
        assert_eq!(grade_for(69.9, 100.0), Grade::A);
        assert_eq!(grade_for(46.0, 100.0), Grade::C);
        assert_eq!(grade_for(45.9, 100.0), Grade::F);
        assert_eq!(grade_for(0.0, 0.0), Grade::F);
    }
}
