use crate::models::{AnswerSheet, Question, QuestionKind, SubmissionMode, TestDraft};
use crate::scoring::{self, Grade, QuestionOutcome, ScoreReport};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::{fs, path::Path};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub const ACCESS_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherAccount {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct TeacherSession {
    pub teacher_id: i64,
    pub csrf_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: i64,
    pub owner_teacher_id: i64,
    pub owner_name: String,
    pub title: String,
    pub subject: String,
    pub submission_mode: SubmissionMode,
    pub access_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub questions: Vec<Question>,
}

impl TestRecord {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires| now < expires)
    }

    /// Expiry is observed lazily: the first caller to notice it closes the
    /// test, like a manual finish would.
    pub fn close_if_expired(&mut self, now: DateTime<Utc>) {
        if self.is_active && self.expires_at.is_some_and(|expires| now >= expires) {
            self.is_active = false;
            self.finished_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: i64,
    pub test_id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub attempt_number: u32,
    pub answers: AnswerSheet,
    pub outcomes: Vec<QuestionOutcome>,
    pub score: f64,
    pub max_score: f64,
    pub grade: Grade,
    /// Reviewer-assigned points for manual questions, keyed by number.
    pub manual_awards: BTreeMap<u32, f64>,
    pub submitted_at: DateTime<Utc>,
}

/// Why a submission attempt was refused before scoring ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitRejection {
    #[error("test not found")]
    TestNotFound,
    #[error("test is closed")]
    TestClosed,
    #[error("already submitted")]
    AlreadySubmitted,
}

pub struct InMemoryDb {
    pub teachers: RwLock<HashMap<i64, TeacherAccount>>,
    pub teachers_by_login: RwLock<HashMap<String, i64>>,
    pub sessions: RwLock<HashMap<String, TeacherSession>>,
    pub tests: RwLock<HashMap<i64, TestRecord>>,
    pub tests_by_code: RwLock<HashMap<String, i64>>,
    pub submissions: RwLock<HashMap<i64, SubmissionRecord>>,
    next_teacher_id: AtomicI64,
    next_test_id: AtomicI64,
    next_submission_id: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistentSnapshot {
    teachers: HashMap<i64, TeacherAccount>,
    teachers_by_login: HashMap<String, i64>,
    tests: HashMap<i64, TestRecord>,
    tests_by_code: HashMap<String, i64>,
    submissions: HashMap<i64, SubmissionRecord>,
    next_teacher_id: i64,
    next_test_id: i64,
    next_submission_id: i64,
}

impl InMemoryDb {
    pub fn new(snapshot_path: Option<&str>) -> Self {
        let snapshot = snapshot_path.and_then(|path| {
            let raw = fs::read_to_string(path).ok()?;
            match serde_json::from_str::<PersistentSnapshot>(&raw) {
                Ok(s) => Some(s),
                Err(err) => {
                    warn!("failed to read local snapshot {}: {}", path, err);
                    None
                }
            }
        });

        let teachers = snapshot.as_ref().map(|s| s.teachers.clone()).unwrap_or_default();
        let teachers_by_login =
            snapshot.as_ref().map(|s| s.teachers_by_login.clone()).unwrap_or_default();
        let tests = snapshot.as_ref().map(|s| s.tests.clone()).unwrap_or_default();
        let tests_by_code =
            snapshot.as_ref().map(|s| s.tests_by_code.clone()).unwrap_or_default();
        let submissions = snapshot.as_ref().map(|s| s.submissions.clone()).unwrap_or_default();
        let next_teacher_id = snapshot
            .as_ref()
            .map(|s| s.next_teacher_id)
            .unwrap_or(1)
            .max(teachers.keys().max().copied().unwrap_or(0) + 1);
        let next_test_id = snapshot
            .as_ref()
            .map(|s| s.next_test_id)
            .unwrap_or(1)
            .max(tests.keys().max().copied().unwrap_or(0) + 1);
        let next_submission_id = snapshot
            .as_ref()
            .map(|s| s.next_submission_id)
            .unwrap_or(1)
            .max(submissions.keys().max().copied().unwrap_or(0) + 1);

        Self {
            teachers: RwLock::new(teachers),
            teachers_by_login: RwLock::new(teachers_by_login),
            sessions: RwLock::new(HashMap::new()),
            tests: RwLock::new(tests),
            tests_by_code: RwLock::new(tests_by_code),
            submissions: RwLock::new(submissions),
            next_teacher_id: AtomicI64::new(next_teacher_id),
            next_test_id: AtomicI64::new(next_test_id),
            next_submission_id: AtomicI64::new(next_submission_id),
        }
    }

    pub fn next_teacher_id(&self) -> i64 {
        self.next_teacher_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_test_id(&self) -> i64 {
        self.next_test_id.fetch_add(1, Ordering::SeqCst)
    }

    fn next_submission_id(&self) -> i64 {
        self.next_submission_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create a scored submission, or reject it before scoring. The prior
    /// attempt count is read and the record inserted under one write lock,
    /// so two concurrent single-mode attempts for the same (test, student)
    /// serialize and the loser sees `AlreadySubmitted`. `now` is supplied
    /// by the caller; the engine never reads the clock itself.
    pub async fn create_submission(
        &self,
        test_id: i64,
        student_id: i64,
        student_name: String,
        answers: AnswerSheet,
        now: DateTime<Utc>,
    ) -> Result<SubmissionRecord, SubmitRejection> {
        let (mode, questions) = {
            let mut tests = self.tests.write().await;
            let test = tests.get_mut(&test_id).ok_or(SubmitRejection::TestNotFound)?;
            test.close_if_expired(now);
            if !test.is_active {
                return Err(SubmitRejection::TestClosed);
            }
            (test.submission_mode, test.questions.clone())
        };

        let mut submissions = self.submissions.write().await;
        let prior_attempts = submissions
            .values()
            .filter(|s| s.test_id == test_id && s.student_id == student_id)
            .count() as u32;
        if mode == SubmissionMode::Single && prior_attempts > 0 {
            return Err(SubmitRejection::AlreadySubmitted);
        }

        let report = scoring::score_submission(&questions, &answers);
        let record = SubmissionRecord {
            id: self.next_submission_id(),
            test_id,
            student_id,
            student_name,
            attempt_number: prior_attempts + 1,
            answers,
            score: report.score,
            max_score: report.max_score,
            grade: report.grade,
            outcomes: report.outcomes,
            manual_awards: BTreeMap::new(),
            submitted_at: now,
        };
        submissions.insert(record.id, record.clone());
        Ok(record)
    }

    /// Re-grade every submission of a test against its current question
    /// set, re-applying stored manual awards. Used after a teacher edits
    /// the questions.
    pub async fn regrade_test(&self, test_id: i64) {
        let questions = {
            let tests = self.tests.read().await;
            match tests.get(&test_id) {
                Some(test) => test.questions.clone(),
                None => return,
            }
        };
        let mut submissions = self.submissions.write().await;
        for submission in submissions.values_mut().filter(|s| s.test_id == test_id) {
            let report = scoring::score_submission(&questions, &submission.answers);
            let awards = std::mem::take(&mut submission.manual_awards);
            apply_review(&questions, &report, awards, submission);
        }
    }

    /// Merge reviewer-assigned manual points into one submission and
    /// re-band the grade. A later review replaces the earlier awards.
    pub async fn review_submission(
        &self,
        submission_id: i64,
        awards: BTreeMap<u32, f64>,
    ) -> Option<SubmissionRecord> {
        let test_id = self.submissions.read().await.get(&submission_id)?.test_id;
        let questions = self.tests.read().await.get(&test_id)?.questions.clone();
        let mut submissions = self.submissions.write().await;
        let submission = submissions.get_mut(&submission_id)?;
        let report = scoring::score_submission(&questions, &submission.answers);
        apply_review(&questions, &report, awards, submission);
        Some(submission.clone())
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            teachers: self.teachers.read().await.clone(),
            teachers_by_login: self.teachers_by_login.read().await.clone(),
            tests: self.tests.read().await.clone(),
            tests_by_code: self.tests_by_code.read().await.clone(),
            submissions: self.submissions.read().await.clone(),
            next_teacher_id: self.next_teacher_id.load(Ordering::SeqCst),
            next_test_id: self.next_test_id.load(Ordering::SeqCst),
            next_submission_id: self.next_submission_id.load(Ordering::SeqCst),
        }
    }
}

/// Clamp awards to `[0, points]` of the matching manual question, drop
/// awards aimed at anything else, and write the merged score and grade
/// back into the record.
fn apply_review(
    questions: &[Question],
    report: &ScoreReport,
    awards: BTreeMap<u32, f64>,
    submission: &mut SubmissionRecord,
) {
    let clamped: BTreeMap<u32, f64> = awards
        .into_iter()
        .filter_map(|(number, points)| {
            let question = questions
                .iter()
                .find(|q| q.number == number && q.kind == QuestionKind::Manual)?;
            Some((number, points.clamp(0.0, question.points)))
        })
        .collect();
    let merged = report.score + clamped.values().sum::<f64>();
    submission.score = merged;
    submission.max_score = report.max_score;
    submission.grade = scoring::grade_for(merged, report.max_score);
    submission.outcomes = report.outcomes.clone();
    submission.manual_awards = clamped;
}

fn generate_access_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ACCESS_CODE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<InMemoryDb>,
    pub local_state_path: Option<String>,
}

impl AppState {
    pub fn new() -> Self {
        let local_state_path = std::env::var("LOCAL_STATE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| Some(format!("{}/local_state.json", env!("CARGO_MANIFEST_DIR"))));
        Self {
            db: Arc::new(InMemoryDb::new(local_state_path.as_deref())),
            local_state_path,
        }
    }

    pub async fn create_test(
        &self,
        owner_teacher_id: i64,
        owner_name: String,
        draft: TestDraft,
        now: DateTime<Utc>,
    ) -> TestRecord {
        let id = self.db.next_test_id();
        let mut tests_by_code = self.db.tests_by_code.write().await;
        let access_code = loop {
            let candidate = generate_access_code();
            if !tests_by_code.contains_key(&candidate) {
                break candidate;
            }
        };
        let record = TestRecord {
            id,
            owner_teacher_id,
            owner_name,
            title: draft.title,
            subject: draft.subject,
            submission_mode: draft.submission_mode,
            access_code: access_code.clone(),
            is_active: true,
            created_at: now,
            expires_at: draft.expires_at,
            finished_at: None,
            questions: draft.questions,
        };
        tests_by_code.insert(access_code, id);
        drop(tests_by_code);
        self.db.tests.write().await.insert(id, record.clone());
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after create_test: {}", err);
        }
        record
    }

    pub async fn persist_core_data(&self) -> anyhow::Result<()> {
        let Some(path) = self.local_state_path.as_ref() else {
            return Ok(());
        };
        let snapshot = self.db.snapshot().await;
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerKey, QuestionKind, RawAnswer};
    use chrono::Duration;

    fn sample_questions() -> Vec<Question> {
        vec![
            Question {
                number: 1,
                kind: QuestionKind::Choice,
                text: None,
                answer: Some(AnswerKey::Choice { letter: "B".into() }),
                points: 1.0,
            },
            Question {
                number: 41,
                kind: QuestionKind::Manual,
                text: Some("Isbotlang".into()),
                answer: None,
                points: 5.0,
            },
        ]
    }

    async fn insert_test(
        db: &InMemoryDb,
        id: i64,
        mode: SubmissionMode,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let record = TestRecord {
            id,
            owner_teacher_id: 1,
            owner_name: "Eshmatov Toshmat".into(),
            title: "Fizika".into(),
            subject: "Fizika".into(),
            submission_mode: mode,
            access_code: format!("CODE{id:04}"),
            is_active: true,
            created_at: Utc::now(),
            expires_at,
            finished_at: None,
            questions: sample_questions(),
        };
        db.tests.write().await.insert(id, record);
    }

    fn answers(letter: &str) -> AnswerSheet {
        let mut sheet = AnswerSheet::new();
        sheet.insert(1, RawAnswer::One(letter.into()));
        sheet
    }

    #[tokio::test]
    async fn single_mode_rejects_second_attempt() {
        let db = InMemoryDb::new(None);
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Single, None).await;

        let first = db
            .create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now)
            .await
            .unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(first.score, 1.0);

        let second = db
            .create_submission(1, 77, "Aliyev Vali".into(), answers("A"), now)
            .await;
        assert_eq!(second.unwrap_err(), SubmitRejection::AlreadySubmitted);

        // The first attempt stays untouched.
        let stored = db.submissions.read().await.get(&first.id).cloned().unwrap();
        assert_eq!(stored.attempt_number, 1);
        assert_eq!(stored.score, 1.0);
    }

    #[tokio::test]
    async fn multiple_mode_numbers_attempts_without_gaps() {
        let db = InMemoryDb::new(None);
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Multiple, None).await;

        for expected in 1..=3u32 {
            let sub = db
                .create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now)
                .await
                .unwrap();
            assert_eq!(sub.attempt_number, expected);
        }
    }

    #[tokio::test]
    async fn expired_test_rejects_before_scoring_and_closes() {
        let db = InMemoryDb::new(None);
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Single, Some(now - Duration::hours(1))).await;

        let result = db
            .create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now)
            .await;
        assert_eq!(result.unwrap_err(), SubmitRejection::TestClosed);

        let test = db.tests.read().await.get(&1).cloned().unwrap();
        assert!(!test.is_active);
        assert!(test.finished_at.is_some());
    }

    #[tokio::test]
    async fn unknown_test_is_a_distinct_rejection() {
        let db = InMemoryDb::new(None);
        let result = db
            .create_submission(99, 77, "Aliyev Vali".into(), answers("B"), Utc::now())
            .await;
        assert_eq!(result.unwrap_err(), SubmitRejection::TestNotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_single_mode_attempts_accept_exactly_one() {
        let db = Arc::new(InMemoryDb::new(None));
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Single, None).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now).await
            }));
        }
        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(sub) => {
                    accepted += 1;
                    assert_eq!(sub.attempt_number, 1);
                }
                Err(SubmitRejection::AlreadySubmitted) => rejected += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn review_merges_clamped_manual_points_and_rebands() {
        let db = InMemoryDb::new(None);
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Single, None).await;

        let sub = db
            .create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now)
            .await
            .unwrap();
        // Automatic portion: 1 of 6 points.
        assert_eq!(sub.score, 1.0);
        assert_eq!(sub.max_score, 6.0);
        assert_eq!(sub.grade, Grade::F);

        let mut awards = BTreeMap::new();
        awards.insert(41, 99.0); // clamped to the 5-point maximum
        awards.insert(1, 3.0); // not a manual question, dropped
        let reviewed = db.review_submission(sub.id, awards).await.unwrap();
        assert_eq!(reviewed.score, 6.0);
        assert_eq!(reviewed.grade, Grade::APlus);
        assert_eq!(reviewed.manual_awards.get(&41), Some(&5.0));
        assert!(!reviewed.manual_awards.contains_key(&1));

        // A later review replaces, not accumulates.
        let mut awards = BTreeMap::new();
        awards.insert(41, 2.0);
        let reviewed = db.review_submission(sub.id, awards).await.unwrap();
        assert_eq!(reviewed.score, 3.0);
    }

    #[tokio::test]
    async fn regrade_after_edit_keeps_manual_awards() {
        let db = InMemoryDb::new(None);
        let now = Utc::now();
        insert_test(&db, 1, SubmissionMode::Single, None).await;

        let sub = db
            .create_submission(1, 77, "Aliyev Vali".into(), answers("B"), now)
            .await
            .unwrap();
        let mut awards = BTreeMap::new();
        awards.insert(41, 4.0);
        db.review_submission(sub.id, awards).await.unwrap();

        // The correct letter changes from B to A; the manual award survives.
        {
            let mut tests = db.tests.write().await;
            let test = tests.get_mut(&1).unwrap();
            test.questions[0].answer = Some(AnswerKey::Choice { letter: "A".into() });
        }
        db.regrade_test(1).await;

        let stored = db.submissions.read().await.get(&sub.id).cloned().unwrap();
        assert_eq!(stored.score, 4.0);
        assert_eq!(stored.manual_awards.get(&41), Some(&4.0));
    }
}
