use crate::error::AppError;
use crate::models::{
    choice_alphabet, validate_test, AnswerSheet, Question, QuestionKind, SubmissionMode, TestDraft,
    ValidationIssue, MAX_EXPIRY_DAYS,
};
use crate::scoring::Grade;
use crate::state::{AppState, SubmissionRecord, SubmitRejection, TeacherAccount, TeacherSession, TestRecord};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SESSION_COOKIE: &str = "teacher_session";
static RATE_LIMIT: Lazy<DashMap<String, (u32, Instant)>> = Lazy::new(DashMap::new);

fn check_rate_limit(scope: &str, key: &str, limit_per_minute: u32) -> bool {
    let now = Instant::now();
    let full_key = format!("{scope}:{key}");
    if let Some(mut entry) = RATE_LIMIT.get_mut(&full_key) {
        if now.duration_since(entry.1) > Duration::from_secs(60) {
            *entry = (1, now);
            true
        } else if entry.0 >= limit_per_minute {
            false
        } else {
            entry.0 += 1;
            true
        }
    } else {
        RATE_LIMIT.insert(full_key, (1, now));
        true
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn client_ip(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
}

async fn auth_teacher_id(jar: &CookieJar, state: &AppState) -> Option<i64> {
    let sid = jar.get(SESSION_COOKIE)?.value().to_string();
    let sessions = state.db.sessions.read().await;
    sessions.get(&sid).map(|v| v.teacher_id)
}

async fn ensure_csrf(headers: &HeaderMap, jar: &CookieJar, state: &AppState) -> bool {
    let sid = match jar.get(SESSION_COOKIE) {
        Some(v) => v.value().to_string(),
        None => return false,
    };
    let header = match headers.get("x-csrf-token").and_then(|h| h.to_str().ok()) {
        Some(v) => v,
        None => return false,
    };
    let sessions = state.db.sessions.read().await;
    sessions.get(&sid).map(|s| s.csrf_token == header).unwrap_or(false)
}

#[derive(Debug, Deserialize)]
pub struct AuthPayload {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TeacherOut {
    pub id: i64,
    pub login: String,
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AuthPayload>,
) -> Result<(StatusCode, Json<TeacherOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("auth_register", client_ip(&headers), 20) {
        return Err(AppError::rate_limited(req_id));
    }
    let login = payload.login.trim().to_string();
    if login.len() < 3 || payload.password.len() < 8 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "invalid login/password",
            req_id,
        ));
    }

    {
        let map = state.db.teachers_by_login.read().await;
        if map.contains_key(&login) {
            return Err(AppError::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                "login already exists",
                req_id,
            ));
        }
    }

    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|_| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "password hash failed",
                req_id.clone(),
            )
        })?
        .to_string();

    let id = state.db.next_teacher_id();
    let account = TeacherAccount { id, login: login.clone(), password_hash: hash };
    state.db.teachers.write().await.insert(id, account);
    state.db.teachers_by_login.write().await.insert(login.clone(), id);
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after register: {}", err);
    }

    Ok((StatusCode::CREATED, Json(TeacherOut { id, login })))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthPayload>,
) -> Result<(CookieJar, Json<TeacherOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("auth_login", client_ip(&headers), 30) {
        return Err(AppError::rate_limited(req_id));
    }
    let login = payload.login.trim().to_string();
    let id = {
        let by_login = state.db.teachers_by_login.read().await;
        by_login.get(&login).copied()
    }
    .ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid credentials", req_id.clone())
    })?;

    let account = state.db.teachers.read().await.get(&id).cloned().ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid credentials", req_id.clone())
    })?;

    let parsed_hash = PasswordHash::new(&account.password_hash).map_err(|_| {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "bad hash", req_id.clone())
    })?;
    let is_valid = Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .is_ok();
    if !is_valid {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid credentials",
            req_id,
        ));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let csrf_token = uuid::Uuid::new_v4().to_string();
    state.db.sessions.write().await.insert(
        session_id.clone(),
        TeacherSession { teacher_id: id, csrf_token: csrf_token.clone() },
    );

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    let csrf_cookie = Cookie::build(("csrf_token", csrf_token))
        .http_only(false)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    Ok((jar.add(cookie).add(csrf_cookie), Json(TeacherOut { id, login: account.login })))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let req_id = request_id_from_headers(&headers);
    let sid = jar
        .get(SESSION_COOKIE)
        .map(|v| v.value().to_string())
        .ok_or_else(|| AppError::unauthorized(req_id))?;
    state.db.sessions.write().await.remove(&sid);
    Ok((jar.remove(Cookie::from(SESSION_COOKIE)), StatusCode::NO_CONTENT))
}

pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<TeacherOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    let account = state
        .db
        .teachers
        .read()
        .await
        .get(&teacher_id)
        .cloned()
        .ok_or_else(|| AppError::unauthorized(req_id))?;
    Ok(Json(TeacherOut { id: account.id, login: account.login }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTestPayload {
    #[serde(default)]
    pub creator_name: Option<String>,
    pub title: String,
    pub subject: String,
    pub submission_mode: SubmissionMode,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub questions: Vec<Question>,
}

impl CreateTestPayload {
    fn into_draft(self) -> (Option<String>, TestDraft) {
        (
            self.creator_name,
            TestDraft {
                title: self.title,
                subject: self.subject,
                submission_mode: self.submission_mode,
                expires_at: self.expires_at,
                questions: self.questions,
            },
        )
    }
}

pub async fn create_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<CreateTestPayload>,
) -> Result<(StatusCode, Json<TestRecord>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !ensure_csrf(&headers, &jar, &state).await {
        return Err(AppError::forbidden("csrf token invalid", req_id));
    }
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;

    let (creator_name, draft) = payload.into_draft();
    let now = Utc::now();
    if let Err(issues) = validate_test(&draft, now) {
        return Err(AppError::validation("test validation failed", issues, req_id));
    }

    let owner_name = match creator_name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name.trim().to_string(),
        None => state
            .db
            .teachers
            .read()
            .await
            .get(&teacher_id)
            .map(|t| t.login.clone())
            .unwrap_or_default(),
    };

    let record = state.create_test(teacher_id, owner_name, draft, now).await;
    info!(test_id = record.id, access_code = %record.access_code, "test created");
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Serialize)]
pub struct TestSummary {
    pub id: i64,
    pub title: String,
    pub subject: String,
    pub access_code: String,
    pub submission_mode: SubmissionMode,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub submissions_count: usize,
}

#[derive(Debug, Serialize)]
pub struct TestListResponse {
    pub items: Vec<TestSummary>,
    pub total: usize,
}

pub async fn list_tests(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<TestListResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id))?;
    let now = Utc::now();

    // Unique students per test, counting each (id, name) pair once.
    let students_per_test: HashMap<i64, usize> = {
        let submissions = state.db.submissions.read().await;
        let mut seen: HashMap<i64, std::collections::HashSet<i64>> = HashMap::new();
        for s in submissions.values() {
            seen.entry(s.test_id).or_default().insert(s.student_id);
        }
        seen.into_iter().map(|(k, v)| (k, v.len())).collect()
    };

    let mut tests = state.db.tests.write().await;
    let mut items: Vec<TestSummary> = tests
        .values_mut()
        .filter(|t| t.owner_teacher_id == teacher_id)
        .map(|t| {
            t.close_if_expired(now);
            TestSummary {
                id: t.id,
                title: t.title.clone(),
                subject: t.subject.clone(),
                access_code: t.access_code.clone(),
                submission_mode: t.submission_mode,
                is_active: t.is_active,
                created_at: t.created_at,
                expires_at: t.expires_at,
                submissions_count: students_per_test.get(&t.id).copied().unwrap_or(0),
            }
        })
        .collect();
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(TestListResponse { total: items.len(), items }))
}

pub async fn get_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<TestRecord>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    let mut tests = state.db.tests.write().await;
    let test = tests
        .get_mut(&id)
        .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
    if test.owner_teacher_id != teacher_id {
        return Err(AppError::forbidden("access denied", req_id));
    }
    test.close_if_expired(Utc::now());
    Ok(Json(test.clone()))
}

pub async fn update_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
    Json(payload): Json<CreateTestPayload>,
) -> Result<Json<TestRecord>, AppError> {
    let req_id = request_id_from_headers(&headers);
    if !ensure_csrf(&headers, &jar, &state).await {
        return Err(AppError::forbidden("csrf token invalid", req_id));
    }
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;

    let (creator_name, draft) = payload.into_draft();
    let now = Utc::now();
    if let Err(issues) = validate_test(&draft, now) {
        return Err(AppError::validation("test validation failed", issues, req_id));
    }

    let updated = {
        let mut tests = state.db.tests.write().await;
        let test = tests
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
        if test.owner_teacher_id != teacher_id {
            return Err(AppError::forbidden("access denied", req_id));
        }
        test.title = draft.title;
        test.subject = draft.subject;
        test.submission_mode = draft.submission_mode;
        test.expires_at = draft.expires_at;
        test.questions = draft.questions;
        if let Some(name) = creator_name.filter(|n| !n.trim().is_empty()) {
            test.owner_name = name.trim().to_string();
        }
        test.clone()
    };

    // Existing submissions are graded against the new question set.
    state.db.regrade_test(id).await;
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after update_test: {}", err);
    }
    Ok(Json(updated))
}

pub async fn finish_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<TestRecord>, AppError> {
    let req_id = request_id_from_headers(&headers);
    if !ensure_csrf(&headers, &jar, &state).await {
        return Err(AppError::forbidden("csrf token invalid", req_id));
    }
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;

    let finished = {
        let mut tests = state.db.tests.write().await;
        let test = tests
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
        if test.owner_teacher_id != teacher_id {
            return Err(AppError::forbidden("access denied", req_id));
        }
        if !test.is_active {
            return Err(AppError::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                "test is already finished",
                req_id,
            ));
        }
        test.is_active = false;
        test.finished_at = Some(Utc::now());
        test.clone()
    };
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after finish_test: {}", err);
    }
    Ok(Json(finished))
}

#[derive(Debug, Deserialize)]
pub struct ReactivatePayload {
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn reactivate_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
    Json(payload): Json<ReactivatePayload>,
) -> Result<Json<TestRecord>, AppError> {
    let req_id = request_id_from_headers(&headers);
    if !ensure_csrf(&headers, &jar, &state).await {
        return Err(AppError::forbidden("csrf token invalid", req_id));
    }
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;

    let now = Utc::now();
    if let Some(expires_at) = payload.expires_at {
        if expires_at <= now || expires_at > now + ChronoDuration::days(MAX_EXPIRY_DAYS) {
            return Err(AppError::validation(
                "test validation failed",
                vec![ValidationIssue {
                    field: "expires_at".into(),
                    issue: format!("must be in the future and within {MAX_EXPIRY_DAYS} days"),
                }],
                req_id,
            ));
        }
    }

    let reactivated = {
        let mut tests = state.db.tests.write().await;
        let test = tests
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
        if test.owner_teacher_id != teacher_id {
            return Err(AppError::forbidden("access denied", req_id));
        }
        test.is_active = true;
        test.expires_at = payload.expires_at;
        test.finished_at = None;
        test.clone()
    };
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after reactivate_test: {}", err);
    }
    Ok(Json(reactivated))
}

/// Student-facing test summary: everything needed to decide whether to
/// start, nothing that leaks the answer keys.
#[derive(Debug, Serialize)]
pub struct PublicTestOut {
    pub id: i64,
    pub title: String,
    pub subject: String,
    pub owner_name: String,
    pub access_code: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub question_count: usize,
}

pub async fn test_by_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(access_code): Path<String>,
) -> Result<Json<PublicTestOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let code = access_code.trim().to_uppercase();
    let test_id = state
        .db
        .tests_by_code
        .read()
        .await
        .get(&code)
        .copied()
        .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;

    let mut tests = state.db.tests.write().await;
    let test = tests
        .get_mut(&test_id)
        .ok_or_else(|| AppError::not_found("test not found", req_id))?;
    test.close_if_expired(Utc::now());
    Ok(Json(PublicTestOut {
        id: test.id,
        title: test.title.clone(),
        subject: test.subject.clone(),
        owner_name: test.owner_name.clone(),
        access_code: test.access_code.clone(),
        is_active: test.is_active,
        expires_at: test.expires_at,
        question_count: test.questions.len(),
    }))
}

/// One row of the answer sheet a student fills in: question number, kind,
/// points, the allowed letters for choice questions and the number of
/// expected parts for writing questions. Never the key itself.
#[derive(Debug, Serialize)]
pub struct SheetQuestion {
    pub number: u32,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub points: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<char>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AnswerSheetResponse {
    pub test_id: i64,
    pub title: String,
    pub subject: String,
    pub is_active: bool,
    pub questions: Vec<SheetQuestion>,
}

pub async fn answer_sheet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<AnswerSheetResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let mut tests = state.db.tests.write().await;
    let test = tests
        .get_mut(&id)
        .ok_or_else(|| AppError::not_found("test not found", req_id))?;
    test.close_if_expired(Utc::now());

    let questions = test
        .questions
        .iter()
        .map(|q| SheetQuestion {
            number: q.number,
            kind: q.kind,
            text: q.text.clone(),
            points: q.points,
            choices: match q.kind {
                QuestionKind::Choice => Some(choice_alphabet(q.number).to_vec()),
                _ => None,
            },
            part_count: match (&q.kind, &q.answer) {
                (QuestionKind::Writing, Some(crate::models::AnswerKey::Writing { parts })) => {
                    Some(parts.len())
                }
                (QuestionKind::Writing, _) => Some(1),
                _ => None,
            },
        })
        .collect();

    Ok(Json(AnswerSheetResponse {
        test_id: test.id,
        title: test.title.clone(),
        subject: test.subject.clone(),
        is_active: test.is_active,
        questions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SubmitPayload {
    pub test_id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub answers: AnswerSheet,
}

#[derive(Debug, Serialize)]
pub struct SubmitResult {
    pub submission_id: i64,
    pub student_name: String,
    pub attempt_number: u32,
    pub score: f64,
    pub max_score: f64,
    pub grade: Grade,
}

pub async fn create_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitPayload>,
) -> Result<(StatusCode, Json<SubmitResult>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("submit", client_ip(&headers), 30) {
        return Err(AppError::rate_limited(req_id));
    }
    let student_name = payload.student_name.trim().to_string();
    if student_name.is_empty() {
        return Err(AppError::validation(
            "submission validation failed",
            vec![ValidationIssue { field: "student_name".into(), issue: "must not be empty".into() }],
            req_id,
        ));
    }

    let record = state
        .db
        .create_submission(payload.test_id, payload.student_id, student_name, payload.answers, Utc::now())
        .await
        .map_err(|rejection| match rejection {
            SubmitRejection::TestNotFound => AppError::not_found("test not found", req_id.clone()),
            SubmitRejection::TestClosed => AppError::new(
                StatusCode::CONFLICT,
                "TEST_CLOSED",
                "test is closed or expired",
                req_id.clone(),
            ),
            SubmitRejection::AlreadySubmitted => AppError::new(
                StatusCode::CONFLICT,
                "ALREADY_SUBMITTED",
                "this test accepts a single submission per student",
                req_id.clone(),
            ),
        })?;

    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after submission: {}", err);
    }
    info!(
        test_id = record.test_id,
        submission_id = record.id,
        attempt = record.attempt_number,
        "submission scored"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitResult {
            submission_id: record.id,
            student_name: record.student_name,
            attempt_number: record.attempt_number,
            score: record.score,
            max_score: record.max_score,
            grade: record.grade,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct SubmissionOut {
    pub id: i64,
    pub test_id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub attempt_number: u32,
    pub score: f64,
    pub max_score: f64,
    pub grade: Grade,
    pub manual_awards: BTreeMap<u32, f64>,
    pub submitted_at: DateTime<Utc>,
}

impl From<&SubmissionRecord> for SubmissionOut {
    fn from(record: &SubmissionRecord) -> Self {
        Self {
            id: record.id,
            test_id: record.test_id,
            student_id: record.student_id,
            student_name: record.student_name.clone(),
            attempt_number: record.attempt_number,
            score: record.score,
            max_score: record.max_score,
            grade: record.grade,
            manual_awards: record.manual_awards.clone(),
            submitted_at: record.submitted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmissionListResponse {
    pub items: Vec<SubmissionOut>,
    pub total: usize,
    /// Mean score over each student's latest attempt.
    pub average_score: f64,
    /// Best score over each student's latest attempt.
    pub max_score: f64,
    /// Maximum attainable score for the current question set.
    pub total_points: f64,
}

pub async fn list_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<SubmissionListResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    let total_points = {
        let tests = state.db.tests.read().await;
        let test = tests
            .get(&id)
            .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
        if test.owner_teacher_id != teacher_id {
            return Err(AppError::forbidden("access denied", req_id));
        }
        crate::scoring::max_score(&test.questions)
    };

    let submissions = state.db.submissions.read().await;
    let mut items: Vec<SubmissionOut> = submissions
        .values()
        .filter(|s| s.test_id == id)
        .map(SubmissionOut::from)
        .collect();
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // Aggregates consider only each student's latest attempt.
    let mut latest: HashMap<i64, &SubmissionOut> = HashMap::new();
    for item in &items {
        latest
            .entry(item.student_id)
            .and_modify(|current| {
                if item.attempt_number > current.attempt_number {
                    *current = item;
                }
            })
            .or_insert(item);
    }
    let average_score = if latest.is_empty() {
        0.0
    } else {
        let sum: f64 = latest.values().map(|s| s.score).sum();
        (sum / latest.len() as f64 * 10.0).round() / 10.0
    };
    let max_score = latest.values().map(|s| s.score).fold(0.0, f64::max);

    Ok(Json(SubmissionListResponse {
        total: items.len(),
        items,
        average_score,
        max_score,
        total_points,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReviewPayload {
    pub awards: BTreeMap<u32, f64>,
}

pub async fn review_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
    Json(payload): Json<ReviewPayload>,
) -> Result<Json<SubmissionOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    if !ensure_csrf(&headers, &jar, &state).await {
        return Err(AppError::forbidden("csrf token invalid", req_id));
    }
    let teacher_id = auth_teacher_id(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;

    let test_id = state
        .db
        .submissions
        .read()
        .await
        .get(&id)
        .map(|s| s.test_id)
        .ok_or_else(|| AppError::not_found("submission not found", req_id.clone()))?;

    let questions: Vec<Question> = {
        let tests = state.db.tests.read().await;
        let test = tests
            .get(&test_id)
            .ok_or_else(|| AppError::not_found("test not found", req_id.clone()))?;
        if test.owner_teacher_id != teacher_id {
            return Err(AppError::forbidden("access denied", req_id));
        }
        test.questions.clone()
    };

    let mut issues = Vec::new();
    for (number, awarded) in &payload.awards {
        let target = questions.iter().find(|q| q.number == *number);
        match target {
            Some(q) if q.kind == QuestionKind::Manual => {
                if !awarded.is_finite() || *awarded < 0.0 {
                    issues.push(ValidationIssue {
                        field: format!("awards.{number}"),
                        issue: "must be a non-negative number".into(),
                    });
                }
            }
            Some(_) => issues.push(ValidationIssue {
                field: format!("awards.{number}"),
                issue: "is not a manually graded question".into(),
            }),
            None => issues.push(ValidationIssue {
                field: format!("awards.{number}"),
                issue: "unknown question number".into(),
            }),
        }
    }
    if !issues.is_empty() {
        return Err(AppError::validation("review validation failed", issues, req_id));
    }

    let reviewed = state
        .db
        .review_submission(id, payload.awards)
        .await
        .ok_or_else(|| AppError::not_found("submission not found", req_id))?;
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after review: {}", err);
    }
    Ok(Json(SubmissionOut::from(&reviewed)))
}
