use crate::handlers;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_credentials(true)
        .allow_origin([HeaderValue::from_static("http://localhost:3000")])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::COOKIE,
            axum::http::header::SET_COOKIE,
            axum::http::HeaderName::from_static("x-csrf-token"),
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderName::from_static("x-forwarded-for"),
        ]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/auth/register", post(handlers::register))
        .route("/api/v1/auth/login", post(handlers::login))
        .route("/api/v1/auth/logout", post(handlers::logout))
        .route("/api/v1/auth/me", get(handlers::me))
        .route("/api/v1/tests", post(handlers::create_test).get(handlers::list_tests))
        .route("/api/v1/tests/:id", get(handlers::get_test).put(handlers::update_test))
        .route("/api/v1/tests/:id/finish", post(handlers::finish_test))
        .route("/api/v1/tests/:id/reactivate", post(handlers::reactivate_test))
        .route("/api/v1/tests/:id/sheet", get(handlers::answer_sheet))
        .route("/api/v1/tests/:id/submissions", get(handlers::list_submissions))
        .route("/api/v1/tests/code/:access_code", get(handlers::test_by_code))
        .route("/api/v1/submissions", post(handlers::create_submission))
        .route("/api/v1/submissions/:id/review", post(handlers::review_submission))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
