pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod scoring;
pub mod state;

pub fn build_state() -> state::AppState {
    state::AppState::new()
}
