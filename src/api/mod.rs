//! HTTP surface consumed by the UI/ops layer
//!
//! Request/response DTOs, bearer-secret auth gates, and the axum router.

pub mod auth;
pub mod http;
pub mod types;

pub use http::{router, start_http, AppState};
