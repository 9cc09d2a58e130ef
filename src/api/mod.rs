//! HTTP API.

mod admin;
mod error;
pub mod handlers;

pub use handlers::{create_router, AppState};
