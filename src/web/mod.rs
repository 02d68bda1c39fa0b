//! HTTP adapter over the slicing queue and the job lifecycle.

pub mod api;

pub use api::{AppState, create_router};
