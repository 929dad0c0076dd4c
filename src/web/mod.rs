//! 推論API（actix-web）

pub mod error;
pub mod handlers;
pub mod models;
pub mod server;

pub use error::ApiError;
pub use server::{configure, cors_headers, start_web_server, AppState};
