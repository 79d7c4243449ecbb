//! HTTP request handlers.

pub mod health;
pub mod hello;

pub use health::{health_check, readiness};
pub use hello::create_hello;
