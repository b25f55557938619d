pub mod app;
pub mod canonical;
pub mod codex_auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod router;
pub mod sse;
pub mod upstream;
pub mod usage;
