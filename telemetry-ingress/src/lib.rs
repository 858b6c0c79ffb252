pub mod adapter;
pub mod api;
pub mod auth;
pub mod config;
pub mod endpoint;
pub mod limiter;
pub mod mqtt;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
