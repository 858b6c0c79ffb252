pub mod config;
pub mod deadletter;
pub mod envelope;
pub mod events;
pub mod kafka;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod timeseries;
pub mod validation;
pub mod values;
