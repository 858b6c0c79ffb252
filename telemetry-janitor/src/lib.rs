pub mod cleanup;
pub mod config;
pub mod dead_letters;
pub mod handlers;
pub mod partitions;
