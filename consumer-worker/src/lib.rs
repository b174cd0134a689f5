pub mod config;
pub mod handler;
pub mod metrics;
