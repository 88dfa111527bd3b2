pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod services;
