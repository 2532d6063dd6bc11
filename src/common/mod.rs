pub mod metrics;
pub mod types;
