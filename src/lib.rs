pub mod config;
pub mod contracts;
pub mod errors;
pub mod telemetry;
