pub mod audit;
pub mod backoff;
pub mod error;
pub mod hex;
pub mod telemetry;
