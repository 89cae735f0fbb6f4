//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod memory;
pub mod s3;
pub mod telemetry;
