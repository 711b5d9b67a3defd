//! Common utilities and shared types for the deviation publisher.
//!
//! This crate provides foundational components used across all publisher crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based identifiers and lease tokens via [`IdGenerator`]
//! - **Logging**: `tracing` subscriber setup via [`logging::init`]
//!
//! # Example
//!
//! ```no_run
//! use publisher_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!     let lease_id = IdGenerator::new().generate_lease_id();
//!     println!("Lease: {lease_id}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod logging;

pub use config::{
    CircuitBreakerSettings, Config, DatabaseConfig, ExecutionLockSettings, QueueConfig,
    RateLimitSettings, RedisConfig,
};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
