#![forbid(unsafe_code)]

//! Harbor application bootstrap wiring.
//!
//! Layout: `config.rs` (TOML daemon configuration), `bootstrap.rs` (service
//! wiring and the shutdown signal loop), `telemetry.rs` (tracing setup).

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod telemetry;

pub use bootstrap::run_app;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
