//! Configuration: serde models, file loading and validation.

pub mod loader;
pub mod models;
pub mod validation;

pub use models::{AnomalyConfig, AppConfig, EventLogConfig};
pub use validation::{AppConfigValidator, ValidationError};
