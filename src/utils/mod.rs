//! Shared runtime utilities.

pub mod graceful_shutdown;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
