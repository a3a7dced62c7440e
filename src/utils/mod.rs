//! Utility modules for common functionality.
//!
//! Logging setup and the injectable clock used by time-based policies.

pub mod clock;
pub mod logger;
