//! Base types and error handling.

pub mod error;

pub use error::{ConfigViolations, GatherError};
