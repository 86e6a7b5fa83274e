//! Common types, protocol definitions, and errors shared across the survey keyvault crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
