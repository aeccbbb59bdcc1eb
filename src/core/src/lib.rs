//! Shared types for imgcd.

pub mod error;

pub use error::{Error, Result};
