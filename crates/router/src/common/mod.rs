//! Common types and utilities shared between the router core and its listeners
pub mod error;
pub mod types;
pub mod validation;

pub use error::{Result, RouterError};
pub use types::*;
pub use validation::{ValidateConfig, validators};
