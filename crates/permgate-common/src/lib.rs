//! permgate Common Types and Utilities
//!
//! Shared permission model, engine configuration, and error handling for the
//! permgate authorization engine.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, StorageConfig, StorageType};
pub use error::{Error, Result, TranslationError};
pub use types::{
    Condition, Operation, PermissionCheckResult, PermissionConfig, SecurityContext, UserContext,
};
