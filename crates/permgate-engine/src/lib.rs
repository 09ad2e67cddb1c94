//! permgate Permission Engine
//!
//! Compiles declarative permission configuration into runtime rules and
//! enforces them at three points:
//! - **Guard**: allow/deny decisions for object, field and record access
//! - **Trimmer**: row-level security and record-rule filters injected into queries
//! - **Masker**: field removal and value masking on results
//!
//! [`PermissionEngine`] ties them to a configuration store and exposes the
//! pre-query, pre-mutation and post-query hooks a data layer calls.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod bitmask;
pub mod cache;
pub mod compiler;
pub mod engine;
pub mod expr;
pub mod filter;
pub mod formula;
pub mod guard;
pub mod hooks;
pub mod loader;
pub mod mask;
pub mod masker;
pub mod trimmer;

pub use audit::{AuditEntry, AuditLog};
pub use bitmask::{ObjectPermissions, RecordPermissions};
pub use cache::{CacheKey, CacheStats, PermissionCache};
pub use compiler::{CompiledPermissionRule, CompiledRules, PermissionBitmask, RuleCompiler};
pub use engine::PermissionEngine;
pub use expr::Formula;
pub use filter::{Filter, FilterOp, Query, ResidualClause};
pub use formula::formula_to_filter;
pub use guard::PermissionGuard;
pub use hooks::{MutationHookContext, QueryHookContext, QueryOutput, ResultHookContext};
pub use loader::PermissionLoader;
pub use mask::mask_value;
pub use masker::FieldMasker;
pub use trimmer::{condition_to_filter, QueryTrimmer, TranslationMode};
