//! # promptloom core
//!
//! Domain types, traits, and error definitions shared by every promptloom
//! crate. Nothing in here knows how a template is compiled or rendered; it
//! only defines the vocabulary the other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every pluggable collaborator is a trait here:
//! - [`DataSource`] resolves named data for slots and conditions
//! - [`TokenEstimator`] prices text for the budget ledger
//!
//! Implementations live with their callers, or in the host application.

pub mod error;
pub mod estimator;
pub mod message;
pub mod source;

// Re-export key types at crate root for ergonomics
pub use error::{CompileError, Error, ExprError, RenderError, Result, SchemaError, SchemaViolation};
pub use estimator::TokenEstimator;
pub use message::{Message, Role};
pub use source::{DataSource, FnSource, SourceRegistry};
