//! The leaf template language.
//!
//! Leaves are the small strings a prompt template is made of: message
//! contents, slot headers, anchor keys, lane wrappers. They support
//! interpolation and conditional blocks:
//!
//! ```text
//! Hello {{user.name}}!
//! {{#if scene.isNight && !user.nightOwl}}It is late.{{#else}}Good day.{{#endif}}
//! turn_{{item.turnNo}}
//! ```
//!
//! # Architecture
//!
//! ```text
//! "text {{expr}}"  ──▶  leaf parser  ──▶  CompiledLeaf  ──render(scope)──▶  LeafOutput
//!                          │
//!                    expression parser (precedence: || < && < cmp < ! < primary)
//! ```
//!
//! Scopes resolve top-level names through binding frames, the root
//! context, and finally the context's `globals` object.

mod cache;
mod eval;
mod leaf;
mod parser;

pub use cache::LeafCache;
pub use eval::{
    GLOBALS_KEY, Scope, compare, evaluate, evaluate_bool, exists, is_truthy, non_empty,
    sort_order, stringify, walk,
};
pub use leaf::{CompiledLeaf, LeafOutput, compile, is_templated};
pub use parser::{CmpOp, Expr, Path, Segment, SyntaxError, parse_expr};
