//! Budget-aware rendering of compiled prompt templates.
//!
//! A render turns a [`CompiledTemplate`](promptloom_template::CompiledTemplate),
//! a JSON context and a token budget into an ordered list of chat
//! [`Message`](promptloom_core::Message)s:
//!
//! - mandatory layout content is reserved first ([`assembler`])
//! - slots fill what is left in priority order ([`executor`])
//! - attachment lanes are injected at anchors or boundaries ([`injection`])
//!
//! Every render owns its [`Budget`]; compiled templates and the source
//! registry are shared read-only, so concurrent renders need no locking.

pub mod assembler;
pub mod budget;
pub mod executor;
pub mod injection;
pub mod renderer;
pub mod report;
pub mod resolve;
pub mod token;

pub use assembler::{Anchor, AnchorSource, LayoutAssembler, Placed, PreparedLayout};
pub use budget::{Budget, Checkpoint, Exhausted, GLOBAL_LEVEL};
pub use executor::{Emitted, PlanExecutor, SlotBuffer};
pub use injection::{BoundaryPosition, InjectionRequest, InjectionTarget, inject, resolve_position};
pub use renderer::{
    RenderOptions, RenderOptionsSpec, RenderOutput, Renderer, render, render_detailed,
};
pub use report::{DropInfo, LaneStats, RenderReport, SlotStats};
pub use resolve::Resolver;
pub use token::{CharRatioEstimator, estimate_tokens};
