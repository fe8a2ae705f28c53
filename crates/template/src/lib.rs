#![recursion_limit = "256"]
//! Prompt templates: the authored model, its JSON schema, and the compiler.
//!
//! ```text
//! JSON ──validate_template──▶ serde ──▶ Template ──TemplateCompiler──▶ CompiledTemplate
//!                                                        │
//!                                                   LeafCache (shared leaves)
//! ```
//!
//! A [`CompiledTemplate`] is immutable and meant to be wrapped in an `Arc`
//! (see [`TemplateCache`]) and rendered many times.

pub mod cache;
pub mod compiled;
pub mod compiler;
pub mod model;
pub mod schema;

pub use cache::TemplateCache;
pub use compiled::{
    ArgValue, CompiledCondition, CompiledDataRef, CompiledForEach, CompiledFrame, CompiledGroup,
    CompiledIf, CompiledLane, CompiledLayoutNode, CompiledMessage, CompiledPlanNode, CompiledSlot,
    CompiledSlotRef, CompiledTemplate, MessageContent, RefTarget,
};
pub use compiler::{TemplateCompiler, compile_lane};
pub use model::{
    AttachmentLaneSpec, CompareOp, ConditionRef, DataRef, FillDir, ForEachNode, FrameMessage,
    IfNode, LaneGroupSpec, LayoutMessage, LayoutNode, LayoutSlot, Order, PlanMessage, PlanNode,
    SlotSpec, Template,
};
pub use schema::{template_schema, validate_template};
