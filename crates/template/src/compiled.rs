//! Compiled template representation.
//!
//! Everything here is immutable after compilation and `Send + Sync`, so a
//! single `Arc<CompiledTemplate>` serves any number of concurrent renders.

use crate::model::{FillDir, Order};
use promptloom_core::Role;
use promptloom_expr::{CmpOp, CompiledLeaf, Expr, Path, Scope, Segment};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug)]
pub struct CompiledTemplate {
    pub id: String,
    pub task: String,
    pub name: String,
    pub version: u32,
    pub layout: Vec<CompiledLayoutNode>,
    /// Slots in layout order. [`CompiledLayoutNode::Slot`] points into this.
    pub slots: Vec<CompiledSlot>,
    /// Indices into `slots`, highest priority first, ties in layout order.
    pub execution_order: Vec<usize>,
    pub lanes: Vec<CompiledLane>,
}

impl CompiledTemplate {
    pub fn slot(&self, name: &str) -> Option<&CompiledSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn lane(&self, id: &str) -> Option<&CompiledLane> {
        self.lanes.iter().find(|l| l.id == id)
    }

    /// Slots in the order they execute.
    pub fn slots_by_priority(&self) -> impl Iterator<Item = &CompiledSlot> {
        self.execution_order.iter().map(|&i| &self.slots[i])
    }
}

#[derive(Debug)]
pub enum CompiledLayoutNode {
    Message(CompiledMessage),
    Slot(CompiledSlotRef),
}

/// A message node, shared by the layout and slot plans.
#[derive(Debug)]
pub struct CompiledMessage {
    pub role: Role,
    pub content: MessageContent,
    pub prefix: bool,
    pub anchor: Option<Arc<CompiledLeaf>>,
    /// Own token cap (plan messages only).
    pub budget: Option<usize>,
}

#[derive(Debug)]
pub enum MessageContent {
    Leaf(Arc<CompiledLeaf>),
    From(CompiledDataRef),
}

#[derive(Debug)]
pub struct CompiledSlotRef {
    pub name: String,
    /// Index into [`CompiledTemplate::slots`].
    pub slot: usize,
    pub header: Option<CompiledFrame>,
    pub footer: Option<CompiledFrame>,
    pub omit_if_empty: bool,
}

/// Header, footer or separator.
#[derive(Debug)]
pub struct CompiledFrame {
    pub role: Role,
    pub content: Arc<CompiledLeaf>,
}

#[derive(Debug)]
pub struct CompiledSlot {
    pub name: String,
    pub priority: i32,
    pub when: Option<CompiledCondition>,
    pub budget: Option<usize>,
    pub plan: Vec<CompiledPlanNode>,
    pub meta: Value,
    /// Position of the referencing node in the layout.
    pub layout_index: usize,
}

#[derive(Debug)]
pub enum CompiledPlanNode {
    Message(CompiledMessage),
    ForEach(CompiledForEach),
    If(CompiledIf),
}

#[derive(Debug)]
pub struct CompiledForEach {
    pub source: CompiledDataRef,
    pub order: Order,
    pub sort_by: Option<Path>,
    pub limit: Option<usize>,
    pub fill_dir: FillDir,
    pub map: Vec<CompiledPlanNode>,
    pub interleave: Option<CompiledFrame>,
    pub budget: Option<usize>,
    pub stop_when_out_of_budget: bool,
}

#[derive(Debug)]
pub struct CompiledIf {
    pub condition: CompiledCondition,
    pub then: Vec<CompiledPlanNode>,
    pub otherwise: Vec<CompiledPlanNode>,
}

/// Where a data reference reads from.
#[derive(Debug)]
pub enum RefTarget {
    /// A registered source; `drill` walks into its result.
    Source { name: String, drill: Vec<Segment> },
    /// A path read from the current scope.
    Scope(Path),
}

#[derive(Debug)]
pub struct CompiledDataRef {
    pub target: RefTarget,
    pub args: ArgValue,
}

/// Resolver arguments with leaf-templated strings precompiled.
#[derive(Debug)]
pub enum ArgValue {
    Literal(Value),
    Leaf(Arc<CompiledLeaf>),
    Array(Vec<ArgValue>),
    Object(Vec<(String, ArgValue)>),
}

impl ArgValue {
    /// Produce the concrete argument value for one scope.
    pub fn materialize(&self, scope: &Scope<'_>) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Leaf(leaf) => Value::String(leaf.render_text(scope)),
            Self::Array(items) => Value::Array(items.iter().map(|a| a.materialize(scope)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, a)| (k.clone(), a.materialize(scope)))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

#[derive(Debug)]
pub enum CompiledCondition {
    Exists(CompiledDataRef),
    NonEmpty(CompiledDataRef),
    Compare {
        target: CompiledDataRef,
        op: CmpOp,
        value: Value,
    },
    Expr(Expr),
    All(Vec<CompiledCondition>),
    Any(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
}

#[derive(Debug)]
pub struct CompiledLane {
    pub id: String,
    pub enabled: bool,
    pub role: Role,
    pub template: Arc<CompiledLeaf>,
    pub order: i32,
    pub groups: Vec<CompiledGroup>,
    pub reserve_tokens: Option<usize>,
}

impl CompiledLane {
    pub fn group(&self, id: &str) -> Option<&CompiledGroup> {
        self.groups.iter().find(|g| g.id == id)
    }
}

#[derive(Debug)]
pub struct CompiledGroup {
    pub id: String,
    pub open: Option<Arc<CompiledLeaf>>,
    pub close: Option<Arc<CompiledLeaf>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_render_leaves_per_scope() {
        let args = ArgValue::Object(vec![
            ("limit".into(), ArgValue::Literal(json!(3))),
            (
                "tags".into(),
                ArgValue::Array(vec![
                    ArgValue::Leaf(Arc::new(promptloom_expr::compile("{{item.tag}}").unwrap())),
                    ArgValue::Literal(json!("fixed")),
                ]),
            ),
        ]);
        let ctx = json!({});
        let scope = Scope::root(&ctx).with("item", json!({"tag": "forest"}));
        assert_eq!(
            args.materialize(&scope),
            json!({"limit": 3, "tags": ["forest", "fixed"]})
        );
    }
}
