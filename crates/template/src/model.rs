//! Template data model, the declarative shape authors write.
//!
//! A template is JSON (or anything serde can read into these types):
//!
//! ```json
//! {
//!   "id": "chat", "task": "turn", "name": "Chat", "version": 3,
//!   "layout": [
//!     {"kind": "message", "role": "system", "content": "You are {{char.name}}."},
//!     {"kind": "slot", "name": "timeline", "header": {"role": "system", "content": "History:"}},
//!     {"kind": "message", "role": "assistant", "content": "{{char.name}}:", "prefix": true}
//!   ],
//!   "slots": {
//!     "timeline": {
//!       "priority": 10,
//!       "plan": [{
//!         "kind": "forEach", "source": "turns", "order": "desc", "limit": 40,
//!         "fillDir": "prepend",
//!         "map": [{"kind": "message", "role": "user", "content": "{{item.text}}",
//!                  "anchor": "turn_{{item.turnNo}}"}]
//!       }]
//!     }
//!   }
//! }
//! ```

use promptloom_core::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A prompt template as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,

    /// The workflow task this template renders for.
    #[serde(default)]
    pub task: String,

    pub name: String,

    pub version: u32,

    /// Fixed message skeleton with slot placeholders.
    pub layout: Vec<LayoutNode>,

    /// Generated regions, keyed by the name the layout uses.
    #[serde(default)]
    pub slots: BTreeMap<String, SlotSpec>,

    /// Default attachment lanes; render options override them by id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentLaneSpec>,
}

/// One element of the layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LayoutNode {
    Message(LayoutMessage),
    Slot(LayoutSlot),
}

/// A literal (or data-driven) message in the layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutMessage {
    pub role: Role,

    /// Leaf template for the message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Data reference whose value becomes the message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DataRef>,

    /// Assistant prefix the model continues from.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prefix: bool,

    /// Anchor key recorded at this message's position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

/// A placeholder for a slot's generated messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSlot {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<FrameMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<FrameMessage>,

    /// Drop header and footer when the slot produced nothing (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_if_empty: Option<bool>,
}

/// A header, footer or separator message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMessage {
    #[serde(default = "default_frame_role")]
    pub role: Role,
    pub content: String,
}

fn default_frame_role() -> Role {
    Role::System
}

/// A generated region of the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSpec {
    /// Higher priorities execute first and claim budget first.
    #[serde(default)]
    pub priority: i32,

    /// Skip the slot entirely unless this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ConditionRef>,

    /// Token cap for everything the slot emits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,

    pub plan: Vec<PlanNode>,

    /// Free-form author metadata, carried through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

/// A step of a slot plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlanNode {
    Message(PlanMessage),
    ForEach(ForEachNode),
    If(IfNode),
}

/// Emit one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMessage {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DataRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,
}

/// Iterate over a sequence and run `map` for every item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachNode {
    pub source: DataRef,

    #[serde(default)]
    pub order: Order,

    /// Path (relative to each item) to sort by before `order` applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub fill_dir: FillDir,

    pub map: Vec<PlanNode>,

    /// Separator emitted between consecutive item groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interleave: Option<FrameMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,

    #[serde(default = "default_true")]
    pub stop_when_out_of_budget: bool,
}

fn default_true() -> bool {
    true
}

/// Iteration order over the resolved sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Where each item's messages go relative to earlier items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillDir {
    #[default]
    Append,
    Prepend,
}

/// Run one branch depending on a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfNode {
    pub condition: ConditionRef,

    pub then: Vec<PlanNode>,

    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub otherwise: Vec<PlanNode>,
}

/// A reference to runtime data.
///
/// With a `source`, the registry resolver is called with `args` and `path`
/// drills into its result. Without one, `path` is read from the current
/// scope (`item`, `globals`, the context). A bare string is shorthand for
/// `{"source": "<name>"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DataRefInput")]
pub struct DataRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Resolver arguments; string values may contain leaf syntax.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DataRef {
    pub fn source(name: impl Into<String>) -> Self {
        Self {
            source: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DataRefInput {
    Name(String),
    Full {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        path: Option<String>,
    },
}

impl From<DataRefInput> for DataRef {
    fn from(input: DataRefInput) -> Self {
        match input {
            DataRefInput::Name(name) => DataRef::source(name),
            DataRefInput::Full { source, args, path } => DataRef { source, args, path },
        }
    }
}

/// A condition over runtime data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConditionRef {
    /// The value is present and not null.
    Exists {
        #[serde(rename = "ref")]
        target: DataRef,
    },
    /// The value has content (non-blank text, non-empty collection, ...).
    NonEmpty {
        #[serde(rename = "ref")]
        target: DataRef,
    },
    /// Compare the value against a literal.
    Compare {
        #[serde(rename = "ref")]
        target: DataRef,
        op: CompareOp,
        value: Value,
    },
    /// A leaf expression such as `item.role == 'user' && !item.hidden`.
    Expr { expr: String },
    All { conditions: Vec<ConditionRef> },
    Any { conditions: Vec<ConditionRef> },
    Not { condition: Box<ConditionRef> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// An injection lane: how requests for one lane are rendered and budgeted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentLaneSpec {
    pub id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub role: Role,

    /// Leaf rendered per request against `{payload, lane, request}`.
    pub template: String,

    /// Lanes are processed in ascending order.
    #[serde(default)]
    pub order: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<LaneGroupSpec>,

    /// Tokens held back for this lane before any slot runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_tokens: Option<usize>,
}

/// Wrapper text placed once around all requests sharing a group id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneGroupSpec {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<String>,
}
