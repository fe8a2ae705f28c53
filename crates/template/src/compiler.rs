//! Template compiler.
//!
//! Turns an authored [`Template`] into a [`CompiledTemplate`]: every leaf
//! string is compiled (through the compiler-owned [`LeafCache`]), data
//! references and conditions are parsed, and the structural rules are
//! checked. All problems are collected and reported together.

use crate::compiled::*;
use crate::model::*;
use crate::schema::validate_template;
use promptloom_core::{CompileError, Error, ExprError, Role};
use promptloom_expr::{CmpOp, CompiledLeaf, LeafCache, Path, Segment, is_templated, parse_expr};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Compiles templates, caching leaves across compilations.
#[derive(Debug, Default)]
pub struct TemplateCompiler {
    leaves: LeafCache,
    allowed_sources: Option<BTreeSet<String>>,
}

impl TemplateCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject data references to sources outside this allowlist.
    pub fn with_allowed_sources<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_sources = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn leaf_cache(&self) -> &LeafCache {
        &self.leaves
    }

    /// Compile a deserialized template.
    pub fn compile(&self, template: &Template) -> Result<CompiledTemplate, CompileError> {
        self.compile_inner(template, self.allowed_sources.as_ref())
    }

    /// Compile against an explicit source allowlist (lint mode).
    pub fn compile_with_sources(
        &self,
        template: &Template,
        sources: &[&str],
    ) -> Result<CompiledTemplate, CompileError> {
        let allowed: BTreeSet<String> = sources.iter().map(|s| s.to_string()).collect();
        self.compile_inner(template, Some(&allowed))
    }

    /// Validate raw JSON against the schema, then deserialize and compile.
    pub fn compile_value(&self, raw: &Value) -> Result<CompiledTemplate, Error> {
        validate_template(raw)?;
        let template: Template = serde_json::from_value(raw.clone())?;
        Ok(self.compile(&template)?)
    }

    pub fn compile_json(&self, text: &str) -> Result<CompiledTemplate, Error> {
        let raw: Value = serde_json::from_str(text)?;
        self.compile_value(&raw)
    }

    fn compile_inner(
        &self,
        template: &Template,
        allowed: Option<&BTreeSet<String>>,
    ) -> Result<CompiledTemplate, CompileError> {
        let mut pass = Pass {
            leaves: &self.leaves,
            allowed,
            issues: Vec::new(),
            anchors: HashMap::new(),
        };

        // Map slot names to their layout position first so layout nodes can
        // point at the compiled slot by index.
        let mut slot_positions: Vec<(&str, usize)> = Vec::new();
        let mut seen_refs: HashSet<&str> = HashSet::new();
        for (index, node) in template.layout.iter().enumerate() {
            if let LayoutNode::Slot(slot) = node {
                if !template.slots.contains_key(&slot.name) {
                    pass.issues.push(CompileError::UnknownSlot {
                        name: slot.name.clone(),
                    });
                } else if !seen_refs.insert(&slot.name) {
                    pass.issues.push(CompileError::DuplicateSlotReference {
                        name: slot.name.clone(),
                    });
                } else {
                    slot_positions.push((&slot.name, index));
                }
            }
        }
        for name in template.slots.keys() {
            if !seen_refs.contains(name.as_str()) {
                pass.issues
                    .push(CompileError::UnreferencedSlot { name: name.clone() });
            }
        }

        let mut layout = Vec::with_capacity(template.layout.len());
        for (index, node) in template.layout.iter().enumerate() {
            let location = format!("layout[{index}]");
            match node {
                LayoutNode::Message(msg) => {
                    let compiled = pass.message(
                        MessageParts {
                            role: msg.role,
                            content: msg.content.as_deref(),
                            from: msg.from.as_ref(),
                            prefix: msg.prefix,
                            anchor: msg.anchor.as_deref(),
                            budget: None,
                        },
                        &location,
                        false,
                    );
                    if let Some(m) = compiled {
                        layout.push(CompiledLayoutNode::Message(m));
                    }
                }
                LayoutNode::Slot(slot) => {
                    let Some(slot_index) = slot_positions.iter().position(|(_, i)| *i == index)
                    else {
                        continue;
                    };
                    let header = slot
                        .header
                        .as_ref()
                        .and_then(|f| pass.frame(f, &format!("{location}.header")));
                    let footer = slot
                        .footer
                        .as_ref()
                        .and_then(|f| pass.frame(f, &format!("{location}.footer")));
                    layout.push(CompiledLayoutNode::Slot(CompiledSlotRef {
                        name: slot.name.clone(),
                        slot: slot_index,
                        header,
                        footer,
                        omit_if_empty: slot.omit_if_empty != Some(false),
                    }));
                }
            }
        }

        let mut slots = Vec::with_capacity(slot_positions.len());
        for (name, layout_index) in &slot_positions {
            let Some(spec) = template.slots.get(*name) else {
                continue;
            };
            let location = format!("slots.{name}");
            let when = spec
                .when
                .as_ref()
                .and_then(|c| pass.condition(c, &format!("{location}.when")));
            let plan = pass.plan(&spec.plan, &format!("{location}.plan"), false);
            slots.push(CompiledSlot {
                name: name.to_string(),
                priority: spec.priority,
                when,
                budget: spec.budget,
                plan,
                meta: spec.meta.clone(),
                layout_index: *layout_index,
            });
        }

        let mut lanes = Vec::with_capacity(template.attachments.len());
        let mut lane_ids = HashSet::new();
        for (index, lane) in template.attachments.iter().enumerate() {
            if !lane_ids.insert(lane.id.as_str()) {
                pass.issues
                    .push(CompileError::DuplicateLane { id: lane.id.clone() });
                continue;
            }
            if let Some(compiled) = pass.lane(lane, &format!("attachments[{index}]")) {
                lanes.push(compiled);
            }
        }

        if let Some(err) = CompileError::from_issues(pass.issues) {
            debug!(template = %template.id, "template failed to compile");
            return Err(err);
        }

        let mut execution_order: Vec<usize> = (0..slots.len()).collect();
        execution_order.sort_by(|&a, &b| {
            slots[b]
                .priority
                .cmp(&slots[a].priority)
                .then(slots[a].layout_index.cmp(&slots[b].layout_index))
        });

        debug!(
            template = %template.id,
            version = template.version,
            slots = slots.len(),
            lanes = lanes.len(),
            "template compiled"
        );

        Ok(CompiledTemplate {
            id: template.id.clone(),
            task: template.task.clone(),
            name: template.name.clone(),
            version: template.version,
            layout,
            slots,
            execution_order,
            lanes,
        })
    }
}

/// Compile a lane supplied at render time (not through a template).
pub fn compile_lane(lane: &AttachmentLaneSpec) -> Result<CompiledLane, CompileError> {
    let leaves = LeafCache::new();
    let mut pass = Pass {
        leaves: &leaves,
        allowed: None,
        issues: Vec::new(),
        anchors: HashMap::new(),
    };
    let compiled = pass.lane(lane, &format!("lane '{}'", lane.id));
    match (CompileError::from_issues(pass.issues), compiled) {
        (Some(err), _) => Err(err),
        (None, Some(lane)) => Ok(lane),
        (None, None) => Err(CompileError::Invalid {
            location: format!("lane '{}'", lane.id),
            reason: "lane could not be compiled".into(),
        }),
    }
}

struct MessageParts<'t> {
    role: Role,
    content: Option<&'t str>,
    from: Option<&'t DataRef>,
    prefix: bool,
    anchor: Option<&'t str>,
    budget: Option<usize>,
}

/// One compilation: collects issues instead of stopping at the first.
struct Pass<'c> {
    leaves: &'c LeafCache,
    allowed: Option<&'c BTreeSet<String>>,
    issues: Vec<CompileError>,
    /// Static anchor key → where it was first declared.
    anchors: HashMap<String, String>,
}

impl Pass<'_> {
    fn leaf(&mut self, text: &str, location: &str) -> Option<Arc<CompiledLeaf>> {
        match self.leaves.get_or_compile(text) {
            Ok(leaf) => Some(leaf),
            Err(source) => {
                self.issues.push(CompileError::Leaf {
                    location: location.to_string(),
                    source,
                });
                None
            }
        }
    }

    fn frame(&mut self, frame: &FrameMessage, location: &str) -> Option<CompiledFrame> {
        let content = self.leaf(&frame.content, location)?;
        Some(CompiledFrame {
            role: frame.role,
            content,
        })
    }

    fn message(
        &mut self,
        parts: MessageParts<'_>,
        location: &str,
        in_loop: bool,
    ) -> Option<CompiledMessage> {
        if parts.prefix && parts.role != Role::Assistant {
            self.issues.push(CompileError::PrefixOnNonAssistant {
                location: location.to_string(),
                role: parts.role.to_string(),
            });
        }

        let content = match (parts.content, parts.from) {
            (Some(_), Some(_)) => {
                self.issues.push(CompileError::ContentAndFrom {
                    location: location.to_string(),
                });
                None
            }
            (None, None) => {
                self.issues.push(CompileError::MissingContent {
                    location: location.to_string(),
                });
                None
            }
            (Some(text), None) => self
                .leaf(text, &format!("{location}.content"))
                .map(MessageContent::Leaf),
            (None, Some(from)) => self
                .data_ref(from, &format!("{location}.from"))
                .map(MessageContent::From),
        };

        let anchor = match parts.anchor {
            Some(key) => Some(self.anchor(key, &format!("{location}.anchor"), in_loop)?),
            None => None,
        };

        Some(CompiledMessage {
            role: parts.role,
            content: content?,
            prefix: parts.prefix,
            anchor,
            budget: parts.budget,
        })
    }

    fn anchor(
        &mut self,
        key: &str,
        location: &str,
        in_loop: bool,
    ) -> Option<Arc<CompiledLeaf>> {
        let leaf = self.leaf(key, location)?;
        if !leaf.has_variables() {
            if in_loop {
                self.issues.push(CompileError::StaticAnchorInLoop {
                    key: key.to_string(),
                    location: location.to_string(),
                });
                return None;
            }
            if self.anchors.contains_key(key) {
                self.issues.push(CompileError::DuplicateAnchor {
                    key: key.to_string(),
                    location: location.to_string(),
                });
                return None;
            }
            self.anchors.insert(key.to_string(), location.to_string());
        }
        Some(leaf)
    }

    fn plan(&mut self, nodes: &[PlanNode], location: &str, in_loop: bool) -> Vec<CompiledPlanNode> {
        let mut compiled = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            let here = format!("{location}[{index}]");
            let node = match node {
                PlanNode::Message(msg) => self
                    .message(
                        MessageParts {
                            role: msg.role,
                            content: msg.content.as_deref(),
                            from: msg.from.as_ref(),
                            prefix: false,
                            anchor: msg.anchor.as_deref(),
                            budget: msg.budget,
                        },
                        &here,
                        in_loop,
                    )
                    .map(CompiledPlanNode::Message),
                PlanNode::ForEach(each) => self.for_each(each, &here).map(CompiledPlanNode::ForEach),
                PlanNode::If(node) => {
                    let condition = self.condition(&node.condition, &format!("{here}.condition"));
                    let then = self.plan(&node.then, &format!("{here}.then"), in_loop);
                    let otherwise = self.plan(&node.otherwise, &format!("{here}.else"), in_loop);
                    condition.map(|condition| {
                        CompiledPlanNode::If(CompiledIf {
                            condition,
                            then,
                            otherwise,
                        })
                    })
                }
            };
            compiled.extend(node);
        }
        compiled
    }

    fn for_each(&mut self, each: &ForEachNode, location: &str) -> Option<CompiledForEach> {
        let source = self.data_ref(&each.source, &format!("{location}.source"));
        let sort_by = match &each.sort_by {
            Some(path) => Some(self.path(path, &format!("{location}.sortBy"))?),
            None => None,
        };
        let map = self.plan(&each.map, &format!("{location}.map"), true);
        let interleave = each
            .interleave
            .as_ref()
            .and_then(|f| self.frame(f, &format!("{location}.interleave")));

        Some(CompiledForEach {
            source: source?,
            order: each.order,
            sort_by,
            limit: each.limit,
            fill_dir: each.fill_dir,
            map,
            interleave,
            budget: each.budget,
            stop_when_out_of_budget: each.stop_when_out_of_budget,
        })
    }

    fn path(&mut self, path: &str, location: &str) -> Option<Path> {
        match Path::parse(path) {
            Ok(p) => Some(p),
            Err(e) => {
                self.issues.push(CompileError::Leaf {
                    location: location.to_string(),
                    source: ExprError::Syntax {
                        offset: e.offset,
                        snippet: path.to_string(),
                        reason: e.reason,
                    },
                });
                None
            }
        }
    }

    fn data_ref(&mut self, r: &DataRef, location: &str) -> Option<CompiledDataRef> {
        let args = self.args(&r.args, &format!("{location}.args"));
        let target = match (&r.source, &r.path) {
            (Some(name), path) => {
                if let Some(allowed) = self.allowed
                    && !allowed.contains(name)
                {
                    self.issues.push(CompileError::UnknownSource {
                        name: name.clone(),
                        location: location.to_string(),
                    });
                }
                let drill = match path {
                    Some(p) => {
                        let parsed = self.path(p, &format!("{location}.path"))?;
                        let mut drill = vec![Segment::Key(parsed.head)];
                        drill.extend(parsed.segments);
                        drill
                    }
                    None => Vec::new(),
                };
                RefTarget::Source {
                    name: name.clone(),
                    drill,
                }
            }
            (None, Some(p)) => RefTarget::Scope(self.path(p, &format!("{location}.path"))?),
            (None, None) => {
                self.issues.push(CompileError::Invalid {
                    location: location.to_string(),
                    reason: "data reference needs a `source` or a `path`".into(),
                });
                return None;
            }
        };
        Some(CompiledDataRef { target, args })
    }

    fn args(&mut self, value: &Value, location: &str) -> ArgValue {
        match value {
            Value::String(s) if is_templated(s) => match self.leaf(s, location) {
                Some(leaf) => ArgValue::Leaf(leaf),
                None => ArgValue::Literal(Value::Null),
            },
            Value::Array(items) => ArgValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.args(v, &format!("{location}[{i}]")))
                    .collect(),
            ),
            Value::Object(fields) => ArgValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), self.args(v, &format!("{location}.{k}"))))
                    .collect(),
            ),
            other => ArgValue::Literal(other.clone()),
        }
    }

    fn condition(&mut self, cond: &ConditionRef, location: &str) -> Option<CompiledCondition> {
        Some(match cond {
            ConditionRef::Exists { target } => {
                CompiledCondition::Exists(self.data_ref(target, &format!("{location}.ref"))?)
            }
            ConditionRef::NonEmpty { target } => {
                CompiledCondition::NonEmpty(self.data_ref(target, &format!("{location}.ref"))?)
            }
            ConditionRef::Compare { target, op, value } => CompiledCondition::Compare {
                target: self.data_ref(target, &format!("{location}.ref"))?,
                op: match op {
                    CompareOp::Eq => CmpOp::Eq,
                    CompareOp::Ne => CmpOp::NotEq,
                    CompareOp::Lt => CmpOp::Lt,
                    CompareOp::Lte => CmpOp::Lte,
                    CompareOp::Gt => CmpOp::Gt,
                    CompareOp::Gte => CmpOp::Gte,
                },
                value: value.clone(),
            },
            ConditionRef::Expr { expr } => match parse_expr(expr) {
                Ok(parsed) => CompiledCondition::Expr(parsed),
                Err(e) => {
                    self.issues.push(CompileError::Leaf {
                        location: format!("{location}.expr"),
                        source: ExprError::Syntax {
                            offset: e.offset,
                            snippet: expr.clone(),
                            reason: e.reason,
                        },
                    });
                    return None;
                }
            },
            ConditionRef::All { conditions } => {
                CompiledCondition::All(self.conditions(conditions, location)?)
            }
            ConditionRef::Any { conditions } => {
                CompiledCondition::Any(self.conditions(conditions, location)?)
            }
            ConditionRef::Not { condition } => CompiledCondition::Not(Box::new(
                self.condition(condition, &format!("{location}.condition"))?,
            )),
        })
    }

    fn conditions(&mut self, conds: &[ConditionRef], location: &str) -> Option<Vec<CompiledCondition>> {
        let compiled: Vec<_> = conds
            .iter()
            .enumerate()
            .map(|(i, c)| self.condition(c, &format!("{location}.conditions[{i}]")))
            .collect();
        compiled.into_iter().collect()
    }

    fn lane(&mut self, lane: &AttachmentLaneSpec, location: &str) -> Option<CompiledLane> {
        let template = self.leaf(&lane.template, &format!("{location}.template"));
        let mut groups = Vec::with_capacity(lane.groups.len());
        let mut group_ids = HashSet::new();
        for (index, group) in lane.groups.iter().enumerate() {
            let here = format!("{location}.groups[{index}]");
            if !group_ids.insert(group.id.as_str()) {
                self.issues.push(CompileError::Invalid {
                    location: here,
                    reason: format!("duplicate group id '{}'", group.id),
                });
                continue;
            }
            let open = group
                .open
                .as_ref()
                .and_then(|s| self.leaf(s, &format!("{here}.open")));
            let close = group
                .close
                .as_ref()
                .and_then(|s| self.leaf(s, &format!("{here}.close")));
            groups.push(CompiledGroup {
                id: group.id.clone(),
                open,
                close,
            });
        }
        Some(CompiledLane {
            id: lane.id.clone(),
            enabled: lane.enabled,
            role: lane.role,
            template: template?,
            order: lane.order,
            groups,
            reserve_tokens: lane.reserve_tokens,
        })
    }
}
