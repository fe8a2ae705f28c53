//! Layout assembly, the two-phase core of a render.
//!
//! **Phase A** (`prepare`): render every literal layout message and every
//! slot header/footer, and reserve their cost as floors. Mandatory content
//! is priced before any slot spends shared budget.
//!
//! **Slots** (`execute_slots`): run in descending priority (ties in layout
//! order). As soon as a slot turns out empty, the floors of its header and
//! footer are released so lower-priority slots can use that capacity.
//!
//! **Phase B** (`assemble`): walk the layout in order, emitting literal
//! messages and splicing slot buffers between their header and footer.
//!
//! # Determinism
//!
//! Assembly is deterministic: identical template, context, budget and
//! estimator always produce identical output.

use crate::budget::Budget;
use crate::executor::{PlanExecutor, SlotBuffer, render_content};
use crate::resolve::Resolver;
use promptloom_core::{Message, RenderError, Role};
use promptloom_expr::Scope;
use promptloom_template::{CompiledFrame, CompiledLayoutNode, CompiledTemplate};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ── Types ─────────────────────────────────────────────────────────────────

/// Where an anchor came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum AnchorSource {
    Layout,
    Slot {
        #[serde(rename = "slotName")]
        slot_name: String,
    },
}

/// A named position in the final message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub key: String,
    pub index: usize,
    #[serde(flatten)]
    pub source: AnchorSource,
}

/// Anchor key attached to a placed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorMark {
    pub key: String,
    pub source: AnchorSource,
}

/// A message in the assembled output, with the anchor that marks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placed {
    pub message: Message,
    pub anchor: Option<AnchorMark>,
}

impl Placed {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            anchor: None,
        }
    }
}

/// Mandatory text rendered during Phase A, with its floor key.
#[derive(Debug, Clone)]
struct Frame {
    role: Role,
    text: String,
    floor: String,
}

#[derive(Debug)]
enum PreparedNode {
    Message {
        frame: Frame,
        prefix: bool,
        anchor: Option<String>,
    },
    /// Rendered to whitespace; nothing to emit.
    Omitted,
    Slot {
        name: String,
        slot: usize,
        omit_if_empty: bool,
        header: Option<Frame>,
        footer: Option<Frame>,
    },
}

/// The output of Phase A.
#[derive(Debug)]
pub struct PreparedLayout {
    nodes: Vec<PreparedNode>,
    floor_tokens: usize,
}

impl PreparedLayout {
    /// Tokens reserved for mandatory layout content.
    pub fn floor_tokens(&self) -> usize {
        self.floor_tokens
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct LayoutAssembler<'t, 'r> {
    template: &'t CompiledTemplate,
    resolver: Resolver<'r>,
}

impl<'t, 'r> LayoutAssembler<'t, 'r> {
    pub fn new(template: &'t CompiledTemplate, resolver: Resolver<'r>) -> Self {
        Self { template, resolver }
    }

    /// Phase A: render mandatory layout content and reserve it.
    pub fn prepare(&self, budget: &mut Budget) -> PreparedLayout {
        let root = Scope::root(self.resolver.context());
        let mut nodes = Vec::with_capacity(self.template.layout.len());
        let mut floor_tokens = 0;

        for (index, node) in self.template.layout.iter().enumerate() {
            let prepared = match node {
                CompiledLayoutNode::Message(message) => {
                    let rendered = render_content(&self.resolver, &message.content, &root);
                    if rendered.contentful {
                        let anchor = message
                            .anchor
                            .as_ref()
                            .map(|key| key.render_text(&root))
                            .filter(|key| !key.trim().is_empty());
                        PreparedNode::Message {
                            frame: Frame {
                                role: message.role,
                                text: rendered.text,
                                floor: format!("layout[{index}]"),
                            },
                            prefix: message.prefix,
                            anchor,
                        }
                    } else {
                        debug!(index, "layout message rendered empty, omitted");
                        PreparedNode::Omitted
                    }
                }
                CompiledLayoutNode::Slot(slot) => PreparedNode::Slot {
                    name: slot.name.clone(),
                    slot: slot.slot,
                    omit_if_empty: slot.omit_if_empty,
                    header: slot
                        .header
                        .as_ref()
                        .and_then(|f| render_frame(f, &root, format!("layout[{index}].header"))),
                    footer: slot
                        .footer
                        .as_ref()
                        .and_then(|f| render_frame(f, &root, format!("layout[{index}].footer"))),
                },
            };

            let frames: Vec<&Frame> = match &prepared {
                PreparedNode::Message { frame, .. } => vec![frame],
                PreparedNode::Slot { header, footer, .. } => {
                    header.iter().chain(footer.iter()).collect()
                }
                PreparedNode::Omitted => Vec::new(),
            };
            for frame in frames {
                let tokens = budget.estimate(&frame.text);
                budget.reserve_floor(frame.floor.clone(), tokens);
                floor_tokens += tokens;
            }
            nodes.push(prepared);
        }

        debug!(floor_tokens, "layout floor reserved");
        PreparedLayout {
            nodes,
            floor_tokens,
        }
    }

    /// Run every slot in priority order. The result is indexed like
    /// [`CompiledTemplate::slots`].
    pub fn execute_slots(
        &self,
        prepared: &PreparedLayout,
        budget: &mut Budget,
    ) -> Vec<Option<SlotBuffer>> {
        let executor = PlanExecutor::new(self.resolver);
        let mut buffers: Vec<Option<SlotBuffer>> = Vec::new();
        buffers.resize_with(self.template.slots.len(), || None);

        for &slot_index in &self.template.execution_order {
            let slot = &self.template.slots[slot_index];
            let buffer = executor.execute_slot(slot, budget);

            if buffer.is_empty() {
                let frames = prepared.nodes.iter().find_map(|node| match node {
                    PreparedNode::Slot {
                        slot,
                        omit_if_empty: true,
                        header,
                        footer,
                        ..
                    } if *slot == slot_index => Some((header, footer)),
                    _ => None,
                });
                if let Some((header, footer)) = frames {
                    for frame in header.iter().chain(footer.iter()) {
                        budget.release_floor(&frame.floor);
                    }
                }
            }
            buffers[slot_index] = Some(buffer);
        }
        buffers
    }

    /// Phase B: walk the layout and emit messages in order.
    pub fn assemble(
        &self,
        prepared: PreparedLayout,
        buffers: &mut [Option<SlotBuffer>],
        budget: &mut Budget,
    ) -> Result<Vec<Placed>, RenderError> {
        let mut placed = Vec::new();

        for node in prepared.nodes {
            match node {
                PreparedNode::Omitted => {}
                PreparedNode::Message {
                    frame,
                    prefix,
                    anchor,
                } => {
                    budget.consume_floor(&frame.floor, &frame.text);
                    let mut message = Message::new(frame.role, frame.text);
                    message.prefix = prefix;
                    placed.push(Placed {
                        message,
                        anchor: anchor.map(|key| AnchorMark {
                            key,
                            source: AnchorSource::Layout,
                        }),
                    });
                }
                PreparedNode::Slot {
                    name,
                    slot,
                    omit_if_empty,
                    header,
                    footer,
                } => {
                    let buffer = buffers
                        .get_mut(slot)
                        .and_then(Option::take)
                        .ok_or_else(|| RenderError::MissingSlotBuffer { slot: name.clone() })?;

                    if buffer.is_empty() && omit_if_empty {
                        debug!(slot = %name, "empty slot omitted");
                        continue;
                    }

                    if let Some(frame) = header {
                        placed.push(emit_frame(frame, budget));
                    }
                    placed.extend(buffer.entries.into_iter().map(|entry| Placed {
                        message: entry.message,
                        anchor: entry.anchor.map(|key| AnchorMark {
                            key,
                            source: AnchorSource::Slot {
                                slot_name: name.clone(),
                            },
                        }),
                    }));
                    if let Some(frame) = footer {
                        placed.push(emit_frame(frame, budget));
                    }
                }
            }
        }
        Ok(placed)
    }
}

fn render_frame(frame: &CompiledFrame, scope: &Scope<'_>, floor: String) -> Option<Frame> {
    let rendered = frame.content.render(scope);
    rendered.contentful.then(|| Frame {
        role: frame.role,
        text: rendered.text,
        floor,
    })
}

fn emit_frame(frame: Frame, budget: &mut Budget) -> Placed {
    budget.consume_floor(&frame.floor, &frame.text);
    Placed::new(Message::new(frame.role, frame.text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::SourceRegistry;
    use promptloom_template::{Template, TemplateCompiler};
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn compile(raw: Value) -> CompiledTemplate {
        let template: Template = serde_json::from_value(raw).unwrap();
        TemplateCompiler::new().compile(&template).unwrap()
    }

    fn per_char(max: usize) -> Budget {
        Budget::new(max, Arc::new(|text: &str| text.chars().count()))
    }

    fn run(template: &CompiledTemplate, ctx: &Value, budget: &mut Budget) -> Vec<Placed> {
        let registry = SourceRegistry::new().with_fn("turns", |ctx, _| ctx["turns"].clone());
        let assembler = LayoutAssembler::new(template, Resolver::new(&registry, ctx));
        let prepared = assembler.prepare(budget);
        let mut buffers = assembler.execute_slots(&prepared, budget);
        assembler.assemble(prepared, &mut buffers, budget).unwrap()
    }

    fn texts(placed: &[Placed]) -> Vec<&str> {
        placed.iter().map(|p| p.message.content.as_str()).collect()
    }

    fn chat(omit: Option<bool>) -> Value {
        let mut slot = json!({
            "kind": "slot", "name": "timeline",
            "header": {"content": "[history]"}, "footer": {"content": "[end]"}
        });
        if let Some(omit) = omit {
            slot["omitIfEmpty"] = json!(omit);
        }
        json!({
            "id": "chat", "name": "Chat", "version": 1,
            "layout": [
                {"kind": "message", "role": "system", "content": "Intro", "anchor": "intro"},
                slot,
                {"kind": "message", "role": "user", "content": "{{question}}"}
            ],
            "slots": {"timeline": {"plan": [{
                "kind": "forEach", "source": "turns",
                "map": [{"kind": "message", "role": "user", "content": "{{item}}", "anchor": "t_{{index}}"}]
            }]}}
        })
    }

    #[test]
    fn floor_reserved_before_slots() {
        let template = compile(chat(None));
        let ctx = json!({"turns": ["aaaa", "bbbb", "cccc"], "question": "Q?"});
        // Floor: Intro(5) + [history](9) + [end](5) + Q?(2) = 21.
        let mut budget = per_char(29);
        let placed = run(&template, &ctx, &mut budget);
        assert_eq!(
            texts(&placed),
            vec!["Intro", "[history]", "aaaa", "bbbb", "[end]", "Q?"]
        );
        assert_eq!(budget.consumed(), 29);
        assert_eq!(budget.floors_total(), 0);
    }

    #[test]
    fn empty_slot_is_omitted_by_default() {
        let template = compile(chat(None));
        let ctx = json!({"turns": [], "question": "Q?"});
        let mut budget = per_char(100);
        let placed = run(&template, &ctx, &mut budget);
        assert_eq!(texts(&placed), vec!["Intro", "Q?"]);
        assert_eq!(budget.consumed(), 7);
    }

    #[test]
    fn empty_slot_keeps_frames_when_omit_is_false() {
        let template = compile(chat(Some(false)));
        let ctx = json!({"turns": [], "question": "Q?"});
        let mut budget = per_char(100);
        let placed = run(&template, &ctx, &mut budget);
        assert_eq!(texts(&placed), vec!["Intro", "[history]", "[end]", "Q?"]);
    }

    #[test]
    fn whitespace_layout_messages_are_omitted() {
        let template = compile(chat(None));
        let ctx = json!({"turns": ["x"], "question": "  "});
        let mut budget = per_char(100);
        let placed = run(&template, &ctx, &mut budget);
        assert_eq!(texts(&placed), vec!["Intro", "[history]", "x", "[end]"]);
    }

    #[test]
    fn anchors_are_tagged_with_their_origin() {
        let template = compile(chat(None));
        let ctx = json!({"turns": ["a", "b"], "question": "Q?"});
        let mut budget = per_char(100);
        let placed = run(&template, &ctx, &mut budget);
        let marks: Vec<(usize, &AnchorMark)> = placed
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.anchor.as_ref().map(|a| (i, a)))
            .collect();
        assert_eq!(marks.len(), 3);
        assert_eq!(marks[0].0, 0);
        assert_eq!(marks[0].1.source, AnchorSource::Layout);
        assert_eq!(marks[1].0, 2);
        assert_eq!(marks[1].1.key, "t_0");
        assert_eq!(
            marks[2].1.source,
            AnchorSource::Slot {
                slot_name: "timeline".into()
            }
        );
    }

    #[test]
    fn released_frames_feed_lower_priority_slots() {
        let template = compile(json!({
            "id": "t", "name": "t", "version": 1,
            "layout": [
                {"kind": "slot", "name": "notes", "header": {"content": "NOTES-HEADER"}},
                {"kind": "slot", "name": "timeline"}
            ],
            "slots": {
                "notes": {"priority": 10, "plan": [
                    {"kind": "forEach", "source": {"path": "notes"},
                     "map": [{"kind": "message", "role": "system", "content": "{{item}}"}]}
                ]},
                "timeline": {"priority": 1, "plan": [
                    {"kind": "forEach", "source": "turns",
                     "map": [{"kind": "message", "role": "user", "content": "{{item}}"}]}
                ]}
            }
        }));
        let ctx = json!({"notes": [], "turns": ["0123456789", "abcdefghijkl"]});
        // The 12-token header floor is released once notes runs empty, so
        // both turns fit in 22.
        let mut budget = per_char(22);
        let placed = run(&template, &ctx, &mut budget);
        assert_eq!(texts(&placed), vec!["0123456789", "abcdefghijkl"]);
    }

    #[test]
    fn higher_priority_slots_claim_budget_first() {
        let template = compile(json!({
            "id": "t", "name": "t", "version": 1,
            "layout": [
                {"kind": "slot", "name": "low"},
                {"kind": "slot", "name": "high"}
            ],
            "slots": {
                "low": {"priority": 0, "plan": [{"kind": "message", "role": "user", "content": "low-content"}]},
                "high": {"priority": 5, "plan": [{"kind": "message", "role": "user", "content": "high-content"}]}
            }
        }));
        let mut budget = per_char(15);
        let placed = run(&template, &json!({}), &mut budget);
        assert_eq!(texts(&placed), vec!["high-content"]);
    }

    #[test]
    fn missing_buffer_is_an_error() {
        let template = compile(chat(None));
        let ctx = json!({"turns": ["a"], "question": "Q?"});
        let registry = SourceRegistry::new();
        let assembler = LayoutAssembler::new(&template, Resolver::new(&registry, &ctx));
        let mut budget = per_char(100);
        let prepared = assembler.prepare(&mut budget);
        let err = assembler.assemble(prepared, &mut [], &mut budget).unwrap_err();
        assert!(matches!(err, RenderError::MissingSlotBuffer { slot } if slot == "timeline"));
    }

    #[test]
    fn anchor_serializes_flat() {
        let anchor = Anchor {
            key: "turn_3".into(),
            index: 4,
            source: AnchorSource::Slot {
                slot_name: "timeline".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&anchor).unwrap(),
            json!({"key": "turn_3", "index": 4, "source": "slot", "slotName": "timeline"})
        );
    }
}
