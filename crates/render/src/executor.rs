//! Plan (slot) executor.
//!
//! Interprets a slot's plan against the render context and the budget,
//! producing an ordered buffer of messages. Anchor keys ride on the message
//! they mark, so later reordering (`fillDir: prepend`, injection) never
//! invalidates them.
//!
//! # Budget levels
//!
//! A node with its own `budget` opens a nested level. When content is
//! refused, the refusal names the outermost level that could not fit it:
//!
//! - a node *contains* refusals of its own level (a message is skipped, a
//!   loop stops or keeps probing per `stopWhenOutOfBudget`)
//! - refusals of an ancestor level propagate upwards, so an exhausted slot
//!   budget stops every loop inside it, while an exhausted loop budget only
//!   ends that loop
//!
//! Loop items are atomic: if a message inside an item is refused and the
//! item does not contain the refusal, the item's consumption is rolled back
//! and its messages discarded.

use crate::budget::{Budget, Exhausted};
use crate::report::SlotStats;
use crate::resolve::Resolver;
use promptloom_core::{Message, Role};
use promptloom_expr::{LeafOutput, Scope, Segment, sort_order, walk};
use promptloom_template::{
    CompiledForEach, CompiledMessage, CompiledPlanNode, CompiledSlot, FillDir, MessageContent,
    Order,
};
use serde_json::json;
use tracing::debug;

/// A message produced by a plan, carrying the anchor key that marks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub message: Message,
    pub anchor: Option<String>,
}

impl Emitted {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            message: Message::new(role, content),
            anchor: None,
        }
    }
}

/// The output of one slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotBuffer {
    pub entries: Vec<Emitted>,
    pub stats: SlotStats,
}

impl SlotBuffer {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }
}

/// Outcome of running plan nodes: the outermost ancestor level that refused
/// content without being contained, if any.
type Signal = Option<usize>;

fn outermost(a: Signal, b: Signal) -> Signal {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Render message content (leaf or data reference) for one scope.
pub(crate) fn render_content(
    resolver: &Resolver<'_>,
    content: &MessageContent,
    scope: &Scope<'_>,
) -> LeafOutput {
    match content {
        MessageContent::Leaf(leaf) => leaf.render(scope),
        MessageContent::From(data_ref) => {
            let text = resolver.resolve_text(data_ref, scope);
            let contentful = !text.trim().is_empty();
            LeafOutput { text, contentful }
        }
    }
}

/// Executes slot plans for one render.
pub struct PlanExecutor<'r> {
    resolver: Resolver<'r>,
}

impl<'r> PlanExecutor<'r> {
    pub fn new(resolver: Resolver<'r>) -> Self {
        Self { resolver }
    }

    /// Run a slot's plan. A false `when` yields an empty buffer.
    pub fn execute_slot(&self, slot: &CompiledSlot, budget: &mut Budget) -> SlotBuffer {
        let root = Scope::root(self.resolver.context());
        let mut stats = SlotStats {
            name: slot.name.clone(),
            priority: slot.priority,
            ..SlotStats::default()
        };

        if let Some(when) = &slot.when
            && !self.resolver.holds(when, &root)
        {
            debug!(slot = %slot.name, "slot condition false, skipping");
            stats.skipped = true;
            return SlotBuffer {
                entries: Vec::new(),
                stats,
            };
        }

        let before = budget.consumed();
        let own = slot.budget.map(|limit| budget.enter_scope(limit));
        let mut entries = Vec::new();
        let signal = match self.run_nodes(&slot.plan, &root, budget, &mut entries, &mut stats, false)
        {
            Ok(signal) => signal,
            Err(e) => Some(e.level),
        };
        if own.is_some() {
            budget.exit_scope();
        }
        if signal.is_some() {
            stats.truncated = true;
        }

        stats.tokens = budget.consumed().saturating_sub(before);
        stats.messages = entries.len();
        debug!(
            slot = %slot.name,
            messages = stats.messages,
            tokens = stats.tokens,
            truncated = stats.truncated,
            "slot executed"
        );
        SlotBuffer { entries, stats }
    }

    /// Run a node list. With `atomic`, the first uncontained refusal aborts
    /// the list (the caller rolls the item back); otherwise refused nodes
    /// are skipped and the rest still run.
    fn run_nodes(
        &self,
        nodes: &[CompiledPlanNode],
        scope: &Scope<'_>,
        budget: &mut Budget,
        out: &mut Vec<Emitted>,
        stats: &mut SlotStats,
        atomic: bool,
    ) -> Result<Signal, Exhausted> {
        let mut signal = None;
        for node in nodes {
            match self.run_node(node, scope, budget, out, stats, atomic) {
                Ok(s) => signal = outermost(signal, s),
                Err(e) if atomic => return Err(e),
                Err(e) => signal = outermost(signal, Some(e.level)),
            }
        }
        Ok(signal)
    }

    fn run_node(
        &self,
        node: &CompiledPlanNode,
        scope: &Scope<'_>,
        budget: &mut Budget,
        out: &mut Vec<Emitted>,
        stats: &mut SlotStats,
        atomic: bool,
    ) -> Result<Signal, Exhausted> {
        match node {
            CompiledPlanNode::Message(message) => self.emit(message, scope, budget, out, stats),
            CompiledPlanNode::If(branch) => {
                let nodes = if self.resolver.holds(&branch.condition, scope) {
                    &branch.then
                } else {
                    &branch.otherwise
                };
                self.run_nodes(nodes, scope, budget, out, stats, atomic)
            }
            CompiledPlanNode::ForEach(each) => Ok(self.for_each(each, scope, budget, out, stats)),
        }
    }

    fn emit(
        &self,
        message: &CompiledMessage,
        scope: &Scope<'_>,
        budget: &mut Budget,
        out: &mut Vec<Emitted>,
        stats: &mut SlotStats,
    ) -> Result<Signal, Exhausted> {
        let rendered = render_content(&self.resolver, &message.content, scope);
        if !rendered.contentful {
            return Ok(None);
        }

        let own = message.budget.map(|limit| budget.enter_scope(limit));
        let charged = budget.consume(&rendered.text);
        if own.is_some() {
            budget.exit_scope();
        }

        match charged {
            Ok(_) => {
                let anchor = message
                    .anchor
                    .as_ref()
                    .map(|key| key.render_text(scope))
                    .filter(|key| !key.trim().is_empty());
                out.push(Emitted {
                    message: Message::new(message.role, rendered.text),
                    anchor,
                });
                Ok(None)
            }
            Err(e) if own == Some(e.level) => {
                stats.truncated = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn for_each(
        &self,
        each: &CompiledForEach,
        scope: &Scope<'_>,
        budget: &mut Budget,
        out: &mut Vec<Emitted>,
        stats: &mut SlotStats,
    ) -> Signal {
        let mut items = self.resolver.resolve_items(&each.source, scope);
        if let Some(path) = &each.sort_by {
            let key: Vec<Segment> = std::iter::once(Segment::Key(path.head.clone()))
                .chain(path.segments.iter().cloned())
                .collect();
            items.sort_by(|a, b| sort_order(walk(a, &key), walk(b, &key)));
        }
        if each.order == Order::Desc {
            items.reverse();
        }
        if let Some(limit) = each.limit {
            items.truncate(limit);
        }
        let total = items.len();
        stats.items_total += total;

        let own = each.budget.map(|limit| budget.enter_scope(limit));
        let mut groups: Vec<Vec<Emitted>> = Vec::new();
        let mut signal = None;

        for (index, item) in items.into_iter().enumerate() {
            let mut child = scope.child();
            child
                .bind("item", item.clone())
                .bind("$item", item)
                .bind("index", json!(index))
                .bind("$index", json!(index));

            let checkpoint = budget.checkpoint();
            let mut group = Vec::new();
            let mut outcome = self.run_nodes(&each.map, &child, budget, &mut group, stats, true);

            if matches!(outcome, Ok(_))
                && !group.is_empty()
                && !groups.is_empty()
                && let Some(separator) = &each.interleave
            {
                let text = separator.content.render(&child);
                if text.contentful {
                    match budget.consume(&text.text) {
                        Ok(_) => {
                            let sep = Emitted::new(separator.role, text.text);
                            match each.fill_dir {
                                FillDir::Append => group.insert(0, sep),
                                FillDir::Prepend => group.push(sep),
                            }
                        }
                        Err(e) => outcome = Err(e),
                    }
                }
            }

            let refusal = match outcome {
                Ok(inner) => {
                    stats.items_included += 1;
                    if !group.is_empty() {
                        groups.push(group);
                    }
                    inner
                }
                Err(e) => {
                    budget.rollback(&checkpoint);
                    stats.items_dropped += 1;
                    Some(e.level)
                }
            };

            if let Some(level) = refusal {
                stats.truncated = true;
                if own != Some(level) {
                    signal = outermost(signal, Some(level));
                }
                if each.stop_when_out_of_budget {
                    stats.items_dropped += total - index - 1;
                    break;
                }
            }
        }

        if own.is_some() {
            budget.exit_scope();
        }

        match each.fill_dir {
            FillDir::Append => out.extend(groups.into_iter().flatten()),
            FillDir::Prepend => out.extend(groups.into_iter().rev().flatten()),
        }
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::SourceRegistry;
    use promptloom_template::{CompiledTemplate, Template, TemplateCompiler};
    use serde_json::Value;
    use std::sync::Arc;

    fn compile(slot: Value) -> CompiledTemplate {
        let template: Template = serde_json::from_value(json!({
            "id": "t", "name": "t", "version": 1,
            "layout": [{"kind": "slot", "name": "s"}],
            "slots": {"s": slot}
        }))
        .unwrap();
        TemplateCompiler::new().compile(&template).unwrap()
    }

    fn per_char(max: usize) -> Budget {
        Budget::new(max, Arc::new(|text: &str| text.chars().count()))
    }

    fn run(slot: Value, ctx: Value, max: usize) -> SlotBuffer {
        let compiled = compile(slot);
        let registry = SourceRegistry::new().with_fn("turns", |ctx, _| ctx["turns"].clone());
        let executor = PlanExecutor::new(Resolver::new(&registry, &ctx));
        let mut budget = per_char(max);
        executor.execute_slot(&compiled.slots[0], &mut budget)
    }

    fn texts(buffer: &SlotBuffer) -> Vec<&str> {
        buffer.messages().map(|m| m.content.as_str()).collect()
    }

    fn turns(n: usize) -> Value {
        json!({"turns": (1..=n).map(|i| json!({"no": i, "text": format!("t{i}")})).collect::<Vec<_>>()})
    }

    fn timeline(extra: Value) -> Value {
        let mut each = json!({
            "kind": "forEach",
            "source": "turns",
            "map": [{"kind": "message", "role": "user", "content": "{{item.text}}",
                     "anchor": "turn_{{item.no}}"}]
        });
        for (k, v) in extra.as_object().unwrap() {
            each[k] = v.clone();
        }
        json!({"plan": [each]})
    }

    #[test]
    fn iterates_in_order_with_anchors() {
        let buffer = run(timeline(json!({})), turns(3), 100);
        assert_eq!(texts(&buffer), vec!["t1", "t2", "t3"]);
        let anchors: Vec<_> = buffer.entries.iter().map(|e| e.anchor.clone().unwrap()).collect();
        assert_eq!(anchors, vec!["turn_1", "turn_2", "turn_3"]);
        assert_eq!(buffer.stats.items_included, 3);
        assert_eq!(buffer.stats.tokens, 6);
        assert!(!buffer.stats.truncated);
    }

    #[test]
    fn desc_with_prepend_keeps_newest_in_chronological_order() {
        // Walk newest first so the budget favours recent turns, but prepend so
        // the output still reads oldest to newest.
        let buffer = run(
            timeline(json!({"order": "desc", "fillDir": "prepend"})),
            turns(5),
            6,
        );
        assert_eq!(texts(&buffer), vec!["t3", "t4", "t5"]);
        assert!(buffer.stats.truncated);
        // t2 was refused and t1 never reached.
        assert_eq!(buffer.stats.items_dropped, 2);
        assert_eq!(
            buffer.stats.items_included + buffer.stats.items_dropped,
            buffer.stats.items_total
        );
    }

    #[test]
    fn limit_applies_after_ordering() {
        let buffer = run(timeline(json!({"order": "desc", "limit": 2})), turns(5), 100);
        assert_eq!(texts(&buffer), vec!["t5", "t4"]);
        assert_eq!(buffer.stats.items_total, 2);
    }

    #[test]
    fn sort_by_is_stable_and_ascending() {
        let ctx = json!({"turns": [
            {"no": 1, "text": "b", "rank": 2},
            {"no": 2, "text": "a", "rank": 1},
            {"no": 3, "text": "c", "rank": 2}
        ]});
        let buffer = run(timeline(json!({"sortBy": "rank"})), ctx.clone(), 100);
        assert_eq!(texts(&buffer), vec!["a", "b", "c"]);

        let desc = run(timeline(json!({"sortBy": "rank", "order": "desc"})), ctx, 100);
        assert_eq!(texts(&desc), vec!["c", "b", "a"]);
    }

    #[test]
    fn stop_when_out_of_budget_false_keeps_probing() {
        let ctx = json!({"turns": [
            {"no": 1, "text": "aaaa"},
            {"no": 2, "text": "bbbbbbbbbb"},
            {"no": 3, "text": "cc"}
        ]});
        let stopping = run(timeline(json!({})), ctx.clone(), 7);
        assert_eq!(texts(&stopping), vec!["aaaa"]);
        assert_eq!(stopping.stats.items_dropped, 2);

        let probing = run(timeline(json!({"stopWhenOutOfBudget": false})), ctx, 7);
        assert_eq!(texts(&probing), vec!["aaaa", "cc"]);
        assert_eq!(probing.stats.items_dropped, 1);
    }

    #[test]
    fn items_are_atomic() {
        let slot = json!({"plan": [{
            "kind": "forEach",
            "source": "turns",
            "map": [
                {"kind": "message", "role": "user", "content": "{{item.text}}"},
                {"kind": "message", "role": "assistant", "content": "reply-{{item.no}}"}
            ]
        }]});
        // t1 + reply-1 = 9; t2 fits alone but reply-2 does not.
        let buffer = run(slot, turns(2), 12);
        assert_eq!(texts(&buffer), vec!["t1", "reply-1"]);
        assert_eq!(buffer.stats.tokens, 9);
    }

    #[test]
    fn loop_budget_is_contained_slot_budget_is_not() {
        // Inner loop capped at 4 tokens per outer item; outer keeps going.
        let slot = json!({
            "plan": [{
                "kind": "forEach",
                "source": "turns",
                "map": [{
                    "kind": "forEach",
                    "source": {"path": "item.parts"},
                    "budget": 4,
                    "map": [{"kind": "message", "role": "user", "content": "{{item}}"}]
                }]
            }]
        });
        let ctx = json!({"turns": [
            {"parts": ["aa", "bb", "cc"]},
            {"parts": ["dd", "ee"]}
        ]});
        let buffer = run(slot.clone(), ctx.clone(), 100);
        assert_eq!(texts(&buffer), vec!["aa", "bb", "dd", "ee"]);

        // With only 6 tokens overall the render-wide ledger runs out inside
        // the second outer item: the outer loop stops, partial output stays.
        let tight = run(slot, ctx, 6);
        assert_eq!(texts(&tight), vec!["aa", "bb", "dd"]);
        assert!(tight.stats.truncated);
    }

    #[test]
    fn message_budget_skips_only_that_message() {
        let slot = json!({"plan": [
            {"kind": "message", "role": "system", "content": "long message", "budget": 3},
            {"kind": "message", "role": "system", "content": "short"}
        ]});
        let buffer = run(slot, json!({}), 100);
        assert_eq!(texts(&buffer), vec!["short"]);
        assert!(buffer.stats.truncated);
    }

    #[test]
    fn interleave_separates_groups() {
        let buffer = run(
            timeline(json!({"interleave": {"role": "system", "content": "--"}})),
            turns(3),
            100,
        );
        assert_eq!(texts(&buffer), vec!["t1", "--", "t2", "--", "t3"]);

        let prepended = run(
            timeline(json!({"interleave": {"content": "--"}, "fillDir": "prepend"})),
            turns(2),
            100,
        );
        assert_eq!(texts(&prepended), vec!["t2", "--", "t1"]);
    }

    #[test]
    fn if_nodes_and_item_scope() {
        let slot = json!({"plan": [{
            "kind": "forEach",
            "source": "turns",
            "map": [{
                "kind": "if",
                "condition": {"type": "expr", "expr": "index == 0"},
                "then": [{"kind": "message", "role": "user", "content": "first {{$item.text}}"}],
                "else": [{"kind": "message", "role": "user", "content": "#{{$index}} {{item.text}}"}]
            }]
        }]});
        let buffer = run(slot, turns(3), 100);
        assert_eq!(texts(&buffer), vec!["first t1", "#1 t2", "#2 t3"]);
    }

    #[test]
    fn false_when_skips_slot() {
        let slot = json!({
            "when": {"type": "nonEmpty", "ref": "turns"},
            "plan": [{"kind": "message", "role": "system", "content": "has turns"}]
        });
        let skipped = run(slot.clone(), json!({"turns": []}), 100);
        assert!(skipped.is_empty());
        assert!(skipped.stats.skipped);

        let ran = run(slot, turns(1), 100);
        assert_eq!(texts(&ran), vec!["has turns"]);
    }

    #[test]
    fn empty_content_emits_nothing() {
        let slot = json!({"plan": [
            {"kind": "message", "role": "system", "content": "{{#if false}}x{{#endif}}"},
            {"kind": "message", "role": "system", "from": {"path": "missing"}}
        ]});
        let buffer = run(slot, json!({}), 100);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats.tokens, 0);
    }

    #[test]
    fn non_sequence_sources() {
        let single = run(timeline(json!({})), json!({"turns": {"no": 9, "text": "solo"}}), 100);
        assert_eq!(texts(&single), vec!["solo"]);

        let none = run(timeline(json!({})), json!({}), 100);
        assert!(none.is_empty());
    }
}
