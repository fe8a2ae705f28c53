//! The render entry points.
//!
//! ```text
//! CompiledTemplate + context + Budget + SourceRegistry + RenderOptions
//!        │
//!        ├─ Phase A   layout floors + lane reserves
//!        ├─ slots     priority order, empty-slot floors released
//!        ├─ Phase B   layout walk, buffers spliced
//!        ├─ injection lanes inserted at anchors/boundaries
//!        └─ finalize  prefix check, anchor indices
//!        ▼
//! Vec<Message>  (or RenderOutput with anchors + report)
//! ```

use crate::assembler::{Anchor, LayoutAssembler, Placed};
use crate::budget::Budget;
use crate::injection::{InjectionRequest, inject, lane_floor_key};
use crate::report::{DropInfo, RenderReport};
use crate::resolve::Resolver;
use crate::token::CharRatioEstimator;
use promptloom_core::{CompileError, Message, RenderError, SourceRegistry, TokenEstimator};
use promptloom_template::{AttachmentLaneSpec, CompiledLane, CompiledTemplate, compile_lane};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-call render options.
#[derive(Debug, Default)]
pub struct RenderOptions {
    /// Lanes overriding (by id) or extending the template's attachments.
    pub attachments: Vec<CompiledLane>,
    pub injections: Vec<InjectionRequest>,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lane(mut self, lane: CompiledLane) -> Self {
        self.attachments.push(lane);
        self
    }

    pub fn with_injection(mut self, request: InjectionRequest) -> Self {
        self.injections.push(request);
        self
    }

    /// Compile the lanes of a deserialized options document.
    pub fn from_spec(spec: RenderOptionsSpec) -> Result<Self, CompileError> {
        let mut attachments = Vec::with_capacity(spec.attachments.len());
        let mut issues = Vec::new();
        let mut ids = HashSet::new();
        for lane in &spec.attachments {
            if !ids.insert(lane.id.as_str()) {
                issues.push(CompileError::DuplicateLane {
                    id: lane.id.clone(),
                });
                continue;
            }
            match compile_lane(lane) {
                Ok(compiled) => attachments.push(compiled),
                Err(e) => issues.push(e),
            }
        }
        match CompileError::from_issues(issues) {
            Some(err) => Err(err),
            None => Ok(Self {
                attachments,
                injections: spec.injections,
            }),
        }
    }
}

/// Serializable form of [`RenderOptions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptionsSpec {
    #[serde(default)]
    pub attachments: Vec<AttachmentLaneSpec>,
    #[serde(default)]
    pub injections: Vec<InjectionRequest>,
}

/// Messages plus everything known about how they were produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderOutput {
    pub messages: Vec<Message>,
    pub anchors: Vec<Anchor>,
    pub report: RenderReport,
}

/// Render a compiled template to messages.
pub fn render(
    template: &CompiledTemplate,
    context: &Value,
    budget: &mut Budget,
    registry: &SourceRegistry,
    options: &RenderOptions,
) -> Result<Vec<Message>, RenderError> {
    render_detailed(template, context, budget, registry, options).map(|out| out.messages)
}

/// Render and keep anchors and the render report.
pub fn render_detailed(
    template: &CompiledTemplate,
    context: &Value,
    budget: &mut Budget,
    registry: &SourceRegistry,
    options: &RenderOptions,
) -> Result<RenderOutput, RenderError> {
    let resolver = Resolver::new(registry, context);
    let assembler = LayoutAssembler::new(template, resolver);
    let lanes = merged_lanes(template, options);

    // ── Phase A: mandatory content and lane reserves ───────────────────────
    let prepared = assembler.prepare(budget);
    let floor_tokens = prepared.floor_tokens();
    for lane in lanes.iter().filter(|l| l.enabled) {
        if let Some(reserve) = lane.reserve_tokens.filter(|r| *r > 0) {
            budget.reserve_floor(lane_floor_key(&lane.id), reserve);
        }
    }

    // ── Slots, highest priority first ─────────────────────────────────────
    let mut buffers = assembler.execute_slots(&prepared, budget);
    let slot_stats: Vec<_> = template
        .execution_order
        .iter()
        .filter_map(|&i| buffers[i].as_ref().map(|b| b.stats.clone()))
        .collect();

    // ── Phase B: layout walk ──────────────────────────────────────────────
    let mut placed = assembler.assemble(prepared, &mut buffers, budget)?;

    // ── Injection ─────────────────────────────────────────────────────────
    let injected = inject(&lanes, &options.injections, &mut placed, budget);

    let anchors = finalize(&mut placed);
    let messages: Vec<Message> = placed.into_iter().map(|p| p.message).collect();

    let mut drops: Vec<DropInfo> = slot_stats
        .iter()
        .filter(|s| s.items_dropped > 0)
        .map(|s| DropInfo {
            scope: format!("slot:{}", s.name),
            items_dropped: s.items_dropped,
            reason: "budget exhausted".into(),
        })
        .collect();
    drops.extend(injected.drops);

    let total_tokens = budget.consumed();
    let max_tokens = budget.max_tokens();
    let utilization_pct = match (max_tokens, total_tokens) {
        (0, 0) => 0.0,
        (0, _) => 100.0,
        (max, total) => total as f32 / max as f32 * 100.0,
    };

    debug!(
        template = %template.id,
        messages = messages.len(),
        total_tokens,
        max_tokens,
        "render complete"
    );

    Ok(RenderOutput {
        messages,
        anchors,
        report: RenderReport {
            budget: max_tokens,
            total_tokens,
            utilization_pct,
            floor_tokens,
            slots: slot_stats,
            lanes: injected.lanes,
            drops,
        },
    })
}

/// Template lanes with call-site lanes substituted by id, followed by
/// call-site lanes the template does not declare.
fn merged_lanes<'a>(template: &'a CompiledTemplate, options: &'a RenderOptions) -> Vec<&'a CompiledLane> {
    let mut lanes: Vec<&CompiledLane> = template
        .lanes
        .iter()
        .map(|lane| {
            options
                .attachments
                .iter()
                .find(|o| o.id == lane.id)
                .unwrap_or(lane)
        })
        .collect();
    lanes.extend(
        options
            .attachments
            .iter()
            .filter(|o| template.lane(&o.id).is_none()),
    );
    lanes
}

/// Enforce the prefix rule and compute final anchor indices.
fn finalize(placed: &mut [Placed]) -> Vec<Anchor> {
    let last = placed.len().saturating_sub(1);
    for (index, entry) in placed.iter_mut().enumerate() {
        if entry.message.prefix && index != last {
            warn!(index, "assistant prefix is not the last message, emitting it as a plain message");
            entry.message.prefix = false;
        }
    }

    let mut seen = HashSet::new();
    let mut anchors = Vec::new();
    for (index, entry) in placed.iter().enumerate() {
        let Some(mark) = &entry.anchor else {
            continue;
        };
        if !seen.insert(mark.key.as_str()) {
            warn!(key = %mark.key, index, "duplicate anchor key, keeping the first");
            continue;
        }
        anchors.push(Anchor {
            key: mark.key.clone(),
            index,
            source: mark.source.clone(),
        });
    }
    anchors
}

// ── Renderer ──────────────────────────────────────────────────────────────

/// A reusable renderer: a shared source registry plus an estimator.
///
/// Cheap to clone and safe to share; each call gets its own [`Budget`].
#[derive(Clone)]
pub struct Renderer {
    registry: Arc<SourceRegistry>,
    estimator: Arc<dyn TokenEstimator>,
}

impl Renderer {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self {
            registry,
            estimator: Arc::new(CharRatioEstimator::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// A fresh budget priced with this renderer's estimator.
    pub fn budget(&self, max_tokens: usize) -> Budget {
        Budget::new(max_tokens, Arc::clone(&self.estimator))
    }

    pub fn render(
        &self,
        template: &CompiledTemplate,
        context: &Value,
        max_tokens: usize,
        options: &RenderOptions,
    ) -> Result<Vec<Message>, RenderError> {
        let mut budget = self.budget(max_tokens);
        render(template, context, &mut budget, &self.registry, options)
    }

    pub fn render_detailed(
        &self,
        template: &CompiledTemplate,
        context: &Value,
        max_tokens: usize,
        options: &RenderOptions,
    ) -> Result<RenderOutput, RenderError> {
        let mut budget = self.budget(max_tokens);
        render_detailed(template, context, &mut budget, &self.registry, options)
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AnchorSource;
    use crate::injection::InjectionTarget;
    use promptloom_core::Role;
    use promptloom_template::{Template, TemplateCompiler};
    use serde_json::json;

    fn compile(raw: Value) -> CompiledTemplate {
        let template: Template = serde_json::from_value(raw).unwrap();
        TemplateCompiler::new().compile(&template).unwrap()
    }

    fn renderer() -> Renderer {
        let registry = SourceRegistry::new().with_fn("turns", |ctx, _| ctx["turns"].clone());
        Renderer::new(Arc::new(registry)).with_estimator(Arc::new(|t: &str| t.chars().count()))
    }

    fn chat() -> CompiledTemplate {
        compile(json!({
            "id": "chat", "name": "Chat", "version": 1,
            "layout": [
                {"kind": "message", "role": "system", "content": "Intro"},
                {"kind": "slot", "name": "timeline"},
                {"kind": "message", "role": "assistant", "content": "{{char}}:", "prefix": true}
            ],
            "slots": {"timeline": {"plan": [{
                "kind": "forEach", "source": "turns", "order": "desc", "fillDir": "prepend",
                "map": [{"kind": "message", "role": "user", "content": "{{item.text}}",
                         "anchor": "turn_{{item.no}}"}]
            }]}},
            "attachments": [
                {"id": "lore", "role": "system", "template": "[{{payload}}]", "reserveTokens": 5}
            ]
        }))
    }

    fn ctx() -> Value {
        json!({
            "char": "Ava",
            "turns": [
                {"no": 1, "text": "one"},
                {"no": 2, "text": "two"},
                {"no": 3, "text": "three"}
            ]
        })
    }

    #[test]
    fn prefix_survives_on_last_message() {
        let messages = renderer()
            .render(&chat(), &ctx(), 1000, &RenderOptions::new())
            .unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.content, "Ava:");
        assert!(last.prefix);
        assert!(messages[..messages.len() - 1].iter().all(|m| !m.prefix));
    }

    #[test]
    fn prefix_is_dropped_when_something_follows() {
        let options = RenderOptions::new().with_injection(InjectionRequest::new(
            "lore",
            InjectionTarget::bottom(0),
            json!("tail"),
        ));
        let messages = renderer().render(&chat(), &ctx(), 1000, &options).unwrap();
        assert_eq!(messages.last().unwrap().content, "[tail]");
        let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert!(!assistant.prefix);
    }

    #[test]
    fn anchors_index_the_final_list() {
        let options = RenderOptions::new().with_injection(InjectionRequest::new(
            "lore",
            InjectionTarget::after("turn_1"),
            json!("lore"),
        ));
        let out = renderer()
            .render_detailed(&chat(), &ctx(), 1000, &options)
            .unwrap();
        let contents: Vec<&str> = out.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Intro", "one", "[lore]", "two", "three", "Ava:"]);

        for anchor in &out.anchors {
            let expected = match anchor.key.as_str() {
                "turn_1" => "one",
                "turn_2" => "two",
                "turn_3" => "three",
                other => panic!("unexpected anchor {other}"),
            };
            assert_eq!(out.messages[anchor.index].content, expected);
            assert_eq!(
                anchor.source,
                AnchorSource::Slot {
                    slot_name: "timeline".into()
                }
            );
        }
        assert_eq!(out.anchors.len(), 3);
    }

    #[test]
    fn lane_reserve_is_held_back_from_slots() {
        // Floors: Intro(5) + Ava:(4) + lore reserve(5) = 14, leaving 8 for
        // turns: "three" and "two" fit, "one" does not.
        let options = RenderOptions::new().with_injection(InjectionRequest::new(
            "lore",
            InjectionTarget::top(0),
            json!("abc"),
        ));
        let out = renderer()
            .render_detailed(&chat(), &ctx(), 22, &options)
            .unwrap();
        let contents: Vec<&str> = out.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["[abc]", "Intro", "two", "three", "Ava:"]);
        assert_eq!(out.report.floor_tokens, 9);
        assert_eq!(out.report.total_tokens, 22);
        let timeline = out.report.slot("timeline").unwrap();
        assert_eq!(timeline.items_included, 2);
        assert_eq!(timeline.items_dropped, 1);
        assert_eq!(out.report.drops[0].scope, "slot:timeline");
    }

    #[test]
    fn call_site_lanes_override_by_id() {
        let spec: RenderOptionsSpec = serde_json::from_value(json!({
            "attachments": [
                {"id": "lore", "role": "user", "template": "<{{payload}}>"},
                {"id": "notes", "role": "system", "template": "note: {{payload}}"}
            ],
            "injections": [
                {"lane": "lore", "target": {"kind": "boundary", "position": "top"}, "payload": "x"},
                {"lane": "notes", "target": {"kind": "boundary", "position": "top", "delta": 1}, "payload": "y"}
            ]
        }))
        .unwrap();
        let options = RenderOptions::from_spec(spec).unwrap();
        let messages = renderer().render(&chat(), &ctx(), 1000, &options).unwrap();
        assert_eq!(messages[0], Message::user("<x>"));
        assert_eq!(messages[1], Message::system("note: y"));
        assert_eq!(messages[2].content, "Intro");
    }

    #[test]
    fn options_spec_reports_bad_lanes() {
        let spec: RenderOptionsSpec = serde_json::from_value(json!({
            "attachments": [
                {"id": "a", "role": "user", "template": "{{#if x}}"},
                {"id": "b", "role": "user", "template": "ok"},
                {"id": "b", "role": "user", "template": "dup"}
            ]
        }))
        .unwrap();
        let err = RenderOptions::from_spec(spec).unwrap_err();
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn duplicate_runtime_anchors_keep_the_first() {
        let template = compile(json!({
            "id": "t", "name": "t", "version": 1,
            "layout": [{"kind": "slot", "name": "s"}],
            "slots": {"s": {"plan": [{
                "kind": "forEach", "source": "turns",
                "map": [{"kind": "message", "role": "user", "content": "{{item.text}}", "anchor": "k{{item.group}}"}]
            }]}}
        }));
        let ctx = json!({"turns": [
            {"text": "a", "group": 1},
            {"text": "b", "group": 1},
            {"text": "c", "group": 2}
        ]});
        let out = renderer()
            .render_detailed(&template, &ctx, 1000, &RenderOptions::new())
            .unwrap();
        let keys: Vec<(&str, usize)> = out.anchors.iter().map(|a| (a.key.as_str(), a.index)).collect();
        assert_eq!(keys, vec![("k1", 0), ("k2", 2)]);
    }

    #[test]
    fn zero_budget_keeps_mandatory_content_only() {
        let out = renderer()
            .render_detailed(&chat(), &ctx(), 0, &RenderOptions::new())
            .unwrap();
        let contents: Vec<&str> = out.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Intro", "Ava:"]);
        assert_eq!(out.report.utilization_pct, 100.0);
    }

    #[test]
    fn free_function_matches_renderer() {
        let registry = SourceRegistry::new().with_fn("turns", |ctx, _| ctx["turns"].clone());
        let mut budget = Budget::new(1000, Arc::new(|t: &str| t.chars().count()));
        let direct = render(&chat(), &ctx(), &mut budget, &registry, &RenderOptions::new()).unwrap();
        let via = renderer()
            .render(&chat(), &ctx(), 1000, &RenderOptions::new())
            .unwrap();
        assert_eq!(direct, via);
    }
}
