//! Injection of attachment-lane payloads into the assembled messages.
//!
//! Runs after assembly. Each enabled lane, in ascending `order` (then id),
//! renders its requests through the lane template, admits them in priority
//! order while they fit the budget, and inserts them at the position their
//! target resolves to. Later lanes see the messages earlier lanes inserted.
//!
//! Anchor targets are tried in order and the first existing one wins. An
//! anchor that does not exist is never fatal: the request falls back to the
//! last boundary target, or to the bottom of the prompt.

use crate::assembler::Placed;
use crate::budget::Budget;
use crate::report::{DropInfo, LaneStats};
use promptloom_core::Message;
use promptloom_expr::Scope;
use promptloom_template::CompiledLane;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

// ── Requests ──────────────────────────────────────────────────────────────

/// Where an injected payload should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InjectionTarget {
    /// Next to the message carrying anchor `key` (after it by default).
    At {
        key: String,
        #[serde(default = "default_after")]
        after: bool,
    },
    /// `delta` messages in from the top or bottom edge.
    Boundary {
        position: BoundaryPosition,
        #[serde(default)]
        delta: usize,
    },
}

fn default_after() -> bool {
    true
}

impl InjectionTarget {
    pub fn after(key: impl Into<String>) -> Self {
        Self::At {
            key: key.into(),
            after: true,
        }
    }

    pub fn before(key: impl Into<String>) -> Self {
        Self::At {
            key: key.into(),
            after: false,
        }
    }

    pub fn top(delta: usize) -> Self {
        Self::Boundary {
            position: BoundaryPosition::Top,
            delta,
        }
    }

    pub fn bottom(delta: usize) -> Self {
        Self::Boundary {
            position: BoundaryPosition::Bottom,
            delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPosition {
    Top,
    Bottom,
}

/// A pre-computed payload addressed to a lane (e.g. a triggered lore entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionRequest {
    pub lane: String,
    /// Candidate targets, tried in order. A single object is accepted.
    #[serde(rename = "target", deserialize_with = "one_or_many")]
    pub targets: Vec<InjectionTarget>,
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl InjectionRequest {
    pub fn new(lane: impl Into<String>, target: InjectionTarget, payload: Value) -> Self {
        Self {
            lane: lane.into(),
            targets: vec![target],
            payload,
            priority: 0,
            group_id: None,
        }
    }

    /// Add a fallback target tried after the existing ones.
    pub fn or(mut self, target: InjectionTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group_id = Some(group.into());
        self
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<InjectionTarget>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(InjectionTarget),
        Many(Vec<InjectionTarget>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(target) => vec![target],
        OneOrMany::Many(targets) => targets,
    })
}

/// Floor key holding a lane's `reserveTokens`.
pub fn lane_floor_key(lane_id: &str) -> String {
    format!("lane:{lane_id}")
}

/// Resolve candidate targets to an insertion point in `0..=len`.
///
/// The first `at` target whose anchor exists wins. Otherwise the last
/// `boundary` target applies, and with no boundary the request goes to the
/// bottom.
pub fn resolve_position(targets: &[InjectionTarget], placed: &[Placed]) -> usize {
    let len = placed.len();
    let anchored = targets.iter().find_map(|target| match target {
        InjectionTarget::At { key, after } => placed
            .iter()
            .position(|p| p.anchor.as_ref().is_some_and(|a| &a.key == key))
            .map(|index| if *after { index + 1 } else { index }),
        InjectionTarget::Boundary { .. } => None,
    });
    if let Some(index) = anchored {
        return index;
    }

    let fallback = targets.iter().rev().find_map(|target| match target {
        InjectionTarget::Boundary { position, delta } => Some((*position, *delta)),
        InjectionTarget::At { .. } => None,
    });
    match fallback {
        Some((BoundaryPosition::Top, delta)) => delta.min(len),
        Some((BoundaryPosition::Bottom, delta)) => len.saturating_sub(delta),
        None => len,
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────

/// One message to insert: a single entry or a whole group.
struct Block<'q> {
    targets: &'q [InjectionTarget],
    group: Option<&'q str>,
    entries: Vec<String>,
}

/// Result of injecting all lanes.
#[derive(Debug, Default)]
pub struct InjectionOutcome {
    pub lanes: Vec<LaneStats>,
    pub drops: Vec<DropInfo>,
}

/// Inject every request into `placed`.
///
/// `lanes` must already be merged (call-site lanes override template lanes
/// by id); ordering is applied here.
pub fn inject(
    lanes: &[&CompiledLane],
    requests: &[InjectionRequest],
    placed: &mut Vec<Placed>,
    budget: &mut Budget,
) -> InjectionOutcome {
    let mut outcome = InjectionOutcome::default();

    for request in requests {
        if !lanes.iter().any(|l| l.id == request.lane) {
            warn!(lane = %request.lane, "injection request for unknown lane ignored");
        }
    }

    let mut ordered: Vec<&CompiledLane> = lanes.iter().copied().filter(|l| l.enabled).collect();
    ordered.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

    for lane in ordered {
        budget.release_floor(&lane_floor_key(&lane.id));

        let mut requests: Vec<&InjectionRequest> =
            requests.iter().filter(|r| r.lane == lane.id).collect();
        // Stable: equal priorities keep input order.
        requests.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut stats = LaneStats {
            id: lane.id.clone(),
            entries_total: requests.len(),
            ..LaneStats::default()
        };

        let blocks = build_blocks(lane, &requests);
        let mut inserts: Vec<(usize, Placed)> = Vec::new();
        let mut exhausted = false;

        for block in blocks {
            if exhausted {
                break;
            }
            let mut accepted: Vec<String> = Vec::new();
            for entry in &block.entries {
                let mut candidate = accepted.clone();
                candidate.push(entry.clone());
                let text = compose(lane, block.group, &candidate);
                if budget.can_fit_token_estimate(&text) {
                    accepted = candidate;
                } else {
                    exhausted = true;
                    break;
                }
            }
            if accepted.is_empty() {
                continue;
            }

            let text = compose(lane, block.group, &accepted);
            let Ok(tokens) = budget.consume(&text) else {
                exhausted = true;
                continue;
            };
            stats.tokens += tokens;
            stats.entries_included += accepted.len();
            stats.blocks += 1;

            let position = resolve_position(block.targets, placed);
            inserts.push((position, Placed::new(Message::new(lane.role, text))));
        }

        weave(placed, inserts);

        let dropped = stats.entries_total - stats.entries_included;
        if dropped > 0 {
            outcome.drops.push(DropInfo {
                scope: lane_floor_key(&lane.id),
                items_dropped: dropped,
                reason: if exhausted {
                    "budget exhausted".into()
                } else {
                    "rendered empty".into()
                },
            });
        }
        debug!(
            lane = %lane.id,
            included = stats.entries_included,
            total = stats.entries_total,
            tokens = stats.tokens,
            "lane injected"
        );
        outcome.lanes.push(stats);
    }

    outcome
}

/// Render requests through the lane template and group them into blocks.
/// A group's block sits where its highest-priority request would.
fn build_blocks<'q>(lane: &CompiledLane, requests: &[&'q InjectionRequest]) -> Vec<Block<'q>> {
    let mut blocks: Vec<Block<'q>> = Vec::new();

    for request in requests {
        let data = json!({
            "payload": request.payload,
            "lane": lane.id,
            "request": {"priority": request.priority, "groupId": request.group_id},
        });
        let rendered = lane.template.render(&Scope::root(&data));
        if !rendered.contentful {
            debug!(lane = %lane.id, "lane entry rendered empty, dropped");
            continue;
        }

        match request.group_id.as_deref() {
            Some(group) => match blocks.iter_mut().find(|b| b.group == Some(group)) {
                Some(block) => block.entries.push(rendered.text),
                None => blocks.push(Block {
                    targets: &request.targets,
                    group: Some(group),
                    entries: vec![rendered.text],
                }),
            },
            None => blocks.push(Block {
                targets: &request.targets,
                group: None,
                entries: vec![rendered.text],
            }),
        }
    }
    blocks
}

/// Join a block's entries, wrapped in the group's open/close text.
fn compose(lane: &CompiledLane, group: Option<&str>, entries: &[String]) -> String {
    let wrappers = group.and_then(|g| lane.group(g));
    let Some(wrappers) = wrappers else {
        return entries.join("\n");
    };

    let data = json!({"group": wrappers.id, "lane": lane.id, "entries": entries});
    let scope = Scope::root(&data);
    let open = wrappers.open.as_ref().map(|leaf| leaf.render(&scope));
    let close = wrappers.close.as_ref().map(|leaf| leaf.render(&scope));

    let mut parts: Vec<&str> = Vec::with_capacity(entries.len() + 2);
    if let Some(open) = open.as_ref().filter(|o| o.contentful) {
        parts.push(&open.text);
    }
    parts.extend(entries.iter().map(String::as_str));
    if let Some(close) = close.as_ref().filter(|c| c.contentful) {
        parts.push(&close.text);
    }
    parts.join("\n")
}

/// Insert messages at precomputed gap positions. Inserts sharing a position
/// keep their relative order.
fn weave(placed: &mut Vec<Placed>, mut inserts: Vec<(usize, Placed)>) {
    if inserts.is_empty() {
        return;
    }
    inserts.sort_by_key(|(position, _)| *position);

    let original = std::mem::take(placed);
    let mut pending = inserts.into_iter().peekable();
    for (index, entry) in original.into_iter().enumerate() {
        while let Some((_, insert)) = pending.next_if(|(position, _)| *position <= index) {
            placed.push(insert);
        }
        placed.push(entry);
    }
    placed.extend(pending.map(|(_, insert)| insert));
}
