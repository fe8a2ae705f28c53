//! Render metadata: what went in, what was dropped, and why.

use serde::{Deserialize, Serialize};

/// Detailed metadata about one render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderReport {
    /// Configured token budget.
    pub budget: usize,
    /// Tokens charged for the emitted messages.
    pub total_tokens: usize,
    /// Budget utilization percentage (0.0–100.0; above 100 on mandatory overflow).
    pub utilization_pct: f32,
    /// Tokens of mandatory layout content (the Phase A floor).
    pub floor_tokens: usize,
    /// Per-slot statistics, in execution order.
    pub slots: Vec<SlotStats>,
    /// Per-lane statistics, in injection order.
    pub lanes: Vec<LaneStats>,
    /// Content dropped for budget reasons.
    pub drops: Vec<DropInfo>,
}

impl RenderReport {
    pub fn slot(&self, name: &str) -> Option<&SlotStats> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn lane(&self, id: &str) -> Option<&LaneStats> {
        self.lanes.iter().find(|l| l.id == id)
    }
}

/// Statistics for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub name: String,
    pub priority: i32,
    /// Tokens the slot's plan consumed (header and footer excluded).
    pub tokens: usize,
    pub messages: usize,
    /// `forEach` items admitted, across every loop in the plan.
    pub items_included: usize,
    /// `forEach` items available after ordering and `limit`.
    pub items_total: usize,
    /// Items refused by a budget or never reached after the loop stopped.
    pub items_dropped: usize,
    /// Some content was refused by a budget.
    pub truncated: bool,
    /// The slot's `when` condition was false.
    pub skipped: bool,
}

/// Statistics for one attachment lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub id: String,
    pub tokens: usize,
    /// Requests rendered into the prompt.
    pub entries_included: usize,
    /// Requests addressed to this lane.
    pub entries_total: usize,
    /// Inserted messages (a group counts once).
    pub blocks: usize,
}

/// Information about content dropped during budget enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropInfo {
    /// `slot:<name>` or `lane:<id>`.
    pub scope: String,
    pub items_dropped: usize,
    pub reason: String,
}
