//! Token budget ledger for one render.
//!
//! The ledger tracks three things against `max_tokens`:
//!
//! - **consumed**: tokens charged for content already emitted
//! - **floors**: named reservations for mandatory content that has not been
//!   emitted yet (layout messages, slot headers, lane reserves)
//! - **scopes**: nested caps (a slot budget, a `forEach` budget) that narrow
//!   what discretionary content may take
//!
//! Discretionary content only goes in when it fits every level. Floors are
//! never refused: mandatory content larger than the whole budget is still
//! recorded (with a warning) and simply leaves nothing for anything else.

use crate::token::CharRatioEstimator;
use promptloom_core::TokenEstimator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Level of the render-wide ledger. Nested scopes are numbered from 1.
pub const GLOBAL_LEVEL: usize = 0;

/// Content did not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// The outermost level that could not take the content.
    pub level: usize,
    /// Estimated cost of the refused content.
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy)]
struct ScopeCap {
    limit: usize,
    consumed: usize,
}

/// Saved consumption state, see [`Budget::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    consumed: usize,
    scopes: Vec<usize>,
}

pub struct Budget {
    max_tokens: usize,
    consumed: usize,
    floors: BTreeMap<String, usize>,
    scopes: Vec<ScopeCap>,
    estimator: Arc<dyn TokenEstimator>,
}

impl Budget {
    pub fn new(max_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            max_tokens,
            consumed: 0,
            floors: BTreeMap::new(),
            scopes: Vec::new(),
            estimator,
        }
    }

    /// A budget priced with [`CharRatioEstimator::default`].
    pub fn with_default_estimator(max_tokens: usize) -> Self {
        Self::new(max_tokens, Arc::new(CharRatioEstimator::default()))
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn estimate(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    // ── Capacity ──────────────────────────────────────────────────────────

    /// Total of all unreleased floors.
    pub fn floors_total(&self) -> usize {
        self.floors.values().sum()
    }

    pub fn floor(&self, key: &str) -> Option<usize> {
        self.floors.get(key).copied()
    }

    fn global_remaining(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.consumed)
            .saturating_sub(self.floors_total())
    }

    /// Tokens available to discretionary content at the innermost level.
    pub fn remaining(&self) -> usize {
        self.scopes
            .iter()
            .map(|s| s.limit.saturating_sub(s.consumed))
            .fold(self.global_remaining(), usize::min)
    }

    pub fn has_any(&self) -> bool {
        self.remaining() > 0
    }

    /// The outermost level that cannot take `tokens`, if any.
    pub fn refusal_level(&self, tokens: usize) -> Option<usize> {
        if tokens > self.global_remaining() {
            return Some(GLOBAL_LEVEL);
        }
        self.scopes
            .iter()
            .position(|s| tokens > s.limit.saturating_sub(s.consumed))
            .map(|i| i + 1)
    }

    pub fn can_fit(&self, tokens: usize) -> bool {
        self.refusal_level(tokens).is_none()
    }

    pub fn can_fit_token_estimate(&self, text: &str) -> bool {
        self.can_fit(self.estimate(text))
    }

    // ── Consumption ───────────────────────────────────────────────────────

    /// Charge discretionary content if it fits every level.
    pub fn consume(&mut self, text: &str) -> Result<usize, Exhausted> {
        let tokens = self.estimate(text);
        if let Some(level) = self.refusal_level(tokens) {
            trace!(tokens, level, "budget refused content");
            return Err(Exhausted { level, tokens });
        }
        self.charge(tokens);
        Ok(tokens)
    }

    fn charge(&mut self, tokens: usize) {
        self.consumed += tokens;
        for scope in &mut self.scopes {
            scope.consumed += tokens;
        }
    }

    // ── Floors ────────────────────────────────────────────────────────────

    /// Reserve mandatory capacity under `key`. Repeated keys accumulate.
    pub fn reserve_floor(&mut self, key: impl Into<String>, tokens: usize) {
        let key = key.into();
        *self.floors.entry(key.clone()).or_default() += tokens;
        let committed = self.consumed + self.floors_total();
        if committed > self.max_tokens {
            warn!(
                floor = %key,
                committed,
                max_tokens = self.max_tokens,
                "mandatory content exceeds the budget"
            );
        }
    }

    /// Drop a floor whose content will not be emitted. Returns its size.
    pub fn release_floor(&mut self, key: &str) -> usize {
        self.floors.remove(key).unwrap_or(0)
    }

    /// Emit the content a floor protected: release the floor and charge the
    /// content's actual cost without a fit check.
    pub fn consume_floor(&mut self, key: &str, text: &str) -> usize {
        self.release_floor(key);
        let tokens = self.estimate(text);
        self.charge(tokens);
        tokens
    }

    // ── Nesting ───────────────────────────────────────────────────────────

    /// Open a nested cap of `limit` tokens. Returns its level.
    ///
    /// Every `enter_scope` must be paired with [`exit_scope`](Self::exit_scope);
    /// prefer [`scoped`](Self::scoped) where a closure fits.
    pub fn enter_scope(&mut self, limit: usize) -> usize {
        self.scopes.push(ScopeCap { limit, consumed: 0 });
        self.scopes.len()
    }

    pub fn exit_scope(&mut self) {
        self.scopes.pop();
    }

    /// Level of the innermost open scope.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Run `f` inside a nested cap.
    pub fn scoped<R>(&mut self, limit: usize, f: impl FnOnce(&mut Budget) -> R) -> R {
        self.enter_scope(limit);
        let result = f(self);
        self.exit_scope();
        result
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            consumed: self.consumed,
            scopes: self.scopes.iter().map(|s| s.consumed).collect(),
        }
    }

    /// Undo consumption since `checkpoint`. Floors are untouched.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.consumed = checkpoint.consumed;
        for (scope, consumed) in self.scopes.iter_mut().zip(&checkpoint.scopes) {
            scope.consumed = *consumed;
        }
    }
}

impl std::fmt::Debug for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Budget")
            .field("max_tokens", &self.max_tokens)
            .field("consumed", &self.consumed)
            .field("floors", &self.floors)
            .field("depth", &self.scopes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_char(max: usize) -> Budget {
        Budget::new(max, Arc::new(|text: &str| text.chars().count()))
    }

    #[test]
    fn consume_until_full() {
        let mut budget = per_char(10);
        assert!(budget.has_any());
        assert_eq!(budget.consume("hello"), Ok(5));
        assert!(budget.can_fit_token_estimate("world"));
        assert!(!budget.can_fit_token_estimate("world!"));
        assert_eq!(budget.consume("world"), Ok(5));
        assert!(!budget.has_any());
        assert_eq!(
            budget.consume("x"),
            Err(Exhausted {
                level: GLOBAL_LEVEL,
                tokens: 1
            })
        );
        assert_eq!(budget.consumed(), 10);
    }

    #[test]
    fn floors_are_pre_subtracted() {
        let mut budget = per_char(10);
        budget.reserve_floor("intro", 4);
        assert_eq!(budget.remaining(), 6);
        assert!(budget.consume("sevenxx").is_err());

        assert_eq!(budget.release_floor("intro"), 4);
        assert_eq!(budget.remaining(), 10);
        assert_eq!(budget.release_floor("intro"), 0);
    }

    #[test]
    fn consume_floor_charges_actual_cost() {
        let mut budget = per_char(10);
        budget.reserve_floor("intro", 5);
        assert_eq!(budget.consume_floor("intro", "Intro"), 5);
        assert_eq!(budget.floor("intro"), None);
        assert_eq!(budget.consumed(), 5);
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn mandatory_overflow_blocks_discretionary_content() {
        let mut budget = per_char(0);
        budget.reserve_floor("intro", 5);
        budget.consume_floor("intro", "Intro");
        assert_eq!(budget.consumed(), 5);
        assert!(!budget.has_any());
        assert!(budget.consume("a").is_err());
    }

    #[test]
    fn repeated_floor_keys_accumulate() {
        let mut budget = per_char(10);
        budget.reserve_floor("lane:lore", 2);
        budget.reserve_floor("lane:lore", 3);
        assert_eq!(budget.floor("lane:lore"), Some(5));
        assert_eq!(budget.floors_total(), 5);
    }

    #[test]
    fn nested_scopes_report_outermost_refusal() {
        let mut budget = per_char(10);
        budget.scoped(6, |slot| {
            assert_eq!(slot.depth(), 1);
            slot.scoped(3, |each| {
                assert_eq!(each.remaining(), 3);
                // Fits nothing above 3: the innermost cap refuses.
                assert_eq!(each.consume("four").unwrap_err().level, 2);
                assert_eq!(each.consume("abc"), Ok(3));
                // 7 exceeds both the slot cap (3 left) and the item cap (0 left):
                // the slot level is reported.
                assert_eq!(each.refusal_level(7), Some(1));
                // 11 exceeds the global ledger as well.
                assert_eq!(each.refusal_level(11), Some(GLOBAL_LEVEL));
            });
            assert_eq!(slot.remaining(), 3);
        });
        assert_eq!(budget.depth(), 0);
        assert_eq!(budget.remaining(), 7);
    }

    #[test]
    fn rollback_restores_every_level() {
        let mut budget = per_char(20);
        let level = budget.enter_scope(10);
        assert_eq!(level, 1);
        budget.consume("abc").unwrap();
        let checkpoint = budget.checkpoint();
        budget.consume("defgh").unwrap();
        assert_eq!(budget.remaining(), 2);
        budget.rollback(&checkpoint);
        assert_eq!(budget.remaining(), 7);
        assert_eq!(budget.consumed(), 3);
        budget.exit_scope();
        assert_eq!(budget.remaining(), 17);
    }

    #[test]
    fn default_estimator_is_char_ratio() {
        let budget = Budget::with_default_estimator(100);
        assert_eq!(budget.estimate("hello"), 2);
    }
}
