//! Data-reference resolution and condition evaluation.

use promptloom_core::SourceRegistry;
use promptloom_expr::{Scope, compare, evaluate_bool, exists, non_empty, stringify, walk};
use promptloom_template::{CompiledCondition, CompiledDataRef, RefTarget};
use serde_json::Value;

/// Resolves data references for one render.
#[derive(Clone, Copy)]
pub struct Resolver<'r> {
    registry: &'r SourceRegistry,
    context: &'r Value,
}

impl<'r> Resolver<'r> {
    pub fn new(registry: &'r SourceRegistry, context: &'r Value) -> Self {
        Self { registry, context }
    }

    pub fn context(&self) -> &'r Value {
        self.context
    }

    /// Resolve a reference. `None` means absent; a `null` result is absent too.
    pub fn resolve(&self, data_ref: &CompiledDataRef, scope: &Scope<'_>) -> Option<Value> {
        let value = match &data_ref.target {
            RefTarget::Source { name, drill } => {
                let args = data_ref.args.materialize(scope);
                let result = self.registry.resolve(name, self.context, &args)?;
                if drill.is_empty() {
                    result
                } else {
                    walk(&result, drill)?.clone()
                }
            }
            RefTarget::Scope(path) => scope.resolve(path)?.clone(),
        };
        (!value.is_null()).then_some(value)
    }

    /// Resolve a reference to message text.
    pub fn resolve_text(&self, data_ref: &CompiledDataRef, scope: &Scope<'_>) -> String {
        stringify(self.resolve(data_ref, scope).as_ref()).into_owned()
    }

    /// Resolve a reference as a sequence for `forEach`.
    ///
    /// Arrays iterate as-is, absent yields nothing, and any other value is a
    /// one-element sequence.
    pub fn resolve_items(&self, data_ref: &CompiledDataRef, scope: &Scope<'_>) -> Vec<Value> {
        match self.resolve(data_ref, scope) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        }
    }

    pub fn holds(&self, condition: &CompiledCondition, scope: &Scope<'_>) -> bool {
        match condition {
            CompiledCondition::Exists(r) => exists(self.resolve(r, scope).as_ref()),
            CompiledCondition::NonEmpty(r) => non_empty(self.resolve(r, scope).as_ref()),
            CompiledCondition::Compare { target, op, value } => {
                compare(self.resolve(target, scope).as_ref(), *op, Some(value))
            }
            CompiledCondition::Expr(expr) => evaluate_bool(expr, scope),
            CompiledCondition::All(all) => all.iter().all(|c| self.holds(c, scope)),
            CompiledCondition::Any(any) => any.iter().any(|c| self.holds(c, scope)),
            CompiledCondition::Not(inner) => !self.holds(inner, scope),
        }
    }
}
