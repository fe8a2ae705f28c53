//! DataSource trait: the abstraction over runtime data a template reads.
//!
//! Slots iterate over sources (`turns`, `characters`, `lore`, ...) and
//! conditions test them. The renderer never looks inside a source; it only
//! calls through [`SourceRegistry::resolve`].
//!
//! Sources are synchronous. Anything that needs I/O must be fetched by the
//! caller before the render starts and handed over inside the context.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named resolver over the render context.
pub trait DataSource: Send + Sync {
    /// The unique name templates use to reference this source.
    fn name(&self) -> &str;

    /// Resolve the source for one render.
    ///
    /// Returns a scalar, an object, or an array (a sequence for `forEach`).
    /// `Value::Null` means "nothing here" and is treated as absent.
    fn resolve(&self, context: &Value, args: &Value) -> Value;
}

/// Adapter turning a closure into a [`DataSource`].
pub struct FnSource<F> {
    name: String,
    resolver: F,
}

impl<F> FnSource<F>
where
    F: Fn(&Value, &Value) -> Value + Send + Sync,
{
    pub fn new(name: impl Into<String>, resolver: F) -> Self {
        Self {
            name: name.into(),
            resolver,
        }
    }
}

impl<F> DataSource for FnSource<F>
where
    F: Fn(&Value, &Value) -> Value + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, context: &Value, args: &Value) -> Value {
        (self.resolver)(context, args)
    }
}

/// A registry of available data sources.
///
/// Built once at startup and shared read-only (`Arc<SourceRegistry>`)
/// between concurrent renders.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source. Replaces any existing source with the same name.
    pub fn register(&mut self, source: impl DataSource + 'static) {
        let name = source.name().to_string();
        self.sources.insert(name, Arc::new(source));
    }

    /// Register a closure as a source.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, resolver: F)
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.register(FnSource::new(name, resolver));
    }

    /// Builder-style [`register_fn`](Self::register_fn).
    pub fn with_fn<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.register_fn(name, resolver);
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn DataSource> {
        self.sources.get(name).map(|s| s.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Resolve a source by name. `None` if the source is not registered.
    pub fn resolve(&self, name: &str, context: &Value, args: &Value) -> Option<Value> {
        match self.sources.get(name) {
            Some(source) => Some(source.resolve(context, args)),
            None => {
                tracing::debug!(source = name, "data source not registered");
                None
            }
        }
    }

    /// List all registered source names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Reads `context.turns`, honouring an optional `limit` arg.
    struct TurnsSource;

    impl DataSource for TurnsSource {
        fn name(&self) -> &str {
            "turns"
        }

        fn resolve(&self, context: &Value, args: &Value) -> Value {
            let turns = context["turns"].as_array().cloned().unwrap_or_default();
            match args["limit"].as_u64() {
                Some(limit) => Value::Array(turns.into_iter().take(limit as usize).collect()),
                None => Value::Array(turns),
            }
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = SourceRegistry::new();
        registry.register(TurnsSource);
        assert!(registry.get("turns").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert!(registry.contains("turns"));
    }

    #[test]
    fn registry_resolves_with_args() {
        let mut registry = SourceRegistry::new();
        registry.register(TurnsSource);
        let ctx = json!({"turns": [1, 2, 3]});

        let all = registry.resolve("turns", &ctx, &Value::Null).unwrap();
        assert_eq!(all, json!([1, 2, 3]));

        let limited = registry.resolve("turns", &ctx, &json!({"limit": 2})).unwrap();
        assert_eq!(limited, json!([1, 2]));
    }

    #[test]
    fn registry_missing_source_is_none() {
        let registry = SourceRegistry::new();
        assert!(registry.resolve("lore", &json!({}), &Value::Null).is_none());
    }

    #[test]
    fn closures_register_and_names_are_sorted() {
        let registry = SourceRegistry::new()
            .with_fn("zeta", |_, _| json!(1))
            .with_fn("alpha", |ctx, _| ctx["alpha"].clone());
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert_eq!(
            registry.resolve("alpha", &json!({"alpha": "a"}), &Value::Null),
            Some(json!("a"))
        );
    }
}
