//! Command implementations and the helpers they share.

pub mod batch;
pub mod lint;
pub mod render;
pub mod schema;

use promptloom_config::PromptloomConfig;
use promptloom_core::SourceRegistry;
use promptloom_render::{CharRatioEstimator, RenderOptions, RenderOptionsSpec, Renderer};
use promptloom_template::{CompiledTemplate, TemplateCompiler};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config(path: Option<&Path>) -> Result<PromptloomConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => PromptloomConfig::load_from(path),
        None => PromptloomConfig::load(),
    };
    config.map_err(|e| format!("Failed to load config: {e}").into())
}

pub fn read_json(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|e| format!("Failed to parse {}: {e}", path.display()).into())
}

/// Validate and compile a template file, honoring `strict_sources`.
pub fn compile_template(
    path: &Path,
    config: &PromptloomConfig,
) -> Result<CompiledTemplate, Box<dyn std::error::Error>> {
    let raw = read_json(&config.template_path(path))?;
    let compiler = match config.enforced_sources() {
        Some(names) => TemplateCompiler::new().with_allowed_sources(names.iter().cloned()),
        None => TemplateCompiler::new(),
    };
    Ok(compiler.compile_value(&raw)?)
}

pub fn load_options(path: Option<&Path>) -> Result<RenderOptions, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(RenderOptions::default());
    };
    let spec: RenderOptionsSpec = serde_json::from_value(read_json(path)?)?;
    Ok(RenderOptions::from_spec(spec)?)
}

/// Expose each top-level context field as a data source of the same name.
///
/// With an allowlist configured, only listed fields are registered.
pub fn context_registry(context: &Value, config: &PromptloomConfig) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    let Some(fields) = context.as_object() else {
        return registry;
    };
    for name in fields.keys() {
        let allowed = config
            .allowed_sources
            .as_ref()
            .is_none_or(|list| list.contains(name));
        if !allowed {
            tracing::debug!(source = %name, "context field not in allowed_sources, skipped");
            continue;
        }
        let key = name.clone();
        registry.register_fn(name.clone(), move |ctx: &Value, _args: &Value| {
            ctx.get(&key).cloned().unwrap_or(Value::Null)
        });
    }
    registry
}

pub fn renderer(registry: SourceRegistry, config: &PromptloomConfig) -> Renderer {
    Renderer::new(Arc::new(registry))
        .with_estimator(Arc::new(CharRatioEstimator::new(config.chars_per_token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_fields_become_sources() {
        let ctx = json!({"history": [1, 2], "persona": {"name": "Ava"}});
        let registry = context_registry(&ctx, &PromptloomConfig::default());
        assert_eq!(registry.names(), vec!["history", "persona"]);
        assert_eq!(
            registry.resolve("history", &ctx, &Value::Null),
            Some(json!([1, 2]))
        );
    }

    #[test]
    fn allowlist_limits_registered_sources() {
        let config = PromptloomConfig {
            allowed_sources: Some(vec!["history".into()]),
            ..PromptloomConfig::default()
        };
        let ctx = json!({"history": [], "secrets": "x"});
        let registry = context_registry(&ctx, &config);
        assert!(registry.contains("history"));
        assert!(!registry.contains("secrets"));
    }
}
