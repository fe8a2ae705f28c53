//! `promptloom lint`: validate and compile a template without rendering it.

use super::{CommandResult, read_json};
use promptloom_config::PromptloomConfig;
use promptloom_core::Error;
use promptloom_template::{Template, TemplateCompiler, validate_template};
use std::path::Path;

pub fn run(template: &Path, sources: Option<Vec<String>>, config: &PromptloomConfig) -> CommandResult {
    let path = config.template_path(template);
    println!("🔍 Linting {}", path.display());
    let raw = read_json(&path)?;

    if let Err(e) = validate_template(&raw) {
        println!("   ❌ Schema: {} violation(s)", e.violations().len().max(1));
        if e.violations().is_empty() {
            println!("      {e}");
        }
        for v in e.violations() {
            let at = if v.path.is_empty() { "/" } else { v.path.as_str() };
            println!("      {at} {}", v.message);
        }
        return Err(Error::from(e).into());
    }
    println!("   ✅ Schema valid");

    let parsed: Template = serde_json::from_value(raw)?;
    let allowlist = sources.or_else(|| config.allowed_sources.clone());
    let compiler = match &allowlist {
        Some(names) => TemplateCompiler::new().with_allowed_sources(names.iter().cloned()),
        None => TemplateCompiler::new(),
    };

    match compiler.compile(&parsed) {
        Ok(compiled) => {
            println!("   ✅ Compiled {} v{}", compiled.id, compiled.version);
            println!("   Layout nodes:  {}", compiled.layout.len());
            println!("   Slots:         {}", compiled.slots.len());
            println!("   Lanes:         {}", compiled.lanes.len());
            let order: Vec<&str> = compiled
                .slots_by_priority()
                .map(|slot| slot.name.as_str())
                .collect();
            if !order.is_empty() {
                println!("   Fill order:    {}", order.join(" → "));
            }
            Ok(())
        }
        Err(e) => {
            let issues = e.issues();
            println!("   ❌ {} compile error(s)", issues.len());
            for issue in issues {
                println!("      {issue}");
            }
            Err(Error::from(e).into())
        }
    }
}
