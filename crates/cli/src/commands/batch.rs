//! `promptloom batch`: render every context file in a directory.
//!
//! The template is compiled once and shared; each context renders on its
//! own blocking task with its own budget.

use super::{CommandResult, compile_template, context_registry, load_options, read_json, renderer};
use promptloom_config::PromptloomConfig;
use promptloom_render::RenderOptions;
use promptloom_template::CompiledTemplate;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn run(
    template: &Path,
    contexts: &Path,
    budget: Option<usize>,
    options: Option<&Path>,
    config: &PromptloomConfig,
) -> CommandResult {
    let template = Arc::new(compile_template(template, config)?);
    let options = Arc::new(load_options(options)?);
    let config = Arc::new(config.clone());
    let budget = budget.unwrap_or(config.max_tokens);

    let files = context_files(contexts)?;
    tracing::info!(template = %template.id, files = files.len(), budget, "batch render");

    let mut handles = Vec::with_capacity(files.len());
    for file in files {
        let template = Arc::clone(&template);
        let options = Arc::clone(&options);
        let config = Arc::clone(&config);
        handles.push(tokio::task::spawn_blocking(move || {
            let result = render_file(&file, &template, budget, &options, &config);
            (file, result)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut failures = 0;
    for handle in handles {
        let (file, result) = handle.await?;
        let name = file.display().to_string();
        match result {
            Ok(messages) => results.push(json!({"context": name, "messages": messages})),
            Err(e) => {
                failures += 1;
                tracing::warn!(context = %name, error = %e, "render failed");
                results.push(json!({"context": name, "error": e}));
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    if failures > 0 {
        return Err(format!("{failures} context(s) failed to render").into());
    }
    Ok(())
}

fn render_file(
    file: &Path,
    template: &CompiledTemplate,
    budget: usize,
    options: &RenderOptions,
    config: &PromptloomConfig,
) -> Result<Value, String> {
    let context = read_json(file).map_err(|e| e.to_string())?;
    let renderer = renderer(context_registry(&context, config), config);
    let messages = renderer
        .render(template, &context, budget, options)
        .map_err(|e| e.to_string())?;
    serde_json::to_value(messages).map_err(|e| e.to_string())
}

/// `*.json` files in `dir`, sorted by name.
fn context_files(dir: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("Failed to read {}: {e}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
