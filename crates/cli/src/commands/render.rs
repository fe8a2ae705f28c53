//! `promptloom render`: render one template against one context.

use super::{CommandResult, compile_template, context_registry, load_options, read_json, renderer};
use promptloom_config::PromptloomConfig;
use std::path::Path;

pub struct RenderArgs<'a> {
    pub template: &'a Path,
    pub context: &'a Path,
    pub budget: Option<usize>,
    pub options: Option<&'a Path>,
    pub detailed: bool,
}

pub fn run(args: RenderArgs<'_>, config: &PromptloomConfig) -> CommandResult {
    let template = compile_template(args.template, config)?;
    let context = read_json(args.context)?;
    let options = load_options(args.options)?;
    let budget = args.budget.unwrap_or(config.max_tokens);

    let renderer = renderer(context_registry(&context, config), config);
    let output = renderer.render_detailed(&template, &context, budget, &options)?;

    tracing::info!(
        template = %template.id,
        messages = output.messages.len(),
        tokens = output.report.total_tokens,
        budget,
        "rendered"
    );

    let json = if args.detailed {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string_pretty(&output.messages)?
    };
    println!("{json}");
    Ok(())
}
