//! `promptloom schema`: print the template JSON Schema.

use super::CommandResult;
use promptloom_template::template_schema;

pub fn run() -> CommandResult {
    println!("{}", serde_json::to_string_pretty(&template_schema())?);
    Ok(())
}
