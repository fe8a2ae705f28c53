//! Error types for the promptloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each stage of the pipeline has its own error enum; [`Error`] rolls them up.

use thiserror::Error;

/// The top-level error type for all promptloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Leaf expression errors ---
    #[error("Expression error: {0}")]
    Expr(#[from] ExprError),

    // --- Template input errors ---
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    // --- Structural errors ---
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    // --- Render errors ---
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Stage errors ---

/// A leaf template string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("at offset {offset} in `{snippet}`: {reason}")]
    Syntax {
        offset: usize,
        snippet: String,
        reason: String,
    },

    #[error("at offset {offset} in `{snippet}`: {reason}")]
    Block {
        offset: usize,
        snippet: String,
        reason: String,
    },
}

impl ExprError {
    /// Byte offset of the offending token within the leaf source.
    pub fn offset(&self) -> usize {
        match self {
            Self::Syntax { offset, .. } | Self::Block { offset, .. } => *offset,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Syntax { reason, .. } | Self::Block { reason, .. } => reason,
        }
    }
}

/// One violated field reported by schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer into the template document (`/layout/2/role`).
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    #[error("built-in template schema failed to compile: {0}")]
    InvalidSchema(String),

    #[error("template violates schema ({} violations):\n{}", .0.len(), join_lines(.0))]
    Violations(Vec<SchemaViolation>),
}

impl SchemaError {
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            Self::Violations(v) => v,
            Self::InvalidSchema(_) => &[],
        }
    }
}

/// Structural problems detected while compiling a template.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("invalid leaf at {location}: {source}")]
    Leaf {
        location: String,
        source: ExprError,
    },

    #[error("layout references unknown slot '{name}'")]
    UnknownSlot { name: String },

    #[error("slot '{name}' is never referenced by the layout")]
    UnreferencedSlot { name: String },

    #[error("slot '{name}' is referenced more than once by the layout")]
    DuplicateSlotReference { name: String },

    #[error("duplicate anchor key '{key}' at {location}")]
    DuplicateAnchor { key: String, location: String },

    #[error("anchor key '{key}' at {location} is static inside a forEach and would repeat")]
    StaticAnchorInLoop { key: String, location: String },

    #[error("`prefix` at {location} requires role assistant, found {role}")]
    PrefixOnNonAssistant { location: String, role: String },

    #[error("`content` and `from` are mutually exclusive at {location}")]
    ContentAndFrom { location: String },

    #[error("message at {location} needs either `content` or `from`")]
    MissingContent { location: String },

    #[error("unknown data source '{name}' at {location}")]
    UnknownSource { name: String, location: String },

    #[error("duplicate attachment lane '{id}'")]
    DuplicateLane { id: String },

    #[error("invalid template at {location}: {reason}")]
    Invalid { location: String, reason: String },

    #[error("{} compile errors:\n{}", .0.len(), join_lines(.0))]
    Multiple(Vec<CompileError>),
}

impl CompileError {
    /// Collapse a list of issues into one error.
    ///
    /// Returns `None` for an empty list.
    pub fn from_issues(mut issues: Vec<CompileError>) -> Option<Self> {
        match issues.len() {
            0 => None,
            1 => issues.pop(),
            _ => Some(Self::Multiple(issues)),
        }
    }

    /// Flatten into the individual issues.
    pub fn issues(&self) -> Vec<&CompileError> {
        match self {
            Self::Multiple(all) => all.iter().collect(),
            other => vec![other],
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The assembler met a slot that the executor never produced a buffer for.
    #[error("no buffer was produced for slot '{slot}'")]
    MissingSlotBuffer { slot: String },
}

fn join_lines<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_roll_up() {
        let errors: Vec<Error> = vec![
            SchemaError::Violations(vec![]).into(),
            CompileError::UnknownSlot { name: "s".into() }.into(),
            RenderError::MissingSlotBuffer { slot: "s".into() }.into(),
        ];
        assert!(matches!(errors[0], Error::Schema(_)));
        assert!(matches!(errors[1], Error::Compile(_)));
        assert!(matches!(errors[2], Error::Render(_)));
    }

    #[test]
    fn expr_error_displays_offset() {
        let err = Error::Expr(ExprError::Block {
            offset: 7,
            snippet: "{{#if a}}x".into(),
            reason: "missing matching `{{#endif}}`".into(),
        });
        let text = err.to_string();
        assert!(text.contains("offset 7"));
        assert!(text.contains("{{#endif}}"));
    }

    #[test]
    fn schema_error_lists_every_violation() {
        let err = SchemaError::Violations(vec![
            SchemaViolation {
                path: "/layout/0/role".into(),
                message: "\"robot\" is not one of the allowed roles".into(),
            },
            SchemaViolation {
                path: "".into(),
                message: "\"id\" is a required property".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 violations"));
        assert!(text.contains("/layout/0/role"));
        assert!(text.contains("/: \"id\""));
    }

    #[test]
    fn compile_issues_collapse() {
        assert!(CompileError::from_issues(vec![]).is_none());

        let single = CompileError::from_issues(vec![CompileError::UnknownSlot {
            name: "history".into(),
        }])
        .unwrap();
        assert!(matches!(single, CompileError::UnknownSlot { .. }));

        let many = CompileError::from_issues(vec![
            CompileError::UnknownSlot { name: "a".into() },
            CompileError::UnreferencedSlot { name: "b".into() },
        ])
        .unwrap();
        assert_eq!(many.issues().len(), 2);
        assert!(many.to_string().starts_with("2 compile errors"));
    }
}
