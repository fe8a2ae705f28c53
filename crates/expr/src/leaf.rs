//! Leaf templates: free text with `{{expr}}` interpolations and
//! `{{#if cond}} … {{#else}} … {{#endif}}` blocks.
//!
//! A leaf is compiled once into a small node tree and then rendered many
//! times against different scopes. Rendering never fails: absent values
//! interpolate as empty strings and are falsy in conditions.

use crate::eval::{Scope, evaluate, evaluate_bool, stringify};
use crate::parser::{Expr, SyntaxError, parse_expr};
use promptloom_core::ExprError;
use std::sync::atomic::{AtomicBool, Ordering};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Width of the source excerpt attached to parse errors.
const SNIPPET_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Interpolate(Expr),
    If {
        condition: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// Result of one leaf render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafOutput {
    pub text: String,
    /// `true` when the trimmed text is non-empty.
    pub contentful: bool,
}

/// A compiled leaf template.
///
/// Immutable apart from the advisory "last render" flag, so it can be shared
/// across threads behind an `Arc`.
#[derive(Debug)]
pub struct CompiledLeaf {
    source: String,
    nodes: Vec<Node>,
    has_variables: bool,
    static_text: Option<String>,
    last_contentful: AtomicBool,
}

impl CompiledLeaf {
    /// Parse a leaf template string.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let nodes = parse_leaf(source)?;
        let has_variables = nodes.iter().any(|n| !matches!(n, Node::Text(_)));
        let static_text = (!has_variables).then(|| {
            nodes
                .iter()
                .filter_map(|n| match n {
                    Node::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect::<String>()
        });
        let initially_contentful = static_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        Ok(Self {
            source: source.to_string(),
            nodes,
            has_variables,
            static_text,
            last_contentful: AtomicBool::new(initially_contentful),
        })
    }

    /// Render against a scope.
    pub fn render(&self, scope: &Scope<'_>) -> LeafOutput {
        let mut text = String::with_capacity(self.source.len());
        render_nodes(&self.nodes, scope, &mut text);
        let contentful = !text.trim().is_empty();
        self.last_contentful.store(contentful, Ordering::Relaxed);
        LeafOutput { text, contentful }
    }

    /// Render and keep only the text.
    pub fn render_text(&self, scope: &Scope<'_>) -> String {
        self.render(scope).text
    }

    /// The template string this leaf was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Does the leaf contain any interpolation or block?
    pub fn has_variables(&self) -> bool {
        self.has_variables
    }

    /// The full text of a leaf without variables.
    pub fn static_text(&self) -> Option<&str> {
        self.static_text.as_deref()
    }

    /// Whether the most recent [`render`](Self::render) produced
    /// non-whitespace output.
    ///
    /// With concurrent renders this reflects whichever finished last; prefer
    /// [`LeafOutput::contentful`] when the leaf is shared.
    pub fn was_last_render_contentful(&self) -> bool {
        self.last_contentful.load(Ordering::Relaxed)
    }
}

/// Compile a leaf template string.
pub fn compile(source: &str) -> Result<CompiledLeaf, ExprError> {
    CompiledLeaf::compile(source)
}

/// Does the string contain leaf syntax at all?
pub fn is_templated(source: &str) -> bool {
    source.contains(OPEN)
}

fn render_nodes(nodes: &[Node], scope: &Scope<'_>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Interpolate(expr) => {
                let value = evaluate(expr, scope);
                out.push_str(&stringify(value.as_deref()));
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                if evaluate_bool(condition, scope) {
                    render_nodes(then, scope, out);
                } else {
                    render_nodes(otherwise, scope, out);
                }
            }
        }
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────

/// An `{{#if}}` waiting for its `{{#endif}}`.
struct OpenBlock {
    condition: Expr,
    offset: usize,
    then: Vec<Node>,
    otherwise: Option<Vec<Node>>,
}

enum Tag<'s> {
    If(&'s str),
    Else,
    EndIf,
    Expr(&'s str),
}

fn parse_leaf(source: &str) -> Result<Vec<Node>, ExprError> {
    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<OpenBlock> = Vec::new();
    let mut pos = 0;

    while let Some(rel) = source[pos..].find(OPEN) {
        let tag_start = pos + rel;
        if tag_start > pos {
            push_text(current(&mut root, &mut stack), &source[pos..tag_start]);
        }
        let inner_start = tag_start + OPEN.len();
        let Some(close_rel) = source[inner_start..].find(CLOSE) else {
            return Err(block_error(source, tag_start, "unterminated `{{` tag, missing `}}`"));
        };
        let inner_end = inner_start + close_rel;
        let raw = &source[inner_start..inner_end];
        let lead = raw.len() - raw.trim_start().len();
        let body_offset = inner_start + lead;

        match classify(raw.trim()).map_err(|reason| block_error(source, tag_start, &reason))? {
            Tag::If(cond_src) => {
                let cond_offset = body_offset + "#if".len() + leading_ws(&raw.trim()[3..]);
                let condition = parse_expr(cond_src)
                    .map_err(|e| syntax_error(source, cond_offset, e))?;
                stack.push(OpenBlock {
                    condition,
                    offset: tag_start,
                    then: Vec::new(),
                    otherwise: None,
                });
            }
            Tag::Else => match stack.last_mut() {
                None => return Err(block_error(source, tag_start, "stray `{{#else}}` without `{{#if}}`")),
                Some(open) if open.otherwise.is_some() => {
                    return Err(block_error(source, tag_start, "duplicate `{{#else}}` in one `{{#if}}` block"));
                }
                Some(open) => open.otherwise = Some(Vec::new()),
            },
            Tag::EndIf => {
                let Some(open) = stack.pop() else {
                    return Err(block_error(source, tag_start, "stray `{{#endif}}` without `{{#if}}`"));
                };
                let node = Node::If {
                    condition: open.condition,
                    then: open.then,
                    otherwise: open.otherwise.unwrap_or_default(),
                };
                current(&mut root, &mut stack).push(node);
            }
            Tag::Expr(expr_src) => {
                let expr = parse_expr(expr_src).map_err(|e| syntax_error(source, body_offset, e))?;
                current(&mut root, &mut stack).push(Node::Interpolate(expr));
            }
        }
        pos = inner_end + CLOSE.len();
    }

    if pos < source.len() {
        push_text(current(&mut root, &mut stack), &source[pos..]);
    }

    if let Some(open) = stack.last() {
        return Err(block_error(
            source,
            open.offset,
            "missing matching `{{#endif}}` for `{{#if}}`",
        ));
    }
    Ok(root)
}

fn classify(body: &str) -> Result<Tag<'_>, String> {
    if body.is_empty() {
        return Err("empty `{{}}` tag".into());
    }
    let Some(directive) = body.strip_prefix('#') else {
        return Ok(Tag::Expr(body));
    };
    let name_len = directive
        .find(|c: char| c.is_whitespace())
        .unwrap_or(directive.len());
    let (name, rest) = directive.split_at(name_len);
    let rest = rest.trim();
    match name {
        "if" if rest.is_empty() => Err("`{{#if}}` needs a condition".into()),
        "if" => Ok(Tag::If(rest)),
        "else" | "endif" if !rest.is_empty() => {
            Err(format!("`{{{{#{name}}}}}` takes no arguments"))
        }
        "else" => Ok(Tag::Else),
        "endif" => Ok(Tag::EndIf),
        other => Err(format!("unknown block `{{{{#{other}}}}}`")),
    }
}

fn leading_ws(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

/// The node list new content is appended to.
fn current<'n>(root: &'n mut Vec<Node>, stack: &'n mut [OpenBlock]) -> &'n mut Vec<Node> {
    match stack.last_mut() {
        Some(open) => match &mut open.otherwise {
            Some(otherwise) => otherwise,
            None => &mut open.then,
        },
        None => root,
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if let Some(Node::Text(prev)) = nodes.last_mut() {
        prev.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn snippet(source: &str, offset: usize) -> String {
    if source.chars().count() <= SNIPPET_CHARS {
        return source.to_string();
    }
    let start = source
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i + SNIPPET_CHARS / 3 <= offset)
        .last()
        .unwrap_or(0);
    let excerpt: String = source[start..].chars().take(SNIPPET_CHARS).collect();
    let prefix = if start > 0 { "…" } else { "" };
    let suffix = if start + excerpt.len() < source.len() { "…" } else { "" };
    format!("{prefix}{excerpt}{suffix}")
}

fn block_error(source: &str, offset: usize, reason: &str) -> ExprError {
    ExprError::Block {
        offset,
        snippet: snippet(source, offset),
        reason: reason.to_string(),
    }
}

fn syntax_error(source: &str, base: usize, err: SyntaxError) -> ExprError {
    let offset = base + err.offset;
    ExprError::Syntax {
        offset,
        snippet: snippet(source, offset),
        reason: err.reason,
    }
}
