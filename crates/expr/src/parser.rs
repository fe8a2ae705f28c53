//! Expression tokenizer and parser.
//!
//! Expressions appear inside `{{ ... }}` interpolations and `{{#if ...}}`
//! blocks:
//!
//! ```text
//! user.name
//! turns[0].speaker == "narrator"
//! !(scene.isNight) && mood != 'calm'
//! score >= -2.5 || globals.debug
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr    = and ("||" and)*
//! and     = cmp ("&&" cmp)*
//! cmp     = unary (CMP unary)*
//! unary   = "!" unary | primary
//! primary = literal | path | "(" expr ")"
//! path    = IDENT ("." (IDENT | INT) | "[" (STRING | INT) "]")*
//! CMP     = "==" | "!=" | "<" | ">" | "<=" | ">="
//! literal = QUOTED_STRING | NUMBER | "true" | "false" | "null"
//! ```

use serde_json::Value;

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A string, number, boolean or null literal.
    Literal(Value),
    /// A lookup into the scope.
    Path(Path),
    /// Logical negation.
    Not(Box<Expr>),
    /// A comparison between two operands.
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    /// Logical AND of two sub-expressions.
    And(Box<Expr>, Box<Expr>),
    /// Logical OR of two sub-expressions.
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Does evaluating this expression read from the scope?
    pub fn reads_scope(&self) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Path(_) => true,
            Expr::Not(inner) => inner.reads_scope(),
            Expr::Compare(a, _, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.reads_scope() || b.reads_scope()
            }
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    Lte,
    Gte,
}

/// A dotted/bracketed lookup path such as `a.b[0]["c d"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// The top-level key, looked up in the scope (then in `globals`).
    pub head: String,
    /// Steps taken from the head value.
    pub segments: Vec<Segment>,
}

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Path {
    /// Parse a standalone path (used by data references and `sortBy`).
    pub fn parse(input: &str) -> Result<Path, SyntaxError> {
        let tokens = tokenize(input)?;
        let (path, rest) = parse_path(&tokens, input.len())?;
        if let Some(tok) = rest.first() {
            return Err(SyntaxError::new(
                tok.offset,
                format!("unexpected {} after path", tok.kind.describe()),
            ));
        }
        Ok(path)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.head)?;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) if is_plain_ident(k) => write!(f, ".{k}")?,
                Segment::Key(k) => write!(f, "[{k:?}]")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// A syntax error with the byte offset it occurred at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub offset: usize,
    pub reason: String,
}

impl SyntaxError {
    fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Parse an expression string into an [`Expr`] tree.
pub fn parse_expr(input: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SyntaxError::new(0, "empty expression"));
    }
    let end = input.len();
    let (expr, rest) = parse_or(&tokens, end)?;
    if let Some(tok) = rest.first() {
        return Err(SyntaxError::new(
            tok.offset,
            format!("unexpected {} after expression", tok.kind.describe()),
        ));
    }
    Ok(expr)
}

/// Token types for the expression language.
#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Str(s) => format!("string {s:?}"),
            TokenKind::Num(n) => format!("number {n}"),
            TokenKind::True => "`true`".into(),
            TokenKind::False => "`false`".into(),
            TokenKind::Null => "`null`".into(),
            TokenKind::And => "`&&`".into(),
            TokenKind::Or => "`||`".into(),
            TokenKind::Not => "`!`".into(),
            TokenKind::Eq => "`==`".into(),
            TokenKind::NotEq => "`!=`".into(),
            TokenKind::Gt => "`>`".into(),
            TokenKind::Lt => "`<`".into(),
            TokenKind::Gte => "`>=`".into(),
            TokenKind::Lte => "`<=`".into(),
            TokenKind::Dot => "`.`".into(),
            TokenKind::LBracket => "`[`".into(),
            TokenKind::RBracket => "`]`".into(),
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |at: usize| chars.get(at).map(|&(_, c)| c);

    while let Some(&(offset, c)) = chars.get(i) {
        let single = |kind: TokenKind| Token { kind, offset };
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(single(TokenKind::LParen));
                i += 1;
            }
            ')' => {
                tokens.push(single(TokenKind::RParen));
                i += 1;
            }
            '[' => {
                tokens.push(single(TokenKind::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push(single(TokenKind::RBracket));
                i += 1;
            }
            '.' => {
                tokens.push(single(TokenKind::Dot));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match peek(i) {
                        Some('\\') => {
                            match peek(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(escaped) => s.push(escaped),
                                None => {
                                    return Err(SyntaxError::new(
                                        offset,
                                        "unterminated string literal",
                                    ));
                                }
                            }
                            i += 2;
                        }
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(SyntaxError::new(offset, "unterminated string literal"));
                        }
                    }
                }
                tokens.push(single(TokenKind::Str(s)));
            }
            '>' | '<' => {
                let with_eq = peek(i + 1) == Some('=');
                let kind = match (c, with_eq) {
                    ('>', true) => TokenKind::Gte,
                    ('>', false) => TokenKind::Gt,
                    ('<', true) => TokenKind::Lte,
                    _ => TokenKind::Lt,
                };
                tokens.push(single(kind));
                i += if with_eq { 2 } else { 1 };
            }
            '=' => {
                if peek(i + 1) != Some('=') {
                    return Err(SyntaxError::new(offset, "expected `==`, found single `=`"));
                }
                tokens.push(single(TokenKind::Eq));
                i += 2;
            }
            '!' => {
                if peek(i + 1) == Some('=') {
                    tokens.push(single(TokenKind::NotEq));
                    i += 2;
                } else {
                    tokens.push(single(TokenKind::Not));
                    i += 1;
                }
            }
            '&' | '|' => {
                if peek(i + 1) != Some(c) {
                    return Err(SyntaxError::new(
                        offset,
                        format!("expected `{c}{c}`, found single `{c}`"),
                    ));
                }
                tokens.push(single(if c == '&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }));
                i += 2;
            }
            _ if c.is_ascii_digit() || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let mut num_str = String::new();
                num_str.push(c);
                i += 1;
                while let Some(nc) = peek(i) {
                    let fraction_dot =
                        nc == '.' && peek(i + 1).is_some_and(|d| d.is_ascii_digit());
                    if nc.is_ascii_digit() || fraction_dot {
                        num_str.push(nc);
                        i += 1;
                    } else {
                        break;
                    }
                }
                match num_str.parse::<f64>() {
                    Ok(n) => tokens.push(single(TokenKind::Num(n))),
                    Err(_) => {
                        return Err(SyntaxError::new(offset, format!("invalid number: {num_str}")));
                    }
                }
            }
            _ if is_ident_char(c) => {
                let mut word = String::new();
                while let Some(wc) = peek(i) {
                    if is_ident_char(wc) {
                        word.push(wc);
                        i += 1;
                    } else {
                        break;
                    }
                }
                let kind = match word.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    _ => TokenKind::Ident(word),
                };
                tokens.push(single(kind));
            }
            _ => return Err(SyntaxError::new(offset, format!("unexpected character `{c}`"))),
        }
    }

    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_plain_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(is_ident_char)
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// Offset of the next token, or the end of input.
fn offset_of(tokens: &[Token], end: usize) -> usize {
    tokens.first().map_or(end, |t| t.offset)
}

fn found(tokens: &[Token]) -> String {
    tokens
        .first()
        .map_or_else(|| "end of expression".to_string(), |t| t.kind.describe())
}

fn parse_or(tokens: &[Token], end: usize) -> Result<(Expr, &[Token]), SyntaxError> {
    let (mut left, mut rest) = parse_and(tokens, end)?;
    while rest.first().map(|t| &t.kind) == Some(&TokenKind::Or) {
        let (right, remaining) = parse_and(&rest[1..], end)?;
        left = Expr::Or(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token], end: usize) -> Result<(Expr, &[Token]), SyntaxError> {
    let (mut left, mut rest) = parse_cmp(tokens, end)?;
    while rest.first().map(|t| &t.kind) == Some(&TokenKind::And) {
        let (right, remaining) = parse_cmp(&rest[1..], end)?;
        left = Expr::And(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_cmp(tokens: &[Token], end: usize) -> Result<(Expr, &[Token]), SyntaxError> {
    let (mut left, mut rest) = parse_unary(tokens, end)?;
    while let Some(op) = rest.first().and_then(|t| cmp_op(&t.kind)) {
        let (right, remaining) = parse_unary(&rest[1..], end)?;
        left = Expr::Compare(Box::new(left), op, Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn cmp_op(kind: &TokenKind) -> Option<CmpOp> {
    match kind {
        TokenKind::Eq => Some(CmpOp::Eq),
        TokenKind::NotEq => Some(CmpOp::NotEq),
        TokenKind::Lt => Some(CmpOp::Lt),
        TokenKind::Gt => Some(CmpOp::Gt),
        TokenKind::Lte => Some(CmpOp::Lte),
        TokenKind::Gte => Some(CmpOp::Gte),
        _ => None,
    }
}

fn parse_unary(tokens: &[Token], end: usize) -> Result<(Expr, &[Token]), SyntaxError> {
    if tokens.first().map(|t| &t.kind) == Some(&TokenKind::Not) {
        let (inner, rest) = parse_unary(&tokens[1..], end)?;
        return Ok((Expr::Not(Box::new(inner)), rest));
    }
    parse_primary(tokens, end)
}

fn parse_primary(tokens: &[Token], end: usize) -> Result<(Expr, &[Token]), SyntaxError> {
    let Some(first) = tokens.first() else {
        return Err(SyntaxError::new(end, "expected a value, found end of expression"));
    };
    let rest = &tokens[1..];
    match &first.kind {
        TokenKind::LParen => {
            let (inner, rest) = parse_or(rest, end)?;
            match rest.first() {
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => Ok((inner, &rest[1..])),
                _ => Err(SyntaxError::new(
                    offset_of(rest, end),
                    format!("expected closing parenthesis, found {}", found(rest)),
                )),
            }
        }
        TokenKind::Str(s) => Ok((Expr::Literal(Value::String(s.clone())), rest)),
        TokenKind::Num(n) => Ok((Expr::Literal(number_value(*n)), rest)),
        TokenKind::True => Ok((Expr::Literal(Value::Bool(true)), rest)),
        TokenKind::False => Ok((Expr::Literal(Value::Bool(false)), rest)),
        TokenKind::Null => Ok((Expr::Literal(Value::Null), rest)),
        TokenKind::Ident(_) => {
            let (path, rest) = parse_path(tokens, end)?;
            Ok((Expr::Path(path), rest))
        }
        other => Err(SyntaxError::new(
            first.offset,
            format!("expected a value, found {}", other.describe()),
        )),
    }
}

fn parse_path(tokens: &[Token], end: usize) -> Result<(Path, &[Token]), SyntaxError> {
    let head = match tokens.first() {
        Some(Token {
            kind: TokenKind::Ident(name),
            ..
        }) => name.clone(),
        _ => {
            return Err(SyntaxError::new(
                offset_of(tokens, end),
                format!("expected identifier, found {}", found(tokens)),
            ));
        }
    };

    let mut segments = Vec::new();
    let mut rest = &tokens[1..];
    loop {
        match rest.first().map(|t| &t.kind) {
            Some(TokenKind::Dot) => {
                let after = &rest[1..];
                match after.first() {
                    Some(Token {
                        kind: TokenKind::Ident(key),
                        ..
                    }) => segments.push(Segment::Key(key.clone())),
                    Some(Token {
                        kind: TokenKind::Num(n),
                        offset,
                    }) => segments.push(Segment::Index(index_value(*n, *offset)?)),
                    // `a.true` is still a key, not a literal.
                    Some(Token {
                        kind: kw @ (TokenKind::True | TokenKind::False | TokenKind::Null),
                        ..
                    }) => segments.push(Segment::Key(keyword_text(kw).to_string())),
                    _ => {
                        return Err(SyntaxError::new(
                            offset_of(after, end),
                            format!("expected property name after `.`, found {}", found(after)),
                        ));
                    }
                }
                rest = &after[1..];
            }
            Some(TokenKind::LBracket) => {
                let after = &rest[1..];
                let segment = match after.first() {
                    Some(Token {
                        kind: TokenKind::Str(key),
                        ..
                    }) => Segment::Key(key.clone()),
                    Some(Token {
                        kind: TokenKind::Num(n),
                        offset,
                    }) => Segment::Index(index_value(*n, *offset)?),
                    _ => {
                        return Err(SyntaxError::new(
                            offset_of(after, end),
                            format!("expected string or index inside `[]`, found {}", found(after)),
                        ));
                    }
                };
                let close = &after[1..];
                match close.first() {
                    Some(Token {
                        kind: TokenKind::RBracket,
                        ..
                    }) => {}
                    _ => {
                        return Err(SyntaxError::new(
                            offset_of(close, end),
                            format!("expected `]`, found {}", found(close)),
                        ));
                    }
                }
                segments.push(segment);
                rest = &close[1..];
            }
            _ => break,
        }
    }
    Ok((Path { head, segments }, rest))
}

fn keyword_text(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::True => "true",
        TokenKind::False => "false",
        _ => "null",
    }
}

fn index_value(n: f64, offset: usize) -> Result<usize, SyntaxError> {
    if n < 0.0 || n.fract() != 0.0 {
        return Err(SyntaxError::new(
            offset,
            format!("index must be a non-negative integer, found {n}"),
        ));
    }
    Ok(n as usize)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn path(head: &str, segments: Vec<Segment>) -> Expr {
        Expr::Path(Path {
            head: head.into(),
            segments,
        })
    }

    #[test]
    fn parse_dotted_and_bracket_path() {
        let expr = parse_expr(r#"a.b[0]["c d"].e"#).unwrap();
        assert_eq!(
            expr,
            path(
                "a",
                vec![
                    Segment::Key("b".into()),
                    Segment::Index(0),
                    Segment::Key("c d".into()),
                    Segment::Key("e".into()),
                ]
            )
        );
    }

    #[test]
    fn parse_numeric_dot_index() {
        let expr = parse_expr("turns.2.text").unwrap();
        assert_eq!(
            expr,
            path(
                "turns",
                vec![Segment::Index(2), Segment::Key("text".into())]
            )
        );
    }

    #[test]
    fn parse_literals() {
        assert_eq!(parse_expr("'it\\'s'").unwrap(), Expr::Literal("it's".into()));
        assert_eq!(parse_expr("\"a\\\"b\"").unwrap(), Expr::Literal("a\"b".into()));
        assert_eq!(parse_expr("-3").unwrap(), Expr::Literal(Value::from(-3)));
        assert_eq!(parse_expr("2.5").unwrap(), Expr::Literal(Value::from(2.5)));
        assert_eq!(parse_expr("true").unwrap(), Expr::Literal(Value::Bool(true)));
        assert_eq!(parse_expr("null").unwrap(), Expr::Literal(Value::Null));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse_expr("a || b && c").unwrap();
        match expr {
            Expr::Or(left, right) => {
                assert_eq!(*left, path("a", vec![]));
                assert!(matches!(*right, Expr::And(_, _)));
            }
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse_expr("(a || b) && c").unwrap();
        match expr {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Or(_, _))),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn negation_binds_to_operand() {
        let expr = parse_expr("!a == false").unwrap();
        match expr {
            Expr::Compare(left, CmpOp::Eq, _) => assert!(matches!(*left, Expr::Not(_))),
            other => panic!("expected Compare, got {other:?}"),
        }
    }

    #[test]
    fn comparison_operators() {
        for (src, op) in [
            ("a == 1", CmpOp::Eq),
            ("a != 1", CmpOp::NotEq),
            ("a < 1", CmpOp::Lt),
            ("a > 1", CmpOp::Gt),
            ("a <= 1", CmpOp::Lte),
            ("a >= 1", CmpOp::Gte),
        ] {
            match parse_expr(src).unwrap() {
                Expr::Compare(_, parsed, _) => assert_eq!(parsed, op, "{src}"),
                other => panic!("{src}: expected Compare, got {other:?}"),
            }
        }
    }

    #[test]
    fn errors_carry_offsets() {
        let err = parse_expr("a = 1").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.reason.contains("single `=`"));

        let err = parse_expr("(a && b").unwrap_err();
        assert_eq!(err.offset, 7);
        assert!(err.reason.contains("closing parenthesis"));

        let err = parse_expr("'open").unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.reason.contains("unterminated"));

        let err = parse_expr("a b").unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn invalid_expressions_reject() {
        assert!(parse_expr("").is_err());
        assert!(parse_expr("&& a").is_err());
        assert!(parse_expr("a &").is_err());
        assert!(parse_expr("a[").is_err());
        assert!(parse_expr("a[-1]").is_err());
        assert!(parse_expr("a.").is_err());
        assert!(parse_expr("a ==").is_err());
        assert!(parse_expr("#").is_err());
    }

    #[test]
    fn standalone_path_parse_and_display() {
        let p = Path::parse("item.meta[\"first name\"][3]").unwrap();
        assert_eq!(p.head, "item");
        assert_eq!(p.to_string(), "item.meta[\"first name\"][3]");
        assert!(Path::parse("a == b").is_err());
        assert!(Path::parse("'lit'").is_err());
    }

    #[test]
    fn reads_scope_detects_paths() {
        assert!(!parse_expr("1 < 2 && 'a' != 'b'").unwrap().reads_scope());
        assert!(parse_expr("!(x)").unwrap().reads_scope());
    }
}
