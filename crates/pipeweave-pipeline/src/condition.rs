//! Guard expression language for edge `guard`/`when` attributes.
//!
//! `ConditionalHandler` and [`crate::edge_selection::select_next`] both parse
//! an edge's `guard` (or, for conditional nodes, `when`/`label`) string and
//! evaluate it against Context/outcome lookups to decide whether that edge
//! fires. A clause may compare a key to a literal, or — bare, with no
//! operator — just ask whether a key resolves to a truthy value, so
//! `guard="context.tests_passed"` reads as "this flag is set" without
//! spelling out `=true`.
//!
//! Grammar:
//! ```text
//! GuardExpr   ::= Clause ( '&&' Clause )*
//! Clause      ::= Key Operator Literal | Key
//! Key         ::= identifier ( '.' identifier )*
//! Operator    ::= '=' | '!='
//! Literal     ::= QuotedString | BareWord | Integer | Boolean
//! ```

use pipeweave_types::PipeweaveError;

/// A parsed guard expression: one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardExpr {
    pub clauses: Vec<GuardClause>,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// A single clause: either `key op literal`, or a bare `key` asking whether
/// the resolved value is truthy.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardClause {
    Compare { key: String, operator: Operator, value: String },
    Truthy { key: String },
}

/// Parse a guard string into a [`GuardExpr`].
///
/// An empty or whitespace-only input produces an expression with zero
/// clauses, which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<GuardExpr, PipeweaveError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(GuardExpr { clauses: Vec::new() });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }

    Ok(GuardExpr { clauses })
}

fn parse_clause(input: &str) -> Result<GuardClause, PipeweaveError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    match find_operator(input) {
        Some((key_end, operator, op_len)) => {
            let key = input[..key_end].trim().to_string();
            validate_key(&key)?;

            let raw_value = input[key_end + op_len..].trim();
            if raw_value.is_empty() {
                return Err(make_error(&format!("missing value after operator in '{input}'")));
            }

            Ok(GuardClause::Compare { key, operator, value: strip_quotes(raw_value) })
        }
        None => {
            // No operator at all: treat the whole clause as a bare truthy key.
            validate_key(input)?;
            Ok(GuardClause::Truthy { key: input.to_string() })
        }
    }
}

fn validate_key(key: &str) -> Result<(), PipeweaveError> {
    if key.is_empty() {
        return Err(make_error("missing key"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }
    Ok(())
}

/// Scan for `!=` or `=`, skipping quoted regions. Returns `None` rather than
/// erroring when no operator is found, so the caller can fall back to a bare
/// truthy key.
fn find_operator(input: &str) -> Option<(usize, Operator, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1; // skip closing quote
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Some((i, Operator::NotEq, 2));
            }
            b'=' => {
                return Some((i, Operator::Eq, 1));
            }
            _ => {
                i += 1;
            }
        }
    }
    None
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> PipeweaveError {
    PipeweaveError::ValidationError(format!("guard parse error: {msg}"))
}

/// Resolved values that count as truthy for a bare-key clause: anything
/// non-empty other than the literal strings `false` and `0`.
fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "false" && value != "0"
}

/// Evaluate a guard expression against values supplied by a resolver
/// function.
///
/// `resolve` maps a key (e.g. `"outcome"`, `"context.env"`) to its string
/// value; keys not found should resolve to an empty string, which is never
/// truthy and never equal to a non-empty literal.
///
/// An expression with zero clauses (from an empty input) evaluates to `true`.
pub fn evaluate_condition(expr: &GuardExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    if expr.clauses.is_empty() {
        return true;
    }

    expr.clauses.iter().all(|clause| match clause {
        GuardClause::Compare { key, operator, value } => {
            let actual = resolve(key);
            match operator {
                Operator::Eq => &actual == value,
                Operator::NotEq => &actual != value,
            }
        }
        GuardClause::Truthy { key } => is_truthy(&resolve(key)),
    })
}
