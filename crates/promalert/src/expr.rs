//! Decomposition of alerting expressions into chartable conditions.
//!
//! Only the top of the expression matters for charting, so instead of a full
//! PromQL grammar the source is scanned for binary operators that sit outside
//! any brackets or string literals and split by PromQL precedence (`or` binds
//! loosest, then `and`/`unless`, then comparisons). The result is a closed
//! [`ExprNode`] tree:
//!
//! - a single parenthesised wrapper is unwrapped,
//! - `a and b` is charted as the panels of `a` followed by the panels of `b`,
//! - `lhs <op> threshold` becomes one [`PlotExpression`],
//! - anything else is not chartable.

use slack::{MAX_TEXT_LENGTH, TRUNCATION_MARKER};
use std::fmt;
use tracing::{debug, info, warn};

/// Which side of the threshold is the violation region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Values below the threshold breach it
    LessThan,
    /// Values above the threshold breach it
    GreaterThan,
}

impl Comparison {
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::LessThan => "<",
            Self::GreaterThan => ">",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One chartable sub-condition of an alert expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotExpression {
    /// Expression to query and draw
    pub formula: String,
    /// Breach direction
    pub operator: Comparison,
    /// Threshold level
    pub level: f64,
}

impl PlotExpression {
    /// `formula operator level`, the formula shortened so the whole title fits
    /// in [`MAX_TEXT_LENGTH`] characters.
    #[must_use]
    pub fn title(&self) -> String {
        let level = format!("{:.2}", self.level);
        let suffix_len = self.operator.symbol().len() + level.len() + 2;

        let formula_len = self.formula.chars().count();
        if formula_len + suffix_len <= MAX_TEXT_LENGTH {
            return format!("{} {} {level}", self.formula, self.operator);
        }

        let keep = MAX_TEXT_LENGTH.saturating_sub(suffix_len + TRUNCATION_MARKER.len());
        let formula: String = self.formula.chars().take(keep).collect();
        format!("{formula}{TRUNCATION_MARKER} {} {level}", self.operator)
    }
}

impl fmt::Display for PlotExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:.2}", self.formula, self.operator, self.level)
    }
}

/// Relational operators PromQL allows between two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl RelOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// Top-level shape of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode<'a> {
    /// `( inner )`
    Paren(Box<ExprNode<'a>>),
    /// `lhs and rhs`
    LogicalAnd(Box<ExprNode<'a>>, Box<ExprNode<'a>>),
    /// `lhs <op> rhs`, both sides as source text
    BinaryComparison { op: RelOp, lhs: &'a str, rhs: &'a str },
    /// Anything that is not chartable as a threshold
    Other(&'a str),
}

/// Split an alert expression into the conditions to chart, in source order.
#[must_use]
pub fn decompose(query: &str) -> Vec<PlotExpression> {
    let mut out = Vec::new();
    collect(parse(query), &mut out);

    if out.is_empty() && !query.trim().is_empty() {
        warn!(query, "Expression has no chartable condition");
    }

    out
}

fn collect(node: ExprNode<'_>, out: &mut Vec<PlotExpression>) {
    let node = match node {
        ExprNode::Paren(inner) => {
            debug!("Removing redundant brackets");
            *inner
        }
        other => other,
    };

    match node {
        ExprNode::LogicalAnd(lhs, rhs) => {
            info!("Logical condition, drawing sides separately");
            collect(*lhs, out);
            collect(*rhs, out);
        }
        ExprNode::BinaryComparison { op, lhs, rhs } => {
            let operator = match op {
                RelOp::Lt | RelOp::Le => Comparison::LessThan,
                RelOp::Gt | RelOp::Ge => Comparison::GreaterThan,
                // Equality has no breach side; shade above the level.
                RelOp::Eq | RelOp::Ne => {
                    info!(operator = op.symbol(), "Unexpected operator, assuming >");
                    Comparison::GreaterThan
                }
            };

            out.push(PlotExpression {
                formula: lhs.to_string(),
                operator,
                level: parse_level(rhs),
            });
        }
        ExprNode::Paren(_) | ExprNode::Other(_) => {
            debug!("Non binary expression");
        }
    }
}

/// Numeric value of a threshold literal, decimal or `0x` hex. Anything else is 0.
fn parse_level(literal: &str) -> f64 {
    let literal = literal.trim();
    let (negative, digits) = match literal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, literal.strip_prefix('+').unwrap_or(literal)),
    };

    let hex = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"));
    if let Some(hex) = hex {
        return i64::from_str_radix(hex, 16)
            .map(|v| if negative { -(v as f64) } else { v as f64 })
            .unwrap_or(0.0);
    }

    literal.parse().unwrap_or(0.0)
}

/// Parse the top level of `src` into an [`ExprNode`].
#[must_use]
pub fn parse(src: &str) -> ExprNode<'_> {
    let src = src.trim();
    if src.is_empty() {
        return ExprNode::Other(src);
    }

    if let Some(inner) = strip_wrapping_parens(src) {
        return ExprNode::Paren(Box::new(parse(inner)));
    }

    let Some(ops) = scan_top_level(src) else {
        warn!(expression = src, "Unbalanced expression, not chartable");
        return ExprNode::Other(src);
    };

    if ops.iter().any(|o| o.op == TopOp::Or) {
        return ExprNode::Other(src);
    }

    // Binary operators are left-associative, so the last one is the root.
    if let Some(set_op) = ops
        .iter()
        .rev()
        .find(|o| matches!(o.op, TopOp::And | TopOp::Unless))
    {
        if set_op.op == TopOp::Unless {
            return ExprNode::Other(src);
        }
        let lhs = &src[..set_op.start];
        let rhs = skip_modifiers(&src[set_op.end..]);
        return ExprNode::LogicalAnd(Box::new(parse(lhs)), Box::new(parse(rhs)));
    }

    if let Some(cmp) = ops.iter().rev().find_map(|o| match o.op {
        TopOp::Cmp(rel) => Some((o, rel)),
        _ => None,
    }) {
        let (span, op) = cmp;
        let lhs = src[..span.start].trim();
        let rhs = skip_modifiers(&src[span.end..]).trim();
        if lhs.is_empty() || rhs.is_empty() {
            return ExprNode::Other(src);
        }
        return ExprNode::BinaryComparison { op, lhs, rhs };
    }

    ExprNode::Other(src)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopOp {
    Or,
    And,
    Unless,
    Cmp(RelOp),
}

#[derive(Debug)]
struct OpSpan {
    start: usize,
    end: usize,
    op: TopOp,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b':'
}

fn word_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    end
}

/// Index just past the string literal opening at `start`, `None` if unterminated.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote != b'`' => i += 2,
            c if c == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn comparison_at(bytes: &[u8], i: usize) -> Option<(RelOp, usize)> {
    let next = bytes.get(i + 1).copied();
    match (bytes[i], next) {
        (b'=', Some(b'=')) => Some((RelOp::Eq, 2)),
        (b'!', Some(b'=')) => Some((RelOp::Ne, 2)),
        (b'<', Some(b'=')) => Some((RelOp::Le, 2)),
        (b'>', Some(b'=')) => Some((RelOp::Ge, 2)),
        (b'<', _) => Some((RelOp::Lt, 1)),
        (b'>', _) => Some((RelOp::Gt, 1)),
        _ => None,
    }
}

/// Binary operators outside brackets and strings, in source order.
/// `None` when brackets are unbalanced or a string is unterminated.
fn scan_top_level(src: &str) -> Option<Vec<OpSpan>> {
    let bytes = src.as_bytes();
    let mut ops = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i)?;
                continue;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth = depth.checked_sub(1)?,
            _ if depth == 0 => {
                if let Some((rel, len)) = comparison_at(bytes, i) {
                    ops.push(OpSpan {
                        start: i,
                        end: i + len,
                        op: TopOp::Cmp(rel),
                    });
                    i += len;
                    continue;
                }
                if is_ident_start(c) && (i == 0 || !is_ident_char(bytes[i - 1])) {
                    let end = word_end(bytes, i);
                    let op = match src[i..end].to_ascii_lowercase().as_str() {
                        "and" => Some(TopOp::And),
                        "or" => Some(TopOp::Or),
                        "unless" => Some(TopOp::Unless),
                        _ => None,
                    };
                    if let Some(op) = op {
                        ops.push(OpSpan { start: i, end, op });
                    }
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (depth == 0).then_some(ops)
}

/// Inner text when `src` is entirely enclosed by one pair of parentheses.
fn strip_wrapping_parens(src: &str) -> Option<&str> {
    let bytes = src.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }

    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i)?;
                continue;
            }
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (i == bytes.len() - 1).then(|| &src[1..i]);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Drop `bool`, `on(..)`, `ignoring(..)`, `group_left(..)` and `group_right(..)`
/// from the start of a right-hand operand.
fn skip_modifiers(rhs: &str) -> &str {
    let mut rest = rhs.trim_start();
    loop {
        let bytes = rest.as_bytes();
        if bytes.is_empty() || !is_ident_start(bytes[0]) {
            return rest;
        }
        let end = word_end(bytes, 0);
        let word = rest[..end].to_ascii_lowercase();
        match word.as_str() {
            "bool" => rest = rest[end..].trim_start(),
            "on" | "ignoring" | "group_left" | "group_right" => {
                let after = rest[end..].trim_start();
                if after.starts_with('(') {
                    match after.find(')') {
                        Some(close) => rest = after[close + 1..].trim_start(),
                        None => return rest,
                    }
                } else if word.starts_with("group_") {
                    rest = after;
                } else {
                    return rest;
                }
            }
            _ => return rest,
        }
    }
}
