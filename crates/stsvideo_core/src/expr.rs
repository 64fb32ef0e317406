//! The `calc(…)` timing expression language (§4.2).
//!
//! Grammar: literals with unit suffix `s` or `ms` (the canonical unit);
//! references `url(#<fragment-id>.<dotted-path>)` navigating into a
//! `FragmentData` record `{ time: { start, end, duration } }`; binary
//! operators `+ - * /`; unary minus; parentheses.

use crate::error::CoreError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

fn url_ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"url\(#([A-Za-z0-9_-]+)\.([A-Za-z0-9_.]+)\)").unwrap())
}

/// The per-compile mapping from fragment id to its resolved time fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FragmentData {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

#[derive(Debug, Default)]
pub struct ExpressionContext {
    pub fragments: HashMap<String, FragmentData>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fragment_id: impl Into<String>, data: FragmentData) {
        self.fragments.insert(fragment_id.into(), data);
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// A reference to a property path of one fragment's resolved timing, with
/// the flattened variable name the arithmetic parser sees in its place.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VarRef {
    var_name: String,
    fragment_id: String,
    path: String,
}

/// A parsed, not-yet-evaluated `calc(…)` expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledExpression {
    pub original_text: String,
    ast: Expr,
    refs: Vec<VarRef>,
}

impl CompiledExpression {
    /// All fragment ids this expression references — used by the Timeline
    /// Compiler's fixed-point resolution loop to tell whether a fragment's
    /// dependencies have all resolved yet.
    pub fn referenced_fragment_ids(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().map(|r| r.fragment_id.as_str())
    }
}

// ---------------------------------------------------------------------------
// parse
// ---------------------------------------------------------------------------

pub fn parse(text: &str) -> Result<CompiledExpression, CoreError> {
    let rewritten_calc = replace_first(text, "calc(", "(");

    let mut refs = Vec::new();
    let mut var_index = 0usize;
    let after_refs = url_ref_pattern()
        .replace_all(&rewritten_calc, |caps: &regex::Captures| {
            let fragment_id = caps[1].to_string();
            let path = caps[2].to_string();
            let var_name = format!("__ref{var_index}_{}_{}", fragment_id, path.replace('.', "_"));
            var_index += 1;
            refs.push(VarRef {
                var_name: var_name.clone(),
                fragment_id,
                path,
            });
            var_name
        })
        .into_owned();

    let ast = parse_arithmetic(&after_refs).map_err(|message| CoreError::ExpressionParse {
        text: text.to_string(),
        message,
    })?;

    Ok(CompiledExpression {
        original_text: text.to_string(),
        ast,
        refs,
    })
}

fn replace_first(haystack: &str, needle: &str, replacement: &str) -> String {
    match haystack.find(needle) {
        Some(idx) => {
            let mut out = String::with_capacity(haystack.len());
            out.push_str(&haystack[..idx]);
            out.push_str(replacement);
            out.push_str(&haystack[idx + needle.len()..]);
            out
        }
        None => haystack.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer + recursive-descent parser for the arithmetic sublanguage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(s: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let mut value: f64 = num_str
                    .parse()
                    .map_err(|_| format!("invalid number literal {num_str:?}"))?;

                // Unit suffix: `ms` (canonical, no-op) or `s` (×1000).
                if i + 1 < chars.len() && chars[i] == 'm' && chars[i + 1] == 's' {
                    i += 2;
                } else if i < chars.len() && chars[i] == 's' {
                    value *= 1000.0;
                    i += 1;
                }
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    let rhs = self.term()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.advance();
                    let rhs = self.term()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    let rhs = self.unary()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.advance();
                    let rhs = self.unary()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected closing parenthesis".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn parse_arithmetic(s: &str) -> Result<Expr, String> {
    let tokens = tokenize(s)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens after expression".to_string());
    }
    Ok(ast)
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

pub fn evaluate(compiled: &CompiledExpression, ctx: &ExpressionContext) -> Result<f64, CoreError> {
    let mut bindings: HashMap<&str, f64> = HashMap::new();

    for r in &compiled.refs {
        let data = ctx.fragments.get(&r.fragment_id).ok_or_else(|| {
            CoreError::UnknownReference {
                fragment_id: r.fragment_id.clone(),
                target_name: r.path.clone(),
            }
        })?;

        let value = match r.path.as_str() {
            "time.start" => data.start,
            "time.end" => data.end,
            "time.duration" => data.duration,
            other => {
                return Err(CoreError::ExpressionEval {
                    text: compiled.original_text.clone(),
                    message: format!("unknown property path {other:?}"),
                })
            }
        };
        bindings.insert(&r.var_name, value);
    }

    eval_ast(&compiled.ast, &bindings, &compiled.original_text)
}

fn eval_ast(e: &Expr, bindings: &HashMap<&str, f64>, original_text: &str) -> Result<f64, CoreError> {
    match e {
        Expr::Num(n) => Ok(*n),
        Expr::Var(name) => bindings.get(name.as_str()).copied().ok_or_else(|| {
            CoreError::ExpressionEval {
                text: original_text.to_string(),
                message: format!("unbound variable {name:?}"),
            }
        }),
        Expr::Neg(inner) => Ok(-eval_ast(inner, bindings, original_text)?),
        Expr::Add(a, b) => Ok(eval_ast(a, bindings, original_text)? + eval_ast(b, bindings, original_text)?),
        Expr::Sub(a, b) => Ok(eval_ast(a, bindings, original_text)? - eval_ast(b, bindings, original_text)?),
        Expr::Mul(a, b) => Ok(eval_ast(a, bindings, original_text)? * eval_ast(b, bindings, original_text)?),
        Expr::Div(a, b) => {
            let bv = eval_ast(b, bindings, original_text)?;
            if bv == 0.0 {
                return Err(CoreError::ExpressionEval {
                    text: original_text.to_string(),
                    message: "division by zero".to_string(),
                });
            }
            Ok(eval_ast(a, bindings, original_text)? / bv)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(id: &str, start: f64, end: f64, duration: f64) -> ExpressionContext {
        let mut ctx = ExpressionContext::new();
        ctx.insert(id, FragmentData { start, end, duration });
        ctx
    }

    #[test]
    fn literal_ms_is_identity() {
        let compiled = parse("calc(250ms)").unwrap();
        let ctx = ExpressionContext::new();
        assert_eq!(evaluate(&compiled, &ctx).unwrap(), 250.0);
    }

    #[test]
    fn literal_seconds_scaled_to_ms() {
        let compiled = parse("calc(2.5s)").unwrap();
        let ctx = ExpressionContext::new();
        assert_eq!(evaluate(&compiled, &ctx).unwrap(), 2500.0);
    }

    #[test]
    fn unit_normalization_property_holds_for_many_values() {
        for r in [0.0, 1.0, 3.25, 100.0, 0.001] {
            let seconds = parse(&format!("calc({r}s)")).unwrap();
            let millis = parse(&format!("calc({r}ms)")).unwrap();
            let ctx = ExpressionContext::new();
            assert!((evaluate(&seconds, &ctx).unwrap() - r * 1000.0).abs() < 1e-9);
            assert!((evaluate(&millis, &ctx).unwrap() - r).abs() < 1e-9);
        }
    }

    #[test]
    fn binary_ops_and_precedence() {
        let compiled = parse("calc((1000 + 2000) * 2)").unwrap();
        let ctx = ExpressionContext::new();
        assert_eq!(evaluate(&compiled, &ctx).unwrap(), 6000.0);
    }

    #[test]
    fn unary_minus() {
        let compiled = parse("calc(-500ms + 1000ms)").unwrap();
        let ctx = ExpressionContext::new();
        assert_eq!(evaluate(&compiled, &ctx).unwrap(), 500.0);
    }

    #[test]
    fn forward_reference_resolves_against_context() {
        let compiled = parse("calc(url(#ending.time.start))").unwrap();
        let ctx = ctx_with("ending", 8000.0, 12000.0, 4000.0);
        assert_eq!(evaluate(&compiled, &ctx).unwrap(), 8000.0);
    }

    #[test]
    fn expression_round_trip_property() {
        let ctx = ctx_with("f", 1000.0, 3000.0, 2000.0);
        let xy = parse("calc((url(#f.time.start) + url(#f.time.duration)) * 2)").unwrap();
        let x = parse("calc(url(#f.time.start))").unwrap();
        let y = parse("calc(url(#f.time.duration))").unwrap();
        let lhs = evaluate(&xy, &ctx).unwrap();
        let rhs = 2.0 * (evaluate(&x, &ctx).unwrap() + evaluate(&y, &ctx).unwrap());
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn unknown_fragment_id_errors() {
        let compiled = parse("calc(url(#missing.time.start))").unwrap();
        let ctx = ExpressionContext::new();
        let err = evaluate(&compiled, &ctx).unwrap_err();
        assert!(matches!(err, CoreError::UnknownReference { .. }));
    }

    #[test]
    fn unknown_property_path_errors() {
        let compiled = parse("calc(url(#f.time.bogus))").unwrap();
        let ctx = ctx_with("f", 0.0, 1000.0, 1000.0);
        let err = evaluate(&compiled, &ctx).unwrap_err();
        assert!(matches!(err, CoreError::ExpressionEval { .. }));
    }

    #[test]
    fn division_by_zero_errors() {
        let compiled = parse("calc(1000 / 0)").unwrap();
        let ctx = ExpressionContext::new();
        let err = evaluate(&compiled, &ctx).unwrap_err();
        assert!(matches!(err, CoreError::ExpressionEval { .. }));
    }

    #[test]
    fn malformed_expression_errors_at_parse_time() {
        let err = parse("calc(1 + )").unwrap_err();
        assert!(matches!(err, CoreError::ExpressionParse { .. }));
    }

    #[test]
    fn referenced_fragment_ids_reports_all_refs() {
        let compiled = parse("calc(url(#a.time.start) + url(#b.time.end))").unwrap();
        let ids: Vec<&str> = compiled.referenced_fragment_ids().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
