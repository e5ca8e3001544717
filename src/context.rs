//! Merged host/file/string/model fact tree, and the small expression
//! language used to select dockerfile variants via `# CONTEXT <expr>`
//! comments.

use serde_json::Value;
use std::collections::BTreeMap;

/// A merged fact tree. Values are merged shallowly per top-level key, except
/// for a fixed set of nested maps (`docker_env_vars`, `docker_mounts`,
/// `docker_build_arg`) which are merged key-wise so a later layer can add or
/// override a single entry without clobbering the rest.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Context {
    facts: BTreeMap<String, Value>,
}

const NESTED_MERGE_KEYS: &[&str] = &["docker_env_vars", "docker_mounts", "docker_build_arg"];

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(facts: BTreeMap<String, Value>) -> Self {
        Self { facts }
    }

    /// Merges `other` on top of `self`. Later (the argument) wins.
    pub fn merge(&mut self, other: Context) {
        for (key, value) in other.facts {
            if NESTED_MERGE_KEYS.contains(&key.as_str()) {
                match (self.facts.get_mut(&key), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        for (k, v) in incoming {
                            existing.insert(k, v);
                        }
                        continue;
                    }
                    (_, incoming) => {
                        self.facts.insert(key, incoming);
                        continue;
                    }
                }
            }
            self.facts.insert(key, value);
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.facts.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.facts.insert(key.into(), value);
    }

    pub fn snapshot(&self) -> &BTreeMap<String, Value> {
        &self.facts
    }

    /// Evaluates a `# CONTEXT <expr>` filter expression against this context.
    pub fn filter(&self, expr: &ContextExpr) -> bool {
        expr.eval(self)
    }
}

/// AST for the dockerfile context-filter expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextExpr {
    And(Vec<ContextExpr>),
    Or(Vec<ContextExpr>),
    Not(Box<ContextExpr>),
    Eq(String, String),
    In(String, Vec<String>),
    Exists(String),
}

impl ContextExpr {
    pub fn eval(&self, ctx: &Context) -> bool {
        match self {
            ContextExpr::And(exprs) => exprs.iter().all(|e| e.eval(ctx)),
            ContextExpr::Or(exprs) => exprs.iter().any(|e| e.eval(ctx)),
            ContextExpr::Not(expr) => !expr.eval(ctx),
            ContextExpr::Eq(path, want) => ctx
                .get(path)
                .map(|v| value_as_str(v) == *want)
                .unwrap_or(false),
            ContextExpr::In(path, options) => ctx
                .get(path)
                .map(|v| options.iter().any(|o| o == &value_as_str(v)))
                .unwrap_or(false),
            ContextExpr::Exists(path) => ctx.get(path).is_some(),
        }
    }
}

fn value_as_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses the textual form embedded in a `# CONTEXT <expr>` dockerfile
/// comment, e.g. `gpu_vendor == "amd" and gfx_arch in ["gfx90a", "gfx942"]`.
pub fn parse(input: &str) -> crate::error::Result<ContextExpr> {
    Parser::new(input).parse_or()
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Ident(&'a str),
    Str(String),
    And,
    Or,
    Not,
    In,
    EqEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            tokens: tokenize(input),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> crate::error::Result<ContextExpr> {
        let mut parts = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            ContextExpr::Or(parts)
        })
    }

    fn parse_and(&mut self) -> crate::error::Result<ContextExpr> {
        let mut parts = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            ContextExpr::And(parts)
        })
    }

    fn parse_unary(&mut self) -> crate::error::Result<ContextExpr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            return Ok(ContextExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> crate::error::Result<ContextExpr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(crate::error::MadError::validation("expected ')'")),
                }
            }
            Some(Token::Ident(path)) => match self.peek() {
                Some(Token::EqEq) => {
                    self.next();
                    match self.next() {
                        Some(Token::Str(s)) => Ok(ContextExpr::Eq(path.to_string(), s)),
                        Some(Token::Ident(s)) => Ok(ContextExpr::Eq(path.to_string(), s.to_string())),
                        _ => Err(crate::error::MadError::validation("expected value after '=='")),
                    }
                }
                Some(Token::In) => {
                    self.next();
                    match self.next() {
                        Some(Token::LBracket) => {
                            let mut values = Vec::new();
                            loop {
                                match self.next() {
                                    Some(Token::Str(s)) => values.push(s),
                                    Some(Token::Ident(s)) => values.push(s.to_string()),
                                    Some(Token::RBracket) => break,
                                    _ => {
                                        return Err(crate::error::MadError::validation(
                                            "malformed 'in [...]' list",
                                        ))
                                    }
                                }
                                match self.peek() {
                                    Some(Token::Comma) => {
                                        self.next();
                                    }
                                    Some(Token::RBracket) => {
                                        self.next();
                                        break;
                                    }
                                    _ => {
                                        return Err(crate::error::MadError::validation(
                                            "malformed 'in [...]' list",
                                        ))
                                    }
                                }
                            }
                            Ok(ContextExpr::In(path.to_string(), values))
                        }
                        _ => Err(crate::error::MadError::validation("expected '[' after 'in'")),
                    }
                }
                _ => Ok(ContextExpr::Exists(path.to_string())),
            },
            other => Err(crate::error::MadError::validation(format!(
                "unexpected token in context expression: {other:?}"
            ))),
        }
    }
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] as char != quote {
                    end += 1;
                }
                tokens.push(Token::Str(input[start..end].to_string()));
                i = end + 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> Context {
        let mut c = Context::new();
        for (k, v) in pairs {
            c.set(*k, v.clone());
        }
        c
    }

    #[test]
    fn later_layer_wins_on_merge() {
        let mut base = ctx(&[("gpu_vendor", json!("amd"))]);
        base.merge(ctx(&[("gpu_vendor", json!("nvidia"))]));
        assert_eq!(base.get("gpu_vendor").unwrap(), &json!("nvidia"));
    }

    #[test]
    fn nested_docker_env_vars_merge_key_wise() {
        let mut base = Context::new();
        base.set("docker_env_vars", json!({"A": "1"}));
        let mut overlay = Context::new();
        overlay.set("docker_env_vars", json!({"B": "2"}));
        base.merge(overlay);
        let merged = base.get("docker_env_vars").unwrap();
        assert_eq!(merged.get("A").unwrap(), &json!("1"));
        assert_eq!(merged.get("B").unwrap(), &json!("2"));
    }

    #[test]
    fn parses_and_or_not_eq_in_exists() {
        let expr = parse("gpu_vendor == \"amd\" and gfx_arch in [\"gfx90a\", \"gfx942\"]").unwrap();
        let c = ctx(&[
            ("gpu_vendor", json!("amd")),
            ("gfx_arch", json!("gfx90a")),
        ]);
        assert!(expr.eval(&c));

        let c2 = ctx(&[("gpu_vendor", json!("amd")), ("gfx_arch", json!("gfx908"))]);
        assert!(!expr.eval(&c2));

        let exists_expr = parse("not slurm_cluster").unwrap();
        assert!(exists_expr.eval(&Context::new()));
    }

    #[test]
    fn unknown_path_eq_is_false_not_error() {
        let expr = ContextExpr::Eq("missing.path".into(), "x".into());
        assert!(!expr.eval(&Context::new()));
    }
}
