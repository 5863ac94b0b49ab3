//! Target evaluation against one minion.

use std::collections::BTreeMap;

use brine_storage::{Target, TargetKind};
use regex::Regex;

use crate::expr::glob_match;
use crate::TargetError;

const GRAIN_DELIM: char = ':';

/// What a target expression is evaluated against.
pub struct MatchContext<'a> {
    pub id: &'a str,
    pub grains: &'a serde_json::Value,
    pub nodegroups: &'a BTreeMap<String, String>,
}

pub fn matches(target: &Target, ctx: &MatchContext<'_>) -> Result<bool, TargetError> {
    match target.kind {
        TargetKind::Glob => Ok(glob_match(ctx.id, &target.expr)),
        TargetKind::Pcre => pcre_match(ctx.id, &target.expr),
        TargetKind::List => Ok(list_match(ctx.id, &target.expr)),
        TargetKind::Grain => Ok(grain_match(ctx.grains, &target.expr)),
        TargetKind::Nodegroup => {
            let expr = ctx
                .nodegroups
                .get(&target.expr)
                .ok_or_else(|| TargetError::UnknownNodegroup(target.expr.clone()))?;
            compound_match(expr, ctx)
        }
        TargetKind::Compound => compound_match(&target.expr, ctx),
    }
}

fn pcre_match(id: &str, expr: &str) -> Result<bool, TargetError> {
    let re = Regex::new(&format!(r"\A(?:{})", expr))
        .map_err(|e| TargetError::InvalidRegex(e.to_string()))?;
    Ok(re.is_match(id))
}

fn list_match(id: &str, expr: &str) -> bool {
    expr.split(',').map(str::trim).any(|item| item == id)
}

fn value_match(value: &serde_json::Value, pattern: &str) -> bool {
    match value {
        serde_json::Value::String(s) => glob_match(s, pattern),
        serde_json::Value::Array(items) => items.iter().any(|v| value_match(v, pattern)),
        serde_json::Value::Null | serde_json::Value::Object(_) => false,
        other => glob_match(&other.to_string(), pattern),
    }
}

/// `key:glob`, with `:` also walking into nested maps (`a:b:glob`).
/// The shortest key path is tried first.
pub fn grain_match(grains: &serde_json::Value, expr: &str) -> bool {
    let parts: Vec<&str> = expr.split(GRAIN_DELIM).collect();
    for split in 1..parts.len() {
        let mut node = grains;
        let mut found = true;
        for key in &parts[..split] {
            match node.get(*key) {
                Some(next) => node = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        let pattern = parts[split..].join(":");
        if value_match(node, &pattern) {
            return true;
        }
    }
    false
}

// ───────────────────────────────────── Compound ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Matcher(String),
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for word in expr.split_whitespace() {
        let mut word = word;
        while let Some(rest) = word.strip_prefix('(') {
            tokens.push(Token::Open);
            word = rest;
        }
        let mut closes = 0;
        while let Some(rest) = word.strip_suffix(')') {
            closes += 1;
            word = rest;
        }
        match word {
            "" => {}
            "and" => tokens.push(Token::And),
            "or" => tokens.push(Token::Or),
            "not" => tokens.push(Token::Not),
            other => tokens.push(Token::Matcher(other.to_string())),
        }
        tokens.extend(std::iter::repeat(Token::Close).take(closes));
    }
    tokens
}

struct Parser<'t, 'c> {
    tokens: &'t [Token],
    pos: usize,
    ctx: &'t MatchContext<'c>,
    depth: usize,
}

const MAX_NODEGROUP_DEPTH: usize = 16;

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<bool, TargetError> {
        let mut value = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, TargetError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                }
                // Adjacent matchers are joined with an implicit `and`.
                Some(Token::Matcher(_)) | Some(Token::Not) | Some(Token::Open) => {}
                _ => break,
            }
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<bool, TargetError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| TargetError::Syntax("unexpected end of expression".into()))?;
        self.pos += 1;
        match token {
            Token::Not => Ok(!self.unary()?),
            Token::Open => {
                let value = self.or_expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(TargetError::Syntax("unbalanced parenthesis".into()));
                }
                self.pos += 1;
                Ok(value)
            }
            Token::Matcher(word) => self.matcher(&word),
            other => Err(TargetError::Syntax(format!("unexpected {:?}", other))),
        }
    }

    fn matcher(&self, word: &str) -> Result<bool, TargetError> {
        let ctx = self.ctx;
        match word.split_once('@') {
            Some(("G", expr)) => Ok(grain_match(ctx.grains, expr)),
            Some(("E", expr)) => pcre_match(ctx.id, expr),
            Some(("L", expr)) => Ok(list_match(ctx.id, expr)),
            Some(("N", name)) => {
                if self.depth >= MAX_NODEGROUP_DEPTH {
                    return Err(TargetError::NodegroupCycle(name.to_string()));
                }
                let expr = ctx
                    .nodegroups
                    .get(name)
                    .ok_or_else(|| TargetError::UnknownNodegroup(name.to_string()))?;
                compound_eval(expr, ctx, self.depth + 1)
            }
            Some((prefix, _)) if prefix.len() == 1 => Err(TargetError::Syntax(format!(
                "unsupported matcher {}@",
                prefix
            ))),
            _ => Ok(glob_match(ctx.id, word)),
        }
    }
}

fn compound_eval(expr: &str, ctx: &MatchContext<'_>, depth: usize) -> Result<bool, TargetError> {
    let tokens = tokenize(expr);
    if tokens.is_empty() {
        return Err(TargetError::Syntax("empty compound expression".into()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
        depth,
    };
    let value = parser.or_expr()?;
    if parser.pos != tokens.len() {
        return Err(TargetError::Syntax(format!(
            "trailing tokens in {:?}",
            expr
        )));
    }
    Ok(value)
}

pub fn compound_match(expr: &str, ctx: &MatchContext<'_>) -> Result<bool, TargetError> {
    compound_eval(expr, ctx, 0)
}

/// Rewrite nodegroup targets (and `N@` references) into plain compound
/// expressions so the receiver needs no nodegroup table.
pub fn expand_nodegroups(
    target: &Target,
    nodegroups: &BTreeMap<String, String>,
) -> Result<Target, TargetError> {
    fn expand(
        expr: &str,
        nodegroups: &BTreeMap<String, String>,
        depth: usize,
    ) -> Result<String, TargetError> {
        let mut out = Vec::new();
        for word in expr.split_whitespace() {
            let core = word.trim_start_matches('(').trim_end_matches(')');
            match core.strip_prefix("N@") {
                Some(name) => {
                    if depth >= MAX_NODEGROUP_DEPTH {
                        return Err(TargetError::NodegroupCycle(name.to_string()));
                    }
                    let inner = nodegroups
                        .get(name)
                        .ok_or_else(|| TargetError::UnknownNodegroup(name.to_string()))?;
                    let expanded = expand(inner, nodegroups, depth + 1)?;
                    out.push(word.replacen(core, &format!("( {} )", expanded), 1));
                }
                None => out.push(word.to_string()),
            }
        }
        Ok(out.join(" "))
    }

    match target.kind {
        TargetKind::Nodegroup => Ok(Target {
            expr: expand(&format!("N@{}", target.expr), nodegroups, 0)?,
            kind: TargetKind::Compound,
        }),
        TargetKind::Compound => Ok(Target {
            expr: expand(&target.expr, nodegroups, 0)?,
            kind: TargetKind::Compound,
        }),
        _ => Ok(target.clone()),
    }
}
