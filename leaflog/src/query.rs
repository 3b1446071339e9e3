/*
 * This file is a part of leaflog.
 *
 * leaflog is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * leaflog is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with leaflog. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Query-expression grammar: `expr (, expr)*`, each `expr` a
//! dot-separated chain of segments (`KEY`, `{K1,K2}`, `*`, `**`,
//! optionally `(...)`-wrapped to mark it "kept" in the result path).
//!
//! Splitting on `,` and `.` is brace-aware: a comma inside a `{...}`
//! group does not end the enclosing expression. A naive
//! `split(',')`/`partition(',')` would cut a `{a,b}` group in half;
//! this parser tracks nesting depth instead.

use crate::error::{TreeError, TreeResult};
use serde_json::Value as Json;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String, bool),
    KeySet(Vec<String>, bool),
    Any(bool),
    AnyRecursive(bool),
}

impl Segment {
    fn kept(&self) -> bool {
        match self {
            Self::Key(_, k) | Self::KeySet(_, k) | Self::Any(k) | Self::AnyRecursive(k) => *k,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub segments: Vec<Segment>,
    /// True when no segment in this expression was explicitly
    /// parenthesized — in that case every segment counts as kept.
    pub keep_all: bool,
}

fn split_top_level(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' | '(' => depth += 1,
            '}' | ')' => depth -= 1,
            c if c == delim && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_segment(raw: &str) -> TreeResult<Segment> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TreeError::Query("empty query segment".to_owned()));
    }
    let (body, kept) = if trimmed.starts_with('(') && trimmed.ends_with(')') {
        (&trimmed[1..trimmed.len() - 1], true)
    } else {
        (trimmed, false)
    };
    let body = body.trim();
    if body == "**" {
        Ok(Segment::AnyRecursive(kept))
    } else if body == "*" {
        Ok(Segment::Any(kept))
    } else if body.starts_with('{') && body.ends_with('}') {
        let inner = &body[1..body.len() - 1];
        let keys: Vec<String> = inner
            .split(',')
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(TreeError::Query(format!("empty key set in {raw:?}")));
        }
        Ok(Segment::KeySet(keys, kept))
    } else if body.contains(['{', '}', '(', ')']) {
        Err(TreeError::Query(format!("malformed query segment {raw:?}")))
    } else {
        Ok(Segment::Key(body.to_owned(), kept))
    }
}

fn parse_expr(raw: &str) -> TreeResult<Expr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TreeError::Query("empty query expression".to_owned()));
    }
    let segments: Vec<Segment> = split_top_level(raw, '.')
        .into_iter()
        .map(parse_segment)
        .collect::<TreeResult<_>>()?;
    let keep_all = !segments.iter().any(Segment::kept);
    Ok(Expr { segments, keep_all })
}

/// Parse a full query string into its comma-separated expressions.
pub fn parse(query: &str) -> TreeResult<Vec<Expr>> {
    split_top_level(query, ',')
        .into_iter()
        .map(parse_expr)
        .collect()
}

/// Anything queryable: a tree façade and a record-store node look the
/// same to the query engine, which only needs to walk keys and
/// materialize matched locations to JSON.
pub trait QueryNode: Sized + Clone {
    fn keys(&self) -> Vec<String>;
    fn child(&self, key: &str) -> Option<Self>;
    fn to_json(&self) -> TreeResult<Json>;
}

struct Matched<T> {
    path: Vec<String>,
    node: T,
}

fn walk<T: QueryNode>(
    node: &T,
    segments: &[Segment],
    keep_all: bool,
    path: &mut Vec<String>,
    out: &mut Vec<Matched<T>>,
) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push(Matched {
            path: path.clone(),
            node: node.clone(),
        });
        return;
    };
    let mut visit = |key: &str, node: &T, keep: bool, path: &mut Vec<String>, out: &mut Vec<Matched<T>>| {
        if keep {
            path.push(key.to_owned());
        }
        walk(node, rest, keep_all, path, out);
        if keep {
            path.pop();
        }
    };
    match seg {
        Segment::Key(name, kept) => {
            if let Some(child) = node.child(name) {
                visit(name, &child, *kept || keep_all, path, out);
            }
        }
        Segment::KeySet(names, kept) => {
            for name in names {
                if let Some(child) = node.child(name) {
                    visit(name, &child, *kept || keep_all, path, out);
                }
            }
        }
        Segment::Any(kept) => {
            for name in node.keys() {
                if let Some(child) = node.child(&name) {
                    visit(&name, &child, *kept || keep_all, path, out);
                }
            }
        }
        Segment::AnyRecursive(kept) => {
            // match here, consuming zero levels...
            walk(node, rest, keep_all, path, out);
            // ...and recurse into every child with the `**` still pending.
            for name in node.keys() {
                if let Some(child) = node.child(&name) {
                    if *kept || keep_all {
                        path.push(name.clone());
                    }
                    walk(&child, segments, keep_all, path, out);
                    if *kept || keep_all {
                        path.pop();
                    }
                }
            }
        }
    }
}

/// Run `exprs` against `root`, returning kept-path tuples mapped to
/// their matched (and possibly transformed/filtered) JSON value.
/// A repeated kept-path across any match is a hard error.
pub fn run<T: QueryNode>(
    root: &T,
    exprs: &[Expr],
    transform: Option<&dyn Fn(&Json) -> Json>,
    filter: Option<&dyn Fn(&Json) -> bool>,
) -> TreeResult<HashMap<Vec<String>, Json>> {
    let mut matches = Vec::new();
    for expr in exprs {
        let mut path = Vec::new();
        walk(root, &expr.segments, expr.keep_all, &mut path, &mut matches);
    }
    let mut out = HashMap::with_capacity(matches.len());
    for m in matches {
        let mut value = m.node.to_json()?;
        if let Some(f) = filter {
            if !f(&value) {
                continue;
            }
        }
        if let Some(t) = transform {
            value = t(&value);
        }
        if out.insert(m.path.clone(), value).is_some() {
            return Err(TreeError::Query(format!(
                "name collision on kept path {:?}",
                m.path
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_commas_outside_braces() {
        let exprs = parse("a.{b,c},d").unwrap();
        assert_eq!(exprs.len(), 2);
        assert_eq!(exprs[0].segments.len(), 2);
        assert_eq!(exprs[1].segments.len(), 1);
    }

    #[test]
    fn parses_kept_and_recursive_segments() {
        let exprs = parse("*.(b)").unwrap();
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].segments, vec![Segment::Any(false), Segment::Key("b".into(), true)]);
        assert!(!exprs[0].keep_all);

        let exprs = parse("**").unwrap();
        assert_eq!(exprs[0].segments, vec![Segment::AnyRecursive(false)]);
        assert!(exprs[0].keep_all);
    }

    #[test]
    fn rejects_empty_key_set() {
        assert!(parse("{}").is_err());
    }
}
