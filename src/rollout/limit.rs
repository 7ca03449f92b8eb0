//! Node selector expressions
//!
//! A limit is a list of patterns separated by `,` or `:`. A pattern is `all`
//! or `*`, a glob using `*` and `?`, or a regex prefixed with `~`. Prefix a
//! pattern with `!` to exclude its matches or `&` to intersect with them.
//! Positive patterns are unioned first (everything when there are none),
//! then intersections apply, then exclusions.

use crate::error::{FleetError, Result};
use regex::Regex;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Include,
    Intersect,
    Exclude,
}

#[derive(Debug, Clone)]
struct Term {
    op: Op,
    matcher: Regex,
}

impl Term {
    fn hits(&self, group: &str, node: &str) -> bool {
        self.matcher.is_match(node) || (!group.is_empty() && self.matcher.is_match(group))
    }
}

/// A parsed node limit
#[derive(Debug, Clone)]
pub struct NodeLimit {
    source: String,
    terms: Vec<Term>,
}

impl NodeLimit {
    /// Parse a limit expression
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(FleetError::Validation("empty node limit".to_string()));
        }

        let mut terms = Vec::new();
        for piece in expr.split(',') {
            let stripped = piece.trim_start_matches(&['!', '&'][..]);
            // A regex keeps its colons.
            let parts: Vec<&str> = if stripped.starts_with('~') {
                vec![piece]
            } else {
                piece.split(':').collect()
            };
            for part in parts {
                terms.push(Self::term(part.trim(), expr)?);
            }
        }

        Ok(Self {
            source: expr.to_string(),
            terms,
        })
    }

    fn term(pattern: &str, expr: &str) -> Result<Term> {
        let (op, body) = if let Some(rest) = pattern.strip_prefix('!') {
            (Op::Exclude, rest)
        } else if let Some(rest) = pattern.strip_prefix('&') {
            (Op::Intersect, rest)
        } else {
            (Op::Include, pattern)
        };

        if body.is_empty() {
            return Err(FleetError::Validation(format!(
                "node limit '{}' contains an empty pattern",
                expr
            )));
        }

        let matcher = if let Some(re) = body.strip_prefix('~') {
            Regex::new(&format!("^(?:{})$", re)).map_err(|e| {
                FleetError::Validation(format!("node limit '{}': invalid regex '{}': {}", expr, re, e))
            })?
        } else if body == "all" || body == "*" {
            Regex::new(".*").map_err(|e| FleetError::Internal(e.to_string()))?
        } else {
            if let Some(bad) = body
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(*c, '-' | '_' | '.' | '*' | '?')))
            {
                return Err(FleetError::Validation(format!(
                    "node limit '{}': invalid character '{}' in pattern '{}'",
                    expr, bad, body
                )));
            }
            Regex::new(&glob_to_regex(body)).map_err(|e| FleetError::Internal(e.to_string()))?
        };

        Ok(Term { op, matcher })
    }

    /// Original expression
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Select the matching nodes
    pub fn select(&self, nodes: &[String]) -> BTreeSet<String> {
        self.select_group("", nodes)
    }

    /// Select matching nodes of a named group. A pattern matching the group
    /// name matches every node in it.
    pub fn select_group(&self, group: &str, nodes: &[String]) -> BTreeSet<String> {
        let includes: Vec<&Term> = self.terms.iter().filter(|t| t.op == Op::Include).collect();
        let mut selected: BTreeSet<String> = nodes
            .iter()
            .filter(|n| includes.is_empty() || includes.iter().any(|t| t.hits(group, n)))
            .cloned()
            .collect();

        for term in self.terms.iter().filter(|t| t.op == Op::Intersect) {
            selected.retain(|n| term.hits(group, n));
        }
        for term in self.terms.iter().filter(|t| t.op == Op::Exclude) {
            selected.retain(|n| !term.hits(group, n));
        }
        selected
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
