//! Per-sink delivery filter over a trace's URI and client address.
//!
//! Rules are evaluated in a fixed order:
//!
//! 1. all four lists empty: deliver everything;
//! 2. `included_ips` (if any) must match the client address, then any `excluded_ips` match rejects;
//! 3. `included` (if any) must match the URI, then any `excluded` match rejects.
//!
//! Exclusion always wins. Patterns containing `*` are globs where `*` stops at `/` and `**`
//! does not (`?`, `[..]` and `{a,b}` are honoured inside them); other patterns are literals,
//! compared by prefix for URIs and exactly for addresses.
//!
//! ```rust
//! use tracebus::filter::FilterRule;
//!
//! let filter = FilterRule {
//!     included: vec!["/api/*".into()],
//!     excluded: vec!["/api/health".into()],
//!     ..Default::default()
//! }
//! .compile()
//! .unwrap();
//! assert!(filter.allows("/api/users", "10.0.0.1"));
//! assert!(!filter.allows("/api/health", "10.0.0.1"));
//! assert!(!filter.allows("/other", "10.0.0.1"));
//! ```

use crate::error::ConfigError;
use crate::event::TraceEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Include/exclude pattern lists as they appear in settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRule {
    pub included: Vec<String>,
    pub excluded: Vec<String>,
    #[serde(alias = "includedIPs")]
    pub included_ips: Vec<String>,
    #[serde(alias = "excludedIPs")]
    pub excluded_ips: Vec<String>,
}

impl FilterRule {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
            && self.excluded.is_empty()
            && self.included_ips.is_empty()
            && self.excluded_ips.is_empty()
    }

    /// Compile every pattern once; the result is immutable and shared without locking.
    pub fn compile(&self) -> Result<Filter, ConfigError> {
        Ok(Filter {
            open: self.is_empty(),
            included: compile_all(&self.included, Literal::Prefix)?,
            excluded: compile_all(&self.excluded, Literal::Prefix)?,
            included_ips: compile_all(&self.included_ips, Literal::Exact)?,
            excluded_ips: compile_all(&self.excluded_ips, Literal::Exact)?,
        })
    }
}

/// Something that decides whether a trace reaches a particular sink.
pub trait DeliveryFilter: Send + Sync {
    fn should_deliver(&self, event: &TraceEvent) -> bool;
}

/// Compiled [`FilterRule`].
#[derive(Debug, Clone)]
pub struct Filter {
    open: bool,
    included: Vec<Pattern>,
    excluded: Vec<Pattern>,
    included_ips: Vec<Pattern>,
    excluded_ips: Vec<Pattern>,
}

impl Filter {
    /// A filter that delivers everything.
    pub const fn open() -> Self {
        Self {
            open: true,
            included: Vec::new(),
            excluded: Vec::new(),
            included_ips: Vec::new(),
            excluded_ips: Vec::new(),
        }
    }

    pub fn allows(&self, uri: &str, client_ip: &str) -> bool {
        if self.open {
            return true;
        }
        stage(&self.included_ips, &self.excluded_ips, client_ip)
            && stage(&self.included, &self.excluded, uri)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::open()
    }
}

impl DeliveryFilter for Filter {
    fn should_deliver(&self, event: &TraceEvent) -> bool {
        self.allows(&event.uri, &event.client_ip)
    }
}

fn stage(included: &[Pattern], excluded: &[Pattern], value: &str) -> bool {
    let admitted = included.is_empty() || included.iter().any(|p| p.matches(value));
    admitted && !excluded.iter().any(|p| p.matches(value))
}

#[derive(Debug, Clone, Copy)]
enum Literal {
    Prefix,
    Exact,
}

#[derive(Debug, Clone)]
enum Pattern {
    Prefix(String),
    Exact(String),
    Glob(Regex),
}

impl Pattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Pattern::Exact(exact) => value == exact,
            Pattern::Glob(regex) => regex.is_match(value),
        }
    }
}

fn compile_all(patterns: &[String], literal: Literal) -> Result<Vec<Pattern>, ConfigError> {
    patterns.iter().map(|p| compile(p, literal)).collect()
}

fn compile(pattern: &str, literal: Literal) -> Result<Pattern, ConfigError> {
    if !pattern.contains('*') {
        return Ok(match literal {
            Literal::Prefix => Pattern::Prefix(pattern.to_string()),
            Literal::Exact => Pattern::Exact(pattern.to_string()),
        });
    }
    let source = glob_to_regex(pattern).map_err(|reason| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    })?;
    Regex::new(&source).map(Pattern::Glob).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Translate a doublestar-style glob into an anchored regex.
fn glob_to_regex(glob: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    let mut alternation_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for class_char in chars.by_ref() {
                    if class_char == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(class_char, '\\' | '[' | '&' | '~' | '^') {
                        out.push('\\');
                    }
                    out.push(class_char);
                }
                if !closed {
                    return Err("unterminated character class");
                }
                out.push(']');
            }
            '{' => {
                alternation_depth += 1;
                out.push_str("(?:");
            }
            ',' if alternation_depth > 0 => out.push('|'),
            '}' if alternation_depth > 0 => {
                alternation_depth -= 1;
                out.push(')');
            }
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => return Err("trailing escape"),
            },
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    if alternation_depth != 0 {
        return Err("unterminated alternation");
    }
    out.push('$');
    Ok(out)
}
