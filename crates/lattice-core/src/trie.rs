//! Path trie indexing routes by path segment.
//!
//! Each level of the trie holds literal children, at most one parameter
//! child, and at most one catch-all edge. Matching precedence per level is
//! literal → parameter → catch-all; ties are impossible by construction.
//! Patterns registered without a trailing slash match paths with one and
//! vice versa. Lookup never panics and never allocates on the miss path.

use std::collections::HashMap;

use http::Method;
use percent_encoding::percent_decode_str;

use crate::error::{RouteError, RouteResult};

/// Index into the router's route arena.
pub type RouteId = usize;

// =============================================================================
// Pattern segments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    CatchAll(String),
}

/// Splits and validates a pattern into segments.
///
/// Rejects empty interior segments, non-final catch-alls, and duplicate
/// parameter names within one pattern.
fn parse_pattern(pattern: &str) -> RouteResult<Vec<Segment>> {
    let malformed = |reason: &str| RouteError::MalformedPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if !pattern.starts_with('/') {
        return Err(malformed("pattern must start with '/'"));
    }
    if pattern == "/" {
        return Ok(Vec::new());
    }

    let trimmed = pattern.strip_suffix('/').unwrap_or(pattern);
    let mut segments = Vec::new();
    let mut seen_names: Vec<&str> = Vec::new();

    for raw in trimmed.split('/').skip(1) {
        if segments
            .last()
            .is_some_and(|s| matches!(s, Segment::CatchAll(_)))
        {
            return Err(malformed("catch-all must be the final segment"));
        }
        if raw.is_empty() {
            return Err(malformed("empty path segment"));
        }
        let segment = if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                return Err(malformed("parameter segment with no name"));
            }
            if seen_names.contains(&name) {
                return Err(malformed("duplicate parameter name"));
            }
            seen_names.push(name);
            Segment::Param(name.to_string())
        } else if let Some(name) = raw.strip_prefix('*') {
            if name.is_empty() {
                return Err(malformed("catch-all segment with no name"));
            }
            if seen_names.contains(&name) {
                return Err(malformed("duplicate parameter name"));
            }
            seen_names.push(name);
            Segment::CatchAll(name.to_string())
        } else {
            Segment::Literal(raw.to_string())
        };
        segments.push(segment);
    }

    Ok(segments)
}

/// Normalizes a pattern for conflict detection: strips the trailing slash
/// so `/a/b` and `/a/b/` occupy the same trie node.
pub(crate) fn normalize_pattern(pattern: &str) -> &str {
    if pattern.len() > 1 {
        pattern.strip_suffix('/').unwrap_or(pattern)
    } else {
        pattern
    }
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    /// At most one parameter child per node; the name is fixed by the first
    /// registration and later registrations must agree.
    param: Option<(String, Box<Node>)>,
    /// At most one catch-all edge per node. Catch-alls are terminal, so the
    /// edge holds method slots directly rather than a child node.
    catch_all: Option<(String, HashMap<Method, RouteId>)>,
    terminals: HashMap<Method, RouteId>,
}

// =============================================================================
// Lookup result
// =============================================================================

/// Outcome of a trie lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Find {
    /// A route matched; params are ordered and URL-decoded once.
    Found {
        /// Arena index of the matched route.
        route: RouteId,
        /// Extracted `(name, value)` pairs in pattern order.
        params: Vec<(String, String)>,
    },
    /// The path matches some route under a different method.
    MethodNotAllowed,
    /// Nothing matches the path under any method.
    NotFound,
}

// =============================================================================
// Trie
// =============================================================================

/// The route trie. Immutable once the server starts serving.
#[derive(Debug, Default)]
pub struct Trie {
    root: Node,
}

impl Trie {
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pattern` for `method`, pointing at `route`.
    pub fn add(&mut self, method: Method, pattern: &str, route: RouteId) -> RouteResult<()> {
        let segments = parse_pattern(pattern)?;
        let conflict = || RouteError::ConflictingRoute {
            method: method.to_string(),
            pattern: normalize_pattern(pattern).to_string(),
        };

        let mut node = &mut self.root;
        for (idx, segment) in segments.iter().enumerate() {
            match segment {
                Segment::Literal(text) => {
                    node = node.literals.entry(text.clone()).or_default();
                }
                Segment::Param(name) => {
                    let (existing, child) = node
                        .param
                        .get_or_insert_with(|| (name.clone(), Box::default()));
                    if existing.as_str() != name.as_str() {
                        return Err(RouteError::MalformedPattern {
                            pattern: pattern.to_string(),
                            reason: format!(
                                "parameter ':{name}' conflicts with existing ':{existing}' at the same position"
                            ),
                        });
                    }
                    node = child.as_mut();
                }
                Segment::CatchAll(name) => {
                    debug_assert_eq!(idx, segments.len() - 1);
                    let (existing, slots) = node
                        .catch_all
                        .get_or_insert_with(|| (name.clone(), HashMap::new()));
                    if existing.as_str() != name.as_str() {
                        return Err(RouteError::MalformedPattern {
                            pattern: pattern.to_string(),
                            reason: format!(
                                "catch-all '*{name}' conflicts with existing '*{existing}' at the same position"
                            ),
                        });
                    }
                    if slots.contains_key(&method) {
                        return Err(conflict());
                    }
                    slots.insert(method, route);
                    return Ok(());
                }
            }
        }

        if node.terminals.contains_key(&method) {
            return Err(conflict());
        }
        node.terminals.insert(method, route);
        Ok(())
    }

    /// Looks up `path` under `method`.
    ///
    /// The query string is stripped before matching; a trailing slash is
    /// equivalent to its absence.
    pub fn find(&self, method: &Method, path: &str) -> Find {
        let path = path.split('?').next().unwrap_or(path);
        let path = if path.len() > 1 {
            path.strip_suffix('/').unwrap_or(path)
        } else {
            path
        };
        let segments: Vec<&str> = if path == "/" || path.is_empty() {
            Vec::new()
        } else {
            path.split('/').skip(1).collect()
        };

        let mut params = Vec::new();
        if let Some(route) =
            search(&self.root, &segments, Some(method), &mut params)
        {
            return Find::Found { route, params };
        }

        // Second pass ignoring the method: distinguishes 405 from 404.
        params.clear();
        if search(&self.root, &segments, None, &mut params).is_some() {
            return Find::MethodNotAllowed;
        }
        Find::NotFound
    }
}

/// Decodes one path segment; invalid UTF-8 after decoding falls back to the
/// raw text so lookup never fails.
fn decode_segment(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Recursive backtracking search. `method: None` matches any terminal, used
/// by the 405 pass. Parameters collected along a failed branch are popped on
/// backtrack.
fn search(
    node: &Node,
    segments: &[&str],
    method: Option<&Method>,
    params: &mut Vec<(String, String)>,
) -> Option<RouteId> {
    let terminal_for = |slots: &HashMap<Method, RouteId>| -> Option<RouteId> {
        match method {
            Some(m) => slots.get(m).copied(),
            None => slots.values().next().copied(),
        }
    };

    let Some((head, rest)) = segments.split_first() else {
        return terminal_for(&node.terminals);
    };

    if let Some(child) = node.literals.get(*head) {
        if let Some(route) = search(child, rest, method, params) {
            return Some(route);
        }
    }

    if let Some((name, child)) = &node.param {
        params.push((name.clone(), decode_segment(head)));
        if let Some(route) = search(child, rest, method, params) {
            return Some(route);
        }
        params.pop();
    }

    if let Some((name, slots)) = &node.catch_all {
        if let Some(route) = terminal_for(slots) {
            let mut remainder = String::from(*head);
            for seg in rest {
                remainder.push('/');
                remainder.push_str(seg);
            }
            params.push((name.clone(), remainder));
            return Some(route);
        }
    }

    None
}
