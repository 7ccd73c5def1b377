//! Route pattern compilation and matching.
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "docs/readme.txt"`  |
//! | `^/v(\d+)/`  (regex) | `/v2/items`                | `0 → "2"`                       |
//!
//! A pattern is compiled once into a [`Matcher`]; matching is a pure function
//! of the path it is given.

use std::collections::HashMap;

use regex::Regex;

/// Parameters captured by a matched route.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds `other`'s entries, overwriting keys that already exist.
    pub fn extend(&mut self, other: Params) {
        self.map.extend(other.map);
    }
}

/// A successful match: the consumed path prefix and the captured parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub prefix: String,
    pub params: Params,
}

/// Route pattern as given at registration time.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// A literal path with optional `:name` segments and a trailing `*`.
    Path(String),
    /// A regular expression; capture groups become params `"0"`, `"1"`, ….
    Regex(Regex),
    /// Matches when any member does, first one wins.
    Any(Vec<Pattern>),
}

impl From<&str> for Pattern {
    fn from(path: &str) -> Self {
        Self::Path(path.to_owned())
    }
}

impl From<String> for Pattern {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

impl From<Regex> for Pattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

impl<T: Into<Pattern>> From<Vec<T>> for Pattern {
    fn from(patterns: Vec<T>) -> Self {
        Self::Any(patterns.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Pattern>, const N: usize> From<[T; N]> for Pattern {
    fn from(patterns: [T; N]) -> Self {
        Self::Any(patterns.into_iter().map(Into::into).collect())
    }
}

/// Whether a pattern must consume the whole path or only a leading part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Leaf routes: the whole path must match.
    Exact,
    /// Sub-router mounts: the pattern must be followed by `/` or the end.
    Prefix,
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
enum Compiled {
    Segments { segments: Vec<Segment>, wildcard: bool },
    Regex(Regex),
    Any(Vec<Compiled>),
}

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct Matcher {
    compiled: Compiled,
    mode: MatchMode,
    ignore_trailing_slash: bool,
}

impl Matcher {
    /// Compiles `pattern`.
    ///
    /// With `ignore_trailing_slash`, one trailing `/` on either the pattern or
    /// the path is ignored in [`MatchMode::Exact`], so `/users/` and `/users`
    /// are equivalent.
    ///
    /// # Examples
    ///
    /// ```
    /// use wharf::router::{MatchMode, Matcher};
    ///
    /// let m = Matcher::compile("/users/:id", MatchMode::Exact, true);
    /// let hit = m.matches("/users/42/").unwrap();
    /// assert_eq!(hit.params.get("id"), Some("42"));
    /// assert!(m.matches("/users").is_none());
    /// ```
    pub fn compile(pattern: impl Into<Pattern>, mode: MatchMode, ignore_trailing_slash: bool) -> Self {
        Self {
            compiled: compile(pattern.into(), mode, ignore_trailing_slash),
            mode,
            ignore_trailing_slash,
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// `true` for `*` and `/*`, which match every path.
    pub fn is_catch_all(&self) -> bool {
        matches!(&self.compiled, Compiled::Segments { segments, wildcard: true } if segments.is_empty())
    }

    /// Matches `path`, returning the consumed prefix and captured params.
    pub fn matches(&self, path: &str) -> Option<Match> {
        self.compiled.matches(path, self.mode, self.ignore_trailing_slash)
    }
}

fn compile(pattern: Pattern, mode: MatchMode, ignore_trailing_slash: bool) -> Compiled {
    match pattern {
        Pattern::Path(path) => {
            let mut segments: Vec<Segment> = split_path(&path)
                .into_iter()
                .map(|(s, _)| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_owned()),
                    None => Segment::Static(s.to_owned()),
                })
                .collect();
            let wildcard = matches!(segments.last(), Some(Segment::Static(s)) if s == "*");
            if wildcard {
                segments.pop();
            } else if (ignore_trailing_slash || mode == MatchMode::Prefix)
                && matches!(segments.last(), Some(Segment::Static(s)) if s.is_empty())
            {
                segments.pop();
            }
            Compiled::Segments { segments, wildcard }
        }
        Pattern::Regex(regex) => Compiled::Regex(regex),
        Pattern::Any(patterns) => Compiled::Any(
            patterns
                .into_iter()
                .map(|p| compile(p, mode, ignore_trailing_slash))
                .collect(),
        ),
    }
}

impl Compiled {
    fn matches(&self, path: &str, mode: MatchMode, ignore_trailing_slash: bool) -> Option<Match> {
        match self {
            Compiled::Segments { segments, wildcard } => {
                let mut parts = split_path(path);
                if mode == MatchMode::Exact
                    && !*wildcard
                    && ignore_trailing_slash
                    && parts.len() > segments.len()
                    && matches!(parts.last(), Some((s, _)) if s.is_empty())
                {
                    parts.pop();
                }
                if parts.len() < segments.len() {
                    return None;
                }
                if !*wildcard && mode == MatchMode::Exact && parts.len() != segments.len() {
                    return None;
                }

                let mut params = Params::new();
                for (segment, (part, _)) in segments.iter().zip(&parts) {
                    match segment {
                        Segment::Static(s) if s.as_str() == *part => {}
                        Segment::Parameter(name) if !part.is_empty() => params.insert(name.as_str(), *part),
                        _ => return None,
                    }
                }

                let consumed = match segments.len() {
                    0 => 0,
                    n => parts[n - 1].1,
                };
                if *wildcard {
                    let rest = path.get(consumed..).unwrap_or_default();
                    params.insert("wildcard", rest.strip_prefix('/').unwrap_or(rest));
                    return Some(Match {
                        prefix: path.to_owned(),
                        params,
                    });
                }
                Some(Match {
                    prefix: path[..consumed].to_owned(),
                    params,
                })
            }
            Compiled::Regex(regex) => {
                let captures = regex.captures(path)?;
                let whole = captures.get(0)?;
                if whole.start() != 0 {
                    return None;
                }
                let mut end = whole.end();
                if mode == MatchMode::Prefix {
                    if whole.as_str().ends_with('/') {
                        end -= 1;
                    } else if !(path[end..].is_empty() || path[end..].starts_with('/')) {
                        return None;
                    }
                }
                let mut params = Params::new();
                for (i, group) in captures.iter().skip(1).enumerate() {
                    if let Some(group) = group {
                        params.insert(i.to_string(), group.as_str());
                    }
                }
                Some(Match {
                    prefix: path[..end].to_owned(),
                    params,
                })
            }
            Compiled::Any(members) => members
                .iter()
                .find_map(|m| m.matches(path, mode, ignore_trailing_slash)),
        }
    }
}

/// Splits `path` into segments, each paired with the byte offset where it ends.
fn split_path(path: &str) -> Vec<(&str, usize)> {
    let mut start = usize::from(path.starts_with('/'));
    if start >= path.len() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    for segment in path[start..].split('/') {
        let end = start + segment.len();
        parts.push((segment, end));
        start = end + 1;
    }
    parts
}
