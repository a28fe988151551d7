//! Route table: maps `(method, path pattern, endpoint name)` onto handlers.
//!
//! Patterns are segment-based: literals, `:name` parameters, `*` for exactly
//! one segment and `**` for any remainder. Matching prefers exact methods
//! over the `*` method, and literal segments over parameters over wildcards,
//! compared left to right.

use crate::error::{Error, Result};
use crate::pipeline::{Middleware, RouteHandler};
use crate::static_files::StaticMount;
use http::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// `*` — exactly one segment.
    Wildcard,
    /// `**` — the rest of the path, possibly empty.
    Remainder,
}

impl Segment {
    // Higher ranks are more specific; used for leftmost-first comparison.
    fn rank(&self) -> u8 {
        match self {
            Segment::Literal(_) => 3,
            Segment::Param(_) => 2,
            Segment::Wildcard => 1,
            Segment::Remainder => 0,
        }
    }

    fn shape(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Param(_) => ":",
            Segment::Wildcard => "*",
            Segment::Remainder => "**",
        }
    }
}

/// A parsed path pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = normalize_path(raw);
        let mut segments = Vec::new();
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            let segment = match part {
                "*" => Segment::Wildcard,
                "**" => Segment::Remainder,
                p if p.starts_with(':') => {
                    let name = &p[1..];
                    if name.is_empty() {
                        return Err(Error::config(format!("unnamed parameter in {raw}")));
                    }
                    Segment::Param(name.to_string())
                }
                p => Segment::Literal(p.to_string()),
            };
            if matches!(segments.last(), Some(Segment::Remainder)) {
                return Err(Error::config(format!(
                    "'**' must be the final segment in {raw}"
                )));
            }
            segments.push(segment);
        }
        Ok(Self {
            raw: normalized,
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Two patterns collide when their segment shapes are identical
    /// (parameter names do not differentiate routes).
    fn shape_eq(&self, other: &RoutePattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.shape() == b.shape())
    }

    /// Try to match an already percent-decoded path. Returns the bound
    /// parameters and the `**` remainder, when present.
    pub fn matches(&self, path: &str) -> Option<(HashMap<String, String>, Option<String>)> {
        let path = normalize_path(path);
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

        let mut params = HashMap::new();
        let mut remainder = None;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Remainder => {
                    remainder = Some(parts[i.min(parts.len())..].join("/"));
                    return Some((params, remainder));
                }
                _ if i >= parts.len() => return None,
                Segment::Literal(lit) => {
                    if !lit.eq_ignore_ascii_case(parts[i]) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), parts[i].to_string());
                }
                Segment::Wildcard => {}
            }
        }
        if parts.len() != self.segments.len() {
            return None;
        }
        Some((params, remainder))
    }

    /// Leftmost-first specificity comparison: literal beats `:param` beats
    /// `*` beats `**`. A terminating sentinel outranks everything so that an
    /// exact-length pattern beats one that swallows a remainder.
    fn specificity(&self) -> Vec<u8> {
        let mut ranks: Vec<u8> = self.segments.iter().map(Segment::rank).collect();
        ranks.push(4);
        ranks
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let without_trailing = trimmed.trim_end_matches('/');
    if without_trailing.is_empty() {
        "/".to_string()
    } else if without_trailing.starts_with('/') {
        without_trailing.to_string()
    } else {
        format!("/{without_trailing}")
    }
}

/// One registered route.
pub struct Route {
    /// `None` means the `*` method: matches any, loses to a specific match.
    pub method: Option<Method>,
    pub pattern: RoutePattern,
    /// When set, only requests accepted on the endpoint of this name match.
    pub endpoint_name: Option<String>,
    pub handler: RouteHandler,
    pub middleware: Vec<Arc<dyn Middleware>>,
    /// Name of the authentication method guarding this route.
    pub auth: Option<String>,
    /// A login route renders its page unauthenticated on GET.
    pub login: bool,
    /// A logout route clears the session's auth slot and revokes it.
    pub logout: bool,
    pub static_mount: Option<StaticMount>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.raw)
            .field("endpoint_name", &self.endpoint_name)
            .field("auth", &self.auth)
            .finish()
    }
}

impl Route {
    pub fn new(method: Option<Method>, pattern: &str, handler: RouteHandler) -> Result<Self> {
        Ok(Self {
            method,
            pattern: RoutePattern::parse(pattern)?,
            endpoint_name: None,
            handler,
            middleware: Vec::new(),
            auth: None,
            login: false,
            logout: false,
            static_mount: None,
        })
    }

    pub fn on_endpoint(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = Some(name.into());
        self
    }

    pub fn with_auth(mut self, name: impl Into<String>) -> Self {
        self.auth = Some(name.into());
        self
    }

    pub fn with_middleware(mut self, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn as_login(mut self) -> Self {
        self.login = true;
        self
    }

    pub fn as_logout(mut self) -> Self {
        self.logout = true;
        self
    }

    pub fn with_static(mut self, mount: StaticMount) -> Self {
        self.static_mount = Some(mount);
        self
    }

    fn method_label(&self) -> String {
        self.method
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "*".to_string())
    }
}

/// A successful route lookup.
#[derive(Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
    /// The path tail captured by a trailing `**`.
    pub remainder: Option<String>,
}

/// The route table. Configure-once, read-many: routes are added during
/// setup, before the listener starts.
#[derive(Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route.
    ///
    /// Two routes with the same method, pattern shape and endpoint filter
    /// are a configuration error, reported here rather than as an ambiguous
    /// tie at dispatch time.
    pub fn add(&mut self, route: Route) -> Result<()> {
        if let Some(existing) = self.routes.iter().find(|r| {
            r.method == route.method
                && r.endpoint_name == route.endpoint_name
                && r.pattern.shape_eq(&route.pattern)
        }) {
            return Err(Error::config(format!(
                "route {} {} is already defined (as {} {})",
                route.method_label(),
                route.pattern,
                existing.method_label(),
                existing.pattern,
            )));
        }
        tracing::info!(
            method = %route.method_label(),
            pattern = %route.pattern,
            endpoint = ?route.endpoint_name,
            auth = ?route.auth,
            "route registered"
        );
        self.routes.push(Arc::new(route));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    /// Match a request against the table.
    ///
    /// An exact-method match always beats a `*`-method match; among matches
    /// of the same method class the most specific pattern wins, comparing
    /// segments left to right.
    pub fn route(
        &self,
        method: &Method,
        path: &str,
        endpoint_name: Option<&str>,
    ) -> Option<RouteMatch> {
        let mut best: Option<(bool, Vec<u8>, RouteMatch)> = None;

        for route in &self.routes {
            if let Some(filter) = &route.endpoint_name {
                if endpoint_name != Some(filter.as_str()) {
                    continue;
                }
            }
            let method_exact = match &route.method {
                Some(m) => {
                    if m != method {
                        continue;
                    }
                    true
                }
                None => false,
            };
            let Some((params, remainder)) = route.pattern.matches(path) else {
                continue;
            };
            let specificity = route.pattern.specificity();
            let candidate = (
                method_exact,
                specificity,
                RouteMatch {
                    route: route.clone(),
                    params,
                    remainder,
                },
            );
            let better = match &best {
                None => true,
                Some((best_exact, best_spec, _)) => {
                    (candidate.0, &candidate.1) > (*best_exact, best_spec)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        match best {
            Some((_, _, m)) => {
                tracing::debug!(method = %method, path = %path, pattern = %m.route.pattern, "route matched");
                Some(m)
            }
            None => {
                tracing::debug!(method = %method, path = %path, "no route matched");
                None
            }
        }
    }
}
