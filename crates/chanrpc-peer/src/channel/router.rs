use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::logical::Channel;
use crate::error::{PeerError, Result};

/// Route parameters captured from a channel path.
pub type RouteParams = HashMap<String, String>;

/// Server-side handler for channels opened on a matching path.
pub trait PathHandler: Send + Sync + 'static {
    /// Take over a newly opened channel.
    fn handle(&self, channel: Channel, connection_id: u64, params: RouteParams);

    /// The physical connection `connection_id` is gone.
    fn dispose(&self, connection_id: u64) {
        let _ = connection_id;
    }
}

impl<F> PathHandler for F
where
    F: Fn(Channel, u64, RouteParams) + Send + Sync + 'static,
{
    fn handle(&self, channel: Channel, connection_id: u64, params: RouteParams) {
        self(channel, connection_id, params)
    }
}

struct Route {
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn PathHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Maps path patterns to handlers.
///
/// A pattern is `/`-separated and may contain one `:name` segment that
/// captures whatever occupies that position. A path with no matching route
/// falls back to the route registered for its first segment.
#[derive(Default)]
pub struct PathRouter {
    routes: Vec<Route>,
}

/// A resolved route.
pub struct RouteMatch {
    pub pattern: String,
    pub handler: Arc<dyn PathHandler>,
    pub params: RouteParams,
}

impl PathRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`. Replaces an earlier route with the
    /// same pattern.
    pub fn add(&mut self, pattern: &str, handler: impl PathHandler) -> Result<()> {
        let segments = parse_pattern(pattern)?;
        let pattern = trim(pattern).to_string();
        debug!(path = %pattern, "route added");
        let route = Route {
            pattern,
            segments,
            handler: Arc::new(handler),
        };
        match self.routes.iter_mut().find(|r| r.pattern == route.pattern) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
        Ok(())
    }

    /// Builder-style [`add`](Self::add).
    pub fn route(mut self, pattern: &str, handler: impl PathHandler) -> Result<Self> {
        self.add(pattern, handler)?;
        Ok(self)
    }

    /// Registered patterns, sorted.
    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.routes.iter().map(|r| r.pattern.as_str()).collect();
        patterns.sort_unstable();
        patterns
    }

    /// Find the handler for `path`.
    ///
    /// Literal routes win over parameterized ones. When nothing matches, the
    /// part of the path before the first `/` is tried as an exact route.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let path = trim(path);
        let parts: Vec<&str> = path.split('/').collect();

        let exact = self
            .routes
            .iter()
            .find(|route| route.pattern == path)
            .map(|route| (route, RouteParams::new()));
        let matched = exact.or_else(|| {
            self.routes
                .iter()
                .find_map(|route| match_segments(&route.segments, &parts).map(|p| (route, p)))
        });
        let matched = matched.or_else(|| {
            let (parent, _) = path.split_once('/')?;
            self.routes
                .iter()
                .find(|route| route.pattern == parent)
                .map(|route| (route, RouteParams::new()))
        });

        matched.map(|(route, params)| RouteMatch {
            pattern: route.pattern.clone(),
            handler: Arc::clone(&route.handler),
            params,
        })
    }
}

fn trim(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    let trimmed = trim(pattern);
    if trimmed.is_empty() {
        return Err(PeerError::InvalidRoute(pattern.to_string()));
    }
    let mut params = 0;
    let mut segments = Vec::new();
    for part in trimmed.split('/') {
        match part.strip_prefix(':') {
            Some("") => return Err(PeerError::InvalidRoute(pattern.to_string())),
            Some(name) => {
                params += 1;
                segments.push(Segment::Param(name.to_string()));
            }
            None => segments.push(Segment::Literal(part.to_string())),
        }
    }
    if params > 1 {
        return Err(PeerError::InvalidRoute(pattern.to_string()));
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<RouteParams> {
    if segments.len() != parts.len() {
        return None;
    }
    let mut params = RouteParams::new();
    for (segment, part) in segments.iter().zip(parts) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}
