//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - CONNECT only considers routes that allow tunnels, and ignores paths
//! - Explicit `None` rather than silent default

use crate::codec::RequestHead;
use crate::config::{RetryConfig, RouteConfig};
use crate::resilience::RetryPolicy;

use super::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub cluster: String,
    pub require_host: bool,
    pub allow_connect: bool,
    pub https_redirect: bool,
    pub retry: RetryPolicy,
    priority: u32,
    matcher: AndMatcher,
    connect_matcher: AndMatcher,
}

impl Route {
    pub fn compile(config: &RouteConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = host_matcher(config).into_iter().collect();
        if let Some(prefix) = &config.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }

        let retry = config
            .retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .unwrap_or_else(|| RetryPolicy::from_config(&RetryConfig::default()));

        Self {
            name: config.name.clone(),
            cluster: config.cluster.clone(),
            require_host: config.require_host,
            allow_connect: config.allow_connect,
            https_redirect: config.https_redirect,
            retry,
            priority: config.priority,
            matcher: AndMatcher::new(matchers),
            connect_matcher: AndMatcher::new(host_matcher(config).into_iter().collect()),
        }
    }

    pub fn matches(&self, head: &RequestHead) -> bool {
        if head.is_connect() {
            self.allow_connect && self.connect_matcher.matches(head)
        } else {
            self.matcher.matches(head)
        }
    }
}

fn host_matcher(config: &RouteConfig) -> Option<Box<dyn Matcher>> {
    match config.host.as_deref() {
        None | Some("*") => None,
        Some(host) => Some(Box::new(HostMatcher::new(host))),
    }
}

/// Immutable, priority-ordered route list.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = configs.iter().map(Route::compile).collect();
        // Stable sort keeps config order among equal priorities
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    /// First route matching the request, highest priority first.
    pub fn find(&self, head: &RequestHead) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(head))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
