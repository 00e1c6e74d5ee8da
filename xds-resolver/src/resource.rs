//! Resource types delivered by the xDS client watches.
//!
//! These are the validated, client-side views of the Listener and
//! RouteConfiguration resources; decoding them from the wire protos is the
//! xDS client's job. All types compare structurally so the resolver can
//! suppress redundant updates.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::filter::{FilterConfig, HttpFilterDescriptor};

/// Configuration carried by a Listener (LDS) resource for a gRPC client.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerUpdate {
    /// Where the route configuration comes from.
    pub route_config: RouteConfigSource,
    /// Listener-level default for the per-RPC stream duration limit.
    pub max_stream_duration: Option<Duration>,
    /// Ordered HTTP filter list; must end with a terminal router filter.
    pub http_filters: Vec<HttpFilterDescriptor>,
}

/// Where a listener's route configuration comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteConfigSource {
    /// The listener names a RouteConfiguration watched via RDS.
    Rds(String),
    /// The listener carries its route configuration inline.
    Inline(RouteConfig),
}

/// A RouteConfiguration (RDS) resource: an ordered virtual-host tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteConfig {
    pub virtual_hosts: Vec<VirtualHost>,
}

/// A group of routes selected by the request authority.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualHost {
    /// Domain patterns matched against the channel authority. `*` prefixes
    /// and suffixes are supported, as is the catch-all `*`.
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
    /// Per-virtual-host filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, FilterConfig>,
}

/// A single route: a match condition plus the action taken when it wins.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub matcher: RouteMatch,
    pub action: RouteAction,
    /// Hash policies evaluated for consistent-hash load balancing.
    pub hash_policies: Vec<HashPolicy>,
    /// Per-route filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, FilterConfig>,
    /// Per-route stream duration limit. `Some(ZERO)` disables the listener
    /// default; `None` inherits it.
    pub max_stream_duration: Option<Duration>,
}

impl Route {
    /// A route with the given match and action and nothing else.
    pub fn new(matcher: RouteMatch, action: RouteAction) -> Self {
        Self {
            matcher,
            action,
            hash_policies: Vec::new(),
            filter_overrides: HashMap::new(),
            max_stream_duration: None,
        }
    }
}

/// The match condition of a route.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteMatch {
    pub path: PathMatcher,
    /// Whether exact and prefix path matching is case sensitive.
    pub case_sensitive: bool,
    pub headers: Vec<HeaderMatcher>,
    /// Fraction of requests this route applies to, decided per RPC by a
    /// random draw.
    pub runtime_fraction: Option<RuntimeFraction>,
}

impl RouteMatch {
    /// A case-sensitive prefix match with no header or fraction conditions.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            path: PathMatcher::Prefix(prefix.into()),
            case_sensitive: true,
            headers: Vec::new(),
            runtime_fraction: None,
        }
    }
}

/// How a route matches the RPC method path.
#[derive(Clone, Debug)]
pub enum PathMatcher {
    Exact(String),
    /// The empty prefix matches any path.
    Prefix(String),
    /// Must match the entire path.
    Regex(Regex),
}

impl PartialEq for PathMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Prefix(a), Self::Prefix(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// A single header match condition.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderMatcher {
    pub name: String,
    pub kind: HeaderMatchKind,
    /// Inverts the match result.
    pub invert: bool,
}

/// The kinds of header matches.
#[derive(Clone, Debug)]
pub enum HeaderMatchKind {
    Exact(String),
    /// Must match the entire value.
    Regex(Regex),
    /// The value parses as an integer in `[start, end)`.
    Range { start: i64, end: i64 },
    /// The header is present (or absent, for `Present(false)`).
    Present(bool),
    Prefix(String),
    Suffix(String),
}

impl PartialEq for HeaderMatchKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::Range { start: a, end: b }, Self::Range { start: c, end: d }) => {
                a == c && b == d
            }
            (Self::Present(a), Self::Present(b)) => a == b,
            (Self::Prefix(a), Self::Prefix(b)) => a == b,
            (Self::Suffix(a), Self::Suffix(b)) => a == b,
            _ => false,
        }
    }
}

/// Fraction of requests a route applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeFraction {
    pub numerator: u32,
    pub denominator: u32,
}

/// The action taken when a route matches.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteAction {
    /// A weighted cluster set; one entry is drawn per RPC.
    WeightedClusters(Vec<WeightedCluster>),
    /// An opaque cluster specifier plugin carrying its child LB policy.
    ClusterSpecifierPlugin {
        name: String,
        child_policy: serde_json::Value,
    },
    /// Recognized but unsupported; the route never matches.
    Unsupported,
}

/// One entry of a weighted cluster set.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedCluster {
    pub name: String,
    /// Selection weight. A zero-weight entry is never picked but still
    /// counts as a referenced cluster.
    pub weight: u32,
    /// Per-cluster filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, FilterConfig>,
}

impl WeightedCluster {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            filter_overrides: HashMap::new(),
        }
    }
}

/// A rule producing a 64-bit value for consistent-hash load balancing.
#[derive(Clone, Debug, PartialEq)]
pub struct HashPolicy {
    pub kind: HashPolicyKind,
    /// Stop evaluating later policies once this one has produced a value.
    pub terminal: bool,
}

/// The sources a hash policy can draw from.
#[derive(Clone, Debug)]
pub enum HashPolicyKind {
    /// Hash a request header value, optionally rewritten first.
    Header {
        header_name: String,
        /// When set, every regex match in the value is replaced with
        /// `regex_substitution` before hashing.
        regex: Option<Regex>,
        regex_substitution: String,
    },
    /// Hash the 64-bit id of the channel issuing the RPC.
    ChannelId,
    /// Hash a filter-state value; only the channel-id key is recognized.
    FilterState { key: String },
}

impl PartialEq for HashPolicyKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Header {
                    header_name: a,
                    regex: ar,
                    regex_substitution: asub,
                },
                Self::Header {
                    header_name: b,
                    regex: br,
                    regex_substitution: bsub,
                },
            ) => {
                a == b
                    && asub == bsub
                    && ar.as_ref().map(Regex::as_str) == br.as_ref().map(Regex::as_str)
            }
            (Self::ChannelId, Self::ChannelId) => true,
            (Self::FilterState { key: a }, Self::FilterState { key: b }) => a == b,
            _ => false,
        }
    }
}
