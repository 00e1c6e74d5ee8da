//! Virtual-host and route matching.

use crate::client::RpcInfo;
use crate::resource::{
    HeaderMatchKind, HeaderMatcher, PathMatcher, RouteMatch, VirtualHost, WeightedCluster,
};
use crate::RandSource;

/// gRPC requests always carry this content type; it is not part of the
/// metadata handed to the resolver.
const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Domain pattern tiers, weakest first so `Ord` picks the strongest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DomainTier {
    CatchAll,
    Prefix,
    Suffix,
    Exact,
}

fn match_domain(pattern: &str, host: &str) -> Option<(DomainTier, usize)> {
    if pattern == "*" {
        return Some((DomainTier::CatchAll, 0));
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.contains('*') {
            return None;
        }
        return host
            .ends_with(suffix)
            .then_some((DomainTier::Suffix, suffix.len()));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if prefix.contains('*') {
            return None;
        }
        return host
            .starts_with(prefix)
            .then_some((DomainTier::Prefix, prefix.len()));
    }
    if pattern.contains('*') {
        return None;
    }
    (pattern == host).then_some((DomainTier::Exact, pattern.len()))
}

/// Selects the virtual host whose domains best match `authority`:
/// exact beats suffix beats prefix beats catch-all, with ties broken by the
/// longest literal and then declaration order.
pub(crate) fn find_best_virtual_host<'a>(
    authority: &str,
    virtual_hosts: &'a [VirtualHost],
) -> Option<&'a VirtualHost> {
    let host = authority.to_ascii_lowercase();
    let mut best: Option<(&VirtualHost, DomainTier, usize)> = None;
    for vh in virtual_hosts {
        for domain in &vh.domains {
            let pattern = domain.to_ascii_lowercase();
            let Some((tier, literal)) = match_domain(&pattern, &host) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((_, best_tier, best_literal)) => {
                    tier > best_tier || (tier == best_tier && literal > best_literal)
                }
            };
            if better {
                best = Some((vh, tier, literal));
            }
        }
    }
    best.map(|(vh, _, _)| vh)
}

/// Whether the route's match condition succeeds for this RPC.
pub(crate) fn route_matches(m: &RouteMatch, rpc: &RpcInfo<'_>, rand: &dyn RandSource) -> bool {
    if !path_matches(&m.path, m.case_sensitive, rpc.method) {
        return false;
    }
    if !m.headers.iter().all(|h| header_matches(h, rpc)) {
        return false;
    }
    if let Some(fraction) = &m.runtime_fraction {
        if fraction.denominator == 0 {
            return false;
        }
        if rand.next_u64() % u64::from(fraction.denominator) >= u64::from(fraction.numerator) {
            return false;
        }
    }
    true
}

fn path_matches(matcher: &PathMatcher, case_sensitive: bool, path: &str) -> bool {
    match matcher {
        PathMatcher::Exact(want) => {
            if case_sensitive {
                path == want
            } else {
                path.eq_ignore_ascii_case(want)
            }
        }
        PathMatcher::Prefix(prefix) => {
            if case_sensitive {
                path.starts_with(prefix)
            } else {
                path.get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            }
        }
        PathMatcher::Regex(re) => re.find(path).is_some_and(|m| m.as_str() == path),
    }
}

/// Looks up a header value for matching and hashing: repeated values are
/// joined with commas, binary (`-bin`) headers are invisible, and the
/// `:path` and `content-type` pseudo-values are synthesized.
pub(crate) fn header_value(rpc: &RpcInfo<'_>, name: &str) -> Option<String> {
    if name == ":path" {
        return Some(rpc.method.to_string());
    }
    if name.eq_ignore_ascii_case("content-type") {
        return Some(GRPC_CONTENT_TYPE.to_string());
    }
    if name.ends_with("-bin") {
        return None;
    }
    let values: Vec<&str> = rpc
        .headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.join(","))
}

fn header_matches(matcher: &HeaderMatcher, rpc: &RpcInfo<'_>) -> bool {
    let value = header_value(rpc, &matcher.name);
    let matched = match &matcher.kind {
        HeaderMatchKind::Present(want) => value.is_some() == *want,
        kind => match value {
            None => false,
            Some(value) => match kind {
                HeaderMatchKind::Exact(want) => value == *want,
                HeaderMatchKind::Regex(re) => {
                    re.find(&value).is_some_and(|m| m.as_str() == value)
                }
                HeaderMatchKind::Range { start, end } => value
                    .parse::<i64>()
                    .is_ok_and(|n| *start <= n && n < *end),
                HeaderMatchKind::Prefix(prefix) => value.starts_with(prefix),
                HeaderMatchKind::Suffix(suffix) => value.ends_with(suffix),
                HeaderMatchKind::Present(_) => unreachable!(),
            },
        },
    };
    matched != matcher.invert
}

/// Draws one entry from a weighted cluster set. Returns `None` when the
/// total weight is zero, in which case the route counts as unmatched.
pub(crate) fn pick_weighted<'a>(
    entries: &'a [WeightedCluster],
    rand: &dyn RandSource,
) -> Option<&'a WeightedCluster> {
    let total: u64 = entries.iter().map(|e| u64::from(e.weight)).sum();
    if total == 0 {
        return None;
    }
    let mut draw = rand.next_u64() % total;
    for entry in entries {
        let weight = u64::from(entry.weight);
        if draw < weight {
            return Some(entry);
        }
        draw -= weight;
    }
    None
}
