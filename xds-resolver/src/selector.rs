//! The immutable per-RPC decision object built from each accepted update.
//!
//! A selector is *active* while it is the one most recently published to
//! the channel, and *retired* once replaced. A retired selector no longer
//! holds its construction references, but RPCs that selected through it
//! keep their own references on every cluster of the matched route until
//! they commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::Status;

use crate::client::RpcInfo;
use crate::cluster::ClusterRefHandle;
use crate::filter::{Done, FilterChainPlan, InterceptorChain};
use crate::hash;
use crate::matcher;
use crate::resolver::Shared;
use crate::resource::{ListenerUpdate, RouteAction, RouteConfig, VirtualHost};
use crate::service_config::{cds_child_policy, cluster_id, cluster_specifier_plugin_id};
use crate::RandSource;

/// Channel-scoped inputs captured once per selector build.
pub(crate) struct SelectorContext {
    /// The data-plane authority matched against virtual-host domains.
    pub(crate) authority: String,
    pub(crate) ring_hash_enabled: bool,
    pub(crate) channel_id: u64,
    pub(crate) rand: Arc<dyn RandSource>,
}

/// The routing decision returned to the channel for one RPC.
#[derive(Debug)]
pub struct RouteSelection {
    /// Child id of the picked cluster as it appears in the service config
    /// (`cluster:<name>` or `cluster_specifier_plugin:<name>`).
    pub cluster: String,
    /// Request hash for consistent-hash load balancing, when enabled.
    pub request_hash: Option<u64>,
    /// Interceptor chain to run for this RPC.
    pub interceptor: InterceptorChain,
    /// Effective stream duration limit for this RPC.
    pub method_timeout: Option<Duration>,
    /// Fires when the RPC commits, releasing the cluster references this
    /// selection holds. Safe to fire more than once.
    pub on_committed: Done,
}

enum SelectorInner {
    Routing(RoutingState),
    /// Fails every RPC with the stored status while the cluster set keeps
    /// serving whatever in-flight RPCs still reference.
    Erroring(Status),
}

struct RoutingState {
    virtual_hosts: Vec<VirtualHost>,
    plan: FilterChainPlan,
    /// Listener-level stream duration default.
    max_stream_duration: Option<Duration>,
    ctx: Arc<SelectorContext>,
}

/// Immutable per-RPC decision object bound to one published service config.
pub struct ConfigSelector {
    inner: SelectorInner,
    shared: Arc<Shared>,
    /// Held from construction until retirement.
    construction_refs: Mutex<Vec<ClusterRefHandle>>,
}

impl ConfigSelector {
    /// Builds a selector from an accepted listener/route-config pair,
    /// acquiring one reference per cluster named anywhere in the routes.
    pub(crate) fn new(
        listener: &ListenerUpdate,
        route_config: &RouteConfig,
        ctx: Arc<SelectorContext>,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let mut refs = Vec::new();
        {
            let mut set = shared.lock_clusters();
            for vhost in &route_config.virtual_hosts {
                for route in &vhost.routes {
                    match &route.action {
                        RouteAction::WeightedClusters(entries) => {
                            for entry in entries {
                                refs.push(set.acquire(
                                    &cluster_id(&entry.name),
                                    cds_child_policy(&entry.name),
                                ));
                            }
                        }
                        RouteAction::ClusterSpecifierPlugin { name, child_policy } => {
                            refs.push(set.acquire(
                                &cluster_specifier_plugin_id(name),
                                child_policy.clone(),
                            ));
                        }
                        RouteAction::Unsupported => {}
                    }
                }
            }
        }
        let inner = match FilterChainPlan::compile(&listener.http_filters) {
            Ok(plan) => SelectorInner::Routing(RoutingState {
                virtual_hosts: route_config.virtual_hosts.clone(),
                plan,
                max_stream_duration: listener.max_stream_duration,
                ctx,
            }),
            Err(_) => SelectorInner::Erroring(Status::unavailable("no router filter present")),
        };
        Arc::new(Self {
            inner,
            shared,
            construction_refs: Mutex::new(refs),
        })
    }

    /// A selector that fails every RPC with `status` and holds no
    /// references of its own.
    pub(crate) fn erroring(status: Status, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            inner: SelectorInner::Erroring(status),
            shared,
            construction_refs: Mutex::new(Vec::new()),
        })
    }

    /// Decides route, cluster, interceptors and timeout for one RPC.
    ///
    /// Runs on the caller's thread; the selector itself is immutable and
    /// only the cluster set is touched under its own lock.
    pub fn select_config(&self, rpc: &RpcInfo<'_>) -> Result<RouteSelection, Status> {
        let state = match &self.inner {
            SelectorInner::Erroring(status) => return Err(status.clone()),
            SelectorInner::Routing(state) => state,
        };
        let ctx = &state.ctx;
        let vhost = matcher::find_best_virtual_host(&ctx.authority, &state.virtual_hosts)
            .ok_or_else(no_matching_route)?;
        let route = vhost
            .routes
            .iter()
            .find(|r| matcher::route_matches(&r.matcher, rpc, ctx.rand.as_ref()))
            .ok_or_else(no_matching_route)?;

        let no_overrides = HashMap::new();
        let (picked, cluster_overrides, handles) = match &route.action {
            RouteAction::WeightedClusters(entries) => {
                let picked = matcher::pick_weighted(entries, ctx.rand.as_ref())
                    .ok_or_else(no_matching_route)?;
                // Every cluster of the set stays alive until this RPC
                // commits, not only the picked one: a later update may
                // re-route to any of them while the RPC is in flight.
                let mut set = self.shared.lock_clusters();
                let handles = entries
                    .iter()
                    .map(|e| set.acquire(&cluster_id(&e.name), cds_child_policy(&e.name)))
                    .collect();
                (cluster_id(&picked.name), &picked.filter_overrides, handles)
            }
            RouteAction::ClusterSpecifierPlugin { name, child_policy } => {
                let id = cluster_specifier_plugin_id(name);
                let handle = self.shared.lock_clusters().acquire(&id, child_policy.clone());
                (id, &no_overrides, vec![handle])
            }
            RouteAction::Unsupported => return Err(no_matching_route()),
        };

        let chain = match state.plan.instantiate(
            &vhost.filter_overrides,
            &route.filter_overrides,
            cluster_overrides,
        ) {
            Ok(chain) => chain,
            Err(status) => {
                self.release_refs(handles);
                return Err(status);
            }
        };

        let request_hash = ctx
            .ring_hash_enabled
            .then(|| hash::generate_hash(&route.hash_policies, rpc, ctx.channel_id));

        let method_timeout = match route.max_stream_duration {
            // An explicit zero disables the listener default.
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => state.max_stream_duration.filter(|d| !d.is_zero()),
        };

        let shared = self.shared.clone();
        let on_committed = Done::new(move || {
            let mut any_idle = false;
            {
                let mut set = shared.lock_clusters();
                for handle in handles {
                    any_idle |= set.release(handle);
                }
            }
            if any_idle {
                shared.notify_idle();
            }
        });

        Ok(RouteSelection {
            cluster: picked,
            request_hash,
            interceptor: chain,
            method_timeout,
            on_committed,
        })
    }

    /// Releases the construction references; invoked once when the selector
    /// is replaced or the resolver shuts down. Returns true when any
    /// cluster count reached zero.
    pub(crate) fn retire(&self) -> bool {
        let handles = match self.construction_refs.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return false;
        }
        let mut any_idle = false;
        let mut set = self.shared.lock_clusters();
        for handle in handles {
            any_idle |= set.release(handle);
        }
        any_idle
    }

    fn release_refs(&self, handles: Vec<ClusterRefHandle>) {
        let mut any_idle = false;
        {
            let mut set = self.shared.lock_clusters();
            for handle in handles {
                any_idle |= set.release(handle);
            }
        }
        if any_idle {
            self.shared.notify_idle();
        }
    }
}

fn no_matching_route() -> Status {
    Status::unavailable("no matching virtual host or route")
}
