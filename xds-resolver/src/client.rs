//! Interfaces connecting the resolver to its collaborators: the xDS client
//! below it and the gRPC channel above it.

use std::sync::Arc;

use crate::bootstrap::BootstrapConfig;
use crate::error::XdsError;
use crate::resource::{ListenerUpdate, RouteConfig};
use crate::selector::ConfigSelector;

/// Callback invoked with each Listener watch event.
pub type ListenerWatcher = Box<dyn Fn(Result<ListenerUpdate, XdsError>) + Send + Sync>;

/// Callback invoked with each RouteConfiguration watch event.
pub type RouteConfigWatcher = Box<dyn Fn(Result<RouteConfig, XdsError>) + Send + Sync>;

/// Cancels a previously registered watch.
pub type WatchCancel = Box<dyn FnOnce() + Send>;

/// The xDS client the resolver registers its watches with.
///
/// Implementations deliver the current resource state when known and on
/// every subsequent change. Callbacks may be invoked from any thread; the
/// resolver serializes them internally, so implementations need not.
pub trait XdsClient: Send + Sync + 'static {
    /// The bootstrap configuration this client was created from.
    fn bootstrap_config(&self) -> Arc<BootstrapConfig>;

    /// Subscribes to a Listener (LDS) resource.
    fn watch_listener(&self, resource_name: &str, watcher: ListenerWatcher) -> WatchCancel;

    /// Subscribes to a RouteConfiguration (RDS) resource.
    fn watch_route_config(&self, resource_name: &str, watcher: RouteConfigWatcher) -> WatchCancel;
}

/// The channel-facing surface the resolver publishes to.
pub trait ChannelController: Send + Sync + 'static {
    /// Publishes a new service config and config selector. States arrive in
    /// the order the resolver produced them.
    fn update_state(&self, state: ResolverState);

    /// Reports a transient control-plane error. Previously published state
    /// remains in effect.
    fn report_error(&self, error: XdsError);
}

/// State published to the channel on each accepted update.
#[derive(Clone)]
pub struct ResolverState {
    /// JSON service config for the cluster-manager load balancer. The
    /// literal `{}` when no clusters are active.
    pub service_config: String,
    /// Decides the route, cluster and interceptors for each RPC on the
    /// channel.
    pub config_selector: Arc<ConfigSelector>,
}

/// Per-RPC information passed to
/// [`ConfigSelector::select_config`](crate::selector::ConfigSelector::select_config).
#[derive(Clone, Copy, Debug)]
pub struct RpcInfo<'a> {
    /// Full method path, e.g. `/package.Service/Method`.
    pub method: &'a str,
    /// Outgoing request metadata.
    pub headers: &'a http::HeaderMap,
}
