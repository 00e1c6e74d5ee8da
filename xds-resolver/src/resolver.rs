//! The resolver core: the LDS→RDS watch state machine, selector lifecycle
//! and service config publication.
//!
//! All control events (watch callbacks, commit notifications, close) are
//! funneled through one unbounded channel and drained FIFO by a single
//! worker task, which yields a total order on selector builds and
//! publications. `select_config` never touches the worker: it reads the
//! immutable selector the channel already holds and only briefly locks the
//! cluster set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tonic::Status;
use tracing::{debug, warn};

use crate::client::{ChannelController, ResolverState, WatchCancel, XdsClient};
use crate::cluster::ClusterRefSet;
use crate::error::{BuildError, XdsError};
use crate::resource::{ListenerUpdate, RouteConfig, RouteConfigSource};
use crate::selector::{ConfigSelector, SelectorContext};
use crate::service_config;
use crate::target::XdsTarget;
use crate::{RandSource, ThreadRngSource};

/// State shared between the worker, the selectors it builds, and every
/// in-flight RPC.
pub(crate) struct Shared {
    cluster_refs: Mutex<ClusterRefSet>,
    event_tx: UnboundedSender<ResolverEvent>,
}

impl Shared {
    pub(crate) fn new(event_tx: UnboundedSender<ResolverEvent>) -> Self {
        Self {
            cluster_refs: Mutex::new(ClusterRefSet::new()),
            event_tx,
        }
    }

    pub(crate) fn lock_clusters(&self) -> MutexGuard<'_, ClusterRefSet> {
        self.cluster_refs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wakes the worker after some cluster count dropped to zero. A no-op
    /// once the resolver shut down.
    pub(crate) fn notify_idle(&self) {
        let _ = self.event_tx.send(ResolverEvent::ClusterIdle);
    }

    /// Snapshots the active clusters into a service config document and
    /// marks the publication so zero-count entries can be pruned.
    fn build_service_config(&self) -> String {
        let mut set = self.lock_clusters();
        let snapshot = set.snapshot();
        set.publish();
        service_config::build(&snapshot)
    }
}

pub(crate) enum ResolverEvent {
    Listener(Result<ListenerUpdate, XdsError>),
    RouteConfig {
        name: String,
        result: Result<RouteConfig, XdsError>,
    },
    /// Some cluster lost its last reference; republish without it.
    ClusterIdle,
    /// Wakes the worker so it observes the closed flag.
    Close,
}

/// Per-channel options supplied when building the resolver.
#[derive(Default)]
pub struct BuildOptions {
    /// Data-plane authority override; defaults to the target endpoint.
    pub authority: Option<String>,
    /// Set when the channel dials with xDS credentials; requires
    /// certificate providers in the bootstrap configuration.
    pub xds_credentials: bool,
    /// 64-bit id of the owning channel, consumed by channel-id hash
    /// policies. Drawn at random when absent.
    pub channel_id: Option<u64>,
    /// Replacement draw source; tests install deterministic generators.
    pub rand: Option<Arc<dyn RandSource>>,
}

/// Builds [`XdsResolver`] instances for `xds:` targets.
pub struct XdsResolverBuilder {
    client_factory: Box<dyn Fn() -> Result<Arc<dyn XdsClient>, XdsError> + Send + Sync>,
}

impl XdsResolverBuilder {
    /// Creates a builder that obtains its xDS client from `client_factory`
    /// on every `build` call.
    pub fn new<F>(client_factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn XdsClient>, XdsError> + Send + Sync + 'static,
    {
        Self {
            client_factory: Box::new(client_factory),
        }
    }

    /// Builds a resolver for `target`, registering the Listener watch and
    /// spawning the worker task.
    ///
    /// Must be called within a tokio runtime. Fails synchronously when the
    /// xDS client cannot be obtained, the target authority is not declared
    /// in the bootstrap configuration, or xDS credentials are requested
    /// without certificate providers.
    pub fn build(
        &self,
        target: &XdsTarget,
        controller: Arc<dyn ChannelController>,
        opts: BuildOptions,
    ) -> Result<XdsResolver, BuildError> {
        let client =
            (self.client_factory)().map_err(|err| BuildError::ClientCreation(err.to_string()))?;
        let bootstrap = client.bootstrap_config();
        let listener_name = bootstrap.listener_resource_name(target, crate::federation_enabled())?;
        if opts.xds_credentials && bootstrap.certificate_providers.is_empty() {
            return Err(BuildError::MissingCertificateProviders);
        }

        let rand = opts.rand.unwrap_or_else(|| Arc::new(ThreadRngSource));
        // Defaulted from the process RNG, never the injectable source:
        // draws from that source are reserved for route matching.
        let channel_id = opts
            .channel_id
            .unwrap_or_else(|| ThreadRngSource.next_u64());
        let ctx = Arc::new(SelectorContext {
            authority: opts
                .authority
                .unwrap_or_else(|| target.endpoint().to_string()),
            ring_hash_enabled: crate::ring_hash_enabled(),
            channel_id,
            rand,
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared::new(event_tx.clone()));

        debug!(resource = %listener_name, "starting listener watch");
        let lds_cancel = {
            let tx = event_tx.clone();
            let closed = closed.clone();
            client.watch_listener(
                &listener_name,
                Box::new(move |result| {
                    if closed.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.send(ResolverEvent::Listener(result));
                }),
            )
        };

        let worker = ResolverWorker {
            client,
            controller,
            shared,
            closed: closed.clone(),
            event_tx: event_tx.clone(),
            events: event_rx,
            ctx,
            lds_cancel: Some(lds_cancel),
            rds_cancel: None,
            listener: None,
            route_config_name: None,
            route_config: None,
            current_selector: None,
        };
        tokio::spawn(worker.run());

        Ok(XdsResolver { closed, event_tx })
    }
}

/// Handle to a running resolver, returned to the channel.
#[derive(Debug)]
pub struct XdsResolver {
    closed: Arc<AtomicBool>,
    event_tx: UnboundedSender<ResolverEvent>,
}

impl XdsResolver {
    /// Shuts the resolver down: watches are cancelled, construction
    /// references released, and every xDS callback arriving afterwards is
    /// silently dropped. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.event_tx.send(ResolverEvent::Close);
    }
}

impl Drop for XdsResolver {
    fn drop(&mut self) {
        self.close();
    }
}

struct ResolverWorker {
    client: Arc<dyn XdsClient>,
    controller: Arc<dyn ChannelController>,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    event_tx: UnboundedSender<ResolverEvent>,
    events: UnboundedReceiver<ResolverEvent>,
    ctx: Arc<SelectorContext>,

    lds_cancel: Option<WatchCancel>,
    rds_cancel: Option<WatchCancel>,
    /// The most recently accepted listener.
    listener: Option<ListenerUpdate>,
    /// Name of the route config currently watched, when not inline.
    route_config_name: Option<String>,
    /// The most recently accepted route config.
    route_config: Option<RouteConfig>,
    current_selector: Option<Arc<ConfigSelector>>,
}

impl ResolverWorker {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            // Checked on the worker as well as in the callbacks: events
            // already queued when close() flips the flag must not surface.
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            match event {
                ResolverEvent::Listener(result) => self.handle_listener_event(result),
                ResolverEvent::RouteConfig { name, result } => {
                    self.handle_route_config_event(name, result)
                }
                ResolverEvent::ClusterIdle => self.publish(),
                ResolverEvent::Close => break,
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.lds_cancel.take() {
            cancel();
        }
        if let Some(cancel) = self.rds_cancel.take() {
            cancel();
        }
        if let Some(selector) = self.current_selector.take() {
            selector.retire();
        }
        self.shared.lock_clusters().publish();
    }

    fn handle_listener_event(&mut self, result: Result<ListenerUpdate, XdsError>) {
        match result {
            Ok(update) => self.handle_listener_update(update),
            Err(err) if err.is_resource_not_found() => {
                debug!("listener resource removed");
                self.listener = None;
                self.cancel_rds();
                self.route_config_name = None;
                self.route_config = None;
                self.install_erroring_selector();
            }
            Err(err) => {
                warn!(error = %err, "listener watch error");
                self.controller.report_error(err);
            }
        }
    }

    fn handle_listener_update(&mut self, update: ListenerUpdate) {
        if self.listener.as_ref() == Some(&update) {
            debug!("suppressing unchanged listener update");
            return;
        }
        match update.route_config.clone() {
            RouteConfigSource::Inline(route_config) => {
                self.cancel_rds();
                self.route_config_name = None;
                self.listener = Some(update);
                self.apply_route_config(route_config);
            }
            RouteConfigSource::Rds(name) => {
                let same_name = self.route_config_name.as_deref() == Some(name.as_str());
                self.listener = Some(update);
                if same_name {
                    // Same route config with new filters or stream
                    // duration: rebuild from what we already have.
                    if let Some(route_config) = self.route_config.clone() {
                        self.apply_route_config(route_config);
                    }
                } else {
                    // The previous selector keeps serving (and keeps its
                    // references) until the new route config arrives.
                    self.cancel_rds();
                    self.route_config = None;
                    self.route_config_name = Some(name.clone());
                    self.start_rds_watch(name);
                }
            }
        }
    }

    fn start_rds_watch(&mut self, name: String) {
        debug!(resource = %name, "starting route config watch");
        let tx = self.event_tx.clone();
        let closed = self.closed.clone();
        let resource = name.clone();
        let cancel = self.client.watch_route_config(
            &name,
            Box::new(move |result| {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let _ = tx.send(ResolverEvent::RouteConfig {
                    name: resource.clone(),
                    result,
                });
            }),
        );
        self.rds_cancel = Some(cancel);
    }

    fn cancel_rds(&mut self) {
        if let Some(cancel) = self.rds_cancel.take() {
            cancel();
        }
    }

    fn handle_route_config_event(&mut self, name: String, result: Result<RouteConfig, XdsError>) {
        if self.route_config_name.as_deref() != Some(name.as_str()) {
            debug!(resource = %name, "dropping event for stale route config watch");
            return;
        }
        match result {
            Ok(route_config) => {
                if self.route_config.as_ref() == Some(&route_config) {
                    debug!("suppressing unchanged route config update");
                    return;
                }
                self.apply_route_config(route_config);
            }
            Err(err) if err.is_resource_not_found() => {
                debug!(resource = %name, "route config resource removed");
                self.route_config = None;
                self.install_erroring_selector();
            }
            Err(err) => {
                warn!(error = %err, "route config watch error");
                self.controller.report_error(err);
            }
        }
    }

    fn apply_route_config(&mut self, route_config: RouteConfig) {
        let Some(listener) = &self.listener else {
            return;
        };
        let selector = ConfigSelector::new(
            listener,
            &route_config,
            self.ctx.clone(),
            self.shared.clone(),
        );
        self.route_config = Some(route_config);
        self.install(selector);
    }

    /// Installs an erroring selector after a watched resource was removed.
    /// In-flight RPCs keep their clusters in the published config; new RPCs
    /// fail until a resource reappears.
    fn install_erroring_selector(&mut self) {
        self.install(ConfigSelector::erroring(
            Status::unavailable("resource removed"),
            self.shared.clone(),
        ));
    }

    fn install(&mut self, selector: Arc<ConfigSelector>) {
        let previous = self.current_selector.replace(selector);
        // Publish before retiring: the outgoing selector's clusters stay in
        // this config, protecting RPCs that selected but have not
        // committed.
        self.publish();
        if let Some(previous) = previous {
            if previous.retire() {
                // Retirement idled some clusters; follow up with a config
                // that no longer carries them.
                self.publish();
            }
        }
    }

    fn publish(&mut self) {
        let Some(selector) = &self.current_selector else {
            return;
        };
        let service_config = self.shared.build_service_config();
        debug!(config = %service_config, "publishing resolver state");
        self.controller.update_state(ResolverState {
            service_config,
            config_selector: selector.clone(),
        });
    }
}
