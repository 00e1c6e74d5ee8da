//! HTTP filter descriptors and the per-RPC interceptor chain.
//!
//! The listener installs an ordered filter list ending in a terminal router
//! filter. At selector build time the list is validated and truncated at
//! the router; for each RPC the surviving filters are instantiated (with
//! virtual-host, route and cluster overrides resolved) into a nested
//! interceptor chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tonic::Status;

use crate::client::RpcInfo;

/// Boxed error returned by filter builders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An opaque HTTP filter configuration.
///
/// Concrete filters interpret the JSON; the resolver core only compares
/// configurations and threads them through override resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig(pub serde_json::Value);

/// A hook fired at most once, no matter how many clones fire it.
///
/// Used for the per-stream `done` notifications threaded through the
/// interceptor chain and for the per-RPC commit hook.
#[derive(Clone)]
pub struct Done {
    hook: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Done {
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            hook: Arc::new(Mutex::new(Some(Box::new(hook)))),
        }
    }

    /// A hook that does nothing when fired.
    pub fn noop() -> Self {
        Self {
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Fires the hook. Every later call is a no-op.
    pub fn call(&self) {
        let hook = match self.hook.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Done")
    }
}

/// Continuation an interceptor invokes to create the next stream layer,
/// passing the `done` hook the deeper layers should fire.
pub type NewStreamFn<'a> = Box<dyn FnOnce(Done) -> Result<(), Status> + Send + 'a>;

/// A per-RPC stream interceptor produced by an HTTP filter.
pub trait ClientInterceptor: Send + Sync {
    /// Enters the interceptor for one RPC.
    ///
    /// `done` must fire exactly once when the RPC finishes using its stream
    /// or fails to obtain one. Implementations typically wrap `done` and
    /// pass the wrapper to `next`.
    fn new_stream(&self, rpc: &RpcInfo<'_>, done: Done, next: NewStreamFn<'_>)
        -> Result<(), Status>;
}

/// Builds per-RPC interceptors from a filter's configuration.
pub trait HttpFilter: Send + Sync {
    /// Stable identifier of the filter implementation. Filter lists from
    /// separately decoded listener deliveries are compared through it, so
    /// two instances of the same filter must report the same URL.
    fn type_url(&self) -> &str;

    /// Builds the interceptor for one RPC. `config` is the listener-level
    /// configuration; `override_config` is the most specific of the
    /// cluster, route and virtual-host overrides, when any is present.
    fn build_client_interceptor(
        &self,
        config: &FilterConfig,
        override_config: Option<&FilterConfig>,
    ) -> Result<Box<dyn ClientInterceptor>, BoxError>;

    /// Whether this is the terminal router filter ending the chain.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// A named HTTP filter installed by the listener.
#[derive(Clone)]
pub struct HttpFilterDescriptor {
    pub name: String,
    pub filter: Arc<dyn HttpFilter>,
    pub config: FilterConfig,
}

impl HttpFilterDescriptor {
    pub fn new(
        name: impl Into<String>,
        filter: Arc<dyn HttpFilter>,
        config: FilterConfig,
    ) -> Self {
        Self {
            name: name.into(),
            filter,
            config,
        }
    }
}

impl fmt::Debug for HttpFilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFilterDescriptor")
            .field("name", &self.name)
            .field("filter", &self.filter.type_url())
            .field("config", &self.config)
            .finish()
    }
}

/// Descriptors compare by name, filter type URL and configuration, so an
/// unchanged listener compares equal even when each delivery decodes into
/// fresh filter instances.
impl PartialEq for HttpFilterDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.filter.type_url() == other.filter.type_url()
            && self.config == other.config
    }
}

const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

/// The terminal router filter.
///
/// Its presence ends the interceptor chain; descriptors after it are
/// discarded when the chain is compiled.
#[derive(Debug, Default)]
pub struct RouterFilter;

impl HttpFilter for RouterFilter {
    fn type_url(&self) -> &str {
        ROUTER_TYPE_URL
    }

    fn build_client_interceptor(
        &self,
        _config: &FilterConfig,
        _override_config: Option<&FilterConfig>,
    ) -> Result<Box<dyn ClientInterceptor>, BoxError> {
        Ok(Box::new(PassthroughInterceptor))
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

struct PassthroughInterceptor;

impl ClientInterceptor for PassthroughInterceptor {
    fn new_stream(
        &self,
        _rpc: &RpcInfo<'_>,
        done: Done,
        next: NewStreamFn<'_>,
    ) -> Result<(), Status> {
        next(done)
    }
}

/// Marker error: the listener's filter list has no terminal router.
#[derive(Debug)]
pub(crate) struct NoRouter;

/// The listener's filter list validated and truncated at the router.
///
/// Compiled once per config selector; instantiated once per RPC.
#[derive(Clone)]
pub(crate) struct FilterChainPlan {
    filters: Vec<HttpFilterDescriptor>,
}

impl FilterChainPlan {
    pub(crate) fn compile(filters: &[HttpFilterDescriptor]) -> Result<Self, NoRouter> {
        let router = filters
            .iter()
            .position(|f| f.filter.is_terminal())
            .ok_or(NoRouter)?;
        Ok(Self {
            filters: filters[..router].to_vec(),
        })
    }

    /// Builds the interceptor chain for one RPC, resolving each filter's
    /// effective override as cluster, then route, then virtual host.
    pub(crate) fn instantiate(
        &self,
        vhost_overrides: &HashMap<String, FilterConfig>,
        route_overrides: &HashMap<String, FilterConfig>,
        cluster_overrides: &HashMap<String, FilterConfig>,
    ) -> Result<InterceptorChain, Status> {
        let mut interceptors = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            let override_config = cluster_overrides
                .get(&filter.name)
                .or_else(|| route_overrides.get(&filter.name))
                .or_else(|| vhost_overrides.get(&filter.name));
            let interceptor = filter
                .filter
                .build_client_interceptor(&filter.config, override_config)
                .map_err(|err| {
                    Status::unavailable(format!(
                        "error constructing filter {}: {err}",
                        filter.name
                    ))
                })?;
            interceptors.push(interceptor);
        }
        Ok(InterceptorChain { interceptors })
    }
}

/// The interceptor chain instantiated for one selected route.
///
/// Invoking it composes the interceptors outermost-first around the
/// caller's stream constructor.
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn ClientInterceptor>>,
}

impl InterceptorChain {
    pub fn new_stream<'a>(
        &'a self,
        rpc: &'a RpcInfo<'a>,
        done: Done,
        new_stream: NewStreamFn<'a>,
    ) -> Result<(), Status> {
        compose(&self.interceptors, rpc, done, new_stream)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

fn compose<'a>(
    chain: &'a [Box<dyn ClientInterceptor>],
    rpc: &'a RpcInfo<'a>,
    done: Done,
    new_stream: NewStreamFn<'a>,
) -> Result<(), Status> {
    let Some((first, rest)) = chain.split_first() else {
        return new_stream(done);
    };
    first.new_stream(
        rpc,
        done,
        Box::new(move |entered: Done| {
            let result = compose(rest, rpc, entered.clone(), new_stream);
            if result.is_err() {
                // A deeper layer failed after `first` was entered; the done
                // hooks of every entered filter must still fire.
                entered.call();
            }
            result
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg(tag: &str) -> FilterConfig {
        FilterConfig(json!({ "tag": tag }))
    }

    struct RecordingFilter {
        log: Arc<Mutex<Vec<String>>>,
        fail_new_stream: bool,
    }

    impl HttpFilter for RecordingFilter {
        fn type_url(&self) -> &str {
            "type.googleapis.com/test.RecordingFilter"
        }

        fn build_client_interceptor(
            &self,
            config: &FilterConfig,
            override_config: Option<&FilterConfig>,
        ) -> Result<Box<dyn ClientInterceptor>, BoxError> {
            let tag = config.0["tag"].as_str().unwrap().to_string();
            self.log.lock().unwrap().push(format!("build:{tag}"));
            if let Some(over) = override_config {
                let over = over.0["tag"].as_str().unwrap();
                self.log.lock().unwrap().push(format!("override:{over}"));
            }
            Ok(Box::new(RecordingInterceptor {
                log: self.log.clone(),
                tag,
                fail: self.fail_new_stream,
            }))
        }
    }

    struct RecordingInterceptor {
        log: Arc<Mutex<Vec<String>>>,
        tag: String,
        fail: bool,
    }

    impl ClientInterceptor for RecordingInterceptor {
        fn new_stream(
            &self,
            _rpc: &RpcInfo<'_>,
            done: Done,
            next: NewStreamFn<'_>,
        ) -> Result<(), Status> {
            self.log
                .lock()
                .unwrap()
                .push(format!("newstream:{}", self.tag));
            if self.fail {
                return Err(Status::unavailable(format!("{} failed", self.tag)));
            }
            let log = self.log.clone();
            let tag = self.tag.clone();
            let wrapped = Done::new(move || {
                log.lock().unwrap().push(format!("done:{tag}"));
                done.call();
            });
            next(wrapped)
        }
    }

    fn descriptor(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_new_stream: bool,
    ) -> HttpFilterDescriptor {
        HttpFilterDescriptor::new(
            name,
            Arc::new(RecordingFilter {
                log: log.clone(),
                fail_new_stream,
            }),
            cfg(&format!("{name}1")),
        )
    }

    fn router() -> HttpFilterDescriptor {
        HttpFilterDescriptor::new("router", Arc::new(RouterFilter), FilterConfig(json!({})))
    }

    #[test]
    fn done_fires_at_most_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let done = Done::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        done.call();
        done.clone().call();
        done.call();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn descriptors_compare_structurally_across_instances() {
        let log = Arc::new(Mutex::new(Vec::new()));
        // Fresh filter instances with the same name, type URL and config
        // compare equal, as they do when deliveries are decoded anew.
        assert_eq!(descriptor("foo", &log, false), descriptor("foo", &log, false));
        let other_type = HttpFilterDescriptor::new("foo", Arc::new(RouterFilter), cfg("foo1"));
        assert_ne!(descriptor("foo", &log, false), other_type);
        let other_config = HttpFilterDescriptor::new(
            "foo",
            Arc::new(RecordingFilter {
                log: log.clone(),
                fail_new_stream: false,
            }),
            cfg("changed"),
        );
        assert_ne!(descriptor("foo", &log, false), other_config);
    }

    #[test]
    fn compile_requires_router() {
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(FilterChainPlan::compile(&[descriptor("foo", &log, false)]).is_err());
        assert!(FilterChainPlan::compile(&[descriptor("foo", &log, false), router()]).is_ok());
    }

    #[test]
    fn compile_discards_filters_after_router() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = FilterChainPlan::compile(&[
            descriptor("foo", &log, false),
            router(),
            descriptor("ignored", &log, false),
        ])
        .unwrap();
        let chain = plan
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["build:foo1"]);
    }

    #[test]
    fn override_resolution_prefers_cluster_then_route_then_vhost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = FilterChainPlan::compile(&[
            descriptor("foo", &log, false),
            descriptor("bar", &log, false),
            descriptor("baz", &log, false),
            router(),
        ])
        .unwrap();
        let vhost = HashMap::from([
            ("foo".to_string(), cfg("foo-vh")),
            ("bar".to_string(), cfg("bar-vh")),
            ("baz".to_string(), cfg("baz-vh")),
        ]);
        let route = HashMap::from([
            ("foo".to_string(), cfg("foo-rt")),
            ("bar".to_string(), cfg("bar-rt")),
        ]);
        let cluster = HashMap::from([("foo".to_string(), cfg("foo-cl"))]);
        plan.instantiate(&vhost, &route, &cluster).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "build:foo1",
                "override:foo-cl",
                "build:bar1",
                "override:bar-rt",
                "build:baz1",
                "override:baz-vh",
            ]
        );
    }

    #[test]
    fn chain_invokes_done_hooks_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan =
            FilterChainPlan::compile(&[descriptor("foo", &log, false), descriptor("bar", &log, false), router()])
                .unwrap();
        let chain = plan
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();

        let headers = http::HeaderMap::new();
        let rpc = RpcInfo {
            method: "/svc/m",
            headers: &headers,
        };
        let inner_done = Arc::new(Mutex::new(None::<Done>));
        let slot = inner_done.clone();
        chain
            .new_stream(
                &rpc,
                Done::noop(),
                Box::new(move |done| {
                    *slot.lock().unwrap() = Some(done);
                    Ok(())
                }),
            )
            .unwrap();
        inner_done.lock().unwrap().take().unwrap().call();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "build:foo1",
                "build:bar1",
                "newstream:foo1",
                "newstream:bar1",
                "done:bar1",
                "done:foo1",
            ]
        );
    }

    #[test]
    fn failing_filter_fires_done_of_entered_filters_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan =
            FilterChainPlan::compile(&[descriptor("foo", &log, false), descriptor("bar", &log, true), router()])
                .unwrap();
        let chain = plan
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();

        let headers = http::HeaderMap::new();
        let rpc = RpcInfo {
            method: "/svc/m",
            headers: &headers,
        };
        let err = chain
            .new_stream(&rpc, Done::noop(), Box::new(|_| panic!("must not reach the base")))
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["build:foo1", "build:bar1", "newstream:foo1", "newstream:bar1", "done:foo1"]
        );
    }

    #[test]
    fn failing_builder_reports_unavailable() {
        struct FailingFilter;
        impl HttpFilter for FailingFilter {
            fn type_url(&self) -> &str {
                "type.googleapis.com/test.FailingFilter"
            }

            fn build_client_interceptor(
                &self,
                _config: &FilterConfig,
                _override_config: Option<&FilterConfig>,
            ) -> Result<Box<dyn ClientInterceptor>, BoxError> {
                Err("broken filter".into())
            }
        }
        let plan = FilterChainPlan::compile(&[
            HttpFilterDescriptor::new("bad", Arc::new(FailingFilter), FilterConfig(json!({}))),
            router(),
        ])
        .unwrap();
        let err = plan
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert!(err.message().contains("bad"));
    }
}
