//! An xDS-based name resolver core for gRPC clients.
//!
//! The resolver turns a dial target such as `xds:///my-service` into a
//! dynamically-updated routing configuration obtained from an xDS control
//! plane. It subscribes to a Listener resource (LDS), follows its reference
//! to a RouteConfiguration (RDS), and compiles each accepted update into an
//! immutable per-RPC [`ConfigSelector`](selector::ConfigSelector) plus a
//! cluster-manager service config published to the channel.
//!
//! Transport to the management server, bootstrap-file parsing and the
//! downstream load balancers are external collaborators; see
//! [`client::XdsClient`] and [`client::ChannelController`] for the seams.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod bootstrap;
pub mod client;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod resource;
pub mod selector;
pub mod target;

pub(crate) mod cluster;
pub(crate) mod hash;
pub(crate) mod matcher;
pub(crate) mod service_config;

pub use resolver::{BuildOptions, XdsResolver, XdsResolverBuilder};

/// Controls whether target authorities and `xdstp:` listener-name templates
/// are honored.
///
/// It is recommended to set this value at application startup. Each resolver
/// reads it once when built and never re-checks it.
static FEDERATION_ENABLED: AtomicBool = AtomicBool::new(false);

/// Controls whether route hash policies are evaluated to produce a request
/// hash for consistent-hash load balancing.
///
/// It is recommended to set this value at application startup. Each resolver
/// reads it once when built and never re-checks it.
static RING_HASH_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn federation_enabled() -> bool {
    FEDERATION_ENABLED.load(Ordering::Relaxed)
}

pub fn set_federation_enabled(enabled: bool) {
    FEDERATION_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn ring_hash_enabled() -> bool {
    RING_HASH_ENABLED.load(Ordering::Relaxed)
}

pub fn set_ring_hash_enabled(enabled: bool) {
    RING_HASH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// A source of 64-bit random draws.
///
/// The resolver exposes this as an injectable capability so tests can
/// install a deterministic generator and assert exact weighted-cluster
/// distributions.
pub trait RandSource: Send + Sync + 'static {
    fn next_u64(&self) -> u64;
}

/// The default [`RandSource`], backed by the thread-local generator.
#[derive(Debug, Default)]
pub struct ThreadRngSource;

impl RandSource for ThreadRngSource {
    fn next_u64(&self) -> u64 {
        use rand::Rng as _;
        rand::thread_rng().gen()
    }
}
