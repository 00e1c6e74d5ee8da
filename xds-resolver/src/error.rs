//! Error types for the xDS resolver.

use thiserror::Error;

/// Errors delivered by the xDS client for a watched resource.
#[derive(Debug, Clone, Error)]
pub enum XdsError {
    /// The watched resource does not exist on the management server, or was
    /// removed from it.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The resource could not be decoded or failed validation.
    #[error("resource validation failed: {0}")]
    Validation(String),

    /// The management-server connection failed. The watch stays registered
    /// and previously delivered configuration remains in use.
    #[error("control plane unreachable: {0}")]
    Transport(String),
}

impl XdsError {
    /// Whether this error retires the active configuration (as opposed to a
    /// transient error that is only reported).
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, XdsError::ResourceNotFound(_))
    }
}

/// Errors that fail [`XdsResolverBuilder::build`](crate::XdsResolverBuilder::build)
/// synchronously.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The xDS client could not be obtained.
    #[error("failed to create xDS client: {0}")]
    ClientCreation(String),

    /// The target names an authority the bootstrap configuration does not
    /// declare.
    #[error("authority {0:?} is not found in the bootstrap configuration")]
    AuthorityNotFound(String),

    /// The channel requested xDS credentials but the bootstrap configuration
    /// carries no certificate providers.
    #[error("xDS credentials specified but certificate_providers config missing in bootstrap")]
    MissingCertificateProviders,

    /// The dial target could not be parsed.
    #[error("invalid target: {0}")]
    Target(#[from] crate::target::TargetParseError),
}
