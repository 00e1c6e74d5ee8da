//! Parsing of `xds:` dial targets.

use std::str::FromStr;

use percent_encoding::percent_decode_str;
use thiserror::Error;

const XDS_SCHEME: &str = "xds";

/// Error type for parsing xDS targets.
#[derive(Debug, Error)]
pub enum TargetParseError {
    /// The URI scheme is not `xds`.
    #[error("target URI scheme must be 'xds'")]
    InvalidScheme,
    /// The URI could not be parsed.
    #[error("invalid target URI: {0}")]
    InvalidUri(#[from] url::ParseError),
    /// The URI carries no endpoint.
    #[error("target URI has an empty endpoint")]
    EmptyEndpoint,
}

/// An xDS dial target such as `xds:///my-service` or
/// `xds://my-authority/my-service`.
///
/// The endpoint names the service whose Listener resource the resolver
/// subscribes to; the optional authority selects a management server
/// declared in the bootstrap configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XdsTarget {
    endpoint: String,
    authority: Option<String>,
}

impl XdsTarget {
    /// Parses a target from its string form.
    pub fn parse(target: &str) -> Result<Self, TargetParseError> {
        let url = url::Url::parse(target)?;
        if url.scheme() != XDS_SCHEME {
            return Err(TargetParseError::InvalidScheme);
        }
        // The url parser escapes characters such as brackets in the path;
        // the endpoint is the unescaped form.
        let path = url.path();
        let endpoint = percent_decode_str(path.strip_prefix('/').unwrap_or(path))
            .decode_utf8_lossy()
            .into_owned();
        if endpoint.is_empty() {
            return Err(TargetParseError::EmptyEndpoint);
        }
        let authority = url.host_str().filter(|h| !h.is_empty()).map(str::to_owned);
        Ok(Self {
            endpoint,
            authority,
        })
    }

    /// The service name resolved by this target.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The authority naming a management server, if present.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }
}

impl FromStr for XdsTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
