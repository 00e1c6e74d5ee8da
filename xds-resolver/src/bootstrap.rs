//! A minimal view of the xDS bootstrap configuration.
//!
//! Parsing the bootstrap file belongs to the xDS client; the resolver only
//! consumes the pieces it needs to compute listener resource names and to
//! validate build options.

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::BuildError;
use crate::target::XdsTarget;

/// Characters escaped when substituting an endpoint into an `xdstp:`
/// resource name template. Everything a URI path cannot carry is escaped;
/// `/` and `:` stay literal.
const TEMPLATE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'|')
    .add(b'\\')
    .add(b'%');

/// An authority entry from the bootstrap configuration.
#[derive(Debug, Clone, Default)]
pub struct Authority {
    /// Listener resource name template for targets naming this authority.
    /// Empty selects the default
    /// `xdstp://<authority>/envoy.config.listener.v3.Listener/%s`.
    pub client_listener_resource_name_template: String,
}

/// The subset of the bootstrap configuration consumed by the resolver.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Listener resource name template for targets without an authority.
    pub client_default_listener_resource_name_template: String,
    /// Authorities the client may be directed at, keyed by name.
    pub authorities: HashMap<String, Authority>,
    /// Certificate provider instances declared in the bootstrap file. Only
    /// their presence matters to the resolver.
    pub certificate_providers: HashMap<String, serde_json::Value>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            client_default_listener_resource_name_template: "%s".to_string(),
            authorities: HashMap::new(),
            certificate_providers: HashMap::new(),
        }
    }
}

impl BootstrapConfig {
    /// Computes the Listener resource name to subscribe to for `target`.
    ///
    /// A target authority must be declared in the bootstrap configuration
    /// regardless of the federation setting. Templates only take effect when
    /// federation is enabled; otherwise the endpoint is used verbatim.
    pub fn listener_resource_name(
        &self,
        target: &XdsTarget,
        federation: bool,
    ) -> Result<String, BuildError> {
        let template = match target.authority() {
            Some(authority) => {
                let entry = self
                    .authorities
                    .get(authority)
                    .ok_or_else(|| BuildError::AuthorityNotFound(authority.to_string()))?;
                if entry.client_listener_resource_name_template.is_empty() {
                    format!("xdstp://{authority}/envoy.config.listener.v3.Listener/%s")
                } else {
                    entry.client_listener_resource_name_template.clone()
                }
            }
            None => self.client_default_listener_resource_name_template.clone(),
        };
        if !federation {
            return Ok(target.endpoint().to_string());
        }
        let endpoint = if template.starts_with("xdstp:") {
            utf8_percent_encode(target.endpoint(), TEMPLATE_ENCODE_SET).to_string()
        } else {
            target.endpoint().to_string()
        };
        Ok(template.replace("%s", &endpoint))
    }
}
