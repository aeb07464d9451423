//! NATS adapter configuration and address resolution

use std::time::Duration;

use crate::options::BrokerOptions;

/// Fallback server address when nothing is configured
pub(crate) const DEFAULT_ADDRESS: &str = "nats://127.0.0.1:4222";

/// NATS-specific settings
///
/// Attached to the broker through `with_ext(NatsOptions { .. })`. Fields
/// left at their defaults keep the driver's behavior.
#[derive(Debug, Clone, Default)]
pub struct NatsOptions {
    /// Server addresses, consulted only when the common address list is
    /// empty
    pub servers: Vec<String>,

    /// Connection name reported to the server
    pub name: Option<String>,

    /// Authentication token
    pub token: Option<String>,

    /// TCP connect timeout
    pub connect_timeout: Option<Duration>,

    /// Request timeout for the underlying client
    pub request_timeout: Option<Duration>,
}

/// Prefix a bare `host:port` with the `nats://` scheme
pub(crate) fn normalize_address(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("nats://{}", addr)
    }
}

/// Resolve the server list for this broker
///
/// Precedence: the common address list, then `NatsOptions::servers`, then
/// [`DEFAULT_ADDRESS`]. Blank entries are skipped and every survivor comes
/// back scheme-normalized.
pub(crate) fn resolve_addresses(opts: &BrokerOptions) -> Vec<String> {
    let configured: Vec<&str> = if !opts.addrs.is_empty() {
        opts.addrs.iter().map(String::as_str).collect()
    } else {
        opts.ext
            .get::<NatsOptions>()
            .map(|native| native.servers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    };

    let mut resolved: Vec<String> = configured
        .into_iter()
        .filter(|addr| !addr.trim().is_empty())
        .map(normalize_address)
        .collect();

    if resolved.is_empty() {
        resolved.push(DEFAULT_ADDRESS.to_string());
    }
    resolved
}

/// Build driver connect options from the native settings
pub(crate) fn build_connect_options(native: Option<&NatsOptions>) -> async_nats::ConnectOptions {
    let mut connect = async_nats::ConnectOptions::new();

    if let Some(native) = native {
        if let Some(ref name) = native.name {
            connect = connect.name(name);
        }
        if let Some(ref token) = native.token {
            connect = connect.token(token.clone());
        }
        if let Some(timeout) = native.connect_timeout {
            connect = connect.connection_timeout(timeout);
        }
        if let Some(timeout) = native.request_timeout {
            connect = connect.request_timeout(Some(timeout));
        }
    }

    connect
}
