//! Declared service and backend option types.
//!
//! The user-facing fields round-trip through JSON for the admin surface
//! and the external store. Validation normalizes them in place and fills
//! the private resolved fields the driver calls consume; the registry
//! only ever stores validated options.

use super::error::{CoreError, CoreResult};
use crate::ipvs::{ForwardingMethod, Protocol, FLAG_SCHED_SH_FALLBACK, FLAG_SCHED_SH_PORT};
use crate::pulse::PulseOptions;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Declared shape of a virtual service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Service address; a literal IP or a resolvable host name. Empty
    /// falls back to the configured default endpoint.
    pub host: String,

    /// Service port.
    pub port: u16,

    /// L4 protocol, `tcp` or `udp`.
    pub protocol: String,

    /// Scheduler name, e.g. `rr`, `wrr`, `wlc`, `sh`, `dr`.
    pub method: String,

    /// Whether connections are persistent.
    pub persistent: bool,

    /// Scheduler modifier flags, `|`-separated. Recognized tokens:
    /// `sh-fallback`, `sh-port`.
    pub flags: String,

    #[serde(skip)]
    pub(crate) ip: Option<IpAddr>,

    #[serde(skip)]
    pub(crate) proto: Protocol,

    #[serde(skip)]
    pub(crate) flag_bits: u32,

    /// Whether service creation attached the VIP to the local interface,
    /// so removal undoes exactly what creation did.
    #[serde(skip)]
    pub(crate) del_if_addr: bool,
}

impl ServiceOptions {
    /// Creates service options for `host:port` with defaults everywhere
    /// else; remaining user-facing fields can be assigned directly.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Fills missing fields and validates the service configuration.
    ///
    /// The host is resolved (DNS lookup included); an empty host falls
    /// back to `default_host`.
    pub async fn validate(&mut self, default_host: Option<IpAddr>) -> CoreResult<()> {
        if self.port == 0 {
            return Err(CoreError::MissingEndpoint);
        }

        if !self.host.is_empty() {
            self.ip = Some(resolve_host(&self.host).await?);
        } else if let Some(ip) = default_host {
            self.ip = Some(ip);
        } else {
            return Err(CoreError::MissingEndpoint);
        }

        if self.protocol.is_empty() {
            self.protocol = "tcp".to_string();
        }
        self.protocol = self.protocol.to_lowercase();
        self.proto = match self.protocol.as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => return Err(CoreError::UnknownProtocol(other.to_string())),
        };

        if self.method.is_empty() {
            // WRR, since the stasher dynamically reweights backends.
            self.method = "wrr".to_string();
        }

        self.flag_bits = parse_flags(&self.flags)?;

        Ok(())
    }

    /// Resolved service address.
    ///
    /// # Panics
    ///
    /// Panics when called before a successful [`validate`](Self::validate).
    #[must_use]
    pub(crate) fn addr(&self) -> IpAddr {
        self.ip.expect("service options are validated before use")
    }

    /// Field-by-field comparison of the user-facing fields.
    ///
    /// Used by reconciliation to decide whether a desired service
    /// matches a live one.
    #[must_use]
    pub fn same_declaration(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.protocol == other.protocol
            && self.method == other.method
            && self.persistent == other.persistent
            && self.flags == other.flags
    }
}

/// Declared shape of a real server under a virtual service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    /// Backend address; a literal IP or a resolvable host name.
    pub host: String,

    /// Backend port.
    pub port: u16,

    /// Destination weight. Non-positive values are coerced to 100.
    pub weight: i32,

    /// Forwarding method, `nat` or `tunnel`/`ipip`.
    pub method: String,

    /// Health probe configuration.
    pub pulse: PulseOptions,

    /// Parent service id, carried for store round-tripping.
    #[serde(rename = "vsID", skip_serializing_if = "Option::is_none")]
    pub vs_id: Option<String>,

    #[serde(skip)]
    pub(crate) ip: Option<IpAddr>,

    #[serde(skip)]
    pub(crate) fwd: ForwardingMethod,
}

impl BackendOptions {
    /// Creates backend options for `host:port` with defaults everywhere
    /// else; remaining user-facing fields can be assigned directly.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Fills missing fields and validates the backend configuration.
    pub async fn validate(&mut self) -> CoreResult<()> {
        if self.host.is_empty() || self.port == 0 {
            return Err(CoreError::MissingEndpoint);
        }

        self.ip = Some(resolve_host(&self.host).await?);

        if self.weight <= 0 {
            self.weight = 100;
        }

        if self.method.is_empty() {
            self.method = "nat".to_string();
        }
        self.method = self.method.to_lowercase();
        self.fwd = match self.method.as_str() {
            "nat" => ForwardingMethod::Masquerade,
            "tunnel" | "ipip" => ForwardingMethod::Tunnel,
            other => return Err(CoreError::UnknownMethod(other.to_string())),
        };

        self.pulse.validate()?;

        Ok(())
    }

    /// Resolved backend address.
    ///
    /// # Panics
    ///
    /// Panics when called before a successful [`validate`](Self::validate).
    #[must_use]
    pub(crate) fn addr(&self) -> IpAddr {
        self.ip.expect("backend options are validated before use")
    }

    /// Field-by-field comparison of the user-facing fields.
    ///
    /// The live weight is deliberately excluded: the stasher legitimately
    /// diverges it from the declared value while a backend is degraded,
    /// and reconciliation must not tear a backend down over that.
    #[must_use]
    pub fn same_declaration(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.method == other.method
            && self.pulse == other.pulse
    }
}

/// Resolves a host string to an IP address, DNS lookup included.
async fn resolve_host(host: &str) -> CoreResult<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| CoreError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or(CoreError::MissingEndpoint)
}

/// Parses `|`-separated scheduler flag tokens into a bitset.
fn parse_flags(flags: &str) -> CoreResult<u32> {
    if flags.is_empty() {
        return Ok(0);
    }

    let mut bits = 0;
    for token in flags.split('|') {
        bits |= match token {
            "sh-fallback" => FLAG_SCHED_SH_FALLBACK,
            "sh-port" => FLAG_SCHED_SH_PORT,
            other => return Err(CoreError::UnknownFlag(other.to_string())),
        };
    }
    Ok(bits)
}
