//! # IPVS Driver Capability
//!
//! A narrow capability set over the kernel's IP Virtual Server tables.
//! The configuration manager drives this trait for every kernel-side
//! mutation; the netlink wire encoding lives in a separate driver crate
//! so that an in-memory fake can exercise the whole control plane in
//! tests.

pub mod mock;

pub use mock::{IpvsCall, MockIpvs};

use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Scheduler modifier flag for `sh` fallback on an unavailable backend
/// (kernel `IP_VS_SVC_F_SCHED_SH_FALLBACK`).
pub const FLAG_SCHED_SH_FALLBACK: u32 = 0x0008;

/// Scheduler modifier flag including the source port in the `sh` hash
/// (kernel `IP_VS_SVC_F_SCHED_SH_PORT`).
pub const FLAG_SCHED_SH_PORT: u32 = 0x0010;

/// An opaque failure reported by an IPVS driver.
///
/// The configuration manager never inspects driver errors beyond logging
/// them; every failure surfaces to callers as a single syscall-failed
/// error kind.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IpvsError(String);

impl IpvsError {
    /// Creates a driver error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for IPVS driver operations.
pub type IpvsResult = Result<(), IpvsError>;

/// L4 protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// TCP (`IPPROTO_TCP`).
    #[default]
    Tcp,
    /// UDP (`IPPROTO_UDP`).
    Udp,
}

impl Protocol {
    /// Returns the IP protocol number.
    #[must_use]
    pub fn number(self) -> u16 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Packet forwarding method for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardingMethod {
    /// NAT / masquerading (`IP_VS_CONN_F_MASQ`).
    #[default]
    Masquerade,
    /// IPIP tunneling (`IP_VS_CONN_F_TUNNEL`).
    Tunnel,
}

impl ForwardingMethod {
    /// Returns the kernel connection-flag value.
    #[must_use]
    pub fn number(self) -> u32 {
        match self {
            Self::Masquerade => 0,
            Self::Tunnel => 2,
        }
    }
}

/// The IPVS driver capability.
///
/// Implementations are expected to serialize their own kernel access;
/// the configuration manager already calls them while holding its
/// registry write lock, so per-call reentrancy is not required. A failed
/// call is not retriable within the call itself.
pub trait IpvsDriver: Send + Sync {
    /// Opens the IPVS control channel.
    fn init(&self) -> IpvsResult;

    /// Releases the IPVS control channel.
    fn exit(&self);

    /// Removes every virtual service from the kernel tables.
    fn flush(&self) -> IpvsResult;

    /// Registers a virtual service.
    fn add_service(&self, vip: IpAddr, port: u16, protocol: Protocol, sched: &str) -> IpvsResult;

    /// Registers a virtual service with scheduler modifier flags.
    fn add_service_with_flags(
        &self,
        vip: IpAddr,
        port: u16,
        protocol: Protocol,
        sched: &str,
        flags: u32,
    ) -> IpvsResult;

    /// Deregisters a virtual service.
    fn del_service(&self, vip: IpAddr, port: u16, protocol: Protocol) -> IpvsResult;

    /// Adds a destination to a virtual service.
    #[allow(clippy::too_many_arguments)]
    fn add_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
        weight: i32,
        fwd: ForwardingMethod,
    ) -> IpvsResult;

    /// Updates a destination, typically its weight.
    #[allow(clippy::too_many_arguments)]
    fn update_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
        weight: i32,
        fwd: ForwardingMethod,
    ) -> IpvsResult;

    /// Removes a destination from a virtual service.
    fn del_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
    ) -> IpvsResult;
}
