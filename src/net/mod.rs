//! Network address helpers and the VIP attachment seam.

use std::net::IpAddr;

/// Address family of an IP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    /// IPv4, including IPv4-mapped IPv6 addresses.
    V4,
    /// IPv6.
    V6,
}

/// Returns the address family of an IP address.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are classified as IPv4,
/// matching how the kernel routes them.
#[must_use]
pub fn addr_family(ip: IpAddr) -> AddrFamily {
    match ip.to_canonical() {
        IpAddr::V4(_) => AddrFamily::V4,
        IpAddr::V6(_) => AddrFamily::V6,
    }
}

/// Attaches and detaches virtual IPs on a local network interface.
///
/// The production implementation drives netlink address operations and
/// lives outside this crate; tests use an in-memory recorder. Attach and
/// detach failures are logged by the caller and never fail the operation
/// that triggered them.
pub trait AddressAttacher: Send + Sync {
    /// Adds `ip` to the interface this attacher manages.
    fn attach_vip(&self, ip: IpAddr) -> std::io::Result<()>;

    /// Removes `ip` from the interface this attacher manages.
    fn detach_vip(&self, ip: IpAddr) -> std::io::Result<()>;
}
