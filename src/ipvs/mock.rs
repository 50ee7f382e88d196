//! In-memory IPVS driver for tests.

use super::{ForwardingMethod, IpvsDriver, IpvsError, IpvsResult, Protocol};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// A recorded IPVS driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpvsCall {
    /// `init` was called.
    Init,
    /// `exit` was called.
    Exit,
    /// `flush` was called.
    Flush,
    /// A virtual service was added.
    AddService {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        port: u16,
        /// Service protocol.
        protocol: Protocol,
        /// Scheduler name.
        sched: String,
    },
    /// A virtual service was added with scheduler flags.
    AddServiceWithFlags {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        port: u16,
        /// Service protocol.
        protocol: Protocol,
        /// Scheduler name.
        sched: String,
        /// Scheduler modifier bits.
        flags: u32,
    },
    /// A virtual service was removed.
    DelService {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        port: u16,
        /// Service protocol.
        protocol: Protocol,
    },
    /// A destination was added.
    AddDest {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        vport: u16,
        /// Real IP.
        rip: IpAddr,
        /// Real port.
        rport: u16,
        /// Service protocol.
        protocol: Protocol,
        /// Destination weight.
        weight: i32,
        /// Forwarding method.
        fwd: ForwardingMethod,
    },
    /// A destination was updated.
    UpdateDest {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        vport: u16,
        /// Real IP.
        rip: IpAddr,
        /// Real port.
        rport: u16,
        /// Service protocol.
        protocol: Protocol,
        /// Destination weight.
        weight: i32,
        /// Forwarding method.
        fwd: ForwardingMethod,
    },
    /// A destination was removed.
    DelDest {
        /// Virtual IP.
        vip: IpAddr,
        /// Virtual port.
        vport: u16,
        /// Real IP.
        rip: IpAddr,
        /// Real port.
        rport: u16,
        /// Service protocol.
        protocol: Protocol,
    },
}

impl IpvsCall {
    /// Method name this call was recorded under.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Exit => "exit",
            Self::Flush => "flush",
            Self::AddService { .. } => "add_service",
            Self::AddServiceWithFlags { .. } => "add_service_with_flags",
            Self::DelService { .. } => "del_service",
            Self::AddDest { .. } => "add_dest",
            Self::UpdateDest { .. } => "update_dest",
            Self::DelDest { .. } => "del_dest",
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Mutex<Vec<IpvsCall>>,
    failing: Mutex<HashSet<String>>,
}

/// A recording IPVS driver.
///
/// Clones share state, so a test can keep one handle while moving another
/// into the configuration manager. Individual methods can be scripted to
/// fail by name.
#[derive(Debug, Clone, Default)]
pub struct MockIpvs {
    state: Arc<MockState>,
}

impl MockIpvs {
    /// Creates a new recording driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<IpvsCall> {
        self.state.calls.lock().expect("calls lock poisoned").clone()
    }

    /// Returns and clears the recorded calls.
    #[must_use]
    pub fn take_calls(&self) -> Vec<IpvsCall> {
        std::mem::take(&mut *self.state.calls.lock().expect("calls lock poisoned"))
    }

    /// Returns the recorded calls for one method, in order.
    #[must_use]
    pub fn calls_to(&self, method: &str) -> Vec<IpvsCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method() == method)
            .collect()
    }

    /// Scripts `method` to fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, method: &str) {
        self.state
            .failing
            .lock()
            .expect("failing lock poisoned")
            .insert(method.to_string());
    }

    /// Clears all scripted failures.
    pub fn clear_failures(&self) {
        self.state
            .failing
            .lock()
            .expect("failing lock poisoned")
            .clear();
    }

    fn record(&self, call: IpvsCall) -> IpvsResult {
        let method = call.method();
        let failing = self
            .state
            .failing
            .lock()
            .expect("failing lock poisoned")
            .contains(method);
        self.state
            .calls
            .lock()
            .expect("calls lock poisoned")
            .push(call);
        if failing {
            Err(IpvsError::new(format!("scripted failure in {method}")))
        } else {
            Ok(())
        }
    }
}

impl IpvsDriver for MockIpvs {
    fn init(&self) -> IpvsResult {
        self.record(IpvsCall::Init)
    }

    fn exit(&self) {
        let _ = self.record(IpvsCall::Exit);
    }

    fn flush(&self) -> IpvsResult {
        self.record(IpvsCall::Flush)
    }

    fn add_service(&self, vip: IpAddr, port: u16, protocol: Protocol, sched: &str) -> IpvsResult {
        self.record(IpvsCall::AddService {
            vip,
            port,
            protocol,
            sched: sched.to_string(),
        })
    }

    fn add_service_with_flags(
        &self,
        vip: IpAddr,
        port: u16,
        protocol: Protocol,
        sched: &str,
        flags: u32,
    ) -> IpvsResult {
        self.record(IpvsCall::AddServiceWithFlags {
            vip,
            port,
            protocol,
            sched: sched.to_string(),
            flags,
        })
    }

    fn del_service(&self, vip: IpAddr, port: u16, protocol: Protocol) -> IpvsResult {
        self.record(IpvsCall::DelService {
            vip,
            port,
            protocol,
        })
    }

    fn add_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
        weight: i32,
        fwd: ForwardingMethod,
    ) -> IpvsResult {
        self.record(IpvsCall::AddDest {
            vip,
            vport,
            rip,
            rport,
            protocol,
            weight,
            fwd,
        })
    }

    fn update_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
        weight: i32,
        fwd: ForwardingMethod,
    ) -> IpvsResult {
        self.record(IpvsCall::UpdateDest {
            vip,
            vport,
            rip,
            rport,
            protocol,
            weight,
            fwd,
        })
    }

    fn del_dest(
        &self,
        vip: IpAddr,
        vport: u16,
        rip: IpAddr,
        rport: u16,
        protocol: Protocol,
    ) -> IpvsResult {
        self.record(IpvsCall::DelDest {
            vip,
            vport,
            rip,
            rport,
            protocol,
        })
    }
}
