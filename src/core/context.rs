//! The authoritative registry of virtual services and backends.
//!
//! All mutations flow through [`Context`]: inputs are validated, written
//! through to the external store when one is configured, translated into
//! IPVS driver calls, and only then recorded in memory. Driver calls
//! happen while the registry write lock is held, which serializes kernel
//! operations with the in-memory bookkeeping and keeps partial states
//! invisible to readers.

use super::error::{CoreError, CoreResult};
use super::options::{BackendOptions, ServiceOptions};
use super::stasher;
use crate::disco::{DiscoveryDriver, NoopDiscovery};
use crate::ipvs::IpvsDriver;
use crate::net::{addr_family, AddressAttacher};
use crate::pulse::{Metrics, Pulse, PulseHandle, PulseId, PulseUpdate};
use crate::store::StoreBinding;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of the shared pulse update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

pub(crate) struct ServiceRecord {
    pub(crate) options: ServiceOptions,
}

pub(crate) struct BackendRecord {
    pub(crate) options: BackendOptions,
    pub(crate) vs_id: String,
    pub(crate) monitor: PulseHandle,
    pub(crate) metrics: Metrics,
}

/// In-memory model of the configured routing table.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) services: HashMap<String, ServiceRecord>,
    pub(crate) backends: HashMap<String, BackendRecord>,
}

pub(crate) struct ContextInner {
    ipvs: Box<dyn IpvsDriver>,
    endpoint: Option<IpAddr>,
    pub(crate) registry: RwLock<Registry>,
    updates: mpsc::Sender<PulseUpdate>,
    stop: watch::Sender<bool>,
    disco: Box<dyn DiscoveryDriver>,
    store: Option<Arc<dyn StoreBinding>>,
    attacher: Option<(String, Box<dyn AddressAttacher>)>,
    closed: AtomicBool,
}

/// Handle to the configuration manager.
///
/// Cheap to clone; every clone shares the same registry, driver and
/// probe fleet.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    ipvs: Box<dyn IpvsDriver>,
    endpoint: Option<IpAddr>,
    flush: bool,
    disco: Box<dyn DiscoveryDriver>,
    store: Option<Arc<dyn StoreBinding>>,
    attacher: Option<(String, Box<dyn AddressAttacher>)>,
}

impl ContextBuilder {
    /// Sets the default endpoint IP used by services declared without a
    /// host.
    #[must_use]
    pub fn endpoint(mut self, ip: IpAddr) -> Self {
        self.endpoint = Some(ip);
        self
    }

    /// Flushes existing IPVS pools during construction.
    #[must_use]
    pub fn flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    /// Sets the discovery driver services are announced to.
    #[must_use]
    pub fn disco(mut self, disco: Box<dyn DiscoveryDriver>) -> Self {
        self.disco = disco;
        self
    }

    /// Sets the external store the registry writes through to.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StoreBinding>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attaches service VIPs to `interface` via the given attacher.
    #[must_use]
    pub fn vip_interface(
        mut self,
        interface: impl Into<String>,
        attacher: Box<dyn AddressAttacher>,
    ) -> Self {
        self.attacher = Some((interface.into(), attacher));
        self
    }

    /// Initializes the driver and starts the weight stasher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> CoreResult<Context> {
        info!("initializing IPVS context");

        if let Err(e) = self.ipvs.init() {
            error!(error = %e, "unable to initialize IPVS context");
            return Err(CoreError::IpvsSyscallFailed);
        }

        if self.flush {
            if let Err(e) = self.ipvs.flush() {
                error!(error = %e, "unable to clean up IPVS pools - ensure ip_vs is loaded");
                self.ipvs.exit();
                return Err(CoreError::IpvsSyscallFailed);
            }
        }

        if let Some((interface, _)) = &self.attacher {
            info!(interface = %interface, "VIPs will be added to interface");
        }

        let (updates, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        let stop_rx = stop.subscribe();

        let inner = Arc::new(ContextInner {
            ipvs: self.ipvs,
            endpoint: self.endpoint,
            registry: RwLock::new(Registry::default()),
            updates,
            stop,
            disco: self.disco,
            store: self.store,
            attacher: self.attacher,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(stasher::run(Arc::clone(&inner), update_rx, stop_rx));

        Ok(Context { inner })
    }
}

/// Virtual service options, aggregate health and backend ids.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// Declared service options.
    pub options: ServiceOptions,
    /// Mean health of the service's backends; 1.0 when it has none.
    pub health: f64,
    /// Ids of the backends registered under this service.
    pub backends: Vec<String>,
}

/// Backend options and the latest pulse metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    /// Declared backend options.
    pub options: BackendOptions,
    /// Latest metrics published by the backend's probe.
    pub metrics: Metrics,
}

impl Context {
    /// Starts building a context on top of an IPVS driver.
    #[must_use]
    pub fn builder(ipvs: Box<dyn IpvsDriver>) -> ContextBuilder {
        ContextBuilder {
            ipvs,
            endpoint: None,
            flush: false,
            disco: Box::new(NoopDiscovery),
            store: None,
            attacher: None,
        }
    }

    /// Registers a new virtual service.
    pub async fn create_service(&self, vs_id: &str, mut opts: ServiceOptions) -> CoreResult<()> {
        opts.validate(self.inner.endpoint).await?;
        let mut reg = self.inner.registry.write().await;
        self.inner.create_service_locked(&mut reg, vs_id, opts).await
    }

    /// Registers a new backend under an existing virtual service and
    /// starts its probe.
    pub async fn create_backend(
        &self,
        vs_id: &str,
        rs_id: &str,
        mut opts: BackendOptions,
    ) -> CoreResult<()> {
        opts.validate().await?;
        // Built before the registry lock is taken so a bad probe
        // configuration rejects without touching the critical section.
        let pulse = Pulse::new(opts.addr(), opts.port, &opts.pulse)?;

        let mut reg = self.inner.registry.write().await;
        self.inner
            .create_backend_locked(&mut reg, vs_id, rs_id, opts, pulse)
            .await
    }

    /// Updates a backend's weight, returning the previous weight.
    pub async fn update_backend(&self, vs_id: &str, rs_id: &str, weight: i32) -> CoreResult<i32> {
        self.inner.update_backend(vs_id, rs_id, weight).await
    }

    /// Deregisters a virtual service and all of its backends, returning
    /// the removed service options.
    pub async fn remove_service(&self, vs_id: &str) -> CoreResult<ServiceOptions> {
        let mut reg = self.inner.registry.write().await;
        self.inner.remove_service_locked(&mut reg, vs_id).await
    }

    /// Deregisters a backend, stopping its probe first, and returns the
    /// removed backend options.
    pub async fn remove_backend(&self, vs_id: &str, rs_id: &str) -> CoreResult<BackendOptions> {
        let mut reg = self.inner.registry.write().await;
        self.inner.remove_backend_locked(&mut reg, vs_id, rs_id).await
    }

    /// Returns the ids of all registered services.
    pub async fn list_services(&self) -> Vec<String> {
        let reg = self.inner.registry.read().await;
        reg.services.keys().cloned().collect()
    }

    /// Returns information about a virtual service.
    pub async fn get_service(&self, vs_id: &str) -> CoreResult<ServiceInfo> {
        let reg = self.inner.registry.read().await;
        let vs = reg.services.get(vs_id).ok_or(CoreError::ObjectNotFound)?;

        let mut info = ServiceInfo {
            options: vs.options.clone(),
            health: 0.0,
            backends: Vec::new(),
        };

        // O(n) over all backends; acceptable at control-plane scale.
        for (rs_id, rs) in &reg.backends {
            if rs.vs_id != vs_id {
                continue;
            }
            info.backends.push(rs_id.clone());
            info.health += rs.metrics.health;
        }

        if info.backends.is_empty() {
            // A service without backends is healthy, albeit useless.
            info.health = 1.0;
        } else {
            info.health /= info.backends.len() as f64;
        }

        Ok(info)
    }

    /// Returns information about a backend.
    pub async fn get_backend(&self, vs_id: &str, rs_id: &str) -> CoreResult<BackendInfo> {
        let reg = self.inner.registry.read().await;
        let rs = reg.backends.get(rs_id).ok_or(CoreError::ObjectNotFound)?;
        if rs.vs_id != vs_id {
            return Err(CoreError::ObjectNotFound);
        }

        Ok(BackendInfo {
            options: rs.options.clone(),
            metrics: rs.metrics.clone(),
        })
    }

    /// Brings the registry into agreement with the desired state.
    ///
    /// Stale objects are removed, changed objects are recreated, and
    /// matching objects are left untouched. The whole diff executes
    /// under one exclusive critical section so the probe fleet never
    /// observes a half-reconciled registry. Per-item failures are
    /// logged, not returned.
    pub async fn reconcile(
        &self,
        desired_services: HashMap<String, ServiceOptions>,
        desired_backends: HashMap<String, BackendOptions>,
    ) {
        let mut reg = self.inner.registry.write().await;
        self.inner
            .reconcile_locked(&mut reg, desired_services, desired_backends)
            .await;
    }

    /// Shuts the context down: stops the probe fleet and the stasher,
    /// removes every service, and releases the driver.
    ///
    /// Idempotent on a best-effort basis; only the first call tears
    /// anything down.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("shutting down IPVS context");

        // Stop signal first: probe tasks and the stasher must be on
        // their way out before services start disappearing underneath
        // them.
        let _ = self.inner.stop.send(true);

        let mut reg = self.inner.registry.write().await;
        let ids: Vec<String> = reg.services.keys().cloned().collect();
        for vs_id in ids {
            if let Err(e) = self.inner.remove_service_locked(&mut reg, &vs_id).await {
                warn!(service = %vs_id, error = %e, "failed to remove service during shutdown");
            }
        }

        self.inner.ipvs.exit();
    }
}

impl ContextInner {
    pub(crate) async fn update_backend(
        &self,
        vs_id: &str,
        rs_id: &str,
        weight: i32,
    ) -> CoreResult<i32> {
        let mut reg = self.registry.write().await;
        self.update_backend_locked(&mut reg, vs_id, rs_id, weight)
    }

    /// Registers a validated service while holding the write lock.
    async fn create_service_locked(
        &self,
        reg: &mut Registry,
        vs_id: &str,
        mut opts: ServiceOptions,
    ) -> CoreResult<()> {
        if reg.services.contains_key(vs_id) {
            return Err(CoreError::ObjectExists);
        }

        let vip = opts.addr();

        if let Some((interface, attacher)) = &self.attacher {
            match attacher.attach_vip(vip) {
                Ok(()) => {
                    opts.del_if_addr = true;
                    info!(vip = %vip, interface = %interface, service = vs_id, "VIP attached to interface");
                }
                Err(e) => {
                    warn!(vip = %vip, interface = %interface, service = vs_id, error = %e, "failed to attach VIP");
                }
            }
        }

        info!(service = vs_id, host = %vip, port = opts.port, "creating virtual service");

        if let Some(store) = &self.store {
            if let Err(e) = store.create_service(vs_id, &opts).await {
                error!(service = vs_id, error = %e, "error while writing service to store");
                return Err(e.into());
            }
        }

        let result = if opts.flag_bits != 0 {
            self.ipvs
                .add_service_with_flags(vip, opts.port, opts.proto, &opts.method, opts.flag_bits)
        } else {
            self.ipvs.add_service(vip, opts.port, opts.proto, &opts.method)
        };
        if let Err(e) = result {
            error!(service = vs_id, error = %e, "error while creating virtual service");
            return Err(CoreError::IpvsSyscallFailed);
        }

        let host = vip.to_string();
        let port = opts.port;
        reg.services
            .insert(vs_id.to_string(), ServiceRecord { options: opts });

        if let Err(e) = self.disco.expose(vs_id, &host, port).await {
            error!(service = vs_id, error = %e, "error while exposing service to discovery");
        }

        Ok(())
    }

    /// Registers a validated backend while holding the write lock.
    async fn create_backend_locked(
        &self,
        reg: &mut Registry,
        vs_id: &str,
        rs_id: &str,
        opts: BackendOptions,
        pulse: Pulse,
    ) -> CoreResult<()> {
        if reg.backends.contains_key(rs_id) {
            return Err(CoreError::ObjectExists);
        }

        let vs = reg.services.get(vs_id).ok_or(CoreError::ObjectNotFound)?;
        let (vip, vport, proto) = (vs.options.addr(), vs.options.port, vs.options.proto);

        if addr_family(opts.addr()) != addr_family(vip) {
            return Err(CoreError::IncompatibleAFs);
        }

        info!(service = vs_id, backend = rs_id, host = %opts.addr(), port = opts.port, "creating backend");

        if let Some(store) = &self.store {
            if let Err(e) = store.create_backend(vs_id, rs_id, &opts).await {
                error!(service = vs_id, backend = rs_id, error = %e, "error while writing backend to store");
                return Err(e.into());
            }
        }

        if let Err(e) = self.ipvs.add_dest(
            vip,
            vport,
            opts.addr(),
            opts.port,
            proto,
            opts.weight,
            opts.fwd,
        ) {
            error!(service = vs_id, backend = rs_id, error = %e, "error while creating backend");
            return Err(CoreError::IpvsSyscallFailed);
        }

        let monitor = pulse.start(
            PulseId::new(vs_id, rs_id),
            self.updates.clone(),
            self.stop.subscribe(),
        );

        reg.backends.insert(
            rs_id.to_string(),
            BackendRecord {
                options: opts,
                vs_id: vs_id.to_string(),
                monitor,
                metrics: Metrics::new(),
            },
        );

        Ok(())
    }

    /// Updates a backend's weight while holding the write lock,
    /// returning the previous weight.
    fn update_backend_locked(
        &self,
        reg: &mut Registry,
        vs_id: &str,
        rs_id: &str,
        weight: i32,
    ) -> CoreResult<i32> {
        let rs = reg.backends.get_mut(rs_id).ok_or(CoreError::ObjectNotFound)?;
        let vs = reg
            .services
            .get(&rs.vs_id)
            .ok_or(CoreError::ObjectNotFound)?;

        info!(service = vs_id, backend = rs_id, weight, "updating backend weight");

        if let Err(e) = self.ipvs.update_dest(
            vs.options.addr(),
            vs.options.port,
            rs.options.addr(),
            rs.options.port,
            vs.options.proto,
            weight,
            rs.options.fwd,
        ) {
            error!(service = vs_id, backend = rs_id, error = %e, "error while updating backend");
            return Err(CoreError::IpvsSyscallFailed);
        }

        Ok(std::mem::replace(&mut rs.options.weight, weight))
    }

    /// Removes a service and cascades to its backends while holding the
    /// write lock.
    async fn remove_service_locked(
        &self,
        reg: &mut Registry,
        vs_id: &str,
    ) -> CoreResult<ServiceOptions> {
        let record = reg.services.remove(vs_id).ok_or(CoreError::ObjectNotFound)?;
        let opts = record.options;
        let (vip, vport, proto) = (opts.addr(), opts.port, opts.proto);

        if opts.del_if_addr {
            if let Some((interface, attacher)) = &self.attacher {
                match attacher.detach_vip(vip) {
                    Ok(()) => {
                        info!(vip = %vip, interface = %interface, service = vs_id, "VIP detached from interface");
                    }
                    Err(e) => {
                        warn!(vip = %vip, interface = %interface, service = vs_id, error = %e, "failed to detach VIP");
                    }
                }
            }
        }

        info!(service = vs_id, host = %vip, port = vport, "removing virtual service");

        // Destinations first, then the service itself.
        let orphaned: Vec<String> = reg
            .backends
            .iter()
            .filter(|(_, rs)| rs.vs_id == vs_id)
            .map(|(id, _)| id.clone())
            .collect();

        for rs_id in orphaned {
            info!(service = vs_id, backend = %rs_id, "cleaning up now orphaned backend");

            if let Some(rs) = reg.backends.remove(&rs_id) {
                rs.monitor.stop();

                if let Err(e) =
                    self.ipvs
                        .del_dest(vip, vport, rs.options.addr(), rs.options.port, proto)
                {
                    error!(service = vs_id, backend = %rs_id, error = %e, "error while removing orphaned backend");
                }

                if let Some(store) = &self.store {
                    if let Err(e) = store.remove_backend(&rs_id).await {
                        error!(backend = %rs_id, error = %e, "error while removing backend from store");
                    }
                }
            }
        }

        if let Err(e) = self.ipvs.del_service(vip, vport, proto) {
            error!(service = vs_id, error = %e, "error while removing virtual service");
            return Err(CoreError::IpvsSyscallFailed);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.remove_service(vs_id).await {
                error!(service = vs_id, error = %e, "error while removing service from store");
            }
        }

        if let Err(e) = self.disco.remove(vs_id).await {
            error!(service = vs_id, error = %e, "error while removing service from discovery");
        }

        Ok(opts)
    }

    /// Removes a backend while holding the write lock.
    async fn remove_backend_locked(
        &self,
        reg: &mut Registry,
        vs_id: &str,
        rs_id: &str,
    ) -> CoreResult<BackendOptions> {
        let rs = reg.backends.get(rs_id).ok_or(CoreError::ObjectNotFound)?;
        let vs = reg
            .services
            .get(&rs.vs_id)
            .ok_or(CoreError::ObjectNotFound)?;
        let (vip, vport, proto) = (vs.options.addr(), vs.options.port, vs.options.proto);
        let (rip, rport) = (rs.options.addr(), rs.options.port);

        info!(service = vs_id, backend = rs_id, "removing backend");

        if let Some(store) = &self.store {
            if let Err(e) = store.remove_backend(rs_id).await {
                error!(service = vs_id, backend = rs_id, error = %e, "error while removing backend from store");
            }
        }

        // The probe stops before the destination disappears; a stale
        // in-flight update is dropped by the stasher's membership check.
        rs.monitor.stop();

        if let Err(e) = self.ipvs.del_dest(vip, vport, rip, rport, proto) {
            error!(service = vs_id, backend = rs_id, error = %e, "error while removing backend");
            return Err(CoreError::IpvsSyscallFailed);
        }

        let record = reg
            .backends
            .remove(rs_id)
            .ok_or(CoreError::ObjectNotFound)?;

        Ok(record.options)
    }

    /// Diffs the registry against the desired state while holding the
    /// write lock.
    async fn reconcile_locked(
        &self,
        reg: &mut Registry,
        desired_services: HashMap<String, ServiceOptions>,
        desired_backends: HashMap<String, BackendOptions>,
    ) {
        debug!(
            services = desired_services.len(),
            backends = desired_backends.len(),
            "reconciling registry against desired state"
        );

        let stale: Vec<String> = reg
            .services
            .keys()
            .filter(|id| !desired_services.contains_key(*id))
            .cloned()
            .collect();
        for vs_id in stale {
            if let Err(e) = self.remove_service_locked(reg, &vs_id).await {
                warn!(service = %vs_id, error = %e, "failed to remove stale service");
            }
        }

        for (vs_id, mut opts) in desired_services {
            if let Err(e) = opts.validate(self.endpoint).await {
                warn!(service = %vs_id, error = %e, "invalid desired service");
                continue;
            }

            if let Some(current) = reg.services.get(&vs_id) {
                if current.options.same_declaration(&opts) {
                    continue;
                }
                if let Err(e) = self.remove_service_locked(reg, &vs_id).await {
                    warn!(service = %vs_id, error = %e, "failed to remove changed service");
                }
            }

            if let Err(e) = self.create_service_locked(reg, &vs_id, opts).await {
                warn!(service = %vs_id, error = %e, "failed to create desired service");
            }
        }

        let stale: Vec<String> = reg
            .backends
            .keys()
            .filter(|id| !desired_backends.contains_key(*id))
            .cloned()
            .collect();
        for rs_id in stale {
            let vs_id = reg
                .backends
                .get(&rs_id)
                .map_or_else(|| "(unknown)".to_string(), |rs| rs.vs_id.clone());
            if let Err(e) = self.remove_backend_locked(reg, &vs_id, &rs_id).await {
                warn!(backend = %rs_id, error = %e, "failed to remove stale backend");
            }
        }

        for (rs_id, mut opts) in desired_backends {
            let Some(vs_id) = opts.vs_id.clone() else {
                warn!(backend = %rs_id, "desired backend carries no parent service id");
                continue;
            };

            if let Err(e) = opts.validate().await {
                warn!(backend = %rs_id, error = %e, "invalid desired backend");
                continue;
            }

            if let Some(current) = reg.backends.get(&rs_id) {
                if current.options.same_declaration(&opts) {
                    continue;
                }
                if let Err(e) = self.remove_backend_locked(reg, &vs_id, &rs_id).await {
                    warn!(backend = %rs_id, error = %e, "failed to remove changed backend");
                }
            }

            let pulse = match Pulse::new(opts.addr(), opts.port, &opts.pulse) {
                Ok(pulse) => pulse,
                Err(e) => {
                    warn!(backend = %rs_id, error = %e, "invalid desired backend pulse");
                    continue;
                }
            };

            if let Err(e) = self
                .create_backend_locked(reg, &vs_id, &rs_id, opts, pulse)
                .await
            {
                warn!(backend = %rs_id, error = %e, "failed to create desired backend");
            }
        }
    }
}
