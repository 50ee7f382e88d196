//! End-to-end tests for the configuration manager, driven against the
//! in-memory IPVS driver.

use async_trait::async_trait;
use rudder::core::{BackendOptions, Context, CoreError, ServiceOptions};
use rudder::ipvs::{IpvsCall, MockIpvs};
use rudder::net::AddressAttacher;
use rudder::pulse::{PulseKind, PulseOptions, Status};
use rudder::store::{StoreBinding, StoreError, StoreResult};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

fn service_opts(host: &str, port: u16) -> ServiceOptions {
    let mut opts = ServiceOptions::new(host, port);
    opts.protocol = "tcp".to_string();
    opts.method = "wrr".to_string();
    opts
}

fn backend_opts(host: &str, port: u16, pulse: PulseOptions) -> BackendOptions {
    let mut opts = BackendOptions::new(host, port);
    opts.weight = 100;
    opts.method = "nat".to_string();
    opts.pulse = pulse;
    opts
}

fn no_pulse() -> PulseOptions {
    PulseOptions {
        kind: PulseKind::None,
        interval: Duration::from_secs(1),
        ..PulseOptions::default()
    }
}

/// Polls `predicate` for up to `deadline`, sleeping between attempts.
async fn eventually<F: FnMut() -> bool>(deadline: Duration, mut predicate: F) -> bool {
    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    predicate()
}

/// Store binding that records operations and can be scripted to fail.
#[derive(Default)]
struct RecordingStore {
    ops: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingStore {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn check(&self, op: String) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("scripted failure".to_string()));
        }
        self.ops.lock().unwrap().push(op);
        Ok(())
    }
}

#[async_trait]
impl StoreBinding for RecordingStore {
    async fn create_service(&self, vs_id: &str, _opts: &ServiceOptions) -> StoreResult<()> {
        self.check(format!("create_service {vs_id}"))
    }

    async fn create_backend(
        &self,
        vs_id: &str,
        rs_id: &str,
        _opts: &BackendOptions,
    ) -> StoreResult<()> {
        self.check(format!("create_backend {vs_id}/{rs_id}"))
    }

    async fn remove_service(&self, vs_id: &str) -> StoreResult<()> {
        self.check(format!("remove_service {vs_id}"))
    }

    async fn remove_backend(&self, rs_id: &str) -> StoreResult<()> {
        self.check(format!("remove_backend {rs_id}"))
    }
}

/// VIP attacher that records attach/detach calls.
#[derive(Default)]
struct RecordingAttacher {
    ops: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingAttacher {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

impl AddressAttacher for RecordingAttacher {
    fn attach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("scripted failure"));
        }
        self.ops.lock().unwrap().push(format!("attach {ip}"));
        Ok(())
    }

    fn detach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
        self.ops.lock().unwrap().push(format!("detach {ip}"));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_and_probe() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let info = ctx.get_backend("web", "web-1").await.unwrap();
    assert_eq!(info.metrics.status, Status::Up);
    assert!((info.metrics.health - 1.0).abs() < f64::EPSILON);

    let dests = mock.calls_to("add_dest");
    assert_eq!(dests.len(), 1);
    match &dests[0] {
        IpvsCall::AddDest { weight, .. } => assert_eq!(*weight, 100),
        other => panic!("unexpected call {other:?}"),
    }

    ctx.close().await;
}

#[tokio::test]
async fn test_stash_on_probe_failure() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    // Bind then drop to get a local port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pulse = PulseOptions {
        kind: PulseKind::Tcp,
        interval: Duration::from_millis(10),
        ..PulseOptions::default()
    };

    ctx.create_service("web", service_opts("127.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("127.0.0.1", addr.port(), pulse))
        .await
        .unwrap();

    // The failing probe must drive the weight to zero.
    let stashed = eventually(Duration::from_secs(5), || {
        mock.calls_to("update_dest")
            .iter()
            .any(|call| matches!(call, IpvsCall::UpdateDest { weight: 0, .. }))
    })
    .await;
    assert!(stashed, "no zero-weight update observed");

    let info = ctx.get_backend("web", "web-1").await.unwrap();
    assert_eq!(info.metrics.status, Status::Down);
    assert!(info.metrics.health < 1.0);

    ctx.close().await;
}

#[tokio::test]
async fn test_probe_feeds_metrics_snapshots() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let pulse = PulseOptions {
        kind: PulseKind::Tcp,
        interval: Duration::from_millis(10),
        ..PulseOptions::default()
    };

    ctx.create_service("web", service_opts("127.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("127.0.0.1", addr.port(), pulse))
        .await
        .unwrap();

    let mut probed = false;
    for _ in 0..250 {
        let info = ctx.get_backend("web", "web-1").await.unwrap();
        if info.metrics.status == Status::Up && info.metrics.uptime > Duration::ZERO {
            probed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(probed, "probe never published an up update");

    ctx.close().await;
}

#[tokio::test]
async fn test_cascade_removal() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();
    ctx.create_backend("web", "web-2", backend_opts("10.0.0.3", 80, no_pulse()))
        .await
        .unwrap();

    let removed = ctx.remove_service("web").await.unwrap();
    assert_eq!(removed.host, "10.0.0.1");

    assert_eq!(mock.calls_to("del_dest").len(), 2);
    assert_eq!(mock.calls_to("del_service").len(), 1);
    assert!(ctx.list_services().await.is_empty());
    assert!(matches!(
        ctx.get_backend("web", "web-1").await,
        Err(CoreError::ObjectNotFound)
    ));

    ctx.close().await;
}

#[tokio::test]
async fn test_incompatible_address_families() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    let err = ctx
        .create_backend("web", "web-1", backend_opts("fd00::1", 80, no_pulse()))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::IncompatibleAFs));
    assert!(mock.calls_to("add_dest").is_empty());

    ctx.close().await;
}

#[tokio::test]
async fn test_create_remove_roundtrip() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();

    let backend = ctx.remove_backend("web", "web-1").await.unwrap();
    assert_eq!(backend.host, "10.0.0.2");
    let service = ctx.remove_service("web").await.unwrap();
    assert_eq!(service.host, "10.0.0.1");

    assert!(ctx.list_services().await.is_empty());

    // The same ids are usable again.
    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();

    ctx.close().await;
}

#[tokio::test]
async fn test_reconcile_diff() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("a", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_service("b", service_opts("10.0.0.2", 80))
        .await
        .unwrap();
    let _ = mock.take_calls();

    let desired: HashMap<String, ServiceOptions> = [
        ("b".to_string(), service_opts("10.0.0.2", 80)),
        ("c".to_string(), service_opts("10.0.0.3", 80)),
    ]
    .into();
    ctx.reconcile(desired, HashMap::new()).await;

    let mut services = ctx.list_services().await;
    services.sort();
    assert_eq!(services, vec!["b".to_string(), "c".to_string()]);

    // `a` was deleted, `c` created, `b` untouched.
    assert_eq!(mock.calls_to("del_service").len(), 1);
    let adds = mock.calls_to("add_service");
    assert_eq!(adds.len(), 1);
    match &adds[0] {
        IpvsCall::AddService { vip, .. } => {
            assert_eq!(*vip, "10.0.0.3".parse::<IpAddr>().unwrap());
        }
        other => panic!("unexpected call {other:?}"),
    }

    ctx.close().await;
}

#[tokio::test]
async fn test_reconcile_current_state_is_noop() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();

    let mut desired_backend = backend_opts("10.0.0.2", 80, no_pulse());
    desired_backend.vs_id = Some("web".to_string());

    let _ = mock.take_calls();
    ctx.reconcile(
        [("web".to_string(), service_opts("10.0.0.1", 80))].into(),
        [("web-1".to_string(), desired_backend)].into(),
    )
    .await;

    assert!(mock.calls().is_empty(), "reconcile was not a no-op");

    ctx.close().await;
}

#[tokio::test]
async fn test_reconcile_empty_clears_everything() {
    let mock = MockIpvs::new();
    let ctx = Context::builder(Box::new(mock.clone())).build().unwrap();

    ctx.create_service("a", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_service("b", service_opts("10.0.0.2", 80))
        .await
        .unwrap();
    ctx.create_backend("a", "a-1", backend_opts("10.0.0.3", 80, no_pulse()))
        .await
        .unwrap();

    ctx.reconcile(HashMap::new(), HashMap::new()).await;

    assert!(ctx.list_services().await.is_empty());
    assert!(matches!(
        ctx.get_backend("a", "a-1").await,
        Err(CoreError::ObjectNotFound)
    ));

    ctx.close().await;
}

#[tokio::test]
async fn test_store_write_through_precedes_driver() {
    let mock = MockIpvs::new();
    let store = Arc::new(RecordingStore::default());
    let ctx = Context::builder(Box::new(mock.clone()))
        .store(store.clone())
        .build()
        .unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.create_backend("web", "web-1", backend_opts("10.0.0.2", 80, no_pulse()))
        .await
        .unwrap();

    assert_eq!(
        store.ops(),
        vec![
            "create_service web".to_string(),
            "create_backend web/web-1".to_string(),
        ]
    );

    ctx.remove_service("web").await.unwrap();
    let ops = store.ops();
    assert!(ops.contains(&"remove_backend web-1".to_string()));
    assert!(ops.contains(&"remove_service web".to_string()));

    ctx.close().await;
}

#[tokio::test]
async fn test_store_failure_aborts_creation() {
    let mock = MockIpvs::new();
    let store = Arc::new(RecordingStore::default());
    store.failing.store(true, Ordering::SeqCst);

    let ctx = Context::builder(Box::new(mock.clone()))
        .store(store.clone())
        .build()
        .unwrap();
    let _ = mock.take_calls();

    let err = ctx
        .create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Store(_)));
    assert!(ctx.list_services().await.is_empty());
    // The store is the source of truth: the driver is never reached.
    assert!(mock.calls().is_empty());

    ctx.close().await;
}

#[tokio::test]
async fn test_vip_attach_and_detach() {
    let mock = MockIpvs::new();
    let attacher = Arc::new(RecordingAttacher::default());

    struct Proxy(Arc<RecordingAttacher>);
    impl AddressAttacher for Proxy {
        fn attach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
            self.0.attach_vip(ip)
        }
        fn detach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
            self.0.detach_vip(ip)
        }
    }

    let ctx = Context::builder(Box::new(mock.clone()))
        .vip_interface("lo", Box::new(Proxy(attacher.clone())))
        .build()
        .unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();
    ctx.remove_service("web").await.unwrap();

    assert_eq!(
        attacher.ops(),
        vec!["attach 10.0.0.1".to_string(), "detach 10.0.0.1".to_string()]
    );

    ctx.close().await;
}

#[tokio::test]
async fn test_vip_attach_failure_is_not_fatal_and_skips_detach() {
    let mock = MockIpvs::new();
    let attacher = Arc::new(RecordingAttacher::default());
    attacher.failing.store(true, Ordering::SeqCst);

    struct Proxy(Arc<RecordingAttacher>);
    impl AddressAttacher for Proxy {
        fn attach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
            self.0.attach_vip(ip)
        }
        fn detach_vip(&self, ip: IpAddr) -> std::io::Result<()> {
            self.0.detach_vip(ip)
        }
    }

    let ctx = Context::builder(Box::new(mock.clone()))
        .vip_interface("lo", Box::new(Proxy(attacher.clone())))
        .build()
        .unwrap();

    ctx.create_service("web", service_opts("10.0.0.1", 80))
        .await
        .unwrap();

    // Creation attached nothing, so removal must not detach anything.
    ctx.remove_service("web").await.unwrap();
    assert!(attacher.ops().is_empty());

    ctx.close().await;
}
