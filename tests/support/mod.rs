//! In-memory platform fakes and a shell-script stand-in for the tunnel binary.
#![allow(dead_code)]

use std::collections::HashSet;
use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ipnet::IpNet;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tunvisor::app::{
    Connectivity, HostService, InterfaceBuilder, LifecycleState, NetworkEvent, NetworkHandle,
    NetworkListener, PackageNotFound, TunInterface, TunnelDeps, TunnelEvent, TunnelService,
};
use tunvisor::config::{ServerEntry, Settings, TunnelConfig};

pub const SELF_PACKAGE: &str = "com.tunvisor.app";

/// Tests in one binary share the process; exec of a freshly written script
/// can fail with ETXTBSY while another test forks.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, what: impl Into<String>) {
    log.lock().unwrap().push(what.into());
}

// ─── interface ─────────────────────────────────────────────────────────────

pub struct FakeInterface {
    id: usize,
    file: Mutex<Option<File>>,
    fd: i32,
    log: CallLog,
    pub closes: AtomicUsize,
    pub underlying: Mutex<Vec<Option<Vec<NetworkHandle>>>>,
}

impl TunInterface for FakeInterface {
    fn raw_fd(&self) -> i32 {
        self.fd
    }

    fn set_underlying_networks(&self, networks: Option<&[NetworkHandle]>) {
        self.underlying
            .lock()
            .unwrap()
            .push(networks.map(|n| n.to_vec()));
    }

    fn close(&self) -> std::io::Result<()> {
        if self.file.lock().unwrap().take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            record(&self.log, format!("close:{}", self.id));
        }
        Ok(())
    }
}

impl FakeInterface {
    pub fn is_closed(&self) -> bool {
        self.file.lock().unwrap().is_none()
    }
}

// ─── builder ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BuiltSpec {
    pub mtu: u16,
    pub addresses: Vec<(IpAddr, u8)>,
    pub routes: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub session: String,
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
    pub http_proxy: Option<SocketAddr>,
    pub metered: Option<bool>,
}

pub struct FakeBuilder {
    host: Arc<HostState>,
    spec: BuiltSpec,
}

impl InterfaceBuilder for FakeBuilder {
    fn set_mtu(&mut self, mtu: u16) {
        self.spec.mtu = mtu;
    }

    fn add_address(&mut self, addr: IpAddr, prefix_len: u8) {
        self.spec.addresses.push((addr, prefix_len));
    }

    fn add_route(&mut self, route: IpNet) {
        self.spec.routes.push(route);
    }

    fn add_dns_server(&mut self, addr: IpAddr) {
        self.spec.dns.push(addr);
    }

    fn set_session(&mut self, session: &str) {
        self.spec.session = session.to_string();
    }

    fn add_allowed_application(&mut self, package: &str) -> Result<(), PackageNotFound> {
        self.host.check_package(package)?;
        self.spec.allowed.push(package.to_string());
        Ok(())
    }

    fn add_disallowed_application(&mut self, package: &str) -> Result<(), PackageNotFound> {
        self.host.check_package(package)?;
        self.spec.disallowed.push(package.to_string());
        Ok(())
    }

    fn set_http_proxy(&mut self, addr: SocketAddr) {
        self.spec.http_proxy = Some(addr);
    }

    fn set_metered(&mut self, metered: bool) {
        self.spec.metered = Some(metered);
    }

    fn establish(self: Box<Self>) -> anyhow::Result<Arc<dyn TunInterface>> {
        if self.host.fail_establish.load(Ordering::SeqCst) {
            anyhow::bail!("establish refused");
        }
        let file = tempfile::tempfile()?;
        let id = self.host.interfaces.lock().unwrap().len();
        let iface = Arc::new(FakeInterface {
            id,
            fd: file.as_raw_fd(),
            file: Mutex::new(Some(file)),
            log: self.host.log.clone(),
            closes: AtomicUsize::new(0),
            underlying: Mutex::new(Vec::new()),
        });
        record(&self.host.log, format!("establish:{}", id));
        self.host.interfaces.lock().unwrap().push(iface.clone());
        *self.host.last_spec.lock().unwrap() = Some(self.spec);
        Ok(iface)
    }
}

// ─── host ──────────────────────────────────────────────────────────────────

pub struct HostState {
    pub log: CallLog,
    pub prepared: AtomicBool,
    pub fail_establish: AtomicBool,
    pub installed: Mutex<HashSet<String>>,
    pub interfaces: Mutex<Vec<Arc<FakeInterface>>>,
    pub last_spec: Mutex<Option<BuiltSpec>>,
    pub protected: Mutex<Vec<i32>>,
}

impl HostState {
    fn check_package(&self, package: &str) -> Result<(), PackageNotFound> {
        if self.installed.lock().unwrap().contains(package) {
            Ok(())
        } else {
            Err(PackageNotFound(package.to_string()))
        }
    }
}

#[derive(Clone)]
pub struct FakeHost(pub Arc<HostState>);

impl FakeHost {
    pub fn new() -> Self {
        let installed = [SELF_PACKAGE, "com.example.browser", "com.example.mail"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self(Arc::new(HostState {
            log: Arc::new(Mutex::new(Vec::new())),
            prepared: AtomicBool::new(true),
            fail_establish: AtomicBool::new(false),
            installed: Mutex::new(installed),
            interfaces: Mutex::new(Vec::new()),
            last_spec: Mutex::new(None),
            protected: Mutex::new(Vec::new()),
        }))
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.log.lock().unwrap().clone()
    }

    pub fn count(&self, what: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == what).count()
    }

    pub fn interface(&self, idx: usize) -> Arc<FakeInterface> {
        self.0.interfaces.lock().unwrap()[idx].clone()
    }

    pub fn interface_count(&self) -> usize {
        self.0.interfaces.lock().unwrap().len()
    }

    pub fn last_spec(&self) -> Option<BuiltSpec> {
        self.0.last_spec.lock().unwrap().clone()
    }
}

impl HostService for FakeHost {
    fn prepare(&self) -> bool {
        self.0.prepared.load(Ordering::SeqCst)
    }

    fn new_builder(&self) -> Box<dyn InterfaceBuilder> {
        Box::new(FakeBuilder {
            host: self.0.clone(),
            spec: BuiltSpec::default(),
        })
    }

    fn protect(&self, fd: i32) -> bool {
        self.0.protected.lock().unwrap().push(fd);
        fd >= 0
    }

    fn stop_core(&self) {
        record(&self.0.log, "stop_core");
    }

    fn stop_self(&self) {
        record(&self.0.log, "stop_self");
    }
}

// ─── connectivity ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeConnectivity {
    listener: Mutex<Option<Arc<dyn NetworkListener>>>,
    pub registered: AtomicUsize,
    pub unregistered: AtomicUsize,
}

impl FakeConnectivity {
    pub fn fire(&self, event: NetworkEvent) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(l) = listener {
            l.on_network_event(event);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

impl Connectivity for FakeConnectivity {
    fn register_default_network(&self, listener: Arc<dyn NetworkListener>) -> anyhow::Result<()> {
        self.registered.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn unregister_default_network(&self) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        self.listener.lock().unwrap().take();
    }
}

// ─── harness ───────────────────────────────────────────────────────────────

/// Script behaviour: the first `crashes` runs sleep `crash_after` seconds and
/// exit with 139, later runs stay up. With `remove_on_crash` the script deletes
/// itself before crashing, so every respawn fails.
pub struct ScriptPlan {
    pub crashes: u32,
    pub crash_after: &'static str,
    pub remove_on_crash: bool,
}

impl Default for ScriptPlan {
    fn default() -> Self {
        Self {
            crashes: 0,
            crash_after: "0",
            remove_on_crash: false,
        }
    }
}

pub fn write_tunnel_script(dir: &Path, plan: &ScriptPlan) {
    let script = format!(
        r#"#!/bin/sh
echo "$1 $2" > args
if [ -e "/proc/self/fd/$2" ]; then echo yes > fd_open; else echo no > fd_open; fi
n=$(cat runs 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > runs
echo "tunnel run $n"
if [ "$n" -le {crashes} ]; then
  sleep {after}
  {remove}
  exit 139
fi
exec sleep 30
"#,
        crashes = plan.crashes,
        after = plan.crash_after,
        remove = if plan.remove_on_crash { r#"rm -f "$0""# } else { ":" },
    );
    let path = dir.join("libhev-socks5-tunnel.so");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn test_settings() -> Settings {
    Settings {
        selected_server: Some("s1".to_string()),
        servers: vec![ServerEntry {
            id: "s1".to_string(),
            remarks: "tokyo".to_string(),
            address: "203.0.113.7".to_string(),
        }],
        ..Default::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub host: FakeHost,
    pub conn: Arc<FakeConnectivity>,
    pub config: TunnelConfig,
    pub settings: Settings,
}

impl Harness {
    pub fn new(plan: ScriptPlan) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_tunnel_script(dir.path(), &plan);
        let config = TunnelConfig {
            package_name: SELF_PACKAGE.to_string(),
            native_lib_dir: dir.path().to_path_buf(),
            files_dir: dir.path().to_path_buf(),
            restart_delay_ms: 50,
            stop_grace_ms: 500,
            ..Default::default()
        };
        Self {
            dir,
            host: FakeHost::new(),
            conn: Arc::new(FakeConnectivity::default()),
            config,
            settings: test_settings(),
        }
    }

    pub fn service(&self) -> TunnelService {
        TunnelService::spawn(TunnelDeps {
            settings: Arc::new(self.settings.clone()),
            host: Arc::new(self.host.clone()),
            connectivity: self.conn.clone(),
            config: self.config.clone(),
        })
    }

    pub fn runs(&self) -> u32 {
        std::fs::read_to_string(self.dir.path().join("runs"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name))
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    pub fn config_file_exists(&self) -> bool {
        self.config.config_path().exists()
    }
}

pub async fn wait_for_state(svc: &TunnelService, state: LifecycleState) {
    let mut rx = svc.watch_status();
    timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == state))
        .await
        .expect("state wait timed out")
        .expect("status channel closed");
}

/// Receive events until `pred` matches, returning everything seen.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<TunnelEvent>,
    mut pred: impl FnMut(&TunnelEvent) -> bool,
) -> Vec<TunnelEvent> {
    let mut seen = Vec::new();
    loop {
        let ev = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event wait timed out")
            .expect("event channel closed");
        let done = pred(&ev);
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

/// Wait until the script has been started `n` times.
pub async fn wait_for_runs(h: &Harness, n: u32) {
    timeout(Duration::from_secs(10), async {
        while h.runs() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("script run wait timed out");
}
