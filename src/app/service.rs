//! 隧道服务句柄
//!
//! 宿主（Android VpnService / JNI 层）持有 `TunnelService`，
//! 把 OS 生命周期回调转成发给状态机 actor 的命令。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use crate::app::lifecycle::{Command, Lifecycle, LifecycleState, TunnelDeps, TunnelEvent, TunnelStatus};
use crate::app::monitor::BindingSnapshot;
use crate::app::platform::{Connectivity, HostService};
use crate::common::{Result, TunnelError};
use crate::config::Config;

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;

/// Hosting service callback surface.
///
/// Callbacks arrive on OS threads and must not block, so start/stop are
/// fire-and-forget; outcomes are reported through [`TunnelEvent`]s.
pub trait ServiceControl {
    fn start_service(&self);
    fn stop_service(&self);
    /// Exempt a socket of the upstream proxy core from the tunnel.
    fn vpn_protect(&self, fd: i32) -> bool;
    fn get_service(&self) -> Arc<dyn HostService>;
}

/// Cloneable handle to the lifecycle actor. The actor tears the tunnel down
/// once the last handle is dropped.
#[derive(Clone)]
pub struct TunnelService {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<TunnelStatus>,
    events_tx: broadcast::Sender<TunnelEvent>,
    host: Arc<dyn HostService>,
}

impl TunnelService {
    /// Must be called inside a tokio runtime.
    pub fn spawn(deps: TunnelDeps) -> Self {
        let host = deps.host.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(TunnelStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);

        let (lifecycle, mail) = Lifecycle::new(deps, status_tx, events_tx.clone());
        tokio::spawn(lifecycle.run(cmd_rx, mail));

        Self {
            cmd_tx,
            status_rx,
            events_tx,
            host,
        }
    }

    /// Build from a loaded [`Config`]; its `settings` section becomes the
    /// settings snapshot.
    pub fn from_config(
        config: &Config,
        host: Arc<dyn HostService>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self::spawn(TunnelDeps {
            settings: Arc::new(config.settings.clone()),
            host,
            connectivity,
            config: config.tunnel.clone(),
        })
    }

    /// Resolves once the tunnel is running or the start failed and was rolled back.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { reply }).await?;
        rx.await.map_err(|_| closed())?
    }

    pub async fn stop(&self, forced: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { forced, reply }).await?;
        rx.await.map_err(|_| closed())
    }

    /// VPN permission revoked by the OS.
    pub async fn on_revoke(&self) -> Result<()> {
        self.stop(true).await
    }

    pub fn status(&self) -> TunnelStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.status_rx.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events_tx.subscribe()
    }

    /// Current underlying network binding, if attached.
    pub async fn network(&self) -> Result<Option<BindingSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Network { reply }).await?;
        rx.await.map_err(|_| closed())
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| closed())
    }

    fn post(&self, cmd: Command, what: &'static str) {
        if let Err(e) = self.cmd_tx.try_send(cmd) {
            warn!(command = what, error = %e, "tunnel command dropped");
        }
    }
}

fn closed() -> TunnelError {
    TunnelError::Other(anyhow::anyhow!("tunnel service has shut down"))
}

impl ServiceControl for TunnelService {
    fn start_service(&self) {
        let (reply, _) = oneshot::channel();
        self.post(Command::Start { reply }, "start");
    }

    fn stop_service(&self) {
        let (reply, _) = oneshot::channel();
        self.post(Command::Stop { forced: true, reply }, "stop");
    }

    fn vpn_protect(&self, fd: i32) -> bool {
        self.host.protect(fd)
    }

    fn get_service(&self) -> Arc<dyn HostService> {
        self.host.clone()
    }
}
