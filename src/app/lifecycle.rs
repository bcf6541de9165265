//! Lifecycle State Machine：隧道启动 / 停止 / 重启的唯一 owner。
//!
//! 运行在独立的 actor 任务中，所有状态迁移都经由 channel 串行化：
//! - 外部命令（start / stop / revoke）
//! - 子进程退出报告（来自 supervisor 的观察任务）
//! - 重启定时器到期
//!
//! 状态通过 `watch` 发布，事件通过 `broadcast` 发布。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::app::monitor::{BindingSnapshot, NetworkMonitor};
use crate::app::platform::{Connectivity, HostService, TunInterface};
use crate::app::resilience::{RestartDecision, RestartPolicy};
use crate::app::supervisor::{ExitCause, ExitReport, LaunchSpec, ProcessInfo, ProcessSupervisor};
use crate::common::{Result, TunnelError, TunnelErrorKind};
use crate::config::{SettingsSnapshot, TeardownOrder, TunnelConfig};
use crate::tun::{self, AppIdentity, EmitOptions, InterfaceConfigurator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Preparing,
    Establishing,
    Running,
    Restarting,
    StoppingSubprocess,
    ReleasingInterface,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Establishing => "establishing",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::StoppingSubprocess => "stopping_subprocess",
            Self::ReleasingInterface => "releasing_interface",
        }
    }

    /// Running or about to run again.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub state: LifecycleState,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
}

impl TunnelStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    StateChanged(LifecycleState),
    Started {
        pid: u32,
    },
    ProcessExited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
        cause: ExitCause,
        requested: bool,
    },
    Restarting {
        attempt: u32,
        delay: Duration,
    },
    RetryExhausted {
        attempts: u32,
    },
    Failed {
        kind: TunnelErrorKind,
        message: String,
    },
    Stopped {
        forced: bool,
    },
}

/// Collaborators the state machine is constructed with.
#[derive(Clone)]
pub struct TunnelDeps {
    pub settings: Arc<dyn SettingsSnapshot>,
    pub host: Arc<dyn HostService>,
    pub connectivity: Arc<dyn Connectivity>,
    pub config: TunnelConfig,
}

pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        forced: bool,
        reply: oneshot::Sender<()>,
    },
    Network {
        reply: oneshot::Sender<Option<BindingSnapshot>>,
    },
}

pub(crate) struct Lifecycle {
    settings: Arc<dyn SettingsSnapshot>,
    host: Arc<dyn HostService>,
    config: TunnelConfig,
    app: AppIdentity,
    emit_options: EmitOptions,
    config_path: PathBuf,

    configurator: InterfaceConfigurator,
    supervisor: ProcessSupervisor,
    monitor: NetworkMonitor,

    state: LifecycleState,
    interface: Option<Arc<dyn TunInterface>>,
    launch: Option<LaunchSpec>,
    last_error: Option<String>,
    restart_generation: u64,
    restart_tx: mpsc::UnboundedSender<u64>,

    status_tx: watch::Sender<TunnelStatus>,
    events_tx: broadcast::Sender<TunnelEvent>,
}

pub(crate) struct Mailboxes {
    exit_rx: mpsc::UnboundedReceiver<ExitReport>,
    restart_rx: mpsc::UnboundedReceiver<u64>,
}

impl Lifecycle {
    pub(crate) fn new(
        deps: TunnelDeps,
        status_tx: watch::Sender<TunnelStatus>,
        events_tx: broadcast::Sender<TunnelEvent>,
    ) -> (Self, Mailboxes) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let config = deps.config;
        let supervisor =
            ProcessSupervisor::new(RestartPolicy::from(&config), config.stop_grace(), exit_tx);
        let emit_options = EmitOptions {
            interface_name: config.interface_name.clone(),
            udp_mode: config.udp_mode.clone(),
            misc: Some(config.misc.clone()),
            ..Default::default()
        };

        let lifecycle = Self {
            settings: deps.settings,
            app: AppIdentity::from(&config),
            config_path: config.config_path(),
            emit_options,
            configurator: InterfaceConfigurator::new(deps.host.clone()),
            host: deps.host,
            supervisor,
            monitor: NetworkMonitor::new(deps.connectivity),
            config,
            state: LifecycleState::Idle,
            interface: None,
            launch: None,
            last_error: None,
            restart_generation: 0,
            restart_tx,
            status_tx,
            events_tx,
        };
        (lifecycle, Mailboxes { exit_rx, restart_rx })
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut mail: Mailboxes) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(report) = mail.exit_rx.recv() => self.handle_exit(report).await,
                Some(generation) = mail.restart_rx.recv() => self.handle_restart_due(generation).await,
            }
        }

        if self.state != LifecycleState::Idle || self.interface.is_some() {
            info!("tunnel service handle dropped, tearing down");
            self.teardown(true).await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => {
                let res = self.start().await;
                let _ = reply.send(res);
            }
            Command::Stop { forced, reply } => {
                self.stop(forced).await;
                let _ = reply.send(());
            }
            Command::Network { reply } => {
                let _ = reply.send(self.monitor.binding().map(|b| b.snapshot()));
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // start / stop
    // ═══════════════════════════════════════════════════════════════════════

    async fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Idle {
            debug!(state = self.state.as_str(), "start ignored");
            return Ok(());
        }

        self.supervisor.reset();
        self.last_error = None;

        match self.bring_up().await {
            Ok(info) => {
                self.set_state(LifecycleState::Running);
                self.emit(TunnelEvent::Started { pid: info.pid });
                info!(pid = info.pid, "tunnel started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "tunnel start failed, rolling back");
                self.teardown(true).await;
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<ProcessInfo> {
        self.set_state(LifecycleState::Preparing);
        self.validate_settings()?;

        self.set_state(LifecycleState::Establishing);
        let spec = tun::build(self.settings.as_ref(), &self.app);
        let iface = self.configurator.commit(&spec, self.interface.take())?;
        self.interface = Some(iface.clone());

        let blob = tun::emit(&spec, self.settings.socks_port(), &self.emit_options)
            .map_err(|e| TunnelError::Configuration(format!("{:#}", e)))?;
        blob.write_to(&self.config_path)?;
        debug!(path = %self.config_path.display(), "tunnel config written");

        let launch = LaunchSpec::for_tunnel(&self.config, &self.config_path, iface.raw_fd());
        let info = self.supervisor.spawn(&launch)?;
        self.launch = Some(launch);

        self.monitor.attach(&iface)?;
        Ok(info)
    }

    fn validate_settings(&self) -> Result<()> {
        if self.settings.server_count() == 0 {
            return Err(TunnelError::Configuration(
                "no server configuration".to_string(),
            ));
        }
        let id = self
            .settings
            .selected_server_id()
            .ok_or_else(|| TunnelError::Configuration("no server selected".to_string()))?;
        match self.settings.server_address(&id) {
            Some(addr) if !addr.trim().is_empty() => Ok(()),
            Some(_) => Err(TunnelError::Configuration(format!(
                "server {} has no address",
                id
            ))),
            None => Err(TunnelError::Configuration(format!(
                "selected server {} not found",
                id
            ))),
        }
    }

    async fn stop(&mut self, forced: bool) {
        // 已经完全停下：不再重复 stop_core / stop_self
        if self.state == LifecycleState::Idle
            && self.interface.is_none()
            && self.supervisor.current().is_none()
        {
            debug!(forced, "tunnel already stopped");
            return;
        }

        info!(forced, state = self.state.as_str(), "stopping tunnel");
        self.teardown(forced).await;
        self.emit(TunnelEvent::Stopped { forced });
    }

    /// Shared by stop, rollback and retry exhaustion.
    async fn teardown(&mut self, forced: bool) {
        // pending restart timers become stale
        self.restart_generation += 1;

        self.set_state(LifecycleState::StoppingSubprocess);
        self.supervisor.terminate().await;
        self.monitor.detach();
        self.launch = None;

        if forced {
            self.set_state(LifecycleState::ReleasingInterface);
            self.host.stop_core();
            match self.config.teardown_order {
                TeardownOrder::ReleaseThenDeregister => {
                    self.release_interface();
                    self.host.stop_self();
                }
                TeardownOrder::DeregisterThenRelease => {
                    self.host.stop_self();
                    self.release_interface();
                }
            }
            self.remove_config_file();
        }

        self.set_state(LifecycleState::Idle);
    }

    fn release_interface(&mut self) {
        if let Some(iface) = self.interface.take() {
            if let Err(e) = iface.close() {
                warn!(error = %e, "failed to close tunnel interface");
            }
        }
    }

    fn remove_config_file(&self) {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => debug!(path = %self.config_path.display(), "tunnel config removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.config_path.display(), error = %e, "failed to remove tunnel config"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // 子进程退出与重启
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_exit(&mut self, report: ExitReport) {
        self.emit(TunnelEvent::ProcessExited {
            pid: report.pid,
            code: report.code,
            signal: report.signal,
            cause: report.cause,
            requested: report.requested,
        });

        match self.supervisor.on_exit(&report) {
            None => self.publish(),
            Some(decision) => {
                self.last_error = Some(
                    TunnelError::SubprocessCrash(report.cause.describe()).to_string(),
                );
                self.apply_decision(decision).await;
            }
        }
    }

    async fn apply_decision(&mut self, decision: RestartDecision) {
        match decision {
            RestartDecision::Retry { attempt, delay } => self.schedule_restart(attempt, delay),
            RestartDecision::GiveUp { attempts } => self.give_up(attempts).await,
        }
    }

    fn schedule_restart(&mut self, attempt: u32, delay: Duration) {
        self.restart_generation += 1;
        let generation = self.restart_generation;
        self.set_state(LifecycleState::Restarting);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "restarting tunnel process");
        self.emit(TunnelEvent::Restarting { attempt, delay });

        let tx = self.restart_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(generation);
        });
    }

    async fn handle_restart_due(&mut self, generation: u64) {
        if self.state != LifecycleState::Restarting || generation != self.restart_generation {
            debug!(generation, "stale restart timer ignored");
            return;
        }
        let Some(launch) = self.launch.clone() else {
            return;
        };

        match self.supervisor.spawn(&launch) {
            Ok(info) => {
                self.set_state(LifecycleState::Running);
                self.emit(TunnelEvent::Started { pid: info.pid });
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                let decision = self.supervisor.after_spawn_failure();
                self.apply_decision(decision).await;
            }
        }
    }

    async fn give_up(&mut self, attempts: u32) {
        let err = TunnelError::RetryExhausted { attempts };
        self.teardown(true).await;
        self.emit(TunnelEvent::RetryExhausted { attempts });
        self.record_failure(&err);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // 状态发布
    // ═══════════════════════════════════════════════════════════════════════

    fn set_state(&mut self, state: LifecycleState) {
        if self.state == state {
            return;
        }
        debug!(from = self.state.as_str(), to = state.as_str(), "lifecycle transition");
        self.state = state;
        self.emit(TunnelEvent::StateChanged(state));
        self.publish();
    }

    fn record_failure(&mut self, err: &TunnelError) {
        self.last_error = Some(err.to_string());
        self.emit(TunnelEvent::Failed {
            kind: err.kind(),
            message: err.to_string(),
        });
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(TunnelStatus {
            state: self.state,
            restart_count: self.supervisor.restart_count(),
            pid: self.supervisor.current().map(|p| p.pid),
            last_error: self.last_error.clone(),
        });
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events_tx.send(event);
    }
}
