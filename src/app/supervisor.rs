//! Process Supervisor：管理 tun2socks 子进程的启动、输出、退出与重启决策。
//!
//! 每个子进程实例对应一个观察任务，任务独占 `Child`，退出结果通过 channel
//! 回报给唯一的状态机 owner；`running` 标志只在 owner 的 `&mut self` 调用中修改，
//! 观察任务从不读取它。

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::resilience::{RestartDecision, RestartPolicy};
use crate::common::{Result, TunnelError};
use crate::config::{InvocationMode, TunnelConfig};

/// Second argument in self-created mode: no descriptor is handed over.
pub const SELF_CREATED_SENTINEL: &str = "-1";

const OUTPUT_TARGET: &str = "tunvisor::tun2socks";

const SIGILL: i32 = 4;
const SIGABRT: i32 = 6;
const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;
const SIGTERM: i32 = 15;

/// Everything needed to (re)start the subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Descriptor that must survive `exec` in the child.
    pub inherit_fd: Option<i32>,
}

impl LaunchSpec {
    pub fn for_tunnel(cfg: &TunnelConfig, config_path: &Path, tun_fd: i32) -> Self {
        let (last_arg, inherit_fd) = match cfg.invocation {
            InvocationMode::Fd => (tun_fd.to_string(), Some(tun_fd)),
            InvocationMode::SelfCreated => (SELF_CREATED_SENTINEL.to_string(), None),
        };
        Self {
            executable: cfg.executable_path(),
            args: vec![config_path.to_string_lossy().into_owned(), last_arg],
            cwd: cfg.files_dir.clone(),
            inherit_fd,
        }
    }
}

/// Human-diagnosable reason for an exit. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Clean,
    IllegalInstruction,
    SegmentationFault,
    Aborted,
    Killed,
    Terminated,
    Signal(i32),
    Code(i32),
    Unknown,
}

impl ExitCause {
    /// Shells and Android report fatal signals as `128 + signo`.
    pub fn classify(code: Option<i32>, signal: Option<i32>) -> Self {
        match (code, signal) {
            (Some(0), _) => ExitCause::Clean,
            (Some(132), _) | (_, Some(SIGILL)) => ExitCause::IllegalInstruction,
            (Some(139), _) | (_, Some(SIGSEGV)) => ExitCause::SegmentationFault,
            (Some(134), _) | (_, Some(SIGABRT)) => ExitCause::Aborted,
            (_, Some(SIGKILL)) => ExitCause::Killed,
            (_, Some(SIGTERM)) => ExitCause::Terminated,
            (_, Some(sig)) => ExitCause::Signal(sig),
            (Some(code), None) => ExitCause::Code(code),
            (None, None) => ExitCause::Unknown,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitCause::Clean => "exited normally".to_string(),
            ExitCause::IllegalInstruction => {
                "SIGILL (illegal instruction): the binary may be incompatible with this CPU".to_string()
            }
            ExitCause::SegmentationFault => {
                "SIGSEGV (segmentation fault): memory access violation".to_string()
            }
            ExitCause::Aborted => "SIGABRT (aborted): internal assertion failed".to_string(),
            ExitCause::Killed => "SIGKILL (killed)".to_string(),
            ExitCause::Terminated => "SIGTERM (terminated)".to_string(),
            ExitCause::Signal(sig) => format!("killed by signal {}", sig),
            ExitCause::Code(code) => format!("unknown error code: {}", code),
            ExitCause::Unknown => "exit status unavailable".to_string(),
        }
    }
}

/// Sent by an observer task once its process is gone.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub instance: u64,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub cause: ExitCause,
    /// The process went away because a stop was requested.
    pub requested: bool,
}

impl ExitReport {
    fn new(instance: u64, pid: u32, status: &io::Result<ExitStatus>, requested: bool) -> Self {
        let (code, signal) = match status {
            Ok(s) => (s.code(), exit_signal(s)),
            Err(_) => (None, None),
        };
        Self {
            instance,
            pid,
            code,
            signal,
            cause: ExitCause::classify(code, signal),
            requested,
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// A spawned subprocess as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub instance: u64,
    pub pid: u32,
}

struct ProcessInstance {
    info: ProcessInfo,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    policy: RestartPolicy,
    grace: Duration,
    running: bool,
    restart_counter: u32,
    next_instance: u64,
    current: Option<ProcessInstance>,
    exit_tx: mpsc::UnboundedSender<ExitReport>,
}

impl ProcessSupervisor {
    pub fn new(
        policy: RestartPolicy,
        grace: Duration,
        exit_tx: mpsc::UnboundedSender<ExitReport>,
    ) -> Self {
        Self {
            policy,
            grace,
            running: false,
            restart_counter: 0,
            next_instance: 1,
            current: None,
            exit_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_counter
    }

    pub fn current(&self) -> Option<ProcessInfo> {
        self.current.as_ref().map(|p| p.info)
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Called on every externally-triggered start.
    pub fn reset(&mut self) {
        self.restart_counter = 0;
    }

    /// Start one subprocess instance. A failure counts against the restart cap.
    pub fn spawn(&mut self, launch: &LaunchSpec) -> Result<ProcessInfo> {
        self.running = true;

        let mut child = match spawn_child(launch) {
            Ok(child) => child,
            Err(e) => {
                self.restart_counter += 1;
                error!(
                    executable = %launch.executable.display(),
                    error = %e,
                    failures = self.restart_counter,
                    "failed to start tunnel process"
                );
                return Err(TunnelError::SubprocessSpawn(format!(
                    "{}: {}",
                    launch.executable.display(),
                    e
                )));
            }
        };

        let pid = child.id().unwrap_or_default();
        let instance = self.next_instance;
        self.next_instance += 1;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(drain_output(out, pid, "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(drain_output(err, pid, "stderr"));
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(observe(
            instance,
            pid,
            child,
            stop.clone(),
            self.grace,
            self.exit_tx.clone(),
        ));

        let info = ProcessInfo { instance, pid };
        info!(pid, instance, args = ?launch.args, "tunnel process started");
        self.current = Some(ProcessInstance { info, stop, task });
        Ok(info)
    }

    /// Decide what an exit means. `None` means the exit needs no action:
    /// it was requested, the supervisor is stopped, or the report is stale.
    pub fn on_exit(&mut self, report: &ExitReport) -> Option<RestartDecision> {
        let is_current = self
            .current
            .as_ref()
            .map(|p| p.info.instance == report.instance)
            .unwrap_or(false);
        if !is_current {
            debug!(instance = report.instance, "ignoring exit of stale instance");
            return None;
        }
        self.current = None;

        if report.requested || !self.running {
            return None;
        }

        self.restart_counter += 1;
        Some(self.after_failure())
    }

    /// Decision after a failed spawn; the counter was bumped by `spawn`.
    pub fn after_spawn_failure(&mut self) -> RestartDecision {
        self.after_failure()
    }

    fn after_failure(&mut self) -> RestartDecision {
        let decision = self.policy.decide(self.restart_counter);
        if let RestartDecision::GiveUp { attempts } = decision {
            self.running = false;
            error!(attempts, "too many consecutive restarts, giving up");
        }
        decision
    }

    /// Clear `running` and stop the current instance: SIGTERM, wait up to the
    /// grace period, then SIGKILL. Returns once the process is reaped.
    pub async fn terminate(&mut self) {
        self.running = false;
        let Some(instance) = self.current.take() else {
            return;
        };

        info!(pid = instance.info.pid, "stopping tunnel process");
        instance.stop.cancel();
        if let Err(e) = instance.task.await {
            warn!(error = %e, "tunnel process observer ended abnormally");
        }
    }
}

fn spawn_child(launch: &LaunchSpec) -> io::Result<Child> {
    let mut cmd = Command::new(&launch.executable);
    cmd.args(&launch.args)
        .current_dir(&launch.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Some(fd) = launch.inherit_fd {
            // SAFETY: the closure only calls fcntl, which is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || clear_cloexec(fd));
            }
        }
    }

    cmd.spawn()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn clear_cloexec(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drain a pipe line by line so the child never blocks on a full buffer.
async fn drain_output<R: AsyncRead + Unpin>(reader: R, pid: u32, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: OUTPUT_TARGET, pid, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(target: OUTPUT_TARGET, pid, stream, error = %e, "error reading process output");
                break;
            }
        }
    }
}

async fn observe(
    instance: u64,
    pid: u32,
    mut child: Child,
    stop: CancellationToken,
    grace: Duration,
    exit_tx: mpsc::UnboundedSender<ExitReport>,
) {
    let (status, requested) = tokio::select! {
        biased;
        _ = stop.cancelled() => (terminate_child(&mut child, pid, grace).await, true),
        status = await_exit(&mut child) => (status, false),
    };

    let report = ExitReport::new(instance, pid, &status, requested);
    if requested {
        info!(pid, code = ?report.code, signal = ?report.signal, "tunnel process stopped");
    } else {
        error!(
            pid,
            code = ?report.code,
            signal = ?report.signal,
            cause = %report.cause.describe(),
            "tunnel process exited"
        );
    }
    let _ = exit_tx.send(report);
}

pub async fn await_exit(child: &mut Child) -> io::Result<ExitStatus> {
    child.wait().await
}

pub async fn terminate_child(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
    request_graceful_stop(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "process didn't terminate gracefully, forcing kill");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn request_graceful_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on a pid we own and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn request_graceful_stop(child: &mut Child) {
    let _ = child.start_kill();
}
