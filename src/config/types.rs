use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use super::settings::Settings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        if self.settings.socks_port == 0 {
            anyhow::bail!("settings.socks_port must not be 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How the tunnelling binary gets hold of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    /// Pass the already-open interface descriptor number as the second argument.
    #[default]
    Fd,
    /// Pass a sentinel and let the binary open `tunnel.name` itself.
    SelfCreated,
}

/// Order of the last two steps of a forced stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownOrder {
    /// Close the interface, then deregister the hosting service.
    #[default]
    ReleaseThenDeregister,
    /// Deregister the hosting service, then close the interface.
    DeregisterThenRelease,
}

/// `misc` section of the subprocess configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MiscConfig {
    #[serde(default = "default_misc_log_level")]
    pub log_level: String,
    #[serde(default = "default_tcp_buffer_size")]
    pub tcp_buffer_size: u32,
    #[serde(default = "default_task_stack_size")]
    pub task_stack_size: u32,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            log_level: default_misc_log_level(),
            tcp_buffer_size: default_tcp_buffer_size(),
            task_stack_size: default_task_stack_size(),
        }
    }
}

fn default_misc_log_level() -> String {
    "debug".to_string()
}

// Small on purpose: larger values abort with OOM on low-end devices.
fn default_tcp_buffer_size() -> u32 {
    2048
}

fn default_task_stack_size() -> u32 {
    8192
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Package identifier of the hosting application.
    #[serde(default = "default_package_name")]
    pub package_name: String,
    /// Session label used when no server name is available.
    #[serde(default = "default_app_label")]
    pub app_label: String,
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_native_lib_dir")]
    pub native_lib_dir: PathBuf,
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default)]
    pub invocation: InvocationMode,
    #[serde(default)]
    pub teardown_order: TeardownOrder,
    #[serde(default = "default_udp_mode")]
    pub udp_mode: String,
    #[serde(default)]
    pub misc: MiscConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            package_name: default_package_name(),
            app_label: default_app_label(),
            executable: default_executable(),
            native_lib_dir: default_native_lib_dir(),
            files_dir: default_files_dir(),
            config_file: default_config_file(),
            interface_name: default_interface_name(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            invocation: InvocationMode::default(),
            teardown_order: TeardownOrder::default(),
            udp_mode: default_udp_mode(),
            misc: MiscConfig::default(),
        }
    }
}

fn default_package_name() -> String {
    "com.tunvisor.app".to_string()
}

fn default_app_label() -> String {
    "tunvisor".to_string()
}

fn default_executable() -> String {
    "libhev-socks5-tunnel.so".to_string()
}

fn default_native_lib_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_files_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_config_file() -> String {
    "hev-socks5-tunnel.yml".to_string()
}

fn default_interface_name() -> String {
    "tun0".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_udp_mode() -> String {
    "udp".to_string()
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.package_name.trim().is_empty() {
            anyhow::bail!("tunnel.package_name must not be empty");
        }
        if self.executable.trim().is_empty() {
            anyhow::bail!("tunnel.executable must not be empty");
        }
        if self.config_file.trim().is_empty() {
            anyhow::bail!("tunnel.config_file must not be empty");
        }
        if self.restart_delay_ms == 0 {
            anyhow::bail!("tunnel.restart_delay_ms must be greater than 0");
        }
        if self.misc.tcp_buffer_size == 0 || self.misc.task_stack_size == 0 {
            anyhow::bail!("tunnel.misc buffer sizes must be greater than 0");
        }
        if self.invocation == InvocationMode::SelfCreated && self.interface_name.is_empty() {
            anyhow::bail!("tunnel.interface_name is required for self-created invocation");
        }
        Ok(())
    }

    pub fn executable_path(&self) -> PathBuf {
        self.native_lib_dir.join(&self.executable)
    }

    pub fn config_path(&self) -> PathBuf {
        self.files_dir.join(&self.config_file)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
