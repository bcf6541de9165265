//! Tunnel Config Emitter：生成 hev-socks5-tunnel 的 YAML 配置。
//!
//! 键名和层级由外部二进制解析，属于固定协议；这里只写不读。

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::MiscConfig;
use crate::tun::interface::InterfaceSpec;

/// Parameters that do not come from the interface spec.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub interface_name: String,
    pub socks_address: IpAddr,
    pub udp_mode: String,
    pub misc: Option<MiscConfig>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            interface_name: "tun0".to_string(),
            socks_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_mode: "udp".to_string(),
            misc: Some(MiscConfig::default()),
        }
    }
}

/// Serialized subprocess configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob(String);

impl ConfigBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.0.as_bytes())
    }
}

#[derive(Serialize)]
struct HevConfig<'a> {
    tunnel: TunnelSection<'a>,
    socks5: Socks5Section<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    misc: Option<MiscSection<'a>>,
}

#[derive(Serialize)]
struct TunnelSection<'a> {
    name: &'a str,
    mtu: u16,
    ipv4: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<String>,
}

#[derive(Serialize)]
struct Socks5Section<'a> {
    address: String,
    port: u16,
    udp: &'a str,
}

#[derive(Serialize)]
struct MiscSection<'a> {
    #[serde(rename = "log-level")]
    log_level: &'a str,
    #[serde(rename = "tcp-buffer-size")]
    tcp_buffer_size: u32,
    #[serde(rename = "task-stack-size")]
    task_stack_size: u32,
}

pub fn emit(spec: &InterfaceSpec, socks_port: u16, extra: &EmitOptions) -> Result<ConfigBlob> {
    if socks_port == 0 {
        anyhow::bail!("socks5 port must not be 0");
    }
    if extra.udp_mode.is_empty() {
        anyhow::bail!("socks5 udp mode must not be empty");
    }

    let doc = HevConfig {
        tunnel: TunnelSection {
            name: &extra.interface_name,
            mtu: spec.mtu,
            ipv4: spec.ipv4.router.to_string(),
            ipv6: spec.ipv6.map(|v6| v6.router.to_string()),
        },
        socks5: Socks5Section {
            address: extra.socks_address.to_string(),
            port: socks_port,
            udp: &extra.udp_mode,
        },
        misc: extra.misc.as_ref().map(|m| MiscSection {
            log_level: &m.log_level,
            tcp_buffer_size: m.tcp_buffer_size,
            task_stack_size: m.task_stack_size,
        }),
    };

    let text = serde_yml::to_string(&doc).context("failed to serialize tunnel config")?;
    Ok(ConfigBlob(text))
}
