//! 平台接口：宿主（Android VpnService 等）需要实现的 trait。
//!
//! 生命周期状态机只依赖这些 trait，通过构造函数注入，
//! 不依赖任何进程级全局状态，也不关心平台回调的具体形态。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
// 网络
// ═══════════════════════════════════════════════════════════════════════════

/// 网络连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    None = 0,
    WiFi = 1,
    Cellular = 2,
    Ethernet = 3,
    Other = 4,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WiFi => "wifi",
            Self::Cellular => "cellular",
            Self::Ethernet => "ethernet",
            Self::Other => "other",
        }
    }
}

/// Opaque OS identity of a physical network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub handle: NetworkHandle,
    pub network_type: NetworkType,
    pub is_metered: bool,
}

/// Default-network notifications delivered by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkInfo),
    CapabilitiesChanged(NetworkInfo),
    Lost(NetworkHandle),
}

/// Receives default-network notifications. Called on an OS-owned context,
/// implementations must not block.
pub trait NetworkListener: Send + Sync {
    fn on_network_event(&self, event: NetworkEvent);
}

pub trait Connectivity: Send + Sync {
    fn register_default_network(&self, listener: Arc<dyn NetworkListener>) -> anyhow::Result<()>;

    /// Must tolerate being called without a prior successful registration.
    fn unregister_default_network(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// 虚拟网卡
// ═══════════════════════════════════════════════════════════════════════════

/// A live, OS-owned tunnel interface.
pub trait TunInterface: Send + Sync {
    fn raw_fd(&self) -> i32;

    /// `None` clears the binding and lets the OS pick.
    fn set_underlying_networks(&self, networks: Option<&[NetworkHandle]>);

    /// Idempotent.
    fn close(&self) -> std::io::Result<()>;
}

#[derive(Debug, Error)]
#[error("package not found: {0}")]
pub struct PackageNotFound(pub String);

/// Mirror of the OS interface builder. One builder per establish attempt.
pub trait InterfaceBuilder: Send {
    fn set_mtu(&mut self, mtu: u16);
    fn add_address(&mut self, addr: IpAddr, prefix_len: u8);
    fn add_route(&mut self, route: IpNet);
    fn add_dns_server(&mut self, addr: IpAddr);
    fn set_session(&mut self, session: &str);
    fn add_allowed_application(&mut self, package: &str) -> Result<(), PackageNotFound>;
    fn add_disallowed_application(&mut self, package: &str) -> Result<(), PackageNotFound>;
    fn set_http_proxy(&mut self, addr: SocketAddr);
    fn set_metered(&mut self, metered: bool);
    fn establish(self: Box<Self>) -> anyhow::Result<Arc<dyn TunInterface>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// 宿主服务
// ═══════════════════════════════════════════════════════════════════════════

pub trait HostService: Send + Sync {
    /// Whether the user has granted VPN permission.
    fn prepare(&self) -> bool;

    fn new_builder(&self) -> Box<dyn InterfaceBuilder>;

    /// Exempt a raw socket from the tunnel.
    fn protect(&self, fd: i32) -> bool;

    /// Stop the upstream proxy core.
    fn stop_core(&self);

    /// Deregister the hosting service from the OS.
    fn stop_self(&self);
}
