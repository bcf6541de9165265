//! Settings Snapshot：上游代理配置存储的只读视图。
//!
//! 宿主应用可以在自己的 key/value 存储之上实现 [`SettingsSnapshot`]；
//! 本 crate 自带一个由 YAML 文件反序列化而来的 [`Settings`] 实现。

use serde::Deserialize;

pub const DEFAULT_SOCKS_PORT: u16 = 10808;
pub const DEFAULT_HTTP_PORT: u16 = 10809;
pub const DEFAULT_VPN_DNS: &str = "1.1.1.1";

/// Read-only lookups the tunnel core needs from the settings store.
pub trait SettingsSnapshot: Send + Sync {
    fn prefer_ipv6(&self) -> bool;
    fn bypass_lan(&self) -> bool;
    fn per_app_proxy(&self) -> bool;
    /// `true` = the per-app set is a deny-list, `false` = allow-list.
    fn bypass_apps(&self) -> bool;
    fn per_app_packages(&self) -> Vec<String>;
    fn local_dns_enabled(&self) -> bool;
    /// Raw DNS entries as stored; may contain hostnames or DoH URLs.
    fn vpn_dns_servers(&self) -> Vec<String>;
    fn append_http_proxy(&self) -> bool;
    fn http_port(&self) -> u16;
    fn socks_port(&self) -> u16;
    fn server_count(&self) -> usize;
    fn selected_server_id(&self) -> Option<String>;
    /// Host of the server's first outbound, if the server exists.
    fn server_address(&self, id: &str) -> Option<String>;
    fn running_server_name(&self) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub prefer_ipv6: bool,
    #[serde(default = "default_true")]
    pub bypass_lan: bool,
    #[serde(default)]
    pub per_app_proxy: bool,
    #[serde(default)]
    pub bypass_apps: bool,
    #[serde(default)]
    pub per_app_set: Vec<String>,
    #[serde(default)]
    pub local_dns: bool,
    #[serde(default = "default_vpn_dns")]
    pub vpn_dns: Vec<String>,
    #[serde(default)]
    pub append_http_proxy: bool,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub selected_server: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefer_ipv6: false,
            bypass_lan: true,
            per_app_proxy: false,
            bypass_apps: false,
            per_app_set: Vec::new(),
            local_dns: false,
            vpn_dns: default_vpn_dns(),
            append_http_proxy: false,
            socks_port: DEFAULT_SOCKS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            selected_server: None,
            servers: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_vpn_dns() -> Vec<String> {
    vec![DEFAULT_VPN_DNS.to_string()]
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Settings {
    fn selected(&self) -> Option<&ServerEntry> {
        let id = self.selected_server.as_deref()?;
        self.servers.iter().find(|s| s.id == id)
    }
}

impl SettingsSnapshot for Settings {
    fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    fn bypass_lan(&self) -> bool {
        self.bypass_lan
    }

    fn per_app_proxy(&self) -> bool {
        self.per_app_proxy
    }

    fn bypass_apps(&self) -> bool {
        self.bypass_apps
    }

    fn per_app_packages(&self) -> Vec<String> {
        self.per_app_set.clone()
    }

    fn local_dns_enabled(&self) -> bool {
        self.local_dns
    }

    fn vpn_dns_servers(&self) -> Vec<String> {
        self.vpn_dns.clone()
    }

    fn append_http_proxy(&self) -> bool {
        self.append_http_proxy
    }

    fn http_port(&self) -> u16 {
        self.http_port
    }

    fn socks_port(&self) -> u16 {
        self.socks_port
    }

    fn server_count(&self) -> usize {
        self.servers.len()
    }

    fn selected_server_id(&self) -> Option<String> {
        self.selected_server.clone()
    }

    fn server_address(&self, id: &str) -> Option<String> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.address.clone())
    }

    fn running_server_name(&self) -> Option<String> {
        self.selected()
            .map(|s| s.remarks.clone())
            .filter(|r| !r.is_empty())
    }
}
