//! Interface Configurator：把 Settings Snapshot 推导成网卡参数，并交给宿主建立。

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::app::platform::{HostService, TunInterface};
use crate::common::{Result, TunnelError};
use crate::config::{SettingsSnapshot, TunnelConfig};
use crate::tun::routes;

pub const VPN_MTU: u16 = 1500;

pub const PRIVATE_VLAN4_CLIENT: Ipv4Addr = Ipv4Addr::new(10, 10, 14, 1);
pub const PRIVATE_VLAN4_ROUTER: Ipv4Addr = Ipv4Addr::new(10, 10, 14, 2);
pub const PRIVATE_VLAN4_PREFIX: u8 = 30;

pub const PRIVATE_VLAN6_CLIENT: Ipv6Addr = Ipv6Addr::new(0xfc00, 0, 0, 0, 0x10, 0x10, 0x14, 0x1);
pub const PRIVATE_VLAN6_ROUTER: Ipv6Addr = Ipv6Addr::new(0xfc00, 0, 0, 0, 0x10, 0x10, 0x14, 0x2);
pub const PRIVATE_VLAN6_PREFIX: u8 = 126;

pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Client side is the interface address, router side is the subprocess's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPair<A> {
    pub client: A,
    pub router: A,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    /// Only these packages enter the tunnel.
    Allow(BTreeSet<String>),
    /// Every package except these enters the tunnel.
    Deny(BTreeSet<String>),
}

impl AppFilter {
    pub fn packages(&self) -> &BTreeSet<String> {
        match self {
            AppFilter::Allow(p) | AppFilter::Deny(p) => p,
        }
    }

    pub fn is_allow_list(&self) -> bool {
        matches!(self, AppFilter::Allow(_))
    }
}

/// Who is hosting the tunnel; only the package matters for filtering.
#[derive(Debug, Clone)]
pub struct AppIdentity {
    pub package_name: String,
    pub label: String,
}

impl From<&TunnelConfig> for AppIdentity {
    fn from(cfg: &TunnelConfig) -> Self {
        Self {
            package_name: cfg.package_name.clone(),
            label: cfg.app_label.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub mtu: u16,
    pub ipv4: AddressPair<Ipv4Addr>,
    pub ipv6: Option<AddressPair<Ipv6Addr>>,
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    pub session: String,
    pub app_filter: AppFilter,
    pub http_proxy: Option<SocketAddr>,
    pub metered: bool,
}

/// Derive the interface parameters. Pure: no I/O, same input gives the same spec.
pub fn build(settings: &dyn SettingsSnapshot, app: &AppIdentity) -> InterfaceSpec {
    let bypass_lan = settings.bypass_lan();

    let ipv4 = AddressPair {
        client: PRIVATE_VLAN4_CLIENT,
        router: PRIVATE_VLAN4_ROUTER,
        prefix_len: PRIVATE_VLAN4_PREFIX,
    };
    let mut route_set = routes::ipv4_routes(bypass_lan);

    let ipv6 = if settings.prefer_ipv6() {
        route_set.extend(routes::ipv6_routes(bypass_lan));
        Some(AddressPair {
            client: PRIVATE_VLAN6_CLIENT,
            router: PRIVATE_VLAN6_ROUTER,
            prefix_len: PRIVATE_VLAN6_PREFIX,
        })
    } else {
        None
    };

    let dns_servers = if settings.local_dns_enabled() {
        vec![IpAddr::V4(PRIVATE_VLAN4_ROUTER)]
    } else {
        literal_dns_servers(&settings.vpn_dns_servers())
    };

    let session = settings
        .running_server_name()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| app.label.clone());

    let http_proxy = settings
        .append_http_proxy()
        .then(|| SocketAddr::new(IpAddr::V4(LOOPBACK), settings.http_port()));

    InterfaceSpec {
        mtu: VPN_MTU,
        ipv4,
        ipv6,
        routes: route_set,
        dns_servers,
        session,
        app_filter: app_filter(settings, &app.package_name),
        http_proxy,
        metered: false,
    }
}

/// Keep literal IP entries only, first occurrence wins.
fn literal_dns_servers(raw: &[String]) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for entry in raw {
        if let Ok(ip) = entry.trim().parse::<IpAddr>() {
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
    }
    out
}

fn app_filter(settings: &dyn SettingsSnapshot, self_package: &str) -> AppFilter {
    let self_only = || AppFilter::Deny(BTreeSet::from([self_package.to_string()]));

    if !settings.per_app_proxy() {
        return self_only();
    }

    let mut packages: BTreeSet<String> = settings
        .per_app_packages()
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if settings.bypass_apps() {
        packages.insert(self_package.to_string());
        AppFilter::Deny(packages)
    } else {
        packages.remove(self_package);
        if packages.is_empty() {
            // an empty allow-list means "all apps", the host included
            return self_only();
        }
        AppFilter::Allow(packages)
    }
}

/// Materializes an [`InterfaceSpec`] through the host's interface builder.
pub struct InterfaceConfigurator {
    host: Arc<dyn HostService>,
}

impl InterfaceConfigurator {
    pub fn new(host: Arc<dyn HostService>) -> Self {
        Self { host }
    }

    /// Establish a new interface. `previous` is closed first, on every path
    /// including a refused prepare, so a stale descriptor can never reach the
    /// next subprocess.
    pub fn commit(
        &self,
        spec: &InterfaceSpec,
        previous: Option<Arc<dyn TunInterface>>,
    ) -> Result<Arc<dyn TunInterface>> {
        // 无论后面是否成功，旧描述符都要先关掉
        if let Some(old) = previous {
            if let Err(e) = old.close() {
                debug!(error = %e, "closing previous interface failed");
            }
        }

        if !self.host.prepare() {
            return Err(TunnelError::InterfaceEstablish(
                "VPN permission not granted".to_string(),
            ));
        }

        let mut builder = self.host.new_builder();
        builder.set_mtu(spec.mtu);
        builder.add_address(IpAddr::V4(spec.ipv4.client), spec.ipv4.prefix_len);
        if let Some(v6) = &spec.ipv6 {
            builder.add_address(IpAddr::V6(v6.client), v6.prefix_len);
        }
        for route in &spec.routes {
            builder.add_route(*route);
        }
        for dns in &spec.dns_servers {
            builder.add_dns_server(*dns);
        }
        builder.set_session(&spec.session);

        let allow = spec.app_filter.is_allow_list();
        let mut applied = 0usize;
        for package in spec.app_filter.packages() {
            let res = if allow {
                builder.add_allowed_application(package)
            } else {
                builder.add_disallowed_application(package)
            };
            match res {
                Ok(()) => applied += 1,
                Err(e) => warn!(package = package.as_str(), error = %e, "skipping per-app entry"),
            }
        }

        builder.set_metered(spec.metered);
        if let Some(proxy) = spec.http_proxy {
            builder.set_http_proxy(proxy);
        }

        let iface = builder
            .establish()
            .map_err(|e| TunnelError::InterfaceEstablish(format!("{:#}", e)))?;

        info!(
            fd = iface.raw_fd(),
            routes = spec.routes.len(),
            dns = spec.dns_servers.len(),
            apps = applied,
            allow_list = allow,
            session = spec.session.as_str(),
            "tunnel interface established"
        );
        Ok(iface)
    }
}
