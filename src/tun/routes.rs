use ipnet::IpNet;

/// IPv4 space minus the RFC 1918 and multicast ranges. Routing only these
/// keeps LAN traffic off the tunnel.
pub const BYPASS_PRIVATE_IP_LIST: [&str; 31] = [
    "0.0.0.0/5",
    "8.0.0.0/7",
    "11.0.0.0/8",
    "12.0.0.0/6",
    "16.0.0.0/4",
    "32.0.0.0/3",
    "64.0.0.0/2",
    "128.0.0.0/3",
    "160.0.0.0/5",
    "168.0.0.0/6",
    "172.0.0.0/12",
    "172.32.0.0/11",
    "172.64.0.0/10",
    "172.128.0.0/9",
    "173.0.0.0/8",
    "174.0.0.0/7",
    "176.0.0.0/4",
    "192.0.0.0/9",
    "192.128.0.0/11",
    "192.160.0.0/13",
    "192.169.0.0/16",
    "192.170.0.0/15",
    "192.172.0.0/14",
    "192.176.0.0/12",
    "192.192.0.0/10",
    "193.0.0.0/8",
    "194.0.0.0/7",
    "196.0.0.0/6",
    "200.0.0.0/5",
    "208.0.0.0/4",
    "240.0.0.0/4",
];

/// Global unicast only; the rest of IPv6 is barely in use.
pub const BYPASS_IPV6_ROUTE: &str = "2000::/3";

pub const DEFAULT_ROUTE_V4: &str = "0.0.0.0/0";
pub const DEFAULT_ROUTE_V6: &str = "::/0";

pub fn ipv4_routes(bypass_lan: bool) -> Vec<IpNet> {
    if bypass_lan {
        parse_all(&BYPASS_PRIVATE_IP_LIST)
    } else {
        parse_all(&[DEFAULT_ROUTE_V4])
    }
}

pub fn ipv6_routes(bypass_lan: bool) -> Vec<IpNet> {
    if bypass_lan {
        parse_all(&[BYPASS_IPV6_ROUTE])
    } else {
        parse_all(&[DEFAULT_ROUTE_V6])
    }
}

fn parse_all(cidrs: &[&str]) -> Vec<IpNet> {
    cidrs.iter().filter_map(|c| c.parse::<IpNet>().ok()).collect()
}
