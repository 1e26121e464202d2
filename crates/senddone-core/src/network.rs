//! 本地网络接口枚举
//!
//! 列出可以作为接收端监听地址的本机地址。接口由 `if-addrs` 枚举；
//! 枚举失败时退回到路由探测，只能得到默认出口地址。

use log::debug;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::error::{Result, TransferError};

/// 一个接口地址
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub address: IpAddr,
}

/// 枚举非回环地址
///
/// 默认只返回 IPv4；`include_ipv6` 为真时附带非链路本地的 IPv6 地址。
/// 枚举失败时返回空列表。
pub fn list_networks(include_ipv6: bool) -> Vec<NetworkInterface> {
    let mut networks: Vec<_> = raw_interfaces()
        .into_iter()
        .filter(|iface| is_candidate(&iface.address, include_ipv6))
        .collect();
    networks.sort();
    networks.dedup();
    debug!("Found {} candidate network addresses", networks.len());
    networks
}

fn is_candidate(addr: &IpAddr, include_ipv6: bool) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return false;
    }
    match addr {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => include_ipv6 && !is_unicast_link_local(v6),
    }
}

// fe80::/10
fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn raw_interfaces() -> Vec<NetworkInterface> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|iface| NetworkInterface {
                address: iface.ip(),
                name: iface.name,
            })
            .collect(),
        Err(e) => {
            debug!("Interface enumeration failed, probing default route: {}", e);
            default_route().into_iter().collect()
        }
    }
}

// UDP connect 不发送数据，只让系统选出默认路由的源地址
fn default_route() -> Option<NetworkInterface> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("8.8.8.8:80").map(|()| socket))
        .and_then(|socket| socket.local_addr());
    match probe {
        Ok(addr) => Some(NetworkInterface {
            name: "default".to_string(),
            address: addr.ip(),
        }),
        Err(e) => {
            debug!("Default route probe failed: {}", e);
            None
        }
    }
}

/// 解析对端地址
///
/// 接受 `ip`、`ip:port` 或 `[v6]:port`；未给端口时使用 `default_port`。
pub fn parse_peer_addr(text: &str, default_port: u16) -> Result<SocketAddr> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let bare = text.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| TransferError::InvalidAddress(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_list_networks_excludes_loopback() {
        for iface in list_networks(true) {
            assert!(!iface.address.is_loopback(), "{:?}", iface);
            assert!(!iface.name.is_empty());
        }
    }

    #[test]
    fn test_list_networks_ipv4_only_by_default() {
        assert!(list_networks(false).iter().all(|iface| iface.address.is_ipv4()));
    }

    #[test]
    fn test_list_networks_come_from_interfaces() {
        let known: Vec<IpAddr> = if_addrs::get_if_addrs()
            .map(|ifaces| ifaces.iter().map(if_addrs::Interface::ip).collect())
            .unwrap_or_default();
        if known.is_empty() {
            return;
        }
        for iface in list_networks(true) {
            assert!(known.contains(&iface.address), "{:?}", iface);
        }
    }

    #[test]
    fn test_candidate_filter() {
        assert!(is_candidate(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), false));
        assert!(!is_candidate(&IpAddr::V4(Ipv4Addr::LOCALHOST), false));
        assert!(!is_candidate(&"fe80::1".parse().unwrap(), true));
        assert!(is_candidate(&"fd00::1".parse().unwrap(), true));
        assert!(!is_candidate(&"fd00::1".parse().unwrap(), false));
    }

    #[test]
    fn test_parse_peer_addr() {
        assert_eq!(
            parse_peer_addr("192.168.1.10", 47823).unwrap(),
            "192.168.1.10:47823".parse().unwrap()
        );
        assert_eq!(
            parse_peer_addr("192.168.1.10:9000", 47823).unwrap().port(),
            9000
        );
        assert_eq!(
            parse_peer_addr("[fd00::1]", 47823).unwrap(),
            "[fd00::1]:47823".parse().unwrap()
        );
        assert!(matches!(
            parse_peer_addr("not-an-ip", 1),
            Err(TransferError::InvalidAddress(_))
        ));
    }
}
