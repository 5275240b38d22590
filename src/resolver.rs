//! Destination resolution with an address-family preference.

use std::net::SocketAddr;

use tokio::net::lookup_host;

use crate::error::{ProxyError, Result};
use crate::protocol::socks5::Address;

/// Resolve `host:port`, ordering results by the preferred family.
pub async fn resolve(host: &str, port: u16, ipv6_first: bool) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::Resolver(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ProxyError::Resolver(format!("{host}: no addresses")));
    }
    Ok(order_by_family(addrs, ipv6_first))
}

/// Candidate addresses for a parsed destination; IP literals skip the
/// resolver entirely.
pub async fn resolve_addr(addr: &Address, ipv6_first: bool) -> Result<Vec<SocketAddr>> {
    match addr {
        Address::Ip(sa) => Ok(vec![*sa]),
        Address::Domain(name, port) => resolve(name, *port, ipv6_first).await,
    }
}

fn order_by_family(addrs: Vec<SocketAddr>, ipv6_first: bool) -> Vec<SocketAddr> {
    let (mut preferred, other): (Vec<_>, Vec<_>) =
        addrs.into_iter().partition(|sa| sa.is_ipv6() == ipv6_first);
    preferred.extend(other);
    preferred
}
