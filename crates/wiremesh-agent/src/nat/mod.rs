// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! NAT traversal: public endpoint discovery and private endpoint selection.

pub mod probe;
pub mod stun;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use wiremesh_types::NetworkPeer;

/// How many ports above the preferred one are tried before letting the OS
/// choose.
const PORT_ATTEMPTS: u16 = 32;

/// What an interface learned about itself before coming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    /// Local UDP port the interface will listen on.
    pub listen_port: u16,
    /// Port as mapped by the NAT; equals `listen_port` without STUN.
    pub public_listen_port: u16,
    /// Public address, if a STUN server answered.
    pub endpoint: Option<IpAddr>,
    /// LAN address used to reach the control server, if private.
    pub private_endpoint: Option<IpAddr>,
}

/// Bind a free UDP port near `preferred`, run STUN from it and release it
/// for the interface.
#[tracing::instrument(skip(stun_servers))]
pub async fn discover(
    preferred: u16,
    stun_servers: &[String],
    stun_timeout: Duration,
    control_server: &str,
) -> std::io::Result<Discovery> {
    let socket = bind_near(preferred).await?;
    let listen_port = socket.local_addr()?.port();

    let (endpoint, public_listen_port) = if stun_servers.is_empty() {
        (None, listen_port)
    } else {
        match stun::discover(&socket, stun_servers, stun_timeout).await {
            Ok(mapped) => (Some(mapped.ip()), mapped.port()),
            Err(e) => {
                warn!(error = %e, "public endpoint discovery failed");
                (None, listen_port)
            }
        }
    };
    drop(socket);

    let private_endpoint = lan_address(control_server).await;
    let discovery = Discovery {
        listen_port,
        public_listen_port,
        endpoint,
        private_endpoint,
    };
    info!(
        listen_port,
        public_listen_port,
        endpoint = ?endpoint,
        private_endpoint = ?private_endpoint,
        "discovered endpoints"
    );
    Ok(discovery)
}

async fn bind_near(preferred: u16) -> std::io::Result<UdpSocket> {
    if preferred != 0 {
        for offset in 0..PORT_ATTEMPTS {
            let Some(port) = preferred.checked_add(offset) else {
                break;
            };
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!(port, "listen port busy");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(preferred, "no free port near preferred, letting the OS choose");
    }
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await
}

/// The local address the kernel would route `target` from, when it is a
/// LAN address worth advertising.
async fn lan_address(target: &str) -> Option<IpAddr> {
    let target = tokio::net::lookup_host(target)
        .await
        .ok()?
        .find(SocketAddr::is_ipv4)?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(target).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if ip.is_private() => Some(IpAddr::V4(ip)),
        _ => None,
    }
}

/// Where to reach `peer` from the outside: its STUN-mapped address and port.
pub fn public_endpoint(peer: &NetworkPeer) -> Option<SocketAddr> {
    let ip = peer.endpoint?;
    let port = match peer.public_listen_port {
        0 => peer.listen_port,
        port => port,
    };
    (port != 0).then(|| SocketAddr::new(ip, port))
}

/// Pick the endpoint for `peer`: its private address if it answers the
/// probe, otherwise its public one. `None` leaves the peer to the relay
/// topology.
pub async fn select_endpoint(peer: &NetworkPeer, probe_timeout: Duration) -> Option<SocketAddr> {
    if let Some(private) = peer.private_endpoint
        && peer.listen_port != 0
    {
        let addr = SocketAddr::new(private, peer.listen_port);
        match probe::probe(addr, &peer.public_key, probe_timeout).await {
            Ok(()) => return Some(addr),
            Err(e) => debug!(peer = %peer.public_key, %addr, error = %e, "private endpoint unreachable"),
        }
    }
    public_endpoint(peer)
}
