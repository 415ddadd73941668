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

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use ipnetwork::Ipv4Network;
use thiserror::Error;

use crate::device::{DeviceError, decode_key};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("interface {0} does not exist")]
    NoSuchInterface(String),

    #[error(transparent)]
    Key(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One WireGuard peer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<Ipv4Network>,
    pub keepalive: Option<u16>,
}

/// Everything needed to bring an interface up from nothing.
#[derive(Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub private_key: String,
    pub listen_port: u16,
    pub address: Ipv4Addr,
    /// Prefix length of the network, so the mesh CIDR routes via the link.
    pub prefix: u8,
    pub peers: Vec<PeerConfig>,
}

impl std::fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("name", &self.name)
            .field("listen_port", &self.listen_port)
            .field("address", &self.address)
            .field("prefix", &self.prefix)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

/// Live counters for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    /// `None` if the peer never completed a handshake.
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub trait Platform: Send + Sync + 'static {
    fn interface_exists(&self, name: &str) -> impl Future<Output = Result<bool, PlatformError>> + Send;

    /// Create the interface, set its key, port and peers, assign the
    /// address and bring the link up.
    fn create_interface(
        &self,
        config: &InterfaceConfig,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Removing an interface that does not exist succeeds.
    fn remove_interface(&self, name: &str) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Replace the whole peer set atomically.
    fn replace_peers(
        &self,
        name: &str,
        peers: &[PeerConfig],
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Add a peer or replace its endpoint, allowed IPs and keepalive.
    fn upsert_peer(
        &self,
        name: &str,
        peer: &PeerConfig,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn remove_peer(
        &self,
        name: &str,
        public_key: &str,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn peer_stats(&self, name: &str)
    -> impl Future<Output = Result<Vec<PeerStats>, PlatformError>> + Send;
}

// -- Route bookkeeping --

/// Routes each interface needs beyond its connected network, derived from
/// the allowed IPs of its peers. Host routes are covered by the connected
/// network or by WireGuard itself and are never tracked.
#[derive(Debug, Default)]
pub struct RouteTable {
    interfaces: BTreeMap<String, InterfaceRoutes>,
}

#[derive(Debug, Default)]
struct InterfaceRoutes {
    connected: Option<Ipv4Network>,
    peers: BTreeMap<String, Vec<Ipv4Network>>,
    installed: BTreeSet<Ipv4Network>,
}

/// What to change in the kernel to match the peer set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteChanges {
    pub add: Vec<Ipv4Network>,
    pub remove: Vec<Ipv4Network>,
}

impl RouteChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

impl RouteTable {
    /// The network the interface address already routes.
    pub fn set_connected(&mut self, iface: &str, address: Ipv4Addr, prefix: u8) {
        self.entry(iface).connected = Ipv4Network::new(address, prefix).ok();
    }

    pub fn replace_peers(&mut self, iface: &str, peers: &[PeerConfig]) -> RouteChanges {
        let entry = self.entry(iface);
        entry.peers = peers
            .iter()
            .map(|p| (p.public_key.clone(), p.allowed_ips.clone()))
            .collect();
        entry.plan()
    }

    pub fn upsert_peer(&mut self, iface: &str, peer: &PeerConfig) -> RouteChanges {
        let entry = self.entry(iface);
        entry
            .peers
            .insert(peer.public_key.clone(), peer.allowed_ips.clone());
        entry.plan()
    }

    pub fn remove_peer(&mut self, iface: &str, public_key: &str) -> RouteChanges {
        let entry = self.entry(iface);
        entry.peers.remove(public_key);
        entry.plan()
    }

    /// The kernel drops an interface's routes along with it.
    pub fn remove_interface(&mut self, iface: &str) {
        self.interfaces.remove(iface);
    }

    pub fn mark_installed(&mut self, iface: &str, net: Ipv4Network) {
        self.entry(iface).installed.insert(net);
    }

    pub fn mark_removed(&mut self, iface: &str, net: Ipv4Network) {
        if let Some(entry) = self.interfaces.get_mut(iface) {
            entry.installed.remove(&net);
        }
    }

    pub fn installed(&self, iface: &str) -> BTreeSet<Ipv4Network> {
        self.interfaces
            .get(iface)
            .map(|e| e.installed.clone())
            .unwrap_or_default()
    }

    fn entry(&mut self, iface: &str) -> &mut InterfaceRoutes {
        self.interfaces.entry(iface.to_string()).or_default()
    }
}

impl InterfaceRoutes {
    fn covered(&self, net: &Ipv4Network) -> bool {
        net.prefix() == 32
            || self
                .connected
                .is_some_and(|c| c.prefix() <= net.prefix() && c.contains(net.network()))
    }

    fn plan(&self) -> RouteChanges {
        let desired: BTreeSet<Ipv4Network> = self
            .peers
            .values()
            .flatten()
            .filter(|net| !self.covered(net))
            .copied()
            .collect();
        RouteChanges {
            add: desired.difference(&self.installed).copied().collect(),
            remove: self.installed.difference(&desired).copied().collect(),
        }
    }
}

#[cfg(target_os = "linux")]
pub type CurrentPlatform = linux::LinuxPlatform;

#[cfg(not(target_os = "linux"))]
pub type CurrentPlatform = StubPlatform;

pub fn decode_peer_key(b64: &str) -> Result<[u8; 32], PlatformError> {
    Ok(decode_key(b64)?)
}

// -- Stub platform for non-Linux --

#[derive(Debug, Default)]
pub struct StubPlatform;

impl Platform for StubPlatform {
    async fn interface_exists(&self, _name: &str) -> Result<bool, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn create_interface(&self, _config: &InterfaceConfig) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn remove_interface(&self, _name: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn replace_peers(&self, _name: &str, _peers: &[PeerConfig]) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn upsert_peer(&self, _name: &str, _peer: &PeerConfig) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn remove_peer(&self, _name: &str, _public_key: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn peer_stats(&self, _name: &str) -> Result<Vec<PeerStats>, PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::{Duration, SystemTime};

    use futures::TryStreamExt;
    use ipnetwork::Ipv4Network;
    use tracing::{debug, info, warn};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, set};

    use super::{
        InterfaceConfig, PeerConfig, PeerStats, Platform, PlatformError, RouteChanges, RouteTable,
        decode_peer_key,
    };

    #[derive(Debug, Default)]
    pub struct LinuxPlatform {
        routes: Mutex<RouteTable>,
    }

    impl LinuxPlatform {
        fn routes(&self) -> MutexGuard<'_, RouteTable> {
            self.routes.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Apply `changes`, keeping only routes the kernel accepted.
        async fn sync_routes(&self, name: &str, changes: RouteChanges) -> Result<(), PlatformError> {
            if changes.is_empty() {
                return Ok(());
            }
            let handle = connection().await?;
            let index = get_link_index(&handle, name).await?;

            for net in changes.remove {
                match handle.route().del(route_message(net, index)).execute().await {
                    Ok(()) => debug!(interface = name, route = %net, "removed route"),
                    Err(e) => debug!(interface = name, route = %net, error = %e, "route already gone"),
                }
                self.routes().mark_removed(name, net);
            }
            for net in changes.add {
                match handle.route().add(route_message(net, index)).execute().await {
                    Ok(()) => {
                        debug!(interface = name, route = %net, "added route");
                        self.routes().mark_installed(name, net);
                    }
                    Err(e) => warn!(interface = name, route = %net, error = %e, "route not added"),
                }
            }
            Ok(())
        }
    }

    fn iface_err(e: impl std::fmt::Display) -> PlatformError {
        PlatformError::Interface(e.to_string())
    }

    fn device_names() -> Result<Vec<String>, PlatformError> {
        let mut route = RouteSocket::connect().map_err(iface_err)?;
        route.list_device_names().map_err(iface_err)
    }

    impl Platform for LinuxPlatform {
        async fn interface_exists(&self, name: &str) -> Result<bool, PlatformError> {
            Ok(device_names()?.iter().any(|n| n == name))
        }

        async fn create_interface(&self, config: &InterfaceConfig) -> Result<(), PlatformError> {
            let name = config.name.as_str();
            if device_names()?.iter().any(|n| n == name) {
                debug!(interface = name, "interface already exists");
            } else {
                info!(interface = name, "creating wireguard interface");
                let mut route = RouteSocket::connect().map_err(iface_err)?;
                route.add_device(name).map_err(iface_err)?;
            }

            let private_key = decode_peer_key(&config.private_key)?;
            let owned = own_peers(&config.peers)?;
            let dev = set::Device::from_ifname(name)
                .private_key(&private_key)
                .listen_port(config.listen_port)
                .flags(vec![set::WgDeviceF::ReplacePeers])
                .peers(owned.iter().map(PeerOwned::as_set).collect());
            WgSocket::connect()
                .map_err(iface_err)?
                .set_device(dev)
                .map_err(iface_err)?;

            assign_address(name, config.address, config.prefix).await?;
            set_link_up(name).await?;
            let changes = {
                let mut routes = self.routes();
                routes.set_connected(name, config.address, config.prefix);
                routes.replace_peers(name, &config.peers)
            };
            self.sync_routes(name, changes).await?;
            info!(
                interface = name,
                listen_port = config.listen_port,
                address = %config.address,
                peer_count = config.peers.len(),
                "interface up"
            );
            Ok(())
        }

        async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
            if device_names()?.iter().any(|n| n == name) {
                info!(interface = name, "removing interface");
                let mut route = RouteSocket::connect().map_err(iface_err)?;
                route.del_device(name).map_err(iface_err)?;
            }
            self.routes().remove_interface(name);
            Ok(())
        }

        async fn replace_peers(&self, name: &str, peers: &[PeerConfig]) -> Result<(), PlatformError> {
            let owned = own_peers(peers)?;
            let dev = set::Device::from_ifname(name)
                .flags(vec![set::WgDeviceF::ReplacePeers])
                .peers(owned.iter().map(PeerOwned::as_set).collect());
            WgSocket::connect()
                .map_err(iface_err)?
                .set_device(dev)
                .map_err(iface_err)?;
            let changes = self.routes().replace_peers(name, peers);
            self.sync_routes(name, changes).await?;
            debug!(interface = name, peer_count = peers.len(), "replaced peers");
            Ok(())
        }

        async fn upsert_peer(&self, name: &str, peer: &PeerConfig) -> Result<(), PlatformError> {
            let owned = own_peers(std::slice::from_ref(peer))?;
            let dev = set::Device::from_ifname(name).peers(owned.iter().map(PeerOwned::as_set).collect());
            WgSocket::connect()
                .map_err(iface_err)?
                .set_device(dev)
                .map_err(iface_err)?;
            let changes = self.routes().upsert_peer(name, peer);
            self.sync_routes(name, changes).await?;
            debug!(interface = name, peer = %peer.public_key, "upserted peer");
            Ok(())
        }

        async fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), PlatformError> {
            let key = decode_peer_key(public_key)?;
            let peer = set::Peer::from_public_key(&key).flags(vec![set::WgPeerF::RemoveMe]);
            let dev = set::Device::from_ifname(name).peers(vec![peer]);
            WgSocket::connect()
                .map_err(iface_err)?
                .set_device(dev)
                .map_err(iface_err)?;
            let changes = self.routes().remove_peer(name, public_key);
            self.sync_routes(name, changes).await?;
            debug!(interface = name, peer = public_key, "removed peer");
            Ok(())
        }

        async fn peer_stats(&self, name: &str) -> Result<Vec<PeerStats>, PlatformError> {
            use base64::Engine;
            use base64::engine::general_purpose::STANDARD as BASE64;

            let device = WgSocket::connect()
                .map_err(iface_err)?
                .get_device(DeviceInterface::from_name(name))
                .map_err(iface_err)?;

            Ok(device
                .peers
                .iter()
                .map(|p| PeerStats {
                    public_key: BASE64.encode(p.public_key),
                    last_handshake: (p.last_handshake_time != Duration::ZERO)
                        .then(|| SystemTime::UNIX_EPOCH + p.last_handshake_time),
                    rx_bytes: p.rx_bytes,
                    tx_bytes: p.tx_bytes,
                })
                .collect())
        }
    }

    struct PeerOwned {
        key: [u8; 32],
        endpoint: Option<SocketAddr>,
        allowed_ips: Vec<(IpAddr, u8)>,
        keepalive: Option<u16>,
    }

    impl PeerOwned {
        fn as_set(&self) -> set::Peer<'_> {
            let mut peer = set::Peer::from_public_key(&self.key)
                .flags(vec![set::WgPeerF::ReplaceAllowedIps]);
            if let Some(ref ep) = self.endpoint {
                peer = peer.endpoint(ep);
            }
            if let Some(keepalive) = self.keepalive {
                peer = peer.persistent_keepalive_interval(keepalive);
            }
            let allowed: Vec<set::AllowedIp<'_>> = self
                .allowed_ips
                .iter()
                .map(|(addr, cidr)| {
                    let mut aip = set::AllowedIp::from_ipaddr(addr);
                    aip.cidr_mask = Some(*cidr);
                    aip
                })
                .collect();
            peer.allowed_ips(allowed)
        }
    }

    fn own_peers(peers: &[PeerConfig]) -> Result<Vec<PeerOwned>, PlatformError> {
        peers
            .iter()
            .map(|p| {
                Ok(PeerOwned {
                    key: decode_peer_key(&p.public_key)?,
                    endpoint: p.endpoint,
                    allowed_ips: p
                        .allowed_ips
                        .iter()
                        .map(|net| (IpAddr::V4(net.network()), net.prefix()))
                        .collect(),
                    keepalive: p.keepalive,
                })
            })
            .collect()
    }

    async fn connection() -> Result<rtnetlink::Handle, PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        Ok(handle)
    }

    async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, PlatformError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(iface_err)?
            .ok_or_else(|| PlatformError::NoSuchInterface(name.to_string()))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, address: Ipv4Addr, prefix: u8) -> Result<(), PlatformError> {
        let handle = connection().await?;
        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(iface_err)?;
        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(iface_err)?;
        }

        handle
            .address()
            .add(index, IpAddr::V4(address), prefix)
            .execute()
            .await
            .map_err(iface_err)?;
        info!(interface = name, %address, prefix, "assigned address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str) -> Result<(), PlatformError> {
        let handle = connection().await?;
        let index = get_link_index(&handle, name).await?;
        let msg = rtnetlink::LinkUnspec::new_with_index(index).up().build();
        handle.link().set(msg).execute().await.map_err(iface_err)?;
        debug!(interface = name, "set link up via netlink");
        Ok(())
    }

    fn route_message(net: Ipv4Network, index: u32) -> rtnetlink::packet_route::route::RouteMessage {
        rtnetlink::RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(net.network(), net.prefix())
            .output_interface(index)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn peer(key: &str, allowed: &[&str]) -> PeerConfig {
        PeerConfig {
            public_key: key.to_string(),
            endpoint: None,
            allowed_ips: allowed.iter().map(|s| net(s)).collect(),
            keepalive: None,
        }
    }

    fn apply(table: &mut RouteTable, changes: RouteChanges) {
        for n in changes.remove {
            table.mark_removed("wm0", n);
        }
        for n in changes.add {
            table.mark_installed("wm0", n);
        }
    }

    #[test]
    fn connected_network_and_host_routes_are_skipped() {
        let mut table = RouteTable::default();
        table.set_connected("wm0", Ipv4Addr::new(10, 0, 0, 1), 24);
        let changes = table.replace_peers("wm0", &[peer("relay", &["10.0.0.0/24", "10.0.0.2/32"])]);
        assert!(changes.is_empty());
    }

    #[test]
    fn stale_subnet_routes_are_withdrawn() {
        let mut table = RouteTable::default();
        table.set_connected("wm0", Ipv4Addr::new(10, 0, 0, 1), 24);

        let changes = table.replace_peers("wm0", &[peer("a", &["10.0.0.2/32", "192.168.1.0/24"])]);
        assert_eq!(changes.add, vec![net("192.168.1.0/24")]);
        apply(&mut table, changes);

        let changes = table.upsert_peer("wm0", &peer("a", &["10.0.0.2/32"]));
        assert_eq!(changes.remove, vec![net("192.168.1.0/24")]);
        apply(&mut table, changes);
        assert!(table.installed("wm0").is_empty());
    }

    #[test]
    fn shared_route_survives_until_last_peer_leaves() {
        let mut table = RouteTable::default();
        let changes = table.replace_peers(
            "wm0",
            &[peer("a", &["172.30.0.0/24"]), peer("b", &["172.30.0.0/24"])],
        );
        apply(&mut table, changes);

        assert!(table.remove_peer("wm0", "a").is_empty());
        let changes = table.remove_peer("wm0", "b");
        assert_eq!(changes.remove, vec![net("172.30.0.0/24")]);
    }
}
