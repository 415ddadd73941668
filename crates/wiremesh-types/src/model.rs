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

//! Records persisted by the server and mirrored by agents.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Length of a base64-encoded WireGuard public key.
///
/// Subject parsing relies on this being fixed.
pub const KEY_LEN: usize = 44;

/// Whether `key` looks like a padded base64 WireGuard key.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_LEN
        && key.ends_with('=')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// The server's view of a registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// WireGuard public key; primary key.
    pub public_key: String,
    /// Public half of the device's bus signing key.
    pub signing_key: String,
    /// Reported hostname.
    pub hostname: String,
    /// Reported operating system.
    pub os: String,
    /// Reported agent version.
    pub version: String,
    /// Last public endpoint seen on checkin.
    pub endpoint: Option<IpAddr>,
    /// Whether the device checked in recently.
    pub connected: bool,
    /// Last checkin time.
    pub last_seen: DateTime<Utc>,
}

/// A single connectivity report for one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivitySample {
    /// Network the sample belongs to.
    pub network: String,
    /// Fraction of peers with a fresh handshake, 0.0 to 1.0.
    pub score: f64,
}

/// A device's membership record within one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPeer {
    /// WireGuard public key of the member.
    pub public_key: String,
    /// Hostname at join time, for display.
    #[serde(default)]
    pub hostname: String,
    /// Address assigned inside the network CIDR.
    pub address: Ipv4Addr,
    /// Local WireGuard listen port.
    pub listen_port: u16,
    /// Listen port as seen from outside the NAT.
    pub public_listen_port: u16,
    /// Public (STUN-discovered) address.
    pub endpoint: Option<IpAddr>,
    /// LAN address, if the device advertises one.
    pub private_endpoint: Option<IpAddr>,
    /// Fraction of recent handshakes within the freshness window.
    #[serde(default)]
    pub connectivity: f64,
    /// Carries traffic for the peers in `relayed_peers`.
    #[serde(default)]
    pub is_relay: bool,
    /// Keys this relay carries.
    #[serde(default)]
    pub relayed_peers: BTreeSet<String>,
    /// Derived: some other peer relays this one.
    #[serde(default)]
    pub is_relayed: bool,
    /// Advertises a route to `subnet` (or `virt_subnet`).
    #[serde(default)]
    pub is_subnet_router: bool,
    /// Masquerade traffic leaving into the subnet.
    #[serde(default)]
    pub use_nat: bool,
    /// Advertise `virt_subnet` and map it 1:1 onto `subnet`.
    #[serde(default)]
    pub use_virt_subnet: bool,
    /// The routed subnet.
    #[serde(default)]
    pub subnet: Option<Ipv4Network>,
    /// The virtual subnet mapped onto `subnet`.
    #[serde(default)]
    pub virt_subnet: Option<Ipv4Network>,
}

impl NetworkPeer {
    /// A fresh member with no topology flags set.
    pub fn new(public_key: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            public_key: public_key.into(),
            hostname: String::new(),
            address,
            listen_port: 0,
            public_listen_port: 0,
            endpoint: None,
            private_endpoint: None,
            connectivity: 0.0,
            is_relay: false,
            relayed_peers: BTreeSet::new(),
            is_relayed: false,
            is_subnet_router: false,
            use_nat: false,
            use_virt_subnet: false,
            subnet: None,
            virt_subnet: None,
        }
    }

    /// The `/32` route for this peer's mesh address.
    pub fn host_route(&self) -> Ipv4Network {
        Ipv4Network::from(self.address)
    }

    /// The subnet this peer advertises, if it is a subnet router.
    pub fn advertised_subnet(&self) -> Option<Ipv4Network> {
        if !self.is_subnet_router {
            return None;
        }
        if self.use_virt_subnet {
            self.virt_subnet
        } else {
            self.subnet
        }
    }

    /// Whether `other` differs from `self` in anything that changes the
    /// shape of the mesh rather than a single edge.
    pub fn routing_differs(&self, other: &NetworkPeer) -> bool {
        self.is_relay != other.is_relay
            || self.relayed_peers != other.relayed_peers
            || self.is_relayed != other.is_relayed
            || self.is_subnet_router != other.is_subnet_router
            || self.use_nat != other.use_nat
            || self.use_virt_subnet != other.use_virt_subnet
            || self.subnet != other.subnet
            || self.virt_subnet != other.virt_subnet
            || self.address != other.address
    }

    /// Whether this peer carries any relay or subnet-router role.
    pub fn has_routing_role(&self) -> bool {
        self.is_relay || self.is_relayed || self.is_subnet_router
    }
}

/// A named mesh network and its ordered member list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Unique name; also the last token of its broadcast subject.
    pub name: String,
    /// Address range members are allocated from.
    pub cidr: Ipv4Network,
    /// Members in join order.
    #[serde(default)]
    pub peers: Vec<NetworkPeer>,
}

impl Network {
    /// An empty network.
    pub fn new(name: impl Into<String>, cidr: Ipv4Network) -> Self {
        Self {
            name: name.into(),
            cidr,
            peers: Vec::new(),
        }
    }

    /// Look up a member by key.
    pub fn peer(&self, key: &str) -> Option<&NetworkPeer> {
        self.peers.iter().find(|p| p.public_key == key)
    }

    /// Look up a member by key, mutably.
    pub fn peer_mut(&mut self, key: &str) -> Option<&mut NetworkPeer> {
        self.peers.iter_mut().find(|p| p.public_key == key)
    }

    /// Whether `key` is a member.
    pub fn contains(&self, key: &str) -> bool {
        self.peer(key).is_some()
    }

    /// Insert or replace a member, keeping its position if it already
    /// existed. Returns the replaced record.
    pub fn upsert_peer(&mut self, peer: NetworkPeer) -> Option<NetworkPeer> {
        match self.peer_mut(&peer.public_key) {
            Some(existing) => Some(std::mem::replace(existing, peer)),
            None => {
                self.peers.push(peer);
                None
            }
        }
    }

    /// Remove a member by key.
    pub fn remove_peer(&mut self, key: &str) -> Option<NetworkPeer> {
        let idx = self.peers.iter().position(|p| p.public_key == key)?;
        Some(self.peers.remove(idx))
    }
}

/// Whether network name `name` is safe to embed in a subject.
pub fn is_valid_network_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
}
