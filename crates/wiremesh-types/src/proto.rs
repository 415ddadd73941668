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

//! Payloads exchanged over the bus.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::model::{ConnectivitySample, Network, NetworkPeer, Peer};

/// What happened to a network's topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// A peer joined.
    AddPeer,
    /// A peer left or was removed.
    DeletePeer,
    /// A peer's endpoint, ports or flags changed.
    UpdatePeer,
    /// A peer became a relay for some others.
    AddRelay,
    /// A peer stopped relaying.
    DeleteRelay,
    /// The network itself was deleted.
    DeleteNetwork,
}

impl Action {
    /// Relay changes always force receivers to rebuild the full peer set.
    pub fn forces_reset(self) -> bool {
        matches!(self, Self::AddRelay | Self::DeleteRelay)
    }
}

/// Broadcast on `networks.<name>` whenever the topology changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// What changed.
    pub action: Action,
    /// Network the event applies to.
    pub network: String,
    /// The affected member's full record. Absent for `DeleteNetwork`.
    pub peer: Option<NetworkPeer>,
}

/// Envelope for every request/reply response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request succeeded.
    Ok(T),
    /// The request was rejected.
    Err(MeshError),
}

impl<T> Reply<T> {
    /// Convert to a standard result.
    pub fn into_result(self) -> Result<T, MeshError> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }
}

impl<T> From<Result<T, MeshError>> for Reply<T> {
    fn from(result: Result<T, MeshError>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(e),
        }
    }
}

/// Published on `register` by a device holding an invitation token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Invitation token.
    pub token: String,
    /// WireGuard public key.
    pub public_key: String,
    /// Bus signing public key.
    pub signing_key: String,
    /// Device hostname.
    pub hostname: String,
    /// Device operating system.
    pub os: String,
    /// Agent version.
    pub version: String,
    /// Public endpoint, if already known.
    pub endpoint: Option<IpAddr>,
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The stored peer record.
    pub peer: Peer,
}

/// Periodic liveness report on `<pubkey>.checkin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinRequest {
    /// Currently known public endpoint.
    pub endpoint: Option<IpAddr>,
    /// Agent version.
    pub version: String,
    /// One sample per running network.
    #[serde(default)]
    pub samples: Vec<ConnectivitySample>,
}

/// Answer to a checkin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinResponse {
    /// Networks the server believes the device belongs to.
    pub networks: Vec<String>,
}

/// Request on `<pubkey>.join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Network to join.
    pub network: String,
    /// Local WireGuard listen port.
    pub listen_port: u16,
    /// STUN-mapped listen port.
    pub public_listen_port: u16,
    /// STUN-discovered public address.
    pub endpoint: Option<IpAddr>,
    /// LAN address to advertise for same-network peers.
    pub private_endpoint: Option<IpAddr>,
    /// Hostname to show in listings.
    pub hostname: String,
}

/// Request on `<pubkey>.leave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// Network to leave.
    pub network: String,
}

/// Request on `<pubkey>.updatePorts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePortsRequest {
    /// Network the interface belongs to.
    pub network: String,
    /// Local WireGuard listen port.
    pub listen_port: u16,
    /// STUN-mapped listen port.
    pub public_listen_port: u16,
    /// STUN-discovered public address.
    pub endpoint: Option<IpAddr>,
    /// LAN address.
    pub private_endpoint: Option<IpAddr>,
}

/// Full snapshot returned by `<pubkey>.reload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadResponse {
    /// Every network the device belongs to.
    pub networks: Vec<Network>,
}

/// Empty request/response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Server-to-one-device instructions on `update.<pubkey>.<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectUpdate {
    /// You joined this network; bring up its interface.
    Join {
        /// Snapshot including the device's own record.
        network: Network,
    },
    /// Re-run endpoint discovery for this network and report the result.
    ListenPort {
        /// Network whose ports should be refreshed.
        network: String,
    },
    /// Start routing a subnet.
    AddSubnetRouter {
        /// Network the router belongs to.
        network: String,
        /// Real subnet behind the router.
        subnet: Ipv4Network,
        /// Virtual subnet mapped 1:1 onto `subnet`.
        virt_subnet: Option<Ipv4Network>,
        /// Masquerade outbound traffic.
        use_nat: bool,
    },
    /// Stop routing a subnet.
    DeleteSubnetRouter {
        /// Network the router belongs to.
        network: String,
        /// Real subnet behind the router.
        subnet: Ipv4Network,
        /// Virtual subnet that was mapped.
        virt_subnet: Option<Ipv4Network>,
        /// Whether masquerading was in use.
        use_nat: bool,
    },
}

impl DirectUpdate {
    /// The subject suffix this update is sent under.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::ListenPort { .. } => "listenPort",
            Self::AddSubnetRouter { .. } => "addSubnetRouter",
            Self::DeleteSubnetRouter { .. } => "deleteSubnetRouter",
        }
    }

    /// The network this update concerns.
    pub fn network(&self) -> &str {
        match self {
            Self::Join { network } => &network.name,
            Self::ListenPort { network }
            | Self::AddSubnetRouter { network, .. }
            | Self::DeleteSubnetRouter { network, .. } => network,
        }
    }
}

/// Admin request on `admin.createNetwork`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    /// Network name.
    pub name: String,
    /// IPv4 CIDR, e.g. `10.0.0.0/24`.
    pub cidr: String,
}

/// Admin request on `admin.deleteNetwork`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNetworkRequest {
    /// Network name.
    pub name: String,
}

/// Admin request on `admin.createInvite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInviteRequest {
    /// How many registrations the token admits.
    pub uses: u32,
    /// Lifetime in seconds; `None` never expires.
    pub ttl_secs: Option<i64>,
}

/// Answer to `admin.createInvite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInviteResponse {
    /// The token to hand to a new device.
    pub token: String,
}

/// Admin request on `admin.addRelay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddRelayRequest {
    /// Network name.
    pub network: String,
    /// Key of the relay.
    pub relay: String,
    /// Keys the relay will carry.
    pub relayed: BTreeSet<String>,
}

/// Admin request on `admin.deleteRelay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRelayRequest {
    /// Network name.
    pub network: String,
    /// Key of the relay.
    pub relay: String,
}

/// Admin request on `admin.addSubnetRouter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddSubnetRouterRequest {
    /// Network name.
    pub network: String,
    /// Key of the router.
    pub public_key: String,
    /// Real subnet behind the router.
    pub subnet: Ipv4Network,
    /// Optional virtual subnet; must have the same prefix length.
    pub virt_subnet: Option<Ipv4Network>,
    /// Masquerade outbound traffic.
    pub use_nat: bool,
}

/// Admin request on `admin.deleteSubnetRouter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSubnetRouterRequest {
    /// Network name.
    pub network: String,
    /// Key of the router.
    pub public_key: String,
}

/// Answer to `admin.listNetworks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListNetworksResponse {
    /// All networks.
    pub networks: Vec<Network>,
}
