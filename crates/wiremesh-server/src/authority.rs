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

//! The membership authority.
//!
//! Owns every Peer, Network and Invite record. Each read-modify-write of a
//! network runs under that network's lock, and events for a network are
//! published while the lock is held, so members observe mutations in the
//! order they were persisted.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use wiremesh_bus::identity::decode_verifying_key;
use wiremesh_bus::{Broker, LocalConnection, Permissions, publish_json};
use wiremesh_store::KvStore;
use wiremesh_types::proto::{
    AddRelayRequest, AddSubnetRouterRequest, CheckinRequest, CheckinResponse,
    CreateInviteRequest, CreateInviteResponse, CreateNetworkRequest, DeleteRelayRequest,
    DeleteSubnetRouterRequest, JoinRequest, RegisterRequest, RegisterResponse, ReloadResponse,
    UpdatePortsRequest,
};
use wiremesh_types::subject::{
    ALL_NETWORKS, network_subject, peer_namespace, update_namespace, update_subject,
};
use wiremesh_types::{
    Action, DirectUpdate, MeshError, Network, NetworkEvent, NetworkPeer, Peer, is_valid_key,
    is_valid_network_name, topology,
};

use crate::allocator;
use crate::error::AuthorityError;
use crate::records::Records;
use crate::tokens::{self, Invite};

type Result<T> = std::result::Result<T, AuthorityError>;

/// Smallest network that still has two usable addresses.
const MAX_PREFIX: u8 = 30;

#[derive(Default)]
struct LockMap(DashMap<String, Arc<Mutex<()>>>);

impl LockMap {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.0.entry(key.to_string()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for `key` unless someone holds or waits on it.
    fn prune(&self, key: &str) {
        self.0.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Bus permissions for an admitted device.
pub fn device_permissions(key: &str) -> Permissions {
    Permissions {
        publish: vec![peer_namespace(key)],
        subscribe: vec![ALL_NETWORKS.to_string(), update_namespace(key)],
    }
}

pub struct Authority<S> {
    records: Records<S>,
    broker: Broker,
    bus: LocalConnection,
    network_locks: LockMap,
    peer_locks: LockMap,
    register_lock: Mutex<()>,
    invite_lock: Mutex<()>,
}

impl<S: KvStore> Authority<S> {
    /// `bus` is the server's own connection to `broker`, used to publish.
    pub fn new(store: S, broker: Broker, bus: LocalConnection) -> Self {
        Self {
            records: Records::new(store),
            broker,
            bus,
            network_locks: LockMap::default(),
            peer_locks: LockMap::default(),
            register_lock: Mutex::new(()),
            invite_lock: Mutex::new(()),
        }
    }

    pub fn records(&self) -> &Records<S> {
        &self.records
    }

    /// Reinstall the bus identity of every registered peer.
    pub async fn restore_identities(&self) -> Result<usize> {
        let peers = self.records.list_peers().await?;
        for peer in &peers {
            self.broker
                .authorize(&peer.signing_key, device_permissions(&peer.public_key));
        }
        info!(count = peers.len(), "restored device identities");
        Ok(peers.len())
    }

    // -- Publishing ----------------------------------------------------------

    async fn broadcast(&self, network: &str, action: Action, peer: Option<&NetworkPeer>) {
        let event = NetworkEvent {
            action,
            network: network.to_string(),
            peer: peer.cloned(),
        };
        match publish_json(&self.bus, &network_subject(network), &event).await {
            Ok(()) => debug!(network, ?action, "broadcast network event"),
            Err(e) => warn!(network, ?action, error = %e, "failed to broadcast network event"),
        }
    }

    /// Broadcast `UpdatePeer` for each of `keys` still in `network`.
    async fn broadcast_updates<'a>(&self, network: &Network, keys: impl IntoIterator<Item = &'a String>) {
        let keys: BTreeSet<&String> = keys.into_iter().collect();
        for key in keys {
            if let Some(peer) = network.peer(key) {
                self.broadcast(&network.name, Action::UpdatePeer, Some(peer))
                    .await;
            }
        }
    }

    async fn notify(&self, key: &str, update: DirectUpdate) {
        let subject = update_subject(key, update.action());
        if let Err(e) = publish_json(&self.bus, &subject, &update).await {
            warn!(peer = key, action = update.action(), error = %e, "failed to send direct update");
        }
    }

    /// Lock `name` and load it. Names that do not exist never keep a lock
    /// entry.
    async fn lock_network(&self, name: &str) -> Result<(OwnedMutexGuard<()>, Network)> {
        if !is_valid_network_name(name) || self.records.get_network(name).await?.is_none() {
            return Err(MeshError::NetworkNotFound.into());
        }
        let guard = self.network_locks.lock(name).await;
        match self.records.get_network(name).await? {
            Some(network) => Ok((guard, network)),
            None => {
                drop(guard);
                self.network_locks.prune(name);
                Err(MeshError::NetworkNotFound.into())
            }
        }
    }

    /// Number of networks with a lock entry.
    pub fn network_lock_count(&self) -> usize {
        self.network_locks.len()
    }

    async fn require_peer(&self, key: &str) -> Result<Peer> {
        Ok(self
            .records
            .get_peer(key)
            .await?
            .ok_or(MeshError::PeerNotFound)?)
    }

    // -- Device operations ---------------------------------------------------

    #[tracing::instrument(skip(self, req), fields(peer = %req.public_key, hostname = %req.hostname))]
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        if !is_valid_key(&req.public_key) {
            return Err(MeshError::InvalidRequest("malformed public key".into()).into());
        }
        decode_verifying_key(&req.signing_key)
            .map_err(|_| MeshError::InvalidRequest("malformed signing key".into()))?;
        if !tokens::is_well_formed(&req.token) {
            return Err(MeshError::InvalidToken.into());
        }

        let _registering = self.register_lock.lock().await;
        let _guard = self.peer_locks.lock(&req.public_key).await;
        if self.records.get_peer(&req.public_key).await?.is_some() {
            return Err(MeshError::DuplicatePeer.into());
        }
        if self.signing_key_in_use(&req.signing_key).await? {
            warn!("signing key already bound to another peer");
            return Err(MeshError::DuplicatePeer.into());
        }
        self.redeem_invite(&req.token).await?;

        let peer = Peer {
            public_key: req.public_key,
            signing_key: req.signing_key,
            hostname: req.hostname,
            os: req.os,
            version: req.version,
            endpoint: req.endpoint,
            connected: true,
            last_seen: Utc::now(),
        };
        self.records.put_peer(&peer).await?;
        self.broker
            .authorize(&peer.signing_key, device_permissions(&peer.public_key));

        info!(os = %peer.os, version = %peer.version, "registered peer");
        Ok(RegisterResponse { peer })
    }

    async fn signing_key_in_use(&self, signing_key: &str) -> Result<bool> {
        Ok(self
            .records
            .list_peers()
            .await?
            .iter()
            .any(|peer| peer.signing_key == signing_key))
    }

    async fn redeem_invite(&self, token: &str) -> Result<()> {
        let _guard = self.invite_lock.lock().await;
        let mut invite = self
            .records
            .get_invite(token)
            .await?
            .ok_or(MeshError::InvalidToken)?;

        if let Err(e) = invite.consume(Utc::now()) {
            self.records.delete_invite(token).await?;
            return Err(e.into());
        }
        if invite.uses_left == 0 {
            self.records.delete_invite(token).await?;
        } else {
            self.records.put_invite(&invite).await?;
        }
        debug!(uses_left = invite.uses_left, "redeemed invite");
        Ok(())
    }

    /// Admit `key` into a network, allocating its address.
    ///
    /// The new member is sent a `join` snapshot on its private subject
    /// before `AddPeer` goes out to the network.
    #[tracing::instrument(skip(self, req), fields(network = %req.network))]
    pub async fn join(&self, key: &str, req: JoinRequest) -> Result<NetworkPeer> {
        self.require_peer(key).await?;

        let (_guard, mut network) = self.lock_network(&req.network).await?;
        if network.contains(key) {
            return Err(MeshError::AlreadyMember.into());
        }

        let address = allocator::allocate(&network)?;
        let mut member = NetworkPeer::new(key, address);
        member.hostname = req.hostname;
        member.listen_port = req.listen_port;
        member.public_listen_port = req.public_listen_port;
        member.endpoint = req.endpoint;
        member.private_endpoint = req.private_endpoint;

        network.peers.push(member.clone());
        self.records.put_network(&network).await?;
        info!(%address, "peer joined network");

        self.notify(key, DirectUpdate::Join {
            network: network.clone(),
        })
        .await;
        self.broadcast(&network.name, Action::AddPeer, Some(&member))
            .await;
        Ok(member)
    }

    #[tracing::instrument(skip(self))]
    pub async fn leave(&self, key: &str, network: &str) -> Result<NetworkPeer> {
        let (_guard, mut network) = self.lock_network(network).await?;
        self.remove_member(&mut network, key).await
    }

    /// Remove `key` from `network` and drop it from any relay set. The
    /// caller holds the network's lock.
    async fn remove_member(&self, network: &mut Network, key: &str) -> Result<NetworkPeer> {
        let removed = network.remove_peer(key).ok_or(MeshError::NotMember)?;

        let mut touched = Vec::new();
        for relay in &mut network.peers {
            if relay.relayed_peers.remove(key) {
                touched.push(relay.public_key.clone());
            }
        }
        touched.extend(topology::recompute_relayed(network));

        self.records.put_network(network).await?;
        info!(network = %network.name, peer = key, address = %removed.address, "peer left network");

        self.broadcast(&network.name, Action::DeletePeer, Some(&removed))
            .await;
        self.broadcast_updates(network, &touched).await;
        Ok(removed)
    }

    /// Record liveness, fold in connectivity samples and propagate an
    /// endpoint change to every network the peer is in.
    #[tracing::instrument(skip(self, req), fields(endpoint = ?req.endpoint, samples = req.samples.len()))]
    pub async fn checkin(&self, key: &str, req: CheckinRequest) -> Result<CheckinResponse> {
        let _guard = self.peer_locks.lock(key).await;
        let mut peer = self.require_peer(key).await?;

        if req.endpoint.is_some() && req.endpoint != peer.endpoint {
            info!(old = ?peer.endpoint, new = ?req.endpoint, "peer endpoint changed");
            peer.endpoint = req.endpoint;
        }
        peer.version = req.version;
        peer.connected = true;
        peer.last_seen = Utc::now();
        self.records.put_peer(&peer).await?;

        let mut names = Vec::new();
        for network in self.records.networks_of(key).await? {
            let score = req
                .samples
                .iter()
                .rev()
                .find(|s| s.network == network.name)
                .map(|s| s.score)
                .filter(|s| s.is_finite());
            if req.endpoint.is_some() || score.is_some() {
                self.refresh_member(&network.name, key, req.endpoint, score)
                    .await?;
            }
            names.push(network.name);
        }
        Ok(CheckinResponse { networks: names })
    }

    async fn refresh_member(
        &self,
        network: &str,
        key: &str,
        endpoint: Option<IpAddr>,
        score: Option<f64>,
    ) -> Result<()> {
        let _guard = self.network_locks.lock(network).await;
        let Some(mut network) = self.records.get_network(network).await? else {
            return Ok(());
        };
        let Some(member) = network.peer_mut(key) else {
            return Ok(());
        };

        let moved = endpoint.is_some() && member.endpoint != endpoint;
        if moved {
            member.endpoint = endpoint;
        }
        if let Some(score) = score {
            member.connectivity = score.clamp(0.0, 1.0);
        }
        let snapshot = member.clone();
        self.records.put_network(&network).await?;

        if moved {
            self.broadcast(&network.name, Action::UpdatePeer, Some(&snapshot))
                .await;
        }
        Ok(())
    }

    /// Remove the peer from every network and forget it.
    ///
    /// Its bus identity is left in place so the caller can still answer
    /// on the peer's inbox; call [`Authority::revoke`] afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn leave_server(&self, key: &str) -> Result<Peer> {
        let _peer_guard = self.peer_locks.lock(key).await;
        let peer = self.require_peer(key).await?;

        for candidate in self.records.networks_of(key).await? {
            let _guard = self.network_locks.lock(&candidate.name).await;
            let Some(mut network) = self.records.get_network(&candidate.name).await? else {
                continue;
            };
            if network.contains(key) {
                self.remove_member(&mut network, key).await?;
            }
        }

        self.records.delete_peer(key).await?;
        info!("peer left server");
        Ok(peer)
    }

    pub fn revoke(&self, peer: &Peer) {
        self.broker.revoke(&peer.signing_key);
    }

    #[tracing::instrument(skip(self))]
    pub async fn reload(&self, key: &str) -> Result<ReloadResponse> {
        self.require_peer(key).await?;
        let networks = self.records.networks_of(key).await?;
        debug!(networks = networks.len(), "serving reload");
        Ok(ReloadResponse { networks })
    }

    /// Record new ports or endpoints for one membership.
    #[tracing::instrument(skip(self, req), fields(network = %req.network, listen_port = req.listen_port, public_listen_port = req.public_listen_port))]
    pub async fn update_ports(&self, key: &str, req: UpdatePortsRequest) -> Result<NetworkPeer> {
        let (_guard, mut network) = self.lock_network(&req.network).await?;
        let member = network.peer_mut(key).ok_or(MeshError::NotMember)?;

        let before = member.clone();
        member.listen_port = req.listen_port;
        member.public_listen_port = req.public_listen_port;
        if req.endpoint.is_some() {
            member.endpoint = req.endpoint;
        }
        member.private_endpoint = req.private_endpoint;
        let updated = member.clone();

        if updated != before {
            self.records.put_network(&network).await?;
            info!("updated member ports");
            self.broadcast(&network.name, Action::UpdatePeer, Some(&updated))
                .await;
        }
        Ok(updated)
    }

    // -- Admin operations ----------------------------------------------------

    #[tracing::instrument(skip(self, req), fields(network = %req.name, cidr = %req.cidr))]
    pub async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network> {
        if !is_valid_network_name(&req.name) {
            return Err(MeshError::InvalidRequest(format!("invalid network name {:?}", req.name)).into());
        }
        let cidr: Ipv4Network = req
            .cidr
            .parse()
            .map_err(|_| MeshError::InvalidRequest(format!("invalid IPv4 CIDR {:?}", req.cidr)))?;
        if cidr.prefix() > MAX_PREFIX {
            return Err(MeshError::InvalidRequest(format!("{cidr} has no room for peers")).into());
        }
        let cidr = Ipv4Network::new(cidr.network(), cidr.prefix())
            .map_err(|e| MeshError::InvalidRequest(e.to_string()))?;

        let _guard = self.network_locks.lock(&req.name).await;
        if self.records.get_network(&req.name).await?.is_some() {
            return Err(MeshError::DuplicateNetwork.into());
        }
        let network = Network::new(req.name, cidr);
        self.records.put_network(&network).await?;
        info!("created network");
        Ok(network)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_network(&self, name: &str) -> Result<Network> {
        let (guard, network) = self.lock_network(name).await?;
        self.records.delete_network(name).await?;
        info!(members = network.peers.len(), "deleted network");
        self.broadcast(name, Action::DeleteNetwork, None).await;
        drop(guard);
        self.network_locks.prune(name);
        Ok(network)
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_invite(&self, req: CreateInviteRequest) -> Result<CreateInviteResponse> {
        if req.uses == 0 {
            return Err(MeshError::InvalidRequest("an invite needs at least one use".into()).into());
        }
        let ttl = match req.ttl_secs {
            Some(secs) if secs <= 0 => {
                return Err(MeshError::InvalidRequest("ttl must be positive".into()).into());
            }
            Some(secs) => Some(
                chrono::Duration::try_seconds(secs)
                    .ok_or_else(|| MeshError::InvalidRequest("ttl out of range".into()))?,
            ),
            None => None,
        };

        let invite = Invite::new(req.uses, ttl, Utc::now());
        self.records.put_invite(&invite).await?;
        info!(expires_at = ?invite.expires_at, "created invite");
        Ok(CreateInviteResponse {
            token: invite.token,
        })
    }

    /// Make `relay` carry `relayed` in addition to anything it already
    /// carries.
    #[tracing::instrument(skip(self, req), fields(network = %req.network, relay = %req.relay, relayed = req.relayed.len()))]
    pub async fn add_relay(&self, req: AddRelayRequest) -> Result<NetworkPeer> {
        let (_guard, mut network) = self.lock_network(&req.network).await?;
        topology::validate_relay(&network, &req.relay, &req.relayed)?;

        let relay = network
            .peer_mut(&req.relay)
            .ok_or(MeshError::NotMember)?;
        relay.is_relay = true;
        relay.relayed_peers.extend(req.relayed.iter().cloned());
        let changed = topology::recompute_relayed(&mut network);
        let relay = network
            .peer(&req.relay)
            .cloned()
            .ok_or(MeshError::NotMember)?;

        self.records.put_network(&network).await?;
        info!(changed = changed.len(), "assigned relay");

        self.broadcast(&network.name, Action::AddRelay, Some(&relay))
            .await;
        self.broadcast_updates(&network, &changed).await;
        for key in std::iter::once(&req.relay).chain(&req.relayed) {
            self.notify(key, DirectUpdate::ListenPort {
                network: network.name.clone(),
            })
            .await;
        }
        Ok(relay)
    }

    #[tracing::instrument(skip(self, req), fields(network = %req.network, relay = %req.relay))]
    pub async fn delete_relay(&self, req: DeleteRelayRequest) -> Result<NetworkPeer> {
        let (_guard, mut network) = self.lock_network(&req.network).await?;

        let relay = network
            .peer_mut(&req.relay)
            .ok_or(MeshError::NotMember)?;
        if !relay.is_relay {
            return Err(MeshError::InvalidRequest(format!("{} is not a relay", req.relay)).into());
        }
        relay.is_relay = false;
        let former = std::mem::take(&mut relay.relayed_peers);
        let changed = topology::recompute_relayed(&mut network);
        let relay = network
            .peer(&req.relay)
            .cloned()
            .ok_or(MeshError::NotMember)?;

        self.records.put_network(&network).await?;
        info!(released = former.len(), "removed relay");

        self.broadcast(&network.name, Action::DeleteRelay, Some(&relay))
            .await;
        self.broadcast_updates(&network, &changed).await;
        for key in std::iter::once(&req.relay).chain(&former) {
            if network.contains(key) {
                self.notify(key, DirectUpdate::ListenPort {
                    network: network.name.clone(),
                })
                .await;
            }
        }
        Ok(relay)
    }

    #[tracing::instrument(skip(self, req), fields(network = %req.network, peer = %req.public_key, subnet = %req.subnet))]
    pub async fn add_subnet_router(&self, req: AddSubnetRouterRequest) -> Result<NetworkPeer> {
        let subnet = normalize(req.subnet)?;
        let virt_subnet = req.virt_subnet.map(normalize).transpose()?;

        let (_guard, mut network) = self.lock_network(&req.network).await?;
        topology::validate_subnet_router(&network, &req.public_key, subnet, virt_subnet)?;

        let member = network
            .peer_mut(&req.public_key)
            .ok_or(MeshError::NotMember)?;
        let previous = subnet_update(member, &req.network, false);
        member.is_subnet_router = true;
        member.subnet = Some(subnet);
        member.virt_subnet = virt_subnet;
        member.use_virt_subnet = virt_subnet.is_some();
        member.use_nat = req.use_nat;
        let updated = member.clone();

        self.records.put_network(&network).await?;
        info!(virt_subnet = ?virt_subnet, use_nat = req.use_nat, "assigned subnet router");

        self.broadcast(&network.name, Action::UpdatePeer, Some(&updated))
            .await;
        if let Some(previous) = previous {
            self.notify(&req.public_key, previous).await;
        }
        if let Some(add) = subnet_update(&updated, &network.name, true) {
            self.notify(&req.public_key, add).await;
        }
        Ok(updated)
    }

    #[tracing::instrument(skip(self, req), fields(network = %req.network, peer = %req.public_key))]
    pub async fn delete_subnet_router(&self, req: DeleteSubnetRouterRequest) -> Result<NetworkPeer> {
        let (_guard, mut network) = self.lock_network(&req.network).await?;

        let member = network
            .peer_mut(&req.public_key)
            .ok_or(MeshError::NotMember)?;
        let removal = subnet_update(member, &req.network, false).ok_or_else(|| {
            MeshError::InvalidRequest(format!("{} is not a subnet router", req.public_key))
        })?;
        member.is_subnet_router = false;
        member.use_nat = false;
        member.use_virt_subnet = false;
        member.subnet = None;
        member.virt_subnet = None;
        let updated = member.clone();

        self.records.put_network(&network).await?;
        info!("removed subnet router");

        self.broadcast(&network.name, Action::UpdatePeer, Some(&updated))
            .await;
        self.notify(&req.public_key, removal).await;
        Ok(updated)
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.records.list_networks().await?)
    }

    // -- Housekeeping --------------------------------------------------------

    /// Mark peers that have not checked in since `now - stale_after` as
    /// disconnected. Returns how many were marked.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> Result<usize> {
        let cutoff = now - stale_after;
        let mut swept = 0;
        for candidate in self.records.list_peers().await? {
            if !candidate.connected || candidate.last_seen > cutoff {
                continue;
            }
            let _guard = self.peer_locks.lock(&candidate.public_key).await;
            let Some(mut peer) = self.records.get_peer(&candidate.public_key).await? else {
                continue;
            };
            if !peer.connected || peer.last_seen > cutoff {
                continue;
            }
            peer.connected = false;
            self.records.put_peer(&peer).await?;
            info!(peer = %peer.public_key, last_seen = %peer.last_seen, "marked peer disconnected");
            swept += 1;
        }
        Ok(swept)
    }
}

fn normalize(net: Ipv4Network) -> std::result::Result<Ipv4Network, MeshError> {
    Ipv4Network::new(net.network(), net.prefix()).map_err(|e| MeshError::InvalidRequest(e.to_string()))
}

/// The direct update that installs (`add`) or removes the subnet-router
/// rules `member` currently carries, if it is a router.
fn subnet_update(member: &NetworkPeer, network: &str, add: bool) -> Option<DirectUpdate> {
    if !member.is_subnet_router {
        return None;
    }
    let subnet = member.subnet?;
    let network = network.to_string();
    let virt_subnet = member.use_virt_subnet.then_some(member.virt_subnet).flatten();
    let use_nat = member.use_nat;
    Some(if add {
        DirectUpdate::AddSubnetRouter {
            network,
            subnet,
            virt_subnet,
            use_nat,
        }
    } else {
        DirectUpdate::DeleteSubnetRouter {
            network,
            subnet,
            virt_subnet,
            use_nat,
        }
    })
}
