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

//! Turns network snapshots and topology events into WireGuard state for one
//! network's interface.
//!
//! An interface moves `Absent → Starting → Running ⇄ Resetting → TornDown`.
//! Single-peer events are patched in place; anything that changes relay or
//! subnet-router flags rebuilds the whole peer set from the topology
//! transform instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use ipnetwork::Ipv4Network;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wiremesh_store::KvStore;
use wiremesh_types::proto::UpdatePortsRequest;
use wiremesh_types::topology::{self, RoutedPeer};
use wiremesh_types::{Action, DirectUpdate, Network, NetworkEvent, NetworkPeer};

use crate::config::AgentConfig;
use crate::device::Device;
use crate::firewall::{Firewall, FirewallError};
use crate::nat::{self, probe};
use crate::netlink::{InterfaceConfig, PeerConfig, PeerStats, Platform, PlatformError};
use crate::records::{LocalRecords, Membership};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("own key not present in network {0}")]
    NoSelfAddress(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("endpoint discovery failed: {0}")]
    Discovery(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Absent,
    Starting,
    Running,
    Resetting,
    TornDown,
}

/// What the caller should do after a reconciliation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    /// Tell the server about new ports or endpoints.
    Report(UpdatePortsRequest),
    /// The network is gone locally; the interface and record were removed.
    Removed,
}

/// Hands out interface slots so two networks never share a name.
#[derive(Debug, Default)]
pub struct InterfaceSlots {
    claimed: Mutex<BTreeMap<String, u32>>,
}

impl InterfaceSlots {
    /// The slot already held by `network`, else `preferred` if free, else
    /// the lowest free one.
    pub fn claim(&self, network: &str, preferred: Option<u32>) -> u32 {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = claimed.get(network) {
            return *index;
        }
        let taken: BTreeSet<u32> = claimed.values().copied().collect();
        let index = preferred
            .filter(|p| !taken.contains(p))
            .or_else(|| (0..=u32::MAX).find(|i| !taken.contains(i)))
            .unwrap_or(0);
        claimed.insert(network.to_string(), index);
        index
    }

    pub fn release(&self, network: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(network);
    }
}

/// Shared collaborators every reconciler needs.
pub struct Context<P, F, S> {
    pub config: Arc<AgentConfig>,
    pub platform: Arc<P>,
    pub firewall: Arc<F>,
    pub records: Arc<LocalRecords<S>>,
    pub slots: Arc<InterfaceSlots>,
    pub public_key: String,
    pub private_key: String,
}

impl<P, F, S> Clone for Context<P, F, S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            platform: self.platform.clone(),
            firewall: self.firewall.clone(),
            records: self.records.clone(),
            slots: self.slots.clone(),
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
        }
    }
}

impl<P, F, S: KvStore> Context<P, F, S> {
    pub fn new(config: AgentConfig, device: &Device, platform: Arc<P>, firewall: Arc<F>, store: S) -> Self {
        Self {
            config: Arc::new(config),
            platform,
            firewall,
            records: Arc::new(LocalRecords::new(store)),
            slots: Arc::new(InterfaceSlots::default()),
            public_key: device.public_key.clone(),
            private_key: device.private_key.clone(),
        }
    }
}

pub struct Reconciler<P, F, S> {
    name: String,
    ctx: Context<P, F, S>,
    state: InterfaceState,
    membership: Option<Membership>,
    applied: BTreeMap<String, PeerConfig>,
    responder: Option<CancellationToken>,
}

impl<P: Platform, F: Firewall, S: KvStore> Reconciler<P, F, S> {
    pub fn new(network: &str, ctx: Context<P, F, S>) -> Self {
        Self {
            name: network.to_string(),
            ctx,
            state: InterfaceState::Absent,
            membership: None,
            applied: BTreeMap::new(),
            responder: None,
        }
    }

    pub fn state(&self) -> InterfaceState {
        self.state
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    /// Peers currently programmed into the interface.
    pub fn applied(&self) -> impl Iterator<Item = &PeerConfig> {
        self.applied.values()
    }

    fn own_record<'a>(&self, network: &'a Network) -> Option<&'a NetworkPeer> {
        network.peer(&self.ctx.public_key)
    }

    // -- Start & resync ------------------------------------------------------

    /// Bring the interface in line with `network`: start it if it is not
    /// running, otherwise resync it.
    pub async fn sync(&mut self, network: Network) -> Result<Outcome, ReconcileError> {
        match self.state {
            InterfaceState::Running | InterfaceState::Resetting => self.resync(network).await,
            _ => self.start(network).await,
        }
    }

    #[tracing::instrument(skip(self, network), fields(network = %self.name))]
    pub async fn start(&mut self, network: Network) -> Result<Outcome, ReconcileError> {
        let me = self
            .own_record(&network)
            .cloned()
            .ok_or_else(|| ReconcileError::NoSelfAddress(network.name.clone()))?;

        let previous = match self.membership.take() {
            Some(membership) => Some(membership),
            None => self.ctx.records.get_membership(&self.name).await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to read local network record");
                None
            }),
        };
        let index = self
            .ctx
            .slots
            .claim(&self.name, previous.as_ref().map(|m| m.index));
        let interface = self.ctx.config.interface_name(index);
        self.state = InterfaceState::Starting;

        if self.ctx.platform.interface_exists(&interface).await? {
            info!(interface = %interface, "interface already present, re-applying");
            let membership = match previous {
                Some(previous) => Membership {
                    network,
                    index,
                    interface,
                    ..previous
                },
                None => Membership {
                    network,
                    index,
                    interface,
                    listen_port: me.listen_port,
                    public_listen_port: me.public_listen_port,
                    endpoint: me.endpoint,
                },
            };
            self.membership = Some(membership);
            if let Err(e) = self.reset_peers().await {
                self.state = InterfaceState::Running;
                return Err(e);
            }
            self.finish_start(&me).await;
            return Ok(self.port_report(&me, None));
        }

        let preferred = previous
            .as_ref()
            .map(|m| m.listen_port)
            .or(Some(me.listen_port))
            .filter(|p| *p != 0)
            .unwrap_or_else(|| self.ctx.config.listen_port(index));
        let found = match nat::discover(
            preferred,
            &self.ctx.config.stun_servers,
            self.ctx.config.stun_timeout(),
            &self.ctx.config.server,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                self.state = InterfaceState::Absent;
                self.membership = previous;
                return Err(e.into());
            }
        };
        if let Some(previous) = &previous {
            if found.endpoint.is_some() && found.endpoint != previous.endpoint {
                info!(old = ?previous.endpoint, new = ?found.endpoint, "public endpoint changed");
            }
            if found.public_listen_port != previous.public_listen_port {
                info!(
                    old = previous.public_listen_port,
                    new = found.public_listen_port,
                    "public port changed"
                );
            }
        }

        let peers = self.desired_peers(&network).await;
        let config = InterfaceConfig {
            name: interface.clone(),
            private_key: self.ctx.private_key.clone(),
            listen_port: found.listen_port,
            address: me.address,
            prefix: network.cidr.prefix(),
            peers: peers.clone(),
        };
        let membership = Membership {
            network,
            index,
            interface,
            listen_port: found.listen_port,
            public_listen_port: found.public_listen_port,
            endpoint: found.endpoint.or(previous.and_then(|p| p.endpoint)),
        };
        self.persist(&membership).await;

        if let Err(e) = self.ctx.platform.create_interface(&config).await {
            self.state = InterfaceState::Absent;
            self.membership = Some(membership);
            return Err(e.into());
        }
        self.applied = peers
            .into_iter()
            .map(|p| (p.public_key.clone(), p))
            .collect();
        self.membership = Some(membership);
        self.finish_start(&me).await;
        Ok(self.port_report(&me, found.private_endpoint))
    }

    async fn finish_start(&mut self, me: &NetworkPeer) {
        if let Some((subnet, virt, use_nat)) = router_rules(me) {
            self.install_router_rules(subnet, virt, use_nat).await;
        }
        self.start_responder().await;
        self.state = InterfaceState::Running;
        if let Some(membership) = &self.membership {
            self.persist(membership).await;
            info!(
                interface = %membership.interface,
                address = %me.address,
                peers = self.applied.len(),
                "network running"
            );
        }
    }

    /// Ports and endpoints to send to the server if its record of us is
    /// stale.
    fn port_report(&self, me: &NetworkPeer, private_endpoint: Option<std::net::IpAddr>) -> Outcome {
        let Some(membership) = &self.membership else {
            return Outcome::Applied;
        };
        let private_endpoint = private_endpoint.or(me.private_endpoint);
        let endpoint = membership.endpoint.or(me.endpoint);
        let stale = me.listen_port != membership.listen_port
            || me.public_listen_port != membership.public_listen_port
            || me.endpoint != endpoint
            || me.private_endpoint != private_endpoint;
        if !stale {
            return Outcome::Applied;
        }
        Outcome::Report(UpdatePortsRequest {
            network: self.name.clone(),
            listen_port: membership.listen_port,
            public_listen_port: membership.public_listen_port,
            endpoint,
            private_endpoint,
        })
    }

    /// Replace the local snapshot with `network` and fix whatever drifted.
    #[tracing::instrument(skip(self, network), fields(network = %self.name))]
    async fn resync(&mut self, network: Network) -> Result<Outcome, ReconcileError> {
        let Some(me) = self.own_record(&network).cloned() else {
            info!("no longer a member, tearing down");
            self.teardown(true).await;
            return Ok(Outcome::Removed);
        };
        let Some(membership) = self.membership.as_mut() else {
            return self.start(network).await;
        };

        let old_me = membership.network.peer(&me.public_key).cloned();
        membership.network = network;
        let snapshot = membership.clone();
        self.persist(&snapshot).await;

        let old_rules = old_me.as_ref().and_then(router_rules);
        let new_rules = router_rules(&me);
        if old_rules != new_rules {
            if let Some((subnet, virt, use_nat)) = old_rules {
                self.remove_router_rules(subnet, virt, use_nat).await;
            }
            if let Some((subnet, virt, use_nat)) = new_rules {
                self.install_router_rules(subnet, virt, use_nat).await;
            }
        }

        let mut desired = self.desired_peers(&snapshot.network).await;
        desired.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        if !self.applied.values().eq(desired.iter()) {
            self.replace(desired).await?;
        }
        Ok(self.port_report(&me, None))
    }

    // -- Events --------------------------------------------------------------

    #[tracing::instrument(skip(self, event), fields(network = %self.name, action = ?event.action))]
    pub async fn apply_event(&mut self, event: NetworkEvent) -> Result<Outcome, ReconcileError> {
        if event.action == Action::DeleteNetwork {
            info!("network deleted, tearing down");
            self.teardown(true).await;
            return Ok(Outcome::Removed);
        }
        let Some(peer) = event.peer else {
            warn!("event without a peer record, ignoring");
            return Ok(Outcome::Applied);
        };
        let Some(membership) = self.membership.as_mut() else {
            debug!("no local record yet, ignoring event");
            return Ok(Outcome::Applied);
        };

        let key = peer.public_key.clone();
        if key == self.ctx.public_key && event.action == Action::DeletePeer {
            info!("removed from network, tearing down");
            self.teardown(true).await;
            return Ok(Outcome::Removed);
        }

        let old = membership.network.peer(&key).cloned();
        match event.action {
            Action::DeletePeer => {
                membership.network.remove_peer(&key);
                for relay in &mut membership.network.peers {
                    relay.relayed_peers.remove(&key);
                }
                topology::recompute_relayed(&mut membership.network);
            }
            Action::AddRelay | Action::DeleteRelay => {
                membership.network.upsert_peer(peer.clone());
                topology::recompute_relayed(&mut membership.network);
            }
            _ => {
                membership.network.upsert_peer(peer.clone());
            }
        }
        let snapshot = membership.clone();
        self.persist(&snapshot).await;

        if self.state != InterfaceState::Running {
            debug!(state = ?self.state, "interface not running, record updated only");
            return Ok(Outcome::Applied);
        }

        if key == self.ctx.public_key {
            if event.action.forces_reset() || old.is_some_and(|o| o.routing_differs(&peer)) {
                self.reset_peers().await?;
            }
            return Ok(Outcome::Applied);
        }

        let reshaped = event.action.forces_reset()
            || peer.has_routing_role()
            || old
                .as_ref()
                .is_some_and(|o| o.has_routing_role() || o.routing_differs(&peer));
        if reshaped {
            self.reset_peers().await?;
        } else {
            self.patch_peer(&key).await?;
        }
        Ok(Outcome::Applied)
    }

    /// Server-to-device instructions.
    #[tracing::instrument(skip(self, update), fields(network = %self.name, action = update.action()))]
    pub async fn apply_direct(&mut self, update: DirectUpdate) -> Result<Outcome, ReconcileError> {
        match update {
            DirectUpdate::Join { network } => self.sync(network).await,
            DirectUpdate::ListenPort { .. } => {
                let Some(membership) = self.membership.clone() else {
                    return Ok(Outcome::Applied);
                };
                info!("re-running endpoint discovery");
                self.stop_responder();
                if let Err(e) = self.ctx.platform.remove_interface(&membership.interface).await {
                    error!(interface = %membership.interface, error = %e, "failed to stop interface for discovery");
                    return Err(e.into());
                }
                self.state = InterfaceState::Absent;
                self.membership = Some(membership.clone());
                self.start(membership.network).await
            }
            DirectUpdate::AddSubnetRouter {
                subnet,
                virt_subnet,
                use_nat,
                ..
            } => {
                if self.state == InterfaceState::Running {
                    self.install_router_rules(subnet, virt_subnet, use_nat).await;
                }
                Ok(Outcome::Applied)
            }
            DirectUpdate::DeleteSubnetRouter {
                subnet,
                virt_subnet,
                use_nat,
                ..
            } => {
                if self.state == InterfaceState::Running {
                    self.remove_router_rules(subnet, virt_subnet, use_nat).await;
                }
                Ok(Outcome::Applied)
            }
        }
    }

    // -- Peer programming ----------------------------------------------------

    async fn desired_peers(&self, network: &Network) -> Vec<PeerConfig> {
        let routed = topology::compute_peer_set(network, &self.ctx.public_key);
        let timeout = self.ctx.config.probe_timeout();
        join_all(routed.into_iter().map(|r| peer_config(r, timeout))).await
    }

    /// Rebuild the whole peer set from the current snapshot.
    async fn reset_peers(&mut self) -> Result<(), ReconcileError> {
        let Some(membership) = &self.membership else {
            return Ok(());
        };
        let network = membership.network.clone();
        let desired = self.desired_peers(&network).await;
        self.replace(desired).await
    }

    async fn replace(&mut self, desired: Vec<PeerConfig>) -> Result<(), ReconcileError> {
        let Some(interface) = self.membership.as_ref().map(|m| m.interface.clone()) else {
            return Ok(());
        };
        let previous = self.state;
        self.state = InterfaceState::Resetting;
        let result = self.ctx.platform.replace_peers(&interface, &desired).await;
        self.state = match previous {
            InterfaceState::Starting => InterfaceState::Starting,
            _ => InterfaceState::Running,
        };
        result?;

        info!(interface = %interface, peers = desired.len(), "reset peer set");
        self.applied = desired
            .into_iter()
            .map(|p| (p.public_key.clone(), p))
            .collect();
        Ok(())
    }

    /// Bring the entry for `key` in line with the snapshot without touching
    /// anyone else.
    async fn patch_peer(&mut self, key: &str) -> Result<(), ReconcileError> {
        let Some(membership) = &self.membership else {
            return Ok(());
        };
        let interface = membership.interface.clone();
        let routed = topology::compute_peer_set(&membership.network, &self.ctx.public_key)
            .into_iter()
            .find(|r| r.peer.public_key == key);

        match routed {
            Some(routed) => {
                let desired = peer_config(routed, self.ctx.config.probe_timeout()).await;
                if self.applied.get(key) == Some(&desired) {
                    debug!(peer = key, "peer already up to date");
                    return Ok(());
                }
                self.ctx.platform.upsert_peer(&interface, &desired).await?;
                debug!(peer = key, endpoint = ?desired.endpoint, "patched peer");
                self.applied.insert(key.to_string(), desired);
            }
            None => {
                if self.applied.contains_key(key) {
                    self.ctx.platform.remove_peer(&interface, key).await?;
                    self.applied.remove(key);
                    debug!(peer = key, "removed peer");
                }
            }
        }
        Ok(())
    }

    // -- Subnet router rules -------------------------------------------------

    async fn install_router_rules(&self, subnet: Ipv4Network, virt: Option<Ipv4Network>, use_nat: bool) {
        let Some(membership) = &self.membership else {
            return;
        };
        let iface = membership.interface.as_str();
        if use_nat && let Err(e) = self.ctx.firewall.install_masquerade(iface, subnet).await {
            error!(interface = iface, %subnet, error = %e, "failed to install masquerade");
        }
        if let Some(virt) = virt
            && let Err(e) = self.ctx.firewall.install_netmap(iface, virt, subnet).await
        {
            error!(interface = iface, %virt, %subnet, error = %e, "failed to install netmap");
        }
    }

    async fn remove_router_rules(&self, subnet: Ipv4Network, virt: Option<Ipv4Network>, use_nat: bool) {
        let Some(membership) = &self.membership else {
            return;
        };
        let iface = membership.interface.as_str();
        if use_nat && let Err(e) = self.ctx.firewall.remove_masquerade(iface, subnet).await {
            error!(interface = iface, %subnet, error = %e, "failed to remove masquerade");
        }
        if let Some(virt) = virt
            && let Err(e) = self.ctx.firewall.remove_netmap(iface, virt, subnet).await
        {
            error!(interface = iface, %virt, %subnet, error = %e, "failed to remove netmap");
        }
    }

    // -- Probe responder -----------------------------------------------------

    async fn start_responder(&mut self) {
        self.stop_responder();
        let Some(membership) = &self.membership else {
            return;
        };
        match TcpListener::bind(("0.0.0.0", membership.listen_port)).await {
            Ok(listener) => {
                let token = CancellationToken::new();
                tokio::spawn(probe::respond(listener, self.ctx.public_key.clone(), token.clone()));
                self.responder = Some(token);
            }
            Err(e) => warn!(
                port = membership.listen_port,
                error = %e,
                "could not start probe responder"
            ),
        }
    }

    fn stop_responder(&mut self) {
        if let Some(token) = self.responder.take() {
            token.cancel();
        }
    }

    // -- Teardown ------------------------------------------------------------

    /// Remove the interface. With `forget`, also delete the local record and
    /// free the slot; without it the network comes back on the next start.
    pub async fn teardown(&mut self, forget: bool) {
        self.stop_responder();
        if let Some(membership) = &self.membership {
            if let Some((subnet, virt, use_nat)) = self
                .own_record(&membership.network)
                .and_then(router_rules)
            {
                self.remove_router_rules(subnet, virt, use_nat).await;
            }
            if let Err(e) = self.ctx.platform.remove_interface(&membership.interface).await {
                error!(interface = %membership.interface, error = %e, "failed to remove interface");
            }
        }
        self.applied.clear();

        if forget {
            if let Err(e) = self.ctx.records.delete_membership(&self.name).await {
                warn!(error = %e, "failed to delete local network record");
            }
            self.ctx.slots.release(&self.name);
            self.membership = None;
        }
        self.state = InterfaceState::TornDown;
        info!(network = %self.name, forget, "interface torn down");
    }

    async fn persist(&self, membership: &Membership) {
        if let Err(e) = self.ctx.records.put_membership(membership).await {
            warn!(network = %self.name, error = %e, "failed to persist network record");
        }
    }
}

/// `(subnet, virtual subnet, masquerade)` for a subnet router.
fn router_rules(peer: &NetworkPeer) -> Option<(Ipv4Network, Option<Ipv4Network>, bool)> {
    if !peer.is_subnet_router {
        return None;
    }
    let virt = if peer.use_virt_subnet { peer.virt_subnet } else { None };
    Some((peer.subnet?, virt, peer.use_nat))
}

async fn peer_config(routed: RoutedPeer, probe_timeout: Duration) -> PeerConfig {
    let endpoint = nat::select_endpoint(&routed.peer, probe_timeout).await;
    PeerConfig {
        public_key: routed.peer.public_key,
        endpoint,
        allowed_ips: routed.allowed_ips,
        keepalive: routed.keepalive,
    }
}

/// Fraction of peers whose latest handshake is within `window` of `now`.
/// `None` when there are no peers to measure.
pub fn connectivity(stats: &[PeerStats], now: SystemTime, window: Duration) -> Option<f64> {
    if stats.is_empty() {
        return None;
    }
    let fresh = stats
        .iter()
        .filter_map(|s| s.last_handshake)
        .filter(|at| now.duration_since(*at).map_or(true, |age| age <= window))
        .count();
    Some(fresh as f64 / stats.len() as f64)
}
