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

//! The agent runtime: one bus connection, a router feeding per-network
//! actors, and the checkin and reconnect tickers.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use wiremesh_bus::{Bus, BusError, Credentials, Message, Subscription};
use wiremesh_store::{KvStore, StoreError};
use wiremesh_types::proto::{CheckinRequest, JoinRequest, UpdatePortsRequest};
use wiremesh_types::subject::{ALL_NETWORKS, parse_network_subject, parse_update_subject, update_namespace};
use wiremesh_types::{Action, ConnectivitySample, DirectUpdate, NetworkEvent, NetworkPeer};

use crate::actor::{self, ActorHandle, Command, Report};
use crate::api::{self, RpcError};
use crate::device::{Device, DeviceError};
use crate::firewall::Firewall;
use crate::nat;
use crate::netlink::Platform;
use crate::reconcile::{self, Context, Reconciler};
use crate::records::Membership;
use crate::slot::{ConnectionSlot, Connector};

pub struct Agent<C: Connector, P, F, S> {
    inner: Arc<Inner<C, P, F, S>>,
}

impl<C: Connector, P, F, S> Clone for Agent<C, P, F, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

type Receivers = (mpsc::UnboundedReceiver<Message>, mpsc::UnboundedReceiver<Report>);

struct Inner<C: Connector, P, F, S> {
    ctx: Context<P, F, S>,
    device: Device,
    credentials: Credentials,
    endpoint: Mutex<Option<IpAddr>>,
    connector: C,
    slot: ConnectionSlot<C::Conn>,
    actors: DashMap<String, ActorHandle>,
    next_actor: AtomicU64,
    inbound: mpsc::UnboundedSender<Message>,
    reports: mpsc::UnboundedSender<Report>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<C, P, F, S> Agent<C, P, F, S>
where
    C: Connector,
    P: Platform,
    F: Firewall,
    S: KvStore,
{
    pub fn new(connector: C, ctx: Context<P, F, S>, device: Device) -> Result<Self, DeviceError> {
        let credentials = device.credentials()?;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (reports, reports_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                endpoint: Mutex::new(device.endpoint),
                device,
                credentials,
                connector,
                slot: ConnectionSlot::default(),
                actors: DashMap::new(),
                next_actor: AtomicU64::new(0),
                inbound,
                reports,
                receivers: Mutex::new(Some((inbound_rx, reports_rx))),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.inner.device.public_key
    }

    fn timeout(&self) -> Duration {
        self.inner.ctx.config.request_timeout()
    }

    /// Networks with a live actor, sorted.
    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.actors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Locally recorded memberships.
    pub async fn status(&self) -> Result<Vec<Membership>, StoreError> {
        self.inner.ctx.records.list_memberships().await
    }

    pub fn endpoint(&self) -> Option<IpAddr> {
        *self
            .inner
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Restore local networks, connect, and start the tickers. A server that
    /// is down does not stop the agent; the reconnect ticker keeps trying.
    pub async fn start(&self) {
        let receivers = self
            .inner
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((inbound, reports)) = receivers else {
            warn!("agent already started");
            return;
        };
        self.inner.tracker.spawn(self.clone().route(inbound, reports));

        self.restore().await;
        if let Err(e) = self.reconnect().await {
            warn!(error = %e, "server unreachable, will retry");
        }

        self.inner.tracker.spawn(self.clone().checkin_loop());
        self.inner.tracker.spawn(self.clone().reconnect_loop());
        info!(public_key = %self.public_key(), "agent started");
    }

    async fn restore(&self) {
        match self.inner.ctx.records.list_memberships().await {
            Ok(memberships) => {
                for membership in memberships {
                    let name = membership.network.name.clone();
                    info!(network = %name, interface = %membership.interface, "restoring network");
                    self.send(&name, Command::Start(membership.network));
                }
            }
            Err(e) => warn!(error = %e, "failed to read local network records"),
        }
    }

    /// Tear every interface down, keeping local records, and stop all tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();

        let handles: Vec<ActorHandle> = self.inner.actors.iter().map(|e| e.value().clone()).collect();
        let waits = handles.into_iter().filter_map(|handle| {
            let (done, wait) = oneshot::channel();
            handle.send(Command::Shutdown { done }).ok().map(|()| wait)
        });
        if tokio::time::timeout(grace, join_all(waits)).await.is_err() {
            warn!("timed out tearing down interfaces");
        }
        self.inner.actors.clear();
        self.inner.slot.clear().await;

        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!("background tasks did not stop in time");
        }
        info!("agent stopped");
    }

    // -- Connection ----------------------------------------------------------

    async fn connection(&self) -> Result<C::Conn, RpcError> {
        self.inner
            .slot
            .get()
            .await
            .ok_or(RpcError::Bus(BusError::Closed))
    }

    /// Open a fresh connection, drain the old one, subscribe and resync.
    pub async fn reconnect(&self) -> Result<(), BusError> {
        let fresh = self.inner.connector.connect(&self.inner.credentials).await?;
        self.inner.slot.swap(fresh.clone()).await;

        let subscribed = async {
            let updates = fresh.subscribe(&update_namespace(self.public_key())).await?;
            let events = fresh.subscribe(ALL_NETWORKS).await?;
            Ok::<_, BusError>((updates, events))
        }
        .await;
        let (updates, events) = match subscribed {
            Ok(subs) => subs,
            Err(e) => {
                self.inner.slot.clear().await;
                return Err(e);
            }
        };
        self.inner.tracker.spawn(pump(
            updates,
            events,
            self.inner.inbound.clone(),
            self.inner.shutdown.clone(),
        ));

        if let Err(e) = self.resync().await {
            warn!(error = %e, "resync after connect failed");
        }
        Ok(())
    }

    // -- Routing -------------------------------------------------------------

    fn spawn_actor(&self, network: &str) -> ActorHandle {
        let id = self.inner.next_actor.fetch_add(1, Ordering::Relaxed) + 1;
        let reconciler = Reconciler::new(network, self.inner.ctx.clone());
        actor::spawn(id, reconciler, self.inner.reports.clone(), network)
    }

    /// The live actor for `network`, spawning one if needed.
    fn actor(&self, network: &str) -> ActorHandle {
        let mut entry = self
            .inner
            .actors
            .entry(network.to_string())
            .or_insert_with(|| self.spawn_actor(network));
        if entry.is_closed() {
            *entry = self.spawn_actor(network);
        }
        entry.value().clone()
    }

    /// Deliver to `network`'s actor, spawning it if needed.
    fn send(&self, network: &str, command: Command) {
        if let Err(command) = self.actor(network).send(command) {
            self.inner.actors.remove(network);
            if self.actor(network).send(command).is_err() {
                warn!(network, "network actor unavailable");
            }
        }
    }

    /// Deliver only if an actor already exists.
    fn forward(&self, network: &str, command: Command) {
        let handle = self.inner.actors.get(network).map(|h| h.value().clone());
        match handle {
            Some(handle) => {
                if handle.send(command).is_err() {
                    debug!(network, "network actor already stopped");
                }
            }
            None => debug!(network, "not a member, ignoring"),
        }
    }

    async fn route(
        self,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                Some(message) = inbound.recv() => self.dispatch(message),
                Some(report) = reports.recv() => self.on_report(report),
                else => break,
            }
        }
        debug!("router stopped");
    }

    fn dispatch(&self, message: Message) {
        if let Some(network) = parse_network_subject(&message.subject) {
            match message.json::<NetworkEvent>() {
                Ok(event) => self.forward(network, Command::Event(event)),
                Err(e) => warn!(subject = %message.subject, error = %e, "malformed network event"),
            }
            return;
        }

        let Some((key, action)) = parse_update_subject(&message.subject) else {
            debug!(subject = %message.subject, "unexpected subject");
            return;
        };
        if key != self.public_key() {
            warn!(subject = %message.subject, "update addressed to another device");
            return;
        }
        match message.json::<DirectUpdate>() {
            Ok(update) => {
                let network = update.network().to_string();
                debug!(network = %network, action, "direct update");
                if matches!(update, DirectUpdate::Join { .. }) {
                    self.send(&network, Command::Direct(update));
                } else {
                    self.forward(&network, Command::Direct(update));
                }
            }
            Err(e) => warn!(action, error = %e, "malformed direct update"),
        }
    }

    fn on_report(&self, report: Report) {
        match report {
            Report::Ports(req) => {
                let agent = self.clone();
                self.inner.tracker.spawn(async move { agent.report_ports(req).await });
            }
            Report::Removed { network, actor } => {
                self.inner.actors.remove_if(&network, |_, h| h.id() == actor);
                info!(network = %network, "network removed");
            }
        }
    }

    async fn report_ports(&self, req: UpdatePortsRequest) {
        if let Some(endpoint) = req.endpoint {
            self.set_endpoint(endpoint).await;
        }
        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(_) => {
                debug!(network = %req.network, "offline, ports will be reported on resync");
                return;
            }
        };
        if let Err(e) = api::update_ports(&conn, self.public_key(), &req, self.timeout()).await {
            warn!(network = %req.network, error = %e, "failed to report ports");
        }
    }

    async fn set_endpoint(&self, endpoint: IpAddr) {
        {
            let mut current = self
                .inner
                .endpoint
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == Some(endpoint) {
                return;
            }
            *current = Some(endpoint);
        }
        let device = Device {
            endpoint: Some(endpoint),
            ..self.inner.device.clone()
        };
        if let Err(e) = self.inner.ctx.records.put_device(&device).await {
            warn!(error = %e, "failed to persist endpoint");
        }
    }

    // -- Requests ------------------------------------------------------------

    /// Ask the server to add this device to `network`. The interface comes up
    /// when the server's join update arrives.
    pub async fn join(&self, network: &str) -> Result<NetworkPeer, RpcError> {
        let conn = self.connection().await?;
        let index = self.inner.ctx.slots.claim(network, None);
        let req = self.join_request(network, index).await;
        let joined = api::join(&conn, self.public_key(), &req, self.timeout()).await;
        if joined.is_err() && !self.inner.actors.contains_key(network) {
            self.inner.ctx.slots.release(network);
        }
        joined
    }

    /// Advertise the port the interface for slot `index` will listen on, so
    /// peers can reach it before the first port report.
    async fn join_request(&self, network: &str, index: u32) -> JoinRequest {
        let config = &self.inner.ctx.config;
        let preferred = config.listen_port(index);
        let mut req = JoinRequest {
            network: network.to_string(),
            listen_port: preferred,
            public_listen_port: preferred,
            endpoint: self.endpoint(),
            private_endpoint: None,
            hostname: self.inner.device.hostname.clone(),
        };
        match nat::discover(preferred, &config.stun_servers, config.stun_timeout(), &config.server).await {
            Ok(found) => {
                req.listen_port = found.listen_port;
                req.public_listen_port = found.public_listen_port;
                req.endpoint = found.endpoint.or(req.endpoint);
                req.private_endpoint = found.private_endpoint;
            }
            Err(e) => warn!(error = %e, "endpoint discovery failed, advertising configured port"),
        }
        req
    }

    pub async fn leave(&self, network: &str) -> Result<(), RpcError> {
        let conn = self.connection().await?;
        api::leave(&conn, self.public_key(), network, self.timeout()).await
    }

    /// Deregister from the server and drop every network.
    pub async fn leave_server(&self) -> Result<(), RpcError> {
        let conn = self.connection().await?;
        api::leave_server(&conn, self.public_key(), self.timeout()).await?;
        self.remove_all();
        self.inner.slot.clear().await;
        Ok(())
    }

    /// Fetch every network from the server and converge on it.
    pub async fn resync(&self) -> Result<(), RpcError> {
        let conn = self.connection().await?;
        let networks = api::reload(&conn, self.public_key(), self.timeout())
            .await?
            .networks;

        let names: BTreeSet<String> = networks.iter().map(|n| n.name.clone()).collect();
        for network in networks {
            let name = network.name.clone();
            self.send(&name, Command::Resync(network));
        }
        for stale in self.networks() {
            if !names.contains(&stale) {
                info!(network = %stale, "no longer a member");
                self.forward(&stale, Command::Event(deleted(&stale)));
            }
        }
        debug!(networks = names.len(), "resynced");
        Ok(())
    }

    /// Report liveness and connectivity. Resyncs on drift; tears everything
    /// down if the server no longer knows this device.
    pub async fn checkin(&self) -> Result<(), RpcError> {
        let conn = self.connection().await?;
        let req = CheckinRequest {
            endpoint: self.endpoint(),
            version: self.inner.device.version.clone(),
            samples: self.samples().await,
        };
        match api::checkin(&conn, self.public_key(), &req, self.timeout()).await {
            Ok(resp) => {
                let remote: BTreeSet<String> = resp.networks.into_iter().collect();
                let local: BTreeSet<String> = self.networks().into_iter().collect();
                if remote != local {
                    info!(?remote, ?local, "membership drifted, resyncing");
                    self.resync().await?;
                }
                Ok(())
            }
            Err(e) if e.is_gone() => {
                warn!("server no longer knows this device, removing all networks");
                self.remove_all();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn remove_all(&self) {
        for network in self.networks() {
            self.forward(&network, Command::Event(deleted(&network)));
        }
    }

    async fn samples(&self) -> Vec<ConnectivitySample> {
        let memberships = self.status().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to read local network records");
            Vec::new()
        });
        let now = SystemTime::now();
        let window = self.inner.ctx.config.handshake_window();

        let mut samples = Vec::new();
        for membership in memberships {
            if !self.inner.actors.contains_key(&membership.network.name) {
                continue;
            }
            match self.inner.ctx.platform.peer_stats(&membership.interface).await {
                Ok(stats) => {
                    if let Some(score) = reconcile::connectivity(&stats, now, window) {
                        samples.push(ConnectivitySample {
                            network: membership.network.name,
                            score,
                        });
                    }
                }
                Err(e) => debug!(interface = %membership.interface, error = %e, "no peer stats"),
            }
        }
        samples
    }

    // -- Tickers -------------------------------------------------------------

    async fn checkin_loop(self) {
        let period = self.inner.ctx.config.checkin_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.checkin().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => debug!(error = %e, "checkin skipped"),
                Err(e) => warn!(error = %e, "checkin failed"),
            }
        }
    }

    async fn reconnect_loop(self) {
        let period = self.inner.ctx.config.reconnect_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.inner.slot.is_connected().await {
                continue;
            }
            info!("reconnecting to server");
            if let Err(e) = self.reconnect().await {
                warn!(error = %e, "reconnect failed");
            }
        }
    }
}

fn deleted(network: &str) -> NetworkEvent {
    NetworkEvent {
        action: Action::DeleteNetwork,
        network: network.to_string(),
        peer: None,
    }
}

/// Forward both subscriptions into the router, direct updates first.
async fn pump(
    mut updates: Subscription,
    mut events: Subscription,
    tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(message) = updates.next() => message,
            Some(message) = events.next() => message,
            else => break,
        };
        if tx.send(message).is_err() {
            break;
        }
    }
    debug!("subscription pump stopped");
}
