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

//! Routes inbound bus requests to the authority.
//!
//! Every concrete subject gets its own worker with a FIFO queue, so requests
//! on one subject are handled in arrival order while different subjects
//! (different peers, different operations) run concurrently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wiremesh_bus::{Bus, BusError, LocalConnection, Message, respond_json};
use wiremesh_store::KvStore;
use wiremesh_types::proto::{
    AddRelayRequest, AddSubnetRouterRequest, CheckinRequest, CreateInviteRequest,
    CreateNetworkRequest, DeleteNetworkRequest, DeleteRelayRequest, DeleteSubnetRouterRequest,
    Empty, JoinRequest, LeaveRequest, ListNetworksResponse, RegisterRequest, UpdatePortsRequest,
};
use wiremesh_types::subject::{
    ADMIN_NAMESPACE, PeerOp, REGISTER, parse_admin_subject, parse_peer_subject,
};
use wiremesh_types::{MeshError, Reply};

use crate::authority::Authority;
use crate::error::AuthorityError;

/// How long a worker waits for more work before it exits.
const WORKER_IDLE: Duration = Duration::from_secs(60);

pub struct Dispatcher<S> {
    authority: Arc<Authority<S>>,
    bus: LocalConnection,
    workers: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl<S: KvStore> Dispatcher<S> {
    pub fn new(authority: Arc<Authority<S>>, bus: LocalConnection) -> Self {
        Self {
            authority,
            bus,
            workers: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to every request subject, then serve on a background task
    /// until `shutdown`. Requests published after this returns are handled.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        let mut patterns: Vec<String> = PeerOp::ALL.iter().map(|op| op.wildcard()).collect();
        patterns.push(REGISTER.to_string());
        patterns.push(ADMIN_NAMESPACE.to_string());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for pattern in &patterns {
            let mut sub = self.bus.subscribe(pattern).await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);
        info!(subjects = patterns.len(), "dispatcher listening");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => self.route(msg),
                        None => break,
                    },
                }
            }
            info!("dispatcher stopped");
        }))
    }

    fn route(&self, msg: Message) {
        let subject = msg.subject.clone();
        let msg = match self.workers.get(&subject) {
            Some(worker) => match worker.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Queue before the worker can observe an empty inbox.
        let _ = tx.send(msg);
        self.workers.insert(subject.clone(), tx);
        debug!(subject = %subject, "spawned subject worker");

        let worker = Worker {
            subject,
            authority: self.authority.clone(),
            bus: self.bus.clone(),
            workers: self.workers.clone(),
        };
        tokio::spawn(worker.run(rx));
    }
}

struct Worker<S> {
    subject: String,
    authority: Arc<Authority<S>>,
    bus: LocalConnection,
    workers: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl<S: KvStore> Worker<S> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
                Ok(Some(msg)) => handle(&self.authority, &self.bus, msg).await,
                Ok(None) => break,
                Err(_) => {
                    // Sends happen under the map's shard lock, so an empty
                    // inbox here stays empty once the entry is gone.
                    if self
                        .workers
                        .remove_if(&self.subject, |_, _| rx.is_empty())
                        .is_some()
                    {
                        break;
                    }
                }
            }
        }
        debug!(subject = %self.subject, "subject worker exited");
    }
}

fn decode<T: DeserializeOwned>(msg: &Message) -> Result<T, AuthorityError> {
    msg.json()
        .map_err(|e| MeshError::InvalidRequest(e.to_string()).into())
}

async fn reply<T: Serialize + Sync>(
    bus: &LocalConnection,
    msg: &Message,
    result: Result<T, AuthorityError>,
) {
    let reply: Reply<T> = result.map_err(MeshError::from).into();
    if let Err(e) = respond_json(bus, msg, &reply).await {
        warn!(subject = %msg.subject, error = %e, "failed to send reply");
    }
}

/// Handle one request and answer it on its reply subject.
pub async fn handle<S: KvStore>(authority: &Authority<S>, bus: &LocalConnection, msg: Message) {
    if msg.subject == REGISTER {
        let result = match decode::<RegisterRequest>(&msg) {
            Ok(req) => authority.register(req).await,
            Err(e) => Err(e),
        };
        return reply(bus, &msg, result).await;
    }

    if let Some(op) = parse_admin_subject(&msg.subject).map(str::to_string) {
        return handle_admin(authority, bus, &op, msg).await;
    }

    let (key, op) = match parse_peer_subject(&msg.subject) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(subject = %msg.subject, "rejected request on malformed subject");
            return reply::<Empty>(bus, &msg, Err(e.into())).await;
        }
    };
    let key = key.to_string();

    match op {
        PeerOp::Checkin => {
            let result = match decode::<CheckinRequest>(&msg) {
                Ok(req) => authority.checkin(&key, req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        PeerOp::Join => {
            let result = match decode::<JoinRequest>(&msg) {
                Ok(req) => authority.join(&key, req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        PeerOp::Leave => {
            let result = match decode::<LeaveRequest>(&msg) {
                Ok(req) => authority.leave(&key, &req.network).await.map(|_| Empty {}),
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        PeerOp::LeaveServer => {
            let result = authority.leave_server(&key).await;
            let departed = result.as_ref().ok().cloned();
            reply(bus, &msg, result.map(|_| Empty {})).await;
            if let Some(peer) = departed {
                authority.revoke(&peer);
            }
        }
        PeerOp::Reload => {
            let result = authority.reload(&key).await;
            reply(bus, &msg, result).await;
        }
        PeerOp::UpdatePorts => {
            let result = match decode::<UpdatePortsRequest>(&msg) {
                Ok(req) => authority.update_ports(&key, req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
    }
}

async fn handle_admin<S: KvStore>(
    authority: &Authority<S>,
    bus: &LocalConnection,
    op: &str,
    msg: Message,
) {
    debug!(op, "admin request");
    match op {
        "createNetwork" => {
            let result = match decode::<CreateNetworkRequest>(&msg) {
                Ok(req) => authority.create_network(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "deleteNetwork" => {
            let result = match decode::<DeleteNetworkRequest>(&msg) {
                Ok(req) => authority.delete_network(&req.name).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "createInvite" => {
            let result = match decode::<CreateInviteRequest>(&msg) {
                Ok(req) => authority.create_invite(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "addRelay" => {
            let result = match decode::<AddRelayRequest>(&msg) {
                Ok(req) => authority.add_relay(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "deleteRelay" => {
            let result = match decode::<DeleteRelayRequest>(&msg) {
                Ok(req) => authority.delete_relay(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "addSubnetRouter" => {
            let result = match decode::<AddSubnetRouterRequest>(&msg) {
                Ok(req) => authority.add_subnet_router(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "deleteSubnetRouter" => {
            let result = match decode::<DeleteSubnetRouterRequest>(&msg) {
                Ok(req) => authority.delete_subnet_router(req).await,
                Err(e) => Err(e),
            };
            reply(bus, &msg, result).await;
        }
        "listNetworks" => {
            let result = authority
                .list_networks()
                .await
                .map(|networks| ListNetworksResponse { networks });
            reply(bus, &msg, result).await;
        }
        other => {
            warn!(op = other, "unknown admin operation");
            let err = MeshError::InvalidRequest(format!("unknown admin operation {other}"));
            reply::<Empty>(bus, &msg, Err(err.into())).await;
        }
    }
}
