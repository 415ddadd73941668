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

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acl::Permissions;
use crate::identity::{self, Credentials, Nonce, Proof};
use crate::{Bus, BusError, INBOX_PREFIX, Message, Subscription, pattern};

/// Routes messages between connections and enforces their permissions.
///
/// Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    admin_token: Option<String>,
    identities: DashMap<String, Permissions>,
    connections: DashMap<u64, ConnEntry>,
    subscriptions: DashMap<u64, SubEntry>,
    next_id: AtomicU64,
}

struct ConnEntry {
    identity: Option<String>,
    permissions: Permissions,
    token: CancellationToken,
}

struct SubEntry {
    conn: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl Broker {
    /// `admin_token` enables [`Credentials::Admin`] connections.
    pub fn new(admin_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                admin_token,
                ..Inner::default()
            }),
        }
    }

    /// Install or replace the permissions of a device identity.
    pub fn authorize(&self, identity: &str, permissions: Permissions) {
        debug!(identity, ?permissions, "authorized bus identity");
        self.inner
            .identities
            .insert(identity.to_string(), permissions);
    }

    /// Remove a device identity and close its live connections.
    pub fn revoke(&self, identity: &str) -> usize {
        self.inner.identities.remove(identity);
        let ids: Vec<u64> = self
            .inner
            .connections
            .iter()
            .filter(|c| c.identity.as_deref() == Some(identity))
            .map(|c| *c.key())
            .collect();
        for id in &ids {
            self.inner.close(*id);
        }
        info!(identity, closed = ids.len(), "revoked bus identity");
        ids.len()
    }

    pub fn is_authorized(&self, identity: &str) -> bool {
        self.inner.identities.contains_key(identity)
    }

    /// Open an in-process connection.
    pub fn connect(&self, credentials: &Credentials) -> Result<LocalConnection, BusError> {
        let nonce = identity::new_nonce();
        match credentials.prove(&nonce) {
            None => Ok(self.open(None, Permissions::allow_all())),
            Some(proof) => self.attach(&nonce, &proof),
        }
    }

    /// Open a connection for a client that answered `nonce` with `proof`.
    pub fn attach(&self, nonce: &Nonce, proof: &Proof) -> Result<LocalConnection, BusError> {
        match proof {
            Proof::Admin { token } => {
                let expected = self.inner.admin_token.as_deref();
                if expected.is_none_or(|t| t != token) {
                    warn!("rejected admin connection with bad token");
                    return Err(BusError::Unauthorized);
                }
                Ok(self.open(None, Permissions::publish_only(["admin.>"])))
            }
            Proof::Invite { token } => {
                if token.is_empty() {
                    return Err(BusError::Unauthorized);
                }
                Ok(self.open(None, Permissions::publish_only(["register"])))
            }
            Proof::Device {
                public_key,
                signature,
            } => {
                let identity = identity::verify_device(nonce, public_key, signature)?;
                let permissions = self
                    .inner
                    .identities
                    .get(&identity)
                    .map(|p| p.value().clone())
                    .ok_or(BusError::Unauthorized)?;
                Ok(self.open(Some(identity), permissions))
            }
        }
    }

    fn open(&self, identity: Option<String>, permissions: Permissions) -> LocalConnection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let permissions = permissions.with_subscribe(format!("{INBOX_PREFIX}.{id}.>"));
        let token = CancellationToken::new();
        debug!(conn = id, identity = ?identity, "bus connection opened");
        self.inner.connections.insert(
            id,
            ConnEntry {
                identity,
                permissions,
                token: token.clone(),
            },
        );
        LocalConnection {
            inner: self.inner.clone(),
            id,
            token,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl Inner {
    fn close(&self, conn: u64) {
        if let Some((_, entry)) = self.connections.remove(&conn) {
            entry.token.cancel();
        }
        self.subscriptions.retain(|_, sub| sub.conn != conn);
    }

    fn permissions(&self, conn: u64) -> Result<Permissions, BusError> {
        self.connections
            .get(&conn)
            .map(|c| c.permissions.clone())
            .ok_or(BusError::Closed)
    }

    fn route(&self, message: Message) -> usize {
        let targets: Vec<(u64, mpsc::UnboundedSender<Message>)> = self
            .subscriptions
            .iter()
            .filter(|s| pattern::matches(&s.pattern, &message.subject))
            .map(|s| (*s.key(), s.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (sid, tx) in targets {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                self.subscriptions.remove(&sid);
            }
        }
        delivered
    }
}

/// A connection to a [`Broker`] in the same process.
#[derive(Clone)]
pub struct LocalConnection {
    inner: Arc<Inner>,
    id: u64,
    token: CancellationToken,
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection").field("id", &self.id).finish()
    }
}

impl LocalConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the connection is drained or revoked.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

impl Bus for LocalConnection {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        pattern::validate(&message.subject, false)?;
        let permissions = self.inner.permissions(self.id)?;
        if !permissions.can_publish(&message.subject) {
            return Err(BusError::PermissionDenied {
                op: "publish",
                subject: message.subject,
            });
        }
        if let Some(reply) = &message.reply {
            pattern::validate(reply, false)?;
            let inbox = format!("{}.>", self.inbox_prefix());
            if !permissions.is_unrestricted() && !pattern::matches(&inbox, reply) {
                return Err(BusError::PermissionDenied {
                    op: "reply",
                    subject: reply.clone(),
                });
            }
        }
        let delivered = self.inner.route(message);
        debug!(conn = self.id, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        pattern::validate(subject, true)?;
        if !self.inner.permissions(self.id)?.can_subscribe(subject) {
            return Err(BusError::PermissionDenied {
                op: "subscribe",
                subject: subject.to_string(),
            });
        }

        let sid = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions.insert(
            sid,
            SubEntry {
                conn: self.id,
                pattern: subject.to_string(),
                tx,
            },
        );
        debug!(conn = self.id, sid, subject, "subscribed");
        Ok(Subscription::new(sid, subject.to_string(), rx))
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), BusError> {
        self.inner
            .subscriptions
            .remove_if(&sid, |_, sub| sub.conn == self.id);
        Ok(())
    }

    fn inbox_prefix(&self) -> String {
        format!("{INBOX_PREFIX}.{}", self.id)
    }

    async fn drain(&self) {
        self.inner.close(self.id);
        debug!(conn = self.id, "drained bus connection");
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}
