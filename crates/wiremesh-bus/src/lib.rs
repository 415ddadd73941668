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

//! wiremesh-bus: topic-based pub/sub with request/reply and per-identity
//! subject permissions.
//!
//! [`Broker`] routes messages in-process. [`remote::serve`] exposes a broker
//! over TCP and [`RemoteConnection`] talks to it from another process; both
//! connection kinds implement [`Bus`], so the server and agent are written
//! against the trait.

pub mod acl;
pub mod broker;
pub mod identity;
pub mod pattern;
pub mod remote;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use acl::Permissions;
pub use broker::{Broker, LocalConnection};
pub use identity::{Credentials, Proof};
pub use remote::RemoteConnection;

/// Prefix of every reply inbox.
pub const INBOX_PREFIX: &str = "_INBOX";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("permission denied to {op} {subject}")]
    PermissionDenied { op: &'static str, subject: String },

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("authentication failed")]
    Unauthorized,

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Messages delivered to one subscription, in publish order.
#[derive(Debug)]
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub(crate) fn new(sid: u64, subject: String, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { sid, subject, rx }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// `None` once the subscription is removed or the connection closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// One authenticated connection to the bus.
pub trait Bus: Send + Sync + 'static {
    /// Publish a message, honouring its reply subject.
    fn send(&self, message: Message) -> impl Future<Output = Result<(), BusError>> + Send;

    fn subscribe(&self, subject: &str)
    -> impl Future<Output = Result<Subscription, BusError>> + Send;

    fn unsubscribe(&self, sid: u64) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Subject prefix this connection may receive replies on.
    fn inbox_prefix(&self) -> String;

    /// Remove every subscription and close the connection.
    fn drain(&self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;

    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        self.send(Message::new(subject, payload))
    }

    /// Publish with a private reply inbox and wait for the first answer.
    fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Message, BusError>> + Send {
        let subject = subject.to_string();
        async move {
            let inbox = format!("{}.{}", self.inbox_prefix(), Uuid::new_v4().simple());
            let mut sub = self.subscribe(&inbox).await?;
            let message = Message {
                subject,
                reply: Some(inbox),
                payload,
            };

            let result = match self.send(message).await {
                Ok(()) => match tokio::time::timeout(timeout, sub.next()).await {
                    Ok(Some(reply)) => Ok(reply),
                    Ok(None) => Err(BusError::Closed),
                    Err(_) => Err(BusError::Timeout),
                },
                Err(e) => Err(e),
            };

            if !self.is_closed() {
                let _ = self.unsubscribe(sub.sid()).await;
            }
            result
        }
    }
}

/// Publish `value` as JSON.
pub async fn publish_json<B: Bus, T: Serialize + Sync>(
    bus: &B,
    subject: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, payload).await
}

/// Answer `request` on its reply subject. Messages without one are ignored.
pub async fn respond_json<B: Bus, T: Serialize + Sync>(
    bus: &B,
    request: &Message,
    value: &T,
) -> Result<(), BusError> {
    let Some(reply) = &request.reply else {
        return Ok(());
    };
    let payload = serde_json::to_vec(value)?;
    bus.publish(reply, payload).await
}

/// Send a JSON request and decode the JSON reply.
pub async fn request_json<B: Bus, Req: Serialize + Sync, Resp: DeserializeOwned>(
    bus: &B,
    subject: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, BusError> {
    let payload = serde_json::to_vec(request)?;
    let reply = bus.request(subject, payload, timeout).await?;
    reply
        .json()
        .map_err(|e| BusError::Protocol(format!("undecodable reply on {subject}: {e}")))
}
