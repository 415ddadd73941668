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

//! The agent's single bus connection, swapped atomically on reconnect.

use std::future::Future;

use tokio::sync::Mutex;
use tracing::{debug, info};

use wiremesh_bus::{Broker, Bus, BusError, Credentials, LocalConnection, RemoteConnection};

/// Opens bus connections for the agent.
pub trait Connector: Send + Sync + 'static {
    type Conn: Bus + Clone;

    fn connect(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Conn, BusError>> + Send;
}

/// Connects to a broker over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Conn = RemoteConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<RemoteConnection, BusError> {
        RemoteConnection::connect(self.addr.as_str(), credentials).await
    }
}

/// Attaches to a broker running in the same process.
impl Connector for Broker {
    type Conn = LocalConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<LocalConnection, BusError> {
        Broker::connect(self, credentials)
    }
}

/// Holds at most one live connection. Replacing it drains the old one
/// first so no subscription is delivered twice.
pub struct ConnectionSlot<B> {
    current: Mutex<Option<B>>,
}

impl<B> Default for ConnectionSlot<B> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<B: Bus + Clone> ConnectionSlot<B> {
    /// The current connection, unless there is none or it has closed.
    pub async fn get(&self) -> Option<B> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    pub async fn is_connected(&self) -> bool {
        self.get().await.is_some()
    }

    /// Drain the current connection and install `fresh` in its place.
    pub async fn swap(&self, fresh: B) {
        let mut current = self.current.lock().await;
        if let Some(old) = current.take() {
            debug!("draining previous connection");
            old.drain().await;
        }
        *current = Some(fresh);
        info!("bus connection established");
    }

    /// Drain and forget the current connection.
    pub async fn clear(&self) {
        if let Some(old) = self.current.lock().await.take() {
            old.drain().await;
            debug!("bus connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_drains_previous_connection() {
        let broker = Broker::new(None);
        let slot = ConnectionSlot::default();
        assert!(slot.get().await.is_none());

        let first = Connector::connect(&broker, &Credentials::Server).await.unwrap();
        slot.swap(first.clone()).await;
        assert!(slot.is_connected().await);

        let second = Connector::connect(&broker, &Credentials::Server).await.unwrap();
        slot.swap(second.clone()).await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(slot.get().await.map(|c| c.id()), Some(second.id()));

        slot.clear().await;
        assert!(second.is_closed());
        assert!(!slot.is_connected().await);
    }

    #[tokio::test]
    async fn closed_connection_reads_as_absent() {
        let broker = Broker::new(None);
        let slot = ConnectionSlot::default();
        let conn = Connector::connect(&broker, &Credentials::Server).await.unwrap();
        slot.swap(conn.clone()).await;

        conn.drain().await;
        assert!(slot.get().await.is_none());
    }
}
