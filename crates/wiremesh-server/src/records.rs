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

//! Typed tables over the key-value store.

use wiremesh_store::{KvStore, StoreError, json};
use wiremesh_types::{Network, Peer};

use crate::tokens::Invite;

const PEERS: &str = "peers";
const NETWORKS: &str = "networks";
const INVITES: &str = "invites";

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct Records<S> {
    store: S,
}

impl<S: KvStore> Records<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    // -- Peers ---------------------------------------------------------------

    pub async fn get_peer(&self, key: &str) -> Result<Option<Peer>> {
        json::get(&self.store, PEERS, key).await
    }

    #[tracing::instrument(skip(self, peer), fields(peer = %peer.public_key))]
    pub async fn put_peer(&self, peer: &Peer) -> Result<()> {
        json::put(&self.store, PEERS, &peer.public_key, peer).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_peer(&self, key: &str) -> Result<bool> {
        self.store.delete(PEERS, key).await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        json::scan(&self.store, PEERS).await
    }

    // -- Networks ------------------------------------------------------------

    pub async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        json::get(&self.store, NETWORKS, name).await
    }

    #[tracing::instrument(skip(self, network), fields(network = %network.name, peers = network.peers.len()))]
    pub async fn put_network(&self, network: &Network) -> Result<()> {
        json::put(&self.store, NETWORKS, &network.name, network).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_network(&self, name: &str) -> Result<bool> {
        self.store.delete(NETWORKS, name).await
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        json::scan(&self.store, NETWORKS).await
    }

    /// Every network `key` is a member of.
    pub async fn networks_of(&self, key: &str) -> Result<Vec<Network>> {
        let mut networks = self.list_networks().await?;
        networks.retain(|n| n.contains(key));
        Ok(networks)
    }

    // -- Invites -------------------------------------------------------------

    pub async fn get_invite(&self, token: &str) -> Result<Option<Invite>> {
        json::get(&self.store, INVITES, token).await
    }

    #[tracing::instrument(skip_all, fields(uses_left = invite.uses_left))]
    pub async fn put_invite(&self, invite: &Invite) -> Result<()> {
        json::put(&self.store, INVITES, &invite.token, invite).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn delete_invite(&self, token: &str) -> Result<bool> {
        self.store.delete(INVITES, token).await
    }
}
