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

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use wiremesh_store::{KvStore, StoreError, json};
use wiremesh_types::Network;

use crate::device::Device;

const DEVICE: &str = "device";
const DEVICE_KEY: &str = "self";
const NETWORKS: &str = "networks";

/// This device's view of one network it belongs to, plus the local
/// interface that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Last known network snapshot, own record included.
    pub network: Network,
    /// Interface slot; the interface is `<prefix><index>`.
    pub index: u32,
    pub interface: String,
    /// Port the interface listens on.
    pub listen_port: u16,
    /// Port as seen from outside the NAT.
    pub public_listen_port: u16,
    /// Public address seen by STUN when the interface last started.
    pub endpoint: Option<IpAddr>,
}

type Result<T> = std::result::Result<T, StoreError>;

pub struct LocalRecords<S> {
    store: S,
}

impl<S: KvStore> LocalRecords<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn get_device(&self) -> Result<Option<Device>> {
        json::get(&self.store, DEVICE, DEVICE_KEY).await
    }

    pub async fn put_device(&self, device: &Device) -> Result<()> {
        json::put(&self.store, DEVICE, DEVICE_KEY, device).await
    }

    pub async fn get_membership(&self, network: &str) -> Result<Option<Membership>> {
        json::get(&self.store, NETWORKS, network).await
    }

    #[tracing::instrument(skip(self, membership), fields(network = %membership.network.name, interface = %membership.interface))]
    pub async fn put_membership(&self, membership: &Membership) -> Result<()> {
        json::put(&self.store, NETWORKS, &membership.network.name, membership).await?;
        debug!(peers = membership.network.peers.len(), "saved membership");
        Ok(())
    }

    pub async fn delete_membership(&self, network: &str) -> Result<bool> {
        self.store.delete(NETWORKS, network).await
    }

    pub async fn list_memberships(&self) -> Result<Vec<Membership>> {
        json::scan(&self.store, NETWORKS).await
    }
}
