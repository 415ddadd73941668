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

//! Requests from this device to the membership server.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use wiremesh_bus::{Bus, BusError, request_json};
use wiremesh_types::proto::{
    CheckinRequest, CheckinResponse, Empty, JoinRequest, LeaveRequest, RegisterRequest,
    RegisterResponse, ReloadResponse, UpdatePortsRequest,
};
use wiremesh_types::subject::{PeerOp, REGISTER, peer_subject};
use wiremesh_types::{MeshError, NetworkPeer, Reply};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("server rejected request: {0}")]
    Rejected(#[from] MeshError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl RpcError {
    /// The server no longer knows this device.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Rejected(MeshError::PeerNotFound))
    }

    /// The request never got an answer; the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Bus(BusError::Timeout | BusError::Closed | BusError::Io(_))
        )
    }
}

async fn call<B, Req, Resp>(bus: &B, subject: &str, req: &Req, timeout: Duration) -> Result<Resp, RpcError>
where
    B: Bus,
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let reply: Reply<Resp> = request_json(bus, subject, req, timeout).await?;
    match reply.into_result() {
        Ok(resp) => Ok(resp),
        Err(e) => {
            debug!(subject, error = %e, "request rejected");
            Err(e.into())
        }
    }
}

#[tracing::instrument(skip(bus, req), fields(peer = %req.public_key))]
pub async fn register<B: Bus>(bus: &B, req: &RegisterRequest, timeout: Duration) -> Result<RegisterResponse, RpcError> {
    let resp: RegisterResponse = call(bus, REGISTER, req, timeout).await?;
    info!("registered with server");
    Ok(resp)
}

pub async fn checkin<B: Bus>(
    bus: &B,
    key: &str,
    req: &CheckinRequest,
    timeout: Duration,
) -> Result<CheckinResponse, RpcError> {
    call(bus, &peer_subject(key, PeerOp::Checkin), req, timeout).await
}

#[tracing::instrument(skip(bus, key, req), fields(network = %req.network))]
pub async fn join<B: Bus>(bus: &B, key: &str, req: &JoinRequest, timeout: Duration) -> Result<NetworkPeer, RpcError> {
    let member: NetworkPeer = call(bus, &peer_subject(key, PeerOp::Join), req, timeout).await?;
    info!(address = %member.address, "joined network");
    Ok(member)
}

#[tracing::instrument(skip(bus, key))]
pub async fn leave<B: Bus>(bus: &B, key: &str, network: &str, timeout: Duration) -> Result<(), RpcError> {
    let req = LeaveRequest {
        network: network.to_string(),
    };
    let _: Empty = call(bus, &peer_subject(key, PeerOp::Leave), &req, timeout).await?;
    info!("left network");
    Ok(())
}

#[tracing::instrument(skip(bus, key))]
pub async fn leave_server<B: Bus>(bus: &B, key: &str, timeout: Duration) -> Result<(), RpcError> {
    let _: Empty = call(bus, &peer_subject(key, PeerOp::LeaveServer), &Empty {}, timeout).await?;
    warn!("left server; this device must register again to rejoin");
    Ok(())
}

pub async fn reload<B: Bus>(bus: &B, key: &str, timeout: Duration) -> Result<ReloadResponse, RpcError> {
    call(bus, &peer_subject(key, PeerOp::Reload), &Empty {}, timeout).await
}

#[tracing::instrument(skip(bus, key, req), fields(network = %req.network, listen_port = req.listen_port, public_listen_port = req.public_listen_port))]
pub async fn update_ports<B: Bus>(
    bus: &B,
    key: &str,
    req: &UpdatePortsRequest,
    timeout: Duration,
) -> Result<NetworkPeer, RpcError> {
    call(bus, &peer_subject(key, PeerOp::UpdatePorts), req, timeout).await
}
