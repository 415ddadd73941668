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

//! Error codes that travel over the bus in request/reply payloads.

use serde::{Deserialize, Serialize};

/// A failure reported by the membership server to a requester.
///
/// These are the only errors a device ever sees from the server; anything
/// internal is collapsed into [`MeshError::Internal`] before it leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum MeshError {
    /// The key is already a member of the network.
    #[error("peer is already a member of this network")]
    AlreadyMember,

    /// The key is not a member of the network.
    #[error("peer is not a member of this network")]
    NotMember,

    /// No network with that name exists.
    #[error("network not found")]
    NetworkNotFound,

    /// A network with that name already exists.
    #[error("network already exists")]
    DuplicateNetwork,

    /// The invitation token is malformed, expired or used up.
    #[error("invalid invitation token")]
    InvalidToken,

    /// The public key is already registered.
    #[error("peer already registered")]
    DuplicatePeer,

    /// The key is not registered with the server.
    #[error("peer not found")]
    PeerNotFound,

    /// Every usable address in the network is taken.
    #[error("no free addresses left in network")]
    Exhausted,

    /// The device's own key is missing from the network it was asked to start.
    #[error("own key not present in network peer list")]
    NoSelfAddress,

    /// The subject did not carry a well-formed public key.
    #[error("invalid subject")]
    InvalidSubject,

    /// The request payload could not be decoded or failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The relay assignment would make a peer both relay and relayed.
    #[error("relay conflict: {0}")]
    RelayConflict(String),

    /// The subnet overlaps one already routed in the network.
    #[error("subnet {0} already in use")]
    SubnetInUse(String),

    /// Something went wrong on the server side.
    #[error("internal server error")]
    Internal,
}
