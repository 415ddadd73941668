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

//! wiremesh-types: Shared definitions for the wiremesh control plane.
//!
//! This crate contains the data model, protocol messages, subject naming and
//! wire error codes shared between the membership server and the node agent,
//! along with the topology transform that both sides run to turn a network's
//! peer list into a directly-routable peer set.

#![warn(missing_docs)]

pub mod error;
pub mod model;
pub mod proto;
pub mod subject;
pub mod topology;

pub use error::MeshError;
pub use model::{
    ConnectivitySample, KEY_LEN, Network, NetworkPeer, Peer, is_valid_key, is_valid_network_name,
};
pub use proto::{Action, DirectUpdate, NetworkEvent, Reply};
