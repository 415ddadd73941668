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

//! wiremesh-agent: keeps this device's WireGuard interfaces in line with the
//! networks it belongs to.
//!
//! The [`agent::Agent`] holds one bus connection to the membership server
//! and feeds topology events to a per-network actor, which drives a
//! [`reconcile::Reconciler`] over the [`netlink::Platform`] and
//! [`firewall::Firewall`] seams.

pub mod actor;
pub mod agent;
pub mod api;
pub mod config;
pub mod device;
pub mod firewall;
pub mod nat;
pub mod netlink;
pub mod reconcile;
pub mod records;
pub mod slot;

pub use agent::Agent;
pub use config::AgentConfig;
pub use device::Device;
