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

//! wiremesh-server: the membership authority for wiremesh networks.
//!
//! The server hosts the bus broker, answers device and admin requests
//! through the [`dispatch::Dispatcher`], and keeps Peer, Network and Invite
//! records in a [`wiremesh_store::KvStore`].

pub mod allocator;
pub mod authority;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod records;
pub mod sweep;
pub mod tokens;

pub use authority::Authority;
pub use dispatch::Dispatcher;
pub use error::AuthorityError;
