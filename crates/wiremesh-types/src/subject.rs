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

//! Subject naming for the bus.
//!
//! Device-originated subjects are `<pubkey>.<op>`; the key is always
//! [`KEY_LEN`] characters, so it is split off by position rather than by
//! searching for the first dot.

use std::fmt;
use std::str::FromStr;

use crate::error::MeshError;
use crate::model::{KEY_LEN, is_valid_key};

/// Devices holding only an invitation publish here.
pub const REGISTER: &str = "register";

/// Every network broadcast.
pub const ALL_NETWORKS: &str = "networks.>";

const NETWORKS_PREFIX: &str = "networks.";
const UPDATE_PREFIX: &str = "update.";
const ADMIN_PREFIX: &str = "admin.";

/// Operations a device may request under its own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerOp {
    /// Liveness report.
    Checkin,
    /// Join a network.
    Join,
    /// Leave a network.
    Leave,
    /// Leave the server entirely.
    LeaveServer,
    /// Fetch a full snapshot.
    Reload,
    /// Report new listen ports or endpoints.
    UpdatePorts,
}

impl PeerOp {
    /// Every operation, for subscribing.
    pub const ALL: [PeerOp; 6] = [
        Self::Checkin,
        Self::Join,
        Self::Leave,
        Self::LeaveServer,
        Self::Reload,
        Self::UpdatePorts,
    ];

    /// The subject token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkin => "checkin",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::LeaveServer => "leaveServer",
            Self::Reload => "reload",
            Self::UpdatePorts => "updatePorts",
        }
    }

    /// Wildcard subject matching this op for every key.
    pub fn wildcard(self) -> String {
        format!("*.{}", self.as_str())
    }
}

impl fmt::Display for PeerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerOp {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or(MeshError::InvalidSubject)
    }
}

/// `<pubkey>.<op>`
pub fn peer_subject(key: &str, op: PeerOp) -> String {
    format!("{key}.{op}")
}

/// Split `<pubkey>.<op>` back into its parts.
pub fn parse_peer_subject(subject: &str) -> Result<(&str, PeerOp), MeshError> {
    if subject.len() <= KEY_LEN + 1 || subject.as_bytes()[KEY_LEN] != b'.' {
        return Err(MeshError::InvalidSubject);
    }
    let (key, rest) = subject.split_at(KEY_LEN);
    if !is_valid_key(key) {
        return Err(MeshError::InvalidSubject);
    }
    let op = rest[1..].parse()?;
    Ok((key, op))
}

/// Everything a device may publish: `<pubkey>.>`.
pub fn peer_namespace(key: &str) -> String {
    format!("{key}.>")
}

/// `networks.<name>`
pub fn network_subject(name: &str) -> String {
    format!("{NETWORKS_PREFIX}{name}")
}

/// The network name from `networks.<name>`.
pub fn parse_network_subject(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(NETWORKS_PREFIX)
        .filter(|name| !name.is_empty() && !name.contains('.'))
}

/// `update.<pubkey>.<action>`
pub fn update_subject(key: &str, action: &str) -> String {
    format!("{UPDATE_PREFIX}{key}.{action}")
}

/// Everything the server can send directly to one device.
pub fn update_namespace(key: &str) -> String {
    format!("{UPDATE_PREFIX}{key}.>")
}

/// The key and action from `update.<pubkey>.<action>`.
pub fn parse_update_subject(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix(UPDATE_PREFIX)?;
    if rest.len() <= KEY_LEN + 1 || rest.as_bytes()[KEY_LEN] != b'.' {
        return None;
    }
    let (key, action) = rest.split_at(KEY_LEN);
    Some((key, &action[1..]))
}

/// `admin.<op>`
pub fn admin_subject(op: &str) -> String {
    format!("{ADMIN_PREFIX}{op}")
}

/// Everything an admin may publish.
pub const ADMIN_NAMESPACE: &str = "admin.>";

/// The op from `admin.<op>`.
pub fn parse_admin_subject(subject: &str) -> Option<&str> {
    subject.strip_prefix(ADMIN_PREFIX)
}
