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

//! Address allocation within a network's CIDR.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use wiremesh_types::Network;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("no free addresses left in {cidr}")]
    Exhausted { cidr: Ipv4Network },
}

/// First address after the network address that no member holds.
///
/// The scan stops short of the broadcast address. Callers hold the
/// network's lock across allocate, append and persist.
pub fn allocate(network: &Network) -> Result<Ipv4Addr, AllocationError> {
    let cidr = network.cidr;
    let first = u32::from(cidr.network()).saturating_add(1);
    let broadcast = u32::from(cidr.broadcast());

    let mut taken: Vec<u32> = network
        .peers
        .iter()
        .map(|p| u32::from(p.address))
        .filter(|a| (first..broadcast).contains(a))
        .collect();
    taken.sort_unstable();
    taken.dedup();

    let mut candidate = first;
    for addr in taken {
        if addr != candidate {
            break;
        }
        candidate += 1;
    }

    if candidate >= broadcast {
        return Err(AllocationError::Exhausted { cidr });
    }
    Ok(Ipv4Addr::from(candidate))
}
