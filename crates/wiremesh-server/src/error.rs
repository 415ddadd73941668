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

use wiremesh_bus::BusError;
use wiremesh_store::StoreError;
use wiremesh_types::MeshError;

use crate::allocator::AllocationError;

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Rejected(#[from] MeshError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<AuthorityError> for MeshError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Rejected(e) => e,
            AuthorityError::Allocation(AllocationError::Exhausted { .. }) => Self::Exhausted,
            AuthorityError::Store(_) | AuthorityError::Bus(_) => {
                tracing::error!(error = %err, "authority error");
                Self::Internal
            }
        }
    }
}
