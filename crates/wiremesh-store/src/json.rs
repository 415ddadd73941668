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

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{KvStore, StoreError};

pub async fn get<T: DeserializeOwned, S: KvStore>(
    store: &S,
    table: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.get(table, key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            table: table.to_string(),
            key: key.to_string(),
            source,
        })
}

pub async fn put<T: Serialize + Sync, S: KvStore>(
    store: &S,
    table: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(StoreError::Encode)?;
    store.put(table, key, bytes).await
}

pub async fn scan<T: DeserializeOwned, S: KvStore>(
    store: &S,
    table: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .scan(table)
        .await?
        .into_iter()
        .map(|(key, bytes)| {
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                table: table.to_string(),
                key,
                source,
            })
        })
        .collect()
}
