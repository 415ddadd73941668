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

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{debug, warn};

use crate::{KvStore, StoreError};

const EXTENSION: &str = "json";

/// One directory per table, one file per record.
///
/// Keys are base64url-encoded into file names since WireGuard keys contain
/// `/`. Writes go through a temporary file and a rename so a crash never
/// leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf, StoreError> {
        if table.is_empty()
            || !table
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(StoreError::InvalidTable(table.to_string()));
        }
        Ok(self.root.join(table))
    }

    fn record_path(&self, table: &str, key: &str) -> Result<PathBuf, StoreError> {
        let name = format!("{}.{EXTENSION}", URL_SAFE_NO_PAD.encode(key));
        Ok(self.table_dir(table)?.join(name))
    }
}

fn decode_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
    let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

impl KvStore for FileStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.record_path(table, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.record_path(table, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(table, path = %path.display(), "stored record");
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(table, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let dir = self.table_dir(table)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(decode_name) else {
                warn!(table, file = ?file_name, "skipping unrecognised file in table directory");
                continue;
            };
            let bytes = tokio::fs::read(entry.path()).await?;
            rows.push((key, bytes));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}
