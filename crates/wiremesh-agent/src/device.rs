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

//! The long-lived identity of this machine.

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use wiremesh_bus::Credentials;
use wiremesh_bus::identity::encode_verifying_key;
use wiremesh_store::{KvStore, StoreError};
use wiremesh_types::proto::RegisterRequest;

use crate::records::LocalRecords;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("device is not registered with a server")]
    NotRegistered,
}

/// Keys and facts about this machine, persisted once and reused forever.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// WireGuard private key, base64.
    pub private_key: String,
    /// WireGuard public key, base64 (44 chars).
    pub public_key: String,
    /// Ed25519 seed for bus authentication, base64.
    pub signing_key: String,
    pub hostname: String,
    pub os: String,
    pub version: String,
    /// Last STUN-discovered public address.
    pub endpoint: Option<IpAddr>,
    /// Bus address of the server this device registered with.
    pub server: Option<String>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("public_key", &self.public_key)
            .field("hostname", &self.hostname)
            .field("os", &self.os)
            .field("version", &self.version)
            .field("endpoint", &self.endpoint)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Fresh keys plus this machine's hostname and OS.
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let public = PublicKey::from(&secret);
        let signing: [u8; 32] = rand::random();

        Self {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
            signing_key: BASE64.encode(signing),
            hostname: local_hostname(),
            os: std::env::consts::OS.to_string(),
            version: env!("GIT_VERSION").to_string(),
            endpoint: None,
            server: None,
        }
    }

    /// Load the persisted device, creating and saving one on first run.
    ///
    /// Keys are never regenerated once stored; only the reported version is
    /// refreshed.
    pub async fn load_or_create<S: KvStore>(records: &LocalRecords<S>) -> Result<Self, DeviceError> {
        if let Some(mut device) = records.get_device().await? {
            let version = env!("GIT_VERSION");
            if device.version != version {
                device.version = version.to_string();
                records.put_device(&device).await?;
            }
            return Ok(device);
        }

        let device = Self::generate();
        records.put_device(&device).await?;
        info!(public_key = %device.public_key, hostname = %device.hostname, "generated device identity");
        Ok(device)
    }

    pub fn signing_key(&self) -> Result<SigningKey, DeviceError> {
        Ok(SigningKey::from_bytes(&decode_key(&self.signing_key)?))
    }

    /// Bus credentials for a registered device.
    pub fn credentials(&self) -> Result<Credentials, DeviceError> {
        Ok(Credentials::Device(self.signing_key()?))
    }

    /// The registration request for an invitation token.
    pub fn register_request(&self, token: &str) -> Result<RegisterRequest, DeviceError> {
        Ok(RegisterRequest {
            token: token.to_string(),
            public_key: self.public_key.clone(),
            signing_key: encode_verifying_key(&self.signing_key()?.verifying_key()),
            hostname: self.hostname.clone(),
            os: self.os.clone(),
            version: self.version.clone(),
            endpoint: self.endpoint,
        })
    }

    pub fn server(&self) -> Result<&str, DeviceError> {
        self.server.as_deref().ok_or(DeviceError::NotRegistered)
    }
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], DeviceError> {
    let bytes = BASE64.decode(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| DeviceError::InvalidKeyLength(len))
}

fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
