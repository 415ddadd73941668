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

//! Same-LAN reachability probe.
//!
//! The client connects over TCP to a peer's private address on its listen
//! port and writes [`PREAMBLE`]; the responder answers with its 44-byte
//! WireGuard public key. A verbatim match means the private address really
//! belongs to that peer.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wiremesh_types::KEY_LEN;

pub const PREAMBLE: &[u8] = b"WMPROBE.";

/// Longest preamble the responder reads before giving up on a client.
const MAX_PREAMBLE: usize = 64;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("peer answered with a different key")]
    KeyMismatch,
}

/// Check that `addr` answers with `expected_key`.
#[tracing::instrument(skip(expected_key))]
pub async fn probe(addr: SocketAddr, expected_key: &str, timeout: Duration) -> Result<(), ProbeError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(PREAMBLE).await?;
        let mut answer = [0u8; KEY_LEN];
        stream.read_exact(&mut answer).await?;
        Ok::<_, ProbeError>(answer)
    };

    let answer = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout)??;
    if answer.as_slice() != expected_key.as_bytes() {
        return Err(ProbeError::KeyMismatch);
    }
    debug!("private endpoint confirmed");
    Ok(())
}

/// Answer probes on `listener` with `public_key` until `shutdown`.
pub async fn respond(listener: TcpListener, public_key: String, shutdown: CancellationToken) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "probe responder listening");

    let mut failures = 0u32;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    warn!(error = %e, ?delay, "probe responder accept failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };
        failures = 0;

        let key = public_key.clone();
        tokio::spawn(async move {
            let answered = tokio::time::timeout(Duration::from_secs(5), answer(stream, &key)).await;
            match answered {
                Ok(Ok(())) => debug!(%peer, "answered probe"),
                Ok(Err(e)) => debug!(%peer, error = %e, "dropped probe"),
                Err(_) => debug!(%peer, "probe client stalled"),
            }
        });
    }
    debug!(addr = ?local, "probe responder stopped");
}

/// Delay before accepting again after `failures` consecutive errors.
/// Persistent errors such as fd exhaustion would otherwise spin the loop.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn answer(mut stream: TcpStream, key: &str) -> std::io::Result<()> {
    let mut preamble = Vec::with_capacity(PREAMBLE.len());
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        preamble.push(byte[0]);
        if byte[0] == b'.' {
            break;
        }
        if preamble.len() >= MAX_PREAMBLE {
            return Err(std::io::Error::other("preamble too long"));
        }
    }
    if preamble != PREAMBLE {
        return Err(std::io::Error::other("unexpected preamble"));
    }
    stream.write_all(key.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";
    const OTHER: &str = "YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=";

    async fn responder(key: &str) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(respond(listener, key.to_string(), token.clone()));
        (addr, token)
    }

    #[tokio::test]
    async fn matching_key_succeeds() {
        let (addr, token) = responder(KEY).await;
        probe(addr, KEY, Duration::from_secs(1)).await.unwrap();
        token.cancel();
    }

    #[tokio::test]
    async fn different_key_is_rejected() {
        let (addr, token) = responder(OTHER).await;
        let err = probe(addr, KEY, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::KeyMismatch));
        token.cancel();
    }

    #[tokio::test]
    async fn closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(probe(addr, KEY, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let err = probe(addr, KEY, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout));
        drop(listener);
    }

    #[test]
    fn accept_failures_back_off_up_to_a_cap() {
        assert_eq!(accept_backoff(1), ACCEPT_BACKOFF_MIN);
        assert_eq!(accept_backoff(2), ACCEPT_BACKOFF_MIN * 2);
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(50), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn responder_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(respond(listener, KEY.to_string(), token.clone()));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("responder did not stop")
            .unwrap();
    }
}
