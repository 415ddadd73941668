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

//! Minimal STUN binding client (RFC 5389), enough to learn the mapped
//! address of a UDP socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

#[derive(Debug, Error)]
pub enum StunError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no STUN server answered")]
    NoResponse,

    #[error("could not resolve STUN server {0}")]
    Resolve(String),

    #[error("malformed STUN response: {0}")]
    Malformed(&'static str),

    #[error("STUN response has no mapped address")]
    NoMappedAddress,
}

pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    fastrand::fill(&mut id);
    id
}

pub fn encode_request(txid: &TransactionId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length stays zero: no attributes.
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(txid);
    buf
}

/// Extract the mapped address from a binding success response for `txid`.
/// `XOR-MAPPED-ADDRESS` wins over the legacy `MAPPED-ADDRESS`.
pub fn parse_response(buf: &[u8], txid: &TransactionId) -> Result<SocketAddr, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::Malformed("short header"));
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != BINDING_SUCCESS {
        return Err(StunError::Malformed("not a binding success"));
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return Err(StunError::Malformed("bad magic cookie"));
    }
    if &buf[8..20] != txid {
        return Err(StunError::Malformed("transaction id mismatch"));
    }

    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let body = buf
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(StunError::Malformed("truncated body"))?;

    let mut mapped = None;
    let mut rest = body;
    while rest.len() >= 4 {
        let kind = u16::from_be_bytes([rest[0], rest[1]]);
        let attr_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let value = rest
            .get(4..4 + attr_len)
            .ok_or(StunError::Malformed("truncated attribute"))?;

        match kind {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(txid)),
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }

        let padded = (attr_len + 3) & !3;
        rest = rest.get(4 + padded..).unwrap_or_default();
    }
    mapped.ok_or(StunError::NoMappedAddress)
}

fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Malformed("short address"));
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        FAMILY_V4 => {
            let raw: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::Malformed("short IPv4 address"))?;
            let mut octets = raw;
            if xor.is_some() {
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let raw: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::Malformed("short IPv6 address"))?;
            let mut octets = raw;
            if let Some(txid) = xor {
                let mask = cookie.iter().chain(txid.iter());
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::Malformed("unknown address family")),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Ask one server for `socket`'s mapped address.
#[tracing::instrument(skip(socket))]
pub async fn query(socket: &UdpSocket, server: &str, timeout: Duration) -> Result<SocketAddr, StunError> {
    let target = tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| StunError::Resolve(server.to_string()))?;

    let txid = new_transaction_id();
    socket.send_to(&encode_request(&txid), target).await?;

    let mut buf = [0u8; 512];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| StunError::NoResponse)??;
        if from != target {
            continue;
        }
        match parse_response(&buf[..len], &txid) {
            Ok(mapped) => {
                debug!(%mapped, "STUN mapped address");
                return Ok(mapped);
            }
            Err(StunError::Malformed("transaction id mismatch")) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Try each server in turn until one answers.
pub async fn discover(
    socket: &UdpSocket,
    servers: &[String],
    timeout: Duration,
) -> Result<SocketAddr, StunError> {
    for server in servers {
        match query(socket, server, timeout).await {
            Ok(mapped) => return Ok(mapped),
            Err(e) => warn!(server = %server, error = %e, "STUN query failed"),
        }
    }
    Err(StunError::NoResponse)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A binding success carrying `mapped` as XOR-MAPPED-ADDRESS.
    pub(crate) fn success_response(txid: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = mapped else {
            panic!("IPv4 only");
        };
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = v4.port() ^ (MAGIC_COOKIE >> 16) as u16;
        let mut ip = v4.ip().octets();
        for (o, c) in ip.iter_mut().zip(cookie) {
            *o ^= c;
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&cookie);
        buf.extend_from_slice(txid);
        buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0, FAMILY_V4]);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(&ip);
        buf
    }

    fn mapped() -> SocketAddr {
        "203.0.113.5:40123".parse().unwrap()
    }

    #[test]
    fn request_layout() {
        let txid = [7u8; 12];
        let req = encode_request(&txid);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[2..4], &[0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..], &txid);
    }

    #[test]
    fn decodes_xor_mapped_address() {
        let txid = new_transaction_id();
        let resp = success_response(&txid, mapped());
        assert_eq!(parse_response(&resp, &txid).unwrap(), mapped());
    }

    #[test]
    fn rejects_foreign_transaction() {
        let resp = success_response(&[1; 12], mapped());
        assert!(matches!(
            parse_response(&resp, &[2; 12]),
            Err(StunError::Malformed("transaction id mismatch"))
        ));
    }

    #[test]
    fn falls_back_to_plain_mapped_address() {
        let txid = [3u8; 12];
        let mut buf = Vec::new();
        buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&txid);
        buf.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0, FAMILY_V4]);
        buf.extend_from_slice(&3478u16.to_be_bytes());
        buf.extend_from_slice(&[198, 51, 100, 1]);

        assert_eq!(
            parse_response(&buf, &txid).unwrap(),
            "198.51.100.1:3478".parse().unwrap()
        );
    }

    #[test]
    fn truncated_response_is_malformed() {
        let txid = [4u8; 12];
        let resp = success_response(&txid, mapped());
        assert!(parse_response(&resp[..26], &txid).is_err());
        assert!(parse_response(&resp[..10], &txid).is_err());
    }

    #[tokio::test]
    async fn queries_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_LEN);
            let txid: TransactionId = buf[8..20].try_into().unwrap();
            let resp = success_response(&txid, from);
            server.send_to(&resp, from).await.unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = client.local_addr().unwrap();
        let servers = vec!["127.0.0.1:1".to_string(), server_addr.to_string()];
        let found = discover(&client, &servers, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(found, local);
    }
}
