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

//! The bus over TCP.
//!
//! Newline-delimited JSON frames. The server opens with `hello` carrying a
//! nonce, the client answers `connect` with a [`Proof`], and from then on
//! the client sends `pub`/`sub`/`unsub` (each acknowledged by `ok` or `err`
//! with the same id) while the server pushes `msg` frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, LocalConnection};
use crate::identity::{Credentials, Nonce, Proof, new_nonce};
use crate::{Bus, BusError, INBOX_PREFIX, Message, Subscription};

const MAX_FRAME_LEN: usize = 1 << 20;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Hello {
        nonce: String,
    },
    Connect {
        proof: Proof,
    },
    Connected {
        conn_id: u64,
    },
    Pub {
        id: u64,
        subject: String,
        reply: Option<String>,
        payload: String,
    },
    Sub {
        id: u64,
        subject: String,
    },
    Unsub {
        id: u64,
        sid: u64,
    },
    Ok {
        id: u64,
        sid: Option<u64>,
    },
    Err {
        id: u64,
        error: WireError,
    },
    Msg {
        sid: u64,
        subject: String,
        reply: Option<String>,
        payload: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireError {
    PermissionDenied { op: String, subject: String },
    InvalidSubject { subject: String },
    Unauthorized,
    Closed,
    Protocol { message: String },
}

impl From<&BusError> for WireError {
    fn from(err: &BusError) -> Self {
        match err {
            BusError::PermissionDenied { op, subject } => Self::PermissionDenied {
                op: op.to_string(),
                subject: subject.clone(),
            },
            BusError::InvalidSubject(subject) => Self::InvalidSubject {
                subject: subject.clone(),
            },
            BusError::Unauthorized => Self::Unauthorized,
            BusError::Closed => Self::Closed,
            other => Self::Protocol {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for BusError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PermissionDenied { op, subject } => BusError::PermissionDenied {
                op: match op.as_str() {
                    "subscribe" => "subscribe",
                    "reply" => "reply",
                    _ => "publish",
                },
                subject,
            },
            WireError::InvalidSubject { subject } => BusError::InvalidSubject(subject),
            WireError::Unauthorized => BusError::Unauthorized,
            WireError::Closed => BusError::Closed,
            WireError::Protocol { message } => BusError::Protocol(message),
        }
    }
}

type Lines<S> = Framed<S, LinesCodec>;

async fn write_frame<S>(framed: &mut Lines<S>, frame: &Frame) -> Result<(), BusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(frame)?;
    framed
        .send(line)
        .await
        .map_err(|e| BusError::Protocol(e.to_string()))
}

async fn read_frame<S>(framed: &mut Lines<S>) -> Result<Option<Frame>, BusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(BusError::Protocol(e.to_string())),
        Some(Ok(line)) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| BusError::Protocol(format!("malformed frame: {e}"))),
    }
}

fn decode_nonce(b64: &str) -> Result<Nonce, BusError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|_| BusError::Protocol("bad nonce".into()))?;
    bytes
        .try_into()
        .map_err(|_| BusError::Protocol("bad nonce length".into()))
}

fn decode_payload(b64: &str) -> Result<Vec<u8>, BusError> {
    BASE64
        .decode(b64)
        .map_err(|_| BusError::Protocol("bad payload encoding".into()))
}

// -- Server side --

/// Accept connections on `listener` and bridge them onto `broker` until
/// `shutdown` fires.
pub async fn serve(listener: TcpListener, broker: Broker, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "bus endpoint listening");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("bus endpoint shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session(stream, broker).await {
                            debug!(%peer, error = %e, "bus session ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept bus connection"),
            },
        }
    }
}

async fn session(stream: TcpStream, broker: Broker) -> Result<(), BusError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let nonce = new_nonce();
    write_frame(
        &mut framed,
        &Frame::Hello {
            nonce: BASE64.encode(nonce),
        },
    )
    .await?;

    let proof = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut framed)).await {
        Ok(Ok(Some(Frame::Connect { proof }))) => proof,
        Ok(Err(e)) => return Err(e),
        Ok(_) => return Err(BusError::Protocol("expected connect frame".into())),
        Err(_) => return Err(BusError::Timeout),
    };

    let conn = match broker.attach(&nonce, &proof) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = write_frame(
                &mut framed,
                &Frame::Err {
                    id: 0,
                    error: WireError::from(&e),
                },
            )
            .await;
            return Err(e);
        }
    };
    write_frame(&mut framed, &Frame::Connected { conn_id: conn.id() }).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let result = loop {
        tokio::select! {
            _ = conn.closed() => break Ok(()),
            incoming = read_frame(&mut framed) => match incoming {
                Ok(Some(frame)) => handle_client_frame(&conn, frame, &out_tx).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            Some(frame) = out_rx.recv() => {
                if let Err(e) = write_frame(&mut framed, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    conn.drain().await;
    result
}

async fn handle_client_frame(
    conn: &LocalConnection,
    frame: Frame,
    out: &mpsc::UnboundedSender<Frame>,
) {
    let ack = |id: u64, result: Result<Option<u64>, BusError>| match result {
        Ok(sid) => Frame::Ok { id, sid },
        Err(e) => Frame::Err {
            id,
            error: WireError::from(&e),
        },
    };

    match frame {
        Frame::Pub {
            id,
            subject,
            reply,
            payload,
        } => {
            let result = match decode_payload(&payload) {
                Ok(payload) => conn
                    .send(Message {
                        subject,
                        reply,
                        payload,
                    })
                    .await
                    .map(|()| None),
                Err(e) => Err(e),
            };
            let _ = out.send(ack(id, result));
        }
        Frame::Sub { id, subject } => match conn.subscribe(&subject).await {
            Ok(mut sub) => {
                let sid = sub.sid();
                // The ack must be queued before any message for this sid.
                let _ = out.send(ack(id, Ok(Some(sid))));
                let out = out.clone();
                tokio::spawn(async move {
                    while let Some(msg) = sub.next().await {
                        let frame = Frame::Msg {
                            sid,
                            subject: msg.subject,
                            reply: msg.reply,
                            payload: BASE64.encode(&msg.payload),
                        };
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                let _ = out.send(ack(id, Err(e)));
            }
        },
        Frame::Unsub { id, sid } => {
            let result = conn.unsubscribe(sid).await.map(|()| None);
            let _ = out.send(ack(id, result));
        }
        other => {
            warn!(conn = conn.id(), frame = ?other, "unexpected frame from client");
        }
    }
}

// -- Client side --

struct Pending {
    tx: oneshot::Sender<Result<Option<u64>, BusError>>,
    sub: Option<mpsc::UnboundedSender<Message>>,
}

struct Shared {
    conn_id: u64,
    out: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, Pending>>,
    subs: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
    token: CancellationToken,
}

impl Shared {
    fn shutdown(&self) {
        self.token.cancel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if let Ok(mut subs) = self.subs.lock() {
            subs.clear();
        }
    }
}

/// A bus connection to a broker in another process.
#[derive(Clone)]
pub struct RemoteConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("conn_id", &self.shared.conn_id)
            .finish()
    }
}

impl RemoteConnection {
    #[tracing::instrument(skip(addr, credentials), fields(credentials = ?credentials))]
    pub async fn connect(
        addr: impl ToSocketAddrs,
        credentials: &Credentials,
    ) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

        let nonce = match read_frame(&mut framed).await? {
            Some(Frame::Hello { nonce }) => decode_nonce(&nonce)?,
            _ => return Err(BusError::Protocol("expected hello frame".into())),
        };
        let proof = credentials.prove(&nonce).ok_or(BusError::Unauthorized)?;
        write_frame(&mut framed, &Frame::Connect { proof }).await?;

        let conn_id = match read_frame(&mut framed).await? {
            Some(Frame::Connected { conn_id }) => conn_id,
            Some(Frame::Err { error, .. }) => return Err(error.into()),
            _ => return Err(BusError::Protocol("expected connected frame".into())),
        };

        let (mut sink, mut stream) = framed.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let shared = Arc::new(Shared {
            conn_id,
            out: out_tx,
            pending: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            token: CancellationToken::new(),
        });

        let writer = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.token.cancelled() => break,
                    Some(frame) = out_rx.recv() => {
                        let line = match serde_json::to_string(&frame) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(error = %e, "failed to encode bus frame");
                                continue;
                            }
                        };
                        if sink.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
            writer.shutdown();
        });

        let reader = shared.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = reader.token.cancelled() => break,
                    line = stream.next() => line,
                };
                let frame: Frame = match line {
                    Some(Ok(line)) => match serde_json::from_str(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "malformed frame from bus server");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "bus connection read failed");
                        break;
                    }
                    None => break,
                };
                reader.dispatch(frame);
            }
            debug!(conn = reader.conn_id, "bus connection closed");
            reader.shutdown();
        });

        info!(conn = conn_id, "connected to bus");
        Ok(Self { shared })
    }

    async fn call(
        &self,
        frame: impl FnOnce(u64) -> Frame + Send,
        sub: Option<mpsc::UnboundedSender<Message>>,
    ) -> Result<Option<u64>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .map_err(|_| BusError::Closed)?
            .insert(id, Pending { tx, sub });

        if self.shared.out.send(frame(id)).is_err() {
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&id);
                }
                Err(BusError::Timeout)
            }
        }
    }
}

impl Shared {
    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Msg {
                sid,
                subject,
                reply,
                payload,
            } => {
                let Ok(payload) = decode_payload(&payload) else {
                    warn!(sid, "dropping message with undecodable payload");
                    return;
                };
                let Ok(mut subs) = self.subs.lock() else {
                    return;
                };
                let delivered = subs.get(&sid).is_some_and(|tx| {
                    tx.send(Message {
                        subject,
                        reply,
                        payload,
                    })
                    .is_ok()
                });
                if !delivered {
                    subs.remove(&sid);
                }
            }
            Frame::Ok { id, sid } => {
                let Some(pending) = self.pending.lock().ok().and_then(|mut p| p.remove(&id)) else {
                    return;
                };
                if let (Some(sid), Some(sub)) = (sid, pending.sub)
                    && let Ok(mut subs) = self.subs.lock()
                {
                    subs.insert(sid, sub);
                }
                let _ = pending.tx.send(Ok(sid));
            }
            Frame::Err { id, error } => {
                if let Some(pending) = self.pending.lock().ok().and_then(|mut p| p.remove(&id)) {
                    let _ = pending.tx.send(Err(error.into()));
                }
            }
            other => warn!(frame = ?other, "unexpected frame from bus server"),
        }
    }
}

impl Bus for RemoteConnection {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        let payload = BASE64.encode(&message.payload);
        self.call(
            |id| Frame::Pub {
                id,
                subject: message.subject,
                reply: message.reply,
                payload,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self
            .call(
                |id| Frame::Sub {
                    id,
                    subject: subject.to_string(),
                },
                Some(tx),
            )
            .await?
            .ok_or_else(|| BusError::Protocol("subscribe ack without sid".into()))?;
        Ok(Subscription::new(sid, subject.to_string(), rx))
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), BusError> {
        if let Ok(mut subs) = self.shared.subs.lock() {
            subs.remove(&sid);
        }
        self.call(|id| Frame::Unsub { id, sid }, None)
            .await
            .map(|_| ())
    }

    fn inbox_prefix(&self) -> String {
        format!("{INBOX_PREFIX}.{}", self.shared.conn_id)
    }

    async fn drain(&self) {
        let sids: Vec<u64> = self
            .shared
            .subs
            .lock()
            .map(|subs| subs.keys().copied().collect())
            .unwrap_or_default();
        for sid in sids {
            let _ = self.unsubscribe(sid).await;
        }
        self.shared.shutdown();
        debug!(conn = self.shared.conn_id, "drained remote bus connection");
    }

    fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}
