//! WebSocket sessions.
//!
//! # Design
//! `connect` performs the handshake on the caller's thread, then hands the
//! socket to a dedicated reader thread that owns it for the rest of its life.
//! The reader alternates between flushing outbound messages from its channel
//! and polling the socket with a short read timeout; every inbound text or
//! binary frame becomes a `ResponseRecord` on the shared queue, tagged with
//! the session handle as its request id.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::BridgeError;
use crate::http::BodyKind;
use crate::queue::{InstanceId, ResponseQueue, ResponseRecord};
use crate::registry::{Handle, Registry};

/// How long the reader waits on the socket before checking its outbox.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Payload kind fixed when the session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Json,
}

impl PayloadKind {
    fn body_kind(self) -> BodyKind {
        match self {
            PayloadKind::Text => BodyKind::String,
            PayloadKind::Json => BodyKind::Json,
        }
    }
}

enum Outbound {
    Message(Message),
    Close,
}

struct Session {
    address: String,
    kind: PayloadKind,
    state: Arc<AtomicU8>,
    outbox: Sender<Outbound>,
}

/// Everything the reader thread stamps onto inbound records.
struct Inbound {
    session: Handle,
    instance: InstanceId,
    callback: String,
    kind: PayloadKind,
    queue: Arc<ResponseQueue>,
}

impl Inbound {
    fn deliver(&self, body: Vec<u8>) {
        tracing::debug!(session = self.session, len = body.len(), "websocket message received");
        self.queue.push(ResponseRecord {
            request_id: self.session,
            instance: self.instance,
            callback: self.callback.clone(),
            status: 0,
            body_kind: self.kind.body_kind(),
            body,
            is_websocket: true,
        });
    }
}

pub struct SessionManager {
    sessions: Registry<Session>,
    queue: Arc<ResponseQueue>,
}

impl SessionManager {
    pub fn new(queue: Arc<ResponseQueue>) -> Self {
        Self {
            sessions: Registry::new(),
            queue,
        }
    }

    /// Open a session to a `ws://` or `wss://` address. Blocks until the
    /// handshake completes or fails.
    pub fn connect(
        &mut self,
        instance: InstanceId,
        address: &str,
        callback: &str,
        kind: PayloadKind,
    ) -> Result<Handle, BridgeError> {
        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            return Err(BridgeError::WebSocket(format!(
                "unsupported websocket address {address:?}"
            )));
        }

        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));
        let (socket, _response) = tungstenite::connect(address).map_err(|e| {
            state.store(ConnectionState::Closed as u8, Ordering::Release);
            BridgeError::WebSocket(format!("handshake with {address} failed: {e}"))
        })?;
        set_poll_timeout(&socket)
            .map_err(|e| BridgeError::WebSocket(format!("failed to configure socket: {e}")))?;
        state.store(ConnectionState::Open as u8, Ordering::Release);

        let queue = Arc::clone(&self.queue);
        let session = self.sessions.try_insert_with::<BridgeError>(|handle| {
            let (outbox, inbox) = mpsc::channel();
            let inbound = Inbound {
                session: handle,
                instance,
                callback: callback.to_string(),
                kind,
                queue,
            };
            let reader_state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("requests-ws-{handle}"))
                .spawn(move || run_reader(socket, inbox, &reader_state, &inbound))
                .map_err(|e| BridgeError::WebSocket(format!("failed to start reader: {e}")))?;
            Ok(Session {
                address: address.to_string(),
                kind,
                state,
                outbox,
            })
        })?;
        tracing::info!(session, address, ?kind, "websocket connected");
        Ok(session)
    }

    /// Queue a text frame. The reader thread writes it on its next poll.
    pub fn send(&self, session: Handle, payload: &str) -> Result<(), BridgeError> {
        let entry = self.session(session)?;
        if entry.state() == ConnectionState::Closed {
            return Err(BridgeError::WebSocket(format!("session {session} is closed")));
        }
        entry
            .outbox
            .send(Outbound::Message(Message::text(payload)))
            .map_err(|_| BridgeError::WebSocket(format!("session {session} reader has exited")))
    }

    /// Send the serialized text of `value`.
    pub fn send_json(&self, session: Handle, value: &serde_json::Value) -> Result<(), BridgeError> {
        let text = serde_json::to_string(value).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        self.send(session, &text)
    }

    /// Send a close frame and forget the session.
    pub fn close(&mut self, session: Handle) -> Result<(), BridgeError> {
        let entry = self.sessions.remove(session).ok_or(BridgeError::InvalidHandle {
            kind: "session",
            handle: session,
        })?;
        entry.state.store(ConnectionState::Closed as u8, Ordering::Release);
        // The reader may already be gone if the peer closed first.
        let _ = entry.outbox.send(Outbound::Close);
        tracing::info!(session, address = %entry.address, "websocket closed");
        Ok(())
    }

    pub fn state(&self, session: Handle) -> Result<ConnectionState, BridgeError> {
        Ok(self.session(session)?.state())
    }

    pub fn payload_kind(&self, session: Handle) -> Result<PayloadKind, BridgeError> {
        Ok(self.session(session)?.kind)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn close_all(&mut self) {
        let mut count = 0usize;
        for (_, entry) in self.sessions.drain() {
            entry.state.store(ConnectionState::Closed as u8, Ordering::Release);
            let _ = entry.outbox.send(Outbound::Close);
            count += 1;
        }
        if count > 0 {
            tracing::info!(count, "closed websocket sessions");
        }
    }

    fn session(&self, session: Handle) -> Result<&Session, BridgeError> {
        self.sessions.get(session).ok_or(BridgeError::InvalidHandle {
            kind: "session",
            handle: session,
        })
    }
}

impl Session {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

fn set_poll_timeout(socket: &WebSocket<MaybeTlsStream<TcpStream>>) -> std::io::Result<()> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(POLL_INTERVAL)),
        MaybeTlsStream::Rustls(stream) => stream.get_ref().set_read_timeout(Some(POLL_INTERVAL)),
        _ => Ok(()),
    }
}

fn run_reader(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    outbox: Receiver<Outbound>,
    state: &AtomicU8,
    inbound: &Inbound,
) {
    let session = inbound.session;
    let mut closing = false;
    loop {
        while !closing {
            match outbox.try_recv() {
                Ok(Outbound::Message(message)) => {
                    if let Err(e) = socket.send(message) {
                        tracing::warn!(session, error = %e, "websocket send failed");
                    }
                }
                Ok(Outbound::Close) | Err(TryRecvError::Disconnected) => {
                    closing = true;
                    if let Err(e) = socket.close(None) {
                        tracing::debug!(session, error = %e, "websocket close handshake failed");
                    }
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => inbound.deliver(text.as_bytes().to_vec()),
            Ok(Message::Binary(bytes)) => inbound.deliver(bytes.to_vec()),
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => {
                tracing::warn!(session, error = %e, "websocket read failed");
                break;
            }
        }
    }
    state.store(ConnectionState::Closed as u8, Ordering::Release);
    tracing::debug!(session, "websocket reader exited");
}
