//! One connection to one remote member.
//!
//! Each peer runs two tasks: a read loop that decodes envelopes and hands
//! them to the session in receipt order, and a write loop that drains an
//! outbound queue onto the socket. The session only ever talks to a peer
//! through its [`PeerHandle`].

use crate::error::SessionError;
use crate::handshake::{recv_envelope, send_envelope, Link};
use bytes::BytesMut;
use mesh_wire::{Command, Envelope, FrameDecoder};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session-local identifier of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Why a peer connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote closed the socket
    Remote,
    /// Remote sent `leave`
    Left,
    /// Read or write failed terminally
    Lost(String),
    /// Remote sent bytes that were not a valid envelope
    Malformed(String),
    /// This session closed the connection
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote => f.write_str("closed by remote"),
            CloseReason::Left => f.write_str("left the room"),
            CloseReason::Lost(reason) => write!(f, "connection lost: {}", reason),
            CloseReason::Malformed(reason) => write!(f, "malformed envelope: {}", reason),
            CloseReason::Local => f.write_str("closed locally"),
        }
    }
}

/// Events a peer connection reports to its session
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded envelope, in receipt order
    Envelope {
        /// Sender
        peer: PeerId,
        /// Decoded envelope
        envelope: Envelope,
    },
    /// The connection ended on its own
    Closed {
        /// Peer that ended
        peer: PeerId,
        /// Why it ended
        reason: CloseReason,
    },
}

enum Outbound {
    Envelope(Envelope),
    Close,
}

/// Session-side handle to a running peer connection
#[derive(Debug)]
pub struct PeerHandle {
    id: PeerId,
    name: String,
    remote: SocketAddr,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Envelope(envelope) => write!(f, "Envelope({} keys)", envelope.len()),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

impl PeerHandle {
    /// Start the read and write loops for a bootstrapped link
    pub fn spawn(
        id: PeerId,
        link: Link,
        max_frame_size: usize,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let Link {
            stream,
            remote,
            buffer,
        } = link;
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            id,
            remote,
            read_half,
            buffer,
            max_frame_size,
            events.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            id,
            remote,
            write_half,
            outbound_rx,
            max_frame_size,
            events,
        ));

        info!("Peer {} connected from {}", id, remote);
        Self {
            id,
            name: String::new(),
            remote,
            outbound_tx,
            reader,
            writer: Some(writer),
        }
    }

    /// Peer identifier
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Display name announced by the remote, empty until it introduces itself
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the display name; callers validate uniqueness first
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Name for display: the nickname, or the socket address while unnamed
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.remote.to_string()
        } else {
            self.name.clone()
        }
    }

    /// Remote socket address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue an envelope, adding `message` under `text` when given
    pub fn send(&self, mut envelope: Envelope, message: Option<&str>) -> Result<(), SessionError> {
        if let Some(text) = message {
            envelope.insert(Command::Text(text.to_string()));
        }
        self.outbound_tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| SessionError::ConnectionLost(format!("writer for {} stopped", self.id)))
    }

    /// Stop reading, flush queued envelopes and close the socket
    ///
    /// Returns the write loop's handle so callers can wait for the flush.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        self.reader.abort();
        let _ = self.outbound_tx.send(Outbound::Close);
        self.writer.take()
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    id: PeerId,
    remote: SocketAddr,
    mut reader: OwnedReadHalf,
    mut buffer: BytesMut,
    max_frame_size: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);

    let reason = loop {
        match recv_envelope(&mut reader, &mut decoder, &mut buffer).await {
            Ok(Some(envelope)) => {
                debug!("Received {} commands from {} ({})", envelope.len(), id, remote);
                if events.send(PeerEvent::Envelope { peer: id, envelope }).is_err() {
                    return;
                }
            }
            Ok(None) => break CloseReason::Remote,
            Err(SessionError::Malformed(e)) => {
                warn!("Malformed envelope from {} ({}): {}", id, remote, e);
                break CloseReason::Malformed(e.to_string());
            }
            Err(e) => {
                warn!("Read from {} ({}) failed: {}", id, remote, e);
                break CloseReason::Lost(e.to_string());
            }
        }
    };

    debug!("Read loop for {} ended: {}", id, reason);
    events.send(PeerEvent::Closed { peer: id, reason }).ok();
}

async fn write_loop(
    id: PeerId,
    remote: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    max_frame_size: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        let envelope = match outbound {
            Outbound::Envelope(envelope) => envelope,
            Outbound::Close => break,
        };

        match send_envelope(&mut writer, &envelope, max_frame_size).await {
            Ok(()) => {}
            Err(SessionError::Malformed(e)) => {
                warn!("Dropping envelope for {}: {}", id, e);
            }
            Err(e) => {
                warn!("Write to {} ({}) failed: {}", id, remote, e);
                events
                    .send(PeerEvent::Closed {
                        peer: id,
                        reason: CloseReason::Lost(e.to_string()),
                    })
                    .ok();
                return;
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("Write loop for {} ended", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Bootstrap;
    use crate::transport::{connect_tcp, listen_tcp};
    use mesh_wire::{CommandKind, PeerAddr, DEFAULT_MAX_FRAME_SIZE};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_pair() -> (Link, Bootstrap<tokio::net::TcpStream>) {
        let listener = listen_tcp("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = PeerAddr::new("127.0.0.1", port);
        let dial = connect_tcp(&addr, None);
        let (accepted, dialled) = tokio::join!(listener.accept(), dial);
        let (stream, remote) = accepted.unwrap();
        let link = Link {
            stream,
            remote,
            buffer: BytesMut::new(),
        };
        (link, Bootstrap::new(dialled.unwrap(), DEFAULT_MAX_FRAME_SIZE))
    }

    #[tokio::test]
    async fn test_envelopes_delivered_in_order_then_close() {
        let (link, mut remote) = connected_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _peer = PeerHandle::spawn(PeerId(1), link, DEFAULT_MAX_FRAME_SIZE, events_tx);

        for i in 0..3 {
            remote
                .send(&Command::Text(format!("m{}", i)).into())
                .await
                .unwrap();
        }
        drop(remote);

        for i in 0..3 {
            match timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
                Some(PeerEvent::Envelope { peer, mut envelope }) => {
                    assert_eq!(peer, PeerId(1));
                    assert_eq!(
                        envelope.take(CommandKind::Text).unwrap().unwrap(),
                        Command::Text(format!("m{}", i))
                    );
                }
                other => panic!("expected envelope, got {:?}", other),
            }
        }

        match timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
            Some(PeerEvent::Closed { peer, reason }) => {
                assert_eq!(peer, PeerId(1));
                assert_eq!(reason, CloseReason::Remote);
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_attaches_message_as_text() {
        let (link, mut remote) = connected_pair().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = PeerHandle::spawn(PeerId(2), link, DEFAULT_MAX_FRAME_SIZE, events_tx);

        peer.send(Command::Nickname("bob".into()).into(), Some("hello"))
            .unwrap();

        let mut envelope = timeout(Duration::from_secs(2), remote.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            envelope.take(CommandKind::Nickname).unwrap().unwrap(),
            Command::Nickname("bob".into())
        );
        assert_eq!(
            envelope.take(CommandKind::Text).unwrap().unwrap(),
            Command::Text("hello".into())
        );
    }

    #[tokio::test]
    async fn test_garbage_terminates_connection() {
        let (link, remote) = connected_pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _peer = PeerHandle::spawn(PeerId(3), link, DEFAULT_MAX_FRAME_SIZE, events_tx);

        let (mut stream, _) = remote.into_parts();
        stream.write_all(&[0, 0, 0, 3, b'n', b'o', b'!']).await.unwrap();

        match timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
            Some(PeerEvent::Closed { reason, .. }) => {
                assert!(matches!(reason, CloseReason::Malformed(_)))
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_flushes_queued_envelopes() {
        let (link, mut remote) = connected_pair().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut peer = PeerHandle::spawn(PeerId(4), link, DEFAULT_MAX_FRAME_SIZE, events_tx);

        peer.send(Command::Leave("bye".into()).into(), None).unwrap();
        let writer = peer.close().unwrap();
        timeout(Duration::from_secs(2), writer).await.unwrap().unwrap();

        let mut envelope = remote.recv().await.unwrap();
        assert_eq!(
            envelope.take(CommandKind::Leave).unwrap().unwrap(),
            Command::Leave("bye".into())
        );
        assert!(remote.recv().await.is_err());
    }
}
