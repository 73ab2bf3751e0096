//! Bootstrap exchanges performed right after a connection is established.
//!
//! Host side (admin):
//!
//! ```text
//! joiner                         host
//!   | ----------- connect -------> |
//!   | <--------- {conn: bool} ---- |   false: host closes, join fails (503)
//!   | -- {address: [host, port]} ->|
//!   | <-------- {limit: n} ------- |
//! ```
//!
//! Members dialled because of `new_peer` only answer `{conn: true}`.

use crate::error::SessionError;
use crate::transport::is_retryable;
use bytes::BytesMut;
use mesh_wire::{
    encode_frame, Command, CommandKind, Envelope, FrameDecoder, PeerAddr, WireError,
    READ_CHUNK_SIZE,
};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// A connection that finished its bootstrap and is ready to become a peer
#[derive(Debug)]
pub struct Link {
    /// Connected socket
    pub stream: TcpStream,
    /// Remote socket address
    pub remote: SocketAddr,
    /// Bytes already read past the last bootstrap frame
    pub buffer: BytesMut,
}

/// Read one envelope, returning `None` on a clean close between frames
pub async fn recv_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Option<Envelope>, SessionError> {
    loop {
        if let Some(envelope) = decoder.decode(buffer)? {
            return Ok(Some(envelope));
        }

        buffer.reserve(READ_CHUNK_SIZE);
        match reader.read_buf(buffer).await {
            Ok(0) if buffer.is_empty() => return Ok(None),
            Ok(0) => {
                return Err(SessionError::ConnectionLost(format!(
                    "closed with {} bytes of an unfinished frame",
                    buffer.len()
                )))
            }
            Ok(n) => trace!("Read {} bytes, buffer now has {} bytes", n, buffer.len()),
            Err(e) if is_retryable(&e) => {
                debug!("Retrying interrupted read: {}", e);
            }
            Err(e) => return Err(SessionError::ConnectionLost(e.to_string())),
        }
    }
}

/// Write one envelope as a single frame
pub async fn send_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame_size: usize,
) -> Result<(), SessionError> {
    let frame = encode_frame(envelope, max_frame_size)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| SessionError::ConnectionLost(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SessionError::ConnectionLost(e.to_string()))
}

/// Stream plus framing state for the bootstrap exchange
#[derive(Debug)]
pub struct Bootstrap<S> {
    stream: S,
    decoder: FrameDecoder,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Bootstrap<S> {
    /// Wrap a freshly connected stream
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_frame_size,
        }
    }

    /// Send one envelope
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        send_envelope(&mut self.stream, envelope, self.max_frame_size).await
    }

    /// Receive one envelope; a close during bootstrap is an error
    pub async fn recv(&mut self) -> Result<Envelope, SessionError> {
        recv_envelope(&mut self.stream, &mut self.decoder, &mut self.buffer)
            .await?
            .ok_or_else(|| SessionError::ConnectionLost("closed during bootstrap".to_string()))
    }

    /// Receive one envelope and pull out the expected command
    async fn expect(&mut self, kind: CommandKind) -> Result<Command, SessionError> {
        let mut envelope = self.recv().await?;
        let command = envelope.take(kind).ok_or_else(|| WireError::BadArgument {
            key: kind.key().to_string(),
            reason: "missing from bootstrap message".to_string(),
        })??;
        if !envelope.is_empty() {
            warn!(
                "Ignoring {} extra keys alongside `{}` during bootstrap",
                envelope.len(),
                kind
            );
        }
        Ok(command)
    }

    /// Give back the stream and any bytes read past the last frame
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buffer)
    }
}

impl Bootstrap<TcpStream> {
    /// Finish the bootstrap and turn the connection into a [`Link`]
    pub fn into_link(self) -> Result<Link, SessionError> {
        let remote = self.stream.peer_addr()?;
        let (stream, buffer) = self.into_parts();
        Ok(Link {
            stream,
            remote,
            buffer,
        })
    }
}

/// Host side: refuse a join because the room is full
pub async fn reject_join<S: AsyncRead + AsyncWrite + Unpin>(
    bootstrap: &mut Bootstrap<S>,
) -> Result<(), SessionError> {
    bootstrap.send(&Command::Conn(false).into()).await?;
    let _ = bootstrap.stream.shutdown().await;
    Ok(())
}

/// Host side: accept a join, learn the newcomer's address, announce the limit
pub async fn admit_newcomer<S: AsyncRead + AsyncWrite + Unpin>(
    bootstrap: &mut Bootstrap<S>,
    limit: u32,
) -> Result<PeerAddr, SessionError> {
    bootstrap.send(&Command::Conn(true).into()).await?;

    let address = match bootstrap.expect(CommandKind::Address).await? {
        Command::Address(addr) => addr,
        other => unreachable_kind(CommandKind::Address, other)?,
    };
    debug!("Newcomer listens on {}", address);

    bootstrap.send(&Command::Limit(limit).into()).await?;
    Ok(address)
}

/// Member side: accept a connection dialled because of `new_peer`
pub async fn accept_member<S: AsyncRead + AsyncWrite + Unpin>(
    bootstrap: &mut Bootstrap<S>,
) -> Result<(), SessionError> {
    bootstrap.send(&Command::Conn(true).into()).await
}

/// Joiner side: ask to enter the room at `target`, returning its limit
pub async fn join_room<S: AsyncRead + AsyncWrite + Unpin>(
    bootstrap: &mut Bootstrap<S>,
    target: &PeerAddr,
    own_addr: &PeerAddr,
) -> Result<u32, SessionError> {
    let unavailable = |reason: String| SessionError::RoomUnavailable {
        addr: target.clone(),
        reason,
    };

    let accepted = match bootstrap.expect(CommandKind::Conn).await {
        Ok(Command::Conn(accepted)) => accepted,
        Ok(other) => unreachable_kind(CommandKind::Conn, other)?,
        Err(e) => return Err(unavailable(e.to_string())),
    };
    if !accepted {
        return Err(unavailable("join refused".to_string()));
    }

    bootstrap
        .send(&Command::Address(own_addr.clone()).into())
        .await?;

    match bootstrap.expect(CommandKind::Limit).await? {
        Command::Limit(limit) => Ok(limit),
        other => unreachable_kind(CommandKind::Limit, other),
    }
}

/// Dialer side of `new_peer`: wait for the member to accept
pub async fn dial_member<S: AsyncRead + AsyncWrite + Unpin>(
    bootstrap: &mut Bootstrap<S>,
) -> Result<(), SessionError> {
    match bootstrap.expect(CommandKind::Conn).await? {
        Command::Conn(true) => Ok(()),
        Command::Conn(false) => Err(SessionError::ConnectionLost(
            "member refused the connection".to_string(),
        )),
        other => unreachable_kind(CommandKind::Conn, other),
    }
}

fn unreachable_kind<T>(expected: CommandKind, got: Command) -> Result<T, SessionError> {
    Err(WireError::BadArgument {
        key: expected.key().to_string(),
        reason: format!("parsed as {}", got.kind()),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::DEFAULT_MAX_FRAME_SIZE;
    use tokio::io::duplex;

    fn pair() -> (
        Bootstrap<tokio::io::DuplexStream>,
        Bootstrap<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(4096);
        (
            Bootstrap::new(a, DEFAULT_MAX_FRAME_SIZE),
            Bootstrap::new(b, DEFAULT_MAX_FRAME_SIZE),
        )
    }

    #[tokio::test]
    async fn test_join_handshake_exchanges_address_and_limit() {
        let (mut host, mut joiner) = pair();
        let own = PeerAddr::new("localhost", 4410);
        let target = PeerAddr::new("localhost", 4400);

        let host_task = tokio::spawn(async move { admit_newcomer(&mut host, 2).await });
        let limit = join_room(&mut joiner, &target, &own).await.unwrap();
        let learned = host_task.await.unwrap().unwrap();

        assert_eq!(limit, 2);
        assert_eq!(learned, own);
    }

    #[tokio::test]
    async fn test_rejected_join_is_room_unavailable() {
        let (mut host, mut joiner) = pair();
        let target = PeerAddr::new("localhost", 4400);

        tokio::spawn(async move { reject_join(&mut host).await });
        let err = join_room(&mut joiner, &target, &PeerAddr::new("localhost", 4411))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::RoomUnavailable { .. }));
        assert_eq!(err.code(), Some(503));
    }

    #[tokio::test]
    async fn test_leftover_bytes_survive_bootstrap() {
        let (mut member, mut dialer) = pair();

        tokio::spawn(async move {
            accept_member(&mut member).await.unwrap();
            member
                .send(&Command::Nickname("carol".into()).into())
                .await
                .unwrap();
            // keep the stream open until the dialer is done
            let _ = member.recv().await;
        });

        dial_member(&mut dialer).await.unwrap();
        let mut rest = dialer.recv().await.unwrap();
        assert_eq!(
            rest.take(CommandKind::Nickname).unwrap().unwrap(),
            Command::Nickname("carol".into())
        );
    }

    #[tokio::test]
    async fn test_close_during_bootstrap_is_error() {
        let (host, mut joiner) = pair();
        drop(host);
        let err = dial_member(&mut joiner).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionLost(_)));
    }
}
