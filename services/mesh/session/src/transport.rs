//! TCP transport for mesh chat sessions.

use mesh_wire::PeerAddr;
use std::io;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Create a TCP listener bound to `host:port` (port 0 picks a free port)
pub async fn listen_tcp(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Connect to a peer address, optionally bounded by a timeout
///
/// Without a timeout the connect blocks until the OS reports success or
/// failure.
pub async fn connect_tcp(addr: &PeerAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
    debug!("Connecting to {}", addr);
    let connect = TcpStream::connect((addr.host(), addr.port()));
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", addr, limit),
            )
        })??,
        None => connect.await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Whether a socket error is a transient interruption worth retrying
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let listener = listen_tcp("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_tcp(&PeerAddr::new("127.0.0.1", port), None)
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = listen_tcp("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_tcp(
            &PeerAddr::new("127.0.0.1", port),
            Some(Duration::from_secs(2)),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(is_retryable(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_retryable(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_retryable(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
