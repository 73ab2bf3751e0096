//! TCP sockets, bootstrap handshakes, peer read/write loops and the membership actor for mesh chat.
//!
//! Every member of a room holds one direct TCP connection to every other
//! member. The member that created the room (the admin) enforces the
//! membership limit and introduces each newcomer to the existing members,
//! which then dial the newcomer themselves.
//!
//! ## Features
//!
//! - **Bootstrap**: `conn`/`address`/`limit` handshakes for host, joiner and member
//! - **Peer connections**: ordered read loop and queued write loop per socket
//! - **Dispatch**: one typed handler per steady-state command
//! - **Membership actor**: single owner of names, counters and the admin marker
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{ChatEvent, Session, SessionConfig};
//! use mesh_wire::PeerAddr;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SessionConfig {
//!     name: "alice".to_string(),
//!     port: 4401,
//!     ..SessionConfig::default()
//! };
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let session = Session::join(config, PeerAddr::new("localhost", 4400), tx).await?;
//! session.say("hello")?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         ChatEvent::Message { from, text, .. } => println!("{}: {}", from, text),
//!         other => println!("{}", other),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
pub mod handshake;
mod manager;
pub mod peer;
pub mod session;
pub mod transport;

// Re-export main types
pub use dispatch::{CommandHandler, DispatchError, Dispatcher};
pub use error::{describe, SessionError};
pub use handshake::{Bootstrap, Link};
pub use peer::{CloseReason, PeerEvent, PeerHandle, PeerId};
pub use session::{
    ChatEvent, MemberInfo, MembershipSnapshot, Phase, Session, SessionConfig, SessionHandle,
};
pub use transport::{connect_tcp, is_retryable, listen_tcp};
