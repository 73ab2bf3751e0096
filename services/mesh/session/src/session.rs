//! Local node: bootstrap state machine, public handle, and accept loops.
//!
//! A session is entered exactly once per process, either by hosting a new
//! room (this node becomes the admin) or by joining an existing one through
//! its admin. Once bootstrapped, all membership state lives in the
//! [`SessionManager`](crate::manager) actor and is reached through a
//! [`SessionHandle`].

use crate::error::{
    describe, SessionError, CODE_INVALID_NICKNAME, CODE_NICKNAME_UNAVAILABLE,
    CODE_ROOM_UNAVAILABLE,
};
use crate::handshake::{accept_member, admit_newcomer, join_room, reject_join, Bootstrap, Link};
use crate::manager::{Admission, AttachRole, SessionCommand, SessionManager};
use crate::peer::{CloseReason, PeerId};
use crate::transport::{connect_tcp, is_retryable, listen_tcp};
use mesh_wire::{Command, Envelope, PeerAddr, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Configuration for a chat session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Local display name
    pub name: String,
    /// Host to bind and advertise
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Membership cap when hosting, 0 means unlimited
    pub limit: u32,
    /// Largest accepted envelope body
    pub max_frame_size: usize,
    /// Optional bound on outbound connects
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            port: 4400,
            limit: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: None,
        }
    }
}

/// Bootstrap phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Bound, not yet listening or connected
    Idle,
    /// Creating a room as its admin
    Hosting,
    /// Connecting into an existing room
    Joining,
    /// Steady-state mesh participation
    Active,
}

impl Phase {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Hosting => "hosting",
            Phase::Joining => "joining",
            Phase::Active => "active",
        }
    }

    /// Move to `next`, rejecting anything outside
    /// `Idle -> Hosting | Joining -> Active`
    pub fn advance(self, next: Phase) -> Result<Phase, SessionError> {
        match (self, next) {
            (Phase::Idle, Phase::Hosting)
            | (Phase::Idle, Phase::Joining)
            | (Phase::Hosting, Phase::Active)
            | (Phase::Joining, Phase::Active) => {
                debug!("Session phase {} -> {}", self.as_str(), next.as_str());
                Ok(next)
            }
            _ => Err(SessionError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            }),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Things the local user should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A new peer connection was established
    Joined {
        /// Remote socket address
        remote: SocketAddr,
        /// Whether the connection leads to the room admin
        admin: bool,
    },
    /// Chat message or farewell from a member
    Message {
        /// Sender display name
        from: String,
        /// Message text
        text: String,
        /// Whether the sender is the room admin
        from_admin: bool,
    },
    /// A member changed its display name
    NicknameChanged {
        /// Previous display name
        old: String,
        /// New display name
        new: String,
    },
    /// A member proposed a name that was refused
    NicknameRejected {
        /// Refused name
        proposed: String,
        /// Display code sent back to the member
        code: u16,
    },
    /// A member's connection was removed
    PeerLeft {
        /// Display name of the member
        name: String,
        /// Why the connection ended
        reason: CloseReason,
    },
    /// An error code to show
    Error {
        /// Display code
        code: u16,
        /// Text for the code
        description: &'static str,
    },
    /// Dialling an announced member failed
    DialFailed {
        /// Address that was dialled
        addr: PeerAddr,
        /// Why it failed
        reason: String,
    },
}

impl ChatEvent {
    /// Error event for a display code
    pub fn error(code: u16) -> Self {
        ChatEvent::Error {
            code,
            description: describe(code),
        }
    }
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatEvent::Joined { remote, admin: true } => {
                write!(f, "connected to the room admin at {}", remote)
            }
            ChatEvent::Joined { remote, .. } => write!(f, "{} connected", remote),
            ChatEvent::Message {
                from,
                text,
                from_admin: true,
            } => write!(f, "[ADMIN]{}: {}", from, text),
            ChatEvent::Message { from, text, .. } => write!(f, "{}: {}", from, text),
            ChatEvent::NicknameChanged { old, new } => {
                write!(f, "{} changed their name to {}", old, new)
            }
            ChatEvent::NicknameRejected { proposed, code } => {
                write!(f, "refused nickname {:?}: {}", proposed, describe(*code))
            }
            ChatEvent::PeerLeft { name, reason } => write!(f, "{} left ({})", name, reason),
            ChatEvent::Error { code, description } => match *code {
                CODE_INVALID_NICKNAME | CODE_NICKNAME_UNAVAILABLE | CODE_ROOM_UNAVAILABLE => {
                    write!(f, "error {}: {}", code, description)
                }
                _ => write!(f, "{} ({})", description, code),
            },
            ChatEvent::DialFailed { addr, reason } => {
                write!(f, "could not connect to peer {}: {}", addr, reason)
            }
        }
    }
}

/// One member as seen by the local session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Display name, empty until introduced
    pub name: String,
    /// Remote socket address
    pub remote: SocketAddr,
    /// Whether this member is the room admin
    pub is_admin: bool,
}

/// Point-in-time view of the session's membership
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    /// Local display name
    pub name: String,
    /// Current phase
    pub phase: Phase,
    /// Whether this session is the room admin
    pub is_admin: bool,
    /// Membership cap, 0 means unlimited
    pub limit: u32,
    /// Live count of host-admitted members
    pub connections: usize,
    /// Members in join order
    pub members: Vec<MemberInfo>,
}

impl MembershipSnapshot {
    /// Non-empty member names in join order
    pub fn names(&self) -> Vec<&str> {
        self.members
            .iter()
            .map(|m| m.name.as_str())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// Cloneable handle to a running session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    local_addr: PeerAddr,
}

impl SessionHandle {
    /// Address other members dial to reach this session
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Send an envelope to every member
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Broadcast { envelope })
            .map_err(|_| SessionError::Stopped)
    }

    /// Send a chat message to every member
    pub fn say(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.broadcast(Command::Text(text.into()).into())
    }

    /// Broadcast a farewell, close every connection and stop the session
    pub async fn leave(&self, farewell: impl Into<String>) -> Result<(), SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Leave {
                farewell: farewell.into(),
                done: done_tx,
            })
            .map_err(|_| SessionError::Stopped)?;
        done_rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Current membership
    pub async fn snapshot(&self) -> Result<MembershipSnapshot, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot { reply: reply_tx })
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Whether the session actor has stopped
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Entry points for starting a session
pub struct Session;

impl Session {
    /// Create a room and become its admin
    pub async fn host(
        config: SessionConfig,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<SessionHandle, SessionError> {
        let phase = Phase::Idle;
        let listener = listen_tcp(&config.host, config.port).await?;
        let local_addr = PeerAddr::new(config.host.clone(), listener.local_addr()?.port());

        let phase = phase.advance(Phase::Hosting)?;
        info!(
            "Hosting room on {} as {:?} (limit: {})",
            local_addr, config.name, config.limit
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(&config, true, commands_tx.clone(), events);

        let accept = tokio::spawn(accept_loop(
            listener,
            AcceptMode::Host,
            commands_tx.clone(),
            config.max_frame_size,
        ));
        manager.set_accept_task(accept);
        manager.set_phase(phase.advance(Phase::Active)?);

        tokio::spawn(manager.run(commands_rx));
        Ok(SessionHandle {
            commands: commands_tx,
            local_addr,
        })
    }

    /// Join the room whose admin listens on `target`
    ///
    /// On refusal or an unreachable room the error code 503 is published on
    /// `events` and the session never becomes active.
    pub async fn join(
        config: SessionConfig,
        target: PeerAddr,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<SessionHandle, SessionError> {
        let phase = Phase::Idle;
        let listener = listen_tcp(&config.host, config.port).await?;
        let local_addr = PeerAddr::new(config.host.clone(), listener.local_addr()?.port());

        let phase = phase.advance(Phase::Joining)?;
        info!("Joining room at {} from {}", target, local_addr);

        let (link, limit) = match bootstrap_join(&config, &target, &local_addr).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!("Join to {} failed: {}", target, e);
                events.send(ChatEvent::error(CODE_ROOM_UNAVAILABLE)).ok();
                return Err(e);
            }
        };
        info!("Joined room at {} (limit: {})", target, limit);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(&config, false, commands_tx.clone(), events);
        manager.set_limit(limit);
        manager.attach(link, AttachRole::Admin);

        let accept = tokio::spawn(accept_loop(
            listener,
            AcceptMode::Member,
            commands_tx.clone(),
            config.max_frame_size,
        ));
        manager.set_accept_task(accept);
        manager.set_phase(phase.advance(Phase::Active)?);

        tokio::spawn(manager.run(commands_rx));
        Ok(SessionHandle {
            commands: commands_tx,
            local_addr,
        })
    }
}

async fn bootstrap_join(
    config: &SessionConfig,
    target: &PeerAddr,
    local_addr: &PeerAddr,
) -> Result<(Link, u32), SessionError> {
    let unavailable = |reason: String| SessionError::RoomUnavailable {
        addr: target.clone(),
        reason,
    };

    let stream = connect_tcp(target, config.connect_timeout)
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    let mut bootstrap = Bootstrap::new(stream, config.max_frame_size);
    let limit = join_room(&mut bootstrap, target, local_addr)
        .await
        .map_err(|e| match e {
            e @ SessionError::RoomUnavailable { .. } => e,
            other => unavailable(other.to_string()),
        })?;

    Ok((bootstrap.into_link()?, limit))
}

#[derive(Debug, Clone, Copy)]
enum AcceptMode {
    /// Admin: enforce the limit and run the full join handshake
    Host,
    /// Member: accept dials triggered by `new_peer`
    Member,
}

async fn accept_loop(
    listener: TcpListener,
    mode: AcceptMode,
    commands: mpsc::UnboundedSender<SessionCommand>,
    max_frame_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("Accepted TCP connection from {} ({:?})", remote, mode);
                let commands = commands.clone();
                tokio::spawn(async move {
                    let result = match mode {
                        AcceptMode::Host => admit(stream, &commands, max_frame_size).await,
                        AcceptMode::Member => welcome(stream, &commands, max_frame_size).await,
                    };
                    if let Err(e) = result {
                        warn!("Bootstrap with {} failed: {}", remote, e);
                    }
                });
            }
            Err(e) if is_retryable(&e) => continue,
            Err(e) => {
                warn!("Accept error: {}; stopping listener", e);
                break;
            }
        }
    }
}

async fn admit(
    stream: TcpStream,
    commands: &mpsc::UnboundedSender<SessionCommand>,
    max_frame_size: usize,
) -> Result<(), SessionError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(SessionCommand::Admit { reply: reply_tx })
        .map_err(|_| SessionError::Stopped)?;
    let admission = reply_rx.await.map_err(|_| SessionError::Stopped)?;

    let mut bootstrap = Bootstrap::new(stream, max_frame_size);
    let limit = match admission {
        Admission::Full => {
            info!("Room is full; refusing join");
            return reject_join(&mut bootstrap).await;
        }
        Admission::Granted { limit } => limit,
    };

    match admit_handshake(bootstrap, limit).await {
        Ok((link, address)) => commands
            .send(SessionCommand::Attach {
                link,
                role: AttachRole::Newcomer { address },
            })
            .map_err(|_| SessionError::Stopped),
        Err(e) => {
            commands.send(SessionCommand::Release).ok();
            Err(e)
        }
    }
}

async fn admit_handshake(
    mut bootstrap: Bootstrap<TcpStream>,
    limit: u32,
) -> Result<(Link, PeerAddr), SessionError> {
    let address = admit_newcomer(&mut bootstrap, limit).await?;
    Ok((bootstrap.into_link()?, address))
}

async fn welcome(
    stream: TcpStream,
    commands: &mpsc::UnboundedSender<SessionCommand>,
    max_frame_size: usize,
) -> Result<(), SessionError> {
    let mut bootstrap = Bootstrap::new(stream, max_frame_size);
    accept_member(&mut bootstrap).await?;
    commands
        .send(SessionCommand::Attach {
            link: bootstrap.into_link()?,
            role: AttachRole::Inbound,
        })
        .map_err(|_| SessionError::Stopped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert_eq!(Phase::Idle.advance(Phase::Hosting).unwrap(), Phase::Hosting);
        assert_eq!(Phase::Idle.advance(Phase::Joining).unwrap(), Phase::Joining);
        assert_eq!(Phase::Joining.advance(Phase::Active).unwrap(), Phase::Active);
        assert_eq!(Phase::Hosting.advance(Phase::Active).unwrap(), Phase::Active);

        assert!(Phase::Idle.advance(Phase::Active).is_err());
        assert!(Phase::Hosting.advance(Phase::Joining).is_err());
        assert!(matches!(
            Phase::Active.advance(Phase::Idle),
            Err(SessionError::InvalidTransition { from: "active", to: "idle" })
        ));
    }

    #[test]
    fn test_event_rendering() {
        let message = ChatEvent::Message {
            from: "B".into(),
            text: "bye".into(),
            from_admin: false,
        };
        assert_eq!(message.to_string(), "B: bye");

        let admin = ChatEvent::Message {
            from: "H".into(),
            text: "welcome".into(),
            from_admin: true,
        };
        assert_eq!(admin.to_string(), "[ADMIN]H: welcome");

        assert_eq!(
            ChatEvent::error(503).to_string(),
            "error 503: room is not reachable"
        );
        assert_eq!(ChatEvent::error(418).to_string(), "unknown error (418)");
    }

    #[tokio::test]
    async fn test_join_unreachable_room_reports_503() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let closed = listen_tcp("127.0.0.1", 0).await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let config = SessionConfig {
            name: "D".into(),
            host: "127.0.0.1".into(),
            port: 0,
            connect_timeout: Some(Duration::from_secs(2)),
            ..SessionConfig::default()
        };
        let err = Session::join(config, PeerAddr::new("127.0.0.1", port), events_tx)
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(503));
        assert_eq!(events_rx.recv().await, Some(ChatEvent::error(503)));
    }
}
