//! Membership actor.
//!
//! The [`SessionManager`] is the only owner of the member list, the
//! connection counter and the admin marker. Accept tasks, dial tasks, peer
//! connections and the public [`SessionHandle`](crate::SessionHandle) all
//! talk to it through channels, so no membership state is ever shared.

use crate::dispatch::{CommandHandler, Dispatcher};
use crate::error::{
    describe, SessionError, CODE_INVALID_NICKNAME, CODE_NICKNAME_UNAVAILABLE,
};
use crate::handshake::{dial_member, Bootstrap, Link};
use crate::peer::{CloseReason, PeerEvent, PeerHandle, PeerId};
use crate::session::{ChatEvent, MemberInfo, MembershipSnapshot, Phase, SessionConfig};
use crate::transport::connect_tcp;
use futures::future::join_all;
use mesh_wire::{Command, CommandKind, Envelope, PeerAddr};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Longest `leave` waits for queued envelopes to reach the sockets
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests handled by the actor
pub(crate) enum SessionCommand {
    /// Reserve a slot for a newcomer (host only)
    Admit { reply: oneshot::Sender<Admission> },
    /// Give back a reservation whose handshake failed
    Release,
    /// Hand over a bootstrapped connection
    Attach { link: Link, role: AttachRole },
    /// A `new_peer` dial did not complete
    DialFailed { addr: PeerAddr, reason: String },
    /// Send an envelope to every member
    Broadcast { envelope: Envelope },
    /// Say goodbye and stop
    Leave {
        farewell: String,
        done: oneshot::Sender<()>,
    },
    /// Report current membership
    Snapshot {
        reply: oneshot::Sender<MembershipSnapshot>,
    },
}

/// Answer to [`SessionCommand::Admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Granted { limit: u32 },
    Full,
}

/// How a connection came to be attached
#[derive(Debug, Clone)]
pub(crate) enum AttachRole {
    /// Host accepted a join; `address` is announced to the others
    Newcomer { address: PeerAddr },
    /// Joiner's connection to the room admin
    Admin,
    /// Member accepted a dial from a newcomer
    Inbound,
    /// Member dialled a newcomer after `new_peer`
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminMarker {
    /// This session hosts the room
    Local,
    /// The room admin is this peer
    Peer(PeerId),
    /// The admin connection is gone
    Departed,
}

#[derive(Debug)]
struct Member {
    handle: PeerHandle,
    /// Admitted by this host and included in `connections`
    counted: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Single owner of a session's membership state
pub(crate) struct SessionManager {
    name: String,
    limit: u32,
    max_frame_size: usize,
    connect_timeout: Option<Duration>,
    phase: Phase,
    admin: AdminMarker,
    members: Vec<Member>,
    connections: usize,
    pending: usize,
    next_peer_id: u64,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    accept_task: Option<JoinHandle<()>>,
}

impl SessionManager {
    pub(crate) fn new(
        config: &SessionConfig,
        hosting: bool,
        commands_tx: mpsc::UnboundedSender<SessionCommand>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            name: config.name.clone(),
            limit: config.limit,
            max_frame_size: config.max_frame_size,
            connect_timeout: config.connect_timeout,
            phase: Phase::Idle,
            admin: if hosting {
                AdminMarker::Local
            } else {
                AdminMarker::Departed
            },
            members: Vec::new(),
            connections: 0,
            pending: 0,
            next_peer_id: 1,
            commands_tx,
            peer_tx,
            peer_rx: Some(peer_rx),
            events,
            accept_task: None,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    pub(crate) fn set_accept_task(&mut self, task: JoinHandle<()>) {
        self.accept_task = Some(task);
    }

    /// Run until the local user leaves
    pub(crate) async fn run(mut self, mut commands_rx: mpsc::UnboundedReceiver<SessionCommand>) {
        let dispatcher = Dispatcher::new();
        let Some(mut peer_rx) = self.peer_rx.take() else {
            warn!("Session manager started twice");
            return;
        };
        info!("Session {:?} is {}", self.name, self.phase);

        loop {
            tokio::select! {
                Some(event) = peer_rx.recv() => {
                    self.handle_peer_event(&dispatcher, event);
                }
                Some(command) = commands_rx.recv() => {
                    if let Flow::Stop = self.handle_command(command).await {
                        break;
                    }
                }
                else => break,
            }
        }

        info!("Session {:?} stopped", self.name);
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Admit { reply } => {
                let admission = self.admit();
                reply.send(admission).ok();
            }
            SessionCommand::Release => {
                self.pending = self.pending.saturating_sub(1);
                debug!("Released join reservation ({} pending)", self.pending);
            }
            SessionCommand::Attach { link, role } => self.attach(link, role),
            SessionCommand::DialFailed { addr, reason } => {
                warn!("Could not connect to announced member {}: {}", addr, reason);
                self.emit(ChatEvent::DialFailed { addr, reason });
            }
            SessionCommand::Broadcast { envelope } => {
                return self.broadcast_local(envelope).await;
            }
            SessionCommand::Leave { farewell, done } => {
                self.broadcast_local(Command::Leave(farewell).into()).await;
                done.send(()).ok();
                return Flow::Stop;
            }
            SessionCommand::Snapshot { reply } => {
                reply.send(self.snapshot()).ok();
            }
        }
        Flow::Continue
    }

    fn handle_peer_event(&mut self, dispatcher: &Dispatcher<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Envelope { peer, envelope } => {
                if self.position(peer).is_none() {
                    debug!("Dropping envelope from removed {}", peer);
                    return;
                }
                for err in dispatcher.dispatch_envelope(self, peer, &envelope) {
                    warn!("Ignoring command from {}: {}", peer, err);
                }
            }
            PeerEvent::Closed { peer, reason } => self.remove_member(peer, reason),
        }
    }

    /// Check the limit and reserve a slot
    fn admit(&mut self) -> Admission {
        let occupied = self.connections + self.pending;
        if self.limit > 0 && occupied >= self.limit as usize {
            info!(
                "Refusing join: {} of {} slots taken",
                occupied, self.limit
            );
            return Admission::Full;
        }
        self.pending += 1;
        Admission::Granted { limit: self.limit }
    }

    pub(crate) fn attach(&mut self, link: Link, role: AttachRole) {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let handle = PeerHandle::spawn(id, link, self.max_frame_size, self.peer_tx.clone());
        let remote = handle.remote();
        let mut counted = false;

        match role {
            AttachRole::Newcomer { address } => {
                self.pending = self.pending.saturating_sub(1);
                let announced = self.broadcast(Command::NewPeer(address.clone()).into());
                debug!("Announced {} to {} members", address, announced);
                self.connections += 1;
                counted = true;
            }
            AttachRole::Admin => self.admin = AdminMarker::Peer(id),
            AttachRole::Inbound | AttachRole::Outbound => {}
        }

        if !self.name.is_empty() {
            if let Err(e) = handle.send(Command::Nickname(self.name.clone()).into(), None) {
                warn!("Could not introduce ourselves to {}: {}", id, e);
            }
        }

        self.members.push(Member { handle, counted });
        self.emit(ChatEvent::Joined {
            remote,
            admin: self.admin == AdminMarker::Peer(id),
        });
    }

    /// Queue an envelope on every member, returning how many accepted it
    fn broadcast(&self, envelope: Envelope) -> usize {
        self.members
            .iter()
            .filter(|member| match member.handle.send(envelope.clone(), None) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Skipping {}: {}", member.handle.id(), e);
                    false
                }
            })
            .count()
    }

    async fn broadcast_local(&mut self, envelope: Envelope) -> Flow {
        if let Some(Ok(Command::Nickname(name))) = envelope.get(CommandKind::Nickname) {
            if !name.is_empty() {
                info!("Local name is now {:?}", name);
                self.name = name;
            }
        }

        let sent = self.broadcast(envelope.clone());
        debug!("Broadcast {} commands to {} members", envelope.len(), sent);

        if envelope.contains(CommandKind::Leave) {
            self.shutdown().await;
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Close every connection, waiting for queued envelopes to flush
    async fn shutdown(&mut self) {
        if let Some(accept) = self.accept_task.take() {
            accept.abort();
        }

        let writers: Vec<_> = self
            .members
            .iter_mut()
            .filter_map(|member| member.handle.close())
            .collect();
        let aborts: Vec<_> = writers.iter().map(|w| w.abort_handle()).collect();

        if timeout(FLUSH_TIMEOUT, join_all(writers)).await.is_err() {
            warn!(
                "Queued envelopes not flushed within {:?}; dropping them",
                FLUSH_TIMEOUT
            );
            aborts.iter().for_each(|abort| abort.abort());
        }

        info!("Closed {} connections", self.members.len());
        self.members.clear();
        self.connections = 0;
        self.pending = 0;
    }

    /// Remove a member; unknown ids are ignored
    fn remove_member(&mut self, id: PeerId, reason: CloseReason) {
        let Some(index) = self.position(id) else {
            debug!("{} already removed ({})", id, reason);
            return;
        };

        let mut member = self.members.remove(index);
        member.handle.close();
        if member.counted {
            self.connections = self.connections.saturating_sub(1);
        }
        if self.admin == AdminMarker::Peer(id) {
            warn!("Room admin disconnected; new members will not be introduced");
            self.admin = AdminMarker::Departed;
        }

        let name = member.handle.display_name();
        info!("{} ({}) removed: {}", name, id, reason);
        self.emit(ChatEvent::PeerLeft { name, reason });
    }

    fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            name: self.name.clone(),
            phase: self.phase,
            is_admin: self.admin == AdminMarker::Local,
            limit: self.limit,
            connections: self.connections,
            members: self
                .members
                .iter()
                .map(|member| MemberInfo {
                    id: member.handle.id(),
                    name: member.handle.name().to_string(),
                    remote: member.handle.remote(),
                    is_admin: self.admin == AdminMarker::Peer(member.handle.id()),
                })
                .collect(),
        }
    }

    fn position(&self, id: PeerId) -> Option<usize> {
        self.members.iter().position(|m| m.handle.id() == id)
    }

    fn member(&self, id: PeerId) -> Option<&PeerHandle> {
        self.members
            .iter()
            .find(|m| m.handle.id() == id)
            .map(|m| &m.handle)
    }

    fn reply_error(&self, id: PeerId, code: u16) {
        if let Some(handle) = self.member(id) {
            if let Err(e) = handle.send(Command::DisplayError(code).into(), None) {
                debug!("Could not send display_error to {}: {}", id, e);
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            debug!("Chat event receiver dropped");
        }
    }
}

impl CommandHandler for SessionManager {
    fn on_text(&mut self, sender: PeerId, text: String) {
        let Some(handle) = self.member(sender) else {
            return;
        };
        let event = ChatEvent::Message {
            from: handle.display_name(),
            text,
            from_admin: self.admin == AdminMarker::Peer(sender),
        };
        self.emit(event);
    }

    fn on_nickname(&mut self, sender: PeerId, nickname: String) {
        if nickname.is_empty() {
            warn!("{} proposed an empty nickname", sender);
            self.reply_error(sender, CODE_INVALID_NICKNAME);
            self.emit(ChatEvent::NicknameRejected {
                proposed: nickname,
                code: CODE_INVALID_NICKNAME,
            });
            return;
        }

        let Some(index) = self.position(sender) else {
            return;
        };
        if self.members[index].handle.name() == nickname {
            return;
        }

        let taken = self
            .members
            .iter()
            .any(|m| m.handle.id() != sender && m.handle.name() == nickname);
        if taken {
            let err = SessionError::NameCollision(nickname.clone());
            warn!("Refusing nickname from {}: {}", sender, err);
            self.reply_error(sender, CODE_NICKNAME_UNAVAILABLE);
            self.emit(ChatEvent::NicknameRejected {
                proposed: nickname,
                code: CODE_NICKNAME_UNAVAILABLE,
            });
            return;
        }

        let handle = &mut self.members[index].handle;
        let old = handle.display_name();
        handle.set_name(nickname.clone());
        info!("{} is now known as {:?}", sender, nickname);
        self.emit(ChatEvent::NicknameChanged { old, new: nickname });
    }

    fn on_leave(&mut self, sender: PeerId, farewell: String) {
        let Some(handle) = self.member(sender) else {
            return;
        };
        let event = ChatEvent::Message {
            from: handle.display_name(),
            text: farewell,
            from_admin: self.admin == AdminMarker::Peer(sender),
        };
        self.emit(event);
        self.remove_member(sender, CloseReason::Left);
    }

    fn on_new_peer(&mut self, sender: PeerId, addr: PeerAddr) {
        if self.admin != AdminMarker::Peer(sender) {
            debug!("Ignoring new_peer {} from non-admin {}", addr, sender);
            return;
        }

        info!("Room admin announced {}; connecting", addr);
        tokio::spawn(dial_peer(
            addr,
            self.connect_timeout,
            self.max_frame_size,
            self.commands_tx.clone(),
        ));
    }

    fn on_display_error(&mut self, sender: PeerId, code: u16) {
        debug!("{} sent display code {}", sender, code);
        self.emit(ChatEvent::Error {
            code,
            description: describe(code),
        });
    }
}

/// Dial a member announced by the admin and hand the link to the actor
async fn dial_peer(
    addr: PeerAddr,
    connect_timeout: Option<Duration>,
    max_frame_size: usize,
    commands: mpsc::UnboundedSender<SessionCommand>,
) {
    let result: Result<Link, SessionError> = async {
        let stream = connect_tcp(&addr, connect_timeout).await?;
        let mut bootstrap = Bootstrap::new(stream, max_frame_size);
        dial_member(&mut bootstrap).await?;
        bootstrap.into_link()
    }
    .await;

    let command = match result {
        Ok(link) => SessionCommand::Attach {
            link,
            role: AttachRole::Outbound,
        },
        Err(e) => SessionCommand::DialFailed {
            addr,
            reason: e.to_string(),
        },
    };
    if commands.send(command).is_err() {
        debug!("Session stopped before dial completed");
    }
}
