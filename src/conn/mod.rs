//! The connection: public handle, actor command surface, and the state
//! machine driving a single persistent transport.
//!
//! All mutation happens on the actor task; user-facing calls post a command
//! into the inbox and await a oneshot completion. State is mirrored outward
//! through a `watch` cell (current state) and a `broadcast` stream (ordered
//! transition events).

use std::time::Duration;

use aw_codec::ChannelOptions;
use aw_protocol::{Data, ErrorInfo, Message, PresenceAction, PresenceMessage};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::channel::{ChannelState, ChannelStateChange};
use crate::error::Error;

pub(crate) mod ack;
pub(crate) mod actor;
mod backoff;
pub mod machine;

pub use machine::ConnState;

/// A connection state transition, as delivered to state subscribers.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub previous: ConnState,
    pub current: ConnState,
    pub reason: Option<ErrorInfo>,
}

/// Identity of the current (or last) connection, mirrored from the actor.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_serial: Option<i64>,
}

/// Commands user handles post into the actor inbox.
pub(crate) enum Command {
    Connect {
        done: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        done: oneshot::Sender<Result<(), Error>>,
    },
    Publish {
        channel: String,
        options: Option<ChannelOptions>,
        messages: Vec<Message>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    AttachChannel {
        name: String,
        options: Option<ChannelOptions>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    DetachChannel {
        name: String,
        done: oneshot::Sender<Result<(), Error>>,
    },
    ReleaseChannel {
        name: String,
        done: oneshot::Sender<Result<(), Error>>,
    },
    SubscribeMessages {
        name: String,
        options: Option<ChannelOptions>,
        reply: oneshot::Sender<Result<broadcast::Receiver<Message>, Error>>,
    },
    SubscribePresence {
        name: String,
        options: Option<ChannelOptions>,
        reply: oneshot::Sender<Result<broadcast::Receiver<PresenceMessage>, Error>>,
    },
    SubscribeChannelState {
        name: String,
        options: Option<ChannelOptions>,
        reply: oneshot::Sender<Result<broadcast::Receiver<ChannelStateChange>, Error>>,
    },
    PresenceOp {
        name: String,
        action: PresenceAction,
        data: Data,
        done: oneshot::Sender<Result<(), Error>>,
    },
    PresenceMembers {
        name: String,
        reply: oneshot::Sender<Vec<PresenceMessage>>,
    },
    ChannelState {
        name: String,
        reply: oneshot::Sender<ChannelState>,
    },
}

/// Handle to the connection owned by a [`crate::Realtime`] client.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnState>,
    info_rx: watch::Receiver<ConnectionInfo>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
    request_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<Command>,
        state_rx: watch::Receiver<ConnState>,
        info_rx: watch::Receiver<ConnectionInfo>,
        events_tx: broadcast::Sender<ConnectionStateChange>,
        request_timeout: Duration,
    ) -> Self {
        Connection {
            cmd_tx,
            state_rx,
            info_rx,
            events_tx,
            request_timeout,
        }
    }

    pub(crate) fn cmd_tx(&self) -> mpsc::Sender<Command> {
        self.cmd_tx.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Identity of the current connection (id, resume key, last serial).
    pub fn info(&self) -> ConnectionInfo {
        self.info_rx.borrow().clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.info_rx.borrow().connection_id.clone()
    }

    /// Ordered stream of state transitions with their triggering errors.
    pub fn state_changes(&self) -> BroadcastStream<ConnectionStateChange> {
        BroadcastStream::new(self.events_tx.subscribe())
    }

    /// Start connecting; completes when the connection reaches `Connected`
    /// (or definitively fails).
    pub async fn connect(&self) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { done })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Close the connection; completes when it reaches `Closed`.
    pub async fn close(&self) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close { done })
            .await
            .map_err(|_| Error::Disconnected)?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// Wait until the connection reaches `target` (or a terminal state that
    /// makes `target` unreachable).
    pub async fn wait_for(&self, target: ConnState) -> Result<(), Error> {
        let mut rx = self.state_rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current == target {
                return Ok(());
            }
            match current {
                ConnState::Failed if target != ConnState::Failed => {
                    return Err(Error::Disconnected);
                }
                ConnState::Closed
                    if !matches!(target, ConnState::Closed | ConnState::Connecting) =>
                {
                    return Err(Error::Disconnected);
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Disconnected);
            }
        }
    }
}
