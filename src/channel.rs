//! Channels: per-name attach/detach state machines and the registry that
//! owns them.
//!
//! A channel is created on first reference and destroyed only by an explicit
//! release once detached. Channels never hold a reference back to the
//! connection; the user-facing [`Channel`] handle carries only the channel
//! name and the actor's command inbox, and the registry lives inside the
//! actor.

use std::collections::HashMap;
use std::time::Duration;

use aw_codec::{ChannelOptions, CodecPipeline};
use aw_protocol::{
    Action, Data, ErrorInfo, Message, PresenceAction, PresenceMessage, ProtocolMessage,
    WireFormat, flags,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::conn::Command;
use crate::error::Error;

const CHANNEL_BUS_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    /// States a reconnect should re-attach.
    fn wants_reattach(self) -> bool {
        matches!(
            self,
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended
        )
    }
}

/// A channel state transition, as delivered to state subscribers.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// Presence sync phase: after an ATTACHED with the presence flag, the broker
/// streams SYNC frames; a SYNC with no channel serial ends the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    None,
    InProgress,
}

pub(crate) struct ChannelEntry {
    name: String,
    options: ChannelOptions,
    pipeline: CodecPipeline,
    state: ChannelState,
    channel_serial: Option<String>,
    sync: SyncPhase,
    members: HashMap<String, PresenceMessage>,
    pending_release: bool,
    attach_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    detach_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    messages_tx: broadcast::Sender<Message>,
    presence_tx: broadcast::Sender<PresenceMessage>,
    state_tx: broadcast::Sender<ChannelStateChange>,
}

impl ChannelEntry {
    fn new(name: String, options: ChannelOptions, wire: WireFormat) -> Result<Self, Error> {
        let pipeline = CodecPipeline::new(&options, wire)?;
        Ok(ChannelEntry {
            name,
            options,
            pipeline,
            state: ChannelState::Initialized,
            channel_serial: None,
            sync: SyncPhase::None,
            members: HashMap::new(),
            pending_release: false,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            messages_tx: broadcast::channel(CHANNEL_BUS_CAPACITY).0,
            presence_tx: broadcast::channel(CHANNEL_BUS_CAPACITY).0,
            state_tx: broadcast::channel(CHANNEL_BUS_CAPACITY).0,
        })
    }

    pub(crate) fn pipeline(&self) -> &CodecPipeline {
        &self.pipeline
    }

    fn set_state(&mut self, next: ChannelState, reason: Option<ErrorInfo>) {
        if self.state == next {
            return;
        }
        let change = ChannelStateChange {
            previous: self.state,
            current: next,
            reason,
        };
        debug!(channel = %self.name, from = ?change.previous, to = ?next, "channel state");
        self.state = next;
        let _ = self.state_tx.send(change);
    }

    fn attach_frame(&self) -> ProtocolMessage {
        let mut frame = ProtocolMessage::with_channel(Action::Attach, self.name.clone());
        frame.flags = self.options.mode_flags();
        frame
    }

    fn resolve_attach_waiters(&mut self, result: &Result<(), ErrorInfo>) {
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(match result {
                Ok(()) => Ok(()),
                Err(info) => Err(Error::ChannelFailed(info.clone())),
            });
        }
    }

    fn on_attached(&mut self, frame: &ProtocolMessage) {
        self.channel_serial = frame.channel_serial.clone();
        if frame.has_flag(flags::HAS_PRESENCE) {
            self.sync = SyncPhase::InProgress;
            self.members.clear();
        } else {
            self.sync = SyncPhase::None;
        }
        self.set_state(ChannelState::Attached, None);
        self.resolve_attach_waiters(&Ok(()));
    }

    fn on_detached(&mut self, frame: &ProtocolMessage) {
        let error = frame.error.clone();
        if let Some(info) = &error {
            self.resolve_attach_waiters(&Err(info.clone()));
        } else {
            self.resolve_attach_waiters(&Err(ErrorInfo::new(
                90007,
                None,
                "channel detached before attach completed",
            )));
        }
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.set_state(ChannelState::Detached, error);
    }

    fn on_error(&mut self, frame: &ProtocolMessage) {
        let info = frame
            .error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(90000, None, "channel operation failed"));
        self.resolve_attach_waiters(&Err(info.clone()));
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Err(Error::ChannelFailed(info.clone())));
        }
        self.set_state(ChannelState::Failed, Some(info));
    }

    fn on_message(&mut self, frame: &ProtocolMessage) {
        let Some(messages) = &frame.messages else {
            return;
        };
        for message in messages {
            let mut message = message.clone();
            if let Err(e) = self.pipeline.decode(&mut message) {
                // Degrade: deliver with the partial decode and remaining
                // labels so subscribers can see what arrived.
                warn!(channel = %self.name, error = %e, "message decode degraded");
            }
            let _ = self.messages_tx.send(message);
        }
    }

    fn apply_presence(&mut self, entry: PresenceMessage) {
        match entry.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                self.members.insert(entry.member_key(), entry.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.members.remove(&entry.member_key());
            }
        }
        let _ = self.presence_tx.send(entry);
    }

    fn on_presence(&mut self, frame: &ProtocolMessage) {
        let Some(entries) = &frame.presence else {
            return;
        };
        for entry in entries {
            let mut entry = entry.clone();
            if let Err(e) = self.pipeline.decode(&mut entry) {
                warn!(channel = %self.name, error = %e, "presence decode degraded");
            }
            self.apply_presence(entry);
        }
    }

    fn on_sync(&mut self, frame: &ProtocolMessage) {
        self.on_presence(frame);
        // A sync frame without a channel serial marks the end of the
        // accumulated presence state.
        if frame.channel_serial.as_deref().is_none_or(str::is_empty) {
            self.sync = SyncPhase::None;
        }
    }

    fn suspend(&mut self) {
        if matches!(
            self.state,
            ChannelState::Detached | ChannelState::Failed | ChannelState::Initialized
        ) {
            return;
        }
        let info = ErrorInfo::new(80002, None, "connection suspended");
        self.resolve_attach_waiters(&Err(info.clone()));
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Err(Error::ChannelSuspended));
        }
        self.set_state(ChannelState::Suspended, Some(info));
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Channel name -> entry map, owned and mutated only by the connection actor.
pub(crate) struct ChannelRegistry {
    wire: WireFormat,
    channels: HashMap<String, ChannelEntry>,
}

impl ChannelRegistry {
    pub(crate) fn new(wire: WireFormat) -> Self {
        ChannelRegistry {
            wire,
            channels: HashMap::new(),
        }
    }

    /// Fetch a channel, creating it on first reference. Options supplied on a
    /// later reference replace the stored ones only while the channel has not
    /// yet attached.
    pub(crate) fn get_or_create(
        &mut self,
        name: &str,
        options: Option<ChannelOptions>,
    ) -> Result<&mut ChannelEntry, Error> {
        use std::collections::hash_map::Entry;
        match self.channels.entry(name.to_owned()) {
            Entry::Vacant(vacant) => {
                let entry =
                    ChannelEntry::new(name.to_owned(), options.unwrap_or_default(), self.wire)?;
                Ok(vacant.insert(entry))
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if let Some(options) = options {
                    if entry.state == ChannelState::Initialized && entry.options != options {
                        entry.pipeline = CodecPipeline::new(&options, self.wire)?;
                        entry.options = options;
                    }
                }
                Ok(entry)
            }
        }
    }

    /// Begin attaching: registers the waiter and returns the ATTACH frame to
    /// send if one is due (None when already attached or the connection must
    /// send it later).
    pub(crate) fn attach(
        &mut self,
        name: &str,
        options: Option<ChannelOptions>,
        done: oneshot::Sender<Result<(), Error>>,
        connected: bool,
    ) -> Option<ProtocolMessage> {
        let entry = match self.get_or_create(name, options) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = done.send(Err(e));
                return None;
            }
        };
        match entry.state {
            ChannelState::Attached => {
                let _ = done.send(Ok(()));
                None
            }
            ChannelState::Failed => {
                let _ = done.send(Err(Error::ChannelFailed(ErrorInfo::new(
                    90000,
                    None,
                    "channel previously failed; reattach after releasing",
                ))));
                None
            }
            _ => {
                entry.attach_waiters.push(done);
                let already_attaching = entry.state == ChannelState::Attaching;
                entry.set_state(ChannelState::Attaching, None);
                if connected && !already_attaching {
                    Some(entry.attach_frame())
                } else {
                    None
                }
            }
        }
    }

    /// Begin detaching; same contract as [`ChannelRegistry::attach`].
    pub(crate) fn detach(
        &mut self,
        name: &str,
        done: oneshot::Sender<Result<(), Error>>,
        connected: bool,
    ) -> Option<ProtocolMessage> {
        let Some(entry) = self.channels.get_mut(name) else {
            let _ = done.send(Ok(()));
            return None;
        };
        match entry.state {
            ChannelState::Detached | ChannelState::Initialized => {
                entry.set_state(ChannelState::Detached, None);
                let _ = done.send(Ok(()));
                None
            }
            _ => {
                entry.detach_waiters.push(done);
                let already_detaching = entry.state == ChannelState::Detaching;
                entry.set_state(ChannelState::Detaching, None);
                if connected && !already_detaching {
                    Some(ProtocolMessage::with_channel(Action::Detach, name))
                } else {
                    None
                }
            }
        }
    }

    /// Release a detached channel; channels still attached must detach first.
    pub(crate) fn release(
        &mut self,
        name: &str,
        done: oneshot::Sender<Result<(), Error>>,
        connected: bool,
    ) -> Option<ProtocolMessage> {
        let Some(entry) = self.channels.get_mut(name) else {
            let _ = done.send(Ok(()));
            return None;
        };
        match entry.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {
                self.channels.remove(name);
                let _ = done.send(Ok(()));
                None
            }
            _ => {
                entry.pending_release = true;
                self.detach(name, done, connected)
            }
        }
    }

    /// Dispatch a channel-scoped frame. Unknown channels are ignored.
    pub(crate) fn handle_frame(&mut self, frame: &ProtocolMessage) {
        let Some(name) = frame.channel.as_deref() else {
            warn!(action = ?frame.action, "channel frame without a channel name");
            return;
        };
        let Some(entry) = self.channels.get_mut(name) else {
            debug!(channel = name, action = ?frame.action, "frame for unknown channel");
            return;
        };
        if let Some(serial) = &frame.channel_serial {
            entry.channel_serial = Some(serial.clone());
        }
        match frame.action {
            Action::Attached => entry.on_attached(frame),
            Action::Detached => {
                entry.on_detached(frame);
                if entry.pending_release {
                    self.channels.remove(name);
                }
            }
            Action::Error => entry.on_error(frame),
            Action::Message => entry.on_message(frame),
            Action::Presence => entry.on_presence(frame),
            Action::Sync => entry.on_sync(frame),
            other => debug!(channel = name, action = ?other, "unexpected channel frame"),
        }
    }

    /// Move every non-terminal channel into the suspended state.
    pub(crate) fn suspend_all(&mut self) {
        for entry in self.channels.values_mut() {
            entry.suspend();
        }
    }

    /// ATTACH frames for channels that should re-attach after a reconnect.
    pub(crate) fn reattach_frames(&mut self) -> Vec<ProtocolMessage> {
        let mut frames = Vec::new();
        for entry in self.channels.values_mut() {
            if entry.state.wants_reattach() {
                entry.set_state(ChannelState::Attaching, None);
                frames.push(entry.attach_frame());
            }
        }
        frames
    }

    pub(crate) fn subscribe_messages(&mut self, name: &str) -> broadcast::Receiver<Message> {
        self.channels
            .get(name)
            .map(|e| e.messages_tx.subscribe())
            .unwrap_or_else(|| broadcast::channel(1).1)
    }

    pub(crate) fn subscribe_presence(
        &mut self,
        name: &str,
    ) -> broadcast::Receiver<PresenceMessage> {
        self.channels
            .get(name)
            .map(|e| e.presence_tx.subscribe())
            .unwrap_or_else(|| broadcast::channel(1).1)
    }

    pub(crate) fn subscribe_state(
        &mut self,
        name: &str,
    ) -> Option<broadcast::Receiver<ChannelStateChange>> {
        self.channels.get(name).map(|e| e.state_tx.subscribe())
    }

    pub(crate) fn members(&self, name: &str) -> Vec<PresenceMessage> {
        let Some(entry) = self.channels.get(name) else {
            return Vec::new();
        };
        let mut members: Vec<PresenceMessage> = entry.members.values().cloned().collect();
        members.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        members
    }

    pub(crate) fn state_of(&self, name: &str) -> ChannelState {
        self.channels
            .get(name)
            .map_or(ChannelState::Initialized, |e| e.state)
    }

    #[cfg(test)]
    pub(crate) fn sync_in_progress(&self, name: &str) -> bool {
        self.channels
            .get(name)
            .is_some_and(|e| e.sync == SyncPhase::InProgress)
    }
}

// ---------------------------------------------------------------------------
// User-facing handle
// ---------------------------------------------------------------------------

/// A handle to one named channel.
///
/// Handles are cheap to clone; all state lives with the connection actor.
#[derive(Clone)]
pub struct Channel {
    name: String,
    options: Option<ChannelOptions>,
    cmd_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        options: Option<ChannelOptions>,
        cmd_tx: mpsc::Sender<Command>,
        request_timeout: Duration,
    ) -> Self {
        Channel {
            name,
            options,
            cmd_tx,
            request_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send_command(&self, command: Command) -> Result<(), Error> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Attach to the channel; completes on ATTACHED (or a definitive error).
    pub async fn attach(&self) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send_command(Command::AttachChannel {
            name: self.name.clone(),
            options: self.options.clone(),
            done,
        })
        .await?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// Detach from the channel; completes on DETACHED.
    pub async fn detach(&self) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send_command(Command::DetachChannel {
            name: self.name.clone(),
            done,
        })
        .await?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// Publish one named message; completes when the broker ACKs it.
    pub async fn publish(&self, name: &str, data: impl Into<Data>) -> Result<(), Error> {
        self.publish_messages(vec![Message::new(name, data.into())])
            .await
    }

    /// Publish a batch in a single frame; all-or-nothing acknowledgement.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send_command(Command::Publish {
            channel: self.name.clone(),
            options: self.options.clone(),
            messages,
            done,
        })
        .await?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// Subscribe to all messages on the channel. Implies attach.
    pub async fn subscribe(&self) -> Result<Subscription, Error> {
        self.subscribe_filtered(None).await
    }

    /// Subscribe to messages with the given event name. Implies attach.
    pub async fn subscribe_to(&self, name: &str) -> Result<Subscription, Error> {
        self.subscribe_filtered(Some(name.to_owned())).await
    }

    async fn subscribe_filtered(&self, filter: Option<String>) -> Result<Subscription, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SubscribeMessages {
            name: self.name.clone(),
            options: self.options.clone(),
            reply,
        })
        .await?;
        let receiver = rx.await.map_err(|_| Error::Disconnected)??;
        self.attach().await?;
        Ok(Subscription {
            rx: receiver,
            filter,
        })
    }

    /// Subscribe to presence events. Implies attach.
    pub async fn subscribe_presence(&self) -> Result<PresenceSubscription, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SubscribePresence {
            name: self.name.clone(),
            options: self.options.clone(),
            reply,
        })
        .await?;
        let receiver = rx.await.map_err(|_| Error::Disconnected)??;
        self.attach().await?;
        Ok(PresenceSubscription { rx: receiver })
    }

    /// The currently known presence members, sorted by member key.
    pub async fn presence_members(&self) -> Result<Vec<PresenceMessage>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::PresenceMembers {
            name: self.name.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Enter the presence set; completes on ACK.
    pub async fn enter_presence(&self, data: impl Into<Data>) -> Result<(), Error> {
        self.presence_op(PresenceAction::Enter, data.into()).await
    }

    /// Update presence data; completes on ACK.
    pub async fn update_presence(&self, data: impl Into<Data>) -> Result<(), Error> {
        self.presence_op(PresenceAction::Update, data.into()).await
    }

    /// Leave the presence set; completes on ACK.
    pub async fn leave_presence(&self) -> Result<(), Error> {
        self.presence_op(PresenceAction::Leave, Data::None).await
    }

    async fn presence_op(&self, action: PresenceAction, data: Data) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send_command(Command::PresenceOp {
            name: self.name.clone(),
            action,
            data,
            done,
        })
        .await?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// The channel's current lifecycle state.
    pub async fn state(&self) -> Result<ChannelState, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::ChannelState {
            name: self.name.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Stream of state transitions, in the order they occurred.
    pub async fn state_changes(&self) -> Result<BroadcastStream<ChannelStateChange>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SubscribeChannelState {
            name: self.name.clone(),
            options: self.options.clone(),
            reply,
        })
        .await?;
        let receiver = rx.await.map_err(|_| Error::Disconnected)??;
        Ok(BroadcastStream::new(receiver))
    }
}

/// A message subscription; yields messages in frame order.
pub struct Subscription {
    rx: broadcast::Receiver<Message>,
    filter: Option<String>,
}

impl Subscription {
    /// Next matching message, or None once the channel is gone. Slow
    /// consumers skip over messages they lagged past.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => match &self.filter {
                    Some(name) if message.name.as_deref() != Some(name.as_str()) => continue,
                    _ => return Some(message),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged; messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A presence subscription; yields presence events in frame order.
pub struct PresenceSubscription {
    rx: broadcast::Receiver<PresenceMessage>,
}

impl PresenceSubscription {
    pub async fn recv(&mut self) -> Option<PresenceMessage> {
        loop {
            match self.rx.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "presence subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(WireFormat::Json)
    }

    fn attached_frame(name: &str, with_presence: bool) -> ProtocolMessage {
        let mut frame = ProtocolMessage::with_channel(Action::Attached, name);
        frame.channel_serial = Some("s:1".to_owned());
        if with_presence {
            frame.flags = Some(flags::HAS_PRESENCE);
        }
        frame
    }

    #[test]
    fn attach_transitions_and_resolves_on_attached() {
        let mut reg = registry();
        let (done, mut rx) = oneshot::channel();
        let frame = reg.attach("news", None, done, true);
        assert!(frame.is_some(), "connected attach sends a frame");
        assert_eq!(reg.state_of("news"), ChannelState::Attaching);

        reg.handle_frame(&attached_frame("news", false));
        assert_eq!(reg.state_of("news"), ChannelState::Attached);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn attach_while_disconnected_defers_the_frame() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let frame = reg.attach("news", None, done, false);
        assert!(frame.is_none());
        assert_eq!(reg.state_of("news"), ChannelState::Attaching);
        // The reattach pass after reconnect picks it up.
        let frames = reg.reattach_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Attach);
    }

    #[test]
    fn presence_flag_starts_a_sync_phase() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("room", None, done, true);
        reg.handle_frame(&attached_frame("room", true));
        assert!(reg.sync_in_progress("room"));

        // Sync frames stream members; an empty channel serial ends the phase.
        let mut sync = ProtocolMessage::with_channel(Action::Sync, "room");
        sync.channel_serial = Some("s:cursor".to_owned());
        sync.presence = Some(vec![PresenceMessage {
            action: PresenceAction::Present,
            client_id: Some("alice".to_owned()),
            connection_id: Some("c1".to_owned()),
            ..PresenceMessage::default()
        }]);
        reg.handle_frame(&sync);
        assert!(reg.sync_in_progress("room"));

        let mut sync_end = ProtocolMessage::with_channel(Action::Sync, "room");
        sync_end.presence = Some(vec![PresenceMessage {
            action: PresenceAction::Present,
            client_id: Some("bob".to_owned()),
            connection_id: Some("c2".to_owned()),
            ..PresenceMessage::default()
        }]);
        reg.handle_frame(&sync_end);
        assert!(!reg.sync_in_progress("room"));
        assert_eq!(reg.members("room").len(), 2);
    }

    #[test]
    fn presence_enter_and_leave_track_members() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("room", None, done, true);
        reg.handle_frame(&attached_frame("room", false));

        let mut enter = ProtocolMessage::with_channel(Action::Presence, "room");
        enter.presence = Some(vec![PresenceMessage {
            action: PresenceAction::Enter,
            client_id: Some("alice".to_owned()),
            connection_id: Some("c1".to_owned()),
            ..PresenceMessage::default()
        }]);
        reg.handle_frame(&enter);
        assert_eq!(reg.members("room").len(), 1);

        let mut leave = ProtocolMessage::with_channel(Action::Presence, "room");
        leave.presence = Some(vec![PresenceMessage {
            action: PresenceAction::Leave,
            client_id: Some("alice".to_owned()),
            connection_id: Some("c1".to_owned()),
            ..PresenceMessage::default()
        }]);
        reg.handle_frame(&leave);
        assert!(reg.members("room").is_empty());
    }

    #[test]
    fn messages_are_delivered_in_frame_order() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("news", None, done, true);
        reg.handle_frame(&attached_frame("news", false));
        let mut sub = reg.subscribe_messages("news");

        let mut frame = ProtocolMessage::with_channel(Action::Message, "news");
        frame.messages = Some(vec![
            Message::new("a", Data::Text("1".to_owned())),
            Message::new("b", Data::Text("2".to_owned())),
        ]);
        reg.handle_frame(&frame);

        assert_eq!(sub.try_recv().unwrap().name.as_deref(), Some("a"));
        assert_eq!(sub.try_recv().unwrap().name.as_deref(), Some("b"));
    }

    #[test]
    fn suspend_all_spares_terminal_channels() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("live", None, done, true);
        reg.handle_frame(&attached_frame("live", false));

        let (done2, mut rx2) = oneshot::channel();
        let _ = reg.attach("pending", None, done2, true);

        let _ = reg.get_or_create("untouched", None).unwrap();

        reg.suspend_all();
        assert_eq!(reg.state_of("live"), ChannelState::Suspended);
        assert_eq!(reg.state_of("pending"), ChannelState::Suspended);
        assert_eq!(reg.state_of("untouched"), ChannelState::Initialized);
        assert!(matches!(rx2.try_recv(), Ok(Err(Error::ChannelFailed(_)))));
    }

    #[test]
    fn release_of_attached_channel_waits_for_detached() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("temp", None, done, true);
        reg.handle_frame(&attached_frame("temp", false));

        let (release_done, mut release_rx) = oneshot::channel();
        let frame = reg.release("temp", release_done, true);
        assert!(matches!(frame, Some(f) if f.action == Action::Detach));
        assert_eq!(reg.state_of("temp"), ChannelState::Detaching);

        reg.handle_frame(&ProtocolMessage::with_channel(Action::Detached, "temp"));
        assert!(matches!(release_rx.try_recv(), Ok(Ok(()))));
        // Entry is gone; a new reference starts from Initialized.
        assert_eq!(reg.state_of("temp"), ChannelState::Initialized);
    }

    #[test]
    fn decode_failure_degrades_but_still_delivers() {
        let mut reg = registry();
        let (done, _rx) = oneshot::channel();
        let _ = reg.attach("news", None, done, true);
        reg.handle_frame(&attached_frame("news", false));
        let mut sub = reg.subscribe_messages("news");

        let mut frame = ProtocolMessage::with_channel(Action::Message, "news");
        frame.messages = Some(vec![Message {
            name: Some("bad".to_owned()),
            data: Data::Text("%%%not-base64%%%".to_owned()),
            encoding: Some("base64".to_owned()),
            ..Message::default()
        }]);
        reg.handle_frame(&frame);

        let delivered = sub.try_recv().unwrap();
        assert_eq!(delivered.encoding.as_deref(), Some("base64"));
        assert_eq!(delivered.data, Data::Text("%%%not-base64%%%".to_owned()));
    }
}
