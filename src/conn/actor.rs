//! The connection actor.
//!
//! One tokio task per client. It serializes user commands, transport events,
//! and timer expirations into machine inputs, runs the pure transition
//! function, and executes the resulting effects. Nothing else touches the
//! transport, the ack tracker, or the channel registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use aw_protocol::{
    Action, ConnectionDetails, Data, ErrorInfo, Message, PresenceAction, PresenceMessage,
    ProtocolMessage, WireFormat,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelRegistry;
use crate::channel::ChannelState;
use crate::conn::ack::{AckTracker, PendingPublish};
use crate::conn::backoff::{Backoff, HostRotation};
use crate::conn::machine::{self, ConnState, Effect, Input, MachineContext, TimerKind};
use crate::conn::{Command, ConnectionInfo, ConnectionStateChange};
use crate::error::Error;
use crate::options::{AuthMode, ClientOptions};
use crate::transport::{DialRequest, Dialer, Transport, TransportEvent};

const INBOX_CAPACITY: usize = 64;
const EVENTS_CAPACITY: usize = 64;

/// Channels a spawned actor exposes to the client.
pub(crate) struct ActorHandles {
    pub cmd_tx: mpsc::Sender<Command>,
    pub state_rx: watch::Receiver<ConnState>,
    pub info_rx: watch::Receiver<ConnectionInfo>,
    pub events_tx: broadcast::Sender<ConnectionStateChange>,
}

/// Spawn the actor task for a client.
pub(crate) fn spawn(opts: Arc<ClientOptions>, dialer: Arc<dyn Dialer>) -> ActorHandles {
    let (cmd_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::channel(INBOX_CAPACITY);
    let (state_tx, state_rx) = watch::channel(ConnState::Initialized);
    let (info_tx, info_rx) = watch::channel(ConnectionInfo::default());
    let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);

    let wire = opts.wire_format();
    let current_token = match &opts.auth {
        AuthMode::Token(token) => Some(token.clone()),
        _ => None,
    };
    let actor = ConnectionActor {
        backoff: Backoff::new(opts.disconnected_retry_ms),
        hosts: HostRotation::new(opts.realtime_url.clone(), &opts.fallback_hosts),
        registry: ChannelRegistry::new(wire),
        tracker: AckTracker::new(opts.pending_ack_capacity),
        queued: VecDeque::new(),
        msg_serial: 0,
        state: ConnState::Initialized,
        transport: None,
        transport_rx: None,
        details: None,
        info: ConnectionInfo::default(),
        current_token,
        auth_renewed: false,
        last_dial_resume: false,
        timers: HashMap::new(),
        pending_inputs: VecDeque::new(),
        connect_waiters: Vec::new(),
        close_waiters: Vec::new(),
        wire,
        opts,
        dialer,
        inbox,
        internal_rx,
        internal_tx,
        state_tx,
        info_tx,
        events_tx: events_tx.clone(),
    };
    tokio::spawn(actor.run());

    ActorHandles {
        cmd_tx,
        state_rx,
        info_rx,
        events_tx,
    }
}

enum InternalEvent {
    TokenMinted(Result<String, ErrorInfo>),
}

struct QueuedSend {
    frame: ProtocolMessage,
    done: oneshot::Sender<Result<(), Error>>,
}

enum Wake {
    Command(Option<Command>),
    Internal(InternalEvent),
    Transport(Option<TransportEvent>),
    Timer(TimerKind),
}

struct ConnectionActor {
    opts: Arc<ClientOptions>,
    dialer: Arc<dyn Dialer>,
    wire: WireFormat,

    inbox: mpsc::Receiver<Command>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,

    state: ConnState,
    registry: ChannelRegistry,
    tracker: AckTracker,
    queued: VecDeque<QueuedSend>,
    msg_serial: i64,

    transport: Option<Box<dyn Transport>>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,

    details: Option<ConnectionDetails>,
    info: ConnectionInfo,
    current_token: Option<String>,
    auth_renewed: bool,
    last_dial_resume: bool,

    timers: HashMap<TimerKind, Instant>,
    backoff: Backoff,
    hosts: HostRotation,
    /// Inputs produced while executing effects; drained before selecting.
    pending_inputs: VecDeque<Input>,

    connect_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    close_waiters: Vec<oneshot::Sender<Result<(), Error>>>,

    state_tx: watch::Sender<ConnState>,
    info_tx: watch::Sender<ConnectionInfo>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            while let Some(input) = self.pending_inputs.pop_front() {
                self.step(input);
            }

            let deadline = self.next_deadline();
            let far_future = Instant::now() + Duration::from_secs(24 * 3600);
            let wake = tokio::select! {
                biased;
                command = self.inbox.recv() => Wake::Command(command),
                Some(event) = self.internal_rx.recv() => Wake::Internal(event),
                event = Self::next_transport_event(&mut self.transport_rx) => {
                    Wake::Transport(event)
                }
                _ = tokio::time::sleep_until(deadline.map_or(far_future, |d| d.1)),
                    if deadline.is_some() =>
                {
                    match deadline {
                        Some((kind, _)) => Wake::Timer(kind),
                        None => continue,
                    }
                }
            };

            match wake {
                Wake::Command(None) => {
                    self.shutdown();
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Internal(event) => self.handle_internal(event),
                Wake::Transport(Some(event)) => self.handle_transport_event(event),
                Wake::Transport(None) => {
                    self.transport_rx = None;
                    self.step(Input::TransportClosed(None));
                }
                Wake::Timer(kind) => {
                    self.timers.remove(&kind);
                    self.step(Input::Timer(kind));
                }
            }
        }
    }

    async fn next_transport_event(
        rx: &mut Option<mpsc::Receiver<TransportEvent>>,
    ) -> Option<TransportEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    // -- machine driving ----------------------------------------------------

    fn step(&mut self, input: Input) {
        let ctx = MachineContext {
            has_transport: self.transport.is_some(),
            prior_connection_id: self.info.connection_id.clone(),
            can_resume: self.info.connection_key.is_some(),
            auth_renewable: matches!(self.opts.auth, AuthMode::Callback(_)),
            auth_renewed: self.auth_renewed,
        };
        let transition = machine::transition(self.state, input, &ctx);
        if !transition.handled {
            debug!(state = %self.state, "input ignored in this state");
        }
        self.state = transition.next;
        for effect in transition.effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Dial { resume } => self.start_dial(resume),
            Effect::DestroyTransport => self.destroy_transport(),
            Effect::SendFrame(frame) => self.send_frame(frame),
            Effect::ArmTimer(kind) => self.arm_timer(kind),
            Effect::CancelTimer(kind) => {
                self.timers.remove(&kind);
            }
            Effect::ApplyConnected(frame) => self.apply_connected(*frame),
            Effect::ResetBackoff => {
                self.backoff.reset();
                self.hosts.reset();
            }
            Effect::ResendPending => {
                let frames = self.tracker.frames_for_resend();
                info!(count = frames.len(), "resuming with pending publishes");
                for frame in frames {
                    self.send_frame(frame);
                }
            }
            Effect::FailPending => {
                self.tracker.fail_all();
                // Serial continuity only survives an accepted resume.
                self.msg_serial = 0;
            }
            Effect::DrainQueued => self.drain_queued(),
            Effect::ClearConnectionKey => {
                self.info.connection_key = None;
                let _ = self.info_tx.send(self.info.clone());
            }
            Effect::RenewAuth => self.renew_auth(),
            Effect::RouteToChannel(frame) => self.registry.handle_frame(&frame),
            Effect::AckRange { serial, count } => self.tracker.ack(serial, count),
            Effect::NackRange {
                serial,
                count,
                error,
            } => self.tracker.nack(serial, count, error),
            Effect::SuspendChannels => self.registry.suspend_all(),
            Effect::ReattachChannels => {
                for frame in self.registry.reattach_frames() {
                    self.send_frame(frame);
                }
            }
            Effect::NotifyState { state, error } => self.notify_state(state, error),
        }
    }

    // -- effect implementations ---------------------------------------------

    fn start_dial(&mut self, resume: bool) {
        self.last_dial_resume = resume;
        if self.current_token.is_none() && matches!(self.opts.auth, AuthMode::Callback(_)) {
            self.renew_auth();
            return;
        }
        self.do_dial(resume);
    }

    fn do_dial(&mut self, resume: bool) {
        let url = self.build_url(resume);
        debug!(url = %redact_query(&url), resume, "dialing");
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let request = DialRequest {
            url,
            token: self.current_token.clone(),
            format: self.wire,
        };
        self.destroy_transport();
        self.transport = Some(self.dialer.dial(request, tx));
        self.transport_rx = Some(rx);
    }

    fn build_url(&self, resume: bool) -> String {
        let mut url = self.hosts.current().to_owned();
        let mut push_param = |url: &mut String, key: &str, value: &str| {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        };
        push_param(&mut url, "format", self.wire.query_value());
        if let AuthMode::ApiKey(key) = &self.opts.auth {
            push_param(&mut url, "key", key);
        }
        if let Some(client_id) = &self.opts.client_id {
            push_param(&mut url, "clientId", client_id);
        }
        if resume {
            if let Some(connection_key) = &self.info.connection_key {
                push_param(&mut url, "resume", connection_key);
                let serial = self.info.connection_serial.unwrap_or(-1).to_string();
                push_param(&mut url, "connectionSerial", &serial);
            }
        }
        url
    }

    fn destroy_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.transport_rx = None;
    }

    fn send_frame(&mut self, frame: ProtocolMessage) {
        let Some(transport) = &mut self.transport else {
            debug!(action = ?frame.action, "no transport; frame dropped");
            return;
        };
        match self.wire.encode(&frame) {
            Ok(wire_frame) => {
                if let Err(e) = transport.send(wire_frame) {
                    warn!(error = %e, "transport send failed");
                    self.pending_inputs.push_back(Input::TransportError {
                        error: ErrorInfo::new(80000, None, e.to_string()),
                        recoverable: true,
                    });
                }
            }
            Err(e) => warn!(error = %e, action = ?frame.action, "frame encode failed"),
        }
    }

    fn arm_timer(&mut self, kind: TimerKind) {
        let duration = self.timer_duration(kind);
        let deadline = Instant::now() + duration;
        if kind == TimerKind::StateTtl {
            // The TTL clock measures time since the connection dropped; it
            // must survive intermediate retry cycles un-reset.
            self.timers.entry(kind).or_insert(deadline);
        } else {
            self.timers.insert(kind, deadline);
        }
    }

    fn timer_duration(&mut self, kind: TimerKind) -> Duration {
        let ms = match kind {
            TimerKind::Connect => self.opts.connect_timeout_ms,
            TimerKind::Close => self.opts.request_timeout_ms,
            TimerKind::Retry => match self.state {
                ConnState::Suspended => self.opts.suspended_retry_ms,
                _ => self.backoff.next_delay_ms(),
            },
            TimerKind::StateTtl => self.effective_state_ttl_ms(),
            // Inbound silence for a whole state TTL triggers an outbound
            // heartbeat; any frame must then arrive within the idle window.
            TimerKind::Heartbeat => self.effective_state_ttl_ms(),
            TimerKind::Idle => self.idle_window_ms(),
        };
        Duration::from_millis(ms)
    }

    fn effective_state_ttl_ms(&self) -> u64 {
        self.details
            .as_ref()
            .and_then(|d| d.connection_state_ttl)
            .and_then(|ttl| u64::try_from(ttl).ok())
            .unwrap_or(self.opts.connection_state_ttl_ms)
    }

    fn idle_window_ms(&self) -> u64 {
        self.details
            .as_ref()
            .and_then(|d| d.max_idle_interval)
            .and_then(|idle| u64::try_from(idle).ok())
            .unwrap_or_else(|| (self.effective_state_ttl_ms() / 5).max(1_000))
    }

    fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        self.timers
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }

    fn apply_connected(&mut self, frame: ProtocolMessage) {
        self.info.connection_id = frame.connection_id.clone();
        self.info.connection_key = frame
            .connection_details
            .as_ref()
            .and_then(|d| d.connection_key.clone())
            .or(frame.connection_key);
        if let Some(serial) = frame.connection_serial {
            self.info.connection_serial = Some(serial);
        }
        self.details = frame.connection_details;
        self.auth_renewed = false;
        info!(
            connection_id = self.info.connection_id.as_deref().unwrap_or(""),
            "connection established"
        );
        let _ = self.info_tx.send(self.info.clone());
    }

    fn renew_auth(&mut self) {
        let AuthMode::Callback(callback) = &self.opts.auth else {
            self.pending_inputs.push_back(Input::TransportError {
                error: ErrorInfo::new(40101, Some(401), "token expired and not renewable"),
                recoverable: false,
            });
            return;
        };
        debug!("requesting a fresh token");
        let future = callback();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(InternalEvent::TokenMinted(future.await)).await;
        });
    }

    fn notify_state(&mut self, state: ConnState, error: Option<ErrorInfo>) {
        let previous = *self.state_tx.borrow();
        if previous == state {
            return;
        }
        info!(from = %previous, to = %state, "connection state");
        let _ = self.state_tx.send(state);
        let _ = self.events_tx.send(ConnectionStateChange {
            previous,
            current: state,
            reason: error.clone(),
        });

        match state {
            ConnState::Connected => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnState::Failed => {
                let failure = error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::new(80000, None, "connection failed"));
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(Error::from_connection_failure(failure.clone())));
                }
                for waiter in self.close_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.fail_queued();
            }
            ConnState::Closed => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(Error::Disconnected));
                }
                for waiter in self.close_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.fail_queued();
            }
            ConnState::Suspended => self.fail_queued(),
            _ => {}
        }
    }

    fn fail_queued(&mut self) {
        for queued in self.queued.drain(..) {
            let _ = queued.done.send(Err(Error::Disconnected));
        }
    }

    // -- inbound handling ---------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.step(Input::TransportConnected),
            TransportEvent::Frame(wire_frame) => match self.wire.decode(&wire_frame) {
                Ok(frame) => {
                    if self.state == ConnState::Connected {
                        if let Some(serial) = frame.connection_serial {
                            self.info.connection_serial = Some(serial);
                            let _ = self.info_tx.send(self.info.clone());
                        }
                        // Any inbound frame counts as activity.
                        self.arm_timer(TimerKind::Heartbeat);
                        self.timers.remove(&TimerKind::Idle);
                    }
                    self.step(Input::Frame(frame));
                }
                Err(e) => {
                    error!(error = %e, "undecodable frame");
                    self.step(Input::TransportError {
                        error: ErrorInfo::new(80013, Some(400), format!("protocol violation: {e}")),
                        recoverable: false,
                    });
                }
            },
            TransportEvent::Closed(reason) => {
                self.destroy_transport();
                self.step(Input::TransportClosed(reason));
            }
            TransportEvent::Error { error, recoverable } => {
                if self.state == ConnState::Connecting && recoverable {
                    // Next attempt goes to the next host in the rotation.
                    self.hosts.advance();
                }
                self.step(Input::TransportError { error, recoverable });
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TokenMinted(Ok(token)) => {
                self.current_token = Some(token);
                self.auth_renewed = true;
                if self.state == ConnState::Connecting {
                    let resume = self.last_dial_resume;
                    self.do_dial(resume);
                }
            }
            InternalEvent::TokenMinted(Err(info)) => {
                warn!(error = %info, "token renewal failed");
                self.step(Input::TransportError {
                    error: info,
                    recoverable: false,
                });
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done } => {
                if self.state == ConnState::Connected {
                    let _ = done.send(Ok(()));
                } else {
                    self.connect_waiters.push(done);
                    self.step(Input::Connect);
                }
            }
            Command::Close { done } => {
                if self.state == ConnState::Closed {
                    let _ = done.send(Ok(()));
                } else {
                    self.close_waiters.push(done);
                    self.step(Input::CloseRequest);
                }
            }
            Command::Publish {
                channel,
                options,
                messages,
                done,
            } => self.publish(channel, options, messages, done),
            Command::PresenceOp {
                name,
                action,
                data,
                done,
            } => self.presence_op(name, action, data, done),
            Command::AttachChannel {
                name,
                options,
                done,
            } => {
                let connected = self.state == ConnState::Connected;
                if let Some(frame) = self.registry.attach(&name, options, done, connected) {
                    self.send_frame(frame);
                }
            }
            Command::DetachChannel { name, done } => {
                let connected = self.state == ConnState::Connected;
                if let Some(frame) = self.registry.detach(&name, done, connected) {
                    self.send_frame(frame);
                }
            }
            Command::ReleaseChannel { name, done } => {
                let connected = self.state == ConnState::Connected;
                if let Some(frame) = self.registry.release(&name, done, connected) {
                    self.send_frame(frame);
                }
            }
            Command::SubscribeMessages {
                name,
                options,
                reply,
            } => {
                let result = match self.registry.get_or_create(&name, options) {
                    Ok(_) => Ok(self.registry.subscribe_messages(&name)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SubscribePresence {
                name,
                options,
                reply,
            } => {
                let result = match self.registry.get_or_create(&name, options) {
                    Ok(_) => Ok(self.registry.subscribe_presence(&name)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SubscribeChannelState {
                name,
                options,
                reply,
            } => {
                let result = match self.registry.get_or_create(&name, options) {
                    Ok(_) => Ok(self
                        .registry
                        .subscribe_state(&name)
                        .unwrap_or_else(|| broadcast::channel(1).1)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::PresenceMembers { name, reply } => {
                let _ = reply.send(self.registry.members(&name));
            }
            Command::ChannelState { name, reply } => {
                let _ = reply.send(self.registry.state_of(&name));
            }
        }
    }

    // -- publish path -------------------------------------------------------

    fn publish(
        &mut self,
        channel: String,
        options: Option<aw_codec::ChannelOptions>,
        mut messages: Vec<Message>,
        done: oneshot::Sender<Result<(), Error>>,
    ) {
        let entry = match self.registry.get_or_create(&channel, options) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        for message in &mut messages {
            if let Err(e) = entry.pipeline().encode(message) {
                let _ = done.send(Err(e.into()));
                return;
            }
        }
        let mut frame = ProtocolMessage::with_channel(Action::Message, channel);
        frame.messages = Some(messages);
        self.send_or_queue(frame, done);
    }

    fn presence_op(
        &mut self,
        name: String,
        action: PresenceAction,
        data: Data,
        done: oneshot::Sender<Result<(), Error>>,
    ) {
        let Some(client_id) = self.opts.client_id.clone() else {
            let _ = done.send(Err(Error::BadOptions(
                "presence operations require a client_id".to_owned(),
            )));
            return;
        };
        if self.registry.state_of(&name) != ChannelState::Attached {
            let _ = done.send(Err(Error::ChannelNotAttached));
            return;
        }
        let entry = match self.registry.get_or_create(&name, None) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        let mut presence = PresenceMessage::new(action, client_id, data);
        if let Err(e) = entry.pipeline().encode(&mut presence) {
            let _ = done.send(Err(e.into()));
            return;
        }
        let mut frame = ProtocolMessage::with_channel(Action::Presence, name);
        frame.presence = Some(vec![presence]);
        self.send_or_queue(frame, done);
    }

    fn send_or_queue(&mut self, frame: ProtocolMessage, done: oneshot::Sender<Result<(), Error>>) {
        match self.state {
            ConnState::Connected => {
                let serial = self.msg_serial;
                self.msg_serial += 1;
                let mut frame = frame;
                frame.msg_serial = Some(serial);
                self.tracker.push(PendingPublish {
                    frame: frame.clone(),
                    serial,
                    count: 1,
                    done,
                });
                self.send_frame(frame);
            }
            ConnState::Initialized | ConnState::Connecting | ConnState::Disconnected
                if self.opts.queue_messages =>
            {
                if self.queued.len() >= self.opts.queue_capacity {
                    let _ = done.send(Err(Error::QueueOverflow));
                } else {
                    self.queued.push_back(QueuedSend { frame, done });
                }
            }
            ConnState::Suspended => {
                let _ = done.send(Err(Error::ChannelSuspended));
            }
            _ => {
                let _ = done.send(Err(Error::Disconnected));
            }
        }
    }

    fn drain_queued(&mut self) {
        if self.queued.is_empty() {
            return;
        }
        debug!(count = self.queued.len(), "flushing queued publishes");
        let queued: Vec<QueuedSend> = self.queued.drain(..).collect();
        for entry in queued {
            self.send_or_queue(entry.frame, entry.done);
        }
    }

    fn shutdown(&mut self) {
        debug!("client dropped; shutting the connection actor down");
        self.destroy_transport();
        self.tracker.fail_all();
        self.fail_queued();
    }
}

/// Strip query values (tokens, keys) from a URL for logging.
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
