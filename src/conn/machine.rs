//! The connection state machine as a pure transition function.
//!
//! `transition(state, input, ctx)` returns the next state plus an ordered
//! list of effects; it performs no I/O and holds no timers, which keeps every
//! transition unit-testable. The actor executes the effects in order.
//!
//! States and transitions follow the protocol's connection lifecycle:
//! Initialized -> Connecting -> Connected, with Disconnected (short retry,
//! resumable), Suspended (long retry, fresh connect), Closing/Closed, and
//! Failed as the terminal error state.

use aw_protocol::{Action, ErrorInfo, ProtocolMessage};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnState::Initialized => "initialized",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnected => "disconnected",
            ConnState::Suspended => "suspended",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
            ConnState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Timers the machine arms and cancels; durations are the actor's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Dial + CONNECTED handshake deadline.
    Connect,
    /// Reconnect delay (short in Disconnected, long in Suspended).
    Retry,
    /// Elapsed-disconnection clock; expiry demotes Disconnected to Suspended.
    StateTtl,
    /// CLOSED handshake deadline.
    Close,
    /// Inbound-idle monitor while Connected.
    Heartbeat,
    /// Response window after an outbound heartbeat.
    Idle,
}

/// Inputs: user actions, transport events, and timer expirations.
#[derive(Debug)]
pub enum Input {
    Connect,
    CloseRequest,
    Send(ProtocolMessage),
    TransportConnected,
    TransportClosed(Option<ErrorInfo>),
    TransportError { error: ErrorInfo, recoverable: bool },
    Frame(ProtocolMessage),
    Timer(TimerKind),
}

/// Commands the actor executes after a transition, in order.
#[derive(Debug)]
pub enum Effect {
    /// Start a transport dial; `resume` carries the prior connection key.
    Dial { resume: bool },
    DestroyTransport,
    SendFrame(ProtocolMessage),
    ArmTimer(TimerKind),
    CancelTimer(TimerKind),
    /// Store identity/serials/details from a CONNECTED frame.
    ApplyConnected(Box<ProtocolMessage>),
    /// Reset the reconnect backoff and fallback-host rotation.
    ResetBackoff,
    /// Re-send tracked publishes with their original serials (resume ok).
    ResendPending,
    /// Fail tracked and queued publishes with `Disconnected`.
    FailPending,
    /// Flush publishes queued while not connected.
    DrainQueued,
    ClearConnectionKey,
    /// Renew the auth token and dial again (token-expired path).
    RenewAuth,
    /// Route a channel-scoped frame to the channel registry.
    RouteToChannel(Box<ProtocolMessage>),
    /// Ack/nack a serial range in the tracker.
    AckRange { serial: i64, count: u32 },
    NackRange {
        serial: i64,
        count: u32,
        error: ErrorInfo,
    },
    /// Move all non-terminal channels to their suspended state.
    SuspendChannels,
    /// Re-attach channels that were attached before the drop.
    ReattachChannels,
    NotifyState {
        state: ConnState,
        error: Option<ErrorInfo>,
    },
}

/// Facts about the actor the pure function needs to branch on.
#[derive(Debug, Clone, Default)]
pub struct MachineContext {
    pub has_transport: bool,
    /// Connection id from the previous CONNECTED, if any.
    pub prior_connection_id: Option<String>,
    /// A resume key is held and the state TTL has not expired.
    pub can_resume: bool,
    /// An auth callback exists, so expired tokens are renewable.
    pub auth_renewable: bool,
    /// A renewal was already attempted for this connection attempt.
    pub auth_renewed: bool,
}

/// Outcome of one transition.
#[derive(Debug)]
pub struct Transition {
    pub next: ConnState,
    pub effects: Vec<Effect>,
    /// False when the input was ignored (e.g. any frame while Closed).
    pub handled: bool,
}

impl Transition {
    fn to(next: ConnState, effects: Vec<Effect>) -> Self {
        Transition {
            next,
            effects,
            handled: true,
        }
    }

    fn stay(state: ConnState, effects: Vec<Effect>) -> Self {
        Transition {
            next: state,
            effects,
            handled: true,
        }
    }

    fn unhandled(state: ConnState) -> Self {
        Transition {
            next: state,
            effects: Vec::new(),
            handled: false,
        }
    }
}

// -- entry effect helpers ---------------------------------------------------

fn enter_connecting(resume: bool) -> Vec<Effect> {
    vec![
        Effect::Dial { resume },
        Effect::ArmTimer(TimerKind::Connect),
        Effect::NotifyState {
            state: ConnState::Connecting,
            error: None,
        },
    ]
}

fn enter_connected(frame: ProtocolMessage, resumed: bool) -> Vec<Effect> {
    let mut effects = vec![
        Effect::CancelTimer(TimerKind::Connect),
        Effect::CancelTimer(TimerKind::StateTtl),
        Effect::ResetBackoff,
        Effect::ApplyConnected(Box::new(frame)),
    ];
    if resumed {
        effects.push(Effect::ResendPending);
    } else {
        effects.push(Effect::FailPending);
    }
    effects.push(Effect::ArmTimer(TimerKind::Heartbeat));
    effects.push(Effect::NotifyState {
        state: ConnState::Connected,
        error: None,
    });
    effects.push(Effect::ReattachChannels);
    effects.push(Effect::DrainQueued);
    effects
}

fn enter_disconnected(error: Option<ErrorInfo>) -> Vec<Effect> {
    vec![
        Effect::DestroyTransport,
        Effect::ArmTimer(TimerKind::Retry),
        Effect::ArmTimer(TimerKind::StateTtl),
        Effect::NotifyState {
            state: ConnState::Disconnected,
            error,
        },
    ]
}

fn enter_suspended(error: Option<ErrorInfo>) -> Vec<Effect> {
    vec![
        Effect::CancelTimer(TimerKind::Retry),
        Effect::FailPending,
        Effect::SuspendChannels,
        Effect::ArmTimer(TimerKind::Retry),
        Effect::NotifyState {
            state: ConnState::Suspended,
            error,
        },
    ]
}

fn enter_closing() -> Vec<Effect> {
    vec![
        Effect::SendFrame(ProtocolMessage::new(Action::Close)),
        Effect::ArmTimer(TimerKind::Close),
        Effect::NotifyState {
            state: ConnState::Closing,
            error: None,
        },
    ]
}

fn enter_closed(error: Option<ErrorInfo>) -> Vec<Effect> {
    vec![
        Effect::CancelTimer(TimerKind::Close),
        Effect::CancelTimer(TimerKind::Retry),
        Effect::CancelTimer(TimerKind::StateTtl),
        Effect::DestroyTransport,
        Effect::ClearConnectionKey,
        Effect::FailPending,
        Effect::NotifyState {
            state: ConnState::Closed,
            error,
        },
    ]
}

fn enter_failed(error: Option<ErrorInfo>) -> Vec<Effect> {
    vec![
        Effect::CancelTimer(TimerKind::Connect),
        Effect::CancelTimer(TimerKind::Heartbeat),
        Effect::CancelTimer(TimerKind::Idle),
        Effect::DestroyTransport,
        Effect::FailPending,
        Effect::NotifyState {
            state: ConnState::Failed,
            error,
        },
    ]
}

fn exit_connected() -> Vec<Effect> {
    vec![
        Effect::CancelTimer(TimerKind::Heartbeat),
        Effect::CancelTimer(TimerKind::Idle),
    ]
}

/// The close() transition shared by every state: Closing when a transport
/// exists, straight to Closed otherwise.
fn close_from(state: ConnState, ctx: &MachineContext) -> Transition {
    let mut effects = if state == ConnState::Connected {
        exit_connected()
    } else {
        vec![Effect::CancelTimer(TimerKind::Connect)]
    };
    if ctx.has_transport {
        effects.extend(enter_closing());
        Transition::to(ConnState::Closing, effects)
    } else {
        effects.extend(enter_closed(None));
        Transition::to(ConnState::Closed, effects)
    }
}

/// Apply one input to the machine.
pub fn transition(state: ConnState, input: Input, ctx: &MachineContext) -> Transition {
    match state {
        ConnState::Initialized => match input {
            Input::Connect => Transition::to(ConnState::Connecting, enter_connecting(false)),
            Input::CloseRequest => close_from(state, ctx),
            // A CLOSE frame before the first connect is meaningless; ignore.
            _ => Transition::unhandled(state),
        },

        ConnState::Connecting => connecting(input, ctx),
        ConnState::Connected => connected(input, ctx),
        ConnState::Disconnected => disconnected(input, ctx),
        ConnState::Suspended => suspended(input, ctx),
        ConnState::Closing => closing(input),

        ConnState::Closed => match input {
            Input::Connect => Transition::to(ConnState::Connecting, enter_connecting(false)),
            // close() is a no-op; send() is dropped; frames are not handled.
            Input::CloseRequest => Transition::stay(state, Vec::new()),
            Input::Send(_) => Transition::stay(state, Vec::new()),
            _ => Transition::unhandled(state),
        },

        ConnState::Failed => match input {
            Input::Connect => Transition::to(ConnState::Connecting, enter_connecting(false)),
            Input::CloseRequest => Transition::stay(state, Vec::new()),
            _ => Transition::unhandled(state),
        },
    }
}

fn connecting(input: Input, ctx: &MachineContext) -> Transition {
    let state = ConnState::Connecting;
    match input {
        Input::TransportConnected => Transition::stay(state, Vec::new()),
        Input::Frame(frame) => match frame.action {
            Action::Connected => {
                let resumed = match (&ctx.prior_connection_id, &frame.connection_id) {
                    (Some(prior), Some(new)) => prior == new,
                    _ => false,
                };
                Transition::to(ConnState::Connected, enter_connected(frame, resumed))
            }
            Action::Error => {
                let error = frame.error.unwrap_or_default();
                if error.is_token_expired() && ctx.auth_renewable && !ctx.auth_renewed {
                    Transition::stay(
                        state,
                        vec![Effect::DestroyTransport, Effect::RenewAuth],
                    )
                } else {
                    Transition::to(ConnState::Failed, enter_failed(Some(error)))
                }
            }
            Action::Disconnected => {
                Transition::to(ConnState::Disconnected, enter_disconnected(frame.error))
            }
            Action::Close | Action::Closed => {
                Transition::to(ConnState::Closed, enter_closed(frame.error))
            }
            _ => Transition::unhandled(state),
        },
        Input::Timer(TimerKind::Connect) => {
            let error = ErrorInfo::new(80014, Some(408), "connection attempt timed out");
            Transition::to(ConnState::Failed, enter_failed(Some(error)))
        }
        Input::TransportError { error, recoverable } => {
            if recoverable {
                let mut effects = vec![Effect::CancelTimer(TimerKind::Connect)];
                effects.extend(enter_disconnected(Some(error)));
                Transition::to(ConnState::Disconnected, effects)
            } else {
                Transition::to(ConnState::Failed, enter_failed(Some(error)))
            }
        }
        Input::TransportClosed(error) => {
            let mut effects = vec![Effect::CancelTimer(TimerKind::Connect)];
            effects.extend(enter_disconnected(error));
            Transition::to(ConnState::Disconnected, effects)
        }
        Input::CloseRequest => close_from(state, ctx),
        _ => Transition::unhandled(state),
    }
}

fn connected(input: Input, ctx: &MachineContext) -> Transition {
    let state = ConnState::Connected;
    match input {
        Input::Frame(frame) => match frame.action {
            Action::Heartbeat => Transition::stay(state, Vec::new()),
            Action::Connected => {
                // Re-issued CONNECTED (e.g. after in-place re-auth): refresh
                // the stored details.
                Transition::stay(state, vec![Effect::ApplyConnected(Box::new(frame))])
            }
            Action::Ack => Transition::stay(
                state,
                vec![Effect::AckRange {
                    serial: frame.msg_serial.unwrap_or(0),
                    count: frame.count.unwrap_or(1),
                }],
            ),
            Action::Nack => Transition::stay(
                state,
                vec![Effect::NackRange {
                    serial: frame.msg_serial.unwrap_or(0),
                    count: frame.count.unwrap_or(1),
                    error: frame.error.unwrap_or_else(|| {
                        ErrorInfo::new(50000, Some(500), "message not accepted")
                    }),
                }],
            ),
            Action::Disconnect | Action::Disconnected => {
                let mut effects = exit_connected();
                effects.extend(enter_disconnected(frame.error));
                Transition::to(ConnState::Disconnected, effects)
            }
            Action::Close | Action::Closed => {
                let mut effects = exit_connected();
                effects.extend(enter_closed(frame.error));
                Transition::to(ConnState::Closed, effects)
            }
            Action::Error if frame.channel.is_none() => {
                let mut effects = exit_connected();
                effects.extend(enter_failed(frame.error.clone()));
                Transition::to(ConnState::Failed, effects)
            }
            action if action.is_channel_scoped() || action == Action::Error => {
                Transition::stay(state, vec![Effect::RouteToChannel(Box::new(frame))])
            }
            _ => Transition::unhandled(state),
        },
        Input::Send(frame) => Transition::stay(state, vec![Effect::SendFrame(frame)]),
        Input::Timer(TimerKind::Heartbeat) => Transition::stay(
            state,
            vec![
                Effect::SendFrame(ProtocolMessage::new(Action::Heartbeat)),
                Effect::ArmTimer(TimerKind::Idle),
            ],
        ),
        Input::Timer(TimerKind::Idle) => {
            let error = ErrorInfo::new(80003, Some(408), "no activity within the idle window");
            let mut effects = exit_connected();
            effects.extend(enter_disconnected(Some(error)));
            Transition::to(ConnState::Disconnected, effects)
        }
        Input::TransportClosed(error) => {
            let mut effects = exit_connected();
            effects.extend(enter_disconnected(error));
            Transition::to(ConnState::Disconnected, effects)
        }
        Input::TransportError { error, recoverable } => {
            let mut effects = exit_connected();
            if recoverable {
                effects.extend(enter_disconnected(Some(error)));
                Transition::to(ConnState::Disconnected, effects)
            } else {
                effects.extend(enter_failed(Some(error)));
                Transition::to(ConnState::Failed, effects)
            }
        }
        Input::CloseRequest => close_from(state, ctx),
        Input::Connect => Transition::stay(state, Vec::new()),
        _ => Transition::unhandled(state),
    }
}

fn disconnected(input: Input, ctx: &MachineContext) -> Transition {
    let state = ConnState::Disconnected;
    match input {
        Input::Timer(TimerKind::Retry) | Input::Connect => {
            let mut effects = vec![Effect::CancelTimer(TimerKind::Retry)];
            effects.extend(enter_connecting(ctx.can_resume));
            Transition::to(ConnState::Connecting, effects)
        }
        Input::Timer(TimerKind::StateTtl) => {
            Transition::to(ConnState::Suspended, enter_suspended(None))
        }
        Input::CloseRequest => close_from(state, ctx),
        _ => Transition::unhandled(state),
    }
}

fn suspended(input: Input, ctx: &MachineContext) -> Transition {
    let state = ConnState::Suspended;
    match input {
        Input::Timer(TimerKind::Retry) | Input::Connect => {
            let mut effects = vec![Effect::CancelTimer(TimerKind::Retry)];
            // Fresh connection: the state TTL has lapsed, so no resume.
            effects.extend(enter_connecting(false));
            Transition::to(ConnState::Connecting, effects)
        }
        Input::CloseRequest => close_from(state, ctx),
        _ => Transition::unhandled(state),
    }
}

fn closing(input: Input) -> Transition {
    let state = ConnState::Closing;
    match input {
        Input::Frame(frame) if frame.action == Action::Closed => {
            Transition::to(ConnState::Closed, enter_closed(frame.error))
        }
        Input::Frame(frame) if frame.action == Action::Error => {
            Transition::to(ConnState::Failed, enter_failed(frame.error))
        }
        Input::Timer(TimerKind::Close) => Transition::to(ConnState::Closed, enter_closed(None)),
        Input::TransportClosed(_) | Input::TransportError { .. } => {
            Transition::to(ConnState::Closed, enter_closed(None))
        }
        Input::CloseRequest => Transition::stay(state, Vec::new()),
        _ => Transition::unhandled(state),
    }
}
