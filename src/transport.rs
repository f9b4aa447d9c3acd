//! Transport seam between the connection actor and a concrete socket.
//!
//! Exactly one transport is active per connection, owned and mutated only by
//! the actor. A transport pushes [`TransportEvent`]s into the channel it was
//! given at dial time; the actor sends frames down with [`Transport::send`]
//! and tears the socket down with [`Transport::destroy`], which must be
//! idempotent and synchronous.

use aw_protocol::{ErrorInfo, WireFormat, WireFrame};
use tokio::sync::mpsc;

use crate::error::Error;

/// Events a transport posts into the connection actor's inbox.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is open; the broker's first frame is expected next.
    Opened,
    /// A raw frame arrived.
    Frame(WireFrame),
    /// The peer closed the socket.
    Closed(Option<ErrorInfo>),
    /// The socket failed. `recoverable` distinguishes network-level trouble
    /// (worth a retry) from terminal failures.
    Error {
        error: ErrorInfo,
        recoverable: bool,
    },
}

/// Everything the actor needs to know to dial.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Fully-formed WebSocket URL including format/resume query parameters.
    pub url: String,
    /// Bearer token attached as an `Authorization` header, when set.
    pub token: Option<String>,
    pub format: WireFormat,
}

/// An active (or connecting) transport.
pub trait Transport: Send {
    /// Queue a frame for sending. Errors surface as transport events rather
    /// than propagating here, so the actor has a single failure path.
    fn send(&mut self, frame: WireFrame) -> Result<(), Error>;

    /// Tear the socket down. Safe to call more than once.
    fn destroy(&mut self);
}

/// Starts transports. The production implementation dials WebSockets; tests
/// inject an in-process pair.
pub trait Dialer: Send + Sync {
    /// Begin dialing. Returns immediately; the handshake outcome arrives as
    /// an `Opened` or `Error` event on `events`.
    fn dial(&self, request: DialRequest, events: mpsc::Sender<TransportEvent>)
    -> Box<dyn Transport>;
}
