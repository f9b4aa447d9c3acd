//! airwave: a realtime publish/subscribe client.
//!
//! Applications connect to a broker over a persistent WebSocket, attach to
//! named channels, publish and receive messages, track presence, and issue
//! stateless history/stats queries over the request/response API.
//!
//! The crate is built around two subsystems:
//!
//! - a **connection state machine** ([`conn::machine`]) driven by an actor
//!   task that owns the transport, the acknowledgement tracker, and the
//!   channel registry;
//! - a **reversible codec pipeline** (the `aw-codec` crate) that reduces user
//!   payloads to wire-safe form and back, composing `json`, `utf-8`,
//!   `cipher+<spec>`, and `base64` encoding labels.
//!
//! ```no_run
//! use airwave::{ClientOptions, Realtime};
//!
//! # async fn example() -> Result<(), airwave::Error> {
//! let options = ClientOptions::new(
//!     "wss://realtime.example.com",
//!     "https://rest.example.com",
//!     "my-token",
//! );
//! let client = Realtime::new(options)?;
//! client.connect().await?;
//!
//! let channel = client.channel("greetings");
//! let mut subscription = channel.subscribe().await?;
//! channel.publish("hello", "world").await?;
//! let received = subscription.recv().await;
//! # let _ = received;
//! # Ok(())
//! # }
//! ```

pub mod channel;
mod client;
pub mod conn;
mod error;
pub mod options;
pub mod pagination;
pub mod rest;
pub mod transport;
mod ws;

pub use aw_codec::{ChannelMode, ChannelOptions, CipherParams, CodecError};
pub use aw_protocol::{
    Action, ConnectionDetails, Data, ErrorInfo, Message, PresenceAction, PresenceMessage,
    ProtocolMessage, WireFormat, WireFrame, flags,
};
pub use channel::{Channel, ChannelState, ChannelStateChange, PresenceSubscription, Subscription};
pub use client::Realtime;
pub use conn::{ConnState, Connection, ConnectionInfo, ConnectionStateChange};
pub use error::Error;
pub use options::{AuthCallback, AuthMode, ClientOptions};
pub use pagination::{PageRequest, PaginatedResult};
pub use rest::{Direction, HistoryQuery, PageContext, PageItem, Rest, StatsQuery};
pub use transport::{DialRequest, Dialer, Transport, TransportEvent};
pub use ws::WsDialer;
