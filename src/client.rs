//! The realtime client: owns the connection actor and hands out channel
//! handles.

use std::sync::Arc;

use aw_codec::ChannelOptions;
use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::conn::{Command, Connection, actor};
use crate::error::Error;
use crate::options::ClientOptions;
use crate::rest::Rest;
use crate::transport::Dialer;
use crate::ws::WsDialer;

/// A realtime pub/sub client.
///
/// Construction spawns the connection actor but does not dial; call
/// [`Realtime::connect`] (or rely on the first publish being queued until a
/// connect is issued).
pub struct Realtime {
    connection: Connection,
    opts: Arc<ClientOptions>,
}

impl Realtime {
    /// A client using the production WebSocket transport.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::with_dialer(options, Arc::new(WsDialer))
    }

    /// A client with an injected transport dialer (tests use an in-process
    /// pair instead of a socket).
    pub fn with_dialer(options: ClientOptions, dialer: Arc<dyn Dialer>) -> Result<Self, Error> {
        options.validate()?;
        let opts = Arc::new(options);
        let handles = actor::spawn(Arc::clone(&opts), dialer);
        let connection = Connection::new(
            handles.cmd_tx,
            handles.state_rx,
            handles.info_rx,
            handles.events_tx,
            opts.request_timeout(),
        );
        Ok(Realtime { connection, opts })
    }

    /// The connection handle: state, identity, lifecycle operations.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Start connecting; resolves when `Connected` is reached.
    pub async fn connect(&self) -> Result<(), Error> {
        self.connection.connect().await
    }

    /// Close the connection; resolves when `Closed` is reached.
    pub async fn close(&self) -> Result<(), Error> {
        self.connection.close().await
    }

    /// A handle to the named channel (created server-side on first use).
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel::new(
            name.into(),
            None,
            self.connection.cmd_tx(),
            self.opts.request_timeout(),
        )
    }

    /// A handle to the named channel with explicit options (encryption,
    /// modes). Options apply when the channel is first referenced.
    pub fn channel_with_options(
        &self,
        name: impl Into<String>,
        options: ChannelOptions,
    ) -> Channel {
        Channel::new(
            name.into(),
            Some(options),
            self.connection.cmd_tx(),
            self.opts.request_timeout(),
        )
    }

    /// Release a channel: detaches it if needed and removes it from the
    /// registry once detached.
    pub async fn release_channel(&self, name: &str) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.connection
            .cmd_tx()
            .send(Command::ReleaseChannel {
                name: name.to_owned(),
                done,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        tokio::time::timeout(self.opts.request_timeout(), rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Disconnected)?
    }

    /// A stateless REST client sharing this client's options.
    pub fn rest(&self) -> Result<Rest, Error> {
        Rest::from_shared(Arc::clone(&self.opts))
    }
}
