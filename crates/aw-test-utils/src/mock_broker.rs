// mock_broker: an in-process broker for integration testing the client.
//
// Binds to 127.0.0.1:0 and handles each WebSocket connection in its own
// task. Behavior is deliberately small and deterministic:
//
// - on connect, sends CONNECTED with a fresh connection id and resume key
//   (or the original id when the dial presented a known `resume` key);
// - ATTACH -> ATTACHED, DETACH -> DETACHED, CLOSE -> CLOSED,
//   HEARTBEAT -> HEARTBEAT;
// - MESSAGE / PRESENCE frames are recorded, acknowledged per the configured
//   [`AckMode`], and echoed back to the publishing connection;
// - `kill_connections` drops every socket without a CLOSE handshake, for
//   reconnect and resume tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use aw_protocol::{
    Action, ConnectionDetails, ErrorInfo, ProtocolMessage, WireFormat, WireFrame,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

/// How the broker responds to publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum AckMode {
    /// Acknowledge every publish.
    Ack,
    /// Reject every publish with the given error.
    Nack(ErrorInfo),
    /// Swallow publishes without a terminal frame (for resume tests).
    Silent,
}

/// Static broker configuration; runtime switches go through [`MockBroker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Echo publishes back to the sender as MESSAGE/PRESENCE frames.
    pub echo: bool,
    pub ack_mode: AckMode,
    /// Advertised `connection_state_ttl` in ms.
    pub connection_state_ttl: i64,
    /// Advertised `max_idle_interval` in ms.
    pub max_idle_interval: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            echo: true,
            ack_mode: AckMode::Ack,
            connection_state_ttl: 120_000,
            max_idle_interval: 15_000,
        }
    }
}

struct BrokerState {
    config: BrokerConfig,
    /// resume key -> connection id handed out for it.
    resume_keys: HashMap<String, String>,
    /// Every MESSAGE / PRESENCE frame received, in arrival order.
    received: Vec<ProtocolMessage>,
    connections: usize,
    echo_counter: u64,
}

/// The mock broker. Dropping it stops the accept loop.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    kill_tx: broadcast::Sender<()>,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    /// Start on a random port.
    pub async fn start(config: BrokerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(BrokerState {
            config,
            resume_keys: HashMap::new(),
            received: Vec::new(),
            connections: 0,
            echo_counter: 0,
        }));
        let (kill_tx, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        let kill_rx = accept_kill.subscribe();
                        tokio::spawn(async move {
                            state.lock().unwrap().connections += 1;
                            let result =
                                handle_connection(stream, Arc::clone(&state), kill_rx).await;
                            state.lock().unwrap().connections -= 1;
                            if let Err(e) = result {
                                // Dropped clients are routine in tests.
                                debug!(error = %e, "mock broker connection ended");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockBroker {
            addr,
            state,
            kill_tx,
            _accept_task: accept_task,
        })
    }

    /// `ws://` URL of the broker (no query string).
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Switch how publishes are answered, effective for frames received from
    /// now on.
    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().unwrap().config.ack_mode = mode;
    }

    /// Drop every open connection without a CLOSE handshake.
    pub fn kill_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Snapshot of every MESSAGE/PRESENCE frame received so far.
    pub fn received(&self) -> Vec<ProtocolMessage> {
        self.state.lock().unwrap().received.clone()
    }

    /// MESSAGE frames received for one channel, in arrival order.
    pub fn received_on(&self, channel: &str) -> Vec<ProtocolMessage> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|f| f.channel.as_deref() == Some(channel))
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Poll until at least `count` publish frames have arrived; false on
    /// deadline.
    pub async fn wait_for_received(&self, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().unwrap().received.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Poll until the open-connection count reaches `count`; false on
    /// deadline.
    pub async fn wait_for_connections(&self, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().unwrap().connections >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<BrokerState>>,
    mut kill_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    let mut query = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().unwrap_or("").to_owned();
        Ok(resp)
    })
    .await?;
    let params = parse_query(&query);
    let format = match params.get("format").map(String::as_str) {
        Some("msgpack") => WireFormat::MsgPack,
        _ => WireFormat::Json,
    };

    // Resolve identity: a recognized resume key keeps its connection id.
    let (connection_id, connection_key, details) = {
        let mut state = state.lock().unwrap();
        let connection_id = params
            .get("resume")
            .and_then(|key| state.resume_keys.get(key).cloned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let connection_key = format!("key.{}", uuid::Uuid::new_v4());
        state
            .resume_keys
            .insert(connection_key.clone(), connection_id.clone());
        let details = ConnectionDetails {
            connection_key: Some(connection_key.clone()),
            connection_state_ttl: Some(state.config.connection_state_ttl),
            max_idle_interval: Some(state.config.max_idle_interval),
            server_id: Some("mock.001".to_owned()),
            ..ConnectionDetails::default()
        };
        (connection_id, connection_key, details)
    };

    let (mut write, mut read) = ws.split();

    let mut connected = ProtocolMessage::new(Action::Connected);
    connected.connection_id = Some(connection_id.clone());
    connected.connection_key = Some(connection_key);
    connected.connection_details = Some(details);
    send_frame(&mut write, format, &connected).await?;

    loop {
        let message = tokio::select! {
            _ = kill_rx.recv() => {
                // Simulated network drop: no CLOSE handshake.
                break;
            }
            message = read.next() => match message {
                None => break,
                Some(message) => message?,
            },
        };

        let frame = match message {
            Message::Text(text) => WireFormat::Json
                .decode(&WireFrame::Text(text.as_str().to_owned()))?,
            Message::Binary(bytes) => {
                WireFormat::MsgPack.decode(&WireFrame::Binary(bytes.to_vec()))?
            }
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };

        match frame.action {
            Action::Heartbeat => {
                send_frame(&mut write, format, &ProtocolMessage::new(Action::Heartbeat)).await?;
            }
            Action::Attach => {
                let channel = frame.channel.clone().unwrap_or_default();
                let mut attached = ProtocolMessage::with_channel(Action::Attached, channel);
                attached.channel_serial = Some("srl:0".to_owned());
                send_frame(&mut write, format, &attached).await?;
            }
            Action::Detach => {
                let channel = frame.channel.clone().unwrap_or_default();
                let detached = ProtocolMessage::with_channel(Action::Detached, channel);
                send_frame(&mut write, format, &detached).await?;
            }
            Action::Close => {
                send_frame(&mut write, format, &ProtocolMessage::new(Action::Closed)).await?;
                break;
            }
            Action::Message | Action::Presence => {
                let (ack_mode, echo, echo_id) = {
                    let mut state = state.lock().unwrap();
                    state.received.push(frame.clone());
                    state.echo_counter += 1;
                    (
                        state.config.ack_mode.clone(),
                        state.config.echo,
                        state.echo_counter,
                    )
                };

                match ack_mode {
                    AckMode::Ack => {
                        let mut ack = ProtocolMessage::new(Action::Ack);
                        ack.msg_serial = frame.msg_serial;
                        ack.count = Some(1);
                        send_frame(&mut write, format, &ack).await?;
                    }
                    AckMode::Nack(error) => {
                        let mut nack = ProtocolMessage::new(Action::Nack);
                        nack.msg_serial = frame.msg_serial;
                        nack.count = Some(1);
                        nack.error = Some(error);
                        send_frame(&mut write, format, &nack).await?;
                    }
                    AckMode::Silent => {}
                }

                if echo {
                    let mut out = ProtocolMessage::new(frame.action);
                    out.channel = frame.channel.clone();
                    out.id = Some(format!("e:{echo_id}"));
                    out.timestamp = Some(now_ms());
                    out.connection_id = Some(connection_id.clone());
                    out.messages = frame.messages.clone();
                    out.presence = frame.presence.clone();
                    send_frame(&mut write, format, &out).await?;
                }
            }
            other => debug!(action = ?other, "mock broker ignoring frame"),
        }
    }

    Ok(())
}

async fn send_frame<S>(
    write: &mut S,
    format: WireFormat,
    frame: &ProtocolMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let message = match format.encode(frame)? {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    };
    write.send(message).await?;
    Ok(())
}
