//! Persistent market-data socket client.
//!
//! A single background task owns the connection and hands decoded frames to
//! two bounded channels (ticks, order updates). The task reconnects on read
//! errors and on ping starvation, replaying the subscription set and any
//! queued emits after every successful dial.

use crate::socket::codec::{
    decode_order_update, decode_tick, is_order_update, OrderUpdate, SocketMessage, Tick,
    FULL_TICK_LENGTH,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const SOCKET_URL: &str = "wss://wss.tiqs.trading";

/// Tick and order channels are buffered this deep; a stalled consumer blocks
/// the read loop rather than dropping data.
pub const CHANNEL_CAPACITY: usize = 100_000;

const MAX_DIAL_ATTEMPTS: u32 = 20;
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(3);
const PING_TIMEOUT: Duration = Duration::from_secs(35);
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for the market-data socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub app_id: String,
    pub access_token: String,
    /// Base socket URL; credentials are appended as query parameters.
    pub url: String,
}

impl SocketConfig {
    pub fn new(app_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            access_token: access_token.into(),
            url: SOCKET_URL.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe(i32),
    Unsubscribe(i32),
    Close,
}

/// Handle to the socket task. Cheap to clone; subscription calls never block.
#[derive(Clone)]
pub struct SocketClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    subscriptions: Arc<Mutex<BTreeSet<i32>>>,
}

impl SocketClient {
    /// Spawn the socket task and return the handle plus both delivery
    /// channels. Dialing happens in the background; frames start flowing as
    /// soon as the first connect succeeds.
    pub fn connect(config: SocketConfig) -> (Self, mpsc::Receiver<Tick>, mpsc::Receiver<OrderUpdate>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (order_tx, order_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(BTreeSet::new()));

        let task = SocketTask {
            url: format!(
                "{}?appId={}&token={}",
                config.url, config.app_id, config.access_token
            ),
            cmd_rx,
            tick_tx,
            order_tx,
            subscriptions: Arc::clone(&subscriptions),
            pending: VecDeque::new(),
            last_ping: Instant::now(),
        };
        tokio::spawn(task.run());

        (
            Self {
                cmd_tx,
                subscriptions,
            },
            tick_rx,
            order_rx,
        )
    }

    /// Handle wired to nothing, for exercising the dispatcher without a
    /// live socket. The returned receiver observes every command.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                cmd_tx,
                subscriptions: Arc::new(Mutex::new(BTreeSet::new())),
            },
            cmd_rx,
        )
    }

    /// Add `token` to the subscription set and emit a `sub` frame. While
    /// disconnected the frame is queued and replayed after reconnect.
    pub fn add_subscription(&self, token: i32) {
        self.subscriptions.lock().insert(token);
        let _ = self.cmd_tx.send(Command::Subscribe(token));
    }

    /// Remove `token` from the subscription set and emit an `unsub` frame.
    pub fn remove_subscription(&self, token: i32) {
        self.subscriptions.lock().remove(&token);
        let _ = self.cmd_tx.send(Command::Unsubscribe(token));
    }

    /// Current subscription set.
    pub fn subscriptions(&self) -> BTreeSet<i32> {
        self.subscriptions.lock().clone()
    }

    /// Ask the task to close the connection and stop.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

enum LoopExit {
    Reconnect,
    Shutdown,
}

struct SocketTask {
    url: String,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    tick_tx: mpsc::Sender<Tick>,
    order_tx: mpsc::Sender<OrderUpdate>,
    subscriptions: Arc<Mutex<BTreeSet<i32>>>,
    /// Frames that could not be sent while disconnected, replayed after the
    /// resubscription pass.
    pending: VecDeque<String>,
    last_ping: Instant,
}

/// Frames to emit immediately after a successful dial: the full
/// resubscription first, then any queued emits.
fn reconnect_frames(subscriptions: &BTreeSet<i32>, pending: &mut VecDeque<String>) -> Vec<String> {
    let mut frames: Vec<String> = subscriptions
        .iter()
        .map(|&token| frame_json(&SocketMessage::subscribe(token)))
        .collect();
    frames.extend(pending.drain(..));
    frames
}

fn frame_json(message: &SocketMessage) -> String {
    serde_json::to_string(message).expect("subscription frame serializes")
}

impl SocketTask {
    async fn run(mut self) {
        loop {
            let ws = match self.dial().await {
                Some(ws) => ws,
                // Retries exhausted: dropping the senders closes both
                // channels, which is the terminal signal to consumers.
                None => return,
            };

            match self.run_connected(ws).await {
                LoopExit::Reconnect => {
                    info!("socket connection closed");
                    continue;
                }
                LoopExit::Shutdown => return,
            }
        }
    }

    async fn dial(&mut self) -> Option<WsStream> {
        for attempt in 1..=MAX_DIAL_ATTEMPTS {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);

            debug!(attempt, "connecting to socket");
            match connect_async_with_config(self.url.as_str(), Some(ws_config), false).await {
                Ok((ws, _)) => {
                    info!("connected to socket");
                    return Some(ws);
                }
                Err(err) => {
                    warn!(error = %err, attempt, "socket dial failed");
                    if attempt == MAX_DIAL_ATTEMPTS {
                        warn!("socket reconnection limit reached");
                        return None;
                    }
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
        None
    }

    async fn run_connected(&mut self, mut ws: WsStream) -> LoopExit {
        self.last_ping = Instant::now();

        let preamble = {
            let subs = self.subscriptions.lock();
            reconnect_frames(&subs, &mut self.pending)
        };
        for (index, frame) in preamble.iter().enumerate() {
            if let Err(err) = ws.send(Message::Text(frame.clone().into())).await {
                warn!(error = %err, "failed to replay subscription");
                // Keep the unsent tail for the next reconnect.
                for unsent in &preamble[index..] {
                    self.pending.push_back(unsent.clone());
                }
                return LoopExit::Reconnect;
            }
        }

        let mut watchdog = tokio::time::interval(PING_TIMEOUT);

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(msg)) => {
                        if let Some(exit) = self.handle_frame(&mut ws, msg).await {
                            return exit;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "socket read failed");
                        return LoopExit::Reconnect;
                    }
                    None => return LoopExit::Reconnect,
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe(token)) => {
                        if let Some(exit) = self
                            .emit(&mut ws, frame_json(&SocketMessage::subscribe(token)))
                            .await
                        {
                            return exit;
                        }
                    }
                    Some(Command::Unsubscribe(token)) => {
                        if let Some(exit) = self
                            .emit(&mut ws, frame_json(&SocketMessage::unsubscribe(token)))
                            .await
                        {
                            return exit;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = ws.close(None).await;
                        return LoopExit::Shutdown;
                    }
                },
                _ = watchdog.tick() => {
                    if self.last_ping.elapsed() > PING_TIMEOUT {
                        warn!("ping gap exceeded; reconnecting");
                        return LoopExit::Reconnect;
                    }
                }
            }
        }
    }

    /// Send a frame, queueing it for replay when the connection is down.
    async fn emit(&mut self, ws: &mut WsStream, frame: String) -> Option<LoopExit> {
        if let Err(err) = ws.send(Message::Text(frame.clone().into())).await {
            warn!(error = %err, "socket emit failed");
            self.pending.push_back(frame);
            return Some(LoopExit::Reconnect);
        }
        None
    }

    async fn handle_frame(&mut self, ws: &mut WsStream, msg: Message) -> Option<LoopExit> {
        let data: Vec<u8> = match msg {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(_) => return Some(LoopExit::Reconnect),
            // Protocol-level ping/pong is handled by tungstenite.
            _ => return None,
        };

        if data == b"PING" {
            self.last_ping = Instant::now();
            // Volatile: a failed PONG is never queued.
            let _ = ws.send(Message::Text("PONG".into())).await;
            return None;
        }

        if let Ok(text) = std::str::from_utf8(&data) {
            if is_order_update(text) {
                match decode_order_update(&data) {
                    Ok(update) => {
                        if self.order_tx.send(update).await.is_err() {
                            return Some(LoopExit::Shutdown);
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to decode order update"),
                }
                return None;
            }
        }

        if data.len() == FULL_TICK_LENGTH {
            let tick = decode_tick(&data);
            if self.tick_tx.send(tick).await.is_err() {
                return Some(LoopExit::Shutdown);
            }
            return None;
        }

        debug!(len = data.len(), "discarding frame with unexpected length");
        None
    }
}
