//! Upgraded WebSocket connections.
//!
//! Application code sees a [`WebSocket`] handle inside its lifecycle callbacks.
//! Sending never blocks: frames are queued in an outbound buffer that the
//! connection task flushes between callbacks. A buffer grown past
//! `max_backpressure` reports [`SendStatus::Backpressure`] and the `drain`
//! callback fires once it has been written out.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

use super::frame::{Event, FrameParser, Message, Opcode, close_code, encode_close, encode_frame};
use super::hub::TopicHub;
use crate::BoxError;
use crate::http::Headers;
use crate::protocol::http::Conn;
use crate::router::Params;

/// How long a server-initiated close waits for the peer's close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of queueing an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// Queued, but the outbound buffer is over the backpressure limit.
    Backpressure,
    /// Not queued because the connection is closing or closed.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Open,
    Closing,
    Closed,
}

/// Per-route WebSocket settings.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Largest accepted message, after reassembly.
    pub max_payload: usize,
    /// Outbound buffer size above which sends report backpressure.
    pub max_backpressure: usize,
    /// Connection is closed after this long without inbound bytes.
    pub idle_timeout: Duration,
    /// Subprotocols this route speaks, in preference order.
    pub protocols: Vec<String>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            max_payload: 16 * 1024 * 1024,
            max_backpressure: 1024 * 1024,
            idle_timeout: Duration::from_secs(120),
            protocols: Vec::new(),
        }
    }
}

/// Result type of every WebSocket callback.
pub type WsResult = Result<(), BoxError>;

type OpenFn = Arc<dyn Fn(&mut WebSocket) -> WsResult + Send + Sync>;
type MessageFn = Arc<dyn Fn(&mut WebSocket, Message) -> WsResult + Send + Sync>;
type CloseFn = Arc<dyn Fn(&mut WebSocket, u16, &str) -> WsResult + Send + Sync>;
type ControlFn = Arc<dyn Fn(&mut WebSocket, &[u8]) -> WsResult + Send + Sync>;
type SubscriptionFn = Arc<dyn Fn(&mut WebSocket, &str, usize, usize) -> WsResult + Send + Sync>;

/// Lifecycle callbacks for one WebSocket route.
///
/// A callback that returns an error or panics is logged; outside of `close`
/// it also closes the connection with code 1011.
///
/// # Examples
///
/// ```
/// use wharf::realtime::WsHandlers;
///
/// let echo = WsHandlers::new().on_message(|ws, msg| {
///     ws.send(msg);
///     Ok(())
/// });
/// ```
#[derive(Clone, Default)]
pub struct WsHandlers {
    open: Option<OpenFn>,
    message: Option<MessageFn>,
    close: Option<CloseFn>,
    ping: Option<ControlFn>,
    pong: Option<ControlFn>,
    drain: Option<OpenFn>,
    subscription: Option<SubscriptionFn>,
    options: Option<WsOptions>,
}

impl fmt::Debug for WsHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsHandlers")
            .field("open", &self.open.is_some())
            .field("message", &self.message.is_some())
            .field("close", &self.close.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WsHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the server-wide WebSocket defaults for this route.
    pub fn with_options(mut self, options: WsOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn options(&self) -> Option<&WsOptions> {
        self.options.as_ref()
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket) -> WsResult + Send + Sync + 'static,
    {
        self.open = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket, Message) -> WsResult + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(f));
        self
    }

    /// Called once when the connection ends, with the close code and reason
    /// (1006 when the transport went away without a close frame).
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket, u16, &str) -> WsResult + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    /// Called after the automatic pong has been queued.
    pub fn on_ping<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket, &[u8]) -> WsResult + Send + Sync + 'static,
    {
        self.ping = Some(Arc::new(f));
        self
    }

    pub fn on_pong<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket, &[u8]) -> WsResult + Send + Sync + 'static,
    {
        self.pong = Some(Arc::new(f));
        self
    }

    pub fn on_drain<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket) -> WsResult + Send + Sync + 'static,
    {
        self.drain = Some(Arc::new(f));
        self
    }

    /// Called with `(topic, new_count, old_count)` whenever this connection
    /// joins or leaves a topic.
    pub fn on_subscription<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket, &str, usize, usize) -> WsResult + Send + Sync + 'static,
    {
        self.subscription = Some(Arc::new(f));
        self
    }

    fn run_open(&self, ws: &mut WebSocket) {
        if let Some(cb) = &self.open {
            guarded(ws, "open", true, |ws| cb(ws));
        }
    }

    fn run_message(&self, ws: &mut WebSocket, message: Message) {
        if let Some(cb) = &self.message {
            guarded(ws, "message", true, |ws| cb(ws, message));
        }
    }

    fn run_close(&self, ws: &mut WebSocket, code: u16, reason: &str) {
        if let Some(cb) = &self.close {
            guarded(ws, "close", false, |ws| cb(ws, code, reason));
        }
    }

    fn run_ping(&self, ws: &mut WebSocket, payload: &[u8]) {
        if let Some(cb) = &self.ping {
            guarded(ws, "ping", true, |ws| cb(ws, payload));
        }
    }

    fn run_pong(&self, ws: &mut WebSocket, payload: &[u8]) {
        if let Some(cb) = &self.pong {
            guarded(ws, "pong", true, |ws| cb(ws, payload));
        }
    }

    fn run_drain(&self, ws: &mut WebSocket) {
        if let Some(cb) = &self.drain {
            guarded(ws, "drain", true, |ws| cb(ws));
        }
    }

    fn run_subscriptions(&self, ws: &mut WebSocket) {
        let changes = std::mem::take(&mut ws.subscription_changes);
        if let Some(cb) = &self.subscription {
            for (topic, new, old) in changes {
                guarded(ws, "subscription", true, |ws| cb(ws, &topic, new, old));
            }
        }
    }
}

/// Runs a callback, logging failures and closing with 1011 when `force_close`.
fn guarded<F>(ws: &mut WebSocket, callback: &'static str, force_close: bool, f: F)
where
    F: FnOnce(&mut WebSocket) -> WsResult,
{
    let failure = match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *ws))) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(&*payload),
    };
    error!(connection = ws.id, callback, error = %failure, "websocket callback failed");
    if force_close {
        ws.close(close_code::INTERNAL_ERROR, "");
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned())
}

/// Handle to one open WebSocket connection.
pub struct WebSocket {
    id: u64,
    state: WsState,
    outbound: BytesMut,
    max_backpressure: usize,
    needs_drain: bool,
    close_deadline: Option<Instant>,
    topics: HashSet<String>,
    subscription_changes: Vec<(String, usize, usize)>,
    hub: Arc<TopicHub>,
    inbox: UnboundedSender<Bytes>,
    path: String,
    query: String,
    headers: Headers,
    params: Params,
    protocol: Option<String>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("path", &self.path)
            .field("buffered", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

/// Request details captured at upgrade time.
pub(crate) struct UpgradeInfo {
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub params: Params,
    pub protocol: Option<String>,
}

impl WebSocket {
    pub(crate) fn new(
        hub: Arc<TopicHub>,
        info: UpgradeInfo,
        max_backpressure: usize,
    ) -> (Self, UnboundedReceiver<Bytes>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let ws = Self {
            id: hub.next_connection_id(),
            state: WsState::Open,
            outbound: BytesMut::new(),
            max_backpressure,
            needs_drain: false,
            close_deadline: None,
            topics: HashSet::new(),
            subscription_changes: Vec::new(),
            hub,
            inbox,
            path: info.path,
            query: info.query,
            headers: info.headers,
            params: info.params,
            protocol: info.protocol,
        };
        (ws, rx)
    }

    /// Server-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// Path of the upgrade request.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query
    }

    /// Headers of the upgrade request.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// The negotiated subprotocol, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Bytes queued but not yet written to the transport.
    pub fn buffered_amount(&self) -> usize {
        self.outbound.len()
    }

    /// Queues `message` as a single frame.
    pub fn send(&mut self, message: impl Into<Message>) -> SendStatus {
        let message = message.into();
        self.send_frame(message.opcode(), message.as_bytes())
    }

    /// Queues a ping control frame (payload truncated to 125 bytes).
    pub fn ping(&mut self, payload: &[u8]) -> SendStatus {
        let len = payload.len().min(super::frame::MAX_CONTROL_PAYLOAD);
        self.send_frame(Opcode::Ping, &payload[..len])
    }

    fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> SendStatus {
        if self.state != WsState::Open {
            return SendStatus::Dropped;
        }
        encode_frame(opcode, payload, true, None, &mut self.outbound);
        self.backpressure_status()
    }

    fn backpressure_status(&mut self) -> SendStatus {
        if self.outbound.len() > self.max_backpressure {
            self.needs_drain = true;
            SendStatus::Backpressure
        } else {
            SendStatus::Sent
        }
    }

    /// Starts the closing handshake. The connection is dropped if the peer does
    /// not answer within [`CLOSE_TIMEOUT`].
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.state != WsState::Open {
            return;
        }
        self.outbound.extend_from_slice(&encode_close(code, reason));
        self.state = WsState::Closing;
        self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
    }

    /// Drops the connection immediately without a closing handshake.
    pub fn terminate(&mut self) {
        self.state = WsState::Closed;
    }

    /// Joins `topic`. Returns `false` if already subscribed.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        if self.state == WsState::Closed || !self.topics.insert(topic.to_owned()) {
            return false;
        }
        let (new, old) = self.hub.subscribe(topic, self.id, self.inbox.clone());
        self.subscription_changes.push((topic.to_owned(), new, old));
        true
    }

    /// Leaves `topic`. Returns `false` if not subscribed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        if !self.topics.remove(topic) {
            return false;
        }
        let (new, old) = self.hub.unsubscribe(topic, self.id);
        self.subscription_changes.push((topic.to_owned(), new, old));
        true
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// Publishes to every other subscriber of `topic`. Returns the number of
    /// connections the message was queued for.
    pub fn publish(&self, topic: &str, message: impl Into<Message>) -> usize {
        self.hub.publish(topic, &message.into(), Some(self.id))
    }

    fn unsubscribe_all(&mut self) {
        let topics: Vec<String> = self.topics.drain().collect();
        for topic in topics {
            let (new, old) = self.hub.unsubscribe(&topic, self.id);
            self.subscription_changes.push((topic, new, old));
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

/// Drives an upgraded connection until it closes.
///
/// `conn.buf` may already hold frame bytes that arrived with the upgrade
/// request; they are parsed before anything else is read.
pub(crate) async fn run(
    mut conn: Conn,
    mut ws: WebSocket,
    mut inbox: UnboundedReceiver<Bytes>,
    handlers: Arc<WsHandlers>,
    options: WsOptions,
) {
    conn.set_idle_timeout(options.idle_timeout);
    let mut parser = FrameParser::new(options.max_payload);
    let mut outcome: (u16, String) = (close_code::ABNORMAL, String::new());

    handlers.run_open(&mut ws);
    let leftover = conn.buf.split();
    if !leftover.is_empty() {
        handle_events(&mut ws, &handlers, parser.feed(&leftover), &mut outcome);
    }

    loop {
        handlers.run_subscriptions(&mut ws);
        if !ws.outbound.is_empty() {
            let pending = ws.outbound.split();
            if let Err(e) = conn.write_all(&pending).await {
                debug!(connection = ws.id, error = %e, "websocket write failed");
                ws.state = WsState::Closed;
                break;
            }
            if ws.needs_drain && ws.outbound.len() <= ws.max_backpressure {
                ws.needs_drain = false;
                handlers.run_drain(&mut ws);
            }
            continue;
        }
        if ws.state == WsState::Closed {
            break;
        }

        let deadline = ws.close_deadline;
        tokio::select! {
            read = conn.fill() => match read {
                Ok(0) => {
                    debug!(connection = ws.id, "websocket peer went away");
                    ws.state = WsState::Closed;
                }
                Ok(_) => {
                    let data = conn.buf.split();
                    handle_events(&mut ws, &handlers, parser.feed(&data), &mut outcome);
                }
                Err(e) => {
                    warn!(connection = ws.id, error = %e, "websocket read failed");
                    ws.state = WsState::Closed;
                }
            },
            Some(frame) = inbox.recv() => {
                if ws.state == WsState::Open {
                    ws.outbound.extend_from_slice(&frame);
                    ws.backpressure_status();
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(connection = ws.id, "websocket close handshake timed out");
                ws.state = WsState::Closed;
            }
        }
    }

    if let Err(e) = conn.shutdown().await {
        debug!(connection = ws.id, error = %e, "websocket shutdown failed");
    }
    ws.unsubscribe_all();
    handlers.run_subscriptions(&mut ws);
    let (code, reason) = outcome;
    debug!(connection = ws.id, code, "websocket closed");
    handlers.run_close(&mut ws, code, &reason);
}

fn handle_events(ws: &mut WebSocket, handlers: &WsHandlers, events: Vec<Event>, outcome: &mut (u16, String)) {
    for event in events {
        if ws.state == WsState::Closed {
            return;
        }
        match event {
            Event::Message(message) => {
                if ws.state == WsState::Open {
                    handlers.run_message(ws, message);
                }
            }
            Event::Ping(payload) => {
                if ws.state == WsState::Open {
                    encode_frame(Opcode::Pong, &payload, true, None, &mut ws.outbound);
                }
                handlers.run_ping(ws, &payload);
            }
            Event::Pong(payload) => handlers.run_pong(ws, &payload),
            Event::Close { code, reason } => {
                if ws.state == WsState::Open {
                    match code {
                        Some(code) if code >= 5000 => {}
                        Some(code) => ws.outbound.extend_from_slice(&encode_close(code, "")),
                        None => encode_frame(Opcode::Close, &[], true, None, &mut ws.outbound),
                    }
                }
                *outcome = (code.unwrap_or(close_code::NO_STATUS), reason);
                ws.state = WsState::Closed;
            }
            Event::Error(e) => {
                warn!(connection = ws.id, error = %e, "websocket protocol error");
                let code = e.close_code();
                if ws.state == WsState::Open {
                    ws.outbound.extend_from_slice(&encode_close(code, ""));
                }
                *outcome = (code, e.to_string());
                ws.state = WsState::Closed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;

    fn masked(opcode: Opcode, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(opcode, payload, true, Some([1, 2, 3, 4]), &mut buf);
        buf
    }

    fn info() -> UpgradeInfo {
        UpgradeInfo {
            path: "/chat".into(),
            query: String::new(),
            headers: Headers::new(),
            params: Params::new(),
            protocol: None,
        }
    }

    fn spawn(handlers: WsHandlers) -> (DuplexStream, tokio::task::JoinHandle<()>, Arc<TopicHub>) {
        let (client, server) = duplex(64 * 1024);
        let hub = Arc::new(TopicHub::new());
        let options = WsOptions::default();
        let (ws, inbox) = WebSocket::new(hub.clone(), info(), options.max_backpressure);
        let conn = Conn::from_stream(server, Duration::from_secs(5));
        let task = tokio::spawn(run(conn, ws, inbox, Arc::new(handlers), options));
        (client, task, hub)
    }

    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        let len = match head[1] & 0x7F {
            126 => client.read_u16().await.unwrap() as usize,
            127 => client.read_u64().await.unwrap() as usize,
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    #[tokio::test]
    async fn echoes_messages_and_answers_pings() {
        let (mut client, _task, _hub) = spawn(WsHandlers::new().on_message(|ws, msg| {
            ws.send(msg);
            Ok(())
        }));

        client.write_all(&masked(Opcode::Text, b"hello")).await.unwrap();
        assert_eq!(read_frame(&mut client).await, (0x81, b"hello".to_vec()));

        client.write_all(&masked(Opcode::Ping, b"x")).await.unwrap();
        assert_eq!(read_frame(&mut client).await, (0x8A, b"x".to_vec()));
    }

    #[tokio::test]
    async fn close_is_echoed_and_reported() {
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();
        let (mut client, task, _hub) = spawn(WsHandlers::new().on_close(move |_, code, reason| {
            *record.lock().unwrap() = Some((code, reason.to_owned()));
            Ok(())
        }));

        client.write_all(&encode_masked_close(1000, "bye")).await.unwrap();
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        task.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((1000, "bye".to_owned())));
    }

    #[tokio::test]
    async fn application_close_codes_are_not_echoed() {
        let (mut client, task, _hub) = spawn(WsHandlers::new());
        client.write_all(&encode_masked_close(4999 + 1, "")).await.unwrap();
        task.await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn failing_callback_closes_with_1011() {
        let (mut client, _task, _hub) = spawn(WsHandlers::new().on_message(|_, _| Err("boom".into())));
        client.write_all(&masked(Opcode::Text, b"hi")).await.unwrap();
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], &1011u16.to_be_bytes());
    }

    #[tokio::test]
    async fn panicking_callback_closes_with_1011() {
        let (mut client, _task, _hub) = spawn(WsHandlers::new().on_open(|_| panic!("open exploded")));
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], &1011u16.to_be_bytes());
    }

    #[tokio::test]
    async fn invalid_utf8_closes_with_1007() {
        let (mut client, _task, _hub) = spawn(WsHandlers::new());
        client.write_all(&masked(Opcode::Text, &[0xFF, 0xFE])).await.unwrap();
        let (_, payload) = read_frame(&mut client).await;
        assert_eq!(&payload[..2], &1007u16.to_be_bytes());
    }

    #[tokio::test]
    async fn subscribe_and_publish_through_hub() {
        let counts = Arc::new(Mutex::new(Vec::new()));
        let record = counts.clone();
        let handlers = WsHandlers::new()
            .on_open(|ws| {
                ws.subscribe("room");
                Ok(())
            })
            .on_subscription(move |_, topic, new, old| {
                record.lock().unwrap().push((topic.to_owned(), new, old));
                Ok(())
            });
        let (mut client, _task, hub) = spawn(handlers);

        // Wait until the open callback has joined the topic.
        while hub.subscriber_count("room") == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.publish("room", &Message::text("news"), None), 1);
        assert_eq!(read_frame(&mut client).await, (0x81, b"news".to_vec()));
        assert_eq!(counts.lock().unwrap()[0], ("room".to_owned(), 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_close_is_forced_after_timeout() {
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();
        let handlers = WsHandlers::new()
            .on_open(|ws| {
                ws.close(close_code::NORMAL, "");
                Ok(())
            })
            .on_close(move |_, code, _| {
                *record.lock().unwrap() = Some(code);
                Ok(())
            });
        let started = Instant::now();
        let (mut client, task, _hub) = spawn(handlers);

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], &close_code::NORMAL.to_be_bytes());

        // The peer stays connected but never answers the close.
        tokio::time::timeout(CLOSE_TIMEOUT * 2, task)
            .await
            .expect("close watchdog fired")
            .unwrap();
        assert!(started.elapsed() >= CLOSE_TIMEOUT);
        assert_eq!(*seen.lock().unwrap(), Some(close_code::ABNORMAL));
        drop(client);
    }

    #[test]
    fn backpressure_is_reported_past_the_limit() {
        let hub = Arc::new(TopicHub::new());
        let (mut ws, _rx) = WebSocket::new(hub, info(), 8);
        assert_eq!(ws.send("1234"), SendStatus::Sent);
        assert_eq!(ws.send("5678"), SendStatus::Backpressure);
        assert!(ws.buffered_amount() > 8);

        ws.close(1000, "");
        assert_eq!(ws.state(), WsState::Closing);
        assert_eq!(ws.send("late"), SendStatus::Dropped);
    }

    fn encode_masked_close(code: u16, reason: &str) -> BytesMut {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        masked(Opcode::Close, &payload)
    }
}
