// Identity-scoped WebSocket client to one upstream chat server.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use md5::{Digest, Md5};
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
    time::Instant,
};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::broker::Broker;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type UpstreamSink = SplitSink<UpstreamStream, Message>;

#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimings {
    pub dial_timeout: Duration,
    pub write_deadline: Duration,
    /// Read deadline, refreshed by every pong.
    pub read_idle: Duration,
    pub heartbeat_interval: Duration,
    pub close_wait: Duration,
}

impl Default for UpstreamTimings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            write_deadline: Duration::from_secs(10),
            read_idle: Duration::from_secs(700),
            heartbeat_interval: Duration::from_secs(600),
            close_wait: Duration::from_secs(5),
        }
    }
}

impl UpstreamTimings {
    /// Zero fields take their default.
    pub fn or_defaults(self) -> Self {
        let defaults = Self::default();
        let pick = |value: Duration, default: Duration| if value.is_zero() { default } else { value };
        Self {
            dial_timeout: pick(self.dial_timeout, defaults.dial_timeout),
            write_deadline: pick(self.write_deadline, defaults.write_deadline),
            read_idle: pick(self.read_idle, defaults.read_idle),
            heartbeat_interval: pick(self.heartbeat_interval, defaults.heartbeat_interval),
            close_wait: pick(self.close_wait, defaults.close_wait),
        }
    }
}

/// The identity a client speaks for, with its md5 computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    /// Lowercase hex; empty for a blank id.
    pub md5: String,
}

impl LocalIdentity {
    pub fn new(id: &str) -> Self {
        let id = id.trim();
        let md5 = if id.is_empty() {
            String::new()
        } else {
            format!("{:x}", Md5::digest(id.as_bytes()))
        };
        Self { id: id.to_owned(), md5 }
    }
}

#[derive(Default)]
struct WriteState {
    sink: Option<UpstreamSink>,
    connected: bool,
    pending: VecDeque<String>,
}

pub struct UpstreamClient {
    identity: LocalIdentity,
    url: String,
    timings: UpstreamTimings,
    broker: Weak<Broker>,
    state: Mutex<WriteState>,
    closed: AtomicBool,
    expected_close: AtomicBool,
    done: watch::Sender<bool>,
}

impl UpstreamClient {
    pub fn new(
        identity: &str,
        url: impl Into<String>,
        timings: UpstreamTimings,
        broker: Weak<Broker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: LocalIdentity::new(identity),
            url: url.into(),
            timings: timings.or_defaults(),
            broker,
            state: Mutex::new(WriteState::default()),
            closed: AtomicBool::new(false),
            expected_close: AtomicBool::new(false),
            done: watch::channel(false).0,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Write `message` now, or queue it until the dial completes.
    ///
    /// Blank messages are dropped. A failed write closes the client as
    /// unexpected.
    pub async fn send_message(&self, message: &str) {
        if message.trim().is_empty() || self.is_closed() {
            return;
        }

        let written = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match (state.connected, state.sink.as_mut()) {
                (true, Some(sink)) => {
                    let frame = Message::text(message.to_owned());
                    write_frame(sink, frame, self.timings.write_deadline).await
                }
                _ => {
                    state.pending.push_back(message.to_owned());
                    return;
                }
            }
        };

        if let Err(error) = written {
            warn!(identity = %self.identity.id, %error, "upstream write failed");
            self.close_unexpected().await;
        }
    }

    /// Dial and serve the connection on a background task.
    pub fn connect_async(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await });
    }

    /// Operator-initiated close; the broker is not notified.
    pub async fn close_expected(&self) {
        self.close(true).await;
    }

    /// Transport-level close; the read loop reports the loss to the broker.
    pub async fn close_unexpected(&self) {
        self.close(false).await;
    }

    async fn close(&self, expected: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.expected_close.store(expected, Ordering::SeqCst);
        self.done.send_replace(true);

        let sink = {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.sink.take()
        };
        let Some(mut sink) = sink else {
            return;
        };

        let close_frame =
            Message::Close(Some(CloseFrame { code: CloseCode::Normal, reason: String::new().into() }));
        let _ = tokio::time::timeout(self.timings.close_wait, async {
            let _ = sink.send(close_frame).await;
            let _ = sink.close().await;
        })
        .await;
        debug!(identity = %self.identity.id, expected, "upstream connection closed");
    }

    async fn run(self: Arc<Self>) {
        let dial = tokio_tungstenite::connect_async(self.url.as_str());
        let dialled = tokio::time::timeout(self.timings.dial_timeout, dial).await;
        let stream = match dialled {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(error)) => {
                warn!(identity = %self.identity.id, url = %self.url, %error, "upstream dial failed");
                self.finish().await;
                return;
            }
            Err(_) => {
                warn!(identity = %self.identity.id, url = %self.url, "upstream dial timed out");
                self.finish().await;
                return;
            }
        };

        let (sink, stream) = stream.split();
        if !self.install(sink).await {
            self.finish().await;
            return;
        }
        info!(identity = %self.identity.id, url = %self.url, "upstream connected");

        self.spawn_heartbeat();
        self.read_loop(stream).await;
        self.finish().await;
    }

    /// Drain queued messages in order, then mark the client connected.
    async fn install(&self, mut sink: UpstreamSink) -> bool {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            let _ = tokio::time::timeout(self.timings.close_wait, sink.close()).await;
            return false;
        }

        while let Some(message) = state.pending.pop_front() {
            if let Err(error) =
                write_frame(&mut sink, Message::text(message), self.timings.write_deadline).await
            {
                warn!(identity = %self.identity.id, %error, "upstream flush of queued messages failed");
                drop(state);
                self.close_unexpected().await;
                return false;
            }
        }

        state.sink = Some(sink);
        state.connected = true;
        true
    }

    async fn read_loop(&self, mut stream: SplitStream<UpstreamStream>) {
        let mut done = self.done.subscribe();
        let mut deadline = Instant::now() + self.timings.read_idle;

        loop {
            tokio::select! {
                _ = done_signalled(&mut done) => break,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(identity = %self.identity.id, "upstream read deadline exceeded");
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = std::str::from_utf8(&bytes) {
                            self.dispatch(text).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + self.timings.read_idle;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(identity = %self.identity.id, %error, "upstream read failed");
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, raw: &str) {
        if let Some(broker) = self.broker.upgrade() {
            broker.handle_upstream_frame(&self.identity, raw).await;
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let interval = self.timings.heartbeat_interval;
        let mut done = self.done.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = done_signalled(&mut done) => return,
                    _ = ticker.tick() => {
                        let Some(client) = client.upgrade() else {
                            return;
                        };
                        client.ping().await;
                    }
                }
            }
        });
    }

    async fn ping(&self) {
        let mut state = self.state.lock().await;
        if !state.connected {
            return;
        }
        if let Some(sink) = state.sink.as_mut() {
            if let Err(error) =
                write_frame(sink, Message::Ping(Default::default()), self.timings.write_deadline)
                    .await
            {
                debug!(identity = %self.identity.id, %error, "upstream ping failed");
            }
        }
    }

    /// Read side is over: release the socket and report unexpected loss.
    async fn finish(self: &Arc<Self>) {
        self.close(false).await;
        if self.expected_close.load(Ordering::SeqCst) {
            return;
        }
        info!(identity = %self.identity.id, "upstream connection lost");
        if let Some(broker) = self.broker.upgrade() {
            broker.upstream_lost(self).await;
        }
    }
}

// Resolves once the client is closed. The borrowed value is released here so
// the select! output stays Send.
async fn done_signalled(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|done| *done).await;
}

async fn write_frame(
    sink: &mut UpstreamSink,
    frame: Message,
    deadline: Duration,
) -> Result<(), anyhow::Error> {
    tokio::time::timeout(deadline, sink.send(frame))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out after {deadline:?}"))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{LocalIdentity, UpstreamClient, UpstreamTimings};
    use std::{sync::Weak, time::Duration};

    #[test]
    fn local_identity_md5_is_lowercase_hex() {
        let identity = LocalIdentity::new(" u1 ");
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.md5, "e4774cdda0793f86414e8b9140bb6db4");
        assert_eq!(LocalIdentity::new("  ").md5, "");
    }

    #[tokio::test]
    async fn messages_queue_until_connected_and_blank_is_dropped() {
        let client =
            UpstreamClient::new("u1", "ws://127.0.0.1:1", UpstreamTimings::default(), Weak::new());
        client.send_message("{\"act\":\"sign\"}").await;
        client.send_message("   ").await;
        client.send_message("{\"act\":\"say\"}").await;

        assert!(!client.is_connected().await);
        assert_eq!(client.pending_len().await, 2);
    }

    #[tokio::test]
    async fn close_is_once_and_stops_queueing() {
        let client =
            UpstreamClient::new("u1", "ws://127.0.0.1:1", UpstreamTimings::default(), Weak::new());
        client.close_expected().await;
        client.close_unexpected().await;

        assert!(client.is_closed());
        client.send_message("late").await;
        assert_eq!(client.pending_len().await, 0);
    }

    #[test]
    fn zero_timings_fall_back_to_defaults() {
        let timings = UpstreamTimings {
            heartbeat_interval: Duration::ZERO,
            read_idle: Duration::ZERO,
            dial_timeout: Duration::from_secs(3),
            ..UpstreamTimings::default()
        }
        .or_defaults();

        assert_eq!(timings.heartbeat_interval, UpstreamTimings::default().heartbeat_interval);
        assert_eq!(timings.read_idle, UpstreamTimings::default().read_idle);
        assert_eq!(timings.dial_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_dial_closes_the_client() {
        let timings =
            UpstreamTimings { dial_timeout: Duration::from_secs(2), ..UpstreamTimings::default() };
        let client = UpstreamClient::new("u1", "ws://127.0.0.1:1", timings, Weak::new());
        client.connect_async();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("client should close after a failed dial");
    }
}
