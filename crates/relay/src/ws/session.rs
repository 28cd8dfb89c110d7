// One authenticated downstream WebSocket: serialized writes, close-once.

use std::{pin::Pin, sync::atomic::AtomicBool, sync::atomic::Ordering, time::Duration};

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

pub const DEFAULT_DOWNSTREAM_WRITE_DEADLINE: Duration = Duration::from_secs(5);

pub type DownstreamSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("downstream write timed out after {0:?}")]
    Timeout(Duration),
    #[error("downstream write failed: {0}")]
    Transport(#[from] axum::Error),
}

pub struct DownstreamSession {
    id: Uuid,
    write_deadline: Duration,
    sink: Mutex<Option<DownstreamSink>>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
}

impl DownstreamSession {
    pub fn new(sink: DownstreamSink, write_deadline: Duration) -> Self {
        let write_deadline = if write_deadline.is_zero() {
            DEFAULT_DOWNSTREAM_WRITE_DEADLINE
        } else {
            write_deadline
        };
        Self {
            id: Uuid::new_v4(),
            write_deadline,
            sink: Mutex::new(Some(sink)),
            closed: AtomicBool::new(false),
            closed_signal: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write one text frame under the write deadline.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let mut slot = self.sink.lock().await;
        let sink = slot.as_mut().ok_or(SessionError::Closed)?;
        tokio::time::timeout(self.write_deadline, sink.send(Message::Text(text.to_owned().into())))
            .await
            .map_err(|_| SessionError::Timeout(self.write_deadline))??;
        Ok(())
    }

    /// Close the socket. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_signal.send_replace(true);

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(self.write_deadline, sink.close()).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::close`] has been called.
    pub async fn closed(&self) {
        let mut signal = self.closed_signal.subscribe();
        let _ = signal.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{DownstreamSession, DownstreamSink};
    use axum::extract::ws::Message;
    use futures_util::sink;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    /// A session whose frames land on the returned receiver.
    pub(crate) fn channel_session() -> (Arc<DownstreamSession>, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink: DownstreamSink = Box::pin(sink::unfold(sender, |sender, message: Message| async move {
            sender.send(message).map_err(axum::Error::new)?;
            Ok::<_, axum::Error>(sender)
        }));
        (Arc::new(DownstreamSession::new(sink, Duration::from_secs(1))), receiver)
    }

    /// Texts received so far, without waiting.
    pub(crate) fn drain_texts(receiver: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            if let Message::Text(text) = message {
                texts.push(text.as_str().to_owned());
            }
        }
        texts
    }
}
