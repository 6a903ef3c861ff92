//! Session channel handle
//!
//! The channel is an opaque duplex connection: outbound media goes into a
//! bounded queue with fire-and-forget semantics, inbound [`ServerEvent`]s come
//! out of a receiver. [`ChannelOpener`] is the seam between the session and a
//! concrete transport such as Gemini Live.

use crate::config::LiveConfig;
use crate::error::ChannelOpenError;
use crate::events::{Outbound, ServerEvent};
use std::future::Future;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Why an outbound chunk did not make it into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Full,
    Closed,
}

/// Cloneable, non-blocking sender for outbound media.
#[derive(Debug, Clone)]
pub struct MediaSender {
    tx: mpsc::Sender<Outbound>,
}

impl MediaSender {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue a chunk without waiting. Real-time media favors recency, so a
    /// full queue drops the chunk.
    pub fn try_send(&self, msg: Outbound) -> Result<(), SendFailure> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }
}

/// An open session channel.
pub struct Channel {
    sender: MediaSender,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Channel {
    pub fn new(tx: mpsc::Sender<Outbound>, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            sender: MediaSender::new(tx),
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn sender(&self) -> MediaSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: Outbound) -> Result<(), SendFailure> {
        self.sender.try_send(msg)
    }

    /// Close the connection. Later calls are no-ops.
    pub fn close(&mut self) {
        if let Some(close) = self.on_close.take() {
            debug!("Closing session channel");
            close();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// An opened channel plus its inbound event stream.
pub struct OpenedChannel {
    pub channel: Channel,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Opens session channels.
pub trait ChannelOpener: Send + Sync + 'static {
    fn open(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<OpenedChannel, ChannelOpenError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_full_queue_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = Channel::new(tx, || {});
        assert_eq!(channel.send(Outbound::AudioStreamEnd), Ok(()));
        assert_eq!(channel.send(Outbound::AudioStreamEnd), Err(SendFailure::Full));
        assert_eq!(rx.try_recv().unwrap(), Outbound::AudioStreamEnd);
        drop(rx);
        assert_eq!(channel.send(Outbound::AudioStreamEnd), Err(SendFailure::Closed));
    }

    #[test]
    fn test_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let (tx, _rx) = mpsc::channel(1);
        let mut channel = Channel::new(tx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.close();
        channel.close();
        drop(channel);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
