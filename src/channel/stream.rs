//! Duplex async view over a [`Channel`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::channel::entry::{Channel, ChannelEvent};
use crate::channel::ChannelError;

/// Inbound events as a [`Stream`], plus awaited sends.
///
/// The stream yields every event in arrival order and ends after
/// [`ChannelEvent::Close`].
#[derive(Debug)]
pub struct ChannelStream {
    channel: Channel,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    closed: bool,
}

impl ChannelStream {
    pub(crate) fn new(channel: Channel, rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            channel,
            rx,
            closed: false,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Send a message.
    ///
    /// Resolves immediately when fully sent; when queued it resolves on the
    /// next drain, or fails if the channel closes first.
    pub async fn send(&self, data: impl AsRef<[u8]>, binary: bool) -> Result<(), ChannelError> {
        self.channel.send_and_wait(data.as_ref(), binary).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send(text, false).await
    }
}

impl Stream for ChannelStream {
    type Item = ChannelEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, ChannelEvent::Close { .. }) {
                    this.closed = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.closed = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use crate::transport::SendStatus;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn channel() -> (Channel, crate::transport::memory::MemoryChannelPeer) {
        let hub = MemoryHub::new();
        let (transport, peer) = hub.channel();
        (Channel::new(Box::new(transport), "/t"), peer)
    }

    #[tokio::test]
    async fn send_outcomes_map_to_errors() {
        let (channel, peer) = channel();
        let stream = channel.stream().unwrap();
        stream.send("hi", false).await.unwrap();

        peer.set_send_status(SendStatus::Dropped);
        assert!(matches!(stream.send("x", false).await, Err(ChannelError::Dropped)));

        channel.close();
        assert!(matches!(stream.send("x", false).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn backpressured_send_waits_for_drain() {
        let (channel, peer) = channel();
        peer.set_send_status(SendStatus::Backpressure);
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_and_wait(b"queued", true).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        peer.flush();
        channel.on_drain();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backpressured_send_fails_when_closed_first() {
        let (channel, peer) = channel();
        peer.set_send_status(SendStatus::Backpressure);
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_and_wait(b"queued", false).await })
        };
        tokio::task::yield_now().await;
        channel.on_close(1001, b"going away");
        assert!(matches!(pending.await.unwrap(), Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn stream_yields_owned_events_and_ends_on_close() {
        let (channel, _peer) = channel();
        let mut stream = channel.stream().unwrap();
        assert!(matches!(channel.stream(), Err(ChannelError::StreamTaken)));

        let mut scratch = b"hello".to_vec();
        channel.on_message(&scratch, false);
        scratch.fill(0);
        channel.on_ping(b"p");
        channel.on_close(1000, b"done");
        channel.on_message(b"late", false);

        assert_eq!(
            stream.next().await,
            Some(ChannelEvent::Message {
                data: Bytes::from_static(b"hello"),
                binary: false
            })
        );
        assert_eq!(stream.next().await, Some(ChannelEvent::Ping(Bytes::from_static(b"p"))));
        assert_eq!(
            stream.next().await,
            Some(ChannelEvent::Close {
                code: 1000,
                reason: Bytes::from_static(b"done")
            })
        );
        assert_eq!(stream.next().await, None);
    }
}
