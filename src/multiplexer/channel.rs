//! A single bidirectional byte-stream carried inside a multiplexer.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::multiplexer::message::{FlowType, MultiplexerMessage};

/// Bound on the per-channel inbound queue. Interactive traffic
/// favors low latency over throughput, so excess inbound frames are dropped
/// rather than blocking the multiplexer's read loop.
pub const INBOUND_QUEUE_SIZE: usize = 2;

/// A logical, bidirectional byte stream multiplexed over one peer
/// connection.
///
/// Dropping a `Channel` does not send `CLOSE` by itself; call
/// [`crate::multiplexer::Multiplexer::delete_channel`] with its id.
pub struct Channel {
    id: Uuid,
    outbound: mpsc::Sender<MultiplexerMessage>,
    inbound: mpsc::Receiver<MultiplexerMessage>,
}

impl Channel {
    pub(crate) fn new(
        id: Uuid,
        outbound: mpsc::Sender<MultiplexerMessage>,
    ) -> (Self, ChannelHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let channel = Channel {
            id,
            outbound,
            inbound: inbound_rx,
        };
        let handle = ChannelHandle { id, inbound_tx };
        (channel, handle)
    }

    /// The id this channel is addressed by on the wire.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send `data` to the peer. Suspends if the multiplexer's outbound queue
    /// is full (backpressure toward the remote side).
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.outbound
            .send(MultiplexerMessage::data(self.id, data))
            .await
            .map_err(|_| Error::new(ErrorKind::TransportClose))?;
        debug!(channel = %self.id, "wrote message to channel");
        Ok(())
    }

    /// Read the next inbound `DATA` payload. Resolves to
    /// [`ErrorKind::TransportClose`] once a `CLOSE` frame arrives or the
    /// multiplexer tears this channel down.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        match self.inbound.recv().await {
            Some(msg) if msg.flow_type == FlowType::Data => {
                debug!(channel = %self.id, "read message from channel");
                Ok(msg.data)
            }
            _ => {
                debug!(channel = %self.id, "read a close for channel");
                Err(Error::new(ErrorKind::TransportClose))
            }
        }
    }

    /// Split into independent halves so a caller can drive both directions
    /// of a splice concurrently. `Channel::read` takes `&mut self` and
    /// `Channel::write` takes `&self`, but both borrows would be held live
    /// at once by two concurrently polled futures, which the borrow checker
    /// rejects; the two halves instead own their own state.
    pub fn split(self) -> (ChannelReadHalf, ChannelWriteHalf) {
        let Channel {
            id,
            outbound,
            inbound,
        } = self;
        (
            ChannelReadHalf { id, inbound },
            ChannelWriteHalf { id, outbound },
        )
    }
}

/// The read half of a [`Channel`] produced by [`Channel::split`].
pub struct ChannelReadHalf {
    id: Uuid,
    inbound: mpsc::Receiver<MultiplexerMessage>,
}

impl ChannelReadHalf {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Read the next inbound `DATA` payload. Resolves to
    /// [`ErrorKind::TransportClose`] once a `CLOSE` frame arrives or the
    /// multiplexer tears this channel down.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        match self.inbound.recv().await {
            Some(msg) if msg.flow_type == FlowType::Data => {
                debug!(channel = %self.id, "read message from channel");
                Ok(msg.data)
            }
            _ => {
                debug!(channel = %self.id, "read a close for channel");
                Err(Error::new(ErrorKind::TransportClose))
            }
        }
    }
}

/// The write half of a [`Channel`] produced by [`Channel::split`].
pub struct ChannelWriteHalf {
    id: Uuid,
    outbound: mpsc::Sender<MultiplexerMessage>,
}

impl ChannelWriteHalf {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send `data` to the peer. Suspends if the multiplexer's outbound queue
    /// is full (backpressure toward the remote side).
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.outbound
            .send(MultiplexerMessage::data(self.id, data))
            .await
            .map_err(|_| Error::new(ErrorKind::TransportClose))?;
        debug!(channel = %self.id, "wrote message to channel");
        Ok(())
    }
}

/// Non-owning handle the multiplexer's channel table keeps for each live
/// channel, used solely to deliver inbound frames without blocking the
/// reader loop.
pub(crate) struct ChannelHandle {
    id: Uuid,
    inbound_tx: mpsc::Sender<MultiplexerMessage>,
}

impl ChannelHandle {
    /// Deliver an inbound frame to the channel. Only ever called from the
    /// multiplexer's reader loop. If the channel's inbound queue is full,
    /// the frame is dropped with a warning instead of blocking the caller.
    pub(crate) fn message_transport(&self, message: MultiplexerMessage) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inbound_tx.try_send(message) {
            warn!(channel = %self.id, "channel input is full, dropping frame");
        }
    }

    /// Deliver a `CLOSE` frame, ignoring backpressure: a pending `read()`
    /// must always observe the close.
    pub(crate) async fn notify_close(&self) {
        let _ = self
            .inbound_tx
            .send(MultiplexerMessage::close(self.id))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tmpsc;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (outbound_tx, mut outbound_rx) = tmpsc::channel(8);
        let id = Uuid::new_v4();
        let (mut channel, handle) = Channel::new(id, outbound_tx);

        channel.write(b"hello".to_vec()).await.unwrap();
        let sent = outbound_rx.recv().await.unwrap();
        assert_eq!(sent.flow_type, FlowType::Data);
        assert_eq!(sent.data, b"hello");

        handle.message_transport(MultiplexerMessage::data(id, b"world".to_vec()));
        let received = channel.read().await.unwrap();
        assert_eq!(received, b"world");
    }

    #[tokio::test]
    async fn close_surfaces_as_transport_close() {
        let (outbound_tx, _outbound_rx) = tmpsc::channel(8);
        let id = Uuid::new_v4();
        let (mut channel, handle) = Channel::new(id, outbound_tx);

        handle.notify_close().await;
        let err = channel.read().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportClose);
    }

    #[tokio::test]
    async fn full_inbound_queue_drops_instead_of_blocking() {
        let (outbound_tx, _outbound_rx) = tmpsc::channel(8);
        let id = Uuid::new_v4();
        let (mut channel, handle) = Channel::new(id, outbound_tx);

        for i in 0..(INBOUND_QUEUE_SIZE + 1) {
            handle.message_transport(MultiplexerMessage::data(id, vec![i as u8]));
        }

        // only the first INBOUND_QUEUE_SIZE frames survive
        for i in 0..INBOUND_QUEUE_SIZE {
            let msg = channel.read().await.unwrap();
            assert_eq!(msg, vec![i as u8]);
        }
    }

    #[tokio::test]
    async fn split_halves_read_and_write_concurrently() {
        let (outbound_tx, mut outbound_rx) = tmpsc::channel(8);
        let id = Uuid::new_v4();
        let (channel, handle) = Channel::new(id, outbound_tx);
        let (mut read_half, write_half) = channel.split();

        handle.message_transport(MultiplexerMessage::data(id, b"world".to_vec()));

        let (write_result, received) =
            tokio::join!(write_half.write(b"hello".to_vec()), read_half.read());

        write_result.unwrap();
        assert_eq!(received.unwrap(), b"world");
        let sent = outbound_rx.recv().await.unwrap();
        assert_eq!(sent.data, b"hello");
    }
}
