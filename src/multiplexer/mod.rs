//! Per-peer framing loop: channel table, open/close protocol, PING, and the
//! optional byte-rate throttle.

pub mod channel;
pub mod crypto;
pub mod message;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use channel::{Channel, ChannelReadHalf, ChannelWriteHalf};
use channel::ChannelHandle;
use crypto::CryptoTransport;
use message::{FlowType, MultiplexerMessage, HEADER_LENGTH};

use crate::error::{Error, ErrorKind, Result};

/// Bound on the outbound frame queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 8;

/// Invoked by the reader loop whenever the peer opens a new channel.
/// Runs on a detached task so the reader loop never blocks on user code.
pub type NewChannelCallback =
    Arc<dyn Fn(Channel) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Shared {
    channels: Mutex<HashMap<Uuid, ChannelHandle>>,
    outbound_tx: mpsc::Sender<MultiplexerMessage>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    #[allow(dead_code)]
    protocol_version: u8,
}

impl Shared {
    /// Idempotent: tears the multiplexer down exactly once, notifying every
    /// live channel of the close and signalling `wait()`/`is_connected()`.
    fn trigger_shutdown(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let _ = self.connected_tx.send(false);

        let shared = self.clone();
        tokio::spawn(async move {
            let handles: Vec<_> = std::mem::take(&mut *shared.channels.lock())
                .into_values()
                .collect();
            for handle in handles {
                handle.notify_close().await;
            }
        });
    }
}

/// The multiplexer for one authenticated peer connection: frames, encrypts
/// and dispatches channel traffic over a single TCP socket.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    #[allow(dead_code)]
    reader_handle: Arc<JoinHandle<()>>,
    #[allow(dead_code)]
    writer_handle: Arc<JoinHandle<()>>,
}

impl Multiplexer {
    /// Construct a multiplexer over an already-split socket and start its
    /// reader/writer tasks. `throttling` is a post-write sleep rate in
    /// bytes/sec.
    pub fn new<R, W>(
        crypto: CryptoTransport,
        reader: R,
        writer: W,
        protocol_version: u8,
        new_channel: NewChannelCallback,
        throttling: Option<u32>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let crypto = Arc::new(crypto);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (connected_tx, _) = watch::channel(true);

        let shared = Arc::new(Shared {
            channels: Mutex::new(HashMap::new()),
            outbound_tx,
            connected_tx,
            cancel: CancellationToken::new(),
            protocol_version,
        });

        let seconds_per_byte = throttling.map(|bps| 1.0 / f64::from(bps));

        let writer_handle = tokio::spawn(Self::writer_loop(
            shared.clone(),
            outbound_rx,
            crypto.clone(),
            writer,
            seconds_per_byte,
        ));
        let reader_handle = tokio::spawn(Self::reader_loop(
            shared.clone(),
            reader,
            crypto,
            new_channel,
        ));

        Multiplexer {
            shared,
            reader_handle: Arc::new(reader_handle),
            writer_handle: Arc::new(writer_handle),
        }
    }

    async fn writer_loop<W>(
        shared: Arc<Shared>,
        mut outbound_rx: mpsc::Receiver<MultiplexerMessage>,
        crypto: Arc<CryptoTransport>,
        mut writer: W,
        seconds_per_byte: Option<f64>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                message = outbound_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let plaintext = message.encode();
            let len = plaintext.len();
            let ciphertext = crypto.encrypt(plaintext);

            if let Err(err) = writer.write_all(&ciphertext).await {
                error!(%err, "multiplexer write failed");
                break;
            }
            if let Err(err) = writer.flush().await {
                error!(%err, "multiplexer flush failed");
                break;
            }

            if let Some(secs_per_byte) = seconds_per_byte {
                let delay = Duration::from_secs_f64(secs_per_byte * len as f64);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        shared.trigger_shutdown();
    }

    async fn reader_loop<R>(
        shared: Arc<Shared>,
        mut reader: R,
        crypto: Arc<CryptoTransport>,
        new_channel: NewChannelCallback,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut header_buf = vec![0u8; HEADER_LENGTH];
            let read_header = async {
                reader.read_exact(&mut header_buf).await?;
                Ok::<_, std::io::Error>(())
            };

            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                result = read_header => {
                    if result.is_err() {
                        break;
                    }
                }
            }

            let header_plain = crypto.decrypt(header_buf);
            let (id, flow_type, data_length) = match MultiplexerMessage::decode_header(&header_plain) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(%err, "malformed frame header, disconnecting");
                    break;
                }
            };

            let data = if data_length > 0 {
                let mut data_buf = vec![0u8; data_length as usize];
                if reader.read_exact(&mut data_buf).await.is_err() {
                    break;
                }
                crypto.decrypt(data_buf)
            } else {
                Vec::new()
            };

            match flow_type {
                FlowType::New => {
                    let mut table = shared.channels.lock();
                    if table.contains_key(&id) {
                        drop(table);
                        warn!(channel = %id, "duplicate NEW, disconnecting");
                        break;
                    }
                    let (channel, handle) = Channel::new(id, shared.outbound_tx.clone());
                    table.insert(id, handle);
                    drop(table);

                    debug!(channel = %id, "new channel from peer");
                    let callback = new_channel.clone();
                    tokio::spawn(async move { callback(channel).await });
                }
                FlowType::Data => {
                    let table = shared.channels.lock();
                    if let Some(handle) = table.get(&id) {
                        handle.message_transport(MultiplexerMessage::from_parts(id, flow_type, data));
                    }
                    // else: raced with a local delete_channel; drop silently
                }
                FlowType::Close => {
                    let handle = shared.channels.lock().remove(&id);
                    if let Some(handle) = handle {
                        handle.notify_close().await;
                    }
                }
                FlowType::Ping => {
                    debug!("ping received");
                }
            }
        }

        shared.trigger_shutdown();
    }

    /// Allocate a fresh channel, register it, and send its `NEW` frame.
    pub async fn create_channel(&self) -> Result<Channel> {
        let id = Uuid::new_v4();
        let (channel, handle) = Channel::new(id, self.shared.outbound_tx.clone());
        self.shared.channels.lock().insert(id, handle);

        self.shared
            .outbound_tx
            .send(MultiplexerMessage::new(id))
            .await
            .map_err(|_| Error::new(ErrorKind::NotConnected))?;

        Ok(channel)
    }

    /// Remove a channel from the table and send its `CLOSE` frame. Takes
    /// the channel id rather than an owned `Channel` so a channel already
    /// split into halves (see [`Channel::split`]) can still be torn down.
    pub async fn delete_channel(&self, id: Uuid) -> Result<()> {
        self.shared.channels.lock().remove(&id);
        self.shared
            .outbound_tx
            .send(MultiplexerMessage::close(id))
            .await
            .map_err(|_| Error::new(ErrorKind::NotConnected))?;
        Ok(())
    }

    /// Enqueue a `PING` frame; resolves once it has been handed to the
    /// writer's queue.
    pub async fn ping(&self) -> Result<()> {
        self.shared
            .outbound_tx
            .send(MultiplexerMessage::ping())
            .await
            .map_err(|_| Error::new(ErrorKind::NotConnected))?;
        Ok(())
    }

    /// Resolves once this multiplexer has disconnected.
    pub async fn wait(&self) {
        let mut rx = self.shared.connected_tx.subscribe();
        if !*rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if !*rx.borrow() {
                return;
            }
        }
    }

    /// Idempotent teardown: cancels the reader/writer loops, CLOSE-notifies
    /// every live channel, and closes the socket.
    pub fn shutdown(&self) {
        self.shared.trigger_shutdown();
    }

    /// Whether the reader/writer loops are still running.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{IV_LENGTH, KEY_LENGTH};

    fn noop_callback() -> NewChannelCallback {
        Arc::new(|_channel: Channel| Box::pin(async {}))
    }

    async fn connected_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn channel_lifecycle_round_trips_data_and_close() {
        let (a_sock, b_sock) = connected_pair().await;
        let key = [1u8; KEY_LENGTH];
        let iv = [2u8; IV_LENGTH];

        let (a_read, a_write) = a_sock.into_split();
        let (b_read, b_write) = b_sock.into_split();

        let received = Arc::new(tokio::sync::Mutex::new(None));
        let received_clone = received.clone();
        let b_callback: NewChannelCallback = Arc::new(move |mut channel: Channel| {
            let received = received_clone.clone();
            Box::pin(async move {
                let data = channel.read().await.unwrap();
                *received.lock().await = Some(data);
            })
        });

        let a = Multiplexer::new(
            CryptoTransport::new(&key, &iv),
            a_read,
            a_write,
            1,
            noop_callback(),
            None,
        );
        let b = Multiplexer::new(
            CryptoTransport::new(&key, &iv),
            b_read,
            b_write,
            1,
            b_callback,
            None,
        );

        let channel = a.create_channel().await.unwrap();
        channel.write(b"hello".to_vec()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*received.lock().await, Some(b"hello".to_vec()));

        a.delete_channel(channel.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn ping_produces_expected_wire_bytes() {
        let (a_sock, b_sock) = connected_pair().await;
        let key = [3u8; KEY_LENGTH];
        let iv = [4u8; IV_LENGTH];

        let (a_read, a_write) = a_sock.into_split();
        let (mut b_read, _b_write) = b_sock.into_split();

        let a = Multiplexer::new(
            CryptoTransport::new(&key, &iv),
            a_read,
            a_write,
            1,
            noop_callback(),
            None,
        );

        a.ping().await.unwrap();

        let mut buf = vec![0u8; HEADER_LENGTH];
        b_read.read_exact(&mut buf).await.unwrap();
        let crypto = CryptoTransport::new(&key, &iv);
        let plain = crypto.decrypt(buf);

        assert_eq!(plain[16], 0x08);
        assert_eq!(&plain[17..21], &[0, 0, 0, 0]);
        assert_eq!(&plain[21..25], b"ping");

        a.shutdown();
    }
}
