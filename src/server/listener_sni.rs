//! TCP listener that reads the TLS ClientHello, resolves SNI to a peer, and
//! splices the connection onto a fresh multiplexer channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::multiplexer::{ChannelReadHalf, ChannelWriteHalf, Multiplexer};
use crate::server::peer_manager::PeerManager;
use crate::server::sni::{self, RECORD_HEADER_LENGTH};

/// Bounds how long we wait to read a whole ClientHello off the wire.
const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts client connections, routes them by SNI hostname to a peer's
/// multiplexer channel.
pub struct SniProxy {
    manager: Arc<PeerManager>,
    cancel: CancellationToken,
}

impl SniProxy {
    pub fn new(manager: Arc<PeerManager>) -> Self {
        SniProxy {
            manager,
            cancel: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "sni proxy accept failed");
                    continue;
                }
            };

            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(manager, socket).await {
                    debug!(%addr, error = %e, "sni routing failed");
                }
            });
        }
    }
}

async fn handle_connection(manager: Arc<PeerManager>, mut socket: TcpStream) -> Result<()> {
    socket.set_nodelay(true).ok();

    let client_hello = crate::utils::with_timeout(CLIENT_HELLO_TIMEOUT, read_client_hello(&mut socket)).await?;

    let hostname = sni::parse_server_name(&client_hello)?
        .ok_or_else(|| Error::new(ErrorKind::Protocol))?;

    let peer = manager
        .get_peer(&hostname)
        .filter(|peer| peer.is_ready())
        .ok_or_else(|| Error::new(ErrorKind::NotConnected))?;

    let multiplexer = peer
        .multiplexer()
        .ok_or_else(|| Error::new(ErrorKind::NotConnected))?;

    let channel = multiplexer.create_channel().await?;
    let channel_id = channel.id();
    let (read_half, write_half) = channel.split();
    write_half.write(client_hello).await?;

    splice(socket, read_half, write_half, channel_id, multiplexer).await;
    Ok(())
}

async fn read_client_hello(socket: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = vec![0u8; RECORD_HEADER_LENGTH];
    socket
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;

    let body_len = sni::record_body_length(&header)?;
    let mut body = vec![0u8; body_len];
    socket
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;

    header.extend_from_slice(&body);
    Ok(header)
}

/// Copy bytes in both directions between the raw socket and the
/// multiplexer channel until either side closes. Reads and writes run
/// concurrently, so the channel is split into independent halves rather
/// than shared as one value between the two directions.
async fn splice(
    socket: TcpStream,
    mut channel_read: ChannelReadHalf,
    channel_write: ChannelWriteHalf,
    channel_id: Uuid,
    multiplexer: Multiplexer,
) {
    let (mut sock_read, mut sock_write) = socket.into_split();

    let to_channel = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if channel_write.write(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
    };

    let to_socket = async {
        loop {
            match channel_read.read().await {
                Ok(data) => {
                    if sock_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = sock_write.shutdown().await;
    };

    tokio::join!(to_channel, to_socket);
    let _ = multiplexer.delete_channel(channel_id).await;
}
