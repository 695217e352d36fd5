//! TCP listener that onboards peers: reads a Fernet token, runs the
//! challenge, registers the resulting [`Peer`].

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::server::peer::ignore_new_channel;
use crate::server::peer_manager::PeerManager;

/// Upper bound on how many bytes we'll read looking for a Fernet token.
/// Real tokens are well under this; a larger frame is not a valid token.
const MAX_TOKEN_LENGTH: usize = 2 * 1024;

/// Bounds the whole onboarding handshake: token read, verification, and the
/// crypto challenge.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts peer connections and onboards them into a [`PeerManager`].
pub struct PeerListener {
    manager: Arc<PeerManager>,
    cancel: CancellationToken,
}

impl PeerListener {
    pub fn new(manager: Arc<PeerManager>) -> Self {
        PeerListener {
            manager,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop accepting and let in-flight handshakes finish on their own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accept loop. Runs until cancelled via [`Self::shutdown`] or the
    /// listener errors.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "peer listener accept failed");
                    continue;
                }
            };
            debug!(%addr, "peer connection accepted");

            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(manager, socket).await {
                    debug!(%addr, error = %e, "peer onboarding failed");
                }
            });
        }
    }
}

async fn handle_connection(manager: Arc<PeerManager>, socket: TcpStream) -> Result<()> {
    crate::utils::with_timeout(HANDSHAKE_TIMEOUT, async {
        socket.set_nodelay(true).ok();
        let (mut reader, writer) = socket.into_split();

        let token = read_token(&mut reader).await?;
        let peer = manager.create_peer(&token)?;

        peer.init_multiplexer_challenge(reader, writer, ignore_new_channel())
            .await?;

        manager.add_peer(peer);
        Ok(())
    })
    .await
}

async fn read_token<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; MAX_TOKEN_LENGTH];
    let n = reader
        .read(&mut buf)
        .await
        .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;
    if n == 0 {
        return Err(Error::new(ErrorKind::TransportClose));
    }
    buf.truncate(n);
    Ok(buf)
}
