//! A single authenticated remote endpoint and its multiplexer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use rand::RngCore;
use ring::digest::{digest, SHA256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::multiplexer::crypto::{CryptoTransport, IV_LENGTH, KEY_LENGTH};
use crate::multiplexer::{Channel, Multiplexer, NewChannelCallback};

/// Size, in bytes, of the random challenge exchanged during the handshake.
const CHALLENGE_LENGTH: usize = 32;

/// A callback that logs and drops any channel the peer opens on us. Peers
/// are not expected to initiate channels in this design (only the
/// SNI-facing side does), so this is the default supplied by
/// [`crate::server::listener_peer::PeerListener`].
pub fn ignore_new_channel() -> NewChannelCallback {
    Arc::new(|_channel: Channel| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {
            warn!("peer opened an unexpected channel; ignoring it");
        })
    })
}

/// An authenticated remote endpoint, identified by hostname (and optional
/// alias), with a time-bounded validity.
pub struct Peer {
    hostname: String,
    alias: Option<String>,
    valid_until: SystemTime,
    aes_key: [u8; KEY_LENGTH],
    aes_iv: [u8; IV_LENGTH],
    protocol_version: u8,
    throttling: Option<u32>,
    multiplexer: RwLock<Option<Multiplexer>>,
}

impl Peer {
    /// Construct a peer in the `Pending` state (no multiplexer yet).
    pub fn new(
        hostname: impl Into<String>,
        valid_until: SystemTime,
        aes_key: [u8; KEY_LENGTH],
        aes_iv: [u8; IV_LENGTH],
        protocol_version: u8,
        alias: Option<String>,
        throttling: Option<u32>,
    ) -> Self {
        Peer {
            hostname: hostname.into(),
            alias,
            valid_until,
            aes_key,
            aes_iv,
            protocol_version,
            throttling,
            multiplexer: RwLock::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// `true` iff `now < valid_until`.
    pub fn is_valid(&self) -> bool {
        SystemTime::now() < self.valid_until
    }

    /// `true` once the multiplexer has been constructed (state `Ready`).
    pub fn is_ready(&self) -> bool {
        self.multiplexer.read().is_some()
    }

    /// `true` iff ready and the multiplexer's transport is still up.
    pub fn is_connected(&self) -> bool {
        self.multiplexer
            .read()
            .as_ref()
            .map(Multiplexer::is_connected)
            .unwrap_or(false)
    }

    /// A cheap clone of the multiplexer handle, once ready.
    pub fn multiplexer(&self) -> Option<Multiplexer> {
        self.multiplexer.read().clone()
    }

    /// Resolves once the peer's multiplexer disconnects. Calling this
    /// before the peer is `Ready` is a usage error.
    pub async fn wait_disconnect(&self) -> Result<()> {
        let multiplexer = self
            .multiplexer()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected))?;
        multiplexer.wait().await;
        Ok(())
    }

    /// Run the challenge-response handshake over `reader`/`writer`, then
    /// construct the multiplexer and transition to `Ready`.
    ///
    /// Wire order: we send a random 32-byte encrypted challenge,
    /// the peer replies with `encrypt(sha256(decrypt(challenge)))`, and we
    /// validate that against our own `sha256(token)`.
    pub async fn init_multiplexer_challenge<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        new_channel: NewChannelCallback,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let crypto = CryptoTransport::new(&self.aes_key, &self.aes_iv);

        let mut token = [0u8; CHALLENGE_LENGTH];
        rand::thread_rng().fill_bytes(&mut token);

        let challenge = crypto.encrypt(token.to_vec());
        writer
            .write_all(&challenge)
            .await
            .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;

        let mut response = vec![0u8; CHALLENGE_LENGTH];
        reader
            .read_exact(&mut response)
            .await
            .map_err(|e| Error::wrap(ErrorKind::TransportError, e))?;
        let response = crypto.decrypt(response);

        let expected = digest(&SHA256, &token);
        if response != expected.as_ref() {
            return Err(Error::new(ErrorKind::ChallengeError));
        }

        debug!(hostname = %self.hostname, "peer passed challenge");
        let multiplexer = Multiplexer::new(
            crypto,
            reader,
            writer,
            self.protocol_version,
            new_channel,
            self.throttling,
        );
        *self.multiplexer.write() = Some(multiplexer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn validity_window() {
        let valid = Peer::new(
            "localhost",
            SystemTime::now() + Duration::from_secs(3600),
            [0u8; KEY_LENGTH],
            [0u8; IV_LENGTH],
            1,
            Some("localhost.custom".into()),
            None,
        );
        assert!(valid.is_valid());
        assert_eq!(valid.hostname(), "localhost");
        assert_eq!(valid.alias(), Some("localhost.custom"));
        assert!(!valid.is_ready());

        let expired = Peer::new(
            "localhost",
            SystemTime::now() - Duration::from_secs(3600),
            [0u8; KEY_LENGTH],
            [0u8; IV_LENGTH],
            1,
            None,
            None,
        );
        assert!(!expired.is_valid());
    }

    #[tokio::test]
    async fn wait_disconnect_before_ready_is_a_usage_error() {
        let peer = Peer::new(
            "localhost",
            SystemTime::now() + Duration::from_secs(3600),
            [0u8; KEY_LENGTH],
            [0u8; IV_LENGTH],
            1,
            None,
            None,
        );
        let err = peer.wait_disconnect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn challenge_handshake_succeeds_and_mismatch_fails() {
        use tokio::io::duplex;

        // success path
        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let key = [5u8; KEY_LENGTH];
        let iv = [6u8; IV_LENGTH];
        let peer = Peer::new(
            "localhost",
            SystemTime::now() + Duration::from_secs(3600),
            key,
            iv,
            1,
            None,
            None,
        );

        let client_task = tokio::spawn(async move {
            let crypto = CryptoTransport::new(&key, &iv);
            let mut reader = client_read;
            let mut writer = client_write;

            let mut challenge = vec![0u8; CHALLENGE_LENGTH];
            reader.read_exact(&mut challenge).await.unwrap();
            let token = crypto.decrypt(challenge);
            let hash = digest(&SHA256, &token).as_ref().to_vec();
            writer.write_all(&crypto.encrypt(hash)).await.unwrap();
            writer.flush().await.unwrap();
        });

        peer.init_multiplexer_challenge(server_read, server_write, ignore_new_channel())
            .await
            .unwrap();
        client_task.await.unwrap();

        assert!(peer.is_ready());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn challenge_mismatch_is_rejected() {
        use tokio::io::duplex;

        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let key = [7u8; KEY_LENGTH];
        let iv = [8u8; IV_LENGTH];
        let peer = Peer::new(
            "localhost",
            SystemTime::now() + Duration::from_secs(3600),
            key,
            iv,
            1,
            None,
            None,
        );

        let client_task = tokio::spawn(async move {
            let crypto = CryptoTransport::new(&key, &iv);
            let mut reader = client_read;
            let mut writer = client_write;

            let mut challenge = vec![0u8; CHALLENGE_LENGTH];
            reader.read_exact(&mut challenge).await.unwrap();
            let token = crypto.decrypt(challenge);
            // reply with the raw token instead of its hash: wrong answer
            writer.write_all(&crypto.encrypt(token)).await.unwrap();
            writer.flush().await.unwrap();
        });

        let err = peer
            .init_multiplexer_challenge(server_read, server_write, ignore_new_channel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeError);
        client_task.await.unwrap();
        assert!(!peer.is_ready());
    }
}
