//! Hostname/alias → [`Peer`] registry, and Fernet token verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use fernet::{Fernet, MultiFernet};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::multiplexer::crypto::{IV_LENGTH, KEY_LENGTH};
use crate::server::peer::Peer;

/// The Fernet-sealed token's plaintext payload. Field names are
/// kept exactly as named there for wire compatibility.
#[derive(Deserialize)]
struct TokenPayload {
    valid: u64,
    hostname: String,
    aes_key: String,
    aes_iv: String,
    #[serde(default)]
    alias: Vec<String>,
    #[serde(default)]
    throttling: Option<u32>,
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::wrap(ErrorKind::ChallengeError, e))?;
    bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::ChallengeError))
}

/// Maps hostnames (and optional aliases) to live, authenticated peers.
pub struct PeerManager {
    fernet: MultiFernet,
    by_hostname: RwLock<HashMap<String, Arc<Peer>>>,
    by_alias: RwLock<HashMap<String, Arc<Peer>>>,
    protocol_version: u8,
}

impl PeerManager {
    /// Build a manager that verifies tokens against any of `keys` (oldest
    /// first is fine — `MultiFernet` tries each in turn).
    pub fn new(keys: Vec<Fernet>, protocol_version: u8) -> Self {
        PeerManager {
            fernet: MultiFernet::new(keys),
            by_hostname: RwLock::new(HashMap::new()),
            by_alias: RwLock::new(HashMap::new()),
            protocol_version,
        }
    }

    /// Verify a Fernet-sealed token and build a not-yet-connected [`Peer`]
    /// from its payload. Rejects expired tokens.
    pub fn create_peer(&self, token: &[u8]) -> Result<Arc<Peer>> {
        let token_str =
            std::str::from_utf8(token).map_err(|e| Error::wrap(ErrorKind::ChallengeError, e))?;
        let plaintext = self
            .fernet
            .decrypt(token_str)
            .map_err(|_| Error::new(ErrorKind::ChallengeError))?;
        let payload: TokenPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::wrap(ErrorKind::ChallengeError, e))?;

        let valid_until = UNIX_EPOCH + Duration::from_secs(payload.valid);
        if SystemTime::now() >= valid_until {
            debug!(hostname = %payload.hostname, "rejecting expired peer token");
            return Err(Error::new(ErrorKind::ChallengeError));
        }

        let aes_key = decode_fixed::<KEY_LENGTH>(&payload.aes_key)?;
        let aes_iv = decode_fixed::<IV_LENGTH>(&payload.aes_iv)?;

        Ok(Arc::new(Peer::new(
            payload.hostname.to_ascii_lowercase(),
            valid_until,
            aes_key,
            aes_iv,
            self.protocol_version,
            payload.alias.into_iter().next().map(|a| a.to_ascii_lowercase()),
            payload.throttling,
        )))
    }

    /// Register an authenticated (`Ready`) peer under its hostname and
    /// optional alias. If another peer already holds that name, the earlier
    /// peer is shut down and evicted. Subscribes to the peer's multiplexer
    /// disconnect so it's removed automatically when the link drops.
    pub fn add_peer(self: &Arc<Self>, peer: Arc<Peer>) {
        let hostname = peer.hostname().to_string();
        let alias = peer.alias().map(str::to_string);

        if let Some(previous) = self.by_hostname.write().insert(hostname.clone(), peer.clone()) {
            evict_if_different(&previous, &peer);
        }
        if let Some(alias) = &alias {
            if let Some(previous) = self.by_alias.write().insert(alias.clone(), peer.clone()) {
                evict_if_different(&previous, &peer);
            }
        }
        info!(hostname = %hostname, alias = ?alias, "peer registered");

        if let Some(multiplexer) = peer.multiplexer() {
            let manager = self.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                multiplexer.wait().await;
                manager.remove_peer(&peer);
            });
        }
    }

    /// Remove a peer's hostname/alias entries, but only the ones that still
    /// point at exactly this peer (a newer peer may already have evicted it).
    pub fn remove_peer(&self, peer: &Arc<Peer>) {
        let mut by_hostname = self.by_hostname.write();
        if by_hostname
            .get(peer.hostname())
            .is_some_and(|existing| Arc::ptr_eq(existing, peer))
        {
            by_hostname.remove(peer.hostname());
        }
        drop(by_hostname);

        if let Some(alias) = peer.alias() {
            let mut by_alias = self.by_alias.write();
            if by_alias
                .get(alias)
                .is_some_and(|existing| Arc::ptr_eq(existing, peer))
            {
                by_alias.remove(alias);
            }
        }
        debug!(hostname = %peer.hostname(), "peer removed");
    }

    /// O(1) presence check by hostname or alias, case-insensitive.
    pub fn peer_available(&self, hostname: &str) -> bool {
        self.get_peer(hostname).is_some()
    }

    /// O(1) lookup by hostname or alias, case-insensitive.
    pub fn get_peer(&self, hostname: &str) -> Option<Arc<Peer>> {
        let hostname = hostname.to_ascii_lowercase();
        if let Some(peer) = self.by_hostname.read().get(&hostname) {
            return Some(peer.clone());
        }
        self.by_alias.read().get(&hostname).cloned()
    }
}

fn evict_if_different(previous: &Arc<Peer>, incoming: &Arc<Peer>) {
    if Arc::ptr_eq(previous, incoming) {
        return;
    }
    if let Some(multiplexer) = previous.multiplexer() {
        multiplexer.shutdown();
    }
}
