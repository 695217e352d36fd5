//! Plain configuration data for the two listeners. No env/CLI parsing lives
//! here — callers (the composition-root binary, or a test) build one of
//! these however they like and pass it by reference.

use std::net::SocketAddr;

use fernet::Fernet;

/// Everything needed to stand up a [`crate::server::PeerListener`] and a
/// [`crate::server::SniProxy`] against the same peer registry.
pub struct Config {
    /// Where [`crate::server::PeerListener`] accepts peer onboarding
    /// connections.
    pub peer_listener_addr: SocketAddr,
    /// Where [`crate::server::SniProxy`] accepts public client connections.
    pub sni_proxy_addr: SocketAddr,
    /// Keys used to verify (never mint) Fernet-sealed peer tokens.
    pub fernet_keys: Vec<Fernet>,
    /// Negotiated with peers during the handshake.
    pub protocol_version: u8,
}

impl Config {
    pub fn new(
        peer_listener_addr: SocketAddr,
        sni_proxy_addr: SocketAddr,
        fernet_keys: Vec<Fernet>,
    ) -> Self {
        Config {
            peer_listener_addr,
            sni_proxy_addr,
            fernet_keys,
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }
}
