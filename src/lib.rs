//! A TLS-SNI reverse-tunnel gateway: multiplexed, encrypted peer channels
//! behind a single public endpoint.
//!
//! An authenticated peer opens one TCP connection carrying a
//! [`multiplexer::Multiplexer`] of independent channels; the [`server::SniProxy`]
//! terminates public-facing connections, extracts the TLS SNI hostname
//! without fully parsing TLS, and splices each one onto a fresh channel to
//! the matching peer.

pub mod config;
pub mod error;
pub mod multiplexer;
pub mod server;
pub mod utils;

/// Wire-level protocol version negotiated during the peer handshake.
pub const PROTOCOL_VERSION: u8 = 1;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use multiplexer::Multiplexer;
pub use server::{Peer, PeerListener, PeerManager, SniProxy};
