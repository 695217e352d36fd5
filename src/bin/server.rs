//! Thin composition root: wires a [`PeerManager`] to a [`PeerListener`] and
//! an [`SniProxy`] for manual testing. Not a CLI — bind addresses and keys
//! are read from environment variables only, with no subcommands or config
//! file format.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use fernet::Fernet;
use snitun::server::{PeerListener, PeerManager, SniProxy};
use snitun::Config;
use tokio::net::TcpListener;
use tracing::info;

fn config_from_env() -> Result<Config, Box<dyn std::error::Error>> {
    let peer_listener_addr: SocketAddr = env::var("SNITUN_PEER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8893".to_string())
        .parse()?;
    let sni_proxy_addr: SocketAddr = env::var("SNITUN_SNI_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:443".to_string())
        .parse()?;
    let fernet_key = env::var("SNITUN_FERNET_KEY")?;
    let fernet = Fernet::new(&fernet_key).ok_or("invalid SNITUN_FERNET_KEY")?;

    Ok(Config::new(peer_listener_addr, sni_proxy_addr, vec![fernet]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env()?;

    let manager = Arc::new(PeerManager::new(
        config.fernet_keys.clone(),
        config.protocol_version,
    ));

    let peer_listener = Arc::new(PeerListener::new(manager.clone()));
    let sni_proxy = Arc::new(SniProxy::new(manager));

    let peer_tcp = TcpListener::bind(config.peer_listener_addr).await?;
    let sni_tcp = TcpListener::bind(config.sni_proxy_addr).await?;
    info!(peer_addr = %config.peer_listener_addr, sni_addr = %config.sni_proxy_addr, "snitun listening");

    tokio::try_join!(
        run_peer_listener(peer_listener, peer_tcp),
        run_sni_proxy(sni_proxy, sni_tcp),
    )?;
    Ok(())
}

async fn run_peer_listener(
    listener: Arc<PeerListener>,
    tcp: TcpListener,
) -> snitun::Result<()> {
    listener.run(tcp).await
}

async fn run_sni_proxy(proxy: Arc<SniProxy>, tcp: TcpListener) -> snitun::Result<()> {
    proxy.run(tcp).await
}
