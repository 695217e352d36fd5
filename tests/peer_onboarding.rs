//! Drives the peer-onboarding flow end to end over real loopback TCP
//! sockets, mirroring `tests/server/test_listener_peer.py` in the original
//! project: a client connects, sends a Fernet token, completes the crypto
//! challenge, and the peer becomes visible in the registry.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use fernet::Fernet;
use ring::digest::{digest, SHA256};
use snitun::multiplexer::crypto::{CryptoTransport, IV_LENGTH, KEY_LENGTH};
use snitun::server::{PeerListener, PeerManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn token_for(fernet: &Fernet, hostname: &str, aes_key: [u8; KEY_LENGTH], aes_iv: [u8; IV_LENGTH]) -> Vec<u8> {
    let valid = (SystemTime::now() + Duration::from_secs(86_400))
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let payload = serde_json::json!({
        "valid": valid,
        "hostname": hostname,
        "aes_key": base64::engine::general_purpose::STANDARD.encode(aes_key),
        "aes_iv": base64::engine::general_purpose::STANDARD.encode(aes_iv),
    });
    fernet
        .encrypt(serde_json::to_vec(&payload).unwrap().as_slice())
        .into_bytes()
}

#[tokio::test]
async fn peer_appears_in_registry_after_handshake() {
    let fernet = Fernet::new(&Fernet::generate_key()).unwrap();
    let manager = Arc::new(PeerManager::new(vec![fernet.clone()], snitun::PROTOCOL_VERSION));

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let listener = Arc::new(PeerListener::new(manager.clone()));
    let accept_task = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.run(tcp).await })
    };

    let aes_key = [42u8; KEY_LENGTH];
    let aes_iv = [24u8; IV_LENGTH];
    let token = token_for(&fernet, "localhost", aes_key, aes_iv);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&token).await.unwrap();

    let crypto = CryptoTransport::new(&aes_key, &aes_iv);
    let mut challenge = vec![0u8; 32];
    client.read_exact(&mut challenge).await.unwrap();
    let plain = crypto.decrypt(challenge);
    let hash = digest(&SHA256, &plain).as_ref().to_vec();
    client.write_all(&crypto.encrypt(hash)).await.unwrap();
    client.flush().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.peer_available("localhost"));

    listener.shutdown();
    accept_task.abort();
}

#[tokio::test]
async fn disconnect_removes_the_peer() {
    let fernet = Fernet::new(&Fernet::generate_key()).unwrap();
    let manager = Arc::new(PeerManager::new(vec![fernet.clone()], snitun::PROTOCOL_VERSION));

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let listener = Arc::new(PeerListener::new(manager.clone()));
    let accept_task = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.run(tcp).await })
    };

    let aes_key = [1u8; KEY_LENGTH];
    let aes_iv = [2u8; IV_LENGTH];
    let token = token_for(&fernet, "localhost", aes_key, aes_iv);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&token).await.unwrap();

    let crypto = CryptoTransport::new(&aes_key, &aes_iv);
    let mut challenge = vec![0u8; 32];
    client.read_exact(&mut challenge).await.unwrap();
    let plain = crypto.decrypt(challenge);
    let hash = digest(&SHA256, &plain).as_ref().to_vec();
    client.write_all(&crypto.encrypt(hash)).await.unwrap();
    client.flush().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.peer_available("localhost"));

    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!manager.peer_available("localhost"));

    listener.shutdown();
    accept_task.abort();
}
