//! Expiry must survive a restart: deadlines live in the store, and a
//! freshly started server rebuilds its index from them.

use ed25519_dalek::SigningKey;
use rend_core::time::now_nanos;
use rend_core::{EndpointRecord, Topic};
use rend_server::{Server, ServerConfig};
use rend_store::RecordStore;
use std::time::Duration;

fn record(seed: u8) -> EndpointRecord {
    EndpointRecord::signed(1, Vec::new(), &SigningKey::from_bytes(&[seed; 32])).unwrap()
}

#[tokio::test]
async fn rebuilt_index_expires_old_records() {
    let dir = tempfile::tempdir().unwrap();
    let topic = Topic::new("t").unwrap();

    // Populate a store as a previous server run would have left it:
    // three records already past their deadline, one with time left.
    let kept_key = {
        let store = RecordStore::open(dir.path()).unwrap();
        let past = now_nanos() - 1_000_000_000;
        for seed in 0..3 {
            store.add(&topic, &record(seed), past).await.unwrap();
        }
        let future = now_nanos() + 3_600_000_000_000;
        store.add(&topic, &record(9), future).await.unwrap().key
    };

    // "Restart": reopen the same path and start a server over it.
    let store = RecordStore::open(dir.path()).unwrap();
    let mut server = Server::start(
        ServerConfig {
            cleaner_period: Duration::from_millis(20),
            ..ServerConfig::default()
        },
        store.clone(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let remaining = store.get_random("t", 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0], record(9));
    assert!(store.deadline_of(&kept_key).await.unwrap().is_some());

    server.stop().await.unwrap();
    // Stop is idempotent.
    server.stop().await.unwrap();
}
