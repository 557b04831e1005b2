use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::TimeZone;
use werf_core::{ClientId, LockHandle, LockMode, RetryPolicy, StageRecord, StageSignature};
use werf_storage::{
    AcquireOptions, AcquireOutcome, CacheError, LockBackend, LockError, LockOptions,
    StagesStorageCache, StorageLockManager, WaitPolicy,
};
use werf_sync::{
    LocalBackendFactory, ServerConfig, ServerState, SyncClient, SyncError, Synchronization,
    SynchronizationServer, new_client_id,
};

async fn start_server() -> (SynchronizationServer, String) {
    let config = ServerConfig::parse("127.0.0.1", "0", Some("5s")).unwrap();
    let factory = Arc::new(LocalBackendFactory::in_memory(RetryPolicy::immediate(10)));
    let mut server = SynchronizationServer::new(config, factory);
    let addr = server.start().await.unwrap();
    (server, format!("http://{addr}"))
}

fn demo() -> ClientId {
    ClientId::parse("demo").unwrap()
}

fn client(base_url: &str) -> SyncClient {
    SyncClient::new(base_url, demo(), RetryPolicy::immediate(3))
}

fn fast_locks() -> LockOptions {
    LockOptions {
        mode: LockMode::Exclusive,
        ttl: Duration::from_secs(5),
        wait: WaitPolicy::Timeout(Duration::from_secs(10)),
        poll_interval: Duration::from_millis(5),
    }
}

fn record(image_id: &str, signature: &str, seconds: i64) -> StageRecord {
    let created_at = chrono::Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap();
    StageRecord::at(image_id, signature, created_at)
}

// ── Lifecycle ──

#[tokio::test]
async fn server_lifecycle_is_enforced() {
    let config = ServerConfig::parse("127.0.0.1", "0", None).unwrap();
    let factory = Arc::new(LocalBackendFactory::in_memory(RetryPolicy::immediate(3)));
    let mut server = SynchronizationServer::new(config, factory);
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());

    let addr = server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.local_addr(), Some(addr));
    assert!(matches!(
        server.start().await,
        Err(SyncError::State {
            state: ServerState::Running,
            expected: ServerState::Stopped,
        })
    ));

    client(&format!("http://{addr}")).health().await.unwrap();

    server.shutdown().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(matches!(
        server.shutdown().await,
        Err(SyncError::State { .. })
    ));
}

#[tokio::test]
async fn bind_failure_leaves_server_stopped() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port().to_string();

    let config = ServerConfig::parse("127.0.0.1", &port, None).unwrap();
    let factory = Arc::new(LocalBackendFactory::in_memory(RetryPolicy::immediate(3)));
    let mut server = SynchronizationServer::new(config, factory);

    assert!(matches!(server.start().await, Err(SyncError::Bind { .. })));
    assert_eq!(server.state(), ServerState::Stopped);
}

// ── Locking through the server ──

#[tokio::test]
async fn with_lock_is_mutually_exclusive_across_clients() {
    let (mut server, url) = start_server().await;
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = StorageLockManager::new(
            Arc::new(client(&url)),
            uuid::Uuid::new_v4().to_string(),
            fast_locks(),
        );
        let inside = Arc::clone(&inside);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            manager
                .with_lock("demo/install", manager.defaults(), || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, LockError>(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn busy_lock_without_wait_fails_fast() {
    let (mut server, url) = start_server().await;
    let first = StorageLockManager::new(Arc::new(client(&url)), "ci-1", fast_locks());
    let second = StorageLockManager::new(Arc::new(client(&url)), "ci-2", fast_locks());

    let guard = first.acquire("demo/install", first.defaults()).await.unwrap();
    let err = second
        .acquire("demo/install", &second.defaults().no_wait())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, LockError::Busy { holder: Some(holder), .. } if holder == "ci-1"),
        "{err}"
    );

    guard.release().await.unwrap();
    second
        .acquire("demo/install", &second.defaults().no_wait())
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn foreign_lease_renewal_is_lease_lost() {
    let (mut server, url) = start_server().await;
    let handle = LockHandle {
        lock_name: "demo/install".into(),
        holder_id: "ghost".into(),
        mode: LockMode::Exclusive,
    };

    let err = client(&url)
        .renew_lease(&handle, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::LeaseLost { ref holder_id, .. } if holder_id == "ghost"));
    server.shutdown().await.unwrap();
}

// ── Stages storage cache through the server ──

#[tokio::test]
async fn concurrent_builders_converge_on_earliest_record() {
    let (mut server, url) = start_server().await;
    let a = Synchronization::remote(&url, demo(), RetryPolicy::immediate(3), fast_locks());
    let b = Synchronization::remote(&url, demo(), RetryPolicy::immediate(3), fast_locks());
    let signature = StageSignature::from("sig-install");

    let late = a
        .cache()
        .publish("demo", &signature, &record("sha256:a", "sig-install", 10))
        .await
        .unwrap();
    assert!(late.accepted);

    let early = b
        .cache()
        .publish("demo", &signature, &record("sha256:b", "sig-install", 3))
        .await
        .unwrap();
    assert!(early.accepted);

    let retry = a
        .cache()
        .publish("demo", &signature, &record("sha256:a", "sig-install", 10))
        .await
        .unwrap();
    assert!(!retry.accepted);
    assert_eq!(retry.canonical.image_id, "sha256:b");

    for side in [&a, &b] {
        let found = side.cache().lookup("demo", &signature).await.unwrap().unwrap();
        assert_eq!(found.image_id, "sha256:b");
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn signature_mismatch_comes_back_typed() {
    let (mut server, url) = start_server().await;
    let err = client(&url)
        .publish(
            "demo",
            &StageSignature::from("sig-1"),
            &record("sha256:a", "sig-2", 0),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(&err, CacheError::SignatureMismatch { expected, actual }
            if expected == "sig-1" && actual == "sig-2"),
        "{err}"
    );
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_mints_client_ids() {
    let (mut server, url) = start_server().await;
    let id = new_client_id(&url, &RetryPolicy::immediate(3)).await.unwrap();

    let outcome = SyncClient::new(&url, id, RetryPolicy::immediate(3))
        .acquire("install", &AcquireOptions::exclusive("ci-1", Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
    server.shutdown().await.unwrap();
}

// ── Unreachable server ──

#[tokio::test]
async fn unreachable_server_exhausts_retries() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = SyncClient::new(
        format!("http://127.0.0.1:{port}"),
        demo(),
        RetryPolicy::immediate(2),
    );

    let err = client.health().await.unwrap_err();
    assert!(
        matches!(err, SyncError::RetriesExhausted { attempts: 2, .. }),
        "{err}"
    );

    let err = client
        .acquire("install", &AcquireOptions::exclusive("ci-1", Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, LockError::Remote { retryable: true, .. }),
        "{err}"
    );
}
