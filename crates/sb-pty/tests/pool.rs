#![cfg(unix)]

use sb_pty::{PtyError, TermPool};
use std::path::PathBuf;

fn tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn pool(max: usize) -> TermPool {
    TermPool::new(max, 64 * 1024, "/bin/sh".to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_create_get_kill() {
    let pool = pool(4);

    let session = pool
        .create("shell".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();
    assert!(!session.is_stopped());

    let fetched = pool.get(&session.id).await.unwrap();
    assert_eq!(fetched.id, session.id);

    session.kill().await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    assert!(fetched.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_session_not_found() {
    let pool = pool(4);
    let result = pool.get(&uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(PtyError::SessionNotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_enforces_session_cap() {
    let pool = pool(2);
    let a = pool
        .create("a".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();
    let b = pool
        .create("b".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();

    let result = pool.create("c".to_string(), &tmp_dir(), 80, 24).await;
    assert!(matches!(result, Err(PtyError::SessionLimit(2))));

    // Removing one frees a slot.
    a.kill().await.unwrap();
    pool.remove(&a.id).await;
    let c = pool
        .create("c".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();

    for session in [b, c] {
        session.kill().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_kill_all_stops_every_session() {
    let pool = pool(4);
    let a = pool
        .create("a".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();
    let b = pool
        .create("b".to_string(), &tmp_dir(), 80, 24)
        .await
        .unwrap();

    pool.kill_all().await;
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    assert!(a.is_stopped());
    assert!(b.is_stopped());
}
