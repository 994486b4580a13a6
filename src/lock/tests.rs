use super::*;
use tempfile::TempDir;

fn own_pid() -> u32 {
    std::process::id()
}

#[tokio::test]
async fn test_acquire_creates_record_with_holder() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with(&own_pid().to_string()));
    assert_eq!(token.holder_pid, own_pid());
}

#[tokio::test]
async fn test_second_acquire_against_live_holder_fails() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    let _token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();

    // The holder (this test process) is alive, so a second acquire must
    // exhaust its retries and fail fatally.
    let result = acquire(&path, own_pid(), 2, Duration::from_millis(10)).await;
    assert!(matches!(result, Err(ControllerError::Lock { .. })));
}

#[tokio::test]
async fn test_stale_lock_is_reclaimed() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    // A record naming a PID that cannot be alive, with a bogus start time.
    std::fs::write(&path, "4194304 1 2020-01-01T00:00:00Z\n").unwrap();

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(token.holder_pid, own_pid());
}

#[tokio::test]
async fn test_garbage_record_is_reclaimed() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");
    std::fs::write(&path, "not a lock record\n").unwrap();

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(token.holder_pid, own_pid());
}

#[tokio::test]
async fn test_release_removes_own_record() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();
    release(&token).unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_release_leaves_foreign_record_alone() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();

    // Simulate another process having reclaimed the lock.
    std::fs::write(&path, "99999 12345 2026-01-01T00:00:00Z\n").unwrap();

    release(&token).unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_acquire_after_release_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("orchestrator.lock");

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();
    release(&token).unwrap();

    let token = acquire(&path, own_pid(), 0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(token.holder_pid, own_pid());
}
