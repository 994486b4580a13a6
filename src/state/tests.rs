use super::*;
use std::collections::BTreeMap;

fn spec(name: &str, url: &str) -> FeedSpec {
    FeedSpec {
        name: name.to_string(),
        url: url.to_string(),
        sparql_endpoint: "http://db/sparql".to_string(),
        polling_interval: 60,
        shape: String::new(),
        target_graph: String::new(),
        follow: true,
        materialize: false,
        order: crate::config::OrderingMode::None,
        last_version_only: false,
        failure_is_fatal: false,
        concurrent_fetches: 10,
        query_timeout: 1800,
        before: None,
        after: None,
        access_token: None,
        environment: BTreeMap::new(),
    }
}

fn running(name: &str, hash: &str) -> WorkerHandle {
    WorkerHandle {
        feed_name: name.to_string(),
        runtime_id: Some(format!("id-{name}")),
        spec_hash: hash.to_string(),
        status: WorkerStatus::Running,
        started_at: Some(chrono::Utc::now()),
        exit_code: None,
    }
}

#[test]
fn test_diff_launches_new_desired_feed() {
    let mut store = StateStore::new();
    store.upsert_desired(spec("feed-a", "https://a"));

    assert_eq!(store.to_launch(), vec!["feed-a".to_string()]);
    assert!(store.to_stop().is_empty());
}

#[test]
fn test_diff_is_empty_when_converged() {
    let mut store = StateStore::new();
    let s = spec("feed-a", "https://a");
    let hash = s.spec_hash();
    store.upsert_desired(s);
    store.insert_actual(running("feed-a", &hash));

    assert!(store.to_launch().is_empty());
    assert!(store.to_stop().is_empty());
}

#[test]
fn test_diff_stops_removed_feed() {
    let mut store = StateStore::new();
    let s = spec("feed-a", "https://a");
    let hash = s.spec_hash();
    store.upsert_desired(s);
    store.insert_actual(running("feed-a", &hash));
    store.remove_desired("feed-a");

    assert_eq!(store.to_stop(), vec!["feed-a".to_string()]);
    assert!(store.to_launch().is_empty());
}

#[test]
fn test_diff_replaces_on_hash_mismatch() {
    let mut store = StateStore::new();
    let old = spec("feed-a", "https://a");
    let old_hash = old.spec_hash();
    store.upsert_desired(old);
    store.insert_actual(running("feed-a", &old_hash));

    store.upsert_desired(spec("feed-a", "https://a/v2"));

    // Stop first; the relaunch becomes visible once the worker is Absent.
    assert_eq!(store.to_stop(), vec!["feed-a".to_string()]);
    assert!(store.to_launch().is_empty());

    store.set_absent("feed-a");
    assert_eq!(store.to_launch(), vec!["feed-a".to_string()]);
}

#[test]
fn test_in_flight_names_are_skipped() {
    let mut store = StateStore::new();
    store.upsert_desired(spec("feed-a", "https://a"));
    assert!(store.begin_op("feed-a"));
    assert!(!store.begin_op("feed-a"));

    assert!(store.to_launch().is_empty());

    store.end_op("feed-a");
    assert_eq!(store.to_launch(), vec!["feed-a".to_string()]);
}

#[test]
fn test_suspended_feed_is_not_relaunched() {
    let mut store = StateStore::new();
    store.upsert_desired(spec("feed-a", "https://a"));
    store.suspend("feed-a", "exit code 1".to_string());

    assert!(store.to_launch().is_empty());
    assert!(store.is_suspended("feed-a"));
}

#[test]
fn test_reapplied_config_clears_suspension() {
    let mut store = StateStore::new();
    store.upsert_desired(spec("feed-a", "https://a"));
    store.suspend("feed-a", "exit code 1".to_string());
    store.upsert_desired(spec("feed-a", "https://a"));

    assert!(!store.is_suspended("feed-a"));
    assert_eq!(store.to_launch(), vec!["feed-a".to_string()]);
}

#[test]
fn test_published_snapshot_tracks_running_workers_only() {
    let mut store = StateStore::new();
    let s = spec("feed-a", "https://a");
    let hash = s.spec_hash();
    store.upsert_desired(s);
    store.insert_actual(running("feed-a", &hash));

    let tracked = store.tracked();
    assert_eq!(tracked.read().get("feed-a").unwrap(), "id-feed-a");

    store.set_status("feed-a", WorkerStatus::Stopping);
    assert!(tracked.read().is_empty());

    store.set_absent("feed-a");
    assert!(tracked.read().is_empty());
}

#[test]
fn test_absent_removes_entry() {
    let mut store = StateStore::new();
    store.insert_actual(running("feed-a", "h"));
    let removed = store.set_absent("feed-a");
    assert_eq!(removed.unwrap().feed_name, "feed-a");
    assert_eq!(store.status("feed-a"), WorkerStatus::Absent);
    assert!(store.actual("feed-a").is_none());
}
