//! Endpoint failover integration tests

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dirgate::clock::ManualClock;
use dirgate::failover::UrlFailoverTracker;

fn tracker(urls: &[&str], retry: Duration) -> (Arc<UrlFailoverTracker>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let tracker = UrlFailoverTracker::new(
        "corp",
        urls.iter().map(|u| (*u).to_string()).collect(),
        retry,
        clock.clone(),
    )
    .unwrap();
    (Arc::new(tracker), clock)
}

#[test]
fn test_two_endpoint_scenario() {
    let (tracker, clock) = tracker(&["ldap://a", "ldap://b"], Duration::from_millis(60_000));

    assert_eq!(tracker.current_url().as_deref(), Some("ldap://a"));
    assert_eq!(
        tracker.report_failure_and_advance(Some("ldap://a")).as_deref(),
        Some("ldap://b")
    );
    assert_eq!(tracker.report_failure_and_advance(Some("ldap://b")), None);
    assert_eq!(tracker.current_url(), None);

    clock.advance(Duration::from_secs(61));
    assert_eq!(
        tracker.report_failure_and_advance(None).as_deref(),
        Some("ldap://a")
    );
    let status = tracker.status();
    assert!(status[0].current);
    assert_eq!(status[0].blacklisted_since_ms, None);
    // b was not reached by the scan, so its blacklist stays until it is
    assert!(status[1].blacklisted_since_ms.is_some());
}

#[test]
fn test_probe_before_timeout_finds_nothing() {
    let (tracker, clock) = tracker(&["ldap://a"], Duration::from_secs(60));
    assert_eq!(tracker.report_failure_and_advance(Some("ldap://a")), None);

    clock.advance(Duration::from_secs(60));
    assert_eq!(tracker.report_failure_and_advance(None), None);
    clock.advance(Duration::from_millis(1));
    assert_eq!(
        tracker.report_failure_and_advance(None).as_deref(),
        Some("ldap://a")
    );
}

#[test]
fn test_first_eligible_endpoint_wins() {
    let (tracker, _clock) = tracker(&["ldap://a", "ldap://b", "ldap://c"], Duration::from_secs(60));
    assert_eq!(
        tracker.report_failure_and_advance(Some("ldap://a")).as_deref(),
        Some("ldap://b")
    );
    assert_eq!(
        tracker.report_failure_and_advance(Some("ldap://b")).as_deref(),
        Some("ldap://c")
    );
}

#[test]
fn test_stale_report_changes_nothing() {
    let (tracker, _clock) = tracker(&["ldap://a", "ldap://b"], Duration::from_secs(60));
    let before = tracker.status();

    assert_eq!(
        tracker.report_failure_and_advance(Some("ldap://b")).as_deref(),
        Some("ldap://a")
    );
    // None is stale too while an endpoint is preferred
    assert_eq!(
        tracker.report_failure_and_advance(None).as_deref(),
        Some("ldap://a")
    );
    assert_eq!(tracker.status(), before);
}

#[test]
fn test_concurrent_reports_advance_once() {
    let (tracker, _clock) = tracker(&["ldap://a", "ldap://b", "ldap://c"], Duration::from_secs(60));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.report_failure_and_advance(Some("ldap://a")))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().as_deref(), Some("ldap://b"));
    }
    assert_eq!(tracker.current_url().as_deref(), Some("ldap://b"));
    assert!(tracker.status()[2].blacklisted_since_ms.is_none());
}

#[test]
fn test_retry_timeout_is_reloadable() {
    let (tracker, clock) = tracker(&["ldap://a"], Duration::from_secs(600));
    tracker.report_failure_and_advance(Some("ldap://a"));

    tracker.set_retry_timeout(Duration::from_secs(5));
    clock.advance(Duration::from_secs(6));
    assert_eq!(
        tracker.report_failure_and_advance(None).as_deref(),
        Some("ldap://a")
    );
}

#[test]
fn test_empty_url_list_is_a_config_error() {
    let result = UrlFailoverTracker::new("x", Vec::new(), Duration::from_secs(1), Arc::new(ManualClock::new(0)));
    assert!(matches!(result, Err(dirgate::Error::Config(_))));
}
