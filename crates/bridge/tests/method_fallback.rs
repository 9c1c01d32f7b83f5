//! Device bridging and adaptive method selection, end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bridge::access::{AccessChannel, AccessMethod, AccessResult, BridgeError, ErrorCode};
use bridge::{RetryManager, RetryPolicy, ScanProvider};
use common::{retry_manager, scripted_bridge};
use tempfile::TempDir;

const A: AccessMethod = AccessMethod::DirectFilesystem;
const B: AccessMethod = AccessMethod::ShellAutomation;
const C: AccessMethod = AccessMethod::MetadataQuery;

fn fail(method: AccessMethod) -> AccessResult {
    AccessResult::failed(
        method,
        "",
        Duration::from_millis(5),
        &BridgeError::transport("scripted"),
    )
}

// =============================================================================
// Bridging
// =============================================================================

#[test]
fn test_unknown_device_never_yields_channel() {
    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2), (C, 1)], retry_manager());

    let err = bridge.detect_and_bridge("Dishwasher").err().unwrap();
    assert!(err.is(ErrorCode::DeviceNotFound));
    assert!(channels.values().all(|c| !c.is_connected()));

    let err = bridge.get_device_path("Dishwasher", "", "").unwrap_err();
    assert!(err.is(ErrorCode::DeviceNotFound));
}

#[test]
fn test_bridge_prefers_highest_priority() {
    let retry = retry_manager();
    let (bridge, _channels) = scripted_bridge(&[(C, 1), (A, 3), (B, 2)], retry.clone());

    let channel = bridge.detect_and_bridge("Camera").unwrap();
    assert_eq!(channel.method(), A);
    assert_eq!(bridge.get_device_path("Camera", "", "").unwrap(), "direct_filesystem://camera");

    let stats = retry.method_statistics(A).unwrap();
    assert_eq!(stats.success_count, 1);
    assert!(retry.method_statistics(B).is_none());
}

// =============================================================================
// Scan with retry
// =============================================================================

#[test]
fn test_absent_device_never_excludes_methods() {
    let retry = retry_manager();
    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2)], retry.clone());
    channels[&A].add_file("DCIM/IMG_0001.JPG", vec![1; 10]);

    for _ in 0..11 {
        let err = retry.scan_with_retry(&bridge, "Unplugged", "").unwrap_err();
        assert!(err.is(ErrorCode::DeviceNotFound));
    }
    assert!(retry.method_statistics(A).is_none());
    assert!(retry.method_statistics(B).is_none());
    assert!(!retry.should_skip(A));
    assert_eq!(channels[&A].list_calls(), 0);

    let outcome = retry.scan_with_retry_detailed(&bridge, "Camera", "").unwrap();
    assert_eq!(outcome.method, A);
    assert_eq!(outcome.entries.len(), 1);
}

#[test]
fn test_falls_through_to_lowest_priority_method() {
    let retry = retry_manager();
    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2), (C, 1)], retry.clone());
    channels[&A].fail_listing(ErrorCode::TransportFailure);
    channels[&B].fail_listing(ErrorCode::Timeout);
    channels[&C].add_file("DCIM/IMG_0001.JPG", vec![1; 10]);
    channels[&C].add_file("DCIM/IMG_0002.JPG", vec![2; 20]);

    let outcome = retry.scan_with_retry_detailed(&bridge, "Camera", "").unwrap();
    assert_eq!(outcome.method, C);
    let names: Vec<&str> = outcome.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["IMG_0001.JPG", "IMG_0002.JPG"]);

    let a = retry.method_statistics(A).unwrap();
    let b = retry.method_statistics(B).unwrap();
    let c = retry.method_statistics(C).unwrap();
    assert_eq!((a.success_count, a.failure_count), (0, 1));
    assert_eq!((b.success_count, b.failure_count), (0, 1));
    assert_eq!((c.success_count, c.failure_count), (1, 0));
}

#[test]
fn test_chronically_failing_method_is_never_invoked() {
    let retry = retry_manager();
    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2)], retry.clone());
    channels[&B].add_file("a.jpg", vec![0; 4]);

    for _ in 0..11 {
        retry.record(&fail(A));
    }
    assert!(retry.should_skip(A));

    let entries = retry.scan_with_retry(&bridge, "Camera", "").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(channels[&A].list_calls(), 0);
    assert_eq!(channels[&B].list_calls(), 1);
}

#[test]
fn test_early_failures_do_not_disable_method() {
    let retry = retry_manager();
    let (bridge, channels) = scripted_bridge(&[(A, 3)], retry.clone());
    channels[&A].add_file("a.jpg", vec![0; 4]);

    for _ in 0..10 {
        retry.record(&fail(A));
    }
    let before = retry.method_statistics(A).unwrap().success_rate;
    assert!(!retry.should_skip(A));

    retry.scan_with_retry(&bridge, "Camera", "").unwrap();

    let after = retry.method_statistics(A).unwrap();
    assert!(after.success_rate > before);
    assert_eq!(after.success_count, 1);
    assert!(!retry.should_skip(A));
}

#[test]
fn test_exhaustion_reports_every_method() {
    let retry = retry_manager();
    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2), (C, 1)], retry.clone());
    for channel in channels.values() {
        channel.fail_listing(ErrorCode::TransportFailure);
    }

    let err = retry.scan_with_retry(&bridge, "Camera", "").unwrap_err();
    assert!(err.is(ErrorCode::TransportFailure));
    let context = err.context();
    assert!(context.contains_key("attempt.1.direct_filesystem"));
    assert!(context.contains_key("attempt.2.shell_automation"));
    assert!(context.contains_key("attempt.3.metadata_query"));
    assert!(context["statistics.metadata_query"].contains("failure=1"));
}

#[test]
fn test_statistics_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("method_stats.json");

    {
        let retry = Arc::new(RetryManager::with_persistence(RetryPolicy::default(), &path));
        for _ in 0..11 {
            retry.record(&fail(A));
        }
        retry.save().unwrap();
    }

    let retry = Arc::new(RetryManager::with_persistence(RetryPolicy::default(), &path));
    assert!(retry.should_skip(A));

    let (bridge, channels) = scripted_bridge(&[(A, 3), (B, 2)], retry.clone());
    channels[&B].add_file("a.jpg", vec![0; 4]);
    assert_eq!(bridge.preferred_methods(), vec![A, B]);

    let outcome = retry.scan_with_retry_detailed(&bridge, "Camera", "").unwrap();
    assert_eq!(outcome.method, B);
    assert_eq!(channels[&A].list_calls(), 0);
}
