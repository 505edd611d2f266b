use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chat2api_core::error::CoreError;
use chat2api_core::retry::run_with_retry;

#[tokio::test]
async fn always_failing_attempt_runs_the_full_bound() {
    let calls = AtomicU32::new(0);
    let delay = Duration::from_millis(40);
    let started = Instant::now();

    let outcome: Result<(), _> = run_with_retry(
        |attempt_no| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(CoreError::Protocol(format!("boom {attempt_no}"))) }
        },
        3,
        delay,
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Two waits between three attempts.
    assert!(started.elapsed() >= delay * 2);
    match outcome {
        Err(CoreError::Protocol(message)) => assert_eq!(message, "boom 2"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn success_stops_retrying() {
    let calls = AtomicU32::new(0);
    let value = run_with_retry(
        |attempt_no| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt_no < 1 {
                    Err(CoreError::Challenge("transient".to_string()))
                } else {
                    Ok(attempt_no)
                }
            }
        },
        5,
        Duration::from_millis(5),
    )
    .await
    .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn quota_errors_surface_immediately() {
    let calls = AtomicU32::new(0);
    let outcome: Result<(), _> = run_with_retry(
        |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Quota("thinking quota exhausted".to_string())) }
        },
        5,
        Duration::from_millis(5),
    )
    .await;
    assert!(matches!(outcome, Err(CoreError::Quota(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
