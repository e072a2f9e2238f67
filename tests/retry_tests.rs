use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Result, anyhow};
use eval_notifier::{models::retry::RetryConfig, utils::retry_with_backoff};
use tokio::time::Instant;

fn quick_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 20,
        max_delay_ms: 60,
        backoff_multiplier: 2,
    }
}

/// Test: A first-try success runs the operation once
#[tokio::test]
async fn test_success_runs_once() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let value = retry_with_backoff(&quick_retry(3), "register_event", || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(42)
        }
    })
    .await?;

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: Transient failures are retried until the operation succeeds
#[tokio::test]
async fn test_transient_failures_recover() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let value = retry_with_backoff(&quick_retry(5), "register_event", || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("connection reset"))
            } else {
                Ok("registered")
            }
        }
    })
    .await?;

    assert_eq!(value, "registered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: The last error is returned once attempts run out
#[tokio::test]
async fn test_exhausted_attempts_return_error() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = retry_with_backoff(&quick_retry(4), "register_event", || {
        let counter = counter.clone();
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(format!("attempt {} refused", attempt))
        }
    })
    .await;

    assert_eq!(result, Err("attempt 4 refused".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    Ok(())
}

/// Test: Backoff grows but never waits past the cap
#[tokio::test]
async fn test_backoff_respects_cap() -> Result<()> {
    let config = quick_retry(5);
    let start = Instant::now();
    let times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let recorded = times.clone();

    let _ = retry_with_backoff(&config, "register_event", || {
        let recorded = recorded.clone();
        async move {
            recorded.lock().await.push(start.elapsed().as_millis());
            Err::<(), _>(anyhow!("unavailable"))
        }
    })
    .await;

    let times = times.lock().await;
    assert_eq!(times.len(), 5);

    let total = times[times.len() - 1];
    // 20 + 40 + 60 + 60 with at most 10% jitter each way.
    assert!(total >= 155, "Backoff finished too early: {}ms", total);

    for pair in times.windows(2) {
        let delay = pair[1] - pair[0];
        assert!(
            delay <= (config.max_delay_ms * 12 / 10) as u128 + 20,
            "Delay {}ms exceeds the cap",
            delay
        );
    }

    Ok(())
}
