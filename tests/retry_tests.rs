use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Result, anyhow};
use dispatch_service::{models::retry::RetryConfig, utils::retry_with_backoff};
use tokio::{sync::Mutex, time::Instant};

fn config(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms,
        max_delay_ms,
        backoff_multiplier: 2,
    }
}

/// Records the elapsed milliseconds of every attempt of an always-failing call.
async fn attempt_offsets(config: &RetryConfig) -> Vec<u128> {
    let start = Instant::now();
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&offsets);

    let _ = retry_with_backoff(config, || {
        let recorder = Arc::clone(&recorder);
        async move {
            recorder.lock().await.push(start.elapsed().as_millis());
            Err::<(), _>(anyhow!("unreachable"))
        }
    })
    .await;

    let offsets = offsets.lock().await;
    offsets.clone()
}

/// Test: Successful operations complete without retry
#[tokio::test]
async fn test_successful_operation_no_retry() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&config(3, 100, 1000), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("rendered")
        }
    })
    .await?;

    assert_eq!(result, "rendered");
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "Should only attempt once");

    Ok(())
}

/// Test: Transient failures are retried until the call succeeds
#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&config(5, 100, 1000), || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("template service returned 503"))
            } else {
                Ok("rendered")
            }
        }
    })
    .await?;

    assert_eq!(result, "rendered");
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        3,
        "Should retry 2 times then succeed"
    );

    Ok(())
}

/// Test: Permanent failures stop after max_attempts and return the last error
#[tokio::test(start_paused = true)]
async fn test_permanent_failure_exhausts_retries() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&config(4, 50, 500), || {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow!("failure {}", n))
        }
    })
    .await;

    assert_eq!(
        result.unwrap_err().to_string(),
        "failure 3",
        "Last error is surfaced"
    );
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        4,
        "Should attempt exactly max_attempts times"
    );

    Ok(())
}

/// Test: Delays double per attempt within the jitter band
#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_timing() -> Result<()> {
    let config = config(4, 100, 1000);
    let offsets = attempt_offsets(&config).await;

    assert_eq!(offsets.len(), 4);
    assert_eq!(offsets[0], 0, "First attempt should be immediate");

    for i in 1..offsets.len() {
        let delay = offsets[i] - offsets[i - 1];
        let nominal = (config.initial_delay_ms * config.backoff_multiplier.pow(i as u32 - 1)) as u128;

        assert!(
            delay >= nominal * 8 / 10 && delay <= nominal * 12 / 10,
            "Delay {} was {}ms, expected about {}ms",
            i,
            delay,
            nominal
        );
    }

    Ok(())
}

/// Test: Delays never grow past max_delay_ms
#[tokio::test(start_paused = true)]
async fn test_max_delay_cap_respected() -> Result<()> {
    let config = config(6, 100, 300);
    let offsets = attempt_offsets(&config).await;

    assert_eq!(offsets.len(), 6);
    for i in 3..offsets.len() {
        let delay = offsets[i] - offsets[i - 1];
        assert!(
            delay <= (config.max_delay_ms * 12 / 10) as u128,
            "Delay {} of {}ms exceeds the cap",
            i,
            delay
        );
    }

    Ok(())
}

/// Test: Concurrent retrying operations keep independent state
#[tokio::test(start_paused = true)]
async fn test_retry_state_independence() -> Result<()> {
    let config = Arc::new(config(5, 50, 500));

    let failing_config = Arc::clone(&config);
    let failing = tokio::spawn(async move {
        retry_with_backoff(&failing_config, || async {
            Err::<String, _>(anyhow!("always fails"))
        })
        .await
    });

    let recovering_config = Arc::clone(&config);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let recovering = tokio::spawn(async move {
        retry_with_backoff(&recovering_config, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("not yet"))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await
    });

    let (failed, recovered) = tokio::join!(failing, recovering);

    assert!(failed?.is_err(), "First operation should fail");
    assert_eq!(recovered??, "recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    Ok(())
}
