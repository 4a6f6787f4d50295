use std::sync::Arc;

use anyhow::Result;
use dispatch_service::{
    clients::{
        circuit_breaker::BreakerRegistry,
        redis::RedisStore,
        store::SharedStore,
    },
    models::{
        circuit_breaker::{BreakerConfig, CircuitState},
        notification::Channel,
        vendor::Vendor,
    },
};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
};

const REDIS_PORT: ContainerPort = ContainerPort::Tcp(6379);

async fn start_redis() -> Result<(ContainerAsync<GenericImage>, RedisStore)> {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(REDIS_PORT)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_startup_timeout(std::time::Duration::from_secs(60))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(REDIS_PORT).await?;
    let store = RedisStore::connect(&format!("redis://{}:{}", host, port)).await?;

    Ok((container, store))
}

/// Test: Compare-and-swap only writes over the expected value
#[tokio::test]
#[ignore = "requires docker"]
async fn test_compare_and_swap() -> Result<()> {
    let (_container, store) = start_redis().await?;

    assert!(store.compare_and_swap("cas", None, "v1").await?);
    assert!(
        !store.compare_and_swap("cas", None, "v2").await?,
        "Key already exists"
    );
    assert!(
        !store.compare_and_swap("cas", Some("stale"), "v2").await?,
        "Expected value does not match"
    );
    assert!(store.compare_and_swap("cas", Some("v1"), "v2").await?);
    assert_eq!(store.get("cas").await?, Some("v2".to_string()));

    store.ping().await?;

    Ok(())
}

/// Test: Lists keep append order and are removed with delete
#[tokio::test]
#[ignore = "requires docker"]
async fn test_push_and_range() -> Result<()> {
    let (_container, store) = start_redis().await?;

    for attempt in ["a1", "a2", "a3"] {
        store.push("attempts", attempt, 60).await?;
    }
    assert_eq!(store.range("attempts").await?, vec!["a1", "a2", "a3"]);

    store.delete("attempts").await?;
    assert!(store.range("attempts").await?.is_empty());

    Ok(())
}

/// Test: Two processes sharing Redis see the same breaker state
#[tokio::test]
#[ignore = "requires docker"]
async fn test_breaker_state_is_shared_across_processes() -> Result<()> {
    let (_container, store) = start_redis().await?;
    let store: Arc<dyn SharedStore> = Arc::new(store);

    let process_a = BreakerRegistry::new(Arc::clone(&store), BreakerConfig::default());
    let process_b = BreakerRegistry::new(store, BreakerConfig::default());

    let breaker_a = process_a.for_vendor(Vendor::Iterable, Channel::Email, "default");
    for _ in 0..5 {
        breaker_a.record_failure().await?;
    }

    let breaker_b = process_b.for_vendor(Vendor::Iterable, Channel::Email, "default");
    assert_eq!(breaker_b.get_state().await?.state, CircuitState::Open);
    assert!(!breaker_b.is_available().await?);

    Ok(())
}
