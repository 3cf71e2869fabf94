mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use field_cache::prelude::*;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_calls_execute_once() -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(cache_with(memory(false)));
    let handle = cache.define_policy(FieldIdentity::new("Query", "user"), PolicyConfig::new().ttl(10.0))?;
    let executions = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        let handle = handle.clone();
        let compute = numbered(&executions, Duration::from_millis(100));
        tasks.push(tokio::spawn(async move {
            cache
                .invoke(&handle, call().with_args(json!({"id": 7})), compute)
                .await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await?.map_err(|e| e.to_string())?);
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == &json!({"n": 1})));

    let report = cache.flush_report();
    let user = counters(&report, "Query", "user");
    assert_eq!(user.misses, 1);
    assert_eq!(user.dedupes, 9);
    assert_eq!(user.hits, 0);
    assert_eq!(cache.in_flight(), 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_share_the_failure() -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(cache_with(memory(false)));
    let handle = cache.define_policy(FieldIdentity::new("Query", "broken"), PolicyConfig::new().ttl(10.0))?;
    let executions = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let cache = Arc::clone(&cache);
        let handle = handle.clone();
        let compute = failing(&executions, "upstream unavailable");
        tasks.push(tokio::spawn(async move { cache.invoke(&handle, call(), compute).await }));
    }

    for task in tasks {
        let err = task.await?.unwrap_err();
        assert_eq!(err.to_string(), "upstream unavailable");
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Failures are never cached.
    let value = cache
        .invoke(&handle, call(), returning(&executions, json!("ok")))
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(value, json!("ok"));
    assert_eq!(counters(&cache.flush_report(), "Query", "broken").misses, 2);

    Ok(())
}

#[tokio::test]
async fn different_arguments_are_not_coalesced() -> Result<(), Box<dyn std::error::Error>> {
    let cache = cache_with(memory(false));
    let handle = cache.define_policy(FieldIdentity::new("Query", "user"), PolicyConfig::new().ttl(10.0))?;
    let executions = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
        cache.invoke(
            &handle,
            call().with_args(json!({"id": 1})),
            numbered(&executions, Duration::from_millis(50))
        ),
        cache.invoke(
            &handle,
            call().with_args(json!({"id": 2})),
            numbered(&executions, Duration::from_millis(50))
        ),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_ne!(a.unwrap(), b.unwrap());
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    Ok(())
}

#[tokio::test]
async fn abandoned_caller_still_populates_the_cache() -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(cache_with(memory(false)));
    let handle = cache.define_policy(FieldIdentity::new("Query", "slow"), PolicyConfig::new().ttl(10.0))?;
    let executions = Arc::new(AtomicUsize::new(0));

    let task = {
        let cache = Arc::clone(&cache);
        let handle = handle.clone();
        let compute = numbered(&executions, Duration::from_millis(100));
        tokio::spawn(async move { cache.invoke(&handle, call(), compute).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();

    settle(&cache).await;

    let value = cache
        .invoke(&handle, call(), numbered(&executions, Duration::ZERO))
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(value, json!({"n": 1}));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    Ok(())
}
