use pacer::persistence::StateStore;
use pacer::token_bucket::TokenBucket;
use pacer::{
    Dispatcher, DispatcherOptions, EndpointConfigs, LimitError, LimiterConfig, LimiterRegistry,
    Priority,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_token_bucket_edge_cases() {
    // Zero refill rate never becomes satisfiable
    let bucket = TokenBucket::new(10, 0.0);
    assert!(bucket.try_acquire(5));
    assert_eq!(bucket.estimated_wait(10), Duration::MAX);

    // Very small time differences
    let bucket = TokenBucket::new(100, 10.0);
    assert!(bucket.try_acquire(50));
    let available = bucket.available_tokens();
    assert!(available >= 50.0 && available <= 100.0);

    // Floating point accumulation stays under capacity
    let bucket = TokenBucket::new(1000, 0.1);
    for _ in 0..10 {
        bucket.release(1);
    }
    assert!(bucket.available_tokens() <= 1000.0);
}

#[tokio::test]
async fn test_concurrent_acquire_scenario() {
    let bucket = Arc::new(TokenBucket::new(5, 0.0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.try_acquire(1) })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(bucket.available_tokens(), 0.0);
}

#[tokio::test]
async fn test_slow_upstream_lowers_rate_within_bounds() {
    let config = LimiterConfig {
        tokens_per_second: 5.0,
        min_rate: 1.0,
        max_rate: 10.0,
        target_response_time: Duration::from_millis(50),
        ..Default::default()
    };
    let dispatcher = Dispatcher::new("slow", config, DispatcherOptions::default()).unwrap();

    for _ in 0..20 {
        dispatcher.record_response(Duration::from_millis(200), true, Priority::Normal);
    }
    dispatcher.maybe_adjust(Instant::now());

    let rate = dispatcher.current_rate();
    assert!(rate < 5.0);
    assert!(rate >= 1.0);
}

#[tokio::test]
async fn test_fast_upstream_raises_rate_within_bounds() {
    let config = LimiterConfig {
        tokens_per_second: 9.5,
        min_rate: 1.0,
        max_rate: 10.0,
        target_response_time: Duration::from_millis(100),
        ..Default::default()
    };
    let dispatcher = Dispatcher::new("fast", config, DispatcherOptions::default()).unwrap();

    for _ in 0..20 {
        dispatcher.record_response(Duration::from_millis(50), true, Priority::High);
    }
    dispatcher.maybe_adjust(Instant::now());

    assert_eq!(dispatcher.current_rate(), 10.0);
}

#[tokio::test]
async fn test_learned_rate_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = LimiterConfig {
        tokens_per_second: 5.0,
        min_rate: 1.0,
        max_rate: 10.0,
        target_response_time: Duration::from_millis(100),
        ..Default::default()
    };
    let options = || DispatcherOptions {
        state_store: Some(StateStore::for_endpoint(dir.path(), "lookup")),
        ..Default::default()
    };

    let first = Dispatcher::new("lookup", config.clone(), options()).unwrap();
    for _ in 0..20 {
        first.record_response(Duration::from_millis(500), true, Priority::Normal);
    }
    first.maybe_adjust(Instant::now()).unwrap();
    let learned = first.current_rate();
    first.stop().await;

    let second = Dispatcher::new("lookup", config, options()).unwrap();
    assert!((second.current_rate() - learned).abs() < 1e-9);
    assert!((second.current_rate() - 5.0).abs() > 0.1);
    assert_eq!(second.stats().rate_changes, 1);
}

#[tokio::test]
async fn test_corrupt_state_falls_back_to_default_rate() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lookup.json"), "not json at all").unwrap();

    let registry = LimiterRegistry::new(EndpointConfigs::default()).with_state_dir(dir.path());
    let limiter = registry.limiter("lookup").unwrap();
    assert_eq!(limiter.current_rate(), 10.0);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_queued_request_times_out() {
    let mut rules = EndpointConfigs::default();
    rules.set_rule(
        "starved",
        LimiterConfig {
            tokens_per_second: 0.0,
            min_rate: 0.0,
            bucket_capacity: 1,
            ..Default::default()
        },
    );
    let registry = LimiterRegistry::new(rules);
    let limiter = registry.limiter("starved").unwrap();
    assert!(limiter.acquire(Priority::High, None, None).await);

    let started = Instant::now();
    let admitted = limiter
        .acquire_within(Priority::Background, Duration::from_millis(100))
        .await;

    assert!(!admitted);
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(limiter.queue_len(Priority::Background), 0);
    assert_eq!(limiter.stats().timed_out, 1);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_wrapper_distinguishes_limit_from_failure() {
    let mut rules = EndpointConfigs::default();
    rules.set_rule(
        "one-shot",
        LimiterConfig {
            tokens_per_second: 0.0,
            min_rate: 0.0,
            bucket_capacity: 1,
            ..Default::default()
        },
    );
    let registry = LimiterRegistry::new(rules);

    let failure = registry
        .run_with_limit("one-shot", Priority::Critical, None, || async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "reset"))
        })
        .await
        .unwrap_err();
    assert!(matches!(failure, LimitError::Operation(_)));

    let deadline = Instant::now() + Duration::from_millis(30);
    let limited = registry
        .run_with_limit("one-shot", Priority::Critical, Some(deadline), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();
    assert!(limited.is_rate_limited());

    let status = registry.limiter("one-shot").unwrap().get_status();
    assert_eq!(status.stats.failures, 1);
    assert_eq!(status.stats.admitted, 1);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_sustained_load_is_paced() {
    let mut rules = EndpointConfigs::default();
    rules.set_rule(
        "paced",
        LimiterConfig {
            tokens_per_second: 50.0,
            bucket_capacity: 5,
            ..Default::default()
        },
    );
    let registry = Arc::new(LimiterRegistry::new(rules).with_idle_delay(Duration::from_millis(2)));

    let started = Instant::now();
    let handles: Vec<_> = (0..15)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .run_with_limit("paced", Priority::Normal, None, || async {
                        Ok::<_, std::io::Error>(())
                    })
                    .await
                    .is_ok()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    // 5 from the initial burst, 10 more at 50/s
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(registry.limiter("paced").unwrap().stats().admitted, 15);
    registry.shutdown_all().await;
}
