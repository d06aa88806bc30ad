//! End-to-end scenarios across the rate limiter, retry helper, circuit breaker
//! and TTL cache.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aias_guard::cache::TtlCache;
use aias_guard::config::{GuardConfig, RemoteStoreConfig};
use aias_guard::error::CircuitBreakerError;
use aias_guard::ratelimit::{HttpKvStore, RateLimitConfig, RateLimitRules, RateLimiter};
use aias_guard::resilience::{retry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn limit(window_ms: u64, max_requests: u32) -> RateLimitConfig {
    RateLimitConfig {
        window_ms,
        max_requests,
    }
}

fn network_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "network unreachable")
}

#[tokio::test]
async fn test_four_calls_against_limit_of_three() {
    let limiter = RateLimiter::new();
    let config = limit(60_000, 3);

    let mut decisions = Vec::new();
    for _ in 0..4 {
        let r = limiter.check_rate_limit("/api/test", "user1", &config).await;
        decisions.push((r.allowed, r.remaining));
    }

    assert_eq!(decisions, vec![(true, 2), (true, 1), (true, 0), (false, 0)]);
}

#[tokio::test]
async fn test_window_expiry_resets_budget() {
    let limiter = RateLimiter::new();
    let config = limit(50, 2);

    assert!(limiter.check_rate_limit("/api/chat", "u", &config).await.allowed);
    assert!(limiter.check_rate_limit("/api/chat", "u", &config).await.allowed);
    assert!(!limiter.check_rate_limit("/api/chat", "u", &config).await.allowed);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let r = limiter.check_rate_limit("/api/chat", "u", &config).await;
    assert!(r.allowed);
    assert_eq!(r.remaining, 1);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let limiter = RateLimiter::new();
    let config = limit(60_000, 1);

    assert!(limiter.check_rate_limit("/api/a", "alice", &config).await.allowed);
    assert!(!limiter.check_rate_limit("/api/a", "alice", &config).await.allowed);

    assert!(limiter.check_rate_limit("/api/a", "bob", &config).await.allowed);
    assert!(limiter.check_rate_limit("/api/b", "alice", &config).await.allowed);
}

#[tokio::test]
async fn test_route_rules_pick_longest_prefix() {
    let rules = RateLimitRules::new(limit(60_000, 100)).with_route("/api/auth", limit(60_000, 1));
    let limiter = RateLimiter::new().with_rules(rules);

    assert!(limiter.check_route("/api/auth/login", "ip").await.allowed);
    assert!(!limiter.check_route("/api/auth/login", "ip").await.allowed);

    let r = limiter.check_route("/api/generate", "ip").await;
    assert!(r.allowed);
    assert_eq!(r.remaining, 99);
}

#[tokio::test]
async fn test_unreachable_remote_store_fails_over_to_memory() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = GuardConfig {
        remote_store: RemoteStoreConfig {
            url: Some(server.uri()),
            token: Some("token".to_string()),
        },
        ..GuardConfig::default()
    };
    let limiter = RateLimiter::from_config(&config).unwrap();
    assert!(limiter.has_remote_store());

    let config = limit(60_000, 2);
    let first = limiter.check_rate_limit("/api/x", "u", &config).await;
    let second = limiter.check_rate_limit("/api/x", "u", &config).await;
    let third = limiter.check_rate_limit("/api/x", "u", &config).await;

    assert_eq!((first.allowed, first.remaining), (true, 1));
    assert_eq!((second.allowed, second.remaining), (true, 0));
    assert!(!third.allowed);
}

#[tokio::test]
async fn test_remote_store_counts_across_limiters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": r#"{"count":5,"resetTime":9999999999999}"#
        })))
        .mount(&server)
        .await;

    let store = Arc::new(HttpKvStore::new(server.uri(), "token").unwrap());
    let limiter = RateLimiter::new().with_remote_store(store);

    let r = limiter.check_rate_limit("/api/x", "u", &limit(60_000, 5)).await;
    assert!(!r.allowed);
    assert_eq!(r.remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_two_network_errors() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let retries = Arc::new(AtomicU32::new(0));
    let observed = Arc::clone(&retries);

    let config = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(100),
        backoff_multiplier: 2.0,
        ..RetryConfig::default()
    }
    .on_retry(move |_, _| {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    let start = tokio::time::Instant::now();
    let result = retry(
        move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(network_error())
            } else {
                Ok("ok")
            }
        },
        config,
    )
    .await;

    assert_eq!(assert_ok!(result), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(retries.load(Ordering::SeqCst), 2);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(310));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_returns_last_error() {
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let result: Result<(), io::Error> = retry(
        move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(io::Error::new(io::ErrorKind::TimedOut, format!("timeout #{}", n)))
        },
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(10),
            ..RetryConfig::default()
        },
    )
    .await;

    let error = assert_err!(result);
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    assert_eq!(error.to_string(), "timeout #4");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_stops_after_one_attempt() {
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let result: Result<(), io::Error> = retry(
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::InvalidInput, "bad prompt"))
        },
        RetryConfig {
            max_attempts: 10,
            ..RetryConfig::default()
        },
    )
    .await;

    assert_err!(result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_protects_failing_dependency() {
    let breaker = CircuitBreaker::new(
        "provider",
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 1_000,
        },
    );
    let calls = AtomicU32::new(0);
    let calls = &calls;

    for _ in 0..2 {
        let result: Result<(), _> = breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(network_error())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), CircuitBreakerError<io::Error>> =
        breaker.call(|| async { Ok(()) }).await;
    assert!(assert_err!(rejected).is_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let recovered: Result<u32, CircuitBreakerError<io::Error>> =
        breaker.call(|| async { Ok(7) }).await;
    assert_eq!(assert_ok!(recovered), 7);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl_and_overwrite() {
    let cache = TtlCache::new();

    cache.set("k", "v1".to_string(), Duration::from_secs(1));
    assert_eq!(cache.get("k").as_deref(), Some("v1"));

    cache.set("k", "v2".to_string(), Duration::from_secs(1));
    assert_eq!(cache.get("k").as_deref(), Some("v2"));

    tokio::time::advance(Duration::from_millis(1_100)).await;
    assert_eq!(cache.get("k"), None);
}

#[tokio::test]
async fn test_with_cache_wraps_retrying_fetch() {
    let cache: TtlCache<String> = TtlCache::new();
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let fetch = move || async move {
        retry(
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(network_error())
                } else {
                    Ok("models".to_string())
                }
            },
            RetryConfig {
                initial_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            },
        )
        .await
    };

    let first = cache.with_cache("models", fetch, Duration::from_secs(60)).await;
    let second = cache.with_cache("models", fetch, Duration::from_secs(60)).await;

    assert_eq!(assert_ok!(first), "models");
    assert_eq!(assert_ok!(second), "models");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
