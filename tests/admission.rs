use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rate_admission::ratelimit::{
    AdmissionBackend, RecordPolicy, RedisCounterStore, SlidingWindowConfig, SlidingWindowLimiter,
    StoreCounter,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

#[test]
fn steady_arrival_is_never_denied() {
    let limiter = SlidingWindowLimiter::from_durations(ms(100), ms(1000), 10).unwrap();
    let t0 = Instant::now();

    // One request per 100ms never puts more than 10 in any trailing second
    for i in 0..100 {
        assert!(limiter.allow_at("steady", t0 + ms(i * 100)), "request {i}");
    }
}

#[test]
fn burst_then_drain_in_real_time() {
    let limiter = SlidingWindowLimiter::from_durations(ms(50), ms(200), 5).unwrap();

    for _ in 0..5 {
        assert!(limiter.allow("burst"));
    }
    assert!(!limiter.allow("burst"));

    thread::sleep(ms(250));
    assert!(limiter.allow("burst"));
}

#[test]
fn reference_scenario_with_sleeps() {
    let limiter = SlidingWindowLimiter::from_durations(ms(100), ms(1000), 10).unwrap();
    let key = "127.0.0.1";

    for _ in 0..5 {
        assert!(!limiter.is_limited(key));
    }
    assert_eq!(limiter.aggregate(key), Some(5));

    thread::sleep(ms(100));
    for _ in 0..5 {
        assert!(!limiter.is_limited(key));
    }
    assert_eq!(limiter.aggregate(key), Some(10));
    assert!(limiter.is_limited(key));

    thread::sleep(ms(1000));
    for _ in 0..7 {
        assert!(!limiter.is_limited(key));
    }
    let slots = limiter.slots(key);
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].count(), 7);
}

#[test]
fn concurrent_callers_never_exceed_budget() {
    let limiter = SlidingWindowLimiter::from_durations(ms(100), ms(60_000), 50).unwrap();
    let admitted = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                for _ in 0..100 {
                    if limiter.allow("hot") {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(admitted.load(Ordering::Relaxed), 50);
    // Denied requests are recorded too
    assert_eq!(limiter.aggregate("hot"), Some(1600));
}

#[test]
fn concurrent_callers_with_admitted_only_policy() {
    let limiter = SlidingWindowLimiter::new(SlidingWindowConfig {
        slot_duration_ms: 100,
        window_duration_ms: 60_000,
        max_requests: 50,
        record_policy: RecordPolicy::AdmittedOnly,
        sweep_interval_ms: None,
    })
    .unwrap();
    let admitted = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                for _ in 0..100 {
                    if limiter.allow("hot") {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(admitted.load(Ordering::Relaxed), 50);
    assert_eq!(limiter.aggregate("hot"), Some(50));
}

#[test]
fn concurrent_keys_do_not_interfere() {
    let limiter = SlidingWindowLimiter::from_durations(ms(100), ms(60_000), 20).unwrap();

    thread::scope(|s| {
        for t in 0..8 {
            let limiter = &limiter;
            s.spawn(move || {
                let key = format!("user-{t}");
                let admitted = (0..40).filter(|_| limiter.allow(&key)).count();
                assert_eq!(admitted, 20);
            });
        }
    });

    assert_eq!(limiter.key_count(), 8);
}

#[tokio::test]
async fn shared_limiter_across_tasks() {
    let limiter = Arc::new(SlidingWindowLimiter::from_durations(ms(100), ms(60_000), 30).unwrap());

    let tasks = (0..10).map(|_| {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut admitted: usize = 0;
            for _ in 0..10 {
                if AdmissionBackend::allow(&*limiter, "shared").await.unwrap() {
                    admitted += 1;
                }
            }
            admitted
        })
    });

    let total: usize = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();
    assert_eq!(total, 30);
}

#[tokio::test]
async fn redis_store_counter_enforces_budget() {
    let Some(url) = redis_url() else {
        return;
    };

    let store = Arc::new(RedisCounterStore::connect(&url).await.unwrap());
    let prefix = format!("rate_admission_test_{}_", rand::random::<u64>());
    let counter = StoreCounter::new(store, 3).with_prefix(prefix);

    let bucket = counter.bucket_key("user");
    let mut admitted = 0;
    for _ in 0..5 {
        if counter.allow("user").await.unwrap() {
            admitted += 1;
        }
    }

    if counter.bucket_key("user") == bucket {
        assert_eq!(admitted, 3);
    }

    // Buckets expire after a second
    tokio::time::sleep(ms(2100)).await;
    assert!(counter.allow("user").await.unwrap());
}

#[tokio::test]
async fn redis_bucket_gets_expiry_with_first_increment() {
    let Some(url) = redis_url() else {
        return;
    };

    let store = Arc::new(RedisCounterStore::connect(&url).await.unwrap());
    let prefix = format!("rate_admission_test_{}_", rand::random::<u64>());
    let counter = StoreCounter::new(store, 3)
        .with_prefix(prefix)
        .with_expiry(ms(5000));

    let bucket = counter.bucket_key("user");
    assert!(counter.allow("user").await.unwrap());

    let mut connection = redis::Client::open(url.as_str())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let ttl: i64 = redis::cmd("PTTL")
        .arg(&bucket)
        .query_async(&mut connection)
        .await
        .unwrap();

    if counter.bucket_key("user") == bucket {
        assert!(ttl > 0 && ttl <= 5000, "ttl {ttl}");
    }
}
