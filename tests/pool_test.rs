use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gathernet::ClientPool;

fn ua_headers() -> DashMap<String, String> {
    let headers = DashMap::new();
    headers.insert("User-Agent".to_string(), "chrome".to_string());
    headers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn lease_count_never_exceeds_pool_size_under_load() {
    const POOL_SIZE: usize = 5;
    const CALLERS: usize = 50;

    let pool = Arc::new(ClientPool::new(ua_headers(), "", 30, false, POOL_SIZE).unwrap());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let pool = Arc::clone(&pool);
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire_within(Duration::from_secs(10)).await.unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(lease);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= POOL_SIZE, "peak concurrent leases was {peak}");
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_pool_times_out_close_to_the_budget() {
    let pool = ClientPool::new(ua_headers(), "", 30, false, 1).unwrap();
    let held = pool.acquire_within(Duration::from_secs(1)).await.unwrap();

    let started = std::time::Instant::now();
    let result = pool.acquire_within(Duration::from_millis(300)).await;
    let waited = started.elapsed();

    assert!(result.unwrap_err().is_no_free_client());
    assert!(waited >= Duration::from_millis(250), "returned early: {waited:?}");
    assert!(waited < Duration::from_secs(2), "returned late: {waited:?}");
    drop(held);
}
