use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

const CLEANUP_EVERY_REQUESTS: u64 = 256;

/// Sliding-window limiter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    requests_seen: AtomicU64,
}

impl RateLimiter {
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
            requests_seen: AtomicU64::new(0),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Records a request from `client`. Returns the seconds to wait when the
    /// client is over its budget; rejected requests are not recorded.
    pub async fn register(&self, client: &str) -> Result<(), u64> {
        self.register_at(client, Instant::now()).await
    }

    async fn register_at(&self, client: &str, now: Instant) -> Result<(), u64> {
        let mut hits = self.hits.lock().await;

        if self.requests_seen.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY_REQUESTS == 0 {
            hits.retain(|_, timestamps| {
                timestamps
                    .back()
                    .is_some_and(|last| now.duration_since(*last) < self.window)
            });
        }

        let timestamps = hits.entry(client.to_string()).or_default();
        while timestamps
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.max_requests {
            let retry_after = timestamps
                .front()
                .map(|first| self.window.saturating_sub(now.duration_since(*first)))
                .unwrap_or(self.window);
            return Err(retry_after.as_secs().max(1));
        }

        timestamps.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sixth_request_within_a_minute_is_rejected() {
        let limiter = RateLimiter::per_minute(5);
        let start = Instant::now();

        for offset in 0..5 {
            limiter
                .register_at("10.0.0.1", start + Duration::from_secs(offset))
                .await
                .unwrap();
        }

        let retry_after = limiter
            .register_at("10.0.0.1", start + Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(retry_after, 50);
    }

    #[tokio::test]
    async fn budget_recovers_as_the_window_slides() {
        let limiter = RateLimiter::per_minute(2);
        let start = Instant::now();

        limiter.register_at("a", start).await.unwrap();
        limiter.register_at("a", start + Duration::from_secs(30)).await.unwrap();
        assert!(limiter.register_at("a", start + Duration::from_secs(59)).await.is_err());
        limiter.register_at("a", start + Duration::from_secs(60)).await.unwrap();
        assert!(limiter.register_at("a", start + Duration::from_secs(61)).await.is_err());
    }

    #[tokio::test]
    async fn clients_are_limited_independently() {
        let limiter = RateLimiter::per_minute(1);
        let now = Instant::now();

        limiter.register_at("a", now).await.unwrap();
        assert!(limiter.register_at("a", now).await.is_err());
        limiter.register_at("b", now).await.unwrap();
    }

    #[tokio::test]
    async fn zero_budget_rejects_everything() {
        let limiter = RateLimiter::per_minute(0);
        assert_eq!(limiter.register("a").await, Err(60));
    }
}
