use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::errors::TransportError;
use crate::transport::ThrottlePolicy;

/// Bounds the number of collector calls in flight and spaces their starts
/// by at least the policy delay
#[derive(Clone)]
pub struct Throttle {
    permits: Arc<Semaphore>,
    next_slot: Arc<Mutex<Instant>>,
    policy: ThrottlePolicy,
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(policy.max_calls.max(1))),
            next_slot: Arc::new(Mutex::new(Instant::now())),
            policy,
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Waits for a free call slot. The call is in flight until the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransportError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let start = {
            let mut next_slot = self.next_slot.lock().await;
            let start = (*next_slot).max(Instant::now());
            *next_slot = start + self.policy.delay();
            start
        };
        tokio::time::sleep_until(start).await;

        Ok(permit)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounds_calls_in_flight() {
        let throttle = Throttle::new(ThrottlePolicy {
            delay_ms: 0,
            max_batch: 10,
            max_calls: 2,
        });

        let first = throttle.acquire().await.unwrap();
        let _second = throttle.acquire().await.unwrap();
        assert_eq!(throttle.available(), 0);

        let third = tokio::time::timeout(Duration::from_millis(50), throttle.acquire()).await;
        assert!(third.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), throttle.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_spaces_call_starts() {
        let throttle = Throttle::new(ThrottlePolicy {
            delay_ms: 30,
            max_batch: 10,
            max_calls: 10,
        });

        let started = Instant::now();
        for _ in 0..3 {
            let _permit = throttle.acquire().await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
