/// Per-device admission control. Each device gets a sliding window of admission instants,
/// sharded by device id in a DashMap so concurrent publishes from different devices never
/// contend on a single lock. Rejected messages are dropped and only ever counted.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::gauge;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub admitted: u64,
    pub rejected: u64,
    pub in_window: usize,
}

struct DeviceRateState {
    admissions: VecDeque<Instant>,
    limit: u32,
    admitted: u64,
    rejected: u64,
    last_seen: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    devices: Arc<DashMap<String, DeviceRateState>>,
    limit: u32,
    window: Duration,
    overrides: Arc<HashMap<String, u32>>,
    idle_eviction: Duration,
    rejected_total: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(
        limit: u32,
        window: Duration,
        overrides: HashMap<String, u32>,
        idle_eviction: Duration,
    ) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            limit,
            window,
            overrides: Arc::new(overrides),
            idle_eviction,
            rejected_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.rate_limit_per_window,
            Duration::from_secs(config.rate_limit_window_secs),
            config.rate_limit_device_type_overrides.0.clone(),
            Duration::from_secs(config.rate_limit_idle_eviction_secs),
        )
    }

    fn limit_for(&self, device_type: Option<&str>) -> u32 {
        device_type
            .and_then(|t| self.overrides.get(t))
            .copied()
            .unwrap_or(self.limit)
    }

    pub fn admit(&self, device_id: &str, device_type: Option<&str>, now: Instant) -> Admission {
        let limit = self.limit_for(device_type);
        let mut state = self
            .devices
            .entry(device_id.to_owned())
            .or_insert_with(|| DeviceRateState {
                admissions: VecDeque::new(),
                limit,
                admitted: 0,
                rejected: 0,
                last_seen: now,
            });

        // A device may report its type on a later publish than the first one
        state.limit = limit;
        state.last_seen = now;

        while state
            .admissions
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.window)
        {
            state.admissions.pop_front();
        }

        if state.admissions.len() < state.limit as usize {
            state.admissions.push_back(now);
            state.admitted += 1;
            Admission::Allow
        } else {
            state.rejected += 1;
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            Admission::Reject
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn device_stats(&self, device_id: &str) -> Option<DeviceStats> {
        self.devices.get(device_id).map(|state| DeviceStats {
            admitted: state.admitted,
            rejected: state.rejected,
            in_window: state.admissions.len(),
        })
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.len()
    }

    /// Drops devices not seen for longer than the idle period, returns how many were evicted.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.devices.len();
        self.devices
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < self.idle_eviction);
        self.devices.shrink_to_fit();
        before.saturating_sub(self.devices.len())
    }

    /// Evicts idle devices on a randomized interval, so that replicas don't all scan
    /// their maps at the same moment. Needs to be spawned in a separate task.
    pub async fn clean_state(&self, token: CancellationToken) {
        let secs = rand::thread_rng().gen_range(60..70);
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.evict_idle(Instant::now());
                    if evicted > 0 {
                        debug!("evicted {} idle devices from the rate limiter", evicted);
                    }
                }
            }
        }
    }

    /// Reports the number of tracked devices to prometheus every 10 seconds,
    /// needs to be spawned in a separate task.
    pub async fn report_metrics(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    gauge!("telemetry_ingress_rate_limiter_devices").set(self.devices.len() as f64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            limit,
            Duration::from_secs(window_secs),
            HashMap::new(),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn burst_above_limit_is_rejected() {
        let limiter = limiter(100, 60);
        let start = Instant::now();

        // 110 messages spread over 10 seconds
        let mut allowed = 0;
        let mut rejected = 0;
        for i in 0..110u64 {
            let now = start + Duration::from_millis(i * 90);
            match limiter.admit("dev-1", None, now) {
                Admission::Allow => allowed += 1,
                Admission::Reject => rejected += 1,
            }
        }

        assert_eq!(allowed, 100);
        assert_eq!(rejected, 10);
        assert_eq!(limiter.rejected_total(), 10);
        assert_eq!(
            limiter.device_stats("dev-1"),
            Some(DeviceStats {
                admitted: 100,
                rejected: 10,
                in_window: 100
            })
        );
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(2, 60);
        let start = Instant::now();

        assert_eq!(limiter.admit("dev-1", None, start), Admission::Allow);
        assert_eq!(
            limiter.admit("dev-1", None, start + Duration::from_secs(30)),
            Admission::Allow
        );
        assert_eq!(
            limiter.admit("dev-1", None, start + Duration::from_secs(59)),
            Admission::Reject
        );

        // The first admission left the window
        assert_eq!(
            limiter.admit("dev-1", None, start + Duration::from_secs(60)),
            Admission::Allow
        );
        assert_eq!(
            limiter.admit("dev-1", None, start + Duration::from_secs(61)),
            Admission::Reject
        );
    }

    #[test]
    fn devices_are_independent() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert_eq!(limiter.admit("dev-1", None, now), Admission::Allow);
        assert_eq!(limiter.admit("dev-1", None, now), Admission::Reject);
        assert_eq!(limiter.admit("dev-2", None, now), Admission::Allow);
        assert_eq!(limiter.tracked_devices(), 2);
    }

    #[test]
    fn device_type_overrides_apply() {
        let overrides = HashMap::from([("thermostat".to_owned(), 1), ("camera".to_owned(), 3)]);
        let limiter = RateLimiter::new(
            2,
            Duration::from_secs(60),
            overrides,
            Duration::from_secs(600),
        );
        let now = Instant::now();

        assert_eq!(limiter.admit("t-1", Some("thermostat"), now), Admission::Allow);
        assert_eq!(limiter.admit("t-1", Some("thermostat"), now), Admission::Reject);

        for _ in 0..3 {
            assert_eq!(limiter.admit("c-1", Some("camera"), now), Admission::Allow);
        }
        assert_eq!(limiter.admit("c-1", Some("camera"), now), Admission::Reject);

        // Unknown types use the global limit
        for _ in 0..2 {
            assert_eq!(limiter.admit("s-1", Some("sensor"), now), Admission::Allow);
        }
        assert_eq!(limiter.admit("s-1", Some("sensor"), now), Admission::Reject);
    }

    #[test]
    fn idle_devices_are_evicted() {
        let limiter = limiter(10, 60);
        let start = Instant::now();

        limiter.admit("idle", None, start);
        limiter.admit("active", None, start + Duration::from_secs(500));

        assert_eq!(limiter.evict_idle(start + Duration::from_secs(700)), 1);
        assert!(limiter.device_stats("idle").is_none());
        assert!(limiter.device_stats("active").is_some());
    }

    #[tokio::test]
    async fn background_tasks_stop_on_cancellation() {
        let limiter = limiter(10, 60);
        let token = CancellationToken::new();
        token.cancel();

        limiter.clean_state(token.clone()).await;
        limiter.report_metrics(token).await;
    }
}
