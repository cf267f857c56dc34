//! Bandwidth provider - refills limiters once per accounting window
//!
//! The provider owns the schedule the limiters themselves know nothing
//! about: every interval each registered limiter gets its per-window budget
//! back, derived from the configured bytes-per-second limit.

use crate::engine::bandwidth_limiter::{BandwidthLimiter, UNLIMITED};
use parking_lot::Mutex;
use pfxfer_types::{BandwidthSettings, TrafficClass};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A limiter together with its configured limit (0 = unlimited)
struct LimitEntry {
    limiter: Arc<BandwidthLimiter>,
    bytes_per_second: u64,
}

/// Periodically resets the budget of registered limiters
pub struct BandwidthProvider {
    interval: Duration,
    entries: Arc<Mutex<Vec<LimitEntry>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BandwidthProvider {
    pub fn new(interval: Duration) -> Self {
        // tokio intervals panic on a zero period
        let interval = interval.max(Duration::from_millis(1));
        Self {
            interval,
            entries: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register a limiter or change its limit. Takes effect immediately.
    pub fn set_limit_bps(&self, limiter: &Arc<BandwidthLimiter>, bytes_per_second: u64) {
        {
            let mut entries = self.entries.lock();
            match entries.iter_mut().find(|e| Arc::ptr_eq(&e.limiter, limiter)) {
                Some(entry) => entry.bytes_per_second = bytes_per_second,
                None => entries.push(LimitEntry {
                    limiter: Arc::clone(limiter),
                    bytes_per_second,
                }),
            }
        }
        limiter.set_available(budget_per_window(bytes_per_second, self.interval));
    }

    /// The configured limit of a registered limiter
    pub fn limit_bps(&self, limiter: &Arc<BandwidthLimiter>) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .find(|e| Arc::ptr_eq(&e.limiter, limiter))
            .map(|e| e.bytes_per_second)
    }

    /// Stop refilling a limiter. Its current budget is left as is.
    pub fn remove_limiter(&self, limiter: &Arc<BandwidthLimiter>) {
        self.entries
            .lock()
            .retain(|e| !Arc::ptr_eq(&e.limiter, limiter));
    }

    /// Start a new accounting window for every registered limiter
    pub fn refill(&self) {
        refill_all(&self.entries, self.interval);
    }

    /// Spawn the refill loop on the current tokio runtime
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Bandwidth provider already running");
            return;
        }

        let entries = Arc::clone(&self.entries);
        let interval = self.interval;
        let cancel = self.cancel.clone();

        info!("Starting bandwidth provider (window: {:?})", interval);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => refill_all(&entries, interval),
                }
            }
            debug!("Bandwidth provider stopped");
        }));
    }

    /// Stop the refill loop and open every limiter so no writer stays blocked
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        for entry in self.entries.lock().iter() {
            entry.limiter.set_available(UNLIMITED);
        }
        info!("Bandwidth provider shut down");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for BandwidthProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn refill_all(entries: &Mutex<Vec<LimitEntry>>, interval: Duration) {
    for entry in entries.lock().iter() {
        entry
            .limiter
            .set_available(budget_per_window(entry.bytes_per_second, interval));
    }
}

/// Bytes allowed per window for a bytes-per-second limit, at least one byte
pub fn budget_per_window(bytes_per_second: u64, interval: Duration) -> i64 {
    if bytes_per_second == 0 {
        return UNLIMITED;
    }
    let budget = bytes_per_second as u128 * interval.as_millis() / 1000;
    budget.clamp(1, i64::MAX as u128) as i64
}

/// One limiter per traffic class, shared by every connection of that class
#[derive(Debug, Clone)]
pub struct SharedLimiters {
    limiters: HashMap<TrafficClass, Arc<BandwidthLimiter>>,
}

impl SharedLimiters {
    pub fn new() -> Self {
        let limiters = TrafficClass::ALL
            .iter()
            .map(|&class| (class, Arc::new(BandwidthLimiter::new())))
            .collect();
        Self { limiters }
    }

    pub fn get(&self, class: TrafficClass) -> &Arc<BandwidthLimiter> {
        // Every class is inserted in new()
        &self.limiters[&class]
    }

    /// Limiter for data sent to a peer
    pub fn output_limiter(&self, on_lan: bool) -> Arc<BandwidthLimiter> {
        Arc::clone(self.get(TrafficClass::output(on_lan)))
    }

    /// Limiter for data received from a peer
    pub fn input_limiter(&self, on_lan: bool) -> Arc<BandwidthLimiter> {
        Arc::clone(self.get(TrafficClass::input(on_lan)))
    }

    /// Push the configured limits of all four classes into the provider
    pub fn apply_settings(&self, settings: &BandwidthSettings, provider: &BandwidthProvider) {
        for class in TrafficClass::ALL {
            let limit = settings.limit_for(class);
            provider.set_limit_bps(self.get(class), limit);
            debug!("Bandwidth limit for {}: {} bytes/s", class, limit);
        }
    }
}

impl Default for SharedLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_budget_per_window() {
        let second = Duration::from_secs(1);
        assert_eq!(budget_per_window(0, second), UNLIMITED);
        assert_eq!(budget_per_window(1024, second), 1024);
        assert_eq!(budget_per_window(1024, Duration::from_millis(250)), 256);
        // Never hand out an exhausted window for a non-zero limit
        assert_eq!(budget_per_window(1, Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_set_limit_applies_immediately() {
        let provider = BandwidthProvider::new(Duration::from_millis(500));
        let limiter = Arc::new(BandwidthLimiter::new());

        provider.set_limit_bps(&limiter, 2000);
        assert_eq!(limiter.get_available(), 1000);
        assert_eq!(provider.limit_bps(&limiter), Some(2000));

        provider.set_limit_bps(&limiter, 0);
        assert!(limiter.is_unlimited());
        assert_eq!(provider.limit_bps(&limiter), Some(0));
    }

    #[test]
    fn test_refill_resets_budget() {
        let provider = BandwidthProvider::new(Duration::from_secs(1));
        let limiter = Arc::new(BandwidthLimiter::new());
        provider.set_limit_bps(&limiter, 100);

        assert_eq!(limiter.request_bandwidth(80), 80);
        assert_eq!(limiter.get_available(), 20);

        provider.refill();
        assert_eq!(limiter.get_available(), 100);

        provider.remove_limiter(&limiter);
        limiter.request_bandwidth(100);
        provider.refill();
        assert_eq!(limiter.get_available(), 0);
    }

    #[tokio::test]
    async fn test_running_provider_releases_blocked_writer() {
        let provider = BandwidthProvider::new(Duration::from_millis(20));
        let limiter = Arc::new(BandwidthLimiter::new());
        provider.set_limit_bps(&limiter, 500);
        limiter.set_available(0);

        provider.start();
        assert!(provider.is_running());

        let start = Instant::now();
        let writer = {
            let limiter = limiter.clone();
            tokio::task::spawn_blocking(move || {
                let mut total = 0;
                while total < 25 {
                    total += limiter.request_bandwidth(25 - total);
                }
                total
            })
        };

        let total = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer should be released by the provider")
            .unwrap();
        assert_eq!(total, 25);
        assert!(start.elapsed() >= Duration::from_millis(10));

        provider.shutdown();
        assert!(!provider.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_opens_limiters() {
        let provider = BandwidthProvider::new(Duration::from_secs(60));
        let limiter = Arc::new(BandwidthLimiter::new());
        provider.set_limit_bps(&limiter, 10);
        provider.start();
        // Let the immediate first tick pass, then exhaust the window
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.set_available(0);

        let writer = {
            let limiter = limiter.clone();
            tokio::task::spawn_blocking(move || limiter.request_bandwidth(1_000))
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        provider.shutdown();
        let granted = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(granted >= 1);
    }

    #[test]
    fn test_shared_limiters_apply_settings() {
        let provider = BandwidthProvider::new(Duration::from_secs(1));
        let limiters = SharedLimiters::new();
        let settings = BandwidthSettings {
            upload_limit_wan: 4096,
            download_limit_lan: 1024,
            ..BandwidthSettings::default()
        };

        limiters.apply_settings(&settings, &provider);

        assert_eq!(limiters.output_limiter(false).get_available(), 4096);
        assert!(limiters.output_limiter(true).is_unlimited());
        assert_eq!(limiters.input_limiter(true).get_available(), 1024);
        assert!(limiters.input_limiter(false).is_unlimited());
        assert!(Arc::ptr_eq(
            &limiters.output_limiter(false),
            limiters.get(TrafficClass::WanOutput)
        ));
    }
}
