//! Periodic device polling
//!
//! Hardware drivers here are polled, not event-driven. Each device gets one
//! [`DevicePoller`]: a tokio task that calls [`Pollable::poll`] on a fixed
//! cadence (plus optional random jitter). A failing or panicking tick is
//! logged and swallowed; the next tick runs regardless.
//!
//! A poller that silently stopped would look exactly like an idle device, so
//! every poller publishes a [`PollerHealth`] record that status snapshots and
//! tests can inspect.

use crate::error::DeviceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A device that can be sampled periodically
#[async_trait]
pub trait Pollable: Send + Sync + 'static {
    /// Name used for the poller task and its log lines
    fn poll_name(&self) -> String;

    /// Sample hardware state and derive activity transitions
    async fn poll(&self) -> DeviceResult<()>;
}

/// Poller cadence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Time between ticks
    pub interval_ms: u64,
    /// Maximum random delay added to each interval (0 disables jitter)
    pub jitter_ms: u64,
    /// A poller is considered stalled when no tick completed within
    /// `interval * stall_factor`
    pub stall_factor: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            jitter_ms: 0,
            stall_factor: 3,
        }
    }
}

impl PollerConfig {
    /// Camera cadence: one tick per second
    pub fn for_camera() -> Self {
        Self::default()
    }

    /// Unit cadence: one tick every two seconds
    pub fn for_unit() -> Self {
        Self {
            interval_ms: 2000,
            ..Self::default()
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Interval for the next tick, including jitter
    fn next_delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.interval() + Duration::from_millis(jitter)
    }

    fn stall_after(&self) -> Duration {
        (self.interval() + Duration::from_millis(self.jitter_ms)) * self.stall_factor.max(1)
    }
}

/// Liveness record for a poller task
#[derive(Debug)]
pub struct PollerHealth {
    name: String,
    running: AtomicBool,
    ticks: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    spawned: Instant,
    last_tick: Mutex<Option<(Instant, DateTime<Utc>)>>,
    last_error: Mutex<Option<String>>,
    stall_after: Duration,
}

/// Serializable view of [`PollerHealth`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerHealthSnapshot {
    pub name: String,
    pub running: bool,
    pub alive: bool,
    pub ticks: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PollerHealth {
    fn new(name: String, stall_after: Duration) -> Self {
        Self {
            name,
            running: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            spawned: Instant::now(),
            last_tick: Mutex::new(None),
            last_error: Mutex::new(None),
            stall_after,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Completed ticks, successful or not
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True while the task runs and ticks keep completing on schedule
    pub fn is_alive(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let since = self
            .last_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|(instant, _)| instant)
            .unwrap_or(self.spawned);
        since.elapsed() <= self.stall_after
    }

    pub fn snapshot(&self) -> PollerHealthSnapshot {
        PollerHealthSnapshot {
            name: self.name.clone(),
            running: self.is_running(),
            alive: self.is_alive(),
            ticks: self.ticks(),
            failures: self.failures(),
            consecutive_failures: self.consecutive_failures(),
            last_tick: self
                .last_tick
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|(_, at)| at),
            last_error: self.last_error(),
        }
    }

    fn record_tick(&self) {
        *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner) = Some((Instant::now(), Utc::now()));
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.record_tick();
    }

    fn record_failure(&self, message: String) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.record_tick();
    }
}

/// Handle to a running poller task. Dropping the handle aborts the task.
pub struct DevicePoller {
    health: Arc<PollerHealth>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DevicePoller {
    /// Spawn a poller for `target` on the current tokio runtime
    pub fn spawn(target: Arc<dyn Pollable>, config: PollerConfig) -> Self {
        let name = target.poll_name();
        let health = Arc::new(PollerHealth::new(name.clone(), config.stall_after()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_health = health.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!("{}: poller started (interval {:?})", name, config.interval());
            loop {
                tokio::select! {
                    _ = sleep(config.next_delay()) => {}
                    _ = &mut shutdown_rx => break,
                }
                run_tick(target.as_ref(), &task_health).await;
            }
            task_health.running.store(false, Ordering::Release);
            tracing::debug!("{}: poller stopped", name);
        });

        Self {
            health,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn health(&self) -> Arc<PollerHealth> {
        self.health.clone()
    }

    /// Stop the task and wait for its current tick to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("{}: poller task ended abnormally: {}", self.health.name(), e);
            }
        }
        self.health.running.store(false, Ordering::Release);
    }
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Nobody is left to wait for a tick in progress
        if let Some(handle) = self.handle.take() {
            handle.abort();
            self.health.running.store(false, Ordering::Release);
        }
    }
}

async fn run_tick(target: &dyn Pollable, health: &PollerHealth) {
    match AssertUnwindSafe(target.poll()).catch_unwind().await {
        Ok(Ok(())) => health.record_success(),
        Ok(Err(e)) => {
            tracing::warn!("{}: poll tick failed: {}", health.name(), e);
            health.record_failure(e.to_string());
        }
        Err(panic_payload) => {
            let msg = extract_panic_message(&panic_payload);
            tracing::error!("{}: poll tick panicked: {}", health.name(), msg);
            health.record_failure(format!("panic: {}", msg));
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    struct Counter {
        polls: AtomicU64,
    }

    #[async_trait]
    impl Pollable for Counter {
        fn poll_name(&self) -> String {
            "counter".to_string()
        }

        async fn poll(&self) -> DeviceResult<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails every second tick and panics on the third
    struct Flaky {
        polls: AtomicU64,
    }

    #[async_trait]
    impl Pollable for Flaky {
        fn poll_name(&self) -> String {
            "flaky".to_string()
        }

        async fn poll(&self) -> DeviceResult<()> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                panic!("driver exploded");
            }
            if n % 2 == 0 {
                return Err(DeviceError::driver("flaky", "poll", "transient"));
            }
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Pollable for Stuck {
        fn poll_name(&self) -> String {
            "stuck".to_string()
        }

        async fn poll(&self) -> DeviceResult<()> {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn fast() -> PollerConfig {
        PollerConfig::with_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_poller_ticks_repeatedly() {
        let counter = Arc::new(Counter { polls: AtomicU64::new(0) });
        let poller = DevicePoller::spawn(counter.clone(), fast());

        sleep(Duration::from_millis(150)).await;
        let health = poller.health();
        assert!(health.ticks() >= 3, "only {} ticks", health.ticks());
        assert_eq!(health.failures(), 0);
        assert!(health.is_alive());
        assert_eq!(counter.polls.load(Ordering::SeqCst), health.ticks());

        poller.stop().await;
    }

    #[tokio::test]
    async fn test_poller_survives_errors_and_panics() {
        let flaky = Arc::new(Flaky { polls: AtomicU64::new(0) });
        let poller = DevicePoller::spawn(flaky.clone(), fast());
        let health = poller.health();

        sleep(Duration::from_millis(200)).await;
        assert!(health.ticks() >= 6, "only {} ticks", health.ticks());
        assert!(health.failures() >= 3);
        assert!(health.is_running());
        assert!(health.is_alive());
        assert!(flaky.polls.load(Ordering::SeqCst) > 3);

        poller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_halts_ticks() {
        let counter = Arc::new(Counter { polls: AtomicU64::new(0) });
        let poller = DevicePoller::spawn(counter.clone(), fast());
        let health = poller.health();

        sleep(Duration::from_millis(50)).await;
        poller.stop().await;
        let ticks = health.ticks();
        assert!(!health.is_running());
        assert!(!health.is_alive());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(health.ticks(), ticks);
    }

    #[tokio::test]
    async fn test_stalled_poller_is_not_alive() {
        let poller = DevicePoller::spawn(Arc::new(Stuck), fast());
        let health = poller.health();

        sleep(Duration::from_millis(150)).await;
        assert!(health.is_running());
        assert!(!health.is_alive());
        assert_eq!(health.ticks(), 0);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.name, "stuck");
        assert!(!snapshot.alive);
    }

    #[tokio::test]
    async fn test_drop_aborts_stuck_tick() {
        let stuck = Arc::new(Stuck);
        let poller = DevicePoller::spawn(stuck.clone(), fast());
        let health = poller.health();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&stuck), 2);
        drop(poller);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&stuck), 1);
        assert!(!health.is_running());
    }

    #[test]
    fn test_config_defaults() {
        assert_eq!(PollerConfig::for_camera().interval(), Duration::from_secs(1));
        assert_eq!(PollerConfig::for_unit().interval(), Duration::from_secs(2));

        let jittery = PollerConfig {
            interval_ms: 100,
            jitter_ms: 20,
            stall_factor: 3,
        };
        for _ in 0..50 {
            let delay = jittery.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}
