//! The Quota-Aware Concurrency Fabric.
//!
//! Fronts every LLM call with a per-class semaphore, a minimum inter-request
//! spacing timer, and an adaptive loop that nudges concurrency from rolling
//! success-rate/latency statistics. Grounded in the windowed
//! `Mutex<HashMap<K, WindowState>>` rate limiter idiom and the
//! `Arc<Semaphore>`-gated fan-out pattern this crate's teacher uses for its
//! own batch executor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

use super::types::{Outcome, TaskClass, WindowSummary, WINDOW_CAP};

struct ClassState {
    semaphore: Arc<Semaphore>,
    /// Target permit count; semaphore capacity drains toward this value as
    /// held permits are released (see `resize`).
    target_limit: Mutex<usize>,
    min_limit: usize,
    max_limit: usize,
    request_interval: Duration,
    last_dispatch: Mutex<Instant>,
    window: Mutex<VecDeque<Outcome>>,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
}

impl ClassState {
    fn new(limit: usize, min: usize, max: usize, interval: Duration, scale_up: f64, scale_down: f64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            target_limit: Mutex::new(limit),
            min_limit: min,
            max_limit: max,
            request_interval: interval,
            last_dispatch: Mutex::new(Instant::now() - interval),
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAP)),
            scale_up_threshold: scale_up,
            scale_down_threshold: scale_down,
        }
    }

    async fn summary(&self) -> WindowSummary {
        let window = self.window.lock().await;
        if window.is_empty() {
            return WindowSummary::default();
        }
        let count = window.len();
        let successes = window.iter().filter(|o| o.success).count();
        let total_duration: Duration = window.iter().map(|o| o.duration).sum();
        WindowSummary {
            count,
            success_rate: successes as f64 / count as f64,
            error_rate: (count - successes) as f64 / count as f64,
            avg_duration: total_duration / count as u32,
        }
    }

    /// Grow or shrink the semaphore's capacity toward `new_limit`, preserving
    /// currently-held permits. Growing adds permits immediately; shrinking
    /// forgets whatever is currently available and records the lower target
    /// so excess capacity drains away as held permits are eventually
    /// released (see `release_and_drain`).
    async fn resize(&self, new_limit: usize) {
        let new_limit = new_limit.clamp(self.min_limit, self.max_limit);
        let mut target = self.target_limit.lock().await;
        if new_limit == *target {
            return;
        }
        if new_limit > *target {
            self.semaphore.add_permits(new_limit - *target);
        } else {
            let shrink_by = *target - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink_by);
            if forgotten < shrink_by {
                debug!(
                    class_shrink_deficit = shrink_by - forgotten,
                    "semaphore capacity will keep draining as held permits release"
                );
            }
        }
        *target = new_limit;
    }
}

/// A held slot in the Fabric. Dropping it (or calling `release` explicitly)
/// returns the slot; a double release is a no-op.
pub struct FabricPermit {
    class: TaskClass,
    permit: Option<OwnedSemaphorePermit>,
    released: AtomicBool,
}

impl FabricPermit {
    /// Explicitly return the slot. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.permit.take();
        }
    }

    pub fn task_class(&self) -> TaskClass {
        self.class
    }
}

impl Drop for FabricPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// The Quota-Aware Concurrency Fabric. One instance is owned explicitly and
/// threaded into every component that makes LLM calls — there is no
/// ambient/static access to its state (spec §9).
pub struct ConcurrencyFabric {
    classes: RwLock<HashMap<TaskClass, Arc<ClassState>>>,
    config: Config,
    cancel: CancellationToken,
    adaptive_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ConcurrencyFabric {
    pub fn new(config: Config) -> Arc<Self> {
        let fabric = Arc::new(Self {
            classes: RwLock::new(HashMap::new()),
            config,
            cancel: CancellationToken::new(),
            adaptive_handle: StdMutex::new(None),
        });
        fabric.clone().spawn_adaptive_loop();
        fabric
    }

    async fn class_state(&self, class: TaskClass) -> Arc<ClassState> {
        if let Some(state) = self.classes.read().await.get(&class) {
            return state.clone();
        }
        let mut write = self.classes.write().await;
        write
            .entry(class)
            .or_insert_with(|| {
                let limits = self.config.class_limits(class);
                Arc::new(ClassState::new(
                    limits.max_concurrent,
                    limits.adaptive_range.min,
                    limits.adaptive_range.max,
                    limits.request_interval(),
                    limits.adaptive_range.scale_up_threshold,
                    limits.adaptive_range.scale_down_threshold,
                ))
            })
            .clone()
    }

    /// Blocks until a slot is free and minimum spacing has elapsed; returns
    /// `Error::Cancelled` immediately if `cancel` fires first. Ordering
    /// between competing acquirers is not guaranteed.
    pub async fn acquire(&self, class: TaskClass, cancel: &CancellationToken) -> Result<FabricPermit> {
        let state = self.class_state(class).await;

        loop {
            let wait = {
                let last = *state.last_dispatch.lock().await;
                let elapsed = last.elapsed();
                if elapsed < state.request_interval {
                    Some(state.request_interval - elapsed)
                } else {
                    None
                }
            };
            match wait {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                None => break,
            }
        }

        let permit = tokio::select! {
            res = state.semaphore.clone().acquire_owned() => {
                res.map_err(|_| Error::Internal("fabric semaphore closed".into()))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        *state.last_dispatch.lock().await = Instant::now();

        Ok(FabricPermit {
            class,
            permit: Some(permit),
            released: AtomicBool::new(false),
        })
    }

    /// Record a call outcome into the class's rolling window, evicting the
    /// oldest entry once the window exceeds its cap.
    pub async fn observe(&self, class: TaskClass, outcome: Outcome) {
        let state = self.class_state(class).await;
        let mut window = state.window.lock().await;
        if window.len() >= WINDOW_CAP {
            window.pop_front();
        }
        window.push_back(outcome);
    }

    /// The current (possibly adapted) concurrency limit for planners. Does
    /// not itself gate acquisition.
    pub async fn optimal_concurrency(&self, class: TaskClass) -> usize {
        let state = self.class_state(class).await;
        *state.target_limit.lock().await
    }

    fn spawn_adaptive_loop(self: Arc<Self>) {
        if !self.config.adaptive.enable {
            return;
        }
        let interval = self.config.adaptive.adjustment_interval();
        let fast = Duration::from_millis(self.config.adaptive.fast_duration_ms);
        let slow = Duration::from_millis(self.config.adaptive.slow_duration_ms);
        let cancel = self.cancel.clone();
        let fabric = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fabric.adapt_once(fast, slow).await;
                    }
                    _ = cancel.cancelled() => {
                        info!("fabric adaptive loop shutting down");
                        break;
                    }
                }
            }
        });

        *self.adaptive_handle.lock().expect("adaptive_handle mutex poisoned") = Some(handle);
    }

    async fn adapt_once(&self, fast: Duration, slow: Duration) {
        let snapshot: Vec<(TaskClass, Arc<ClassState>)> = self
            .classes
            .read()
            .await
            .iter()
            .map(|(c, s)| (*c, s.clone()))
            .collect();

        for (class, state) in snapshot {
            let summary = state.summary().await;
            if summary.count == 0 {
                continue;
            }
            let current = *state.target_limit.lock().await;

            let new_limit = if summary.success_rate >= state.scale_up_threshold && summary.avg_duration < fast {
                (current + 1).min(state.max_limit)
            } else if summary.error_rate >= state.scale_down_threshold || summary.avg_duration > slow {
                current.saturating_sub(1).max(state.min_limit)
            } else {
                current
            };

            if new_limit != current {
                debug!(%class, current, new_limit, success_rate = summary.success_rate, "adaptive concurrency change");
                state.resize(new_limit).await;
            }
        }
    }

    /// Cancel the tick loop and stop accepting new acquisitions; in-flight
    /// acquires still racing the fabric's own cancellation token unblock
    /// with `Error::Cancelled`.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .adaptive_handle
            .lock()
            .expect("adaptive_handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassLimits;

    fn test_config(max_concurrent: usize) -> Config {
        let mut cfg = Config::default();
        let mut limits = ClassLimits::default();
        limits.max_concurrent = max_concurrent;
        limits.request_interval_ms = 0;
        limits.adaptive_range.min = 1;
        limits.adaptive_range.max = max_concurrent;
        cfg.adaptive.enable = false;
        cfg.classes.insert(TaskClass::DataCleaning, limits);
        cfg
    }

    #[tokio::test]
    async fn acquire_respects_concurrency_limit() {
        let fabric = ConcurrencyFabric::new(test_config(1));
        let cancel = CancellationToken::new();

        let permit1 = fabric.acquire(TaskClass::DataCleaning, &cancel).await.unwrap();

        let fabric2 = fabric.clone();
        let cancel2 = cancel.clone();
        let second = tokio::spawn(async move {
            tokio::time::timeout(
                Duration::from_millis(50),
                fabric2.acquire(TaskClass::DataCleaning, &cancel2),
            )
            .await
        });

        // Second acquire should still be waiting: the single permit is held.
        let result = second.await.unwrap();
        assert!(result.is_err(), "expected acquire to time out while permit is held");

        drop(permit1);
        fabric.close().await;
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let fabric = ConcurrencyFabric::new(test_config(1));
        let cancel = CancellationToken::new();
        let mut permit = fabric.acquire(TaskClass::DataCleaning, &cancel).await.unwrap();
        permit.release();
        permit.release();

        let permit2 = fabric.acquire(TaskClass::DataCleaning, &cancel).await;
        assert!(permit2.is_ok());
        fabric.close().await;
    }

    #[tokio::test]
    async fn acquire_is_cancellable() {
        let fabric = ConcurrencyFabric::new(test_config(1));
        let cancel = CancellationToken::new();
        let _permit = fabric.acquire(TaskClass::DataCleaning, &cancel).await.unwrap();

        let cancel2 = CancellationToken::new();
        cancel2.cancel();
        let result = fabric.acquire(TaskClass::DataCleaning, &cancel2).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        fabric.close().await;
    }

    #[tokio::test]
    async fn observe_trims_window_to_cap() {
        let fabric = ConcurrencyFabric::new(test_config(4));
        for _ in 0..(WINDOW_CAP + 10) {
            fabric
                .observe(TaskClass::DataCleaning, Outcome::success(Duration::from_millis(1)))
                .await;
        }
        let state = fabric.class_state(TaskClass::DataCleaning).await;
        assert_eq!(state.window.lock().await.len(), WINDOW_CAP);
        fabric.close().await;
    }
}
