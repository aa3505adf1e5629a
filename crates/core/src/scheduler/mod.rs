//! Per-modality polling loops.
//!
//! Every scheduler wakes on the shared frame ticker but only calls its
//! detector once the modality's throttle interval has elapsed since the
//! previous call. Cheap modalities therefore run close to the display rate
//! while expensive ones sample a fraction of the frames.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    camera::VideoSink,
    config::SchedulerConfig,
    detector::DetectorAdapter,
    state::ModuleStore,
    task::{CancelGate, LoopHandle},
    Modality,
};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Last-invoked guard for one modality.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` (and records `now`) when a call is due.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .map(|last| now.saturating_duration_since(last) >= self.interval)
            .unwrap_or(true);
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Counts detection attempts over a sliding one-second window.
#[derive(Debug, Default)]
struct FpsMeter {
    samples: VecDeque<Instant>,
}

impl FpsMeter {
    fn record(&mut self, now: Instant) -> f32 {
        self.samples.push_back(now);
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(*front) > FPS_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.len() as f32
    }
}

/// Timing for one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    pub frame_interval: Duration,
    pub throttle: Duration,
}

impl SchedulerTiming {
    pub fn for_modality(config: &SchedulerConfig, modality: Modality) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            throttle: config.throttle(modality),
        }
    }
}

/// Handle to a running per-modality loop.
#[derive(Debug)]
pub struct DetectionScheduler {
    modality: Modality,
    store: Arc<ModuleStore>,
    gate: Arc<CancelGate>,
    handle: LoopHandle,
}

impl DetectionScheduler {
    /// Spawns the loop: initialize the adapter, then poll on every frame tick.
    pub fn spawn(
        adapter: Arc<DetectorAdapter>,
        sink: Arc<VideoSink>,
        store: Arc<ModuleStore>,
        timing: SchedulerTiming,
    ) -> Self {
        let modality = adapter.modality();
        let gate = Arc::new(CancelGate::new());
        let task = tokio::spawn(run(adapter, sink, store.clone(), gate.clone(), timing));
        tracing::debug!(
            %modality,
            throttle_ms = timing.throttle.as_millis() as u64,
            "scheduler started"
        );
        Self {
            modality,
            store,
            gate: gate.clone(),
            handle: LoopHandle::new(gate, task),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// Marks the module disabled and stops the loop. Nothing this loop does
    /// afterwards reaches the store. Idempotent.
    pub fn cancel(&self) {
        let store = &self.store;
        let modality = self.modality;
        self.gate.cancel_with(|| {
            store.update(modality, |slot| {
                slot.state.enabled = false;
                slot.state.loading = false;
            })
        });
        tracing::debug!(%modality, "scheduler cancelled");
    }

    /// Cancels and waits for the task to finish.
    pub async fn shutdown(&self) {
        self.cancel();
        self.handle.shutdown().await;
    }
}

async fn run(
    adapter: Arc<DetectorAdapter>,
    sink: Arc<VideoSink>,
    store: Arc<ModuleStore>,
    gate: Arc<CancelGate>,
    timing: SchedulerTiming,
) {
    let modality = adapter.modality();
    let token = gate.token().clone();

    gate.publish(|| {
        store.update(modality, |slot| {
            slot.state.enabled = true;
            slot.state.loading = !adapter.is_ready();
            slot.state.error = None;
        })
    });

    let initialized = tokio::select! {
        _ = token.cancelled() => return,
        result = adapter.initialize() => result,
    };

    if let Err(err) = initialized {
        tracing::warn!(%modality, %err, "modality disabled after failed initialization");
        gate.publish(|| {
            store.update(modality, |slot| {
                slot.state.ready = false;
                slot.state.loading = false;
                slot.state.error = Some(err.to_string());
            })
        });
        return;
    }

    gate.publish(|| {
        store.update(modality, |slot| {
            slot.state.ready = true;
            slot.state.loading = false;
        })
    });

    let mut ticker = tokio::time::interval(timing.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut throttle = Throttle::new(timing.throttle);
    let mut fps = FpsMeter::default();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // The tick instant is the scheduled deadline, which lags the real
        // wake-up when the runtime is busy.
        let now = Instant::now();

        let Some(frame) = sink.decodable_frame() else {
            continue;
        };
        if !throttle.try_acquire(now) {
            continue;
        }

        let timestamp_ms = store.millis_since_epoch(now);
        let detection = adapter.detect(&frame, timestamp_ms).map(Arc::new);
        let observed_fps = fps.record(now);

        let published = gate.publish(|| {
            store.update(modality, |slot| {
                slot.state.last_update_ms = Some(timestamp_ms);
                slot.state.observed_fps = observed_fps;
                slot.latest = detection;
            })
        });
        if published.is_none() {
            break;
        }
    }

    tracing::debug!(%modality, "scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use proptest::prelude::*;

    use super::*;
    use crate::{camera::testing::frame, detector::testing::ScriptedLoader};

    fn timing(throttle_ms: u64) -> SchedulerTiming {
        SchedulerTiming {
            frame_interval: Duration::from_millis(16),
            throttle: Duration::from_millis(throttle_ms),
        }
    }

    fn sink_with_frame() -> Arc<VideoSink> {
        let sink = Arc::new(VideoSink::new());
        sink.push(frame(1));
        sink
    }

    proptest! {
        #[test]
        fn throttle_never_admits_two_calls_within_interval(
            interval_ms in 1u64..250,
            deltas in proptest::collection::vec(0u64..120, 1..200),
        ) {
            let start = Instant::now();
            let interval = Duration::from_millis(interval_ms);
            let mut throttle = Throttle::new(interval);
            let mut offset = 0;
            let mut admitted: Vec<u64> = Vec::new();

            for delta in deltas {
                offset += delta;
                if throttle.try_acquire(start + Duration::from_millis(offset)) {
                    admitted.push(offset);
                }
            }

            for pair in admitted.windows(2) {
                prop_assert!(pair[1] - pair[0] >= interval_ms);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detect_calls_respect_the_throttle() {
        let loader = ScriptedLoader::new(Modality::Objects, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = Arc::new(DetectorAdapter::new(Modality::Objects, loader));
        let store = Arc::new(ModuleStore::new());

        let scheduler =
            DetectionScheduler::spawn(adapter, sink_with_frame(), store.clone(), timing(200));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        scheduler.shutdown().await;

        let calls = model.calls.load(Ordering::SeqCst);
        assert!((4..=6).contains(&calls), "unexpected call count {calls}");
    }

    // Real time: a sibling task blocks the only runtime thread so the
    // scheduler wakes well after its tick deadlines.
    #[tokio::test]
    async fn throttle_holds_when_the_runtime_is_blocked() {
        let loader = ScriptedLoader::new(Modality::Face, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = Arc::new(DetectorAdapter::new(Modality::Face, loader));
        let store = Arc::new(ModuleStore::new());

        let scheduler = DetectionScheduler::spawn(adapter, sink_with_frame(), store, timing(33));
        let blocker = tokio::spawn(async {
            for pause in [5u64, 11, 23, 7, 29, 13, 3, 17].iter().cycle().take(32) {
                tokio::time::sleep(Duration::from_millis(*pause)).await;
                std::thread::sleep(Duration::from_millis(18));
            }
        });
        blocker.await.unwrap();
        scheduler.shutdown().await;

        let called_at = model.called_at.lock().clone();
        assert!(called_at.len() > 5, "only {} calls", called_at.len());
        // slack covers the few instructions between the throttle check and the call
        let floor = Duration::from_millis(33) - Duration::from_micros(300);
        for pair in called_at.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= floor, "detect calls {gap:?} apart");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_state_and_results() {
        let adapter = Arc::new(DetectorAdapter::new(
            Modality::Face,
            ScriptedLoader::new(Modality::Face, Duration::from_millis(30)),
        ));
        let store = Arc::new(ModuleStore::new());

        let scheduler =
            DetectionScheduler::spawn(adapter, sink_with_frame(), store.clone(), timing(33));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let loading = store.state(Modality::Face);
        assert!(loading.enabled && loading.loading && !loading.ready);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let state = store.state(Modality::Face);
        assert!(state.ready && !state.loading);
        assert!(state.last_update_ms.is_some());
        assert!(state.observed_fps > 0.0);
        assert!(store.latest(Modality::Face).is_some());

        scheduler.shutdown().await;
        assert!(!store.state(Modality::Face).enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn no_writes_after_cancel() {
        let loader = ScriptedLoader::new(Modality::Pose, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = Arc::new(DetectorAdapter::new(Modality::Pose, loader));
        let store = Arc::new(ModuleStore::new());

        let scheduler =
            DetectionScheduler::spawn(adapter, sink_with_frame(), store.clone(), timing(50));
        tokio::time::sleep(Duration::from_millis(220)).await;

        scheduler.cancel();
        scheduler.cancel();
        let frozen = store.state(Modality::Pose);
        let calls = model.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.state(Modality::Pose), frozen);
        assert_eq!(model.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialization_is_recorded() {
        let loader = ScriptedLoader::new(Modality::Bio, Duration::from_millis(10));
        loader.fail.store(true, Ordering::SeqCst);
        let adapter = Arc::new(DetectorAdapter::new(Modality::Bio, loader));
        let store = Arc::new(ModuleStore::new());

        let _scheduler =
            DetectionScheduler::spawn(adapter, sink_with_frame(), store.clone(), timing(500));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = store.state(Modality::Bio);
        assert!(!state.ready);
        assert!(!state.loading);
        assert!(state.error.as_deref().unwrap_or_default().contains("weights missing"));
        assert!(store.latest(Modality::Bio).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_decodable_frame() {
        let loader = ScriptedLoader::new(Modality::Hands, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = Arc::new(DetectorAdapter::new(Modality::Hands, loader));
        let store = Arc::new(ModuleStore::new());
        let sink = Arc::new(VideoSink::new());

        let scheduler = DetectionScheduler::spawn(adapter, sink.clone(), store.clone(), timing(50));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        sink.push(frame(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(model.calls.load(Ordering::SeqCst) > 0);
        scheduler.shutdown().await;
    }
}
