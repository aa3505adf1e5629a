//! Continuous vision-language inference.
//!
//! The loop repeatedly feeds the newest decodable frame to the model with a
//! fixed prompt, streams partial text while it arrives and, once the model
//! finishes, derives keywords and a score from the final text. At most one
//! inference is in flight at any time; an iteration that finds one running is
//! skipped rather than queued.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    camera::{Frame, VideoSink},
    config::InferenceConfig,
    keywords::{self, KeywordReport},
    task::{CancelGate, LoopHandle},
    Result,
};

/// External vision-language model.
pub trait VisionLanguageModel: Send + Sync {
    /// Streams generated text in chunks. The stream ends when generation is
    /// complete.
    fn generate(&self, frame: Arc<Frame>, prompt: String) -> BoxStream<'static, Result<String>>;
}

/// Result of one completed inference cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FastVlmAnalysis {
    pub text: String,
    pub extracted_keywords: Vec<String>,
    pub derived_score: f32,
    /// Milliseconds since the session epoch.
    pub timestamp: u64,
    pub report: KeywordReport,
}

impl FastVlmAnalysis {
    fn from_text(text: String, timestamp: u64) -> Self {
        let report = keywords::parse(&text);
        Self {
            extracted_keywords: report.engagement_keywords(),
            derived_score: report.contextual_score,
            text,
            timestamp,
            report,
        }
    }
}

/// What a single call to [`InferenceLoop::run_cycle`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published(Arc<FastVlmAnalysis>),
    /// No decodable frame yet.
    NoFrame,
    /// Another cycle was already in flight.
    InFlight,
    /// The model finished without producing text.
    Empty,
    Failed,
    Cancelled,
}

struct Shared {
    model: Arc<dyn VisionLanguageModel>,
    sink: Arc<VideoSink>,
    prompt: String,
    epoch: Instant,
    gate: Arc<CancelGate>,
    in_flight: AtomicBool,
    completed: AtomicU64,
    published: AtomicU64,
    partial: watch::Sender<String>,
    analysis: watch::Sender<Option<Arc<FastVlmAnalysis>>>,
}

/// Clears the in-flight flag however the cycle ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    async fn run_cycle(&self) -> CycleOutcome {
        let token = self.gate.token();
        if token.is_cancelled() {
            return CycleOutcome::Cancelled;
        }
        let Some(frame) = self.sink.decodable_frame() else {
            return CycleOutcome::NoFrame;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!("inference already in flight, skipping");
            return CycleOutcome::InFlight;
        }
        let _flight = FlightGuard(&self.in_flight);

        // observers must not read the previous cycle's text as this one's
        if self.gate.publish(|| self.partial.send_replace(String::new())).is_none() {
            return CycleOutcome::Cancelled;
        }
        let mut stream = self.model.generate(frame, self.prompt.clone());
        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return CycleOutcome::Cancelled,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    text.push_str(&chunk);
                    let partial = text.clone();
                    if self.gate.publish(|| self.partial.send_replace(partial)).is_none() {
                        return CycleOutcome::Cancelled;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(%err, "inference failed, skipping cycle");
                    return CycleOutcome::Failed;
                }
                None => break,
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        let text = text.trim().to_string();
        if text.is_empty() {
            return CycleOutcome::Empty;
        }

        let timestamp = Instant::now().saturating_duration_since(self.epoch).as_millis() as u64;
        let analysis = Arc::new(FastVlmAnalysis::from_text(text, timestamp));
        let published = self.gate.publish(|| {
            self.analysis.send_replace(Some(analysis.clone()));
            self.published.fetch_add(1, Ordering::SeqCst);
        });

        match published {
            Some(()) => {
                tracing::debug!(
                    score = analysis.derived_score,
                    keywords = analysis.extracted_keywords.len(),
                    "published vision-language analysis"
                );
                CycleOutcome::Published(analysis)
            }
            None => CycleOutcome::Cancelled,
        }
    }
}

/// Handle over the running loop and its observable outputs.
pub struct InferenceLoop {
    shared: Arc<Shared>,
    handle: Mutex<Option<LoopHandle>>,
    delay: std::time::Duration,
}

impl InferenceLoop {
    /// Builds the loop without starting it.
    pub fn new(
        model: Arc<dyn VisionLanguageModel>,
        sink: Arc<VideoSink>,
        config: &InferenceConfig,
        epoch: Instant,
    ) -> Self {
        let (partial, _) = watch::channel(String::new());
        let (analysis, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                model,
                sink,
                prompt: config.prompt.clone(),
                epoch,
                gate: Arc::new(CancelGate::new()),
                in_flight: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                published: AtomicU64::new(0),
                partial,
                analysis,
            }),
            handle: Mutex::new(None),
            delay: config.loop_delay(),
        }
    }

    /// Spawns the background loop. Calling it twice keeps the first loop.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.shared.gate.is_cancelled() {
            return;
        }

        let shared = self.shared.clone();
        let delay = self.delay;
        let token = self.shared.gate.token().clone();
        let task = tokio::spawn(async move {
            run_loop(shared, token, delay).await;
        });
        *handle = Some(LoopHandle::new(self.shared.gate.clone(), task));
        tracing::info!("vision-language loop started");
    }

    /// Runs a single iteration without the trailing delay.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.shared.run_cycle().await
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn latest_analysis(&self) -> Option<Arc<FastVlmAnalysis>> {
        self.shared.analysis.borrow().clone()
    }

    pub fn subscribe_analysis(&self) -> watch::Receiver<Option<Arc<FastVlmAnalysis>>> {
        self.shared.analysis.subscribe()
    }

    pub fn subscribe_partial(&self) -> watch::Receiver<String> {
        self.shared.partial.subscribe()
    }

    /// Inference cycles whose model stream ran to completion.
    pub fn completed_cycles(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.shared.gate.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.gate.is_cancelled()
    }

    pub async fn shutdown(&self) {
        self.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

impl std::fmt::Debug for InferenceLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceLoop")
            .field("in_flight", &self.is_in_flight())
            .field("completed", &self.completed_cycles())
            .field("published", &self.published_count())
            .finish_non_exhaustive()
    }
}

async fn run_loop(shared: Arc<Shared>, token: CancellationToken, delay: std::time::Duration) {
    while !token.is_cancelled() {
        if shared.run_cycle().await == CycleOutcome::Cancelled {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!("vision-language loop stopped");
}
