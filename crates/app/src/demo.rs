//! Synthetic stand-ins for the camera, detectors, vision-language model and
//! backend so a full session can run without hardware.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    StreamExt,
};
use kiosk_vision_core::{
    detector::{
        BioReading, BoundingBox, DetectedObject, ExpressionScore, FaceMesh, FaceReading, Gesture,
        Hand, HandReading, Handedness, Landmark, ObjectReading, PoseReading, Sentiment,
        SentimentLabel, SpeechReading,
    },
    CaptureConstraints, CaptureDevice, CaptureStream, Connection, Connector, Detection,
    DetectionModel, DetectorAdapter, DetectorLoader, DetectorRegistry, Frame, KioskError, Modality,
    Result, VisionLanguageModel,
};
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::Instant};

// SOI, a comment marker and EOI: enough for every decodability check.
const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xFE, 0x00, 0x04, 0x6B, 0x76, 0xFF, 0xD9];

pub struct SyntheticCamera;

struct SyntheticStream {
    sequence: u64,
    period: Duration,
    width: u32,
    height: u32,
}

impl CaptureDevice for SyntheticCamera {
    fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> BoxFuture<'_, Result<Box<dyn CaptureStream>>> {
        let stream = SyntheticStream {
            sequence: 0,
            period: Duration::from_millis(1_000 / u64::from(constraints.frame_rate.max(1))),
            width: constraints.width,
            height: constraints.height,
        };
        Box::pin(async move { Ok(Box::new(stream) as Box<dyn CaptureStream>) })
    }
}

impl CaptureStream for SyntheticStream {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move {
            tokio::time::sleep(self.period).await;
            self.sequence += 1;
            Ok(Some(Frame {
                sequence: self.sequence,
                captured_at: Instant::now(),
                width: self.width,
                height: self.height,
                jpeg: Bytes::from_static(FAKE_JPEG),
            }))
        })
    }

    fn stop(&mut self) {
        tracing::debug!(frames = self.sequence, "synthetic camera stopped");
    }
}

/// Builds a registry with one synthetic detector per modality.
pub fn detectors(load_delay: Duration) -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    for modality in Modality::ALL {
        registry.register(DetectorAdapter::new(modality, SyntheticLoader { modality, load_delay }));
    }
    registry
}

struct SyntheticLoader {
    modality: Modality,
    load_delay: Duration,
}

impl DetectorLoader for SyntheticLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn DetectionModel>>> {
        Box::pin(async move {
            tokio::time::sleep(self.load_delay).await;
            tracing::info!(modality = %self.modality, "synthetic detector loaded");
            Ok(Arc::new(SyntheticModel { modality: self.modality }) as Arc<dyn DetectionModel>)
        })
    }
}

struct SyntheticModel {
    modality: Modality,
}

/// Slow drift in `[0, 1]` so readings move over time.
fn wave(timestamp_ms: u64, period_ms: u64) -> f32 {
    let phase = (timestamp_ms % period_ms) as f32 / period_ms as f32;
    0.5 + 0.5 * (phase * std::f32::consts::TAU).sin()
}

fn ring(count: usize, cx: f32, cy: f32, radius: f32) -> Vec<Landmark> {
    (0..count)
        .map(|i| {
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            Landmark {
                x: cx + radius * angle.cos(),
                y: cy + radius * angle.sin(),
                z: 0.0,
                visibility: Some(0.9),
            }
        })
        .collect()
}

impl DetectionModel for SyntheticModel {
    fn detect(&self, _frame: &Frame, timestamp_ms: u64) -> Result<Option<Detection>> {
        let drift = wave(timestamp_ms, 4_000);
        let cx = 0.4 + 0.2 * drift;

        let detection = match self.modality {
            Modality::Face => Detection::Face(FaceReading {
                faces: vec![FaceMesh {
                    landmarks: ring(36, cx, 0.35, 0.1),
                    bounding_box: BoundingBox {
                        x: cx - 0.1,
                        y: 0.25,
                        width: 0.2,
                        height: 0.2,
                    },
                    confidence: 0.95,
                }],
            }),
            Modality::Pose => Detection::Pose(PoseReading {
                landmarks: ring(33, cx, 0.55, 0.25),
                confidence: 0.9,
            }),
            Modality::Hands => Detection::Hands(HandReading {
                hands: vec![Hand {
                    handedness: Handedness::Right,
                    landmarks: ring(21, cx + 0.2, 0.6, 0.05),
                    gesture: (drift > 0.6).then(|| Gesture {
                        name: "open_palm".to_string(),
                        score: drift,
                    }),
                }],
            }),
            Modality::Objects => Detection::Objects(ObjectReading {
                objects: vec![DetectedObject {
                    label: "cup".to_string(),
                    score: 0.7,
                    bounding_box: BoundingBox {
                        x: 0.7,
                        y: 0.6,
                        width: 0.1,
                        height: 0.15,
                    },
                }],
            }),
            Modality::Bio => Detection::Bio(BioReading {
                expressions: vec![
                    ExpressionScore {
                        label: "happy".to_string(),
                        score: drift,
                    },
                    ExpressionScore {
                        label: "neutral".to_string(),
                        score: 1.0 - drift,
                    },
                ],
                age_estimate: Some(31.0),
                attention: 0.6 + 0.4 * drift,
            }),
            Modality::Speech => {
                // silence most of the time
                if drift < 0.7 {
                    return Ok(None);
                }
                Detection::Speech(SpeechReading {
                    transcript: "this looks amazing".to_string(),
                    is_final: true,
                    sentiment: Sentiment {
                        label: SentimentLabel::Positive,
                        score: drift,
                    },
                })
            }
        };
        Ok(Some(detection))
    }

    fn close(&self) {
        tracing::debug!(modality = %self.modality, "synthetic detector closed");
    }
}

/// Streams canned descriptions word by word.
pub struct SyntheticVlm {
    cycle: AtomicU64,
    word_delay: Duration,
}

impl SyntheticVlm {
    pub fn new(word_delay: Duration) -> Self {
        Self {
            cycle: AtomicU64::new(0),
            word_delay,
        }
    }
}

const DESCRIPTIONS: &[&str] = &[
    "A smiling person leaning forward, attentive and nodding.",
    "The visitor looks calm and relaxed, watching the screen.",
    "Someone glancing away with arms crossed, not engaged.",
];

impl VisionLanguageModel for SyntheticVlm {
    fn generate(&self, _frame: Arc<Frame>, _prompt: String) -> BoxStream<'static, Result<String>> {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) as usize;
        let text = DESCRIPTIONS[cycle % DESCRIPTIONS.len()];
        let delay = self.word_delay;
        let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();

        stream::iter(words)
            .then(move |word| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, KioskError>(word)
            })
            .boxed()
    }
}

/// In-process backend that answers frames with engagement updates.
pub struct LoopbackConnector;

struct LoopbackConnection {
    replies: mpsc::UnboundedSender<String>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Connector for LoopbackConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
        Box::pin(async move {
            tracing::info!(url, "loopback backend accepted connection");
            let (replies, inbox) = mpsc::unbounded_channel();
            Ok(Box::new(LoopbackConnection {
                replies,
                inbox: tokio::sync::Mutex::new(inbox),
            }) as Box<dyn Connection>)
        })
    }
}

impl LoopbackConnection {
    fn reply_to(&self, message: &Value) -> Option<Value> {
        match message.get("type").and_then(Value::as_str)? {
            "ping" => Some(json!({ "type": "pong" })),
            "video_frame" => {
                let keywords = message
                    .get("fastvlm_keywords")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                Some(json!({
                    "type": "engagement_update",
                    "data": { "keywords": keywords, "engaged": keywords > 0 },
                }))
            }
            _ => None,
        }
    }
}

impl Connection for LoopbackConnection {
    fn send(&self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message: Value = serde_json::from_str(&text)?;
            if let Some(reply) = self.reply_to(&message) {
                self.replies
                    .send(reply.to_string())
                    .map_err(|_| KioskError::Transport("loopback closed".into()))?;
            }
            Ok::<(), KioskError>(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<Result<String>>> {
        Box::pin(async move { self.inbox.lock().await.recv().await.map(Ok) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inbox.lock().await.close();
        })
    }
}
