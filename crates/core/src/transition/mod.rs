//! Scene transition state machine.
//!
//! A transition is a fixed timeline of actions, each at an offset measured
//! from the moment the transition started. The driver sleeps until each
//! absolute deadline, so slow downstream work never shifts later phases.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};

/// Source and destination of the single activation transition.
pub const ACTIVATION: (usize, usize) = (0, 1);

pub const PORTAL_DURATION: Duration = Duration::from_millis(3_000);
pub const PORTAL_SWAP_OFFSET: Duration = Duration::from_millis(1_000);
pub const BLUR_SCALE_DURATION: Duration = Duration::from_millis(800);
pub const BLUR_SCALE_SWAP_OFFSET: Duration = Duration::from_millis(400);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPhase {
    Idle,
    Converging,
    Bursting,
    Washing,
    Revealing,
    Exiting,
    Entering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionVariant {
    Portal,
    BlurScale,
}

impl TransitionVariant {
    pub fn select(from: usize, to: usize) -> Self {
        if (from, to) == ACTIVATION {
            TransitionVariant::Portal
        } else {
            TransitionVariant::BlurScale
        }
    }

    pub fn total_duration(self) -> Duration {
        match self {
            TransitionVariant::Portal => PORTAL_DURATION,
            TransitionVariant::BlurScale => BLUR_SCALE_DURATION,
        }
    }

    pub fn swap_offset(self) -> Duration {
        match self {
            TransitionVariant::Portal => PORTAL_SWAP_OFFSET,
            TransitionVariant::BlurScale => BLUR_SCALE_SWAP_OFFSET,
        }
    }
}

/// Decorative layer shown during the portal variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overlay {
    Ring,
    Wash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimelineAction {
    Phase(TransitionPhase),
    ShowOverlay(Overlay),
    HideOverlay(Overlay),
    Swap,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledAction {
    pub offset: Duration,
    pub action: TimelineAction,
}

impl ScheduledAction {
    fn at(millis: u64, action: TimelineAction) -> Self {
        Self {
            offset: Duration::from_millis(millis),
            action,
        }
    }
}

/// Ordered action list for one transition with a cursor over it.
#[derive(Debug, Clone)]
pub struct TransitionTimeline {
    variant: TransitionVariant,
    actions: Vec<ScheduledAction>,
    next_action: usize,
}

impl TransitionTimeline {
    pub fn new(variant: TransitionVariant) -> Self {
        use TimelineAction::*;
        use TransitionPhase::*;

        let mut actions = match variant {
            TransitionVariant::Portal => vec![
                ScheduledAction::at(0, Phase(Converging)),
                ScheduledAction::at(800, Phase(Bursting)),
                ScheduledAction::at(800, ShowOverlay(Overlay::Ring)),
                ScheduledAction::at(1_000, Swap),
                ScheduledAction::at(1_200, Phase(Washing)),
                ScheduledAction::at(1_200, ShowOverlay(Overlay::Wash)),
                ScheduledAction::at(1_600, HideOverlay(Overlay::Ring)),
                ScheduledAction::at(2_000, Phase(Revealing)),
                ScheduledAction::at(2_400, HideOverlay(Overlay::Wash)),
                ScheduledAction::at(3_000, Phase(Idle)),
                ScheduledAction::at(3_000, Complete),
            ],
            TransitionVariant::BlurScale => vec![
                ScheduledAction::at(0, Phase(Exiting)),
                ScheduledAction::at(400, Swap),
                ScheduledAction::at(400, Phase(Entering)),
                ScheduledAction::at(800, Phase(Idle)),
                ScheduledAction::at(800, Complete),
            ],
        };
        // stable: equal offsets keep their listed order
        actions.sort_by_key(|scheduled| scheduled.offset);

        Self {
            variant,
            actions,
            next_action: 0,
        }
    }

    pub fn variant(&self) -> TransitionVariant {
        self.variant
    }

    pub fn actions(&self) -> &[ScheduledAction] {
        &self.actions
    }

    /// Offset of the next pending action.
    pub fn next_offset(&self) -> Option<Duration> {
        self.actions.get(self.next_action).map(|scheduled| scheduled.offset)
    }

    pub fn is_finished(&self) -> bool {
        self.next_action >= self.actions.len()
    }

    /// Returns every action due at or before `elapsed`, in order, and moves
    /// the cursor past them.
    pub fn advance_to(&mut self, elapsed: Duration) -> Vec<TimelineAction> {
        let mut due = Vec::new();
        while let Some(scheduled) = self.actions.get(self.next_action) {
            if scheduled.offset > elapsed {
                break;
            }
            due.push(scheduled.action);
            self.next_action += 1;
        }
        due
    }
}

/// Broadcast to decorative UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransitionEvent {
    Started {
        from: usize,
        to: usize,
        variant: TransitionVariant,
    },
    Phase {
        phase: TransitionPhase,
        offset_ms: u64,
    },
    Overlay {
        overlay: Overlay,
        visible: bool,
        offset_ms: u64,
    },
    Swap {
        from: usize,
        to: usize,
        offset_ms: u64,
    },
    Complete {
        from: usize,
        to: usize,
        offset_ms: u64,
    },
}

/// The two hooks a transition calls, each exactly once.
pub struct TransitionCallbacks {
    on_swap: Box<dyn FnOnce() + Send>,
    on_complete: Box<dyn FnOnce() + Send>,
}

impl TransitionCallbacks {
    pub fn new(
        on_swap: impl FnOnce() + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            on_swap: Box::new(on_swap),
            on_complete: Box::new(on_complete),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| {}, || {})
    }
}

impl std::fmt::Debug for TransitionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionCallbacks").finish_non_exhaustive()
    }
}

/// Runs at most one transition at a time.
#[derive(Debug, Clone)]
pub struct TransitionMachine {
    phase: Arc<watch::Sender<TransitionPhase>>,
    events: broadcast::Sender<TransitionEvent>,
    active: Arc<AtomicBool>,
}

impl Default for TransitionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionMachine {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(TransitionPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            phase: Arc::new(phase),
            events,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> TransitionPhase {
        *self.phase.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<TransitionPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Starts a transition from scene `from` to scene `to`.
    ///
    /// Returns `false` and drops `callbacks` uncalled when another transition
    /// is running or when `from == to`.
    pub fn request(&self, from: usize, to: usize, callbacks: TransitionCallbacks) -> bool {
        if from == to {
            tracing::debug!(scene = from, "ignoring transition to the current scene");
            return false;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(from, to, "transition already active, request ignored");
            return false;
        }

        let variant = TransitionVariant::select(from, to);
        tracing::info!(from, to, ?variant, "scene transition started");
        let _ = self.events.send(TransitionEvent::Started { from, to, variant });

        tokio::spawn(drive(self.clone(), from, to, TransitionTimeline::new(variant), callbacks));
        true
    }
}

/// Clears the machine's active flag if `drive` stops before its Complete
/// action, for instance when a host callback panics.
struct ActiveGuard<'a> {
    machine: &'a TransitionMachine,
    armed: bool,
}

impl ActiveGuard<'_> {
    fn release(&mut self) {
        self.machine.active.store(false, Ordering::SeqCst);
        self.armed = false;
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("scene transition aborted before completing");
            self.machine.phase.send_replace(TransitionPhase::Idle);
            self.machine.active.store(false, Ordering::SeqCst);
        }
    }
}

async fn drive(
    machine: TransitionMachine,
    from: usize,
    to: usize,
    mut timeline: TransitionTimeline,
    callbacks: TransitionCallbacks,
) {
    let start = Instant::now();
    let mut guard = ActiveGuard {
        machine: &machine,
        armed: true,
    };
    let mut on_swap = Some(callbacks.on_swap);
    let mut on_complete = Some(callbacks.on_complete);

    while let Some(offset) = timeline.next_offset() {
        tokio::time::sleep_until(start + offset).await;
        let offset_ms = offset.as_millis() as u64;

        for action in timeline.advance_to(offset) {
            match action {
                TimelineAction::Phase(phase) => {
                    machine.phase.send_replace(phase);
                    let _ = machine.events.send(TransitionEvent::Phase { phase, offset_ms });
                }
                TimelineAction::ShowOverlay(overlay) | TimelineAction::HideOverlay(overlay) => {
                    let visible = matches!(action, TimelineAction::ShowOverlay(_));
                    let _ = machine.events.send(TransitionEvent::Overlay {
                        overlay,
                        visible,
                        offset_ms,
                    });
                }
                TimelineAction::Swap => {
                    if let Some(swap) = on_swap.take() {
                        swap();
                    }
                    let _ = machine.events.send(TransitionEvent::Swap { from, to, offset_ms });
                }
                TimelineAction::Complete => {
                    // a swap that never fired would break swap-before-complete
                    if let Some(swap) = on_swap.take() {
                        swap();
                    }
                    guard.release();
                    if let Some(complete) = on_complete.take() {
                        complete();
                    }
                    let _ = machine.events.send(TransitionEvent::Complete { from, to, offset_ms });
                    tracing::info!(from, to, "scene transition complete");
                }
            }
        }
    }
}
