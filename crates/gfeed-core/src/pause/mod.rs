//! Cooperative pause/resume coordination.
//!
//! Pauses take effect at chunk boundaries: the controller flips a watch
//! flag that the processor observes, optionally after waiting for an
//! acknowledgement (graceful mode). Every pause arms a watchdog bounded
//! by the maximum pause duration; a pause that outlives it is forcibly
//! resumed. Expected refusals (already paused, not paused) are values,
//! never errors.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::ProgressSnapshot;
use crate::config::StreamConfig;
use crate::events::{EventBus, StreamEvent};

/// Why a pause or resume request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseRefusal {
    /// A pause is already in effect (or being executed).
    AlreadyPaused,
    /// No pause is in effect.
    NotPaused,
    /// Pause/resume is disabled by configuration.
    Disabled,
    /// Another resume is already underway.
    ResumeInProgress,
    /// The saved snapshot failed validation.
    InvalidSavedState,
}

impl PauseRefusal {
    /// Stable reason code for callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            PauseRefusal::AlreadyPaused => "already_paused",
            PauseRefusal::NotPaused => "not_paused",
            PauseRefusal::Disabled => "disabled",
            PauseRefusal::ResumeInProgress => "resume_in_progress",
            PauseRefusal::InvalidSavedState => "invalid_saved_state",
        }
    }
}

/// Result of a pause request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// The pause executed.
    Paused {
        /// When the pause took effect.
        pause_time: Instant,
    },
    /// The request was refused.
    Refused(PauseRefusal),
}

impl PauseOutcome {
    /// Whether the pause executed.
    pub fn success(&self) -> bool {
        matches!(self, PauseOutcome::Paused { .. })
    }
}

/// Result of a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The resume executed.
    Resumed {
        /// When the resume took effect.
        resume_time: Instant,
        /// How long the stream was paused.
        pause_duration: Duration,
    },
    /// The request was refused.
    Refused(PauseRefusal),
}

impl ResumeOutcome {
    /// Whether the resume executed.
    pub fn success(&self) -> bool {
        matches!(self, ResumeOutcome::Resumed { .. })
    }
}

/// Snapshot captured at pause time for later validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    /// Progress at the moment of the pause.
    pub snapshot: ProgressSnapshot,
    /// Capture time, unix milliseconds.
    pub captured_at: u64,
}

/// Pause/resume statistics for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PauseStats {
    /// Pauses executed.
    pub pause_count: u64,
    /// Resumes executed (including forced ones).
    pub resume_count: u64,
    /// Resumes forced by the watchdog.
    pub forced_resume_count: u64,
    /// Pause requests refused.
    pub refused_pauses: u64,
    /// Resume requests refused.
    pub refused_resumes: u64,
    /// Shortest observed pause.
    pub min_pause: Option<Duration>,
    /// Longest observed pause.
    pub max_pause: Option<Duration>,
    /// Sum of all pause durations.
    pub total_paused: Duration,
}

impl PauseStats {
    /// Mean pause duration over all resumes.
    pub fn average_pause(&self) -> Option<Duration> {
        (self.resume_count > 0).then(|| self.total_paused / self.resume_count as u32)
    }

    /// Fraction of pause requests that executed.
    pub fn pause_success_rate(&self) -> f64 {
        let attempts = self.pause_count + self.refused_pauses;
        if attempts == 0 {
            return 1.0;
        }
        self.pause_count as f64 / attempts as f64
    }
}

#[derive(Debug, Default)]
struct PauseState {
    is_paused: bool,
    is_pausing: bool,
    is_resuming: bool,
    pause_time: Option<Instant>,
    pause_reason: Option<String>,
    saved_state: Option<SavedState>,
}

struct Shared {
    config: StreamConfig,
    events: EventBus,
    state: Mutex<PauseState>,
    stats: Mutex<PauseStats>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    paused_tx: watch::Sender<bool>,
    ack: Notify,
}

/// Coordinates graceful and immediate pausing of the stream.
#[derive(Clone)]
pub struct PauseController {
    shared: Arc<Shared>,
}

impl PauseController {
    /// Create a controller for the given configuration.
    pub fn new(config: StreamConfig, events: EventBus) -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                events,
                state: Mutex::new(PauseState::default()),
                stats: Mutex::new(PauseStats::default()),
                callbacks: Mutex::new(Vec::new()),
                watchdog: Mutex::new(None),
                paused_tx,
                ack: Notify::new(),
            }),
        }
    }

    /// Paused-flag receiver for the processing loop to observe.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.paused_tx.subscribe()
    }

    /// Whether a pause is currently in effect.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().expect("pause state poisoned").is_paused
    }

    /// Acknowledge a pending graceful pause request.
    ///
    /// Called by workers once they reach a safe point; unblocks the
    /// pause-readiness wait.
    pub fn acknowledge_pause(&self) {
        self.shared.ack.notify_waiters();
    }

    /// Queue a callback invoked exactly once on the next resume.
    pub fn on_resume(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .expect("pause callbacks poisoned")
            .push(Box::new(callback));
    }

    /// Request a pause, optionally preserving a progress snapshot.
    ///
    /// In graceful mode the controller signals a pause request and waits
    /// up to the readiness timeout for an acknowledgement before
    /// executing; the pause proceeds either way. On success a watchdog is
    /// armed at the maximum pause duration.
    pub async fn request_pause(
        &self,
        reason: &str,
        preserve: Option<ProgressSnapshot>,
    ) -> PauseOutcome {
        {
            let mut state = self.shared.state.lock().expect("pause state poisoned");
            if !self.shared.config.enable_pause_resume {
                drop(state);
                return self.refuse_pause(PauseRefusal::Disabled);
            }
            if state.is_paused || state.is_pausing {
                drop(state);
                return self.refuse_pause(PauseRefusal::AlreadyPaused);
            }
            state.is_pausing = true;
        }

        if self.shared.config.enable_graceful_pause {
            self.shared.events.emit(StreamEvent::PauseRequested {
                reason: reason.to_string(),
            });
            let wait = tokio::time::timeout(
                self.shared.config.pause_ready_timeout,
                self.shared.ack.notified(),
            )
            .await;
            if wait.is_err() {
                warn!(reason, "pause readiness wait timed out; pausing anyway");
            }
        }

        let pause_time = Instant::now();
        {
            let mut state = self.shared.state.lock().expect("pause state poisoned");
            state.is_pausing = false;
            state.is_paused = true;
            state.pause_time = Some(pause_time);
            state.pause_reason = Some(reason.to_string());
            state.saved_state = preserve.map(|snapshot| SavedState {
                snapshot,
                captured_at: crate::checkpoint::now_millis(),
            });
        }
        let _ = self.shared.paused_tx.send(true);
        self.shared.stats.lock().expect("pause stats poisoned").pause_count += 1;

        info!(reason, "stream paused");
        self.shared.events.emit(StreamEvent::StreamPaused {
            reason: reason.to_string(),
        });

        self.arm_watchdog();
        PauseOutcome::Paused { pause_time }
    }

    /// Request a resume, optionally validating the saved snapshot.
    pub async fn request_resume(&self, validate_saved_state: bool) -> ResumeOutcome {
        let pause_time = {
            let mut state = self.shared.state.lock().expect("pause state poisoned");
            if !state.is_paused {
                drop(state);
                return self.refuse_resume(PauseRefusal::NotPaused);
            }
            if state.is_resuming {
                drop(state);
                return self.refuse_resume(PauseRefusal::ResumeInProgress);
            }

            if validate_saved_state {
                let max_age_ms = self.shared.config.max_pause_duration.as_millis() as u64;
                let valid = state.saved_state.as_ref().is_some_and(|saved| {
                    saved.captured_at > 0
                        && crate::checkpoint::now_millis().saturating_sub(saved.captured_at)
                            <= max_age_ms
                });
                if !valid {
                    drop(state);
                    return self.refuse_resume(PauseRefusal::InvalidSavedState);
                }
            }

            state.is_resuming = true;
            state.pause_time
        };

        let outcome = self.execute_resume(pause_time, false);
        outcome
    }

    /// Pause/resume statistics.
    pub fn stats(&self) -> PauseStats {
        *self.shared.stats.lock().expect("pause stats poisoned")
    }

    /// The snapshot captured by the current pause, if any.
    pub fn saved_state(&self) -> Option<SavedState> {
        self.shared
            .state
            .lock()
            .expect("pause state poisoned")
            .saved_state
            .clone()
    }

    fn refuse_pause(&self, refusal: PauseRefusal) -> PauseOutcome {
        debug!(reason = refusal.code(), "pause refused");
        self.shared.stats.lock().expect("pause stats poisoned").refused_pauses += 1;
        PauseOutcome::Refused(refusal)
    }

    fn refuse_resume(&self, refusal: PauseRefusal) -> ResumeOutcome {
        debug!(reason = refusal.code(), "resume refused");
        self.shared.stats.lock().expect("pause stats poisoned").refused_resumes += 1;
        ResumeOutcome::Refused(refusal)
    }

    fn execute_resume(&self, pause_time: Option<Instant>, forced: bool) -> ResumeOutcome {
        let resume_time = Instant::now();
        let pause_duration = pause_time.map(|t| t.elapsed()).unwrap_or_default();

        {
            let mut state = self.shared.state.lock().expect("pause state poisoned");
            state.is_paused = false;
            state.is_resuming = false;
            state.pause_time = None;
            state.pause_reason = None;
            state.saved_state = None;
        }
        let _ = self.shared.paused_tx.send(false);

        if let Some(task) = self
            .shared
            .watchdog
            .lock()
            .expect("pause watchdog poisoned")
            .take()
        {
            if !forced {
                task.abort();
            }
        }

        let callbacks: Vec<_> = std::mem::take(
            &mut *self
                .shared
                .callbacks
                .lock()
                .expect("pause callbacks poisoned"),
        );
        for callback in callbacks {
            callback();
        }

        {
            let mut stats = self.shared.stats.lock().expect("pause stats poisoned");
            stats.resume_count += 1;
            if forced {
                stats.forced_resume_count += 1;
            }
            stats.total_paused += pause_duration;
            stats.min_pause = Some(stats.min_pause.map_or(pause_duration, |m| m.min(pause_duration)));
            stats.max_pause = Some(stats.max_pause.map_or(pause_duration, |m| m.max(pause_duration)));
        }

        info!(pause_ms = pause_duration.as_millis() as u64, forced, "stream resumed");
        self.shared
            .events
            .emit(StreamEvent::StreamResumed { pause_duration });

        ResumeOutcome::Resumed {
            resume_time,
            pause_duration,
        }
    }

    fn arm_watchdog(&self) {
        let shared = Arc::clone(&self.shared);
        let max_pause = self.shared.config.max_pause_duration;
        let controller = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(max_pause).await;

            let pause_time = {
                let mut state = shared.state.lock().expect("pause state poisoned");
                if !state.is_paused || state.is_resuming {
                    return;
                }
                state.is_resuming = true;
                state.pause_time
            };

            warn!(
                max_pause_ms = max_pause.as_millis() as u64,
                "maximum pause duration exceeded; forcing resume"
            );
            let pause_duration = pause_time.map(|t| t.elapsed()).unwrap_or_default();
            shared
                .events
                .emit(StreamEvent::PauseTimeoutExceeded { pause_duration });
            controller.execute_resume(pause_time, true);
        });
        *self
            .shared
            .watchdog
            .lock()
            .expect("pause watchdog poisoned") = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn immediate_config() -> StreamConfig {
        StreamConfig {
            enable_graceful_pause: false,
            ..StreamConfig::default()
        }
    }

    fn snapshot() -> ProgressSnapshot {
        ProgressSnapshot {
            current_chunk: 1,
            total_chunks: 4,
            current_line: 1000,
            total_lines: 4000,
            bytes_processed: 10_000,
            total_bytes: 40_000,
            started_at: crate::checkpoint::now_millis(),
            paused_at: None,
        }
    }

    #[tokio::test]
    async fn pause_then_resume() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());

        let pause = controller.request_pause("operator", None).await;
        assert!(pause.success());
        assert!(controller.is_paused());

        let resume = controller.request_resume(false).await;
        assert!(resume.success());
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn pause_while_paused_is_refused() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());
        controller.request_pause("first", None).await;

        let second = controller.request_pause("second", None).await;
        assert_eq!(second, PauseOutcome::Refused(PauseRefusal::AlreadyPaused));
        match second {
            PauseOutcome::Refused(refusal) => assert_eq!(refusal.code(), "already_paused"),
            _ => panic!("expected refusal"),
        }
    }

    #[tokio::test]
    async fn resume_while_running_is_refused() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());
        let outcome = controller.request_resume(false).await;
        assert_eq!(outcome, ResumeOutcome::Refused(PauseRefusal::NotPaused));
        match outcome {
            ResumeOutcome::Refused(refusal) => assert_eq!(refusal.code(), "not_paused"),
            _ => panic!("expected refusal"),
        }
    }

    #[tokio::test]
    async fn disabled_pause_is_refused() {
        let config = StreamConfig {
            enable_pause_resume: false,
            ..StreamConfig::default()
        };
        let controller = PauseController::new(config, EventBus::disabled());
        let outcome = controller.request_pause("operator", None).await;
        assert_eq!(outcome, PauseOutcome::Refused(PauseRefusal::Disabled));
    }

    #[tokio::test]
    async fn graceful_pause_waits_for_acknowledgement() {
        let (bus, mut rx) = EventBus::channel();
        let controller = PauseController::new(StreamConfig::default(), bus);

        let pauser = controller.clone();
        let task = tokio::spawn(async move { pauser.request_pause("tool change", None).await });

        // The request event precedes the pause itself
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            StreamEvent::PauseRequested {
                reason: "tool change".into()
            }
        );
        assert!(!controller.is_paused());

        controller.acknowledge_pause();
        assert!(task.await.unwrap().success());
        assert!(controller.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_pause_proceeds_after_readiness_timeout() {
        let controller = PauseController::new(StreamConfig::default(), EventBus::disabled());
        // Nobody acknowledges; the readiness timeout elapses on the
        // paused clock and the pause still executes
        let outcome = controller.request_pause("unattended", None).await;
        assert!(outcome.success());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_forces_resume() {
        let config = StreamConfig {
            enable_graceful_pause: false,
            max_pause_duration: Duration::from_secs(60),
            ..StreamConfig::default()
        };
        let (bus, mut rx) = EventBus::channel();
        let controller = PauseController::new(config, bus);

        controller.request_pause("forgotten", None).await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!controller.is_paused());
        let stats = controller.stats();
        assert_eq!(stats.forced_resume_count, 1);

        let mut saw_timeout = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StreamEvent::PauseTimeoutExceeded { .. }) {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn resume_callbacks_run_exactly_once() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let c = Arc::clone(&counter);
        controller.on_resume(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        controller.request_pause("x", None).await;
        controller.request_resume(false).await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second cycle must not re-run the drained callback
        controller.request_pause("y", None).await;
        controller.request_resume(false).await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saved_state_is_validated_on_resume() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());

        // No snapshot preserved: validated resume is refused
        controller.request_pause("x", None).await;
        let outcome = controller.request_resume(true).await;
        assert_eq!(
            outcome,
            ResumeOutcome::Refused(PauseRefusal::InvalidSavedState)
        );
        // Unvalidated resume still works
        assert!(controller.request_resume(false).await.success());

        // With a snapshot the validated resume succeeds
        controller.request_pause("y", Some(snapshot())).await;
        assert!(controller.saved_state().is_some());
        assert!(controller.request_resume(true).await.success());
        assert!(controller.saved_state().is_none());
    }

    #[tokio::test]
    async fn stats_track_counts_and_durations() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());

        controller.request_pause("a", None).await;
        controller.request_resume(false).await;
        controller.request_resume(false).await; // refused
        controller.request_pause("b", None).await;
        controller.request_pause("c", None).await; // refused
        controller.request_resume(false).await;

        let stats = controller.stats();
        assert_eq!(stats.pause_count, 2);
        assert_eq!(stats.resume_count, 2);
        assert_eq!(stats.refused_pauses, 1);
        assert_eq!(stats.refused_resumes, 1);
        assert!(stats.min_pause.is_some());
        assert!(stats.max_pause.unwrap() >= stats.min_pause.unwrap());
        assert!(stats.average_pause().is_some());
        assert!((stats.pause_success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn watch_flag_follows_pause_state() {
        let controller = PauseController::new(immediate_config(), EventBus::disabled());
        let rx = controller.subscribe();

        assert!(!*rx.borrow());
        controller.request_pause("x", None).await;
        assert!(*rx.borrow());
        controller.request_resume(false).await;
        assert!(!*rx.borrow());
    }
}
