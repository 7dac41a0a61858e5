//! Host memory-pressure monitoring and adaptive chunk sizing.
//!
//! Samples memory usage on a configurable interval, classifies pressure
//! against the configured ceiling, runs cleanup passes under pressure,
//! and recommends chunk-size adjustments. Pressure is a signalled state,
//! never an error - nothing here aborts processing.

pub mod sampler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::events::{EventBus, StreamEvent};

pub use sampler::{MemorySampler, ScriptedSampler, SysinfoSampler};

/// Rolling history capacity; trimmed to [`HISTORY_TRIM`] newest on overflow.
const HISTORY_CAP: usize = 100;
const HISTORY_TRIM: usize = 50;

/// Samples examined by leak detection.
const LEAK_WINDOW: usize = 10;
/// Fraction of increasing consecutive pairs that triggers a leak report.
const LEAK_RATIO: f64 = 0.8;

/// Classified memory pressure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Below the warning threshold.
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

/// Snapshot of memory usage figures. Read-only to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryState {
    /// Most recent sample in bytes.
    pub current_usage: u64,
    /// Highest sample observed.
    pub peak_usage: u64,
    /// First sample observed after construction.
    pub baseline_usage: u64,
}

/// Suspected memory leak over the recent sample window.
///
/// A heuristic signal, not proof: it only ever produces a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    /// Usage growth across the window in bytes.
    pub growth_bytes: u64,
    /// Consecutive sample pairs that increased.
    pub increasing_pairs: usize,
    /// Pairs examined.
    pub window_pairs: usize,
}

struct TrackedChunk {
    bytes: u64,
    completed: bool,
}

struct Inner {
    sampler: Box<dyn MemorySampler>,
    state: MemoryState,
    history: Vec<u64>,
    tracked_chunks: HashMap<usize, TrackedChunk>,
    baseline_set: bool,
}

/// Monitors host memory and advises the chunk processor.
pub struct MemoryManager {
    config: StreamConfig,
    events: EventBus,
    inner: Arc<Mutex<Inner>>,
    monitor: Option<JoinHandle<()>>,
}

impl MemoryManager {
    /// Create a manager sampling the current process.
    pub fn new(config: StreamConfig, events: EventBus) -> Self {
        Self::with_sampler(config, events, Box::new(SysinfoSampler::new()))
    }

    /// Create a manager with an injected sampler (used by tests).
    pub fn with_sampler(
        config: StreamConfig,
        events: EventBus,
        sampler: Box<dyn MemorySampler>,
    ) -> Self {
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(Inner {
                sampler,
                state: MemoryState {
                    current_usage: 0,
                    peak_usage: 0,
                    baseline_usage: 0,
                },
                history: Vec::new(),
                tracked_chunks: HashMap::new(),
                baseline_set: false,
            })),
            monitor: None,
        }
    }

    /// Start the periodic sampling task. No-op if already running.
    pub fn start_monitoring(&mut self) {
        if self.monitor.is_some() {
            return;
        }
        let interval = self.config.monitor_interval;
        let manager = self.handle();
        debug!(interval_ms = interval.as_millis() as u64, "memory monitoring started");
        self.monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.check_memory_usage();
                manager.detect_memory_leaks();
            }
        }));
    }

    /// Stop the periodic sampling task. No-op if not running.
    pub fn stop_monitoring(&mut self) {
        if let Some(task) = self.monitor.take() {
            task.abort();
            debug!("memory monitoring stopped");
        }
    }

    /// A cheap shareable handle for the monitor task and the processor.
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            config: self.config.clone(),
            events: self.events.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Sample now and classify pressure. See [`MemoryHandle::check_memory_usage`].
    pub fn check_memory_usage(&self) -> MemoryPressure {
        self.handle().check_memory_usage()
    }

    /// Current usage snapshot.
    pub fn state(&self) -> MemoryState {
        self.inner.lock().expect("memory state poisoned").state
    }

    /// See [`MemoryHandle::chunk_size_recommendation`].
    pub fn chunk_size_recommendation(&self, current: usize) -> usize {
        self.handle().chunk_size_recommendation(current)
    }

    /// See [`MemoryHandle::is_memory_available`].
    pub fn is_memory_available(&self, required_bytes: u64) -> bool {
        self.handle().is_memory_available(required_bytes)
    }

    /// See [`MemoryHandle::detect_memory_leaks`].
    pub fn detect_memory_leaks(&self) -> Option<LeakReport> {
        self.handle().detect_memory_leaks()
    }

    /// See [`MemoryHandle::track_chunk`].
    pub fn track_chunk(&self, index: usize, bytes: u64) {
        self.handle().track_chunk(index, bytes);
    }

    /// See [`MemoryHandle::complete_chunk`].
    pub fn complete_chunk(&self, index: usize) {
        self.handle().complete_chunk(index);
    }

    /// Number of samples currently retained.
    pub fn history_len(&self) -> usize {
        self.inner.lock().expect("memory state poisoned").history.len()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Cloneable view of a [`MemoryManager`] shared with the monitor task
/// and the chunk processor.
#[derive(Clone)]
pub struct MemoryHandle {
    config: StreamConfig,
    events: EventBus,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHandle {
    /// Sample current usage, update peak/history, classify pressure.
    ///
    /// Warning pressure runs a cleanup pass; critical pressure
    /// additionally requests a forced allocator release.
    pub fn check_memory_usage(&self) -> MemoryPressure {
        let usage = {
            let mut inner = self.inner.lock().expect("memory state poisoned");
            let usage = inner.sampler.sample();

            if !inner.baseline_set {
                inner.state.baseline_usage = usage;
                inner.baseline_set = true;
            }
            inner.state.current_usage = usage;
            inner.state.peak_usage = inner.state.peak_usage.max(usage);

            inner.history.push(usage);
            if inner.history.len() > HISTORY_CAP {
                let drop_count = inner.history.len() - HISTORY_TRIM;
                inner.history.drain(..drop_count);
            }
            usage
        };

        let fraction = self.usage_fraction(usage);
        let pressure = self.classify(fraction);

        self.events.emit(StreamEvent::MemoryStatus {
            usage_bytes: usage,
            usage_fraction: fraction,
            pressure,
        });

        match pressure {
            MemoryPressure::Normal => {}
            MemoryPressure::Warning => {
                warn!(usage, fraction, "memory pressure: warning");
                self.events.emit(StreamEvent::MemoryWarning { usage_bytes: usage });
                self.optimize_memory();
            }
            MemoryPressure::Critical => {
                warn!(usage, fraction, "memory pressure: critical");
                self.events.emit(StreamEvent::MemoryCritical { usage_bytes: usage });
                self.optimize_memory();
                if self.force_garbage_collection() {
                    self.events.emit(StreamEvent::GarbageCollected);
                }
            }
        }

        pressure
    }

    /// Recommend a chunk size for the current usage fraction.
    ///
    /// Pure given current usage: shrinks by the configured factor at
    /// critical, by 25% at warning, grows by 25% under half usage,
    /// otherwise unchanged. Never below one line.
    pub fn chunk_size_recommendation(&self, current: usize) -> usize {
        let usage = self.inner.lock().expect("memory state poisoned").state.current_usage;
        let fraction = self.usage_fraction(usage);

        let scaled = if fraction >= self.config.critical_threshold {
            current as f64 * self.config.critical_reduction_factor
        } else if fraction >= self.config.warning_threshold {
            current as f64 * 0.75
        } else if fraction < 0.5 {
            current as f64 * 1.25
        } else {
            current as f64
        };

        (scaled as usize).max(1)
    }

    /// Whether projected usage stays under the warning threshold.
    pub fn is_memory_available(&self, required_bytes: u64) -> bool {
        let usage = self.inner.lock().expect("memory state poisoned").state.current_usage;
        usage.saturating_add(required_bytes) < self.config.warning_bytes()
    }

    /// Examine the recent sample window for sustained growth.
    ///
    /// Reports a suspected leak when more than 80% of consecutive pairs
    /// increased. Warn-only; never blocks processing.
    pub fn detect_memory_leaks(&self) -> Option<LeakReport> {
        let inner = self.inner.lock().expect("memory state poisoned");
        if inner.history.len() < LEAK_WINDOW {
            return None;
        }
        let window = &inner.history[inner.history.len() - LEAK_WINDOW..];
        let window_pairs = window.len() - 1;
        let increasing_pairs = window.windows(2).filter(|pair| pair[1] > pair[0]).count();

        if (increasing_pairs as f64) <= LEAK_RATIO * window_pairs as f64 {
            return None;
        }

        let growth_bytes = window[window.len() - 1].saturating_sub(window[0]);
        drop(inner);

        warn!(
            growth_bytes,
            increasing_pairs, window_pairs, "suspected memory leak in recent samples"
        );
        self.events
            .emit(StreamEvent::MemoryLeakDetected { growth_bytes });

        Some(LeakReport {
            growth_bytes,
            increasing_pairs,
            window_pairs,
        })
    }

    /// Soft cleanup: prune sample history and completed chunk entries.
    ///
    /// Returns the number of entries freed.
    pub fn optimize_memory(&self) -> usize {
        let freed = {
            let mut inner = self.inner.lock().expect("memory state poisoned");
            let mut freed = 0;

            if inner.history.len() > HISTORY_TRIM {
                freed += inner.history.len() - HISTORY_TRIM;
                let drop_count = inner.history.len() - HISTORY_TRIM;
                inner.history.drain(..drop_count);
            }

            let before = inner.tracked_chunks.len();
            inner.tracked_chunks.retain(|_, chunk| !chunk.completed);
            freed += before - inner.tracked_chunks.len();
            freed
        };

        debug!(freed, "memory optimization pass");
        self.events
            .emit(StreamEvent::MemoryOptimized { freed_entries: freed });
        freed
    }

    /// Ask the allocator to return free pages to the OS, if it can.
    ///
    /// Returns whether a release pass actually ran. Absence of the
    /// capability is not an error.
    pub fn force_garbage_collection(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: malloc_trim has no preconditions and only touches
            // allocator-internal free lists.
            let trimmed = unsafe { libc::malloc_trim(0) };
            debug!(trimmed, "malloc_trim requested");
            trimmed != 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            debug!("allocator exposes no forced release on this platform");
            false
        }
    }

    /// Record memory attributed to an in-flight chunk.
    pub fn track_chunk(&self, index: usize, bytes: u64) {
        let mut inner = self.inner.lock().expect("memory state poisoned");
        inner.tracked_chunks.insert(
            index,
            TrackedChunk {
                bytes,
                completed: false,
            },
        );
    }

    /// Mark a tracked chunk finished; its entry is reclaimed by the next
    /// optimization pass.
    pub fn complete_chunk(&self, index: usize) {
        let mut inner = self.inner.lock().expect("memory state poisoned");
        if let Some(chunk) = inner.tracked_chunks.get_mut(&index) {
            chunk.completed = true;
        }
    }

    /// Bytes currently attributed to in-flight chunks.
    pub fn tracked_bytes(&self) -> u64 {
        let inner = self.inner.lock().expect("memory state poisoned");
        inner
            .tracked_chunks
            .values()
            .filter(|c| !c.completed)
            .map(|c| c.bytes)
            .sum()
    }

    fn usage_fraction(&self, usage: u64) -> f64 {
        if self.config.max_memory_usage == 0 {
            return 0.0;
        }
        usage as f64 / self.config.max_memory_usage as f64
    }

    fn classify(&self, fraction: f64) -> MemoryPressure {
        if fraction >= self.config.critical_threshold {
            MemoryPressure::Critical
        } else if fraction >= self.config.warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }
}
