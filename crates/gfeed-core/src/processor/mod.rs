//! Chunk processing orchestration.
//!
//! Pulls analyzed chunks through the external streaming manager with a
//! bounded number in flight, applies per-chunk timeout and retry, emits
//! progress events, checkpoints periodically, and parks at chunk
//! boundaries when paused. A single chunk's permanent failure never
//! aborts the rest of the run.

pub mod state;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analyzer::Chunk;
use crate::checkpoint::{now_millis, CheckpointManager, ProgressSnapshot};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, StreamEvent};
use crate::memory::MemoryHandle;
use crate::pause::PauseController;
use crate::streamer::{LineContext, StreamingManager};

pub use state::{LineFailure, ProcessingState, ProcessingSummary};

/// Per-line failure rate above which a finished chunk is flagged.
const HIGH_FAILURE_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ControlState {
    paused: bool,
    stopped: bool,
}

/// Outcome of one chunk attempt, reported by its worker task.
struct ChunkResult {
    chunk: Chunk,
    sent_lines: usize,
    failures: Vec<LineFailure>,
    timed_out: bool,
}

/// Per-run bookkeeping local to the queue loop.
struct Run {
    queue: VecDeque<Chunk>,
    retry_queue: VecDeque<Chunk>,
    retry_attempts: HashMap<usize, u32>,
    active: usize,
    tasks: Vec<JoinHandle<()>>,
    failed_indexes: Vec<usize>,
    completed_since_checkpoint: usize,
    total_lines: usize,
    total_bytes: u64,
    started_at_ms: u64,
    paused_since_ms: Option<u64>,
    high_line: usize,
    high_byte: u64,
}

/// Drives chunk transmission through the streaming manager.
pub struct ChunkProcessor {
    config: StreamConfig,
    events: EventBus,
    streamer: Arc<dyn StreamingManager>,
    state: Mutex<ProcessingState>,
    control_tx: watch::Sender<ControlState>,
    external_pause: Option<watch::Receiver<bool>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    memory: Option<MemoryHandle>,
    source_path: Option<PathBuf>,
}

impl ChunkProcessor {
    /// Create a processor sending through `streamer`.
    pub fn new(config: StreamConfig, streamer: Arc<dyn StreamingManager>, events: EventBus) -> Self {
        let (control_tx, _) = watch::channel(ControlState::default());
        Self {
            config,
            events,
            streamer,
            state: Mutex::new(ProcessingState::idle()),
            control_tx,
            external_pause: None,
            checkpoints: None,
            memory: None,
            source_path: None,
        }
    }

    /// Checkpoint progress for `source_path` through the given manager.
    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>, source_path: PathBuf) -> Self {
        self.checkpoints = Some(manager);
        self.source_path = Some(source_path);
        self
    }

    /// Consult the memory manager for sizing hints and chunk tracking.
    pub fn with_memory(mut self, memory: MemoryHandle) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Observe pause signals from a [`PauseController`].
    pub fn with_pause_controller(mut self, controller: &PauseController) -> Self {
        self.external_pause = Some(controller.subscribe());
        self
    }

    /// Current processing state snapshot.
    pub fn state(&self) -> ProcessingState {
        *self.state.lock().expect("processing state poisoned")
    }

    /// Park the queue loop at the next chunk boundary.
    pub fn pause(&self) {
        self.control_tx.send_modify(|c| c.paused = true);
    }

    /// Re-enter the queue loop after a pause.
    pub fn resume(&self) {
        self.control_tx.send_modify(|c| c.paused = false);
    }

    /// Stop the run: pending work is dropped, active chunk tasks are
    /// cancelled, and in-flight sends already delegated to the streaming
    /// manager are abandoned.
    pub fn stop(&self) {
        self.control_tx.send_modify(|c| c.stopped = true);
    }

    /// Reset state between runs. Refused while a run is active.
    pub fn reset(&self) -> bool {
        let mut state = self.state.lock().expect("processing state poisoned");
        if state.is_processing {
            return false;
        }
        *state = ProcessingState::idle();
        true
    }

    /// Process the chunk sequence to completion, stop, or exhaustion.
    ///
    /// Fails synchronously with [`Error::AlreadyProcessing`] if a run is
    /// active. Chunk-level failures are retried and reported through
    /// events; they never surface as an `Err` here.
    pub async fn start_processing(&self, chunks: Vec<Chunk>) -> Result<ProcessingSummary> {
        {
            let mut state = self.state.lock().expect("processing state poisoned");
            if state.is_processing {
                return Err(Error::AlreadyProcessing);
            }
            *state = ProcessingState::started(chunks.len());
        }
        self.control_tx.send_modify(|c| c.stopped = false);

        info!(chunks = chunks.len(), "processing started");
        let summary = self.run(chunks).await;

        {
            let mut state = self.state.lock().expect("processing state poisoned");
            state.is_processing = false;
            state.is_paused = false;
        }
        Ok(summary)
    }

    async fn run(&self, chunks: Vec<Chunk>) -> ProcessingSummary {
        let started = Instant::now();
        let total_chunks = chunks.len();
        let mut run = Run {
            total_lines: chunks.last().map(|c| c.end_line).unwrap_or(0),
            total_bytes: chunks.last().map(|c| c.byte_end).unwrap_or(0),
            queue: chunks.into(),
            retry_queue: VecDeque::new(),
            retry_attempts: HashMap::new(),
            active: 0,
            tasks: Vec::new(),
            failed_indexes: Vec::new(),
            completed_since_checkpoint: 0,
            started_at_ms: now_millis(),
            paused_since_ms: None,
            high_line: 0,
            high_byte: 0,
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_chunks));
        let (tx, mut rx) = mpsc::unbounded_channel::<ChunkResult>();
        let mut control_rx = self.control_tx.subscribe();
        let mut external = self.external_pause.clone();
        let mut was_paused = false;
        let mut stopped = false;

        loop {
            if control_rx.borrow().stopped {
                stopped = true;
                break;
            }

            let paused = control_rx.borrow().paused
                || external.as_ref().is_some_and(|rx| *rx.borrow());
            if paused {
                if !was_paused {
                    was_paused = true;
                    run.paused_since_ms = Some(now_millis());
                    self.state.lock().expect("processing state poisoned").is_paused = true;
                    info!("processing paused at chunk boundary");
                    self.events.emit(StreamEvent::ProcessingPaused);
                }
                tokio::select! {
                    Some(result) = rx.recv(), if run.active > 0 => {
                        self.handle_result(&mut run, result).await;
                    }
                    _ = control_rx.changed() => {}
                    _ = wait_external(&mut external) => {}
                }
                continue;
            }
            if was_paused {
                was_paused = false;
                run.paused_since_ms = None;
                self.state.lock().expect("processing state poisoned").is_paused = false;
                info!("processing resumed");
                self.events.emit(StreamEvent::ProcessingResumed);
            }

            let has_next = !(run.queue.is_empty() && run.retry_queue.is_empty());
            if !has_next && run.active == 0 {
                break;
            }

            if !has_next || semaphore.available_permits() == 0 {
                // At capacity or waiting on stragglers: sleep until a
                // worker reports or a control signal arrives.
                tokio::select! {
                    Some(result) = rx.recv(), if run.active > 0 => {
                        self.handle_result(&mut run, result).await;
                    }
                    _ = control_rx.changed() => {}
                    _ = wait_external(&mut external) => {}
                }
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                continue;
            };
            let Some(chunk) = run.retry_queue.pop_front().or_else(|| run.queue.pop_front()) else {
                continue;
            };
            self.dispatch_chunk(&mut run, chunk, permit, tx.clone());

            // Harvest anything already finished without blocking
            while let Ok(result) = rx.try_recv() {
                self.handle_result(&mut run, result).await;
            }
        }

        for task in &run.tasks {
            task.abort();
        }
        run.queue.clear();
        run.retry_queue.clear();

        let state = self.state();
        let summary = ProcessingSummary {
            total_chunks,
            processed_chunks: state.processed_chunks,
            failed_chunks: state.failed_chunks,
            failed_chunk_indexes: run.failed_indexes,
            retry_attempts: run.retry_attempts,
            elapsed: started.elapsed(),
            stopped,
        };

        if stopped {
            info!(
                processed = summary.processed_chunks,
                failed = summary.failed_chunks,
                "processing stopped"
            );
            self.events.emit(StreamEvent::ProcessingStopped {
                processed_chunks: summary.processed_chunks,
                failed_chunks: summary.failed_chunks,
            });
        } else {
            info!(
                processed = summary.processed_chunks,
                failed = summary.failed_chunks,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "processing completed"
            );
            self.events.emit(StreamEvent::ProcessingCompleted {
                processed_chunks: summary.processed_chunks,
                failed_chunks: summary.failed_chunks,
            });
        }
        summary
    }

    fn dispatch_chunk(
        &self,
        run: &mut Run,
        chunk: Chunk,
        permit: OwnedSemaphorePermit,
        tx: mpsc::UnboundedSender<ChunkResult>,
    ) {
        run.active += 1;
        if let Some(memory) = &self.memory {
            memory.track_chunk(chunk.index, chunk.byte_len());
        }
        debug!(chunk = chunk.index, lines = chunk.line_count(), "chunk dispatched");

        let streamer = Arc::clone(&self.streamer);
        let timeout = self.config.chunk_timeout;
        let task = tokio::spawn(async move {
            let _permit = permit;
            let outcome =
                match tokio::time::timeout(timeout, send_chunk_lines(&chunk, streamer.as_ref()))
                    .await
                {
                    Ok((sent_lines, failures)) => ChunkResult {
                        chunk,
                        sent_lines,
                        failures,
                        timed_out: false,
                    },
                    Err(_) => ChunkResult {
                        chunk,
                        sent_lines: 0,
                        failures: Vec::new(),
                        timed_out: true,
                    },
                };
            let _ = tx.send(outcome);
        });
        run.tasks.push(task);
    }

    async fn handle_result(&self, run: &mut Run, result: ChunkResult) {
        run.active -= 1;
        run.tasks.retain(|t| !t.is_finished());
        let index = result.chunk.index;

        if self.config.validate_completion && !result.timed_out {
            let accounted = result.sent_lines + result.failures.len();
            if accounted != result.chunk.line_count() {
                warn!(
                    chunk = index,
                    accounted,
                    declared = result.chunk.line_count(),
                    "line accounting mismatch"
                );
            }
            let rate = result.failures.len() as f64 / result.chunk.line_count().max(1) as f64;
            if rate > HIGH_FAILURE_RATE {
                warn!(chunk = index, rate, "per-line failure rate above 10%");
            }
        }

        let failed = result.timed_out || !result.failures.is_empty();
        if !failed {
            {
                let mut state = self.state.lock().expect("processing state poisoned");
                state.processed_chunks += 1;
                state.current_chunk_index = state.current_chunk_index.max(index + 1);
            }
            run.high_line = run.high_line.max(result.chunk.end_line);
            run.high_byte = run.high_byte.max(result.chunk.byte_end);

            if let Some(memory) = &self.memory {
                memory.complete_chunk(index);
                let recommended = memory.chunk_size_recommendation(self.config.chunk_size);
                if recommended != self.config.chunk_size {
                    debug!(
                        configured = self.config.chunk_size,
                        recommended, "memory pressure suggests a different chunk size"
                    );
                }
            }

            debug!(chunk = index, "chunk completed");
            self.events.emit(StreamEvent::ChunkCompleted { chunk_index: index });

            run.completed_since_checkpoint += 1;
            if run.completed_since_checkpoint >= self.config.checkpoint_interval {
                run.completed_since_checkpoint = 0;
                self.write_checkpoint(run).await;
            }
            return;
        }

        let error = if result.timed_out {
            Error::ChunkTimeout {
                chunk_index: index,
                timeout_ms: self.config.chunk_timeout.as_millis() as u64,
            }
        } else {
            Error::ChunkExecution {
                chunk_index: index,
                failed_lines: result.failures.len(),
                total_lines: result.chunk.line_count(),
            }
        };
        for failure in result.failures.iter().take(3) {
            debug!(line = failure.line_number, message = %failure.message, "line send failed");
        }

        let attempts = run.retry_attempts.entry(index).or_insert(0);
        *attempts += 1;
        if *attempts <= self.config.max_chunk_retries {
            let attempt = *attempts;
            warn!(chunk = index, attempt, error = %error, "chunk failed; retry queued");
            self.events.emit(StreamEvent::ChunkRetryQueued {
                chunk_index: index,
                attempt,
            });
            run.retry_queue.push_back(result.chunk);
        } else {
            self.state
                .lock()
                .expect("processing state poisoned")
                .failed_chunks += 1;
            run.failed_indexes.push(index);
            if let Some(memory) = &self.memory {
                memory.complete_chunk(index);
            }
            warn!(chunk = index, error = %error, "chunk permanently failed; continuing");
            self.events.emit(StreamEvent::ChunkFailed {
                chunk_index: index,
                error: error.to_string(),
            });
        }
    }

    async fn write_checkpoint(&self, run: &Run) {
        let (Some(manager), Some(path)) = (&self.checkpoints, &self.source_path) else {
            return;
        };
        let state = self.state();
        let snapshot = ProgressSnapshot {
            current_chunk: state.current_chunk_index,
            total_chunks: state.total_chunks,
            current_line: run.high_line,
            total_lines: run.total_lines,
            bytes_processed: run.high_byte,
            total_bytes: run.total_bytes,
            started_at: run.started_at_ms,
            paused_at: run.paused_since_ms,
        };
        let metadata = serde_json::json!({
            "processed_chunks": state.processed_chunks,
            "failed_chunks": state.failed_chunks,
        });
        if let Err(e) = manager.create_checkpoint(path, snapshot, metadata, true).await {
            warn!(error = %e, "checkpoint creation failed");
        }
    }
}

/// Send every line of a chunk strictly in order.
///
/// A line failure is recorded and the remaining lines are still sent.
async fn send_chunk_lines(
    chunk: &Chunk,
    streamer: &dyn StreamingManager,
) -> (usize, Vec<LineFailure>) {
    let mut sent = 0;
    let mut failures = Vec::new();
    let last = chunk.lines.len().saturating_sub(1);

    for (i, line) in chunk.lines.iter().enumerate() {
        let context = LineContext {
            line_number: chunk.start_line + i,
            chunk_index: chunk.index,
            is_last_line_in_chunk: i == last,
        };
        match streamer.send_line(line, context).await {
            Ok(()) => sent += 1,
            Err(e) => failures.push(LineFailure {
                line_number: context.line_number,
                message: e.to_string(),
            }),
        }
    }

    (sent, failures)
}

/// Wait for the external pause flag to change, if one is attached.
async fn wait_external(rx_opt: &mut Option<watch::Receiver<bool>>) {
    match rx_opt {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Controller dropped; stop watching it
                *rx_opt = None;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::FileAnalyzer;
    use crate::checkpoint::MemoryStore;
    use crate::memory::{MemoryManager, ScriptedSampler};
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;

    /// Crate-local scripted streaming double.
    ///
    /// Chunk failure scripts act per attempt: the engine replays a chunk
    /// from its first line on retry, so a non-increasing line number for
    /// a chunk marks a new attempt. Only successful deliveries are
    /// recorded.
    struct StubStreamer {
        sent: Mutex<Vec<(usize, usize)>>,
        fail_attempts: Mutex<HashMap<usize, u32>>,
        fail_always: Mutex<HashSet<usize>>,
        fail_lines: Mutex<HashSet<usize>>,
        last_line: Mutex<HashMap<usize, usize>>,
        line_delay: Mutex<Option<Duration>>,
    }

    impl StubStreamer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_attempts: Mutex::new(HashMap::new()),
                fail_always: Mutex::new(HashSet::new()),
                fail_lines: Mutex::new(HashSet::new()),
                last_line: Mutex::new(HashMap::new()),
                line_delay: Mutex::new(None),
            })
        }

        fn fail_chunk_times(&self, chunk_index: usize, times: u32) {
            self.fail_attempts.lock().unwrap().insert(chunk_index, times);
        }

        fn fail_chunk_always(&self, chunk_index: usize) {
            self.fail_always.lock().unwrap().insert(chunk_index);
        }

        fn fail_line(&self, line_number: usize) {
            self.fail_lines.lock().unwrap().insert(line_number);
        }

        fn set_line_delay(&self, delay: Duration) {
            *self.line_delay.lock().unwrap() = Some(delay);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn line_numbers_for_chunk(&self, chunk_index: usize) -> Vec<usize> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(chunk, _)| *chunk == chunk_index)
                .map(|(_, line)| *line)
                .collect()
        }

        fn should_fail(&self, context: LineContext) -> bool {
            if self
                .fail_lines
                .lock()
                .unwrap()
                .contains(&context.line_number)
            {
                return true;
            }
            if self
                .fail_always
                .lock()
                .unwrap()
                .contains(&context.chunk_index)
            {
                return true;
            }
            let new_attempt = {
                let mut last = self.last_line.lock().unwrap();
                let restarted = last
                    .get(&context.chunk_index)
                    .map_or(true, |&l| context.line_number <= l);
                last.insert(context.chunk_index, context.line_number);
                restarted
            };
            if !new_attempt {
                return false;
            }
            match self.fail_attempts.lock().unwrap().get_mut(&context.chunk_index) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamingManager for StubStreamer {
        async fn send_line(&self, _line: &str, context: LineContext) -> Result<()> {
            let delay = *self.line_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail(context) {
                return Err(Error::Streaming {
                    message: format!("scripted failure at line {}", context.line_number),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((context.chunk_index, context.line_number));
            Ok(())
        }
    }

    async fn chunks(total_lines: usize, per_chunk: usize) -> Vec<Chunk> {
        let content: String = (0..total_lines)
            .map(|i| format!("G1 X{i} Y{i}\n"))
            .collect();
        FileAnalyzer::new(
            StreamConfig::new().with_chunk_size(per_chunk),
            EventBus::disabled(),
        )
        .analyze_stream(content.as_bytes(), Path::new("job.gcode"), content.len() as u64)
        .await
        .unwrap()
        .chunks
    }

    fn processor_for(
        config: StreamConfig,
        stub: &Arc<StubStreamer>,
        events: EventBus,
    ) -> ChunkProcessor {
        let streamer: Arc<dyn StreamingManager> = stub.clone();
        ChunkProcessor::new(config, streamer, events)
    }

    #[tokio::test]
    async fn drains_all_chunks_successfully() {
        let stub = StubStreamer::new();
        let processor = processor_for(StreamConfig::default(), &stub, EventBus::disabled());

        let summary = processor.start_processing(chunks(50, 10).await).await.unwrap();

        assert!(summary.is_complete_success());
        assert_eq!(summary.processed_chunks, 5);
        assert_eq!(stub.sent_count(), 50);

        let state = processor.state();
        assert!(!state.is_processing);
        assert_eq!(state.current_chunk_index, 5);
    }

    #[tokio::test]
    async fn lines_are_sent_in_order_within_chunks() {
        let stub = StubStreamer::new();
        let processor = processor_for(StreamConfig::default(), &stub, EventBus::disabled());

        processor.start_processing(chunks(30, 10).await).await.unwrap();

        for chunk_index in 0..3 {
            let lines = stub.line_numbers_for_chunk(chunk_index);
            let mut sorted = lines.clone();
            sorted.sort_unstable();
            assert_eq!(lines, sorted, "chunk {chunk_index} out of order");
        }
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let stub = StubStreamer::new();
        stub.set_line_delay(Duration::from_millis(50));
        let processor = Arc::new(processor_for(
            StreamConfig::default(),
            &stub,
            EventBus::disabled(),
        ));

        let first = Arc::clone(&processor);
        let work = chunks(20, 10).await;
        let task = tokio::spawn(async move { first.start_processing(work).await });
        tokio::task::yield_now().await;

        let second = processor.start_processing(chunks(10, 10).await).await;
        assert!(matches!(second, Err(Error::AlreadyProcessing)));

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn transient_chunk_failure_is_retried_to_success() {
        // Chunk 3 fails exactly twice, then succeeds
        let stub = StubStreamer::new();
        stub.fail_chunk_times(3, 2);
        let config = StreamConfig::new().with_max_concurrent_chunks(2);
        let (bus, mut rx) = EventBus::channel();
        let processor = processor_for(config, &stub, bus);

        let summary = processor.start_processing(chunks(50, 10).await).await.unwrap();

        assert_eq!(summary.processed_chunks, 5);
        assert_eq!(summary.failed_chunks, 0);
        assert_eq!(summary.retry_attempts.get(&3), Some(&2));

        let mut retry_events = 0;
        let mut completed_three = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::ChunkRetryQueued { chunk_index: 3, .. } => retry_events += 1,
                StreamEvent::ChunkCompleted { chunk_index: 3 } => completed_three = true,
                _ => {}
            }
        }
        assert_eq!(retry_events, 2);
        assert!(completed_three);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_abort_the_run() {
        let stub = StubStreamer::new();
        stub.fail_chunk_always(1);
        let config = StreamConfig::new().with_max_chunk_retries(3);
        let (bus, mut rx) = EventBus::channel();
        let processor = processor_for(config, &stub, bus);

        let summary = processor.start_processing(chunks(40, 10).await).await.unwrap();

        assert_eq!(summary.processed_chunks, 3);
        assert_eq!(summary.failed_chunks, 1);
        assert_eq!(summary.failed_chunk_indexes, vec![1]);
        // Initial attempt plus three retries
        assert_eq!(summary.retry_attempts.get(&1), Some(&4));

        let mut retry_events = 0;
        let mut failed_events = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::ChunkRetryQueued { chunk_index: 1, .. } => retry_events += 1,
                StreamEvent::ChunkFailed { chunk_index: 1, .. } => failed_events += 1,
                _ => {}
            }
        }
        assert_eq!(retry_events, 3);
        assert_eq!(failed_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_chunk_times_out_and_retries() {
        let stub = StubStreamer::new();
        stub.set_line_delay(Duration::from_secs(60));
        let config = StreamConfig::new()
            .with_chunk_timeout(Duration::from_secs(1))
            .with_max_chunk_retries(1);
        let (bus, mut rx) = EventBus::channel();
        let processor = processor_for(config, &stub, bus);

        let summary = processor.start_processing(chunks(10, 10).await).await.unwrap();

        assert_eq!(summary.processed_chunks, 0);
        assert_eq!(summary.failed_chunks, 1);
        assert_eq!(summary.retry_attempts.get(&0), Some(&2));

        let mut saw_timeout_error = false;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::ChunkFailed { error, .. } = event {
                assert!(error.contains("timed out"));
                saw_timeout_error = true;
            }
        }
        assert!(saw_timeout_error);
    }

    #[tokio::test]
    async fn line_failure_keeps_remaining_lines_flowing() {
        let stub = StubStreamer::new();
        stub.fail_line(5);
        let config = StreamConfig::new().with_max_chunk_retries(0);
        let (bus, mut rx) = EventBus::channel();
        let processor = processor_for(config, &stub, bus);

        let summary = processor.start_processing(chunks(10, 10).await).await.unwrap();

        // The chunk is failed, but every line after the bad one was
        // still offered in order
        assert_eq!(summary.failed_chunks, 1);
        assert_eq!(
            stub.line_numbers_for_chunk(0),
            vec![1, 2, 3, 4, 6, 7, 8, 9, 10]
        );

        let mut failed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::ChunkFailed { error, .. } = event {
                assert!(error.contains("1 of 10 lines"));
                failed_events += 1;
            }
        }
        assert_eq!(failed_events, 1);
    }

    #[tokio::test]
    async fn pause_parks_and_resume_drains() {
        let stub = StubStreamer::new();
        let (bus, mut rx) = EventBus::channel();
        let processor = Arc::new(processor_for(StreamConfig::default(), &stub, bus));

        processor.pause();
        let runner = Arc::clone(&processor);
        let work = chunks(20, 10).await;
        let task = tokio::spawn(async move { runner.start_processing(work).await });

        // Wait for the loop to park
        loop {
            if let Some(event) = rx.recv().await {
                if event == StreamEvent::ProcessingPaused {
                    break;
                }
            }
        }
        assert!(processor.state().is_paused);
        assert_eq!(stub.sent_count(), 0);

        processor.resume();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processed_chunks, 2);
        assert!(!processor.state().is_paused);
    }

    #[tokio::test]
    async fn stop_clears_pending_work() {
        let stub = StubStreamer::new();
        let (bus, mut rx) = EventBus::channel();
        let processor = Arc::new(processor_for(StreamConfig::default(), &stub, bus));

        processor.pause();
        let runner = Arc::clone(&processor);
        let work = chunks(30, 10).await;
        let task = tokio::spawn(async move { runner.start_processing(work).await });

        loop {
            if rx.recv().await == Some(StreamEvent::ProcessingPaused) {
                break;
            }
        }

        processor.stop();
        let summary = task.await.unwrap().unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.processed_chunks, 0);
        assert!(!processor.state().is_processing);
    }

    #[tokio::test]
    async fn external_pause_controller_is_observed() {
        let stub = StubStreamer::new();
        let pause_config = StreamConfig {
            enable_graceful_pause: false,
            ..StreamConfig::default()
        };
        let controller = PauseController::new(pause_config, EventBus::disabled());
        controller.request_pause("operator", None).await;

        let (bus, mut rx) = EventBus::channel();
        let processor = Arc::new(
            processor_for(StreamConfig::default(), &stub, bus)
                .with_pause_controller(&controller),
        );

        let runner = Arc::clone(&processor);
        let work = chunks(20, 10).await;
        let task = tokio::spawn(async move { runner.start_processing(work).await });

        loop {
            if rx.recv().await == Some(StreamEvent::ProcessingPaused) {
                break;
            }
        }
        assert_eq!(stub.sent_count(), 0);

        controller.request_resume(false).await;
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processed_chunks, 2);
    }

    #[tokio::test]
    async fn periodic_checkpoints_record_progress() {
        let stub = StubStreamer::new();
        let config = StreamConfig {
            checkpoint_interval: 1,
            ..StreamConfig::default()
        };
        let manager = Arc::new(CheckpointManager::new(
            config.clone(),
            EventBus::disabled(),
            Arc::new(MemoryStore::new()),
        ));
        let source = PathBuf::from("job.gcode");
        let processor = processor_for(config, &stub, EventBus::disabled())
            .with_checkpoints(Arc::clone(&manager), source.clone());

        processor.start_processing(chunks(30, 10).await).await.unwrap();

        let checkpoint = manager.load_checkpoint(&source).await.unwrap().unwrap();
        assert_eq!(checkpoint.snapshot.current_chunk, 3);
        assert_eq!(checkpoint.snapshot.total_chunks, 3);
        assert_eq!(checkpoint.snapshot.current_line, 30);
        assert_eq!(checkpoint.snapshot.total_lines, 30);
        assert!(checkpoint.snapshot.paused_at.is_none());
        assert!(checkpoint.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_during_pause_records_pause_time() {
        let stub = StubStreamer::new();
        stub.set_line_delay(Duration::from_secs(1));
        let config = StreamConfig {
            checkpoint_interval: 1,
            ..StreamConfig::default()
        };
        let (bus, mut rx) = EventBus::channel();
        let manager = Arc::new(CheckpointManager::new(
            config.clone(),
            bus.clone(),
            Arc::new(MemoryStore::new()),
        ));
        let source = PathBuf::from("job.gcode");
        let processor = Arc::new(
            processor_for(config, &stub, bus)
                .with_checkpoints(Arc::clone(&manager), source.clone()),
        );

        let runner = Arc::clone(&processor);
        let work = chunks(3, 3).await;
        let run = tokio::spawn(async move { runner.start_processing(work).await });

        // Let the chunk get dispatched, then pause while it is in flight
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        processor.pause();

        // The in-flight chunk finishes while parked and is checkpointed
        loop {
            if matches!(
                rx.recv().await.unwrap(),
                StreamEvent::CheckpointCreated { .. }
            ) {
                break;
            }
        }
        let checkpoint = manager.load_checkpoint(&source).await.unwrap().unwrap();
        assert!(checkpoint.snapshot.paused_at.is_some());
        assert!(processor.state().is_paused);

        processor.resume();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.processed_chunks, 1);
    }

    #[tokio::test]
    async fn memory_tracking_follows_chunks() {
        let stub = StubStreamer::new();
        let memory = MemoryManager::with_sampler(
            StreamConfig::default(),
            EventBus::disabled(),
            Box::new(ScriptedSampler::new(vec![1000])),
        );
        let processor = processor_for(StreamConfig::default(), &stub, EventBus::disabled())
            .with_memory(memory.handle());

        processor.start_processing(chunks(20, 10).await).await.unwrap();

        // Every tracked chunk was completed; an optimization pass
        // reclaims them all
        assert_eq!(memory.handle().optimize_memory(), 2);
    }

    #[tokio::test]
    async fn reset_clears_state_between_runs() {
        let stub = StubStreamer::new();
        let processor = processor_for(StreamConfig::default(), &stub, EventBus::disabled());

        processor.start_processing(chunks(10, 10).await).await.unwrap();
        assert_eq!(processor.state().current_chunk_index, 1);

        assert!(processor.reset());
        assert_eq!(processor.state().current_chunk_index, 0);
    }

    #[tokio::test]
    async fn empty_chunk_list_completes_immediately() {
        let stub = StubStreamer::new();
        let processor = processor_for(StreamConfig::default(), &stub, EventBus::disabled());
        let summary = processor.start_processing(Vec::new()).await.unwrap();
        assert!(summary.is_complete_success());
        assert_eq!(summary.total_chunks, 0);
    }
}
