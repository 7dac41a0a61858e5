//! Scripted streaming manager for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gfeed_core::error::{Error, Result};
use gfeed_core::streamer::{LineContext, StreamingManager};

/// One successfully delivered line, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentLine {
    /// Chunk the line belonged to.
    pub chunk_index: usize,
    /// 1-based source line number.
    pub line_number: usize,
    /// Line text as received.
    pub text: String,
}

#[derive(Default)]
struct ChunkScript {
    /// Attempts still scripted to fail (one failed line per attempt).
    remaining_failures: u32,
    /// Every line of this chunk always fails.
    always_fail: bool,
    /// Last line number seen; a non-increasing number marks a new attempt.
    last_line: Option<usize>,
}

/// In-memory [`StreamingManager`] with scripted failures.
///
/// Failure scripts work per chunk attempt: `fail_chunk_times(c, n)` makes
/// the first `n` attempts at chunk `c` each report one failed line (the
/// attempt's first line), after which the chunk succeeds. Attempts are
/// detected from line numbers restarting, which matches the engine's
/// retry behavior of replaying a chunk from its first line.
pub struct MockStreamer {
    sent: Mutex<Vec<SentLine>>,
    scripts: Mutex<HashMap<usize, ChunkScript>>,
    fail_lines: Mutex<HashSet<usize>>,
    line_delay: Mutex<Option<Duration>>,
}

impl MockStreamer {
    /// Create a streamer that delivers everything instantly.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            fail_lines: Mutex::new(HashSet::new()),
            line_delay: Mutex::new(None),
        })
    }

    /// Script the first `times` attempts at `chunk_index` to fail.
    pub fn fail_chunk_times(&self, chunk_index: usize, times: u32) {
        self.scripts
            .lock()
            .expect("mock scripts poisoned")
            .entry(chunk_index)
            .or_default()
            .remaining_failures = times;
    }

    /// Script every attempt at `chunk_index` to fail.
    pub fn fail_chunk_always(&self, chunk_index: usize) {
        self.scripts
            .lock()
            .expect("mock scripts poisoned")
            .entry(chunk_index)
            .or_default()
            .always_fail = true;
    }

    /// Script one source line to fail on every delivery.
    pub fn fail_line(&self, line_number: usize) {
        self.fail_lines
            .lock()
            .expect("mock scripts poisoned")
            .insert(line_number);
    }

    /// Delay every delivery, for timeout tests.
    pub fn set_line_delay(&self, delay: Duration) {
        *self.line_delay.lock().expect("mock scripts poisoned") = Some(delay);
    }

    /// Number of lines delivered successfully.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock record poisoned").len()
    }

    /// Text of every delivered line, in delivery order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("mock record poisoned")
            .iter()
            .map(|s| s.text.clone())
            .collect()
    }

    /// Full delivery record, in delivery order.
    pub fn sent(&self) -> Vec<SentLine> {
        self.sent.lock().expect("mock record poisoned").clone()
    }

    /// Line numbers delivered for one chunk, in delivery order.
    pub fn line_numbers_for_chunk(&self, chunk_index: usize) -> Vec<usize> {
        self.sent
            .lock()
            .expect("mock record poisoned")
            .iter()
            .filter(|s| s.chunk_index == chunk_index)
            .map(|s| s.line_number)
            .collect()
    }

    fn should_fail(&self, context: LineContext) -> bool {
        if self
            .fail_lines
            .lock()
            .expect("mock scripts poisoned")
            .contains(&context.line_number)
        {
            return true;
        }

        let mut scripts = self.scripts.lock().expect("mock scripts poisoned");
        let script = scripts.entry(context.chunk_index).or_default();
        let new_attempt = script
            .last_line
            .map_or(true, |last| context.line_number <= last);
        script.last_line = Some(context.line_number);

        if script.always_fail {
            return true;
        }
        if new_attempt && script.remaining_failures > 0 {
            script.remaining_failures -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl StreamingManager for MockStreamer {
    async fn send_line(&self, line: &str, context: LineContext) -> Result<()> {
        let delay = *self.line_delay.lock().expect("mock scripts poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(context) {
            return Err(Error::Streaming {
                message: format!("scripted failure at line {}", context.line_number),
            });
        }

        self.sent.lock().expect("mock record poisoned").push(SentLine {
            chunk_index: context.chunk_index,
            line_number: context.line_number,
            text: line.to_string(),
        });
        Ok(())
    }
}
