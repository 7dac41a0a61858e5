//! Host memory sampling.

use sysinfo::{Pid, System};

/// Source of memory usage samples.
///
/// The manager owns one sampler; tests inject deterministic ones.
pub trait MemorySampler: Send {
    /// Current memory usage in bytes.
    fn sample(&mut self) -> u64;
}

/// Samples the current process's resident memory via sysinfo.
///
/// Falls back to system-wide used memory when the process entry is
/// unavailable.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    /// Create a sampler bound to the current process.
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self) -> u64 {
        if let Some(pid) = self.pid {
            self.system.refresh_process(pid);
            if let Some(process) = self.system.process(pid) {
                return process.memory();
            }
        }
        self.system.refresh_memory();
        self.system.used_memory()
    }
}

/// Fixed sequence of samples, for tests.
pub struct ScriptedSampler {
    samples: Vec<u64>,
    position: usize,
}

impl ScriptedSampler {
    /// Create a sampler that replays `samples`, repeating the last one.
    pub fn new(samples: Vec<u64>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl MemorySampler for ScriptedSampler {
    fn sample(&mut self) -> u64 {
        let value = self
            .samples
            .get(self.position)
            .or_else(|| self.samples.last())
            .copied()
            .unwrap_or(0);
        if self.position < self.samples.len() {
            self.position += 1;
        }
        value
    }
}
