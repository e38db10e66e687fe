/// Lamport logical clock shared by every protocol a process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Creates a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without advancing
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Merges a received timestamp: `max(local, remote) + 1`
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.value = self.value.max(remote) + 1;
        self.value
    }

    /// Advances the clock for a locally originated message and returns the stamp
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }
}
