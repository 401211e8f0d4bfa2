use crate::abi::{DEFAULT_BUFFER_SIZE, DEFAULT_SEGMENT_SIZE};

/// Knobs for building a [`crate::State`] and driving its bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    buffer_size: usize,
    dump_segment_size: usize,
    memory_limit: Option<usize>,
}

impl BridgeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            dump_segment_size: DEFAULT_SEGMENT_SIZE,
            memory_limit: None,
        }
    }

    /// Read buffer capacity per load. Zero is rejected at load time.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_dump_segment_size(mut self, size: usize) -> Self {
        self.dump_segment_size = size;
        self
    }

    /// Cap on outstanding engine memory, read buffers included.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn dump_segment_size(&self) -> usize {
        self.dump_segment_size
    }

    #[must_use]
    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}
