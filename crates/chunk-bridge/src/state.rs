use std::fmt;

use crate::abi::DEFAULT_BUFFER_SIZE;
use crate::alloc::{Allocator, HostMemory, MemoryUsage, TrackedMemory};
use crate::config::BridgeConfig;
use crate::engine::{BytecodeEngine, CompiledChunk, Engine};
use crate::reader::{HostReader, SliceReader, load_chunk};
use crate::writer::{HostWriter, dump_chunk};
use crate::Result;

/// One isolated engine environment, owned by the host.
///
/// The allocator adapter is wired in at construction and every byte the
/// engine holds goes through it. Dropping the state (or calling
/// [`State::close`]) releases all of it.
///
/// A `State` is single-threaded: it is neither `Sync` nor `Clone`. Hosts
/// that need parallelism keep one state per worker.
pub struct State {
    allocator: Allocator,
    engine: Box<dyn Engine>,
    usage: Option<MemoryUsage>,
    buffer_size: usize,
}

impl State {
    /// A state over tracked system memory running the reference engine.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&BridgeConfig::default())
    }

    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut memory = TrackedMemory::new();
        if let Some(limit) = config.memory_limit() {
            memory = memory.with_limit(limit);
        }
        let usage = memory.usage();
        let engine = BytecodeEngine::new().with_segment_size(config.dump_segment_size());

        let mut state = Self::with_engine(memory, engine);
        state.usage = Some(usage);
        state.buffer_size = config.buffer_size();
        state
    }

    /// A state over host-supplied memory running the reference engine.
    pub fn with_memory(memory: impl HostMemory + 'static) -> Self {
        Self::with_engine(memory, BytecodeEngine::new())
    }

    pub fn with_engine(memory: impl HostMemory + 'static, engine: impl Engine + 'static) -> Self {
        tracing::debug!("creating state");
        Self {
            allocator: Allocator::new(memory),
            engine: Box::new(engine),
            usage: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Memory statistics, when the state was built over [`TrackedMemory`]
    /// by [`State::new`] or [`State::from_config`].
    #[must_use]
    pub fn usage(&self) -> Option<&MemoryUsage> {
        self.usage.as_ref()
    }

    /// Buffer size used by [`State::load_bytes`].
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Load one chunk from `reader`, pulling at most `buffer_size` bytes per
    /// read, and push it on the stack.
    ///
    /// A reader error ends the input just like end of stream does; see the
    /// [`crate::reader`] module docs.
    pub fn load<R: HostReader + ?Sized>(
        &mut self,
        reader: &mut R,
        buffer_size: usize,
        chunk_name: &str,
    ) -> Result<CompiledChunk> {
        load_chunk(
            self.engine.as_mut(),
            &self.allocator,
            reader,
            buffer_size,
            chunk_name,
        )
    }

    /// Load a chunk held in memory.
    pub fn load_bytes(&mut self, bytes: &[u8], chunk_name: &str) -> Result<CompiledChunk> {
        let buffer_size = self.buffer_size;
        self.load(&mut SliceReader::new(bytes), buffer_size, chunk_name)
    }

    /// Serialize the chunk on top of the stack into `writer`.
    ///
    /// On failure, segments written before the failing one have already
    /// reached the writer.
    pub fn dump<W: HostWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        dump_chunk(self.engine.as_ref(), writer)
    }

    /// Number of chunks on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.engine.depth()
    }

    #[must_use]
    pub fn top(&self) -> Option<CompiledChunk> {
        self.engine.top()
    }

    /// Pop the top chunk and release its memory. Returns `false` if the
    /// stack was empty.
    pub fn pop(&mut self) -> bool {
        self.engine.pop(&self.allocator)
    }

    /// Destroy the state.
    pub fn close(self) {
        drop(self);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.engine.close(&self.allocator);
        tracing::debug!(
            outstanding = self.usage.as_ref().map(MemoryUsage::outstanding),
            "state closed"
        );
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("depth", &self.engine.depth())
            .field("buffer_size", &self.buffer_size)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::test_harness::{FragmentReader, ScriptedWriter, sample_chunk};

    #[test]
    fn test_load_bytes_then_dump() {
        let bytes = sample_chunk(600);
        let mut state = State::new();
        let chunk = state.load_bytes(&bytes, "mem").unwrap();
        assert_eq!(chunk.name(), "mem");
        assert_eq!(chunk.len(), bytes.len());
        assert_eq!(state.depth(), 1);

        let mut writer = ScriptedWriter::new();
        state.dump(&mut writer).unwrap();
        assert_eq!(writer.written(), bytes);
    }

    #[test]
    fn test_memory_returns_to_zero_after_close() {
        let mut memory = TrackedMemory::new();
        let usage = memory.usage();
        memory = memory.with_limit(1 << 20);
        let mut state = State::with_memory(memory);

        state.load_bytes(&sample_chunk(100), "a").unwrap();
        state.load_bytes(&sample_chunk(3000), "b").unwrap();
        assert!(state.load_bytes(b"garbage", "c").is_err());
        assert!(usage.outstanding() > 0);

        state.close();
        assert_eq!(usage.outstanding(), 0);
        assert_eq!(usage.allocations(), usage.frees());
    }

    #[test]
    fn test_config_limit_applies_to_read_buffer() {
        let config = BridgeConfig::new().with_buffer_size(512).with_memory_limit(256);
        let mut state = State::from_config(&config);
        let err = state.load_bytes(&sample_chunk(8), "limited").unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert_eq!(state.usage().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_config_segment_size() {
        let config = BridgeConfig::new().with_dump_segment_size(4);
        let mut state = State::from_config(&config);
        let bytes = sample_chunk(8);
        state.load_bytes(&bytes, "segments").unwrap();

        let mut writer = ScriptedWriter::new();
        state.dump(&mut writer).unwrap();
        assert_eq!(writer.calls(), 3);
    }

    #[test]
    fn test_failed_load_leaves_stack_untouched() {
        let mut state = State::new();
        state.load_bytes(&sample_chunk(2), "first").unwrap();
        let mut reader = FragmentReader::new(vec![b"??".to_vec()]);
        assert!(state.load(&mut reader, 8, "second").is_err());
        assert_eq!(state.depth(), 1);
        assert_eq!(state.top().unwrap().name(), "first");
    }

    #[test]
    fn test_pop() {
        let mut state = State::new();
        state.load_bytes(&sample_chunk(2), "only").unwrap();
        assert!(state.pop());
        assert!(!state.pop());
        assert_eq!(state.usage().unwrap().outstanding(), 0);
        assert!(matches!(
            state.dump(&mut ScriptedWriter::new()),
            Err(Error::Serialization(_))
        ));
    }
}
