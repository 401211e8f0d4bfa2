#![allow(
    clippy::module_name_repetitions, // ChunkReader/ChunkWriter read better than Reader/Writer at call sites
    clippy::missing_errors_doc // error variants are documented on `Error`
)]

pub mod abi;
pub mod alloc;
pub mod config;
pub mod engine;
pub mod error;
pub mod reader;
pub mod state;
pub mod writer;

/// Scripted host collaborators for unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use abi::Status;
pub use alloc::{Allocator, Block, HostMemory, MemoryUsage, OutOfMemory, SystemMemory, TrackedMemory};
pub use config::BridgeConfig;
pub use engine::{BytecodeEngine, ChunkSink, ChunkSource, CompiledChunk, DumpFailure, Engine, LoadFailure};
pub use error::{Error, Result};
pub use reader::{ChunkReader, HostReader, IoReader, ReadOutcome, SliceReader};
pub use state::State;
pub use writer::{ChunkWriter, HostWriter, IoWriter};
