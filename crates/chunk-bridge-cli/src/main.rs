use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chunk_bridge::{BridgeConfig, CompiledChunk, IoReader, IoWriter, State};

#[derive(Parser)]
#[command(name = "chunk-bridge")]
#[command(about = "Load and dump precompiled script chunks through host streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BridgeArgs {
    #[arg(short, long, default_value_t = 256, help = "Read buffer size in bytes")]
    buffer_size: usize,

    #[arg(long, help = "Cap on outstanding engine memory in bytes")]
    memory_limit: Option<usize>,
}

impl BridgeArgs {
    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::new().with_buffer_size(self.buffer_size);
        if let Some(limit) = self.memory_limit {
            config = config.with_memory_limit(limit);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a chunk file and dump it back out
    Roundtrip {
        #[arg(help = "Input chunk file")]
        input: PathBuf,

        #[arg(short, long, help = "Output chunk file")]
        output: PathBuf,

        #[arg(long, default_value_t = 256, help = "Largest segment per write")]
        segment_size: usize,

        #[command(flatten)]
        bridge: BridgeArgs,
    },
    /// Load a chunk file and report what the engine holds
    Inspect {
        #[arg(help = "Input chunk file")]
        input: PathBuf,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,

        #[command(flatten)]
        bridge: BridgeArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Roundtrip {
            input,
            output,
            segment_size,
            bridge,
        } => {
            let config = bridge.config().with_dump_segment_size(segment_size);
            let mut state = State::from_config(&config);
            let chunk = load_file(&mut state, &input, config.buffer_size())?;

            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let mut writer = IoWriter(BufWriter::new(file));
            state
                .dump(&mut writer)
                .with_context(|| format!("Failed to dump chunk to {}", output.display()))?;
            writer
                .0
                .into_inner()
                .map_err(|e| anyhow::anyhow!("Failed to flush {}: {e}", output.display()))?;

            println!(
                "Round-tripped {} -> {} ({} bytes)",
                input.display(),
                output.display(),
                chunk.len()
            );
        }
        Commands::Inspect {
            input,
            json,
            bridge,
        } => {
            let config = bridge.config();
            let mut state = State::from_config(&config);
            let chunk = load_file(&mut state, &input, config.buffer_size())?;
            report(&state, &chunk, json)?;
        }
    }

    Ok(())
}

fn load_file(state: &mut State, path: &Path, buffer_size: usize) -> Result<CompiledChunk> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let name = path
        .file_name()
        .map_or_else(|| path.to_string_lossy(), |f| f.to_string_lossy())
        .into_owned();
    let size = fs::metadata(path).map(|m| m.len()).ok();
    tracing::debug!(path = %path.display(), ?size, "loading chunk file");

    state
        .load(&mut IoReader(file), buffer_size, &name)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn report(state: &State, chunk: &CompiledChunk, json: bool) -> Result<()> {
    let usage = state.usage();
    if json {
        let value = serde_json::json!({
            "name": chunk.name(),
            "len": chunk.len(),
            "depth": state.depth(),
            "memory": usage.map(|u| serde_json::json!({
                "outstanding": u.outstanding(),
                "peak": u.peak(),
                "allocations": u.allocations(),
                "resizes": u.resizes(),
                "frees": u.frees(),
                "kilobytes": u.kilobytes(),
                "kilobytes_remainder": u.kilobytes_remainder(),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("chunk:  {}", chunk.name());
    println!("length: {} bytes", chunk.len());
    if let Some(u) = usage {
        println!(
            "memory: {} bytes in use ({}K + {}), peak {}",
            u.outstanding(),
            u.kilobytes(),
            u.kilobytes_remainder(),
            u.peak()
        );
        println!(
            "calls:  {} allocations, {} resizes, {} frees",
            u.allocations(),
            u.resizes(),
            u.frees()
        );
    }
    Ok(())
}
