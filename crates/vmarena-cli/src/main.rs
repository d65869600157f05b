use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmarena_core::{flush_to_file, read_entire_file, ArenaConfig, MappedFile};

#[derive(Parser)]
#[command(name = "vmarena")]
#[command(about = "Load, map and copy files through a reserve-then-commit arena", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "VMARENA_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Push files into a single arena and report where each landed
    Load {
        /// Files to load, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Alignment for the start of every file after the first; the first starts at offset 0
        #[arg(short, long, default_value = "1")]
        align: usize,
    },

    /// Map a file read-only and report its size and SHA-256 digest
    Map {
        /// File to map
        file: PathBuf,
    },

    /// Copy a file through an in-memory buffer
    Copy {
        /// Source file
        source: PathBuf,

        /// Destination file, created or truncated
        destination: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        ArenaConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config, cli.verbose);

    match execute_command(&cli, &config) {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &ArenaConfig, verbose: bool) {
    let fallback = if verbose {
        "vmarena=debug,vmarena_core=debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn execute_command(cli: &Cli, config: &ArenaConfig) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Load { files, align } => execute_load(config, files, *align),
        Commands::Map { file } => execute_map(file),
        Commands::Copy {
            source,
            destination,
        } => execute_copy(source, destination),
        Commands::Config => Ok(serde_json::to_value(config)?),
    }
}

fn execute_load(config: &ArenaConfig, files: &[PathBuf], align: usize) -> Result<serde_json::Value> {
    let mut arena = config.build_arena().context("Failed to create arena")?;

    let mut loaded: Vec<serde_json::Value> = Vec::with_capacity(files.len());
    for path in files {
        // Zero-length pushes only serve to align the next file.
        if !loaded.is_empty() {
            arena
                .push_aligned(0, align)
                .with_context(|| format!("Invalid alignment {}", align))?;
        }
        let slice = arena
            .push_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        info!(path = %path.display(), offset = slice.offset(), len = slice.len(), "loaded");
        loaded.push(json!({
            "path": path.display().to_string(),
            "offset": slice.offset(),
            "len": slice.len(),
        }));
    }

    let stats = arena.stats();
    arena.destroy();
    Ok(json!({
        "files": loaded,
        "reserved_bytes": stats.reserved_bytes,
        "committed_bytes": stats.committed_bytes,
        "used_bytes": stats.used_bytes,
    }))
}

fn execute_map(file: &Path) -> Result<serde_json::Value> {
    let mut mapped =
        MappedFile::open(file).with_context(|| format!("Failed to map {}", file.display()))?;
    let digest = sha256_hex(mapped.as_bytes());
    let len = mapped.len();
    mapped.close();

    Ok(json!({
        "path": file.display().to_string(),
        "len": len,
        "sha256": digest,
    }))
}

fn execute_copy(source: &Path, destination: &Path) -> Result<serde_json::Value> {
    let bytes = read_entire_file(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    flush_to_file(destination, &bytes)
        .with_context(|| format!("Failed to write {}", destination.display()))?;

    Ok(json!({
        "source": source.display().to_string(),
        "destination": destination.display().to_string(),
        "bytes": bytes.len(),
    }))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value) -> Result<()> {
    let serde_json::Value::Object(map) = value else {
        println!("{}", serde_json::to_string_pretty(value)?);
        return Ok(());
    };

    for (key, val) in map {
        let key_colored = key.cyan().bold();
        match val {
            serde_json::Value::String(s) => println!("{}: {}", key_colored, s.green()),
            serde_json::Value::Number(n) => {
                println!("{}: {}", key_colored, n.to_string().yellow())
            }
            serde_json::Value::Bool(b) => {
                let val_colored = if *b { "true".green() } else { "false".red() };
                println!("{}: {}", key_colored, val_colored);
            }
            serde_json::Value::Array(files) if key == "files" => {
                println!("{}:", key_colored);
                for line in file_rows(files) {
                    println!("{}", line);
                }
            }
            _ => println!("{}: {}", key_colored, val),
        }
    }
    Ok(())
}

/// One `offset len path` row per loaded file, offsets and lengths right-aligned.
fn file_rows(files: &[serde_json::Value]) -> Vec<String> {
    let width = |field: &str| {
        files
            .iter()
            .map(|f| f[field].to_string().len())
            .max()
            .unwrap_or(0)
    };
    let (offset_width, len_width) = (width("offset"), width("len"));

    files
        .iter()
        .map(|f| {
            format!(
                "  {:>ow$}  {:>lw$}  {}",
                f["offset"].to_string(),
                f["len"].to_string(),
                f["path"].as_str().unwrap_or_default(),
                ow = offset_width,
                lw = len_width,
            )
        })
        .collect()
}
