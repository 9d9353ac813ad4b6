use std::{fs, path::PathBuf, process};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lmx_normalizer::{
    normalize_blackboard, normalize_canvas, normalize_google_classroom, normalize_moodle, validate,
};

/// Normalize a raw LMS export and validate the canonical payload.
#[derive(Parser, Debug)]
#[command(
    name = "normalize-payload",
    version,
    about = "Normalize a raw LMS export into the canonical payload and validate it"
)]
struct Cli {
    /// Path to the raw export JSON file
    path: PathBuf,

    /// Source system that produced the export
    #[arg(long, value_enum)]
    source: Source,

    /// Optional auxiliary fragment JSON (submission/attempt feed)
    #[arg(long)]
    aux: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Source {
    Canvas,
    Moodle,
    GoogleClassroom,
    Blackboard,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lmx_normalizer=debug,info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn load_json(path: &PathBuf) -> Result<Value> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let json: Value = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON in {}", path.display()))?;
    Ok(json)
}

fn main() -> Result<()> {
    init_logging();
    let args = Cli::parse();

    let raw = load_json(&args.path)?;
    let aux = args.aux.as_ref().map(load_json).transpose()?;

    let payload = match args.source {
        Source::Canvas => normalize_canvas(&raw, aux.as_ref()),
        Source::Moodle => normalize_moodle(&raw, aux.as_ref()),
        Source::GoogleClassroom => normalize_google_classroom(&raw, aux.as_ref()),
        Source::Blackboard => normalize_blackboard(&raw, aux.as_ref()),
    }
    .with_context(|| format!("Failed to normalize {}", args.path.display()))?;

    let report = validate(&payload);
    if report.valid {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        Ok(())
    } else {
        eprintln!("invalid:");
        for error in &report.errors {
            eprintln!("- {error}");
        }
        process::exit(1)
    }
}
