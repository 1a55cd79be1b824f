//! CLI binary for pdftrans.
//!
//! A thin shim over the library crate that maps CLI flags to
//! [`PipelineConfig`], wires up the extractor adapters, and prints a run
//! summary. The process exit code follows the documented contract:
//! 0 success, 1 configuration error, 2 fatal extractor/input error,
//! 3 endpoint unreachable, 4 partial success with quarantined blocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdftrans::{
    exit_code_for, CancelFlag, FixtureLayoutExtractor, FixtureVisualExtractor, HttpProvider,
    LayoutOutput, Pipeline, PipelineConfig, VisualAsset,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Translate a paper to Greek using a pre-extracted layout dump
  pdftrans paper.pdf -o out/ --target-lang Greek \
      --layout-json paper.layout.json --visuals-json paper.visuals.json

  # With a config file (every key has a default)
  pdftrans paper.pdf -o out/ -c pdftrans.toml --layout-json paper.layout.json

  # Override the endpoint and model from the command line
  pdftrans paper.pdf -o out/ --endpoint http://localhost:8089/translate \
      --model quality-large --layout-json paper.layout.json

EXTRACTOR INTEGRATION:
  The pipeline consumes two extraction sources through narrow traits; any
  OCR or layout engine integrates by dumping its output as JSON:
    --layout-json    serialized LayoutOutput (fragments + block hints)
    --visuals-json   serialized [VisualAsset] (figure binaries + boxes)
  Library users implement LayoutExtractor / VisualExtractor directly and
  skip the JSON hop.

EXIT CODES:
  0  success
  1  configuration error
  2  fatal extractor or input error
  3  translation endpoint unreachable
  4  partial success — output produced with [TRANSLATION_FAILED] markers

ENVIRONMENT VARIABLES:
  PDFTRANS_API_KEY     API key for the translation endpoint (preferred
                       over any key in the config file)
  PDFTRANS_ENDPOINT    Endpoint URL (same as --endpoint)
"#;

/// Translate a PDF into a target language, preserving structure.
#[derive(Parser, Debug)]
#[command(
    name = "pdftrans",
    version,
    about = "Structure-preserving PDF translation",
    long_about = "Translate complex PDFs (papers, manuals) into a target language while \
preserving headings, tables, formulas, lists, figures and footnotes. Regenerates a table \
of contents with page numbers; failed blocks are quarantined and substituted with the \
original text.",
    arg_required_else_help = true,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input PDF path.
    input: PathBuf,

    /// Output directory (artifacts land in <output>/<stem>/).
    #[arg(short, long, env = "PDFTRANS_OUTPUT", default_value = "out")]
    output: PathBuf,

    /// Target language override (otherwise from the config file).
    #[arg(long, env = "PDFTRANS_TARGET_LANG")]
    target_lang: Option<String>,

    /// TOML configuration file; missing keys take defaults.
    #[arg(short, long, env = "PDFTRANS_CONFIG")]
    config: Option<PathBuf>,

    /// Translation endpoint URL.
    #[arg(long, env = "PDFTRANS_ENDPOINT")]
    endpoint: Option<String>,

    /// Model identifier override for both routing tiers.
    #[arg(long, env = "PDFTRANS_MODEL")]
    model: Option<String>,

    /// Concurrent in-flight translation batches (1–64).
    #[arg(long, env = "PDFTRANS_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Serialized LayoutOutput JSON from the layout extraction engine.
    #[arg(long, env = "PDFTRANS_LAYOUT_JSON")]
    layout_json: Option<PathBuf>,

    /// Serialized [VisualAsset] JSON from the visual extraction engine.
    #[arg(long, env = "PDFTRANS_VISUALS_JSON")]
    visuals_json: Option<PathBuf>,

    /// Disable both cache tiers for this run.
    #[arg(long)]
    no_cache: bool,

    /// Disable the trace.json summary.
    #[arg(long)]
    no_trace: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFTRANS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFTRANS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {e}", red("✗"));
            std::process::exit(1);
        }
    };

    // ── Wire up collaborators ────────────────────────────────────────────
    let layout = match load_layout(&cli) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{} {e:#}", red("✗"));
            std::process::exit(2);
        }
    };
    let visual = load_visuals(&cli).unwrap_or_else(|e| {
        eprintln!("{} visual extraction input unreadable ({e:#}); continuing without images", cyan("⚠"));
        Arc::new(FixtureVisualExtractor::failing())
    });

    let provider = match HttpProvider::new(
        &config.translation.endpoint_url,
        config.translation.resolve_api_key(),
        config.translation.request_timeout_seconds,
    ) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("{} {e}", red("✗"));
            std::process::exit(3);
        }
    };

    let pipeline = match Pipeline::new(config, vec![layout], visual, provider) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{} {e}", red("✗"));
            std::process::exit(1);
        }
    };

    // ── Run ──────────────────────────────────────────────────────────────
    let spinner = (!cli.quiet).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Translating {}…", cli.input.display()));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let cancel = CancelFlag::new();
    let result = pipeline
        .translate_document(&cli.input, &cli.output, cli.target_lang.as_deref(), &cancel)
        .await;

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }

    // ── Summary ──────────────────────────────────────────────────────────
    let code = exit_code_for(&result);
    match &result {
        Ok(outcome) => {
            if !cli.quiet {
                let s = &outcome.stats;
                let tick = if outcome.is_partial() { cyan("⚠") } else { green("✔") };
                eprintln!(
                    "{tick}  {} blocks across {} pages  →  {}",
                    bold(&s.blocks.to_string()),
                    s.pages,
                    bold(&outcome.output_path.display().to_string()),
                );
                eprintln!(
                    "   {} translated, {} preserved, {} cache hits, {} API calls, {}ms",
                    s.translated_blocks,
                    s.preserved_blocks,
                    s.cache_hits,
                    s.api_calls,
                    s.total_duration_ms,
                );
                if outcome.toc_entries > 0 {
                    eprintln!("   {} TOC entries", outcome.toc_entries);
                }
                if outcome.is_partial() {
                    eprintln!(
                        "   {} block(s) quarantined — output carries {} markers",
                        red(&s.quarantined_blocks.to_string()),
                        bold("[TRANSLATION_FAILED]"),
                    );
                }
                if let Some(trace) = &outcome.trace_path {
                    eprintln!("   {}", dim(&format!("trace: {}", trace.display())));
                }
            }
        }
        Err(e) => {
            eprintln!("{} {e}", red("✗"));
        }
    }

    std::process::exit(code);
}

/// Map CLI args onto the loaded configuration.
fn build_config(cli: &Cli) -> Result<PipelineConfig, pdftrans::PipelineError> {
    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;

    if let Some(endpoint) = &cli.endpoint {
        config.translation.endpoint_url = endpoint.clone();
    }
    if let Some(model) = &cli.model {
        config.translation.model_identifier = model.clone();
        config.routing.cost_model = model.clone();
        config.routing.quality_model = model.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.translation.max_concurrent_translations = concurrency;
    }
    if cli.no_cache {
        config.cache.enable_memory = false;
        config.cache.enable_persistent = false;
    }
    if cli.no_trace {
        config.tracing.enable = false;
    }

    config.validate()?;
    Ok(config)
}

fn load_layout(cli: &Cli) -> Result<Arc<FixtureLayoutExtractor>> {
    let path = cli.layout_json.as_ref().context(
        "no layout extraction input: pass --layout-json <file> (see --help, EXTRACTOR INTEGRATION)",
    )?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading layout JSON from {}", path.display()))?;
    let output: LayoutOutput = serde_json::from_str(&raw)
        .with_context(|| format!("parsing layout JSON from {}", path.display()))?;
    Ok(Arc::new(FixtureLayoutExtractor::new(output)))
}

fn load_visuals(cli: &Cli) -> Result<Arc<FixtureVisualExtractor>> {
    match &cli.visuals_json {
        None => Ok(Arc::new(FixtureVisualExtractor::default())),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading visuals JSON from {}", path.display()))?;
            let assets: Vec<VisualAsset> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing visuals JSON from {}", path.display()))?;
            Ok(Arc::new(FixtureVisualExtractor::new(assets)))
        }
    }
}
