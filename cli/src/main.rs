use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bloom_core::{
    engine::{
        Acceleration, AccelerationPreference, Classifier, ClassifierConfig, DEFAULT_FALLBACK_THREADS,
        DEFAULT_INPUT_SIZE, Normalization, OnnxClassifier, ScoreKind,
    },
    pipeline::AnalyzerConfig,
    recognition::{MAX_RESULT_DISPLAY, Recognition, rank},
    runtime::configure_ort_dylib,
    screen::{ResultsView, run_live},
    video::{AspectRatio, FrameGate, GateStats, RgbFrame, SourceSpec},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "bloom-lens",
    version,
    about = "Live camera flower classifier",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a live camera (or video) stream and show the top results.
    Watch {
        /// Capture device, video file or URL
        #[arg(short, long, default_value = "/dev/video0")]
        source: String,

        #[command(flatten)]
        model: ModelArgs,

        /// Pause after each successful analysis, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        cooldown_ms: u64,

        /// Clockwise rotation to apply to frames (overrides stream metadata)
        #[arg(long, allow_hyphen_values = true)]
        rotation: Option<i32>,

        /// Downscale frames to this width before analysis
        #[arg(long)]
        analysis_width: Option<u32>,

        /// Center-crop frames to this aspect ratio (e.g. 16:9, 4:3) or "native"
        #[arg(long, default_value = "16:9")]
        aspect: String,

        /// Print one JSON line per update instead of the live list
        #[arg(long)]
        json: bool,
    },

    /// Classify a single image file.
    Classify {
        /// Image path
        #[arg(short, long)]
        image: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Report which execution path the classifier would use.
    Probe {
        /// CPU threads for the fallback path
        #[arg(long, default_value_t = DEFAULT_FALLBACK_THREADS)]
        threads: usize,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Image-classification ONNX model path
    #[arg(long, default_value = "flower_model.onnx")]
    model: PathBuf,

    /// Label file, one class per line in model output order
    #[arg(long, default_value = "labels.txt")]
    labels: PathBuf,

    /// Execution path
    #[arg(long, value_enum, default_value_t = Accel::Auto)]
    accel: Accel,

    /// CPU threads for the fallback path
    #[arg(long, default_value_t = DEFAULT_FALLBACK_THREADS)]
    threads: usize,

    /// Model input side length
    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,

    /// Input pixel normalisation
    #[arg(long, value_enum, default_value_t = Norm::Unit)]
    normalization: Norm,

    /// Model outputs raw logits (softmax is applied)
    #[arg(long)]
    logits: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Accel {
    Auto,
    Accelerated,
    Cpu,
}

#[derive(Clone, Copy, ValueEnum)]
enum Norm {
    /// x / 255
    Unit,
    /// (x - 127.5) / 127.5
    Symmetric,
}

impl ModelArgs {
    fn load(&self) -> Result<OnnxClassifier> {
        let preference = match self.accel {
            Accel::Auto => AccelerationPreference::Auto,
            Accel::Accelerated => AccelerationPreference::Accelerated,
            Accel::Cpu => AccelerationPreference::Cpu,
        };
        let config = ClassifierConfig {
            input_size: self.input_size,
            normalization: match self.normalization {
                Norm::Unit => Normalization::UnitRange,
                Norm::Symmetric => Normalization::Symmetric,
            },
            scores: if self.logits {
                ScoreKind::Logits
            } else {
                ScoreKind::Probabilities
            },
            acceleration: Acceleration::resolve(preference, self.threads),
        };
        OnnxClassifier::load(&self.model, &self.labels, config)
            .with_context(|| format!("failed to load model: {}", self.model.display()))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info. Logs go to stderr, results to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Before the runtime spawns threads: this may set ORT_DYLIB_PATH.
    configure_ort_dylib();

    match cli.command {
        Commands::Watch {
            source,
            model,
            cooldown_ms,
            rotation,
            analysis_width,
            aspect,
            json,
        } => {
            let target_aspect = match aspect.as_str() {
                "native" => None,
                ratio => Some(ratio.parse::<AspectRatio>()?),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            let spec = SourceSpec {
                input: source,
                rotation,
                target_width: analysis_width,
                target_aspect,
            };
            runtime.block_on(cmd_watch(spec, model, cooldown_ms, json))
        }
        Commands::Classify { image, model } => cmd_classify(image, model),
        Commands::Probe { threads } => cmd_probe(threads),
    }
}

// ── watch ─────────────────────────────────────────────────────────────────────

async fn cmd_watch(
    spec: SourceSpec,
    model: ModelArgs,
    cooldown_ms: u64,
    json: bool,
) -> Result<()> {
    info!("Live classification");
    info!("  source : {}", spec.input);
    info!("  model  : {}", model.model.display());

    let classifier = model.load()?;
    let config = AnalyzerConfig {
        cooldown: Duration::from_millis(cooldown_ms),
        ..AnalyzerConfig::default()
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_on_signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
            cancel_on_signal.store(true, Ordering::Relaxed);
        }
    });

    let gate = FrameGate::new();
    let report = if json {
        run_live(spec, classifier, config, JsonView, gate, cancel).await?
    } else {
        let view = TerminalView::new(&spec.input, gate.clone());
        run_live(spec, classifier, config, view, gate, cancel).await?
    };

    info!(
        frames = report.frames_decoded,
        delivered = report.gate.delivered,
        skipped = report.gate.skipped,
        updates = report.updates,
        "session finished"
    );
    for row in &report.latest {
        info!("  last: {row}");
    }
    Ok(())
}

/// Live list: a header tracking the source, then one progress bar per
/// recognition row, bar length = confidence.
struct TerminalView {
    _multi: MultiProgress,
    header: ProgressBar,
    rows: Vec<ProgressBar>,
    ticker: tokio::task::JoinHandle<()>,
}

impl TerminalView {
    /// Must be called from within a Tokio runtime.
    fn new(source: &str, gate: FrameGate) -> Self {
        let multi = MultiProgress::new();
        let header = multi.add(spinner(&format!("Watching {source}…")));

        let style = ProgressStyle::with_template("  {msg:<28} {bar:30.green/white} {prefix}")
            .expect("static progress template")
            .progress_chars("█▉░");
        let rows = (0..MAX_RESULT_DISPLAY)
            .map(|_| {
                let bar = multi.add(ProgressBar::new(1_000));
                bar.set_style(style.clone());
                bar
            })
            .collect();

        let source = source.to_string();
        let status = header.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                status.set_message(source_status(&source, gate.stats()));
            }
        });

        Self {
            _multi: multi,
            header,
            rows,
            ticker,
        }
    }
}

/// Header line: how many frames the source produced and what became of them.
fn source_status(source: &str, stats: GateStats) -> String {
    format!(
        "{source}  {} frames, {} delivered, {} skipped",
        stats.delivered + stats.skipped,
        stats.delivered,
        stats.skipped
    )
}

impl ResultsView for TerminalView {
    fn render(&mut self, rows: &[Recognition]) {
        for (i, bar) in self.rows.iter().enumerate() {
            match rows.get(i) {
                Some(r) => {
                    bar.set_message(r.label().to_string());
                    bar.set_prefix(r.percentage());
                    bar.set_position((r.confidence().clamp(0.0, 1.0) * 1_000.0) as u64);
                }
                None => {
                    let msg = if i == 0 { "No recognitions" } else { "" };
                    bar.set_message(msg.to_string());
                    bar.set_prefix(String::new());
                    bar.set_position(0);
                }
            }
        }
    }
}

impl Drop for TerminalView {
    fn drop(&mut self) {
        self.ticker.abort();
        self.header.finish_with_message("Stopped.");
        for bar in &self.rows {
            bar.abandon();
        }
    }
}

/// Machine-readable output: `{"recognitions":[{"label":…,"confidence":…},…]}`.
struct JsonView;

impl ResultsView for JsonView {
    fn render(&mut self, rows: &[Recognition]) {
        match serde_json::to_string(&serde_json::json!({ "recognitions": rows })) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("failed to encode results: {e}"),
        }
    }
}

// ── classify ──────────────────────────────────────────────────────────────────

fn cmd_classify(image: PathBuf, model: ModelArgs) -> Result<()> {
    let frame = RgbFrame::open(&image)?;
    let mut classifier = model.load()?;

    let categories = classifier
        .classify(&frame)
        .with_context(|| format!("classification failed: {}", image.display()))?;
    let ranked = rank(categories, MAX_RESULT_DISPLAY);

    if ranked.is_empty() {
        println!("No recognitions");
    }
    for r in &ranked {
        println!("{:<28} {:>7}", r.label(), r.percentage());
    }
    Ok(())
}

// ── probe ─────────────────────────────────────────────────────────────────────

fn cmd_probe(threads: usize) -> Result<()> {
    match Acceleration::resolve(AccelerationPreference::Auto, threads) {
        Acceleration::Accelerated => println!("accelerated (hardware execution provider)"),
        Acceleration::Fallback { threads } => println!("cpu fallback ({threads} threads)"),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .expect("static progress template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_status_counts_every_decoded_frame() {
        let stats = GateStats {
            delivered: 3,
            skipped: 147,
        };
        assert_eq!(
            source_status("/dev/video0", stats),
            "/dev/video0  150 frames, 3 delivered, 147 skipped"
        );
    }

    #[test]
    fn watch_defaults_to_wide_aspect() {
        let cli = Cli::try_parse_from(["bloom-lens", "watch"]).unwrap();
        let Commands::Watch {
            aspect,
            cooldown_ms,
            ..
        } = cli.command
        else {
            panic!("expected watch");
        };
        assert_eq!(aspect.parse::<AspectRatio>().unwrap(), AspectRatio::RATIO_16_9);
        assert_eq!(cooldown_ms, 2_000);
    }
}
