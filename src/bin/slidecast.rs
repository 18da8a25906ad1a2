//! CLI binary for slidecast.
//!
//! `run` narrates one deck in the foreground; `serve` starts the HTTP
//! trigger surface. Both map their flags onto `PipelineConfig`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use slidecast::server::{self, AppState, ServerConfig};
use slidecast::{
    run_pipeline, Collaborators, PipelineConfig, PipelineProgressCallback, ProgressCallback,
    ProviderChoice, RunContext, RunOutcome, RunState, RunStatus, Stage,
};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Idle => "Idle",
        Stage::Converting => "Converting",
        Stage::Recognizing => "Recognizing",
        Stage::Enriching => "Enriching",
        Stage::Scripting => "Scripting",
        Stage::Synthesizing => "Synthesizing",
        Stage::Dispatching => "Dispatching",
        Stage::Completed => "Completed",
        Stage::Stopped => "Stopped",
        Stage::Failed => "Failed",
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar that is re-armed at every stage boundary, plus
/// a log line per degraded page.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Validating deck…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch to a counted bar for a stage with a known number of units.
    fn activate_bar(&self, stage: Stage, total: usize) {
        let unit = if stage == Stage::Scripting { "batches" } else { "pages" };
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_style(style);
        self.bar.set_prefix(stage_label(stage));
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, source: &str) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Narrating {source}"))
        ));
    }

    fn on_stage_start(&self, stage: Stage, units: usize) {
        if units == 0 {
            self.bar.set_prefix(stage_label(stage));
            self.bar.set_message("working…");
        } else {
            self.activate_bar(stage, units);
        }
    }

    fn on_page_recognized(&self, _page_num: usize, _total: usize, _text_len: usize) {
        self.bar.inc(1);
    }

    fn on_page_enriched(&self, _page_num: usize, _total: usize) {
        self.bar.inc(1);
    }

    fn on_batch_scripted(&self, batch: usize, total: usize, narrated: usize) {
        self.bar.println(format!(
            "  {} Batch {:>2}/{:<2}  {}",
            green("✓"),
            batch + 1,
            total,
            dim(&format!("{narrated} slides narrated")),
        ));
        self.bar.inc(1);
    }

    fn on_page_synthesized(&self, _page_num: usize, _total: usize) {
        self.bar.inc(1);
    }

    fn on_page_dispatched(&self, page_num: usize, total: usize) {
        self.bar.println(format!(
            "  {} Slide {:>3}/{:<3}  {}",
            green("▶"),
            page_num,
            total,
            dim("sent to avatar"),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, stage: Stage, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Slide {:>3}  {}  {}",
            red("✗"),
            page_num,
            dim(stage_label(stage)),
            red(&msg),
        ));
    }

    fn on_run_complete(&self, status: RunStatus) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        match status {
            RunStatus::Completed if errors == 0 => {
                eprintln!("{} {}", green("✔"), bold("Presentation narrated"))
            }
            RunStatus::Completed => eprintln!(
                "{} {}  ({} slide errors)",
                cyan("⚠"),
                bold("Presentation narrated"),
                red(&errors.to_string())
            ),
            RunStatus::Stopped => eprintln!("{} {}", cyan("■"), bold("Processing stopped")),
            RunStatus::Failed => eprintln!("{} {}", red("✘"), bold("Processing failed")),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Narrate one deck and push it to the avatar
  slidecast run deck.pptx -o out/deck

  # Faster pacing, bigger scripting batches, JSON outcome on stdout
  slidecast run deck.pptx --dispatch-delay-ms 1500 --batch-size 8 --json

  # Start the upload service
  slidecast serve --addr 0.0.0.0:5000 --recovery-command "systemctl restart audio2face"

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (vision + scripting)
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  GOOGLE_TTS_API_KEY      Google Cloud Text-to-Speech key
  SLIDECAST_AVATAR_URL    Audio2Face gRPC endpoint, e.g. 192.168.1.20:50051
  HOST_IP_ADDRESS         Audio2Face host when SLIDECAST_AVATAR_URL is unset

EXTERNAL TOOLS:
  libreoffice   deck → PDF
  convert       PDF → page images (ImageMagick)
  tesseract     page text recognition
"#;

/// Turn a slide deck into narrated audio for a talking avatar.
#[derive(Parser, Debug)]
#[command(
    name = "slidecast",
    version,
    about = "Turn a slide deck into narrated audio for a talking avatar",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SLIDECAST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SLIDECAST_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Narrate one deck end to end. Ctrl-C stops the run cooperatively.
    Run(RunArgs),
    /// Serve POST /upload, POST /stop and GET /status.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Deck to narrate (.pptx by default).
    file: PathBuf,

    /// Directory for the PDF, page images, audio and manifest.
    #[arg(short, long, env = "SLIDECAST_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// Print the full run outcome as JSON on stdout.
    #[arg(long, env = "SLIDECAST_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "SLIDECAST_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "SLIDECAST_ADDR", default_value = "0.0.0.0:5000")]
    addr: SocketAddr,

    /// Where uploaded decks are saved.
    #[arg(long, env = "SLIDECAST_UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    /// Root under which each run gets its own output directory.
    #[arg(long, env = "SLIDECAST_OUTPUT_ROOT", default_value = "outputs")]
    output_root: PathBuf,

    /// Upload size limit in bytes.
    #[arg(long, env = "SLIDECAST_MAX_UPLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// Command run after /stop to recover the avatar, split on whitespace.
    #[arg(long, env = "SLIDECAST_RECOVERY_COMMAND")]
    recovery_command: Option<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

/// Knobs shared by `run` and `serve`.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Model used to write the narration (default: gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision model for slide analysis (default: same as --model).
    #[arg(long, env = "SLIDECAST_VISION_MODEL")]
    vision_model: Option<String>,

    /// Rasterisation density (72–600).
    #[arg(long, env = "SLIDECAST_DENSITY", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    density: u32,

    /// Concurrent recognition workers (default: cores - 1, at most 8).
    #[arg(long, env = "SLIDECAST_WORKERS")]
    workers: Option<usize>,

    /// Per-page recognition timeout in seconds.
    #[arg(long, env = "SLIDECAST_RECOGNITION_TIMEOUT", default_value_t = 60)]
    recognition_timeout: u64,

    /// Slides per scripting call.
    #[arg(long, env = "SLIDECAST_BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    /// Pause between avatar dispatches, in milliseconds.
    #[arg(long, env = "SLIDECAST_DISPATCH_DELAY_MS", default_value_t = 3000)]
    dispatch_delay_ms: u64,

    /// Report completion without waiting for in-flight avatar pushes.
    #[arg(long, env = "SLIDECAST_NO_AWAIT_DISPATCHES")]
    no_await_dispatches: bool,

    /// Audio2Face streaming player prim path.
    #[arg(long, env = "SLIDECAST_AVATAR_INSTANCE",
          default_value = "/World/audio2face/PlayerStreaming")]
    avatar_instance: String,

    /// Path to a text file with custom presenter instructions.
    #[arg(long, env = "SLIDECAST_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Scripting temperature (0.0–2.0).
    #[arg(long, env = "SLIDECAST_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Max tokens per scripting call.
    #[arg(long, env = "SLIDECAST_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Retries per scripting batch on transport failure.
    #[arg(long, env = "SLIDECAST_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Skip writing manifest.json.
    #[arg(long, env = "SLIDECAST_NO_MANIFEST")]
    no_manifest: bool,
}

impl PipelineArgs {
    fn provider_choice(&self) -> ProviderChoice {
        ProviderChoice {
            provider: self.provider.clone(),
            model: self.model.clone(),
            vision_model: self.vision_model.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The bar carries the feedback during `run`; library INFO logs would
    // only tear it.
    let show_progress = match cli.command {
        Command::Run(ref args) => !cli.quiet && !args.no_progress && !args.json,
        Command::Serve(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(args, cli.quiet, show_progress).await,
        Command::Serve(args) => serve(args).await,
    }
}

async fn run(args: RunArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args.pipeline, progress).await?;
    let collaborators = Collaborators::from_env(&config, &args.pipeline.provider_choice())
        .context("Failed to configure collaborators")?;

    let state = RunState::new();
    let ctx = RunContext::begin(&state, &config).context("Failed to start run")?;

    let stopper = Arc::clone(&state);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} stopping after the current step…", cyan("■"));
            stopper.cancel();
        }
    });

    let outcome = run_pipeline(&args.file, &args.output_dir, &ctx, &collaborators, &config).await;
    ctrl_c.abort();

    if args.json {
        let json = serde_json::to_string_pretty(&outcome).context("Failed to serialise outcome")?;
        println!("{json}");
    } else if !quiet {
        print_summary(&outcome, show_progress);
    }

    match outcome.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Stopped => std::process::exit(130),
        RunStatus::Failed => {
            anyhow::bail!(outcome.error.unwrap_or(outcome.message))
        }
    }
}

fn print_summary(outcome: &RunOutcome, show_progress: bool) {
    let s = &outcome.stats;
    if !show_progress {
        eprintln!("{} ({:?})", outcome.message, outcome.status);
    }
    eprintln!(
        "   {}/{} slides narrated  /  {} synthesised  /  {} delivered  -  {}ms",
        s.narrated_pages, s.total_pages, s.synthesized_pages, s.dispatched_pages, s.total_duration_ms,
    );
    for audio in outcome.audio_paths() {
        eprintln!("   {}", dim(&audio.display().to_string()));
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = build_config(&args.pipeline, None).await?;
    let collaborators = Collaborators::from_env(&config, &args.pipeline.provider_choice())
        .context("Failed to configure collaborators")?;

    let recovery_command = args
        .recovery_command
        .as_deref()
        .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|parts| !parts.is_empty());
    let server_config = ServerConfig {
        upload_dir: args.upload_dir,
        output_root: args.output_root,
        max_upload_bytes: args.max_upload_bytes,
        recovery_command,
    };

    let state = AppState::new(RunState::new(), collaborators, config, server_config);
    let run_state = Arc::clone(state.run_state());
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        run_state.cancel();
    };
    server::serve(args.addr, state, shutdown)
        .await
        .context("Server failed")?;
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(
    args: &PipelineArgs,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .density(args.density)
        .recognition_timeout_secs(args.recognition_timeout)
        .batch_size(args.batch_size)
        .dispatch_delay_ms(args.dispatch_delay_ms)
        .await_dispatches(!args.no_await_dispatches)
        .avatar_instance(args.avatar_instance.clone())
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_retries(args.max_retries)
        .write_manifest(!args.no_manifest);

    if let Some(n) = args.workers {
        builder = builder.recognition_workers(n);
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn provider_and_model_read_the_library_env_vars() {
        let cmd = Cli::command();
        for sub in ["run", "serve"] {
            let sub = cmd.find_subcommand(sub).unwrap();
            let env = |id: &str| {
                sub.get_arguments()
                    .find(|a| a.get_id() == id)
                    .and_then(|a| a.get_env())
                    .map(OsStr::to_os_string)
            };
            assert_eq!(env("provider").as_deref(), Some(OsStr::new("EDGEQUAKE_LLM_PROVIDER")));
            assert_eq!(env("model").as_deref(), Some(OsStr::new("EDGEQUAKE_MODEL")));
        }
    }
}
