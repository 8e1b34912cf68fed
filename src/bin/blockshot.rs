//! CLI binary for blockshot.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, wires collaborators and prints results.

use anyhow::{Context, Result};
use blockshot::pipeline::ids::KindCounters;
use blockshot::{
    correlate, html_page, render_with, scan_with, write_output, BlockshotError,
    ConversionProgressCallback, ConversionReport, MemoryDom, ScanConfig,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

#[cfg_attr(not(feature = "chrome"), allow(dead_code))]
/// Live progress bar plus one log line per block. Uploads finish out of
/// order, so per-block timings are keyed by block id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Launching browser…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} blocks  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
    }

    fn elapsed(&self, block_id: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(block_id))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_blocks: usize) {
        self.activate_bar(total_blocks);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_blocks} blocks…"))
        ));
    }

    fn on_block_start(&self, block_id: &str, _index: usize, _total: usize) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(block_id.to_string(), Instant::now());
        }
        self.bar.set_message(block_id.to_string());
    }

    fn on_block_complete(&self, block_id: &str, _total: usize, url: &str) {
        let secs = self.elapsed(block_id);
        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            green("✓"),
            block_id,
            dim(url),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_block_error(&self, block_id: &str, _total: usize, error: &str) {
        let secs = self.elapsed(block_id);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            red("✗"),
            block_id,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_blocks: usize, success_count: usize) {
        let failed = total_blocks.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} blocks converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} blocks converted  ({} failed)",
                if failed == total_blocks { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_blocks,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # List the blocks that would be converted
  blockshot scan post.md

  # Preview the rendered page
  blockshot render post.md -o preview.html

  # Check that every block has a rendered element
  blockshot check post.md --headings 2-3

  # Convert, writing images to ./images
  blockshot convert post.md -o post.wechat.md

  # Convert, uploading to an image host
  blockshot convert post.md --upload-url https://img.example.com/api/upload -o out.md

ENVIRONMENT VARIABLES:
  BLOCKSHOT_UPLOAD_URL    Image host endpoint (multipart POST, answers {"url": "..."})
  BLOCKSHOT_UPLOAD_TOKEN  Bearer token for the image host
  BLOCKSHOT_STATE         Cache/marker file (default: .blockshot/state.json)
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Convert rich Markdown blocks to images for WeChat publishing.
#[derive(Parser, Debug)]
#[command(
    name = "blockshot",
    version,
    about = "Convert admonitions, math and code blocks in Markdown to uploaded images",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "BLOCKSHOT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "BLOCKSHOT_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the convertible blocks of a document.
    Scan {
        #[command(flatten)]
        doc: DocArgs,

        /// Print the scan report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Render a document to an HTML page with block identities.
    Render {
        #[command(flatten)]
        doc: DocArgs,

        /// Write HTML to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify that every block has a rendered element.
    Check {
        #[command(flatten)]
        doc: DocArgs,
    },
    /// Capture, upload and substitute every block.
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
struct DocArgs {
    /// Markdown file.
    input: PathBuf,

    /// Also convert ATX headings of these levels, e.g. `2` or `2-3`.
    #[arg(long, env = "BLOCKSHOT_HEADINGS")]
    headings: Option<String>,

    /// Page width in CSS pixels.
    #[arg(long, env = "BLOCKSHOT_WIDTH", default_value_t = 677)]
    width: u32,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    doc: DocArgs,

    /// Write the converted Markdown here instead of stdout.
    #[arg(short, long, env = "BLOCKSHOT_OUTPUT")]
    output: Option<PathBuf>,

    /// Image host endpoint; images go to --image-dir when unset.
    #[arg(long, env = "BLOCKSHOT_UPLOAD_URL")]
    upload_url: Option<String>,

    /// Bearer token for --upload-url.
    #[arg(long, env = "BLOCKSHOT_UPLOAD_TOKEN", hide_env_values = true)]
    upload_token: Option<String>,

    /// Directory for images when no --upload-url is given.
    #[arg(long, env = "BLOCKSHOT_IMAGE_DIR", default_value = "images")]
    image_dir: PathBuf,

    /// Public URL prefix of --image-dir.
    #[arg(long, env = "BLOCKSHOT_BASE_URL")]
    base_url: Option<String>,

    /// Upload category / sub-directory.
    #[arg(long, env = "BLOCKSHOT_CATEGORY", default_value = "blockshot")]
    category: String,

    /// Cache and marker state file.
    #[arg(long, env = "BLOCKSHOT_STATE", default_value = ".blockshot/state.json")]
    state: PathBuf,

    /// Device pixel ratio (1–4).
    #[arg(long, env = "BLOCKSHOT_PIXEL_RATIO", default_value_t = 2.0)]
    pixel_ratio: f32,

    /// Concurrent uploads.
    #[arg(short, long, env = "BLOCKSHOT_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Upload retries per block.
    #[arg(long, env = "BLOCKSHOT_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Poll each new URL this many times before accepting it.
    #[arg(long, env = "BLOCKSHOT_AVAILABILITY_ATTEMPTS", default_value_t = 0)]
    availability_attempts: u32,

    /// HTTP timeout in seconds.
    #[arg(long, env = "BLOCKSHOT_HTTP_TIMEOUT", default_value_t = 60)]
    http_timeout: u64,

    /// Print the conversion report as JSON on stdout. The Markdown still goes
    /// to --output when set.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "BLOCKSHOT_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = match &cli.command {
        Command::Convert(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
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
        Command::Scan { doc, json } => run_scan(&doc, json).await,
        Command::Render { doc, output } => run_render(&doc, output.as_deref()).await,
        Command::Check { doc } => run_check(&doc, cli.quiet).await,
        Command::Convert(args) => run_convert(args, show_progress, cli.quiet).await,
    }
}

async fn read_input(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(BlockshotError::InputNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn scan_config(doc: &DocArgs) -> Result<ScanConfig> {
    let mut scan = ScanConfig::default();
    if let Some(spec) = &doc.headings {
        scan.heading_levels = Some(parse_headings(spec)?);
    }
    Ok(scan)
}

/// Parse `--headings` (`3` or `2-4`) into a level range.
fn parse_headings(s: &str) -> Result<(u8, u8)> {
    let s = s.trim();
    let (min, max) = match s.split_once('-') {
        Some((a, b)) => (
            a.trim().parse::<u8>().context("Invalid minimum heading level")?,
            b.trim().parse::<u8>().context("Invalid maximum heading level")?,
        ),
        None => {
            let level = s.parse::<u8>().context("Invalid heading level")?;
            (level, level)
        }
    };
    if !(2..=6).contains(&min) || !(2..=6).contains(&max) || min > max {
        anyhow::bail!("Heading levels must satisfy 2 ≤ min ≤ max ≤ 6 (got '{}')", s);
    }
    Ok((min, max))
}

async fn run_scan(doc: &DocArgs, json: bool) -> Result<()> {
    let markdown = read_input(&doc.input).await?;
    let report = scan_with(&markdown, &scan_config(doc)?, &mut KindCounters::new());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise scan report")?
        );
        return Ok(());
    }

    for block in &report.blocks {
        println!(
            "{:<16} lines {:>4}–{:<4} bytes {:>6}..{:<6}",
            block.id, block.start_line, block.end_line, block.start_offset, block.end_offset
        );
    }
    eprintln!(
        "{} block(s), {} nested candidate(s) skipped",
        report.blocks.len(),
        report.nested_count()
    );
    Ok(())
}

async fn run_render(doc: &DocArgs, output: Option<&Path>) -> Result<()> {
    let markdown = read_input(&doc.input).await?;
    let rendered = render_with(
        &markdown,
        &scan_config(doc)?,
        &mut KindCounters::new(),
        blockshot::render::IDENTITY_ATTRIBUTE,
    );
    let page = html_page(&rendered, doc.width, None);

    match output {
        Some(path) => {
            tokio::fs::write(path, &page)
                .await
                .map_err(|e| BlockshotError::OutputWriteFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            eprintln!(
                "{} {} block element(s)  →  {}",
                green("✔"),
                rendered.elements.len(),
                bold(&path.display().to_string())
            );
        }
        None => {
            io::stdout()
                .lock()
                .write_all(page.as_bytes())
                .context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

async fn run_check(doc: &DocArgs, quiet: bool) -> Result<()> {
    let markdown = read_input(&doc.input).await?;
    let scan = scan_config(doc)?;
    let blocks = scan_with(&markdown, &scan, &mut KindCounters::new()).blocks;
    let rendered = render_with(
        &markdown,
        &scan,
        &mut KindCounters::new(),
        blockshot::render::IDENTITY_ATTRIBUTE,
    );
    let dom = MemoryDom::from_rendered(&rendered);

    let correlation = correlate(&blocks, &dom);
    if !quiet {
        for entry in &correlation.entries {
            match entry.strategy {
                Some(strategy) => println!("  {} {:<16} {}", green("✓"), entry.block_id, dim(strategy)),
                None => println!("  {} {:<16} {}", red("✗"), entry.block_id, red("no element")),
            }
        }
    }
    correlation.into_matched()?;
    if !quiet {
        eprintln!("{} all {} block(s) located", green("✔"), blocks.len());
    }
    Ok(())
}

/// Write the converted Markdown to `output` when set, then put either the
/// JSON report or (without an output file) the Markdown on `stdout`.
#[cfg_attr(not(feature = "chrome"), allow(dead_code))]
async fn emit_results(
    text: &str,
    report: &ConversionReport,
    output: Option<&Path>,
    json: bool,
    stdout: &mut dyn Write,
) -> Result<()> {
    if let Some(path) = output {
        write_output(path, text).await?;
    }
    if json {
        let rendered = serde_json::to_string_pretty(report).context("Failed to serialise report")?;
        writeln!(stdout, "{rendered}").context("Failed to write to stdout")?;
    } else if output.is_none() {
        stdout
            .write_all(text.as_bytes())
            .context("Failed to write to stdout")?;
    }
    Ok(())
}

#[cfg(not(feature = "chrome"))]
async fn run_convert(_args: ConvertArgs, _show_progress: bool, _quiet: bool) -> Result<()> {
    anyhow::bail!("`convert` needs a browser; rebuild with `--features chrome`")
}

#[cfg(feature = "chrome")]
async fn run_convert(args: ConvertArgs, show_progress: bool, quiet: bool) -> Result<()> {
    use blockshot::browser::ChromeSession;
    use blockshot::pipeline::upload::{DirUploader, HttpProbe, HttpUploader, Uploader};
    use blockshot::{
        Collaborators, ConversionConfig, ConversionOrchestrator, JsonFileStore,
        LogNotifier, ProgressCallback,
    };

    let markdown = read_input(&args.doc.input).await?;

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let mut builder = ConversionConfig::builder()
        .pixel_ratio(args.pixel_ratio)
        .upload_concurrency(args.concurrency)
        .max_retries(args.max_retries)
        .availability_attempts(args.availability_attempts)
        .upload_category(args.category.clone())
        .scan(scan_config(&args.doc)?);
    if let Some(cb) = progress_cb {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("Invalid configuration")?;

    // ── Collaborators ────────────────────────────────────────────────────
    let timeout = Duration::from_secs(args.http_timeout);
    let uploader: Arc<dyn Uploader> = match &args.upload_url {
        Some(url) => {
            let mut http = HttpUploader::new(url.clone(), timeout).map_err(anyhow::Error::msg)?;
            if let Some(token) = &args.upload_token {
                http = http.with_token(token.clone());
            }
            Arc::new(http)
        }
        None => {
            let mut dir = DirUploader::new(&args.image_dir);
            if let Some(base) = &args.base_url {
                dir = dir.with_base_url(base.clone());
            }
            Arc::new(dir)
        }
    };
    let probe = HttpProbe::new(timeout).map_err(anyhow::Error::msg)?;
    let store = JsonFileStore::open(&args.state).context("Failed to open state file")?;

    let rendered = render_with(
        &markdown,
        &config.scan,
        &mut KindCounters::new(),
        &config.identity_attribute,
    );
    let chrome = ChromeSession::open(html_page(&rendered, args.doc.width, None), args.doc.width)
        .await
        .context("Failed to start headless Chrome")?;

    let collaborators = Collaborators::new(Arc::new(chrome.raster()), uploader)
        .with_probe(Arc::new(probe))
        .with_notifier(Arc::new(LogNotifier));
    let orchestrator = ConversionOrchestrator::new(config, collaborators, Arc::new(store));

    // ── Run conversion ───────────────────────────────────────────────────
    let (output, report) = orchestrator
        .convert_document(&markdown, &chrome.dom())
        .await
        .context("Conversion failed")?;

    emit_results(
        &output.text,
        &report,
        args.output.as_deref(),
        args.json,
        &mut io::stdout().lock(),
    )
    .await?;

    if !quiet {
        let stats = &report.stats;
        eprintln!(
            "{}  {}/{} blocks substituted  {} cached  {} reused  {}ms{}",
            if stats.failed_blocks == 0 { green("✔") } else { cyan("⚠") },
            output.substituted_count,
            output.total_count,
            dim(&stats.cached_blocks.to_string()),
            dim(&stats.reused_blocks.to_string()),
            stats.total_duration_ms,
            match &args.output {
                Some(p) => format!("  →  {}", bold(&p.display().to_string())),
                None => String::new(),
            },
        );
    }

    Ok(())
}
