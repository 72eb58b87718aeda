use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use pinforge::{
    BatchRequest, BatchResponse, DirUploader, DirectImageSource, ExportFormat, FieldMapping,
    PoolConfig, RowData, ServerConfig, Template, TemplateRenderer, TextEngine, run_batch, serve,
};

#[derive(Parser, Debug)]
#[command(name = "pinforge", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a batch locally, writing pins into a directory.
    Batch(BatchArgs),
    /// Start the HTTP server.
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// Template JSON: {elements, canvasSize, backgroundColor}.
    #[arg(long)]
    template: PathBuf,

    /// Rows JSON: array of column -> value objects.
    #[arg(long)]
    rows: PathBuf,

    /// Field mapping JSON: template field -> column name.
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Output directory for rendered pins.
    #[arg(long, default_value = "pins")]
    out: PathBuf,

    /// Export format.
    #[arg(long, value_enum, default_value_t = FormatChoice::Jpeg)]
    format: FormatChoice,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 90)]
    quality: u8,

    /// Surface pool size override (otherwise derived from the environment).
    #[arg(long)]
    pool: Option<usize>,

    /// Directory of .ttf/.otf/.ttc fonts to register.
    #[arg(long)]
    fonts: Option<PathBuf>,

    /// Index reported for the first row (page offset into a larger campaign).
    #[arg(long, default_value_t = 0)]
    start_index: usize,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Directory of .ttf/.otf/.ttc fonts to register.
    #[arg(long)]
    fonts: Option<PathBuf>,

    /// HTTP PUT base for uploaded pins.
    #[arg(long)]
    storage_url: Option<String>,

    /// Public URL base reported back for uploaded pins.
    #[arg(long)]
    public_url: Option<String>,

    /// Local output directory used when no storage URL is configured.
    #[arg(long, default_value = "pins")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatChoice {
    Jpeg,
    Png,
}

impl From<FormatChoice> for ExportFormat {
    fn from(choice: FormatChoice) -> Self {
        match choice {
            FormatChoice::Jpeg => ExportFormat::Jpeg,
            FormatChoice::Png => ExportFormat::Png,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Batch(args) => cmd_batch(args).await,
        Command::Serve(args) => cmd_serve(args).await,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let f = File::open(path).with_context(|| format!("open {what} '{}'", path.display()))?;
    let r = BufReader::new(f);
    serde_json::from_reader(r).with_context(|| format!("parse {what} JSON"))
}

async fn cmd_batch(args: BatchArgs) -> anyhow::Result<()> {
    let template: Template = read_json(&args.template, "template")?;
    template.validate()?;
    let rows: Vec<RowData> = read_json(&args.rows, "rows")?;
    let mapping: FieldMapping = match &args.mapping {
        Some(path) => read_json(path, "field mapping")?,
        None => FieldMapping::default(),
    };

    let mut text = TextEngine::new();
    if let Some(dir) = &args.fonts {
        let loaded = text.load_fonts_dir(dir);
        eprintln!("registered {loaded} fonts from {}", dir.display());
    }
    let renderer = TemplateRenderer::new(
        Arc::new(Mutex::new(text)),
        Arc::new(DirectImageSource::new()?),
    );
    let uploader = Arc::new(DirUploader::new(&args.out)?);

    let canvas = template.canvas_size;
    let request = BatchRequest {
        elements: template.elements,
        canvas_size: canvas,
        background_color: template.background_color,
        field_mapping: mapping,
        csv_rows: rows,
        start_index: args.start_index,
        format: args.format.into(),
        quality: args.quality,
    };
    let pool_cfg = args
        .pool
        .map(PoolConfig::fixed)
        .unwrap_or_else(|| PoolConfig::from_env(canvas.width, canvas.height));

    let outcome = run_batch(&request, &renderer, uploader, pool_cfg).await?;
    let stats = outcome.stats;
    println!(
        "{}",
        serde_json::to_string_pretty(&BatchResponse::from(outcome))?
    );
    eprintln!(
        "rendered {}/{} pins into {} ({} failed, {:.1} pins/s)",
        stats.success,
        stats.total,
        args.out.display(),
        stats.failed,
        stats.pins_per_second
    );
    Ok(())
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig {
        listen_addr: args.listen,
        fonts_dir: args.fonts,
        storage_url: args.storage_url,
        public_url: args.public_url,
        output_dir: args.out,
    };
    serve(config).await?;
    Ok(())
}
