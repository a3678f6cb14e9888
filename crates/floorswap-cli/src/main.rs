mod server;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use floorswap_contracts::runs::remix::RemixHistory;
use floorswap_contracts::runs::summary::{write_summary, BatchSummary};
use floorswap_engine::{
    EngineConfig, FloorError, FloorJob, FloorOutcome, FloorReplaceEngine, InstructionTemplate,
    UploadedImage,
};

const FLOOR_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Parser)]
#[command(
    name = "floorswap",
    version,
    about = "Replace the floor in room photos with a flooring product reference"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One room photo with one or two product references.
    Generate(GenerateArgs),
    /// Every room against every product image in a floors directory.
    Batch(BatchArgs),
    /// One room against a random product not tried yet.
    Remix(RemixArgs),
    /// HTTP API with `/api/generate-floor` and `/outputs`.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct JobArgs {
    #[arg(long)]
    mask: Option<PathBuf>,
    #[arg(long)]
    hints: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    top_p: Option<f64>,
    #[arg(long)]
    seed: Option<i64>,
    /// `universal` or `multi-reference`; picked from the reference count when unset.
    #[arg(long)]
    template: Option<String>,
    /// Also send center and corner close-ups of the first reference.
    #[arg(long)]
    closeups: bool,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    room: PathBuf,
    #[arg(long)]
    reference: PathBuf,
    #[arg(long)]
    reference2: Option<PathBuf>,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long, required = true)]
    room: Vec<PathBuf>,
    #[arg(long)]
    floors_dir: PathBuf,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Parser)]
struct RemixArgs {
    #[arg(long)]
    room: PathBuf,
    #[arg(long)]
    floors_dir: PathBuf,
    /// History file; defaults to `remix_history.json` in the records directory.
    #[arg(long)]
    state: Option<PathBuf>,
    #[arg(long)]
    reset: bool,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("floorswap error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    match cli.command {
        Command::Generate(args) => run_generate(config, args),
        Command::Batch(args) => run_batch(config, args),
        Command::Remix(args) => run_remix(config, args),
        Command::Serve(args) => run_serve(config, args),
    }
}

fn run_generate(config: EngineConfig, args: GenerateArgs) -> Result<i32> {
    let mut engine = build_engine(config, &args.job)?;
    let references: Vec<PathBuf> = std::iter::once(args.reference.clone())
        .chain(args.reference2.clone())
        .collect();
    for reference in &references {
        allow_parent(&mut engine, reference);
    }

    let room = UploadedImage::from_path(&args.room)?;
    let job = build_job(&args.job, room, &references)?;
    match engine.generate(&job) {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(0)
        }
        Err(FloorError::EmptyResult { .. }) => {
            eprintln!("No image returned");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn run_batch(config: EngineConfig, args: BatchArgs) -> Result<i32> {
    let mut engine = build_engine(config, &args.job)?;
    let floors = list_floor_images(&args.floors_dir)?;
    if floors.is_empty() {
        bail!("no floor images found in {}", args.floors_dir.display());
    }
    if !engine.add_allowed_root(&args.floors_dir) {
        bail!("floors directory {} is not accessible", args.floors_dir.display());
    }

    let mut summary = BatchSummary::new(engine.session_id());
    for room_path in &args.room {
        let room_name = display_name(room_path);
        let room = match UploadedImage::from_path(room_path) {
            Ok(room) => room,
            Err(err) => {
                eprintln!("{room_name}: {err}");
                for floor in &floors {
                    summary.record_failure(&room_name, &display_name(floor), err.to_string());
                }
                continue;
            }
        };
        for floor in &floors {
            let floor_name = display_name(floor);
            let outcome = build_job(&args.job, room.clone(), std::slice::from_ref(floor))
                .map_err(|err| err.to_string())
                .and_then(|job| engine.generate(&job).map_err(|err| err.to_string()));
            match outcome {
                Ok(outcome) => {
                    println!("{room_name} × {floor_name}");
                    print_outcome(&outcome);
                    summary.record_success(&room_name, &floor_name, output_files(&outcome));
                }
                Err(message) => {
                    eprintln!("{room_name} × {floor_name}: {message}");
                    summary.record_failure(&room_name, &floor_name, message);
                }
            }
        }
    }
    summary.finish();

    let summary_path = engine.config().records_dir().join("summary.json");
    write_summary(&summary_path, &summary)?;
    println!(
        "{} attempted, {} succeeded, {} failed. Summary: {}",
        summary.attempted,
        summary.succeeded,
        summary.failed,
        summary_path.display()
    );
    Ok(if summary.failed == 0 { 0 } else { 1 })
}

fn run_remix(config: EngineConfig, args: RemixArgs) -> Result<i32> {
    let mut engine = build_engine(config, &args.job)?;
    let floors = list_floor_images(&args.floors_dir)?;
    if floors.is_empty() {
        bail!("no floor images found in {}", args.floors_dir.display());
    }
    if !engine.add_allowed_root(&args.floors_dir) {
        bail!("floors directory {} is not accessible", args.floors_dir.display());
    }

    let state_path = args
        .state
        .clone()
        .unwrap_or_else(|| engine.config().records_dir().join("remix_history.json"));
    let mut history = RemixHistory::load(&state_path);
    if args.reset {
        history.reset();
        history.save(&state_path)?;
    }

    let Some(floor) = history
        .pick_unused(&floors, &mut rand::thread_rng())
        .cloned()
    else {
        println!(
            "Every floor in {} has been tried. Run with --reset to start over.",
            args.floors_dir.display()
        );
        return Ok(0);
    };

    println!("Remixing with {}", display_name(&floor));
    let room = UploadedImage::from_path(&args.room)?;
    let job = build_job(&args.job, room, std::slice::from_ref(&floor))?;
    match engine.generate(&job) {
        Ok(outcome) => {
            history.record(&floor);
            history.save(&state_path)?;
            print_outcome(&outcome);
            println!("{} floors left untried.", history.remaining(&floors).len());
            Ok(0)
        }
        Err(FloorError::EmptyResult { .. }) => {
            eprintln!("No image returned");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn run_serve(mut config: EngineConfig, args: ServeArgs) -> Result<i32> {
    if let Some(out) = args.out.as_ref() {
        apply_out_dir(&mut config, out, None);
    }
    let engine = FloorReplaceEngine::new(config)?;
    if engine.allowlist().is_empty() {
        eprintln!("warning: FLOORSWAP_ALLOWED_ROOTS is empty; every reference path will be rejected");
    }
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(server::serve(engine, &args.bind))?;
    Ok(0)
}

fn build_engine(mut config: EngineConfig, job: &JobArgs) -> Result<FloorReplaceEngine> {
    if let Some(out) = job.out.as_ref() {
        apply_out_dir(&mut config, out, job.events.as_deref());
    } else if let Some(events) = job.events.as_ref() {
        config.events_path = Some(events.clone());
    }
    Ok(FloorReplaceEngine::new(config)?)
}

/// Records follow `--out` to its sibling directory unless one was configured.
fn apply_out_dir(config: &mut EngineConfig, out: &Path, events: Option<&Path>) {
    config.outputs_dir = out.to_path_buf();
    config.events_path = Some(
        events
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.records_dir().join("events.jsonl")),
    );
}

fn build_job(args: &JobArgs, room: UploadedImage, references: &[PathBuf]) -> Result<FloorJob> {
    let template = match args.template.as_deref() {
        Some(raw) => Some(
            InstructionTemplate::parse(raw)
                .with_context(|| format!("unknown template {raw:?} (universal, multi-reference)"))?,
        ),
        None => None,
    };
    let mask = match args.mask.as_ref() {
        Some(path) => Some(UploadedImage::from_path(path)?),
        None => None,
    };
    Ok(FloorJob {
        room,
        reference_paths: references
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect(),
        mask,
        product_hints: args.hints.clone(),
        template,
        texture_closeups: args.closeups,
        model: args.model.clone(),
        temperature: args.temperature,
        top_p: args.top_p,
        seed: args.seed,
    })
}

/// Explicitly named references are trusted: their directory joins the allowlist.
fn allow_parent(engine: &mut FloorReplaceEngine, reference: &Path) -> bool {
    let parent = match reference.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    engine.add_allowed_root(parent)
}

/// Product images directly inside `dir`, sorted by path.
fn list_floor_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut floors = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| FLOOR_IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            floors.push(path);
        }
    }
    floors.sort();
    Ok(floors)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn output_files(outcome: &FloorOutcome) -> Vec<String> {
    outcome
        .outputs
        .iter()
        .map(|output| output.path.to_string_lossy().to_string())
        .collect()
}

fn print_outcome(outcome: &FloorOutcome) {
    for output in &outcome.outputs {
        println!("Saved {}", output.path.display());
    }
    for note in &outcome.notes {
        println!("  model: {note}");
    }
}
