use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use fivek_dataset::acquire::ProgressSink;
use fivek_dataset::camera::{CameraTable, RawloaderProbe};
use fivek_dataset::config::{ConfigLoader, Settings, parse_experts};
use fivek_dataset::dataset::{Dataset, DatasetOptions};
use fivek_dataset::domain::{AssetSet, Split};
use fivek_dataset::error::FivekError;
use fivek_dataset::index::{IndexBuilder, IndexSources, IndexStore, SourceLocation, check_partition};
use fivek_dataset::output::{
    BuildResult, BuildSplitEntry, CameraTableResult, CategoriesResult, InfoResult, JsonOutput,
    OutputMode, StderrProgress, print_report_summary,
};
use fivek_dataset::remote::HttpRemote;
use fivek_dataset::store::Layout;

#[derive(Parser)]
#[command(name = "fivek")]
#[command(about = "Acquire, index and inspect the MIT-Adobe FiveK dataset")]
#[command(version, author)]
struct Cli {
    /// Path to a fivek.json config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Dataset root, overriding the config.
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    /// Fetch the published split index when it is missing locally.
    #[arg(long, global = true)]
    download: bool,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Identify the camera of every DNG under a directory")]
    CameraTable(CameraTableArgs),
    #[command(about = "Build and persist the split indexes")]
    BuildIndex(BuildIndexArgs),
    #[command(about = "Download the files of a split")]
    Fetch(FetchArgs),
    #[command(about = "Show one item of a split")]
    Info(InfoArgs),
    #[command(about = "List category values of a split")]
    Categories(CategoriesArgs),
}

#[derive(Args)]
struct CameraTableArgs {
    raw_dir: Utf8PathBuf,

    /// Defaults to <root>/camera.csv.
    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct BuildIndexArgs {
    #[arg(long)]
    categories: String,

    #[arg(long)]
    adobe: String,

    #[arg(long)]
    adobe_mit: String,

    #[arg(long)]
    camera_table: String,
}

#[derive(Args)]
struct FetchArgs {
    split: Split,

    /// Comma-separated experts, e.g. `a,c`.
    #[arg(long)]
    experts: Option<String>,

    #[arg(long)]
    no_raw: bool,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    retries: Option<u32>,
}

#[derive(Args)]
struct InfoArgs {
    split: Split,
    index: usize,

    #[arg(long)]
    experts: Option<String>,
}

#[derive(Args)]
struct CategoriesArgs {
    split: Split,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(fivek) = report.downcast_ref::<FivekError>() {
            return ExitCode::from(map_exit_code(fivek));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FivekError) -> u8 {
    match error {
        FivekError::IndexNotFound(_) | FivekError::FileMissing(_) => 2,
        FivekError::Http(_) | FivekError::HttpStatus { .. } => 3,
        FivekError::Acquisition { .. } | FivekError::IncompleteAcquisition { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut settings = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        settings.root = root;
    }
    if cli.download {
        settings.download = true;
    }

    match cli.command {
        Commands::CameraTable(args) => run_camera_table(args, &settings),
        Commands::BuildIndex(args) => run_build_index(args, &settings),
        Commands::Fetch(args) => run_fetch(args, settings, output_mode),
        Commands::Info(args) => run_info(args, settings),
        Commands::Categories(args) => run_categories(args, settings),
    }
}

fn run_camera_table(args: CameraTableArgs, settings: &Settings) -> miette::Result<()> {
    let output = args
        .output
        .unwrap_or_else(|| settings.root.join("camera.csv"));
    let scan = CameraTable::scan(args.raw_dir.as_std_path(), &RawloaderProbe)?;
    let result = CameraTableResult {
        output: output.to_string(),
        visited: scan.visited,
        identified: scan.rows.len(),
        skipped: scan.skipped,
    };
    CameraTable::from_scan(scan).write_csv(&output)?;
    JsonOutput::print_camera_table(&result).into_diagnostic()
}

fn run_build_index(args: BuildIndexArgs, settings: &Settings) -> miette::Result<()> {
    let sources = IndexSources {
        categories: args.categories.parse::<SourceLocation>()?,
        adobe_list: args.adobe.parse::<SourceLocation>()?,
        adobe_mit_list: args.adobe_mit.parse::<SourceLocation>()?,
        camera_table: args.camera_table.parse::<SourceLocation>()?,
    };
    let remote = HttpRemote::new(settings.timeout)?;
    let inputs = sources.load(&remote)?;

    let store = IndexStore::new(Layout::new_with_root(settings.root.clone()));
    let previous = store.load_assignments()?;
    let builder = IndexBuilder::new(settings.archive_base_url.clone(), settings.ratios)?;
    let built = builder.build(&inputs, &previous)?;
    check_partition(&built.splits().collect::<Vec<_>>())?;
    store.save_all(&built)?;

    let result = BuildResult {
        root: settings.root.to_string(),
        splits: built
            .splits()
            .map(|index| BuildSplitEntry {
                split: index.split(),
                items: index.len(),
                path: store.layout().index_path(index.split()).to_string(),
            })
            .collect(),
    };
    JsonOutput::print_build(&result).into_diagnostic()
}

fn run_fetch(args: FetchArgs, settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let experts = match args.experts.as_deref() {
        Some(value) => parse_experts(value)?,
        None => settings.experts.clone(),
    };
    let mut options = DatasetOptions::from_settings(&settings, args.split);
    options.assets = AssetSet::new(!args.no_raw, &experts);
    options.download = true;
    if let Some(workers) = args.workers {
        options.acquisition.pool_size = workers.max(1);
    }
    if let Some(retries) = args.retries {
        options.acquisition.retries = retries;
    }

    let dataset = Dataset::open(options, HttpRemote::new(settings.timeout)?)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &StderrProgress,
        OutputMode::NonInteractive => &JsonOutput,
    };
    let report = dataset.prefetch(sink)?;
    match output_mode {
        OutputMode::Interactive => print_report_summary(&report),
        OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic()?,
    }
    if report.is_complete() {
        return Ok(());
    }
    Err(FivekError::IncompleteAcquisition {
        target: format!("the {} split", args.split),
        failed: report.failed.len(),
        items: report.failed_ids().len(),
    }
    .into())
}

fn run_info(args: InfoArgs, settings: Settings) -> miette::Result<()> {
    let experts = match args.experts.as_deref() {
        Some(value) => parse_experts(value)?,
        None => settings.experts.clone(),
    };
    let mut options = DatasetOptions::from_settings(&settings, args.split);
    options.assets = AssetSet::new(true, &experts);
    let dataset = Dataset::open(options, HttpRemote::new(settings.timeout)?)?;
    let record = dataset.record(args.index)?;
    let requirement = dataset.resolve(args.index)?;
    let result = InfoResult::new(args.split, args.index, record, &requirement);
    JsonOutput::print_info(&result).into_diagnostic()
}

fn run_categories(args: CategoriesArgs, settings: Settings) -> miette::Result<()> {
    let options = DatasetOptions::from_settings(&settings, args.split);
    let dataset = Dataset::open(options, HttpRemote::new(settings.timeout)?)?;
    let result = CategoriesResult {
        split: args.split,
        categories: dataset.all_categories(),
    };
    JsonOutput::print_categories(&result).into_diagnostic()
}
