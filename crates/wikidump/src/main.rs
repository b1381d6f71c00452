use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikidump_core::config::{DumpConfig, load_config};
use wikidump_core::extract::{ExtractOptions, ExtractReport, Extractor, PageErrorPolicy, PageOutcome};
use wikidump_core::ledger::{inspect_ledger, normalize_path};
use wikidump_core::normalize::normalize;
use wikidump_core::remote::{ConfluenceClient, ConfluenceClientConfig};
use wikidump_core::retry::{RetryPolicy, ThreadSleeper};
use wikidump_core::runtime::{
    ContentDir, InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_content_dir,
    init_layout, resolve_content_dir, resolve_paths,
};
use wikidump_core::upload::{HttpUploadSink, upload_from_ledger};

#[derive(Debug, Parser)]
#[command(
    name = "wikidump",
    version,
    about = "Extract a Confluence space into local HTML files plus a JSONL metadata ledger",
    after_help = "Runs are incremental: pages whose HTML file already exists are skipped.\nDo not run two extractions against the same content directory at once."
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
    #[arg(short, long, global = true, help = "Only log errors")]
    quiet: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wikidump/ and a commented config file")]
    Init(InitArgs),
    #[command(about = "Extract every current page of a space (or a single page)")]
    Extract(ExtractArgs),
    #[command(about = "Summarize the metadata ledger of a content directory")]
    Status(StatusArgs),
    #[command(about = "Print the normalized HTML of a local storage-format file")]
    Normalize(NormalizeArgs),
    #[command(about = "Upload every ledger artifact to the configured backend")]
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct ContentArgs {
    #[arg(long, value_name = "KEY", help = "Space key (defaults to config / ATLASSIAN_SPACE_KEY)")]
    space: Option<String>,
    #[arg(long, value_name = "PATH", help = "Use this directory instead of {base}-{space}")]
    content_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    #[command(flatten)]
    content: ContentArgs,
    #[arg(long, overrides_with = "no_attachments", help = "Also download page attachments")]
    attachments: bool,
    #[arg(long, overrides_with = "attachments", help = "Skip attachments even if the config enables them")]
    no_attachments: bool,
    #[arg(long, value_name = "N")]
    page_size: Option<usize>,
    #[arg(long, value_name = "N")]
    max_pages: Option<usize>,
    #[arg(long, value_name = "ID", help = "Extract only this page")]
    page_id: Option<String>,
    #[arg(long, help = "Stop at the first page that fails")]
    abort_on_error: bool,
}

impl ExtractArgs {
    fn include_attachments(&self, configured: bool) -> bool {
        if self.attachments {
            true
        } else if self.no_attachments {
            false
        } else {
            configured
        }
    }
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[command(flatten)]
    content: ContentArgs,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    content: ContentArgs,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Extract(args)) => run_extract(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Normalize(NormalizeArgs { file })) => run_normalize(file),
        Some(Commands::Upload(args)) => run_upload(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("error")
        } else {
            match verbose {
                0 => EnvFilter::new("wikidump=info,wikidump_core=info,warn"),
                1 => EnvFilter::new("wikidump=debug,wikidump_core=debug,info"),
                _ => EnvFilter::new("trace"),
            }
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized wikidump runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_extract(runtime: &RuntimeOptions, args: ExtractArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let (space_key, content_dir) = resolve_target(&paths, &config, &args.content)?;
    let created = ensure_content_dir(&content_dir.path)?;

    let client = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config)?)?;
    let base_url = client.base_url().to_string();
    let on_page_error = if args.abort_on_error {
        PageErrorPolicy::Abort
    } else {
        config.on_page_error()
    };
    let include_attachments = args.include_attachments(config.include_attachments());
    let mut extractor = Extractor::new(
        client,
        ThreadSleeper,
        ExtractOptions {
            content_dir: content_dir.path.clone(),
            base_url,
            retry: config.retry_policy()?,
            on_page_error,
        },
    );

    println!("extract");
    println!("space: {space_key}");
    println!(
        "content_dir: {} ({})",
        normalize_path(&content_dir.path),
        content_dir.source.as_str()
    );
    println!("content_dir_created: {created}");
    println!("attachments: {include_attachments}");

    if let Some(page_id) = args.page_id.as_deref() {
        let outcome = extractor.extract_page(page_id.trim(), include_attachments)?;
        println!("page_id: {}", page_id.trim());
        match outcome {
            PageOutcome::Skipped => println!("outcome: skipped (already extracted)"),
            PageOutcome::Extracted {
                attachments_written,
                attachments_skipped,
            } => {
                println!("outcome: extracted");
                println!("attachments_written: {attachments_written}");
                println!("attachments_skipped: {attachments_skipped}");
            }
        }
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    let report = extractor.extract_all(
        &space_key,
        include_attachments,
        args.page_size.unwrap_or_else(|| config.page_size()),
        args.max_pages.unwrap_or_else(|| config.max_pages()),
    )?;
    print_extract_report(&report);
    print_diagnostics(runtime, &paths);

    if !report.success {
        bail!(
            "{} of {} pages failed to extract; rerun to retry them",
            report.failed.len(),
            report.discovered
        );
    }
    Ok(())
}

fn print_extract_report(report: &ExtractReport) {
    println!("pages.discovered: {}", report.discovered);
    println!("pages.extracted: {}", report.extracted);
    println!("pages.skipped: {}", report.skipped);
    println!("pages.failed: {}", report.failed.len());
    println!("attachments.written: {}", report.attachments_written);
    println!("attachments.skipped: {}", report.attachments_skipped);
    println!("requests: {}", report.request_count);
    for failure in &report.failed {
        println!(
            "failed: {} ({}): {}",
            failure.page_id, failure.title, failure.error
        );
    }
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let (space_key, content_dir) = resolve_target(&paths, &config, &args.content)?;
    let status = inspect_ledger(&content_dir.path)?;

    println!("ledger status");
    println!("space: {space_key}");
    println!("content_dir: {}", normalize_path(&content_dir.path));
    println!("ledger_path: {}", status.ledger_path);
    println!("ledger_exists: {}", format_flag(status.ledger_exists));
    println!("records: {}", status.total_records);
    for (content_type, count) in &status.by_content_type {
        println!("records.{content_type}: {count}");
    }
    print_list("missing_files", &status.missing_files);
    print_list("orphan_pages", &status.orphan_pages);
    if !status.orphan_pages.is_empty() {
        println!("hint: delete orphan page files to have the next run extract them again");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_normalize(file: PathBuf) -> Result<()> {
    let raw = fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    println!("{}", normalize(&raw));
    Ok(())
}

fn run_upload(runtime: &RuntimeOptions, args: UploadArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let (space_key, content_dir) = resolve_target(&paths, &config, &args.content)?;
    let mut sink = HttpUploadSink::new(&config.upload_target()?)?;

    let report = upload_from_ledger(
        &content_dir.path,
        &mut sink,
        &RetryPolicy::upload_default(),
        &mut ThreadSleeper,
    )?;

    println!("upload");
    println!("space: {space_key}");
    println!("content_dir: {}", normalize_path(&content_dir.path));
    println!("files.total: {}", report.total);
    println!("files.uploaded: {}", report.uploaded);
    println!("files.failed: {}", report.failed.len());
    for failure in &report.failed {
        println!("failed: {}: {}", failure.file_path, failure.error);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    resolve_paths(
        &context,
        &PathOverrides {
            project_root: runtime.project_root.clone(),
            config: runtime.config.clone(),
        },
    )
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<DumpConfig> {
    let mut config = load_config(&paths.config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

fn resolve_target(
    paths: &ResolvedPaths,
    config: &DumpConfig,
    args: &ContentArgs,
) -> Result<(String, ContentDir)> {
    let space_key = match args.space.as_deref().map(str::trim) {
        Some(space) if !space.is_empty() => space.to_string(),
        _ => match config.space_key() {
            Some(space) => space,
            None => bail!(
                "no space key given (pass --space, set confluence.space, or ATLASSIAN_SPACE_KEY)"
            ),
        },
    };
    let content_dir =
        resolve_content_dir(paths, config, &space_key, args.content_dir.as_deref())?;
    Ok((space_key, content_dir))
}

fn print_list(label: &str, items: &[String]) {
    println!("{label}: {}", items.len());
    for item in items {
        println!("  - {item}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
