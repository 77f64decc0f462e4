use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use plurkive_core::archive::BackupLayout;
use plurkive_core::config::{ArchiveConfig, load_config, patch_backup_path};
use plurkive_core::fts::rebuild_indexes;
use plurkive_core::import::{FileFailure, run_import};
use plurkive_core::links::{extract_links, link_status_counts, parse_month_arg};
use plurkive_core::preview::{FetchReport, FetchSelection, HttpPreviewFetcher, fetch_previews};
use plurkive_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use plurkive_core::scan::ScanRange;
use plurkive_core::search::{SearchDb, SearchHit, SearchMode, SearchScope};
use plurkive_core::server::serve;
use plurkive_core::store::{ArchiveStore, open_existing, resolve_tokenizer};

#[derive(Debug, Parser)]
#[command(
    name = "plurkive",
    version,
    about = "Incremental import, full-text search and link previews for Plurk backups"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout and record the backup location")]
    Init(InitArgs),
    #[command(about = "Import new posts and replies from the backup")]
    Import,
    #[command(about = "Rebuild every full-text index from stored content")]
    Reindex,
    Links(LinksArgs),
    Search(SearchArgs),
    #[command(about = "Show archive counts and runtime status")]
    Stats,
    #[command(about = "Serve the JSON search API")]
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(value_name = "BACKUP_PATH", help = "Root of the unpacked Plurk backup")]
    backup_path: PathBuf,
}

#[derive(Debug, Args)]
struct LinksArgs {
    #[command(subcommand)]
    command: LinksSubcommand,
}

#[derive(Debug, Subcommand)]
enum LinksSubcommand {
    #[command(about = "Collect URLs from posts and replies")]
    Extract(ExtractArgs),
    #[command(about = "Fetch previews for pending links")]
    Fetch(FetchArgs),
    #[command(about = "Show link counts per fetch status")]
    Status,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    #[arg(long, value_name = "YYYYMM", help = "Only scan this month")]
    month: Option<String>,
    #[arg(long, help = "Fetch previews for the extracted links that are still pending")]
    fetch_previews: bool,
    #[command(flatten)]
    fetch: FetchOverrides,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long, default_value_t = 50, help = "Maximum links to fetch (0 = all pending)")]
    limit: usize,
    #[command(flatten)]
    fetch: FetchOverrides,
}

#[derive(Debug, Args)]
struct FetchOverrides {
    #[arg(long, value_name = "MS", help = "Per-request timeout in milliseconds")]
    timeout: Option<u64>,
    #[arg(long, value_name = "N", help = "Attempts per link")]
    retries: Option<u32>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, default_value = "all", help = "all, posts, replies or links")]
    scope: SearchScope,
    #[arg(long, default_value = "fts", help = "fts or like")]
    mode: SearchMode,
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long, help = "Print the raw JSON response")]
    json: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Import) => run_import_command(&runtime),
        Some(Commands::Reindex) => run_reindex(&runtime),
        Some(Commands::Links(LinksArgs { command })) => match command {
            LinksSubcommand::Extract(args) => run_links_extract(&runtime, args),
            LinksSubcommand::Fetch(args) => run_links_fetch(&runtime, args),
            LinksSubcommand::Status => run_links_status(&runtime),
        },
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Stats) => run_stats(&runtime),
        Some(Commands::Serve(args)) => run_serve(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let backup_path = if args.backup_path.is_absolute() {
        args.backup_path
    } else {
        std::env::current_dir()?.join(args.backup_path)
    };
    BackupLayout::new(&backup_path).validate()?;

    let report = init_layout(&paths)?;
    let wrote_config = patch_backup_path(&paths.config_path, &backup_path)?;

    println!("Initialized plurkive runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("backup_path: {}", normalize_for_display(&backup_path));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("lib_dir: {}", normalize_for_display(&paths.lib_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(wrote_config));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import_command(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let layout = backup_layout(&paths, &config)?;
    let mut store = ArchiveStore::open(&paths, &config)?;
    let today = chrono::Local::now().date_naive();
    let report = run_import(&mut store, &layout, today, &config.scan_policy())?;

    println!("import");
    println!("backup_path: {}", normalize_for_display(layout.root()));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("range: {}", report.range.describe());
    println!("post_files: {}", report.post_files);
    println!("reply_files: {}", report.reply_files);
    println!("posts.new: {}", report.posts.new);
    println!("posts.skipped: {}", report.posts.skipped);
    println!("replies.new: {}", report.replies.new);
    println!("replies.skipped: {}", report.replies.skipped);
    println!("total_posts: {}", report.total_posts);
    println!("total_replies: {}", report.total_replies);
    print_failures(&report.failures);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_reindex(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut store = ArchiveStore::open(&paths, &config)?;
    let tokenizer = store.tokenizer().to_string();
    let report = rebuild_indexes(store.connection_mut(), &tokenizer)?;

    println!("reindex");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("tokenizer: {}", report.tokenizer);
    for index in &report.rebuilt {
        println!("{}.rows: {}", index.index, index.rows);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_links_extract(runtime: &RuntimeOptions, args: ExtractArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let range = match args.month.as_deref() {
        Some(month) => parse_month_arg(month)?,
        None => ScanRange::default(),
    };
    let layout = backup_layout(&paths, &config)?;
    let mut store = ArchiveStore::open(&paths, &config)?;
    let report = extract_links(&mut store, &layout, &range)?;

    println!("links extract");
    println!("range: {}", report.range.describe());
    println!("post_files: {}", report.post_files);
    println!("reply_files: {}", report.reply_files);
    println!("unique_urls: {}", report.unique_urls);
    println!("image_urls: {}", report.image_urls);
    println!("page_urls: {}", report.page_urls);
    println!("new_links: {}", report.new_links);
    println!("new_images: {}", report.new_images);
    println!("merged: {}", report.merged);
    print_failures(&report.failures);

    if args.fetch_previews {
        let mut fetcher = HttpPreviewFetcher::new(&fetch_settings(&config, &args.fetch))?;
        let fetched = fetch_previews(&mut store, &mut fetcher, &FetchSelection::Urls(report.urls))?;
        print_fetch_report(&fetched);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_links_fetch(runtime: &RuntimeOptions, args: FetchArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut store = ArchiveStore::open(&paths, &config)?;
    let mut fetcher = HttpPreviewFetcher::new(&fetch_settings(&config, &args.fetch))?;
    let selection = FetchSelection::Pending {
        limit: (args.limit > 0).then_some(args.limit),
    };
    let report = fetch_previews(&mut store, &mut fetcher, &selection)?;

    println!("links fetch");
    print_fetch_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_links_status(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let choice = resolve_tokenizer(
        &config.tokenizer_settings(&paths.project_root),
        &paths.lib_dir,
    );
    let connection = open_existing(&paths.db_path, &choice)?;

    println!("links status");
    match link_status_counts(&connection)? {
        Some(counts) => {
            let total: usize = counts.values().sum();
            println!("links.total: {total}");
            for (status, count) in counts {
                println!("links.{status}: {count}");
            }
        }
        None => println!("links: <not extracted> (run `plurkive links extract`)"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let db = SearchDb::open(&paths, &config)?;
    let response = db.search(&args.query, args.scope, args.mode, args.page)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("search");
    println!("query: {}", args.query.trim());
    println!("total: {}", response.total);
    println!("page: {}/{}", response.page + 1, response.pages);
    if let Some(error) = &response.error {
        println!("error: {error}");
    }
    for hit in &response.results {
        println!("{}", summarize_hit(hit));
    }
    Ok(())
}

fn run_stats(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("stats");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    if status.db_exists {
        let stats = SearchDb::open(&paths, &config)?.get_stats()?;
        println!("posts: {}", stats.post_count);
        println!("replies: {}", stats.reply_count);
        println!("links: {}", stats.link_count);
        println!("links_with_preview: {}", stats.link_with_preview);
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_serve(runtime: &RuntimeOptions, args: ServeArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let db = SearchDb::open(&paths, &config)?;
    print_diagnostics(runtime, &paths);
    serve(&db, args.port)
}

fn summarize_hit(hit: &SearchHit) -> String {
    match hit {
        SearchHit::Post(post) => format!(
            "post {} [{}] {}",
            post.id,
            post.posted.as_deref().unwrap_or("?"),
            one_line(post.content_raw.as_deref())
        ),
        SearchHit::Reply(reply) => format!(
            "reply {} [{}] {}: {}",
            reply.id,
            reply.posted.as_deref().unwrap_or("?"),
            reply.user_nick.as_deref().unwrap_or("?"),
            one_line(reply.content_raw.as_deref())
        ),
        SearchHit::Link(link) => format!(
            "link [{}] {} {}",
            link.status.as_deref().unwrap_or("pending"),
            link.url,
            link.og_title.as_deref().unwrap_or("")
        ),
    }
}

fn one_line(text: Option<&str>) -> String {
    let flat = text.unwrap_or_default().split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 100 {
        format!("{}...", flat.chars().take(100).collect::<String>())
    } else {
        flat
    }
}

fn print_fetch_report(report: &FetchReport) {
    println!("fetch.attempted: {}", report.attempted);
    for (status, count) in &report.by_status {
        println!("fetch.{status}: {count}");
    }
}

fn print_failures(failures: &[FileFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("skipped_files: {}", failures.len());
    for failure in failures {
        println!(
            "  - {}: {}",
            normalize_for_display(&failure.path),
            failure.message
        );
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn fetch_settings(
    config: &ArchiveConfig,
    overrides: &FetchOverrides,
) -> plurkive_core::config::FetchSettings {
    let mut settings = config.fetch_settings();
    if let Some(timeout) = overrides.timeout {
        settings.timeout_ms = timeout;
    }
    if let Some(retries) = overrides.retries {
        settings.retries = retries.max(1);
    }
    settings
}

fn backup_layout(paths: &ResolvedPaths, config: &ArchiveConfig) -> Result<BackupLayout> {
    let Some(backup_path) = config.backup_path(&paths.project_root) else {
        bail!(
            "no backup path configured in {}; run `plurkive init <backup_path>` first",
            normalize_for_display(&paths.config_path)
        );
    };
    Ok(BackupLayout::new(backup_path))
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ArchiveConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    log::debug!(
        "project root {} ({})",
        normalize_for_display(&paths.project_root),
        paths.root_source.as_str()
    );
    Ok(paths)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
