use bakehouse::bake::{BakeEvent, Baker};
use bakehouse::config::{self, BakehouseConfig};
use bakehouse::deploy::{DeployPipeline, DrainLock, DrainOutcome, Drainer, direct_request};
use bakehouse::publish::GitPublisher;
use bakehouse::queue::{DeployQueue, QueueEntry};
use bakehouse::render::CommandRenderer;
use bakehouse::source::DirectorySource;
use bakehouse::types::ArtifactKind;
use bakehouse::watch::{QueueWatcher, WatchOptions};
use bakehouse::{output, telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;
type SiteBaker = Baker<DirectorySource, CommandRenderer>;
type SitePipeline = DeployPipeline<DirectorySource, CommandRenderer, GitPublisher>;

fn version_string() -> &'static str {
    let on_tag = env!("BAKEHOUSE_ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("BAKEHOUSE_GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "bakehouse")]
#[command(about = "Incremental static-site baker with a crash-safe deploy queue")]
#[command(long_about = "\
Incremental static-site baker with a crash-safe deploy queue

Content records are JSON files; an external renderer turns each into HTML,
chart exports or data files. Baking only re-renders records whose version
changed and deletes pages whose record is gone.

Content structure:

  content/
  ├── posts/hello-world.json       # {\"version\": 3, \"payload\": {...}}
  ├── charts/life-expectancy.json  # payload.dimensions[].variableId → data file
  ├── pages/index.json             # special pages, always re-rendered
  ├── redirects/_redirects.json
  ├── feeds/atom.xml.json
  └── sitemaps/sitemap.xml.json

Deploy flow:

  bakehouse enqueue -m \"Fix typo\"   # append a request to the queue file
  bakehouse watch                   # debounce, then bake + commit + push

Run 'bakehouse gen-config' to generate a documented bakehouse.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file (missing file means stock defaults)
    #[arg(long, default_value = "bakehouse.toml", env = "BAKEHOUSE_CONFIG", global = true)]
    config: PathBuf,

    /// Content directory [config: paths.content_dir]
    #[arg(long, env = "BAKEHOUSE_CONTENT_DIR", global = true)]
    content_dir: Option<PathBuf>,

    /// Output directory [config: paths.baked_dir]
    #[arg(long, env = "BAKEHOUSE_BAKED_DIR", global = true)]
    baked_dir: Option<PathBuf>,

    /// Deploy queue file [config: paths.queue_file]
    #[arg(long, env = "BAKEHOUSE_QUEUE_FILE", global = true)]
    queue_file: Option<PathBuf>,

    /// Pending marker file [config: paths.pending_file]
    #[arg(long, env = "BAKEHOUSE_PENDING_FILE", global = true)]
    pending_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Commit message and optional co-author of a deploy request.
#[derive(clap::Args, Clone)]
struct EntryArgs {
    /// Line for the commit message body
    #[arg(long, short)]
    message: Option<String>,
    #[arg(long)]
    author_name: Option<String>,
    #[arg(long, requires = "author_name")]
    author_email: Option<String>,
}

impl EntryArgs {
    fn into_entry(self) -> QueueEntry {
        QueueEntry {
            author_name: self.author_name,
            author_email: self.author_email,
            message: self.message,
        }
    }
}

#[derive(clap::Args, Clone)]
struct BakeArgs {
    /// Disable the artifact cache — re-render every record
    #[arg(long)]
    no_cache: bool,
    /// Bake a single record, as kind:id (e.g. chart:life-expectancy)
    #[arg(long, value_name = "KIND:ID")]
    only: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Bake the site into the output directory
    Bake(BakeArgs),
    /// Bake and publish now, bypassing the queue
    Deploy(EntryArgs),
    /// Append a deploy request to the queue
    Enqueue(EntryArgs),
    /// Deploy everything queued, once
    Drain,
    /// Watch the queue and deploy after each quiet period
    Watch,
    /// Show queued and pending deploy requests
    Status,
    /// Print a stock bakehouse.toml with all options documented
    GenConfig,
}

fn main() -> CliResult<ExitCode> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load(&cli)?;
    telemetry::init(&config.logging)?;

    match cli.command {
        Command::Bake(args) => bake(&config, args),
        Command::Deploy(args) => {
            let request = direct_request(&args.into_entry());
            println!("==> Baking {}", config.paths.baked_dir.display());
            let report = pipeline(&config).bake_and_publish(&request)?;
            output::print_bake_report(&report);
            println!("==> Published to {} {}", config.deploy.remote, config.deploy.branch);
            Ok(exit_code(report.is_success()))
        }
        Command::Enqueue(args) => {
            queue(&config).enqueue(&args.into_entry())?;
            println!("Queued deploy request");
            Ok(ExitCode::SUCCESS)
        }
        Command::Drain => {
            let Some(_lock) = DrainLock::try_acquire(&drain_lock_path(&config))? else {
                output::print_drain_outcome(&DrainOutcome::AlreadyRunning);
                return Ok(ExitCode::SUCCESS);
            };
            let outcome = Drainer::new(queue(&config), pipeline(&config)).trigger()?;
            output::print_drain_outcome(&outcome);
            Ok(exit_code(!matches!(outcome, DrainOutcome::GaveUp { .. })))
        }
        Command::Watch => watch(&config),
        Command::Status => {
            output::print_queue_status(&queue(&config).status()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::GenConfig => Ok(ExitCode::SUCCESS),
    }
}

/// Config file, then command-line and environment path overrides.
fn load(cli: &Cli) -> CliResult<BakehouseConfig> {
    let mut config = config::load_config(&cli.config)?;
    let paths = &mut config.paths;
    for (value, target) in [
        (&cli.content_dir, &mut paths.content_dir),
        (&cli.baked_dir, &mut paths.baked_dir),
        (&cli.queue_file, &mut paths.queue_file),
        (&cli.pending_file, &mut paths.pending_file),
    ] {
        if let Some(v) = value {
            *target = v.clone();
        }
    }
    config.validate()?;
    Ok(config)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn baker(config: &BakehouseConfig) -> SiteBaker {
    Baker::new(
        DirectorySource::new(&config.paths.content_dir),
        CommandRenderer::new(config.renderer.command.clone(), config.renderer.timeout()),
        &config.paths.baked_dir,
    )
    .with_max_workers(config::effective_workers(&config.baking))
}

fn pipeline(config: &BakehouseConfig) -> SitePipeline {
    let publisher = GitPublisher::new(
        config.deploy.remote.as_str(),
        config.deploy.branch.as_str(),
        config.deploy.publish_timeout(),
    )
    .with_upload_command(config.deploy.netlify_command.clone())
    .with_committer(config.deploy.committer());
    DeployPipeline::new(baker(config), publisher)
}

fn queue(config: &BakehouseConfig) -> DeployQueue {
    DeployQueue::new(&config.paths.queue_file, &config.paths.pending_file)
}

fn drain_lock_path(config: &BakehouseConfig) -> PathBuf {
    let mut name = config
        .paths
        .queue_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| ".queue".into());
    name.push(".drain");
    config.paths.queue_file.with_file_name(name)
}

fn bake(config: &BakehouseConfig, args: BakeArgs) -> CliResult<ExitCode> {
    let target = args.only.as_deref().map(parse_target).transpose()?;

    let (tx, rx) = mpsc::channel::<BakeEvent>();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_bake_event(&event) {
                println!("{}", line);
            }
        }
    });

    let mut site = baker(config).with_force(args.no_cache).with_events(tx);
    println!(
        "==> Baking {} → {}",
        config.paths.content_dir.display(),
        config.paths.baked_dir.display()
    );
    let result = match &target {
        Some((kind, id)) => site.bake_one(*kind, id),
        None => site.bake_all(),
    };
    site.clear_events();
    printer.join().map_err(|_| "output thread panicked")?;

    let report = result?;
    output::print_bake_report(&report);
    Ok(exit_code(report.is_success()))
}

fn watch(config: &BakehouseConfig) -> CliResult<ExitCode> {
    let Some(_lock) = DrainLock::try_acquire(&drain_lock_path(config))? else {
        return Err("another bakehouse process is already draining this queue".into());
    };

    let (tx, rx) = mpsc::channel();
    let options = WatchOptions {
        debounce: config.watch.debounce(),
        poll_interval: config.watch.poll_interval(),
    };
    let watcher =
        QueueWatcher::new(Drainer::new(queue(config), pipeline(config)), options).with_events(tx);
    std::thread::spawn(move || {
        for event in rx {
            for line in output::format_watch_event(&event) {
                println!("{}", line);
            }
        }
    });
    watcher.run()?;
    Ok(ExitCode::SUCCESS)
}

/// `kind:id`, e.g. `chart:life-expectancy`. The id may itself contain `:`.
fn parse_target(spec: &str) -> CliResult<(ArtifactKind, String)> {
    let (kind, id) = spec
        .split_once(':')
        .ok_or_else(|| format!("expected KIND:ID, got '{spec}'"))?;
    if id.is_empty() {
        return Err(format!("missing id in '{spec}'").into());
    }
    Ok((kind.parse()?, id.to_string()))
}
