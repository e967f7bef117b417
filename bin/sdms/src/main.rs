//! SDMS operator CLI
//!
//! Every subcommand runs one operation against the metadata store and exits.
//! Scheduling (cron, batch system) happens outside.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdms_cache::{
    CacheCrawler, NodeMonitor, ReconciliationProcessor, TcpProbe, purge_broken_links,
};
use sdms_catalog::ArchiveCrawler;
use sdms_common::{Config, NodeName, StageTarget, TargetClass};
use sdms_meta_store::MetaStore;
use sdms_stager::{CycleState, Stager, StagerTools};
use sdms_tools::{HpssArchive, HpssTapeSorter, SshShell, StatvfsProbe, XrdCopy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "/etc/sdms/sdms.toml";

type SiteStager = Stager<HpssArchive, HpssTapeSorter, XrdCopy, StatvfsProbe>;

#[derive(Parser, Debug)]
#[command(name = "sdms")]
#[command(about = "STAR data management system")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); SDMS_* environment variables override it
    #[arg(short, long, env = "SDMS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Catalog the tape archive
    CrawlArchive {
        /// Root folders below the archive base folder (default: configured)
        #[arg(long = "root")]
        roots: Vec<String>,
    },
    /// Scan the cache namespace of this node
    CrawlCache {
        /// Node name (default: short host name)
        #[arg(long)]
        node: Option<String>,
        /// Target classes (default: configured)
        #[arg(long = "target")]
        targets: Vec<TargetClass>,
    },
    /// Fold crawl observations into the cache catalog
    Process {
        #[arg(long = "target")]
        targets: Vec<TargetClass>,
    },
    /// Probe cache nodes and record their state
    CheckNodes {
        /// Additional nodes to probe
        nodes: Vec<String>,
    },
    /// Delete dangling namespace links found by cache crawls
    PurgeBrokenLinks {
        #[arg(long = "target")]
        targets: Vec<TargetClass>,
    },
    /// Staging cycle operations
    Stage {
        #[command(subcommand)]
        action: StageCommands,
    },
    /// Show the size of every collection
    Inspect,
}

#[derive(Subcommand, Debug)]
enum StageCommands {
    /// Start a cycle from the configured staging request
    Prepare,
    /// Recompute tape order and stage groups of unstaged jobs
    Order,
    /// Retrieve files from the archive into scratch
    Archive {
        /// Stage group (default: every group, concurrently)
        #[arg(long)]
        group: Option<u32>,
    },
    /// Copy retrieved files to the cache
    Deliver {
        #[arg(long, default_value = "XRD")]
        stage_target: StageTarget,
    },
    /// Triage jobs and end the cycle when nothing is left
    End,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = load_config(args.config.as_deref())?;
    let store = MetaStore::open(&config.store.path)
        .with_context(|| format!("opening metadata store {}", config.store.path.display()))?;

    if let Err(e) = run(args.command, &config, store).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Commands, config: &Config, store: MetaStore) -> Result<()> {
    match command {
        Commands::CrawlArchive { roots } => {
            let roots = if roots.is_empty() {
                config.archive.root_folders.clone()
            } else {
                roots
            };
            let crawler =
                ArchiveCrawler::new(store, HpssArchive::new(&config.archive), config.archive.clone());
            let stats = crawler.discover(&roots).await?;
            println!("{stats:#?}");
        }
        Commands::CrawlCache { node, targets } => {
            let node = match node {
                Some(node) => NodeName::from(node.as_str()),
                None => local_node()?,
            };
            let crawler = CacheCrawler::new(store, config.cache.clone(), StatvfsProbe);
            for target in targets_or(&targets, &config.cache.targets) {
                let stats = crawler.scan(&node, target)?;
                println!("{target}: {stats:?}");
            }
        }
        Commands::Process { targets } => {
            let processor = ReconciliationProcessor::new(store, config.store.lock_ttl());
            for target in targets_or(&targets, &config.cache.targets) {
                let new = processor.apply_new(target)?;
                let missing = processor.apply_missing(target)?;
                println!("{target}: {new:?}");
                println!("{target}: {missing:?}");
            }
        }
        Commands::CheckNodes { nodes } => {
            let nodes: Vec<NodeName> = nodes.iter().map(|n| NodeName::from(n.as_str())).collect();
            let monitor = NodeMonitor::new(
                store,
                config.cluster.clone(),
                TcpProbe::from_config(&config.cluster),
            );
            let changes = monitor.refresh(&nodes).await?;
            println!("{changes:#?}");
        }
        Commands::PurgeBrokenLinks { targets } => {
            let shell = SshShell::default();
            for target in targets_or(&targets, &config.cache.targets) {
                let stats = purge_broken_links(&store, &shell, target).await?;
                println!("{target}: {stats:?}");
            }
        }
        Commands::Stage { action } => run_stage(action, config, store).await?,
        Commands::Inspect => {
            for (name, count) in store.collection_counts()? {
                println!("{name:<40} {count:>12}");
            }
        }
    }
    Ok(())
}

async fn run_stage(action: StageCommands, config: &Config, store: MetaStore) -> Result<()> {
    let stager = site_stager(config, store);
    match action {
        StageCommands::Prepare => match stager.prepare_staging().await? {
            Some(report) => println!("{report:#?}"),
            None => println!("A staging cycle is already active"),
        },
        StageCommands::Order => {
            let stats = stager.order_jobs().await?;
            println!("{stats:?}");
        }
        StageCommands::Archive { group: Some(group) } => {
            let stats = stager.stage_from_archive(group).await?;
            println!("group {group}: {stats:?}");
        }
        StageCommands::Archive { group: None } => {
            let stager = Arc::new(stager);
            let mut workers = JoinSet::new();
            for group in 0..config.staging.max_stage_groups {
                let stager = Arc::clone(&stager);
                workers.spawn(async move { (group, stager.stage_from_archive(group).await) });
            }
            while let Some(joined) = workers.join_next().await {
                let (group, result) = joined?;
                match result {
                    Ok(stats) => println!("group {group}: {stats:?}"),
                    Err(e) => error!(group, "Archive retrieval failed: {}", e),
                }
            }
        }
        StageCommands::Deliver { stage_target } => {
            let stats = stager.stage_to_cache(stage_target).await?;
            println!("{stats:?}");
        }
        StageCommands::End => {
            let report = stager.check_end_of_cycle().await?;
            if report.state == CycleState::Ended {
                info!("Staging cycle ended");
            }
            println!("{report:#?}");
        }
    }
    Ok(())
}

fn site_stager(config: &Config, store: MetaStore) -> SiteStager {
    Stager::new(
        store,
        config,
        StagerTools {
            archive: HpssArchive::new(&config.archive),
            sorter: HpssTapeSorter::new(config.staging.tape_sorter.clone()),
            copy: XrdCopy::new(&config.staging.copy, config.staging.copy_process_name.clone()),
            space: StatvfsProbe,
        },
    )
}

/// Layer the config file (explicit, or the default one when present) under
/// `SDMS_*` environment variables; nested keys use `__`
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();
    match path {
        Some(path) => builder = builder.add_source(config::File::from(path)),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            builder = builder.add_source(config::File::with_name(DEFAULT_CONFIG));
        }
        None => {}
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SDMS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config: Config = builder
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("parsing configuration")?;
    config.validate()?;
    Ok(config)
}

fn local_node() -> Result<NodeName> {
    let host = nix::unistd::gethostname().context("reading host name")?;
    let host = host
        .into_string()
        .map_err(|raw| anyhow::anyhow!("host name is not UTF-8: {raw:?}"))?;
    Ok(NodeName::from_fqdn(&host))
}

fn targets_or(requested: &[TargetClass], configured: &[TargetClass]) -> Vec<TargetClass> {
    if requested.is_empty() {
        configured.to_vec()
    } else {
        requested.to_vec()
    }
}
