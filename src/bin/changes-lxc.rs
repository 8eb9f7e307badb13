//! changes-lxc - LXC wrapper for Changes job steps
//!
//! Runs CI builds in throwaway LXC containers and maintains the local
//! snapshot cache.
//!
//! ## Usage
//!
//! ```sh
//! changes-lxc run --api-url <url> --jobstep-id <id>
//! changes-lxc run --snapshot <uuid> -- make test
//! changes-lxc launch [name] [--snapshot <uuid>]
//! changes-lxc exec [--user <user>] <name> -- <cmd>...
//! changes-lxc exec-script [--user <user>] <name> <path>
//! changes-lxc destroy <name>
//! changes-lxc cache cleanup [--max-disk <bytes>] [--ttl <secs>] [--dry-run]
//! changes-lxc cache list
//! ```
//!
//! The process exit code mirrors the build: 0 on success, the command's
//! exit code (or 1) on failure.

use anyhow::{Context, bail};
use changes_lxc::constants::{
    API_URL_ENV, DEFAULT_RELEASE, DEFAULT_USER, S3_BUCKET_ENV, SNAPSHOT_CACHE_ROOT,
};
use changes_lxc::{
    ChangesClient, Container, ContainerSpec, EvictionPolicy, JobOptions, JobService,
    LaunchOptions, ObjectStore, Orchestrator, OutputSink, S3SyncStore, SnapshotCache, StdoutSink,
    runtimes,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "changes-lxc", version, about = "LXC wrapper for running Changes jobs")]
struct Cli {
    /// Log filter (error, warn, info, debug, trace); RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a job in a fresh container
    Run(RunArgs),
    /// Launch a new container and leave it running
    Launch(LaunchArgs),
    /// Execute a command within a container
    Exec {
        /// User to run the command as
        #[arg(short, long, default_value = DEFAULT_USER)]
        user: String,
        /// Container name
        name: String,
        /// Command to run inside the container
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Execute a local script within a container
    ExecScript {
        /// User to run the script as
        #[arg(short, long, default_value = DEFAULT_USER)]
        user: String,
        /// Container name
        name: String,
        /// Local script to copy in and run
        path: PathBuf,
    },
    /// Destroy a container
    Destroy {
        /// Container name
        name: String,
    },
    /// Inspect or bound the snapshot cache
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct ImageArgs {
    /// Snapshot ID of the container
    #[arg(short, long)]
    snapshot: Option<Uuid>,

    /// Ubuntu release
    #[arg(short, long)]
    release: Option<String>,

    /// Don't validate downloaded images
    #[arg(long)]
    no_validate: bool,

    /// Use a fresh container from the Ubuntu minimal install
    #[arg(long)]
    clean: bool,

    /// Rebuild the Ubuntu minimal install cache
    #[arg(long)]
    flush_cache: bool,

    /// S3 bucket to store/fetch images from
    #[arg(long, env = S3_BUCKET_ENV)]
    s3_bucket: Option<String>,

    /// Host command to run before the container is started
    #[arg(long)]
    pre_launch: Option<String>,

    /// Local script to run inside the container after it started
    #[arg(long)]
    post_launch: Option<PathBuf>,

    /// Snapshot cache root
    #[arg(long, default_value = SNAPSHOT_CACHE_ROOT)]
    cache_path: PathBuf,
}

impl ImageArgs {
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            validate: !self.no_validate,
            clean: self.clean,
            flush_cache: self.flush_cache,
            pre_launch: self.pre_launch.clone(),
            post_launch: self.post_launch.clone(),
        }
    }

    fn store(&self) -> Option<Arc<dyn ObjectStore>> {
        self.s3_bucket
            .as_ref()
            .map(|bucket| Arc::new(S3SyncStore::new(bucket.as_str())) as Arc<dyn ObjectStore>)
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Don't destroy the container after the build
    #[arg(long)]
    keep: bool,

    /// Create an image from this container
    #[arg(long)]
    save_snapshot: bool,

    /// API URL of Changes (e.g. https://changes.example.com/api/0/)
    #[arg(long, env = API_URL_ENV)]
    api_url: Option<String>,

    /// Job step ID in Changes
    #[arg(long, requires = "api_url")]
    jobstep_id: Option<String>,

    /// User to run the command (or script) as
    #[arg(short, long, default_value = DEFAULT_USER)]
    user: String,

    /// Local script to execute instead of a command
    #[arg(long, conflicts_with = "cmd")]
    script: Option<PathBuf>,

    /// Command to run inside the container
    #[arg(last = true)]
    cmd: Vec<String>,
}

#[derive(Debug, Args)]
struct LaunchArgs {
    /// Container name (random when omitted)
    name: Option<String>,

    #[command(flatten)]
    image: ImageArgs,
}

#[derive(Debug, Args)]
struct CacheArgs {
    /// Snapshot cache root
    #[arg(long, default_value = SNAPSHOT_CACHE_ROOT)]
    cache_path: PathBuf,

    /// API URL of Changes, for snapshot metadata
    #[arg(long, env = API_URL_ENV)]
    api_url: String,

    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Evict snapshots until the cache is within bounds
    Cleanup {
        /// Overall size limit, in bytes
        #[arg(long)]
        max_disk: Option<u64>,
        /// Size limit per project, in bytes
        #[arg(long)]
        max_disk_per_class: Option<u64>,
        /// Maximum snapshot age, in seconds
        #[arg(long)]
        ttl: Option<i64>,
        /// Report decisions without removing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List cached snapshots
    List,
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let mut orchestrator = Orchestrator::new(runtimes::default_runtime())
        .with_store(args.image.store())
        .with_cache_root(args.image.cache_path.clone());

    if let Some(ref url) = args.api_url {
        let client = ChangesClient::new(url).context("invalid --api-url")?;
        orchestrator = orchestrator.with_service(Arc::new(client), url.as_str());
    }

    let opts = JobOptions {
        snapshot: args.image.snapshot.map(|s| s.to_string()),
        release: args.image.release.clone(),
        clean: args.image.clean,
        save_snapshot: args.save_snapshot,
        keep: args.keep,
        launch: args.image.launch_options(),
        command: args.cmd.clone(),
        script: args.script.clone(),
        user: args.user.clone(),
    };

    let outcome = match args.jobstep_id {
        Some(ref id) => orchestrator.run_remote(id, &opts).await,
        None => orchestrator.run_local(&opts).await,
    }
    .context("job aborted")?;

    Ok(outcome.exit_code())
}

async fn cmd_launch(args: LaunchArgs) -> anyhow::Result<i32> {
    let name = args.name.unwrap_or_else(|| Uuid::new_v4().to_string());
    let spec = ContainerSpec::new(
        name.as_str(),
        args.image.release.as_deref().unwrap_or(DEFAULT_RELEASE),
    )
    .with_snapshot(args.image.snapshot.map(|s| s.to_string()))
    .with_cache_root(args.image.cache_path.clone());

    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let container = Container::new(
        spec,
        runtimes::default_runtime(),
        args.image.store(),
        Arc::clone(&sink),
    )?;
    container.launch(&args.image.launch_options()).await?;
    sink.status(&format!("Instance successfully launched as {}", name));
    Ok(0)
}

async fn attach(name: &str) -> anyhow::Result<Container> {
    let spec = ContainerSpec::new(name, DEFAULT_RELEASE);
    let container = Container::attach(
        spec,
        runtimes::default_runtime(),
        None,
        Arc::new(StdoutSink),
    )
    .await?;
    Ok(container)
}

async fn cmd_exec(name: &str, user: &str, cmd: &[String]) -> anyhow::Result<i32> {
    let container = attach(name).await?;
    Ok(container.run(cmd, user).await?)
}

async fn cmd_exec_script(name: &str, user: &str, path: &std::path::Path) -> anyhow::Result<i32> {
    let container = attach(name).await?;
    match container.run_script(path, user).await {
        Ok(()) => Ok(0),
        Err(changes_lxc::Error::ExecutionFailed { exit_code, .. }) => Ok(exit_code),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_destroy(name: &str) -> anyhow::Result<i32> {
    attach(name).await?.destroy().await?;
    Ok(0)
}

async fn cmd_cache(args: CacheArgs) -> anyhow::Result<i32> {
    let service: Arc<dyn JobService> =
        Arc::new(ChangesClient::new(&args.api_url).context("invalid --api-url")?);
    let mut cache = SnapshotCache::new(&args.cache_path, service);
    cache
        .initialize()
        .await
        .with_context(|| format!("failed to load cache at {}", args.cache_path.display()))?;

    match args.command {
        CacheCommand::List => {
            for s in cache.snapshots() {
                println!(
                    "{}  {:>12}  project={}  created={}  active={}  valid={}",
                    s.id,
                    s.size,
                    s.project.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    s.date_created
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".into()),
                    s.is_active,
                    s.is_valid,
                );
            }
            println!(
                "==> {} items in cache ({} bytes)",
                cache.snapshots().len(),
                cache.total_size()
            );
        }
        CacheCommand::Cleanup {
            max_disk,
            max_disk_per_class,
            ttl,
            dry_run,
        } => {
            if ttl.is_some_and(|t| t < 0) {
                bail!("--ttl must not be negative");
            }
            let policy = EvictionPolicy {
                max_disk,
                max_disk_per_class,
                ttl: ttl.map(chrono::Duration::seconds),
                dry_run,
            };
            let report = cache.cleanup(&policy, chrono::Utc::now().naive_utc())?;
            for eviction in &report.evicted {
                println!(
                    "==> {}snapshot {} ({} bytes, {})",
                    if dry_run { "Would remove " } else { "Removed " },
                    eviction.id,
                    eviction.size,
                    eviction.reason
                );
            }
            println!(
                "==> Freed {} bytes, {} bytes remain",
                report.freed_bytes(),
                report.remaining_bytes
            );
            if report.over_quota {
                println!("==> Cache is still over quota: only active snapshots remain");
            }
        }
    }
    Ok(0)
}

// =============================================================================
// Main
// =============================================================================

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Maps a build exit code onto a process status. Codes outside `0..=255`
/// are failures, never success.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Launch(args) => cmd_launch(args).await,
        Command::Exec { user, name, cmd } => cmd_exec(&name, &user, &cmd).await,
        Command::ExecScript { user, name, path } => cmd_exec_script(&name, &user, &path).await,
        Command::Destroy { name } => cmd_destroy(&name).await,
        Command::Cache(args) => cmd_cache(args).await,
    };

    match result {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mirrors_build() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(255), 255);
    }

    #[test]
    fn test_out_of_range_exit_is_failure() {
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(-9), 1);
        assert_eq!(exit_status(256), 1);
    }
}
