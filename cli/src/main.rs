use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata_snapshotter::{OverlaySnapshotter, PathMappingIndex, SnapshotterConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata-ctl")]
#[command(about = "Operator tooling for the strata snapshotter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the shared-storage path mapping index
    #[command(subcommand)]
    Mappings(MappingCommands),
    /// Remove snapshot directories that have no metadata entry
    Cleanup {
        /// Snapshotter root directory
        #[arg(long)]
        root: PathBuf,

        /// Snapshot homes live under the short root two levels up
        #[arg(long)]
        short_paths: bool,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// List every record in the index
    List {
        /// Shared storage base holding .path-mappings.json
        #[arg(long)]
        base: PathBuf,
    },
    /// Look up the identity behind a hash pair
    Lookup {
        /// Shared storage base holding .path-mappings.json
        #[arg(long)]
        base: PathBuf,

        pod_hash: String,
        snapshot_hash: String,
    },
    /// Drop records not accessed within a maximum age
    SweepStale {
        /// Shared storage base holding .path-mappings.json
        #[arg(long)]
        base: PathBuf,

        /// Maximum age in days
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,
    },
    /// Drop records whose backing directory is gone
    SweepOrphans {
        /// Shared storage base holding .path-mappings.json
        #[arg(long)]
        base: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Mappings(command) => handle_mappings(command).await?,
        Commands::Cleanup { root, short_paths } => {
            let config = SnapshotterConfig {
                short_paths,
                ..Default::default()
            };
            let snapshotter = OverlaySnapshotter::new(&root, config).await?;
            tracing::info!("running cleanup pass under {:?}", snapshotter.root());
            snapshotter.cleanup().await?;
        }
    }

    Ok(())
}

async fn handle_mappings(command: MappingCommands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        MappingCommands::List { base } => {
            let index = PathMappingIndex::new();
            index.load(&base).await?;

            let mut mappings = index.all().await;
            mappings.sort_by(|a, b| {
                match (a.snapshot_id.parse::<u64>(), b.snapshot_id.parse::<u64>()) {
                    (Ok(x), Ok(y)) => y.cmp(&x),
                    _ => b.snapshot_id.cmp(&a.snapshot_id),
                }
            });

            for mapping in mappings {
                println!(
                    "{}/{}  {}/{}/{}  snapshot {}  last accessed {}",
                    mapping.pod_hash,
                    mapping.snapshot_hash,
                    mapping.namespace,
                    mapping.pod_name,
                    mapping.container_name,
                    mapping.snapshot_id,
                    mapping.last_accessed.to_rfc3339()
                );
            }
        }
        MappingCommands::Lookup {
            base,
            pod_hash,
            snapshot_hash,
        } => {
            let index = PathMappingIndex::new();
            index.load(&base).await?;

            match index.lookup(&pod_hash, &snapshot_hash).await {
                Some(mapping) => {
                    println!("namespace:      {}", mapping.namespace);
                    println!("pod:            {}", mapping.pod_name);
                    println!("container:      {}", mapping.container_name);
                    println!("snapshot id:    {}", mapping.snapshot_id);
                    println!("created:        {}", mapping.created_at.to_rfc3339());
                    println!("last accessed:  {}", mapping.last_accessed.to_rfc3339());
                }
                None => {
                    eprintln!("no mapping for {}/{}", pod_hash, snapshot_hash);
                    std::process::exit(1);
                }
            }
        }
        MappingCommands::SweepStale { base, max_age_days } => {
            let index = PathMappingIndex::new();
            index.load(&base).await?;
            let dropped = index
                .cleanup_stale(&base, Duration::days(max_age_days))
                .await?;
            println!("dropped {} stale mapping(s)", dropped);
        }
        MappingCommands::SweepOrphans { base } => {
            let index = PathMappingIndex::new();
            index.load(&base).await?;
            let dropped = index.cleanup_orphans(&base).await?;
            println!("dropped {} orphaned mapping(s)", dropped);
        }
    }

    Ok(())
}
