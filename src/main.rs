use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shelfsync::config::Config;
use shelfsync::feed::{build_client, FaviconFetcher};
use shelfsync::storage::{CatalogEntryDraft, Database, DatabaseError, LocalFileHandle};
use shelfsync::sync::{
    merger, ChangeLogMerger, ChangeSignal, LogWatcher, QueryCache, Reconciler, RefreshOutcome,
    RefreshTrigger,
};

/// How often `watch` offers an automatic refresh to the reconciler
const AUTO_REFRESH_CHECK: Duration = Duration::from_secs(60);

/// Get the config directory path (~/.config/shelfsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("shelfsync"))
}

#[derive(Parser, Debug)]
#[command(name = "shelfsync", about = "Offline library catalog synchronization")]
struct Args {
    /// Config file (default: ~/.config/shelfsync/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Catalog database (default: ~/.config/shelfsync/catalog.db)
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    /// Change log cursor of this process (default: <consumer_name>.<command>)
    #[arg(long, value_name = "NAME", global = true)]
    consumer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the catalog with the remote feed
    Refresh {
        /// Behave like a background trigger (respects auto_refresh and staleness)
        #[arg(long)]
        auto: bool,
    },
    /// Apply pending change log records to this process's cache
    Merge,
    /// Stay running: merge changes from other processes and refresh when stale
    Watch,
    /// Delete change log records older than the retention window
    Prune,
    /// Print the catalog
    List {
        /// Only entries backed by a local file
        #[arg(long)]
        local: bool,
    },
    /// Record a content file on this device
    OpenLocal {
        /// Entry identifier
        id: String,
        /// Path of the content file
        file: PathBuf,
        /// Display name when the entry is not in the catalog yet
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget the local file of an entry
    Unlink { id: String },
    /// Download icons for entries that have none
    Favicons {
        #[arg(long, default_value_t = 200)]
        limit: i64,
    },
}

impl Command {
    /// Role name; each role keeps its own change log cursor
    fn role(&self) -> &'static str {
        match self {
            Command::Refresh { .. } => "refresh",
            Command::Merge => "merge",
            Command::Watch => "watch",
            Command::Prune => "prune",
            Command::List { .. } => "list",
            Command::OpenLocal { .. } => "open-local",
            Command::Unlink { .. } => "unlink",
            Command::Favicons { .. } => "favicons",
        }
    }
}

/// Components shared by the subcommands
struct Engine {
    config: Config,
    db: Database,
    client: reqwest::Client,
    signal: ChangeSignal,
    merger: Arc<ChangeLogMerger>,
}

impl Engine {
    async fn reconciler(&self) -> Result<Reconciler> {
        Reconciler::new(
            self.db.clone(),
            self.client.clone(),
            self.config.parsed_feed_url()?,
            self.config.request_timeout(),
            self.config.refresh_policy(),
            self.signal.clone(),
        )
        .await
        .context("Failed to read refresh state")
    }

    fn favicons(&self) -> FaviconFetcher {
        FaviconFetcher::new(
            self.db.clone(),
            self.client.clone(),
            self.signal.clone(),
            self.config.favicon_concurrency,
            self.config.request_timeout(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access to the catalog and its config
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config_dir.join("catalog.db"));
    let db = open_database(&db_path).await?;

    let client = build_client(config.request_timeout()).context("Failed to build HTTP client")?;
    let signal = ChangeSignal::new();
    let cache = Arc::new(QueryCache::new(config.cache_capacity));
    let consumer = args
        .consumer
        .clone()
        .unwrap_or_else(|| config.consumer_for(args.command.role()));
    let merger = Arc::new(ChangeLogMerger::new(
        db.clone(),
        consumer,
        cache,
        signal.clone(),
    ));

    let engine = Engine {
        config,
        db,
        client,
        signal,
        merger,
    };

    match args.command {
        Command::Refresh { auto } => refresh(&engine, auto).await,
        Command::Merge => {
            let report = engine.merger.merge().await.context("Merge failed")?;
            println!(
                "Applied {} change(s); cursor at {}",
                report.applied,
                report
                    .token
                    .map_or_else(|| "start".to_string(), |t| t.position().to_string())
            );
            Ok(())
        }
        Command::Watch => watch(&engine).await,
        Command::Prune => {
            let pruned = merger::prune_once(&engine.db, engine.config.change_log_retention())
                .await
                .context("Pruning failed")?;
            println!("Pruned {} change log record(s)", pruned);
            Ok(())
        }
        Command::List { local } => list(&engine, local).await,
        Command::OpenLocal { id, file, name } => open_local(&engine, &id, &file, name).await,
        Command::Unlink { id } => {
            if engine.db.unlink_local_entry(&id).await? {
                println!("{} is no longer local", id);
            } else {
                println!("{} has no local file", id);
            }
            Ok(())
        }
        Command::Favicons { limit } => {
            let handles = engine.favicons().fetch_missing(limit).await?;
            let started = handles.len();
            futures::future::join_all(handles).await;
            println!("Attempted {} favicon download(s)", started);
            Ok(())
        }
    }
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: the catalog database is locked by another process. Please try again."
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn refresh(engine: &Engine, auto: bool) -> Result<()> {
    let trigger = if auto {
        RefreshTrigger::Automatic
    } else {
        RefreshTrigger::UserInitiated
    };
    let reconciler = engine.reconciler().await?;

    match reconciler.refresh(trigger).await? {
        RefreshOutcome::Completed(report) => {
            println!(
                "Catalog refreshed: {} added, {} removed, {} in feed, {} malformed",
                report.inserted, report.deleted, report.remote_total, report.skipped
            );
            // Fetch icons for the new entries before exiting
            let handles = engine.favicons().fetch_missing(i64::MAX).await?;
            futures::future::join_all(handles).await;
        }
        RefreshOutcome::AlreadyInProgress => println!("A refresh is already running"),
        RefreshOutcome::NotDue => println!("Catalog is up to date"),
    }
    engine.merger.merge().await.context("Merge failed")?;
    Ok(())
}

async fn watch(engine: &Engine) -> Result<()> {
    let reconciler = engine.reconciler().await?;
    let favicons = engine.favicons();

    let mut events = engine.merger.subscribe();
    let worker = engine.merger.spawn_worker();
    let watcher = LogWatcher::spawn(
        engine.db.clone(),
        engine.signal.clone(),
        engine.config.watch_poll_interval(),
    );
    let pruner = ChangeLogMerger::spawn_pruner(
        engine.db.clone(),
        engine.config.change_log_retention(),
        engine.config.prune_interval(),
    );

    let mut auto_refresh = tokio::time::interval(AUTO_REFRESH_CHECK);
    tracing::info!(consumer = %engine.merger.consumer(), "Watching catalog");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = auto_refresh.tick() => {
                match reconciler.refresh(RefreshTrigger::Automatic).await {
                    Ok(RefreshOutcome::Completed(_)) => {
                        if let Err(e) = favicons.fetch_missing(i64::MAX).await {
                            tracing::warn!(error = %e, "Failed to list entries missing favicons");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("Refresh failed: {}", e),
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!("{:>8} {:?} {}", event.position, event.kind, event.entry_id),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event display fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    worker.abort();
    watcher.abort();
    pruner.abort();
    Ok(())
}

async fn list(engine: &Engine, local_only: bool) -> Result<()> {
    let entries = engine
        .db
        .list_entries()
        .await
        .context("Failed to read catalog")?;

    for entry in entries.iter().filter(|e| !local_only || e.is_local()) {
        println!(
            "{}  {:<40} {:<8} {:<12} {:>10} {}",
            entry.id,
            entry.name,
            entry.language_code,
            entry.category,
            entry.size_bytes,
            if entry.is_local() { "local" } else { "" }
        );
    }
    Ok(())
}

async fn open_local(engine: &Engine, id: &str, file: &Path, name: Option<String>) -> Result<()> {
    let canonical = file
        .canonicalize()
        .with_context(|| format!("Cannot access '{}'", file.display()))?;
    let size_bytes = std::fs::metadata(&canonical)
        .map(|m| i64::try_from(m.len()).unwrap_or(i64::MAX))
        .unwrap_or(0);

    let draft = match engine.db.get_entry(id).await? {
        Some(existing) => existing.to_draft(),
        None => CatalogEntryDraft {
            id: id.to_lowercase(),
            name: name.unwrap_or_else(|| {
                canonical
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| id.to_string())
            }),
            description: String::new(),
            language_code: String::new(),
            category: "other".to_string(),
            flavor: String::new(),
            group_id: None,
            size_bytes,
            article_count: 0,
            media_count: 0,
            created_at: chrono::Utc::now().timestamp(),
            favicon_url: None,
            download_url: None,
            has_details: false,
            has_pictures: false,
            has_videos: false,
            requires_service_workers: false,
        },
    };

    let handle = LocalFileHandle(canonical.to_string_lossy().into_owned().into_bytes());
    engine
        .db
        .add_local_entry(&draft, &handle)
        .await
        .context("Failed to record local entry")?;
    engine.signal.notify();
    println!("{} is now local ({})", draft.id, canonical.display());
    Ok(())
}
