use std::{
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use docchat::{
    DataDir,
    DocumentDb,
    IndexCacheManager,
    ServiceConfig,
    config::{self, SETTING_KEYS},
    error,
    ingestion::{self, IngestReport},
    mcp,
    retention,
    text_util::{DEFAULT_PREVIEW_MAX_CHARS, preview},
};
use kdam::{Bar, BarExt, tqdm};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCCHAT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let db = Arc::new(DocumentDb::open(&data_dir.documents_db())?);
    let config = ServiceConfig::resolve(&cli.overrides(), &db)?;

    match cli.command {
        Command::Ingest(args) => {
            block_on(cmd_ingest(&data_dir, db, &config, &args))?;
        }
        Command::Search(args) => {
            block_on(cmd_search(&data_dir, db, &config, &args))?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, &db, &config, args.json)?;
        }
        Command::Purge(args) => {
            block_on(cmd_purge(&data_dir, db, &config, &args.user))?;
        }
        Command::Cleanup(args) => {
            block_on(cmd_cleanup(&data_dir, db, &config, args.older_than))?;
        }
        Command::Mcp => {
            mcp::run_mcp(data_dir, db, config)?;
        }
        Command::Config { action } => {
            cmd_config(&db, action)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn block_on<F: Future<Output = error::Result<()>>>(future: F) -> error::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| error::Error::Config(format!("failed to start tokio runtime: {e}")))?
        .block_on(future)
}

/// Flush everything the manager holds, reporting users whose index could
/// not be saved.
async fn shutdown(manager: &IndexCacheManager) {
    for (user, e) in manager.shutdown().await {
        eprintln!("Warning: index for '{user}' was not saved: {e}");
    }
}

/// A manager that never loads the embedding model, for commands that only
/// delete data.
fn maintenance_manager(
    data_dir: &DataDir,
    db: Arc<DocumentDb>,
    config: &ServiceConfig,
) -> error::Result<IndexCacheManager> {
    let config = ServiceConfig {
        vectors: false,
        ..config.clone()
    };
    IndexCacheManager::open(data_dir, &config, db)
}

async fn cmd_ingest(
    data_dir: &DataDir,
    db: Arc<DocumentDb>,
    config: &ServiceConfig,
    args: &cli::IngestArgs,
) -> error::Result<()> {
    let manager = IndexCacheManager::open(data_dir, config, db.clone())?;
    let cancel = AtomicBool::new(false);
    let mut result = Ok(());

    for path in &args.files {
        match ingest_file(&db, &manager, &args.user, path, &cancel).await {
            Ok(report) => print_ingest_report(&report),
            Err(e) => {
                eprintln!("Error: {}: {e}", path.display());
                result = Err(e);
            }
        }
    }

    shutdown(&manager).await;
    result
}

async fn ingest_file(
    db: &DocumentDb,
    manager: &IndexCacheManager,
    user: &str,
    path: &Path,
    cancel: &AtomicBool,
) -> error::Result<IngestReport> {
    let document = ingestion::read_document(path)?;
    let mut bar: Option<Bar> = None;

    let report = ingestion::ingest_document(db, manager, user, &document, cancel, |done, total| {
        let pb = bar.get_or_insert_with(|| tqdm!(total = total, desc = document.filename.clone()));
        if let Err(e) = pb.update_to(done) {
            debug!(error = %e, "progress bar update failed");
        }
    })
    .await?;

    if bar.is_some() {
        eprintln!();
    }
    Ok(report)
}

fn print_ingest_report(report: &IngestReport) {
    println!(
        "Ingested '{}' (document {}): {} chunks",
        report.filename, report.document_id, report.chunks_total
    );
    if report.degraded > 0 {
        println!("  {} chunks embedded in degraded mode", report.degraded);
    }
    if report.recorded > 0 && report.indexed == 0 && report.degraded == 0 {
        println!("  vectors disabled, keyword search only");
    }
    for failure in &report.failures {
        println!("  chunk {} skipped: {}", failure.chunk_index, failure.error);
    }
    if let Some(e) = &report.flush_error {
        println!("  warning: index not saved: {e}");
    }
}

async fn cmd_search(
    data_dir: &DataDir,
    db: Arc<DocumentDb>,
    config: &ServiceConfig,
    args: &cli::SearchArgs,
) -> error::Result<()> {
    let manager = IndexCacheManager::open(data_dir, config, db)?;
    let store = manager.get_store(&args.user).await;
    let hits = store.search_similar(&args.query, args.count).await;

    if args.json {
        let value = serde_json::json!({
            "query": args.query,
            "user": args.user,
            "backend": manager.backend_status(),
            "results": hits,
        });
        println!("{}", serde_json::to_string(&value)?);
    } else if hits.is_empty() {
        println!("No results found for \"{}\"", args.query);
    } else {
        for (rank, hit) in hits.iter().enumerate() {
            println!(
                "{:>3}. #{} {:.3}  {}",
                rank + 1,
                hit.chunk_id,
                hit.score,
                preview(&hit.text, DEFAULT_PREVIEW_MAX_CHARS)
            );
        }
    }

    shutdown(&manager).await;
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    db: &DocumentDb,
    config: &ServiceConfig,
    json: bool,
) -> error::Result<()> {
    let owners = db.owner_summaries()?;
    let persisted = data_dir.persisted_users()?;

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "config": config,
            "users": owners,
            "persisted_indexes": persisted,
        });
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Model: {}", config.model);
    println!(
        "Vectors: {}",
        if config.vectors { "enabled" } else { "disabled" }
    );
    println!("Max cached indexes: {}", config.max_services);
    println!("Users: {}", owners.len());
    for owner in &owners {
        let saved = if persisted.contains(&owner.owner) {
            "saved index"
        } else {
            "no saved index"
        };
        println!(
            "  {}: {} documents, {} chunks ({saved})",
            owner.owner, owner.documents, owner.chunks
        );
    }
    Ok(())
}

async fn cmd_purge(
    data_dir: &DataDir,
    db: Arc<DocumentDb>,
    config: &ServiceConfig,
    user: &str,
) -> error::Result<()> {
    let (documents, chunks) = db.delete_owner(user)?;
    let manager = maintenance_manager(data_dir, db, config)?;
    let removed = manager.purge(user).await?;

    if documents == 0 && !removed {
        return Err(error::Error::NotFound {
            kind: "user",
            name: user.to_string(),
        });
    }
    println!("Purged '{user}': {documents} documents, {chunks} chunks");
    Ok(())
}

async fn cmd_cleanup(
    data_dir: &DataDir,
    db: Arc<DocumentDb>,
    config: &ServiceConfig,
    older_than: Option<u64>,
) -> error::Result<()> {
    let manager = maintenance_manager(data_dir, db.clone(), config)?;
    let mut removed = 0;

    if let Some(count) = older_than {
        for user in retention::cleanup_inactive(&db, &manager, retention::days(count)).await? {
            println!(
                "Removed inactive user '{}': {} documents, {} chunks",
                user.user, user.documents, user.chunks
            );
            removed += 1;
        }
    }

    for user in retention::cleanup_orphans(&db, &manager, data_dir.persisted_users()?).await? {
        println!("Removed orphaned index for '{user}'");
        removed += 1;
    }

    if removed == 0 {
        println!("Nothing to clean up.");
    }
    Ok(())
}

fn cmd_config(db: &DocumentDb, action: ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            config::validate_key(&key)?;
            match db.get_setting(&key)? {
                Some(value) => println!("{value}"),
                None => {
                    return Err(error::Error::NotFound {
                        kind: "setting",
                        name: key,
                    });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            config::validate_setting(&key, &value)?;
            db.set_setting(&key, value.trim())?;
            println!("Set {key} = {}", value.trim());
        }
        ConfigAction::List => {
            for key in SETTING_KEYS {
                match db.get_setting(key)? {
                    Some(value) => println!("{key}\t{value}"),
                    None => println!("{key}\t(default)"),
                }
            }
        }
    }
    Ok(())
}
