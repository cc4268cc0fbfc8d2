use std::path::{Path, PathBuf};

use {
    clap::Subcommand,
    parley_config::ParleyConfig,
    parley_store::SqliteStore,
};

#[derive(Subcommand)]
pub enum DbAction {
    /// Delete the database file (and its WAL/SHM companions).
    Reset,
    /// Clear all data from tables but keep the schema intact.
    Clear,
    /// Run all pending database migrations.
    Migrate,
}

/// Tables in the store schema.
const TABLES: &[&str] = &["conversation_messages", "rate_windows", "command_usage"];

pub async fn handle_db(action: DbAction, config: &ParleyConfig) -> anyhow::Result<()> {
    let url = parley_config::database_url(config);
    match action {
        DbAction::Reset => reset(&url),
        DbAction::Clear => clear(&url).await,
        DbAction::Migrate => migrate(&url).await,
    }
}

/// File path behind a `sqlite:` URL, if it names one.
fn sqlite_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && path != ":memory:").then(|| PathBuf::from(path))
}

fn companions(db: &Path) -> Vec<PathBuf> {
    ["", "-wal", "-shm"]
        .iter()
        .map(|suffix| {
            let mut name = db.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

fn reset(url: &str) -> anyhow::Result<()> {
    let Some(db) = sqlite_path(url) else {
        anyhow::bail!("{url} does not point at a database file");
    };

    let mut deleted = false;
    for path in companions(&db) {
        if path.exists() {
            std::fs::remove_file(&path)?;
            println!("Deleted: {}", path.display());
            deleted = true;
        }
    }

    if deleted {
        println!("Database files deleted. Run `parley db migrate` to recreate them.");
    } else {
        println!("No database files found.");
    }
    Ok(())
}

async fn clear(url: &str) -> anyhow::Result<()> {
    if let Some(db) = sqlite_path(url)
        && !db.exists()
    {
        println!("Database not found: {}", db.display());
        return Ok(());
    }

    let store = SqliteStore::open(url).await?;
    for table in TABLES {
        let query = format!("DELETE FROM {table}");
        match sqlx::query(&query).execute(store.pool()).await {
            Ok(done) => println!("Cleared table: {table} ({} rows)", done.rows_affected()),
            Err(e) => eprintln!("Warning: could not clear {table}: {e}"),
        }
    }
    store.pool().close().await;
    Ok(())
}

async fn migrate(url: &str) -> anyhow::Result<()> {
    if let Some(db) = sqlite_path(url)
        && let Some(dir) = db.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let store = SqliteStore::open(url).await?;
    store.pool().close().await;
    println!("Migrations applied: {url}");
    Ok(())
}
