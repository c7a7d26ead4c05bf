//! # BasedDB CLI
//!
//! Inspect and verify a database directory without a running client.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use basedb_core::Config;
use basedb_storage::writelog::SCHEMA_FILE;
use basedb_storage::{DbServer, DumpInfo, LogFilter, LogLevel, SortOrder, WriteLog};

#[derive(Parser)]
#[command(name = "basedb")]
#[command(about = "BasedDB - embedded graph-relational database")]
struct Cli {
    /// Diagnostic output level
    #[arg(long, global = true, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show schema, types and the root hash of a database
    Info { dir: PathBuf },
    /// List the block dumps recorded by the last save
    Blocks { dir: PathBuf },
    /// Load every block and check it against the recorded hashes
    Verify { dir: PathBuf },
    /// Query the lifecycle history
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
}

#[derive(Subcommand)]
enum LogsCommand {
    Filter(FilterArgs),
}

#[derive(clap::Args, Debug)]
struct FilterArgs {
    dir: PathBuf,
    /// RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long)]
    start_date: Option<String>,
    /// RFC 3339 timestamp or YYYY-MM-DD (inclusive)
    #[arg(long)]
    end_date: Option<String>,
    /// Minimum level: debug, info, warn or error
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    function: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, value_enum, default_value = "asc")]
    sort: Sort,
    /// Prefix of the entry checksum
    #[arg(long)]
    checksum: Option<String>,
    /// One JSON object per line instead of an array
    #[arg(long)]
    stream: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Sort {
    Asc,
    Desc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    match cli.command {
        Commands::Info { dir } => info(&dir).await,
        Commands::Blocks { dir } => blocks(&dir).await,
        Commands::Verify { dir } => verify(&dir).await,
        Commands::Logs {
            command: LogsCommand::Filter(args),
        } => logs(args).await,
    }
}

async fn load_log(dir: &Path) -> Result<WriteLog> {
    WriteLog::load(dir)
        .await?
        .with_context(|| format!("{} holds no saved database", dir.display()))
}

async fn info(dir: &Path) -> Result<()> {
    let log = load_log(dir).await?;
    let schema = tokio::fs::read(dir.join(SCHEMA_FILE))
        .await
        .with_context(|| format!("reading {}", SCHEMA_FILE))?;
    let schema: serde_json::Value = serde_json::from_slice(&schema)?;

    println!("schema hash: {:016x}", log.schema_hash);
    println!("root:        {}", log.root);
    println!("blocks:      {}", log.blocks.len());
    if let Some(locales) = schema.get("locales").and_then(|l| l.as_array()) {
        let locales: Vec<_> = locales.iter().filter_map(|l| l.as_str()).collect();
        println!("locales:     {}", locales.join(", "));
    }
    println!();
    println!("{:>5}  {:<24} {:>10} {:>10}", "id", "type", "last id", "capacity");
    for (id, t) in &log.types {
        println!("{:>5}  {:<24} {:>10} {:>10}", id, t.name, t.last_id, t.block_capacity);
    }
    Ok(())
}

async fn blocks(dir: &Path) -> Result<()> {
    let log = load_log(dir).await?;
    println!("{:<24} {:>10} {:>10} {:>10}  hash", "type", "start", "end", "bytes");
    for b in &log.blocks {
        let name = log.types.get(&b.type_id).map_or("?", |t| t.name.as_str());
        let file = DumpInfo {
            type_id: b.type_id,
            start: b.start,
            end: b.end,
        }
        .path(dir);
        let size = tokio::fs::metadata(&file).await.map(|m| m.len()).unwrap_or(0);
        println!("{:<24} {:>10} {:>10} {:>10}  {}", name, b.start, b.end, size, b.hash);
    }
    Ok(())
}

async fn verify(dir: &Path) -> Result<()> {
    load_log(dir).await?;
    let mut config = Config::default();
    config.storage.data_dir = dir.to_path_buf();
    let server = DbServer::open(config).await?;
    let report = server.verify()?;

    println!("checked:      {}", report.checked);
    println!("dirty:        {}", report.dirty);
    println!("root matches: {}", report.root_matches);
    for key in &report.mismatched {
        println!("mismatch:     type {} start {}", key >> 32, key & 0xffff_ffff);
    }
    if !report.is_ok() {
        bail!("verification failed");
    }
    Ok(())
}

async fn logs(args: FilterArgs) -> Result<()> {
    let filter = build_filter(&args)?;
    let log = load_log(&args.dir).await?;
    let entries = filter.apply(&log.history);

    if args.stream {
        for entry in entries {
            println!("{}", serde_json::to_string(entry)?);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    }
    Ok(())
}

fn build_filter(args: &FilterArgs) -> Result<LogFilter> {
    let start = args.start_date.as_deref().map(|s| parse_date(s, false)).transpose()?;
    let end = args.end_date.as_deref().map(|s| parse_date(s, true)).transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            bail!("--start-date must not be after --end-date");
        }
    }
    let level = match &args.level {
        Some(l) => Some(LogLevel::parse(l).with_context(|| format!("unknown level '{}'", l))?),
        None => None,
    };
    if args.limit == Some(0) {
        bail!("--limit must be positive");
    }
    if let Some(c) = &args.checksum {
        if c.is_empty() || !c.chars().all(|ch| ch.is_ascii_hexdigit()) {
            bail!("--checksum must be hexadecimal");
        }
    }
    Ok(LogFilter {
        start,
        end,
        level,
        function: args.function.clone(),
        checksum: args.checksum.as_ref().map(|c| c.to_ascii_lowercase()),
        limit: args.limit,
        sort: match args.sort {
            Sort::Asc => SortOrder::Asc,
            Sort::Desc => SortOrder::Desc,
        },
    })
}

/// Epoch milliseconds. A bare date covers the whole day when it ends a range.
fn parse_date(s: &str, end_of_day: bool) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{}'", s))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .with_context(|| format!("invalid date '{}'", s))?;
    Ok(Utc.from_utc_datetime(&time).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> FilterArgs {
        FilterArgs {
            dir: PathBuf::from("."),
            start_date: None,
            end_date: None,
            level: None,
            function: None,
            limit: None,
            sort: Sort::Asc,
            checksum: None,
            stream: false,
        }
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("1970-01-01", false).unwrap(), 0);
        assert_eq!(parse_date("1970-01-01", true).unwrap(), 86_399_999);
        assert_eq!(parse_date("1970-01-01T00:00:01Z", false).unwrap(), 1_000);
        assert!(parse_date("yesterday", false).is_err());
    }

    #[test]
    fn test_filter_validation() {
        let mut a = args();
        a.start_date = Some("2024-02-01".into());
        a.end_date = Some("2024-01-01".into());
        assert!(build_filter(&a).is_err());

        let mut a = args();
        a.limit = Some(0);
        assert!(build_filter(&a).is_err());

        let mut a = args();
        a.level = Some("loud".into());
        assert!(build_filter(&a).is_err());

        let mut a = args();
        a.checksum = Some("xyz".into());
        assert!(build_filter(&a).is_err());

        let mut a = args();
        a.level = Some("WARN".into());
        a.sort = Sort::Desc;
        a.checksum = Some("AB".into());
        let f = build_filter(&a).unwrap();
        assert_eq!(f.level, Some(LogLevel::Warn));
        assert_eq!(f.sort, SortOrder::Desc);
        assert_eq!(f.checksum.as_deref(), Some("ab"));
    }
}
