use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use storefront_data::backend::{Backend, Filter, RestBackend, Row, Select};
use storefront_data::cache::CacheEngine;
use storefront_data::config::Config;
use storefront_data::connection::ConnectionManager;
use storefront_data::mutation::{MutationCoordinator, RowUpdate};

const PASSWORD_ENV: &str = "STOREFRONT_PASSWORD";
const DEFAULT_LOG_FILTER: &str = "storefront_data=info";

#[derive(Parser, Debug)]
#[command(name = "storefront-data")]
#[command(about = "Inspect and maintain storefront data through the shared client")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./storefront.yaml, then $XDG_CONFIG_HOME/storefront/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Sign in before running the command; the password is read from STOREFRONT_PASSWORD
  #[arg(long)]
  email: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe the service once
  Check,
  /// Print connection and write statistics as JSON
  Stats,
  /// Read rows through the cache
  Select {
    resource: String,
    #[arg(long, default_value = "*")]
    columns: String,
    /// Filter as `column=op.value`, e.g. `category=eq.shoes`; repeatable
    #[arg(short, long = "filter")]
    filters: Vec<String>,
    /// Sort column, prefixed with `-` for descending
    #[arg(short, long, allow_hyphen_values = true)]
    order: Option<String>,
    #[arg(short, long)]
    limit: Option<u64>,
  },
  /// Insert rows from a file holding a JSON array of objects
  Import {
    resource: String,
    file: PathBuf,
    #[arg(long)]
    chunk_size: Option<usize>,
  },
  /// Apply patches from a file holding `[{"key": .., "patch": {..}}, ..]`
  Patch {
    resource: String,
    file: PathBuf,
    #[arg(long, default_value = "id")]
    key_column: String,
    #[arg(long)]
    chunk_size: Option<usize>,
  },
  /// Upload a file to a storage bucket
  Upload {
    bucket: String,
    path: String,
    file: PathBuf,
    #[arg(long, default_value = "application/octet-stream")]
    content_type: String,
  },
  /// List objects in a storage bucket
  Ls {
    bucket: String,
    #[arg(default_value = "")]
    prefix: String,
  },
  /// Remove objects from a storage bucket
  Rm {
    bucket: String,
    #[arg(required = true)]
    paths: Vec<String>,
  },
}

#[derive(Debug, Deserialize)]
struct PatchEntry {
  key: serde_json::Value,
  patch: Row,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_file.as_deref())?;

  // Missing endpoint or key fails here, before anything connects
  let config = Config::load(args.config.as_deref())?;
  let backend = RestBackend::new(&config)?;
  let manager = ConnectionManager::new(&config, move || backend.clone());

  if let Some(email) = &args.email {
    let password = std::env::var(PASSWORD_ENV)
      .wrap_err_with(|| format!("{} must be set when --email is given", PASSWORD_ENV))?;
    let session = manager.sign_in(email, &password).await?;
    info!(user = ?session.user_id, "Signed in");
  }

  let result = run(args.command, &config, &manager).await;
  manager.disconnect();
  result
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = match path.parent() {
    Some(p) if !p.as_os_str().is_empty() => p,
    _ => Path::new("."),
  };
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}

async fn run(command: Command, config: &Config, manager: &ConnectionManager<RestBackend>) -> Result<()> {
  match command {
    Command::Check => {
      let status = manager.check_connection().await;
      println!("{}", serde_json::to_string_pretty(&status)?);
      if !status.connected {
        return Err(eyre!("Service unreachable at {}", config.url));
      }
    }

    Command::Stats => {
      let coordinator = MutationCoordinator::new(manager.clone(), &config.batch);
      manager.check_connection().await;
      println!("{}", serde_json::to_string_pretty(&coordinator.get_performance_stats())?);
    }

    Command::Select {
      resource,
      columns,
      filters,
      order,
      limit,
    } => {
      let mut query = Select::from(resource).columns(columns);
      for filter in &filters {
        query = query.filter(filter.parse::<Filter>()?);
      }
      if let Some(order) = order {
        query = match order.strip_prefix('-') {
          Some(column) => query.order(column, false),
          None => query.order(order.as_str(), true),
        };
      }
      if let Some(limit) = limit {
        query = query.limit(limit);
      }

      let engine: CacheEngine<RestBackend, Vec<Row>> = CacheEngine::new(manager.clone(), &config.cache);
      let options = engine
        .default_options()
        .with_timeout(Duration::from_secs(config.cache.read_timeout_secs));
      let result = engine.select(query, options).await;
      engine.shutdown();

      match (result.data, result.error) {
        (Some(rows), _) => println!("{}", serde_json::to_string_pretty(&rows)?),
        (None, Some(e)) => return Err(e).wrap_err("Select failed"),
        (None, None) => return Err(eyre!("Select returned no data")),
      }
    }

    Command::Import {
      resource,
      file,
      chunk_size,
    } => {
      let rows: Vec<Row> = read_json(&file).await?;
      let coordinator = MutationCoordinator::new(manager.clone(), &config.batch);
      let chunk_size = chunk_size.unwrap_or_else(|| coordinator.default_chunk_size());

      let result = coordinator.bulk_insert(&resource, rows, chunk_size).await?;
      println!("Inserted {} row(s) into {}", result.inserted_count, resource);
      for e in &result.errors {
        eprintln!("  chunk {} ({} rows): {}", e.chunk, e.rows, e.error);
      }
      if !result.success {
        return Err(eyre!("{} chunk(s) failed", result.errors.len()));
      }
    }

    Command::Patch {
      resource,
      file,
      key_column,
      chunk_size,
    } => {
      let entries: Vec<PatchEntry> = read_json(&file).await?;
      let updates = entries
        .into_iter()
        .map(|e| RowUpdate::new(key_column.as_str(), e.key, e.patch))
        .collect();
      let coordinator = MutationCoordinator::new(manager.clone(), &config.batch);
      let chunk_size = chunk_size.unwrap_or_else(|| coordinator.default_chunk_size());

      let result = coordinator.bulk_update(&resource, updates, chunk_size).await?;
      println!("Updated {} row(s) in {}", result.updated_count, resource);
      for e in &result.errors {
        eprintln!("  #{} ({}={}): {}", e.index, key_column, e.key, e.error);
      }
      if !result.success {
        return Err(eyre!("{} row(s) failed", result.errors.len()));
      }
    }

    Command::Upload {
      bucket,
      path,
      file,
      content_type,
    } => {
      let bytes = tokio::fs::read(&file)
        .await
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
      let size = bytes.len();
      manager
        .get_handle()
        .upload(&bucket, &path, bytes, &content_type)
        .await?;
      info!(bucket = %bucket, path = %path, size, "Uploaded");
    }

    Command::Ls { bucket, prefix } => {
      for object in manager.get_handle().list(&bucket, &prefix).await? {
        let size = object.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
          "{:>10}  {:<25}  {}",
          size,
          object.updated_at.as_deref().unwrap_or("-"),
          object.name
        );
      }
    }

    Command::Rm { bucket, paths } => {
      manager.get_handle().remove(&bucket, &paths).await?;
      info!(bucket = %bucket, removed = paths.len(), "Removed objects");
    }
  }

  Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let contents = tokio::fs::read_to_string(path)
    .await
    .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
  serde_json::from_str(&contents).wrap_err_with(|| format!("Failed to parse {}", path.display()))
}
