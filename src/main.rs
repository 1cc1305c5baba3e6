mod config;
mod ledger;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cached_field::{
  worker, CachedAttribute, ChannelDispatcher, Engine, Expiration, Registry, SqliteStore, Worker,
};
use chrono::Duration;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

type LedgerEngine = Engine<SqliteStore, ChannelDispatcher>;

#[derive(Parser, Debug)]
#[command(name = "cached-field")]
#[command(about = "Ledger demo for cached, lazily recalculated attributes")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cached-field/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Ledger database to use
  #[arg(short, long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create the ledger tables and print the database path
  Init,
  /// Record an entry (in cents) and flag the balance as stale
  Add {
    account: String,
    #[arg(allow_hyphen_values = true)]
    amount: i64,
    /// Only flag; don't schedule a background recalculation
    #[arg(long)]
    no_recalculate: bool,
  },
  /// Print the balance, recalculating if it is stale
  Balance { account: String },
  /// Recalculate the balance now
  Recalculate { account: String },
  /// Set when the balance expires (default expiration if omitted)
  Expire {
    account: String,
    #[arg(long)]
    seconds: Option<i64>,
  },
  /// Print the raw cached slots
  Show { account: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config)?;

  let path = match args.database.or_else(|| config.database.clone()) {
    Some(path) => path,
    None => SqliteStore::default_path()?,
  };
  let store = Arc::new(SqliteStore::open(&path)?);
  ledger::create_schema(&store)?;

  let mut registry = Registry::new();
  let balance = registry.bind(
    store.as_ref(),
    Arc::new(ledger::AccountModel::new(Arc::clone(&store))),
    ledger::balance_attribute(&config.settings)?,
  )?;

  let (dispatcher, queue) = worker::channel();
  let engine = Arc::new(Engine::new(
    Arc::clone(&store),
    registry,
    config.settings.clone(),
    dispatcher,
  ));
  let worker = Worker::spawn(Arc::clone(&engine), queue);

  let result = execute(engine, balance, path, args.command).await;

  let stats = worker.shutdown().await?;
  info!(
    completed = stats.completed,
    failed = stats.failed,
    coalesced = stats.coalesced,
    "background recalculations finished"
  );

  result
}

/// Run a command on the blocking pool; SQLite calls must not stall the
/// runtime the worker shares.
async fn execute(
  engine: Arc<LedgerEngine>,
  balance: Arc<CachedAttribute>,
  path: PathBuf,
  command: Command,
) -> Result<()> {
  tokio::task::spawn_blocking(move || run(&engine, &balance, &path, command))
    .await
    .map_err(|e| eyre!("Command panicked: {}", e))?
}

fn run(
  engine: &LedgerEngine,
  balance: &CachedAttribute,
  path: &Path,
  command: Command,
) -> Result<()> {
  let store = engine.store();

  match command {
    Command::Init => {
      println!("{}", path.display());
    }
    Command::Add {
      account,
      amount,
      no_recalculate,
    } => {
      let id = ledger::ensure_account(store, &account)?;
      ledger::add_entry(store, id, amount)?;
      let mut record = engine.load(ledger::ACCOUNT, id)?;
      let and_recalculate = no_recalculate.then_some(false);
      engine.flag_as_stale(&mut record, balance, and_recalculate, true)?;
      info!(account = %account, amount, "entry added");
    }
    Command::Balance { account } => {
      let id = ledger::find_account(store, &account)?;
      let mut record = engine.load(ledger::ACCOUNT, id)?;
      println!("{}", engine.read(&mut record, balance)?);
    }
    Command::Recalculate { account } => {
      let id = ledger::find_account(store, &account)?;
      let mut record = engine.load(ledger::ACCOUNT, id)?;
      engine.recalculate(&mut record, balance, None, true)?;
      println!("{}", record.cached_value(balance));
    }
    Command::Expire { account, seconds } => {
      let id = ledger::find_account(store, &account)?;
      let mut record = engine.load(ledger::ACCOUNT, id)?;
      let expiration = seconds
        .map(|s| {
          Duration::try_seconds(s)
            .map(Expiration::from)
            .ok_or_else(|| eyre!("{} seconds is out of range", s))
        })
        .transpose()?;
      match engine.expire_after(&mut record, balance, expiration)? {
        Some(at) => println!("expires at {}", at.to_rfc3339()),
        None => println!("expiration cleared"),
      }
    }
    Command::Show { account } => {
      let id = ledger::find_account(store, &account)?;
      let record = engine.load(ledger::ACCOUNT, id)?;
      for slot in balance.slots() {
        println!("{:<32} {}", slot.name, record.get(&slot.name));
      }
    }
  }

  Ok(())
}

/// Log to a daily file; `CACHED_FIELD_LOG` overrides the `info` filter.
fn init_logging(config: &config::Config) -> Result<WorkerGuard> {
  let dir = config.log_dir()?;
  std::fs::create_dir_all(&dir)?;

  let appender = tracing_appender::rolling::daily(dir, "cached-field.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter =
    EnvFilter::try_from_env("CACHED_FIELD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
