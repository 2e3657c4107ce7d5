use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use db::{Db, Options};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "siltkv")]
#[command(about = "An embedded LSM-tree key/value store", long_about = None)]
struct Cli {
    /// Database directory (WAL + SSTables live here)
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    /// Memtable flush threshold in bytes (0 disables flushing)
    #[arg(long, default_value_t = 0)]
    mem: usize,

    /// SSTable count that triggers compaction (0 disables it)
    #[arg(long, default_value_t = 0)]
    max_sst: usize,

    /// fsync the WAL after each write
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    sync: bool,

    /// Show flush, compaction, and bloom-filter activity on stderr
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value under a key
    Put { key: String, value: String },
    /// Print the value stored under a key
    Get { key: String },
    /// Delete a key
    Del { key: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut store = Db::open(Options {
        dir: cli.dir,
        sync_on_write: cli.sync,
        memtable_max_bytes: cli.mem,
        max_sstables: cli.max_sst,
    })?;

    let code = match &cli.command {
        Commands::Put { key, value } => {
            store.put(key.as_bytes(), value.as_bytes())?;
            println!("ok");
            ExitCode::SUCCESS
        }
        Commands::Get { key } => match store.get(key.as_bytes())? {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                ExitCode::SUCCESS
            }
            None => {
                println!("(not found)");
                ExitCode::from(1)
            }
        },
        Commands::Del { key } => {
            store.delete(key.as_bytes())?;
            println!("ok");
            ExitCode::SUCCESS
        }
    };

    store.close()?;
    Ok(code)
}
