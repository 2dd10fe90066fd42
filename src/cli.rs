use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, info};

use crate::config::Config;
use crate::db::{RetryPolicy, SqliteBackend};
use crate::engine::{LogSink, StepSequencer};
use crate::error::MigrateError;
use crate::steps::{MigrationChain, SchemaVersion, StepDefinition};

#[derive(Parser)]
#[command(
    name = "migrastep",
    version,
    about = "migrastep: versioned, resumable schema upgrades for SQLite databases"
)]
pub struct Cli {
    /// Configuration file (default: config.toml in the app's data directory)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upgrade a database by running every pending step
    Upgrade {
        /// Database file
        #[arg(long = "db")]
        db: PathBuf,

        /// Step definition file, or directory of *.toml step files
        #[arg(long = "steps")]
        steps: PathBuf,

        /// Stop at this version (default: newest known version)
        #[arg(long = "to")]
        to: Option<String>,

        /// Version to assume when the database has no recorded version
        #[arg(long = "from")]
        from: Option<String>,

        /// Print step reports as JSON
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Show the database's version and the steps still to run
    Status {
        /// Database file
        #[arg(long = "db")]
        db: PathBuf,

        /// Step definition file, or directory of *.toml step files
        #[arg(long = "steps")]
        steps: PathBuf,

        /// Print status as JSON
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Load and validate step definitions without touching a database
    Check {
        /// Step definition file, or directory of *.toml step files
        #[arg(long = "steps")]
        steps: PathBuf,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), MigrateError> {
        let args = Cli::parse();
        let config = Config::load_config(args.config.as_deref());
        let _logger = init_logging(&config)?;
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        match args.command {
            Command::Upgrade {
                db,
                steps,
                to,
                from,
                json,
            } => Self::upgrade(&config, &db, &steps, to.as_deref(), from.as_deref(), json),
            Command::Status { db, steps, json } => Self::status(&config, &db, &steps, json),
            Command::Check { steps } => Self::check(&steps),
        }
    }

    fn load_chain(steps: &Path) -> Result<MigrationChain, MigrateError> {
        MigrationChain::new(StepDefinition::load_path(steps)?)
    }

    fn open(config: &Config, db: &Path) -> Result<SqliteBackend, MigrateError> {
        SqliteBackend::open(db, Duration::from_millis(config.database.busy_timeout_ms))
    }

    fn upgrade(
        config: &Config,
        db: &Path,
        steps: &Path,
        to: Option<&str>,
        from: Option<&str>,
        json: bool,
    ) -> Result<(), MigrateError> {
        let chain = Self::load_chain(steps)?;
        let to: Option<SchemaVersion> = to.map(str::parse::<SchemaVersion>).transpose()?;
        let from: Option<SchemaVersion> = from.map(str::parse::<SchemaVersion>).transpose()?;
        let mut backend = Self::open(config, db)?;

        let sink = LogSink;
        let sequencer = StepSequencer::new(&sink).with_retry(RetryPolicy::from(&config.retry));
        let reports = chain.upgrade(&mut backend, &sequencer, from.as_ref(), to.as_ref())?;

        if json {
            let text = serde_json::to_string_pretty(&reports)
                .map_err(|e| MigrateError::Error(e.to_string()))?;
            println!("{text}");
        } else if reports.is_empty() {
            println!("Nothing to do: database is up to date");
        } else {
            for report in &reports {
                print!("{report}");
            }
        }
        Ok(())
    }

    fn status(config: &Config, db: &Path, steps: &Path, json: bool) -> Result<(), MigrateError> {
        let chain = Self::load_chain(steps)?;
        let backend = Self::open(config, db)?;
        let status = chain.status(&backend)?;

        if json {
            let text = serde_json::to_string_pretty(&status)
                .map_err(|e| MigrateError::Error(e.to_string()))?;
            println!("{text}");
            return Ok(());
        }

        println!(
            "Current version: {}{}",
            status.current,
            if status.assumed { " (assumed, no version recorded)" } else { "" }
        );
        println!("Latest version:  {}", status.latest);
        if status.pending.is_empty() {
            println!("No pending steps");
        } else {
            println!("Pending steps:");
            for step in &status.pending {
                println!("  {step}");
            }
        }
        for applied in &status.history {
            println!(
                "Applied {} ({} -> {}) at {}",
                applied.name, applied.from_version, applied.to_version, applied.applied_at
            );
        }
        Ok(())
    }

    fn check(steps: &Path) -> Result<(), MigrateError> {
        let chain = Self::load_chain(steps)?;
        for step in chain.steps() {
            info!("Validated step {} ({})", step.label(), step.checksum());
            println!("{}  {}", step.checksum(), step.label());
        }
        println!(
            "{} step(s), {} -> {}",
            chain.steps().len(),
            chain.first_version(),
            chain.latest_version()
        );
        Ok(())
    }
}

fn init_logging(config: &Config) -> Result<LoggerHandle, MigrateError> {
    Logger::try_with_str(config.logging.spec())
        .and_then(|logger| logger.log_to_stderr().start())
        .map_err(|e| MigrateError::Error(format!("Failed to initialize logging: {e}")))
}
