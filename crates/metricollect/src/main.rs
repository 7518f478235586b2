//! mcollect: run, inspect and reap metric collection worker pools.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use metricollect_core::config::Config;
use metricollect_core::error::{Error, format_error_with_remediation};
use metricollect_core::logging::{LogFormat, init_logging};
use metricollect_core::reaper::{PidFile, ReaperConfig, reap_stale_instances};
use metricollect_core::runner::{self, RunnerOptions};

#[derive(Parser, Debug)]
#[command(name = "mcollect", version, about = "Periodic metric collection with a self-scaling worker pool")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, short = 'c', global = true, env = "MCOLLECT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MCOLLECT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true, env = "MCOLLECT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the scheduler for an application and block until it stops
    Run(RunArgs),

    /// Print the metric ids an application would schedule
    List {
        app: String,

        /// Comma-separated role filter
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// Publish one metric in-process, without forking
    Publish { app: String, id: String },

    /// Stop stale instances of an application and report what happened
    Reap { app: String },

    /// Print the default configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    app: String,

    /// Seconds between cycles
    #[arg(long)]
    frequency: Option<u64>,

    /// Stop after this many cycles
    #[arg(long)]
    iterations: Option<u64>,

    /// Comma-separated role filter
    #[arg(long, value_delimiter = ',')]
    roles: Option<Vec<String>>,

    /// Initial pool size
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    min_workers: Option<usize>,

    #[arg(long)]
    max_workers: Option<usize>,

    /// Skip reaping stale instances before starting
    #[arg(long)]
    no_reap: bool,
}

impl RunArgs {
    fn apply(&self, options: &mut RunnerOptions) {
        if let Some(secs) = self.frequency {
            options.frequency = Duration::from_secs(secs);
        }
        if self.iterations.is_some() {
            options.iterations = self.iterations;
        }
        if let Some(roles) = &self.roles {
            options.roles.clone_from(roles);
        }
        if let Some(workers) = self.workers {
            options.initial_workers = workers;
        }
        if let Some(min) = self.min_workers {
            options.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            options.max_workers = max;
        }
        if self.no_reap {
            options.reap_stale = false;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Config) {
        print!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;

    let log_config = config
        .log_config()
        .with_overrides(cli.log_level, cli.log_format);
    init_logging(&log_config).context("Failed to initialize logging")?;
    debug!(config = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Run(args) => {
            let registry = config.build_registry()?;
            let mut options = config.runner_options(&args.app);
            args.apply(&mut options);
            if let Some(pid_file) = &options.pid_file {
                if let Some(dir) = pid_file.parent() {
                    std::fs::create_dir_all(dir).with_context(|| {
                        format!("Failed to create run directory {}", dir.display())
                    })?;
                }
            }

            let summary = runner::run(&registry, &args.app, options)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::List { app, roles } => {
            let registry = config.build_registry()?;
            let app = registry.resolve(&app)?;
            for id in app.metric_ids(&roles) {
                println!("{id}");
            }
        }
        Commands::Publish { app, id } => {
            let registry = config.build_registry()?;
            registry.resolve(&app)?.publish(&id)?;
        }
        Commands::Reap { app } => {
            let options = config.runner_options(&app);
            let pid_file = PidFile::for_app(&config.run_dir(), &app);
            let reaper = ReaperConfig::for_app(&app)
                .with_pid_file(pid_file.path())
                .with_timing(options.reap_grace, options.reap_poll);
            let report = reap_stale_instances(&reaper);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        // Printed before the config file is read.
        Commands::Config => {}
    }

    Ok(())
}
