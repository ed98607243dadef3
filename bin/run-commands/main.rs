use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, error, info};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use usaxs_runner::command_file::{command_list_as_table, get_command_list};
use usaxs_runner::command_list::{ListOutcome, execute_command_list, verify_commands};
use usaxs_runner::config::{AppConfig, load_config_or_default};
use usaxs_runner::instrument::Instrument;
use usaxs_runner::notify::{LogNotifier, Notifier, SpoolNotifier};
use usaxs_runner::sim::simulated_instrument;

/// USAXS batch command runner
#[derive(Parser, Debug)]
#[command(name = "run-commands")]
#[command(about = "Run a USAXS/SAXS/WAXS command list", long_about = None)]
struct Args {
    /// Command file (text or CSV/TSV table)
    command_file: PathBuf,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Parse and validate the command file, print it, and exit
    #[arg(short, long)]
    summarize: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, &args);

    let notifier: Arc<dyn Notifier> = match &config.notices.spool_dir {
        Some(dir) => Arc::new(SpoolNotifier::new(dir.clone())),
        None => Arc::new(LogNotifier),
    };

    // no channel-access transport is wired in; everything runs against the
    // soft IOC until a beamline client lands behind the ControlSystem trait
    let sim_config = simulation_overrides(config);
    let (instrument, _ioc) = simulated_instrument(sim_config, notifier)?;
    info!("soft IOC in use; hardware records are simulated");

    let commands = get_command_list(&args.command_file)?;
    info!(
        "Command file: {}\n{}",
        args.command_file.display(),
        command_list_as_table(&commands)
    );

    if args.summarize {
        verify_commands(&instrument, &commands)?;
        println!("{}", command_list_as_table(&commands));
        return Ok(());
    }

    wire_abort_handler(&instrument);

    let outcome = execute_command_list(
        &instrument,
        &args.command_file,
        &commands,
        &BTreeMap::new(),
    )?;
    match outcome {
        ListOutcome::Completed { executed } => {
            info!("command list completed: {executed} commands executed");
            Ok(())
        }
        ListOutcome::Aborted { line } => {
            match line {
                Some(line) => info!("command list aborted at line {line}"),
                None => info!("command list aborted"),
            }
            Ok(())
        }
        ListOutcome::Failed { line, attempts } => {
            error!("command list failed at line {line} after {attempts} attempts");
            std::process::exit(1);
        }
    }
}

/// The soft IOC completes moves instantly; drop the physical settling
/// pauses so simulated batches run at full speed.
fn simulation_overrides(mut config: AppConfig) -> AppConfig {
    config.stages.guard_slit_settle_ms = 0;
    config.stages.beam_slit_settle_ms = 0;
    config
}

fn wire_abort_handler(instrument: &Instrument) {
    let flag = instrument.abort_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received: stopping after the current command");
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }) {
        error!("cannot install Ctrl+C handler: {e}");
    }
}

fn log_startup_info(config: &AppConfig, args: &Args) {
    info!("=== USAXS batch command runner ===");
    match &args.config {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Record prefix: {}", config.epics.prefix);
    info!(
        "Attempts per command: {}",
        config.collection.maximum_attempts
    );
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };
    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
