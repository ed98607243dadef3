use std::collections::BTreeMap;
use std::path::Path;

use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;

use crate::archive;
use crate::command_file::{Command, CommandAction, ScanKind, command_list_as_table};
use crate::error::SequencerError;
use crate::instrument::Instrument;
use crate::journal::AttemptRecord;
use crate::modes::InstrumentMode;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scans::{self, parse_scan_args};

/// End-of-list status text. A downstream notification consumer triggers on
/// this exact string; reproduce it bit for bit.
pub const LIST_DONE_STATE: &str = "USAXS macro file done";

/// How a command list ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ListOutcome {
    Completed { executed: usize },
    Aborted { line: Option<usize> },
    Failed { line: usize, attempts: usize },
}

impl ListOutcome {
    fn describe(&self) -> String {
        match self {
            ListOutcome::Completed { executed } => {
                format!("completed, {executed} commands executed")
            }
            ListOutcome::Aborted { line: Some(line) } => format!("aborted at line {line}"),
            ListOutcome::Aborted { line: None } => "aborted".to_string(),
            ListOutcome::Failed { line, attempts } => {
                format!("failed at line {line} after {attempts} attempts")
            }
        }
    }
}

/// Per-command metadata record handed to the journal, merged with whatever
/// the caller supplied for the whole list.
#[derive(Debug, Clone, Serialize)]
pub struct CommandMetadata {
    pub full_filename: String,
    pub filename: String,
    pub line_number: usize,
    pub action: String,
    pub parameters: Vec<String>,
    pub iso8601: String,
    pub extra: BTreeMap<String, String>,
}

impl CommandMetadata {
    fn new(source: &Path, command: &Command, extra: &BTreeMap<String, String>) -> Self {
        let full_filename = std::fs::canonicalize(source)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| source.display().to_string());
        Self {
            full_filename,
            filename: source.display().to_string(),
            line_number: command.line_number,
            action: command.action.name().to_string(),
            parameters: command.args.clone(),
            iso8601: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            extra: extra.clone(),
        }
    }
}

/// Pre-flight validation of a command list, before any hardware motion.
///
/// All violations across the whole list are accumulated and reported in a
/// single error, so an operator fixes the entire file in one pass instead
/// of one error at a time.
pub fn verify_commands(
    instrument: &Instrument,
    commands: &[Command],
) -> Result<(), SequencerError> {
    let mut errors = Vec::new();
    let sx_low = instrument.stages.sample_x.low_limit();
    let sx_high = instrument.stages.sample_x.high_limit();
    let sy_low = instrument.stages.sample_y.low_limit();
    let sy_high = instrument.stages.sample_y.high_limit();

    for command in commands {
        let CommandAction::Scan(_) = command.action else {
            continue;
        };
        let raw = command.raw.trim();
        let line = command.line_number;
        let args = match parse_scan_args(&command.args) {
            Ok(args) => args,
            Err(reason) => {
                errors.push(format!("line {line}: improper command: {raw} : {reason}"));
                continue;
            }
        };
        if args.x < sx_low {
            errors.push(format!(
                "line {line}: SX low limit: value {} < low limit {sx_low}, command: {raw}",
                args.x
            ));
        }
        if args.x > sx_high {
            errors.push(format!(
                "line {line}: SX high limit: value {} > high limit {sx_high}, command: {raw}",
                args.x
            ));
        }
        if args.y < sy_low {
            errors.push(format!(
                "line {line}: SY low limit: value {} < low limit {sy_low}, command: {raw}",
                args.y
            ));
        }
        if args.y > sy_high {
            errors.push(format!(
                "line {line}: SY high limit: value {} > high limit {sy_high}, command: {raw}",
                args.y
            ));
        }
        if args.thickness < 0.0 {
            warn!("line {line}: thickness {} looks wrong: {raw}", args.thickness);
        }
    }
    if !errors.is_empty() {
        return Err(SequencerError::Validation(errors));
    }
    info!("Command file verified");
    Ok(())
}

/// Pick the maximum order number across the independent detectors and set
/// them all to it, so free-running file counters cannot overwrite each
/// other's output.
pub fn sync_order_numbers(instrument: &Instrument) -> Result<(), SequencerError> {
    let order = instrument
        .terms
        .flyscan_order_number()?
        .max(instrument.terms.saxs_order_number()?)
        .max(instrument.terms.waxs_order_number()?);
    info!("Synchronizing detector order numbers to {order}");
    instrument.terms.set_flyscan_order_number(order)?;
    instrument.terms.set_saxs_order_number(order)?;
    instrument.terms.set_waxs_order_number(order)
}

/// Actions before a command list is run.
pub fn before_command_list(
    instrument: &Instrument,
    commands: &[Command],
) -> Result<(), SequencerError> {
    verify_commands(instrument, commands)?;

    instrument.user_status.stamp_now()?;
    instrument.user_status.set_state("Starting data collection")?;
    instrument.user_status.set_collection_in_progress(true)?;
    instrument.ti_filter_shutter.close()?;
    instrument.terms.set_saxs_collecting(false)?;
    instrument.terms.set_waxs_collecting(false)?;

    if instrument.config.collection.measure_dark_currents {
        instrument.measure_dark_currents()?;
    }

    // reset the ranges used when tuning the optical axes
    let ranges = scans::default_tune_ranges(instrument)?;
    scans::update_tuning_widths(instrument, &ranges)?;

    if instrument.terms.run_tune_on_qdo()? {
        info!("Running the USAXS tune as requested at start of measurements");
        scans::pre_usaxs_tune(instrument)?;
    }

    if instrument.config.collection.sync_order_numbers {
        sync_order_numbers(instrument)?;
    }

    // archive the list; the worker is joined here because the archived copy
    // must exist before the first command can fail
    let table = command_list_as_table(commands);
    let handle = archive::post_command_list(instrument.archive_targets(), table);
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    instrument.user_status.set_macro_file("commands.txt")?;
    instrument.user_status.set_macro_file_time(&ts)?;
    if handle.join().is_err() {
        warn!("command list archive worker panicked");
    }

    // force the next fly scan to reload its metadata configuration
    instrument.terms.request_flyscan_reload()
}

/// Actions after a command list is run. This runs on every termination
/// path, leaving the shutter closed and the flags cleared no matter how
/// the list ended.
pub fn after_command_list(instrument: &Instrument) -> Result<(), SequencerError> {
    instrument.user_status.stamp_now()?;
    instrument.user_status.set_state(LIST_DONE_STATE)?;
    instrument.user_status.set_collection_in_progress(false)?;
    instrument.ti_filter_shutter.close()
}

/// Parse a command file and execute it.
pub fn run_command_file(
    instrument: &Instrument,
    path: &Path,
    md: &BTreeMap<String, String>,
) -> Result<ListOutcome, SequencerError> {
    let commands = crate::command_file::get_command_list(path)?;
    execute_command_list(instrument, path, &commands, md)
}

/// Execute an ordered command list with per-command fault isolation.
///
/// Commands run strictly in list order. A failing command is retried up to
/// the configured attempt budget, each failure producing one operator
/// notification with full context; once the budget is exhausted the rest of
/// the list is abandoned. The operator abort signal stops the list cleanly
/// with no failure notification. The after-list procedure runs regardless.
pub fn execute_command_list(
    instrument: &Instrument,
    source: &Path,
    commands: &[Command],
    md: &BTreeMap<String, String>,
) -> Result<ListOutcome, SequencerError> {
    if commands.is_empty() {
        info!("empty command list: {}", source.display());
        return Ok(ListOutcome::Completed { executed: 0 });
    }

    info!(
        "Command file: {}\n{}",
        source.display(),
        command_list_as_table(commands)
    );

    let reporter = ProgressReporter::start();
    reporter.send(ProgressEvent::ListStarted {
        source: source.display().to_string(),
        total: commands.len(),
    });

    let result = run_list(instrument, source, commands, md, &reporter);

    // hardware must end in a safe state on every path
    let after = after_command_list(instrument);

    if let Ok(outcome) = &result {
        reporter.send(ProgressEvent::ListFinished {
            outcome: outcome.describe(),
        });
    }
    reporter.finish();

    let outcome = result?;
    after?;
    Ok(outcome)
}

fn run_list(
    instrument: &Instrument,
    source: &Path,
    commands: &[Command],
    md: &BTreeMap<String, String>,
    reporter: &ProgressReporter,
) -> Result<ListOutcome, SequencerError> {
    before_command_list(instrument, commands)?;

    let maximum_attempts = instrument.config.collection.maximum_attempts.max(1);
    let mut executed = 0usize;

    for command in commands {
        if instrument.abort_requested() {
            info!("operator abort: stopping before line {}", command.line_number);
            return Ok(ListOutcome::Aborted { line: None });
        }
        info!("file line {}: {}", command.line_number, command.raw);
        let metadata = CommandMetadata::new(source, command, md);
        reporter.send(ProgressEvent::CommandStarted {
            line: command.line_number,
            action: command.action.name().to_string(),
        });

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match dispatch(instrument, command) {
                Ok(()) => {
                    executed += 1;
                    record_attempt(instrument, &metadata, command, attempt, "ok");
                    reporter.send(ProgressEvent::CommandFinished {
                        line: command.line_number,
                        outcome: "ok".to_string(),
                    });
                    break;
                }
                Err(e) if e.is_abort() => {
                    record_attempt(instrument, &metadata, command, attempt, "aborted");
                    reporter.send(ProgressEvent::CommandFinished {
                        line: command.line_number,
                        outcome: "aborted".to_string(),
                    });
                    return Ok(ListOutcome::Aborted {
                        line: Some(command.line_number),
                    });
                }
                Err(e) => {
                    notify_failure(instrument, &metadata, command, attempt, maximum_attempts, &e);
                    record_attempt(instrument, &metadata, command, attempt, e.kind());
                    if attempt >= maximum_attempts {
                        reporter.send(ProgressEvent::CommandFinished {
                            line: command.line_number,
                            outcome: format!("failed: {}", e.kind()),
                        });
                        return Ok(ListOutcome::Failed {
                            line: command.line_number,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        "retrying line {} (attempt {} of {})",
                        command.line_number,
                        attempt + 1,
                        maximum_attempts
                    );
                }
            }
        }
    }
    Ok(ListOutcome::Completed { executed })
}

/// Resolve one command against the action vocabulary and run it.
///
/// Unrecognized actions are logged and skipped; the engine never aborts a
/// list merely because of a word it does not know. Every other failure is
/// wrapped with the command context, except the abort signal, which passes
/// through untouched.
fn dispatch(instrument: &Instrument, command: &Command) -> Result<(), SequencerError> {
    let wrap = |e: SequencerError| {
        if e.is_abort() {
            e
        } else {
            SequencerError::Dispatch {
                command: command.raw.clone(),
                line: command.line_number,
                source: Box::new(e),
            }
        }
    };
    let scan_args = |command: &Command| {
        parse_scan_args(&command.args).map_err(|reason| SequencerError::Parse {
            path: command.raw.clone(),
            reason,
        })
    };
    match &command.action {
        CommandAction::Scan(ScanKind::Usaxs) => {
            let args = scan_args(command).map_err(wrap)?;
            scans::usaxs_scan(instrument, &args).map_err(wrap)
        }
        CommandAction::Scan(ScanKind::Saxs) => {
            let args = scan_args(command).map_err(wrap)?;
            scans::saxs_scan(instrument, &args).map_err(wrap)
        }
        CommandAction::Scan(ScanKind::Waxs) => {
            let args = scan_args(command).map_err(wrap)?;
            scans::waxs_scan(instrument, &args).map_err(wrap)
        }
        CommandAction::ModeBlackFly => instrument
            .modes
            .transition_to(InstrumentMode::BlackFly)
            .map_err(wrap),
        CommandAction::ModeRadiography => instrument
            .modes
            .transition_to(InstrumentMode::Radiography)
            .map_err(wrap),
        CommandAction::ModeSaxs => instrument
            .modes
            .transition_to(InstrumentMode::Saxs)
            .map_err(wrap),
        CommandAction::ModeUsaxs => instrument
            .modes
            .transition_to(InstrumentMode::Usaxs)
            .map_err(wrap),
        CommandAction::ModeWaxs => instrument
            .modes
            .transition_to(InstrumentMode::Waxs)
            .map_err(wrap),
        CommandAction::RotatorOff => instrument.rotator.stop().map_err(wrap),
        CommandAction::RotatorForward => instrument.rotator.start_forward().map_err(wrap),
        CommandAction::RotatorReverse => instrument.rotator.start_reverse().map_err(wrap),
        CommandAction::PreUsaxsTune => scans::pre_usaxs_tune(instrument).map_err(wrap),
        CommandAction::RunScript => match command.args.first() {
            Some(name) => scans::run_script(instrument, name).map_err(wrap),
            None => Err(wrap(SequencerError::Parse {
                path: command.raw.clone(),
                reason: "run needs a script name".to_string(),
            })),
        },
        CommandAction::Unrecognized(_) => {
            info!(
                "no handling for line {}: {}",
                command.line_number, command.raw
            );
            Ok(())
        }
    }
}

fn notify_failure(
    instrument: &Instrument,
    metadata: &CommandMetadata,
    command: &Command,
    attempt: usize,
    maximum_attempts: usize,
    e: &SequencerError,
) {
    let subject = format!(
        "{} during attempt {attempt} of {maximum_attempts} of command '{}'",
        e.kind(),
        command.raw
    );
    let mut body = format!(
        "subject: {subject}\n\
         \n\
         date: {}\n\
         command file: {}\n\
         line number: {}\n\
         command: {:?}\n\
         raw command: {}\n\
         attempt: {attempt} of {maximum_attempts}\n\
         exception: {e}\n",
        metadata.iso8601, metadata.full_filename, command.line_number, command, command.raw
    );
    if attempt >= maximum_attempts {
        body.push_str("Stopping further processing of this command list.\n");
    }
    error!("Exception {subject}\n{body}");
    instrument.notifier.send(&subject, &body);
}

fn record_attempt(
    instrument: &Instrument,
    metadata: &CommandMetadata,
    command: &Command,
    attempt: usize,
    outcome: &str,
) {
    instrument.journal_record(AttemptRecord {
        iso8601: metadata.iso8601.clone(),
        source_file: metadata.filename.clone(),
        line_number: command.line_number,
        action: command.action.name().to_string(),
        parameters: command.args.clone(),
        raw: command.raw.clone(),
        attempt,
        outcome: outcome.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_file::parse_text_command_file;
    use crate::config::AppConfig;
    use crate::control::{PvValue, SoftIoc};
    use crate::notify::MemoryNotifier;
    use crate::sim::simulated_instrument;
    use std::io::Write;
    use std::sync::Arc;

    fn write_list(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    fn sim_config() -> AppConfig {
        let mut config = AppConfig::for_simulation();
        // keep before-list cheap for engine-level tests
        config.collection.measure_dark_currents = false;
        config
    }

    fn archived_config(dir: &Path) -> AppConfig {
        let mut config = sim_config();
        config.archive.livedata_file = dir.join("commands.txt").display().to_string();
        config.archive.posterity_dir = dir.join("macros").display().to_string();
        config
    }

    fn rig(config: AppConfig) -> (crate::instrument::Instrument, Arc<SoftIoc>, Arc<MemoryNotifier>)
    {
        let notifier = Arc::new(MemoryNotifier::new());
        let (instrument, ioc) = simulated_instrument(config, notifier.clone()).unwrap();
        (instrument, ioc, notifier)
    }

    #[test]
    fn validation_batches_every_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, _ioc, _notifier) = rig(archived_config(dir.path()));
        let file = write_list(
            "FlyScan 0 0 0 ok\n\
             FlyScan 99 0 0 bad_x\n\
             mode_USAXS\n\
             # a comment\n\
             SAXS 0 -99 0 bad_y\n\
             WAXS nonsense 0 0 bad_parse\n",
        );
        let commands = parse_text_command_file(file.path()).unwrap();
        let err = verify_commands(&instrument, &commands).unwrap_err();
        match err {
            SequencerError::Validation(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].starts_with("line 2:"));
                assert!(errors[1].starts_with("line 5:"));
                assert!(errors[2].starts_with("line 6:"));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn end_to_end_list_runs_in_order_and_ends_on_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, ioc, notifier) = rig(archived_config(dir.path()));
        let file = write_list("USAXS 0 0 0 blank\n#comment\nSAXS 1 2 0.5 foo\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].line_number, 1);
        assert_eq!(commands[1].line_number, 3);

        let outcome =
            execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new()).unwrap();
        assert_eq!(outcome, ListOutcome::Completed { executed: 2 });

        // mode transitions happened in list order: USAXS then SAXS
        let mode_codes: Vec<i64> = ioc
            .puts_to(&instrument.terms.mode_address())
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        assert!(
            mode_codes
                .windows(2)
                .any(|w| w == [InstrumentMode::Usaxs.code(), InstrumentMode::Saxs.code()]),
            "expected USAXS then SAXS transitions, got {mode_codes:?}"
        );

        // the final status text is the exact sentinel
        assert_eq!(instrument.user_status.state().unwrap(), LIST_DONE_STATE);
        assert!(!instrument.user_status.collection_in_progress().unwrap());
        assert!(instrument.ti_filter_shutter.is_closed().unwrap());
        assert!(notifier.messages().is_empty());

        // the archive worker ran before the first command
        assert!(dir.path().join("commands.txt").exists());
    }

    #[test]
    fn first_failure_notifies_once_and_halts_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, ioc, notifier) = rig(archived_config(dir.path()));
        // the sample stage never reaches its setpoint: hardware fault
        struct Clamp {
            address: String,
        }
        impl crate::control::IocBehavior for Clamp {
            fn on_put(&self, ioc: &SoftIoc, address: &str, _value: &PvValue) {
                if address == self.address {
                    ioc.react(self.address.clone(), 5.0);
                }
            }
        }
        ioc.install(Arc::new(Clamp {
            address: instrument.stages.sample_x.address().to_string(),
        }));

        let file = write_list("FlyScan 1 0 0 will_fail\nmode_WAXS\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        let outcome =
            execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new()).unwrap();

        assert_eq!(
            outcome,
            ListOutcome::Failed {
                line: 1,
                attempts: 1
            }
        );
        // exactly one notification, with the exception class and context
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.contains("ActionDispatchError"));
        assert!(messages[0].0.contains("attempt 1 of 1"));
        assert!(messages[0].1.contains("line number: 1"));
        assert!(messages[0].1.contains("raw command: FlyScan 1 0 0 will_fail"));

        // the command after the failing one never ran
        let mode_codes: Vec<i64> = ioc
            .puts_to(&instrument.terms.mode_address())
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        assert!(!mode_codes.contains(&InstrumentMode::Waxs.code()));

        // the after-list procedure still ran
        assert_eq!(instrument.user_status.state().unwrap(), LIST_DONE_STATE);
    }

    #[test]
    fn attempt_budget_allows_true_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = archived_config(dir.path());
        config.collection.maximum_attempts = 3;
        let (instrument, ioc, notifier) = rig(config);
        struct Clamp {
            address: String,
        }
        impl crate::control::IocBehavior for Clamp {
            fn on_put(&self, ioc: &SoftIoc, address: &str, _value: &PvValue) {
                if address == self.address {
                    ioc.react(self.address.clone(), 5.0);
                }
            }
        }
        ioc.install(Arc::new(Clamp {
            address: instrument.stages.sample_x.address().to_string(),
        }));

        let file = write_list("FlyScan 1 0 0 still_fails\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        let outcome =
            execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new()).unwrap();
        assert_eq!(
            outcome,
            ListOutcome::Failed {
                line: 1,
                attempts: 3
            }
        );
        let messages = notifier.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].0.contains("attempt 1 of 3"));
        assert!(messages[2].0.contains("attempt 3 of 3"));
        assert!(messages[2].1.contains("Stopping further processing"));
        assert!(!messages[0].1.contains("Stopping further processing"));
    }

    #[test]
    fn operator_abort_stops_cleanly_without_notification() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, _ioc, notifier) = rig(archived_config(dir.path()));
        instrument.request_abort();
        let file = write_list("mode_USAXS\nmode_WAXS\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        let outcome =
            execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new()).unwrap();
        assert!(matches!(outcome, ListOutcome::Aborted { .. }));
        assert!(notifier.messages().is_empty());
        // the after-list procedure still ran
        assert_eq!(instrument.user_status.state().unwrap(), LIST_DONE_STATE);
    }

    #[test]
    fn unrecognized_actions_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, _ioc, notifier) = rig(archived_config(dir.path()));
        let file = write_list("make_coffee now\nmode_WAXS\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        let outcome =
            execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new()).unwrap();
        assert_eq!(outcome, ListOutcome::Completed { executed: 2 });
        assert!(notifier.messages().is_empty());
        assert_eq!(
            instrument.modes.current().unwrap(),
            InstrumentMode::Waxs
        );
    }

    #[test]
    fn validation_failure_prevents_any_motion() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, ioc, _notifier) = rig(archived_config(dir.path()));
        let file = write_list("FlyScan 99 0 0 beyond_limits\n");
        let commands = parse_text_command_file(file.path()).unwrap();
        let history_before = ioc.history().len();
        let result = execute_command_list(&instrument, file.path(), &commands, &BTreeMap::new());
        assert!(matches!(result, Err(SequencerError::Validation(_))));
        // no stage was commanded
        let motion: usize = instrument
            .stages
            .all()
            .iter()
            .map(|m| ioc.puts_to(m.address()).len())
            .sum();
        assert_eq!(motion, 0);
        assert!(ioc.history().len() >= history_before);
    }

    #[test]
    fn sync_order_numbers_picks_the_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let (instrument, _ioc, _notifier) = rig(archived_config(dir.path()));
        instrument.terms.set_flyscan_order_number(588).unwrap();
        instrument.terms.set_saxs_order_number(590).unwrap();
        instrument.terms.set_waxs_order_number(589).unwrap();
        sync_order_numbers(&instrument).unwrap();
        assert_eq!(instrument.terms.flyscan_order_number().unwrap(), 590);
        assert_eq!(instrument.terms.saxs_order_number().unwrap(), 590);
        assert_eq!(instrument.terms.waxs_order_number().unwrap(), 590);
    }
}
