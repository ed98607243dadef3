pub mod archive;
pub mod autorange;
pub mod command_file;
pub mod command_list;
pub mod config;
pub mod control;
pub mod devices;
pub mod error;
pub mod instrument;
pub mod journal;
pub mod modes;
pub mod notify;
pub mod poll;
pub mod progress;
pub mod scans;
pub mod sim;

pub use autorange::{GainCache, autoscale_amplifiers, measure_background};
pub use command_file::{
    Command, CommandAction, ScanKind, command_list_as_table, get_command_list,
    parse_table_command_file, parse_text_command_file, split_quoted_line,
};
pub use command_list::{
    LIST_DONE_STATE, ListOutcome, after_command_list, before_command_list, execute_command_list,
    run_command_file, sync_order_numbers, verify_commands,
};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use control::{ControlSystem, IocBehavior, PvValue, SoftIoc};
pub use devices::{
    AutorangeChannel, AutorangeMode, DetectorChannel, FemtoAmplifier, GainSpec, Motor, Rotator,
    Scaler, Shutter, Stages, Terms, UserStatus, group_by_scaler,
};
pub use error::SequencerError;
pub use instrument::Instrument;
pub use modes::{InstrumentMode, ModeController};
pub use notify::{LogNotifier, MemoryNotifier, Notifier, SpoolNotifier};
pub use scans::{ScanArgs, parse_scan_args};
pub use sim::simulated_instrument;
