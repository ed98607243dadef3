use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use crate::devices::motor::Motor;
use crate::error::SequencerError;
use crate::instrument::Instrument;
use crate::modes::InstrumentMode;

/// Arguments common to every scan action: sample position, thickness and
/// the sample name used in titles and file names.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanArgs {
    pub x: f64,
    pub y: f64,
    pub thickness: f64,
    pub name: String,
}

/// Parse the 4 positional scan arguments.
///
/// The same routine backs both the pre-flight validation and the dispatch
/// path, so the parsing rules cannot drift apart between the two stages.
pub fn parse_scan_args(args: &[String]) -> Result<ScanArgs, String> {
    if args.len() != 4 {
        return Err(format!(
            "expected 4 arguments (sx sy thickness name), got {}",
            args.len()
        ));
    }
    let x: f64 = args[0]
        .parse()
        .map_err(|_| format!("sx is not a number: '{}'", args[0]))?;
    let y: f64 = args[1]
        .parse()
        .map_err(|_| format!("sy is not a number: '{}'", args[1]))?;
    let thickness: f64 = args[2]
        .parse()
        .map_err(|_| format!("thickness is not a number: '{}'", args[2]))?;
    Ok(ScanArgs {
        x,
        y,
        thickness,
        name: args[3].clone(),
    })
}

/// Clean-stop check consumed between scans and before hardware motion.
pub fn stop_if_requested(instrument: &Instrument) -> Result<(), SequencerError> {
    if instrument.abort_requested() {
        info!("stopping: operator abort requested");
        return Err(SequencerError::Abort);
    }
    Ok(())
}

/// Actions before every data collection plan: consume the retune-needed
/// flag (tuning at the previous sample position, before the new sample is
/// exposed) and enable the automatic shutter.
pub fn before_plan(instrument: &Instrument) -> Result<(), SequencerError> {
    if instrument.terms.retune_needed()? {
        if instrument.modes.current()? == InstrumentMode::Usaxs {
            pre_usaxs_tune(instrument)?;
        } else {
            pre_swaxs_tune(instrument)?;
        }
    }
    instrument.terms.enable_auto_open()
}

/// Actions after every data collection plan.
pub fn after_plan(instrument: &Instrument, weight: i64) -> Result<(), SequencerError> {
    let n = instrument.terms.num_scans_last_tune()?;
    instrument.terms.set_num_scans_last_tune(n + weight)
}

/// USAXS fly scan of one sample.
pub fn usaxs_scan(instrument: &Instrument, args: &ScanArgs) -> Result<(), SequencerError> {
    stop_if_requested(instrument)?;
    instrument.modes.transition_to(InstrumentMode::Usaxs)?;
    before_plan(instrument)?;

    instrument.stages.sample_x.move_to(args.x)?;
    instrument.stages.sample_y.move_to(args.y)?;
    instrument.user_status.set_sample(&args.name, args.thickness)?;
    instrument
        .user_status
        .set_state(&format!("USAXS scan: {}", args.name))?;

    instrument.autoscale(&instrument.usaxs_channels(), Some(&instrument.ti_filter_shutter))?;

    instrument.user_status.set_scanning(true)?;
    let acquire = Duration::from_secs_f64(instrument.config.collection.acquire_time_s);
    let result = instrument.scaler.count(acquire);
    instrument.user_status.set_scanning(false)?;
    result?;

    let order = instrument.terms.flyscan_order_number()?;
    instrument.terms.set_flyscan_order_number(order + 1)?;
    instrument.ti_filter_shutter.close()?;
    after_plan(instrument, 1)
}

/// Pinhole SAXS exposure of one sample.
pub fn saxs_scan(instrument: &Instrument, args: &ScanArgs) -> Result<(), SequencerError> {
    stop_if_requested(instrument)?;
    instrument.modes.transition_to(InstrumentMode::Saxs)?;
    before_plan(instrument)?;

    instrument.stages.sample_x.move_to(args.x)?;
    instrument.stages.sample_y.move_to(args.y)?;
    instrument.user_status.set_sample(&args.name, args.thickness)?;
    instrument
        .user_status
        .set_state(&format!("SAXS collection: {}", args.name))?;

    instrument.autoscale(&instrument.usaxs_channels(), Some(&instrument.ti_filter_shutter))?;

    instrument.terms.set_saxs_collecting(true)?;
    let acquire = Duration::from_secs_f64(instrument.config.collection.acquire_time_s);
    let result = instrument.scaler.count(acquire);
    instrument.terms.set_saxs_collecting(false)?;
    result?;

    let order = instrument.terms.saxs_order_number()?;
    instrument.terms.set_saxs_order_number(order + 1)?;
    instrument.ti_filter_shutter.close()?;
    after_plan(instrument, 1)
}

/// WAXS exposure of one sample.
pub fn waxs_scan(instrument: &Instrument, args: &ScanArgs) -> Result<(), SequencerError> {
    stop_if_requested(instrument)?;
    instrument.modes.transition_to(InstrumentMode::Waxs)?;
    before_plan(instrument)?;

    instrument.stages.sample_x.move_to(args.x)?;
    instrument.stages.sample_y.move_to(args.y)?;
    instrument.user_status.set_sample(&args.name, args.thickness)?;
    instrument
        .user_status
        .set_state(&format!("WAXS collection: {}", args.name))?;

    instrument.autoscale(&instrument.usaxs_channels(), Some(&instrument.ti_filter_shutter))?;

    instrument.terms.set_waxs_collecting(true)?;
    let acquire = Duration::from_secs_f64(instrument.config.collection.acquire_time_s);
    let result = instrument.scaler.count(acquire);
    instrument.terms.set_waxs_collecting(false)?;
    result?;

    let order = instrument.terms.waxs_order_number()?;
    instrument.terms.set_waxs_order_number(order + 1)?;
    instrument.ti_filter_shutter.close()?;
    after_plan(instrument, 1)
}

/// Tune widths for the optics axes, derived from the monochromator energy.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneRanges {
    pub mr: f64,
    pub ar: f64,
    pub minstep: f64,
}

/// Recompute the tune widths for the current crystal set and energy.
///
/// The bands match the instrument's Si 220/440 configurations; at the top
/// energy the crystal set is told apart by the mr position. The user
/// override, when configured, wins over the derived minimum step.
pub fn default_tune_ranges(instrument: &Instrument) -> Result<TuneRanges, SequencerError> {
    let energy = instrument.terms.mono_energy()?;
    let (ar, minstep) = if energy < 10.99 {
        (0.003, 0.000045)
    } else if energy < 12.99 {
        (0.0025, 0.000035)
    } else if energy < 18.1 {
        (0.0022, 0.000025)
    } else if energy < 20.8 {
        (0.002, 0.000025)
    } else if instrument.stages.mr.position()? >= 11.0 {
        // Si 440 crystals
        (0.0006, 0.000006)
    } else {
        // Si 220 crystals
        (0.0018, 0.00002)
    };
    let minstep = instrument.config.tuning.usaxs_minstep.unwrap_or(minstep);
    info!("setting USAXS minstep to {minstep}");
    instrument.terms.set_usaxs_minstep(minstep)?;
    Ok(TuneRanges {
        mr: 0.005,
        ar,
        minstep,
    })
}

/// Push the computed tune widths to their beamline records.
pub fn update_tuning_widths(
    instrument: &Instrument,
    ranges: &TuneRanges,
) -> Result<(), SequencerError> {
    instrument.terms.set_tune_width_mr(ranges.mr)?;
    instrument.terms.set_tune_width_ar(ranges.ar)
}

/// Step one axis across `width` and center it on the detector peak.
///
/// The axis returns to its starting position when no usable peak shows up,
/// so a failed tune never strands the optics.
pub fn tune_axis(instrument: &Instrument, axis: &Motor, width: f64) -> Result<(), SequencerError> {
    stop_if_requested(instrument)?;
    info!("tuning axis: {}", axis.name());
    let start = axis.position()?;

    instrument.mono_shutter.open()?;
    instrument.ti_filter_shutter.open()?;
    instrument.autoscale(&instrument.tuning_channels(), None)?;

    let points = instrument.config.tuning.tune_points.max(3);
    let count_time = Duration::from_secs_f64(instrument.config.tuning.tune_count_time_s);
    let step = width / (points - 1) as f64;
    let mut best = (start, f64::NEG_INFINITY);
    let mut edges = f64::NEG_INFINITY;
    for k in 0..points {
        let position = start - width / 2.0 + step * k as f64;
        axis.move_to(position)?;
        instrument.scaler.count(count_time)?;
        let reading = instrument.upd.reading()?;
        if reading > best.1 {
            best = (position, reading);
        }
        if k == 0 || k == points - 1 {
            edges = edges.max(reading);
        }
    }

    // a real peak clearly tops the scan edges
    let peak_detected = best.1 > 0.0 && best.1 > 2.0 * edges.max(0.0);
    if peak_detected {
        info!(
            "axis {}: peak {} at {}, moving there",
            axis.name(),
            best.1,
            best.0
        );
        axis.move_to(best.0)?;
    } else {
        warn!(
            "axis {}: no peak detected, returning to start position {}",
            axis.name(),
            start
        );
        axis.move_to(start)?;
    }

    instrument.ti_filter_shutter.close()?;
    instrument.scaler.set_count_mode("AutoCount")?;
    Ok(())
}

/// Tune the USAXS optics and reset the tune bookkeeping.
pub fn pre_usaxs_tune(instrument: &Instrument) -> Result<(), SequencerError> {
    instrument.modes.transition_to(InstrumentMode::Usaxs)?;
    // the transition itself may have raised the flag we are about to clear
    instrument.terms.set_retune_needed(false)?;
    let ranges = default_tune_ranges(instrument)?;
    tune_axis(instrument, &instrument.stages.mr, ranges.mr)?;
    tune_axis(instrument, &instrument.stages.ar, ranges.ar)?;
    instrument.terms.set_num_scans_last_tune(0)?;
    instrument.terms.set_epoch_last_tune(epoch_seconds())?;
    Ok(())
}

/// Reduced tune used before SAXS/WAXS collections.
pub fn pre_swaxs_tune(instrument: &Instrument) -> Result<(), SequencerError> {
    instrument.terms.set_retune_needed(false)?;
    let ranges = default_tune_ranges(instrument)?;
    tune_axis(instrument, &instrument.stages.mr, ranges.mr)?;
    instrument.terms.set_epoch_last_tune(epoch_seconds())?;
    Ok(())
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Run an external script by name.
///
/// The name is resolved against the working directory and the configured
/// search paths; a missing file is reported but is not a fault, matching
/// how operator macros have always behaved.
pub fn run_script(instrument: &Instrument, name: &str) -> Result<(), SequencerError> {
    let mut candidates = vec![PathBuf::from(name)];
    for root in &instrument.config.scripts.search_paths {
        candidates.push(PathBuf::from(root).join(name));
    }
    for candidate in candidates {
        if candidate.exists() {
            info!("running script: {}", candidate.display());
            let status = std::process::Command::new(&instrument.config.scripts.interpreter)
                .arg(&candidate)
                .status()
                .map_err(|e| {
                    SequencerError::io(e, format!("spawning {}", candidate.display()))
                })?;
            if !status.success() {
                warn!("script {} exited with {status}", candidate.display());
            }
            return Ok(());
        }
    }
    error!("could not find script '{name}'");
    if !name.ends_with(".py") {
        warn!("did you forget the '.py' suffix on '{name}'?");
    }
    Ok(())
}
