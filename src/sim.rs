use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::config::AppConfig;
use crate::control::{ControlSystem, IocBehavior, PvValue, SoftIoc};
use crate::error::SequencerError;
use crate::instrument::Instrument;
use crate::modes::InstrumentMode;
use crate::notify::Notifier;

/// Gain table shared by all simulated amplifiers.
pub fn sim_gain_table() -> Vec<String> {
    ["1e4 V/A", "1e6 V/A", "1e8 V/A", "1e10 V/A", "1e12 V/A"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Counting-scaler stand-in.
///
/// When the count bit is raised it immediately produces a reading on every
/// registered channel, lets each autorange program follow its requested
/// gain, and completes the count. Per-channel rates can be replaced to
/// shape a scenario (saturation, beam loss).
pub struct SimCounting {
    count_address: String,
    /// (signal address, gain readback address, reqrange address)
    channels: Vec<(String, String, String)>,
    rates: RwLock<HashMap<String, f64>>,
    default_rate: f64,
}

impl SimCounting {
    pub fn new(count_address: String, channels: Vec<(String, String, String)>) -> Self {
        Self {
            count_address,
            channels,
            rates: RwLock::new(HashMap::new()),
            default_rate: 1.0e5,
        }
    }

    /// Override the rate one signal address reports on future counts.
    pub fn set_rate(&self, signal_address: &str, rate: f64) {
        self.rates.write().insert(signal_address.to_string(), rate);
    }
}

impl IocBehavior for SimCounting {
    fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue) {
        if address != self.count_address || value.as_i64() != Some(1) {
            return;
        }
        for (signal, gain, reqrange) in &self.channels {
            let requested = ioc.get_i64(reqrange).unwrap_or(0);
            ioc.react(gain.clone(), requested);
            let rate = self
                .rates
                .read()
                .get(signal)
                .copied()
                .unwrap_or(self.default_rate);
            ioc.react(signal.clone(), rate);
        }
        ioc.react(self.count_address.clone(), 0i64);
    }
}

/// Build an instrument wired to a seeded soft IOC.
///
/// This is what the CLI runs against when no beamline is attached, and what
/// the crate's own tests drive. The IOC handle is returned alongside so
/// callers can inspect the put journal or install extra behaviors.
pub fn simulated_instrument(
    config: AppConfig,
    notifier: Arc<dyn Notifier>,
) -> Result<(Instrument, Arc<SoftIoc>), SequencerError> {
    let ioc = Arc::new(SoftIoc::new());
    let instrument = Instrument::new(config, ioc.clone(), notifier)?;
    seed(&instrument, &ioc)?;
    Ok((instrument, ioc))
}

fn seed(instrument: &Instrument, ioc: &Arc<SoftIoc>) -> Result<(), SequencerError> {
    // shutters start closed, all positioners at zero
    for shutter in [
        &instrument.mono_shutter,
        &instrument.ti_filter_shutter,
        &instrument.ccd_shutter,
    ] {
        ioc.seed(shutter.address(), "close");
    }
    for motor in instrument.stages.all() {
        ioc.seed(motor.address(), 0.0);
    }

    // scaler idle, in auto-count display mode
    ioc.seed(instrument.scaler.count_address(), 0i64);
    ioc.seed(instrument.scaler.preset_address(), 1.0);
    ioc.seed(instrument.scaler.count_mode_address(), "AutoCount");

    // amplifier chains: gain tables, idle sequence programs, zero signals
    let channels = [
        &instrument.upd,
        &instrument.i0,
        &instrument.i00,
        &instrument.trd,
    ];
    let mut counting_channels = Vec::new();
    for channel in channels {
        ioc.set_enum_labels(channel.femto.gain_index_address(), sim_gain_table());
        ioc.set_enum_labels(channel.auto.reqrange_address(), sim_gain_table());
        ioc.seed(channel.femto.gain_index_address(), 0i64);
        ioc.seed(channel.auto.reqrange_address(), 0i64);
        ioc.seed(channel.auto.gain_address(), 0i64);
        ioc.seed(channel.auto.mode_address(), "manual");
        ioc.seed(channel.signal_address(), 0.0);
        for gain in 0..sim_gain_table().len() {
            ioc.seed(channel.auto.background_address(gain), 0.0);
            ioc.seed(channel.auto.background_error_address(gain), 0.0);
        }
        counting_channels.push((
            channel.signal_address().to_string(),
            channel.auto.gain_address(),
            channel.auto.reqrange_address(),
        ));
    }
    ioc.install(Arc::new(SimCounting::new(
        instrument.scaler.count_address().to_string(),
        counting_channels,
    )));

    // rotator parked
    ioc.seed(instrument.rotator.home_address(), "forward");
    ioc.seed(instrument.rotator.jog_forward_address(), 0i64);
    ioc.seed(instrument.rotator.jog_reverse_address(), 0i64);

    // session state
    let terms = &instrument.terms;
    instrument.user_status.set_state("idle")?;
    instrument.user_status.set_scanning(false)?;
    instrument.user_status.set_collection_in_progress(false)?;
    instrument.user_status.set_macro_file("")?;
    instrument.user_status.set_macro_file_time("")?;
    instrument.user_status.set_sample("", 0.0)?;
    instrument.user_status.stamp_now()?;

    // persisted configuration: start out of beam, nothing collecting
    terms.set_mode_code(InstrumentMode::OutOfBeam.code())?;
    terms.set_saxs_collecting(false)?;
    terms.set_waxs_collecting(false)?;
    terms.set_flyscan_order_number(0)?;
    terms.set_saxs_order_number(0)?;
    terms.set_waxs_order_number(0)?;
    terms.set_retune_needed(false)?;
    terms.set_num_scans_last_tune(0)?;
    terms.set_epoch_last_tune(0.0)?;
    terms.set_run_tune_on_qdo(false)?;
    terms.set_usaxs_minstep(2.0e-5)?;
    terms.set_tune_width_mr(0.005)?;
    terms.set_tune_width_ar(0.0018)?;
    terms.set_mono_energy(12.0)?;
    terms.set_scan_filters(2, 0)?;

    // slit aperture targets
    terms.set_saxs_h_size(0.8)?;
    terms.set_saxs_v_size(0.2)?;
    terms.set_guard_h_size(0.95)?;
    terms.set_guard_v_size(0.35)?;

    // subsystem insert/park positions
    terms.set_stage_target("USAXS_Pin:waxs_x_in", 0.0)?;
    terms.set_stage_target("USAXS_Pin:waxs_x_out", 12.0)?;
    terms.set_stage_target("USAXS_Pin:Pin_y_in", 9.0)?;
    terms.set_stage_target("USAXS_Pin:Pin_y_out", -5.0)?;
    terms.set_stage_target("USAXS_Pin:Pin_z_in", 5.0)?;
    terms.set_stage_target("USAXS_Pin:Pin_z_out", 0.0)?;
    terms.set_stage_target("USAXS_Pin:ax_in", 8.0)?;
    terms.set_stage_target("USAXS_Pin:ax_out", -8.0)?;
    terms.set_stage_target("USAXS_Pin:dx_out", 50.0)?;
    terms.set_stage_target("USAXS:Diode_dx", 8.0)?;

    // collaborator endpoints touched by plans
    ioc.seed(format!("{}DCM:feedback:on", instrument.config.epics.prefix), 0i64);
    ioc.seed(format!("{}pf4:fPosA", instrument.config.epics.prefix), 0i64);
    ioc.seed(format!("{}pf4:fPosB", instrument.config.epics.prefix), 0i64);
    ioc.seed(format!("{}AShtr:Enable", instrument.config.epics.prefix), 0i64);
    ioc.seed(
        format!("{}USAXSfly:reloadConfig", instrument.config.epics.prefix),
        0i64,
    );

    Ok(())
}
