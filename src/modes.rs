use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::control::{ControlSystem, PvValue};
use crate::devices::scaler::Scaler;
use crate::devices::shutter::Shutter;
use crate::devices::stages::Stages;
use crate::devices::terms::Terms;
use crate::devices::user_status::UserStatus;
use crate::error::SequencerError;

/// Guard slit apertures may sit this far from target without a move.
const GUARD_SLIT_TOLERANCE: f64 = 0.03;
/// Beam-defining slit apertures get a tighter gate.
const BEAM_SLIT_TOLERANCE: f64 = 0.02;

/// Physical configuration of the instrument: which subsystem occupies the
/// beam path. Exactly one mode is current at any time; the canonical code is
/// persisted in the configuration store and read back at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentMode {
    Unknown,
    OutOfBeam,
    Usaxs,
    Saxs,
    Waxs,
    Radiography,
    Imaging,
    BlackFly,
    SbUsaxs,
}

impl InstrumentMode {
    pub fn code(self) -> i64 {
        match self {
            InstrumentMode::Unknown => 0,
            InstrumentMode::OutOfBeam => 1,
            InstrumentMode::Usaxs => 2,
            InstrumentMode::Saxs => 3,
            InstrumentMode::Waxs => 4,
            InstrumentMode::Radiography => 5,
            InstrumentMode::Imaging => 6,
            InstrumentMode::BlackFly => 7,
            InstrumentMode::SbUsaxs => 8,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => InstrumentMode::OutOfBeam,
            2 => InstrumentMode::Usaxs,
            3 => InstrumentMode::Saxs,
            4 => InstrumentMode::Waxs,
            5 => InstrumentMode::Radiography,
            6 => InstrumentMode::Imaging,
            7 => InstrumentMode::BlackFly,
            8 => InstrumentMode::SbUsaxs,
            _ => InstrumentMode::Unknown,
        }
    }

    /// Display text of the mode readback.
    pub fn readback(self) -> &'static str {
        match self {
            InstrumentMode::Unknown => "unknown",
            InstrumentMode::OutOfBeam => "out of beam",
            InstrumentMode::Usaxs => "USAXS in beam",
            InstrumentMode::Saxs => "SAXS in beam",
            InstrumentMode::Waxs => "WAXS in beam",
            InstrumentMode::Radiography => "radiography",
            InstrumentMode::Imaging => "imaging",
            InstrumentMode::BlackFly => "blackfly",
            InstrumentMode::SbUsaxs => "side-bounce USAXS",
        }
    }

    /// Short label used in status texts ("USAXS Mode" and so on).
    pub fn label(self) -> &'static str {
        match self {
            InstrumentMode::Unknown => "Unknown",
            InstrumentMode::OutOfBeam => "OpenBeamPath",
            InstrumentMode::Usaxs => "USAXS",
            InstrumentMode::Saxs => "SAXS",
            InstrumentMode::Waxs => "WAXS",
            InstrumentMode::Radiography => "Radiography",
            InstrumentMode::Imaging => "Imaging",
            InstrumentMode::BlackFly => "BlackFly",
            InstrumentMode::SbUsaxs => "SBUSAXS",
        }
    }
}

/// Settling pauses after slit moves. The beam-defining slit motors are slow
/// and show backlash, so they get the longer pause.
#[derive(Clone)]
pub struct ModeSettling {
    pub guard_slits: Duration,
    pub beam_slits: Duration,
}

impl Default for ModeSettling {
    fn default() -> Self {
        Self {
            guard_slits: Duration::from_millis(500),
            beam_slits: Duration::from_secs(2),
        }
    }
}

/// Guarded transitions between instrument configurations.
///
/// A transition closes both dynamic shutters first, retracts whatever is in
/// the beam path before inserting the target subsystem (WAXS and SAXS must
/// clear out before USAXS components move, or they collide), and is only
/// complete once the persisted mode code and the slit apertures agree with
/// the target. Transitions are idempotent: reaching the current mode again
/// skips the motion but still runs the post-condition checks and records
/// the completion status.
///
/// Endpoint failures during a transition propagate; any retry belongs to
/// the caller.
#[derive(Clone)]
pub struct ModeController {
    terms: Terms,
    user_status: UserStatus,
    ti_filter_shutter: Shutter,
    ccd_shutter: Shutter,
    stages: Stages,
    scaler: Scaler,
    mono_feedback_address: String,
    filter_al_address: String,
    filter_ti_address: String,
    settling: ModeSettling,
    control: Arc<dyn ControlSystem>,
}

impl ModeController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        terms: Terms,
        user_status: UserStatus,
        ti_filter_shutter: Shutter,
        ccd_shutter: Shutter,
        stages: Stages,
        scaler: Scaler,
        mono_feedback_address: String,
        filter_al_address: String,
        filter_ti_address: String,
        settling: ModeSettling,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            terms,
            user_status,
            ti_filter_shutter,
            ccd_shutter,
            stages,
            scaler,
            mono_feedback_address,
            filter_al_address,
            filter_ti_address,
            settling,
            control,
        }
    }

    pub fn current(&self) -> Result<InstrumentMode, SequencerError> {
        Ok(InstrumentMode::from_code(self.terms.mode_code()?))
    }

    pub fn transition_to(&self, target: InstrumentMode) -> Result<(), SequencerError> {
        if target == InstrumentMode::Unknown {
            return Err(SequencerError::ControlSystem(
                "cannot transition to the unknown mode".into(),
            ));
        }
        let label = target.label();
        self.user_status
            .set_state(&format!("Moving to {label} mode"))?;
        self.ccd_shutter.close()?;
        self.ti_filter_shutter.close()?;

        if target == InstrumentMode::Usaxs {
            self.dcm_feedback_on()?;
        }

        let current = self.current()?;
        let mut moved = false;
        if current == target {
            debug!("{} is already in the beam path", label);
        } else {
            info!("found instrument mode: {}", current.readback());
            info!("moving to proper {label} mode");
            match target {
                InstrumentMode::Usaxs => {
                    self.move_waxs_out()?;
                    self.move_saxs_out()?;
                    self.move_usaxs_in()?;
                }
                InstrumentMode::Saxs => {
                    self.move_waxs_out()?;
                    self.move_usaxs_out()?;
                    self.move_saxs_in()?;
                }
                InstrumentMode::Waxs => {
                    self.move_saxs_out()?;
                    self.move_usaxs_out()?;
                    self.move_waxs_in()?;
                }
                InstrumentMode::OutOfBeam
                | InstrumentMode::Radiography
                | InstrumentMode::Imaging
                | InstrumentMode::BlackFly => {
                    self.move_saxs_out()?;
                    self.move_waxs_out()?;
                    self.move_usaxs_out()?;
                }
                InstrumentMode::SbUsaxs => {
                    warn!("no motion choreography defined for side-bounce USAXS");
                }
                InstrumentMode::Unknown => unreachable!(),
            }
            self.terms.set_mode_code(target.code())?;
            moved = true;
        }

        match target {
            InstrumentMode::Usaxs => {
                info!("Preparing for USAXS mode ... please wait ...");
                self.scaler.set_count_mode("AutoCount")?;
                // park the transmission diode
                self.stages.usaxs_dx.move_to(self.terms.diode_dx()?)?;
                if !self.ccd_shutter.is_closed()? {
                    warn!("CCD shutter failed to close");
                } else {
                    self.insert_scan_filters()?;
                    self.ccd_shutter.close()?;
                }
            }
            InstrumentMode::Saxs | InstrumentMode::Waxs => self.confirm_slits()?,
            _ => {}
        }

        info!("Prepared for {label} mode");
        self.user_status.set_state(&format!("{label} Mode"))?;
        let ts = self.user_status.stamp_now()?;
        self.user_status.set_macro_file_time(&ts)?;
        self.user_status.set_scanning(false)?;

        if target == InstrumentMode::Usaxs && moved {
            // the optics need a retune after the stages moved; the next scan
            // cycle consumes this flag, tuning is not done here
            self.terms.set_retune_needed(true)?;
        }
        Ok(())
    }

    fn dcm_feedback_on(&self) -> Result<(), SequencerError> {
        self.control.put(&self.mono_feedback_address, PvValue::I64(1))
    }

    fn insert_scan_filters(&self) -> Result<(), SequencerError> {
        self.control.put(
            &self.filter_al_address,
            PvValue::I64(self.terms.scan_filter_al()?),
        )?;
        self.control.put(
            &self.filter_ti_address,
            PvValue::I64(self.terms.scan_filter_ti()?),
        )
    }

    fn move_waxs_out(&self) -> Result<(), SequencerError> {
        self.stages.waxs_x.move_to(self.terms.waxs_x_out()?)
    }

    fn move_waxs_in(&self) -> Result<(), SequencerError> {
        self.stages.waxs_x.move_to(self.terms.waxs_x_in()?)
    }

    fn move_saxs_out(&self) -> Result<(), SequencerError> {
        // retract the pinhole before dropping the z stage
        self.stages.pin_y.move_to(self.terms.pin_y_out()?)?;
        self.stages.pin_z.move_to(self.terms.pin_z_out()?)
    }

    fn move_saxs_in(&self) -> Result<(), SequencerError> {
        // z stage first, then the pinhole
        self.stages.pin_z.move_to(self.terms.pin_z_in()?)?;
        self.stages.pin_y.move_to(self.terms.pin_y_in()?)
    }

    fn move_usaxs_out(&self) -> Result<(), SequencerError> {
        self.stages.usaxs_ax.move_to(self.terms.ax_out()?)?;
        self.stages.usaxs_dx.move_to(self.terms.dx_out()?)
    }

    fn move_usaxs_in(&self) -> Result<(), SequencerError> {
        self.stages.usaxs_ax.move_to(self.terms.ax_in()?)?;
        self.stages.usaxs_dx.move_to(self.terms.diode_dx()?)
    }

    /// Bring the slit apertures to their configured targets, skipping the
    /// physically slow moves entirely when already within tolerance.
    fn confirm_slits(&self) -> Result<(), SequencerError> {
        let guard_h_diff = (self.stages.guard_h.position()? - self.terms.guard_h_size()?).abs();
        let guard_v_diff = (self.stages.guard_v.position()? - self.terms.guard_v_size()?).abs();
        debug!("guard slits horizontal difference = {guard_h_diff}");
        debug!("guard slits vertical difference = {guard_v_diff}");
        if guard_h_diff.max(guard_v_diff) > GUARD_SLIT_TOLERANCE {
            info!("changing guard slits");
            self.stages.guard_h.move_to(self.terms.guard_h_size()?)?;
            self.stages.guard_v.move_to(self.terms.guard_v_size()?)?;
            std::thread::sleep(self.settling.guard_slits);
        }

        let h_diff = (self.stages.slit_h.position()? - self.terms.saxs_h_size()?).abs();
        let v_diff = (self.stages.slit_v.position()? - self.terms.saxs_v_size()?).abs();
        debug!("beam-defining slits horizontal difference = {h_diff}");
        debug!("beam-defining slits vertical difference = {v_diff}");
        if h_diff.max(v_diff) > BEAM_SLIT_TOLERANCE {
            info!("moving beam-defining slits");
            self.stages.slit_h.move_to(self.terms.saxs_h_size()?)?;
            self.stages.slit_v.move_to(self.terms.saxs_v_size()?)?;
            // wait out the backlash, these motors lag their readback
            std::thread::sleep(self.settling.beam_slits);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::sim::simulated_instrument;

    #[test]
    fn codes_round_trip() {
        for mode in [
            InstrumentMode::OutOfBeam,
            InstrumentMode::Usaxs,
            InstrumentMode::Saxs,
            InstrumentMode::Waxs,
            InstrumentMode::Radiography,
            InstrumentMode::Imaging,
            InstrumentMode::BlackFly,
            InstrumentMode::SbUsaxs,
        ] {
            assert_eq!(InstrumentMode::from_code(mode.code()), mode);
        }
        assert_eq!(InstrumentMode::from_code(99), InstrumentMode::Unknown);
    }

    #[test]
    fn transition_moves_subsystems_and_records_completion() {
        let (instrument, ioc) = simulated_instrument(
            crate::config::AppConfig::for_simulation(),
            Arc::new(MemoryNotifier::new()),
        )
        .unwrap();
        instrument.modes.transition_to(InstrumentMode::Waxs).unwrap();
        assert_eq!(
            instrument.modes.current().unwrap(),
            InstrumentMode::Waxs
        );
        assert_eq!(instrument.user_status.state().unwrap(), "WAXS Mode");
        // WAXS stage was inserted
        let waxs_moves = ioc.puts_to(instrument.stages.waxs_x.address());
        assert_eq!(waxs_moves.len(), 1);
    }

    #[test]
    fn repeated_transition_skips_motion_but_repeats_postconditions() {
        let (instrument, ioc) = simulated_instrument(
            crate::config::AppConfig::for_simulation(),
            Arc::new(MemoryNotifier::new()),
        )
        .unwrap();
        instrument.modes.transition_to(InstrumentMode::Waxs).unwrap();
        let moves_after_first = ioc.puts_to(instrument.stages.waxs_x.address()).len();
        let slit_moves_after_first = ioc.puts_to(instrument.stages.slit_h.address()).len();
        assert_eq!(moves_after_first, 1);
        assert_eq!(slit_moves_after_first, 1);

        instrument.modes.transition_to(InstrumentMode::Waxs).unwrap();
        // no new stage motion, no new slit motion (within tolerance now)
        assert_eq!(
            ioc.puts_to(instrument.stages.waxs_x.address()).len(),
            moves_after_first
        );
        assert_eq!(
            ioc.puts_to(instrument.stages.slit_h.address()).len(),
            slit_moves_after_first
        );
        // the completion status is still re-recorded
        assert_eq!(instrument.user_status.state().unwrap(), "WAXS Mode");
    }

    #[test]
    fn usaxs_transition_flags_retune_only_when_motion_occurred() {
        let (instrument, _ioc) = simulated_instrument(
            crate::config::AppConfig::for_simulation(),
            Arc::new(MemoryNotifier::new()),
        )
        .unwrap();
        instrument.terms.set_retune_needed(false).unwrap();
        instrument
            .modes
            .transition_to(InstrumentMode::Usaxs)
            .unwrap();
        assert!(instrument.terms.retune_needed().unwrap());

        instrument.terms.set_retune_needed(false).unwrap();
        instrument
            .modes
            .transition_to(InstrumentMode::Usaxs)
            .unwrap();
        // idempotent repeat: no motion, no retune request
        assert!(!instrument.terms.retune_needed().unwrap());
    }

    #[test]
    fn waxs_and_saxs_retract_before_usaxs_moves() {
        let (instrument, ioc) = simulated_instrument(
            crate::config::AppConfig::for_simulation(),
            Arc::new(MemoryNotifier::new()),
        )
        .unwrap();
        instrument
            .modes
            .transition_to(InstrumentMode::Usaxs)
            .unwrap();
        let history = ioc.history();
        let position = |address: &str| {
            history
                .iter()
                .position(|(a, _)| a == address)
                .unwrap_or(usize::MAX)
        };
        let waxs_out = position(instrument.stages.waxs_x.address());
        let saxs_out = position(instrument.stages.pin_y.address());
        let usaxs_in = position(instrument.stages.usaxs_ax.address());
        assert!(waxs_out < usaxs_in);
        assert!(saxs_out < usaxs_in);
    }
}
