use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use log::error;
use parking_lot::Mutex;

use crate::archive::ArchiveTargets;
use crate::autorange::{self, GainCache};
use crate::config::AppConfig;
use crate::control::ControlSystem;
use crate::devices::{
    AutorangeChannel, DetectorChannel, FemtoAmplifier, Motor, Rotator, Scaler, Shutter, Stages,
    Terms, UserStatus,
};
use crate::error::SequencerError;
use crate::journal::{AttemptJournal, AttemptRecord};
use crate::modes::{ModeController, ModeSettling};
use crate::notify::Notifier;

/// Everything the sequencing layer needs, wired once at startup and passed
/// by reference. There is no ambient global state: the gain cache, the
/// abort flag and the journal all live here.
pub struct Instrument {
    pub config: AppConfig,
    pub control: Arc<dyn ControlSystem>,
    pub mono_shutter: Shutter,
    pub ti_filter_shutter: Shutter,
    pub ccd_shutter: Shutter,
    pub stages: Stages,
    pub scaler: Scaler,
    pub upd: DetectorChannel,
    pub i0: DetectorChannel,
    pub i00: DetectorChannel,
    pub trd: DetectorChannel,
    pub terms: Terms,
    pub user_status: UserStatus,
    pub rotator: Rotator,
    pub modes: ModeController,
    pub notifier: Arc<dyn Notifier>,
    gain_cache: Mutex<GainCache>,
    journal: Option<Mutex<AttemptJournal>>,
    abort: Arc<AtomicBool>,
}

impl Instrument {
    pub fn new(
        config: AppConfig,
        control: Arc<dyn ControlSystem>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SequencerError> {
        let p = config.epics.prefix.clone();
        let addr = |suffix: &str| format!("{p}{suffix}");
        let tolerance = config.stages.motor_tolerance;
        let move_timeout = Duration::from_secs_f64(config.stages.move_timeout_s);
        let motor = |name: &str, suffix: &str| {
            Motor::new(name, addr(suffix), control.clone())
                .with_tolerance(tolerance)
                .with_move_timeout(move_timeout)
        };

        let stages = Stages {
            sample_x: motor("sx", "s_stage:x").with_limits(
                config.stages.sample_x_limits[0],
                config.stages.sample_x_limits[1],
            ),
            sample_y: motor("sy", "s_stage:y").with_limits(
                config.stages.sample_y_limits[0],
                config.stages.sample_y_limits[1],
            ),
            waxs_x: motor("waxs_x", "waxs_stage:x"),
            pin_y: motor("pin_y", "saxs_stage:y"),
            pin_z: motor("pin_z", "saxs_stage:z"),
            usaxs_ax: motor("ax", "a_stage:x"),
            usaxs_dx: motor("dx", "d_stage:x"),
            mr: motor("mr", "m_stage:r"),
            ar: motor("ar", "a_stage:r"),
            guard_h: motor("guard_h", "guard_slit:h_size"),
            guard_v: motor("guard_v", "guard_slit:v_size"),
            slit_h: motor("slit_h", "usaxs_slit:h_size"),
            slit_v: motor("slit_v", "usaxs_slit:v_size"),
        };

        let mono_shutter = Shutter::new("mono_shutter", addr("mono_shutter"), control.clone());
        let ti_filter_shutter =
            Shutter::new("ti_filter_shutter", addr("ti_filter_shutter"), control.clone())
                .with_recovery(Duration::from_millis(200));
        let ccd_shutter = Shutter::new("ccd_shutter", addr("ccd_shutter"), control.clone());

        let scaler = Scaler::new(
            "scaler0",
            addr("vsc:c0.CNT"),
            addr("vsc:c0.TP"),
            addr("vsc:c0.CONT"),
            control.clone(),
        );

        let settling = Duration::from_millis(config.channels.settling_time_ms);
        let max_rate = config.channels.max_count_rate;
        let channel = |nickname: &str, signal: &str, femto: &str, auto: &str| {
            DetectorChannel::new(
                nickname,
                scaler.clone(),
                addr(signal),
                FemtoAmplifier::new(
                    format!("{nickname}_femto"),
                    addr(femto),
                    settling,
                    control.clone(),
                ),
                AutorangeChannel::new(addr(auto), max_rate, control.clone()),
                control.clone(),
            )
        };
        let upd = channel("PD_USAXS", "vsc:c0.S4", "fem01:seq01:gainidx", "pd01:seq01:");
        let i0 = channel("I0_USAXS", "vsc:c0.S2", "fem02:seq01:gainidx", "pd02:seq01:");
        let i00 = channel("I00_USAXS", "vsc:c0.S3", "fem03:seq01:gainidx", "pd03:seq01:");
        let trd = channel("TR diode", "vsc:c0.S5", "fem05:seq01:gainidx", "pd05:seq01:");

        let terms = Terms::new(p.clone(), control.clone());
        let user_status = UserStatus::new(&p, control.clone());
        let rotator = Rotator::new(
            addr("pi_c867:home"),
            addr("pi_c867:jog_forward"),
            addr("pi_c867:jog_reverse"),
            control.clone(),
        );

        let modes = ModeController::new(
            terms.clone(),
            user_status.clone(),
            ti_filter_shutter.clone(),
            ccd_shutter.clone(),
            stages.clone(),
            scaler.clone(),
            addr("DCM:feedback:on"),
            addr("pf4:fPosA"),
            addr("pf4:fPosB"),
            ModeSettling {
                guard_slits: Duration::from_millis(config.stages.guard_slit_settle_ms),
                beam_slits: Duration::from_millis(config.stages.beam_slit_settle_ms),
            },
            control.clone(),
        );

        let journal = match &config.logging.journal_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| SequencerError::io(e, format!("creating journal dir {dir}")))?;
                let stamp = Local::now().format("%Y%m%d_%H%M%S");
                let path = std::path::Path::new(dir).join(format!("commands_{stamp}.jsonl"));
                Some(Mutex::new(AttemptJournal::new(path, 64)))
            }
            None => None,
        };

        Ok(Self {
            config,
            control,
            mono_shutter,
            ti_filter_shutter,
            ccd_shutter,
            stages,
            scaler,
            upd,
            i0,
            i00,
            trd,
            terms,
            user_status,
            rotator,
            modes,
            notifier,
            gain_cache: Mutex::new(GainCache::new()),
            journal,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The full channel set measured during scans and dark currents.
    pub fn usaxs_channels(&self) -> Vec<DetectorChannel> {
        vec![
            self.upd.clone(),
            self.i0.clone(),
            self.i00.clone(),
            self.trd.clone(),
        ]
    }

    /// Channels used while tuning the optics.
    pub fn tuning_channels(&self) -> Vec<DetectorChannel> {
        vec![self.upd.clone(), self.i0.clone(), self.i00.clone()]
    }

    /// Run the gain autoscale loop over `channels`, warm-starting from this
    /// instrument's gain cache.
    pub fn autoscale(
        &self,
        channels: &[DetectorChannel],
        shutter: Option<&Shutter>,
    ) -> Result<(), SequencerError> {
        let mut cache = self.gain_cache.lock();
        autorange::autoscale_amplifiers(
            channels,
            shutter,
            &mut cache,
            Duration::from_secs_f64(self.config.channels.count_time_s),
            self.config.channels.max_iterations,
        )
    }

    /// Record dark currents for the full channel set, shutter closed.
    pub fn measure_dark_currents(&self) -> Result<(), SequencerError> {
        autorange::measure_background(
            &self.usaxs_channels(),
            Some(&self.ti_filter_shutter),
            Duration::from_secs_f64(self.config.channels.count_time_s),
            self.config.channels.num_backgrounds,
        )
    }

    pub fn archive_targets(&self) -> ArchiveTargets {
        ArchiveTargets {
            livedata_file: self.config.archive.livedata_file.clone().into(),
            posterity_dir: self.config.archive.posterity_dir.clone().into(),
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Append to the attempt journal, if one is configured.
    pub fn journal_record(&self, record: AttemptRecord) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.lock().add(record)
        {
            error!("cannot journal command attempt: {e}");
        }
    }
}
