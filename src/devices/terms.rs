use std::sync::Arc;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;

/// The persistent configuration store for the instrument: the mode readback,
/// per-technique bookkeeping, slit aperture targets, subsystem park/insert
/// positions, and tuning state. These records survive the process, so a new
/// session reads the instrument's actual state instead of assuming one.
#[derive(Clone)]
pub struct Terms {
    prefix: String,
    control: Arc<dyn ControlSystem>,
}

impl Terms {
    pub fn new(prefix: impl Into<String>, control: Arc<dyn ControlSystem>) -> Self {
        Self {
            prefix: prefix.into(),
            control,
        }
    }

    pub fn address(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn get_f64(&self, suffix: &str) -> Result<f64, SequencerError> {
        self.control.get_f64(&self.address(suffix))
    }

    fn get_i64(&self, suffix: &str) -> Result<i64, SequencerError> {
        self.control.get_i64(&self.address(suffix))
    }

    fn put(&self, suffix: &str, value: impl Into<PvValue>) -> Result<(), SequencerError> {
        self.control.put(&self.address(suffix), value.into())
    }

    // --- instrument mode ---

    pub fn mode_address(&self) -> String {
        self.address("USAXS_Pin:USAXSSAXSMode")
    }

    pub fn mode_code(&self) -> Result<i64, SequencerError> {
        self.get_i64("USAXS_Pin:USAXSSAXSMode")
    }

    pub fn set_mode_code(&self, code: i64) -> Result<(), SequencerError> {
        self.put("USAXS_Pin:USAXSSAXSMode", code)
    }

    // --- per-technique bookkeeping ---

    pub fn set_saxs_collecting(&self, active: bool) -> Result<(), SequencerError> {
        self.put("SAXS:collecting", active as i64)
    }

    pub fn set_waxs_collecting(&self, active: bool) -> Result<(), SequencerError> {
        self.put("WAXS:collecting", active as i64)
    }

    pub fn flyscan_order_number(&self) -> Result<i64, SequencerError> {
        self.get_i64("USAXS:FS_OrderNumber")
    }

    pub fn set_flyscan_order_number(&self, n: i64) -> Result<(), SequencerError> {
        self.put("USAXS:FS_OrderNumber", n)
    }

    pub fn saxs_order_number(&self) -> Result<i64, SequencerError> {
        self.get_i64("SAXS:OrderNumber")
    }

    pub fn set_saxs_order_number(&self, n: i64) -> Result<(), SequencerError> {
        self.put("SAXS:OrderNumber", n)
    }

    pub fn waxs_order_number(&self) -> Result<i64, SequencerError> {
        self.get_i64("WAXS:OrderNumber")
    }

    pub fn set_waxs_order_number(&self, n: i64) -> Result<(), SequencerError> {
        self.put("WAXS:OrderNumber", n)
    }

    // --- tuning state ---

    pub fn retune_needed(&self) -> Result<bool, SequencerError> {
        Ok(self.get_i64("USAXS:retuneNeeded")? != 0)
    }

    pub fn set_retune_needed(&self, needed: bool) -> Result<(), SequencerError> {
        self.put("USAXS:retuneNeeded", needed as i64)
    }

    pub fn num_scans_last_tune(&self) -> Result<i64, SequencerError> {
        self.get_i64("USAXS:NumScansFromLastTune")
    }

    pub fn set_num_scans_last_tune(&self, n: i64) -> Result<(), SequencerError> {
        self.put("USAXS:NumScansFromLastTune", n)
    }

    pub fn set_epoch_last_tune(&self, epoch: f64) -> Result<(), SequencerError> {
        self.put("USAXS:EPOCHTimeOfLastTune", epoch)
    }

    pub fn run_tune_on_qdo(&self) -> Result<bool, SequencerError> {
        Ok(self.get_i64("USAXS:runTuneOnQdo")? != 0)
    }

    pub fn set_run_tune_on_qdo(&self, run: bool) -> Result<(), SequencerError> {
        self.put("USAXS:runTuneOnQdo", run as i64)
    }

    pub fn set_usaxs_minstep(&self, minstep: f64) -> Result<(), SequencerError> {
        self.put("USAXS:MinStep", minstep)
    }

    pub fn set_tune_width_mr(&self, width: f64) -> Result<(), SequencerError> {
        self.put("USAXS:tune_mr_range", width)
    }

    pub fn set_tune_width_ar(&self, width: f64) -> Result<(), SequencerError> {
        self.put("USAXS:tune_ar_range", width)
    }

    // --- slit aperture targets (SAXS values serve WAXS mode as well) ---

    pub fn saxs_h_size(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_hslit_ap")
    }

    pub fn saxs_v_size(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_vslit_ap")
    }

    pub fn guard_h_size(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_hgslit_ap")
    }

    pub fn guard_v_size(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_vgslit_ap")
    }

    pub fn set_saxs_h_size(&self, v: f64) -> Result<(), SequencerError> {
        self.put("USAXS_Pin:Pin_hslit_ap", v)
    }

    pub fn set_saxs_v_size(&self, v: f64) -> Result<(), SequencerError> {
        self.put("USAXS_Pin:Pin_vslit_ap", v)
    }

    pub fn set_guard_h_size(&self, v: f64) -> Result<(), SequencerError> {
        self.put("USAXS_Pin:Pin_hgslit_ap", v)
    }

    pub fn set_guard_v_size(&self, v: f64) -> Result<(), SequencerError> {
        self.put("USAXS_Pin:Pin_vgslit_ap", v)
    }

    // --- subsystem insert/park positions ---

    pub fn waxs_x_in(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:waxs_x_in")
    }

    pub fn waxs_x_out(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:waxs_x_out")
    }

    pub fn pin_y_in(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_y_in")
    }

    pub fn pin_y_out(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_y_out")
    }

    pub fn pin_z_in(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_z_in")
    }

    pub fn pin_z_out(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:Pin_z_out")
    }

    pub fn ax_in(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:ax_in")
    }

    pub fn ax_out(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:ax_out")
    }

    pub fn dx_out(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS_Pin:dx_out")
    }

    pub fn diode_dx(&self) -> Result<f64, SequencerError> {
        self.get_f64("USAXS:Diode_dx")
    }

    pub fn set_stage_target(&self, suffix: &str, value: f64) -> Result<(), SequencerError> {
        self.put(suffix, value)
    }

    // --- scan filters ---

    pub fn scan_filter_al(&self) -> Result<i64, SequencerError> {
        self.get_i64("USAXS:Scan_Al_Filter")
    }

    pub fn scan_filter_ti(&self) -> Result<i64, SequencerError> {
        self.get_i64("USAXS:Scan_Ti_Filter")
    }

    pub fn set_scan_filters(&self, al: i64, ti: i64) -> Result<(), SequencerError> {
        self.put("USAXS:Scan_Al_Filter", al)?;
        self.put("USAXS:Scan_Ti_Filter", ti)
    }

    // --- collaborators ---

    pub fn mono_energy(&self) -> Result<f64, SequencerError> {
        self.get_f64("DCM:Energy")
    }

    pub fn set_mono_energy(&self, kev: f64) -> Result<(), SequencerError> {
        self.put("DCM:Energy", kev)
    }

    pub fn enable_auto_open(&self) -> Result<(), SequencerError> {
        self.put("AShtr:Enable", 1i64)
    }

    /// Ask the fly-scan support to re-read its metadata configuration before
    /// the next scan.
    pub fn request_flyscan_reload(&self) -> Result<(), SequencerError> {
        self.put("USAXSfly:reloadConfig", 1i64)
    }
}
