use std::sync::Arc;

use log::info;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;

/// PI C-867 sample rotator, driven through its jog bits.
///
/// Stopping clears both jog bits. Never write the motor STOP field to end a
/// jog: that faults if the motor is in motion.
#[derive(Clone)]
pub struct Rotator {
    home_address: String,
    jog_forward_address: String,
    jog_reverse_address: String,
    control: Arc<dyn ControlSystem>,
}

impl Rotator {
    pub fn new(
        home_address: impl Into<String>,
        jog_forward_address: impl Into<String>,
        jog_reverse_address: impl Into<String>,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            home_address: home_address.into(),
            jog_forward_address: jog_forward_address.into(),
            jog_reverse_address: jog_reverse_address.into(),
            control,
        }
    }

    pub fn home_address(&self) -> &str {
        &self.home_address
    }

    pub fn jog_forward_address(&self) -> &str {
        &self.jog_forward_address
    }

    pub fn jog_reverse_address(&self) -> &str {
        &self.jog_reverse_address
    }

    pub fn stop(&self) -> Result<(), SequencerError> {
        info!("sample rotator: stop");
        self.control.put(&self.jog_forward_address, PvValue::I64(0))?;
        self.control.put(&self.jog_reverse_address, PvValue::I64(0))
    }

    pub fn start_forward(&self) -> Result<(), SequencerError> {
        info!("sample rotator: forward");
        self.control.put(&self.home_address, PvValue::from("forward"))?;
        self.control.put(&self.jog_forward_address, PvValue::I64(1))
    }

    pub fn start_reverse(&self) -> Result<(), SequencerError> {
        info!("sample rotator: reverse");
        self.control.put(&self.home_address, PvValue::from("reverse"))?;
        self.control.put(&self.jog_reverse_address, PvValue::I64(1))
    }
}
