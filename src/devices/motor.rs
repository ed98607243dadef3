use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;
use crate::poll::wait_for;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A positioner with travel limits and a readback tolerance.
///
/// `move_to` commands the setpoint and then confirms arrival by polling the
/// readback, so callers never proceed on an unconfirmed move.
#[derive(Clone)]
pub struct Motor {
    name: String,
    address: String,
    low_limit: f64,
    high_limit: f64,
    tolerance: f64,
    move_timeout: Duration,
    settling: Duration,
    control: Arc<dyn ControlSystem>,
}

impl Motor {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            low_limit: f64::NEG_INFINITY,
            high_limit: f64::INFINITY,
            tolerance: 1e-4,
            move_timeout: Duration::from_secs(30),
            settling: Duration::ZERO,
            control,
        }
    }

    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = timeout;
        self
    }

    pub fn with_settling(mut self, settling: Duration) -> Self {
        self.settling = settling;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn low_limit(&self) -> f64 {
        self.low_limit
    }

    pub fn high_limit(&self) -> f64 {
        self.high_limit
    }

    pub fn position(&self) -> Result<f64, SequencerError> {
        self.control.get_f64(&self.address)
    }

    pub fn move_to(&self, target: f64) -> Result<(), SequencerError> {
        if target < self.low_limit || target > self.high_limit {
            return Err(SequencerError::ControlSystem(format!(
                "{}: target {} outside travel limits [{}, {}]",
                self.name, target, self.low_limit, self.high_limit
            )));
        }
        debug!("motor {}: move to {}", self.name, target);
        self.control.put(&self.address, PvValue::F64(target))?;
        let what = format!("{} to reach {}", self.name, target);
        wait_for(
            || Ok((self.position()? - target).abs() <= self.tolerance),
            self.move_timeout,
            POLL_INTERVAL,
            &what,
        )?;
        if !self.settling.is_zero() {
            std::thread::sleep(self.settling);
        }
        Ok(())
    }
}
