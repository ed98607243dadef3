use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;

const OPEN: &str = "open";
const CLOSED: &str = "close";

/// A two-state beam shutter.
///
/// Open/close are idempotent: a shutter already in the requested state is
/// not commanded again, so repeated safety closes cost nothing. The filter
/// shutter needs some recovery time after each move; model that with
/// `with_recovery`.
#[derive(Clone)]
pub struct Shutter {
    name: String,
    address: String,
    recovery: Duration,
    control: Arc<dyn ControlSystem>,
}

impl Shutter {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            recovery: Duration::ZERO,
            control,
        }
    }

    pub fn with_recovery(mut self, recovery: Duration) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn open(&self) -> Result<(), SequencerError> {
        self.set_state(OPEN)
    }

    pub fn close(&self) -> Result<(), SequencerError> {
        self.set_state(CLOSED)
    }

    pub fn is_closed(&self) -> Result<bool, SequencerError> {
        Ok(self.control.get_string(&self.address)? == CLOSED)
    }

    fn set_state(&self, state: &str) -> Result<(), SequencerError> {
        if self.control.get_string(&self.address)? == state {
            return Ok(());
        }
        debug!("shutter {}: {}", self.name, state);
        self.control.put(&self.address, PvValue::from(state))?;
        if !self.recovery.is_zero() {
            std::thread::sleep(self.recovery);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SoftIoc;

    fn shutter() -> (Shutter, Arc<SoftIoc>) {
        let ioc = Arc::new(SoftIoc::new());
        ioc.seed("lax:ti_filter_shutter", "close");
        let sh = Shutter::new("ti_filter", "lax:ti_filter_shutter", ioc.clone());
        (sh, ioc)
    }

    #[test]
    fn open_then_close_round_trips() {
        let (sh, _ioc) = shutter();
        assert!(sh.is_closed().unwrap());
        sh.open().unwrap();
        assert!(!sh.is_closed().unwrap());
        sh.close().unwrap();
        assert!(sh.is_closed().unwrap());
    }

    #[test]
    fn repeated_close_is_not_recommanded() {
        let (sh, ioc) = shutter();
        sh.close().unwrap();
        sh.close().unwrap();
        assert!(ioc.puts_to("lax:ti_filter_shutter").is_empty());
    }
}
