use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;
use crate::poll::wait_for;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pad added to the preset time before a count is declared hung.
pub const COUNT_TIMEOUT_PAD: Duration = Duration::from_secs(1);

/// Shared counting device.
///
/// One scaler serves several detector channels simultaneously and cannot
/// service two overlapping count requests, so every caller that owns a set
/// of channels on the same scaler must issue a single `count` for the whole
/// set. Channel grouping is enforced one level up, in the autorange and
/// background controllers.
#[derive(Clone)]
pub struct Scaler {
    name: String,
    count_address: String,
    preset_address: String,
    count_mode_address: String,
    control: Arc<dyn ControlSystem>,
}

impl Scaler {
    pub fn new(
        name: impl Into<String>,
        count_address: impl Into<String>,
        preset_address: impl Into<String>,
        count_mode_address: impl Into<String>,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            name: name.into(),
            count_address: count_address.into(),
            preset_address: preset_address.into(),
            count_mode_address: count_mode_address.into(),
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count_address(&self) -> &str {
        &self.count_address
    }

    pub fn preset_address(&self) -> &str {
        &self.preset_address
    }

    pub fn count_mode_address(&self) -> &str {
        &self.count_mode_address
    }

    /// One synchronized count over `preset`, waiting for completion.
    pub fn count(&self, preset: Duration) -> Result<(), SequencerError> {
        debug!("scaler {}: counting for {:?}", self.name, preset);
        self.control
            .put(&self.preset_address, PvValue::F64(preset.as_secs_f64()))?;
        self.control.put(&self.count_address, PvValue::I64(1))?;
        let what = format!("scaler {} count", self.name);
        wait_for(
            || Ok(self.control.get_i64(&self.count_address)? == 0),
            preset + COUNT_TIMEOUT_PAD,
            POLL_INTERVAL,
            &what,
        )
    }

    /// "OneShot" for synchronized measurements, "AutoCount" for idle display.
    pub fn set_count_mode(&self, mode: &str) -> Result<(), SequencerError> {
        self.control
            .put(&self.count_mode_address, PvValue::from(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{IocBehavior, SoftIoc};

    struct CompleteImmediately;

    impl IocBehavior for CompleteImmediately {
        fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue) {
            if address == "lax:vsc:c0.CNT" && value.as_i64() == Some(1) {
                ioc.react("lax:vsc:c0.CNT", 0i64);
            }
        }
    }

    #[test]
    fn count_waits_for_completion() {
        let ioc = Arc::new(SoftIoc::new());
        ioc.seed("lax:vsc:c0.CNT", 0i64);
        ioc.install(Arc::new(CompleteImmediately));
        let scaler = Scaler::new(
            "scaler0",
            "lax:vsc:c0.CNT",
            "lax:vsc:c0.TP",
            "lax:vsc:c0.CONT",
            ioc.clone(),
        );
        scaler.count(Duration::from_millis(100)).unwrap();
        assert_eq!(ioc.get_f64("lax:vsc:c0.TP").unwrap(), 0.1);
    }

    #[test]
    fn hung_count_is_a_timeout_fault() {
        let ioc = Arc::new(SoftIoc::new());
        ioc.seed("lax:vsc:c0.CNT", 0i64);
        let scaler = Scaler::new(
            "scaler0",
            "lax:vsc:c0.CNT",
            "lax:vsc:c0.TP",
            "lax:vsc:c0.CONT",
            ioc.clone(),
        );
        // No completion behavior installed: the count bit stays at 1.
        let result = scaler.count(Duration::from_millis(1));
        assert!(matches!(result, Err(SequencerError::Timeout(_, _))));
    }
}
