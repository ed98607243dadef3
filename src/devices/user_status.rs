use std::sync::Arc;

use chrono::Local;
use log::info;

use crate::control::{ControlSystem, PvValue};
use crate::error::SequencerError;

/// The status string record holds at most this many characters.
const STATE_FIELD_LEN: usize = 39;

/// Operator-visible session state: status text, timestamps, sample info and
/// the collection-in-progress flag consumed by the beamline displays.
#[derive(Clone)]
pub struct UserStatus {
    state_address: String,
    time_stamp_address: String,
    scanning_address: String,
    collection_address: String,
    macro_file_address: String,
    macro_file_time_address: String,
    sample_title_address: String,
    sample_thickness_address: String,
    control: Arc<dyn ControlSystem>,
}

impl UserStatus {
    pub fn new(prefix: &str, control: Arc<dyn ControlSystem>) -> Self {
        Self {
            state_address: format!("{prefix}state"),
            time_stamp_address: format!("{prefix}USAXS:timeStamp"),
            scanning_address: format!("{prefix}USAXS:scanning"),
            collection_address: format!("{prefix}dataColInProgress"),
            macro_file_address: format!("{prefix}USAXS:macroFile"),
            macro_file_time_address: format!("{prefix}USAXS:macroFileTime"),
            sample_title_address: format!("{prefix}sampleTitle"),
            sample_thickness_address: format!("{prefix}sampleThickness"),
            control,
        }
    }

    pub fn state_address(&self) -> &str {
        &self.state_address
    }

    /// Tell the displays what we are doing. Long messages are truncated to
    /// the record length, keeping a trailing ellipsis.
    pub fn set_state(&self, message: &str) -> Result<(), SequencerError> {
        let message = if message.chars().count() > STATE_FIELD_LEN {
            info!("truncating long status message: {message}");
            let head: String = message.chars().take(STATE_FIELD_LEN - 4).collect();
            format!("{head} ...")
        } else {
            message.to_string()
        };
        self.control.put(&self.state_address, PvValue::from(message))
    }

    pub fn state(&self) -> Result<String, SequencerError> {
        self.control.get_string(&self.state_address)
    }

    pub fn stamp_now(&self) -> Result<String, SequencerError> {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        self.control
            .put(&self.time_stamp_address, PvValue::from(ts.clone()))?;
        Ok(ts)
    }

    pub fn set_macro_file_time(&self, ts: &str) -> Result<(), SequencerError> {
        self.control
            .put(&self.macro_file_time_address, PvValue::from(ts))
    }

    pub fn set_macro_file(&self, name: &str) -> Result<(), SequencerError> {
        self.control.put(&self.macro_file_address, PvValue::from(name))
    }

    pub fn set_scanning(&self, scanning: bool) -> Result<(), SequencerError> {
        self.control
            .put(&self.scanning_address, PvValue::I64(scanning as i64))
    }

    pub fn set_collection_in_progress(&self, active: bool) -> Result<(), SequencerError> {
        self.control
            .put(&self.collection_address, PvValue::I64(active as i64))
    }

    pub fn collection_in_progress(&self) -> Result<bool, SequencerError> {
        Ok(self.control.get_i64(&self.collection_address)? != 0)
    }

    pub fn set_sample(&self, title: &str, thickness: f64) -> Result<(), SequencerError> {
        self.control
            .put(&self.sample_title_address, PvValue::from(title))?;
        self.control
            .put(&self.sample_thickness_address, PvValue::F64(thickness))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SoftIoc;

    #[test]
    fn long_state_text_is_truncated_with_ellipsis() {
        let ioc = Arc::new(SoftIoc::new());
        let status = UserStatus::new("lax:", ioc.clone());
        let long = "a".repeat(60);
        status.set_state(&long).unwrap();
        let stored = status.state().unwrap();
        assert_eq!(stored.len(), STATE_FIELD_LEN);
        assert!(stored.ends_with(" ..."));
    }

    #[test]
    fn short_state_text_is_stored_verbatim() {
        let ioc = Arc::new(SoftIoc::new());
        let status = UserStatus::new("lax:", ioc.clone());
        status.set_state("USAXS Mode").unwrap();
        assert_eq!(status.state().unwrap(), "USAXS Mode");
    }
}
