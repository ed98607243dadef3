use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use crate::control::{ControlSystem, PvValue};
use crate::devices::scaler::Scaler;
use crate::error::SequencerError;

/// Operating modes of the autorange sequence program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutorangeMode {
    Automatic,
    AutoBackground,
    Manual,
}

impl AutorangeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutorangeMode::Automatic => "automatic",
            AutorangeMode::AutoBackground => "auto+background",
            AutorangeMode::Manual => "manual",
        }
    }
}

/// A gain request in any of the three equivalent encodings.
///
/// The hardware enumerates its gains as labels ("1e6 V/A" and so on); a
/// request may name the label, the zero-based index, or the amplification
/// value itself. All three resolve to the same index, which is the only
/// form the hardware accepts for writes.
#[derive(Debug, Clone, PartialEq)]
pub enum GainSpec {
    Label(String),
    Index(usize),
    Value(f64),
}

impl fmt::Display for GainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GainSpec::Label(s) => write!(f, "{s:?}"),
            GainSpec::Index(i) => write!(f, "index {i}"),
            GainSpec::Value(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for GainSpec {
    fn from(value: &str) -> Self {
        GainSpec::Label(value.to_string())
    }
}

impl From<usize> for GainSpec {
    fn from(value: usize) -> Self {
        GainSpec::Index(value)
    }
}

impl From<f64> for GainSpec {
    fn from(value: f64) -> Self {
        GainSpec::Value(value)
    }
}

/// Resolve a gain request against the hardware's label table.
///
/// Labels are formatted "{value} {suffix}", e.g. "1e6 V/A"; a value request
/// matches on the numeric prefix so "2.0e4" finds the "2e4 V/A" entry.
fn resolve_gain(labels: &[String], spec: &GainSpec) -> Option<usize> {
    match spec {
        GainSpec::Label(wanted) => labels.iter().position(|s| s == wanted),
        GainSpec::Index(i) => (*i < labels.len()).then_some(*i),
        GainSpec::Value(v) => labels.iter().position(|s| {
            s.split_whitespace()
                .next()
                .and_then(|head| head.parse::<f64>().ok())
                .is_some_and(|label_value| {
                    label_value != 0.0 && ((v / label_value) - 1.0).abs() < 1e-6
                })
        }),
    }
}

/// The current amplifier itself (gain selection and settling behavior).
#[derive(Clone)]
pub struct FemtoAmplifier {
    name: String,
    gain_index_address: String,
    settling_time: Duration,
    labels: Arc<OnceLock<Vec<String>>>,
    control: Arc<dyn ControlSystem>,
}

impl FemtoAmplifier {
    pub fn new(
        name: impl Into<String>,
        gain_index_address: impl Into<String>,
        settling_time: Duration,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            name: name.into(),
            gain_index_address: gain_index_address.into(),
            settling_time,
            labels: Arc::new(OnceLock::new()),
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gain_index_address(&self) -> &str {
        &self.gain_index_address
    }

    pub fn settling_time(&self) -> Duration {
        self.settling_time
    }

    /// Gain labels, learned from the record metadata on first use.
    pub fn gain_labels(&self) -> Result<Vec<String>, SequencerError> {
        if let Some(labels) = self.labels.get() {
            return Ok(labels.clone());
        }
        let labels = self.control.enum_labels(&self.gain_index_address)?;
        let _ = self.labels.set(labels.clone());
        Ok(labels)
    }

    pub fn set_gain(&self, spec: impl Into<GainSpec>) -> Result<(), SequencerError> {
        let spec = spec.into();
        let labels = self.gain_labels()?;
        let index = resolve_gain(&labels, &spec).ok_or(SequencerError::InvalidGain {
            requested: spec.to_string(),
        })?;
        self.control
            .put(&self.gain_index_address, PvValue::I64(index as i64))
    }
}

/// Endpoints of the per-channel autorange sequence program.
#[derive(Clone)]
pub struct AutorangeChannel {
    prefix: String,
    max_count_rate: f64,
    labels: Arc<OnceLock<Vec<String>>>,
    control: Arc<dyn ControlSystem>,
}

impl AutorangeChannel {
    pub fn new(
        prefix: impl Into<String>,
        max_count_rate: f64,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            max_count_rate,
            labels: Arc::new(OnceLock::new()),
            control,
        }
    }

    pub fn reqrange_address(&self) -> String {
        format!("{}reqrange", self.prefix)
    }

    pub fn mode_address(&self) -> String {
        format!("{}mode", self.prefix)
    }

    pub fn gain_address(&self) -> String {
        format!("{}gain", self.prefix)
    }

    pub fn background_address(&self, index: usize) -> String {
        format!("{}bkg{}", self.prefix, index)
    }

    pub fn background_error_address(&self, index: usize) -> String {
        format!("{}bkgErr{}", self.prefix, index)
    }

    pub fn max_count_rate(&self) -> f64 {
        self.max_count_rate
    }

    pub fn set_mode(&self, mode: AutorangeMode) -> Result<(), SequencerError> {
        self.control
            .put(&self.mode_address(), PvValue::from(mode.as_str()))
    }

    pub fn gain_labels(&self) -> Result<Vec<String>, SequencerError> {
        if let Some(labels) = self.labels.get() {
            return Ok(labels.clone());
        }
        let labels = self.control.enum_labels(&self.reqrange_address())?;
        let _ = self.labels.set(labels.clone());
        Ok(labels)
    }

    pub fn num_gains(&self) -> Result<usize, SequencerError> {
        Ok(self.gain_labels()?.len())
    }

    /// Ask the sequence program for a gain. The request record only accepts
    /// the index encoding, so every spec is resolved first.
    pub fn request_gain(&self, spec: impl Into<GainSpec>) -> Result<(), SequencerError> {
        let spec = spec.into();
        let labels = self.gain_labels()?;
        let index = resolve_gain(&labels, &spec).ok_or(SequencerError::InvalidGain {
            requested: spec.to_string(),
        })?;
        self.control
            .put(&self.reqrange_address(), PvValue::I64(index as i64))
    }

    /// Gain the hardware has actually selected.
    pub fn selected_gain(&self) -> Result<usize, SequencerError> {
        Ok(self.control.get_i64(&self.gain_address())?.max(0) as usize)
    }

    pub fn write_background(
        &self,
        index: usize,
        mean: f64,
        std_dev: f64,
    ) -> Result<(), SequencerError> {
        self.control
            .put(&self.background_address(index), PvValue::F64(mean))?;
        self.control
            .put(&self.background_error_address(index), PvValue::F64(std_dev))
    }

    pub fn background(&self, index: usize) -> Result<(f64, f64), SequencerError> {
        Ok((
            self.control.get_f64(&self.background_address(index))?,
            self.control.get_f64(&self.background_error_address(index))?,
        ))
    }
}

/// One diode or ion chamber: its scaler channel, amplifier, and autorange
/// program, bundled so that the controllers can treat them as a unit.
#[derive(Clone)]
pub struct DetectorChannel {
    nickname: String,
    scaler: Scaler,
    signal_address: String,
    pub femto: FemtoAmplifier,
    pub auto: AutorangeChannel,
    control: Arc<dyn ControlSystem>,
}

impl DetectorChannel {
    pub fn new(
        nickname: impl Into<String>,
        scaler: Scaler,
        signal_address: impl Into<String>,
        femto: FemtoAmplifier,
        auto: AutorangeChannel,
        control: Arc<dyn ControlSystem>,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            scaler,
            signal_address: signal_address.into(),
            femto,
            auto,
            control,
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn signal_address(&self) -> &str {
        &self.signal_address
    }

    /// Last counted value on this channel.
    pub fn reading(&self) -> Result<f64, SequencerError> {
        self.control.get_f64(&self.signal_address)
    }
}

/// Group channels by their underlying scaler, preserving first-appearance
/// order. Channels in one group must be driven by a single synchronized
/// count; two overlapping count requests on one scaler are invalid.
pub fn group_by_scaler(channels: &[DetectorChannel]) -> Vec<(String, Vec<DetectorChannel>)> {
    let mut groups: Vec<(String, Vec<DetectorChannel>)> = Vec::new();
    for channel in channels {
        let key = channel.scaler().name().to_string();
        match groups.iter_mut().find(|(name, _)| *name == key) {
            Some((_, members)) => members.push(channel.clone()),
            None => groups.push((key, vec![channel.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SoftIoc;

    fn gain_table() -> Vec<String> {
        ["1e4 V/A", "1e6 V/A", "1e8 V/A", "1e10 V/A", "1e12 V/A"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn femto() -> (FemtoAmplifier, Arc<SoftIoc>) {
        let ioc = Arc::new(SoftIoc::new());
        ioc.set_enum_labels("lax:fem01:seq01:gainidx", gain_table());
        ioc.seed("lax:fem01:seq01:gainidx", 0i64);
        let femto = FemtoAmplifier::new(
            "upd_femto",
            "lax:fem01:seq01:gainidx",
            Duration::from_millis(80),
            ioc.clone(),
        );
        (femto, ioc)
    }

    #[test]
    fn label_index_and_value_encodings_agree() {
        let (femto, ioc) = femto();
        femto.set_gain("1e8 V/A").unwrap();
        femto.set_gain(2usize).unwrap();
        femto.set_gain(1.0e8).unwrap();
        assert_eq!(
            ioc.puts_to("lax:fem01:seq01:gainidx"),
            vec![PvValue::I64(2), PvValue::I64(2), PvValue::I64(2)]
        );
    }

    #[test]
    fn value_encoding_tolerates_mantissa_formatting() {
        // "2.0e4" must find a "2e4 ..." label
        let labels: Vec<String> = vec!["2e4 V/A".into(), "2e6 V/A".into()];
        assert_eq!(resolve_gain(&labels, &GainSpec::Value(2.0e4)), Some(0));
        assert_eq!(
            resolve_gain(&labels, &GainSpec::Label("2e6 V/A".into())),
            Some(1)
        );
    }

    #[test]
    fn unknown_gain_is_refused() {
        let (femto, _ioc) = femto();
        let err = femto.set_gain(5.0e5).unwrap_err();
        assert!(matches!(err, SequencerError::InvalidGain { .. }));
        let err = femto.set_gain(17usize).unwrap_err();
        assert!(matches!(err, SequencerError::InvalidGain { .. }));
    }

    #[test]
    fn grouping_preserves_order_and_shares_scalers() {
        let ioc = Arc::new(SoftIoc::new());
        let scaler = |name: &str| {
            Scaler::new(
                name,
                format!("lax:{name}.CNT"),
                format!("lax:{name}.TP"),
                format!("lax:{name}.CONT"),
                ioc.clone(),
            )
        };
        let channel = |nick: &str, scaler: Scaler| {
            let femto = FemtoAmplifier::new(
                format!("{nick}_femto"),
                format!("lax:{nick}:gainidx"),
                Duration::from_millis(80),
                ioc.clone(),
            );
            let auto = AutorangeChannel::new(format!("lax:{nick}:seq:"), 950_000.0, ioc.clone());
            DetectorChannel::new(
                nick,
                scaler,
                format!("lax:sig:{nick}"),
                femto,
                auto,
                ioc.clone(),
            )
        };
        let s0 = scaler("c0");
        let s1 = scaler("c1");
        let channels = vec![
            channel("upd", s0.clone()),
            channel("I0", s0.clone()),
            channel("trd", s1.clone()),
        ];
        let groups = group_by_scaler(&channels);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "c0");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "c1");
        assert_eq!(groups[1].1.len(), 1);
    }
}
