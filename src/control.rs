use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SequencerError;

/// Value carried by a process variable.
///
/// Enum-typed records are represented by their integer index; the label
/// strings live in the record metadata (`ControlSystem::enum_labels`).
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    F64(f64),
    I64(i64),
    Str(String),
}

impl PvValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::F64(v) => Some(*v),
            PvValue::I64(v) => Some(*v as f64),
            PvValue::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::F64(v) => write!(f, "{v}"),
            PvValue::I64(v) => write!(f, "{v}"),
            PvValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::F64(value)
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::I64(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::Str(value.to_string())
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::Str(value)
    }
}

/// The hardware seam: settable/gettable scalar records addressed by name.
///
/// Everything above this trait is transport-agnostic. A channel-access
/// client, a gateway, or the in-memory `SoftIoc` all look the same to the
/// sequencing code, which keeps every plan testable against a fake.
pub trait ControlSystem: Send + Sync {
    fn get(&self, address: &str) -> Result<PvValue, SequencerError>;
    fn put(&self, address: &str, value: PvValue) -> Result<(), SequencerError>;
    fn enum_labels(&self, address: &str) -> Result<Vec<String>, SequencerError>;

    fn get_f64(&self, address: &str) -> Result<f64, SequencerError> {
        self.get(address)?.as_f64().ok_or_else(|| {
            SequencerError::ControlSystem(format!("{address}: expected a numeric value"))
        })
    }

    fn get_i64(&self, address: &str) -> Result<i64, SequencerError> {
        self.get(address)?.as_i64().ok_or_else(|| {
            SequencerError::ControlSystem(format!("{address}: expected an integer value"))
        })
    }

    fn get_string(&self, address: &str) -> Result<String, SequencerError> {
        match self.get(address)? {
            PvValue::Str(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

/// Hardware reaction hook for the soft IOC.
///
/// Behaviors run after the written value is stored, so they may read it back
/// and issue further puts (a counting scaler completing, an autorange
/// sequence program selecting a gain).
pub trait IocBehavior: Send + Sync {
    fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue);
}

/// In-memory record store standing in for the real control system.
///
/// Used by the CLI when no beamline is attached and by every test. Records
/// are created implicitly on first put; reading an address that was never
/// seeded or written is an error, which surfaces wiring mistakes early.
/// All puts are journaled in order for call-order assertions.
#[derive(Default)]
pub struct SoftIoc {
    store: RwLock<HashMap<String, PvValue>>,
    labels: RwLock<HashMap<String, Vec<String>>>,
    history: Mutex<Vec<(String, PvValue)>>,
    behaviors: RwLock<Vec<Arc<dyn IocBehavior>>>,
}

impl SoftIoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an initial record value without journaling or behavior callbacks.
    pub fn seed(&self, address: impl Into<String>, value: impl Into<PvValue>) {
        self.store.write().insert(address.into(), value.into());
    }

    pub fn set_enum_labels(&self, address: impl Into<String>, labels: Vec<String>) {
        self.labels.write().insert(address.into(), labels);
    }

    pub fn install(&self, behavior: Arc<dyn IocBehavior>) {
        self.behaviors.write().push(behavior);
    }

    /// Complete put journal, in order.
    pub fn history(&self) -> Vec<(String, PvValue)> {
        self.history.lock().clone()
    }

    /// Values written to one address, in order.
    pub fn puts_to(&self, address: &str) -> Vec<PvValue> {
        self.history
            .lock()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Store a value as a behavior side effect (journaled, no re-dispatch).
    pub fn react(&self, address: impl Into<String>, value: impl Into<PvValue>) {
        let address = address.into();
        let value = value.into();
        self.store.write().insert(address.clone(), value.clone());
        self.history.lock().push((address, value));
    }
}

impl ControlSystem for SoftIoc {
    fn get(&self, address: &str) -> Result<PvValue, SequencerError> {
        self.store.read().get(address).cloned().ok_or_else(|| {
            SequencerError::ControlSystem(format!("no record named {address}"))
        })
    }

    fn put(&self, address: &str, value: PvValue) -> Result<(), SequencerError> {
        self.store
            .write()
            .insert(address.to_string(), value.clone());
        self.history
            .lock()
            .push((address.to_string(), value.clone()));
        // Snapshot the behavior list so a hook may install further hooks.
        let behaviors: Vec<_> = self.behaviors.read().clone();
        for behavior in behaviors {
            behavior.on_put(self, address, &value);
        }
        Ok(())
    }

    fn enum_labels(&self, address: &str) -> Result<Vec<String>, SequencerError> {
        self.labels.read().get(address).cloned().ok_or_else(|| {
            SequencerError::ControlSystem(format!("no enum labels for record {address}"))
        })
    }
}
