pub mod amplifier;
pub mod motor;
pub mod rotator;
pub mod scaler;
pub mod shutter;
pub mod stages;
pub mod terms;
pub mod user_status;

pub use amplifier::{
    AutorangeChannel, AutorangeMode, DetectorChannel, FemtoAmplifier, GainSpec, group_by_scaler,
};
pub use motor::Motor;
pub use rotator::Rotator;
pub use scaler::Scaler;
pub use shutter::Shutter;
pub use stages::Stages;
pub use terms::Terms;
pub use user_status::UserStatus;
