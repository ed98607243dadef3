use crate::devices::motor::Motor;

/// Every positioner the sequencing layer moves, bundled for wiring.
///
/// `sample_x`/`sample_y` carry the travel limits used by the pre-flight
/// command validation; the rest are subsystem stages, tunable optics axes
/// and slit aperture positioners.
#[derive(Clone)]
pub struct Stages {
    pub sample_x: Motor,
    pub sample_y: Motor,
    pub waxs_x: Motor,
    pub pin_y: Motor,
    pub pin_z: Motor,
    pub usaxs_ax: Motor,
    pub usaxs_dx: Motor,
    pub mr: Motor,
    pub ar: Motor,
    pub guard_h: Motor,
    pub guard_v: Motor,
    pub slit_h: Motor,
    pub slit_v: Motor,
}

impl Stages {
    /// All members, for bulk wiring chores such as simulator seeding.
    pub fn all(&self) -> Vec<&Motor> {
        vec![
            &self.sample_x,
            &self.sample_y,
            &self.waxs_x,
            &self.pin_y,
            &self.pin_z,
            &self.usaxs_ax,
            &self.usaxs_dx,
            &self.mr,
            &self.ar,
            &self.guard_h,
            &self.guard_v,
            &self.slit_h,
            &self.slit_v,
        ]
    }
}
