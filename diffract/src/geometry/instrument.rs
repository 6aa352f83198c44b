use glam::{DMat3, DVec3};

/// Instrument model supplied by the caller.
///
/// Frame arguments are continuous so peak centers between frames can be
/// evaluated. Wavevectors share one length unit; only directions and
/// relative magnitudes matter to this crate.
pub trait InstrumentGeometry: Send + Sync {
    /// Incident beam wavevector in the lab frame.
    fn incident_wavevector(&self, frame: f64) -> DVec3;

    /// Scattered wavevector towards detector pixel `(x, y)` in the lab frame.
    fn scattered_wavevector(&self, x: f64, y: f64, frame: f64) -> DVec3;

    /// Sample orientation: maps sample-frame vectors to the lab frame.
    fn sample_rotation(&self, frame: f64) -> DMat3;
}
