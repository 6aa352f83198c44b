//! Error types for peak finding and integration.

use thiserror::Error;

/// Errors that abort a whole engine call.
///
/// Isolated numeric edge cases (a zero-mass blob, a peak whose fit does not
/// converge) never surface here: blobs are dropped and counted, integration
/// failures are recorded on the peak as [`IntegrationFailure`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Frame index {index} out of range (dataset has {count} frames)")]
    FrameIndex { index: usize, count: usize },

    #[error("Frame shape mismatch: expected {expected:?}, got {actual:?}")]
    FrameShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Frame source error: {0}")]
    Source(String),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn degenerate(message: impl Into<String>) -> Self {
        Error::DegenerateGeometry(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reason a single peak could not be integrated.
///
/// Stored on the peak; the peak stays in the output list for inspection.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum IntegrationFailure {
    #[error("no valid background pixels in the integration region")]
    NoBackground,

    #[error("no pixels inside the peak region")]
    NoPeakPixels,

    #[error("profile fit did not converge")]
    NotConverged,

    #[error("profile fit rejected: {0}")]
    InvalidFit(String),

    #[error("profile has no weight inside the peak region")]
    EmptyProfile,

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("peak region holds a saturated pixel ({0} counts)")]
    SaturatedPixel(f64),

    #[error("refined shape rejected: {0}")]
    InconsistentShape(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_message() {
        let err = Error::config("min_size (10) > max_size (5)");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: min_size (10) > max_size (5)"
        );
    }

    #[test]
    fn test_frame_index_error_message() {
        let err = Error::FrameIndex { index: 31, count: 30 };
        let msg = err.to_string();
        assert!(msg.contains("31"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn test_frame_shape_error_message() {
        let err = Error::FrameShape {
            expected: (50, 50),
            actual: (50, 40),
        };
        assert!(err.to_string().contains("(50, 40)"));
    }

    #[test]
    fn test_integration_failure_display() {
        assert_eq!(
            IntegrationFailure::NoBackground.to_string(),
            "no valid background pixels in the integration region"
        );
        let failure = IntegrationFailure::InvalidFit("pearson 0.40 < 0.75".into());
        assert!(failure.to_string().contains("pearson"));
        assert_eq!(
            IntegrationFailure::SaturatedPixel(65535.0).to_string(),
            "peak region holds a saturated pixel (65535 counts)"
        );
    }

    #[test]
    fn test_error_is_debug() {
        let debug_str = format!("{:?}", Error::Cancelled);
        assert!(debug_str.contains("Cancelled"));
    }
}
