//! Commonly used types.
//!
//! ```rust,ignore
//! use diffract::prelude::*;
//! ```

pub use crate::{Error, IntegrationFailure, Result};

// Frames
pub use crate::{Dataset, FrameSource, InstrumentGeometry, IterationMode, MemoryFrameSource};

// Peak finding
pub use crate::{FindResult, Peak, PeakFinder, PeakFinderConfig, ThresholdKind};

// Integration
pub use crate::{IntegrationConfig, Integrator, IntegratorKind, ShapeLibrary, ShapeLibraryConfig};

pub use crate::ProgressHandler;
