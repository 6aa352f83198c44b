//! Frame pre-processing kernels.
//!
//! A [`ConvolutionKernel`] generates a real-valued filter matching the frame
//! shape, laid out with the zero offset at index `(0, 0)` and negative
//! offsets wrapped to the far edge. The [`Convolver`] applies it as a
//! circular correlation, so the filtered frame has the same shape as the
//! input.

mod convolver;

#[cfg(test)]
mod tests;

pub use convolver::Convolver;

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{Error, Result};

/// Kernel parameters keyed by name. Unknown keys are ignored.
pub type KernelParams = HashMap<String, f64>;

/// Registered kernel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum KernelKind {
    #[strum(to_string = "delta", serialize = "identity")]
    Delta,
    #[strum(to_string = "constant", serialize = "box")]
    Constant,
    Gaussian,
    Annular,
    EnhancedAnnular,
}

impl KernelKind {
    pub fn names() -> Vec<String> {
        KernelKind::iter().map(|k| k.to_string()).collect()
    }
}

/// Parameterized filter generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum ConvolutionKernel {
    /// Identity: the filtered frame equals the input.
    #[default]
    Delta,
    /// Uniform `rows x cols` box whose weights sum to 1.
    Constant { rows: usize, cols: usize },
    /// Normalized Gaussian, `exp(-(dx^2 / 2 sx^2 + dy^2 / 2 sy^2))`.
    Gaussian { sigma_x: f64, sigma_y: f64 },
    /// Uniform weight for `r1 <= r <= r2`, zero elsewhere, summing to 1.
    Annular { r1: f64, r2: f64 },
    /// Zero-sum kernel: `+1/N` on the disc `r <= r1`, `-1/M` on the annulus
    /// `r2 < r <= r3`. The filtered value is the local peak mean minus the
    /// local background mean.
    EnhancedAnnular { r1: f64, r2: f64, r3: f64 },
}

fn required(kind: KernelKind, params: &KernelParams, key: &str) -> Result<f64> {
    params.get(key).copied().ok_or_else(|| {
        Error::config(format!("kernel '{kind}' requires parameter '{key}'"))
    })
}

fn optional(params: &KernelParams, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

fn size_param(kind: KernelKind, params: &KernelParams, key: &str, default: usize) -> Result<usize> {
    let value = optional(params, key, default as f64);
    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
        return Err(Error::config(format!(
            "kernel '{kind}': '{key}' must be a positive integer, got {value}"
        )));
    }
    Ok(value as usize)
}

impl ConvolutionKernel {
    /// Build a kernel from its registered name and parameters.
    pub fn from_name(name: &str, params: &KernelParams) -> Result<Self> {
        let kind = KernelKind::from_str(name).map_err(|_| {
            Error::config(format!(
                "unknown kernel '{name}' (available: {})",
                KernelKind::names().join(", ")
            ))
        })?;

        let kernel = match kind {
            KernelKind::Delta => ConvolutionKernel::Delta,
            KernelKind::Constant => ConvolutionKernel::Constant {
                rows: size_param(kind, params, "rows", 3)?,
                cols: size_param(kind, params, "cols", 3)?,
            },
            KernelKind::Gaussian => {
                let sigma = required(kind, params, "sigma")?;
                ConvolutionKernel::Gaussian {
                    sigma_x: optional(params, "sigma_x", sigma),
                    sigma_y: optional(params, "sigma_y", sigma),
                }
            }
            KernelKind::Annular => ConvolutionKernel::Annular {
                r1: required(kind, params, "r1")?,
                r2: required(kind, params, "r2")?,
            },
            KernelKind::EnhancedAnnular => ConvolutionKernel::EnhancedAnnular {
                r1: required(kind, params, "r1")?,
                r2: required(kind, params, "r2")?,
                r3: required(kind, params, "r3")?,
            },
        };
        kernel.validate()?;
        Ok(kernel)
    }

    pub fn kind(&self) -> KernelKind {
        match self {
            ConvolutionKernel::Delta => KernelKind::Delta,
            ConvolutionKernel::Constant { .. } => KernelKind::Constant,
            ConvolutionKernel::Gaussian { .. } => KernelKind::Gaussian,
            ConvolutionKernel::Annular { .. } => KernelKind::Annular,
            ConvolutionKernel::EnhancedAnnular { .. } => KernelKind::EnhancedAnnular,
        }
    }

    /// Check parameter ranges independent of the frame shape.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        let positive = |key: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::config(format!("kernel '{kind}': '{key}' must be positive, got {v}")))
            }
        };
        match *self {
            ConvolutionKernel::Delta => Ok(()),
            ConvolutionKernel::Constant { rows, cols } => {
                if rows == 0 || cols == 0 {
                    return Err(Error::config(format!(
                        "kernel '{kind}': size must be positive, got {rows}x{cols}"
                    )));
                }
                Ok(())
            }
            ConvolutionKernel::Gaussian { sigma_x, sigma_y } => {
                positive("sigma_x", sigma_x)?;
                positive("sigma_y", sigma_y)
            }
            ConvolutionKernel::Annular { r1, r2 } => {
                if !(r1.is_finite() && r1 >= 0.0) {
                    return Err(Error::config(format!("kernel '{kind}': invalid r1 {r1}")));
                }
                positive("r2", r2)?;
                if r1 >= r2 {
                    return Err(Error::config(format!(
                        "kernel '{kind}': r1 ({r1}) must be < r2 ({r2})"
                    )));
                }
                Ok(())
            }
            ConvolutionKernel::EnhancedAnnular { r1, r2, r3 } => {
                if !(r1.is_finite() && r1 >= 0.0) {
                    return Err(Error::config(format!("kernel '{kind}': invalid r1 {r1}")));
                }
                positive("r3", r3)?;
                if !(r1 < r2 && r2 < r3) {
                    return Err(Error::config(format!(
                        "kernel '{kind}': radii must satisfy r1 < r2 < r3, got {r1}, {r2}, {r3}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Support radius in pixels. Detections closer than this to the detector
    /// edge see wrapped-around data.
    pub fn half_size(&self) -> usize {
        match *self {
            ConvolutionKernel::Delta => 0,
            ConvolutionKernel::Constant { rows, cols } => rows.max(cols) / 2,
            ConvolutionKernel::Gaussian { sigma_x, sigma_y } => (3.0 * sigma_x.max(sigma_y)).ceil() as usize,
            ConvolutionKernel::Annular { r2, .. } => r2.ceil() as usize,
            ConvolutionKernel::EnhancedAnnular { r3, .. } => r3.ceil() as usize,
        }
    }

    /// Filter matrix for a `rows x cols` frame, row-major, zero offset at
    /// index 0.
    pub fn produce(&self, rows: usize, cols: usize) -> Result<Vec<f64>> {
        self.validate()?;
        if rows == 0 || cols == 0 {
            return Err(Error::config(format!("cannot build a kernel for a {rows}x{cols} frame")));
        }

        let mut k = vec![0.0f64; rows * cols];
        match *self {
            ConvolutionKernel::Delta => {
                k[0] = 1.0;
            }
            ConvolutionKernel::Constant {
                rows: kr,
                cols: kc,
            } => {
                if kr > rows || kc > cols {
                    return Err(Error::config(format!(
                        "box kernel {kr}x{kc} larger than frame {rows}x{cols}"
                    )));
                }
                let weight = 1.0 / (kr * kc) as f64;
                let r0 = -(((kr - 1) / 2) as isize);
                let c0 = -(((kc - 1) / 2) as isize);
                for dy in r0..r0 + kr as isize {
                    for dx in c0..c0 + kc as isize {
                        let i = dy.rem_euclid(rows as isize) as usize;
                        let j = dx.rem_euclid(cols as isize) as usize;
                        k[i * cols + j] = weight;
                    }
                }
            }
            ConvolutionKernel::Gaussian { sigma_x, sigma_y } => {
                let (ax, ay) = (0.5 / (sigma_x * sigma_x), 0.5 / (sigma_y * sigma_y));
                fill_radial(&mut k, rows, cols, |dx, dy| (-(ax * dx * dx + ay * dy * dy)).exp());
                normalize(&mut k);
            }
            ConvolutionKernel::Annular { r1, r2 } => {
                fill_radial(&mut k, rows, cols, |dx, dy| {
                    let r = dx.hypot(dy);
                    if r >= r1 && r <= r2 { 1.0 } else { 0.0 }
                });
                if normalize(&mut k) == 0.0 {
                    return Err(Error::config(format!("annular kernel r1={r1} r2={r2} covers no pixels")));
                }
            }
            ConvolutionKernel::EnhancedAnnular { r1, r2, r3 } => {
                let mut bkg = vec![0.0f64; rows * cols];
                fill_radial(&mut k, rows, cols, |dx, dy| if dx.hypot(dy) <= r1 { 1.0 } else { 0.0 });
                fill_radial(&mut bkg, rows, cols, |dx, dy| {
                    let r = dx.hypot(dy);
                    if r > r2 && r <= r3 { 1.0 } else { 0.0 }
                });
                let n_peak = normalize(&mut k);
                let n_bkg = normalize(&mut bkg);
                if n_peak == 0.0 || n_bkg == 0.0 {
                    return Err(Error::config(format!(
                        "enhanced annular kernel r1={r1} r2={r2} r3={r3} has an empty region for a {rows}x{cols} frame"
                    )));
                }
                for (p, b) in k.iter_mut().zip(bkg.iter()) {
                    *p -= b;
                }
            }
        }
        Ok(k)
    }
}

/// Signed offset of index `i` on a circular axis of length `n`.
#[inline]
fn wrapped_offset(i: usize, n: usize) -> f64 {
    if i <= n / 2 {
        i as f64
    } else {
        i as f64 - n as f64
    }
}

fn fill_radial(k: &mut [f64], rows: usize, cols: usize, f: impl Fn(f64, f64) -> f64) {
    for i in 0..rows {
        let dy = wrapped_offset(i, rows);
        for j in 0..cols {
            k[i * cols + j] = f(wrapped_offset(j, cols), dy);
        }
    }
}

/// Scale to unit sum, returning the sum before scaling.
fn normalize(k: &mut [f64]) -> f64 {
    let sum: f64 = k.iter().sum();
    if sum > 0.0 {
        k.iter_mut().for_each(|v| *v /= sum);
    }
    sum
}
