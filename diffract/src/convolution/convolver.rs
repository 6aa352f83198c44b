use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::ConvolutionKernel;
use crate::frame::Frame;
use crate::{Error, Result};

/// Kernel spectrum and FFT plans for one frame shape.
struct ShapePlan {
    rows: usize,
    cols: usize,
    /// Complex conjugate of the kernel spectrum, so that multiplying turns
    /// convolution into correlation.
    kernel_conj: Vec<Complex<f64>>,
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

/// Applies a kernel to frames as a circular correlation:
/// `out(y, x) = sum k(dy, dx) * in(y + dy, x + dx)` with wrap-around.
///
/// Plans and kernel spectra are cached per frame shape; a convolver is
/// shareable across threads.
pub struct Convolver {
    kernel: ConvolutionKernel,
    plans: Mutex<HashMap<(usize, usize), Arc<ShapePlan>>>,
}

impl std::fmt::Debug for Convolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolver")
            .field("kernel", &self.kernel)
            .field("cached_shapes", &self.cached_shapes())
            .finish()
    }
}

impl Convolver {
    pub fn new(kernel: ConvolutionKernel) -> Result<Self> {
        kernel.validate()?;
        Ok(Self {
            kernel,
            plans: Mutex::new(HashMap::new()),
        })
    }

    pub fn kernel(&self) -> &ConvolutionKernel {
        &self.kernel
    }

    /// Number of frame shapes with a cached spectrum.
    pub fn cached_shapes(&self) -> usize {
        self.plans.lock().len()
    }

    /// Filter a frame.
    pub fn apply(&self, frame: &Frame) -> Result<Vec<f64>> {
        self.apply_values(frame.rows(), frame.cols(), &frame.to_f64())
    }

    /// Filter a row-major `rows x cols` image.
    pub fn apply_values(&self, rows: usize, cols: usize, values: &[f64]) -> Result<Vec<f64>> {
        if values.len() != rows * cols {
            return Err(Error::FrameShape {
                expected: (rows, cols),
                actual: (1, values.len()),
            });
        }
        if matches!(self.kernel, ConvolutionKernel::Delta) {
            return Ok(values.to_vec());
        }

        let plan = self.plan(rows, cols)?;
        let mut data: Vec<Complex<f64>> = values.iter().map(|&v| Complex::new(v, 0.0)).collect();
        fft_2d(&mut data, rows, cols, &plan.row_forward, &plan.col_forward);

        data.par_iter_mut()
            .zip(plan.kernel_conj.par_iter())
            .for_each(|(d, k)| *d *= *k);

        fft_2d(&mut data, rows, cols, &plan.row_inverse, &plan.col_inverse);
        let norm = 1.0 / (rows * cols) as f64;
        Ok(data.iter().map(|c| c.re * norm).collect())
    }

    fn plan(&self, rows: usize, cols: usize) -> Result<Arc<ShapePlan>> {
        if let Some(plan) = self.plans.lock().get(&(rows, cols)) {
            return Ok(Arc::clone(plan));
        }

        let kernel = self.kernel.produce(rows, cols)?;
        let mut planner = FftPlanner::<f64>::new();
        let row_forward = planner.plan_fft_forward(cols);
        let row_inverse = planner.plan_fft_inverse(cols);
        let col_forward = planner.plan_fft_forward(rows);
        let col_inverse = planner.plan_fft_inverse(rows);

        let mut spectrum: Vec<Complex<f64>> = kernel.iter().map(|&v| Complex::new(v, 0.0)).collect();
        fft_2d(&mut spectrum, rows, cols, &row_forward, &col_forward);
        let kernel_conj = spectrum.iter().map(|c| c.conj()).collect();

        tracing::debug!(kind = %self.kernel.kind(), rows, cols, "Built kernel spectrum");

        let plan = Arc::new(ShapePlan {
            rows,
            cols,
            kernel_conj,
            row_forward,
            row_inverse,
            col_forward,
            col_inverse,
        });
        self.plans.lock().insert((rows, cols), Arc::clone(&plan));
        Ok(plan)
    }
}

/// In-place 2D FFT by row-column decomposition; rows run in parallel.
fn fft_2d(
    data: &mut [Complex<f64>],
    rows: usize,
    cols: usize,
    row_fft: &Arc<dyn Fft<f64>>,
    col_fft: &Arc<dyn Fft<f64>>,
) {
    data.par_chunks_mut(cols).for_each(|row| row_fft.process(row));

    let mut transposed = transpose(data, rows, cols);
    transposed
        .par_chunks_mut(rows)
        .for_each(|col| col_fft.process(col));

    let back = transpose(&transposed, cols, rows);
    data.copy_from_slice(&back);
}

/// Transpose a row-major `rows x cols` matrix.
fn transpose(data: &[Complex<f64>], rows: usize, cols: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}
