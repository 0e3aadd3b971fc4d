//! Zernike polynomial evaluation for modal pupil aberrations.
//!
//! Modes follow Noll's ordering. The evaluator is bound to a grid at
//! construction and precomputes one surface per mode, so re-evaluating the
//! pupil phase during recovery is a weighted sum rather than a rebuild.

use ndarray::{Array1, Array2};
use thiserror::Error;

/// The maximum Zernike radial degree that can be used to model a pupil.
///
/// Degree 3 covers the first 10 Noll modes; the basis conditioning degrades
/// beyond that for this use case.
pub const MAX_RADIAL_DEGREE: usize = 3;

/// The maximum number of Zernike coefficients that can be used to model a
/// pupil, i.e. every mode up to radial degree 3.
pub const MAX_NUM_COEFFS: usize = 10;

#[derive(Debug, Error)]
pub enum ZernikeError {
    #[error("the maximum radial degree is {max}; received {degree}")]
    RadialDegreeTooHigh { degree: usize, max: usize },
    #[error("expected at most {max} weights; got {got}")]
    TooManyWeights { got: usize, max: usize },
    #[error("mode index {index} is out of bounds for {num_modes} modes")]
    ModeOutOfBounds { index: usize, num_modes: usize },
}

/// Evaluates weighted sums of Zernike modes on a fixed cartesian grid.
///
/// Grid samples outside the unit disk evaluate to zero for every mode.
#[derive(Clone, Debug)]
pub struct Zernike {
    modes: Vec<Array2<f64>>,
    shape: (usize, usize),
}

impl Zernike {
    /// Builds an evaluator over `shape` grid points spanning `x_range` by
    /// `y_range`, with all modes up to `radial_degree`.
    ///
    /// The caller chooses the ranges so that the physical aperture radius maps
    /// to a radial distance of 1.
    pub fn new(
        x_range: (f64, f64),
        y_range: (f64, f64),
        shape: (usize, usize),
        radial_degree: usize,
    ) -> Result<Self, ZernikeError> {
        if radial_degree > MAX_RADIAL_DEGREE {
            return Err(ZernikeError::RadialDegreeTooHigh {
                degree: radial_degree,
                max: MAX_RADIAL_DEGREE,
            });
        }

        let num_modes = (radial_degree + 1) * (radial_degree + 2) / 2;
        let x = Array1::linspace(x_range.0, x_range.1, shape.1);
        let y = Array1::linspace(y_range.0, y_range.1, shape.0);

        let modes = (1..=num_modes)
            .map(|noll| {
                Array2::from_shape_fn(shape, |(r, c)| eval_noll_mode(noll, x[c], y[r]))
            })
            .collect();

        Ok(Self { modes, shape })
    }

    /// Number of modes held by this evaluator.
    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Evaluates the weighted mode sum on the grid.
    ///
    /// `weights[0]` corresponds to Noll index 1, `weights[1]` to Noll index 2,
    /// and so on. Vectors shorter than the mode count are treated as
    /// zero-padded; longer vectors are an error.
    pub fn eval(&self, weights: &[f64]) -> Result<Array2<f64>, ZernikeError> {
        if weights.len() > self.num_modes() {
            return Err(ZernikeError::TooManyWeights {
                got: weights.len(),
                max: self.num_modes(),
            });
        }

        let mut surface = Array2::zeros(self.shape);
        for (&w, mode) in weights.iter().zip(&self.modes) {
            if w == 0.0 {
                continue;
            }
            surface.zip_mut_with(mode, |s, &m| *s += w * m);
        }

        Ok(surface)
    }

    /// The surface of a single unit-amplitude mode.
    ///
    /// `index` is 0-based; index 0 corresponds to Noll index 1.
    pub fn unit_mode(&self, index: usize) -> Result<&Array2<f64>, ZernikeError> {
        self.modes
            .get(index)
            .ok_or(ZernikeError::ModeOutOfBounds {
                index,
                num_modes: self.num_modes(),
            })
    }

    /// Converts a 1-based Noll index to `(radial, azimuthal)` Zernike degrees.
    pub fn noll_to_zernike(noll_index: usize) -> (usize, i64) {
        let n = ((2.0 * noll_index as f64 - 1.0).sqrt() + 0.5) as usize - 1;
        let m = if n % 2 == 1 {
            2 * ((2 * (noll_index + 1) - n * (n + 1)) as i64 / 4) - 1
        } else {
            2 * ((2 * noll_index + 1 - n * (n + 1)) as i64 / 4)
        };
        let sign = if noll_index % 2 == 1 { -1 } else { 1 };
        (n, m * sign)
    }
}

fn eval_noll_mode(noll: usize, x: f64, y: f64) -> f64 {
    let rho = x.hypot(y);
    if rho > 1.0 {
        return 0.0;
    }

    let (n, m) = Zernike::noll_to_zernike(noll);
    let m_abs = m.unsigned_abs() as usize;
    let theta = y.atan2(x);

    // Noll normalisation: orthonormal over the unit disk
    let norm = if m == 0 {
        ((n + 1) as f64).sqrt()
    } else {
        (2.0 * (n + 1) as f64).sqrt()
    };

    let angular = if m == 0 {
        1.0
    } else if m < 0 {
        (m_abs as f64 * theta).sin()
    } else {
        (m_abs as f64 * theta).cos()
    };

    norm * radial_polynomial(n, m_abs, rho) * angular
}

fn radial_polynomial(n: usize, m: usize, rho: f64) -> f64 {
    let mut sum = 0.0;
    for s in 0..=((n - m) / 2) {
        let sign = if s % 2 == 0 { 1.0 } else { -1.0 };
        let coeff = sign * factorial(n - s)
            / (factorial(s) * factorial((n + m) / 2 - s) * factorial((n - m) / 2 - s));
        sum += coeff * rho.powi((n - 2 * s) as i32);
    }
    sum
}

fn factorial(k: usize) -> f64 {
    (1..=k).map(|v| v as f64).product()
}
