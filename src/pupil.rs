//! The complex pupil function of the imaging system.

use std::f64::consts::PI;

use ndarray::{Array2, Zip};
use num_complex::Complex;
use thiserror::Error;

use crate::zernike::{Zernike, ZernikeError, MAX_NUM_COEFFS};

#[derive(Debug, Error)]
pub enum PupilError {
    #[error("expected a pupil of shape {expected:?}; got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error(transparent)]
    Zernike(#[from] ZernikeError),
}

/// The optical system's transfer function on a centered pixel grid, together
/// with its Fourier-plane sampling constants.
///
/// Every sample at a pixel radius greater than `pupil_radius_px` from the grid
/// center is exactly zero. Construction enforces this, and [`Pupil::set`]
/// re-enforces it after every replacement of the samples, so the hard aperture
/// constraint holds at all observable points in time.
#[derive(Clone, Debug)]
pub struct Pupil {
    p: Array2<Complex<f64>>,
    k_s: f64,
    dk: f64,
    pupil_radius_px: i64,
    zernike: Zernike,
}

impl Pupil {
    /// Computes a pupil from the microscope system parameters.
    ///
    /// * `num_px` - number of pixels along each side of the (square) grid
    /// * `px_size` - physical size of a camera pixel
    /// * `wavelength` - illumination wavelength, in the same unit as `px_size`
    /// * `mag` - magnification of the full imaging system
    /// * `na` - numerical aperture of the objective
    /// * `zernike_coeffs` - aberration coefficients, `[0]` being Noll index 1;
    ///   `None` produces a flat-phase disk. Missing trailing modes are treated
    ///   as zero; more than [`MAX_NUM_COEFFS`] coefficients is an error.
    pub fn from_system_params(
        num_px: usize,
        px_size: f64,
        wavelength: f64,
        mag: f64,
        na: f64,
        zernike_coeffs: Option<&[f64]>,
    ) -> Result<Self, PupilError> {
        // the size of a pixel in the sample plane
        let dx = px_size / mag;

        // sampling angular frequency in the sample plane
        let k_s = 2.0 * PI / dx;

        // the size of a pixel in the Fourier plane
        let dk = k_s / num_px as f64;

        // pupil radius in the Fourier plane in pixels
        // k_cutoff = 2 * pi * NA / wavelength
        let pupil_radius_px = (2.0 * PI * na / wavelength / dk).floor() as i64;

        let zeros = [0.0; MAX_NUM_COEFFS];
        let coeffs = zernike_coeffs.unwrap_or(&zeros);

        let radial_degree = if coeffs.is_empty() {
            crate::zernike::MAX_RADIAL_DEGREE
        } else {
            Zernike::noll_to_zernike(coeffs.len()).0
        };

        // the aperture radius maps to a radial distance of 1
        let half_extent = num_px as f64 / pupil_radius_px as f64 / 2.0;
        let zernike = Zernike::new(
            (-half_extent, half_extent),
            (-half_extent, half_extent),
            (num_px, num_px),
            radial_degree,
        )?;
        let phase = zernike.eval(coeffs)?;

        let mut p = Array2::from_elem((num_px, num_px), Complex::new(1.0, 0.0));
        Zip::from(&mut p)
            .and(&phase)
            .for_each(|e, &ph| *e = Complex::new(0.0, ph).exp());
        apply_aperture(&mut p, pupil_radius_px);

        Ok(Self {
            p,
            k_s,
            dk,
            pupil_radius_px,
            zernike,
        })
    }

    pub fn p(&self) -> &Array2<Complex<f64>> {
        &self.p
    }

    /// Sampling angular frequency in the sample plane.
    pub fn k_s(&self) -> f64 {
        self.k_s
    }

    /// The size of a pixel in the Fourier plane.
    pub fn dk(&self) -> f64 {
        self.dk
    }

    /// Hard aperture cutoff radius in Fourier-plane pixels.
    pub fn pupil_radius_px(&self) -> i64 {
        self.pupil_radius_px
    }

    /// The Zernike evaluator bound to this pupil's grid and radius.
    pub fn zernike(&self) -> &Zernike {
        &self.zernike
    }

    /// Replaces the pupil samples.
    ///
    /// The replacement must match the current shape; a mismatch is rejected
    /// before any write. On success the hard aperture mask is re-applied, so
    /// anything the caller wrote outside the pupil radius is zeroed.
    pub fn set(&mut self, pupil: Array2<Complex<f64>>) -> Result<(), PupilError> {
        if pupil.dim() != self.p.dim() {
            return Err(PupilError::ShapeMismatch {
                expected: self.p.dim(),
                actual: pupil.dim(),
            });
        }

        self.p = pupil;
        apply_aperture(&mut self.p, self.pupil_radius_px);

        Ok(())
    }
}

fn apply_aperture(p: &mut Array2<Complex<f64>>, radius_px: i64) {
    let half_rows = (p.shape()[0] / 2) as i64;
    let half_cols = (p.shape()[1] / 2) as i64;

    Zip::indexed(p).par_for_each(|(r, c), e| {
        let y = r as i64 - half_rows;
        let x = c as i64 - half_cols;
        if x * x + y * y > radius_px * radius_px {
            *e = Complex::new(0.0, 0.0);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_PX: usize = 64;

    fn fake_pupil() -> Pupil {
        Pupil::from_system_params(NUM_PX, 5.86, 0.488, 10.0, 0.288, None).unwrap()
    }

    fn assert_aperture_invariant(pupil: &Pupil) {
        let half = (NUM_PX / 2) as i64;
        let r2 = pupil.pupil_radius_px() * pupil.pupil_radius_px();
        for ((r, c), v) in pupil.p().indexed_iter() {
            let y = r as i64 - half;
            let x = c as i64 - half;
            if x * x + y * y > r2 {
                assert_eq!(*v, Complex::new(0.0, 0.0), "non-zero outside aperture");
            }
        }
    }

    #[test]
    fn construction_zeroes_outside_the_aperture() {
        let pupil = fake_pupil();

        assert!(pupil.pupil_radius_px() > 0);
        assert!(pupil.pupil_radius_px() < (NUM_PX / 2) as i64);
        assert_aperture_invariant(&pupil);
    }

    #[test]
    fn unaberrated_pupil_is_one_inside_the_aperture() {
        let pupil = fake_pupil();
        let center = NUM_PX / 2;

        assert_eq!(pupil.p()[[center, center]], Complex::new(1.0, 0.0));
    }

    #[test]
    fn set_reapplies_the_aperture_mask() {
        let mut pupil = fake_pupil();
        let replacement = Array2::from_elem((NUM_PX, NUM_PX), Complex::new(0.5, 0.25));

        pupil.set(replacement).unwrap();

        assert_aperture_invariant(&pupil);
        let center = NUM_PX / 2;
        assert_eq!(pupil.p()[[center, center]], Complex::new(0.5, 0.25));
    }

    #[test]
    fn set_rejects_a_shape_mismatch_without_writing() {
        let mut pupil = fake_pupil();
        let before = pupil.p().clone();
        let replacement = Array2::from_elem((NUM_PX + 1, NUM_PX + 1), Complex::new(0.5, 0.0));

        let err = pupil.set(replacement).unwrap_err();

        assert!(matches!(err, PupilError::ShapeMismatch { .. }));
        assert_eq!(pupil.p(), &before);
    }

    #[test]
    fn missing_trailing_noll_coefficients_are_accepted() {
        // Noll indexes 8, 9, and 10 are missing for radial degree 3
        let coeffs = [0.3, 0.5, 0.3, 0.6, 0.8, 0.3, 0.1];

        let pupil =
            Pupil::from_system_params(NUM_PX, 5.86, 0.488, 10.0, 0.288, Some(&coeffs)).unwrap();

        assert_aperture_invariant(&pupil);
    }

    #[test]
    fn too_many_coefficients_is_an_error() {
        let coeffs = [0.1; MAX_NUM_COEFFS + 1];

        let result = Pupil::from_system_params(NUM_PX, 5.86, 0.488, 10.0, 0.288, Some(&coeffs));

        assert!(matches!(
            result,
            Err(PupilError::Zernike(ZernikeError::RadialDegreeTooHigh { .. }))
        ));
    }

    #[test]
    fn aberrated_pupil_has_unit_magnitude_inside_the_aperture() {
        let coeffs = [0.0, 0.2, -0.1, 0.4];
        let pupil =
            Pupil::from_system_params(NUM_PX, 5.86, 0.488, 10.0, 0.288, Some(&coeffs)).unwrap();
        let center = NUM_PX / 2;

        let v = pupil.p()[[center, center]];
        assert!((v.norm() - 1.0).abs() < 1e-12);
    }
}
