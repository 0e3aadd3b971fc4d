//! Fourier ptychography reconstruction.
//!
//! Recovers a high-resolution complex object (amplitude and phase) and the
//! imaging system's pupil function from a stack of low-resolution intensity
//! images captured under distinct oblique illumination angles.
//!
//! The entry point is [`fp_recover`], which runs the alternating
//! Fourier-domain update loop: each measurement constrains one window of a
//! synthetic high-resolution spectrum through the pupil, the measured
//! amplitude is enforced in real space, and the window is refined with the
//! relaxed (rPIE) projection rule. The pupil can optionally be refined
//! jointly, either by the symmetric rPIE rule or by gradient descent on a
//! Zernike modal expansion of its phase.
//!
//! [`simulation::fp_simulation`] runs the mirror-image forward model to
//! synthesize datasets for testing and validation.

use std::f64::consts::PI;

use ndarray::{Array2, Zip};
use num_complex::Complex;
use thiserror::Error;
use tracing::{debug, info, trace};

pub mod calibration;
pub mod dataset;
pub mod fft2;
pub mod pupil;
pub mod simulation;
pub mod slice;
pub mod zernike;

pub use crate::dataset::{DatasetError, FpDataset, Measurement};
pub use crate::pupil::{Pupil, PupilError};
pub use crate::slice::{slice_fft, SpectrumSlice};
pub use crate::zernike::{Zernike, ZernikeError, MAX_NUM_COEFFS, MAX_RADIAL_DEGREE};

use crate::fft2::{fft2_centered, ifft2_centered};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("dataset images must be square; got {rows} by {cols}")]
    NonSquareImages { rows: usize, cols: usize },
    #[error(
        "a slice of the target spectrum lies outside its bounds: got shape \
         {actual:?}, expected {expected:?}; the upsampling factor is likely \
         too small for the illumination angles present"
    )]
    SliceOutOfBounds {
        actual: (usize, usize),
        expected: (usize, usize),
    },
    #[error(transparent)]
    Pupil(#[from] PupilError),
    #[error(transparent)]
    Zernike(#[from] ZernikeError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// How the pupil estimate evolves during recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PupilRecoveryMethod {
    /// Leave the initial pupil estimate untouched.
    Disabled,
    /// Relaxed-projection update, symmetric to the object update.
    Rpie,
    /// Gradient descent on the Zernike modal expansion of the pupil phase.
    GradientDescent,
}

/// Tuning parameters of a reconstruction.
#[derive(Clone, Debug)]
pub struct RecoverySettings {
    /// Number of outer passes over the full dataset.
    pub num_iterations: usize,
    pub method: PupilRecoveryMethod,
    /// Ratio of recovered-object pixels to measurement pixels per axis. Must
    /// be large enough that every measurement's spectrum window stays inside
    /// the target spectrum.
    pub upsampling_factor: usize,
    /// rPIE relaxation parameter for the object update.
    pub alpha_o: f64,
    /// rPIE relaxation parameter for the pupil update; only used with
    /// [`PupilRecoveryMethod::Rpie`].
    pub alpha_p: f64,
    /// Number of Zernike modes to refine; only used with
    /// [`PupilRecoveryMethod::GradientDescent`].
    pub num_zernike_coeffs: usize,
    /// Gradient descent step size; only used with
    /// [`PupilRecoveryMethod::GradientDescent`].
    pub learning_rate: f64,
    /// Log per-pass progress at info level instead of debug.
    pub progress: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            num_iterations: 10,
            method: PupilRecoveryMethod::Disabled,
            upsampling_factor: 4,
            alpha_o: 1.0,
            alpha_p: 1.0,
            num_zernike_coeffs: MAX_NUM_COEFFS,
            learning_rate: 1e-4,
            progress: false,
        }
    }
}

/// The results of a reconstruction.
#[derive(Clone, Debug)]
pub struct FpResults {
    /// The recovered complex object.
    pub object: Array2<Complex<f64>>,
    /// The final pupil estimate.
    pub pupil: Pupil,
    /// Per-measurement gradient magnitudes; populated only under
    /// [`PupilRecoveryMethod::GradientDescent`].
    pub gradients: Option<Vec<f64>>,
    /// Per-measurement snapshots of the Zernike coefficient vector; populated
    /// only under [`PupilRecoveryMethod::GradientDescent`].
    pub zernike_coeffs: Option<Vec<Vec<f64>>>,
}

/// Reconstructs a complex object and pupil from a Fourier ptychography
/// dataset.
///
/// The initial object estimate is the upsampled mean of all measurements; the
/// supplied pupil seeds the pupil estimate and is never mutated. Measurements
/// are visited in the dataset's stored order, every pass, so updates from
/// earlier measurements are seen by later ones within the same pass.
///
/// Fails without partial results on non-square measurement images or when a
/// spectrum window falls outside the target spectrum (an upsampling factor
/// too small for the dataset's illumination angles).
pub fn fp_recover(
    dataset: &FpDataset,
    pupil: &Pupil,
    settings: &RecoverySettings,
) -> Result<FpResults, RecoveryError> {
    let (_, rows, cols) = dataset.shape();
    if rows != cols {
        return Err(RecoveryError::NonSquareImages { rows, cols });
    }
    let size_px = rows;

    // Though the target is upsampled, the Fourier-plane pixel pitch dk is
    // unchanged: upsampling adds pixels to the FFT, it does not refine
    // k-space resolution. The wavevector-to-pixel conversion therefore uses
    // the pupil's dk for every grid involved.
    let target = upsample(&dataset.mean_image(), settings.upsampling_factor);
    let mut target_fft = fft2_centered(target.mapv(|v| Complex::new(v, 0.0)));
    let mut target_pupil = pupil.clone();

    let gd = GdState::prepare(settings, &target_pupil)?;
    let mut gd = match gd {
        Some(state) => state,
        None => GdState::empty(),
    };

    for pass in 0..settings.num_iterations {
        if settings.progress {
            info!(pass, total = settings.num_iterations, "recovery pass");
        } else {
            debug!(pass, total = settings.num_iterations, "recovery pass");
        }

        for m in dataset.iter() {
            let kx_px = (m.wavevector[0] / target_pupil.dk()).round() as i64;
            let ky_px = (m.wavevector[1] / target_pupil.dk()).round() as i64;
            trace!(kx_px, ky_px, "measurement update");

            let region = slice_fft(target_fft.dim(), (kx_px, ky_px), size_px);
            if region.shape() != (size_px, size_px) {
                return Err(RecoveryError::SliceOutOfBounds {
                    actual: region.shape(),
                    expected: (size_px, size_px),
                });
            }

            // filter the spectrum window with the pupil
            let mut low_res_fft = region.view(&target_fft).to_owned();
            Zip::from(&mut low_res_fft)
                .and(target_pupil.p())
                .for_each(|e, &p| *e *= p);

            let low_res_img = ifft2_centered(low_res_fft.clone());

            // replace the magnitude of the estimated field with the measured
            // amplitude; keep the phase untouched
            let constrained = Zip::from(&low_res_img)
                .and(&m.image)
                .map_collect(|e, &a| Complex::new(0.0, e.arg()).exp() * a.abs());
            let next_low_res_fft = fft2_centered(constrained);

            // rPIE object update, applied through the window so later
            // measurements in this pass see it
            let p_max_sq = max_norm_sqr(target_pupil.p());
            {
                let mut window = region.view_mut(&mut target_fft);
                Zip::from(&mut window)
                    .and(target_pupil.p())
                    .and(&next_low_res_fft)
                    .and(&low_res_fft)
                    .for_each(|w, &p, &next, &prev| {
                        let denom =
                            (1.0 - settings.alpha_o) * p.norm_sqr() + settings.alpha_o * p_max_sq;
                        *w += p.conj() / denom * (next - prev);
                    });
            }

            match settings.method {
                PupilRecoveryMethod::Disabled => {}
                PupilRecoveryMethod::Rpie => {
                    let window = region.view(&target_fft);
                    let s_max_sq = max_norm_sqr(&window.to_owned());

                    let mut new_pupil = target_pupil.p().clone();
                    Zip::from(&mut new_pupil)
                        .and(&window)
                        .and(&next_low_res_fft)
                        .and(&low_res_fft)
                        .for_each(|p, &s, &next, &prev| {
                            let denom = (1.0 - settings.alpha_p) * s.norm_sqr()
                                + settings.alpha_p * s_max_sq;
                            *p += s.conj() / denom * (next - prev);
                        });
                    target_pupil.set(new_pupil)?;
                }
                PupilRecoveryMethod::GradientDescent => {
                    gd.update(settings, &region, &target_fft, &mut target_pupil, &m)?;
                }
            }
        }
    }

    // one inverse transform of the final working spectrum
    let object = ifft2_centered(target_fft);

    let (gradients, zernike_coeffs) = gd.into_diagnostics();
    Ok(FpResults {
        object,
        pupil: target_pupil,
        gradients,
        zernike_coeffs,
    })
}

/// Working state of the gradient-descent pupil recovery.
///
/// Modified gradient descent after <https://doi.org/10.1063/1.5090552>: each
/// Zernike coefficient receives an independent scalar gradient derived from an
/// image-domain residual, and the pupil phase is rebuilt wholesale from the
/// coefficient vector after every measurement.
struct GdState {
    coeffs: Vec<f64>,
    unit_modes: Vec<Array2<f64>>,
    gradients: Vec<f64>,
    coeff_log: Vec<Vec<f64>>,
    active: bool,
}

impl GdState {
    fn prepare(
        settings: &RecoverySettings,
        pupil: &Pupil,
    ) -> Result<Option<Self>, RecoveryError> {
        if settings.method != PupilRecoveryMethod::GradientDescent {
            return Ok(None);
        }

        let unit_modes = (0..settings.num_zernike_coeffs)
            .map(|j| pupil.zernike().unit_mode(j).map(Clone::clone))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self {
            coeffs: vec![0.0; settings.num_zernike_coeffs],
            unit_modes,
            gradients: Vec::new(),
            coeff_log: Vec::new(),
            active: true,
        }))
    }

    fn empty() -> Self {
        Self {
            coeffs: Vec::new(),
            unit_modes: Vec::new(),
            gradients: Vec::new(),
            coeff_log: Vec::new(),
            active: false,
        }
    }

    fn update(
        &mut self,
        settings: &RecoverySettings,
        region: &SpectrumSlice,
        target_fft: &Array2<Complex<f64>>,
        target_pupil: &mut Pupil,
        m: &Measurement<'_>,
    ) -> Result<(), RecoveryError> {
        let u_sq = (settings.upsampling_factor * settings.upsampling_factor) as f64;

        // re-derive the low resolution field from the un-corrected window
        let window = region.view(target_fft);
        let mut field_fft = Array2::zeros(window.dim());
        Zip::from(&mut field_fft)
            .and(&window)
            .and(target_pupil.p())
            .for_each(|e, &s, &p| *e = s * p / u_sq);
        let field = ifft2_centered(field_fft.clone());

        // image-domain residual, weighted by the inverse peak-scaled
        // measurement
        let peak = m.image.iter().fold(0.0_f64, |acc, &v| acc.max(u_sq * v));
        let residual = Zip::from(&m.image)
            .and(&field)
            .map_collect(|&v, e| (1.0 - u_sq * v / e.norm()) / peak);

        let mut last_gradient = 0.0;
        for (coeff, mode) in self.coeffs.iter_mut().zip(&self.unit_modes) {
            // perturb with a unit-amplitude version of this mode alone
            let mut perturbed_fft = Array2::zeros(field_fft.dim());
            Zip::from(&mut perturbed_fft)
                .and(&field_fft)
                .and(mode)
                .for_each(|e, &f, &z| *e = f * (PI * z));
            let perturbed = ifft2_centered(perturbed_fft);

            let mut acc = 0.0;
            Zip::from(&residual)
                .and(&field)
                .and(&perturbed)
                .for_each(|&d, e, g| acc += d * (e.conj() * g).im);
            let gradient = 2.0 * acc;

            *coeff += settings.learning_rate * gradient;
            last_gradient = gradient;
        }

        // rebuild the pupil phase wholesale from the coefficient vector,
        // preserving the amplitude
        let phase = target_pupil.zernike().eval(&self.coeffs)?;
        let mut new_pupil = Array2::zeros(target_pupil.p().dim());
        Zip::from(&mut new_pupil)
            .and(target_pupil.p())
            .and(&phase)
            .for_each(|e, p, &ph| {
                *e = Complex::new(0.0, PI * ph).exp() * p.norm();
            });
        target_pupil.set(new_pupil)?;

        self.gradients.push(last_gradient);
        self.coeff_log.push(self.coeffs.clone());

        Ok(())
    }

    fn into_diagnostics(self) -> (Option<Vec<f64>>, Option<Vec<Vec<f64>>>) {
        if self.active {
            (Some(self.gradients), Some(self.coeff_log))
        } else {
            (None, None)
        }
    }
}

fn max_norm_sqr(array: &Array2<Complex<f64>>) -> f64 {
    array.iter().fold(0.0_f64, |acc, v| acc.max(v.norm_sqr()))
}

/// Bilinearly upsamples an image by an integer factor.
fn upsample(image: &Array2<f64>, factor: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let out_shape = (rows * factor, cols * factor);
    let scale = 1.0 / factor as f64;

    let mut out = Array2::zeros(out_shape);
    Zip::indexed(&mut out).par_for_each(|(r, c), e| {
        // map the output pixel center into source coordinates
        let y = (r as f64 + 0.5) * scale - 0.5;
        let x = (c as f64 + 0.5) * scale - 0.5;

        let r0 = y.floor().max(0.0) as usize;
        let c0 = x.floor().max(0.0) as usize;
        let r1 = (r0 + 1).min(rows - 1);
        let c1 = (c0 + 1).min(cols - 1);
        let fy = (y - r0 as f64).max(0.0).min(1.0);
        let fx = (x - c0 as f64).max(0.0).min(1.0);

        *e = image[[r0, c0]] * (1.0 - fy) * (1.0 - fx)
            + image[[r0, c1]] * (1.0 - fy) * fx
            + image[[r1, c0]] * fy * (1.0 - fx)
            + image[[r1, c1]] * fy * fx;
    });

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{fp_simulation, SimulationSettings};
    use ndarray::{Array2, Array3};
    use std::f64::consts::FRAC_PI_2;

    fn fake_dataset(rows: usize, cols: usize) -> FpDataset {
        FpDataset::new(
            Array3::zeros((10, rows, cols)),
            Array2::zeros((10, 3)),
            Array2::zeros((10, 2)),
        )
        .unwrap()
    }

    fn fake_pupil(num_px: usize) -> Pupil {
        Pupil::from_system_params(num_px, 5.86, 0.488, 10.0, 0.288, None).unwrap()
    }

    fn small_simulation() -> SimulationSettings {
        SimulationSettings {
            gt_img_size: 128,
            num_leds: (8, 8),
            center_led: (4, 4),
            phase_range: (0.0, FRAC_PI_2),
            ..SimulationSettings::default()
        }
    }

    fn normalized_cross_correlation(
        a: &Array2<Complex<f64>>,
        b: &Array2<Complex<f64>>,
    ) -> f64 {
        let dot: Complex<f64> = a.iter().zip(b.iter()).map(|(x, y)| x.conj() * y).sum();
        let norm_a: f64 = a.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
        dot.norm() / (norm_a * norm_b)
    }

    #[test]
    fn recover_runs_on_a_blank_dataset() {
        let dataset = fake_dataset(64, 64);
        let pupil = fake_pupil(64);

        let results = fp_recover(&dataset, &pupil, &RecoverySettings::default()).unwrap();

        assert_eq!(results.object.dim(), (256, 256));
        assert!(results.gradients.is_none());
        assert!(results.zernike_coeffs.is_none());
    }

    #[test]
    fn images_must_be_square() {
        let dataset = fake_dataset(64, 63);
        let pupil = fake_pupil(64);

        let err = fp_recover(&dataset, &pupil, &RecoverySettings::default()).unwrap_err();

        assert!(matches!(
            err,
            RecoveryError::NonSquareImages { rows: 64, cols: 63 }
        ));
    }

    #[test]
    fn the_initial_pupil_is_never_mutated() {
        let (dataset, pupil, _, _) = fp_simulation(&small_simulation()).unwrap();
        let before = pupil.p().clone();
        let settings = RecoverySettings {
            num_iterations: 1,
            method: PupilRecoveryMethod::Rpie,
            ..RecoverySettings::default()
        };

        let _ = fp_recover(&dataset, &pupil, &settings).unwrap();

        assert_eq!(pupil.p(), &before);
    }

    #[test]
    fn insufficient_upsampling_is_a_geometry_error() {
        let (dataset, pupil, _, _) = fp_simulation(&small_simulation()).unwrap();

        let failing = RecoverySettings {
            num_iterations: 1,
            upsampling_factor: 2,
            ..RecoverySettings::default()
        };
        let err = fp_recover(&dataset, &pupil, &failing).unwrap_err();
        assert!(matches!(err, RecoveryError::SliceOutOfBounds { .. }));

        let passing = RecoverySettings {
            num_iterations: 1,
            upsampling_factor: 4,
            ..RecoverySettings::default()
        };
        assert!(fp_recover(&dataset, &pupil, &passing).is_ok());
    }

    #[test]
    fn round_trip_recovers_the_object() {
        let settings = SimulationSettings {
            phase_range: (0.0, FRAC_PI_2),
            ..SimulationSettings::default()
        };
        let (dataset, pupil, gt, _) = fp_simulation(&settings).unwrap();

        let recovery = RecoverySettings {
            num_iterations: 5,
            ..RecoverySettings::default()
        };
        let results = fp_recover(&dataset, &pupil, &recovery).unwrap();

        assert_eq!(results.object.dim(), gt.dim());
        let ncc = normalized_cross_correlation(&results.object, &gt);
        assert!(ncc > 0.9, "normalized cross-correlation too low: {}", ncc);
    }

    #[test]
    fn rpie_pupil_recovery_refines_the_pupil() {
        let (dataset, pupil, _, _) = fp_simulation(&small_simulation()).unwrap();
        let settings = RecoverySettings {
            num_iterations: 1,
            method: PupilRecoveryMethod::Rpie,
            ..RecoverySettings::default()
        };

        let results = fp_recover(&dataset, &pupil, &settings).unwrap();

        assert_ne!(results.pupil.p(), pupil.p());
        assert!(results.gradients.is_none());
    }

    #[test]
    fn gradient_descent_records_diagnostics() {
        let (dataset, pupil, _, _) = fp_simulation(&small_simulation()).unwrap();
        let settings = RecoverySettings {
            num_iterations: 1,
            method: PupilRecoveryMethod::GradientDescent,
            num_zernike_coeffs: 5,
            ..RecoverySettings::default()
        };

        let results = fp_recover(&dataset, &pupil, &settings).unwrap();

        let gradients = results.gradients.unwrap();
        let coeffs = results.zernike_coeffs.unwrap();
        assert_eq!(gradients.len(), dataset.len());
        assert_eq!(coeffs.len(), dataset.len());
        assert!(coeffs.iter().all(|c| c.len() == 5));
    }

    #[test]
    fn upsample_preserves_a_constant_image() {
        let image = Array2::from_elem((8, 8), 3.0);

        let up = upsample(&image, 4);

        assert_eq!(up.dim(), (32, 32));
        assert!(up.iter().all(|&v| (v - 3.0).abs() < 1e-12));
    }

    #[test]
    fn upsample_interpolates_between_neighbours() {
        let mut image = Array2::zeros((2, 2));
        image[[0, 0]] = 0.0;
        image[[0, 1]] = 1.0;
        image[[1, 0]] = 0.0;
        image[[1, 1]] = 1.0;

        let up = upsample(&image, 2);

        // output pixel centers at x = 0.25 and 0.75 in source coordinates
        assert!((up[[0, 1]] - 0.25).abs() < 1e-12);
        assert!((up[[0, 2]] - 0.75).abs() < 1e-12);
    }
}
