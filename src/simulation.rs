//! Forward-model simulation of a Fourier ptychography acquisition.
//!
//! Runs the mirror image of the recovery engine's per-measurement step: for
//! each illumination angle, a pupil-filtered window of the ground truth
//! spectrum is transformed back to real space and its magnitude recorded as
//! the measurement. The same slice addressing and centered-transform
//! conventions as the recovery engine are used throughout, so a simulated
//! dataset is exactly consistent with what the engine inverts.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, Axis, Zip};
use num_complex::Complex;
use tracing::debug;

use crate::calibration::{calibrate_rectangular_matrix, LedIndex, Wavevector};
use crate::dataset::FpDataset;
use crate::fft2::{fft2_centered, ifft2_centered};
use crate::pupil::Pupil;
use crate::slice::slice_fft;
use crate::RecoveryError;

/// Parameters of a simulated acquisition.
///
/// The defaults describe a 256 by 256 ground truth imaged through a 10x /
/// 0.288 NA system onto 64 by 64 measurements, illuminated by a 16 by 16 LED
/// matrix 50 mm behind the sample. Lengths are in microns.
#[derive(Clone, Debug)]
pub struct SimulationSettings {
    pub gt_img_size: usize,
    pub upsampling_factor: usize,
    pub px_size: f64,
    pub wavelength: f64,
    pub mag: f64,
    pub na: f64,
    pub num_leds: (usize, usize),
    pub center_led: (i64, i64),
    pub led_pitch: (f64, f64),
    pub axial_offset: f64,
    pub phase_range: (f64, f64),
    pub zernike_coeffs: Option<Vec<f64>>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            gt_img_size: 256,
            upsampling_factor: 4,
            px_size: 11.0,
            wavelength: 0.488,
            mag: 10.0,
            na: 0.288,
            num_leds: (16, 16),
            center_led: (8, 8),
            led_pitch: (4000.0, 4000.0),
            axial_offset: -50_000.0,
            phase_range: (0.0, 2.0 * PI),
            zernike_coeffs: None,
        }
    }
}

/// Simulates a Fourier ptychography dataset.
///
/// Returns the dataset, an unaberrated pupil to start a reconstruction from,
/// the ground truth object, and the ground truth pupil that produced the
/// measurements. Measurements come out sorted by illumination angle, lowest
/// first.
pub fn fp_simulation(
    settings: &SimulationSettings,
) -> Result<(FpDataset, Pupil, Array2<Complex<f64>>, Pupil), RecoveryError> {
    let gt = ground_truth(settings.gt_img_size, settings.phase_range);

    let led_indexes = generate_led_indexes(settings.center_led, settings.num_leds);
    let calibration = calibrate_rectangular_matrix(
        &led_indexes,
        settings.center_led,
        settings.led_pitch,
        (0.0, 0.0),
        settings.axial_offset,
        0.0,
        settings.wavelength,
        true,
    );

    // the measurements and the pupil are upsampling_factor times smaller than
    // the ground truth in each dimension
    let dataset_size = settings.gt_img_size / settings.upsampling_factor;
    let gt_pupil = Pupil::from_system_params(
        dataset_size,
        settings.px_size,
        settings.wavelength,
        settings.mag,
        settings.na,
        settings.zernike_coeffs.as_deref(),
    )?;

    let images = generate_simulated_images(&gt, &calibration, &gt_pupil)?;

    let mut wavevectors = Array2::zeros((calibration.len(), 3));
    let mut led_index_array = Array2::zeros((calibration.len(), 2));
    for (n, ((i, j), wv)) in calibration.iter().enumerate() {
        wavevectors[[n, 0]] = wv[0];
        wavevectors[[n, 1]] = wv[1];
        wavevectors[[n, 2]] = wv[2];
        led_index_array[[n, 0]] = *i;
        led_index_array[[n, 1]] = *j;
    }
    let dataset = FpDataset::new(images, wavevectors, led_index_array)?;

    let pupil = Pupil::from_system_params(
        dataset_size,
        settings.px_size,
        settings.wavelength,
        settings.mag,
        settings.na,
        None,
    )?;

    debug!(
        num_measurements = dataset.len(),
        dataset_size, "simulated dataset"
    );

    Ok((dataset, pupil, gt, gt_pupil))
}

/// Generates the LED indexes of a rectangular matrix around `center_led`.
pub fn generate_led_indexes(center_led: (i64, i64), num_leds: (usize, usize)) -> Vec<LedIndex> {
    let low_i = center_led.0 - num_leds.0 as i64 / 2;
    let high_i = center_led.0 + num_leds.0 as i64 / 2;
    let low_j = center_led.1 - num_leds.1 as i64 / 2;
    let high_j = center_led.1 + num_leds.1 as i64 / 2;

    (low_i..high_i)
        .flat_map(|i| (low_j..high_j).map(move |j| (i, j)))
        .collect()
}

/// Runs the forward model for every calibrated LED.
///
/// Fails with the same geometry error as the recovery engine when a spectrum
/// window falls outside the ground truth spectrum, which happens when the
/// ground truth is too small for the illumination angles present.
pub fn generate_simulated_images(
    gt: &Array2<Complex<f64>>,
    calibration: &[(LedIndex, Wavevector)],
    pupil: &Pupil,
) -> Result<Array3<f64>, RecoveryError> {
    let dataset_size = pupil.p().shape()[0];
    let gt_fft = fft2_centered(gt.clone());

    let mut images = Array3::zeros((calibration.len(), dataset_size, dataset_size));
    for (n, (_, wavevector)) in calibration.iter().enumerate() {
        let kx_px = (wavevector[0] / pupil.dk()).round() as i64;
        let ky_px = (wavevector[1] / pupil.dk()).round() as i64;

        let region = slice_fft(gt_fft.dim(), (kx_px, ky_px), dataset_size);
        if region.shape() != (dataset_size, dataset_size) {
            return Err(RecoveryError::SliceOutOfBounds {
                actual: region.shape(),
                expected: (dataset_size, dataset_size),
            });
        }

        // copy the window, then low-pass filter it with the pupil
        let mut window = region.view(&gt_fft).to_owned();
        Zip::from(&mut window)
            .and(pupil.p())
            .for_each(|w, &p| *w *= p);

        let field = ifft2_centered(window);
        Zip::from(images.index_axis_mut(Axis(0), n))
            .and(&field)
            .for_each(|img, f| *img = f.norm());
    }

    Ok(images)
}

/// Generates a smooth, band-limited complex object for testing.
///
/// Amplitude and phase are built from periodic analytic patterns so the
/// object has no edge discontinuities; the phase texture is rescaled into
/// `phase_range`.
pub fn ground_truth(size: usize, phase_range: (f64, f64)) -> Array2<Complex<f64>> {
    let n = size as f64;

    Array2::from_shape_fn((size, size), |(r, c)| {
        let y = r as f64 / n;
        let x = c as f64 / n;

        let blob = (-((x - 0.35) * (x - 0.35) + (y - 0.6) * (y - 0.6)) / 0.02).exp();
        let amplitude = 0.6
            + 0.15 * (2.0 * PI * 3.0 * x).sin() * (2.0 * PI * 2.0 * y).cos()
            + 0.1 * (2.0 * PI * (x + 2.0 * y)).cos()
            + 0.15 * blob;

        // phase texture in [0, 1], mapped into the requested range
        let texture = 0.5
            + 0.25 * (2.0 * PI * 2.0 * x).sin()
            + 0.25 * (2.0 * PI * 3.0 * y).cos();
        let phase = phase_range.0 + (phase_range.1 - phase_range.0) * texture;

        Complex::new(0.0, phase).exp() * amplitude
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_simulation_produces_a_consistent_dataset() {
        let settings = SimulationSettings::default();

        let (dataset, pupil, gt, gt_pupil) = fp_simulation(&settings).unwrap();

        assert_eq!(dataset.len(), 256);
        assert_eq!(dataset.shape(), (256, 64, 64));
        assert_eq!(gt.dim(), (256, 256));
        assert_eq!(pupil.p().dim(), (64, 64));
        assert_eq!(gt_pupil.p().dim(), (64, 64));
        assert!(dataset.images().iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn too_little_upsampling_is_a_geometry_error() {
        let settings = SimulationSettings {
            upsampling_factor: 2,
            ..SimulationSettings::default()
        };

        let err = fp_simulation(&settings).unwrap_err();

        assert!(matches!(err, RecoveryError::SliceOutOfBounds { .. }));
    }

    #[test]
    fn led_indexes_cover_the_full_matrix() {
        let indexes = generate_led_indexes((8, 8), (16, 16));

        assert_eq!(indexes.len(), 256);
        assert!(indexes.contains(&(0, 0)));
        assert!(indexes.contains(&(15, 15)));
        assert!(!indexes.contains(&(16, 0)));
    }

    #[test]
    fn ground_truth_amplitude_is_positive() {
        let gt = ground_truth(64, (0.0, 2.0 * PI));

        assert!(gt.iter().all(|v| v.norm() > 0.0));
    }

    #[test]
    fn measurements_are_sorted_by_illumination_angle() {
        let settings = SimulationSettings {
            gt_img_size: 128,
            num_leds: (8, 8),
            center_led: (4, 4),
            ..SimulationSettings::default()
        };

        let (dataset, _, _, _) = fp_simulation(&settings).unwrap();

        let transverse: Vec<f64> = dataset
            .iter()
            .map(|m| m.wavevector[0].hypot(m.wavevector[1]))
            .collect();
        assert!(transverse.windows(2).all(|w| w[0] <= w[1]));
    }
}
