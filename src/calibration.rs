//! Maps LED lattice coordinates to illumination wavevectors.
//!
//! Two coordinate systems are involved: the local frame of the LED matrix and
//! the global frame of the instrument. The global frame has its origin at the
//! sample plane z = 0, with +z pointing towards the microscope; the matrix
//! sits behind the sample at `z = axial_offset < 0`. All lengths are in the
//! same unit as the wavelength.

use std::cmp::Ordering;
use std::f64::consts::PI;

use tracing::trace;

/// The (col, row) index of an LED on the matrix.
pub type LedIndex = (i64, i64);

/// An illumination wavevector `(kx, ky, kz)` in radians per unit length.
pub type Wavevector = [f64; 3];

/// Computes the wavevectors for a set of LEDs on a rectangular matrix.
///
/// * `led_indexes` - the (col, row) indexes of the LEDs to calibrate
/// * `center_led` - the LED that sits on the matrix origin
/// * `pitch` - horizontal/vertical distance between neighbouring LEDs
/// * `lateral_offset` - (x, y) offset from the global origin to the matrix origin
/// * `axial_offset` - z position of the matrix; negative, behind the sample
/// * `rot_deg` - rotation of the matrix about its central z axis, in degrees
/// * `wavelength` - center wavelength of the LED emission
/// * `sort` - order the result by transverse wavevector magnitude so the
///   lowest-angle illuminations come first
pub fn calibrate_rectangular_matrix(
    led_indexes: &[LedIndex],
    center_led: LedIndex,
    pitch: (f64, f64),
    lateral_offset: (f64, f64),
    axial_offset: f64,
    rot_deg: f64,
    wavelength: f64,
    sort: bool,
) -> Vec<(LedIndex, Wavevector)> {
    let k = 2.0 * PI / wavelength;
    let (sin_t, cos_t) = rot_deg.to_radians().sin_cos();

    let mut calibration: Vec<(LedIndex, Wavevector)> = led_indexes
        .iter()
        .map(|&(i, j)| {
            // LED position in the matrix frame
            let x = (i - center_led.0) as f64 * pitch.0;
            let y = (j - center_led.1) as f64 * pitch.1;

            // rotate about the matrix z axis, then shift into the global frame
            let xg = x * cos_t - y * sin_t + lateral_offset.0;
            let yg = x * sin_t + y * cos_t + lateral_offset.1;

            // direction cosines are negated because the matrix is behind the
            // sample and light travels towards +z
            let r = (xg * xg + yg * yg + axial_offset * axial_offset).sqrt();
            let wavevector = [-k * xg / r, -k * yg / r, -k * axial_offset / r];

            trace!(?wavevector, led = ?(i, j), "calibrated LED");

            ((i, j), wavevector)
        })
        .collect();

    if sort {
        calibration.sort_by(|a, b| {
            let ta = a.1[0].hypot(a.1[1]);
            let tb = b.1[0].hypot(b.1[1]);
            ta.partial_cmp(&tb).unwrap_or(Ordering::Equal)
        });
    }

    calibration
}
