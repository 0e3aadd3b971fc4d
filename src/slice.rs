//! Spectrum slice addressing.
//!
//! Maps an illumination wavevector, expressed in Fourier-plane pixels, to the
//! rectangular window of a larger centered spectrum that a measurement
//! constrains. The addressing is a pure region computation: callers apply the
//! returned region against the one owned spectrum buffer, so window writes are
//! visible to every later measurement in the same pass.

use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};

/// A rectangular window of a 2D spectrum, expressed as index ranges.
///
/// The ranges are already clamped to the source array, so the window's shape
/// may be smaller than requested (or empty) when the requested window extends
/// outside the array. Callers must treat such a shape mismatch as a geometry
/// error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpectrumSlice {
    rows: Range<usize>,
    cols: Range<usize>,
}

impl SpectrumSlice {
    /// Shape of the window as `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.cols.len())
    }

    pub fn view<'a, T>(&self, spectrum: &'a Array2<T>) -> ArrayView2<'a, T> {
        spectrum.slice(s![self.rows.clone(), self.cols.clone()])
    }

    pub fn view_mut<'a, T>(&self, spectrum: &'a mut Array2<T>) -> ArrayViewMut2<'a, T> {
        spectrum.slice_mut(s![self.rows.clone(), self.cols.clone()])
    }
}

/// Addresses the `slice_size` by `slice_size` window of a centered spectrum
/// whose center is offset from the array center by a transverse wavevector.
///
/// `k_px` is `(kx, ky)` in pixels; `kx` shifts the window along columns and
/// `ky` along rows. No bounds are enforced beyond clamping to the array, so a
/// window that does not fit yields a region whose [`SpectrumSlice::shape`]
/// differs from `(slice_size, slice_size)`.
pub fn slice_fft(
    spectrum_shape: (usize, usize),
    k_px: (i64, i64),
    slice_size: usize,
) -> SpectrumSlice {
    let (kx, ky) = k_px;
    SpectrumSlice {
        rows: clamped_range(spectrum_shape.0, ky, slice_size),
        cols: clamped_range(spectrum_shape.1, kx, slice_size),
    }
}

fn clamped_range(len: usize, offset: i64, size: usize) -> Range<usize> {
    let len = len as i64;
    let size = size as i64;
    let low = (len - size).div_euclid(2) + offset;
    let high = (len + size).div_euclid(2) + offset;

    let low = low.max(0).min(len);
    let high = high.max(low).min(len);

    low as usize..high as usize
}
