//! Centered 2D FFT helpers used by the reconstruction and the forward model.
//!
//! All transforms use a symmetric `1/sqrt(H*W)` normalisation so a forward
//! transform followed by an inverse transform is the identity.

use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayViewMut1, ArrayViewMut2, Axis, Zip};
use num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{FftDirection, FftPlanner};

pub fn fft2(mut input: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    transform_2d(input.view_mut(), FftDirection::Forward);
    input
}

pub fn ifft2(mut input: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    transform_2d(input.view_mut(), FftDirection::Inverse);
    input
}

/// Forward transform with the zero frequency moved to the array center.
///
/// Equivalent to a plain `fft2` followed by `fft2_shift_inplace`; the pair
/// `fft2_centered`/`ifft2_centered` are exact inverses of each other.
pub fn fft2_centered(input: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    let mut output = fft2(input);
    fft2_shift_inplace(output.view_mut());
    output
}

/// Inverse transform of a spectrum whose zero frequency sits at the center.
pub fn ifft2_centered(mut input: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    ifft2_shift_inplace(input.view_mut());
    ifft2(input)
}

fn transform_2d(mut input: ArrayViewMut2<Complex<f64>>, direction: FftDirection) {
    let mut planner = FftPlanner::new();
    let fft_row = planner.plan_fft(input.shape()[1], direction);
    let fft_col = planner.plan_fft(input.shape()[0], direction);
    let normalisation = 1.0 / ((input.shape()[0] * input.shape()[1]) as f64).sqrt();

    // rows are contiguous and can be transformed in place
    Zip::from(input.rows_mut()).into_par_iter().for_each_init(
        || vec![Zero::zero(); fft_row.get_inplace_scratch_len()],
        |scratch, mut row| {
            fft_row.process_with_scratch(row.0.as_slice_mut().unwrap(), scratch);
        },
    );

    // columns are strided, so each one is staged through a contiguous buffer
    Zip::from(input.columns_mut())
        .into_par_iter()
        .for_each_init(
            || {
                (
                    vec![Zero::zero(); fft_col.len()],
                    vec![Zero::zero(); fft_col.get_inplace_scratch_len()],
                )
            },
            |(buffer, scratch), mut col| {
                for (b, &c) in buffer.iter_mut().zip(col.0.iter()) {
                    *b = c;
                }
                fft_col.process_with_scratch(buffer, scratch);
                for (c, &b) in col.0.iter_mut().zip(buffer.iter()) {
                    *c = b * normalisation;
                }
            },
        );
}

/// Moves the origin (0, 0) to the array center (H/2, W/2).
pub fn fft2_shift_inplace(mut input: ArrayViewMut2<Complex<f64>>) {
    Zip::from(input.lanes_mut(Axis(1))).par_for_each(|row| {
        fft_shift_inplace(row);
    });
    Zip::from(input.lanes_mut(Axis(0))).par_for_each(|col| {
        fft_shift_inplace(col);
    });
}

/// Moves the array center (H/2, W/2) back to the origin (0, 0).
///
/// Inverts `fft2_shift_inplace` exactly, accounting for the asymmetry of odd
/// lengths.
pub fn ifft2_shift_inplace(mut input: ArrayViewMut2<Complex<f64>>) {
    Zip::from(input.lanes_mut(Axis(1))).par_for_each(|row| {
        ifft_shift_inplace(row);
    });
    Zip::from(input.lanes_mut(Axis(0))).par_for_each(|col| {
        ifft_shift_inplace(col);
    });
}

/// Moves the origin (0) of a lane to its center (N/2).
pub fn fft_shift_inplace(mut lane: ArrayViewMut1<Complex<f64>>) {
    let n = lane.len();
    if n < 2 {
        return;
    }
    let half = n / 2;
    if n % 2 == 0 {
        for i in 0..half {
            lane.swap(i, i + half);
        }
    } else {
        // rotate right by n/2
        let tmp: Vec<Complex<f64>> = lane.iter().copied().collect();
        for (i, e) in lane.iter_mut().enumerate() {
            *e = tmp[(i + half + 1) % n];
        }
    }
}

/// Moves the center (N/2) of a lane back to its origin (0).
pub fn ifft_shift_inplace(mut lane: ArrayViewMut1<Complex<f64>>) {
    let n = lane.len();
    if n < 2 {
        return;
    }
    let half = n / 2;
    if n % 2 == 0 {
        for i in 0..half {
            lane.swap(i, i + half);
        }
    } else {
        // rotate left by n/2
        let tmp: Vec<Complex<f64>> = lane.iter().copied().collect();
        for (i, e) in lane.iter_mut().enumerate() {
            *e = tmp[(i + half) % n];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, ArrayViewMut};

    fn assert_close(a: &[Complex<f64>], b: &[Complex<f64>]) {
        for (a, b) in a.iter().zip(b) {
            assert!((a - b).norm() < 1e-10, "{} != {}", a, b);
        }
    }

    fn as_complex(values: Vec<f64>) -> Vec<Complex<f64>> {
        values.into_iter().map(|x| Complex::new(x, 0.0)).collect()
    }

    #[test]
    fn fft_shift_odd() {
        let mut input = as_complex(vec![1., 2., 3., 4., 5., 6., 7., 8., 9.]);
        let expected = as_complex(vec![6., 7., 8., 9., 1., 2., 3., 4., 5.]);

        fft_shift_inplace(ArrayViewMut::from_shape(9, &mut input).unwrap());

        assert_eq!(input, expected);
    }

    #[test]
    fn fft_shift_even() {
        let mut input = as_complex(vec![1., 2., 3., 4., 5., 6., 7., 8.]);
        let expected = as_complex(vec![5., 6., 7., 8., 1., 2., 3., 4.]);

        fft_shift_inplace(ArrayViewMut::from_shape(8, &mut input).unwrap());

        assert_eq!(input, expected);
    }

    #[test]
    fn ifft_shift_inverts_fft_shift() {
        for n in &[7usize, 8, 9, 16] {
            let mut input: Vec<Complex<f64>> =
                (0..*n).map(|x| Complex::new(x as f64, 0.0)).collect();
            let expected = input.clone();

            fft_shift_inplace(ArrayViewMut::from_shape(*n, &mut input).unwrap());
            ifft_shift_inplace(ArrayViewMut::from_shape(*n, &mut input).unwrap());

            assert_eq!(input, expected);
        }
    }

    #[test]
    fn fft2_known_values() {
        let input = Array2::from_shape_vec((2, 2), as_complex(vec![1., 2., 3., 4.])).unwrap();

        let output = fft2(input);

        // unnormalised DFT of [[1,2],[3,4]] is [[10,-2],[-4,0]], scaled by 1/2
        let expected = as_complex(vec![5., -1., -2., 0.]);
        assert_close(output.as_slice().unwrap(), &expected);
    }

    #[test]
    fn ifft2_inverts_fft2() {
        let input = Array2::from_shape_fn((8, 8), |(r, c)| {
            Complex::new((r * 8 + c) as f64, (r as f64) - (c as f64))
        });
        let expected = input.clone();

        let output = ifft2(fft2(input));

        assert_close(output.as_slice().unwrap(), expected.as_slice().unwrap());
    }

    #[test]
    fn centered_pair_round_trips() {
        let input = Array2::from_shape_fn((6, 6), |(r, c)| {
            Complex::new((r as f64).sin() + c as f64, (c as f64).cos())
        });
        let expected = input.clone();

        let output = ifft2_centered(fft2_centered(input));

        assert_close(output.as_slice().unwrap(), expected.as_slice().unwrap());
    }

    #[test]
    fn centered_forward_puts_dc_at_center() {
        // a constant image transforms to a single spike at the array center
        let input = Array2::from_elem((8, 8), Complex::new(1.0, 0.0));

        let output = fft2_centered(input);

        for ((r, c), v) in output.indexed_iter() {
            if (r, c) == (4, 4) {
                assert!((v - Complex::new(8.0, 0.0)).norm() < 1e-10);
            } else {
                assert!(v.norm() < 1e-10);
            }
        }
    }
}
