//! The dataset container pairing measured images with their illumination.
//!
//! A [`FpDataset`] holds three parallel arrays: a stack of low resolution
//! intensity images, one 3D illumination wavevector per image, and the (col,
//! row) index of the LED that produced it. The structural invariants are
//! checked once at construction so that everything downstream can assume a
//! consistent container.

use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(
        "the images, wavevectors, and LED index arrays must have the same length; \
         got {images}, {wavevectors}, and {led_indexes}"
    )]
    LengthMismatch {
        images: usize,
        wavevectors: usize,
        led_indexes: usize,
    },
    #[error("the wavevectors array must have 3 columns (kx, ky, kz); got {0}")]
    WavevectorColumns(usize),
    #[error("the LED indexes array must have 2 columns; got {0}")]
    LedIndexColumns(usize),
    #[error("index {index} is out of bounds for a dataset of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("slice {start}..{end} is out of bounds for a dataset of length {len}")]
    SliceOutOfBounds {
        start: usize,
        end: usize,
        len: usize,
    },
}

/// One measurement of a dataset: views into the parent arrays.
#[derive(Clone, Copy, Debug)]
pub struct Measurement<'a> {
    pub image: ArrayView2<'a, f64>,
    pub wavevector: ArrayView1<'a, f64>,
    pub led_index: ArrayView1<'a, i64>,
}

/// An ordered Fourier ptychography dataset.
///
/// Images are indexed `(measurement, row, col)` and wavevectors are in radians
/// per unit length in the sample frame. Non-square images are permitted here;
/// the recovery engine rejects them at its own boundary.
#[derive(Clone, Debug)]
pub struct FpDataset {
    images: Array3<f64>,
    wavevectors: Array2<f64>,
    led_indexes: Array2<i64>,
}

impl FpDataset {
    pub fn new(
        images: Array3<f64>,
        wavevectors: Array2<f64>,
        led_indexes: Array2<i64>,
    ) -> Result<Self, DatasetError> {
        if wavevectors.ncols() != 3 {
            return Err(DatasetError::WavevectorColumns(wavevectors.ncols()));
        }
        if led_indexes.ncols() != 2 {
            return Err(DatasetError::LedIndexColumns(led_indexes.ncols()));
        }
        if images.shape()[0] != wavevectors.nrows() || images.shape()[0] != led_indexes.nrows() {
            return Err(DatasetError::LengthMismatch {
                images: images.shape()[0],
                wavevectors: wavevectors.nrows(),
                led_indexes: led_indexes.nrows(),
            });
        }

        Ok(Self {
            images,
            wavevectors,
            led_indexes,
        })
    }

    /// Number of measurements in the dataset.
    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of the image stack as `(length, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[0], s[1], s[2])
    }

    pub fn images(&self) -> &Array3<f64> {
        &self.images
    }

    pub fn wavevectors(&self) -> &Array2<f64> {
        &self.wavevectors
    }

    pub fn led_indexes(&self) -> &Array2<i64> {
        &self.led_indexes
    }

    /// Returns the single-entry sub-dataset at `index`.
    ///
    /// The image stack of the result keeps a leading dimension of size 1.
    pub fn get(&self, index: usize) -> Result<Self, DatasetError> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfBounds {
                index,
                len: self.len(),
            });
        }
        self.slice(index..index + 1)
    }

    /// Returns the sub-dataset covering `range`, in stored order.
    pub fn slice(&self, range: Range<usize>) -> Result<Self, DatasetError> {
        if range.start > range.end || range.end > self.len() {
            return Err(DatasetError::SliceOutOfBounds {
                start: range.start,
                end: range.end,
                len: self.len(),
            });
        }
        Ok(Self {
            images: self
                .images
                .slice(s![range.clone(), .., ..])
                .to_owned(),
            wavevectors: self.wavevectors.slice(s![range.clone(), ..]).to_owned(),
            led_indexes: self.led_indexes.slice(s![range, ..]).to_owned(),
        })
    }

    /// Iterates over measurements from the start, in stored order.
    pub fn iter(&self) -> impl Iterator<Item = Measurement<'_>> {
        self.images
            .axis_iter(Axis(0))
            .zip(self.wavevectors.axis_iter(Axis(0)))
            .zip(self.led_indexes.axis_iter(Axis(0)))
            .map(|((image, wavevector), led_index)| Measurement {
                image,
                wavevector,
                led_index,
            })
    }

    /// Pixel-wise mean of all measurement images.
    ///
    /// An empty dataset yields an all-zero image.
    pub fn mean_image(&self) -> Array2<f64> {
        let (_, rows, cols) = self.shape();
        self.images
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array2::zeros((rows, cols)))
    }
}
