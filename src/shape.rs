use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Logical dimensions of a tensor, outermost first.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    #[inline]
    pub fn scalar() -> Self {
        Self(Arc::new([]))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. A scalar holds one.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides of every dimension but the innermost.
    pub fn strides(&self) -> Vec<usize> {
        strides(&self.0)
    }

    /// Removes every dimension of size 1. Returns the kept dims and their original axes.
    pub fn squeeze(&self) -> (Vec<usize>, Vec<usize>) {
        self.0
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d != 1)
            .map(|(axis, &d)| (d, axis))
            .unzip()
    }
}

/// Row-major strides of every dimension but the innermost.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    if shape.len() < 2 {
        return vec![];
    }
    let mut strides = vec![0; shape.len() - 1];
    strides[shape.len() - 2] = shape[shape.len() - 1];
    for axis in (0..shape.len() - 2).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Axes of `input` that are stretched when broadcast against `output`.
///
/// Axes are counted in the input's own numbering; trailing axes are aligned.
pub fn broadcast_dims(input: &[usize], output: &[usize]) -> Vec<usize> {
    let offset = output.len().saturating_sub(input.len());
    input
        .iter()
        .enumerate()
        .filter(|&(axis, &d)| d == 1 && output.get(axis + offset).is_some_and(|&o| o > 1))
        .map(|(axis, _)| axis)
        .collect()
}

/// Returns `true` if the block at `begin` of extent `size` is one contiguous run of `shape`.
pub fn is_slice_contiguous(shape: &[usize], begin: &[usize], size: &[usize]) -> bool {
    let first = size.iter().position(|&d| d > 1).unwrap_or(size.len());
    (first + 1..size.len()).all(|axis| begin[axis] == 0 && size[axis] == shape[axis])
}

/// Flat row-major index of `coords` in `shape`.
pub fn flat_index(shape: &[usize], coords: &[usize]) -> usize {
    let mut strides = strides(shape);
    if !shape.is_empty() {
        strides.push(1);
    }
    coords.iter().zip(strides).map(|(c, s)| c * s).sum()
}

/// Row-major coordinates of the flat `index` in `shape`.
pub fn unravel(shape: &[usize], index: usize) -> Vec<usize> {
    let mut rem = index;
    let mut coords = strides(shape)
        .into_iter()
        .map(|stride| {
            let coord = rem / stride;
            rem %= stride;
            coord
        })
        .collect::<Vec<_>>();
    if !shape.is_empty() {
        coords.push(rem);
    }
    coords
}
