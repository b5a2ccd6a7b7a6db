//! Dimension merging.
//!
//! Small adjacent axes are folded into one so that each retained axis
//! carries a factor of bounded size. Merging is a pure reshape of the
//! row-major layout, so `unmerge(merge(x)) == x` element for element.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{PrecondError, PrecondResult};

/// Merge `shape` under the axis bound `max_dim`.
///
/// Size-1 axes are dropped, then axes are combined walking from the last
/// axis toward the first while the running product stays within `max_dim`.
/// An axis already larger than `max_dim` stays on its own.
pub fn merge_shape(shape: &[usize], max_dim: usize) -> Vec<usize> {
    let mut merged = Vec::with_capacity(shape.len());
    let mut acc: Option<usize> = None;

    for &dim in shape.iter().rev().filter(|&&d| d != 1) {
        acc = match acc {
            None => Some(dim),
            Some(run) => match run.checked_mul(dim) {
                Some(product) if product <= max_dim => Some(product),
                _ => {
                    merged.push(run);
                    Some(dim)
                }
            },
        };
    }

    match acc {
        Some(run) => merged.push(run),
        None => return vec![1],
    }
    merged.reverse();
    merged
}

/// Original and merged views of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedLayout {
    original: Vec<usize>,
    merged: Vec<usize>,
}

impl MergedLayout {
    pub fn new(shape: &[usize], max_dim: usize, merge: bool) -> Self {
        let merged = if merge {
            merge_shape(shape, max_dim)
        } else if shape.is_empty() {
            vec![1]
        } else {
            shape.to_vec()
        };
        Self {
            original: shape.to_vec(),
            merged,
        }
    }

    /// Rebuild a layout from persisted shapes.
    pub fn from_parts(original: Vec<usize>, merged: Vec<usize>) -> PrecondResult<Self> {
        let numel: usize = original.iter().product();
        let merged_numel: usize = merged.iter().product();
        if merged.is_empty() || numel != merged_numel {
            return Err(PrecondError::Config(format!(
                "merged shape {:?} does not cover original shape {:?}",
                merged, original
            )));
        }
        Ok(Self { original, merged })
    }

    pub fn original(&self) -> &[usize] {
        &self.original
    }

    pub fn merged(&self) -> &[usize] {
        &self.merged
    }

    pub fn ndim(&self) -> usize {
        self.merged.len()
    }

    pub fn numel(&self) -> usize {
        self.merged.iter().product()
    }

    pub fn merge(&self, x: &Tensor) -> PrecondResult<Tensor> {
        self.check_numel(x)?;
        Ok(x.reshape(self.merged.as_slice())?)
    }

    pub fn unmerge(&self, x: &Tensor) -> PrecondResult<Tensor> {
        self.check_numel(x)?;
        Ok(x.reshape(self.original.as_slice())?)
    }

    fn check_numel(&self, x: &Tensor) -> PrecondResult<()> {
        if x.elem_count() != self.numel() {
            return Err(PrecondError::Tensor(format!(
                "tensor of shape {:?} cannot be viewed as {:?}",
                x.dims(),
                self.merged
            )));
        }
        Ok(())
    }
}
