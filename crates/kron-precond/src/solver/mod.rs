//! Factor solvers: eigenbases for SOAP, whitening factors for PSGD.

pub mod eigen;
pub mod whiten;

pub use eigen::{initial_eigenbasis, refresh_eigenbasis, soap_factor_kinds, BasisRefresh};
pub use whiten::{balance, psgd_factor_kinds, sample_probe, update_factors};

use crate::config::MemorySaveMode;

/// Per-axis flags for axes that `memory_save_mode` forces off the full
/// path. `OneDiag` picks the largest axis, the last one on ties.
pub(crate) fn diagonal_axes(dims: &[usize], mode: Option<MemorySaveMode>) -> Vec<bool> {
    let mut diag = vec![false; dims.len()];
    match mode {
        None => {}
        Some(MemorySaveMode::AllDiag) => diag.iter_mut().for_each(|d| *d = true),
        Some(MemorySaveMode::OneDiag) => {
            let largest = dims
                .iter()
                .enumerate()
                .fold(None, |best: Option<(usize, usize)>, (i, &d)| match best {
                    Some((_, size)) if size > d => best,
                    _ => Some((i, d)),
                });
            if let Some((i, _)) = largest {
                diag[i] = true;
            }
        }
    }
    diag
}
