//! Property-based tests for the preconditioner building blocks.
//!
//! Validates invariants that must hold for any shape and any data:
//! - Merging is a reshape: element count preserved, unmerge restores shape
//! - Forward then inverse projection is the identity
//! - Gram statistics stay symmetric

use candle_core::{DType, Device, Tensor};
use kron_precond::factor::Factor;
use kron_precond::gram::{asymmetry, update_grams, GramBlend};
use kron_precond::linalg::{self, ScratchPool};
use kron_precond::merge::{merge_shape, MergedLayout};
use kron_precond::project::{project_merged, Direction};
use nalgebra::DMatrix;
use proptest::prelude::*;

fn tensor(data: &[f32], dims: &[usize]) -> Tensor {
    Tensor::from_vec(data.to_vec(), dims, &Device::Cpu).unwrap()
}

/// Orthogonal basis from the QR of a seeded matrix.
fn orthogonal(n: usize, values: &[f64], pool: &mut ScratchPool) -> Factor {
    let m = DMatrix::from_fn(n, n, |r, c| values[(r * n + c) % values.len()] + (r == c) as u8 as f64);
    let q = linalg::qr_signed(m);
    Factor::Full(linalg::from_matrix(q, &Device::Cpu, pool).unwrap())
}

/// Unit-diagonal upper-triangular factor; always invertible.
fn triangular(n: usize, values: &[f64], pool: &mut ScratchPool) -> Factor {
    let m = DMatrix::from_fn(n, n, |r, c| match r.cmp(&c) {
        std::cmp::Ordering::Equal => 1.0,
        std::cmp::Ordering::Less => 0.25 * values[(r * n + c) % values.len()],
        std::cmp::Ordering::Greater => 0.0,
    });
    Factor::Triangular(linalg::from_matrix(m, &Device::Cpu, pool).unwrap())
}

fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: merged shape covers the original and respects the bound.
    #[test]
    fn merge_preserves_numel(
        shape in prop::collection::vec(1usize..12, 0..5),
        max_dim in 1usize..64,
    ) {
        let merged = merge_shape(&shape, max_dim);
        let numel: usize = shape.iter().product();
        prop_assert_eq!(merged.iter().product::<usize>(), numel);
        prop_assert!(!merged.is_empty());
        for &d in &merged {
            // an axis above the bound is an original axis left alone
            prop_assert!(d <= max_dim || shape.contains(&d));
        }
    }

    /// Property: unmerge(merge(x)) == x element for element.
    #[test]
    fn merge_is_invertible(
        shape in prop::collection::vec(1usize..6, 1..4),
        max_dim in 1usize..40,
        seed in any::<u32>(),
    ) {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = (0..numel).map(|i| ((i as u32 ^ seed) % 97) as f32).collect();
        let x = tensor(&data, &shape);
        let layout = MergedLayout::new(&shape, max_dim, true);
        let merged = layout.merge(&x).unwrap();
        prop_assert_eq!(merged.dims(), layout.merged());
        let back = layout.unmerge(&merged).unwrap();
        prop_assert_eq!(back.dims(), shape.as_slice());
        prop_assert_eq!(back.flatten_all().unwrap().to_vec1::<f32>().unwrap(), data);
    }

    /// Property: inverse projection undoes forward projection for any mix of
    /// identity, orthogonal and triangular factors.
    #[test]
    fn projection_round_trip(
        dims in prop::collection::vec(1usize..6, 1..4),
        kinds in prop::collection::vec(0u8..3, 3),
        values in prop::collection::vec(-1.0f64..1.0, 36),
        data_seed in any::<u16>(),
    ) {
        let mut pool = ScratchPool::default();
        let factors: Vec<Factor> = dims
            .iter()
            .zip(&kinds)
            .map(|(&n, &kind)| match kind {
                0 => Factor::Identity,
                1 => orthogonal(n, &values, &mut pool),
                _ => triangular(n, &values, &mut pool),
            })
            .collect();

        let numel: usize = dims.iter().product();
        let data: Vec<f32> = (0..numel)
            .map(|i| (((i as u32 * 7919 + data_seed as u32) % 200) as f32 - 100.0) / 50.0)
            .collect();
        let x = tensor(&data, &dims);
        let forward = project_merged(&x, &factors, Direction::Forward, &mut pool).unwrap();
        let back = project_merged(&forward, &factors, Direction::Inverse, &mut pool).unwrap();
        prop_assert!(max_diff(&x, &back) < 1e-3);
    }

    /// Property: exact and blended Gram matrices are symmetric.
    #[test]
    fn gram_stays_symmetric(
        rows in 1usize..8,
        cols in 1usize..8,
        beta in 0.0f64..0.999,
        seed in any::<u16>(),
    ) {
        let numel = rows * cols;
        let g1: Vec<f32> = (0..numel).map(|i| ((i * 31 + seed as usize) % 17) as f32 - 8.0).collect();
        let g2: Vec<f32> = (0..numel).map(|i| ((i * 13 + seed as usize) % 11) as f32 - 5.0).collect();
        let device = Device::Cpu;
        let mut grams = vec![
            Some(Tensor::zeros((rows, rows), DType::F32, &device).unwrap()),
            Some(Tensor::zeros((cols, cols), DType::F32, &device).unwrap()),
        ];
        update_grams(&mut grams, &tensor(&g1, &[rows, cols]), GramBlend::Exact).unwrap();
        update_grams(&mut grams, &tensor(&g2, &[rows, cols]), GramBlend::Ema(beta)).unwrap();
        for gram in grams.iter().flatten() {
            prop_assert!(asymmetry(gram).unwrap() <= 1e-5);
        }
    }
}
