//! Per-parameter preconditioner state and its serialized snapshot.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{PrecondError, PrecondResult};
use crate::factor::{Factor, FactorState};
use crate::merge::MergedLayout;

/// Stable key for one optimized tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub u64);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param#{}", self.0)
    }
}

impl From<u64> for ParamId {
    fn from(id: u64) -> Self {
        ParamId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    pub fn from_tensor(t: &Tensor) -> PrecondResult<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> PrecondResult<Tensor> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(PrecondError::Tensor(format!(
                "snapshot data length mismatch: shape {:?} needs {}, got {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(Tensor::from_vec(
            self.data.clone(),
            self.shape.as_slice(),
            device,
        )?)
    }
}

/// Refresh bookkeeping, observable by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStats {
    /// Refreshes that replaced the factors.
    pub refreshes: u64,
    /// Refreshes abandoned on numerical degeneracy.
    pub skipped: u64,
    /// PSGD norm rebalances.
    pub balances: u64,
}

impl RefreshStats {
    pub fn merge(&mut self, other: &RefreshStats) {
        self.refreshes += other.refreshes;
        self.skipped += other.skipped;
        self.balances += other.balances;
    }
}

/// Everything the engine keeps for one parameter.
///
/// Moments are stored in the merged shape. Tensors are reference counted,
/// so cloning a state to stage a step copies no data.
#[derive(Debug, Clone)]
pub struct ParameterState {
    pub layout: MergedLayout,
    /// One slot per merged axis; `Some` only where the factor is `Full`.
    pub grams: Vec<Option<Tensor>>,
    pub factors: Vec<Factor>,
    /// Steps seen, including the initializing one.
    pub step: u64,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
    pub last_refresh_step: Option<u64>,
    pub stats: RefreshStats,
}

impl ParameterState {
    /// Empty state with zeroed moments; factors and grams are filled by the
    /// owning engine.
    pub fn new(layout: MergedLayout, factors: Vec<Factor>, device: &Device) -> PrecondResult<Self> {
        let exp_avg = Tensor::zeros(layout.merged(), DType::F32, device)?;
        let exp_avg_sq = exp_avg.zeros_like()?;
        Ok(Self {
            grams: vec![None; layout.ndim()],
            layout,
            factors,
            step: 0,
            exp_avg,
            exp_avg_sq,
            last_refresh_step: None,
            stats: RefreshStats::default(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.original()
    }

    pub fn merged_shape(&self) -> &[usize] {
        self.layout.merged()
    }

    /// Steps since the factors were last replaced.
    pub fn staleness(&self) -> Option<u64> {
        self.last_refresh_step.map(|s| self.step.saturating_sub(s))
    }

    pub fn check_shape(&self, id: ParamId, grad: &Tensor) -> PrecondResult<()> {
        if grad.dims() != self.shape() {
            return Err(PrecondError::ShapeMismatch {
                param: id,
                expected: self.shape().to_vec(),
                got: grad.dims().to_vec(),
            });
        }
        Ok(())
    }

    pub fn snapshot(&self, id: ParamId) -> PrecondResult<ParameterSnapshot> {
        Ok(ParameterSnapshot {
            id,
            shape: self.layout.original().to_vec(),
            merged_shape: self.layout.merged().to_vec(),
            grams: self
                .grams
                .iter()
                .map(|g| g.as_ref().map(TensorState::from_tensor).transpose())
                .collect::<PrecondResult<Vec<_>>>()?,
            factors: self
                .factors
                .iter()
                .map(Factor::to_state)
                .collect::<PrecondResult<Vec<_>>>()?,
            step: self.step,
            exp_avg: TensorState::from_tensor(&self.exp_avg)?,
            exp_avg_sq: TensorState::from_tensor(&self.exp_avg_sq)?,
            last_refresh_step: self.last_refresh_step,
            stats: self.stats,
        })
    }

    pub fn restore(snap: &ParameterSnapshot, device: &Device) -> PrecondResult<Self> {
        let layout = MergedLayout::from_parts(snap.shape.clone(), snap.merged_shape.clone())?;
        let ndim = layout.ndim();
        if snap.grams.len() != ndim || snap.factors.len() != ndim {
            return Err(PrecondError::Tensor(format!(
                "{}: snapshot has {} grams and {} factors for {} merged axes",
                snap.id,
                snap.grams.len(),
                snap.factors.len(),
                ndim
            )));
        }

        let grams = snap
            .grams
            .iter()
            .map(|g| g.as_ref().map(|t| t.to_tensor(device)).transpose())
            .collect::<PrecondResult<Vec<_>>>()?;
        let factors = snap
            .factors
            .iter()
            .map(|f| Factor::from_state(f, device))
            .collect::<PrecondResult<Vec<_>>>()?;

        for (axis, (gram, factor)) in grams.iter().zip(&factors).enumerate() {
            let n = layout.merged()[axis];
            let dims_ok = gram.as_ref().map_or(true, |g| g.dims() == [n, n])
                && factor.dim().map_or(true, |d| d == n);
            if !dims_ok {
                return Err(PrecondError::Tensor(format!(
                    "{}: axis {} statistics do not match merged size {}",
                    snap.id, axis, n
                )));
            }
        }

        let exp_avg = snap.exp_avg.to_tensor(device)?;
        let exp_avg_sq = snap.exp_avg_sq.to_tensor(device)?;
        for moment in [&exp_avg, &exp_avg_sq] {
            if moment.dims() != layout.merged() {
                return Err(PrecondError::Tensor(format!(
                    "{}: moment shape {:?} does not match merged shape {:?}",
                    snap.id,
                    moment.dims(),
                    layout.merged()
                )));
            }
        }

        Ok(Self {
            layout,
            grams,
            factors,
            step: snap.step,
            exp_avg,
            exp_avg_sq,
            last_refresh_step: snap.last_refresh_step,
            stats: snap.stats,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub id: ParamId,
    pub shape: Vec<usize>,
    pub merged_shape: Vec<usize>,
    pub grams: Vec<Option<TensorState>>,
    pub factors: Vec<FactorState>,
    pub step: u64,
    pub exp_avg: TensorState,
    pub exp_avg_sq: TensorState,
    pub last_refresh_step: Option<u64>,
    pub stats: RefreshStats,
}

/// Explicit per-parameter store, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    states: BTreeMap<ParamId, ParameterState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ParamId) -> Option<&ParameterState> {
        self.states.get(&id)
    }

    pub fn remove(&mut self, id: ParamId) -> Option<ParameterState> {
        self.states.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &ParameterState)> {
        self.states.iter().map(|(id, state)| (*id, state))
    }

    /// Reject a batch before anything is mutated: every id at most once,
    /// and every known parameter with its recorded shape.
    pub fn check_batch(&self, grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for (id, grad) in grads {
            if !seen.insert(*id) {
                return Err(PrecondError::Config(format!(
                    "gradient for {} given twice in one step",
                    id
                )));
            }
            if let Some(state) = self.states.get(id) {
                state.check_shape(*id, grad)?;
            }
        }
        Ok(())
    }

    /// Install every staged state at once.
    pub fn commit(&mut self, staged: Vec<(ParamId, ParameterState)>) {
        self.states.extend(staged);
    }

    /// Counters summed over all parameters.
    pub fn stats(&self) -> RefreshStats {
        let mut total = RefreshStats::default();
        for state in self.states.values() {
            total.merge(&state.stats);
        }
        total
    }

    pub fn snapshot(&self) -> PrecondResult<Vec<ParameterSnapshot>> {
        self.states
            .iter()
            .map(|(id, state)| state.snapshot(*id))
            .collect()
    }

    pub fn restore(snaps: &[ParameterSnapshot], device: &Device) -> PrecondResult<Self> {
        let mut states = BTreeMap::new();
        for snap in snaps {
            if states
                .insert(snap.id, ParameterState::restore(snap, device)?)
                .is_some()
            {
                return Err(PrecondError::Tensor(format!(
                    "{} appears twice in snapshot",
                    snap.id
                )));
            }
        }
        Ok(Self { states })
    }
}
