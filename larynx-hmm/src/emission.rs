//! Emission model contract and per-utterance emission log-probability tables.

use larynx_core::prob::clamp_log_prob;
use larynx_core::{LarynxError, Result};

use crate::features::FeatureMatrix;

/// Acoustic model that scores frames against states and accumulates the
/// sufficient statistics needed to re-estimate itself.
///
/// Statistics live in a separate [`Counts`](EmissionModel::Counts) value
/// owned by the caller, so one model can be scored while counts from many
/// utterances are pooled.
pub trait EmissionModel: Send + Sync {
    /// Accumulator of sufficient statistics for this model.
    type Counts;

    /// Number of emitting states.
    fn n_states(&self) -> usize;

    /// Feature dimension.
    fn dim(&self) -> usize;

    /// Log probability (density) of `frame` under `state`.
    fn log_prob(&self, frame: &[f64], state: usize) -> f64;

    /// Fresh, empty statistics sized for this model.
    fn new_counts(&self) -> Self::Counts;

    /// Clear `counts` back to empty.
    fn reset_counts(&self, counts: &mut Self::Counts);

    /// Add an observation of `frame` in `state` with soft count `weight`.
    fn accumulate(&self, counts: &mut Self::Counts, frame: &[f64], state: usize, weight: f64);

    /// Replace the model parameters with maximum-likelihood estimates from
    /// `counts`.
    fn reestimate(&mut self, counts: &Self::Counts) -> Result<()>;
}

/// Dense `(frame, state)` table of emission log probabilities, flat
/// row-major: `index = frame * n_states + state`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionTable {
    n_frames: usize,
    n_states: usize,
    data: Vec<f64>,
}

impl EmissionTable {
    /// Wrap precomputed log probabilities.
    ///
    /// `-inf` entries become the zero-probability sentinel.
    ///
    /// # Errors
    ///
    /// Returns an error if `data.len() != n_frames * n_states` or any entry
    /// is NaN.
    pub fn new(n_frames: usize, n_states: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_frames * n_states {
            return Err(LarynxError::DimensionMismatch(format!(
                "emission data length {} != n_frames*n_states {}",
                data.len(),
                n_frames * n_states
            )));
        }
        let data = data
            .into_iter()
            .enumerate()
            .map(|(i, x)| {
                clamp_log_prob(x).map_err(|_| {
                    LarynxError::InvalidInput(format!(
                        "emission log prob at frame {} state {} is NaN",
                        i / n_states.max(1),
                        i % n_states.max(1)
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            n_frames,
            n_states,
            data,
        })
    }

    /// Build from one row of state log probabilities per frame.
    ///
    /// # Errors
    ///
    /// Returns an error if rows differ in length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n_states = rows.first().map_or(0, |r| r.len());
        if let Some(f) = rows.iter().position(|r| r.len() != n_states) {
            return Err(LarynxError::DimensionMismatch(format!(
                "emission row {f} has {} states, expected {n_states}",
                rows[f].len()
            )));
        }
        Self::new(rows.len(), n_states, rows.concat())
    }

    /// Score every frame of `feats` against every state of `model`.
    ///
    /// # Errors
    ///
    /// Returns [`LarynxError::DimensionMismatch`] if the feature dimension
    /// differs from the model's, or an error if the model yields NaN.
    pub fn compute<M>(model: &M, feats: &FeatureMatrix) -> Result<Self>
    where
        M: EmissionModel + ?Sized,
    {
        if feats.dim() != model.dim() {
            return Err(LarynxError::DimensionMismatch(format!(
                "feature dim {} != model dim {}",
                feats.dim(),
                model.dim()
            )));
        }
        let n_states = model.n_states();
        let score = |frame: &[f64]| -> Vec<f64> {
            (0..n_states).map(|s| model.log_prob(frame, s)).collect()
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<Vec<f64>> = {
            use rayon::prelude::*;
            (0..feats.n_frames())
                .into_par_iter()
                .map(|f| score(feats.frame(f)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<Vec<f64>> = feats.frames().map(score).collect();

        Self::new(feats.n_frames(), n_states, rows.concat())
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Log probability of frame `f` under state `s`.
    #[inline]
    pub fn get(&self, f: usize, s: usize) -> f64 {
        self.data[f * self.n_states + s]
    }

    /// All state log probabilities of frame `f`.
    pub fn row(&self, f: usize) -> &[f64] {
        &self.data[f * self.n_states..(f + 1) * self.n_states]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larynx_core::LOG_ZERO;

    #[test]
    fn table_indexing() {
        let t = EmissionTable::from_rows(&[vec![-1.0, -2.0], vec![-3.0, -4.0]]).unwrap();
        assert_eq!(t.n_frames(), 2);
        assert_eq!(t.n_states(), 2);
        assert_eq!(t.get(1, 0), -3.0);
        assert_eq!(t.row(0), &[-1.0, -2.0]);
    }

    #[test]
    fn table_clamps_and_validates() {
        let t = EmissionTable::new(1, 2, vec![f64::NEG_INFINITY, -1.0]).unwrap();
        assert_eq!(t.get(0, 0), LOG_ZERO);
        assert!(EmissionTable::new(1, 2, vec![f64::NAN, -1.0]).is_err());
        assert!(EmissionTable::new(2, 2, vec![-1.0; 3]).is_err());
        assert!(EmissionTable::from_rows(&[vec![-1.0], vec![-1.0, -2.0]]).is_err());
    }
}
