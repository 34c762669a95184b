//! Diagonal-covariance Gaussian mixture acoustic model.
//!
//! [`GmmSet`] holds one mixture per emitting state and implements
//! [`EmissionModel`]: a state-level soft count is split across mixture
//! components by their posterior responsibilities and accumulated into
//! [`GmmCount`] records, from which new weights, means and variances are
//! estimated at the end of each training iteration.

use std::f64::consts::PI;

use larynx_core::{is_log_zero, log_sum, LarynxError, Result, Summarizable, LOG_ZERO};
use serde::{Deserialize, Serialize};

use crate::emission::EmissionModel;

/// Default lower bound on re-estimated variances.
pub const DEFAULT_VAR_FLOOR: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Gaussian with diagonal covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagGaussian {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
}

impl DiagGaussian {
    /// Create a Gaussian. Variances must be positive.
    pub fn new(mean: Vec<f64>, var: Vec<f64>) -> Result<Self> {
        if mean.is_empty() {
            return Err(LarynxError::InvalidInput("Gaussian: empty mean".into()));
        }
        if mean.len() != var.len() {
            return Err(LarynxError::DimensionMismatch(format!(
                "Gaussian: mean dim {} != var dim {}",
                mean.len(),
                var.len()
            )));
        }
        if var.iter().any(|&v| !(v > 0.0) || !v.is_finite()) {
            return Err(LarynxError::InvalidInput(
                "Gaussian: variances must be positive and finite".into(),
            ));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(LarynxError::InvalidInput("Gaussian: mean is not finite".into()));
        }
        Ok(Self { mean, var })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Log density at `x`.
    pub fn log_density(&self, x: &[f64]) -> f64 {
        let mut acc = 0.0;
        for ((&xi, &mi), &vi) in x.iter().zip(&self.mean).zip(&self.var) {
            let d = xi - mi;
            acc += (2.0 * PI * vi).ln() + d * d / vi;
        }
        -0.5 * acc
    }
}

/// Mixture of diagonal Gaussians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gmm {
    weights: Vec<f64>,
    components: Vec<DiagGaussian>,
}

impl Gmm {
    /// Create a mixture. Weights must be non-negative and sum to ~1.0
    /// (tolerance 1e-6); all components must share one dimension.
    pub fn new(weights: Vec<f64>, components: Vec<DiagGaussian>) -> Result<Self> {
        if components.is_empty() {
            return Err(LarynxError::InvalidInput("GMM: no components".into()));
        }
        if weights.len() != components.len() {
            return Err(LarynxError::DimensionMismatch(format!(
                "GMM: {} weights for {} components",
                weights.len(),
                components.len()
            )));
        }
        let dim = components[0].dim();
        if components.iter().any(|c| c.dim() != dim) {
            return Err(LarynxError::DimensionMismatch(
                "GMM: components differ in dimension".into(),
            ));
        }
        if weights.iter().any(|&w| !(w >= 0.0)) {
            return Err(LarynxError::InvalidInput("GMM: negative weight".into()));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(LarynxError::InvalidInput(format!(
                "GMM: weights sum to {sum}, expected ~1.0"
            )));
        }
        Ok(Self {
            weights,
            components,
        })
    }

    /// Single-component mixture.
    pub fn single(component: DiagGaussian) -> Self {
        Self {
            weights: vec![1.0],
            components: vec![component],
        }
    }

    pub fn dim(&self) -> usize {
        self.components[0].dim()
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn components(&self) -> &[DiagGaussian] {
        &self.components
    }

    /// Weighted log density of each component: `ln w_k + ln N(x; k)`.
    pub fn component_log_probs(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.components)
            .map(|(&w, c)| {
                if w > 0.0 {
                    (w.ln() + c.log_density(x)).max(LOG_ZERO)
                } else {
                    LOG_ZERO
                }
            })
            .collect()
    }

    /// Log density of the mixture at `x`.
    pub fn log_prob(&self, x: &[f64]) -> f64 {
        log_sum(self.component_log_probs(x))
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Sufficient statistics for one mixture component: total soft count, and
/// the weighted sums of observations and squared observations.
#[derive(Debug, Clone, PartialEq)]
pub struct GmmCount {
    pub occupancy: f64,
    pub sum: Vec<f64>,
    pub sum_sq: Vec<f64>,
}

impl GmmCount {
    pub fn new(dim: usize) -> Self {
        Self {
            occupancy: 0.0,
            sum: vec![0.0; dim],
            sum_sq: vec![0.0; dim],
        }
    }

    /// Add observation `x` with soft count `weight`.
    pub fn add(&mut self, x: &[f64], weight: f64) {
        self.occupancy += weight;
        for ((s, sq), &xi) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(x) {
            *s += weight * xi;
            *sq += weight * xi * xi;
        }
    }

    pub fn merge(&mut self, other: &GmmCount) {
        self.occupancy += other.occupancy;
        for (a, b) in self.sum.iter_mut().zip(&other.sum) {
            *a += b;
        }
        for (a, b) in self.sum_sq.iter_mut().zip(&other.sum_sq) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        self.occupancy = 0.0;
        self.sum.iter_mut().for_each(|x| *x = 0.0);
        self.sum_sq.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Statistics for every component of every state of a [`GmmSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct GmmCounts {
    counts: Vec<Vec<GmmCount>>,
}

impl GmmCounts {
    /// Component statistics of `state`.
    pub fn state(&self, state: usize) -> &[GmmCount] {
        &self.counts[state]
    }

    pub fn n_states(&self) -> usize {
        self.counts.len()
    }

    /// Total soft count of `state` over its components.
    pub fn state_occupancy(&self, state: usize) -> f64 {
        self.counts[state].iter().map(|c| c.occupancy).sum()
    }

    /// Total soft count over all states.
    pub fn total_occupancy(&self) -> f64 {
        (0..self.counts.len()).map(|s| self.state_occupancy(s)).sum()
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().flatten().for_each(GmmCount::reset);
    }

    /// Add `other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if the two were sized for different models.
    pub fn merge(&mut self, other: &GmmCounts) -> Result<()> {
        let same_shape = self.counts.len() == other.counts.len()
            && self
                .counts
                .iter()
                .zip(&other.counts)
                .all(|(a, b)| a.len() == b.len());
        if !same_shape {
            return Err(LarynxError::DimensionMismatch(
                "GMM counts sized for different models".into(),
            ));
        }
        for (a, b) in self.counts.iter_mut().flatten().zip(other.counts.iter().flatten()) {
            a.merge(b);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GmmSet
// ---------------------------------------------------------------------------

/// One Gaussian mixture per emitting state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmmSet {
    dim: usize,
    var_floor: f64,
    gmms: Vec<Gmm>,
}

impl GmmSet {
    /// Create a model from per-state mixtures sharing one dimension.
    pub fn new(gmms: Vec<Gmm>) -> Result<Self> {
        let dim = gmms
            .first()
            .map(Gmm::dim)
            .ok_or_else(|| LarynxError::InvalidInput("GmmSet: no GMMs".into()))?;
        if let Some(i) = gmms.iter().position(|g| g.dim() != dim) {
            return Err(LarynxError::DimensionMismatch(format!(
                "GmmSet: GMM {i} has dim {}, expected {dim}",
                gmms[i].dim()
            )));
        }
        Ok(Self {
            dim,
            var_floor: DEFAULT_VAR_FLOOR,
            gmms,
        })
    }

    /// Set the lower bound applied to re-estimated variances.
    pub fn with_var_floor(mut self, var_floor: f64) -> Result<Self> {
        if !(var_floor > 0.0) {
            return Err(LarynxError::InvalidInput("var_floor must be > 0".into()));
        }
        self.var_floor = var_floor;
        Ok(self)
    }

    /// Parse a model from its JSON form, validating every mixture.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: GmmSet =
            serde_json::from_str(json).map_err(|e| LarynxError::Parse(e.to_string()))?;
        let gmms = raw
            .gmms
            .into_iter()
            .map(|g| {
                let comps = g
                    .components
                    .into_iter()
                    .map(|c| DiagGaussian::new(c.mean, c.var))
                    .collect::<Result<Vec<_>>>()?;
                Gmm::new(g.weights, comps)
            })
            .collect::<Result<Vec<_>>>()?;
        let set = Self::new(gmms)?;
        if set.dim != raw.dim {
            return Err(LarynxError::DimensionMismatch(format!(
                "GmmSet: declared dim {} != component dim {}",
                raw.dim, set.dim
            )));
        }
        set.with_var_floor(raw.var_floor)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| LarynxError::Serialization(e.to_string()))
    }

    pub fn gmm(&self, state: usize) -> &Gmm {
        &self.gmms[state]
    }

    pub fn len(&self) -> usize {
        self.gmms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gmms.is_empty()
    }

    pub fn var_floor(&self) -> f64 {
        self.var_floor
    }
}

impl EmissionModel for GmmSet {
    type Counts = GmmCounts;

    fn n_states(&self) -> usize {
        self.gmms.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn log_prob(&self, frame: &[f64], state: usize) -> f64 {
        self.gmms[state].log_prob(frame)
    }

    fn new_counts(&self) -> GmmCounts {
        GmmCounts {
            counts: self
                .gmms
                .iter()
                .map(|g| vec![GmmCount::new(self.dim); g.n_components()])
                .collect(),
        }
    }

    fn reset_counts(&self, counts: &mut GmmCounts) {
        counts.reset();
    }

    fn accumulate(&self, counts: &mut GmmCounts, frame: &[f64], state: usize, weight: f64) {
        let comps = &mut counts.counts[state];
        if comps.len() == 1 {
            comps[0].add(frame, weight);
            return;
        }
        let gmm = &self.gmms[state];
        let lps = gmm.component_log_probs(frame);
        let total = log_sum(lps.iter().copied());
        if is_log_zero(total) {
            // Every component is below the sentinel: the nearest one takes it all.
            let best = gmm
                .weights
                .iter()
                .zip(&gmm.components)
                .map(|(&w, c)| w.ln() + c.log_density(frame))
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(k, _)| k);
            comps[best].add(frame, weight);
            return;
        }
        for (count, lp) in comps.iter_mut().zip(lps) {
            let resp = (lp - total).exp();
            if resp > 0.0 {
                count.add(frame, weight * resp);
            }
        }
    }

    fn reestimate(&mut self, counts: &GmmCounts) -> Result<()> {
        if counts.counts.len() != self.gmms.len() {
            return Err(LarynxError::DimensionMismatch(format!(
                "counts cover {} states, model has {}",
                counts.counts.len(),
                self.gmms.len()
            )));
        }
        for (state, (gmm, comps)) in self.gmms.iter_mut().zip(&counts.counts).enumerate() {
            if comps.len() != gmm.n_components() {
                return Err(LarynxError::DimensionMismatch(format!(
                    "counts for state {state} cover {} components, model has {}",
                    comps.len(),
                    gmm.n_components()
                )));
            }
            let total: f64 = comps.iter().map(|c| c.occupancy).sum();
            if total <= 0.0 {
                continue;
            }
            for (k, count) in comps.iter().enumerate() {
                gmm.weights[k] = count.occupancy / total;
                if count.occupancy <= 0.0 {
                    continue;
                }
                let comp = &mut gmm.components[k];
                for d in 0..self.dim {
                    let mean = count.sum[d] / count.occupancy;
                    let var = count.sum_sq[d] / count.occupancy - mean * mean;
                    comp.mean[d] = mean;
                    comp.var[d] = var.max(self.var_floor);
                }
            }
        }
        Ok(())
    }
}

impl Summarizable for GmmSet {
    fn summary(&self) -> String {
        let comps: usize = self.gmms.iter().map(Gmm::n_components).sum();
        format!(
            "GmmSet: {} states, {} components, dim={}",
            self.gmms.len(),
            comps,
            self.dim,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mean: f64) -> DiagGaussian {
        DiagGaussian::new(vec![mean], vec![1.0]).unwrap()
    }

    #[test]
    fn gaussian_log_density_matches_closed_form() {
        let g = unit(0.0);
        let expected = -0.5 * (2.0 * PI).ln();
        assert!((g.log_density(&[0.0]) - expected).abs() < 1e-12);
        assert!((g.log_density(&[1.0]) - (expected - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn mixture_log_prob_sums_components() {
        let gmm = Gmm::new(vec![0.25, 0.75], vec![unit(-1.0), unit(2.0)]).unwrap();
        let x = [0.5];
        let direct = 0.25 * unit(-1.0).log_density(&x).exp() + 0.75 * unit(2.0).log_density(&x).exp();
        assert!((gmm.log_prob(&x) - direct.ln()).abs() < 1e-12);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(DiagGaussian::new(vec![0.0], vec![0.0]).is_err());
        assert!(DiagGaussian::new(vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(Gmm::new(vec![0.5, 0.6], vec![unit(0.0), unit(1.0)]).is_err());
        assert!(Gmm::new(vec![1.0], vec![]).is_err());
        let two_d = DiagGaussian::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(GmmSet::new(vec![Gmm::single(unit(0.0)), Gmm::single(two_d)]).is_err());
        assert!(GmmSet::new(vec![]).is_err());
    }

    #[test]
    fn single_component_reestimation_is_weighted_mle() {
        let mut set = GmmSet::new(vec![Gmm::single(unit(0.0))]).unwrap();
        let mut counts = set.new_counts();
        set.accumulate(&mut counts, &[1.0], 0, 1.0);
        set.accumulate(&mut counts, &[3.0], 0, 3.0);
        assert!((counts.total_occupancy() - 4.0).abs() < 1e-12);

        set.reestimate(&counts).unwrap();
        // mean = (1 + 9) / 4, E[x^2] = (1 + 27) / 4
        let mean = 2.5;
        let var = 7.0 - mean * mean;
        let g = &set.gmm(0).components()[0];
        assert!((g.mean[0] - mean).abs() < 1e-12);
        assert!((g.var[0] - var).abs() < 1e-12);
    }

    #[test]
    fn variance_is_floored() {
        let mut set = GmmSet::new(vec![Gmm::single(unit(0.0))])
            .unwrap()
            .with_var_floor(0.01)
            .unwrap();
        let mut counts = set.new_counts();
        set.accumulate(&mut counts, &[2.0], 0, 1.0);
        set.reestimate(&counts).unwrap();
        assert_eq!(set.gmm(0).components()[0].var[0], 0.01);
    }

    #[test]
    fn accumulation_splits_weight_by_responsibility() {
        let set = GmmSet::new(vec![Gmm::new(vec![0.5, 0.5], vec![unit(-5.0), unit(5.0)]).unwrap()]).unwrap();
        let mut counts = set.new_counts();
        set.accumulate(&mut counts, &[0.0], 0, 2.0);
        let comps = counts.state(0);
        assert!((comps[0].occupancy - 1.0).abs() < 1e-12);
        assert!((comps[1].occupancy - 1.0).abs() < 1e-12);

        set.accumulate(&mut counts, &[5.0], 0, 1.0);
        assert!(counts.state(0)[1].occupancy > 1.99);
        assert!((counts.state_occupancy(0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn far_outlier_goes_to_nearest_component() {
        let narrow = |m: f64| DiagGaussian::new(vec![m], vec![1e-4]).unwrap();
        let gmm = Gmm::new(vec![0.5, 0.5], vec![narrow(0.0), narrow(10.0)]).unwrap();
        let set = GmmSet::new(vec![gmm]).unwrap();
        assert!(is_log_zero(set.log_prob(&[1e14], 0)));

        let mut counts = set.new_counts();
        set.accumulate(&mut counts, &[1e14], 0, 0.75);
        assert_eq!(counts.state(0)[0].occupancy, 0.0);
        assert_eq!(counts.state(0)[1].occupancy, 0.75);
        assert_eq!(counts.state_occupancy(0), 0.75);
    }

    #[test]
    fn unobserved_state_keeps_parameters() {
        let mut set = GmmSet::new(vec![Gmm::single(unit(0.0)), Gmm::single(unit(4.0))]).unwrap();
        let before = set.gmm(1).clone();
        let mut counts = set.new_counts();
        set.accumulate(&mut counts, &[1.0], 0, 1.0);
        set.reestimate(&counts).unwrap();
        assert_eq!(set.gmm(1), &before);
    }

    #[test]
    fn counts_merge_and_reset() {
        let set = GmmSet::new(vec![Gmm::single(unit(0.0))]).unwrap();
        let mut a = set.new_counts();
        let mut b = set.new_counts();
        set.accumulate(&mut a, &[1.0], 0, 0.5);
        set.accumulate(&mut b, &[2.0], 0, 1.5);
        a.merge(&b).unwrap();
        assert!((a.total_occupancy() - 2.0).abs() < 1e-12);
        assert!((a.state(0)[0].sum[0] - 3.5).abs() < 1e-12);
        set.reset_counts(&mut a);
        assert_eq!(a.total_occupancy(), 0.0);

        let other = GmmSet::new(vec![Gmm::single(unit(0.0)), Gmm::single(unit(1.0))]).unwrap();
        assert!(a.merge(&other.new_counts()).is_err());
    }

    #[test]
    fn json_roundtrip_revalidates() {
        let set = GmmSet::new(vec![Gmm::new(vec![0.3, 0.7], vec![unit(0.0), unit(1.0)]).unwrap()]).unwrap();
        let json = set.to_json().unwrap();
        assert_eq!(GmmSet::from_json(&json).unwrap(), set);

        let broken = json.replace("0.3", "0.9");
        assert!(GmmSet::from_json(&broken).is_err());
    }
}
