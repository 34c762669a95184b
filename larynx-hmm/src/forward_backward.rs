//! Forward-Backward (Baum-Welch E-step) over an HMM graph.
//!
//! Given a [`Graph`] and a per-utterance [`EmissionTable`], the forward pass
//! fills `forw[f][s]`, the log probability of the first `f + 1` frames ending
//! in node `s`, and the backward pass fills `back[f][s]`, the log probability
//! of the remaining frames given node `s` at frame `f`. Both totals are
//! returned so callers can check that they agree.
//!
//! Posteriors are derived from the chart and delivered to an
//! [`EmissionModel`] accumulator (state occupancy) and to
//! [`TransitionCounts`] (arc traversals).
//!
//! All arithmetic is in the log domain with the [`LOG_ZERO`] sentinel.

use larynx_core::{is_log_zero, log_mul, log_sum, LarynxError, Result, LOG_ZERO};

use crate::chart::FbChart;
use crate::counts::TransitionCounts;
use crate::emission::{EmissionModel, EmissionTable};
use crate::features::FeatureMatrix;
use crate::graph::{ArcKind, Graph};

/// Default tolerance on `|forward total - backward total|`.
pub const DEFAULT_CONSISTENCY_TOL: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Run the forward pass over a freshly reset chart.
///
/// Returns the total utterance log probability: the log-sum over nodes of
/// the last frame's forward value plus the node's exit cost.
pub fn forward_pass(graph: &Graph, emissions: &EmissionTable, chart: &mut FbChart) -> f64 {
    let n_frames = chart.n_frames();
    if n_frames == 0 {
        return LOG_ZERO;
    }

    for (s, gmm) in graph.emitting() {
        chart.cell_mut(0, s).forw_log_prob = log_mul(graph.entry_cost(s), emissions.get(0, gmm));
    }

    for f in 1..n_frames {
        for (s, gmm) in graph.emitting() {
            let incoming = log_sum(graph.in_arcs(s).iter().map(|&a| {
                let arc = graph.arc(a);
                log_mul(chart.forw(f - 1, arc.src), arc.log_prob)
            }));
            chart.cell_mut(f, s).forw_log_prob = log_mul(incoming, emissions.get(f, gmm));
        }
    }

    let last = n_frames - 1;
    log_sum(
        graph
            .emitting()
            .map(|(s, _)| log_mul(chart.forw(last, s), graph.exit_cost(s))),
    )
}

/// Seed the last frame with each node's exit cost: `ln 1 = 0` for an
/// emitting exit node, the exit-arc log probability for nodes feeding a
/// non-emitting exit, and zero probability everywhere else.
fn seed_last_frame(graph: &Graph, chart: &mut FbChart) {
    let Some(last) = chart.n_frames().checked_sub(1) else {
        return;
    };
    for (s, _) in graph.emitting() {
        chart.cell_mut(last, s).back_log_prob = graph.exit_cost(s);
    }
}

/// Seed the last frame of a freshly reset chart and run the backward pass
/// down to frame 0.
///
/// Returns the backward total: the log-sum over nodes of entry cost,
/// first-frame emission and backward value at frame 0.
pub fn init_backward_pass(graph: &Graph, emissions: &EmissionTable, chart: &mut FbChart) -> f64 {
    let n_frames = chart.n_frames();
    if n_frames == 0 {
        return LOG_ZERO;
    }
    seed_last_frame(graph, chart);

    for f in (0..n_frames - 1).rev() {
        for (s, _) in graph.emitting() {
            let outgoing = log_sum(graph.out_arcs(s).iter().map(|&a| {
                let arc = graph.arc(a);
                graph.gmm(arc.dst).map_or(LOG_ZERO, |g| {
                    log_mul(
                        log_mul(arc.log_prob, emissions.get(f + 1, g)),
                        chart.back(f + 1, arc.dst),
                    )
                })
            }));
            chart.cell_mut(f, s).back_log_prob = outgoing;
        }
    }

    log_sum(graph.emitting().map(|(s, gmm)| {
        log_mul(
            log_mul(graph.entry_cost(s), emissions.get(0, gmm)),
            chart.back(0, s),
        )
    }))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Total log probabilities from the two passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FbTotals {
    pub forward: f64,
    pub backward: f64,
    pub n_frames: usize,
}

impl FbTotals {
    /// The utterance log probability used for posteriors (the forward total).
    pub fn log_prob(&self) -> f64 {
        self.forward
    }

    /// `|forward - backward|`.
    pub fn gap(&self) -> f64 {
        (self.forward - self.backward).abs()
    }

    pub fn is_consistent(&self, tol: f64) -> bool {
        self.gap() <= tol
    }
}

/// Posterior probability that `node` (emitting with `gmm`) was occupied at
/// `frame`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatePosterior {
    pub frame: usize,
    pub node: usize,
    pub gmm: usize,
    pub weight: f64,
}

/// Soft counts one utterance contributed to the accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UttOccupancy {
    /// Sum of state posteriors delivered to the emission model.
    pub state_weight: f64,
    /// Number of `(frame, node)` posteriors delivered.
    pub n_delivered: usize,
    /// Sum of arc posteriors added to the transition counts.
    pub arc_weight: f64,
}

/// State occupancy posteriors `exp(forw + back - total)` for every
/// `(frame, emitting node)` with non-zero weight.
pub fn state_posteriors(graph: &Graph, chart: &FbChart, total: f64) -> Vec<StatePosterior> {
    let mut out = Vec::new();
    for f in 0..chart.n_frames() {
        for (s, gmm) in graph.emitting() {
            let cell = chart.cell(f, s);
            let weight = (log_mul(cell.forw_log_prob, cell.back_log_prob) - total).exp();
            if weight > 0.0 {
                out.push(StatePosterior {
                    frame: f,
                    node: s,
                    gmm,
                    weight,
                });
            }
        }
    }
    out
}

/// Expected traversal count of every arc, summed over frames, indexed by
/// arc position in the graph.
pub fn arc_posteriors(graph: &Graph, emissions: &EmissionTable, chart: &FbChart, total: f64) -> Vec<f64> {
    let n_frames = chart.n_frames();
    let mut out = vec![0.0; graph.n_arcs()];
    if n_frames == 0 {
        return out;
    }
    let last = n_frames - 1;

    for (a, weight) in out.iter_mut().enumerate() {
        let arc = graph.arc(a);
        *weight = match graph.arc_kind(a) {
            ArcKind::Entry => graph.gmm(arc.dst).map_or(0.0, |g| {
                let lp = log_mul(log_mul(arc.log_prob, emissions.get(0, g)), chart.back(0, arc.dst));
                (lp - total).exp()
            }),
            ArcKind::Exit => (log_mul(chart.forw(last, arc.src), arc.log_prob) - total).exp(),
            ArcKind::Interior => graph.gmm(arc.dst).map_or(0.0, |g| {
                (0..last)
                    .map(|f| {
                        let lp = log_mul(
                            log_mul(chart.forw(f, arc.src), arc.log_prob),
                            log_mul(emissions.get(f + 1, g), chart.back(f + 1, arc.dst)),
                        );
                        (lp - total).exp()
                    })
                    .sum()
            }),
        };
    }
    out
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Forward-Backward engine: runs both passes and turns the chart into
/// accumulated statistics.
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    consistency_tol: f64,
    posterior_floor: f64,
}

impl Default for ForwardBackward {
    fn default() -> Self {
        Self {
            consistency_tol: DEFAULT_CONSISTENCY_TOL,
            posterior_floor: 0.0,
        }
    }
}

impl ForwardBackward {
    /// # Errors
    ///
    /// Returns an error if `consistency_tol` is not positive or
    /// `posterior_floor` is negative.
    pub fn new(consistency_tol: f64, posterior_floor: f64) -> Result<Self> {
        if !(consistency_tol > 0.0) {
            return Err(LarynxError::InvalidInput(
                "consistency tolerance must be > 0".into(),
            ));
        }
        if !(posterior_floor >= 0.0) {
            return Err(LarynxError::InvalidInput(
                "posterior floor must be >= 0".into(),
            ));
        }
        Ok(Self {
            consistency_tol,
            posterior_floor,
        })
    }

    pub fn consistency_tol(&self) -> f64 {
        self.consistency_tol
    }

    pub fn posterior_floor(&self) -> f64 {
        self.posterior_floor
    }

    /// Reset `chart` for this utterance and run the forward and backward
    /// passes.
    ///
    /// A forward/backward disagreement beyond the tolerance is not an error;
    /// callers check [`FbTotals::is_consistent`] against
    /// [`consistency_tol`](Self::consistency_tol) and report it with their
    /// own context.
    ///
    /// # Errors
    ///
    /// - [`LarynxError::DimensionMismatch`] if the table lacks a state the
    ///   graph emits with
    /// - [`LarynxError::ZeroProbability`] if the utterance is empty or no
    ///   path through the graph has non-zero probability
    pub fn run(&self, graph: &Graph, emissions: &EmissionTable, chart: &mut FbChart) -> Result<FbTotals> {
        if let Some(max) = graph.max_gmm() {
            if max >= emissions.n_states() {
                return Err(LarynxError::DimensionMismatch(format!(
                    "graph emits with state {max}, emission table has {} states",
                    emissions.n_states()
                )));
            }
        }
        let n_frames = emissions.n_frames();
        if n_frames == 0 {
            return Err(LarynxError::ZeroProbability("utterance has no frames".into()));
        }

        chart.reset(n_frames, graph.n_nodes());
        let forward = forward_pass(graph, emissions, chart);
        let backward = init_backward_pass(graph, emissions, chart);

        if is_log_zero(forward) || is_log_zero(backward) {
            return Err(LarynxError::ZeroProbability(format!(
                "no alignment path over {n_frames} frames"
            )));
        }
        if !(forward.is_finite() && backward.is_finite()) {
            return Err(LarynxError::InvalidInput(format!(
                "non-finite total log probability (forward {forward}, backward {backward})"
            )));
        }

        let totals = FbTotals {
            forward,
            backward,
            n_frames,
        };
        tracing::debug!(
            frames = n_frames,
            forward,
            backward,
            consistent = totals.is_consistent(self.consistency_tol),
            "forward-backward complete"
        );
        Ok(totals)
    }

    /// Deliver the posteriors in `chart` to the accumulators.
    ///
    /// State posteriors above the floor go to `model.accumulate` with the
    /// frame's feature vector; arc posteriors are added to `trans` under each
    /// arc's transition id. Posteriors are normalized by the forward total.
    ///
    /// All checks happen before anything is added, so a failed call leaves
    /// the accumulators untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LarynxError::DimensionMismatch`] if `feats` disagrees with
    /// the chart's frame count or the model's dimension, or the graph emits
    /// with a state the model lacks.
    #[allow(clippy::too_many_arguments)]
    pub fn accumulate<M>(
        &self,
        graph: &Graph,
        feats: &FeatureMatrix,
        emissions: &EmissionTable,
        chart: &FbChart,
        totals: &FbTotals,
        model: &M,
        counts: &mut M::Counts,
        trans: &mut TransitionCounts,
    ) -> Result<UttOccupancy>
    where
        M: EmissionModel + ?Sized,
    {
        if feats.n_frames() != chart.n_frames() || emissions.n_frames() != chart.n_frames() {
            return Err(LarynxError::DimensionMismatch(format!(
                "feature frames {} / emission frames {} != chart frames {}",
                feats.n_frames(),
                emissions.n_frames(),
                chart.n_frames()
            )));
        }
        if feats.dim() != model.dim() {
            return Err(LarynxError::DimensionMismatch(format!(
                "feature dim {} != model dim {}",
                feats.dim(),
                model.dim()
            )));
        }
        if let Some(max) = graph.max_gmm() {
            if max >= model.n_states() {
                return Err(LarynxError::DimensionMismatch(format!(
                    "graph emits with state {max}, model has {} states",
                    model.n_states()
                )));
            }
        }

        let total = totals.log_prob();
        let mut occ = UttOccupancy::default();

        for post in state_posteriors(graph, chart, total) {
            if post.weight > self.posterior_floor {
                model.accumulate(counts, feats.frame(post.frame), post.gmm, post.weight);
                occ.state_weight += post.weight;
                occ.n_delivered += 1;
            }
        }

        for (a, weight) in arc_posteriors(graph, emissions, chart, total).into_iter().enumerate() {
            if weight > 0.0 {
                trans.add(graph.arc(a).id, weight);
                occ.arc_weight += weight;
            }
        }

        Ok(occ)
    }
}
