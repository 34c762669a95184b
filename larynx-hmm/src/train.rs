//! Iterative Forward-Backward (Baum-Welch) training over a corpus.
//!
//! [`Trainer`] is an explicit state machine:
//!
//! ```text
//! Idle --init_iter--> Iterating(i) --finish_iter--> Iterating(i + 1) ... --> Done --finish--> outputs written
//!                        |  ^
//!              init_utt  |  |  finish_utt
//!                        v  |
//!                    process_utt
//! ```
//!
//! Within an iteration, every utterance's posteriors are added into one
//! pool of GMM and transition statistics owned by the trainer. The pool is
//! consumed by re-estimation in [`Trainer::finish_iter`] and reset before
//! the next iteration. An utterance that fails (no alignment path, malformed
//! graph, mismatched dimensions) is logged and skipped without touching the
//! pool.
//!
//! # Example
//!
//! ```
//! use larynx_hmm::config::TrainerConfig;
//! use larynx_hmm::corpus::{InMemoryCorpus, Utterance};
//! use larynx_hmm::features::FeatureMatrix;
//! use larynx_hmm::gmm::{DiagGaussian, Gmm, GmmSet};
//! use larynx_hmm::graph::Graph;
//! use larynx_hmm::train::Trainer;
//!
//! let g = |m: f64| Gmm::single(DiagGaussian::new(vec![m], vec![1.0]).unwrap());
//! let model = GmmSet::new(vec![g(-1.0), g(1.0)]).unwrap();
//! let graph = Graph::linear(&[0, 1], 0.5_f64.ln(), 0.5_f64.ln()).unwrap();
//! let feats = FeatureMatrix::new(1, vec![-1.2, -0.8, 0.9, 1.1]).unwrap();
//! let corpus: InMemoryCorpus = [Utterance::new("utt1", feats)].into_iter().collect();
//!
//! let config = TrainerConfig { iters: 3, ..TrainerConfig::default() };
//! let mut trainer = Trainer::new(config, model, corpus, Some(graph)).unwrap();
//! let report = trainer.run().unwrap();
//! assert_eq!(report.iterations.len(), 3);
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};

use larynx_core::{LarynxError, Result, Summarizable};
use serde::Serialize;

use crate::chart::FbChart;
use crate::config::{GraphMode, TrainerConfig};
use crate::corpus::{Utterance, UtteranceSource};
use crate::counts::TransitionCounts;
use crate::emission::{EmissionModel, EmissionTable};
use crate::forward_backward::{FbTotals, ForwardBackward};
use crate::graph::Graph;

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Iterating { iter: usize },
    Done,
}

/// Running totals for one iteration, used for convergence reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationStats {
    /// Utterances that contributed statistics.
    pub n_utts: usize,
    /// Frames of those utterances.
    pub n_frames: usize,
    /// Sum of their total log probabilities.
    pub log_prob: f64,
    /// Utterances skipped because of an utterance-local error.
    pub n_skipped: usize,
    /// Utterances whose forward and backward totals disagreed.
    pub n_mismatched: usize,
}

impl IterationStats {
    /// Average log probability per frame (0.0 before any frame).
    pub fn log_prob_per_frame(&self) -> f64 {
        if self.n_frames == 0 {
            0.0
        } else {
            self.log_prob / self.n_frames as f64
        }
    }
}

/// Statistics of a finished iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationSummary {
    pub iter: usize,
    pub stats: IterationStats,
}

impl Summarizable for IterationSummary {
    fn summary(&self) -> String {
        format!(
            "Iteration {}: {} utts, {} frames, {} skipped, log prob/frame {:.6}",
            self.iter,
            self.stats.n_utts,
            self.stats.n_frames,
            self.stats.n_skipped,
            self.stats.log_prob_per_frame(),
        )
    }
}

/// Result of one training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    pub iterations: Vec<IterationSummary>,
}

impl TrainingReport {
    /// Total log probability of the last iteration.
    pub fn final_log_prob(&self) -> Option<f64> {
        self.iterations.last().map(|s| s.stats.log_prob)
    }
}

/// What happened to one utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum UttOutcome {
    /// Statistics were accumulated.
    Trained {
        log_prob: f64,
        n_frames: usize,
        consistent: bool,
    },
    /// An utterance-local error; nothing was accumulated.
    Skipped { reason: String },
}

/// Forward-Backward trainer over a corpus.
pub struct Trainer<M: EmissionModel, S: UtteranceSource> {
    config: TrainerConfig,
    engine: ForwardBackward,
    model: M,
    source: S,
    shared_graph: Option<Graph>,
    chart: FbChart,
    gmm_counts: M::Counts,
    trans_counts: TransitionCounts,
    last_trans_counts: TransitionCounts,
    stats: IterationStats,
    phase: Phase,
    current: Option<Utterance>,
    history: Vec<IterationSummary>,
}

impl<M: EmissionModel, S: UtteranceSource> Trainer<M, S> {
    /// Create a trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if shared graph
    /// mode is configured without a graph.
    pub fn new(config: TrainerConfig, model: M, source: S, shared_graph: Option<Graph>) -> Result<Self> {
        config.validate()?;
        if config.graph_mode == GraphMode::Shared && shared_graph.is_none() {
            return Err(LarynxError::InvalidInput(
                "graph_mode = shared requires a graph".into(),
            ));
        }
        let engine = ForwardBackward::new(config.consistency_tol, config.posterior_floor)?;
        let gmm_counts = model.new_counts();
        Ok(Self {
            config,
            engine,
            model,
            source,
            shared_graph,
            chart: FbChart::default(),
            gmm_counts,
            trans_counts: TransitionCounts::new(),
            last_trans_counts: TransitionCounts::new(),
            stats: IterationStats::default(),
            phase: Phase::Idle,
            current: None,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn shared_graph(&self) -> Option<&Graph> {
        self.shared_graph.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Totals of the iteration in progress.
    pub fn stats(&self) -> &IterationStats {
        &self.stats
    }

    pub fn history(&self) -> &[IterationSummary] {
        &self.history
    }

    /// GMM statistics pooled so far in the current iteration.
    pub fn gmm_counts(&self) -> &M::Counts {
        &self.gmm_counts
    }

    /// Transition statistics pooled so far in the current iteration.
    pub fn trans_counts(&self) -> &TransitionCounts {
        &self.trans_counts
    }

    /// Transition statistics of the last finished iteration.
    pub fn last_trans_counts(&self) -> &TransitionCounts {
        &self.last_trans_counts
    }

    /// Start an iteration: rewind the corpus and clear the pooled statistics.
    ///
    /// Returns `false` once every configured iteration has finished.
    pub fn init_iter(&mut self) -> Result<bool> {
        let iter = match self.phase {
            Phase::Done => return Ok(false),
            Phase::Idle => 0,
            Phase::Iterating { iter } => iter,
        };
        self.phase = Phase::Iterating { iter };
        self.source.rewind()?;
        self.model.reset_counts(&mut self.gmm_counts);
        self.trans_counts.reset();
        self.stats = IterationStats::default();
        self.current = None;
        tracing::debug!(iter, "starting iteration");
        Ok(true)
    }

    /// Load the next utterance.
    ///
    /// Returns `false` at the end of the corpus. Utterance-local errors from
    /// the source are logged and the utterance skipped.
    pub fn init_utt(&mut self) -> Result<bool> {
        self.expect_iterating("init_utt")?;
        loop {
            match self.source.next_utterance() {
                Ok(utt) => {
                    self.current = utt;
                    return Ok(self.current.is_some());
                }
                Err(e) if e.is_utterance_local() => {
                    tracing::warn!(error = %e, "skipping unreadable utterance");
                    self.stats.n_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run Forward-Backward on the current utterance and add its posteriors
    /// to the pooled statistics.
    ///
    /// # Errors
    ///
    /// Utterance-local failures are reported as [`UttOutcome::Skipped`];
    /// anything else is returned with the utterance id attached.
    pub fn process_utt(&mut self) -> Result<UttOutcome> {
        self.expect_iterating("process_utt")?;
        let Some(utt) = self.current.as_ref() else {
            return Err(LarynxError::InvalidInput(
                "process_utt called without a current utterance".into(),
            ));
        };
        let _span = tracing::debug_span!("utterance", id = %utt.id).entered();

        let graph = match self.config.graph_mode {
            GraphMode::Shared => self.shared_graph.as_ref(),
            GraphMode::PerUtterance => utt.graph.as_ref(),
        };

        let result = train_utterance(
            &self.engine,
            graph,
            utt,
            &self.model,
            &mut self.chart,
            &mut self.gmm_counts,
            &mut self.trans_counts,
        );

        match result {
            Ok(totals) => {
                let consistent = totals.is_consistent(self.engine.consistency_tol());
                if !consistent {
                    tracing::warn!(
                        utt = %utt.id,
                        forward = totals.forward,
                        backward = totals.backward,
                        gap = totals.gap(),
                        tol = self.engine.consistency_tol(),
                        "forward and backward totals disagree"
                    );
                    self.stats.n_mismatched += 1;
                }
                Ok(UttOutcome::Trained {
                    log_prob: totals.log_prob(),
                    n_frames: totals.n_frames,
                    consistent,
                })
            }
            Err(e) if e.is_utterance_local() => {
                tracing::warn!(utt = %utt.id, error = %e, "skipping utterance");
                let reason = e.in_utterance(utt.id.clone()).to_string();
                self.stats.n_skipped += 1;
                self.current = None;
                Ok(UttOutcome::Skipped { reason })
            }
            Err(e) => Err(e.in_utterance(utt.id.clone())),
        }
    }

    /// Add a trained utterance's total log probability and frame count to
    /// the iteration totals.
    pub fn finish_utt(&mut self, log_prob: f64) -> Result<()> {
        let utt = self.current.take().ok_or_else(|| {
            LarynxError::InvalidInput("finish_utt called without a current utterance".into())
        })?;
        self.stats.n_utts += 1;
        self.stats.n_frames += utt.n_frames();
        self.stats.log_prob += log_prob;
        tracing::debug!(utt = %utt.id, frames = utt.n_frames(), log_prob, "utterance done");
        Ok(())
    }

    /// Re-estimate the model from the pooled statistics and advance to the
    /// next iteration (or to [`Phase::Done`] after the last one).
    pub fn finish_iter(&mut self) -> Result<IterationSummary> {
        let iter = self.expect_iterating("finish_iter")?;

        self.model.reestimate(&self.gmm_counts)?;
        if self.config.update_trans {
            if let Some(graph) = &self.shared_graph {
                self.shared_graph = Some(graph.with_reestimated_transitions(&self.trans_counts)?);
            }
        }
        self.last_trans_counts = self.trans_counts.take();
        self.model.reset_counts(&mut self.gmm_counts);

        let summary = IterationSummary {
            iter,
            stats: std::mem::take(&mut self.stats),
        };
        tracing::info!(
            iter,
            utts = summary.stats.n_utts,
            frames = summary.stats.n_frames,
            skipped = summary.stats.n_skipped,
            mismatched = summary.stats.n_mismatched,
            log_prob_per_frame = summary.stats.log_prob_per_frame(),
            "iteration finished"
        );
        self.history.push(summary.clone());

        self.phase = if iter + 1 < self.config.iters {
            Phase::Iterating { iter: iter + 1 }
        } else {
            Phase::Done
        };
        Ok(summary)
    }

    fn expect_iterating(&self, op: &str) -> Result<usize> {
        match self.phase {
            Phase::Iterating { iter } => Ok(iter),
            phase => Err(LarynxError::InvalidInput(format!(
                "{op} called in phase {phase:?}"
            ))),
        }
    }
}

/// Score one utterance, run both passes over `graph` and add its posteriors
/// to `counts` and `trans`.
#[allow(clippy::too_many_arguments)]
fn train_utterance<M: EmissionModel>(
    engine: &ForwardBackward,
    graph: Option<&Graph>,
    utt: &Utterance,
    model: &M,
    chart: &mut FbChart,
    counts: &mut M::Counts,
    trans: &mut TransitionCounts,
) -> Result<FbTotals> {
    let graph = graph
        .ok_or_else(|| LarynxError::MalformedGraph("utterance has no alignment graph".into()))?;
    if let Some(max) = graph.max_gmm() {
        if max >= model.n_states() {
            return Err(LarynxError::MalformedGraph(format!(
                "graph emits with state {max}, model has {} states",
                model.n_states()
            )));
        }
    }
    let feats = &utt.features;
    if feats.dim() != model.dim() {
        return Err(LarynxError::DimensionMismatch(format!(
            "feature dim {} != model dim {}",
            feats.dim(),
            model.dim()
        )));
    }

    let computed;
    let emissions = match &utt.emissions {
        Some(table) => {
            if table.n_frames() != feats.n_frames() {
                return Err(LarynxError::DimensionMismatch(format!(
                    "{} feature frames, {} emission frames",
                    feats.n_frames(),
                    table.n_frames()
                )));
            }
            table
        }
        None => {
            computed = EmissionTable::compute(model, feats)?;
            &computed
        }
    };

    let totals = engine.run(graph, emissions, chart)?;
    engine.accumulate(graph, feats, emissions, chart, &totals, model, counts, trans)?;
    Ok(totals)
}

impl<M, S> Trainer<M, S>
where
    M: EmissionModel + Serialize,
    S: UtteranceSource,
{
    /// Write the trained model to `out_gmm` and the last iteration's
    /// transition counts to `out_trans`, when configured.
    pub fn finish(&mut self) -> Result<()> {
        if self.phase != Phase::Done {
            return Err(LarynxError::InvalidInput(format!(
                "finish called in phase {:?}",
                self.phase
            )));
        }
        if let Some(path) = &self.config.out_gmm {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, &self.model)
                .map_err(|e| LarynxError::Serialization(e.to_string()))?;
            writer.flush()?;
            tracing::info!(path = %path.display(), "wrote model");
        }
        if let Some(path) = &self.config.out_trans {
            self.last_trans_counts.write_to(BufWriter::new(File::create(path)?))?;
            tracing::info!(
                path = %path.display(),
                transitions = self.last_trans_counts.len(),
                "wrote transition counts"
            );
        }
        Ok(())
    }

    /// Run every iteration over the corpus, then [`finish`](Self::finish).
    pub fn run(&mut self) -> Result<TrainingReport> {
        while self.init_iter()? {
            while self.init_utt()? {
                if let UttOutcome::Trained { log_prob, .. } = self.process_utt()? {
                    self.finish_utt(log_prob)?;
                }
            }
            self.finish_iter()?;
        }
        self.finish()?;
        Ok(TrainingReport {
            iterations: self.history.clone(),
        })
    }
}
