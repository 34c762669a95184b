//! Forward-Backward (Baum-Welch) training of GMM/HMM acoustic models for the
//! Larynx speech toolkit.
//!
//! An utterance is a sequence of feature frames aligned against an HMM
//! [`Graph`] whose emitting nodes each point at a Gaussian mixture. The
//! [`ForwardBackward`] engine fills an [`FbChart`] of forward and backward
//! log probabilities, derives state and arc posteriors from it, and adds them
//! to GMM and transition accumulators. [`Trainer`] drives that over a corpus
//! for a number of iterations, re-estimating the model after each one.
//!
//! # Quick start
//!
//! ```
//! use larynx_hmm::{EmissionTable, FbChart, ForwardBackward, Graph};
//!
//! let half = 0.5_f64.ln();
//! let graph = Graph::linear(&[0, 1], half, half).unwrap();
//! let emissions =
//!     EmissionTable::from_rows(&[vec![-1.0, -2.0], vec![-1.5, -0.5], vec![-2.0, -1.0]]).unwrap();
//!
//! let mut chart = FbChart::default();
//! let totals = ForwardBackward::default().run(&graph, &emissions, &mut chart).unwrap();
//! assert!(totals.is_consistent(1e-9));
//! ```

pub mod chart;
pub mod config;
pub mod corpus;
pub mod counts;
pub mod emission;
pub mod features;
pub mod forward_backward;
pub mod gmm;
pub mod graph;
pub mod train;

pub use chart::{FbCell, FbChart};
pub use config::{GraphMode, TrainerConfig};
pub use corpus::{InMemoryCorpus, Utterance, UtteranceSource};
pub use counts::TransitionCounts;
pub use emission::{EmissionModel, EmissionTable};
pub use features::FeatureMatrix;
pub use forward_backward::{
    arc_posteriors, forward_pass, init_backward_pass, state_posteriors, FbTotals,
    ForwardBackward, StatePosterior, UttOccupancy,
};
pub use gmm::{DiagGaussian, Gmm, GmmCount, GmmCounts, GmmSet};
pub use graph::{Arc, ArcKind, Graph};
pub use train::{IterationStats, IterationSummary, Phase, Trainer, TrainingReport, UttOutcome};
