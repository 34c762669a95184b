//! Training corpus access.
//!
//! Feature extraction and graph loading happen outside this crate; an
//! [`UtteranceSource`] hands the trainer one finished [`Utterance`] at a time.

use larynx_core::{Annotated, Result};

use crate::emission::EmissionTable;
use crate::features::FeatureMatrix;
use crate::graph::Graph;

/// One training utterance.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: String,
    pub features: FeatureMatrix,
    /// Alignment graph, required when training in per-utterance graph mode.
    pub graph: Option<Graph>,
    /// Precomputed emission log probabilities; the model scores the features
    /// when absent.
    pub emissions: Option<EmissionTable>,
}

impl Utterance {
    pub fn new(id: impl Into<String>, features: FeatureMatrix) -> Self {
        Self {
            id: id.into(),
            features,
            graph: None,
            emissions: None,
        }
    }

    pub fn with_graph(mut self, graph: Graph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_emissions(mut self, emissions: EmissionTable) -> Self {
        self.emissions = Some(emissions);
        self
    }

    pub fn n_frames(&self) -> usize {
        self.features.n_frames()
    }
}

impl Annotated for Utterance {
    fn name(&self) -> &str {
        &self.id
    }
}

/// Sequential reader over a corpus, restartable once per iteration.
pub trait UtteranceSource {
    /// Position at the first utterance.
    fn rewind(&mut self) -> Result<()>;

    /// Next utterance, or `None` at the end of the corpus.
    fn next_utterance(&mut self) -> Result<Option<Utterance>>;
}

/// Corpus held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    utterances: Vec<Utterance>,
    pos: usize,
}

impl InMemoryCorpus {
    pub fn new(utterances: Vec<Utterance>) -> Self {
        Self { utterances, pos: 0 }
    }

    pub fn push(&mut self, utt: Utterance) {
        self.utterances.push(utt);
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

impl FromIterator<Utterance> for InMemoryCorpus {
    fn from_iter<I: IntoIterator<Item = Utterance>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl UtteranceSource for InMemoryCorpus {
    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn next_utterance(&mut self) -> Result<Option<Utterance>> {
        let utt = self.utterances.get(self.pos).cloned();
        if utt.is_some() {
            self.pos += 1;
        }
        Ok(utt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(id: &str) -> Utterance {
        Utterance::new(id, FeatureMatrix::new(1, vec![0.0, 1.0]).unwrap())
    }

    #[test]
    fn iterates_and_rewinds() {
        let mut corpus: InMemoryCorpus = [utt("a"), utt("b")].into_iter().collect();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.next_utterance().unwrap().unwrap().name(), "a");
        assert_eq!(corpus.next_utterance().unwrap().unwrap().name(), "b");
        assert!(corpus.next_utterance().unwrap().is_none());
        assert!(corpus.next_utterance().unwrap().is_none());

        corpus.rewind().unwrap();
        assert_eq!(corpus.next_utterance().unwrap().unwrap().id, "a");
    }

    #[test]
    fn builder_attaches_graph_and_emissions() {
        let graph = Graph::linear(&[0], 0.0, 0.0).unwrap();
        let em = EmissionTable::from_rows(&[vec![-1.0], vec![-2.0]]).unwrap();
        let u = utt("x").with_graph(graph).with_emissions(em);
        assert_eq!(u.n_frames(), 2);
        assert!(u.graph.is_some());
        assert_eq!(u.emissions.as_ref().map(|e| e.n_frames()), Some(2));
    }
}
