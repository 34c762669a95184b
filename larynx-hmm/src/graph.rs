//! HMM topology: states (nodes) joined by weighted transitions (arcs).
//!
//! Every node carries an optional emission-model state index. Only the entry
//! and exit nodes may be non-emitting. Arcs between emitting nodes advance
//! exactly one frame; arcs leaving a non-emitting entry are taken before the
//! first frame and arcs entering a non-emitting exit after the last one.

use std::collections::VecDeque;

use larynx_core::prob::clamp_log_prob;
use larynx_core::{log_sum, LarynxError, Result, Summarizable, LOG_ZERO};
use serde::{Deserialize, Serialize};

use crate::counts::TransitionCounts;

/// A directed transition between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arc {
    pub src: usize,
    pub dst: usize,
    /// Natural log of the transition probability.
    pub log_prob: f64,
    /// Transition identifier; key into [`TransitionCounts`].
    pub id: usize,
}

impl Arc {
    /// Arc whose transition id is assigned from its position in the graph.
    pub fn new(src: usize, dst: usize, log_prob: f64) -> Self {
        Self {
            src,
            dst,
            log_prob,
            id: usize::MAX,
        }
    }

    /// Arc with an explicit transition id, for graphs whose arcs share
    /// transition statistics with another topology.
    pub fn with_id(src: usize, dst: usize, log_prob: f64, id: usize) -> Self {
        Self {
            src,
            dst,
            log_prob,
            id,
        }
    }
}

/// Where an arc sits relative to the frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcKind {
    /// Leaves a non-emitting entry; taken before frame 0.
    Entry,
    /// Joins two emitting nodes; spans one frame advance.
    Interior,
    /// Enters a non-emitting exit; taken after the last frame.
    Exit,
}

/// Validated HMM topology with designated entry and exit nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    gmms: Vec<Option<usize>>,
    arcs: Vec<Arc>,
    entry: usize,
    exit: usize,
    /// Interior arc indices entering each node.
    in_arcs: Vec<Vec<usize>>,
    /// Interior arc indices leaving each node.
    out_arcs: Vec<Vec<usize>>,
    entry_arcs: Vec<usize>,
    exit_arcs: Vec<usize>,
    entry_costs: Vec<f64>,
    exit_costs: Vec<f64>,
}

impl Graph {
    /// Build and validate a graph.
    ///
    /// `gmms[s]` is the emission-model state node `s` emits with, or `None`
    /// for a non-emitting node. Arcs built with [`Arc::new`] get their index
    /// as transition id. `-inf` arc log probabilities are mapped to
    /// [`LOG_ZERO`].
    ///
    /// # Errors
    ///
    /// Returns [`LarynxError::MalformedGraph`] if:
    /// - the graph is empty or `entry`/`exit` are out of range
    /// - an interior node is non-emitting
    /// - an arc references a missing node, enters a non-emitting entry,
    ///   leaves a non-emitting exit, or joins them directly
    /// - an arc log probability is NaN
    /// - a node is unreachable from the entry or cannot reach the exit
    pub fn new(gmms: Vec<Option<usize>>, arcs: Vec<Arc>, entry: usize, exit: usize) -> Result<Self> {
        let n = gmms.len();
        if n == 0 {
            return Err(LarynxError::MalformedGraph("graph has no nodes".into()));
        }
        if entry >= n {
            return Err(LarynxError::MalformedGraph(format!(
                "entry node {entry} out of range (n_nodes = {n})"
            )));
        }
        if exit >= n {
            return Err(LarynxError::MalformedGraph(format!(
                "exit node {exit} out of range (n_nodes = {n})"
            )));
        }
        for (s, gmm) in gmms.iter().enumerate() {
            if gmm.is_none() && s != entry && s != exit {
                return Err(LarynxError::MalformedGraph(format!(
                    "interior node {s} is non-emitting"
                )));
            }
        }
        if entry == exit && gmms[entry].is_none() {
            return Err(LarynxError::MalformedGraph(
                "entry and exit coincide on a non-emitting node".into(),
            ));
        }

        let entry_emits = gmms[entry].is_some();
        let exit_emits = gmms[exit].is_some();

        let mut arcs = arcs;
        let mut in_arcs = vec![Vec::new(); n];
        let mut out_arcs = vec![Vec::new(); n];
        let mut entry_arcs = Vec::new();
        let mut exit_arcs = Vec::new();

        for (a, arc) in arcs.iter_mut().enumerate() {
            if arc.src >= n || arc.dst >= n {
                return Err(LarynxError::MalformedGraph(format!(
                    "arc {a} ({} -> {}) references a missing node (n_nodes = {n})",
                    arc.src, arc.dst
                )));
            }
            arc.log_prob = clamp_log_prob(arc.log_prob)
                .map_err(|_| LarynxError::MalformedGraph(format!("arc {a} log prob is NaN")))?;
            if arc.id == usize::MAX {
                arc.id = a;
            }

            let from_entry = !entry_emits && arc.src == entry;
            let into_exit = !exit_emits && arc.dst == exit;
            if !entry_emits && arc.dst == entry {
                return Err(LarynxError::MalformedGraph(format!(
                    "arc {a} enters non-emitting entry node {entry}"
                )));
            }
            if !exit_emits && arc.src == exit {
                return Err(LarynxError::MalformedGraph(format!(
                    "arc {a} leaves non-emitting exit node {exit}"
                )));
            }
            match (from_entry, into_exit) {
                (true, true) => {
                    return Err(LarynxError::MalformedGraph(format!(
                        "arc {a} joins non-emitting entry to non-emitting exit"
                    )))
                }
                (true, false) => entry_arcs.push(a),
                (false, true) => exit_arcs.push(a),
                (false, false) => {
                    out_arcs[arc.src].push(a);
                    in_arcs[arc.dst].push(a);
                }
            }
        }

        let mut entry_costs = vec![LOG_ZERO; n];
        if entry_emits {
            entry_costs[entry] = 0.0;
        } else {
            for s in 0..n {
                entry_costs[s] = log_sum(
                    entry_arcs
                        .iter()
                        .filter(|&&a| arcs[a].dst == s)
                        .map(|&a| arcs[a].log_prob),
                );
            }
        }
        let mut exit_costs = vec![LOG_ZERO; n];
        if exit_emits {
            exit_costs[exit] = 0.0;
        } else {
            for s in 0..n {
                exit_costs[s] = log_sum(
                    exit_arcs
                        .iter()
                        .filter(|&&a| arcs[a].src == s)
                        .map(|&a| arcs[a].log_prob),
                );
            }
        }

        let graph = Self {
            gmms,
            arcs,
            entry,
            exit,
            in_arcs,
            out_arcs,
            entry_arcs,
            exit_arcs,
            entry_costs,
            exit_costs,
        };

        let fwd = graph.reachable_from_entry();
        if let Some(s) = fwd.iter().position(|&r| !r) {
            return Err(LarynxError::MalformedGraph(format!(
                "node {s} is unreachable from entry node {entry}"
            )));
        }
        let bwd = graph.reaches_exit();
        if let Some(s) = bwd.iter().position(|&r| !r) {
            return Err(LarynxError::MalformedGraph(format!(
                "node {s} cannot reach exit node {exit}"
            )));
        }

        Ok(graph)
    }

    /// Left-to-right chain over `gmms`: each state has a self-loop and an
    /// advance arc to the next state. Entry is the first state, exit the last.
    pub fn linear(gmms: &[usize], self_loop_log_prob: f64, advance_log_prob: f64) -> Result<Self> {
        let mut arcs = Vec::with_capacity(gmms.len() * 2);
        for s in 0..gmms.len() {
            arcs.push(Arc::new(s, s, self_loop_log_prob));
            if s + 1 < gmms.len() {
                arcs.push(Arc::new(s, s + 1, advance_log_prob));
            }
        }
        let exit = gmms.len().saturating_sub(1);
        Self::new(gmms.iter().map(|&g| Some(g)).collect(), arcs, 0, exit)
    }

    pub fn n_nodes(&self) -> usize {
        self.gmms.len()
    }

    pub fn n_arcs(&self) -> usize {
        self.arcs.len()
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn exit(&self) -> usize {
        self.exit
    }

    pub fn arcs(&self) -> &[Arc] {
        &self.arcs
    }

    pub fn arc(&self, a: usize) -> &Arc {
        &self.arcs[a]
    }

    /// Emission-model state of node `s`, `None` if non-emitting.
    pub fn gmm(&self, s: usize) -> Option<usize> {
        self.gmms[s]
    }

    /// Iterator over `(node, gmm)` for every emitting node.
    pub fn emitting(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.gmms
            .iter()
            .enumerate()
            .filter_map(|(s, g)| g.map(|g| (s, g)))
    }

    /// Largest emission-model state referenced, `None` if nothing emits.
    pub fn max_gmm(&self) -> Option<usize> {
        self.gmms.iter().flatten().copied().max()
    }

    /// Interior arcs entering node `s`.
    pub fn in_arcs(&self, s: usize) -> &[usize] {
        &self.in_arcs[s]
    }

    /// Interior arcs leaving node `s`.
    pub fn out_arcs(&self, s: usize) -> &[usize] {
        &self.out_arcs[s]
    }

    /// Arcs leaving a non-emitting entry (empty if the entry emits).
    pub fn entry_arcs(&self) -> &[usize] {
        &self.entry_arcs
    }

    /// Arcs entering a non-emitting exit (empty if the exit emits).
    pub fn exit_arcs(&self) -> &[usize] {
        &self.exit_arcs
    }

    /// Log probability of starting in node `s` at frame 0.
    pub fn entry_cost(&self, s: usize) -> f64 {
        self.entry_costs[s]
    }

    /// Log probability of ending after the last frame in node `s`.
    pub fn exit_cost(&self, s: usize) -> f64 {
        self.exit_costs[s]
    }

    /// Classify arc `a`.
    pub fn arc_kind(&self, a: usize) -> ArcKind {
        let arc = &self.arcs[a];
        if self.gmms[self.entry].is_none() && arc.src == self.entry {
            ArcKind::Entry
        } else if self.gmms[self.exit].is_none() && arc.dst == self.exit {
            ArcKind::Exit
        } else {
            ArcKind::Interior
        }
    }

    /// Nodes reachable from the entry by following arcs forward.
    pub fn reachable_from_entry(&self) -> Vec<bool> {
        self.search(self.entry, |arc| (arc.src, arc.dst))
    }

    /// Nodes from which the exit is reachable.
    pub fn reaches_exit(&self) -> Vec<bool> {
        self.search(self.exit, |arc| (arc.dst, arc.src))
    }

    fn search(&self, start: usize, orient: impl Fn(&Arc) -> (usize, usize)) -> Vec<bool> {
        let n = self.n_nodes();
        let mut adj = vec![Vec::new(); n];
        for arc in &self.arcs {
            let (from, to) = orient(arc);
            adj[from].push(to);
        }
        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;
        while let Some(s) = queue.pop_front() {
            for &t in &adj[s] {
                if !seen[t] {
                    seen[t] = true;
                    queue.push_back(t);
                }
            }
        }
        seen
    }

    /// Copy of this graph with arc log probabilities re-estimated from
    /// accumulated transition counts.
    ///
    /// Each arc gets `ln(count / total)` where `total` sums the counts of all
    /// arcs leaving the same node. Nodes whose outgoing arcs were never
    /// traversed keep their previous probabilities.
    ///
    /// # Errors
    ///
    /// Propagates validation errors from [`Graph::new`].
    pub fn with_reestimated_transitions(&self, counts: &TransitionCounts) -> Result<Self> {
        let n = self.n_nodes();
        let mut totals = vec![0.0; n];
        for arc in &self.arcs {
            totals[arc.src] += counts.get(arc.id);
        }
        let arcs = self
            .arcs
            .iter()
            .map(|arc| {
                let total = totals[arc.src];
                let log_prob = if total > 0.0 {
                    let c = counts.get(arc.id);
                    if c > 0.0 {
                        (c / total).ln()
                    } else {
                        LOG_ZERO
                    }
                } else {
                    arc.log_prob
                };
                Arc::with_id(arc.src, arc.dst, log_prob, arc.id)
            })
            .collect();
        Self::new(self.gmms.clone(), arcs, self.entry, self.exit)
    }
}

impl Summarizable for Graph {
    fn summary(&self) -> String {
        format!(
            "Graph: {} nodes, {} arcs, entry={}, exit={}",
            self.n_nodes(),
            self.n_arcs(),
            self.entry,
            self.exit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half() -> f64 {
        0.5_f64.ln()
    }

    #[test]
    fn linear_graph_structure() {
        let g = Graph::linear(&[0, 1, 2], half(), half()).unwrap();
        assert_eq!(g.n_nodes(), 3);
        assert_eq!(g.n_arcs(), 5);
        assert_eq!(g.entry(), 0);
        assert_eq!(g.exit(), 2);
        assert_eq!(g.entry_cost(0), 0.0);
        assert_eq!(g.entry_cost(1), LOG_ZERO);
        assert_eq!(g.exit_cost(2), 0.0);
        assert_eq!(g.in_arcs(1).len(), 2);
        assert_eq!(g.out_arcs(2).len(), 1);
        assert!(g.entry_arcs().is_empty());
        assert_eq!(g.max_gmm(), Some(2));
        for a in 0..g.n_arcs() {
            assert_eq!(g.arc(a).id, a);
            assert_eq!(g.arc_kind(a), ArcKind::Interior);
        }
    }

    #[test]
    fn non_emitting_entry_and_exit() {
        // 0 (entry, silent) -> 1 -> 2 -> 3 (exit, silent), plus a skip 0 -> 2
        let arcs = vec![
            Arc::new(0, 1, 0.7_f64.ln()),
            Arc::new(0, 2, 0.3_f64.ln()),
            Arc::new(1, 1, half()),
            Arc::new(1, 2, half()),
            Arc::new(2, 2, half()),
            Arc::new(2, 3, half()),
        ];
        let g = Graph::new(vec![None, Some(0), Some(1), None], arcs, 0, 3).unwrap();
        assert_eq!(g.entry_arcs(), &[0, 1]);
        assert_eq!(g.exit_arcs(), &[5]);
        assert!((g.entry_cost(1) - 0.7_f64.ln()).abs() < 1e-12);
        assert!((g.entry_cost(2) - 0.3_f64.ln()).abs() < 1e-12);
        assert_eq!(g.entry_cost(3), LOG_ZERO);
        assert!((g.exit_cost(2) - half()).abs() < 1e-12);
        assert_eq!(g.exit_cost(1), LOG_ZERO);
        assert_eq!(g.arc_kind(0), ArcKind::Entry);
        assert_eq!(g.arc_kind(3), ArcKind::Interior);
        assert_eq!(g.arc_kind(5), ArcKind::Exit);
    }

    #[test]
    fn explicit_transition_ids_survive() {
        let arcs = vec![Arc::with_id(0, 0, half(), 7), Arc::with_id(0, 1, half(), 9), Arc::new(1, 1, 0.0)];
        let g = Graph::new(vec![Some(0), Some(1)], arcs, 0, 1).unwrap();
        assert_eq!(g.arc(0).id, 7);
        assert_eq!(g.arc(1).id, 9);
        assert_eq!(g.arc(2).id, 2);
    }

    #[test]
    fn negative_infinity_is_clamped() {
        let arcs = vec![Arc::new(0, 1, f64::NEG_INFINITY)];
        let g = Graph::new(vec![Some(0), Some(1)], arcs, 0, 1).unwrap();
        assert_eq!(g.arc(0).log_prob, LOG_ZERO);
    }

    #[test]
    fn rejects_unreachable_node() {
        let arcs = vec![Arc::new(0, 1, 0.0)];
        let err = Graph::new(vec![Some(0), Some(1), Some(2)], arcs, 0, 1).unwrap_err();
        assert!(matches!(err, LarynxError::MalformedGraph(_)));
    }

    #[test]
    fn rejects_dead_end_node() {
        // Node 2 is reachable from entry but cannot reach the exit.
        let arcs = vec![Arc::new(0, 1, half()), Arc::new(0, 2, half())];
        let err = Graph::new(vec![Some(0), Some(1), Some(2)], arcs, 0, 1).unwrap_err();
        assert!(err.to_string().contains("cannot reach exit"));
    }

    #[test]
    fn rejects_structural_errors() {
        assert!(Graph::new(vec![], vec![], 0, 0).is_err());
        assert!(Graph::new(vec![Some(0)], vec![], 0, 3).is_err());
        // Dangling arc
        assert!(Graph::new(vec![Some(0), Some(1)], vec![Arc::new(0, 5, 0.0)], 0, 1).is_err());
        // Silent interior node
        let arcs = vec![Arc::new(0, 1, 0.0), Arc::new(1, 2, 0.0)];
        assert!(Graph::new(vec![Some(0), None, Some(1)], arcs, 0, 2).is_err());
        // Arc into a silent entry
        let arcs = vec![Arc::new(0, 1, 0.0), Arc::new(1, 0, 0.0)];
        assert!(Graph::new(vec![None, Some(0)], arcs, 0, 1).is_err());
        // Silent entry straight to silent exit
        let arcs = vec![Arc::new(0, 1, 0.0), Arc::new(1, 2, 0.0), Arc::new(0, 2, 0.0)];
        assert!(Graph::new(vec![None, Some(0), None], arcs, 0, 2).is_err());
        // NaN log prob
        assert!(Graph::new(vec![Some(0), Some(1)], vec![Arc::new(0, 1, f64::NAN)], 0, 1).is_err());
    }

    #[test]
    fn single_node_graph() {
        let g = Graph::new(vec![Some(4)], vec![], 0, 0).unwrap();
        assert_eq!(g.entry_cost(0), 0.0);
        assert_eq!(g.exit_cost(0), 0.0);
        assert_eq!(g.max_gmm(), Some(4));
    }

    #[test]
    fn reestimate_transitions_normalizes_per_source() {
        let g = Graph::linear(&[0, 1], half(), half()).unwrap();
        let mut counts = TransitionCounts::new();
        counts.add(0, 3.0); // 0 -> 0
        counts.add(1, 1.0); // 0 -> 1
        let g2 = g.with_reestimated_transitions(&counts).unwrap();
        assert!((g2.arc(0).log_prob - 0.75_f64.ln()).abs() < 1e-12);
        assert!((g2.arc(1).log_prob - 0.25_f64.ln()).abs() < 1e-12);
        // Node 1 saw no counts; its self-loop keeps the old value.
        assert!((g2.arc(2).log_prob - half()).abs() < 1e-12);
    }
}
