//! Dynamic-programming chart for the Forward-Backward algorithm.

use larynx_core::LOG_ZERO;

/// One chart cell: forward and backward log probabilities of a
/// `(frame, state)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FbCell {
    pub forw_log_prob: f64,
    pub back_log_prob: f64,
}

impl Default for FbCell {
    fn default() -> Self {
        Self {
            forw_log_prob: LOG_ZERO,
            back_log_prob: LOG_ZERO,
        }
    }
}

/// `n_frames x n_states` grid of [`FbCell`]s, flat row-major:
/// `index = frame * n_states + state`.
#[derive(Debug, Clone, Default)]
pub struct FbChart {
    n_frames: usize,
    n_states: usize,
    cells: Vec<FbCell>,
}

impl FbChart {
    /// Chart with every cell at zero probability.
    pub fn new(n_frames: usize, n_states: usize) -> Self {
        Self {
            n_frames,
            n_states,
            cells: vec![FbCell::default(); n_frames * n_states],
        }
    }

    /// Resize to `n_frames x n_states` and set every cell back to zero
    /// probability. The allocation is reused when large enough.
    pub fn reset(&mut self, n_frames: usize, n_states: usize) {
        self.n_frames = n_frames;
        self.n_states = n_states;
        self.cells.clear();
        self.cells.resize(n_frames * n_states, FbCell::default());
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    #[inline]
    pub fn cell(&self, frame: usize, state: usize) -> &FbCell {
        debug_assert!(frame < self.n_frames && state < self.n_states);
        &self.cells[frame * self.n_states + state]
    }

    #[inline]
    pub fn cell_mut(&mut self, frame: usize, state: usize) -> &mut FbCell {
        debug_assert!(frame < self.n_frames && state < self.n_states);
        &mut self.cells[frame * self.n_states + state]
    }

    #[inline]
    pub fn forw(&self, frame: usize, state: usize) -> f64 {
        self.cell(frame, state).forw_log_prob
    }

    #[inline]
    pub fn back(&self, frame: usize, state: usize) -> f64 {
        self.cell(frame, state).back_log_prob
    }

    /// All cells of `frame`.
    pub fn row(&self, frame: usize) -> &[FbCell] {
        &self.cells[frame * self.n_states..(frame + 1) * self.n_states]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chart_is_all_zero_probability() {
        let chart = FbChart::new(3, 4);
        assert_eq!(chart.n_frames(), 3);
        assert_eq!(chart.n_states(), 4);
        for f in 0..3 {
            assert!(chart.row(f).iter().all(|c| *c == FbCell::default()));
        }
    }

    #[test]
    fn reset_clears_stale_cells() {
        let mut chart = FbChart::new(4, 2);
        chart.cell_mut(3, 1).forw_log_prob = -1.5;
        chart.cell_mut(0, 0).back_log_prob = -2.5;

        chart.reset(2, 3);
        assert_eq!(chart.n_frames(), 2);
        assert_eq!(chart.n_states(), 3);
        for f in 0..2 {
            for s in 0..3 {
                assert_eq!(chart.forw(f, s), LOG_ZERO);
                assert_eq!(chart.back(f, s), LOG_ZERO);
            }
        }
    }

    #[test]
    fn cells_are_row_major() {
        let mut chart = FbChart::new(2, 3);
        chart.cell_mut(1, 2).forw_log_prob = -7.0;
        assert_eq!(chart.row(1)[2].forw_log_prob, -7.0);
        assert_eq!(chart.row(0)[2].forw_log_prob, LOG_ZERO);
    }
}
