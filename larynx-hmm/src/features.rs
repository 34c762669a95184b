//! Per-utterance feature vectors.

use larynx_core::{LarynxError, Result};

/// Time-major sequence of fixed-dimension feature vectors, stored flat
/// row-major: frame `f` occupies `data[f * dim..(f + 1) * dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    n_frames: usize,
    dim: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Wrap flat row-major frame data.
    ///
    /// # Errors
    ///
    /// Returns an error if `dim` is zero, `data.len()` is not a multiple of
    /// `dim`, or any value is not finite.
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self> {
        if dim == 0 {
            return Err(LarynxError::InvalidInput("feature dim must be > 0".into()));
        }
        if data.len() % dim != 0 {
            return Err(LarynxError::DimensionMismatch(format!(
                "feature data length {} is not a multiple of dim {dim}",
                data.len()
            )));
        }
        if let Some(i) = data.iter().position(|x| !x.is_finite()) {
            return Err(LarynxError::InvalidInput(format!(
                "feature value at frame {} dim {} is not finite",
                i / dim,
                i % dim
            )));
        }
        Ok(Self {
            n_frames: data.len() / dim,
            dim,
            data,
        })
    }

    /// Build from one vector per frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty or rows differ in length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows
            .first()
            .map(|r| r.len())
            .ok_or_else(|| LarynxError::InvalidInput("no feature frames".into()))?;
        let mut data = Vec::with_capacity(rows.len() * dim);
        for (f, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(LarynxError::DimensionMismatch(format!(
                    "frame {f} has dim {}, expected {dim}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(dim, data)
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.n_frames == 0
    }

    /// Feature vector of frame `f`.
    pub fn frame(&self, f: usize) -> &[f64] {
        &self.data[f * self.dim..(f + 1) * self.dim]
    }

    pub fn frames(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_time_major() {
        let m = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(m.n_frames(), 3);
        assert_eq!(m.dim(), 2);
        assert_eq!(m.frame(1), &[3.0, 4.0]);
        assert_eq!(m.frames().count(), 3);
    }

    #[test]
    fn rejects_ragged_and_non_finite() {
        assert!(FeatureMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(FeatureMatrix::from_rows(&[]).is_err());
        assert!(FeatureMatrix::new(2, vec![1.0, 2.0, 3.0]).is_err());
        assert!(FeatureMatrix::new(0, vec![]).is_err());
        assert!(FeatureMatrix::new(1, vec![f64::NAN]).is_err());
    }

    #[test]
    fn empty_matrix_is_allowed() {
        let m = FeatureMatrix::new(3, vec![]).unwrap();
        assert!(m.is_empty());
    }
}
