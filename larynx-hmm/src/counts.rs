//! Expected transition counts pooled over a training iteration.

use std::collections::BTreeMap;
use std::io::Write;

use larynx_core::{LarynxError, Result};

/// Soft traversal count per transition id.
///
/// Lifecycle within an iteration: [`reset`](Self::reset), any number of
/// [`add`](Self::add) calls, then [`take`](Self::take) to read and consume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionCounts {
    counts: BTreeMap<usize, f64>,
}

impl TransitionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn add(&mut self, id: usize, weight: f64) {
        *self.counts.entry(id).or_insert(0.0) += weight;
    }

    /// Accumulated count of `id` (0.0 if never traversed).
    pub fn get(&self, id: usize) -> f64 {
        self.counts.get(&id).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.counts.values().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `(id, count)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.counts.iter().map(|(&id, &c)| (id, c))
    }

    pub fn merge(&mut self, other: &TransitionCounts) {
        for (id, c) in other.iter() {
            self.add(id, c);
        }
    }

    /// Return the accumulated counts and leave `self` empty.
    pub fn take(&mut self) -> TransitionCounts {
        std::mem::take(self)
    }

    /// Write one `id count` line per transition, ascending by id.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for (id, c) in self.iter() {
            writeln!(writer, "{id} {c}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Parse the format produced by [`write_to`](Self::write_to).
    pub fn parse(text: &str) -> Result<Self> {
        let mut counts = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(count), None) = (fields.next(), fields.next(), fields.next()) else {
                return Err(LarynxError::Parse(format!(
                    "transition counts line {}: expected `id count`",
                    lineno + 1
                )));
            };
            let id: usize = id.parse().map_err(|e| {
                LarynxError::Parse(format!("transition counts line {}: {e}", lineno + 1))
            })?;
            let count: f64 = count.parse().map_err(|e| {
                LarynxError::Parse(format!("transition counts line {}: {e}", lineno + 1))
            })?;
            counts.add(id, count);
        }
        Ok(counts)
    }
}
