//! Per-agent, per-epoch state history.

use crate::{Epoch, Position, Velocity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State recorded for one agent at one epoch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HistorySample {
    pub position: Position,
    /// Bearing from the arc origin, in radians.
    pub bearing: f64,
    /// Velocity proposed by the coverage law.
    pub coverage: Velocity,
    /// Velocity proposed by the connectivity law, after gain and clamping.
    pub connectivity: Velocity,
    /// Composed command actually flown.
    pub command: Velocity,
    pub heading: f64,
}

/// Errors raised when writing history out of sequence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("history for epoch {epoch} written out of order (next writable epoch is {expected})")]
    OutOfOrder { epoch: u64, expected: u64 },
    #[error("history for epoch {epoch} exceeds preallocated capacity of {capacity} entries")]
    Overflow { epoch: u64, capacity: usize },
}

/// Fixed-capacity history buffer; each epoch is written exactly once and in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    samples: Vec<HistorySample>,
    written: usize,
}

impl Track {
    /// Preallocate `capacity` entries and write `seed` as epoch 0.
    #[must_use]
    pub fn seeded(capacity: usize, seed: HistorySample) -> Self {
        let mut samples = vec![HistorySample::default(); capacity.max(1)];
        samples[0] = seed;
        Self {
            samples,
            written: 1,
        }
    }

    /// Total number of entries the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of epochs written so far (including the seed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.written
    }

    /// Always false: the seed entry is written on construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Sample recorded at `epoch`, if it has been written.
    #[must_use]
    pub fn sample(&self, epoch: Epoch) -> Option<&HistorySample> {
        let index = epoch.index();
        (index < self.written).then(|| &self.samples[index])
    }

    /// Most recently written sample.
    #[must_use]
    pub fn latest(&self) -> &HistorySample {
        &self.samples[self.written - 1]
    }

    /// Written samples in epoch order.
    #[must_use]
    pub fn samples(&self) -> &[HistorySample] {
        &self.samples[..self.written]
    }

    /// Write `sample` at `epoch`, which must be the next unwritten epoch.
    pub fn record(&mut self, epoch: Epoch, sample: HistorySample) -> Result<(), HistoryError> {
        let index = epoch.index();
        if index != self.written {
            return Err(HistoryError::OutOfOrder {
                epoch: epoch.0,
                expected: self.written as u64,
            });
        }
        if index >= self.samples.len() {
            return Err(HistoryError::Overflow {
                epoch: epoch.0,
                capacity: self.samples.len(),
            });
        }
        self.samples[index] = sample;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(x: f64) -> HistorySample {
        HistorySample {
            position: Position::new(x, 0.0),
            ..HistorySample::default()
        }
    }

    #[test]
    fn seed_occupies_epoch_zero() {
        let track = Track::seeded(4, sample_at(1.0));
        assert_eq!(track.capacity(), 4);
        assert_eq!(track.len(), 1);
        assert!(!track.is_empty());
        assert_eq!(track.sample(Epoch(0)).map(|s| s.position.x), Some(1.0));
        assert!(track.sample(Epoch(1)).is_none());
    }

    #[test]
    fn records_in_order_only() {
        let mut track = Track::seeded(3, sample_at(0.0));
        track.record(Epoch(1), sample_at(1.0)).expect("epoch 1");
        assert_eq!(
            track.record(Epoch(1), sample_at(9.0)),
            Err(HistoryError::OutOfOrder {
                epoch: 1,
                expected: 2
            })
        );
        assert_eq!(
            track.record(Epoch(3), sample_at(3.0)),
            Err(HistoryError::OutOfOrder {
                epoch: 3,
                expected: 2
            })
        );
        track.record(Epoch(2), sample_at(2.0)).expect("epoch 2");
        assert_eq!(track.latest().position.x, 2.0);
        assert_eq!(
            track.record(Epoch(3), sample_at(3.0)),
            Err(HistoryError::Overflow {
                epoch: 3,
                capacity: 3
            })
        );
        let xs: Vec<f64> = track.samples().iter().map(|s| s.position.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0]);
    }
}
