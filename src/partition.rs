//! Shot-id sequencing and worker sharding.
//!
//! The logical shot sequence of a run is
//! `offset, offset + increment, offset + 2·increment, …` (length `count`).
//! It never depends on the number of workers; only the assignment of
//! logical indices to workers does.
//!
//! Sharding is round-robin: logical index `i` belongs to worker `i mod n`
//! as that worker's `(i div n)`-th shot. A worker's share is therefore
//! itself an arithmetic sequence and can be described by a [`ShotRange`],
//! which is exactly what the worker invocation takes.
//!
//! ```text
//!   logical:   0   1   2   3   4   5   6
//!   n = 3:     w0  w1  w2  w0  w1  w2  w0
//! ```
//!
//! Merging back in ascending logical order therefore means reading one
//! shot at a time from worker `i mod n`, never from whichever finished first.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// An arithmetic sequence of absolute shot ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShotRange {
    /// Id of the first shot.
    pub offset: u64,
    /// Step between consecutive shot ids.
    pub increment: u64,
    /// Number of shots.
    pub count: u64,
}

impl ShotRange {
    pub fn new(offset: u64, increment: u64, count: u64) -> Self {
        Self {
            offset,
            increment,
            count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Absolute id of the shot at `index` (no bounds check).
    pub fn shot_id(&self, index: u64) -> u64 {
        self.offset.wrapping_add(self.increment.wrapping_mul(index))
    }

    /// Iterate absolute shot ids in order.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count).map(|index| self.shot_id(index))
    }

    /// Fails if the last shot id does not fit in a `u64`.
    pub fn check(&self) -> EngineResult<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.increment
            .checked_mul(self.count - 1)
            .and_then(|span| self.offset.checked_add(span))
            .map(|_| ())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "shot ids overflow: offset {} + increment {} x {} shots",
                    self.offset, self.increment, self.count
                ))
            })
    }
}

/// The share of a run assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Worker slot, `0..n_processes`.
    pub worker: usize,
    /// Absolute shot ids this worker runs, in order.
    pub range: ShotRange,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split `range` into `n_processes` round-robin partitions.
///
/// Always returns `n_processes` partitions; excess workers get empty ones.
pub fn partition(range: &ShotRange, n_processes: usize) -> EngineResult<Vec<Partition>> {
    if n_processes == 0 {
        return Err(EngineError::Configuration(
            "n_processes must be at least 1".into(),
        ));
    }
    range.check()?;

    let n = n_processes as u64;
    let stride = range.increment.checked_mul(n).ok_or_else(|| {
        EngineError::Configuration(format!(
            "shot increment {} x {} processes overflows",
            range.increment, n
        ))
    })?;

    Ok((0..n_processes)
        .map(|worker| {
            let w = worker as u64;
            let count = if w < range.count {
                (range.count - w).div_ceil(n)
            } else {
                0
            };
            let offset = if count > 0 { range.shot_id(w) } else { range.offset };
            Partition {
                worker,
                range: ShotRange::new(offset, stride, count),
            }
        })
        .collect())
}

/// Worker slot and local position of logical index `index`.
pub fn owner_of(index: u64, n_processes: usize) -> (usize, u64) {
    let n = n_processes.max(1) as u64;
    ((index % n) as usize, index / n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_arithmetic() {
        let range = ShotRange::new(5, 10, 4);
        assert_eq!(range.ids().collect::<Vec<_>>(), vec![5, 15, 25, 35]);
    }

    #[test]
    fn test_partitions_cover_sequence_in_merge_order() {
        let range = ShotRange::new(5, 10, 11);
        for n in 1..=13 {
            let parts = partition(&range, n).unwrap();
            assert_eq!(parts.len(), n);

            let merged: Vec<u64> = (0..range.count)
                .map(|index| {
                    let (worker, local) = owner_of(index, n);
                    assert!(local < parts[worker].range.count);
                    parts[worker].range.shot_id(local)
                })
                .collect();
            assert_eq!(merged, range.ids().collect::<Vec<_>>(), "n = {n}");

            let total: u64 = parts.iter().map(|p| p.range.count).sum();
            assert_eq!(total, range.count);
        }
    }

    #[test]
    fn test_excess_processes_get_empty_partitions() {
        let parts = partition(&ShotRange::new(0, 1, 2), 5).unwrap();
        assert_eq!(
            parts.iter().map(|p| p.range.count).collect::<Vec<_>>(),
            vec![1, 1, 0, 0, 0]
        );
        assert!(parts[4].is_empty());
    }

    #[test]
    fn test_zero_shots() {
        let parts = partition(&ShotRange::new(0, 1, 0), 3).unwrap();
        assert!(parts.iter().all(Partition::is_empty));
    }

    #[test]
    fn test_zero_processes_rejected() {
        assert!(matches!(
            partition(&ShotRange::new(0, 1, 1), 0),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_overflow_rejected() {
        let range = ShotRange::new(u64::MAX - 1, 1, 3);
        assert!(range.check().is_err());
        assert!(partition(&range, 1).is_err());
        assert!(ShotRange::new(u64::MAX, 1, 1).check().is_ok());
    }
}
