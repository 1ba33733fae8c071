//! The process-wide `my_qid` allocator (C3).
//!
//! One instance lives on the `Daemon`, not behind a global singleton
//! (§9: "no hidden singletons"). IDs are drawn uniformly from the
//! available set so a long-lived daemon does not bias toward low IDs.

use derive_more::{Display, Error};
use rand::Rng;
use std::collections::HashSet;

use crate::dns::framing::Qid;

#[derive(Debug, Display, Error)]
#[display(fmt = "QID pool exhausted")]
pub struct QidPoolExhausted;

type Result<T> = std::result::Result<T, QidPoolExhausted>;

/// A pool of the 65535 usable 16-bit IDs (0 is reserved and never
/// issued). `available` holds the values not currently assigned to a
/// live query record; `in_use` is tracked implicitly by their absence.
pub struct QidPool {
    available: Vec<u16>,
}

impl Default for QidPool {
    fn default() -> Self {
        Self::new()
    }
}

impl QidPool {
    pub fn new() -> QidPool {
        QidPool {
            available: (1u32..=65535).map(|v| v as u16).collect(),
        }
    }

    /// Number of IDs still available for issue.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Issue an unused ID, removing it from the available set.
    ///
    /// O(1) amortized: a random index is swap-removed rather than the
    /// pool being scanned linearly.
    pub fn get(&mut self) -> Result<Qid> {
        if self.available.is_empty() {
            return Err(QidPoolExhausted);
        }
        let idx = rand::thread_rng().gen_range(0..self.available.len());
        Ok(Qid(self.available.swap_remove(idx)))
    }

    /// Return an ID to the available set. Debug-asserts against
    /// double-release, which would indicate a query-table bug.
    pub fn release(&mut self, qid: Qid) {
        debug_assert!(
            !self.available.contains(&qid.0),
            "releasing a QID that was never issued"
        );
        self.available.push(qid.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_are_unique_until_released() {
        let mut pool = QidPool::new();
        let mut seen: HashSet<u16> = HashSet::new();
        for _ in 0..1000 {
            let qid = pool.get().unwrap();
            assert!(seen.insert(qid.0), "duplicate QID issued");
        }
        assert_eq!(pool.available_count(), 65535 - 1000);
    }

    #[test]
    fn released_ids_become_available_again() {
        let mut pool = QidPool::new();
        let qid = pool.get().unwrap();
        let before = pool.available_count();
        pool.release(qid);
        assert_eq!(pool.available_count(), before + 1);
        // and can be reissued eventually
        let mut reissued = false;
        for _ in 0..65535 {
            let got = pool.get().unwrap();
            if got.0 == qid.0 {
                reissued = true;
            }
            pool.release(got);
        }
        assert!(reissued);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = QidPool::new();
        let mut issued = Vec::new();
        loop {
            match pool.get() {
                Ok(qid) => issued.push(qid),
                Err(QidPoolExhausted) => break,
            }
        }
        assert_eq!(issued.len(), 65535);
        assert!(pool.get().is_err());
    }
}
