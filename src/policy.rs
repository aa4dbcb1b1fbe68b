//! Donor/receiver selection from inter-stage queue lengths.
//!
//! `lengths[i]` is the backlog between stage `i` and stage `i + 1`. For a stage `i` in
//! `[1, lengths.len() - 1]` the delta `lengths[i] - lengths[i - 1]` compares what the stage still
//! has to hand downstream with what is waiting for it upstream. A strongly negative delta means
//! work piles up in front of the stage faster than it leaves, i.e. the stage is short of CPU time.
//!
//! Stage `0` (the source) has no upstream queue and is never selected.

use serde::{Deserialize, Serialize};

/// How the donor and the receiver of a transfer are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferPolicy {
    /// Receiver has the minimum delta (backlog growing in front of it), donor the maximum.
    #[default]
    TowardMinDelta,
    /// Receiver has the maximum delta, donor the minimum.
    TowardMaxDelta,
    /// Receiver has the minimum delta; the donor cycles through every candidate stage in turn.
    RotatingDonor,
}

/// A donor/receiver pair chosen for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub donor: usize,
    pub receiver: usize,
}

/// Stateful selector: the rotating policy remembers whose turn it is to donate.
#[derive(Debug, Clone)]
pub struct TransferSelector {
    policy: TransferPolicy,
    cursor: usize,
}

impl TransferSelector {
    pub fn new(policy: TransferPolicy) -> Self {
        Self { policy, cursor: 0 }
    }

    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }

    /// Pick the pair for this tick, or `None` when there is nothing to do.
    ///
    /// `eligible(stage)` reports whether the stage's quota is known; ineligible stages are never
    /// returned. Ties go to the lowest stage index. No pair is returned when the donor and the
    /// receiver coincide or show the same delta.
    pub fn select<F>(&mut self, lengths: &[usize], eligible: F) -> Option<Transfer>
    where
        F: Fn(usize) -> bool,
    {
        let rotating_donor = match self.policy {
            TransferPolicy::RotatingDonor => self.next_rotation(lengths.len()),
            _ => None,
        };

        let mut min: Option<(usize, i64)> = None;
        let mut max: Option<(usize, i64)> = None;
        for stage in 1..lengths.len() {
            if !eligible(stage) {
                continue;
            }
            let d = delta(lengths, stage);
            if min.map_or(true, |(_, m)| d < m) {
                min = Some((stage, d));
            }
            if max.map_or(true, |(_, m)| d > m) {
                max = Some((stage, d));
            }
        }

        let (donor, receiver) = match self.policy {
            TransferPolicy::TowardMinDelta => (max?, min?),
            TransferPolicy::TowardMaxDelta => (min?, max?),
            TransferPolicy::RotatingDonor => {
                let donor = rotating_donor.filter(|&stage| eligible(stage))?;
                ((donor, delta(lengths, donor)), min?)
            }
        };

        if donor.0 == receiver.0 || donor.1 == receiver.1 {
            return None;
        }
        Some(Transfer {
            donor: donor.0,
            receiver: receiver.0,
        })
    }

    /// Advance the donor cursor over `[1, len - 1]` and return the stage it lands on.
    fn next_rotation(&mut self, len: usize) -> Option<usize> {
        let candidates = len.checked_sub(1).filter(|&n| n > 0)?;
        let stage = 1 + self.cursor % candidates;
        self.cursor = (self.cursor + 1) % candidates;
        Some(stage)
    }
}

/// Pairwise deltas `lengths[i] - lengths[i - 1]` for `i` in `[1, len - 1]`.
pub fn deltas(lengths: &[usize]) -> Vec<i64> {
    (1..lengths.len()).map(|i| delta(lengths, i)).collect()
}

fn delta(lengths: &[usize], stage: usize) -> i64 {
    lengths[stage] as i64 - lengths[stage - 1] as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(_: usize) -> bool {
        true
    }

    #[test]
    fn deltas_of_three_queues() {
        assert_eq!(deltas(&[10, 50, 12]), vec![40, -38]);
        assert!(deltas(&[7]).is_empty());
    }

    #[test]
    fn min_delta_receives() {
        let mut selector = TransferSelector::new(TransferPolicy::TowardMinDelta);
        assert_eq!(
            selector.select(&[10, 50, 12], all),
            Some(Transfer {
                donor: 1,
                receiver: 2
            })
        );
    }

    #[test]
    fn max_delta_receives() {
        let mut selector = TransferSelector::new(TransferPolicy::TowardMaxDelta);
        assert_eq!(
            selector.select(&[10, 50, 12], all),
            Some(Transfer {
                donor: 2,
                receiver: 1
            })
        );
    }

    #[test]
    fn selection_is_reproducible() {
        let lengths = [3, 9, 1, 20, 20];
        let mut a = TransferSelector::new(TransferPolicy::TowardMinDelta);
        let mut b = TransferSelector::new(TransferPolicy::TowardMinDelta);
        for _ in 0..5 {
            assert_eq!(a.select(&lengths, all), b.select(&lengths, all));
        }
    }

    #[test]
    fn ties_resolve_to_lowest_index() {
        // deltas: [5, -5, 5, -5]
        let mut selector = TransferSelector::new(TransferPolicy::TowardMinDelta);
        assert_eq!(
            selector.select(&[0, 5, 0, 5, 0], all),
            Some(Transfer {
                donor: 1,
                receiver: 2
            })
        );
    }

    #[test]
    fn equal_lengths_never_transfer() {
        for policy in [
            TransferPolicy::TowardMinDelta,
            TransferPolicy::TowardMaxDelta,
            TransferPolicy::RotatingDonor,
        ] {
            let mut selector = TransferSelector::new(policy);
            for _ in 0..4 {
                assert_eq!(selector.select(&[4, 4, 4, 4], all), None, "{policy:?}");
            }
        }
    }

    #[test]
    fn too_few_queues_never_transfer() {
        let mut selector = TransferSelector::new(TransferPolicy::RotatingDonor);
        assert_eq!(selector.select(&[], all), None);
        assert_eq!(selector.select(&[9], all), None);
        assert_eq!(selector.select(&[9, 0], all), None);
    }

    #[test]
    fn ineligible_stages_are_skipped() {
        let mut selector = TransferSelector::new(TransferPolicy::TowardMinDelta);
        // deltas: [40, -38, 0]; stage 2 unknown leaves stage 3 as the receiver.
        assert_eq!(
            selector.select(&[10, 50, 12, 12], |stage| stage != 2),
            Some(Transfer {
                donor: 1,
                receiver: 3
            })
        );
        assert_eq!(selector.select(&[10, 50, 12], |stage| stage == 1), None);
    }

    #[test]
    fn rotating_donor_cycles() {
        let mut selector = TransferSelector::new(TransferPolicy::RotatingDonor);
        // deltas: [10, -10, 10]; the receiver is always stage 2.
        let lengths = [0, 10, 0, 10];
        let donors: Vec<Option<usize>> = (0..6)
            .map(|_| selector.select(&lengths, all).map(|t| t.donor))
            .collect();
        assert_eq!(donors, vec![Some(1), None, Some(3), Some(1), None, Some(3)]);
    }
}
