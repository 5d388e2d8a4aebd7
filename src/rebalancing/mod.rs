//! Rebalance phase progression and the confirmation barrier
//!
//! A rebalance moves a cache from its current ownership to a pending one
//! through a fixed sequence of phases. Each phase is closed by a
//! `RebalanceConfirmationCollector` once every member has confirmed it.

pub mod confirmation;

pub use confirmation::RebalanceConfirmationCollector;

use serde::{Deserialize, Serialize};

use crate::topology::{CacheMode, Phase};

/// Phase sequence used by a cache, chosen once from its cache mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceType {
    /// `NoRebalance -> Transitory -> NoRebalance`
    TwoPhase,
    /// `NoRebalance -> ReadOldWriteAll -> ReadAllWriteAll -> ReadNewWriteAll -> NoRebalance`
    FourPhase,
}

impl RebalanceType {
    pub fn for_cache_mode(cache_mode: CacheMode) -> Self {
        match cache_mode {
            CacheMode::Scattered => RebalanceType::TwoPhase,
            CacheMode::Distributed | CacheMode::Replicated => RebalanceType::FourPhase,
        }
    }

    /// Phase a new rebalance starts in
    pub fn first_phase(&self) -> Phase {
        match self {
            RebalanceType::TwoPhase => Phase::Transitory,
            RebalanceType::FourPhase => Phase::ReadOldWriteAll,
        }
    }

    /// Phase following `phase` once it is confirmed, `None` when the
    /// rebalance is complete and the pending ownership becomes current
    pub fn next_phase(&self, phase: Phase) -> Option<Phase> {
        match (self, phase) {
            (RebalanceType::FourPhase, Phase::ReadOldWriteAll) => Some(Phase::ReadAllWriteAll),
            (RebalanceType::FourPhase, Phase::ReadAllWriteAll) => Some(Phase::ReadNewWriteAll),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_phase_progression() {
        let rebalance = RebalanceType::for_cache_mode(CacheMode::Distributed);
        let mut phase = rebalance.first_phase();
        let mut visited = vec![phase];
        while let Some(next) = rebalance.next_phase(phase) {
            visited.push(next);
            phase = next;
        }
        assert_eq!(
            visited,
            vec![
                Phase::ReadOldWriteAll,
                Phase::ReadAllWriteAll,
                Phase::ReadNewWriteAll
            ]
        );
    }

    #[test]
    fn test_two_phase_for_scattered() {
        let rebalance = RebalanceType::for_cache_mode(CacheMode::Scattered);
        assert_eq!(rebalance.first_phase(), Phase::Transitory);
        assert_eq!(rebalance.next_phase(Phase::Transitory), None);
    }
}
