//! The round-by-round fit and prune loop over chain combinations
use std::collections::{HashMap, HashSet};
use std::mem;

use identity_hash::BuildIdentityHasher;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::chain::{AggregatedChain, ChainId};
use crate::combination::{ChainCombination, ChainCombinationIndex};
use crate::fit::{validate_parameters, LinearCombinationFitter, ParameterType};
use crate::resolve_traits::{DebugSink, ResolutionError, ViolationReason, ViolationRecord};

/// The surviving chain combinations and the chains they use.
///
/// Combinations are kept sorted by identifier (the design matrix column order) and chains by
/// chain identity (the row order). Every chain is used by at least one combination and every
/// combination's chains are all present, see [`WorkingState::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingState {
    combinations: Vec<ChainCombination>,
    chains: Vec<AggregatedChain>,
}

impl WorkingState {
    pub fn new(mut combinations: Vec<ChainCombination>, mut chains: Vec<AggregatedChain>) -> Self {
        combinations.sort_by(|a, b| a.id.cmp(&b.id));
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            combinations,
            chains,
        }
    }

    pub fn combinations(&self) -> &[ChainCombination] {
        &self.combinations
    }

    pub fn chains(&self) -> &[AggregatedChain] {
        &self.chains
    }

    pub fn len(&self) -> usize {
        self.combinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    pub fn into_parts(self) -> (Vec<ChainCombination>, Vec<AggregatedChain>) {
        (self.combinations, self.chains)
    }

    fn row_index(&self) -> HashMap<&ChainId, usize> {
        self.chains
            .iter()
            .enumerate()
            .map(|(i, c)| (&c.id, i))
            .collect()
    }

    /// Check that the chain set and combination set agree with each other
    pub fn validate(&self) -> Result<(), ResolutionError> {
        let rows = self.row_index();
        for combination in self.combinations.iter() {
            if let Some(chain) = combination.chains.iter().find(|c| !rows.contains_key(c)) {
                return Err(ResolutionError::InconsistentWorkingState(format!(
                    "combination {} uses chain {chain} which is not in the working state",
                    combination.id
                )));
            }
        }
        for chain in self.chains.iter() {
            if !self.combinations.iter().any(|c| c.contains(&chain.id)) {
                return Err(ResolutionError::InconsistentWorkingState(format!(
                    "chain {} is not used by any combination",
                    chain.id
                )));
            }
        }
        Ok(())
    }

    /// The chains × combinations matrix of chain multiplicities
    pub fn design_matrix(&self) -> DMatrix<ParameterType> {
        let rows = self.row_index();
        let mut design = DMatrix::zeros(self.chains.len(), self.combinations.len());
        for (j, combination) in self.combinations.iter().enumerate() {
            for chain in combination.chains.iter() {
                if let Some(i) = rows.get(chain) {
                    design[(*i, j)] += 1.0;
                }
            }
        }
        design
    }

    /// The aggregated intensity of each chain, in row order
    pub fn observations(&self) -> DVector<ParameterType> {
        DVector::from_iterator(self.chains.len(), self.chains.iter().map(|c| c.intensity))
    }

    /// Remove the combinations at the given column positions, then drop any chain that
    /// no longer belongs to a surviving combination. Returns the removed combinations.
    pub fn remove_columns(&mut self, columns: &[usize]) -> Vec<ChainCombination> {
        let columns: HashSet<usize, BuildIdentityHasher<usize>> = columns.iter().copied().collect();
        let (removed, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.combinations)
            .into_iter()
            .enumerate()
            .partition(|(j, _)| columns.contains(j));
        self.combinations = kept.into_iter().map(|(_, c)| c).collect();
        self.shrink_chains();
        removed.into_iter().map(|(_, c)| c).collect()
    }

    /// Drop every chain not used by a surviving combination, returning how many were dropped
    pub fn shrink_chains(&mut self) -> usize {
        let before = self.chains.len();
        let combinations = &self.combinations;
        self.chains
            .retain(|chain| combinations.iter().any(|c| c.contains(&chain.id)));
        before - self.chains.len()
    }
}

/// What happened in a single round of fitting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoundSummary {
    pub round: usize,
    /// The number of combinations fitted in this round
    pub combinations: usize,
    /// The number of chains fitted in this round
    pub chains: usize,
    pub violations: usize,
    pub removed: usize,
}

/// The final, stable state of a pruning run
#[derive(Debug, Clone)]
pub struct PrunedFit {
    pub state: WorkingState,
    /// The fitted parameter of each surviving combination, in column order
    pub parameters: DVector<ParameterType>,
    pub rounds: Vec<RoundSummary>,
}

/// Repeatedly fit the working state and remove the weakest half of the combinations
/// that fall below `relative_chain_cutoff` times the round's strongest parameter, until
/// a round flags nothing.
///
/// Only half of the violators are removed per round because removing one combination
/// changes the fit of the others.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeCutoffPruner {
    pub relative_chain_cutoff: ParameterType,
    pub max_rounds: Option<usize>,
}

impl IterativeCutoffPruner {
    pub fn new(relative_chain_cutoff: ParameterType, max_rounds: Option<usize>) -> Self {
        Self {
            relative_chain_cutoff,
            max_rounds,
        }
    }

    /// The threshold for this set of parameters, and the columns below it in column order
    pub fn flag_violations(&self, parameters: &DVector<ParameterType>) -> (ParameterType, Vec<usize>) {
        let highest = parameters
            .iter()
            .copied()
            .fold(ParameterType::NEG_INFINITY, ParameterType::max);
        let threshold = self.relative_chain_cutoff * highest;
        let violations = parameters
            .iter()
            .enumerate()
            .filter_map(|(j, x)| (*x < threshold).then_some(j))
            .collect();
        (threshold, violations)
    }

    /// The lowest-valued `ceil(n / 2)` of `violations`, ties going to the earlier column
    pub fn select_for_removal(
        parameters: &DVector<ParameterType>,
        violations: &[usize],
    ) -> Vec<usize> {
        let mut ranked = violations.to_vec();
        ranked.sort_by(|a, b| parameters[*a].total_cmp(&parameters[*b]));
        ranked.truncate(violations.len().div_ceil(2));
        ranked
    }

    pub fn run<F: LinearCombinationFitter + ?Sized>(
        &self,
        mut state: WorkingState,
        fitter: &F,
        index: &ChainCombinationIndex,
        mut sink: Option<&mut dyn DebugSink>,
    ) -> Result<PrunedFit, ResolutionError> {
        let mut rounds: Vec<RoundSummary> = Vec::new();
        loop {
            let round = rounds.len() + 1;
            if state.is_empty() {
                debug!("All combinations were removed before round {round}");
                return Err(ResolutionError::EmptyWorkingSet);
            }
            if let Some(limit) = self.max_rounds {
                if round > limit {
                    return Err(ResolutionError::RoundLimitExceeded(limit));
                }
            }
            state.validate()?;

            let design = state.design_matrix();
            let observed = state.observations();
            let parameters = fitter.fit(&design, &observed)?;
            validate_parameters(&parameters, state.len())?;

            let (threshold, violations) = self.flag_violations(&parameters);
            for j in violations.iter().copied() {
                let combination = &state.combinations()[j];
                trace!(
                    "Round {round}: {} fitted {:0.3} below threshold {threshold:0.3}",
                    combination.id,
                    parameters[j]
                );
                if let Some(sink) = sink.as_deref_mut() {
                    sink.record(ViolationRecord::new(
                        combination.id.clone(),
                        index.canonical_key(&combination.id).cloned(),
                        ViolationReason::BelowRelativeChainCutoff,
                        round,
                        Some(parameters[j]),
                        Some(threshold),
                    ));
                }
            }

            let removal = Self::select_for_removal(&parameters, &violations);
            let summary = RoundSummary {
                round,
                combinations: state.len(),
                chains: state.chains().len(),
                violations: violations.len(),
                removed: removal.len(),
            };
            debug!(
                "Round {round}: {} combinations over {} chains, {} below cutoff, removing {}",
                summary.combinations, summary.chains, summary.violations, summary.removed
            );
            rounds.push(summary);

            if violations.is_empty() {
                return Ok(PrunedFit {
                    state,
                    parameters,
                    rounds,
                });
            }
            state.remove_columns(&removal);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::fit::FitError;

    use super::*;

    /// Hands out pre-computed parameter vectors, one per round
    struct ScriptedFitter {
        responses: RefCell<VecDeque<Vec<f64>>>,
        shapes: RefCell<Vec<(usize, usize)>>,
    }

    impl ScriptedFitter {
        fn new(responses: Vec<Vec<f64>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                shapes: RefCell::new(Vec::new()),
            }
        }
    }

    impl LinearCombinationFitter for ScriptedFitter {
        fn fit(
            &self,
            design: &DMatrix<ParameterType>,
            _observed: &DVector<ParameterType>,
        ) -> Result<DVector<ParameterType>, FitError> {
            self.shapes.borrow_mut().push(design.shape());
            match self.responses.borrow_mut().pop_front() {
                Some(x) => Ok(DVector::from_vec(x)),
                None => Err(FitError::NotConverged { iterations: 0 }),
            }
        }
    }

    fn chain(id: &str, intensity: f64) -> AggregatedChain {
        AggregatedChain::new(ChainId::from(id), intensity, 1)
    }

    fn combination(id: &str, chains: &[&str]) -> ChainCombination {
        ChainCombination::new(id, chains.iter().copied().map(ChainId::from).collect())
    }

    fn five_combinations() -> WorkingState {
        WorkingState::new(
            vec![
                combination("c0", &["16:0", "18:1"]),
                combination("c1", &["16:0", "18:2"]),
                combination("c2", &["18:0", "18:1"]),
                combination("c3", &["18:1", "18:1"]),
                combination("c4", &["14:0", "20:4"]),
            ],
            vec![
                chain("14:0", 10.0),
                chain("16:0", 100.0),
                chain("18:0", 20.0),
                chain("18:1", 500.0),
                chain("18:2", 30.0),
                chain("20:4", 10.0),
            ],
        )
    }

    #[test]
    fn test_design_matrix() {
        let state = five_combinations();
        state.validate().unwrap();
        let design = state.design_matrix();
        assert_eq!(design.shape(), (6, 5));
        // 18:1 is the fourth row, c3 holds it twice
        assert_eq!(design[(3, 3)], 2.0);
        assert_eq!(design[(3, 0)], 1.0);
        assert_eq!(design[(0, 4)], 1.0);
        assert_eq!(design.column(4).sum(), 2.0);
        let observed = state.observations();
        assert_eq!(observed[3], 500.0);
    }

    #[test]
    fn test_half_removal() {
        let pruner = IterativeCutoffPruner::new(0.1, None);
        let parameters = DVector::from_vec(vec![10.0, 2.0, 3.0, 50.0, 1.0]);
        let (threshold, violations) = pruner.flag_violations(&parameters);
        assert!((threshold - 5.0).abs() < 1e-12);
        assert_eq!(violations, vec![1, 2, 4]);
        let removal = IterativeCutoffPruner::select_for_removal(&parameters, &violations);
        assert_eq!(removal, vec![4, 1]);

        let mut state = five_combinations();
        let removed = state.remove_columns(&removal);
        let removed: Vec<_> = removed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(removed, vec!["c1", "c4"]);
        let kept: Vec<_> = state.combinations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(kept, vec!["c0", "c2", "c3"]);
        // 14:0, 18:2 and 20:4 were only used by removed combinations
        let chains: Vec<_> = state.chains().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(chains, vec!["16:0", "18:0", "18:1"]);
        state.validate().unwrap();
    }

    #[test]
    fn test_ties_removed_in_column_order() {
        let parameters = DVector::from_vec(vec![100.0, 1.0, 1.0, 1.0]);
        let removal = IterativeCutoffPruner::select_for_removal(&parameters, &[1, 2, 3]);
        assert_eq!(removal, vec![1, 2]);
    }

    #[test_log::test]
    fn test_run_converges() {
        let pruner = IterativeCutoffPruner::new(0.1, None);
        let state = five_combinations();
        let index = ChainCombinationIndex::from_combinations(state.combinations()).unwrap();
        let fitter = ScriptedFitter::new(vec![
            vec![10.0, 2.0, 3.0, 50.0, 1.0],
            vec![12.0, 3.0, 55.0],
            vec![12.0, 55.0],
        ]);
        let mut trace: Vec<ViolationRecord> = Vec::new();
        let fit = pruner
            .run(state, &fitter, &index, Some(&mut trace))
            .unwrap();

        assert_eq!(fit.rounds.len(), 3);
        assert_eq!(
            fit.rounds[0],
            RoundSummary {
                round: 1,
                combinations: 5,
                chains: 6,
                violations: 3,
                removed: 2
            }
        );
        for pair in fit.rounds.windows(2) {
            assert!(pair[1].combinations < pair[0].combinations);
            assert!(pair[1].chains <= pair[0].chains);
        }
        assert_eq!(
            *fitter.shapes.borrow(),
            vec![(6, 5), (3, 3), (2, 2)]
        );
        let kept: Vec<_> = fit.state.combinations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(kept, vec!["c0", "c3"]);

        // c2 is flagged in both of the first two rounds before it goes
        let flagged: Vec<_> = trace
            .iter()
            .map(|r| (r.round, r.combination.as_str()))
            .collect();
        assert_eq!(
            flagged,
            vec![(1, "c1"), (1, "c2"), (1, "c4"), (2, "c2")]
        );
        assert!(trace
            .iter()
            .all(|r| r.reason == ViolationReason::BelowRelativeChainCutoff));
        assert_eq!(
            trace[0].canonical_key.as_ref().map(|k| k.as_str()),
            Some("16:0_18:2")
        );
    }

    #[test]
    fn test_run_empties() {
        let pruner = IterativeCutoffPruner::new(0.5, None);
        let state = WorkingState::new(
            vec![combination("c0", &["16:0"])],
            vec![chain("16:0", 10.0)],
        );
        let index = ChainCombinationIndex::from_combinations(state.combinations()).unwrap();
        // A negative sole parameter is below half of itself
        let fitter = ScriptedFitter::new(vec![vec![-4.0]]);
        let err = pruner.run(state, &fitter, &index, None).unwrap_err();
        assert_eq!(err, ResolutionError::EmptyWorkingSet);
    }

    #[test]
    fn test_run_fit_failure_propagates() {
        let pruner = IterativeCutoffPruner::new(0.5, None);
        let state = five_combinations();
        let index = ChainCombinationIndex::from_combinations(state.combinations()).unwrap();
        let fitter = ScriptedFitter::new(vec![]);
        let err = pruner.run(state, &fitter, &index, None).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::Fit(FitError::NotConverged { iterations: 0 })
        );

        let fitter = ScriptedFitter::new(vec![vec![1.0, 2.0]]);
        let err = pruner
            .run(five_combinations(), &fitter, &index, None)
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Fit(FitError::WrongParameterCount { .. })
        ));
    }

    #[test]
    fn test_round_limit() {
        let pruner = IterativeCutoffPruner::new(0.1, Some(1));
        let state = five_combinations();
        let index = ChainCombinationIndex::from_combinations(state.combinations()).unwrap();
        let fitter = ScriptedFitter::new(vec![vec![10.0, 2.0, 3.0, 50.0, 1.0]]);
        let err = pruner.run(state, &fitter, &index, None).unwrap_err();
        assert_eq!(err, ResolutionError::RoundLimitExceeded(1));
    }

    #[test]
    fn test_inconsistent_state_detected() {
        let state = WorkingState::new(
            vec![combination("c0", &["16:0", "18:1"])],
            vec![chain("16:0", 10.0), chain("20:4", 3.0)],
        );
        assert!(matches!(
            state.validate(),
            Err(ResolutionError::InconsistentWorkingState(_))
        ));
    }
}
