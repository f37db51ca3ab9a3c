//! * High level APIs for resolving chain combinations
use std::collections::{BTreeMap, HashSet};

use mzpeaks::IntensityMeasurement;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    chain::{AggregatedChain, ChainId},
    combination::{CanonicalKey, ChainCombination, ChainCombinationIndex, CombinationId},
    evidence::{aggregate_fragment_evidence, FragmentEvidence},
    fit::{LinearCombinationFitter, NonNegativeLeastSquares, ParameterType},
    normalize::normalize_parameters,
    pruner::{IterativeCutoffPruner, RoundSummary, WorkingState},
    resolve_traits::{DebugSink, ResolutionError, ViolationReason, ViolationRecord},
};

pub const DEFAULT_RELATIVE_CHAIN_CUTOFF: ParameterType = 0.2;

/// Parameters controlling a [`ChainResolver`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResolverParams {
    /// The fraction of a round's strongest combination below which a combination is pruned,
    /// in (0, 1]
    pub relative_chain_cutoff: ParameterType,
    /// Whether to report every flagged combination to a [`DebugSink`]
    pub debug: bool,
    /// An optional cap on the number of fitting rounds
    pub max_rounds: Option<usize>,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            relative_chain_cutoff: DEFAULT_RELATIVE_CHAIN_CUTOFF,
            debug: false,
            max_rounds: None,
        }
    }
}

impl ResolverParams {
    pub fn new(relative_chain_cutoff: ParameterType, debug: bool, max_rounds: Option<usize>) -> Self {
        Self {
            relative_chain_cutoff,
            debug,
            max_rounds,
        }
    }

    pub fn validate(&self) -> Result<(), ResolutionError> {
        let cutoff = self.relative_chain_cutoff;
        if cutoff.is_finite() && cutoff > 0.0 && cutoff <= 1.0 {
            Ok(())
        } else {
            Err(ResolutionError::InvalidCutoff(cutoff))
        }
    }
}

/// The relative contribution of each surviving chain combination to the combined signal
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainResolution {
    /// The share of each surviving combination, summing to 1
    pub intensities: BTreeMap<CombinationId, ParameterType>,
    /// The chains that still belong to a surviving combination
    pub surviving_chains: BTreeMap<ChainId, AggregatedChain>,
    /// The canonical key of each surviving combination
    pub canonical_keys: BTreeMap<CombinationId, CanonicalKey>,
    /// One summary per fitting round, in order
    pub rounds: Vec<RoundSummary>,
}

impl ChainResolution {
    pub fn relative_intensity(&self, id: &CombinationId) -> Option<ParameterType> {
        self.intensities.get(id).copied()
    }

    pub fn total(&self) -> ParameterType {
        self.intensities.values().sum()
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

/// One independent resolution problem, such as all of the chain combinations proposed
/// for a single lipid species
#[derive(Debug, Clone)]
pub struct ResolutionGroup<P: IntensityMeasurement> {
    pub name: String,
    pub combinations: Vec<ChainCombination>,
    pub evidence: FragmentEvidence<P>,
}

impl<P: IntensityMeasurement> ResolutionGroup<P> {
    pub fn new(
        name: impl Into<String>,
        combinations: Vec<ChainCombination>,
        evidence: FragmentEvidence<P>,
    ) -> Self {
        Self {
            name: name.into(),
            combinations,
            evidence,
        }
    }
}

/// The outcome of resolving one [`ResolutionGroup`]
#[derive(Debug, Clone)]
pub struct GroupResolution {
    pub name: String,
    pub resolution: Result<ChainResolution, ResolutionError>,
    /// The violations flagged while resolving, empty unless debug capture was enabled
    pub trace: Vec<ViolationRecord>,
}

/// A single-shot resolution without debug capture.
///
/// Internally, this creates a [`ChainResolver`] and calls [`ChainResolver::resolve`].
pub fn resolve_chain_combinations<P: IntensityMeasurement, F: LinearCombinationFitter>(
    combinations: &[ChainCombination],
    evidence: &FragmentEvidence<P>,
    fitter: F,
    relative_chain_cutoff: ParameterType,
) -> Result<ChainResolution, ResolutionError> {
    let resolver = ChainResolver::new(
        ResolverParams::new(relative_chain_cutoff, false, None),
        fitter,
    );
    resolver.resolve(combinations, evidence, None)
}

/// Splits a combined signal among candidate chain combinations using a
/// [`LinearCombinationFitter`] and an [`IterativeCutoffPruner`].
///
/// Each call to [`ChainResolver::resolve`] is independent and keeps no state in the
/// resolver, so one instance may serve many threads.
#[derive(Debug, Clone, Default)]
pub struct ChainResolver<F: LinearCombinationFitter = NonNegativeLeastSquares> {
    pub params: ResolverParams,
    pub fitter: F,
}

impl<F: LinearCombinationFitter> ChainResolver<F> {
    pub fn new(params: ResolverParams, fitter: F) -> Self {
        Self { params, fitter }
    }

    fn pruner(&self) -> IterativeCutoffPruner {
        IterativeCutoffPruner::new(self.params.relative_chain_cutoff, self.params.max_rounds)
    }

    /// Drop combinations that use a chain without evidence, then drop chains that no
    /// remaining combination uses.
    fn initial_state(
        combinations: &[ChainCombination],
        chains: Vec<AggregatedChain>,
        index: &ChainCombinationIndex,
        sink: &mut Option<&mut dyn DebugSink>,
    ) -> WorkingState {
        let mut candidates = Vec::with_capacity(combinations.len());
        {
            let available: HashSet<&ChainId> = chains.iter().map(|c| &c.id).collect();
            for combination in combinations {
                match combination.chains.iter().find(|c| !available.contains(c)) {
                    Some(missing) => {
                        debug!(
                            "{} uses chain {missing} which has no fragment evidence",
                            combination.id
                        );
                        if let Some(sink) = sink.as_deref_mut() {
                            sink.record(ViolationRecord::new(
                                combination.id.clone(),
                                index.canonical_key(&combination.id).cloned(),
                                ViolationReason::MissingChainEvidence,
                                0,
                                None,
                                None,
                            ));
                        }
                    }
                    None => candidates.push(combination.clone()),
                }
            }
        }
        let mut state = WorkingState::new(candidates, chains);
        let dropped = state.shrink_chains();
        if dropped > 0 {
            debug!("{dropped} chains with evidence are not used by any combination");
        }
        state
    }

    /// Estimate how much of the combined signal each of `combinations` contributed, given
    /// the fragment `evidence` for their chains.
    ///
    /// When [`ResolverParams::debug`] is set, `sink` must be provided and receives every
    /// combination flagged along the way. Otherwise `sink` is ignored.
    #[tracing::instrument(level = "debug", skip_all, fields(combinations = combinations.len()))]
    pub fn resolve<P: IntensityMeasurement>(
        &self,
        combinations: &[ChainCombination],
        evidence: &FragmentEvidence<P>,
        sink: Option<&mut dyn DebugSink>,
    ) -> Result<ChainResolution, ResolutionError> {
        self.params.validate()?;
        let mut sink = match (self.params.debug, sink) {
            (true, Some(sink)) => Some(sink),
            (true, None) => return Err(ResolutionError::MissingDebugSink),
            (false, _) => None,
        };

        let index = ChainCombinationIndex::from_combinations(combinations)?;
        let chains = aggregate_fragment_evidence(evidence);
        let state = Self::initial_state(combinations, chains, &index, &mut sink);

        let fit = self.pruner().run(state, &self.fitter, &index, sink)?;

        let intensities = normalize_parameters(fit.state.combinations(), &fit.parameters)?;
        let canonical_keys = fit
            .state
            .combinations()
            .iter()
            .filter_map(|c| {
                index
                    .canonical_key(&c.id)
                    .map(|key| (c.id.clone(), key.clone()))
            })
            .collect();
        let (_, chains) = fit.state.into_parts();
        let surviving_chains = chains.into_iter().map(|c| (c.id.clone(), c)).collect();
        debug!(
            "Resolved {} of {} combinations in {} rounds",
            intensities.len(),
            combinations.len(),
            fit.rounds.len()
        );
        Ok(ChainResolution {
            intensities,
            surviving_chains,
            canonical_keys,
            rounds: fit.rounds,
        })
    }

    /// Resolve many independent groups in parallel on the current `rayon` thread pool.
    ///
    /// Results are returned in the same order as `groups`.
    pub fn resolve_many<P: IntensityMeasurement + Sync>(
        &self,
        groups: &[ResolutionGroup<P>],
    ) -> Vec<GroupResolution>
    where
        F: Sync,
    {
        groups
            .par_iter()
            .map(|group| self.resolve_group(group))
            .collect()
    }

    /// Resolve a single [`ResolutionGroup`], capturing its trace when debugging
    pub fn resolve_group<P: IntensityMeasurement>(
        &self,
        group: &ResolutionGroup<P>,
    ) -> GroupResolution {
        let mut trace = Vec::new();
        let resolution = if self.params.debug {
            self.resolve(&group.combinations, &group.evidence, Some(&mut trace))
        } else {
            self.resolve(&group.combinations, &group.evidence, None)
        };
        if let Err(e) = resolution.as_ref() {
            debug!("Failed to resolve {}: {e}", group.name);
        }
        GroupResolution {
            name: group.name.clone(),
            resolution,
            trace,
        }
    }
}
