//! Apportion a combined lipid signal among candidate fatty acyl chain combinations.
//!
//! Fragment peak areas are summed per chain, a chains × combinations design matrix of
//! chain multiplicities is fitted against them, and combinations contributing less than a
//! fraction of the strongest one are pruned round by round until the set is stable. See
//! [`ChainResolver`] for the entry point.
pub mod chain;
pub mod combination;
pub mod evidence;
pub mod fit;
pub mod normalize;
pub mod pruner;
pub mod resolve_traits;

pub mod api;

pub use crate::api::{
    resolve_chain_combinations, ChainResolution, ChainResolver, GroupResolution,
    ResolutionGroup, ResolverParams, DEFAULT_RELATIVE_CHAIN_CUTOFF,
};
pub use crate::chain::{AggregatedChain, ChainComposition, ChainId};
pub use crate::combination::{
    CanonicalKey, ChainCombination, ChainCombinationIndex, CombinationDefect, CombinationId,
};
pub use crate::evidence::{aggregate_fragment_evidence, FragmentEvidence};
pub use crate::fit::{FitError, LeastSquares, LinearCombinationFitter, NonNegativeLeastSquares};
pub use crate::resolve_traits::{DebugSink, ResolutionError, ViolationReason, ViolationRecord};
