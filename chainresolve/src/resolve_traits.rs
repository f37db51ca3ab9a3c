/*! Error types and debugging hooks shared by the resolution machinery */
use std::fmt::Display;

use thiserror::Error;

use crate::combination::{CanonicalKey, CombinationDefect, CombinationId};
use crate::fit::{FitError, ParameterType};

/// An error that might occur while resolving a group of chain combinations.
///
/// Every variant aborts the whole resolution call, there is no partial result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("The linear combination fit failed: {0}")]
    Fit(
        #[source]
        #[from]
        FitError,
    ),
    #[error("No chain combination explains the fragment evidence above the relative chain cutoff")]
    EmptyWorkingSet,
    #[error("All fitted parameters collapsed, their total was {total}")]
    DegenerateNormalization { total: ParameterType },
    #[error("Chain combination {id} could not be encoded: {defect}")]
    MalformedCombination {
        id: CombinationId,
        #[source]
        defect: CombinationDefect,
    },
    #[error("The relative chain cutoff must be in (0, 1], got {0}")]
    InvalidCutoff(f64),
    #[error("Debug capture was requested but no debug sink was supplied")]
    MissingDebugSink,
    #[error("The working state became inconsistent: {0}")]
    InconsistentWorkingState(String),
    #[error("The resolution did not settle within {0} rounds")]
    RoundLimitExceeded(usize),
}

/// Why a chain combination was flagged during resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViolationReason {
    /// The combination's fitted parameter was below the relative chain cutoff of its round
    BelowRelativeChainCutoff,
    /// The combination uses a chain for which no fragment was detected, so it was never fitted
    MissingChainEvidence,
}

impl Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationReason::BelowRelativeChainCutoff => f.write_str("below relative chain cutoff"),
            ViolationReason::MissingChainEvidence => f.write_str("missing chain evidence"),
        }
    }
}

/// A single flag raised against a chain combination
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViolationRecord {
    pub combination: CombinationId,
    pub canonical_key: Option<CanonicalKey>,
    pub reason: ViolationReason,
    /// The fitting round the flag was raised in, 0 for flags raised while building the
    /// initial working state
    pub round: usize,
    pub parameter: Option<ParameterType>,
    pub threshold: Option<ParameterType>,
}

impl ViolationRecord {
    pub fn new(
        combination: CombinationId,
        canonical_key: Option<CanonicalKey>,
        reason: ViolationReason,
        round: usize,
        parameter: Option<ParameterType>,
        threshold: Option<ParameterType>,
    ) -> Self {
        Self {
            combination,
            canonical_key,
            reason,
            round,
            parameter,
            threshold,
        }
    }
}

/// Receives every [`ViolationRecord`] raised while debug capture is enabled, in the
/// order they are raised.
pub trait DebugSink {
    fn record(&mut self, record: ViolationRecord);
}

impl DebugSink for Vec<ViolationRecord> {
    fn record(&mut self, record: ViolationRecord) {
        self.push(record)
    }
}
