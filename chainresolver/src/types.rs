use std::collections::BTreeMap;

use mzpeaks::CentroidPeak;
use serde::{Deserialize, Serialize};

use chainresolve::{
    fit::ParameterType, pruner::RoundSummary, AggregatedChain, ChainCombination, ChainId,
    CombinationId, FragmentEvidence, GroupResolution, ResolutionGroup, ViolationRecord,
};

pub type FPeak = CentroidPeak;
pub(crate) const BUFFER_SIZE: usize = 10_000;

/// A single detected fragment peak
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub mz: f64,
    /// The peak area, stored as the single precision intensity of [`FPeak`]. Areas above
    /// 2^24 keep about seven significant digits before they are summed in double precision.
    pub area: f32,
}

/// One resolution problem as it appears in an input document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub combinations: Vec<ChainCombination>,
    #[serde(default)]
    pub fragments: BTreeMap<String, Vec<FragmentRecord>>,
}

impl GroupRecord {
    pub fn into_group(self) -> ResolutionGroup<FPeak> {
        let mut evidence = FragmentEvidence::new();
        let mut index = 0u32;
        for (chain, fragments) in self.fragments {
            let peaks: Vec<FPeak> = fragments
                .into_iter()
                .map(|f| {
                    index += 1;
                    CentroidPeak::new(f.mz, f.area, index - 1)
                })
                .collect();
            evidence.extend(chain, peaks);
        }
        ResolutionGroup::new(self.name, self.combinations, evidence)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDocument {
    pub groups: Vec<GroupRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Resolved,
    Failed,
}

/// One line of output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOutput {
    pub name: String,
    pub status: GroupStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub intensities: BTreeMap<CombinationId, ParameterType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub surviving_chains: BTreeMap<ChainId, AggregatedChain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rounds: Vec<RoundSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<ViolationRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GroupOutput {
    pub fn from_resolution(result: GroupResolution, debug: bool) -> Self {
        let trace = debug.then_some(result.trace);
        match result.resolution {
            Ok(resolution) => Self {
                name: result.name,
                status: GroupStatus::Resolved,
                intensities: resolution.intensities,
                surviving_chains: resolution.surviving_chains,
                rounds: resolution.rounds,
                trace,
                error: None,
            },
            Err(e) => Self {
                name: result.name,
                status: GroupStatus::Failed,
                intensities: BTreeMap::new(),
                surviving_chains: BTreeMap::new(),
                rounds: Vec::new(),
                trace,
                error: Some(e.to_string()),
            },
        }
    }
}
