//! Fragment-level evidence for chains and its aggregation into one intensity per chain
use std::collections::HashMap;

use mzpeaks::IntensityMeasurement;

use crate::chain::{AggregatedChain, ChainId};

/// The detected fragment peaks supporting each chain.
///
/// Any peak type implementing [`IntensityMeasurement`] may be used, its intensity is
/// taken as the peak's area.
#[derive(Debug, Clone)]
pub struct FragmentEvidence<P: IntensityMeasurement> {
    chains: Vec<(ChainId, Vec<P>)>,
}

impl<P: IntensityMeasurement> Default for FragmentEvidence<P> {
    fn default() -> Self {
        Self {
            chains: Vec::new(),
        }
    }
}

impl<P: IntensityMeasurement> FragmentEvidence<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one detected peak for `chain`
    pub fn add(&mut self, chain: impl Into<ChainId>, peak: P) {
        let chain = chain.into();
        match self.chains.iter_mut().find(|(c, _)| *c == chain) {
            Some((_, peaks)) => peaks.push(peak),
            None => self.chains.push((chain, vec![peak])),
        }
    }

    /// Record all of `peaks` for `chain`. An empty collection still registers the chain,
    /// but it will contribute nothing when aggregated.
    pub fn extend(&mut self, chain: impl Into<ChainId>, peaks: impl IntoIterator<Item = P>) {
        let chain = chain.into();
        match self.chains.iter_mut().find(|(c, _)| *c == chain) {
            Some((_, existing)) => existing.extend(peaks),
            None => self.chains.push((chain, peaks.into_iter().collect())),
        }
    }

    pub fn get(&self, chain: &ChainId) -> Option<&[P]> {
        self.chains
            .iter()
            .find(|(c, _)| c == chain)
            .map(|(_, peaks)| peaks.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (ChainId, Vec<P>)> {
        self.chains.iter()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl<P: IntensityMeasurement, C: Into<ChainId>> FromIterator<(C, P)> for FragmentEvidence<P> {
    fn from_iter<T: IntoIterator<Item = (C, P)>>(iter: T) -> Self {
        let mut evidence = Self::new();
        for (chain, peak) in iter {
            evidence.add(chain, peak);
        }
        evidence
    }
}

/// Sum the detected areas of each chain into one [`AggregatedChain`].
///
/// Chains without any detected peak are left out entirely rather than reported with
/// zero intensity. The result is sorted by chain identity, which is the row order of
/// every design matrix built from it.
pub fn aggregate_fragment_evidence<P: IntensityMeasurement>(
    evidence: &FragmentEvidence<P>,
) -> Vec<AggregatedChain> {
    let mut acc: HashMap<&ChainId, AggregatedChain> = HashMap::with_capacity(evidence.len());
    for (chain, peaks) in evidence.iter() {
        if peaks.is_empty() {
            continue;
        }
        let entry = acc
            .entry(chain)
            .or_insert_with(|| AggregatedChain::new(chain.clone(), 0.0, 0));
        entry.intensity += peaks.iter().map(|p| p.intensity() as f64).sum::<f64>();
        entry.observations += peaks.len();
    }
    let mut chains: Vec<_> = acc.into_values().collect();
    chains.sort_by(|a, b| a.id.cmp(&b.id));
    chains
}
