//! Candidate chain combinations and the order-independent index over them
use std::collections::HashMap;
use std::fmt::Display;

use itertools::Itertools;
use thiserror::Error;

use crate::chain::ChainId;
use crate::resolve_traits::ResolutionError;

/// The separator between chains in a [`CanonicalKey`]. Chain identifiers may not contain it.
pub const CHAIN_SEPARATOR: char = '_';

/// The externally visible identifier of a chain combination, e.g. `PC 16:0_18:1`.
///
/// Identifiers are totally ordered by their bytes, and this order fixes the column
/// order of every design matrix built from them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CombinationId(String);

impl CombinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CombinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CombinationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CombinationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The sorted, order-independent encoding of a combination's chain multiset.
///
/// Only used to correlate combinations while debugging, never to merge them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_chains(chains: &[ChainId]) -> Result<Self, CombinationDefect> {
        if chains.is_empty() {
            return Err(CombinationDefect::NoChains);
        }
        for chain in chains {
            if chain.is_blank() {
                return Err(CombinationDefect::BlankChain);
            }
            if chain.as_str().contains(CHAIN_SEPARATOR) {
                return Err(CombinationDefect::ReservedSeparator(chain.clone()));
            }
        }
        let key = chains
            .iter()
            .sorted()
            .map(|c| c.normalized())
            .join(&CHAIN_SEPARATOR.to_string());
        Ok(Self(key))
    }
}

impl Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a combination could not be given a [`CanonicalKey`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombinationDefect {
    #[error("the combination lists no chains")]
    NoChains,
    #[error("the combination lists a blank chain identifier")]
    BlankChain,
    #[error("chain {0} contains the reserved separator '_'")]
    ReservedSeparator(ChainId),
    #[error("the identifier is used by more than one combination")]
    DuplicateIdentifier,
}

/// A candidate multiset of chains proposed to explain a combined signal
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainCombination {
    pub id: CombinationId,
    /// The chains in the combination in the caller's listing order. Repeats are meaningful.
    pub chains: Vec<ChainId>,
}

impl ChainCombination {
    pub fn new(id: impl Into<CombinationId>, chains: Vec<ChainId>) -> Self {
        Self {
            id: id.into(),
            chains,
        }
    }

    /// How many times `chain` occurs in this combination
    pub fn multiplicity(&self, chain: &ChainId) -> usize {
        self.chains.iter().filter(|c| *c == chain).count()
    }

    pub fn contains(&self, chain: &ChainId) -> bool {
        self.chains.iter().any(|c| c == chain)
    }

    pub fn canonical_key(&self) -> Result<CanonicalKey, ResolutionError> {
        CanonicalKey::from_chains(&self.chains).map_err(|defect| {
            ResolutionError::MalformedCombination {
                id: self.id.clone(),
                defect,
            }
        })
    }
}

/// A record of one [`CombinationId`] displacing another under the same [`CanonicalKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCollision {
    pub key: CanonicalKey,
    pub displaced: CombinationId,
    pub replacement: CombinationId,
}

/// Maps each combination to its [`CanonicalKey`] and each key back to the last
/// combination inserted under it.
///
/// Distinct combinations with the same chain multiset share a key, so the reverse
/// lookup keeps only one of them. The others are not lost silently: [`ChainCombinationIndex::insert`]
/// returns the displaced identifier and every displacement is kept in [`ChainCombinationIndex::collisions`].
#[derive(Debug, Default, Clone)]
pub struct ChainCombinationIndex {
    keys: HashMap<CombinationId, CanonicalKey>,
    reverse: HashMap<CanonicalKey, CombinationId>,
    collisions: Vec<KeyCollision>,
}

impl ChainCombinationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_combinations<'a>(
        combinations: impl IntoIterator<Item = &'a ChainCombination>,
    ) -> Result<Self, ResolutionError> {
        let mut index = Self::new();
        for combination in combinations {
            index.insert(combination)?;
        }
        Ok(index)
    }

    /// Add `combination` to the index, returning the identifier it displaced from the
    /// reverse lookup if another combination already held its canonical key.
    pub fn insert(
        &mut self,
        combination: &ChainCombination,
    ) -> Result<Option<CombinationId>, ResolutionError> {
        if self.keys.contains_key(&combination.id) {
            return Err(ResolutionError::MalformedCombination {
                id: combination.id.clone(),
                defect: CombinationDefect::DuplicateIdentifier,
            });
        }
        let key = combination.canonical_key()?;
        self.keys.insert(combination.id.clone(), key.clone());
        let displaced = self.reverse.insert(key.clone(), combination.id.clone());
        if let Some(displaced) = displaced.as_ref() {
            tracing::warn!(
                "Chain combination {} displaced {displaced} under canonical key {key}",
                combination.id
            );
            self.collisions.push(KeyCollision {
                key,
                displaced: displaced.clone(),
                replacement: combination.id.clone(),
            });
        }
        Ok(displaced)
    }

    pub fn canonical_key(&self, id: &CombinationId) -> Option<&CanonicalKey> {
        self.keys.get(id)
    }

    /// The last combination inserted under `key`
    pub fn lookup(&self, key: &CanonicalKey) -> Option<&CombinationId> {
        self.reverse.get(key)
    }

    pub fn collisions(&self) -> &[KeyCollision] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn combination(id: &str, chains: &[&str]) -> ChainCombination {
        ChainCombination::new(id, chains.iter().copied().map(ChainId::from).collect())
    }

    #[test]
    fn test_canonical_key_ignores_order() {
        let a = combination("PC 16:0_18:1", &["16:0", "18:1"]);
        let b = combination("PC 18:1_16:0", &["18:1", "16:0"]);
        assert_eq!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
        assert_eq!(a.canonical_key().unwrap().as_str(), "16:0_18:1");

        let c = combination("TG 16:0_16:0_18:1", &["18:1", "16:0", "16:0"]);
        assert_eq!(c.canonical_key().unwrap().as_str(), "16:0_16:0_18:1");
        assert_eq!(c.multiplicity(&ChainId::from("16:0")), 2);
    }

    #[test]
    fn test_malformed_combinations() {
        let err = combination("PC ?", &[]).canonical_key().unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MalformedCombination {
                defect: CombinationDefect::NoChains,
                ..
            }
        ));

        let err = combination("PC ?", &["16:0", " "]).canonical_key().unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MalformedCombination {
                defect: CombinationDefect::BlankChain,
                ..
            }
        ));

        let err = combination("PC ?", &["16:0_18:1"]).canonical_key().unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MalformedCombination {
                defect: CombinationDefect::ReservedSeparator(_),
                ..
            }
        ));
    }

    #[test]
    fn test_collision_is_reported() {
        let mut index = ChainCombinationIndex::new();
        let first = combination("PC 16:0_18:1", &["16:0", "18:1"]);
        let second = combination("PC 18:1/16:0", &["18:1", "16:0"]);

        assert_eq!(index.insert(&first).unwrap(), None);
        let displaced = index.insert(&second).unwrap();
        assert_eq!(displaced, Some(first.id.clone()));

        let key = first.canonical_key().unwrap();
        assert_eq!(index.lookup(&key), Some(&second.id));
        assert_eq!(index.canonical_key(&first.id), Some(&key));
        assert_eq!(index.canonical_key(&second.id), Some(&key));
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.collisions(),
            &[KeyCollision {
                key,
                displaced: first.id.clone(),
                replacement: second.id.clone()
            }]
        );
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let a = combination("PC 16:0_18:1", &["16:0", "18:1"]);
        let b = combination("PC 16:0_18:1", &["16:0", "18:2"]);
        let err = ChainCombinationIndex::from_combinations([&a, &b]).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MalformedCombination {
                defect: CombinationDefect::DuplicateIdentifier,
                ..
            }
        ));
    }
}
