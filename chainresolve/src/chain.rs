//! Fatty acyl chain identities and their aggregated fragment evidence
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

/// The identity of a single chain variant, e.g. `16:0`, `FA 18:1;O` or `O-16:0`.
///
/// Equality and hashing are ASCII case-insensitive. Ordering follows the chemical
/// identity of the chain where one can be read from the identifier (see [`ChainComposition`]),
/// falling back to case-insensitive text.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier with ASCII letters upper-cased, the form used when building keys
    pub fn normalized(&self) -> String {
        self.0.to_ascii_uppercase()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn composition(&self) -> Option<ChainComposition> {
        ChainComposition::parse(&self.0)
    }
}

impl PartialEq for ChainId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ChainId {}

impl Hash for ChainId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for ChainId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChainId {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_composition = match (self.composition(), other.composition()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_composition.then_with(|| {
            self.0
                .bytes()
                .map(|b| b.to_ascii_lowercase())
                .cmp(other.0.bytes().map(|b| b.to_ascii_lowercase()))
        })
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The sum composition read from a chain identifier's `<carbons>:<double bonds>[;<oxidation>]`
/// token. Field order is the sort order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainComposition {
    pub carbons: u16,
    pub double_bonds: u16,
    pub oxidations: u16,
}

fn leading_digits(text: &str) -> &str {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    &text[..end]
}

fn parse_oxidation(text: &str) -> u16 {
    let text = text.trim_start();
    if let Some(rest) = text.strip_prefix(['O', 'o']) {
        let digits = leading_digits(rest);
        if digits.is_empty() {
            1
        } else {
            digits.parse().unwrap_or(1)
        }
    } else {
        let digits = leading_digits(text);
        match text[digits.len()..].starts_with(['O', 'o']) {
            true => digits.parse().unwrap_or(0),
            false => 0,
        }
    }
}

impl ChainComposition {
    pub fn new(carbons: u16, double_bonds: u16, oxidations: u16) -> Self {
        Self {
            carbons,
            double_bonds,
            oxidations,
        }
    }

    /// Read the composition out of an identifier like `FA 18:1;O`, `P-18:0` or `22:6`
    pub fn parse(text: &str) -> Option<Self> {
        let colon = text.find(':')?;
        let head = &text[..colon];
        let carbon_start = head
            .char_indices()
            .rev()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let carbons = head[carbon_start..].parse().ok()?;

        let tail = &text[colon + 1..];
        let double_bonds_text = leading_digits(tail);
        let double_bonds = double_bonds_text.parse().ok()?;

        let oxidations = match tail[double_bonds_text.len()..].strip_prefix(';') {
            Some(rest) => parse_oxidation(rest),
            None => 0,
        };
        Some(Self::new(carbons, double_bonds, oxidations))
    }
}

/// All of the fragment evidence observed for one chain, collapsed to a single intensity
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregatedChain {
    pub id: ChainId,
    /// The summed area of all observations
    pub intensity: f64,
    /// How many observations contributed to `intensity`
    pub observations: usize,
}

impl AggregatedChain {
    pub fn new(id: ChainId, intensity: f64, observations: usize) -> Self {
        Self {
            id,
            intensity,
            observations,
        }
    }
}
