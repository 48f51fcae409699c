use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version constraint '{input}': {reason}")]
pub struct ParseVersionError {
    pub input: String,
    pub reason: String,
}

impl ParseVersionError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A package version: numeric release segments with an optional
/// pre/post-release suffix (`2.31.0`, `1.0rc1`, `3.2.post1`).
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    release: Vec<u64>,
    suffix: Option<Suffix>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Suffix {
    rank: u8,
    number: u64,
    label: String,
}

impl Suffix {
    fn parse(text: &str) -> Self {
        let trimmed = text.trim_start_matches(['.', '-', '_']).to_lowercase();
        let split = trimmed
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (label, digits) = trimmed.split_at(split);
        let rank = match label {
            "dev" => 0,
            "a" | "alpha" => 1,
            "b" | "beta" => 2,
            "c" | "rc" | "pre" | "preview" => 3,
            "post" | "rev" | "r" => 5,
            _ => 1,
        };
        Self {
            rank,
            number: digits.parse().unwrap_or(0),
            label: label.to_string(),
        }
    }

    // Final releases sit between pre-releases (rank < 4) and post-releases.
    const FINAL_RANK: u8 = 4;
}

impl Version {
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn segment(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    fn suffix_rank(&self) -> (u8, u64, &str) {
        match &self.suffix {
            Some(s) => (s.rank, s.number, s.label.as_str()),
            None => (Suffix::FINAL_RANK, 0, ""),
        }
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let raw = input.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        if raw.is_empty() {
            return Err(ParseVersionError::new(input, "version is empty"));
        }
        let split = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let (release_text, suffix_text) = raw.split_at(split);
        let release_text = release_text.trim_end_matches('.');
        if release_text.is_empty() {
            return Err(ParseVersionError::new(
                input,
                "version must start with a numeric release",
            ));
        }
        let release = release_text
            .split('.')
            .map(|segment| {
                segment
                    .parse::<u64>()
                    .map_err(|_| ParseVersionError::new(input, "malformed release segment"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let suffix = (!suffix_text.is_empty()).then(|| Suffix::parse(suffix_text));
        Ok(Self {
            raw: raw.to_string(),
            release,
            suffix,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for idx in 0..len {
            match self.segment(idx).cmp(&other.segment(idx)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.suffix_rank().cmp(&other.suffix_rank())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
    Arbitrary,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::Compatible => "~=",
            Operator::Arbitrary => "===",
        }
    }
}

// Longest operators first so `===` is not read as `==`.
const OPERATORS: [(&str, Operator); 8] = [
    ("===", Operator::Arbitrary),
    ("~=", Operator::Compatible),
    ("==", Operator::Equal),
    ("!=", Operator::NotEqual),
    (">=", Operator::GreaterEqual),
    ("<=", Operator::LessEqual),
    (">", Operator::Greater),
    ("<", Operator::Less),
];

#[derive(Debug, Clone)]
pub struct Specifier {
    pub op: Operator,
    pub version: Version,
    pub wildcard: bool,
    raw_version: String,
}

impl Specifier {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Operator::Equal if self.wildcard => self.prefix_matches(candidate),
            Operator::NotEqual if self.wildcard => !self.prefix_matches(candidate),
            Operator::Equal => candidate == &self.version,
            Operator::NotEqual => candidate != &self.version,
            Operator::GreaterEqual => candidate >= &self.version,
            Operator::LessEqual => candidate <= &self.version,
            Operator::Greater => candidate > &self.version,
            Operator::Less => candidate < &self.version,
            Operator::Compatible => {
                let prefix_len = self.version.release().len().saturating_sub(1);
                candidate >= &self.version
                    && (0..prefix_len).all(|idx| candidate.segment(idx) == self.version.segment(idx))
            }
            Operator::Arbitrary => candidate.as_str() == self.raw_version,
        }
    }

    fn prefix_matches(&self, candidate: &Version) -> bool {
        self.version
            .release()
            .iter()
            .enumerate()
            .all(|(idx, segment)| candidate.segment(idx) == *segment)
    }

    fn parse(input: &str) -> Result<Self, ParseVersionError> {
        let text = input.trim();
        let (symbol, op) = OPERATORS
            .iter()
            .find(|(symbol, _)| text.starts_with(symbol))
            .copied()
            .ok_or_else(|| ParseVersionError::new(input, "missing comparison operator"))?;
        let raw_version = text[symbol.len()..].trim().to_string();
        let (version_text, wildcard) = match raw_version.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (raw_version.as_str(), false),
        };
        if wildcard && !matches!(op, Operator::Equal | Operator::NotEqual) {
            return Err(ParseVersionError::new(
                input,
                "wildcards are only allowed with == and !=",
            ));
        }
        let version: Version = version_text.parse()?;
        if op == Operator::Compatible && version.release().len() < 2 {
            return Err(ParseVersionError::new(
                input,
                "~= requires at least two release segments",
            ));
        }
        Ok(Self {
            op,
            version,
            wildcard,
            raw_version,
        })
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.raw_version)
    }
}

/// Comma-separated set of specifiers; a version satisfies the constraint when
/// it satisfies every specifier. The empty constraint accepts any version.
#[derive(Debug, Clone, Default)]
pub struct VersionConstraint {
    specifiers: Vec<Specifier>,
}

impl VersionConstraint {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.specifiers.is_empty()
    }

    /// True when the constraint admits exactly one release.
    pub fn is_pinned(&self) -> bool {
        self.specifiers.iter().any(|spec| {
            matches!(spec.op, Operator::Arbitrary) || (spec.op == Operator::Equal && !spec.wildcard)
        })
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        self.specifiers.iter().all(|spec| spec.matches(candidate))
    }

    /// Highest candidate satisfying the constraint.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|candidate| self.matches(candidate))
            .max()
    }
}

impl FromStr for VersionConstraint {
    type Err = ParseVersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().is_empty() {
            return Ok(Self::any());
        }
        let specifiers = input
            .split(',')
            .map(Specifier::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specifiers })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}
