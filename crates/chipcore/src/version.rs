//! Tool version requirements such as `>=1.0.0` or `>=0.9,<2`.
//!
//! Versions compare component-wise on their dot-separated numeric prefix.
//! Missing components count as zero, so `1.0` equals `1.0.0`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
    Ne,
}

impl Comparator {
    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Comparator::Ge => ordering != Ordering::Less,
            Comparator::Le => ordering != Ordering::Greater,
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Lt => ordering == Ordering::Less,
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ne => ordering != Ordering::Equal,
        }
    }
}

/// Dotted numeric version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(raw: &str) -> Option<Version> {
        let raw = raw.trim();
        let raw = raw.strip_prefix(['v', 'V']).unwrap_or(raw);
        let mut parts = Vec::new();
        for piece in raw.split('.') {
            let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != piece.len() {
                // "1.2rc3" stops at the first non-numeric suffix
                break;
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Version(parts))
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSpecifier {
    pub comparator: Comparator,
    pub version: Version,
}

/// All specifiers must hold for a version to satisfy the requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRequirement {
    specifiers: Vec<VersionSpecifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(pub String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version requirement '{}'", self.0)
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for VersionRequirement {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut specifiers = Vec::new();
        for clause in s.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let (comparator, rest) = [
                (">=", Comparator::Ge),
                ("<=", Comparator::Le),
                ("==", Comparator::Eq),
                ("!=", Comparator::Ne),
                (">", Comparator::Gt),
                ("<", Comparator::Lt),
            ]
            .iter()
            .find_map(|(sym, cmp)| clause.strip_prefix(sym).map(|rest| (*cmp, rest)))
            .unwrap_or((Comparator::Eq, clause));

            let version =
                Version::parse(rest).ok_or_else(|| VersionParseError(s.to_string()))?;
            specifiers.push(VersionSpecifier {
                comparator,
                version,
            });
        }
        if specifiers.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(VersionRequirement { specifiers })
    }
}

impl VersionRequirement {
    pub fn matches(&self, version: &Version) -> bool {
        self.specifiers
            .iter()
            .all(|spec| spec.comparator.accepts(version.cmp(&spec.version)))
    }

    /// Parse `raw` and check it; unparseable versions never match.
    pub fn matches_str(&self, raw: &str) -> bool {
        Version::parse(raw).map(|v| self.matches(&v)).unwrap_or(false)
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .specifiers
            .iter()
            .map(|s| format!("{}{}", s.comparator.symbol(), s.version))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
