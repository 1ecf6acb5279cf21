//! CPU set value type
//!
//! A [`CpuSet`] is an immutable set of logical CPU ids. Every operation
//! returns a new set; the textual form is the canonical Linux cpuset cgroup
//! list (comma-separated ascending ranges such as `0-3,7,10-11`), and
//! parsing is the exact inverse of formatting.

use std::collections::BTreeSet;
use std::str::FromStr;

use thiserror::Error;

/// Error produced when a cpuset list string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cpuset list: {value}")]
pub struct CpuSetParseError {
    pub value: String,
}

/// An immutable set of logical CPU ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    /// Parse the canonical cpuset list form. The empty string is the empty
    /// set.
    pub fn parse(value: &str) -> Result<Self, CpuSetParseError> {
        let invalid = || CpuSetParseError {
            value: value.to_string(),
        };

        let mut cpus = BTreeSet::new();
        if value.is_empty() {
            return Ok(Self { cpus });
        }

        for part in value.split(',') {
            match part.split_once('-') {
                Some((first, last)) => {
                    let first: usize = first.parse().map_err(|_| invalid())?;
                    let last: usize = last.parse().map_err(|_| invalid())?;
                    if first >= last {
                        return Err(invalid());
                    }
                    cpus.extend(first..=last);
                }
                None => {
                    cpus.insert(part.parse().map_err(|_| invalid())?);
                }
            }
        }
        Ok(Self { cpus })
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for CpuSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}
