//! Hierarchical node addresses: a dotted sequence of bounded integer
//! segments, e.g. `10.0.0.0.1`. Immutable, `Ord` by segment sequence.

use chronotree_error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default per-segment upper bound, matching the engine's default
/// allocator configuration.
pub const DEFAULT_SEG_MAX: u32 = 255;

/// An immutable hierarchical address: `[s0, s1, ..., sk]`.
///
/// Ordering is the natural lexicographic order over the segment
/// sequence (`Vec`'s derived `Ord` already treats a strict prefix as
/// "less than" its extensions, which matches "shorter prefix sorts
/// first").
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address {
    segments: Vec<u32>,
}

impl Address {
    /// Build an address from segments already known to be in range.
    /// Used internally by allocator/parse paths that have validated
    /// their inputs; `rooted` in tests for literal addresses.
    pub fn from_segments(segments: Vec<u32>) -> Result<Self> {
        if segments.is_empty() {
            return Err(EngineError::InvalidAddress {
                address: String::new(),
                reason: "address must have at least one segment".into(),
            });
        }
        Ok(Self { segments })
    }

    /// Parse `"10.0.0.0"`-style dotted notation, rejecting empty,
    /// non-numeric, over-range, or over-length segments.
    pub fn parse(input: &str, seg_max: u32) -> Result<Self> {
        if input.is_empty() {
            return Err(EngineError::InvalidAddress {
                address: input.to_string(),
                reason: "address must not be empty".into(),
            });
        }

        let mut segments = Vec::new();
        for (i, part) in input.split('.').enumerate() {
            let value: u32 = part.parse().map_err(|_| EngineError::InvalidAddress {
                address: input.to_string(),
                reason: format!("segment {} is not a non-negative integer: {part}", i + 1),
            })?;
            if value > seg_max {
                return Err(EngineError::InvalidAddress {
                    address: input.to_string(),
                    reason: format!("segment {} out of range 0..={seg_max}: {value}", i + 1),
                });
            }
            segments.push(value);
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// `segments.len() - 1`.
    pub fn depth(&self) -> usize {
        self.segments.len() - 1
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// All segments but the last; `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append segment `index`; rejects `index` outside `[0, seg_max]`.
    pub fn child(&self, index: u32, seg_max: u32) -> Result<Self> {
        if index > seg_max {
            return Err(EngineError::InvalidAddress {
                address: self.to_string(),
                reason: format!("child index out of range 0..={seg_max}: {index}"),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(index);
        Ok(Self { segments })
    }

    /// Replace the last segment with `last + offset`; `None` if the
    /// result would fall outside `[0, seg_max]`.
    pub fn sibling(&self, offset: i64, seg_max: u32) -> Option<Self> {
        let last = *self.segments.last()?;
        let new_last = last as i64 + offset;
        if new_last < 0 || new_last > seg_max as i64 {
            return None;
        }
        let mut segments = self.segments[..self.segments.len() - 1].to_vec();
        segments.push(new_last as u32);
        Some(Self { segments })
    }

    /// True iff `self`'s segments are a strict prefix of `other`'s.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn is_descendant_of(&self, other: &Self) -> bool {
        other.is_ancestor_of(self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders() {
        let addr = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.0");
        assert_eq!(addr.depth(), 3);
    }

    #[test]
    fn rejects_empty_and_non_numeric() {
        assert!(Address::parse("", DEFAULT_SEG_MAX).is_err());
        assert!(Address::parse("10.a.0", DEFAULT_SEG_MAX).is_err());
        assert!(Address::parse("10.999.0", DEFAULT_SEG_MAX).is_err());
    }

    #[test]
    fn parent_child_round_trip() {
        let root = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        let child = root.child(1, DEFAULT_SEG_MAX).unwrap();
        assert_eq!(child.to_string(), "10.0.0.0.1");
        assert_eq!(child.parent().unwrap(), root);
        assert!(root.parent().is_some());
    }

    #[test]
    fn single_segment_has_no_parent() {
        let root = Address::parse("10", DEFAULT_SEG_MAX).unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn sibling_out_of_range_is_none() {
        let addr = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        assert!(addr.sibling(-1000, DEFAULT_SEG_MAX).is_none());
        assert!(addr.sibling(1, DEFAULT_SEG_MAX).is_some());
    }

    #[test]
    fn ancestor_is_strict_prefix() {
        let root = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        let child = root.child(1, DEFAULT_SEG_MAX).unwrap();
        let grandchild = child.child(2, DEFAULT_SEG_MAX).unwrap();
        assert!(root.is_ancestor_of(&child));
        assert!(root.is_ancestor_of(&grandchild));
        assert!(!child.is_ancestor_of(&root));
        assert!(!root.is_ancestor_of(&root));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        let b = Address::parse("10.0.0.1", DEFAULT_SEG_MAX).unwrap();
        let shorter = Address::parse("10.0.0", DEFAULT_SEG_MAX).unwrap();
        assert!(a < b);
        assert!(shorter < a);
    }
}
