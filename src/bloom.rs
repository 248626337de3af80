//! Per-chunk Bloom filters for read-side record skipping.
//!
//! The writer folds every entry's filter value into a small Bloom
//! filter stored between the chunk header and the data region. Entries
//! without a value contribute the empty string, so a matcher configured
//! with `match_unfiltered` can select them. Two SipHash-1-3 derived bit
//! positions are set per value.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

pub const MIN_FILTER_SIZE: u8 = 16;

const SIP_KEY_A: (u64, u64) = (0x4f53_494c_4f47_0001, 0x9e37_79b9_7f4a_7c15);
const SIP_KEY_B: (u64, u64) = (0x4f53_494c_4f47_0002, 0xc2b2_ae3d_27d4_eb4f);

fn bit_positions(value: &[u8], nbits: u64) -> (u64, u64) {
    let mut hasher = SipHasher13::new_with_keys(SIP_KEY_A.0, SIP_KEY_A.1);
    hasher.write(value);
    let first = hasher.finish() % nbits;

    let mut hasher = SipHasher13::new_with_keys(SIP_KEY_B.0, SIP_KEY_B.1);
    hasher.write(value);
    let second = hasher.finish() % nbits;

    (first, second)
}

fn test_bit(bits: &[u8], pos: u64) -> bool {
    bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
}

fn set_bit(bits: &mut [u8], pos: u64) {
    bits[(pos / 8) as usize] |= 1 << (pos % 8);
}

/// Write-side filter accumulator.
pub struct Filter {
    bits: Vec<u8>,
    populated: bool,
}

impl Filter {
    pub fn new(size: u8) -> Self {
        let size = size.max(MIN_FILTER_SIZE);
        Self {
            bits: vec![0u8; size as usize],
            populated: false,
        }
    }

    pub fn insert(&mut self, value: &[u8]) {
        let nbits = self.bits.len() as u64 * 8;
        let (first, second) = bit_positions(value, nbits);
        set_bit(&mut self.bits, first);
        set_bit(&mut self.bits, second);
        self.populated = true;
    }

    /// Serialized filter bytes; empty when nothing was inserted.
    pub fn to_bytes(&self) -> &[u8] {
        if self.populated {
            &self.bits
        } else {
            &[]
        }
    }
}

/// Read-side matcher compiled for a specific filter size.
#[derive(Clone, Debug)]
pub struct Matcher {
    values: Vec<Vec<u8>>,
    match_unfiltered: bool,
    size: u8,
}

pub enum MatchResult {
    Match,
    NoMatch,
    /// The on-disk filter was built with a different size; retry the
    /// same chunk with this recompiled matcher.
    Retry(Matcher),
}

impl Matcher {
    pub fn new(values: Vec<Vec<u8>>, match_unfiltered: bool, size: u8) -> Self {
        Self {
            values,
            match_unfiltered,
            size: size.max(MIN_FILTER_SIZE),
        }
    }

    fn with_size(&self, size: u8) -> Self {
        Self {
            values: self.values.clone(),
            match_unfiltered: self.match_unfiltered,
            size,
        }
    }

    fn matches(&self, filter: &[u8]) -> bool {
        let nbits = filter.len() as u64 * 8;
        let hit = |value: &[u8]| {
            let (first, second) = bit_positions(value, nbits);
            test_bit(filter, first) && test_bit(filter, second)
        };
        if self.match_unfiltered && hit(b"") {
            return true;
        }
        self.values.iter().any(|value| hit(value))
    }
}

/// Match a chunk's filter bytes against an optional matcher.
///
/// No matcher or no on-disk filter always matches: without a filter the
/// chunk cannot be excluded.
pub fn is_match(filter: &[u8], matcher: Option<&Matcher>) -> MatchResult {
    let matcher = match matcher {
        Some(matcher) => matcher,
        None => return MatchResult::Match,
    };
    if filter.is_empty() {
        return MatchResult::Match;
    }
    if filter.len() != matcher.size as usize {
        return MatchResult::Retry(matcher.with_size(filter.len() as u8));
    }
    if matcher.matches(filter) {
        MatchResult::Match
    } else {
        MatchResult::NoMatch
    }
}

/// Declarative matcher configuration, part of the reader options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterSpec {
    pub values: Vec<String>,
    #[serde(default)]
    pub match_unfiltered: bool,
}

impl FilterSpec {
    pub fn matcher(&self, size: u8) -> Matcher {
        Matcher::new(
            self.values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            self.match_unfiltered,
            size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_match() {
        let mut filter = Filter::new(16);
        filter.insert(b"banana");
        filter.insert(b"");
        let bytes = filter.to_bytes().to_vec();
        assert_eq!(bytes.len(), 16);

        let matcher = Matcher::new(vec![b"banana".to_vec()], false, 16);
        assert!(matches!(is_match(&bytes, Some(&matcher)), MatchResult::Match));

        let matcher = Matcher::new(vec![b"apple".to_vec()], false, 16);
        assert!(matches!(
            is_match(&bytes, Some(&matcher)),
            MatchResult::NoMatch
        ));

        // unfiltered entries were present
        let matcher = Matcher::new(vec![], true, 16);
        assert!(matches!(is_match(&bytes, Some(&matcher)), MatchResult::Match));
    }

    #[test]
    fn empty_filter_always_matches() {
        let filter = Filter::new(16);
        assert!(filter.to_bytes().is_empty());
        let matcher = Matcher::new(vec![b"x".to_vec()], false, 16);
        assert!(matches!(
            is_match(filter.to_bytes(), Some(&matcher)),
            MatchResult::Match
        ));
    }

    #[test]
    fn size_mismatch_requests_retry() {
        let mut filter = Filter::new(32);
        filter.insert(b"banana");
        let bytes = filter.to_bytes().to_vec();

        let matcher = Matcher::new(vec![b"banana".to_vec()], false, 16);
        match is_match(&bytes, Some(&matcher)) {
            MatchResult::Retry(rebuilt) => {
                assert!(matches!(
                    is_match(&bytes, Some(&rebuilt)),
                    MatchResult::Match
                ));
            }
            _ => panic!("expected retry"),
        }
    }
}
