//! Variable keys.
//!
//! A [`Key`] is an opaque, totally ordered `u64`. Keys built with [`Key::symbol`] carry a
//! character tag in the top byte and an index in the remaining 56 bits, so `x3` and `l3`
//! are distinct variables that still sort by tag, then index.

use std::fmt;

const CHR_BITS: u32 = 8;
const IDX_BITS: u32 = u64::BITS - CHR_BITS;
const IDX_MASK: u64 = (1 << IDX_BITS) - 1;

/// Identifier of an optimization variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub u64);

impl Key {
    /// Tagged key, e.g. `Key::symbol('x', 3)` displays as `x3`.
    ///
    /// Only ASCII tags are representable; other characters are folded to their low byte.
    pub fn symbol(chr: char, index: u64) -> Self {
        Key(((chr as u64 & 0xff) << IDX_BITS) | (index & IDX_MASK))
    }

    /// Character tag, if the key was built with [`Key::symbol`].
    pub fn chr(&self) -> Option<char> {
        let c = (self.0 >> IDX_BITS) as u8;
        (c != 0).then_some(c as char)
    }

    /// Index without the tag; the raw value for untagged keys below 2⁵⁶.
    pub fn index(&self) -> u64 {
        self.0 & IDX_MASK
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Key(value)
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key(value as u64)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chr() {
            Some(c) => write!(f, "{}{}", c, self.index()),
            None => write!(f, "{}", self.0),
        }
    }
}
