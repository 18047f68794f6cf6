//! Crosspoint selections

use bitvec::prelude::{BitVec, Lsb0};
use crate::crossbar::CrossbarError;

/// `DeviceMask` marks a subset of the crosspoints of a `words × bits`
/// array. It is used for _read all_ jobs over custom (standalone) arrays
/// where only some of the crosspoints carry devices. Internally it is a
/// [`BitVec`] with one bit per crosspoint in row-major order, so
/// iterating over it always yields addresses ordered by word and then
/// by bit.
///
/// ## Examples
///
/// ```
/// use libarc1::DeviceMask;
///
/// let mut mask = DeviceMask::new(3, 3);
/// mask.set(2, 3, true).unwrap();
/// mask.set(1, 2, true).unwrap();
///
/// let addresses: Vec<(usize, usize)> = mask.iter().collect();
/// assert_eq!(addresses, vec![(1, 2), (2, 3)]);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceMask {
    words: usize,
    bits: usize,
    mask: BitVec<u32, Lsb0>,
}

impl DeviceMask {

    /// Create an empty selection
    pub fn new(words: usize, bits: usize) -> Self {
        DeviceMask { words, bits, mask: BitVec::repeat(false, words * bits) }
    }

    /// Create a selection with every crosspoint enabled
    pub fn all(words: usize, bits: usize) -> Self {
        DeviceMask { words, bits, mask: BitVec::repeat(true, words * bits) }
    }

    fn index(&self, word: usize, bit: usize) -> Result<usize, CrossbarError> {
        if word < 1 || word > self.words || bit < 1 || bit > self.bits {
            return Err(CrossbarError::AddressOutOfBounds {
                word, bit, words: self.words, bits: self.bits });
        }
        Ok((word - 1) * self.bits + (bit - 1))
    }

    /// Enable or disable a crosspoint
    pub fn set(&mut self, word: usize, bit: usize, val: bool) -> Result<(), CrossbarError> {
        let idx = self.index(word, bit)?;
        self.mask.set(idx, val);
        Ok(())
    }

    /// Check if a crosspoint is part of the selection. Addresses outside
    /// the array are never selected.
    pub fn contains(&self, word: usize, bit: usize) -> bool {
        match self.index(word, bit) {
            Ok(idx) => self.mask[idx],
            Err(_) => false
        }
    }

    /// Number of selected crosspoints
    pub fn len(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Selected addresses, word-major, bit innermost
    pub fn iter(&self) -> impl Iterator<Item=(usize, usize)> + '_ {
        let bits = self.bits;
        self.mask.iter_ones().map(move |idx| (idx / bits + 1, idx % bits + 1))
    }
}
