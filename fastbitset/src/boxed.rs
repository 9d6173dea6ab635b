use {
    crate::{find_unset_wrapping, split, words_for},
    alloc::{vec, vec::Vec},
    core::fmt::{self, Debug},
};

/// Mutable view over bitset words.
struct BitSlice<'a> {
    words: &'a mut [u32],
    len: usize,
}

impl BitSlice<'_> {
    /// Sets bit. Returns `true` if bit was unset before.
    fn set(&mut self, bit: usize) -> bool {
        assert!(bit < self.len, "Bit {} is out of {} bits", bit, self.len);
        let (word, mask) = split(bit);
        let was = self.words[word] & mask;
        self.words[word] |= mask;
        was == 0
    }

    /// Unsets bit. Returns `true` if bit was set before.
    fn unset(&mut self, bit: usize) -> bool {
        assert!(bit < self.len, "Bit {} is out of {} bits", bit, self.len);
        let (word, mask) = split(bit);
        let was = self.words[word] & mask;
        self.words[word] &= !mask;
        was != 0
    }
}

/// Heap-allocated bitset with fixed number of bits.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u32>,
    len: usize,
}

impl Debug for BitSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("BitSet")
                .field("len", &self.len)
                .field("ones", &self.count_ones())
                .finish()
        } else {
            write!(fmt, "BitSet({}/{})", self.count_ones(), self.len)
        }
    }
}

impl BitSet {
    /// Creates bitset with `len` unset bits.
    pub fn new(len: usize) -> Self {
        BitSet {
            words: vec![0; words_for(len)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slice(&mut self) -> BitSlice<'_> {
        BitSlice {
            words: &mut self.words,
            len: self.len,
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        assert!(bit < self.len, "Bit {} is out of {} bits", bit, self.len);
        self.words[bit / 32] & (1 << (bit % 32)) != 0
    }

    /// Sets bit. Returns `true` if bit was unset before.
    pub fn set(&mut self, bit: usize) -> bool {
        self.slice().set(bit)
    }

    /// Unsets bit. Returns `true` if bit was set before.
    pub fn unset(&mut self, bit: usize) -> bool {
        self.slice().unset(bit)
    }

    /// Finds first unset bit at or after `from`, wrapping around to the
    /// beginning once.
    pub fn find_unset_from(&self, from: usize) -> Option<usize> {
        find_unset_wrapping(&self.words, self.len, from)
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Unsets all bits.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn as_words(&self) -> &[u32] {
        &self.words
    }
}
