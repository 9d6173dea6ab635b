//! Fixed-capacity bitsets stored as `u32` words.
//!
//! Word layout is little-endian by bit: bit `i` lives in word `i / 32` at
//! position `i % 32`. This is the layout GPU shaders read, so the words can
//! be uploaded as is.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "boxed")]
extern crate alloc;

#[cfg(feature = "boxed")]
mod boxed;

#[cfg(feature = "boxed")]
pub use boxed::*;

/// Number of bits in one storage word.
pub const WORD_BITS: usize = 32;

/// Number of words required to hold `bits` bits.
#[inline(always)]
pub const fn words_for(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

#[inline(always)]
pub(crate) fn split(bit: usize) -> (usize, u32) {
    (bit / WORD_BITS, 1u32 << (bit % WORD_BITS))
}

/// Finds first unset bit in `words[..]` in range `start..end`.
/// Bits at or past `end` are ignored.
fn find_unset_in(words: &[u32], start: usize, end: usize) -> Option<usize> {
    if start >= end {
        return None;
    }

    let mut word_index = start / WORD_BITS;
    let mut mask = !0u32 << (start % WORD_BITS);

    while word_index * WORD_BITS < end {
        let free = !words[word_index] & mask;
        if free != 0 {
            let bit = word_index * WORD_BITS + free.trailing_zeros() as usize;
            return if bit < end { Some(bit) } else { None };
        }
        word_index += 1;
        mask = !0;
    }

    None
}

pub(crate) fn find_unset_wrapping(
    words: &[u32],
    len: usize,
    from: usize,
) -> Option<usize> {
    let from = if from < len { from } else { 0 };
    find_unset_in(words, from, len).or_else(|| find_unset_in(words, 0, from))
}
