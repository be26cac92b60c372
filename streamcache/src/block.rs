//! Strongly-typed indices of fixed-size blocks.
//!
//! The cache addresses two distinct spaces with the same arithmetic: lines within a file and slots
//! within the shared arena. [BlockId] is parameterized by a tag type so that a [LineId] can never
//! be used where a [SlotId] is expected (and vice versa).

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// The size of every line (and therefore every slot) in bytes.
pub const LINE_SIZE: usize = 64 * 1024;

const LINE_SIZE_U64: u64 = LINE_SIZE as u64;

/// Tag for blocks of a file.
#[derive(Debug)]
pub enum Line {}

/// Tag for blocks of the shared arena.
#[derive(Debug)]
pub enum Slot {}

/// Index of a line within a file.
pub type LineId = BlockId<LINE_SIZE_U64, Line>;

/// Index of a slot within the arena.
pub type SlotId = BlockId<LINE_SIZE_U64, Slot>;

/// Index of a `SIZE`-byte block within the space identified by `T`.
///
/// An id is either invalid (all bits set) or refers to exactly one block.
pub struct BlockId<const SIZE: u64, T> {
    index: u32,
    _tag: PhantomData<fn() -> T>,
}

impl<const SIZE: u64, T> BlockId<SIZE, T> {
    /// The sentinel id that refers to no block.
    pub const INVALID: Self = Self::new(u32::MAX);

    /// Size of every block in this space.
    pub const SIZE: u64 = SIZE;

    /// Create an id referring to the block at `index`.
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            _tag: PhantomData,
        }
    }

    /// Return the id of the block containing byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the block index is not representable.
    pub fn containing(offset: u64) -> Self {
        let index = offset / SIZE;
        assert!(index < u32::MAX as u64, "block index overflow: {index}");
        Self::new(index as u32)
    }

    /// Returns true if this id refers to a block.
    pub const fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    /// The raw index of the block.
    pub fn index(&self) -> u32 {
        debug_assert!(self.is_valid());
        self.index
    }

    /// Byte offset of the start of the block.
    pub fn offset(&self) -> u64 {
        debug_assert!(self.is_valid());
        self.index as u64 * SIZE
    }

    /// Size of a full block.
    pub const fn size(&self) -> u64 {
        SIZE
    }

    /// Size of this block within a space that is `total` bytes long, which is shorter than
    /// [BlockId::size] for the final block and zero for blocks beyond the end.
    pub fn size_within(&self, total: u64) -> u64 {
        SIZE.min(total.saturating_sub(self.offset()))
    }

    /// Return the id of the following block.
    pub fn next(self) -> Self {
        debug_assert!(self.is_valid());
        let index = self.index + 1;
        assert!(index != u32::MAX, "block index overflow");
        Self::new(index)
    }

    /// Return the id of the preceding block.
    pub fn prev(self) -> Self {
        debug_assert!(self.is_valid());
        Self::new(self.index.checked_sub(1).expect("block index underflow"))
    }

    /// Iterate over every block from `first` to `last` (inclusive).
    pub fn range(first: Self, last: Self) -> impl Iterator<Item = Self> {
        debug_assert!(first.is_valid() && last.is_valid());
        (first.index..=last.index).map(Self::new)
    }
}

impl<const SIZE: u64, T> Clone for BlockId<SIZE, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const SIZE: u64, T> Copy for BlockId<SIZE, T> {}

impl<const SIZE: u64, T> Default for BlockId<SIZE, T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<const SIZE: u64, T> PartialEq for BlockId<SIZE, T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<const SIZE: u64, T> Eq for BlockId<SIZE, T> {}

impl<const SIZE: u64, T> PartialOrd for BlockId<SIZE, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const SIZE: u64, T> Ord for BlockId<SIZE, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<const SIZE: u64, T> Hash for BlockId<SIZE, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<const SIZE: u64, T> fmt::Debug for BlockId<SIZE, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.index)
        } else {
            write!(f, "invalid")
        }
    }
}

impl<const SIZE: u64, T> fmt::Display for BlockId<SIZE, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_block_offsets() {
        let line = LineId::new(3);
        assert!(line.is_valid());
        assert_eq!(line.offset(), 3 * LINE_SIZE_U64);
        assert_eq!(line.size(), LINE_SIZE_U64);
        assert_eq!(LineId::containing(0), LineId::new(0));
        assert_eq!(LineId::containing(LINE_SIZE_U64 - 1), LineId::new(0));
        assert_eq!(LineId::containing(LINE_SIZE_U64), LineId::new(1));
    }

    #[test]
    fn test_block_offset_is_wide() {
        // Offsets beyond 4 GiB must not overflow 32 bits.
        let line = LineId::new(100_000);
        assert_eq!(line.offset(), 100_000 * LINE_SIZE_U64);
    }

    #[test]
    fn test_block_size_within() {
        let file_size = 200 * 1024;
        assert_eq!(LineId::new(0).size_within(file_size), LINE_SIZE_U64);
        assert_eq!(LineId::new(2).size_within(file_size), LINE_SIZE_U64);
        assert_eq!(LineId::new(3).size_within(file_size), 8 * 1024);
        assert_eq!(LineId::new(4).size_within(file_size), 0);
    }

    #[test]
    fn test_block_invalid() {
        let invalid = SlotId::INVALID;
        assert!(!invalid.is_valid());
        assert_eq!(SlotId::default(), invalid);
        assert_eq!(format!("{invalid:?}"), "invalid");
    }

    #[test]
    fn test_block_iteration() {
        let mut line = LineId::new(5);
        line = line.next();
        assert_eq!(line, LineId::new(6));
        line = line.prev().prev();
        assert_eq!(line, LineId::new(4));

        let lines: Vec<_> = LineId::range(LineId::new(2), LineId::new(4)).collect();
        assert_eq!(lines, vec![LineId::new(2), LineId::new(3), LineId::new(4)]);
    }

    #[test]
    fn test_block_hash() {
        let set: HashSet<LineId> = [LineId::new(1), LineId::new(1), LineId::new(2)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    #[should_panic(expected = "block index underflow")]
    fn test_block_prev_underflow() {
        LineId::new(0).prev();
    }
}
