use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
};

use thiserror::Error;

/// Size of the simulated memory: 64 KiB, addressed by 16-bit addresses.
pub const MEM_BYTE_SIZE: usize = 1 << ADDRESS_BITS;

/// Width of a memory address in bits.
pub const ADDRESS_BITS: usize = 16;

/// Bytes per word. Every access is truncated down to this alignment.
pub const WORD_BYTES: usize = 4;

/// Number of word-aligned addresses in the memory.
pub const NUM_WORDS: usize = MEM_BYTE_SIZE / WORD_BYTES;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Addr(usize);

impl Addr {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn inner(self) -> usize {
        self.0
    }
    /// The address truncated down to the nearest word boundary.
    pub fn word_aligned(self) -> Self {
        Self(self.0 & !(WORD_BYTES - 1))
    }
    pub fn disp(self, words: usize) -> Self {
        Self(self.0 + words * WORD_BYTES)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum MemoryAccessError {
    #[error("address {accessed_address:#x} out of range for {MEM_BYTE_SIZE} byte memory")]
    OutOfRange { accessed_address: usize },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

/// Flat word-addressable memory over the full 16-bit address space.
///
/// Conceptually every word-aligned address holds a value (0 until written);
/// storage is materialized lazily. The set of written addresses is kept
/// separately so a front end can highlight modified words. That record is
/// presentation state only and carries no correctness weight.
pub struct Memory {
    words: HashMap<usize, u32>,
    written: BTreeSet<usize>,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            words: HashMap::new(),
            written: BTreeSet::new(),
        }
    }

    fn checked_align(addr: Addr) -> Result<usize> {
        let aligned = addr.word_aligned().inner();
        if aligned >= MEM_BYTE_SIZE {
            return Err(MemoryAccessError::OutOfRange {
                accessed_address: addr.inner(),
            });
        }
        Ok(aligned)
    }

    /// Reads the word at `addr` (aligned down), 0 if never written.
    pub fn read(&self, addr: Addr) -> Result<u32> {
        let aligned = Self::checked_align(addr)?;
        Ok(self.words.get(&aligned).copied().unwrap_or(0))
    }

    /// Reads `n` consecutive words starting at `start` (aligned down).
    pub fn read_block(&self, start: Addr, n: usize) -> Result<Vec<u32>> {
        let start = start.word_aligned();
        (0..n).map(|i| self.read(start.disp(i))).collect()
    }

    /// Writes the word at `addr` (aligned down) and records it as modified.
    pub fn write(&mut self, addr: Addr, value: u32) -> Result<()> {
        let aligned = Self::checked_align(addr)?;
        let _ = self.words.insert(aligned, value);
        let _ = self.written.insert(aligned);
        Ok(())
    }

    /// Writes `values` at consecutive word addresses starting at `start`.
    pub fn write_block(&mut self, start: Addr, values: &[u32]) -> Result<()> {
        let start = start.word_aligned();
        for (i, &value) in values.iter().enumerate() {
            self.write(start.disp(i), value)?;
        }
        Ok(())
    }

    /// Bulk pre-population, used by the exercise loaders.
    pub fn load_words<I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (usize, u32)>,
    {
        for (addr, value) in pairs {
            self.write(Addr::new(addr), value)?;
        }
        Ok(())
    }

    /// Word-aligned addresses written since construction or the last reset,
    /// in ascending order.
    pub fn written_addresses(&self) -> Vec<Addr> {
        self.written.iter().map(|&a| Addr::new(a)).collect()
    }

    /// Clears all stored values back to the all-zero initial state.
    pub fn reset(&mut self) {
        self.words.clear();
        self.written.clear();
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}
