use std::{fmt::Display, str::FromStr};

use thiserror::Error;

use crate::memory::{self, Addr, Memory, ADDRESS_BITS, WORD_BYTES};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WritePolicy {
    WriteThrough,
    WriteBack,
}

impl Display for WritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritePolicy::WriteThrough => write!(f, "write-through"),
            WritePolicy::WriteBack => write!(f, "write-back"),
        }
    }
}

#[derive(Error, Debug)]
#[error("unknown write policy `{0}`, expected `write-through` or `write-back`")]
pub struct ParseWritePolicyError(String);

impl FromStr for WritePolicy {
    type Err = ParseWritePolicyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "write-through" | "wt" => Ok(Self::WriteThrough),
            "write-back" | "wb" => Ok(Self::WriteBack),
            other => Err(ParseWritePolicyError(other.to_owned())),
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheConfigError {
    #[error("number of sets must be a power of two, got {0}")]
    SetsNotPowerOfTwo(usize),
    #[error("block size must be a power of two number of words, got {0}")]
    BlockSizeNotPowerOfTwo(usize),
    #[error("associativity must be at least 1")]
    ZeroAssociativity,
    #[error(
        "{num_sets} sets with {block_size_words}-word blocks needs more than \
         {ADDRESS_BITS} address bits, leaving no room for a tag"
    )]
    NoTagBits {
        num_sets: usize,
        block_size_words: usize,
    },
}

/// Geometry and policy of a cache. Validated once at [`Cache::new`]; a
/// rejected configuration can never reach the decomposition or access paths.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CacheConfig {
    /// Number of sets. Power of two.
    pub num_sets: usize,
    /// Words per block. Power of two.
    pub block_size_words: usize,
    /// Ways per set. 1 means direct-mapped.
    pub associativity: usize,
    pub write_policy: WritePolicy,
}

impl CacheConfig {
    pub fn direct_mapped(num_sets: usize, block_size_words: usize, write_policy: WritePolicy) -> Self {
        Self {
            num_sets,
            block_size_words,
            associativity: 1,
            write_policy,
        }
    }

    fn validate(&self) -> std::result::Result<BitWidths, CacheConfigError> {
        if !self.num_sets.is_power_of_two() {
            return Err(CacheConfigError::SetsNotPowerOfTwo(self.num_sets));
        }
        if !self.block_size_words.is_power_of_two() {
            return Err(CacheConfigError::BlockSizeNotPowerOfTwo(self.block_size_words));
        }
        if self.associativity == 0 {
            return Err(CacheConfigError::ZeroAssociativity);
        }
        let byte_offset_bits = WORD_BYTES.trailing_zeros() as usize;
        let block_offset_bits = self.block_size_words.trailing_zeros() as usize;
        let index_bits = self.num_sets.trailing_zeros() as usize;
        let used = byte_offset_bits + block_offset_bits + index_bits;
        if used > ADDRESS_BITS {
            return Err(CacheConfigError::NoTagBits {
                num_sets: self.num_sets,
                block_size_words: self.block_size_words,
            });
        }
        Ok(BitWidths {
            byte_offset_bits,
            block_offset_bits,
            index_bits,
            tag_bits: ADDRESS_BITS - used,
        })
    }
}

/// How many address bits each decomposition field occupies, low to high.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BitWidths {
    pub byte_offset_bits: usize,
    pub block_offset_bits: usize,
    pub index_bits: usize,
    pub tag_bits: usize,
}

/// An address split into its four fields. This decomposition is the primary
/// object students are quizzed on, so it must be bit-exact.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressFields {
    pub tag: usize,
    pub set_index: usize,
    pub block_offset: usize,
    pub byte_offset: usize,
}

impl AddressFields {
    /// Reassembles the fields into the address they were extracted from.
    pub fn reassemble(&self, widths: BitWidths) -> Addr {
        let mut addr = self.tag;
        addr = (addr << widths.index_bits) | self.set_index;
        addr = (addr << widths.block_offset_bits) | self.block_offset;
        addr = (addr << widths.byte_offset_bits) | self.byte_offset;
        Addr::new(addr)
    }
}

/// Where an access landed, for front-end highlighting only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Placement {
    pub set_index: usize,
    pub way: usize,
    pub tag: usize,
    pub block_offset: usize,
}

/// Result of one cache access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AccessOutcome {
    pub hit: bool,
    /// The word read; absent for writes.
    pub value: Option<u32>,
    pub placement: Placement,
}

#[derive(Clone)]
struct CacheLine {
    valid: bool,
    tag: usize,
    data: Vec<u32>,
    dirty: bool,
    recency: u64,
    /// Word-aligned start address of the resident block, so a dirty line can
    /// be written back to the right place on eviction.
    origin_addr: usize,
}

impl CacheLine {
    fn invalid(block_size_words: usize) -> Self {
        Self {
            valid: false,
            tag: 0,
            data: vec![0; block_size_words],
            dirty: false,
            recency: 0,
            origin_addr: 0,
        }
    }
}

/// Per-line view of the cache contents, for rendering.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LineSnapshot {
    pub valid: bool,
    pub tag: usize,
    pub data: Vec<u32>,
    pub dirty: bool,
    pub recency: u64,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Statistics {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    pub hit_rate_percent: f64,
}

pub type Result<T> = memory::Result<T>;

/// A single-level direct-mapped or N-way set-associative cache in front of a
/// [`Memory`], with LRU replacement.
///
/// The cache exclusively owns its backing memory; everything is synchronous
/// and single-threaded. Replacement recency is an ever-growing counter, which
/// is fine at exercise scale (tens of accesses).
pub struct Cache {
    config: CacheConfig,
    widths: BitWidths,
    sets: Vec<Vec<CacheLine>>,
    memory: Memory,
    hits: u64,
    misses: u64,
}

impl Cache {
    pub fn new(config: CacheConfig, memory: Memory) -> std::result::Result<Self, CacheConfigError> {
        let widths = config.validate()?;
        let sets = (0..config.num_sets)
            .map(|_| vec![CacheLine::invalid(config.block_size_words); config.associativity])
            .collect();
        Ok(Self {
            config,
            widths,
            sets,
            memory,
            hits: 0,
            misses: 0,
        })
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn widths(&self) -> BitWidths {
        self.widths
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Splits an address into its fields by successive shifts and masks,
    /// low bits first.
    pub fn decompose(&self, addr: Addr) -> AddressFields {
        let mut a = addr.inner();
        let byte_offset = a & ((1 << self.widths.byte_offset_bits) - 1);
        a >>= self.widths.byte_offset_bits;
        let block_offset = a & ((1 << self.widths.block_offset_bits) - 1);
        a >>= self.widths.block_offset_bits;
        let set_index = a & ((1 << self.widths.index_bits) - 1);
        a >>= self.widths.index_bits;
        let tag = a & ((1 << self.widths.tag_bits) - 1);
        AddressFields {
            tag,
            set_index,
            block_offset,
            byte_offset,
        }
    }

    /// Word-aligned start address of the block containing `addr`.
    pub fn block_start(&self, addr: Addr) -> Addr {
        let low_bits = self.widths.byte_offset_bits + self.widths.block_offset_bits;
        Addr::new((addr.inner() >> low_bits) << low_bits)
    }

    fn find_hit_way(&self, set_index: usize, tag: usize) -> Option<usize> {
        self.sets[set_index]
            .iter()
            .position(|line| line.valid && line.tag == tag)
    }

    /// The line to service a miss with: any invalid way first, otherwise the
    /// valid way with the smallest recency. Strictly-less comparison keeps
    /// the smallest way index on equal recencies.
    fn victim_way(&self, set_index: usize) -> usize {
        let set = &self.sets[set_index];
        if let Some(way) = set.iter().position(|line| !line.valid) {
            return way;
        }
        let mut victim = 0;
        for (way, line) in set.iter().enumerate().skip(1) {
            if line.recency < set[victim].recency {
                victim = way;
            }
        }
        victim
    }

    /// Stamps `way` as most recently used within its set.
    fn touch(&mut self, set_index: usize, way: usize) {
        let newest = self.sets[set_index]
            .iter()
            .filter(|line| line.valid)
            .map(|line| line.recency)
            .max()
            .unwrap_or(0);
        self.sets[set_index][way].recency = newest + 1;
    }

    /// Flushes the line's block to memory if it is valid and dirty. Must run
    /// before new contents are installed over it, or the write is lost.
    fn flush_if_dirty(&mut self, set_index: usize, way: usize) -> Result<()> {
        let line = &self.sets[set_index][way];
        if line.valid && line.dirty {
            log::debug!(
                "writing back dirty block at {} from set {} way {}",
                Addr::new(line.origin_addr),
                set_index,
                way
            );
            let origin = Addr::new(line.origin_addr);
            let data = line.data.clone();
            self.memory.write_block(origin, &data)?;
            self.sets[set_index][way].dirty = false;
        }
        Ok(())
    }

    fn install(&mut self, set_index: usize, way: usize, tag: usize, data: Vec<u32>, dirty: bool, origin: Addr) {
        let line = &mut self.sets[set_index][way];
        line.valid = true;
        line.tag = tag;
        line.data = data;
        line.dirty = dirty;
        line.origin_addr = origin.inner();
        self.touch(set_index, way);
    }

    /// Reads the word at `addr` through the cache. A miss fetches the whole
    /// containing block, evicting (and flushing, under write-back) the LRU
    /// victim of the addressed set.
    pub fn read(&mut self, addr: Addr) -> Result<AccessOutcome> {
        let fields = self.decompose(addr);
        if let Some(way) = self.find_hit_way(fields.set_index, fields.tag) {
            self.hits += 1;
            let value = self.sets[fields.set_index][way].data[fields.block_offset];
            self.touch(fields.set_index, way);
            return Ok(AccessOutcome {
                hit: true,
                value: Some(value),
                placement: self.placement_of(fields, way),
            });
        }

        self.misses += 1;
        let origin = self.block_start(addr);
        let way = self.victim_way(fields.set_index);
        if self.config.write_policy == WritePolicy::WriteBack {
            self.flush_if_dirty(fields.set_index, way)?;
        }
        let block = self.memory.read_block(origin, self.config.block_size_words)?;
        let value = block[fields.block_offset];
        self.install(fields.set_index, way, fields.tag, block, false, origin);
        Ok(AccessOutcome {
            hit: false,
            value: Some(value),
            placement: self.placement_of(fields, way),
        })
    }

    /// Writes the word at `addr` through the cache.
    ///
    /// On a hit the resident word is updated; write-through also stores it to
    /// memory immediately, write-back only marks the line dirty. On a miss,
    /// write-through stores straight to memory without filling the cache,
    /// while write-back allocates: fetch the block, patch the word, install
    /// the line dirty. The asymmetry is the textbook convention and is kept
    /// deliberately.
    pub fn write(&mut self, addr: Addr, value: u32) -> Result<AccessOutcome> {
        let fields = self.decompose(addr);
        if let Some(way) = self.find_hit_way(fields.set_index, fields.tag) {
            self.hits += 1;
            self.sets[fields.set_index][way].data[fields.block_offset] = value;
            match self.config.write_policy {
                WritePolicy::WriteBack => self.sets[fields.set_index][way].dirty = true,
                WritePolicy::WriteThrough => self.memory.write(addr, value)?,
            }
            self.touch(fields.set_index, way);
            return Ok(AccessOutcome {
                hit: true,
                value: None,
                placement: self.placement_of(fields, way),
            });
        }

        self.misses += 1;
        let way = match self.config.write_policy {
            WritePolicy::WriteThrough => {
                // No write-allocate: memory takes the word, the cache stays
                // untouched, so there is no meaningful way to report.
                self.memory.write(addr, value)?;
                0
            }
            WritePolicy::WriteBack => {
                let origin = self.block_start(addr);
                let mut block = self.memory.read_block(origin, self.config.block_size_words)?;
                block[fields.block_offset] = value;
                let way = self.victim_way(fields.set_index);
                self.flush_if_dirty(fields.set_index, way)?;
                self.install(fields.set_index, way, fields.tag, block, true, origin);
                way
            }
        };
        Ok(AccessOutcome {
            hit: false,
            value: None,
            placement: self.placement_of(fields, way),
        })
    }

    fn placement_of(&self, fields: AddressFields, way: usize) -> Placement {
        Placement {
            set_index: fields.set_index,
            way,
            tag: fields.tag,
            block_offset: fields.block_offset,
        }
    }

    /// Per-set per-way view of the cache contents.
    pub fn snapshot(&self) -> Vec<Vec<LineSnapshot>> {
        self.sets
            .iter()
            .map(|set| {
                set.iter()
                    .map(|line| LineSnapshot {
                        valid: line.valid,
                        tag: line.tag,
                        data: line.data.clone(),
                        dirty: line.dirty,
                        recency: line.recency,
                    })
                    .collect()
            })
            .collect()
    }

    pub fn statistics(&self) -> Statistics {
        let total = self.hits + self.misses;
        let hit_rate_percent = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        };
        Statistics {
            hits: self.hits,
            misses: self.misses,
            total,
            hit_rate_percent,
        }
    }

    /// Invalidates every line and zeroes the hit/miss counters. The backing
    /// memory is not touched; reset it separately if needed.
    pub fn reset(&mut self) {
        for set in &mut self.sets {
            for line in set {
                *line = CacheLine::invalid(self.config.block_size_words);
            }
        }
        self.hits = 0;
        self.misses = 0;
    }
}

#[cfg(feature = "stat")]
impl crate::stat::AddStats for Cache {
    fn add_stats(&self, buf: &mut crate::stat::Stats) {
        buf.push(Box::new(self.statistics()));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::{Stat, StatView};

    use super::Statistics;

    impl Stat for Statistics {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(StatisticsView { stat: self })
        }
    }

    struct StatisticsView<'a> {
        stat: &'a Statistics,
    }

    impl StatView for StatisticsView<'_> {
        fn header(&self) -> &'static str {
            "cache accesses"
        }
        fn width(&self) -> usize {
            30
        }
    }

    impl fmt::Display for StatisticsView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "  {:>8}: {:>10}", "hits", self.stat.hits)?;
            writeln!(f, "  {:>8}: {:>10}", "misses", self.stat.misses)?;
            writeln!(f, "  {:>8}: {:>10}", "total", self.stat.total)?;
            let rate = format!("{:.1} %", self.stat.hit_rate_percent);
            writeln!(f, "  {:>8}: {rate:>10}", "hit rate")
        }
    }
}
