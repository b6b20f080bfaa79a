//! Number Pools
//!
//! Allocators for exclusively owned numbers such as DRBD minor numbers.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use tracing::trace;

/// Default range for automatically allocated minor numbers
pub const DEFAULT_MINOR_RANGE: RangeInclusive<u32> = 1000..=49999;

/// Allocator of numbers from a fixed inclusive range
pub trait NumberPool: Send + Sync {
    fn range(&self) -> RangeInclusive<u32>;

    /// Reserve a specific number
    fn allocate(&self, number: u32) -> Result<()>;

    /// Release a number. Releasing a free number is a no-op.
    fn deallocate(&self, number: u32);

    /// Reserve the lowest free number
    fn auto_allocate(&self) -> Result<u32>;

    fn is_allocated(&self, number: u32) -> bool;

    fn allocated_count(&self) -> usize;
}

// =============================================================================
// Bitmap Pool
// =============================================================================

const WORD_BITS: u32 = 64;

/// Bitmap backed [`NumberPool`]
#[derive(Debug)]
pub struct BitmapPool {
    start: u32,
    end: u32,
    words: Mutex<Vec<u64>>,
}

impl BitmapPool {
    pub fn new(range: RangeInclusive<u32>) -> Result<Self> {
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            return Err(Error::Configuration(format!(
                "number pool range {}..={} is empty",
                start, end
            )));
        }
        let size = (end - start) as usize + 1;
        let words = size.div_ceil(WORD_BITS as usize);
        Ok(Self {
            start,
            end,
            words: Mutex::new(vec![0; words]),
        })
    }

    fn position(&self, number: u32) -> Result<(usize, u64)> {
        if number < self.start || number > self.end {
            return Err(Error::ValueOutOfRange {
                what: "pool number",
                value: number as i64,
                min: self.start as i64,
                max: self.end as i64,
            });
        }
        let offset = number - self.start;
        Ok(((offset / WORD_BITS) as usize, 1u64 << (offset % WORD_BITS)))
    }
}

impl NumberPool for BitmapPool {
    fn range(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    fn allocate(&self, number: u32) -> Result<()> {
        let (word, bit) = self.position(number)?;
        let mut words = self.words.lock();
        if words[word] & bit != 0 {
            return Err(Error::NumberInUse { number });
        }
        words[word] |= bit;
        trace!(number, "Allocated number");
        Ok(())
    }

    fn deallocate(&self, number: u32) {
        if let Ok((word, bit)) = self.position(number) {
            self.words.lock()[word] &= !bit;
            trace!(number, "Released number");
        }
    }

    fn auto_allocate(&self) -> Result<u32> {
        let mut words = self.words.lock();
        for (idx, word) in words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let offset = idx as u32 * WORD_BITS + (!*word).trailing_zeros();
            let number = self.start + offset;
            if number > self.end {
                break;
            }
            *word |= 1u64 << (offset % WORD_BITS);
            trace!(number, "Auto-allocated number");
            return Ok(number);
        }
        Err(Error::PoolExhausted {
            start: self.start,
            end: self.end,
        })
    }

    fn is_allocated(&self, number: u32) -> bool {
        self.position(number)
            .map(|(word, bit)| self.words.lock()[word] & bit != 0)
            .unwrap_or(false)
    }

    fn allocated_count(&self) -> usize {
        self.words
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }
}
