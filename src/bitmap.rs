//! Allocation bitmaps (inode table and data blocks).
//!
//! Bit `n` lives in byte `n / 8` (mask `1 << (n % 8)`) of the bitmap region;
//! set => in use.

use crate::Result;
use crate::block_cache::BlockCache;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Bitmap {
    start: u32,    // First block of the region.
    num_bits: u32, // Bits past this are padding and never handed out.
}

impl Bitmap {
    pub fn new(start: u32, num_bits: u32) -> Self {
        Self { start, num_bits }
    }

    fn locate(&self, bit: u32, block_size: usize) -> (u32, usize, u8) {
        let bits_per_block = (block_size * 8) as u32;
        (
            self.start + bit / bits_per_block,
            ((bit % bits_per_block) / 8) as usize,
            1 << (bit % 8),
        )
    }

    pub fn get(&self, cache: &mut BlockCache, bit: u32) -> Result<bool> {
        debug_assert!(bit < self.num_bits);
        let (block_no, byte, mask) = self.locate(bit, cache.block_size());
        Ok(cache.read(block_no)?[byte] & mask != 0)
    }

    /// Returns the previous value. Writes only if the bit changes.
    pub fn set(&self, cache: &mut BlockCache, bit: u32, value: bool) -> Result<bool> {
        debug_assert!(bit < self.num_bits);
        let (block_no, byte, mask) = self.locate(bit, cache.block_size());
        let prev = cache.read(block_no)?[byte] & mask != 0;
        if prev != value {
            cache.update(block_no, |data| {
                if value {
                    data[byte] |= mask;
                } else {
                    data[byte] &= !mask;
                }
            })?;
        }

        Ok(prev)
    }

    /// First-fit scan.
    pub fn find_first_clear(&self, cache: &mut BlockCache) -> Result<Option<u32>> {
        let bits_per_block = (cache.block_size() * 8) as u32;
        let num_blocks = self.num_bits.div_ceil(bits_per_block);

        for block_idx in 0..num_blocks {
            let data = cache.read(self.start + block_idx)?;
            for (byte_idx, byte) in data.iter().enumerate() {
                if *byte == 0xff {
                    continue;
                }
                let first = block_idx * bits_per_block + (byte_idx as u32) * 8;
                if first >= self.num_bits {
                    return Ok(None);
                }
                let bit = byte.trailing_ones();
                if first + bit >= self.num_bits {
                    return Ok(None);
                }
                return Ok(Some(first + bit));
            }
        }

        Ok(None)
    }

    pub fn count_set(&self, cache: &mut BlockCache) -> Result<u32> {
        let bits_per_block = (cache.block_size() * 8) as u32;
        let num_blocks = self.num_bits.div_ceil(bits_per_block);

        let mut count = 0;
        for block_idx in 0..num_blocks {
            let data = cache.read(self.start + block_idx)?;
            let first = block_idx * bits_per_block;
            let bits = (self.num_bits - first).min(bits_per_block) as usize;

            count += data[..(bits / 8)]
                .iter()
                .map(|b| b.count_ones())
                .sum::<u32>();
            if bits % 8 != 0 {
                let mask = (1_u8 << (bits % 8)) - 1;
                count += (data[bits / 8] & mask).count_ones();
            }
        }

        Ok(count)
    }
}
