//! In-memory NOR flash simulator.
//!
//! Erased bytes read as `0xFF`; `program` can only clear bits and fails if
//! asked to set a bit that is currently clear. Clones share the same storage,
//! so a copy kept outside the filesystem can inspect (or damage) what the
//! filesystem wrote.

use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::BlockDevice;

const ERASED: u8 = 0xff;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub syncs: u64,
}

struct Inner {
    bytes: Vec<u8>,
    stats: DeviceStats,
    // Number of programs/erases that succeed before the next ones fail.
    write_budget: Option<u64>,
    write_failures: u64,
}

#[derive(Clone)]
pub struct RamBlockDevice {
    inner: Arc<Mutex<Inner>>,
    block_size: u32,
    num_blocks: u32,
}

impl RamBlockDevice {
    /// Creates a device with every block erased.
    pub fn new(block_size: u32, num_blocks: u32) -> Self {
        let size = block_size as usize * num_blocks as usize;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bytes: vec![ERASED; size],
                stats: DeviceStats::default(),
                write_budget: None,
                write_failures: 0,
            })),
            block_size,
            num_blocks,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn stats(&self) -> DeviceStats {
        self.lock().stats
    }

    /// A copy of the whole device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Direct access to the raw storage, bypassing flash rules.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock().bytes)
    }

    /// Let `count` more programs/erases succeed, then fail exactly one.
    /// Reads are not affected.
    pub fn fail_after_writes(&self, count: u64) {
        self.fail_writes(count, 1);
    }

    /// Let `count` more programs/erases succeed, then fail the next
    /// `failures` of them.
    pub fn fail_writes(&self, count: u64, failures: u64) {
        let mut inner = self.lock();
        inner.write_budget = (failures > 0).then_some(count);
        inner.write_failures = failures;
    }

    pub fn clear_fault(&self) {
        let mut inner = self.lock();
        inner.write_budget = None;
        inner.write_failures = 0;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain bytes behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn range(&self, block_no: u32, offset: u32, len: usize) -> std::io::Result<core::ops::Range<usize>> {
        if block_no >= self.num_blocks || offset as usize + len > self.block_size as usize {
            return Err(ErrorKind::InvalidInput.into());
        }
        let start = block_no as usize * self.block_size as usize + offset as usize;
        Ok(start..(start + len))
    }
}

impl Inner {
    fn consume_write(&mut self) -> std::io::Result<()> {
        match self.write_budget {
            Some(0) => {
                self.write_failures = self.write_failures.saturating_sub(1);
                if self.write_failures == 0 {
                    self.write_budget = None;
                }
                Err(Error::other("injected device failure"))
            }
            Some(n) => {
                self.write_budget = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn read(&mut self, block_no: u32, offset: u32, buf: &mut [u8]) -> std::io::Result<()> {
        let range = self.range(block_no, offset, buf.len())?;
        let mut inner = self.lock();
        inner.stats.reads += 1;
        buf.copy_from_slice(&inner.bytes[range]);
        Ok(())
    }

    fn program(&mut self, block_no: u32, offset: u32, buf: &[u8]) -> std::io::Result<()> {
        let range = self.range(block_no, offset, buf.len())?;
        let mut inner = self.lock();
        if inner.bytes[range.clone()]
            .iter()
            .zip(buf)
            .any(|(old, new)| new & !old != 0)
        {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "program would set bits that are not erased",
            ));
        }
        inner.consume_write()?;
        inner.stats.programs += 1;
        for (old, new) in inner.bytes[range].iter_mut().zip(buf) {
            *old &= *new;
        }
        Ok(())
    }

    fn erase(&mut self, block_no: u32) -> std::io::Result<()> {
        let range = self.range(block_no, 0, self.block_size as usize)?;
        let mut inner = self.lock();
        inner.consume_write()?;
        inner.stats.erases += 1;
        inner.bytes[range].fill(ERASED);
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.lock().stats.syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_requires_erase() {
        let mut dev = RamBlockDevice::new(128, 4);
        dev.program(1, 0, &[0x0f; 4]).unwrap();
        // Clearing more bits is fine.
        dev.program(1, 0, &[0x0e; 4]).unwrap();
        // Setting them back is not.
        assert_eq!(
            dev.program(1, 0, &[0xff; 4]).err().unwrap().kind(),
            ErrorKind::InvalidInput
        );
        dev.erase(1).unwrap();
        dev.program(1, 0, &[0xf0; 4]).unwrap();

        let mut buf = [0_u8; 4];
        dev.read(1, 0, &mut buf).unwrap();
        assert_eq!([0xf0; 4], buf);
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let mut dev = RamBlockDevice::new(128, 4);
        dev.fail_after_writes(1);
        dev.erase(0).unwrap();
        assert!(dev.erase(1).is_err());
        let mut buf = [0_u8; 1];
        dev.read(0, 0, &mut buf).unwrap();
        dev.erase(1).unwrap();
        assert_eq!(2, dev.stats().erases);

        dev.fail_after_writes(0);
        dev.clear_fault();
        dev.erase(2).unwrap();
    }

    #[test]
    fn injected_failures_in_a_row() {
        let mut dev = RamBlockDevice::new(128, 4);
        dev.fail_writes(1, 2);
        dev.erase(0).unwrap();
        assert!(dev.erase(1).is_err());
        assert!(dev.program(1, 0, &[0; 4]).is_err());
        dev.erase(1).unwrap();
        assert_eq!(2, dev.stats().erases);
    }
}
