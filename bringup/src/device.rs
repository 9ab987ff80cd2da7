// Licensed under the Apache-2.0 license

use crate::{BringupError, Result};

/// A contiguous DMA-capable allocation: host-visible bytes paired with
/// the bus address the device uses to reach them.
#[derive(Debug)]
pub struct DmaBuffer {
    data: Vec<u8>,
    phys: u64,
}

impl DmaBuffer {
    pub fn new(phys: u64, size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            phys,
        }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(BringupError::Usage("write past end of DMA buffer"))?;
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }
}

/// Capabilities the bring-up pipeline needs from its environment:
/// BAR0 register access, a monotonic clock, and DMA-capable memory.
/// Register writes are assumed posted in order; reads are assumed to
/// flush prior writes, matching MMIO semantics on the real part.
pub trait GpuDevice {
    fn read_register(&mut self, offset: u32) -> u32;
    fn write_register(&mut self, offset: u32, value: u32);

    /// Monotonic time in microseconds. Only differences are meaningful.
    fn ticks_us(&mut self) -> u64;

    /// Yield for at least `us` microseconds between poll attempts.
    fn sleep_us(&mut self, us: u64);

    /// Allocate `size` bytes of device-reachable memory. Allocations
    /// need not be adjacent to each other; callers that need contiguity
    /// ask for it in a single allocation.
    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer>;

    /// Make host writes to a DMA buffer visible to the device. A no-op
    /// on coherent systems.
    fn dma_sync(&mut self, _buf: &DmaBuffer) {}

    /// Read back device writes into the host view of a DMA buffer.
    fn dma_invalidate(&mut self, _buf: &mut DmaBuffer) {}
}
