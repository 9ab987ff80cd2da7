// Licensed under the Apache-2.0 license

//! Radix3 page tables describing scattered firmware pages to the boot
//! ROM DMA engine. Three levels of 4 KiB pages, 512 eight-byte entries
//! each: one root page, L1 pages pointing at L2 pages, and L2 leaves
//! naming the data pages in order.

use log::debug;

use crate::device::{DmaBuffer, GpuDevice};
use crate::{BringupError, Result};

pub const RADIX3_PAGE_SIZE: usize = 4096;
pub const RADIX3_ENTRIES_PER_PAGE: usize = RADIX3_PAGE_SIZE / 8;

/// Every entry, leaves included, carries the valid bit in bit 0.
const RADIX3_ENTRY_VALID: u64 = 1;

/// Firmware scattered across individually allocated 4 KiB pages.
pub struct StagedFirmware {
    pub pages: Vec<DmaBuffer>,
    pub size: u64,
}

impl StagedFirmware {
    pub fn page_addrs(&self) -> Vec<u64> {
        self.pages.iter().map(|p| p.phys()).collect()
    }
}

/// Copy `data` into per-page DMA allocations. Pages are deliberately
/// separate allocations; contiguity is the page table's job, not the
/// allocator's.
pub fn stage_firmware(dev: &mut impl GpuDevice, data: &[u8]) -> Result<StagedFirmware> {
    let mut pages = Vec::with_capacity(data.len().div_ceil(RADIX3_PAGE_SIZE));
    for chunk in data.chunks(RADIX3_PAGE_SIZE) {
        let mut page = dev
            .allocate_dma(RADIX3_PAGE_SIZE)
            .map_err(|_| BringupError::DmaAllocFailed {
                size: RADIX3_PAGE_SIZE,
            })?;
        page.write_at(0, chunk)?;
        dev.dma_sync(&page);
        pages.push(page);
    }
    Ok(StagedFirmware {
        pages,
        size: data.len() as u64,
    })
}

/// A built page table. The single allocation holds, in order, the root
/// page, the L1 pages, and the L2 pages.
pub struct Radix3 {
    pub table: DmaBuffer,
    pub num_l1: usize,
    pub num_l2: usize,
}

impl Radix3 {
    pub fn root_phys(&self) -> u64 {
        self.table.phys()
    }
}

/// Level page counts for `num_pages` data pages.
pub fn radix3_levels(num_pages: usize) -> (usize, usize) {
    let num_l2 = num_pages.div_ceil(RADIX3_ENTRIES_PER_PAGE);
    let num_l1 = num_l2.div_ceil(RADIX3_ENTRIES_PER_PAGE);
    (num_l1, num_l2)
}

/// Build the three-level table over the given data page addresses.
pub fn build_radix3(dev: &mut impl GpuDevice, data_pages: &[u64]) -> Result<Radix3> {
    if data_pages.is_empty() {
        return Err(BringupError::Usage("radix3 over zero pages"));
    }
    let (num_l1, num_l2) = radix3_levels(data_pages.len());
    if num_l1 > RADIX3_ENTRIES_PER_PAGE {
        return Err(BringupError::Usage("firmware exceeds one root page"));
    }

    let table_pages = 1 + num_l1 + num_l2;
    let size = table_pages * RADIX3_PAGE_SIZE;
    let mut table = dev
        .allocate_dma(size)
        .map_err(|_| BringupError::DmaAllocFailed { size })?;
    let base = table.phys();

    let l1_first = 1;
    let l2_first = 1 + num_l1;
    let page_phys = |index: usize| base + (index * RADIX3_PAGE_SIZE) as u64;

    for i in 0..num_l1 {
        table.write_u64_at(i * 8, page_phys(l1_first + i) | RADIX3_ENTRY_VALID)?;
    }
    for j in 0..num_l2 {
        let l1_page = l1_first + j / RADIX3_ENTRIES_PER_PAGE;
        let slot = j % RADIX3_ENTRIES_PER_PAGE;
        table.write_u64_at(
            l1_page * RADIX3_PAGE_SIZE + slot * 8,
            page_phys(l2_first + j) | RADIX3_ENTRY_VALID,
        )?;
    }
    for (k, &phys) in data_pages.iter().enumerate() {
        let l2_page = l2_first + k / RADIX3_ENTRIES_PER_PAGE;
        let slot = k % RADIX3_ENTRIES_PER_PAGE;
        table.write_u64_at(
            l2_page * RADIX3_PAGE_SIZE + slot * 8,
            phys | RADIX3_ENTRY_VALID,
        )?;
    }
    dev.dma_sync(&table);

    debug!(
        "radix3: {} data pages -> {} L2, {} L1, root {:#x}",
        data_pages.len(),
        num_l2,
        num_l1,
        base
    );
    Ok(Radix3 {
        table,
        num_l1,
        num_l2,
    })
}
