// Licensed under the Apache-2.0 license

//! Write-protected region (WPR2) state and the boot descriptors handed
//! to the RISC-V core: the WPR metadata block describing where the
//! firmware lives in system memory and how to lay out the protected
//! region, and the libos arguments naming the message queues.

use gsp_config::ChipConfig;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::GpuDevice;

pub const GSP_FW_WPR_META_MAGIC: u32 = 0x5750_5232; // "WPR2"

/// Carve-out the GSP firmware uses as its heap inside WPR2.
pub const GSP_FW_HEAP_SIZE: u64 = 0x810_0000;

/// FRTS carve-out size in bytes.
pub const FRTS_SIZE: u64 = 0x10_0000;

/// An active WPR2 region, byte bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wpr2Region {
    pub lo: u64,
    pub hi: u64,
}

const WPR2_HI_ENABLED: u32 = 1 << 31;

/// Read the WPR2 bound registers. `None` when the region is not armed.
/// Register values are 4 KiB page numbers; the high bound's top bit is
/// the enable flag.
pub fn read_wpr2(dev: &mut impl GpuDevice, cfg: &ChipConfig) -> Option<Wpr2Region> {
    let hi = dev.read_register(cfg.wpr2_addr_hi);
    if hi & WPR2_HI_ENABLED == 0 {
        return None;
    }
    let lo = dev.read_register(cfg.wpr2_addr_lo);
    Some(Wpr2Region {
        lo: u64::from(lo) << 12,
        hi: u64::from(hi & !WPR2_HI_ENABLED) << 12,
    })
}

/// FRTS error code from the VBIOS scratch register's upper half.
pub fn frts_error_code(dev: &mut impl GpuDevice, cfg: &ChipConfig) -> u16 {
    (dev.read_register(cfg.vbios_scratch_0e) >> 16) as u16
}

/// WPR metadata block read by the RISC-V boot ROM. 144-byte layout.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct GspFwWprMeta {
    pub magic: u32,

    pub bootloader_code_offset: u32,
    pub bootloader_code_size: u32,
    pub bootloader_data_offset: u32,
    pub bootloader_data_size: u32,
    pub bootloader_manifest_offset: u32,

    pub sysmem_addr_of_radix3_elf: u64,
    pub size_of_radix3_elf: u64,

    pub sysmem_addr_of_bootloader: u64,
    pub size_of_bootloader: u64,

    pub sysmem_addr_of_signature: u64,
    pub size_of_signature: u64,

    pub gsp_fw_heap_virt_addr: u64,
    pub gsp_fw_heap_size: u64,
    pub gsp_fw_offset: u64,

    pub boot_bin_virt_addr: u64,
    pub boot_bin_size: u64,

    pub frts_offset: u64,
    pub frts_size: u64,

    pub gsp_fw_wpr_end: u64,

    pub fw_heap_enabled: u32,
    pub partition_rpc: u32,
}

/// Libos init arguments; the command/status queue offsets are relative
/// to the shared queue allocation.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct GspLibosInitArgs {
    pub dmem_addr: u64,
    pub gsp_fw_wpr_meta: u64,
    pub cmd_queue_offset: u64,
    pub stat_queue_offset: u64,
    pub queue_size: u64,
}

/// Bootloader section placement inside the boot binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootloaderSections {
    pub code_offset: u32,
    pub code_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub manifest_offset: u32,
}

/// Everything the metadata builder needs to know about where the
/// staged firmware pieces live.
#[derive(Debug, Clone, Copy)]
pub struct WprMetaParams {
    pub radix3_root: u64,
    pub elf_size: u64,
    pub bootloader_addr: u64,
    pub bootloader_size: u64,
    pub sections: BootloaderSections,
    pub signature_addr: u64,
    pub signature_size: u64,
    /// Active FRTS carve-out, from [`read_wpr2`].
    pub frts_offset: u64,
    pub frts_size: u64,
}

fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Lay out WPR2 top-down from the FRTS carve-out: the boot binary sits
/// directly below FRTS, the firmware image below that, and the heap at
/// the bottom.
pub fn build_wpr_meta(p: &WprMetaParams) -> GspFwWprMeta {
    let gsp_fw_wpr_end = p.frts_offset + p.frts_size;
    let boot_bin_virt_addr = align_down(p.frts_offset - p.bootloader_size, 0x1000);
    let gsp_fw_offset = align_down(boot_bin_virt_addr - p.elf_size, 0x10000);
    let gsp_fw_heap_virt_addr = gsp_fw_offset - GSP_FW_HEAP_SIZE;

    let meta = GspFwWprMeta {
        magic: GSP_FW_WPR_META_MAGIC,
        bootloader_code_offset: p.sections.code_offset,
        bootloader_code_size: p.sections.code_size,
        bootloader_data_offset: p.sections.data_offset,
        bootloader_data_size: p.sections.data_size,
        bootloader_manifest_offset: p.sections.manifest_offset,
        sysmem_addr_of_radix3_elf: p.radix3_root,
        size_of_radix3_elf: p.elf_size,
        sysmem_addr_of_bootloader: p.bootloader_addr,
        size_of_bootloader: p.bootloader_size,
        sysmem_addr_of_signature: p.signature_addr,
        size_of_signature: p.signature_size,
        gsp_fw_heap_virt_addr,
        gsp_fw_heap_size: GSP_FW_HEAP_SIZE,
        gsp_fw_offset,
        boot_bin_virt_addr,
        boot_bin_size: p.bootloader_size,
        frts_offset: p.frts_offset,
        frts_size: p.frts_size,
        gsp_fw_wpr_end,
        fw_heap_enabled: 1,
        partition_rpc: 0,
    };
    debug!(
        "WPR meta: fw {:#x}, boot bin {:#x}, end {:#x}",
        meta.gsp_fw_offset, meta.boot_bin_virt_addr, meta.gsp_fw_wpr_end
    );
    meta
}
