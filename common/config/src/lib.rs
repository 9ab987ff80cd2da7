/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Chip-generation capability tables for the GPU security processor
    bring-up pipeline. Register addresses, fuse banks, and poll budgets
    that vary per chip family live here so the core never hard-codes them.

--*/

pub mod regs;

use core::time::Duration;

/// Chip families covered by the capability tables. One generation's
/// register offsets serve as the concrete example; the bring-up core only
/// ever consults the table, never the generation directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGeneration {
    /// GA10x
    Ampere,
    /// AD10x
    Ada,
}

/// Security engines that can host a Falcon core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalconEngine {
    Gsp,
    Sec2,
}

/// Per-generation capability table consumed by the bring-up core.
#[derive(Debug, Clone, Copy)]
pub struct ChipConfig {
    pub generation: ChipGeneration,

    /// Falcon register apertures.
    pub gsp_falcon_base: u32,
    pub sec2_falcon_base: u32,

    /// Anti-rollback fuse banks, 16 words each, one per engine.
    pub fuse_gsp_ucode_version_base: u32,
    pub fuse_sec2_ucode_version_base: u32,
    pub fuse_nvdec_ucode_version_base: u32,

    /// Protected-region bound registers.
    pub wpr2_addr_lo: u32,
    pub wpr2_addr_hi: u32,

    /// Scratch register carrying the FRTS result code in its upper half.
    pub vbios_scratch_0e: u32,

    /// Boot-0 strap register, mirrored into the Falcon RM register.
    pub pmc_boot_0: u32,

    /// Historical ROM signature locations probed before the stride scan.
    pub known_rom_offsets: &'static [usize],

    /// Poll budgets for the boot sequencer.
    pub scrub_timeout: Duration,
    pub core_select_timeout: Duration,
    pub dma_idle_timeout: Duration,
    pub halt_timeout: Duration,
    pub riscv_active_timeout: Duration,
}

impl ChipConfig {
    pub const fn falcon_base(&self, engine: FalconEngine) -> u32 {
        match engine {
            FalconEngine::Gsp => self.gsp_falcon_base,
            FalconEngine::Sec2 => self.sec2_falcon_base,
        }
    }

    /// Head register of GSP queue `idx` (0 = command, 1 = status).
    pub const fn gsp_queue_head(&self, idx: u32) -> u32 {
        regs::NV_PGSP_QUEUE_HEAD_BASE + idx * 8
    }

    /// Tail register of GSP queue `idx`.
    pub const fn gsp_queue_tail(&self, idx: u32) -> u32 {
        regs::NV_PGSP_QUEUE_TAIL_BASE + idx * 8
    }
}

/// AD10x capability table. GA10x shares every offset listed here; the
/// generations differ only in firmware selection, which is out of scope
/// for the capability table.
pub const ADA_CONFIG: ChipConfig = ChipConfig {
    generation: ChipGeneration::Ada,
    gsp_falcon_base: regs::NV_PGSP_FALCON_BASE,
    sec2_falcon_base: regs::NV_PSEC_FALCON_BASE,
    fuse_gsp_ucode_version_base: regs::NV_FUSE_OPT_FPF_GSP_UCODE1_VERSION,
    fuse_sec2_ucode_version_base: regs::NV_FUSE_OPT_FPF_SEC2_UCODE1_VERSION,
    fuse_nvdec_ucode_version_base: regs::NV_FUSE_OPT_FPF_NVDEC_UCODE1_VERSION,
    wpr2_addr_lo: regs::NV_PFB_PRI_MMU_WPR2_ADDR_LO,
    wpr2_addr_hi: regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI,
    vbios_scratch_0e: regs::NV_PBUS_VBIOS_SCRATCH_0E,
    pmc_boot_0: regs::NV_PMC_BOOT_0,
    known_rom_offsets: &[0x9400, 0x19000, 0xFC00],
    scrub_timeout: Duration::from_millis(50),
    core_select_timeout: Duration::from_millis(10),
    dma_idle_timeout: Duration::from_millis(2),
    halt_timeout: Duration::from_secs(2),
    riscv_active_timeout: Duration::from_secs(5),
};

pub const AMPERE_CONFIG: ChipConfig = ChipConfig {
    generation: ChipGeneration::Ampere,
    ..ADA_CONFIG
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_registers_are_interleaved_by_eight() {
        assert_eq!(ADA_CONFIG.gsp_queue_head(0), 0x0011_0C00);
        assert_eq!(ADA_CONFIG.gsp_queue_head(1), 0x0011_0C08);
        assert_eq!(ADA_CONFIG.gsp_queue_tail(0), 0x0011_0C80);
        assert_eq!(ADA_CONFIG.gsp_queue_tail(1), 0x0011_0C88);
    }

    #[test]
    fn fuse_banks_are_distinct() {
        let c = ADA_CONFIG;
        assert_ne!(
            c.fuse_gsp_ucode_version_base,
            c.fuse_sec2_ucode_version_base
        );
        assert_ne!(
            c.fuse_sec2_ucode_version_base,
            c.fuse_nvdec_ucode_version_base
        );
    }
}
