// Licensed under the Apache-2.0 license

//! BAR0 register addresses shared across the supported chip families.
//!
//! Falcon-relative offsets (CPUCTL, IMEMC, ...) live with the Falcon
//! wrapper in the bring-up crate; only absolute addresses appear here.

/// Boot-0 strap/architecture register.
pub const NV_PMC_BOOT_0: u32 = 0x0000_0000;

/// GSP Falcon aperture.
pub const NV_PGSP_FALCON_BASE: u32 = 0x0011_0000;

/// SEC2 Falcon aperture.
pub const NV_PSEC_FALCON_BASE: u32 = 0x0084_0000;

/// Protected-region 2 bounds. Bit 31 of HI is the enable bit; both fields
/// are in 4 KiB units shifted per the MMU's alignment.
pub const NV_PFB_PRI_MMU_WPR2_ADDR_LO: u32 = 0x001F_A820;
pub const NV_PFB_PRI_MMU_WPR2_ADDR_HI: u32 = 0x001F_A824;

/// VBIOS scratch 0E; FRTS leaves its error code in bits 31:16.
pub const NV_PBUS_VBIOS_SCRATCH_0E: u32 = 0x0000_109C;

/// Anti-rollback fuse banks, one 16-word bank per engine, one word per
/// ucode id.
pub const NV_FUSE_OPT_FPF_NVDEC_UCODE1_VERSION: u32 = 0x0082_4100;
pub const NV_FUSE_OPT_FPF_SEC2_UCODE1_VERSION: u32 = 0x0082_4140;
pub const NV_FUSE_OPT_FPF_GSP_UCODE1_VERSION: u32 = 0x0082_41C0;

/// Number of per-engine ucode version fuse words.
pub const NV_FUSE_OPT_FPF_SIZE: u8 = 16;

/// GSP message-queue doorbells, 8 bytes apart per queue index.
pub const NV_PGSP_QUEUE_HEAD_BASE: u32 = 0x0011_0C00;
pub const NV_PGSP_QUEUE_TAIL_BASE: u32 = 0x0011_0C80;
