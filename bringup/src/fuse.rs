// Licensed under the Apache-2.0 license

//! Anti-rollback signature selection. Each engine has a bank of 16
//! fuse words, one per ucode id; the fuse value is a unary version
//! counter whose highest set bit names the minimum ucode version the
//! chip still accepts.

use gsp_config::ChipConfig;
use gsp_vbios::FalconUcodeDescV3;
use log::{debug, warn};

use crate::device::GpuDevice;
use crate::{BringupError, Result};

const ENGINE_ID_MASK_SEC2: u16 = 0x0001;
const ENGINE_ID_MASK_NVDEC: u16 = 0x0004;
const ENGINE_ID_MASK_GSP: u16 = 0x0400;

/// Outcome of matching a ucode blob against the chip's fuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseSelection {
    /// Fused minimum ucode version (1-based).
    pub version: u32,
    /// Index of the matching signature within the blob's signature array.
    pub index: usize,
}

fn fuse_bank(cfg: &ChipConfig, engine_id_mask: u16) -> Result<u32> {
    match engine_id_mask {
        ENGINE_ID_MASK_SEC2 => Ok(cfg.fuse_sec2_ucode_version_base),
        ENGINE_ID_MASK_NVDEC => Ok(cfg.fuse_nvdec_ucode_version_base),
        ENGINE_ID_MASK_GSP => Ok(cfg.fuse_gsp_ucode_version_base),
        _ => Err(BringupError::Usage("unrecognized engine id mask")),
    }
}

/// Read the fuse word for this ucode and pick the signature the Boot
/// ROM will accept.
///
/// The signature array is dense: it only holds signatures for versions
/// whose bit is set in `signature_versions`, in ascending version
/// order. The index is therefore the population count of the mask bits
/// below the fused version's bit.
pub fn select_signature(
    dev: &mut impl GpuDevice,
    cfg: &ChipConfig,
    desc: &FalconUcodeDescV3,
) -> Result<FuseSelection> {
    let bank = fuse_bank(cfg, desc.engine_id_mask)?;
    let reg = bank + 4 * (u32::from(desc.ucode_id) - 1);
    let fuse = dev.read_register(reg);

    // An unblown fuse bank means a factory-fresh part; hardware treats
    // that as version 1.
    let version = if fuse == 0 {
        warn!(
            "ucode version fuse {:#x} for ucode id {} is unblown, assuming version 1",
            reg, desc.ucode_id
        );
        1
    } else {
        u32::BITS - fuse.leading_zeros()
    };

    // The mask is 16 bits wide; a fuse with higher bits set names a
    // version no blob can carry. Widen before shifting so it reports
    // instead of overflowing.
    let version_bit = 1u32 << (version - 1);
    if u32::from(desc.signature_versions) & version_bit == 0 {
        return Err(BringupError::SignatureUnavailable {
            fuse_version: version,
            signature_versions: desc.signature_versions,
        });
    }

    let index = (u32::from(desc.signature_versions) & (version_bit - 1)).count_ones() as usize;
    debug!(
        "fuse {:#x}={:#x}: version {}, signature index {}",
        reg, fuse, version, index
    );
    Ok(FuseSelection { version, index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::StubDevice;
    use gsp_config::ADA_CONFIG;
    use zerocopy::FromZeros;

    fn desc(ucode_id: u8, signature_versions: u16) -> FalconUcodeDescV3 {
        let mut d = FalconUcodeDescV3::new_zeroed();
        d.engine_id_mask = ENGINE_ID_MASK_GSP;
        d.ucode_id = ucode_id;
        d.signature_versions = signature_versions;
        d
    }

    #[test]
    fn dense_index_skips_unused_version_slots() {
        let mut dev = StubDevice::new();
        // Fuse value 0b100 -> version 3.
        dev.regs
            .insert(ADA_CONFIG.fuse_gsp_ucode_version_base + 4, 0b100);
        // Mask has versions 1 and 3; version 3's signature is at index 1.
        let sel = select_signature(&mut dev, &ADA_CONFIG, &desc(2, 0b101)).unwrap();
        assert_eq!(sel, FuseSelection { version: 3, index: 1 });
    }

    #[test]
    fn unblown_fuse_falls_back_to_version_one() {
        let mut dev = StubDevice::new();
        let sel = select_signature(&mut dev, &ADA_CONFIG, &desc(1, 0b1)).unwrap();
        assert_eq!(sel, FuseSelection { version: 1, index: 0 });
    }

    #[test]
    fn missing_version_is_reported_with_evidence() {
        let mut dev = StubDevice::new();
        dev.regs
            .insert(ADA_CONFIG.fuse_gsp_ucode_version_base, 0b1000);
        let err = select_signature(&mut dev, &ADA_CONFIG, &desc(1, 0b0111)).unwrap_err();
        assert_eq!(
            err,
            BringupError::SignatureUnavailable {
                fuse_version: 4,
                signature_versions: 0b0111,
            }
        );
    }

    #[test]
    fn fuse_version_past_the_mask_width_is_unavailable() {
        let mut dev = StubDevice::new();
        // Version 17 cannot appear in a 16-bit version mask.
        dev.regs
            .insert(ADA_CONFIG.fuse_gsp_ucode_version_base, 1 << 16);
        let err = select_signature(&mut dev, &ADA_CONFIG, &desc(1, 0xFFFF)).unwrap_err();
        assert_eq!(
            err,
            BringupError::SignatureUnavailable {
                fuse_version: 17,
                signature_versions: 0xFFFF,
            }
        );
    }

    #[test]
    fn unknown_engine_mask_is_rejected() {
        let mut dev = StubDevice::new();
        let mut d = desc(1, 1);
        d.engine_id_mask = 0x0002;
        assert!(select_signature(&mut dev, &ADA_CONFIG, &d).is_err());
    }
}
