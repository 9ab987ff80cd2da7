// Licensed under the Apache-2.0 license

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    BitTable, Cursor, Result, RomImage, UcodeLookupTable, VbiosError, APP_ID_FRTS,
    APP_ID_FWSEC_PROD, RSA3K_SIGNATURE_SIZE,
};

/// Fixed size of the V3 descriptor's on-ROM layout.
pub const FALCON_UCODE_DESC_V3_SIZE: usize = 44;

/// Load sizes above this are treated as corruption, not firmware.
const MAX_LOAD_SIZE: u32 = 0x80000;

/// Heavy-Secure falcon ucode descriptor, version 3. 44-byte on-ROM
/// layout; the signature array, IMEM, and DMEM payloads follow it in
/// that order.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FalconUcodeDescV3 {
    /// Packed version word: bit 0 = version available, bits 15:8 =
    /// descriptor version, bits 31:16 = descriptor size.
    pub vdesc: u32,
    pub stored_size: u32,
    /// DMEM offset where the selected signature gets patched in.
    pub pkc_data_offset: u32,
    /// DMEM offset of the application-interface table.
    pub interface_offset: u32,
    pub imem_phys_base: u32,
    pub imem_load_size: u32,
    pub imem_virt_base: u32,
    pub dmem_phys_base: u32,
    pub dmem_load_size: u32,
    pub engine_id_mask: u16,
    pub ucode_id: u8,
    pub signature_count: u8,
    /// Bitmask of fuse versions the signature array can satisfy.
    pub signature_versions: u16,
    pub reserved: u16,
}

impl FalconUcodeDescV3 {
    pub fn version(&self) -> u8 {
        (self.vdesc >> 8) as u8
    }

    pub fn desc_size(&self) -> usize {
        (self.vdesc >> 16) as usize
    }

    pub fn version_available(&self) -> bool {
        self.vdesc & 1 != 0
    }

    /// HS ucode enters at the IMEM virtual base.
    pub fn boot_vector(&self) -> u32 {
        self.imem_virt_base
    }

    pub fn signature_bytes(&self) -> usize {
        usize::from(self.signature_count) * RSA3K_SIGNATURE_SIZE
    }

    fn validate(&self) -> Result<()> {
        if !self.version_available() || self.version() != 3 {
            return Err(VbiosError::Format("descriptor version"));
        }
        if self.desc_size() < FALCON_UCODE_DESC_V3_SIZE {
            return Err(VbiosError::Format("descriptor size"));
        }
        if self.imem_load_size == 0 || self.imem_load_size > MAX_LOAD_SIZE {
            return Err(VbiosError::Format("IMEM load size"));
        }
        if self.dmem_load_size == 0 || self.dmem_load_size > MAX_LOAD_SIZE {
            return Err(VbiosError::Format("DMEM load size"));
        }
        if !(1..=16).contains(&self.ucode_id) {
            return Err(VbiosError::Format("ucode id"));
        }
        if self.signature_count == 0 {
            return Err(VbiosError::Format("signature count"));
        }
        let sig_end = self.pkc_data_offset as usize + RSA3K_SIGNATURE_SIZE;
        if sig_end > self.dmem_load_size as usize {
            return Err(VbiosError::Bounds {
                offset: self.pkc_data_offset as usize,
                len: RSA3K_SIGNATURE_SIZE,
                bound: self.dmem_load_size as usize,
            });
        }
        Ok(())
    }
}

/// Optional vendor wrapper preceding a descriptor. When present, the
/// stored size and the true descriptor offset come from the wrapper
/// rather than being assumed.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VendorUcodeHeader {
    /// PCI vendor id doubling as magic.
    pub vendor_id: u16,
    pub version: u16,
    pub size: u32,
    pub header_size: u32,
}

pub const VENDOR_UCODE_MAGIC: u16 = 0x10DE;

/// Extracted FWSEC firmware: the validated descriptor plus owned copies
/// of the signature array and the IMEM/DMEM payloads. DMEM is the
/// working copy later patched before loading; the ROM image itself is
/// never mutated.
#[derive(Debug, Clone)]
pub struct FwsecUcode {
    pub desc: FalconUcodeDescV3,
    pub desc_offset: usize,
    pub signatures: Vec<u8>,
    pub imem: Vec<u8>,
    pub dmem: Vec<u8>,
}

impl FwsecUcode {
    /// Decode and slice one descriptor candidate. A validation failure
    /// on an unwrapped candidate is a recoverable rejection; the caller
    /// advances to the next lookup entry.
    pub fn extract(data: &[u8], candidate_offset: usize) -> Result<Self> {
        let mut desc_offset = candidate_offset;
        let mut wrapped = false;

        let magic = Cursor::at(data, candidate_offset)?.read_u16()?;
        if magic == VENDOR_UCODE_MAGIC {
            let wrapper: VendorUcodeHeader = Cursor::at(data, candidate_offset)?.read_struct()?;
            if (1..=16).contains(&wrapper.version) {
                desc_offset = candidate_offset + wrapper.header_size as usize;
                wrapped = true;
                debug!(
                    "vendor wrapper v{} at {:#x}, descriptor at {:#x}",
                    wrapper.version, candidate_offset, desc_offset
                );
            }
        }

        let desc: FalconUcodeDescV3 = Cursor::at(data, desc_offset)?.read_struct()?;
        desc.validate().map_err(|e| {
            if wrapped {
                // A wrapped candidate was explicitly marked; failing its
                // descriptor is corruption, not a near-miss.
                warn!("wrapped descriptor at {:#x} invalid: {}", desc_offset, e);
            }
            e
        })?;

        let sig_start = desc_offset + desc.desc_size();
        let mut cursor = Cursor::at(data, sig_start)?;
        let signatures = cursor.bytes(desc.signature_bytes())?.to_vec();
        let imem = cursor.bytes(desc.imem_load_size as usize)?.to_vec();
        let dmem = cursor.bytes(desc.dmem_load_size as usize)?.to_vec();

        Ok(Self {
            desc,
            desc_offset,
            signatures,
            imem,
            dmem,
        })
    }

    /// The `index`-th RSA-3072 signature block.
    pub fn signature(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(RSA3K_SIGNATURE_SIZE)?;
        self.signatures.get(start..start + RSA3K_SIGNATURE_SIZE)
    }
}

/// Walk a VBIOS image end to end and extract the FWSEC firmware: ROM
/// discovery, BIT walk, microcode lookup, candidate filtering by
/// application id (production FWSEC first, FRTS fallback), descriptor
/// validation with advance-on-reject.
pub fn extract_fwsec(data: &[u8], known_rom_offsets: &[usize]) -> Result<FwsecUcode> {
    let rom = RomImage::new(data, known_rom_offsets)?;
    let bit = BitTable::find(data, rom.image_base())?;
    let table = UcodeLookupTable::from_bit(data, rom.image_base(), &bit)?;

    for app_id in [APP_ID_FWSEC_PROD, APP_ID_FRTS] {
        for entry in table.entries.iter().filter(|e| e.app_id == app_id) {
            let offset = UcodeLookupTable::resolve(entry, rom.image_base());
            match FwsecUcode::extract(data, offset) {
                Ok(ucode) => {
                    debug!(
                        "FWSEC (app {:#x}) at {:#x}: ucode_id {}, {} signatures",
                        app_id, offset, ucode.desc.ucode_id, ucode.desc.signature_count
                    );
                    return Ok(ucode);
                }
                Err(e) => debug!("candidate at {:#x} (app {:#x}) rejected: {}", offset, app_id, e),
            }
        }
    }
    Err(VbiosError::FwsecNotFound)
}
