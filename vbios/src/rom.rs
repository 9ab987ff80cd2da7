// Licensed under the Apache-2.0 license

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Cursor, Result, VbiosError};

/// Offset of the PCI-data-structure pointer within a ROM image header.
const PCIR_PTR_OFFSET: usize = 0x18;

pub const PCI_VENDOR_ID_NVIDIA: u16 = 0x10DE;

/// PCI Data Structure that immediately identifies each ROM image.
///
/// 24-byte on-ROM layout, little-endian, naturally aligned.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct PcirStruct {
    /// "PCIR", or "NPDS" for the NVIDIA extension record.
    pub signature: [u8; 4],
    pub vendor_id: u16,
    pub device_id: u16,
    pub device_list_ptr: u16,
    pub pci_data_struct_len: u16,
    pub pci_data_struct_rev: u8,
    pub class_code: [u8; 3],
    /// Image length in 512-byte blocks.
    pub image_len: u16,
    pub vendor_rom_rev: u16,
    pub code_type: u8,
    /// Bit 7 set on the last image of a concatenated ROM.
    pub last_image: u8,
    pub max_runtime_image_len: u16,
}

impl PcirStruct {
    fn decode(data: &[u8], offset: usize) -> Result<Self> {
        let pcir: PcirStruct = Cursor::at(data, offset)?.read_struct()?;
        if &pcir.signature != b"PCIR" && &pcir.signature != b"NPDS" {
            return Err(VbiosError::Format("PCIR signature"));
        }
        if pcir.vendor_id != PCI_VENDOR_ID_NVIDIA {
            return Err(VbiosError::Format("PCIR vendor id"));
        }
        if pcir.image_len == 0 {
            return Err(VbiosError::Format("PCIR image length"));
        }
        Ok(pcir)
    }

    /// Image size in bytes.
    pub fn image_size_bytes(&self) -> usize {
        usize::from(self.image_len) * 512
    }

    pub fn is_last(&self) -> bool {
        self.last_image & 0x80 != 0
    }
}

/// A located expansion ROM image: the enclosing buffer plus the offset of
/// its 0x55AA signature and its validated PCI data structure.
///
/// Read-only for the whole bring-up; extraction copies what it needs.
#[derive(Debug, Clone)]
pub struct RomImage<'a> {
    data: &'a [u8],
    image_base: usize,
    pcir_offset: usize,
    pcir: PcirStruct,
}

impl<'a> RomImage<'a> {
    /// Locate the first ROM image. Probes offset 0 first, then the
    /// generation's known historical offsets, then scans in 512-byte
    /// strides.
    pub fn new(data: &'a [u8], known_offsets: &[usize]) -> Result<Self> {
        if let Some(image) = Self::try_at(data, 0) {
            return Ok(image);
        }
        for &offset in known_offsets {
            if let Some(image) = Self::try_at(data, offset) {
                debug!("ROM signature found at known offset {:#x}", offset);
                return Ok(image);
            }
        }
        let mut offset = 512;
        while offset + 2 <= data.len() {
            if let Some(image) = Self::try_at(data, offset) {
                debug!("ROM signature found by stride scan at {:#x}", offset);
                return Ok(image);
            }
            offset += 512;
        }
        Err(VbiosError::RomSignatureNotFound)
    }

    fn try_at(data: &'a [u8], base: usize) -> Option<Self> {
        if base + PCIR_PTR_OFFSET + 2 > data.len() {
            return None;
        }
        if data[base] != 0x55 || data[base + 1] != 0xAA {
            return None;
        }
        let mut cursor = Cursor::at(data, base + PCIR_PTR_OFFSET).ok()?;
        let pcir_ptr = usize::from(cursor.read_u16().ok()?);
        let pcir_offset = base + pcir_ptr;
        match PcirStruct::decode(data, pcir_offset) {
            Ok(pcir) => Some(Self {
                data,
                image_base: base,
                pcir_offset,
                pcir,
            }),
            Err(e) => {
                warn!("ROM signature at {:#x} without valid PCIR: {}", base, e);
                None
            }
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn image_base(&self) -> usize {
        self.image_base
    }

    pub fn pcir_offset(&self) -> usize {
        self.pcir_offset
    }

    pub fn pcir(&self) -> &PcirStruct {
        &self.pcir
    }

    /// The next concatenated image, if this one is not marked last.
    pub fn next_image(&self) -> Result<Option<RomImage<'a>>> {
        if self.pcir.is_last() {
            return Ok(None);
        }
        let next_base = self.image_base + self.pcir.image_size_bytes();
        match Self::try_at(self.data, next_base) {
            Some(image) => Ok(Some(image)),
            None => Err(VbiosError::Format("concatenated image chain")),
        }
    }
}
