// Licensed under the Apache-2.0 license

//! Synthetic VBIOS images for pipeline tests: one expansion ROM image
//! carrying a PCIR record, a BIT table with a falcon-data token, a
//! microcode lookup table, and a structurally complete FWSEC ucode
//! blob whose DMEM holds the application-interface table and mapper.

use gsp_bringup::fwsec::{
    AppInterfaceEntry, AppInterfaceHeader, DmemMapperV3, APPIF_ID_DMEMMAPPER,
    DMEM_MAPPER_SIGNATURE,
};
use gsp_vbios::{BitHeader, FalconUcodeDescV3, PcirStruct, APP_ID_FWSEC_PROD, RSA3K_SIGNATURE_SIZE};
use zerocopy::{FromZeros, IntoBytes};

// Image-relative layout.
const PCIR_OFFSET: usize = 0x40;
const BIT_OFFSET: usize = 0x60;
const FALCON_DATA_OFFSET: usize = 0x100;
const LOOKUP_TABLE_OFFSET: usize = 0x120;
/// First lookup entry points here; all zeroes, so extraction must
/// reject it and advance to the real descriptor.
const BAD_CANDIDATE_OFFSET: usize = 0x1000;
const DESC_OFFSET: usize = 0x200;
const IMAGE_SIZE: usize = 0x1200;

pub const IMEM_SIZE: usize = 0x100;
pub const DMEM_SIZE: usize = 0x400;
pub const IMEM_VIRT_BASE: u32 = 0x4000;
/// DMEM offsets inside the ucode blob.
const INTERFACE_OFFSET: u32 = 0x40;
const MAPPER_OFFSET: u32 = 0x80;
const CMD_BUFFER_OFFSET: u32 = 0x100;
const PKC_DATA_OFFSET: u32 = 0x200;

pub struct VbiosBuilder {
    /// Where in the buffer the ROM image starts.
    pub base: usize,
    pub ucode_id: u8,
    /// Fuse-version mask; one signature block per set bit.
    pub signature_versions: u16,
}

impl Default for VbiosBuilder {
    fn default() -> Self {
        Self {
            base: 0,
            ucode_id: 1,
            signature_versions: 0x3,
        }
    }
}

impl VbiosBuilder {
    pub fn build(&self) -> Vec<u8> {
        let mut img = vec![0u8; self.base + IMAGE_SIZE];
        let base = self.base;

        img[base] = 0x55;
        img[base + 1] = 0xAA;
        img[base + 0x18..base + 0x1A].copy_from_slice(&(PCIR_OFFSET as u16).to_le_bytes());

        let pcir = PcirStruct {
            signature: *b"PCIR",
            vendor_id: 0x10DE,
            device_id: 0x2684,
            device_list_ptr: 0,
            pci_data_struct_len: 24,
            pci_data_struct_rev: 3,
            class_code: [0, 0, 3],
            image_len: (IMAGE_SIZE / 512) as u16,
            vendor_rom_rev: 1,
            code_type: 0,
            last_image: 0x80,
            max_runtime_image_len: 0,
        };
        put(&mut img, base + PCIR_OFFSET, pcir.as_bytes());

        let mut bit = BitHeader {
            id: 0xB8FF,
            signature: *b"BIT\0",
            bcd_version: 0x0110,
            header_size: 12,
            token_size: 6,
            token_entries: 1,
            checksum: 0,
        };
        let sum = bit.as_bytes().iter().fold(0u8, |s, &b| s.wrapping_add(b));
        bit.checksum = 0u8.wrapping_sub(sum);
        put(&mut img, base + BIT_OFFSET, bit.as_bytes());
        // Falcon-data token (0x70) pointing at the table-pointer word.
        put(
            &mut img,
            base + BIT_OFFSET + 12,
            &[0x70, 2, 4, 0, FALCON_DATA_OFFSET as u8, (FALCON_DATA_OFFSET >> 8) as u8],
        );
        put(
            &mut img,
            base + FALCON_DATA_OFFSET,
            &(LOOKUP_TABLE_OFFSET as u32).to_le_bytes(),
        );

        // Lookup table: version 1, 4-byte header, 6-byte entries.
        put(&mut img, base + LOOKUP_TABLE_OFFSET, &[1, 4, 6, 2]);
        let mut entry = Vec::new();
        entry.extend_from_slice(&[APP_ID_FWSEC_PROD, 0]);
        entry.extend_from_slice(&(BAD_CANDIDATE_OFFSET as u32).to_le_bytes());
        entry.extend_from_slice(&[APP_ID_FWSEC_PROD, 0]);
        entry.extend_from_slice(&(DESC_OFFSET as u32).to_le_bytes());
        put(&mut img, base + LOOKUP_TABLE_OFFSET + 4, &entry);

        let signature_count = self.signature_versions.count_ones() as u8;
        let desc = FalconUcodeDescV3 {
            vdesc: (44 << 16) | (3 << 8) | 1,
            stored_size: 0,
            pkc_data_offset: PKC_DATA_OFFSET,
            interface_offset: INTERFACE_OFFSET,
            imem_phys_base: 0,
            imem_load_size: IMEM_SIZE as u32,
            imem_virt_base: IMEM_VIRT_BASE,
            dmem_phys_base: 0,
            dmem_load_size: DMEM_SIZE as u32,
            engine_id_mask: 0x0400,
            ucode_id: self.ucode_id,
            signature_count,
            signature_versions: self.signature_versions,
            reserved: 0,
        };
        let mut blob = desc.as_bytes().to_vec();
        // One distinguishable signature block per advertised version.
        for i in 0..signature_count {
            blob.extend_from_slice(&[0xB0 + i; RSA3K_SIGNATURE_SIZE]);
        }
        blob.extend_from_slice(&[0x5A; IMEM_SIZE]);
        blob.extend_from_slice(&self.dmem());
        put(&mut img, base + DESC_OFFSET, &blob);
        img
    }

    fn dmem(&self) -> Vec<u8> {
        let mut dmem = vec![0u8; DMEM_SIZE];
        let header = AppInterfaceHeader {
            version: 1,
            header_size: 4,
            entry_size: 8,
            entry_count: 1,
        };
        put(&mut dmem, INTERFACE_OFFSET as usize, header.as_bytes());
        let entry = AppInterfaceEntry {
            id: APPIF_ID_DMEMMAPPER,
            dmem_offset: MAPPER_OFFSET,
        };
        put(&mut dmem, INTERFACE_OFFSET as usize + 4, entry.as_bytes());

        let mut mapper = DmemMapperV3::new_zeroed();
        mapper.signature = DMEM_MAPPER_SIGNATURE;
        mapper.version = 3;
        mapper.size = core::mem::size_of::<DmemMapperV3>() as u16;
        mapper.cmd_in_buffer_offset = CMD_BUFFER_OFFSET;
        mapper.cmd_in_buffer_size = 0x80;
        put(&mut dmem, MAPPER_OFFSET as usize, mapper.as_bytes());
        dmem
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}
