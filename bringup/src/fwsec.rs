// Licensed under the Apache-2.0 license

//! Host-side preparation of the FWSEC DMEM image: locating the DMEM
//! mapper through the application-interface table, writing the FRTS
//! command into the command buffer, and patching in the fuse-selected
//! signature. All patching happens on the extracted DMEM copy before
//! it is loaded into the falcon.

use gsp_vbios::{Cursor, FwsecUcode};
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{BringupError, Result};

pub const APPIF_ID_DMEMMAPPER: u32 = 4;
pub const DMEM_MAPPER_SIGNATURE: u32 = 0x50414D44; // "DMAP"

/// DMEM mapper commands understood by FWSEC.
pub const FWSEC_CMD_FRTS: u32 = 0x15;
pub const FWSEC_CMD_SB: u32 = 0x19;

/// FRTS carve-out is a fixed 1 MiB, expressed in 4 KiB pages.
pub const FRTS_SIZE_4K: u32 = 0x100;
const FRTS_REGION_MEDIA_FB: u32 = 2;
const READ_VBIOS_STRUCT_FLAGS: u32 = 2;

/// Application-interface table header in DMEM.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct AppInterfaceHeader {
    pub version: u8,
    pub header_size: u8,
    pub entry_size: u8,
    pub entry_count: u8,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct AppInterfaceEntry {
    pub id: u32,
    pub dmem_offset: u32,
}

/// DMEM mapper interface, version 3. 64-byte layout inside DMEM.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct DmemMapperV3 {
    pub signature: u32,
    pub version: u16,
    pub size: u16,
    pub cmd_in_buffer_offset: u32,
    pub cmd_in_buffer_size: u32,
    pub cmd_out_buffer_offset: u32,
    pub cmd_out_buffer_size: u32,
    pub nvf_img_data_buffer_offset: u32,
    pub nvf_img_data_buffer_size: u32,
    pub printf_buffer_hdr: u32,
    pub ucode_build_time_stamp: u32,
    pub ucode_signature: u32,
    /// Command FWSEC executes at boot; the field this module patches.
    pub init_cmd: u32,
    pub ucode_feature: u32,
    pub ucode_cmd_mask0: u32,
    pub ucode_cmd_mask1: u32,
    pub multi_tgt_tbl: u32,
}

/// Byte offset of `init_cmd` within [`DmemMapperV3`].
const INIT_CMD_OFFSET: usize = 44;

// Packed: the command is a wire image; the u64 image offset sits at
// byte 8 and the combined command is 44 bytes with no padding.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
struct ReadVbiosDesc {
    version: u32,
    size: u32,
    gfw_image_offset: u64,
    gfw_image_size: u32,
    flags: u32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
struct FrtsRegionDesc {
    version: u32,
    size: u32,
    frts_offset_4k: u32,
    frts_size_4k: u32,
    media_type: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
struct FrtsCmd {
    read_vbios: ReadVbiosDesc,
    frts_region: FrtsRegionDesc,
}

/// Locate the DMEM mapper: walk the application-interface table first,
/// and fall back to scanning DMEM for the mapper magic when the table
/// is absent or damaged. Returns the mapper's DMEM offset and its
/// decoded contents.
pub fn find_dmem_mapper(dmem: &[u8], interface_offset: u32) -> Result<(usize, DmemMapperV3)> {
    if let Some(found) = mapper_from_table(dmem, interface_offset) {
        return Ok(found);
    }
    scan_for_mapper(dmem).ok_or(BringupError::InterfaceNotFound {
        interface_id: APPIF_ID_DMEMMAPPER,
    })
}

fn mapper_from_table(dmem: &[u8], interface_offset: u32) -> Option<(usize, DmemMapperV3)> {
    let header: AppInterfaceHeader = Cursor::at(dmem, interface_offset as usize)
        .ok()?
        .read_struct()
        .ok()?;
    if header.version != 1
        || usize::from(header.header_size) < core::mem::size_of::<AppInterfaceHeader>()
        || usize::from(header.entry_size) < core::mem::size_of::<AppInterfaceEntry>()
    {
        warn!("application interface header at {:#x} is malformed", interface_offset);
        return None;
    }

    for i in 0..usize::from(header.entry_count) {
        let entry_offset = interface_offset as usize
            + usize::from(header.header_size)
            + i * usize::from(header.entry_size);
        let entry: AppInterfaceEntry = Cursor::at(dmem, entry_offset).ok()?.read_struct().ok()?;
        if entry.id != APPIF_ID_DMEMMAPPER {
            continue;
        }
        let mapper_offset = entry.dmem_offset as usize;
        let mapper: DmemMapperV3 = Cursor::at(dmem, mapper_offset).ok()?.read_struct().ok()?;
        if mapper.signature != DMEM_MAPPER_SIGNATURE {
            warn!("mapper entry points at {:#x} but the magic is absent", mapper_offset);
            return None;
        }
        debug!(
            "DMEM mapper v{} at {:#x}: cmd buffer {:#x}+{:#x}",
            mapper.version, mapper_offset, mapper.cmd_in_buffer_offset, mapper.cmd_in_buffer_size
        );
        return Some((mapper_offset, mapper));
    }
    None
}

fn scan_for_mapper(dmem: &[u8]) -> Option<(usize, DmemMapperV3)> {
    let magic = DMEM_MAPPER_SIGNATURE.to_le_bytes();
    let mapper_size = core::mem::size_of::<DmemMapperV3>();
    if dmem.len() < mapper_size {
        return None;
    }
    let last = dmem.len() - mapper_size;
    (0..=last).step_by(4).find_map(|at| {
        if dmem[at..at + 4] != magic {
            return None;
        }
        let mapper: DmemMapperV3 = Cursor::at(dmem, at).ok()?.read_struct().ok()?;
        debug!("DMEM mapper found by scan at {:#x}", at);
        Some((at, mapper))
    })
}

/// Resolve the command buffer location. Mapper offsets are nominally
/// relative to the mapper structure; some images record them relative
/// to the DMEM base instead, so fall back to that interpretation when
/// the first one runs off the end.
fn resolve_cmd_offset(
    dmem_len: usize,
    mapper_offset: usize,
    mapper: &DmemMapperV3,
    cmd_len: usize,
) -> Result<usize> {
    if (mapper.cmd_in_buffer_size as usize) < cmd_len {
        return Err(BringupError::Usage("FRTS command exceeds input buffer"));
    }
    let relative = mapper_offset + mapper.cmd_in_buffer_offset as usize;
    if relative + cmd_len <= dmem_len {
        return Ok(relative);
    }
    let absolute = mapper.cmd_in_buffer_offset as usize;
    if absolute + cmd_len <= dmem_len {
        debug!("command buffer offset {:#x} is DMEM-relative", absolute);
        return Ok(absolute);
    }
    Err(BringupError::Usage("command buffer outside DMEM"))
}

/// Patch the DMEM copy so FWSEC executes the FRTS command against the
/// given framebuffer offset (bytes, 4 KiB aligned).
pub fn patch_frts_command(ucode: &mut FwsecUcode, frts_offset: u64) -> Result<()> {
    if frts_offset & 0xFFF != 0 {
        return Err(BringupError::Usage("FRTS offset not 4 KiB aligned"));
    }
    let (mapper_offset, mapper) =
        find_dmem_mapper(&ucode.dmem, ucode.desc.interface_offset)?;

    let cmd = FrtsCmd {
        read_vbios: ReadVbiosDesc {
            version: 1,
            size: core::mem::size_of::<ReadVbiosDesc>() as u32,
            gfw_image_offset: 0,
            gfw_image_size: 0,
            flags: READ_VBIOS_STRUCT_FLAGS,
        },
        frts_region: FrtsRegionDesc {
            version: 1,
            size: core::mem::size_of::<FrtsRegionDesc>() as u32,
            frts_offset_4k: (frts_offset >> 12) as u32,
            frts_size_4k: FRTS_SIZE_4K,
            media_type: FRTS_REGION_MEDIA_FB,
        },
    };
    let cmd_bytes = cmd.as_bytes();
    let cmd_offset = resolve_cmd_offset(ucode.dmem.len(), mapper_offset, &mapper, cmd_bytes.len())?;
    ucode.dmem[cmd_offset..cmd_offset + cmd_bytes.len()].copy_from_slice(cmd_bytes);

    let init_cmd_at = mapper_offset + INIT_CMD_OFFSET;
    ucode.dmem[init_cmd_at..init_cmd_at + 4].copy_from_slice(&FWSEC_CMD_FRTS.to_le_bytes());
    debug!(
        "FRTS command patched: offset {:#x}, cmd buffer at {:#x}",
        frts_offset, cmd_offset
    );
    Ok(())
}

/// Copy the fuse-selected signature over the descriptor's PKC slot in
/// the DMEM copy.
pub fn patch_signature(ucode: &mut FwsecUcode, index: usize) -> Result<()> {
    let sig = ucode
        .signature(index)
        .ok_or(BringupError::Usage("signature index out of range"))?
        .to_vec();
    let start = ucode.desc.pkc_data_offset as usize;
    let end = start
        .checked_add(sig.len())
        .filter(|&end| end <= ucode.dmem.len())
        .ok_or(BringupError::Usage("signature slot outside DMEM"))?;
    ucode.dmem[start..end].copy_from_slice(&sig);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsp_vbios::{FalconUcodeDescV3, RSA3K_SIGNATURE_SIZE};
    use zerocopy::FromZeros;

    const INTERFACE_OFFSET: u32 = 0x40;
    const MAPPER_OFFSET: u32 = 0x80;
    const CMD_BUF_OFFSET: u32 = 0x100;

    fn mapper(cmd_in_offset: u32) -> DmemMapperV3 {
        let mut m = DmemMapperV3::new_zeroed();
        m.signature = DMEM_MAPPER_SIGNATURE;
        m.version = 3;
        m.size = core::mem::size_of::<DmemMapperV3>() as u16;
        m.cmd_in_buffer_offset = cmd_in_offset;
        m.cmd_in_buffer_size = 0x80;
        m
    }

    fn ucode_with_mapper(cmd_in_offset: u32) -> FwsecUcode {
        let mut dmem = vec![0u8; 0x400];
        let header = AppInterfaceHeader {
            version: 1,
            header_size: 4,
            entry_size: 8,
            entry_count: 2,
        };
        dmem[0x40..0x44].copy_from_slice(header.as_bytes());
        let skip = AppInterfaceEntry { id: 1, dmem_offset: 0 };
        let hit = AppInterfaceEntry {
            id: APPIF_ID_DMEMMAPPER,
            dmem_offset: MAPPER_OFFSET,
        };
        dmem[0x44..0x4C].copy_from_slice(skip.as_bytes());
        dmem[0x4C..0x54].copy_from_slice(hit.as_bytes());
        dmem[0x80..0xC0].copy_from_slice(mapper(cmd_in_offset).as_bytes());

        let mut desc = FalconUcodeDescV3::new_zeroed();
        desc.interface_offset = INTERFACE_OFFSET;
        desc.pkc_data_offset = 0x200;
        FwsecUcode {
            desc,
            desc_offset: 0,
            signatures: (0..RSA3K_SIGNATURE_SIZE as u32 * 2)
                .map(|i| (i % 251) as u8)
                .collect(),
            imem: vec![0; 256],
            dmem,
        }
    }

    #[test]
    fn mapper_is_found_past_non_matching_entries() {
        let ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        let (offset, m) = find_dmem_mapper(&ucode.dmem, INTERFACE_OFFSET).unwrap();
        assert_eq!(offset, MAPPER_OFFSET as usize);
        assert_eq!(m.cmd_in_buffer_offset, CMD_BUF_OFFSET);
    }

    #[test]
    fn table_miss_falls_back_to_the_dmem_scan() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        // Overwrite the matching entry's id; the mapper itself stays,
        // so the magic scan must still locate it.
        ucode.dmem[0x4C..0x50].copy_from_slice(&9u32.to_le_bytes());
        let (offset, m) = find_dmem_mapper(&ucode.dmem, INTERFACE_OFFSET).unwrap();
        assert_eq!(offset, MAPPER_OFFSET as usize);
        assert_eq!(m.cmd_in_buffer_offset, CMD_BUF_OFFSET);
    }

    #[test]
    fn no_mapper_anywhere_is_interface_not_found() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        ucode.dmem[0x4C..0x50].copy_from_slice(&9u32.to_le_bytes());
        // Wipe the magic so the scan cannot find it either.
        ucode.dmem[0x80..0x84].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            find_dmem_mapper(&ucode.dmem, INTERFACE_OFFSET).unwrap_err(),
            BringupError::InterfaceNotFound { interface_id: 4 }
        );
    }

    #[test]
    fn frts_patch_writes_command_and_init_cmd() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        patch_frts_command(&mut ucode, 0x3FF0_0000).unwrap();

        // init_cmd patched inside the mapper.
        let init_at = MAPPER_OFFSET as usize + INIT_CMD_OFFSET;
        assert_eq!(
            u32::from_le_bytes(ucode.dmem[init_at..init_at + 4].try_into().unwrap()),
            FWSEC_CMD_FRTS
        );

        // Command lands mapper-relative: 0x80 + 0x100.
        let cmd_at = (MAPPER_OFFSET + CMD_BUF_OFFSET) as usize;
        let cmd = FrtsCmd::read_from_bytes(&ucode.dmem[cmd_at..cmd_at + 44]).unwrap();
        assert_eq!({ cmd.read_vbios.version }, 1);
        assert_eq!({ cmd.read_vbios.flags }, READ_VBIOS_STRUCT_FLAGS);
        assert_eq!({ cmd.frts_region.frts_offset_4k }, 0x3FF00);
        assert_eq!({ cmd.frts_region.frts_size_4k }, FRTS_SIZE_4K);
        assert_eq!({ cmd.frts_region.media_type }, FRTS_REGION_MEDIA_FB);
    }

    #[test]
    fn dmem_relative_fallback_when_mapper_relative_overflows() {
        // 0x3C0 + mapper offset 0x80 would run past the 0x400 DMEM, but
        // taken from the DMEM base it fits.
        let mut ucode = ucode_with_mapper(0x3C0);
        patch_frts_command(&mut ucode, 0x1000).unwrap();
        let cmd = FrtsCmd::read_from_bytes(&ucode.dmem[0x3C0..0x3C0 + 44]).unwrap();
        assert_eq!({ cmd.frts_region.frts_offset_4k }, 1);
    }

    #[test]
    fn unaligned_frts_offset_is_rejected() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        assert!(patch_frts_command(&mut ucode, 0x1001).is_err());
    }

    #[test]
    fn signature_patch_copies_selected_block() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        // Make pkc slot fit inside the small test DMEM.
        ucode.desc.pkc_data_offset = 0x240;
        patch_signature(&mut ucode, 1).unwrap();
        let expected = ucode.signature(1).unwrap().to_vec();
        assert_eq!(&ucode.dmem[0x240..0x240 + RSA3K_SIGNATURE_SIZE], &expected[..]);
    }

    #[test]
    fn signature_slot_outside_dmem_is_an_error() {
        let mut ucode = ucode_with_mapper(CMD_BUF_OFFSET);
        // 0x300 + 384 runs past the 0x400-byte DMEM.
        ucode.desc.pkc_data_offset = 0x300;
        assert!(matches!(
            patch_signature(&mut ucode, 0),
            Err(BringupError::Usage(_))
        ));
    }
}
