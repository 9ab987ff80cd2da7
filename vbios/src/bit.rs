// Licensed under the Apache-2.0 license

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Cursor, Result, VbiosError};

/// BIT header id, stored little-endian so the on-ROM byte pattern is
/// `FF B8 'B' 'I' 'T' 00`.
pub const BIT_HEADER_ID: u16 = 0xB8FF;
pub const BIT_HEADER_SIGNATURE: [u8; 4] = *b"BIT\0";

/// Token whose data points at the falcon ucode lookup table.
pub const BIT_TOKEN_FALCON_DATA: u8 = 0x70;
/// Legacy token carrying a raw, headerless array of table-offset
/// candidates instead of a pointer to a headered table.
pub const BIT_TOKEN_FALCON_DATA_LEGACY: u8 = 0x50;

/// BIOS Information Table header. 12-byte on-ROM layout.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct BitHeader {
    pub id: u16,
    pub signature: [u8; 4],
    pub bcd_version: u16,
    pub header_size: u8,
    pub token_size: u8,
    pub token_entries: u8,
    pub checksum: u8,
}

/// One BIT token table entry. 6-byte on-ROM layout; `data_offset` is
/// relative to the ROM image base.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct BitToken {
    pub id: u8,
    pub data_version: u8,
    pub data_size: u16,
    pub data_offset: u16,
}

/// The located BIT header plus its decoded token table.
#[derive(Debug, Clone)]
pub struct BitTable {
    pub offset: usize,
    pub header: BitHeader,
    pub tokens: Vec<BitToken>,
}

impl BitTable {
    /// Scan forward from `start` for the BIT byte pattern, then validate
    /// and decode the header and token table.
    pub fn find(data: &[u8], start: usize) -> Result<Self> {
        let pattern = [0xFF, 0xB8, b'B', b'I', b'T', 0x00];
        let offset = data
            .get(start..)
            .unwrap_or(&[])
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|pos| start + pos)
            .ok_or(VbiosError::Format("BIT header pattern"))?;

        let header: BitHeader = Cursor::at(data, offset)?.read_struct()?;
        if header.id != BIT_HEADER_ID || header.signature != BIT_HEADER_SIGNATURE {
            return Err(VbiosError::Format("BIT header id/signature"));
        }
        let header_size = usize::from(header.header_size);
        if header_size < core::mem::size_of::<BitHeader>() {
            return Err(VbiosError::Format("BIT header size"));
        }
        let header_bytes = Cursor::at(data, offset)?.bytes(header_size)?;
        if header_bytes
            .iter()
            .fold(0u8, |sum, &b| sum.wrapping_add(b))
            != 0
        {
            return Err(VbiosError::Format("BIT header checksum"));
        }
        if usize::from(header.token_size) < core::mem::size_of::<BitToken>() {
            return Err(VbiosError::Format("BIT token size"));
        }

        let mut tokens = Vec::with_capacity(usize::from(header.token_entries));
        for i in 0..usize::from(header.token_entries) {
            let token_offset = offset + header_size + i * usize::from(header.token_size);
            tokens.push(Cursor::at(data, token_offset)?.read_struct::<BitToken>()?);
        }
        debug!(
            "BIT at {:#x}: version {:#x}, {} tokens",
            offset, header.bcd_version, header.token_entries
        );
        Ok(Self {
            offset,
            header,
            tokens,
        })
    }

    pub fn token(&self, id: u8) -> Option<&BitToken> {
        self.tokens.iter().find(|t| t.id == id)
    }
}

/// Microcode lookup table entry: which application a descriptor belongs
/// to and where it lives. `data_offset` may be image-relative (§ the
/// adjustment rule in [`UcodeLookupTable::resolve`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UcodeLookupEntry {
    pub app_id: u8,
    pub target_id: u8,
    pub data_offset: u32,
}

/// Microcode (PMU) lookup table: a 4-byte header followed by
/// `entry_count` entries of `entry_size` bytes.
#[derive(Debug, Clone)]
pub struct UcodeLookupTable {
    pub offset: usize,
    pub version: u8,
    pub header_size: u8,
    pub entry_size: u8,
    pub entries: Vec<UcodeLookupEntry>,
}

impl UcodeLookupTable {
    /// Decode and validate a lookup table at `offset`. The header
    /// invariant here is also the acceptance test for legacy headerless
    /// candidates.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self> {
        let mut cursor = Cursor::at(data, offset)?;
        let version = cursor.read_u8()?;
        let header_size = cursor.read_u8()?;
        let entry_size = cursor.read_u8()?;
        let entry_count = cursor.read_u8()?;

        if version != 1 {
            return Err(VbiosError::Format("lookup table version"));
        }
        if usize::from(header_size) < 4 || usize::from(entry_size) < 6 || entry_count == 0 {
            return Err(VbiosError::Format("lookup table header"));
        }

        let mut entries = Vec::with_capacity(usize::from(entry_count));
        for i in 0..usize::from(entry_count) {
            let entry_offset = offset + usize::from(header_size) + i * usize::from(entry_size);
            let mut c = Cursor::at(data, entry_offset)?;
            entries.push(UcodeLookupEntry {
                app_id: c.read_u8()?,
                target_id: c.read_u8()?,
                data_offset: c.read_u32()?,
            });
        }
        Ok(Self {
            offset,
            version,
            header_size,
            entry_size,
            entries,
        })
    }

    /// Locate the lookup table from the BIT token table.
    ///
    /// The falcon-data token (0x70) points at a one-word structure whose
    /// word is the table offset. Chip families without that token carry a
    /// legacy token (0x50) whose payload is a raw array of candidate
    /// offsets; each candidate is validated against the header invariant
    /// before acceptance.
    pub fn from_bit(data: &[u8], image_base: usize, bit: &BitTable) -> Result<Self> {
        if let Some(token) = bit.token(BIT_TOKEN_FALCON_DATA) {
            if token.data_size >= 4 {
                let mut c = Cursor::at(data, image_base + usize::from(token.data_offset))?;
                let table_ptr = c.read_u32()? as usize;
                return Self::decode(data, image_base + table_ptr);
            }
            warn!("falcon-data token too small ({} bytes)", token.data_size);
        }

        let token = bit
            .token(BIT_TOKEN_FALCON_DATA_LEGACY)
            .ok_or(VbiosError::Format("no falcon-data BIT token"))?;
        let mut c = Cursor::at(data, image_base + usize::from(token.data_offset))?;
        for _ in 0..usize::from(token.data_size) / 4 {
            let candidate = c.read_u32()? as usize;
            match Self::decode(data, image_base + candidate) {
                Ok(table) => return Ok(table),
                Err(e) => debug!("legacy table candidate {:#x} rejected: {}", candidate, e),
            }
        }
        Err(VbiosError::Format("no valid legacy lookup table candidate"))
    }

    /// Absolute offset of an entry's data, applying the image-relative
    /// adjustment: offsets numerically below the image base (or below the
    /// 1 MiB window on large images) are relative to it.
    pub fn resolve(entry: &UcodeLookupEntry, image_base: usize) -> usize {
        let offset = entry.data_offset as usize;
        if offset < image_base.max(0x100000) {
            image_base + offset
        } else {
            offset
        }
    }
}
