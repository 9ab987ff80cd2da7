/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    VBIOS image parsing for the GPU security processor bring-up pipeline:
    ROM/PCIR discovery, BIT table walking, microcode lookup, and FWSEC
    ucode descriptor plus signature extraction.

--*/

mod bit;
mod cursor;
mod fwsec;
mod rom;

pub use bit::{BitHeader, BitTable, BitToken, UcodeLookupEntry, UcodeLookupTable};
pub use cursor::Cursor;
pub use fwsec::{
    extract_fwsec, FalconUcodeDescV3, FwsecUcode, VendorUcodeHeader, FALCON_UCODE_DESC_V3_SIZE,
    VENDOR_UCODE_MAGIC,
};
pub use rom::{PcirStruct, RomImage};

/// RSA-3072 signature block size in bytes.
pub const RSA3K_SIGNATURE_SIZE: usize = 384;

/// Secure-boot (FWSEC) application id in the microcode lookup table.
pub const APP_ID_FWSEC_PROD: u8 = 0x85;
/// Fallback application id used by some images for the FRTS-capable blob.
pub const APP_ID_FRTS: u8 = 0x01;

/// Errors produced while parsing a VBIOS image.
///
/// Parse failures stop the current candidate immediately; the walkers
/// advance to the next candidate rather than handing partial structures
/// downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbiosError {
    /// No 0x55AA ROM signature anywhere in the buffer.
    RomSignatureNotFound,
    /// A structure failed validation; the message names the structure.
    Format(&'static str),
    /// A computed offset/size exceeds its enclosing buffer.
    Bounds {
        offset: usize,
        len: usize,
        bound: usize,
    },
    /// No lookup entry yielded a structurally valid FWSEC descriptor.
    FwsecNotFound,
}

impl core::fmt::Display for VbiosError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VbiosError::RomSignatureNotFound => write!(f, "ROM signature (0x55AA) not found"),
            VbiosError::Format(what) => write!(f, "malformed structure: {}", what),
            VbiosError::Bounds { offset, len, bound } => write!(
                f,
                "range {:#x}..{:#x} exceeds buffer of {:#x} bytes",
                offset,
                offset + len,
                bound
            ),
            VbiosError::FwsecNotFound => write!(f, "no valid FWSEC ucode descriptor found"),
        }
    }
}

impl std::error::Error for VbiosError {}

pub type Result<T> = core::result::Result<T, VbiosError>;
