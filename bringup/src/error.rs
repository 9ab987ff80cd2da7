// Licensed under the Apache-2.0 license

use gsp_vbios::VbiosError;

/// Falcon register state captured when the core halts with a nonzero
/// mailbox or when a stage times out. Included in errors so a failure
/// report carries the evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltSnapshot {
    pub cpuctl: u32,
    pub mailbox0: u32,
    pub mailbox1: u32,
    pub scratch_error: u16,
}

impl core::fmt::Display for HaltSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "cpuctl={:#x} mailbox0={:#x} mailbox1={:#x} scratch_err={:#x}",
            self.cpuctl, self.mailbox0, self.mailbox1, self.scratch_error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BringupError {
    /// VBIOS parsing failed; carries the underlying parse error.
    Vbios(VbiosError),
    /// Caller-supplied input is unusable (bad sizes, wrong order of
    /// operations). The message names the violated precondition.
    Usage(&'static str),
    /// No fuse-compatible signature exists in the ucode blob.
    SignatureUnavailable {
        fuse_version: u32,
        signature_versions: u16,
    },
    /// A DMA transfer window never reported idle within its budget.
    TransferTimeout { imem: bool, offset: u32 },
    /// A polled hardware condition did not occur within its budget.
    Timeout { stage: &'static str },
    /// The falcon halted with a nonzero error code in its mailbox.
    ExecutionFailed { code: u32, snapshot: HaltSnapshot },
    /// FWSEC ran to completion but the protected region never appeared.
    RegionNotActivated { snapshot: HaltSnapshot },
    /// The write-protected region is already owned by earlier firmware.
    RegionAlreadyActive { lo: u32, hi: u32 },
    /// The ucode's DMEM interface table lacks the required interface.
    InterfaceNotFound { interface_id: u32 },
    /// The device could not provide DMA-capable memory.
    DmaAllocFailed { size: usize },
    /// Not enough free ring space for the message.
    QueueFull { needed: usize, free: usize },
    /// No matching reply arrived on the status queue in time.
    QueueTimeout { function: u32 },
    /// The remote processor rejected an RPC.
    RpcFailed { function: u32, result: u32 },
    /// A status-queue element failed checksum or header validation.
    QueueCorrupt(&'static str),
}

impl core::fmt::Display for BringupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BringupError::Vbios(e) => write!(f, "vbios: {}", e),
            BringupError::Usage(what) => write!(f, "usage: {}", what),
            BringupError::SignatureUnavailable {
                fuse_version,
                signature_versions,
            } => write!(
                f,
                "no signature for fuse version {} (ucode carries mask {:#x})",
                fuse_version, signature_versions
            ),
            BringupError::TransferTimeout { imem, offset } => write!(
                f,
                "DMA to {} stalled at offset {:#x}",
                if *imem { "IMEM" } else { "DMEM" },
                offset
            ),
            BringupError::Timeout { stage } => write!(f, "timed out waiting for {}", stage),
            BringupError::ExecutionFailed { code, snapshot } => {
                write!(f, "ucode halted with error {:#x} ({})", code, snapshot)
            }
            BringupError::RegionNotActivated { snapshot } => {
                write!(f, "WPR2 not activated after FWSEC ({})", snapshot)
            }
            BringupError::RegionAlreadyActive { lo, hi } => {
                write!(f, "WPR2 already active ({:#x}..{:#x})", lo, hi)
            }
            BringupError::InterfaceNotFound { interface_id } => {
                write!(f, "DMEM interface {:#x} not present", interface_id)
            }
            BringupError::DmaAllocFailed { size } => {
                write!(f, "failed to allocate {:#x} bytes of DMA memory", size)
            }
            BringupError::QueueFull { needed, free } => {
                write!(f, "queue full: need {:#x} bytes, {:#x} free", needed, free)
            }
            BringupError::QueueTimeout { function } => {
                write!(f, "no reply for RPC function {:#x}", function)
            }
            BringupError::RpcFailed { function, result } => {
                write!(f, "RPC function {:#x} failed: {:#x}", function, result)
            }
            BringupError::QueueCorrupt(what) => write!(f, "status queue corrupt: {}", what),
        }
    }
}

impl std::error::Error for BringupError {}

impl From<VbiosError> for BringupError {
    fn from(e: VbiosError) -> Self {
        BringupError::Vbios(e)
    }
}

pub type Result<T> = core::result::Result<T, BringupError>;
