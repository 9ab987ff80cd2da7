/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Core bring-up library for the GPU security processor: ucode loading,
    fuse-based signature selection, FWSEC-FRTS execution, the boot/reset
    sequencer, Radix3 page tables, WPR metadata, and the RPC queue
    transport. Hardware access goes through the injected capabilities in
    `device`; no OS calls appear in this crate.

--*/

mod device;
mod error;
pub mod falcon;
pub mod fuse;
pub mod fwsec;
mod poll;
pub mod radix3;
pub mod rpc;
mod sequencer;
mod session;
pub mod wpr;

pub use device::{DmaBuffer, GpuDevice};
pub use error::{BringupError, HaltSnapshot, Result};
pub use poll::{wait_on, PollExpired};
pub use sequencer::{
    BootOutcome, BootPolicy, BootSequencer, BootStage, BromParams, LoadPath, UcodeImage,
};
pub use session::{BringupSession, GspSystemInfo, PrimaryFirmware, Wpr2Region};
