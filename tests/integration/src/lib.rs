/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    End-to-end tests of the bring-up pipeline against the emulated GPU:
    FWSEC extraction from synthetic VBIOS images, FRTS execution and
    WPR2 activation, primary-core boot, and the RPC channel.

--*/

pub mod vbios_builder;

mod test_boot_pipeline;
mod test_fwsec_extraction;
