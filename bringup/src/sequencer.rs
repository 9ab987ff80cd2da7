// Licensed under the Apache-2.0 license

//! Single boot state machine for both processor cores. The falcon-core
//! path loads Heavy-Secure ucode (DMA with PIO fallback) and runs it to
//! the halt; the RISC-V path hands the core its boot descriptor and
//! waits for it to come alive. Policy flags select the variations so
//! the stage order lives in exactly one place.

use log::{debug, error, warn};
use strum_macros::Display;

use crate::device::GpuDevice;
use crate::falcon::{Falcon, DMA_CHUNK};
use crate::{BringupError, HaltSnapshot, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BootStage {
    Idle,
    Reset,
    CoreSelect,
    ContextConfig,
    Loading,
    BromParams,
    Started,
    Halted,
    RiscvActive,
}

/// How ucode reaches falcon memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPath {
    /// DMA bursts from a staged buffer, falling back to PIO on a stall.
    Dma,
    Pio,
}

#[derive(Debug, Clone, Copy)]
pub struct BootPolicy {
    pub load_path: LoadPath,
    /// Mark IMEM transfers secure on both load paths (HS ucode
    /// requires it for Boot ROM authentication).
    pub secure_imem: bool,
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self {
            load_path: LoadPath::Dma,
            secure_imem: true,
        }
    }
}

/// Boot ROM verification parameters for HS ucode.
#[derive(Debug, Clone, Copy)]
pub struct BromParams {
    pub pkc_data_offset: u32,
    pub engine_id_mask: u16,
    pub ucode_id: u8,
}

/// A loadable ucode image: payloads plus placement.
pub struct UcodeImage<'a> {
    pub imem: &'a [u8],
    pub imem_phys_base: u32,
    pub imem_virt_base: u32,
    pub dmem: &'a [u8],
    pub dmem_phys_base: u32,
    pub boot_vector: u32,
    pub brom: Option<BromParams>,
}

/// What the ucode left behind after halting cleanly.
#[derive(Debug, Clone, Copy)]
pub struct BootOutcome {
    pub mailbox0: u32,
    pub snapshot: HaltSnapshot,
}

pub struct BootSequencer<'f> {
    falcon: &'f Falcon,
    stage: BootStage,
}

impl<'f> BootSequencer<'f> {
    pub fn new(falcon: &'f Falcon) -> Self {
        Self {
            falcon,
            stage: BootStage::Idle,
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    fn advance(&mut self, to: BootStage) {
        debug!("{:?}: {} -> {}", self.falcon.engine(), self.stage, to);
        self.stage = to;
    }

    /// Run Heavy-Secure ucode on the falcon core and wait for it to
    /// halt. A clean halt with mailbox0 == 0 is success; anything the
    /// ucode reports lands in the returned error.
    pub fn run_hs_ucode(
        &mut self,
        dev: &mut impl GpuDevice,
        image: &UcodeImage<'_>,
        policy: BootPolicy,
    ) -> Result<BootOutcome> {
        self.advance(BootStage::Reset);
        self.falcon.reset(dev);

        self.advance(BootStage::CoreSelect);
        self.falcon
            .select_falcon_core(dev)
            .map_err(|_| BringupError::Timeout {
                stage: "falcon core select",
            })?;

        self.advance(BootStage::ContextConfig);
        self.falcon.setup_dma_context(dev);

        self.advance(BootStage::Loading);
        self.load(dev, image, policy)?;

        if let Some(brom) = &image.brom {
            self.advance(BootStage::BromParams);
            self.falcon.program_brom_params(
                dev,
                brom.pkc_data_offset,
                brom.engine_id_mask,
                brom.ucode_id,
            );
        }

        self.advance(BootStage::Started);
        self.falcon.set_boot_vector(dev, image.boot_vector);
        self.falcon.start_cpu(dev);

        let cpuctl = self.falcon.wait_for_halt(dev).map_err(|_| {
            let snapshot = self.falcon.snapshot(dev);
            error!("{:?}: no halt, {}", self.falcon.engine(), snapshot);
            BringupError::Timeout { stage: "ucode halt" }
        })?;

        self.advance(BootStage::Halted);
        let snapshot = self.falcon.snapshot(dev);
        let mailbox0 = snapshot.mailbox0;
        debug!(
            "{:?}: halted, cpuctl={:#x} mailbox0={:#x}",
            self.falcon.engine(),
            cpuctl,
            mailbox0
        );
        if mailbox0 != 0 {
            return Err(BringupError::ExecutionFailed {
                code: mailbox0,
                snapshot,
            });
        }
        Ok(BootOutcome { mailbox0, snapshot })
    }

    /// Boot the RISC-V core from a WPR metadata descriptor.
    pub fn run_riscv(
        &mut self,
        dev: &mut impl GpuDevice,
        meta_phys: u64,
        libos_phys: u64,
    ) -> Result<()> {
        self.advance(BootStage::Reset);
        self.falcon.reset(dev);

        self.advance(BootStage::Started);
        self.falcon
            .boot_riscv(dev, meta_phys, libos_phys)
            .map_err(|_| BringupError::Timeout {
                stage: "RISC-V active",
            })?;
        self.advance(BootStage::RiscvActive);
        Ok(())
    }

    fn load(
        &mut self,
        dev: &mut impl GpuDevice,
        image: &UcodeImage<'_>,
        policy: BootPolicy,
    ) -> Result<()> {
        if policy.load_path == LoadPath::Dma {
            match self.load_dma(dev, image, policy.secure_imem) {
                Ok(()) => return Ok(()),
                Err(BringupError::TransferTimeout { imem, offset }) => {
                    warn!(
                        "{:?}: DMA stalled ({} offset {:#x}), retrying via PIO",
                        self.falcon.engine(),
                        if imem { "IMEM" } else { "DMEM" },
                        offset
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.load_pio(dev, image, policy.secure_imem);
        Ok(())
    }

    fn load_dma(
        &mut self,
        dev: &mut impl GpuDevice,
        image: &UcodeImage<'_>,
        secure_imem: bool,
    ) -> Result<()> {
        let imem_len = image.imem.len().next_multiple_of(DMA_CHUNK);
        let dmem_len = image.dmem.len().next_multiple_of(DMA_CHUNK);
        let mut staging = dev
            .allocate_dma(imem_len + dmem_len)
            .map_err(|_| BringupError::DmaAllocFailed {
                size: imem_len + dmem_len,
            })?;
        staging.write_at(0, image.imem)?;
        staging.write_at(imem_len, image.dmem)?;
        dev.dma_sync(&staging);

        self.falcon.program_dma_base(dev, staging.phys());
        for pos in (0..imem_len).step_by(DMA_CHUNK) {
            self.falcon
                .dma_transfer_256(
                    dev,
                    image.imem_phys_base + pos as u32,
                    pos as u32,
                    true,
                    secure_imem,
                )
                .map_err(|_| BringupError::TransferTimeout {
                    imem: true,
                    offset: pos as u32,
                })?;
        }
        for pos in (0..dmem_len).step_by(DMA_CHUNK) {
            self.falcon
                .dma_transfer_256(
                    dev,
                    image.dmem_phys_base + pos as u32,
                    (imem_len + pos) as u32,
                    false,
                    false,
                )
                .map_err(|_| BringupError::TransferTimeout {
                    imem: false,
                    offset: pos as u32,
                })?;
        }
        Ok(())
    }

    fn load_pio(&mut self, dev: &mut impl GpuDevice, image: &UcodeImage<'_>, secure: bool) {
        self.falcon.load_imem_pio(
            dev,
            image.imem,
            image.imem_phys_base,
            image.imem_virt_base,
            secure,
        );
        self.falcon.load_dmem_pio(dev, image.dmem, image.dmem_phys_base);
    }
}
