// Licensed under the Apache-2.0 license

//! The bring-up session: one exclusive attempt to take a GPU's
//! security processor from reset to a live RPC channel. All mutable
//! bring-up state (queues, staged firmware, WPR2 cache) hangs off the
//! session; nothing is process-global.

use core::time::Duration;

use gsp_config::{ChipConfig, FalconEngine};
use gsp_vbios::FwsecUcode;
use log::{info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::{DmaBuffer, GpuDevice};
use crate::falcon::Falcon;
use crate::fuse;
use crate::fwsec;
use crate::radix3::{build_radix3, stage_firmware, Radix3, StagedFirmware};
use crate::rpc::{
    wait_for_function, QueueRing, RpcEvent, RpcMessage, FN_GSP_SET_SYSTEM_INFO,
};
use crate::sequencer::{BootPolicy, BootSequencer, BromParams, UcodeImage};
use crate::wpr::{
    build_wpr_meta, frts_error_code, read_wpr2, BootloaderSections, GspLibosInitArgs,
    WprMetaParams, FRTS_SIZE,
};
pub use crate::wpr::Wpr2Region;
use crate::{BringupError, Result};

/// Ring size for each RPC queue.
const RPC_QUEUE_SIZE: usize = 0x10000;

/// Budget for a blocking RPC reply.
const RPC_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Hardware description sent to the firmware right after boot.
/// Packed wire layout, little-endian.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default)]
pub struct GspSystemInfo {
    pub gpu_phys_addr: u64,
    pub gpu_phys_size: u64,
    pub fb_phys_addr: u64,
    pub fb_phys_size: u64,
    pub pci_domain: u32,
    pub pci_bus: u32,
    pub pci_device: u32,
    pub pci_function: u32,
    pub pci_vendor_id: u32,
    pub pci_device_id: u32,
    pub pci_sub_vendor_id: u32,
    pub pci_sub_device_id: u32,
    pub pci_revision_id: u32,
}

/// Everything the primary-core boot needs from its caller.
pub struct PrimaryFirmware<'a> {
    /// GSP-RM ELF image.
    pub elf: &'a [u8],
    /// Boot binary loaded by the RISC-V boot ROM.
    pub bootloader: &'a [u8],
    pub sections: BootloaderSections,
    /// Detached signature over the ELF.
    pub signature: &'a [u8],
}

/// DMA allocations that must stay alive while the coprocessor runs.
struct BootResources {
    _staged: StagedFirmware,
    _radix3: Radix3,
    _bootloader: DmaBuffer,
    _signature: DmaBuffer,
    _meta: DmaBuffer,
    _libos: DmaBuffer,
}

pub struct BringupSession<'d, D: GpuDevice> {
    dev: &'d mut D,
    cfg: &'static ChipConfig,
    gsp: Falcon,
    cmdq: Option<QueueRing>,
    msgq: Option<QueueRing>,
    resources: Option<BootResources>,
    wpr2: Option<Wpr2Region>,
    init_done: bool,
}

impl<'d, D: GpuDevice> BringupSession<'d, D> {
    pub fn new(dev: &'d mut D, cfg: &'static ChipConfig) -> Self {
        Self {
            dev,
            cfg,
            gsp: Falcon::new(FalconEngine::Gsp, cfg),
            cmdq: None,
            msgq: None,
            resources: None,
            wpr2: None,
            init_done: false,
        }
    }

    pub fn init_done(&self) -> bool {
        self.init_done
    }

    pub fn wpr2(&self) -> Option<Wpr2Region> {
        self.wpr2
    }

    /// Extract the FWSEC ucode from a VBIOS image.
    pub fn extract_fwsec(&self, vbios: &[u8]) -> Result<FwsecUcode> {
        Ok(gsp_vbios::extract_fwsec(vbios, self.cfg.known_rom_offsets)?)
    }

    /// Run FWSEC-FRTS on the GSP falcon to carve out WPR2. `frts_offset`
    /// is the byte offset of the 1 MiB carve-out in the framebuffer.
    pub fn run_fwsec_frts(
        &mut self,
        ucode: &mut FwsecUcode,
        frts_offset: u64,
    ) -> Result<Wpr2Region> {
        if let Some(region) = read_wpr2(self.dev, self.cfg) {
            return Err(BringupError::RegionAlreadyActive {
                lo: (region.lo >> 12) as u32,
                hi: (region.hi >> 12) as u32,
            });
        }

        let selection = fuse::select_signature(self.dev, self.cfg, &ucode.desc)?;
        fwsec::patch_signature(ucode, selection.index)?;
        fwsec::patch_frts_command(ucode, frts_offset)?;

        let image = UcodeImage {
            imem: &ucode.imem,
            imem_phys_base: ucode.desc.imem_phys_base,
            imem_virt_base: ucode.desc.imem_virt_base,
            dmem: &ucode.dmem,
            dmem_phys_base: ucode.desc.dmem_phys_base,
            boot_vector: ucode.desc.boot_vector(),
            brom: Some(BromParams {
                pkc_data_offset: ucode.desc.pkc_data_offset,
                engine_id_mask: ucode.desc.engine_id_mask,
                ucode_id: ucode.desc.ucode_id,
            }),
        };
        let mut seq = BootSequencer::new(&self.gsp);
        seq.run_hs_ucode(self.dev, &image, BootPolicy::default())?;

        let scratch = frts_error_code(self.dev, self.cfg);
        if scratch != 0 {
            let snapshot = self.gsp.snapshot(self.dev);
            return Err(BringupError::ExecutionFailed {
                code: u32::from(scratch),
                snapshot,
            });
        }
        match read_wpr2(self.dev, self.cfg) {
            Some(region) => {
                info!("WPR2 active: {:#x}..{:#x}", region.lo, region.hi);
                self.wpr2 = Some(region);
                Ok(region)
            }
            None => {
                let snapshot = self.gsp.snapshot(self.dev);
                Err(BringupError::RegionNotActivated { snapshot })
            }
        }
    }

    /// Try FWSEC sources in priority order until one activates WPR2.
    /// Each failure is reported; the last error is returned when every
    /// source is exhausted.
    pub fn activate_protected_region(
        &mut self,
        sources: &mut [FwsecUcode],
        frts_offset: u64,
    ) -> Result<Wpr2Region> {
        let mut last = None;
        for (i, ucode) in sources.iter_mut().enumerate() {
            match self.run_fwsec_frts(ucode, frts_offset) {
                Ok(region) => return Ok(region),
                Err(e @ BringupError::RegionAlreadyActive { .. }) => return Err(e),
                Err(e) => {
                    warn!("FWSEC source {} failed: {}", i, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(BringupError::Usage("no FWSEC sources supplied")))
    }

    /// Stage the primary firmware, describe it to the RISC-V core, and
    /// boot it. On return the core is active; initialization completes
    /// asynchronously and is observed via [`Self::rpc_poll_event`] or
    /// during the first [`Self::rpc_call`].
    pub fn boot_primary_core(&mut self, fw: &PrimaryFirmware<'_>) -> Result<()> {
        let wpr2 = self
            .wpr2
            .or_else(|| read_wpr2(self.dev, self.cfg))
            .ok_or(BringupError::Usage("WPR2 must be active before boot"))?;

        let staged = stage_firmware(self.dev, fw.elf)?;
        let radix3 = build_radix3(self.dev, &staged.page_addrs())?;

        let mut bootloader = self.allocate(fw.bootloader.len())?;
        bootloader.write_at(0, fw.bootloader)?;
        self.dev.dma_sync(&bootloader);

        let mut signature = self.allocate(fw.signature.len().max(1))?;
        signature.write_at(0, fw.signature)?;
        self.dev.dma_sync(&signature);

        let cmdq_buf = self.allocate(RPC_QUEUE_SIZE)?;
        let msgq_buf = self.allocate(RPC_QUEUE_SIZE)?;
        // Fresh rings: both pointer pairs start at zero.
        for idx in 0..2 {
            self.dev.write_register(self.cfg.gsp_queue_head(idx), 0);
            self.dev.write_register(self.cfg.gsp_queue_tail(idx), 0);
        }
        let cmdq = QueueRing::command(cmdq_buf, self.cfg)?;
        let msgq = QueueRing::status(msgq_buf, self.cfg)?;

        let meta = build_wpr_meta(&WprMetaParams {
            radix3_root: radix3.root_phys(),
            elf_size: staged.size,
            bootloader_addr: bootloader.phys(),
            bootloader_size: fw.bootloader.len() as u64,
            sections: fw.sections,
            signature_addr: signature.phys(),
            signature_size: fw.signature.len() as u64,
            frts_offset: wpr2.hi - FRTS_SIZE,
            frts_size: FRTS_SIZE,
        });
        let mut meta_buf = self.allocate(core::mem::size_of_val(&meta))?;
        meta_buf.write_at(0, meta.as_bytes())?;
        self.dev.dma_sync(&meta_buf);

        let libos = GspLibosInitArgs {
            dmem_addr: 0,
            gsp_fw_wpr_meta: meta_buf.phys(),
            cmd_queue_offset: cmdq.phys(),
            stat_queue_offset: msgq.phys(),
            queue_size: RPC_QUEUE_SIZE as u64,
        };
        let mut libos_buf = self.allocate(core::mem::size_of_val(&libos))?;
        libos_buf.write_at(0, libos.as_bytes())?;
        self.dev.dma_sync(&libos_buf);

        let mut seq = BootSequencer::new(&self.gsp);
        seq.run_riscv(self.dev, meta_buf.phys(), libos_buf.phys())?;

        self.cmdq = Some(cmdq);
        self.msgq = Some(msgq);
        self.resources = Some(BootResources {
            _staged: staged,
            _radix3: radix3,
            _bootloader: bootloader,
            _signature: signature,
            _meta: meta_buf,
            _libos: libos_buf,
        });
        info!("primary core active, RPC channel up");
        Ok(())
    }

    /// Send one RPC and block for its reply. Out-of-band events
    /// arriving first are absorbed into session state.
    pub fn rpc_call(&mut self, function: u32, params: Vec<u8>) -> Result<RpcMessage> {
        let cmdq = self
            .cmdq
            .as_mut()
            .ok_or(BringupError::Usage("RPC before primary core boot"))?;
        cmdq.enqueue(self.dev, &RpcMessage::request(function, params))?;

        let msgq = match self.msgq.as_mut() {
            Some(q) => q,
            None => return Err(BringupError::Usage("RPC before primary core boot")),
        };
        let init_done = &mut self.init_done;
        wait_for_function(self.dev, msgq, function, RPC_REPLY_TIMEOUT, |event| {
            if event == RpcEvent::InitDone {
                *init_done = true;
            }
        })
    }

    /// Non-blocking poll of the status ring for event messages.
    pub fn rpc_poll_event(&mut self) -> Result<Option<RpcEvent>> {
        let msgq = match self.msgq.as_mut() {
            Some(q) => q,
            None => return Ok(None),
        };
        match msgq.dequeue(self.dev)? {
            None => Ok(None),
            Some(msg) => {
                let event = match msg.header.function {
                    crate::rpc::EVENT_GSP_INIT_DONE => {
                        self.init_done = true;
                        RpcEvent::InitDone
                    }
                    other => RpcEvent::Other(other),
                };
                Ok(Some(event))
            }
        }
    }

    /// Describe the hardware to the firmware (the first RPC after an
    /// init-done event).
    pub fn rpc_set_system_info(&mut self, info: &GspSystemInfo) -> Result<RpcMessage> {
        self.rpc_call(FN_GSP_SET_SYSTEM_INFO, info.as_bytes().to_vec())
    }

    fn allocate(&mut self, size: usize) -> Result<DmaBuffer> {
        self.dev
            .allocate_dma(size)
            .map_err(|_| BringupError::DmaAllocFailed { size })
    }
}
