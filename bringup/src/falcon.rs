// Licensed under the Apache-2.0 license

//! Falcon engine access: reset, memory scrubbing, core selection, PIO
//! and DMA ucode loading, Boot ROM parameters, and the RISC-V boot
//! control block. All offsets are relative to the engine's base so the
//! same code drives GSP and SEC2.

use bitfield::bitfield;
use gsp_config::{ChipConfig, FalconEngine};
use log::{debug, warn};

use crate::device::GpuDevice;
use crate::poll::{wait_on, PollExpired};

pub const FALCON_MAILBOX0: u32 = 0x040;
pub const FALCON_MAILBOX1: u32 = 0x044;
pub const FALCON_ITFEN: u32 = 0x048;
pub const FALCON_RM: u32 = 0x084;
pub const FALCON_HWCFG2: u32 = 0x0F4;
pub const FALCON_CPUCTL: u32 = 0x100;
pub const FALCON_BOOTVEC: u32 = 0x104;
pub const FALCON_DMACTL: u32 = 0x10C;
pub const FALCON_DMATRFBASE: u32 = 0x110;
pub const FALCON_DMATRFMOFFS: u32 = 0x114;
pub const FALCON_DMATRFCMD: u32 = 0x118;
pub const FALCON_DMATRFFBOFFS: u32 = 0x11C;
pub const FALCON_DMATRFBASE1: u32 = 0x128;
pub const FALCON_CPUCTL_ALIAS: u32 = 0x130;
pub const FALCON_ENGINE: u32 = 0x3C0;
pub const FALCON_FBIF_TRANSCFG: u32 = 0x600;
pub const FALCON_FBIF_CTL: u32 = 0x624;

pub const fn falcon_imemc(port: u32) -> u32 {
    0x180 + port * 16
}
pub const fn falcon_imemd(port: u32) -> u32 {
    0x184 + port * 16
}
pub const fn falcon_imemt(port: u32) -> u32 {
    0x188 + port * 16
}
pub const fn falcon_dmemc(port: u32) -> u32 {
    0x1C0 + port * 8
}
pub const fn falcon_dmemd(port: u32) -> u32 {
    0x1C4 + port * 8
}

// Boot ROM (PKC signature verification) parameter block.
pub const FALCON_BROM_MOD_SEL: u32 = 0x1180;
pub const FALCON_BROM_CURR_UCODE_ID: u32 = 0x1198;
pub const FALCON_BROM_ENGIDMASK: u32 = 0x119C;
pub const FALCON_BROM_PARAADDR: u32 = 0x1210;
pub const BROM_MOD_SEL_RSA3K: u32 = 1;

// RISC-V control block, same base as the falcon block.
pub const RISCV_CPUCTL: u32 = 0x388;
pub const RISCV_BR_RETCODE: u32 = 0x400;
pub const RISCV_BCR_CTRL: u32 = 0x668;
pub const RISCV_BCR_DMEM_ADDR: u32 = 0x66C;

pub const RISCV_CPUCTL_STARTCPU: u32 = 1 << 1;
pub const RISCV_CPUCTL_ACTIVE: u32 = 1 << 7;
pub const RISCV_BCR_CTRL_VALID: u32 = 1 << 0;
pub const RISCV_BCR_CTRL_CORE_SELECT_RISCV: u32 = 1 << 4;

const ENGINE_RESET: u32 = 1;
const ITFEN_FBIF: u32 = 1 << 2;
const FBIF_CTL_ALLOW_PHYS_NO_CTX: u32 = 0x80;
const DMACTL_ENABLE: u32 = 0x1;
const DMACTL_SCRUBBING: u32 = 0x6;
const TRANSCFG_TARGET_COHERENT: u32 = 0x01;
const TRANSCFG_MEM_PHYSICAL: u32 = 1 << 2;
pub const MEMC_AINCW: u32 = 1 << 24;
pub const MEMC_AINCR: u32 = 1 << 25;
const IMEMC_SECURE: u32 = 1 << 28;

bitfield! {
    pub struct Cpuctl(u32);
    impl Debug;
    pub startcpu, set_startcpu: 1;
    pub halted, _: 4;
    pub alias_en, _: 6;
}

bitfield! {
    pub struct Hwcfg2(u32);
    impl Debug;
    pub riscv, _: 10;
    pub mem_scrubbing, _: 12;
}

bitfield! {
    pub struct Dmatrfcmd(u32);
    impl Debug;
    pub idle, _: 1;
    pub sec, set_sec: 3, 2;
    pub imem, set_imem: 4;
    pub size, set_size: 10, 8;
}

/// 256-byte DMA burst (size field encoding 6).
const DMATRFCMD_SIZE_256B: u32 = 6;
pub const DMA_CHUNK: usize = 256;

/// One falcon engine instance. Holds the BAR0 base and the chip's
/// timing budgets; all state lives in the device.
pub struct Falcon {
    base: u32,
    engine: FalconEngine,
    cfg: &'static ChipConfig,
}

impl Falcon {
    pub fn new(engine: FalconEngine, cfg: &'static ChipConfig) -> Self {
        Self {
            base: cfg.falcon_base(engine),
            engine,
            cfg,
        }
    }

    pub fn engine(&self) -> FalconEngine {
        self.engine
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn read(&self, dev: &mut impl GpuDevice, offset: u32) -> u32 {
        dev.read_register(self.base + offset)
    }

    pub fn write(&self, dev: &mut impl GpuDevice, offset: u32, value: u32) {
        dev.write_register(self.base + offset, value);
    }

    /// Pulse the engine reset, wait for memory scrubbing, and hand the
    /// falcon to this driver by stamping the chip id into the RM
    /// scratch register.
    pub fn reset(&self, dev: &mut impl GpuDevice) {
        self.write(dev, FALCON_ENGINE, ENGINE_RESET);
        dev.sleep_us(10);
        self.write(dev, FALCON_ENGINE, 0);

        // Scrub overrun is survivable: loads to unscrubbed memory fail
        // later with a diagnosable halt, so warn and continue.
        if self.wait_mem_scrubbing(dev).is_err() {
            warn!(
                "{:?}: memory scrubbing still busy after {:?}",
                self.engine, self.cfg.scrub_timeout
            );
        }

        let boot0 = dev.read_register(self.cfg.pmc_boot_0);
        self.write(dev, FALCON_RM, boot0);
    }

    fn wait_mem_scrubbing(&self, dev: &mut impl GpuDevice) -> Result<(), PollExpired> {
        let budget = self.cfg.scrub_timeout;
        wait_on(dev, budget, |d| {
            let hwcfg2 = Hwcfg2(self.read(d, FALCON_HWCFG2));
            let dmactl = self.read(d, FALCON_DMACTL);
            (!hwcfg2.mem_scrubbing() && dmactl & DMACTL_SCRUBBING == 0).then_some(())
        })
    }

    pub fn is_riscv_capable(&self, dev: &mut impl GpuDevice) -> bool {
        Hwcfg2(self.read(dev, FALCON_HWCFG2)).riscv()
    }

    /// On dual-core engines, route execution to the legacy falcon core.
    /// No-op for engines without a RISC-V core.
    pub fn select_falcon_core(&self, dev: &mut impl GpuDevice) -> Result<(), PollExpired> {
        if !self.is_riscv_capable(dev) {
            return Ok(());
        }
        self.write(dev, RISCV_BCR_CTRL, 0);
        wait_on(dev, self.cfg.core_select_timeout, |d| {
            (self.read(d, RISCV_BCR_CTRL) & RISCV_BCR_CTRL_VALID != 0).then_some(())
        })
    }

    /// Point the FBIF at coherent system memory with physical
    /// addressing and no bound context, and enable the DMA engine.
    pub fn setup_dma_context(&self, dev: &mut impl GpuDevice) {
        self.write(dev, FALCON_FBIF_CTL, FBIF_CTL_ALLOW_PHYS_NO_CTX);
        self.write(dev, FALCON_DMACTL, DMACTL_ENABLE);
        self.write(
            dev,
            FALCON_FBIF_TRANSCFG,
            TRANSCFG_TARGET_COHERENT | TRANSCFG_MEM_PHYSICAL,
        );
        self.write(dev, FALCON_ITFEN, ITFEN_FBIF);
    }

    pub fn program_dma_base(&self, dev: &mut impl GpuDevice, phys: u64) {
        self.write(dev, FALCON_DMATRFBASE, (phys >> 8) as u32);
        self.write(dev, FALCON_DMATRFBASE1, (phys >> 40) as u32);
    }

    /// Issue one 256-byte DMA burst and wait for the engine to go idle.
    /// `secure` marks the burst for Boot ROM authentication; HS IMEM
    /// loads require it.
    pub fn dma_transfer_256(
        &self,
        dev: &mut impl GpuDevice,
        mem_offset: u32,
        src_offset: u32,
        to_imem: bool,
        secure: bool,
    ) -> Result<(), PollExpired> {
        self.write(dev, FALCON_DMATRFMOFFS, mem_offset);
        self.write(dev, FALCON_DMATRFFBOFFS, src_offset);

        let mut cmd = Dmatrfcmd(0);
        cmd.set_size(DMATRFCMD_SIZE_256B);
        cmd.set_imem(to_imem);
        if secure {
            cmd.set_sec(1);
        }
        self.write(dev, FALCON_DMATRFCMD, cmd.0);

        wait_on(dev, self.cfg.dma_idle_timeout, |d| {
            Dmatrfcmd(self.read(d, FALCON_DMATRFCMD))
                .idle()
                .then_some(())
        })
    }

    /// PIO load into IMEM. Tags are stamped per 256-byte block from the
    /// virtual load address so the falcon's IMEM MMU resolves fetches.
    pub fn load_imem_pio(
        &self,
        dev: &mut impl GpuDevice,
        data: &[u8],
        dst_offset: u32,
        virt_base: u32,
        secure: bool,
    ) {
        let sec = if secure { IMEMC_SECURE } else { 0 };
        for (block, chunk) in data.chunks(DMA_CHUNK).enumerate() {
            let block_byte = block as u32 * DMA_CHUNK as u32;
            self.write(
                dev,
                falcon_imemc(0),
                (dst_offset + block_byte) | MEMC_AINCW | sec,
            );
            self.write(dev, falcon_imemt(0), (virt_base + block_byte) >> 8);
            for word in chunk.chunks(4) {
                let mut w = [0u8; 4];
                w[..word.len()].copy_from_slice(word);
                self.write(dev, falcon_imemd(0), u32::from_le_bytes(w));
            }
        }
        debug!(
            "{:?}: PIO loaded {:#x} bytes to IMEM @ {:#x}",
            self.engine,
            data.len(),
            dst_offset
        );
    }

    pub fn load_dmem_pio(&self, dev: &mut impl GpuDevice, data: &[u8], dst_offset: u32) {
        self.write(dev, falcon_dmemc(0), dst_offset | MEMC_AINCW);
        for word in data.chunks(4) {
            let mut w = [0u8; 4];
            w[..word.len()].copy_from_slice(word);
            self.write(dev, falcon_dmemd(0), u32::from_le_bytes(w));
        }
    }

    pub fn dmem_read_u32(&self, dev: &mut impl GpuDevice, offset: u32) -> u32 {
        self.write(dev, falcon_dmemc(0), offset | MEMC_AINCR);
        self.read(dev, falcon_dmemd(0))
    }

    pub fn dmem_write_u32(&self, dev: &mut impl GpuDevice, offset: u32, value: u32) {
        self.write(dev, falcon_dmemc(0), offset);
        self.write(dev, falcon_dmemd(0), value);
    }

    /// Hand the Boot ROM the signature location and identity of the
    /// ucode it is about to verify.
    pub fn program_brom_params(
        &self,
        dev: &mut impl GpuDevice,
        pkc_dmem_offset: u32,
        engine_id_mask: u16,
        ucode_id: u8,
    ) {
        self.write(dev, FALCON_BROM_PARAADDR, pkc_dmem_offset);
        self.write(dev, FALCON_BROM_ENGIDMASK, u32::from(engine_id_mask));
        self.write(dev, FALCON_BROM_CURR_UCODE_ID, u32::from(ucode_id));
        self.write(dev, FALCON_BROM_MOD_SEL, BROM_MOD_SEL_RSA3K);
    }

    pub fn set_boot_vector(&self, dev: &mut impl GpuDevice, boot_vector: u32) {
        self.write(dev, FALCON_BOOTVEC, boot_vector);
    }

    /// Kick the CPU. Newer falcons gate CPUCTL behind an alias register
    /// once secure mode arms; honor the alias_en bit.
    pub fn start_cpu(&self, dev: &mut impl GpuDevice) {
        let cpuctl = Cpuctl(self.read(dev, FALCON_CPUCTL));
        let mut start = Cpuctl(0);
        start.set_startcpu(true);
        if cpuctl.alias_en() {
            self.write(dev, FALCON_CPUCTL_ALIAS, start.0);
        } else {
            self.write(dev, FALCON_CPUCTL, start.0);
        }
    }

    /// Wait for the halted bit; returns the final CPUCTL value.
    pub fn wait_for_halt(&self, dev: &mut impl GpuDevice) -> Result<u32, PollExpired> {
        wait_on(dev, self.cfg.halt_timeout, |d| {
            let cpuctl = Cpuctl(self.read(d, FALCON_CPUCTL));
            cpuctl.halted().then_some(cpuctl.0)
        })
    }

    pub fn mailbox0(&self, dev: &mut impl GpuDevice) -> u32 {
        self.read(dev, FALCON_MAILBOX0)
    }

    pub fn mailbox1(&self, dev: &mut impl GpuDevice) -> u32 {
        self.read(dev, FALCON_MAILBOX1)
    }

    /// Capture the registers a failure report needs.
    pub fn snapshot(&self, dev: &mut impl GpuDevice) -> crate::HaltSnapshot {
        let scratch = dev.read_register(self.cfg.vbios_scratch_0e);
        crate::HaltSnapshot {
            cpuctl: self.read(dev, FALCON_CPUCTL),
            mailbox0: self.mailbox0(dev),
            mailbox1: self.mailbox1(dev),
            scratch_error: (scratch >> 16) as u16,
        }
    }

    /// Boot the RISC-V core: point the boot control at the WPR metadata,
    /// hand the libos argument address over in the mailbox pair, select
    /// the core, start it, and wait for the active bit.
    pub fn boot_riscv(
        &self,
        dev: &mut impl GpuDevice,
        meta_phys: u64,
        libos_phys: u64,
    ) -> Result<(), PollExpired> {
        self.write(dev, FALCON_MAILBOX0, libos_phys as u32);
        self.write(dev, FALCON_MAILBOX1, (libos_phys >> 32) as u32);
        self.write(dev, RISCV_BCR_DMEM_ADDR, (meta_phys >> 8) as u32);
        self.write(dev, RISCV_BCR_CTRL, RISCV_BCR_CTRL_CORE_SELECT_RISCV);
        wait_on(dev, self.cfg.core_select_timeout, |d| {
            (self.read(d, RISCV_BCR_CTRL) & RISCV_BCR_CTRL_VALID != 0).then_some(())
        })?;

        self.write(dev, RISCV_CPUCTL, RISCV_CPUCTL_STARTCPU);
        wait_on(dev, self.cfg.riscv_active_timeout, |d| {
            (self.read(d, RISCV_CPUCTL) & RISCV_CPUCTL_ACTIVE != 0).then_some(())
        })?;
        debug!(
            "{:?}: RISC-V active, BR_RETCODE={:#x}",
            self.engine,
            self.read(dev, RISCV_BR_RETCODE)
        );
        Ok(())
    }
}
