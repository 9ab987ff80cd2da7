/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Software model of the GPU security processor for testing the
    bring-up pipeline without hardware. Implements the register map the
    pipeline drives: falcon reset and scrubbing, PIO and DMA ucode
    loading, FWSEC execution with WPR2 arming, the RISC-V boot control
    block, and a firmware-side RPC responder over the message queues.
    Fault injection switches model the interesting failure modes.

--*/

use std::collections::{BTreeMap, HashMap};

use gsp_bringup::falcon::{
    falcon_dmemc, falcon_dmemd, falcon_imemc, falcon_imemd, falcon_imemt, FALCON_BROM_MOD_SEL,
    FALCON_CPUCTL, FALCON_CPUCTL_ALIAS, FALCON_DMATRFBASE, FALCON_DMATRFBASE1, FALCON_DMATRFCMD,
    FALCON_DMATRFFBOFFS, FALCON_DMATRFMOFFS, FALCON_ENGINE, FALCON_HWCFG2, FALCON_MAILBOX0,
    FALCON_MAILBOX1, MEMC_AINCR, MEMC_AINCW, RISCV_BCR_CTRL, RISCV_BCR_CTRL_VALID,
    RISCV_BCR_DMEM_ADDR, RISCV_BR_RETCODE, RISCV_CPUCTL, RISCV_CPUCTL_ACTIVE,
    RISCV_CPUCTL_STARTCPU,
};
use gsp_bringup::fwsec::{DMEM_MAPPER_SIGNATURE, FWSEC_CMD_FRTS};
use gsp_bringup::rpc::{
    QueueElementHeader, RpcMessageHeader, EVENT_GSP_INIT_DONE, QUEUE_ELEMENT_PAGE,
    RPC_HEADER_SIZE, RPC_HEADER_VERSION, RPC_SIGNATURE,
};
use gsp_bringup::wpr::GSP_FW_WPR_META_MAGIC;
use gsp_bringup::{DmaBuffer, GpuDevice, Result};
use gsp_config::ChipConfig;
use log::{debug, trace, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use zerocopy::{FromBytes, IntoBytes};

const IMEM_SIZE: usize = 0x20000;
const DMEM_SIZE: usize = 0x10000;

/// Chip id stamped into PMC_BOOT_0; an AD102 revision.
const CHIP_BOOT_0: u32 = 0x1920_00A1;

/// Scrub takes a little virtual time after each reset.
const SCRUB_DELAY_US: u64 = 20;

/// Mailbox code when HS ucode starts without Boot ROM parameters.
pub const MODEL_ERR_BROM_CONFIG: u32 = 0x0B;

const CPUCTL_STARTCPU: u32 = 1 << 1;
const CPUCTL_HALTED: u32 = 1 << 4;
const HWCFG2_RISCV: u32 = 1 << 10;
const HWCFG2_MEM_SCRUBBING: u32 = 1 << 12;
const DMATRFCMD_IDLE: u32 = 1 << 1;
const DMATRFCMD_IMEM: u32 = 1 << 4;
const WPR2_HI_ENABLED: u32 = 1 << 31;
const BR_RETCODE_FAIL: u32 = 2;
const BR_RETCODE_PASS: u32 = 3;

const ELEMENT_HEADER_SIZE: usize = core::mem::size_of::<QueueElementHeader>();

/// Failure modes the model can reproduce on demand.
#[derive(Debug, Default, Clone)]
pub struct FaultInjection {
    /// DMA transfers never reach the idle state.
    pub dma_never_idle: bool,
    /// Started ucode never halts.
    pub never_halt: bool,
    /// Started ucode halts with this mailbox0 code.
    pub falcon_error: Option<u32>,
    /// FWSEC reports this FRTS error in the scratch register.
    pub frts_error: Option<u16>,
    /// FWSEC halts cleanly but never arms WPR2.
    pub refuse_wpr2: bool,
    /// The RISC-V core never reports active.
    pub riscv_never_active: bool,
    /// The firmware stops answering RPCs.
    pub drop_rpc_replies: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct MemPort {
    offset: u32,
    inc_write: bool,
    inc_read: bool,
}

impl MemPort {
    fn from_control(value: u32) -> Self {
        Self {
            offset: value & 0x00FF_FFFF,
            inc_write: value & MEMC_AINCW != 0,
            inc_read: value & MEMC_AINCR != 0,
        }
    }
}

/// The emulated GPU. One GSP falcon with its RISC-V sibling, the fuse
/// block, WPR2 bound registers, and system memory reachable over DMA.
pub struct EmulatedGpu {
    cfg: &'static ChipConfig,
    faults: FaultInjection,

    regs: HashMap<u32, u32>,
    /// Device view of DMA memory, keyed by allocation base address.
    mem: BTreeMap<u64, Vec<u8>>,
    next_phys: u64,
    rng: StdRng,
    now_us: u64,

    imem: Vec<u8>,
    dmem: Vec<u8>,
    imem_port: MemPort,
    dmem_port: MemPort,
    scrub_done_at: u64,

    gsp_running: bool,
    cmdq_phys: u64,
    msgq_phys: u64,
    queue_size: u32,
    msgq_wr: u32,
    msgq_seq: u32,
    rpc_log: Vec<u32>,
}

impl EmulatedGpu {
    pub fn new(cfg: &'static ChipConfig) -> Self {
        let mut regs = HashMap::new();
        regs.insert(cfg.pmc_boot_0, CHIP_BOOT_0);
        Self {
            cfg,
            faults: FaultInjection::default(),
            regs,
            mem: BTreeMap::new(),
            next_phys: 0x8000_0000,
            rng: StdRng::seed_from_u64(0x6773_7000),
            now_us: 0,
            imem: vec![0; IMEM_SIZE],
            dmem: vec![0; DMEM_SIZE],
            imem_port: MemPort::default(),
            dmem_port: MemPort::default(),
            scrub_done_at: 0,
            gsp_running: false,
            cmdq_phys: 0,
            msgq_phys: 0,
            queue_size: 0,
            msgq_wr: 0,
            msgq_seq: 0,
            rpc_log: Vec::new(),
        }
    }

    pub fn faults_mut(&mut self) -> &mut FaultInjection {
        &mut self.faults
    }

    /// Raw register write without modeled side effects.
    pub fn poke(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
    }

    pub fn peek(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    /// Blow an anti-rollback fuse word: `bank_base` is one of the
    /// per-engine bases, `ucode_id` is 1-based.
    pub fn set_fuse_version(&mut self, bank_base: u32, ucode_id: u8, raw: u32) {
        self.regs
            .insert(bank_base + 4 * (u32::from(ucode_id) - 1), raw);
    }

    /// True once the RISC-V core accepted the boot descriptor.
    pub fn gsp_running(&self) -> bool {
        self.gsp_running
    }

    /// RPC functions the firmware side has consumed, in order.
    pub fn rpc_log(&self) -> &[u32] {
        &self.rpc_log
    }

    /// Inject an out-of-band event message into the status queue.
    pub fn push_event(&mut self, function: u32, params: &[u8]) {
        self.push_message(function, 0, params);
    }

    fn gsp_base(&self) -> u32 {
        self.cfg.gsp_falcon_base
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn gsp_reg(&self, rel: u32) -> u32 {
        self.reg(self.gsp_base() + rel)
    }

    fn set_gsp_reg(&mut self, rel: u32, value: u32) {
        self.regs.insert(self.gsp_base() + rel, value);
    }

    fn reset_falcon(&mut self) {
        let base = self.gsp_base();
        self.regs
            .retain(|&k, _| !(base..base + 0x1300).contains(&k));
        self.imem.fill(0);
        self.dmem.fill(0);
        self.imem_port = MemPort::default();
        self.dmem_port = MemPort::default();
        self.scrub_done_at = self.now_us + SCRUB_DELAY_US;
        self.gsp_running = false;
        debug!("model: falcon reset, scrub until t+{}us", SCRUB_DELAY_US);
    }

    fn port_write(&mut self, to_imem: bool, value: u32) {
        let port = if to_imem {
            &mut self.imem_port
        } else {
            &mut self.dmem_port
        };
        let at = port.offset as usize;
        if port.inc_write {
            port.offset = port.offset.wrapping_add(4);
        }
        let target = if to_imem { &mut self.imem } else { &mut self.dmem };
        if at + 4 <= target.len() {
            target[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn port_read(&mut self, from_imem: bool) -> u32 {
        let port = if from_imem {
            &mut self.imem_port
        } else {
            &mut self.dmem_port
        };
        let at = port.offset as usize;
        if port.inc_read {
            port.offset = port.offset.wrapping_add(4);
        }
        let source = if from_imem { &self.imem } else { &self.dmem };
        if at + 4 <= source.len() {
            u32::from_le_bytes(source[at..at + 4].try_into().unwrap_or([0; 4]))
        } else {
            0
        }
    }

    fn run_dma(&mut self, cmd: u32) {
        if self.faults.dma_never_idle {
            return;
        }
        let base = (u64::from(self.gsp_reg(FALCON_DMATRFBASE1)) << 40)
            | (u64::from(self.gsp_reg(FALCON_DMATRFBASE)) << 8);
        let src = base + u64::from(self.gsp_reg(FALCON_DMATRFFBOFFS));
        let dst = self.gsp_reg(FALCON_DMATRFMOFFS) as usize;
        let bytes = self.mem_read(src, 256);
        let target = if cmd & DMATRFCMD_IMEM != 0 {
            &mut self.imem
        } else {
            &mut self.dmem
        };
        if dst + 256 <= target.len() {
            target[dst..dst + 256].copy_from_slice(&bytes);
        }
        self.set_gsp_reg(FALCON_DMATRFCMD, cmd | DMATRFCMD_IDLE);
    }

    fn dmem_u32(&self, offset: usize) -> u32 {
        match self.dmem.get(offset..offset + 4) {
            Some(b) => u32::from_le_bytes(b.try_into().unwrap_or([0; 4])),
            None => 0,
        }
    }

    fn start_falcon(&mut self) {
        if self.faults.never_halt {
            debug!("model: ucode started, never halting");
            return;
        }
        self.set_gsp_reg(FALCON_CPUCTL, CPUCTL_HALTED);
        let mailbox0 = match self.faults.falcon_error {
            Some(code) => code,
            None => self.execute_fwsec(),
        };
        self.set_gsp_reg(FALCON_MAILBOX0, mailbox0);
    }

    /// What the FWSEC ucode would do after Boot ROM verification: read
    /// the init command from its DMEM mapper and execute it.
    fn execute_fwsec(&mut self) -> u32 {
        if self.gsp_reg(FALCON_BROM_MOD_SEL) != 1 {
            warn!("model: HS start without Boot ROM parameters");
            return MODEL_ERR_BROM_CONFIG;
        }
        let mapper = match (0..self.dmem.len().saturating_sub(64))
            .step_by(4)
            .find(|&off| self.dmem_u32(off) == DMEM_MAPPER_SIGNATURE)
        {
            Some(off) => off,
            None => return 0,
        };
        if self.dmem_u32(mapper + 44) != FWSEC_CMD_FRTS {
            return 0;
        }
        // Mapper-relative command buffer first, DMEM-relative second.
        let buffer_offset = self.dmem_u32(mapper + 8) as usize;
        let cmd = match [mapper + buffer_offset, buffer_offset].into_iter().find(|&at| {
            at + 44 <= self.dmem.len() && self.dmem_u32(at) == 1 && self.dmem_u32(at + 40) == 2
        }) {
            Some(at) => at,
            None => return 0,
        };
        let offset_4k = self.dmem_u32(cmd + 32);
        let size_4k = self.dmem_u32(cmd + 36);

        if let Some(err) = self.faults.frts_error {
            self.regs
                .insert(self.cfg.vbios_scratch_0e, u32::from(err) << 16);
            return 0;
        }
        if self.faults.refuse_wpr2 {
            return 0;
        }
        self.regs.insert(self.cfg.vbios_scratch_0e, 0);
        self.regs.insert(self.cfg.wpr2_addr_lo, offset_4k);
        self.regs
            .insert(self.cfg.wpr2_addr_hi, WPR2_HI_ENABLED | (offset_4k + size_4k));
        debug!(
            "model: WPR2 armed, pages {:#x}..{:#x}",
            offset_4k,
            offset_4k + size_4k
        );
        0
    }

    fn start_riscv(&mut self) {
        if self.faults.riscv_never_active {
            return;
        }
        if self.reg(self.cfg.wpr2_addr_hi) & WPR2_HI_ENABLED == 0 {
            warn!("model: RISC-V start without WPR2");
            self.set_gsp_reg(RISCV_BR_RETCODE, BR_RETCODE_FAIL);
            return;
        }
        let meta_phys = u64::from(self.gsp_reg(RISCV_BCR_DMEM_ADDR)) << 8;
        let meta = self.mem_read(meta_phys, 4);
        let magic = u32::from_le_bytes(meta[..4].try_into().unwrap_or([0; 4]));
        if magic != GSP_FW_WPR_META_MAGIC {
            warn!("model: bad WPR meta magic {:#x}", magic);
            self.set_gsp_reg(RISCV_BR_RETCODE, BR_RETCODE_FAIL);
            return;
        }
        let libos_phys = u64::from(self.gsp_reg(FALCON_MAILBOX0))
            | (u64::from(self.gsp_reg(FALCON_MAILBOX1)) << 32);
        let args = self.mem_read(libos_phys, 40);
        let word = |at: usize| u64::from_le_bytes(args[at..at + 8].try_into().unwrap_or([0; 8]));
        self.cmdq_phys = word(16);
        self.msgq_phys = word(24);
        self.queue_size = word(32) as u32;
        self.msgq_wr = 0;
        self.msgq_seq = 0;

        self.set_gsp_reg(RISCV_BR_RETCODE, BR_RETCODE_PASS);
        let cpuctl = self.gsp_reg(RISCV_CPUCTL);
        self.set_gsp_reg(RISCV_CPUCTL, cpuctl | RISCV_CPUCTL_ACTIVE);
        self.gsp_running = true;
        debug!(
            "model: RISC-V active, queues at {:#x}/{:#x} size {:#x}",
            self.cmdq_phys, self.msgq_phys, self.queue_size
        );
        self.push_message(EVENT_GSP_INIT_DONE, 0, &[]);
    }

    /// Firmware side of the status ring: append one element and publish
    /// the new write pointer.
    fn push_message(&mut self, function: u32, rpc_result: u32, params: &[u8]) {
        if !self.gsp_running || self.queue_size == 0 {
            return;
        }
        let rpc = RpcMessageHeader {
            signature: RPC_SIGNATURE,
            header_version: RPC_HEADER_VERSION,
            rpc_result,
            rpc_result_priv: 0,
            function,
            length: (RPC_HEADER_SIZE + params.len()) as u32,
        };
        let mut payload = rpc.as_bytes().to_vec();
        payload.extend_from_slice(params);
        let elem_count = (ELEMENT_HEADER_SIZE + payload.len()).div_ceil(QUEUE_ELEMENT_PAGE);
        let header = QueueElementHeader {
            checksum: crc32fast::hash(&payload),
            seq_num: self.msgq_seq,
            elem_count: elem_count as u32,
            reserved: 0,
        };
        let at = self.msgq_wr;
        self.ring_write(self.msgq_phys, at, header.as_bytes());
        let payload_at = (at + ELEMENT_HEADER_SIZE as u32) % self.queue_size;
        self.ring_write(self.msgq_phys, payload_at, &payload);

        self.msgq_seq = self.msgq_seq.wrapping_add(1);
        self.msgq_wr = (at + (elem_count * QUEUE_ELEMENT_PAGE) as u32) % self.queue_size;
        let head_reg = self.cfg.gsp_queue_head(1);
        let wr = self.msgq_wr;
        self.regs.insert(head_reg, wr);
        trace!("model: pushed fn {:#x}, head(1) -> {:#x}", function, wr);
    }

    /// Firmware side of the command ring: consume everything the host
    /// has published and answer each request.
    fn service_command_queue(&mut self) {
        if !self.gsp_running || self.queue_size == 0 {
            return;
        }
        let size = self.queue_size;
        let tail = self.reg(self.cfg.gsp_queue_tail(0)) % size;
        let mut head = self.reg(self.cfg.gsp_queue_head(0)) % size;
        while head != tail {
            let header_bytes = self.ring_read(self.cmdq_phys, head, ELEMENT_HEADER_SIZE);
            let header = match QueueElementHeader::read_from_bytes(&header_bytes) {
                Ok(h) => h,
                Err(_) => break,
            };
            let elem_count = header.elem_count as usize;
            if elem_count == 0 || (elem_count * QUEUE_ELEMENT_PAGE) as u32 > size {
                warn!("model: corrupt command element at {:#x}", head);
                break;
            }
            let rpc_at = (head + ELEMENT_HEADER_SIZE as u32) % size;
            let rpc_bytes = self.ring_read(self.cmdq_phys, rpc_at, RPC_HEADER_SIZE);
            if let Ok(rpc) = RpcMessageHeader::read_from_bytes(&rpc_bytes) {
                let length = (rpc.length as usize)
                    .clamp(RPC_HEADER_SIZE, elem_count * QUEUE_ELEMENT_PAGE);
                let payload = self.ring_read(self.cmdq_phys, rpc_at, length);
                if rpc.signature == RPC_SIGNATURE && crc32fast::hash(&payload) == header.checksum {
                    self.rpc_log.push(rpc.function);
                    if !self.faults.drop_rpc_replies {
                        let params = payload[RPC_HEADER_SIZE..].to_vec();
                        self.push_message(rpc.function, 0, &params);
                    }
                } else {
                    warn!("model: dropping corrupt rpc at {:#x}", head);
                }
            }
            head = (head + (elem_count * QUEUE_ELEMENT_PAGE) as u32) % size;
        }
        self.regs.insert(self.cfg.gsp_queue_head(0), head);
    }

    fn ring_write(&mut self, ring_phys: u64, at: u32, bytes: &[u8]) {
        let size = self.queue_size as usize;
        let at = at as usize;
        let first = bytes.len().min(size - at);
        self.mem_write(ring_phys + at as u64, &bytes[..first]);
        if first < bytes.len() {
            self.mem_write(ring_phys, &bytes[first..]);
        }
    }

    fn ring_read(&self, ring_phys: u64, at: u32, len: usize) -> Vec<u8> {
        let size = self.queue_size as usize;
        let at = at as usize;
        let first = len.min(size - at);
        let mut out = self.mem_read(ring_phys + at as u64, first);
        if first < len {
            out.extend_from_slice(&self.mem_read(ring_phys, len - first));
        }
        out
    }

    fn mem_write(&mut self, phys: u64, bytes: &[u8]) {
        if let Some((&start, buf)) = self.mem.range_mut(..=phys).next_back() {
            let off = (phys - start) as usize;
            if off + bytes.len() <= buf.len() {
                buf[off..off + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        warn!("model: device write to unmapped {:#x}", phys);
    }

    /// Reads of unmapped addresses return zeros, as an idle bus would.
    fn mem_read(&self, phys: u64, len: usize) -> Vec<u8> {
        if let Some((&start, buf)) = self.mem.range(..=phys).next_back() {
            let off = (phys - start) as usize;
            if off + len <= buf.len() {
                return buf[off..off + len].to_vec();
            }
        }
        vec![0; len]
    }
}

impl GpuDevice for EmulatedGpu {
    fn read_register(&mut self, offset: u32) -> u32 {
        let rel = offset.wrapping_sub(self.gsp_base());
        match rel {
            FALCON_HWCFG2 => {
                let scrubbing = if self.now_us < self.scrub_done_at {
                    HWCFG2_MEM_SCRUBBING
                } else {
                    0
                };
                HWCFG2_RISCV | scrubbing
            }
            r if r == falcon_dmemd(0) => self.port_read(false),
            r if r == falcon_imemd(0) => self.port_read(true),
            _ => self.reg(offset),
        }
    }

    fn write_register(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
        if offset == self.cfg.gsp_queue_tail(0) {
            self.service_command_queue();
            return;
        }
        let rel = offset.wrapping_sub(self.gsp_base());
        match rel {
            FALCON_ENGINE if value == 1 => self.reset_falcon(),
            RISCV_BCR_CTRL => {
                // The boot control block latches immediately.
                self.regs.insert(offset, value | RISCV_BCR_CTRL_VALID);
            }
            r if r == falcon_imemc(0) => self.imem_port = MemPort::from_control(value),
            r if r == falcon_dmemc(0) => self.dmem_port = MemPort::from_control(value),
            r if r == falcon_imemd(0) => self.port_write(true, value),
            r if r == falcon_dmemd(0) => self.port_write(false, value),
            r if r == falcon_imemt(0) => {} // virtual tags are not modeled
            FALCON_DMATRFCMD => self.run_dma(value),
            FALCON_CPUCTL | FALCON_CPUCTL_ALIAS if value & CPUCTL_STARTCPU != 0 => {
                self.start_falcon()
            }
            RISCV_CPUCTL if value & RISCV_CPUCTL_STARTCPU != 0 => self.start_riscv(),
            _ => {}
        }
    }

    fn ticks_us(&mut self) -> u64 {
        self.now_us += 1;
        self.now_us
    }

    fn sleep_us(&mut self, us: u64) {
        self.now_us += us;
    }

    fn allocate_dma(&mut self, size: usize) -> Result<DmaBuffer> {
        let phys = self.next_phys;
        let span = (size.max(1) as u64 + 0xFFF) & !0xFFF;
        // Leave random gaps so nothing accidentally relies on adjacency.
        self.next_phys += span + u64::from(self.rng.gen_range(0u32..4)) * 0x1000;
        self.mem.insert(phys, vec![0; size]);
        Ok(DmaBuffer::new(phys, size))
    }

    fn dma_sync(&mut self, buf: &DmaBuffer) {
        if let Some(backing) = self.mem.get_mut(&buf.phys()) {
            backing.copy_from_slice(buf.as_slice());
        }
    }

    fn dma_invalidate(&mut self, buf: &mut DmaBuffer) {
        if let Some(backing) = self.mem.get(&buf.phys()) {
            buf.as_mut_slice().copy_from_slice(backing);
        }
    }
}
