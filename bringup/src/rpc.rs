// Licensed under the Apache-2.0 license

//! RPC transport to the running GSP firmware: checksummed,
//! sequence-numbered elements in a pair of single-writer ring buffers
//! backed by shared DMA memory, with head/tail pointers mirrored into
//! hardware queue registers. The host writes the command ring; the
//! coprocessor writes the status ring.

use gsp_config::ChipConfig;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::{DmaBuffer, GpuDevice};
use crate::poll::wait_on;
use crate::{BringupError, Result};

pub const RPC_SIGNATURE: u32 = 0x4350_5256; // "VRPC"
pub const RPC_HEADER_VERSION: u32 = 3 << 24;

pub const FN_GSP_SET_SYSTEM_INFO: u32 = 0x15;
pub const FN_SET_REGISTRY: u32 = 0x16;
pub const FN_GSP_RM_ALLOC: u32 = 0x24;
pub const FN_GSP_RM_CONTROL: u32 = 0x25;
pub const EVENT_GSP_INIT_DONE: u32 = 0x52;

/// Ring elements occupy whole 4 KiB pages; contents are 256-aligned.
pub const QUEUE_ELEMENT_PAGE: usize = 4096;

/// Per-element transport header.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct QueueElementHeader {
    /// CRC32 over the payload bytes.
    pub checksum: u32,
    pub seq_num: u32,
    /// Element size in 4 KiB pages, header included.
    pub elem_count: u32,
    pub reserved: u32,
}

const ELEMENT_HEADER_SIZE: usize = core::mem::size_of::<QueueElementHeader>();

/// RPC message header preceding every payload.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct RpcMessageHeader {
    pub signature: u32,
    pub header_version: u32,
    pub rpc_result: u32,
    pub rpc_result_priv: u32,
    pub function: u32,
    /// Header plus parameter bytes.
    pub length: u32,
}

pub const RPC_HEADER_SIZE: usize = core::mem::size_of::<RpcMessageHeader>();

/// A decoded RPC message (request or reply).
#[derive(Debug, Clone)]
pub struct RpcMessage {
    pub header: RpcMessageHeader,
    pub params: Vec<u8>,
}

impl RpcMessage {
    pub fn request(function: u32, params: Vec<u8>) -> Self {
        Self {
            header: RpcMessageHeader {
                signature: RPC_SIGNATURE,
                header_version: RPC_HEADER_VERSION,
                rpc_result: 0,
                rpc_result_priv: 0,
                function,
                length: (RPC_HEADER_SIZE + params.len()) as u32,
            },
            params,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RPC_HEADER_SIZE + self.params.len());
        bytes.extend_from_slice(self.header.as_bytes());
        bytes.extend_from_slice(&self.params);
        bytes
    }
}

/// Which side of the ring this instance owns. The owned pointer is the
/// one this code advances; the other is read from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Writer,
    Reader,
}

/// One ring buffer. `our_reg`/`their_reg` are the hardware registers
/// mirroring this side's and the peer's byte offsets into the ring.
pub struct QueueRing {
    buf: DmaBuffer,
    role: Role,
    our_reg: u32,
    their_reg: u32,
    our_ptr: u32,
    next_seq: u32,
}

impl QueueRing {
    /// Host-written command queue (queue index 0).
    pub fn command(buf: DmaBuffer, cfg: &ChipConfig) -> Result<Self> {
        Self::new(buf, Role::Writer, cfg.gsp_queue_tail(0), cfg.gsp_queue_head(0))
    }

    /// Coprocessor-written status queue (queue index 1).
    pub fn status(buf: DmaBuffer, cfg: &ChipConfig) -> Result<Self> {
        Self::new(buf, Role::Reader, cfg.gsp_queue_tail(1), cfg.gsp_queue_head(1))
    }

    fn new(buf: DmaBuffer, role: Role, our_reg: u32, their_reg: u32) -> Result<Self> {
        if buf.len() == 0 || buf.len() % QUEUE_ELEMENT_PAGE != 0 {
            return Err(BringupError::Usage("queue size must be whole pages"));
        }
        Ok(Self {
            buf,
            role,
            our_reg,
            their_reg,
            our_ptr: 0,
            next_seq: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn phys(&self) -> u64 {
        self.buf.phys()
    }

    fn their_ptr(&self, dev: &mut impl GpuDevice) -> u32 {
        dev.read_register(self.their_reg) % self.capacity() as u32
    }

    /// Bytes available to the writer, keeping one page of slack so a
    /// full ring never aliases an empty one. A peer pointer that is not
    /// page-aligned is a corrupt register, not a smaller ring.
    fn free_bytes(&self, dev: &mut impl GpuDevice) -> Result<usize> {
        let cap = self.capacity() as u32;
        let head = if self.role == Role::Writer {
            self.their_ptr(dev)
        } else {
            self.our_ptr
        };
        let tail = if self.role == Role::Writer {
            self.our_ptr
        } else {
            self.their_ptr(dev)
        };
        let used = (tail.wrapping_sub(head)) % cap;
        ((cap - used) as usize)
            .checked_sub(QUEUE_ELEMENT_PAGE)
            .ok_or(BringupError::QueueCorrupt("peer pointer alignment"))
    }

    fn copy_in(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let cap = self.capacity();
        let first = bytes.len().min(cap - at);
        self.buf.write_at(at, &bytes[..first])?;
        if first < bytes.len() {
            self.buf.write_at(0, &bytes[first..])?;
        }
        Ok(())
    }

    fn copy_out(&self, at: usize, len: usize) -> Vec<u8> {
        let cap = self.capacity();
        let first = len.min(cap - at);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.buf.as_slice()[at..at + first]);
        out.extend_from_slice(&self.buf.as_slice()[..len - first]);
        out
    }

    /// Enqueue one RPC message. Fails with `QueueFull` when the element
    /// would not fit; the ring is left untouched in that case.
    pub fn enqueue(&mut self, dev: &mut impl GpuDevice, msg: &RpcMessage) -> Result<u32> {
        debug_assert_eq!(self.role, Role::Writer);
        let payload = msg.to_bytes();
        let elem_bytes = ELEMENT_HEADER_SIZE + payload.len();
        let elem_count = elem_bytes.div_ceil(QUEUE_ELEMENT_PAGE);
        let advance = elem_count * QUEUE_ELEMENT_PAGE;

        let free = self.free_bytes(dev)?;
        if advance > free {
            return Err(BringupError::QueueFull {
                needed: advance,
                free,
            });
        }

        let seq = self.next_seq;
        let header = QueueElementHeader {
            checksum: crc32fast::hash(&payload),
            seq_num: seq,
            elem_count: elem_count as u32,
            reserved: 0,
        };
        let at = self.our_ptr as usize;
        self.copy_in(at, header.as_bytes())?;
        self.copy_in((at + ELEMENT_HEADER_SIZE) % self.capacity(), &payload)?;
        dev.dma_sync(&self.buf);

        self.next_seq = self.next_seq.wrapping_add(1);
        self.our_ptr = (self.our_ptr + advance as u32) % self.capacity() as u32;
        dev.write_register(self.our_reg, self.our_ptr);
        debug!(
            "rpc enqueue: fn {:#x}, seq {}, {} page(s)",
            msg.header.function, seq, elem_count
        );
        Ok(seq)
    }

    /// Non-blocking dequeue of the next element. Returns `Ok(None)`
    /// when the peer has published nothing new.
    pub fn dequeue(&mut self, dev: &mut impl GpuDevice) -> Result<Option<RpcMessage>> {
        debug_assert_eq!(self.role, Role::Reader);
        dev.dma_invalidate(&mut self.buf);
        if self.their_ptr(dev) == self.our_ptr {
            return Ok(None);
        }

        let at = self.our_ptr as usize;
        let header_bytes = self.copy_out(at, ELEMENT_HEADER_SIZE);
        let header = QueueElementHeader::read_from_bytes(&header_bytes)
            .map_err(|_| BringupError::QueueCorrupt("element header"))?;
        let elem_count = header.elem_count as usize;
        if elem_count == 0 || elem_count * QUEUE_ELEMENT_PAGE > self.capacity() {
            return Err(BringupError::QueueCorrupt("element count"));
        }

        let msg_at = (at + ELEMENT_HEADER_SIZE) % self.capacity();
        let rpc_bytes = self.copy_out(msg_at, RPC_HEADER_SIZE);
        let rpc = RpcMessageHeader::read_from_bytes(&rpc_bytes)
            .map_err(|_| BringupError::QueueCorrupt("rpc header"))?;
        if rpc.signature != RPC_SIGNATURE {
            return Err(BringupError::QueueCorrupt("rpc signature"));
        }
        let length = rpc.length as usize;
        if length < RPC_HEADER_SIZE || ELEMENT_HEADER_SIZE + length > elem_count * QUEUE_ELEMENT_PAGE
        {
            return Err(BringupError::QueueCorrupt("rpc length"));
        }

        let payload = self.copy_out(msg_at, length);
        if crc32fast::hash(&payload) != header.checksum {
            return Err(BringupError::QueueCorrupt("checksum"));
        }

        self.our_ptr =
            (self.our_ptr + (elem_count * QUEUE_ELEMENT_PAGE) as u32) % self.capacity() as u32;
        dev.write_register(self.our_reg, self.our_ptr);

        Ok(Some(RpcMessage {
            header: rpc,
            params: payload[RPC_HEADER_SIZE..].to_vec(),
        }))
    }
}

/// Events surfaced while waiting for replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcEvent {
    InitDone,
    Other(u32),
}

/// Poll the status ring until a reply for `function` arrives. Event
/// messages encountered on the way are handed to `on_event` rather
/// than dropped.
pub fn wait_for_function(
    dev: &mut impl GpuDevice,
    ring: &mut QueueRing,
    function: u32,
    budget: core::time::Duration,
    mut on_event: impl FnMut(RpcEvent),
) -> Result<RpcMessage> {
    let outcome = wait_on(dev, budget, |d| match ring.dequeue(d) {
        Ok(Some(msg)) => {
            if msg.header.function == function {
                Some(Ok(msg))
            } else {
                match msg.header.function {
                    EVENT_GSP_INIT_DONE => on_event(RpcEvent::InitDone),
                    other => {
                        warn!("unexpected rpc fn {:#x} while waiting for {:#x}", other, function);
                        on_event(RpcEvent::Other(other));
                    }
                }
                None
            }
        }
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    });
    let msg = outcome.map_err(|_| BringupError::QueueTimeout { function })??;
    if msg.header.rpc_result != 0 {
        return Err(BringupError::RpcFailed {
            function,
            result: msg.header.rpc_result,
        });
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::StubDevice;
    use gsp_config::ADA_CONFIG;

    const QUEUE_SIZE: usize = 8 * QUEUE_ELEMENT_PAGE;

    fn ring(dev: &mut StubDevice, role: Role) -> QueueRing {
        let buf = dev.allocate_dma(QUEUE_SIZE).unwrap();
        match role {
            Role::Writer => QueueRing::command(buf, &ADA_CONFIG).unwrap(),
            Role::Reader => QueueRing::status(buf, &ADA_CONFIG).unwrap(),
        }
    }

    /// Writer and reader views over the same backing pages, as the
    /// hardware pair would see them. The stub shares registers, so the
    /// reader sees the writer's published tail as its peer pointer.
    fn mirrored_pair(dev: &mut StubDevice) -> (QueueRing, QueueRing) {
        let writer = ring(dev, Role::Writer);
        let mut reader_buf = DmaBuffer::new(writer.phys(), QUEUE_SIZE);
        reader_buf
            .write_at(0, writer.buf.as_slice())
            .unwrap();
        // Reader of the command ring: our pointer mirrors queue 0 head.
        let reader = QueueRing {
            buf: reader_buf,
            role: Role::Reader,
            our_reg: ADA_CONFIG.gsp_queue_head(0),
            their_reg: ADA_CONFIG.gsp_queue_tail(0),
            our_ptr: 0,
            next_seq: 0,
        };
        (writer, reader)
    }

    fn sync(writer: &QueueRing, reader: &mut QueueRing) {
        reader.buf.as_mut_slice().copy_from_slice(writer.buf.as_slice());
    }

    #[test]
    fn fill_until_full_then_drain_intact() {
        let mut dev = StubDevice::new();
        let (mut writer, mut reader) = mirrored_pair(&mut dev);

        // 7 usable pages (one page of slack): 7 one-page elements fit.
        let mut sent = Vec::new();
        for i in 0..7u32 {
            let msg = RpcMessage::request(FN_GSP_RM_CONTROL, vec![i as u8; 64]);
            writer.enqueue(&mut dev, &msg).unwrap();
            sent.push(msg);
        }
        let overflow = RpcMessage::request(FN_GSP_RM_CONTROL, vec![0; 64]);
        match writer.enqueue(&mut dev, &overflow).unwrap_err() {
            BringupError::QueueFull { needed, free } => {
                assert_eq!(needed, QUEUE_ELEMENT_PAGE);
                assert!(free < QUEUE_ELEMENT_PAGE);
            }
            other => panic!("unexpected error: {other}"),
        }

        sync(&writer, &mut reader);
        for (i, sent) in sent.iter().enumerate() {
            let got = reader.dequeue(&mut dev).unwrap().unwrap();
            assert_eq!(got.header.function, FN_GSP_RM_CONTROL, "element {i}");
            assert_eq!(got.params, sent.params, "element {i}");
        }
        assert!(reader.dequeue(&mut dev).unwrap().is_none());
    }

    #[test]
    fn elements_wrap_across_ring_end() {
        let mut dev = StubDevice::new();
        let (mut writer, mut reader) = mirrored_pair(&mut dev);

        // Advance both sides to one page before the end, then send an
        // element whose bytes span the wrap point.
        for _ in 0..2 {
            for _ in 0..7 {
                writer
                    .enqueue(&mut dev, &RpcMessage::request(FN_SET_REGISTRY, vec![1; 16]))
                    .unwrap();
                sync(&writer, &mut reader);
                reader.dequeue(&mut dev).unwrap().unwrap();
            }
        }
        // Pointers now at 14 pages mod 8 = page 6; a three-page element
        // wraps through page 0.
        let big = RpcMessage::request(FN_GSP_RM_ALLOC, vec![0xAB; 2 * QUEUE_ELEMENT_PAGE]);
        writer.enqueue(&mut dev, &big).unwrap();
        sync(&writer, &mut reader);
        let got = reader.dequeue(&mut dev).unwrap().unwrap();
        assert_eq!(got.params, big.params);
    }

    #[test]
    fn unaligned_peer_pointer_is_corruption_not_capacity() {
        let mut dev = StubDevice::new();
        let mut writer = ring(&mut dev, Role::Writer);
        // A head register mid-page would otherwise read as a ring
        // holding less than the one-page slack.
        dev.regs.insert(ADA_CONFIG.gsp_queue_head(0), 100);
        let err = writer
            .enqueue(&mut dev, &RpcMessage::request(FN_SET_REGISTRY, vec![0; 16]))
            .unwrap_err();
        assert_eq!(err, BringupError::QueueCorrupt("peer pointer alignment"));
    }

    #[test]
    fn corrupt_checksum_is_detected() {
        let mut dev = StubDevice::new();
        let (mut writer, mut reader) = mirrored_pair(&mut dev);
        writer
            .enqueue(&mut dev, &RpcMessage::request(FN_SET_REGISTRY, vec![7; 32]))
            .unwrap();
        sync(&writer, &mut reader);
        // Flip one payload byte past both headers.
        reader.buf.as_mut_slice()[ELEMENT_HEADER_SIZE + RPC_HEADER_SIZE] ^= 0xFF;
        assert_eq!(
            reader.dequeue(&mut dev).unwrap_err(),
            BringupError::QueueCorrupt("checksum")
        );
    }

    #[test]
    fn wait_for_function_routes_events_first() {
        let mut dev = StubDevice::new();
        let (mut writer, mut reader) = mirrored_pair(&mut dev);
        writer
            .enqueue(&mut dev, &RpcMessage::request(EVENT_GSP_INIT_DONE, vec![]))
            .unwrap();
        writer
            .enqueue(&mut dev, &RpcMessage::request(FN_GSP_RM_ALLOC, vec![3; 8]))
            .unwrap();
        sync(&writer, &mut reader);

        let mut events = Vec::new();
        let reply = wait_for_function(
            &mut dev,
            &mut reader,
            FN_GSP_RM_ALLOC,
            core::time::Duration::from_millis(10),
            |e| events.push(e),
        )
        .unwrap();
        assert_eq!(reply.params, vec![3; 8]);
        assert_eq!(events, vec![RpcEvent::InitDone]);
    }

    #[test]
    fn timeout_when_no_reply_arrives() {
        let mut dev = StubDevice::new();
        let mut reader = ring(&mut dev, Role::Reader);
        let err = wait_for_function(
            &mut dev,
            &mut reader,
            FN_GSP_RM_CONTROL,
            core::time::Duration::from_micros(200),
            |_| {},
        )
        .unwrap_err();
        assert_eq!(
            err,
            BringupError::QueueTimeout {
                function: FN_GSP_RM_CONTROL
            }
        );
    }
}
