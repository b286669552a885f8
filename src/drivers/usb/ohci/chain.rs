//! Transfer chain builder
//!
//! Turns a DMA buffer into a chain of TDs (or ITDs for isochronous pipes).
//! A general TD can span at most one page crossing, so a chunk is either
//! the whole remainder (when it fits in two pages) or as much as fits,
//! rounded down to the endpoint's max packet size.
//!
//! Building always starts at the pipe's current tail sentinel, which the
//! controller already points at but will not execute until `tailp` moves.
//! The last node allocated becomes the new sentinel. If any allocation
//! fails, every node allocated so far is released and the starting node is
//! restored to a clean sentinel.

use alloc::vec::Vec;
use heapless::Vec as HVec;

use super::arena::{Itd, ItdHandle, NodeFlags, Pool, Td, TdHandle};
use super::desc::{
    self, HwItd, HwTd, ISO_MAX_PACKET, ITD_NOFFSET, PAGE_SIZE, itd, page, td,
};
use super::hash::HashTable;
use super::transfer::TransferId;
use crate::dma::{AllocMode, DmaMemory};
use crate::drivers::usb::{Direction, UsbError};

/// Allocate and index a TD (non-blocking, structure lock held)
pub fn alloc_td<D: DmaMemory + ?Sized>(
    tds: &mut Pool<Td>,
    index: &mut HashTable<Td>,
    dma: &D,
) -> Result<TdHandle, UsbError> {
    let h = tds.allocate(dma, AllocMode::NoWait)?;
    index.insert(tds, h);
    Ok(h)
}

/// Unindex and release a TD
pub fn free_td(tds: &mut Pool<Td>, index: &mut HashTable<Td>, h: TdHandle) {
    index.remove(tds, h);
    tds.release(h);
}

pub fn alloc_itd<D: DmaMemory + ?Sized>(
    itds: &mut Pool<Itd>,
    index: &mut HashTable<Itd>,
    dma: &D,
) -> Result<ItdHandle, UsbError> {
    let h = itds.allocate(dma, AllocMode::NoWait)?;
    index.insert(itds, h);
    Ok(h)
}

pub fn free_itd(itds: &mut Pool<Itd>, index: &mut HashTable<Itd>, h: ItdHandle) {
    index.remove(itds, h);
    itds.release(h);
}

/// Bulk, interrupt or control data stage to build
#[derive(Debug, Clone, Copy)]
pub struct ChainSpec {
    pub transfer: TransferId,
    pub buffer_phys: u32,
    pub len: u32,
    pub max_packet: u32,
    pub direction: Direction,
    pub short_ok: bool,
    pub force_short: bool,
}

/// A built TD chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    /// The node building started at
    pub first: TdHandle,
    /// Last node owned by the transfer
    pub last: TdHandle,
    /// Freshly allocated node following `last`, owned by nobody
    pub next: TdHandle,
    /// Nodes owned by the transfer
    pub nodes: usize,
}

fn write_td<D: DmaMemory + ?Sized>(tds: &Pool<Td>, dma: &D, h: TdHandle, hw: HwTd) {
    if let Some(scope) = tds.scope(dma, h) {
        scope.write(hw);
    }
}

/// Turn `start` back into an unowned sentinel
fn reset_sentinel<D: DmaMemory + ?Sized>(tds: &mut Pool<Td>, dma: &D, start: TdHandle) {
    write_td(tds, dma, start, HwTd::default());
    if let Some(soft) = tds.get_mut(start) {
        soft.next = None;
        soft.transfer = None;
        soft.len = 0;
        soft.flags = NodeFlags::empty();
    }
}

/// Build a TD chain for `spec` starting at `start`
pub fn build_td_chain<D: DmaMemory + ?Sized>(
    tds: &mut Pool<Td>,
    index: &mut HashTable<Td>,
    dma: &D,
    start: TdHandle,
    spec: &ChainSpec,
) -> Result<Chain, UsbError> {
    if spec.max_packet == 0 {
        return Err(UsbError::InvalidParameter);
    }
    let mut fresh: Vec<TdHandle> = Vec::new();
    match fill_td_chain(tds, index, dma, start, spec, &mut fresh) {
        Ok(chain) => Ok(chain),
        Err(err) => {
            log::debug!(
                "OHCI: chain build failed after {} nodes: {:?}",
                fresh.len(),
                err
            );
            for h in fresh {
                free_td(tds, index, h);
            }
            reset_sentinel(tds, dma, start);
            Err(err)
        }
    }
}

fn fill_td_chain<D: DmaMemory + ?Sized>(
    tds: &mut Pool<Td>,
    index: &mut HashTable<Td>,
    dma: &D,
    start: TdHandle,
    spec: &ChainSpec,
    fresh: &mut Vec<TdHandle>,
) -> Result<Chain, UsbError> {
    let dir = match spec.direction {
        Direction::In => td::DP_IN,
        Direction::Out => td::DP_OUT,
        Direction::Setup => td::DP_SETUP,
    };
    let tdflags = dir
        | if spec.short_ok { td::R } else { 0 }
        | td::NOCC
        | td::TOGGLE_CARRY
        | td::NOINTR;

    let mut cur = start;
    let mut nodes = 1;

    if spec.len == 0 {
        let next = alloc_td(tds, index, dma)?;
        fresh.push(next);
        link_td(tds, dma, cur, next, spec.transfer, tdflags, 0, 0, NodeFlags::ADD_LEN);
        return Ok(Chain {
            first: start,
            last: cur,
            next,
            nodes,
        });
    }

    let mut dataphys = spec.buffer_phys;
    let mut remaining = spec.len;
    let end_page = page(spec.buffer_phys.wrapping_add(spec.len - 1));
    let mut next;

    loop {
        next = alloc_td(tds, index, dma)?;
        fresh.push(next);

        let curlen = if page(dataphys) == end_page || page(dataphys) + PAGE_SIZE == end_page {
            remaining
        } else {
            let c = 2 * PAGE_SIZE - desc::page_offset(dataphys);
            c - c % spec.max_packet
        };
        if curlen == 0 {
            return Err(UsbError::InvalidParameter);
        }
        remaining -= curlen;

        link_td(
            tds,
            dma,
            cur,
            next,
            spec.transfer,
            tdflags,
            dataphys,
            curlen,
            NodeFlags::ADD_LEN,
        );

        if remaining == 0 {
            break;
        }
        dataphys += curlen;
        cur = next;
        nodes += 1;
    }

    if spec.force_short && spec.direction == Direction::Out && spec.len % spec.max_packet == 0 {
        cur = next;
        next = alloc_td(tds, index, dma)?;
        fresh.push(next);
        link_td(tds, dma, cur, next, spec.transfer, tdflags, 0, 0, NodeFlags::empty());
        nodes += 1;
        log::trace!("OHCI: zero-length terminator appended");
    }

    Ok(Chain {
        first: start,
        last: cur,
        next,
        nodes,
    })
}

/// Fill `cur` to move `len` bytes at `dataphys` and point it at `next`.
/// A zero `len` encodes a zero-length packet (cbp = 0).
#[allow(clippy::too_many_arguments)]
pub(super) fn link_td<D: DmaMemory + ?Sized>(
    tds: &mut Pool<Td>,
    dma: &D,
    cur: TdHandle,
    next: TdHandle,
    transfer: TransferId,
    flags: u32,
    dataphys: u32,
    len: u32,
    soft_flags: NodeFlags,
) {
    let next_phys = tds.phys(next).unwrap_or(0);
    let (cbp, be) = if len == 0 {
        (0, 0)
    } else {
        (dataphys, dataphys + len - 1)
    };
    write_td(
        tds,
        dma,
        cur,
        HwTd {
            flags,
            cbp,
            nexttd: next_phys,
            be,
        },
    );
    if let Some(soft) = tds.get_mut(cur) {
        soft.next = Some(next);
        soft.transfer = Some(transfer);
        soft.len = len;
        soft.flags = soft_flags;
    }
}

// ============================================================================
// Isochronous chains
// ============================================================================

/// Isochronous transfer to build
#[derive(Debug, Clone, Copy)]
pub struct IsoSpec<'a> {
    pub transfer: TransferId,
    pub buffer_phys: u32,
    /// Bytes per frame
    pub frames: &'a [u16],
    /// Controller frame the first ITD starts in
    pub start_frame: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoChain {
    pub first: ItdHandle,
    pub last: ItdHandle,
    pub next: ItdHandle,
    pub nodes: usize,
    /// Frame cursor after the last frame of this transfer
    pub next_frame: u32,
}

/// Frames packed into the ITD under construction
struct Pending {
    bp0: u32,
    frame_base: usize,
    start_frame: u32,
    offsets: HVec<u16, ITD_NOFFSET>,
}

pub fn build_itd_chain<D: DmaMemory + ?Sized>(
    itds: &mut Pool<Itd>,
    index: &mut HashTable<Itd>,
    dma: &D,
    start: ItdHandle,
    spec: &IsoSpec<'_>,
) -> Result<IsoChain, UsbError> {
    // A frame of at most ISO_MAX_PACKET bytes crosses at most one page
    // boundary, which is all an ITD can express
    if spec.frames.is_empty() || spec.frames.iter().any(|&f| u32::from(f) > ISO_MAX_PACKET) {
        return Err(UsbError::InvalidParameter);
    }
    let mut fresh: Vec<ItdHandle> = Vec::new();
    match fill_itd_chain(itds, index, dma, start, spec, &mut fresh) {
        Ok(chain) => Ok(chain),
        Err(err) => {
            for h in fresh {
                free_itd(itds, index, h);
            }
            if let Some(scope) = itds.scope(dma, start) {
                scope.write(HwItd::default());
            }
            if let Some(soft) = itds.get_mut(start) {
                soft.next = None;
                soft.transfer = None;
                soft.flags = NodeFlags::empty();
                soft.nframes = 0;
                soft.frame_base = 0;
            }
            Err(err)
        }
    }
}

fn fill_itd_chain<D: DmaMemory + ?Sized>(
    itds: &mut Pool<Itd>,
    index: &mut HashTable<Itd>,
    dma: &D,
    start: ItdHandle,
    spec: &IsoSpec<'_>,
    fresh: &mut Vec<ItdHandle>,
) -> Result<IsoChain, UsbError> {
    let buf = spec.buffer_phys;
    let mut cur = start;
    let mut nodes = 1;
    let mut pos: u32 = 0;
    let mut pending = Pending {
        bp0: page(buf),
        frame_base: 0,
        start_frame: spec.start_frame,
        offsets: HVec::new(),
    };

    for (i, &flen) in spec.frames.iter().enumerate() {
        let flen = flen as u32;
        let crosses = flen > 0 && page(buf + pos + flen - 1) > pending.bp0 + PAGE_SIZE;
        if !pending.offsets.is_empty() && (pending.offsets.is_full() || crosses) {
            let next = alloc_itd(itds, index, dma)?;
            fresh.push(next);
            close_itd(itds, dma, cur, next, spec.transfer, &pending, buf + pos, false);

            pending = Pending {
                bp0: page(buf + pos),
                frame_base: i,
                start_frame: pending.start_frame + pending.offsets.len() as u32,
                offsets: HVec::new(),
            };
            cur = next;
            nodes += 1;
        }
        let offs = buf + pos - pending.bp0;
        pending
            .offsets
            .push(itd::mk_offs(offs))
            .map_err(|_| UsbError::InvalidParameter)?;
        pos += flen;
    }

    let next = alloc_itd(itds, index, dma)?;
    fresh.push(next);
    close_itd(itds, dma, cur, next, spec.transfer, &pending, buf + pos, true);

    Ok(IsoChain {
        first: start,
        last: cur,
        next,
        nodes,
        next_frame: pending.start_frame + pending.offsets.len() as u32,
    })
}

#[allow(clippy::too_many_arguments)]
fn close_itd<D: DmaMemory + ?Sized>(
    itds: &mut Pool<Itd>,
    dma: &D,
    cur: ItdHandle,
    next: ItdHandle,
    transfer: TransferId,
    pending: &Pending,
    end: u32,
    last: bool,
) {
    let nframes = pending.offsets.len();
    let mut offset = [0u16; ITD_NOFFSET];
    offset[..nframes].copy_from_slice(&pending.offsets);
    let hw = HwItd {
        flags: itd::NOCC
            | itd::set_sf(pending.start_frame)
            | itd::set_di(if last { 0 } else { 6 })
            | itd::set_fc(nframes as u32),
        bp0: pending.bp0,
        nextitd: itds.phys(next).unwrap_or(0),
        be: end.wrapping_sub(1),
        offset,
    };
    if let Some(scope) = itds.scope(dma, cur) {
        scope.write(hw);
    }
    if let Some(soft) = itds.get_mut(cur) {
        soft.next = Some(next);
        soft.transfer = Some(transfer);
        soft.frame_base = pending.frame_base as u16;
        soft.nframes = nframes as u8;
        soft.start_frame = pending.start_frame as u16;
        soft.flags = if last {
            NodeFlags::CALL_DONE
        } else {
            NodeFlags::empty()
        };
    }
}
