//! OHCI (USB 1.1) transfer scheduling and completion engine
//!
//! This module turns pipe-level transfer requests into chains of hardware
//! transfer descriptors, links them into the controller's schedule, retires
//! them from the done list and tears them down again on abort or close.
//!
//! The controller context owns everything: the descriptor arena, the
//! completion index, the scheduling graph and the pipe and transfer tables
//! all live behind one structure lock. The interrupt top half only touches
//! registers under its own lock; all list processing happens in
//! [`OhciController::softintr`], which the platform runs in task context.
//!
//! # References
//! - OpenHCI Specification 1.0a
//! - NetBSD ohci.c

mod abort;
mod arena;
mod chain;
pub mod desc;
mod done;
mod hash;
mod pipe;
pub mod regs;
mod schedule;
mod slab;
pub mod transfer;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;
use tock_registers::LocalRegisterCopy;

pub use desc::ConditionCode;
pub use pipe::PipeId;
pub use transfer::{
    Completion, CompletionCallback, CompletionStatus, FrameResult, SetupPacket, TransferFlags,
    TransferId, TransferRequest, TransferStatus,
};

use super::{Direction, EndpointAttrs, EndpointType, UsbError, UsbSpeed};
use crate::dma::{AllocMode, DmaMemory, DmaRegion, SyncOp, SyncScope};
use crate::platform::Platform;
use arena::{Arena, Ed, Itd, NodeFlags, NodeKind, Pool, Td, TdHandle};
use chain::{ChainSpec, IsoSpec, alloc_itd, alloc_td, build_itd_chain, build_td_chain, free_itd, free_td};
use desc::{
    ED_HEADP, ED_TAILP, HCCA_ALIGN, HCCA_FRAME_NUMBER, HCCA_SIZE, HwEd, ISO_MAX_PACKET, PAGE_SIZE,
    TD_FLAGS, ed, td,
};
use hash::CompletionIndex;
use pipe::{Pipe, Tail};
use regs::{
    HC_COMMAND_STATUS, HC_CONTROL, HC_FM_INTERVAL, HC_FM_NUMBER, HC_PERIODIC_START, HC_REVISION,
    OhciReg, RegisterAccess, command, control, intr,
};
use schedule::ScheduleGraph;
use slab::Slab;
use transfer::{ChainHead, Transfer};

/// Everything the engine needs from its environment
pub trait OhciHost: Platform + DmaMemory + RegisterAccess + Send + Sync {}

impl<T: Platform + DmaMemory + RegisterAccess + Send + Sync> OhciHost for T {}

/// Runtime tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OhciConfig {
    /// Wait after skipping an ED before forcing a completion pass (>= 1 frame)
    pub abort_settle_ms: u32,
    /// How long an abort waits for the deferred task before running the
    /// completion pass itself
    pub pass_wait_ms: u32,
    /// Wait between unlinking an ED and freeing it
    pub close_settle_ms: u32,
    /// Frames between "now" and the first frame of an idle isochronous pipe
    pub iso_start_delay: u32,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            abort_settle_ms: 1,
            pass_wait_ms: 20,
            close_settle_ms: 1,
            iso_start_delay: 5,
        }
    }
}

/// Counters for diagnostics and leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pipes: usize,
    pub transfers: usize,
    /// EDs handed out, schedule anchors included
    pub eds: usize,
    pub tds: usize,
    pub itds: usize,
    /// Entries in the completion index
    pub indexed: usize,
    /// TD and ITD allocations since start
    pub allocated: u64,
    /// TD and ITD releases since start
    pub released: u64,
    pub overruns: u32,
}

/// State guarded by the structure lock
pub(crate) struct Schedule {
    arena: Arena,
    index: CompletionIndex,
    graph: ScheduleGraph,
    pipes: Slab<Pipe>,
    transfers: Slab<Transfer>,
}

/// State guarded by the interrupt lock
struct IntrState {
    /// Interrupt sources currently enabled
    eintrs: u32,
    overruns: u32,
}

/// Completion pass rendezvous.
///
/// A pass that begins after ticket `t` was requested observes every
/// done-list entry written before the request.
struct PassSignal {
    requested: AtomicU64,
    completed: AtomicU64,
}

impl PassSignal {
    const fn new() -> Self {
        Self {
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    fn request(&self) -> u64 {
        self.requested.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn begin(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    fn complete(&self, ticket: u64) {
        self.completed.fetch_max(ticket, Ordering::SeqCst);
    }

    fn reached(&self, ticket: u64) -> bool {
        self.completed.load(Ordering::SeqCst) >= ticket
    }
}

/// A finished transfer whose callback still has to run
type Finished = (Option<CompletionCallback>, Completion);

/// Run callbacks in the order their transfers finished
fn dispatch(finished: Vec<Finished>) {
    for (callback, report) in finished {
        if let Some(cb) = callback {
            cb(report);
        }
    }
}

/// OHCI host controller transfer engine
pub struct OhciController<H: OhciHost> {
    host: H,
    config: OhciConfig,
    hcca: DmaRegion,
    sched: Mutex<Schedule>,
    intr: Mutex<IntrState>,
    /// Held for the duration of one completion pass
    pass: Mutex<()>,
    signal: PassSignal,
    running: AtomicBool,
    /// Set after an unrecoverable error or shutdown; hardware is no longer
    /// trusted to make progress
    dying: AtomicBool,
}

impl<H: OhciHost> OhciController<H> {
    /// Allocate the HCCA and build the schedule skeleton.
    ///
    /// The controller is expected to be reset already; nothing is written
    /// to its registers until [`OhciController::start`].
    pub fn new(host: H, config: OhciConfig) -> Result<Self, UsbError> {
        let rev = LocalRegisterCopy::<u32, HC_REVISION::Register>::new(
            host.read_reg(OhciReg::Revision),
        );
        let rev = rev.read(HC_REVISION::REV);
        log::info!("OHCI version: {}.{}", rev >> 4, rev & 0xF);
        if rev != 0x10 {
            log::warn!("OHCI: unexpected revision {:#x}", rev);
        }

        let hcca = host.allocate(HCCA_SIZE, HCCA_ALIGN, AllocMode::MayBlock)?;
        hcca.copy_from_slice(0, &[0u8; HCCA_SIZE]);

        let mut arena = Arena::new();
        let graph = match ScheduleGraph::build(&mut arena.eds, &host, &hcca) {
            Ok(graph) => graph,
            Err(e) => {
                arena.drain(&host);
                host.release(hcca);
                return Err(e.into());
            }
        };
        host.sync(&hcca, 0, HCCA_SIZE, SyncOp::ForDevice);

        Ok(Self {
            host,
            config,
            hcca,
            sched: Mutex::new(Schedule {
                arena,
                index: CompletionIndex::new(),
                graph,
                pipes: Slab::new(),
                transfers: Slab::new(),
            }),
            intr: Mutex::new(IntrState {
                eintrs: 0,
                overruns: 0,
            }),
            pass: Mutex::new(()),
            signal: PassSignal::new(),
            running: AtomicBool::new(false),
            dying: AtomicBool::new(false),
        })
    }

    /// Program the schedule and put the controller in the operational state
    pub fn start(&self) -> Result<(), UsbError> {
        if self.is_dying() {
            return Err(UsbError::ControllerDead);
        }
        let (ctrl, bulk) = {
            let s = self.sched.lock();
            (
                s.arena.eds.phys(s.graph.ctrl_head).unwrap_or(0),
                s.arena.eds.phys(s.graph.bulk_head).unwrap_or(0),
            )
        };

        self.host.write_reg(OhciReg::Hcca, self.hcca.phys());
        self.host.write_reg(OhciReg::ControlHeadEd, ctrl);
        self.host.write_reg(OhciReg::BulkHeadEd, bulk);

        let fm = LocalRegisterCopy::<u32, HC_FM_INTERVAL::Register>::new(
            self.host.read_reg(OhciReg::FmInterval),
        );
        // Periodic lists get the first 90% of each frame
        let mut ps = LocalRegisterCopy::<u32, HC_PERIODIC_START::Register>::new(0);
        ps.write(HC_PERIODIC_START::PS.val(fm.read(HC_FM_INTERVAL::FI) * 9 / 10));
        self.host.write_reg(OhciReg::PeriodicStart, ps.get());

        {
            let mut st = self.intr.lock();
            st.eintrs = intr::NORMAL;
            self.host.write_reg(OhciReg::InterruptDisable, intr::ALL | intr::MIE);
            self.host.write_reg(OhciReg::InterruptStatus, intr::ALL);
            self.host
                .write_reg(OhciReg::InterruptEnable, st.eintrs | intr::MIE);
        }

        let ctl = self.host.read_reg(OhciReg::Control) & !control::HCFS_MASK;
        self.host.write_reg(
            OhciReg::Control,
            ctl | control::ALL_LISTS | control::HCFS_OPERATIONAL,
        );

        let state = LocalRegisterCopy::<u32, HC_CONTROL::Register>::new(
            self.host.read_reg(OhciReg::Control),
        );
        if !matches!(
            state.read_as_enum(HC_CONTROL::HCFS),
            Some(HC_CONTROL::HCFS::Value::Operational)
        ) {
            log::warn!("OHCI: controller did not enter the operational state");
        }

        self.running.store(true, Ordering::Release);
        log::info!(
            "OHCI controller initialized, HCCA at {:#010x}",
            self.hcca.phys()
        );
        Ok(())
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &OhciConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.is_dying()
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> Result<(), UsbError> {
        if self.is_dying() {
            Err(UsbError::ControllerDead)
        } else {
            Ok(())
        }
    }

    /// Frame number the controller last wrote to the HCCA.
    ///
    /// The HCCA copy is only maintained once the schedule runs; before
    /// that the frame counter register is read directly.
    fn current_frame(&self) -> u32 {
        if !self.running.load(Ordering::Acquire) {
            let fm = LocalRegisterCopy::<u32, HC_FM_NUMBER::Register>::new(
                self.host.read_reg(OhciReg::FmNumber),
            );
            return fm.read(HC_FM_NUMBER::FN);
        }
        self.hcca
            .sub(HCCA_FRAME_NUMBER, 2)
            .and_then(|r| SyncScope::new(&self.host, r).read::<u16>())
            .map_or(0, u32::from)
    }

    /// Make sure the pools hold at least this many free nodes.
    ///
    /// Growing may block, so it happens with the structure lock released;
    /// builders running under the lock then never have to wait.
    fn reserve(&self, eds: usize, tds: usize, itds: usize) -> Result<(), UsbError> {
        loop {
            let (need_ed, need_td, need_itd) = {
                let s = self.sched.lock();
                (
                    s.arena.eds.free_count() < eds,
                    s.arena.tds.free_count() < tds,
                    s.arena.itds.free_count() < itds,
                )
            };
            if !(need_ed || need_td || need_itd) {
                return Ok(());
            }
            if need_ed {
                let chunk = self.host.allocate(Ed::chunk_bytes(), Ed::ALIGN, AllocMode::MayBlock)?;
                self.sched.lock().arena.eds.adopt_chunk(chunk);
            }
            if need_td {
                let chunk = self.host.allocate(Td::chunk_bytes(), Td::ALIGN, AllocMode::MayBlock)?;
                self.sched.lock().arena.tds.adopt_chunk(chunk);
            }
            if need_itd {
                let chunk =
                    self.host
                        .allocate(Itd::chunk_bytes(), Itd::ALIGN, AllocMode::MayBlock)?;
                self.sched.lock().arena.itds.adopt_chunk(chunk);
            }
        }
    }

    // ========================================================================
    // Interrupt top half
    // ========================================================================

    /// Hardware interrupt entry point.
    ///
    /// Returns `false` if the interrupt was not ours.
    pub fn interrupt(&self) -> bool {
        self.service_interrupts() != 0
    }

    /// Acknowledge and dispatch pending interrupt sources; returns the
    /// enabled sources that were serviced
    fn service_interrupts(&self) -> u32 {
        if self.is_dying() {
            return 0;
        }
        let mut st = self.intr.lock();
        let intrs = self.host.read_reg(OhciReg::InterruptStatus);
        if intrs == 0 {
            return 0;
        }
        // WDH stays set until the completion pass has consumed the done head
        self.host
            .write_reg(OhciReg::InterruptStatus, intrs & !(intr::MIE | intr::WDH));

        let mut eintrs = intrs & st.eintrs;
        if eintrs == 0 {
            return 0;
        }
        let serviced = eintrs;

        if eintrs & intr::SO != 0 {
            st.overruns += 1;
            let cs = LocalRegisterCopy::<u32, HC_COMMAND_STATUS::Register>::new(
                self.host.read_reg(OhciReg::CommandStatus),
            );
            log::warn!(
                "OHCI: {} scheduling overruns (SOC {})",
                st.overruns,
                cs.read(HC_COMMAND_STATUS::SOC)
            );
            eintrs &= !intr::SO;
        }
        if eintrs & intr::WDH != 0 {
            self.host.schedule_softintr();
        }
        if eintrs & intr::RD != 0 {
            log::info!("OHCI: resume detect");
            eintrs &= !intr::RD;
        }
        if eintrs & intr::UE != 0 {
            log::error!("OHCI: unrecoverable error, controller halted");
            self.host.write_reg(OhciReg::Control, control::HCFS_RESET);
            self.dying.store(true, Ordering::Release);
        }
        if eintrs & intr::RHSC != 0 {
            log::debug!("OHCI: root hub status change");
        }

        // Block what was not handled here until its owner re-enables it
        if eintrs != 0 {
            self.host.write_reg(OhciReg::InterruptDisable, eintrs);
            st.eintrs &= !eintrs;
        }
        serviced
    }

    /// Polling-mode replacement for the interrupt handler and the deferred
    /// task
    pub fn poll(&self) {
        let pending = {
            let st = self.intr.lock();
            self.host.read_reg(OhciReg::InterruptStatus) & st.eintrs
        };
        if pending != 0 && self.service_interrupts() & intr::WDH != 0 {
            self.softintr();
        }
    }

    // ========================================================================
    // Pipes
    // ========================================================================

    /// Create an ED for `attrs` with an empty queue and link it into the
    /// schedule
    pub fn open(&self, attrs: EndpointAttrs) -> Result<PipeId, UsbError> {
        self.check_alive()?;
        if attrs.max_packet == 0
            || attrs.max_packet > 0x7FF
            || attrs.device_address > 127
            || attrs.endpoint > 15
        {
            return Err(UsbError::InvalidParameter);
        }
        if attrs.kind == EndpointType::Interrupt && attrs.interval_ms == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let iso = attrs.kind == EndpointType::Isochronous;
        self.reserve(1, usize::from(!iso), usize::from(iso))?;

        let mut guard = self.sched.lock();
        let s = &mut *guard;
        let ed_h = s.arena.eds.allocate(&self.host, AllocMode::NoWait)?;
        let tail = if iso {
            alloc_itd(&mut s.arena.itds, &mut s.index.itds, &self.host).map(Tail::Itd)
        } else {
            alloc_td(&mut s.arena.tds, &mut s.index.tds, &self.host).map(Tail::Td)
        };
        let tail = match tail {
            Ok(tail) => tail,
            Err(e) => {
                s.arena.eds.release(ed_h);
                return Err(e);
            }
        };
        let tail_phys = match tail {
            Tail::Td(h) => s.arena.tds.phys(h),
            Tail::Itd(h) => s.arena.itds.phys(h),
        }
        .unwrap_or(0);

        let format = match (iso, attrs.direction) {
            (true, Direction::In) => ed::FORMAT_ISO | ed::DIR_IN,
            (true, _) => ed::FORMAT_ISO | ed::DIR_OUT,
            (false, _) => ed::DIR_TD,
        };
        let speed = if attrs.speed == UsbSpeed::Low { ed::SPEED } else { 0 };
        let toggle = if attrs.toggle { ed::TOGGLECARRY } else { 0 };
        if let Some(scope) = s.arena.eds.scope(&self.host, ed_h) {
            scope.write(HwEd {
                flags: ed::set_fa(attrs.device_address)
                    | ed::set_en(attrs.endpoint)
                    | format
                    | speed
                    | ed::set_maxp(attrs.max_packet),
                tailp: tail_phys,
                headp: tail_phys | toggle,
                nexted: 0,
            });
        }

        let pipe_id = s.pipes.insert(Pipe::new(attrs, ed_h, tail));
        if let Some(soft) = s.arena.eds.get_mut(ed_h) {
            soft.pipe = Some(pipe_id);
        }

        match attrs.kind {
            EndpointType::Control => {
                ScheduleGraph::link_after(&mut s.arena.eds, &self.host, s.graph.ctrl_head, ed_h)
            }
            EndpointType::Bulk => {
                ScheduleGraph::link_after(&mut s.arena.eds, &self.host, s.graph.bulk_head, ed_h)
            }
            EndpointType::Isochronous => {
                ScheduleGraph::link_after(&mut s.arena.eds, &self.host, s.graph.isoc_head, ed_h)
            }
            EndpointType::Interrupt => {
                match s
                    .graph
                    .insert_interrupt(&mut s.arena.eds, &self.host, ed_h, attrs.interval_ms)
                {
                    Ok(node) => {
                        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
                            pipe.interrupt_node = Some(node);
                        }
                    }
                    Err(e) => {
                        s.pipes.remove(pipe_id);
                        Self::free_tail(s, tail);
                        s.arena.eds.release(ed_h);
                        return Err(e);
                    }
                }
            }
        }

        log::debug!(
            "OHCI: opened pipe {:?} addr={} ep={} {:?} {:?} mps={}",
            pipe_id,
            attrs.device_address,
            attrs.endpoint,
            attrs.kind,
            attrs.direction,
            attrs.max_packet
        );
        Ok(pipe_id)
    }

    fn free_tail(s: &mut Schedule, tail: Tail) {
        match tail {
            Tail::Td(h) => free_td(&mut s.arena.tds, &mut s.index.tds, h),
            Tail::Itd(h) => free_itd(&mut s.arena.itds, &mut s.index.itds, h),
        }
    }

    /// Abort every queued transfer, unlink the ED and free it.
    ///
    /// Returns the data toggle the endpoint was left at, for the next pipe
    /// opened on it.
    pub fn close(&self, pipe_id: PipeId) -> Result<bool, UsbError> {
        let pending: Vec<TransferId> = {
            let mut guard = self.sched.lock();
            let s = &mut *guard;
            let pipe = s.pipes.get_mut(pipe_id).ok_or(UsbError::NoSuchPipe)?;
            if pipe.closing {
                return Err(UsbError::PipeClosing);
            }
            pipe.closing = true;
            let ed_h = pipe.ed;
            let pending = pipe.pending.iter().copied().collect();
            ScheduleGraph::set_skip(&s.arena.eds, &self.host, ed_h, true);
            pending
        };

        for id in pending {
            self.abort_with(id, CompletionStatus::Cancelled);
        }

        {
            let mut guard = self.sched.lock();
            let s = &mut *guard;
            let pipe = s.pipes.get(pipe_id).ok_or(UsbError::NoSuchPipe)?;
            let (ed_h, kind, node) = (pipe.ed, pipe.attrs.kind, pipe.interrupt_node);
            if !pipe.pending.is_empty() {
                log::warn!(
                    "OHCI: pipe {:?} still has {} transfers at close",
                    pipe_id,
                    pipe.pending.len()
                );
            }
            match kind {
                EndpointType::Control => {
                    ScheduleGraph::unlink(&mut s.arena.eds, &self.host, s.graph.ctrl_head, ed_h);
                }
                EndpointType::Bulk => {
                    ScheduleGraph::unlink(&mut s.arena.eds, &self.host, s.graph.bulk_head, ed_h);
                }
                EndpointType::Isochronous => {
                    ScheduleGraph::unlink(&mut s.arena.eds, &self.host, s.graph.isoc_head, ed_h);
                }
                EndpointType::Interrupt => {
                    if let Some(node) = node {
                        s.graph
                            .remove_interrupt(&mut s.arena.eds, &self.host, ed_h, node);
                    }
                }
            }
        }

        // The controller may still hold the ED for the rest of this frame
        if !self.is_dying() {
            self.host.delay_ms(self.config.close_settle_ms);
        }

        let mut guard = self.sched.lock();
        let s = &mut *guard;
        let pipe = s.pipes.remove(pipe_id).ok_or(UsbError::NoSuchPipe)?;
        let toggle = s
            .arena
            .eds
            .scope(&self.host, pipe.ed)
            .is_some_and(|scope| scope.read_u32(ED_HEADP) & ed::TOGGLECARRY != 0);
        Self::free_tail(s, pipe.tail);
        s.arena.eds.release(pipe.ed);

        log::debug!("OHCI: closed pipe {:?}, toggle={}", pipe_id, toggle);
        Ok(toggle)
    }

    /// Reset the endpoint's data toggle to DATA0
    pub fn clear_toggle(&self, pipe_id: PipeId) -> Result<(), UsbError> {
        let s = self.sched.lock();
        let pipe = s.pipes.get(pipe_id).ok_or(UsbError::NoSuchPipe)?;
        if let Some(scope) = s.arena.eds.scope(&self.host, pipe.ed) {
            scope.modify_u32(ED_HEADP, |h| h & !ed::TOGGLECARRY);
        }
        Ok(())
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Queue a transfer on `pipe_id` and hand it to the controller
    pub fn enqueue(
        &self,
        pipe_id: PipeId,
        mut req: TransferRequest,
    ) -> Result<TransferId, UsbError> {
        self.check_alive()?;
        let attrs = {
            let s = self.sched.lock();
            let pipe = s.pipes.get(pipe_id).ok_or(UsbError::NoSuchPipe)?;
            if pipe.closing {
                return Err(UsbError::PipeClosing);
            }
            pipe.attrs
        };
        Self::validate(&attrs, &req)?;

        let len = req.length as usize;
        match attrs.kind {
            EndpointType::Isochronous => self.reserve(0, 0, req.frames.len() + 1)?,
            _ => self.reserve(0, len / PAGE_SIZE as usize + 4, 0)?,
        }

        let setup = match req.setup {
            Some(packet) => Some(self.setup_buffer(&packet)?),
            None => None,
        };
        if let Some(buf) = req.buffer.filter(|_| len > 0) {
            self.host.sync(&buf, 0, len, SyncOp::ForDevice);
        }

        let mut guard = self.sched.lock();
        let s = &mut *guard;
        let result = match s.pipes.get(pipe_id) {
            None => Err(UsbError::NoSuchPipe),
            Some(pipe) if pipe.closing => Err(UsbError::PipeClosing),
            Some(_) => self.link_transfer(s, pipe_id, &attrs, &mut req, setup),
        };
        drop(guard);

        if result.is_err() {
            if let Some(region) = setup {
                self.host.release(region);
            }
        }
        result
    }

    fn validate(attrs: &EndpointAttrs, req: &TransferRequest) -> Result<(), UsbError> {
        if req.length > 0 {
            let buf = req.buffer.ok_or(UsbError::InvalidParameter)?;
            if buf.len() < req.length as usize {
                return Err(UsbError::InvalidParameter);
            }
        }
        let ok = match attrs.kind {
            EndpointType::Control => req.setup.is_some(),
            EndpointType::Isochronous => {
                let limit = u32::from(attrs.max_packet).min(ISO_MAX_PACKET);
                req.setup.is_none()
                    && !req.frames.is_empty()
                    && req.buffer.is_some()
                    && req.frames.iter().all(|&f| u32::from(f) <= limit)
            }
            EndpointType::Bulk | EndpointType::Interrupt => req.setup.is_none(),
        };
        if ok { Ok(()) } else { Err(UsbError::InvalidParameter) }
    }

    /// Per-transfer DMA copy of the SETUP packet
    fn setup_buffer(&self, packet: &SetupPacket) -> Result<DmaRegion, UsbError> {
        let region = self.host.allocate(8, 16, AllocMode::MayBlock)?;
        region.copy_from_slice(0, &packet.to_bytes());
        self.host.sync(&region, 0, 8, SyncOp::ForDevice);
        Ok(region)
    }

    /// Build and link the chain; the transfer exists only if this succeeds
    fn link_transfer(
        &self,
        s: &mut Schedule,
        pipe_id: PipeId,
        attrs: &EndpointAttrs,
        req: &mut TransferRequest,
        setup: Option<DmaRegion>,
    ) -> Result<TransferId, UsbError> {
        let direction = match &req.setup {
            Some(packet) => packet.direction(),
            None => attrs.direction,
        };
        let id = s.transfers.insert(Transfer::new(pipe_id, direction, req));

        let linked = match (attrs.kind, req.setup, setup) {
            (EndpointType::Control, Some(packet), Some(region)) => {
                self.link_control(s, pipe_id, id, attrs, req, &packet, region)
            }
            (EndpointType::Isochronous, None, None) => self.link_iso(s, pipe_id, id, req),
            (EndpointType::Bulk | EndpointType::Interrupt, None, None) => {
                self.link_data(s, pipe_id, id, attrs, req)
            }
            _ => Err(UsbError::InvalidParameter),
        };
        if let Err(e) = linked {
            s.transfers.remove(id);
            return Err(e);
        }

        let deadline = req
            .timeout_ms
            .map(|ms| self.host.now_ms() + u64::from(ms));
        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.status = TransferStatus::InProgress;
            xfer.deadline = deadline;
            xfer.setup = setup;
        }
        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.pending.push_back(id);
        }
        log::trace!(
            "OHCI: transfer {:?} queued on {:?}, {} bytes",
            id,
            pipe_id,
            req.length
        );
        Ok(id)
    }

    /// Let the last TD of a transfer interrupt and complete it
    fn mark_last(tds: &mut Pool<Td>, dma: &H, last: TdHandle) {
        if let Some(scope) = tds.scope(dma, last) {
            scope.modify_u32(TD_FLAGS, |f| (f & !td::DI_MASK) | td::set_di(1));
        }
        if let Some(soft) = tds.get_mut(last) {
            soft.flags |= NodeFlags::CALL_DONE;
        }
    }

    /// Move the ED's tail; from here on the controller may run the chain
    fn commit_tail(&self, s: &Schedule, pipe: &Pipe, tail_phys: u32) {
        if let Some(scope) = s.arena.eds.scope(&self.host, pipe.ed) {
            scope.write_u32(ED_TAILP, tail_phys);
        }
    }

    fn link_data(
        &self,
        s: &mut Schedule,
        pipe_id: PipeId,
        id: TransferId,
        attrs: &EndpointAttrs,
        req: &TransferRequest,
    ) -> Result<(), UsbError> {
        let Some(Tail::Td(start)) = s.pipes.get(pipe_id).map(|p| p.tail) else {
            return Err(UsbError::InvalidParameter);
        };
        let spec = ChainSpec {
            transfer: id,
            buffer_phys: req.buffer.map_or(0, |b| b.phys()),
            len: req.length,
            max_packet: u32::from(attrs.max_packet),
            direction: attrs.direction,
            short_ok: req.flags.contains(TransferFlags::SHORT_OK),
            force_short: req.flags.contains(TransferFlags::FORCE_SHORT),
        };
        let chain = build_td_chain(&mut s.arena.tds, &mut s.index.tds, &self.host, start, &spec)?;
        Self::mark_last(&mut s.arena.tds, &self.host, chain.last);

        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.head = Some(ChainHead::Td(chain.first));
        }
        let tail_phys = s.arena.tds.phys(chain.next).unwrap_or(0);
        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.tail = Tail::Td(chain.next);
        }
        if let Some(pipe) = s.pipes.get(pipe_id) {
            self.commit_tail(s, pipe, tail_phys);
        }
        if attrs.kind == EndpointType::Bulk {
            self.host.write_reg(OhciReg::CommandStatus, command::BLF);
        }
        Ok(())
    }

    /// SETUP TD, optional data stage, STATUS TD
    #[allow(clippy::too_many_arguments)]
    fn link_control(
        &self,
        s: &mut Schedule,
        pipe_id: PipeId,
        id: TransferId,
        attrs: &EndpointAttrs,
        req: &TransferRequest,
        packet: &SetupPacket,
        setup: DmaRegion,
    ) -> Result<(), UsbError> {
        let Some(Tail::Td(setup_td)) = s.pipes.get(pipe_id).map(|p| p.tail) else {
            return Err(UsbError::InvalidParameter);
        };
        let stat = alloc_td(&mut s.arena.tds, &mut s.index.tds, &self.host)?;
        let tail = match alloc_td(&mut s.arena.tds, &mut s.index.tds, &self.host) {
            Ok(tail) => tail,
            Err(e) => {
                free_td(&mut s.arena.tds, &mut s.index.tds, stat);
                return Err(e);
            }
        };

        let data_in = packet.direction() == Direction::In;
        let mut status_td = stat;
        if req.length > 0 {
            let spec = ChainSpec {
                transfer: id,
                buffer_phys: req.buffer.map_or(0, |b| b.phys()),
                len: req.length,
                max_packet: u32::from(attrs.max_packet),
                direction: packet.direction(),
                short_ok: req.flags.contains(TransferFlags::SHORT_OK),
                force_short: false,
            };
            match build_td_chain(&mut s.arena.tds, &mut s.index.tds, &self.host, stat, &spec) {
                Ok(chain) => {
                    status_td = chain.next;
                    // The data stage always starts with DATA1
                    if let Some(scope) = s.arena.tds.scope(&self.host, stat) {
                        scope.modify_u32(TD_FLAGS, |f| (f & !td::TOGGLE_MASK) | td::TOGGLE_1);
                    }
                }
                Err(e) => {
                    free_td(&mut s.arena.tds, &mut s.index.tds, stat);
                    free_td(&mut s.arena.tds, &mut s.index.tds, tail);
                    return Err(e);
                }
            }
        }

        chain::link_td(
            &mut s.arena.tds,
            &self.host,
            setup_td,
            stat,
            id,
            td::DP_SETUP | td::NOCC | td::TOGGLE_0 | td::NOINTR,
            setup.phys(),
            8,
            NodeFlags::empty(),
        );
        chain::link_td(
            &mut s.arena.tds,
            &self.host,
            status_td,
            tail,
            id,
            (if data_in { td::DP_OUT } else { td::DP_IN }) | td::NOCC | td::TOGGLE_1 | td::set_di(1),
            0,
            0,
            NodeFlags::CALL_DONE,
        );

        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.head = Some(ChainHead::Td(setup_td));
        }
        let tail_phys = s.arena.tds.phys(tail).unwrap_or(0);
        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.tail = Tail::Td(tail);
        }
        if let Some(pipe) = s.pipes.get(pipe_id) {
            self.commit_tail(s, pipe, tail_phys);
        }
        self.host.write_reg(OhciReg::CommandStatus, command::CLF);
        Ok(())
    }

    fn link_iso(
        &self,
        s: &mut Schedule,
        pipe_id: PipeId,
        id: TransferId,
        req: &TransferRequest,
    ) -> Result<(), UsbError> {
        let Some((Tail::Itd(start), next_frame)) =
            s.pipes.get(pipe_id).map(|p| (p.tail, p.iso.next_frame))
        else {
            return Err(UsbError::InvalidParameter);
        };
        let start_frame =
            next_frame.unwrap_or_else(|| self.current_frame() + self.config.iso_start_delay);

        let frames = &s
            .transfers
            .get(id)
            .ok_or(UsbError::InvalidParameter)?
            .requested_frames;
        let spec = IsoSpec {
            transfer: id,
            buffer_phys: req.buffer.map_or(0, |b| b.phys()),
            frames,
            start_frame,
        };
        let chain = build_itd_chain(&mut s.arena.itds, &mut s.index.itds, &self.host, start, &spec)?;
        let nframes = frames.len() as u32;

        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.head = Some(ChainHead::Itd(chain.first));
        }
        let tail_phys = s.arena.itds.phys(chain.next).unwrap_or(0);
        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.tail = Tail::Itd(chain.next);
            pipe.iso.next_frame = Some(chain.next_frame);
            pipe.iso.inuse += nframes;
        }
        if let Some(pipe) = s.pipes.get(pipe_id) {
            self.commit_tail(s, pipe, tail_phys);
        }
        log::trace!(
            "OHCI: {} iso frames from frame {} in {} ITDs",
            nframes,
            start_frame & 0xFFFF,
            chain.nodes
        );
        Ok(())
    }

    /// Mark `id` finished, release what it still holds besides its nodes
    /// and hand back its callback.
    ///
    /// The record stays in the table while threads wait on it.
    fn retire(
        &self,
        s: &mut Schedule,
        id: TransferId,
        status: CompletionStatus,
    ) -> Option<Finished> {
        let xfer = s.transfers.get_mut(id)?;
        let finished = xfer.finish(id, status)?;
        let pipe_id = xfer.pipe;
        let waiters = xfer.waiters;
        let len = xfer.length as usize;
        let nframes = xfer.requested_frames.len() as u32;
        if let Some(buf) = xfer.buffer.filter(|_| len > 0) {
            self.host.sync(&buf, 0, len, SyncOp::ForCpu);
        }
        if let Some(region) = xfer.setup.take() {
            self.host.release(region);
        }

        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.remove_pending(id);
            if pipe.attrs.kind == EndpointType::Isochronous {
                pipe.iso.inuse = pipe.iso.inuse.saturating_sub(nframes);
            }
        }
        if waiters == 0 {
            s.transfers.remove(id);
        }
        log::trace!("OHCI: transfer {:?} finished: {:?}", id, status);
        Some(finished)
    }

    /// Drop one waiter reference; the last one out of a finished transfer
    /// frees its record
    fn leave(s: &mut Schedule, id: TransferId) {
        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.waiters = xfer.waiters.saturating_sub(1);
            if xfer.waiters == 0 && xfer.is_terminal() {
                s.transfers.remove(id);
            }
        }
    }

    /// Current status of a transfer still known to the engine
    pub fn transfer_status(&self, id: TransferId) -> Option<TransferStatus> {
        self.sched.lock().transfers.get(id).map(|x| x.status)
    }

    #[cfg(test)]
    pub(crate) fn abort_in_progress(&self, id: TransferId) -> bool {
        self.sched
            .lock()
            .transfers
            .get(id)
            .is_some_and(|x| matches!(x.abort, transfer::AbortState::Aborting(_)))
    }

    pub fn stats(&self) -> EngineStats {
        let overruns = self.intr.lock().overruns;
        let s = self.sched.lock();
        EngineStats {
            pipes: s.pipes.len(),
            transfers: s.transfers.len(),
            eds: s.arena.eds.outstanding(),
            tds: s.arena.tds.outstanding(),
            itds: s.arena.itds.outstanding(),
            indexed: s.index.len(),
            allocated: s.arena.tds.allocated() + s.arena.itds.allocated(),
            released: s.arena.tds.released() + s.arena.itds.released(),
            overruns,
        }
    }

    /// Stop the controller and fail everything still queued
    pub fn shutdown(&self) {
        let was_dying = self.dying.swap(true, Ordering::AcqRel);
        if !was_dying {
            log::debug!("OHCI cleanup: stopping controller");
            self.host
                .write_reg(OhciReg::InterruptDisable, intr::ALL | intr::MIE);
            let ctl = self.host.read_reg(OhciReg::Control);
            self.host.write_reg(
                OhciReg::Control,
                (ctl & !(control::ALL_LISTS | control::HCFS_MASK)) | control::HCFS_RESET,
            );
        }
        self.running.store(false, Ordering::Release);

        let live: Vec<TransferId> = {
            let s = self.sched.lock();
            s.transfers
                .keys()
                .into_iter()
                .filter(|&id| s.transfers.get(id).is_some_and(|x| !x.is_terminal()))
                .collect()
        };
        for id in live {
            self.abort_with(id, CompletionStatus::Cancelled);
        }
        log::debug!("OHCI cleanup complete");
    }
}

impl<H: OhciHost> Drop for OhciController<H> {
    fn drop(&mut self) {
        let s = self.sched.get_mut();
        for id in s.transfers.keys() {
            if let Some(region) = s.transfers.get_mut(id).and_then(|x| x.setup.take()) {
                self.host.release(region);
            }
        }
        s.index.tds.clear();
        s.index.itds.clear();
        s.arena.drain(&self.host);
        self.host.release(self.hcca);
    }
}
