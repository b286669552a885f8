//! Simulated OHCI host for unit tests
//!
//! [`SimHost`] provides DMA memory with fake physical addresses, a fake
//! millisecond clock, a register file with OHCI write semantics and a small
//! model of the controller's list processing. [`SimHost::run_frame`] walks
//! the control, bulk and periodic lists, executes every queued descriptor
//! and retires it onto the done list exactly as the hardware would, so the
//! engine's completion and abort paths run against real descriptor memory.

use std::alloc::Layout;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::dma::{AllocMode, DmaError, DmaMemory, DmaRegion, SyncOp};
use crate::drivers::usb::ohci::desc::{
    ED_FLAGS, ED_HEADP, ED_NEXTED, ED_TAILP, HCCA_DONE_HEAD, HCCA_FRAME_NUMBER,
    HCCA_INTERRUPT_TABLE, ITD_NOFFSET, NO_INTRS, cc, ed, itd, td,
};
use crate::drivers::usb::ohci::regs::{OhciReg, RegisterAccess, control, intr};
use crate::drivers::usb::ohci::{OhciConfig, OhciController};
use crate::drivers::usb::{Direction, EndpointAttrs, EndpointType, UsbSpeed};
use crate::platform::Platform;

/// What the simulated device does with the next descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdOutcome {
    Complete,
    Stall,
    Crc,
    /// Device returns only this many bytes
    Short(u32),
    /// The frame went by without the controller touching the descriptor
    NotAccessed,
}

const FIRST_PHYS: u32 = 0x0010_0000;
const FIRST_FRAME: u32 = 0x100;
const CC_DATA_UNDERRUN: u32 = 9;
const CC_CRC: u32 = 1;

struct Block {
    virt: usize,
    layout: Layout,
}

struct Memory {
    blocks: BTreeMap<u32, Block>,
    next_phys: u32,
    allocations: usize,
}

struct HcState {
    regs: [u32; 17],
    status: u32,
    enable: u32,
    commands: [usize; 32],
    frame: u32,
    /// Retired descriptors not yet written back to the HCCA
    done_pending: u32,
    script: VecDeque<TdOutcome>,
    iso_script: BTreeMap<u32, TdOutcome>,
    /// Isochronous frames executed so far
    iso_frames: u32,
}

struct Inner {
    mem: Mutex<Memory>,
    hc: Mutex<HcState>,
    clock: AtomicU64,
    softintr: AtomicBool,
    fail: AtomicBool,
    frame_on_delay: AtomicBool,
    for_cpu: AtomicUsize,
    for_device: AtomicUsize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, block) in core::mem::take(&mut self.mem.get_mut().blocks) {
            // SAFETY: every block was allocated with exactly this layout
            unsafe { std::alloc::dealloc(block.virt as *mut u8, block.layout) };
        }
    }
}

/// Test double for everything an [`OhciController`] needs from its host
#[derive(Clone)]
pub struct SimHost {
    inner: Arc<Inner>,
}

impl SimHost {
    pub fn new() -> Self {
        let mut regs = [0u32; 17];
        regs[reg_slot(OhciReg::Revision)] = 0x10;
        regs[reg_slot(OhciReg::FmInterval)] = 0x2EDF | (0x2778 << 16);
        Self {
            inner: Arc::new(Inner {
                mem: Mutex::new(Memory {
                    blocks: BTreeMap::new(),
                    next_phys: FIRST_PHYS,
                    allocations: 0,
                }),
                hc: Mutex::new(HcState {
                    regs,
                    status: 0,
                    enable: 0,
                    commands: [0; 32],
                    frame: FIRST_FRAME,
                    done_pending: 0,
                    script: VecDeque::new(),
                    iso_script: BTreeMap::new(),
                    iso_frames: 0,
                }),
                clock: AtomicU64::new(0),
                softintr: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                frame_on_delay: AtomicBool::new(false),
                for_cpu: AtomicUsize::new(0),
                for_device: AtomicUsize::new(0),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Successful allocations since creation
    pub fn dma_allocations(&self) -> usize {
        self.inner.mem.lock().allocations
    }

    /// Regions allocated and not yet released
    pub fn live_allocations(&self) -> usize {
        self.inner.mem.lock().blocks.len()
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// (ForCpu, ForDevice) sync calls so far
    pub fn sync_counts(&self) -> (usize, usize) {
        (
            self.inner.for_cpu.load(Ordering::SeqCst),
            self.inner.for_device.load(Ordering::SeqCst),
        )
    }

    /// Page-aligned data buffer
    pub fn dma_buffer(&self, len: usize) -> DmaRegion {
        self.allocate(len, 4096, AllocMode::MayBlock)
            .expect("buffer allocation")
    }

    /// Data buffer starting `offset` bytes into a page
    pub fn buffer_at_page_offset(&self, len: usize, offset: usize) -> DmaRegion {
        let region = self
            .allocate(len + offset, 4096, AllocMode::MayBlock)
            .expect("buffer allocation");
        region.sub(offset, len).expect("sub-region")
    }

    fn ptr(&self, phys: u32, size: usize) -> *mut u8 {
        let mem = self.inner.mem.lock();
        let (&base, block) = mem
            .blocks
            .range(..=phys)
            .next_back()
            .unwrap_or_else(|| panic!("no DMA memory at {:#010x}", phys));
        let offset = (phys - base) as usize;
        assert!(
            offset + size <= block.layout.size(),
            "access at {:#010x} outside its region",
            phys
        );
        (block.virt + offset) as *mut u8
    }

    pub fn read_phys<T: FromBytes>(&self, phys: u32) -> T {
        let size = core::mem::size_of::<T>();
        let p = self.ptr(phys, size);
        // SAFETY: ptr checked that the range lies inside a live block
        let bytes = unsafe { core::slice::from_raw_parts(p, size) };
        T::read_from_bytes(bytes).ok().expect("sized read")
    }

    pub fn write_phys<T: IntoBytes + Immutable>(&self, phys: u32, value: T) {
        let bytes = value.as_bytes();
        let p = self.ptr(phys, bytes.len());
        // SAFETY: as above
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
    }

    fn rd(&self, phys: u32) -> u32 {
        let p = self.ptr(phys, 4) as *const u32;
        // SAFETY: in bounds, descriptors are 16-byte aligned
        unsafe { core::ptr::read_volatile(p) }
    }

    fn wr(&self, phys: u32, value: u32) {
        let p = self.ptr(phys, 4) as *mut u32;
        // SAFETY: as above
        unsafe { core::ptr::write_volatile(p, value) }
    }

    // ------------------------------------------------------------------
    // Clock and deferred work
    // ------------------------------------------------------------------

    pub fn now(&self) -> u64 {
        self.inner.clock.load(Ordering::SeqCst)
    }

    pub fn advance(&self, ms: u64) {
        self.inner.clock.fetch_add(ms, Ordering::SeqCst);
    }

    /// Run one frame on every `delay_ms`, as a live controller would
    pub fn run_every_delay(&self, on: bool) {
        self.inner.frame_on_delay.store(on, Ordering::SeqCst);
    }

    /// Whether a completion pass was requested since the last call
    pub fn take_softintr(&self) -> bool {
        self.inner.softintr.swap(false, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------

    pub fn reg(&self, reg: OhciReg) -> u32 {
        self.read_reg(reg)
    }

    /// Assert interrupt status bits
    pub fn raise(&self, bits: u32) {
        self.inner.hc.lock().status |= bits;
    }

    /// How often `bit` was written to HcCommandStatus
    pub fn command_writes(&self, bit: u32) -> usize {
        self.inner.hc.lock().commands[bit.trailing_zeros() as usize % 32]
    }

    pub fn frame_number(&self) -> u32 {
        self.inner.hc.lock().frame
    }

    pub fn write_done_head(&self, phys: u32) {
        let hcca = self.inner.hc.lock().regs[reg_slot(OhciReg::Hcca)];
        self.wr(hcca + HCCA_DONE_HEAD as u32, phys);
    }

    // ------------------------------------------------------------------
    // Controller model
    // ------------------------------------------------------------------

    /// Outcome for the next general TD the controller executes
    pub fn script(&self, outcome: TdOutcome) {
        self.inner.hc.lock().script.push_back(outcome);
    }

    /// Outcome for the `n`th isochronous frame executed since creation
    pub fn script_iso_frame(&self, n: u32, outcome: TdOutcome) {
        self.inner.hc.lock().iso_script.insert(n, outcome);
    }

    /// Execute every queued descriptor once and write back the done list
    pub fn run_frame(&self) {
        self.run(None);
    }

    /// Execute at most `n` descriptors, then write back the done list
    pub fn run_tds(&self, n: usize) {
        self.run(Some(n));
    }

    fn run(&self, budget: Option<usize>) {
        let mut hc = self.inner.hc.lock();
        let ctl = hc.regs[reg_slot(OhciReg::Control)];
        if ctl & control::HCFS_MASK != control::HCFS_OPERATIONAL {
            return;
        }
        let mut budget = budget;
        let hcca = hc.regs[reg_slot(OhciReg::Hcca)];

        if ctl & control::PLE != 0 {
            let mut visited = BTreeSet::new();
            for slot in 0..NO_INTRS {
                let mut phys = self.rd(hcca + (HCCA_INTERRUPT_TABLE + 4 * slot) as u32);
                while phys != 0 && visited.insert(phys) {
                    self.run_ed(&mut hc, phys, &mut budget);
                    phys = self.rd(phys + ED_NEXTED as u32) & ed::HEADMASK;
                }
            }
        }
        for (enable, head) in [
            (control::CLE, OhciReg::ControlHeadEd),
            (control::BLE, OhciReg::BulkHeadEd),
        ] {
            if ctl & enable == 0 {
                continue;
            }
            let mut phys = hc.regs[reg_slot(head)];
            while phys != 0 {
                self.run_ed(&mut hc, phys, &mut budget);
                phys = self.rd(phys + ED_NEXTED as u32) & ed::HEADMASK;
            }
        }

        hc.frame = hc.frame.wrapping_add(1);
        self.write_phys(hcca + HCCA_FRAME_NUMBER as u32, hc.frame as u16);

        let done_addr = hcca + HCCA_DONE_HEAD as u32;
        if hc.done_pending != 0 && self.rd(done_addr) == 0 && hc.status & intr::WDH == 0 {
            self.wr(done_addr, hc.done_pending);
            hc.done_pending = 0;
            hc.status |= intr::WDH;
        }
    }

    fn run_ed(&self, hc: &mut HcState, ed_phys: u32, budget: &mut Option<usize>) {
        let flags = self.rd(ed_phys + ED_FLAGS as u32);
        if flags & ed::SKIP != 0 {
            return;
        }
        loop {
            let headp = self.rd(ed_phys + ED_HEADP as u32);
            let tailp = self.rd(ed_phys + ED_TAILP as u32);
            if headp & ed::HALTED != 0 || headp & ed::HEADMASK == tailp {
                return;
            }
            match budget {
                Some(0) => return,
                Some(n) => *n -= 1,
                None => {}
            }
            let cur = headp & ed::HEADMASK;
            let (next, carry, halted) = if flags & ed::FORMAT_ISO != 0 {
                let dir_in = flags & ed::DIR_MASK == ed::DIR_IN;
                (self.run_itd(hc, cur, dir_in), false, false)
            } else {
                self.run_td(hc, cur, flags, headp & ed::TOGGLECARRY != 0)
            };
            let mut new_head = next;
            if carry {
                new_head |= ed::TOGGLECARRY;
            }
            if halted {
                new_head |= ed::HALTED;
            }
            self.wr(ed_phys + ED_HEADP as u32, new_head);
        }
    }

    /// Returns (next TD, toggle carry, halted)
    fn run_td(&self, hc: &mut HcState, cur: u32, ed_flags: u32, carry: bool) -> (u32, bool, bool) {
        let flags = self.rd(cur);
        let cbp = self.rd(cur + 4);
        let next = self.rd(cur + 8);
        let be = self.rd(cur + 12);
        let len = if cbp == 0 { 0 } else { be - cbp + 1 };
        let mps = ed::get_maxp(ed_flags).max(1);
        let toggle = if flags & (1 << 25) != 0 {
            flags & (1 << 24) != 0
        } else {
            carry
        };
        let packets = |n: u32| n.div_ceil(mps).max(1);

        let outcome = hc.script.pop_front().unwrap_or(TdOutcome::Complete);
        let (code, new_cbp, toggle) = match outcome {
            TdOutcome::Complete | TdOutcome::NotAccessed => {
                (cc::NO_ERROR, 0, toggle ^ (packets(len) & 1 != 0))
            }
            TdOutcome::Short(n) if n >= len => (cc::NO_ERROR, 0, toggle ^ (packets(len) & 1 != 0)),
            TdOutcome::Short(n) => {
                let code = if flags & td::R != 0 {
                    cc::NO_ERROR
                } else {
                    CC_DATA_UNDERRUN
                };
                (code, cbp + n, toggle ^ ((n / mps + 1) & 1 != 0))
            }
            TdOutcome::Stall => (cc::STALL, cbp, toggle),
            TdOutcome::Crc => (CC_CRC, cbp, toggle),
        };

        self.wr(cur, (flags & !td::CC_MASK) | (code << td::CC_SHIFT));
        self.wr(cur + 4, new_cbp);
        self.wr(cur + 8, hc.done_pending);
        hc.done_pending = cur;
        (next, toggle, code != cc::NO_ERROR)
    }

    /// Execute every frame of an ITD; returns the next ITD
    fn run_itd(&self, hc: &mut HcState, cur: u32, dir_in: bool) -> u32 {
        let flags = self.rd(cur);
        let bp0 = self.rd(cur + 4);
        let next = self.rd(cur + 8);
        let be = self.rd(cur + 12);
        let nframes = (itd::get_fc(flags) as usize).min(ITD_NOFFSET);
        let offsets: [u16; ITD_NOFFSET] = self.read_phys(cur + 16);
        let end = be - bp0 + 1;

        let mut psw = offsets;
        for i in 0..nframes {
            let start = u32::from(offsets[i]) & 0x1FFF;
            let stop = if i + 1 < nframes {
                u32::from(offsets[i + 1]) & 0x1FFF
            } else {
                end
            };
            let size = stop - start;
            let key = hc.iso_frames;
            hc.iso_frames += 1;
            psw[i] = match hc.iso_script.remove(&key).unwrap_or(TdOutcome::Complete) {
                TdOutcome::NotAccessed => offsets[i],
                TdOutcome::Stall => (cc::STALL << 12) as u16,
                TdOutcome::Crc => (CC_CRC << 12) as u16,
                TdOutcome::Short(n) if dir_in => n.min(size) as u16,
                TdOutcome::Complete if dir_in => size as u16,
                _ => 0,
            };
        }

        self.write_phys(cur + 16, psw);
        self.wr(cur, flags & !itd::CC_MASK);
        self.wr(cur + 8, hc.done_pending);
        hc.done_pending = cur;
        next
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

fn reg_slot(reg: OhciReg) -> usize {
    (reg.offset() / 4) as usize
}

impl DmaMemory for SimHost {
    fn allocate(&self, size: usize, align: usize, _mode: AllocMode) -> Result<DmaRegion, DmaError> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(DmaError::OutOfMemory);
        }
        let align = align.max(16);
        let layout =
            Layout::from_size_align(size.max(1), align).map_err(|_| DmaError::BadAlignment)?;
        let mut mem = self.inner.mem.lock();
        let phys = mem.next_phys.next_multiple_of(align as u32);
        mem.next_phys = phys + (layout.size() as u32).next_multiple_of(16) + 16;
        // SAFETY: layout has a non-zero size
        let virt = unsafe { std::alloc::alloc_zeroed(layout) };
        // SAFETY: virt points to size zeroed bytes owned by this block
        let region = unsafe { DmaRegion::new(virt, phys, size) }.ok_or(DmaError::OutOfMemory)?;
        mem.blocks.insert(
            phys,
            Block {
                virt: virt as usize,
                layout,
            },
        );
        mem.allocations += 1;
        Ok(region)
    }

    fn release(&self, region: DmaRegion) {
        if let Some(block) = self.inner.mem.lock().blocks.remove(&region.phys()) {
            // SAFETY: allocated in allocate() with this layout
            unsafe { std::alloc::dealloc(block.virt as *mut u8, block.layout) };
        }
    }

    fn sync(&self, _region: &DmaRegion, _offset: usize, _len: usize, op: SyncOp) {
        match op {
            SyncOp::ForCpu => self.inner.for_cpu.fetch_add(1, Ordering::SeqCst),
            SyncOp::ForDevice => self.inner.for_device.fetch_add(1, Ordering::SeqCst),
        };
    }
}

impl Platform for SimHost {
    fn delay_ms(&self, ms: u32) {
        self.advance(u64::from(ms));
        if self.inner.frame_on_delay.load(Ordering::SeqCst) {
            self.run_frame();
        }
    }

    fn now_ms(&self) -> u64 {
        self.now()
    }

    fn schedule_softintr(&self) {
        self.inner.softintr.store(true, Ordering::SeqCst);
    }

    fn wait_event(&self) {
        std::thread::sleep(Duration::from_millis(1));
        self.advance(1);
    }

    // Waiters wake on the 1 ms tick above
    fn notify_event(&self) {}
}

impl RegisterAccess for SimHost {
    fn read_reg(&self, reg: OhciReg) -> u32 {
        let hc = self.inner.hc.lock();
        match reg {
            OhciReg::InterruptStatus => hc.status,
            OhciReg::InterruptEnable | OhciReg::InterruptDisable => hc.enable,
            OhciReg::FmNumber => hc.frame & 0xFFFF,
            _ => hc.regs[reg_slot(reg)],
        }
    }

    fn write_reg(&self, reg: OhciReg, value: u32) {
        let mut hc = self.inner.hc.lock();
        match reg {
            OhciReg::InterruptStatus => hc.status &= !value,
            OhciReg::InterruptEnable => hc.enable |= value,
            OhciReg::InterruptDisable => hc.enable &= !value,
            OhciReg::CommandStatus => {
                for bit in 0..32 {
                    if value & (1 << bit) != 0 {
                        hc.commands[bit] += 1;
                    }
                }
            }
            OhciReg::Hcca => {
                hc.regs[reg_slot(reg)] = value;
                let frame = hc.frame as u16;
                drop(hc);
                self.write_phys(value + HCCA_FRAME_NUMBER as u32, frame);
            }
            _ => hc.regs[reg_slot(reg)] = value,
        }
    }
}

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

/// Started controller on a fresh simulated host
pub fn controller() -> OhciController<SimHost> {
    let ctl = OhciController::new(SimHost::new(), OhciConfig::default()).expect("controller");
    ctl.start().expect("start");
    ctl
}

fn endpoint(addr: u8, ep: u8, mps: u16, kind: EndpointType, direction: Direction) -> EndpointAttrs {
    EndpointAttrs {
        device_address: addr,
        endpoint: ep,
        direction,
        kind,
        max_packet: mps,
        interval_ms: 0,
        speed: UsbSpeed::Full,
        toggle: false,
    }
}

pub fn bulk_out(addr: u8, ep: u8, mps: u16) -> EndpointAttrs {
    endpoint(addr, ep, mps, EndpointType::Bulk, Direction::Out)
}

pub fn bulk_in(addr: u8, ep: u8, mps: u16) -> EndpointAttrs {
    endpoint(addr, ep, mps, EndpointType::Bulk, Direction::In)
}

pub fn iso_in(addr: u8, ep: u8, mps: u16) -> EndpointAttrs {
    endpoint(addr, ep, mps, EndpointType::Isochronous, Direction::In)
}

pub fn iso_out(addr: u8, ep: u8, mps: u16) -> EndpointAttrs {
    endpoint(addr, ep, mps, EndpointType::Isochronous, Direction::Out)
}
