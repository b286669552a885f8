//! Transfers: requests, their in-flight state and completion reports

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::arena::{ItdHandle, TdHandle};
use super::desc::ConditionCode;
use super::pipe::PipeId;
use super::slab::Key;
use crate::dma::DmaRegion;
use crate::drivers::usb::Direction;

pub type TransferId = Key<Transfer>;

bitflags! {
    /// Per-transfer submission flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransferFlags: u8 {
        /// A short packet ends the transfer without error
        const SHORT_OK = 1 << 0;
        /// OUT transfers that are an exact multiple of the max packet size
        /// get a trailing zero-length packet
        const FORCE_SHORT = 1 << 1;
    }
}

/// Lifecycle of a transfer as the engine tracks it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    InProgress,
    Cancelled,
    TimedOut,
    Completed,
    Stalled,
    IoError(ConditionCode),
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::NotStarted | TransferStatus::InProgress)
    }

    fn from_completion(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => TransferStatus::Completed,
            CompletionStatus::Stalled => TransferStatus::Stalled,
            CompletionStatus::IoError(cc) => TransferStatus::IoError(cc),
            CompletionStatus::Cancelled => TransferStatus::Cancelled,
            CompletionStatus::TimedOut => TransferStatus::TimedOut,
        }
    }
}

/// Final outcome reported to the completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    /// The endpoint returned STALL; clear the halt and the toggle
    Stalled,
    /// Any other hardware error
    IoError(ConditionCode),
    /// Aborted by a caller or a pipe close
    Cancelled,
    TimedOut,
}

impl CompletionStatus {
    /// Classify a retired node's condition code
    pub fn from_condition(cc: ConditionCode) -> Self {
        match cc {
            ConditionCode::NoError => CompletionStatus::Completed,
            ConditionCode::Stall => CompletionStatus::Stalled,
            other => CompletionStatus::IoError(other),
        }
    }
}

/// Result of one isochronous frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameResult {
    /// Bytes moved
    pub length: u16,
    pub status: ConditionCode,
}

/// Everything the completion callback learns about a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub status: CompletionStatus,
    pub actual_length: u32,
    /// Per-frame results, isochronous transfers only
    pub frames: Vec<FrameResult>,
}

/// Invoked exactly once per submitted transfer, from task context
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// The 8-byte SETUP stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    /// Data stage direction
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// A request as submitted by the pipe layer
pub struct TransferRequest {
    pub(crate) buffer: Option<DmaRegion>,
    pub(crate) length: u32,
    pub(crate) flags: TransferFlags,
    pub(crate) setup: Option<SetupPacket>,
    pub(crate) frames: Vec<u16>,
    pub(crate) timeout_ms: Option<u32>,
    pub(crate) callback: Option<CompletionCallback>,
}

impl TransferRequest {
    /// Bulk or interrupt transfer of `length` bytes of `buffer`
    pub fn new(buffer: Option<DmaRegion>, length: u32) -> Self {
        Self {
            buffer,
            length,
            flags: TransferFlags::empty(),
            setup: None,
            frames: Vec::new(),
            timeout_ms: None,
            callback: None,
        }
    }

    /// Control transfer; the data stage length comes from `setup`
    pub fn control(setup: SetupPacket, buffer: Option<DmaRegion>) -> Self {
        let mut req = Self::new(buffer, setup.length as u32);
        req.setup = Some(setup);
        req
    }

    /// Isochronous transfer of consecutive frames packed in `buffer`
    pub fn isochronous(buffer: DmaRegion, frames: Vec<u16>) -> Self {
        let length = frames.iter().map(|&f| f as u32).sum();
        let mut req = Self::new(Some(buffer), length);
        req.frames = frames;
        req
    }

    pub fn flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn timeout_ms(mut self, ms: u32) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }
}

/// First node of a transfer still owned by it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainHead {
    Td(TdHandle),
    Itd(ItdHandle),
}

/// Abort state machine of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortState {
    Active,
    /// An abort run is in progress with this final status
    Aborting(CompletionStatus),
}

/// In-flight transfer record
pub struct Transfer {
    pub(crate) pipe: PipeId,
    pub(crate) direction: Direction,
    pub(crate) length: u32,
    pub(crate) actual: u32,
    pub(crate) status: TransferStatus,
    pub(crate) abort: AbortState,
    /// Threads inside an abort run or waiting for one
    pub(crate) waiters: u32,
    pub(crate) head: Option<ChainHead>,
    pub(crate) buffer: Option<DmaRegion>,
    /// SETUP stage buffer, control transfers only
    pub(crate) setup: Option<DmaRegion>,
    pub(crate) frames: Vec<FrameResult>,
    pub(crate) requested_frames: Vec<u16>,
    pub(crate) deadline: Option<u64>,
    pub(crate) callback: Option<CompletionCallback>,
    pub(crate) outcome: Option<CompletionStatus>,
}

impl Transfer {
    pub(crate) fn new(pipe: PipeId, direction: Direction, req: &mut TransferRequest) -> Self {
        Self {
            pipe,
            direction,
            length: req.length,
            actual: 0,
            status: TransferStatus::NotStarted,
            abort: AbortState::Active,
            waiters: 0,
            head: None,
            buffer: req.buffer,
            setup: None,
            frames: Vec::new(),
            requested_frames: core::mem::take(&mut req.frames),
            deadline: None,
            callback: req.callback.take(),
            outcome: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> Self {
        let mut pipes: super::slab::Slab<super::pipe::Pipe> = super::slab::Slab::new();
        let pipe = pipes.insert(super::pipe::Pipe::placeholder());
        let mut req = TransferRequest::new(None, 0);
        Self::new(pipe, Direction::Out, &mut req)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the transfer finished and hand out its callback and report.
    ///
    /// Returns `None` if it already was terminal.
    pub(crate) fn finish(
        &mut self,
        id: TransferId,
        status: CompletionStatus,
    ) -> Option<(Option<CompletionCallback>, Completion)> {
        if self.is_terminal() {
            return None;
        }
        self.status = TransferStatus::from_completion(status);
        self.outcome = Some(status);
        self.deadline = None;
        self.head = None;
        let report = Completion {
            id,
            status,
            actual_length: self.actual,
            frames: core::mem::take(&mut self.frames),
        };
        Some((self.callback.take(), report))
    }
}
