//! Per-pipe state

use alloc::collections::VecDeque;

use super::arena::{EdHandle, ItdHandle, TdHandle};
use super::slab::Key;
use super::transfer::TransferId;
use crate::drivers::usb::EndpointAttrs;

pub type PipeId = Key<Pipe>;

/// Unowned node the pipe's ED `tailp` points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    Td(TdHandle),
    Itd(ItdHandle),
}

/// Isochronous frame bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoState {
    /// Frame the next ITD starts in; `None` until the first transfer
    pub next_frame: Option<u32>,
    /// Frames queued and not yet completed
    pub inuse: u32,
}

pub struct Pipe {
    pub(crate) attrs: EndpointAttrs,
    pub(crate) ed: EdHandle,
    pub(crate) tail: Tail,
    /// Transfers in submission order
    pub(crate) pending: VecDeque<TransferId>,
    /// Interrupt tree node, interrupt pipes only
    pub(crate) interrupt_node: Option<usize>,
    pub(crate) iso: IsoState,
    /// Close in progress; no new transfers, skip stays set
    pub(crate) closing: bool,
    /// Abort runs holding the ED skipped
    pub(crate) aborts: u32,
}

impl Pipe {
    pub(crate) fn new(attrs: EndpointAttrs, ed: EdHandle, tail: Tail) -> Self {
        Self {
            attrs,
            ed,
            tail,
            pending: VecDeque::new(),
            interrupt_node: None,
            iso: IsoState::default(),
            closing: false,
            aborts: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> Self {
        use super::arena::NodeHandle;
        use crate::drivers::usb::UsbSpeed;
        Self::new(
            EndpointAttrs::control(1, UsbSpeed::Full, 64),
            NodeHandle::dangling(),
            Tail::Td(NodeHandle::dangling()),
        )
    }

    pub fn attrs(&self) -> &EndpointAttrs {
        &self.attrs
    }

    pub(crate) fn remove_pending(&mut self, id: TransferId) {
        if let Some(pos) = self.pending.iter().position(|&t| t == id) {
            self.pending.remove(pos);
        }
    }
}
