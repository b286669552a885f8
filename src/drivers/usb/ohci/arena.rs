//! Descriptor arena
//!
//! Pools of DMA-visible ED, TD and ITD nodes. Each pool grows by whole
//! chunks carved out of one DMA allocation and never shrinks while the
//! controller lives. Nodes are named by generation-checked handles, so a
//! handle kept past its node's release stops resolving instead of aliasing
//! the next owner.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::marker::PhantomData;

use super::desc::{HwEd, HwItd, HwTd};
use super::pipe::PipeId;
use super::transfer::TransferId;
use crate::dma::{AllocMode, DmaError, DmaMemory, DmaRegion, SyncScope};

/// One kind of pooled descriptor
pub trait NodeKind: Sized + 'static {
    const NAME: &'static str;
    /// Hardware descriptor size in bytes
    const SIZE: usize;
    /// Hardware alignment requirement
    const ALIGN: usize;
    /// Nodes carved from one chunk
    const CHUNK: usize;
    /// Software shadow state
    type Soft: Default;

    fn chunk_bytes() -> usize {
        Self::SIZE * Self::CHUNK
    }
}

/// Endpoint descriptor node
pub enum Ed {}
/// General transfer descriptor node
pub enum Td {}
/// Isochronous transfer descriptor node
pub enum Itd {}

impl NodeKind for Ed {
    const NAME: &'static str = "ED";
    const SIZE: usize = core::mem::size_of::<HwEd>();
    const ALIGN: usize = core::mem::align_of::<HwEd>();
    const CHUNK: usize = 64;
    type Soft = SoftEd;
}

impl NodeKind for Td {
    const NAME: &'static str = "TD";
    const SIZE: usize = core::mem::size_of::<HwTd>();
    const ALIGN: usize = core::mem::align_of::<HwTd>();
    const CHUNK: usize = 128;
    type Soft = SoftTd;
}

impl NodeKind for Itd {
    const NAME: &'static str = "ITD";
    const SIZE: usize = core::mem::size_of::<HwItd>();
    const ALIGN: usize = core::mem::align_of::<HwItd>();
    const CHUNK: usize = 64;
    type Soft = SoftItd;
}

/// Generation-checked reference to a pooled node
pub struct NodeHandle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for NodeHandle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for NodeHandle<K> {}

impl<K> PartialEq for NodeHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for NodeHandle<K> {}

impl<K> NodeHandle<K> {
    /// A handle that never resolves
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self {
            index: u32::MAX,
            generation: 0,
            _kind: PhantomData,
        }
    }
}

impl<K: NodeKind> core::fmt::Debug for NodeHandle<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}.{}", K::NAME, self.index, self.generation)
    }
}

pub type EdHandle = NodeHandle<Ed>;
pub type TdHandle = NodeHandle<Td>;
pub type ItdHandle = NodeHandle<Itd>;

bitflags! {
    /// Completion bookkeeping flags of a TD or ITD
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Last node of its transfer; retiring it completes the transfer
        const CALL_DONE = 1 << 0;
        /// Bytes moved by this node count toward the actual length
        const ADD_LEN = 1 << 1;
    }
}

/// Shadow of an endpoint descriptor
#[derive(Debug, Default)]
pub struct SoftEd {
    /// Next ED in the schedule list (software view of `nexted`)
    pub next: Option<EdHandle>,
    /// Owning pipe; `None` for schedule anchors
    pub pipe: Option<PipeId>,
}

/// Shadow of a general transfer descriptor
#[derive(Debug, Default)]
pub struct SoftTd {
    pub next: Option<TdHandle>,
    /// Owning transfer; `None` while the node is a tail sentinel
    pub transfer: Option<TransferId>,
    /// Bytes this node was built to move
    pub len: u32,
    pub flags: NodeFlags,
    pub hash_next: Option<TdHandle>,
}

/// Shadow of an isochronous transfer descriptor
#[derive(Debug, Default)]
pub struct SoftItd {
    pub next: Option<ItdHandle>,
    pub transfer: Option<TransferId>,
    /// Index of this node's first frame inside its transfer
    pub frame_base: u16,
    pub nframes: u8,
    /// Controller frame number the node starts in
    pub start_frame: u16,
    pub flags: NodeFlags,
    pub hash_next: Option<ItdHandle>,
}

struct Slot<S> {
    region: DmaRegion,
    generation: u32,
    live: bool,
    soft: S,
}

/// Free-list pool of one descriptor kind
pub struct Pool<K: NodeKind> {
    slots: Vec<Slot<K::Soft>>,
    free: Vec<u32>,
    chunks: Vec<DmaRegion>,
    allocated: u64,
    released: u64,
}

impl<K: NodeKind> Pool<K> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            chunks: Vec::new(),
            allocated: 0,
            released: 0,
        }
    }

    /// Carve a freshly mapped chunk into free nodes
    pub fn adopt_chunk(&mut self, chunk: DmaRegion) {
        let count = chunk.len() / K::SIZE;
        for i in 0..count {
            let Some(region) = chunk.sub(i * K::SIZE, K::SIZE) else {
                break;
            };
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                region,
                generation: 0,
                live: false,
                soft: K::Soft::default(),
            });
            self.free.push(index);
        }
        log::trace!("arena: {} pool grew by {} nodes", K::NAME, count);
        self.chunks.push(chunk);
    }

    /// Take a node from the free list, growing the pool if it is empty
    pub fn allocate<D: DmaMemory + ?Sized>(
        &mut self,
        dma: &D,
        mode: AllocMode,
    ) -> Result<NodeHandle<K>, DmaError> {
        if self.free.is_empty() {
            let chunk = dma.allocate(K::chunk_bytes(), K::ALIGN, mode)?;
            self.adopt_chunk(chunk);
        }
        let index = self.free.pop().ok_or(DmaError::OutOfMemory)?;
        let slot = &mut self.slots[index as usize];
        slot.live = true;
        self.allocated += 1;
        Ok(NodeHandle {
            index,
            generation: slot.generation,
            _kind: PhantomData,
        })
    }

    /// Return a node to the free list.
    ///
    /// Releasing a stale handle is a consistency violation: it is logged and
    /// ignored.
    pub fn release(&mut self, handle: NodeHandle<K>) -> bool {
        let Some(slot) = self.live_slot_mut(handle) else {
            log::error!("arena: release of dead {:?}", handle);
            return false;
        };
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.soft = K::Soft::default();
        self.free.push(handle.index);
        self.released += 1;
        true
    }

    fn live_slot(&self, handle: NodeHandle<K>) -> Option<&Slot<K::Soft>> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then_some(slot)
    }

    fn live_slot_mut(&mut self, handle: NodeHandle<K>) -> Option<&mut Slot<K::Soft>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then_some(slot)
    }

    pub fn get(&self, handle: NodeHandle<K>) -> Option<&K::Soft> {
        self.live_slot(handle).map(|s| &s.soft)
    }

    pub fn get_mut(&mut self, handle: NodeHandle<K>) -> Option<&mut K::Soft> {
        self.live_slot_mut(handle).map(|s| &mut s.soft)
    }

    /// CPU access to a live node's hardware descriptor
    pub fn scope<'a, D: DmaMemory + ?Sized>(
        &self,
        dma: &'a D,
        handle: NodeHandle<K>,
    ) -> Option<SyncScope<'a, D>> {
        self.live_slot(handle).map(|s| SyncScope::new(dma, s.region))
    }

    /// Physical address of a live node
    pub fn phys(&self, handle: NodeHandle<K>) -> Option<u32> {
        self.live_slot(handle).map(|s| s.region.phys())
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    /// Nodes currently handed out
    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Give every chunk back to the DMA allocator; all handles die
    pub fn drain<D: DmaMemory + ?Sized>(&mut self, dma: &D) {
        self.slots.clear();
        self.free.clear();
        for chunk in self.chunks.drain(..) {
            dma.release(chunk);
        }
    }
}

impl<K: NodeKind> Default for Pool<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// All descriptor pools of one controller
#[derive(Default)]
pub struct Arena {
    pub eds: Pool<Ed>,
    pub tds: Pool<Td>,
    pub itds: Pool<Itd>,
}

impl Arena {
    pub const fn new() -> Self {
        Self {
            eds: Pool::new(),
            tds: Pool::new(),
            itds: Pool::new(),
        }
    }

    pub fn drain<D: DmaMemory + ?Sized>(&mut self, dma: &D) {
        self.eds.drain(dma);
        self.tds.drain(dma);
        self.itds.drain(dma);
    }
}
