//! Scheduling graph
//!
//! The ED lists the controller walks every frame:
//!
//! - control and bulk lists, each hanging off a skipped anchor ED whose
//!   address is programmed into HcControlHeadED / HcBulkHeadED
//! - the isochronous list, anchored the same way at the very end of the
//!   periodic schedule
//! - a 63-node binary tree of skipped anchor EDs for interrupt endpoints;
//!   its 32 leaves are the HCCA interrupt table entries and its root
//!   chains into the isochronous anchor
//!
//! Every new ED goes in right after its anchor. Interrupt EDs are placed
//! on the tree level matching their polling period, on the node with the
//! least bandwidth reserved so far.

use heapless::Vec as HVec;

use super::arena::{Ed, EdHandle, Pool};
use super::desc::{self, ED_FLAGS, ED_NEXTED, HCCA_INTERRUPT_TABLE, NO_INTRS};
use crate::dma::{AllocMode, DmaError, DmaMemory, DmaRegion};
use crate::drivers::usb::UsbError;

/// Anchor EDs in the interrupt tree
pub const NO_EDS: usize = 2 * NO_INTRS - 1;

/// Bit-reversed leaf order, spreading neighbouring leaves across frames
const REVBITS: [u8; NO_INTRS] = [
    0x00, 0x10, 0x08, 0x18, 0x04, 0x14, 0x0c, 0x1c, 0x02, 0x12, 0x0a, 0x1a, 0x06, 0x16, 0x0e,
    0x1e, 0x01, 0x11, 0x09, 0x19, 0x05, 0x15, 0x0d, 0x1d, 0x03, 0x13, 0x0b, 0x1b, 0x07, 0x17,
    0x0f, 0x1f,
];

pub struct ScheduleGraph {
    pub ctrl_head: EdHandle,
    pub bulk_head: EdHandle,
    pub isoc_head: EdHandle,
    intr_eds: HVec<EdHandle, NO_EDS>,
    /// Pipes reserved per 1 ms slot
    bandwidth: [u32; NO_INTRS],
}

fn anchor<D: DmaMemory + ?Sized>(
    eds: &mut Pool<Ed>,
    dma: &D,
    next: Option<EdHandle>,
) -> Result<EdHandle, DmaError> {
    let ed = eds.allocate(dma, AllocMode::MayBlock)?;
    let next_phys = next.and_then(|n| eds.phys(n)).unwrap_or(0);
    if let Some(scope) = eds.scope(dma, ed) {
        scope.write(desc::HwEd {
            flags: desc::ed::SKIP,
            tailp: 0,
            headp: 0,
            nexted: next_phys,
        });
    }
    if let Some(soft) = eds.get_mut(ed) {
        soft.next = next;
    }
    Ok(ed)
}

impl ScheduleGraph {
    /// Allocate every anchor and program the HCCA interrupt table
    pub fn build<D: DmaMemory + ?Sized>(
        eds: &mut Pool<Ed>,
        dma: &D,
        hcca: &DmaRegion,
    ) -> Result<Self, DmaError> {
        let ctrl_head = anchor(eds, dma, None)?;
        let bulk_head = anchor(eds, dma, None)?;
        let isoc_head = anchor(eds, dma, None)?;

        let mut intr_eds: HVec<EdHandle, NO_EDS> = HVec::new();
        for i in 0..NO_EDS {
            let parent = if i == 0 {
                isoc_head
            } else {
                intr_eds[(i - 1) / 2]
            };
            let ed = anchor(eds, dma, Some(parent))?;
            if intr_eds.push(ed).is_err() {
                return Err(DmaError::OutOfMemory);
            }
        }

        for (leaf, &slot) in REVBITS.iter().enumerate() {
            let phys = eds.phys(intr_eds[NO_INTRS - 1 + leaf]).unwrap_or(0);
            hcca.write(HCCA_INTERRUPT_TABLE + 4 * slot as usize, phys);
        }
        dma.sync(hcca, HCCA_INTERRUPT_TABLE, 4 * NO_INTRS, crate::dma::SyncOp::ForDevice);

        log::debug!(
            "OHCI: schedule built, ctrl head {:#010x}, bulk head {:#010x}",
            eds.phys(ctrl_head).unwrap_or(0),
            eds.phys(bulk_head).unwrap_or(0)
        );

        Ok(Self {
            ctrl_head,
            bulk_head,
            isoc_head,
            intr_eds,
            bandwidth: [0; NO_INTRS],
        })
    }

    /// Link `ed` directly after `head`.
    ///
    /// `ed` takes over `head`'s successor before `head` is pointed at it, so
    /// the controller never sees a truncated list.
    pub fn link_after<D: DmaMemory + ?Sized>(
        eds: &mut Pool<Ed>,
        dma: &D,
        head: EdHandle,
        ed: EdHandle,
    ) {
        let (Some(ed_phys), Some(old_next)) = (eds.phys(ed), eds.get(head).map(|s| s.next)) else {
            log::error!("OHCI: link of dead ED {:?} after {:?}", ed, head);
            return;
        };
        let head_next_phys = eds
            .scope(dma, head)
            .map(|s| s.read_u32(ED_NEXTED))
            .unwrap_or(0);

        if let Some(scope) = eds.scope(dma, ed) {
            scope.write_u32(ED_NEXTED, head_next_phys);
        }
        if let Some(soft) = eds.get_mut(ed) {
            soft.next = old_next;
        }
        if let Some(scope) = eds.scope(dma, head) {
            scope.write_u32(ED_NEXTED, ed_phys);
        }
        if let Some(soft) = eds.get_mut(head) {
            soft.next = Some(ed);
        }
    }

    /// Unlink `ed` from the list starting at `head`.
    ///
    /// The controller may still hold a cached pointer to `ed` for up to one
    /// frame; the caller must wait before reusing it.
    pub fn unlink<D: DmaMemory + ?Sized>(
        eds: &mut Pool<Ed>,
        dma: &D,
        head: EdHandle,
        ed: EdHandle,
    ) -> bool {
        let mut prev = head;
        loop {
            let Some(next) = eds.get(prev).and_then(|s| s.next) else {
                log::warn!("OHCI: {:?} not found on list {:?}", ed, head);
                return false;
            };
            if next == ed {
                break;
            }
            prev = next;
        }

        let ed_next = eds.get(ed).and_then(|s| s.next);
        let ed_next_phys = eds
            .scope(dma, ed)
            .map(|s| s.read_u32(ED_NEXTED))
            .unwrap_or(0);
        if let Some(scope) = eds.scope(dma, prev) {
            scope.write_u32(ED_NEXTED, ed_next_phys);
        }
        if let Some(soft) = eds.get_mut(prev) {
            soft.next = ed_next;
        }
        if let Some(soft) = eds.get_mut(ed) {
            soft.next = None;
        }
        true
    }

    /// Tree node an interrupt endpoint polled every `ival` ms would go to.
    ///
    /// The period is rounded down to a power of two no larger than 32.
    /// Candidates are the nodes of that level; each covers `32 / npoll`
    /// bandwidth slots and the one with the smallest sum wins, lowest index
    /// first.
    pub fn best_interrupt_node(&self, ival: u8) -> Result<usize, UsbError> {
        if ival == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let mut npoll = NO_INTRS;
        while npoll > ival as usize {
            npoll /= 2;
        }
        let slow = npoll - 1;
        let shigh = slow + npoll;
        let nslots = NO_INTRS / npoll;

        let mut best = slow;
        let mut bestbw = u32::MAX;
        for i in slow..shigh {
            let bw: u32 = (0..nslots)
                .map(|j| self.bandwidth[(i * nslots + j) % NO_INTRS])
                .sum();
            if bw < bestbw {
                best = i;
                bestbw = bw;
            }
        }
        Ok(best)
    }

    fn slots_of(node: usize) -> (usize, usize) {
        // node sits on level npoll where npoll - 1 <= node < 2 * npoll - 1
        let npoll = 1usize << (usize::BITS - 1 - (node + 1).leading_zeros());
        (node, NO_INTRS / npoll)
    }

    /// Place an interrupt ED and reserve its bandwidth
    pub fn insert_interrupt<D: DmaMemory + ?Sized>(
        &mut self,
        eds: &mut Pool<Ed>,
        dma: &D,
        ed: EdHandle,
        ival: u8,
    ) -> Result<usize, UsbError> {
        let best = self.best_interrupt_node(ival)?;
        let head = self.intr_eds[best];
        Self::link_after(eds, dma, head, ed);

        let (node, nslots) = Self::slots_of(best);
        for j in 0..nslots {
            self.bandwidth[(node * nslots + j) % NO_INTRS] += 1;
        }
        log::debug!("OHCI: interrupt ED {:?} ival={} at node {}", ed, ival, best);
        Ok(best)
    }

    /// Unlink an interrupt ED placed at `node` and return its bandwidth
    pub fn remove_interrupt<D: DmaMemory + ?Sized>(
        &mut self,
        eds: &mut Pool<Ed>,
        dma: &D,
        ed: EdHandle,
        node: usize,
    ) {
        let Some(head) = self.intr_eds.get(node).copied() else {
            return;
        };
        Self::unlink(eds, dma, head, ed);
        let (node, nslots) = Self::slots_of(node);
        for j in 0..nslots {
            let slot = &mut self.bandwidth[(node * nslots + j) % NO_INTRS];
            *slot = slot.saturating_sub(1);
        }
    }

    /// Pipes reserved per 1 ms slot
    #[cfg(test)]
    pub fn bandwidth(&self) -> &[u32; NO_INTRS] {
        &self.bandwidth
    }

    /// Load a tree node carries: the sum over the slots it covers
    #[cfg(test)]
    pub fn node_load(&self, node: usize) -> u32 {
        let (node, nslots) = Self::slots_of(node);
        (0..nslots)
            .map(|j| self.bandwidth[(node * nslots + j) % NO_INTRS])
            .sum()
    }

    /// Set or clear the skip bit of `ed`
    pub fn set_skip<D: DmaMemory + ?Sized>(eds: &Pool<Ed>, dma: &D, ed: EdHandle, skip: bool) {
        if let Some(scope) = eds.scope(dma, ed) {
            scope.modify_u32(ED_FLAGS, |f| {
                if skip {
                    f | desc::ed::SKIP
                } else {
                    f & !desc::ed::SKIP
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimHost;

    fn graph(host: &SimHost) -> (Pool<Ed>, ScheduleGraph, DmaRegion) {
        let mut eds = Pool::new();
        let hcca = host
            .allocate(desc::HCCA_SIZE, desc::HCCA_ALIGN, AllocMode::MayBlock)
            .unwrap();
        let g = ScheduleGraph::build(&mut eds, host, &hcca).unwrap();
        (eds, g, hcca)
    }

    #[test]
    fn test_tree_shape() {
        let host = SimHost::new();
        let (eds, g, hcca) = graph(&host);
        assert_eq!(eds.outstanding(), 3 + NO_EDS);

        // Every leaf path ends at the isochronous anchor in five hops
        let isoc = eds.phys(g.isoc_head).unwrap();
        for slot in 0..NO_INTRS {
            let mut phys: u32 = hcca.read(HCCA_INTERRUPT_TABLE + 4 * slot).unwrap();
            let mut hops = 0;
            while phys != isoc {
                let ed: desc::HwEd = host.read_phys(phys);
                assert_ne!(ed.flags & desc::ed::SKIP, 0);
                phys = ed.nexted;
                hops += 1;
                assert!(hops <= 6);
            }
            assert_eq!(hops, 6);
        }
    }

    #[test]
    fn test_link_and_unlink() {
        let host = SimHost::new();
        let (mut eds, g, _) = graph(&host);
        let a = eds.allocate(&host, AllocMode::NoWait).unwrap();
        let b = eds.allocate(&host, AllocMode::NoWait).unwrap();
        ScheduleGraph::link_after(&mut eds, &host, g.bulk_head, a);
        ScheduleGraph::link_after(&mut eds, &host, g.bulk_head, b);

        let head: desc::HwEd = host.read_phys(eds.phys(g.bulk_head).unwrap());
        assert_eq!(head.nexted, eds.phys(b).unwrap());
        let eb: desc::HwEd = host.read_phys(eds.phys(b).unwrap());
        assert_eq!(eb.nexted, eds.phys(a).unwrap());

        assert!(ScheduleGraph::unlink(&mut eds, &host, g.bulk_head, a));
        let eb: desc::HwEd = host.read_phys(eds.phys(b).unwrap());
        assert_eq!(eb.nexted, 0);
        assert!(!ScheduleGraph::unlink(&mut eds, &host, g.bulk_head, a));
    }

    #[test]
    fn test_interrupt_period_rounding() {
        let host = SimHost::new();
        let (_, g, _) = graph(&host);
        assert_eq!(g.best_interrupt_node(0), Err(UsbError::InvalidParameter));
        assert_eq!(g.best_interrupt_node(1), Ok(0));
        // 3 ms rounds down to 2 ms: level 2 nodes are 1 and 2
        assert_eq!(g.best_interrupt_node(3), Ok(1));
        // 255 ms rounds down to 32 ms: leaves start at 31
        assert_eq!(g.best_interrupt_node(255), Ok(31));
    }

    #[test]
    fn test_interrupt_balance_within_one_pipe() {
        for &ival in &[1u8, 2, 4, 8, 16, 32] {
            for n in 1..=40usize {
                let host = SimHost::new();
                let (mut eds, mut g, _) = graph(&host);
                for _ in 0..n {
                    let ed = eds.allocate(&host, AllocMode::NoWait).unwrap();
                    g.insert_interrupt(&mut eds, &host, ed, ival).unwrap();
                }
                let mut npoll = NO_INTRS;
                while npoll > ival as usize {
                    npoll /= 2;
                }
                let loads: alloc::vec::Vec<u32> =
                    (npoll - 1..2 * npoll - 1).map(|i| g.node_load(i)).collect();
                let per_pipe = (NO_INTRS / npoll) as u32;
                let max = *loads.iter().max().unwrap();
                let optimal = n.div_ceil(npoll) as u32 * per_pipe;
                assert!(max <= optimal + per_pipe, "ival={} n={}", ival, n);
            }
        }
    }

    #[test]
    fn test_mixed_periods_pick_least_loaded_node() {
        let host = SimHost::new();
        let (mut eds, mut g, _) = graph(&host);
        let mut place = |g: &mut ScheduleGraph, ival| {
            let ed = eds.allocate(&host, AllocMode::NoWait).unwrap();
            g.insert_interrupt(&mut eds, &host, ed, ival).unwrap()
        };
        // 1 ms loads every slot once
        assert_eq!(place(&mut g, 1), 0);
        // 8 ms nodes 7, 8 and 9 cover slots 28-31, 0-3 and 4-7
        assert_eq!(place(&mut g, 8), 7);
        assert_eq!(place(&mut g, 8), 8);
        assert_eq!(place(&mut g, 8), 9);
        // node 1 (slots 16-31) carries 20, node 2 (slots 0-15) carries 24
        assert_eq!(place(&mut g, 2), 1);
        // 4 ms: node 5 covers slots 8-15, untouched by anything but 1 ms
        assert_eq!(place(&mut g, 4), 5);
        assert_eq!(g.node_load(5), 16);
        assert_eq!(g.bandwidth().iter().sum::<u32>(), 32 + 3 * 4 + 16 + 8);
    }

    #[test]
    fn test_remove_interrupt_returns_bandwidth() {
        let host = SimHost::new();
        let (mut eds, mut g, _) = graph(&host);
        let a = eds.allocate(&host, AllocMode::NoWait).unwrap();
        let b = eds.allocate(&host, AllocMode::NoWait).unwrap();
        let na = g.insert_interrupt(&mut eds, &host, a, 8).unwrap();
        let nb = g.insert_interrupt(&mut eds, &host, b, 8).unwrap();
        assert_ne!(na, nb);
        g.remove_interrupt(&mut eds, &host, a, na);
        assert_eq!(g.node_load(na), 0);
        assert_eq!(g.best_interrupt_node(8), Ok(na));
        assert_eq!(g.bandwidth().iter().sum::<u32>(), 4);
    }
}
