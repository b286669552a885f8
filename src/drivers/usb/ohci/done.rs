//! Completion engine
//!
//! The controller retires descriptors by pushing them onto the done list,
//! newest first, and writing its head to the HCCA. One pass takes that
//! list, reverses it into execution order and settles each node's
//! transfer. Passes are serialized; callbacks run after the structure lock
//! has been released, in the order the transfers finished.

use alloc::vec;
use alloc::vec::Vec;

use super::arena::{ItdHandle, NodeFlags, TdHandle};
use super::chain::{free_itd, free_td};
use super::desc::{
    ConditionCode, ED_HEADP, HCCA_DONE_HEAD, HwItd, HwTd, cc, ed, itd, td,
};
use super::hash::DoneNode;
use super::pipe::Pipe;
use super::regs::{OhciReg, command, intr};
use super::transfer::{ChainHead, CompletionStatus, FrameResult};
use super::{Finished, OhciController, OhciHost, Schedule, dispatch};
use crate::dma::SyncScope;
use crate::drivers::usb::{Direction, EndpointType};

impl<H: OhciHost> OhciController<H> {
    /// Deferred half of the interrupt handler: process the done list.
    ///
    /// Runs in task context; the platform schedules it on WDH and the abort
    /// engine forces it.
    pub fn softintr(&self) {
        let _pass = self.pass.lock();
        let ticket = self.signal.begin();
        let finished = {
            let mut guard = self.sched.lock();
            self.process_done(&mut guard)
        };
        dispatch(finished);
        self.signal.complete(ticket);
        self.host.notify_event();
    }

    /// Take the done head from the HCCA and hand WDH back to the controller
    fn take_done_head(&self) -> u32 {
        let done = self
            .hcca
            .sub(HCCA_DONE_HEAD, 4)
            .map(|region| {
                let scope = SyncScope::new(&self.host, region);
                let done = scope.read_u32(0);
                scope.write_u32(0, 0);
                done
            })
            .unwrap_or(0);

        if !self.is_dying() {
            let mut st = self.intr.lock();
            self.host.write_reg(OhciReg::InterruptStatus, intr::WDH);
            st.eintrs |= intr::WDH;
            self.host.write_reg(OhciReg::InterruptEnable, intr::WDH);
        }
        // The low bit flags other pending interrupts, not an address
        done & !super::regs::DONE_INTRS
    }

    fn process_done(&self, s: &mut Schedule) -> Vec<Finished> {
        let done = self.take_done_head();
        let mut finished = Vec::new();
        if done == 0 {
            return finished;
        }

        for node in self.reverse_done_list(s, done) {
            match node {
                DoneNode::Td(h) => self.retire_td(s, h, &mut finished),
                DoneNode::Itd(h) => self.retire_itd(s, h, &mut finished),
            }
        }
        finished
    }

    /// Resolve the newest-first done list into oldest-first node handles.
    ///
    /// An address that resolves to no live node ends the walk: whatever it
    /// links to cannot be trusted.
    fn reverse_done_list(&self, s: &Schedule, head: u32) -> Vec<DoneNode> {
        let limit = s.arena.tds.outstanding() + s.arena.itds.outstanding();
        let mut nodes = Vec::new();
        let mut phys = head;
        while phys != 0 {
            if nodes.len() > limit {
                log::error!("OHCI: done list loops at {:#010x}", phys);
                break;
            }
            let Some(node) = s.index.resolve(&s.arena.tds, &s.arena.itds, phys) else {
                log::warn!("OHCI: done list entry {:#010x} is not a known TD", phys);
                break;
            };
            let next = match node {
                DoneNode::Td(h) => s
                    .arena
                    .tds
                    .scope(&self.host, h)
                    .and_then(|scope| scope.read::<HwTd>())
                    .map_or(0, |hw| hw.nexttd),
                DoneNode::Itd(h) => s
                    .arena
                    .itds
                    .scope(&self.host, h)
                    .and_then(|scope| scope.read::<HwItd>())
                    .map_or(0, |hw| hw.nextitd),
            };
            nodes.push(node);
            phys = next & ed::HEADMASK;
        }
        nodes.reverse();
        nodes
    }

    fn retire_td(&self, s: &mut Schedule, h: TdHandle, finished: &mut Vec<Finished>) {
        // Released earlier in this pass by a halt recovery
        let Some(soft) = s.arena.tds.get(h) else {
            return;
        };
        let (owner, next, len, flags) = (soft.transfer, soft.next, soft.len, soft.flags);
        let Some(id) = owner else {
            log::warn!("OHCI: tail sentinel {:?} on the done list", h);
            return;
        };
        let Some(hw) = s
            .arena
            .tds
            .scope(&self.host, h)
            .and_then(|scope| scope.read::<HwTd>())
        else {
            return;
        };
        let code = td::get_cc(hw.flags);
        if code & cc::NOT_ACCESSED_MASK == cc::NOT_ACCESSED {
            log::warn!("OHCI: {:?} retired but never accessed", h);
            return;
        }

        let Some(xfer) = s.transfers.get_mut(id).filter(|x| !x.is_terminal()) else {
            // Owner already finished (aborted or failed); only the node is left
            free_td(&mut s.arena.tds, &mut s.index.tds, h);
            return;
        };

        if flags.contains(NodeFlags::ADD_LEN) {
            let moved = if hw.cbp == 0 {
                len
            } else {
                len.saturating_sub(hw.be.wrapping_sub(hw.cbp).wrapping_add(1))
            };
            xfer.actual += moved;
        }

        if code == cc::NO_ERROR {
            if xfer.head == Some(ChainHead::Td(h)) {
                xfer.head = next.map(ChainHead::Td);
            }
            free_td(&mut s.arena.tds, &mut s.index.tds, h);
            if flags.contains(NodeFlags::CALL_DONE) {
                finished.extend(self.retire(s, id, CompletionStatus::Completed));
            }
            return;
        }

        let pipe_id = xfer.pipe;
        let condition = ConditionCode::from_bits(code);
        log::debug!("OHCI: transfer {:?} failed at {:?}: {:?}", id, h, condition);

        // The ED halted on this node; drop the rest of the transfer and
        // restart the queue at whatever follows it
        let mut p = Some(h);
        while let Some(cur) = p {
            match s.arena.tds.get(cur) {
                Some(node) if node.transfer == Some(id) => {
                    p = node.next;
                    free_td(&mut s.arena.tds, &mut s.index.tds, cur);
                }
                _ => break,
            }
        }
        match (p.and_then(|n| s.arena.tds.phys(n)), s.pipes.get(pipe_id)) {
            (Some(resume), Some(pipe)) => self.restart_queue(s, pipe, resume),
            _ => log::error!("OHCI: no queue left after failed transfer {:?}", id),
        }

        finished.extend(self.retire(s, id, CompletionStatus::from_condition(condition)));
    }

    /// Point a halted ED at `resume` and tell the controller the list has
    /// work again
    fn restart_queue(&self, s: &Schedule, pipe: &Pipe, resume: u32) {
        if let Some(scope) = s.arena.eds.scope(&self.host, pipe.ed) {
            scope.write_u32(ED_HEADP, resume);
        }
        match pipe.attrs.kind {
            EndpointType::Control => self.host.write_reg(OhciReg::CommandStatus, command::CLF),
            EndpointType::Bulk => self.host.write_reg(OhciReg::CommandStatus, command::BLF),
            EndpointType::Interrupt | EndpointType::Isochronous => {}
        }
    }

    /// ITDs are settled as a group when the transfer's last one retires
    fn retire_itd(&self, s: &mut Schedule, h: ItdHandle, finished: &mut Vec<Finished>) {
        let Some(soft) = s.arena.itds.get(h) else {
            return;
        };
        let (owner, last) = (soft.transfer, soft.flags.contains(NodeFlags::CALL_DONE));
        let Some(id) = owner else {
            log::warn!("OHCI: tail sentinel {:?} on the done list", h);
            return;
        };
        let Some(xfer) = s.transfers.get(id).filter(|x| !x.is_terminal()) else {
            free_itd(&mut s.arena.itds, &mut s.index.itds, h);
            return;
        };
        if !last {
            return;
        }
        let Some(ChainHead::Itd(first)) = xfer.head else {
            log::error!("OHCI: isochronous transfer {:?} has no ITD chain", id);
            return;
        };
        let direction = xfer.direction;
        let requested = xfer.requested_frames.clone();

        let mut frames = vec![
            FrameResult {
                length: 0,
                status: ConditionCode::NotAccessed,
            };
            requested.len()
        ];
        let mut status = CompletionStatus::Completed;
        let mut actual = 0u32;
        let mut cur = Some(first);
        while let Some(node) = cur {
            let Some(soft) = s.arena.itds.get(node).filter(|n| n.transfer == Some(id)) else {
                log::error!("OHCI: ITD chain of {:?} broken at {:?}", id, node);
                break;
            };
            let (next, base, count, done) = (
                soft.next,
                soft.frame_base as usize,
                soft.nframes as usize,
                soft.flags.contains(NodeFlags::CALL_DONE),
            );
            if let Some(hw) = s
                .arena
                .itds
                .scope(&self.host, node)
                .and_then(|scope| scope.read::<HwItd>())
            {
                let code = itd::get_cc(hw.flags);
                if code != cc::NO_ERROR && status == CompletionStatus::Completed {
                    status = CompletionStatus::IoError(ConditionCode::from_bits(code));
                }
                for (j, &psw) in hw.offset.iter().take(count).enumerate() {
                    let Some(slot) = frames.get_mut(base + j) else {
                        break;
                    };
                    let pcc = itd::psw_cc(psw);
                    *slot = if pcc & cc::NOT_ACCESSED_MASK == cc::NOT_ACCESSED {
                        FrameResult {
                            length: 0,
                            status: ConditionCode::NotAccessed,
                        }
                    } else {
                        let length = match direction {
                            Direction::In => itd::psw_len(psw) as u16,
                            _ if pcc == cc::NO_ERROR => requested[base + j],
                            _ => 0,
                        };
                        FrameResult {
                            length,
                            status: ConditionCode::from_bits(pcc),
                        }
                    };
                    actual += u32::from(slot.length);
                }
            }
            free_itd(&mut s.arena.itds, &mut s.index.itds, node);
            if done {
                break;
            }
            cur = next;
        }

        if let Some(xfer) = s.transfers.get_mut(id) {
            xfer.frames = frames;
            xfer.actual = actual;
        }
        finished.extend(self.retire(s, id, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::ohci::transfer::TransferRequest;
    use crate::drivers::usb::ohci::{CompletionStatus, TransferFlags, TransferId};
    use crate::testing::{TdOutcome, bulk_in, bulk_out, controller, iso_in, iso_out};
    use alloc::sync::Arc;
    use spin::Mutex;

    type Log = Arc<Mutex<Vec<(TransferId, CompletionStatus, u32)>>>;

    fn recorder(log: &Log) -> impl FnOnce(crate::drivers::usb::ohci::Completion) + Send + 'static {
        let log = log.clone();
        move |c| log.lock().push((c.id, c.status, c.actual_length))
    }

    #[test]
    fn test_completion_order_per_pipe_with_interleaving() {
        let ctl = controller();
        let host = ctl.host();
        let a = ctl.open(bulk_out(2, 1, 64)).unwrap();
        let b = ctl.open(bulk_out(3, 2, 64)).unwrap();
        let buf = host.dma_buffer(4096);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let mut on_a = Vec::new();
        let mut on_b = Vec::new();
        for i in 0..4u32 {
            let len = 64 * (i + 1);
            on_a.push(
                ctl.enqueue(a, TransferRequest::new(Some(buf), len).on_complete(recorder(&log)))
                    .unwrap(),
            );
            on_b.push(
                ctl.enqueue(b, TransferRequest::new(Some(buf), len).on_complete(recorder(&log)))
                    .unwrap(),
            );
        }
        host.run_frame();
        ctl.poll();

        let log = log.lock();
        assert_eq!(log.len(), 8);
        let seen_a: Vec<_> = log.iter().filter(|e| on_a.contains(&e.0)).map(|e| e.0).collect();
        let seen_b: Vec<_> = log.iter().filter(|e| on_b.contains(&e.0)).map(|e| e.0).collect();
        assert_eq!(seen_a, on_a);
        assert_eq!(seen_b, on_b);
        assert!(log.iter().all(|e| e.1 == CompletionStatus::Completed));
    }

    #[test]
    fn test_stall_mid_chain_restarts_queue_after_transfer() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(bulk_out(2, 1, 64)).unwrap();
        let buf = host.dma_buffer(5 * 8192);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        // First transfer spans several TDs; the second TD stalls
        let first = ctl
            .enqueue(
                pipe,
                TransferRequest::new(Some(buf), 4 * 8192).on_complete(recorder(&log)),
            )
            .unwrap();
        let second = ctl
            .enqueue(pipe, TransferRequest::new(Some(buf), 64).on_complete(recorder(&log)))
            .unwrap();
        let second_head = {
            let s = ctl.sched.lock();
            match s.transfers.get(second).unwrap().head {
                Some(ChainHead::Td(h)) => s.arena.tds.phys(h).unwrap(),
                _ => panic!("no chain"),
            }
        };

        host.script(TdOutcome::Complete);
        host.script(TdOutcome::Stall);
        host.run_frame();
        ctl.poll();

        {
            let log = log.lock();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].0, first);
            assert_eq!(log[0].1, CompletionStatus::Stalled);
        }
        // ED head now at the second transfer, halt cleared
        let headp = {
            let s = ctl.sched.lock();
            let ed_h = s.pipes.get(pipe).unwrap().ed;
            host.read_phys::<crate::drivers::usb::ohci::desc::HwEd>(s.arena.eds.phys(ed_h).unwrap())
                .headp
        };
        assert_eq!(headp & ed::HEADMASK, second_head);
        assert_eq!(headp & ed::HALTED, 0);
        assert_eq!(host.command_writes(command::BLF), 3);

        let stats = ctl.stats();
        // second transfer's TD plus the tail
        assert_eq!(stats.tds, 2);
        assert_eq!(stats.indexed, 2);

        host.run_frame();
        ctl.poll();
        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], (second, CompletionStatus::Completed, 64));
    }

    #[test]
    fn test_short_packet_accounting() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(bulk_in(2, 1, 64)).unwrap();
        let buf = host.dma_buffer(512);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        ctl.enqueue(
            pipe,
            TransferRequest::new(Some(buf), 512)
                .flags(TransferFlags::SHORT_OK)
                .on_complete(recorder(&log)),
        )
        .unwrap();
        host.script(TdOutcome::Short(100));
        host.run_frame();
        ctl.poll();
        let log = log.lock();
        assert_eq!(log[0].1, CompletionStatus::Completed);
        assert_eq!(log[0].2, 100);
    }

    #[test]
    fn test_short_packet_without_short_ok_is_an_error() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(bulk_in(2, 1, 64)).unwrap();
        let buf = host.dma_buffer(512);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        ctl.enqueue(pipe, TransferRequest::new(Some(buf), 512).on_complete(recorder(&log)))
            .unwrap();
        host.script(TdOutcome::Short(100));
        host.run_frame();
        ctl.poll();
        let log = log.lock();
        assert_eq!(
            log[0].1,
            CompletionStatus::IoError(ConditionCode::DataUnderrun)
        );
        assert_eq!(log[0].2, 100);
    }

    #[test]
    fn test_crc_error_classified() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(bulk_out(2, 1, 64)).unwrap();
        let buf = host.dma_buffer(64);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        ctl.enqueue(pipe, TransferRequest::new(Some(buf), 64).on_complete(recorder(&log)))
            .unwrap();
        host.script(TdOutcome::Crc);
        host.run_frame();
        ctl.poll();
        let status = log.lock()[0].1;
        assert_eq!(status, CompletionStatus::IoError(ConditionCode::Crc));
        if let CompletionStatus::IoError(code) = status {
            assert!(code.is_transmission_error());
        }
    }

    #[test]
    fn test_conservation_under_mixed_traffic() {
        let ctl = controller();
        let host = ctl.host();
        let pipes = [
            ctl.open(bulk_out(2, 1, 64)).unwrap(),
            ctl.open(bulk_in(2, 2, 64)).unwrap(),
        ];
        let buf = host.dma_buffer(3 * 8192);
        let mut outcomes = [TdOutcome::Complete, TdOutcome::Stall, TdOutcome::Crc].iter().cycle();
        for round in 0..6u32 {
            for &pipe in &pipes {
                ctl.enqueue(pipe, TransferRequest::new(Some(buf), 1000 + round * 3000))
                    .unwrap();
            }
            host.script(*outcomes.next().unwrap());
            host.run_frame();
            ctl.poll();

            let stats = ctl.stats();
            assert_eq!(stats.indexed, stats.tds + stats.itds);
            assert_eq!(stats.allocated - stats.released, (stats.tds + stats.itds) as u64);
        }
        host.run_frame();
        ctl.poll();
        let stats = ctl.stats();
        assert_eq!(stats.transfers, 0);
        // only the two tail sentinels are left
        assert_eq!(stats.tds, 2);
    }

    #[test]
    fn test_unknown_done_address_stops_walk() {
        let ctl = controller();
        let host = ctl.host();
        host.write_done_head(0x0DEA_D000);
        host.raise(intr::WDH);
        ctl.poll();
        assert_eq!(ctl.stats().transfers, 0);
        assert_ne!(host.reg(OhciReg::InterruptEnable) & intr::WDH, 0);
    }

    #[test]
    fn test_iso_in_per_frame_results() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(iso_in(4, 1, 192)).unwrap();
        let buf = host.dma_buffer(12 * 192);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        ctl.enqueue(
            pipe,
            TransferRequest::isochronous(buf, vec![192; 12])
                .on_complete(move |c| *r.lock() = Some(c)),
        )
        .unwrap();
        {
            let s = ctl.sched.lock();
            let p = s.pipes.get(pipe).unwrap();
            assert_eq!(p.iso.inuse, 12);
            assert_eq!(p.iso.next_frame, Some(host.frame_number() + 5 + 12));
        }

        // frame 3 comes back short, frame 7 never happened
        host.script_iso_frame(3, TdOutcome::Short(100));
        host.script_iso_frame(7, TdOutcome::NotAccessed);
        host.run_frame();
        ctl.poll();

        let c = result.lock().take().unwrap();
        assert_eq!(c.status, CompletionStatus::Completed);
        assert_eq!(c.frames.len(), 12);
        assert_eq!(c.frames[3].length, 100);
        assert_eq!(c.frames[7].length, 0);
        assert_eq!(c.frames[7].status, ConditionCode::NotAccessed);
        assert_eq!(c.frames[0].status, ConditionCode::NoError);
        assert_eq!(c.actual_length, 10 * 192 + 100);

        let s = ctl.sched.lock();
        assert_eq!(s.pipes.get(pipe).unwrap().iso.inuse, 0);
        assert_eq!(s.arena.itds.outstanding(), 1);
    }

    #[test]
    fn test_iso_out_reports_requested_lengths() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(iso_out(4, 2, 64)).unwrap();
        let buf = host.dma_buffer(4 * 64);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        ctl.enqueue(
            pipe,
            TransferRequest::isochronous(buf, vec![64, 32, 64, 16])
                .on_complete(move |c| *r.lock() = Some(c)),
        )
        .unwrap();
        host.run_frame();
        ctl.poll();
        let c = result.lock().take().unwrap();
        let lengths: Vec<u16> = c.frames.iter().map(|f| f.length).collect();
        assert_eq!(lengths, vec![64, 32, 64, 16]);
        assert_eq!(c.actual_length, 176);
    }

    #[test]
    fn test_iso_frame_cursor_continues_across_transfers() {
        let ctl = controller();
        let host = ctl.host();
        let pipe = ctl.open(iso_out(4, 2, 64)).unwrap();
        let buf = host.dma_buffer(20 * 64);
        ctl.enqueue(pipe, TransferRequest::isochronous(buf, vec![64; 10]))
            .unwrap();
        let second = ctl
            .enqueue(pipe, TransferRequest::isochronous(buf, vec![64; 10]))
            .unwrap();
        let s = ctl.sched.lock();
        let Some(ChainHead::Itd(first_itd)) = s.transfers.get(second).unwrap().head else {
            panic!("no chain");
        };
        let hw: HwItd = host.read_phys(s.arena.itds.phys(first_itd).unwrap());
        assert_eq!(hw.flags & itd::SF_MASK, (host.frame_number() + 5 + 10) & 0xFFFF);
    }
}
