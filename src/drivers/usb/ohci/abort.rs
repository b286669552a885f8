//! Abort engine
//!
//! Taking a transfer away from the controller is a rendezvous: skip the ED,
//! let the current frame finish, force a completion pass so anything the
//! controller already retired is settled normally, and only then free what
//! is left of the chain. Concurrent aborts of the same transfer collapse
//! into one run; the others wait for it and report the same outcome.

use alloc::vec::Vec;

use super::arena::{EdHandle, NodeHandle, NodeKind, Pool, SoftItd, SoftTd};
use super::chain::{free_itd, free_td};
use super::desc::{ED_HEADP, ITD_NEXTITD, TD_NEXTTD, ed};
use super::schedule::ScheduleGraph;
use super::transfer::{AbortState, ChainHead, CompletionStatus, TransferId};
use super::{Finished, OhciController, OhciHost, Schedule, dispatch};

/// Node in the chain starting at `start` whose successor is `target`
fn predecessor<K: NodeKind>(
    pool: &Pool<K>,
    start: NodeHandle<K>,
    target: NodeHandle<K>,
    next: impl Fn(&K::Soft) -> Option<NodeHandle<K>>,
) -> Option<NodeHandle<K>> {
    let mut cur = start;
    loop {
        let succ = next(pool.get(cur)?);
        if succ == Some(target) {
            return Some(cur);
        }
        cur = succ?;
    }
}

impl<H: OhciHost> OhciController<H> {
    /// Cancel a transfer.
    ///
    /// Returns the transfer's final status, which is not `Cancelled` if it
    /// finished before the abort took hold, or `None` if the transfer is no
    /// longer known (already retired and reported).
    pub fn abort(&self, id: TransferId) -> Option<CompletionStatus> {
        self.abort_with(id, CompletionStatus::Cancelled)
    }

    pub(crate) fn abort_with(
        &self,
        id: TransferId,
        reason: CompletionStatus,
    ) -> Option<CompletionStatus> {
        let mut guard = self.sched.lock();
        let s = &mut *guard;
        let xfer = s.transfers.get_mut(id)?;
        if xfer.is_terminal() {
            return xfer.outcome;
        }

        if self.is_dying() {
            // The controller no longer runs the schedule; nothing to wait for
            let finished = self.retire(s, id, reason);
            drop(guard);
            dispatch(finished.into_iter().collect());
            self.host.notify_event();
            return Some(reason);
        }

        xfer.waiters += 1;
        if let AbortState::Aborting(_) = xfer.abort {
            drop(guard);
            return self.await_abort(id);
        }
        xfer.abort = AbortState::Aborting(reason);
        xfer.deadline = None;
        let pipe_id = xfer.pipe;
        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.aborts += 1;
            if pipe.aborts == 1 {
                ScheduleGraph::set_skip(&s.arena.eds, &self.host, pipe.ed, true);
            }
        }
        drop(guard);
        log::debug!("OHCI: aborting transfer {:?} ({:?})", id, reason);

        // Let the controller finish whatever frame may still use the ED,
        // then settle everything it retired meanwhile
        self.host.delay_ms(self.config.abort_settle_ms);
        self.force_pass();

        let finished = {
            let mut guard = self.sched.lock();
            self.abort_cleanup(&mut guard, id, reason)
        };
        dispatch(finished.into_iter().collect());

        let outcome = {
            let mut guard = self.sched.lock();
            let s = &mut *guard;
            let outcome = s.transfers.get_mut(id).and_then(|x| {
                x.abort = AbortState::Active;
                x.outcome
            });
            Self::leave(s, id);
            outcome
        };
        self.host.notify_event();
        outcome
    }

    /// Request a completion pass and wait for one to finish.
    ///
    /// Without a deferred task to run it (polling mode, early init), the
    /// pass is run here once the wait bound expires.
    fn force_pass(&self) {
        let ticket = self.signal.request();
        self.host.schedule_softintr();
        let deadline = self.host.now_ms() + u64::from(self.config.pass_wait_ms);
        while !self.signal.reached(ticket) {
            if self.host.now_ms() >= deadline {
                log::trace!("OHCI: running completion pass inline");
                self.softintr();
                break;
            }
            self.host.wait_event();
        }
    }

    /// Free what the controller did not retire and finish the transfer
    fn abort_cleanup(
        &self,
        s: &mut Schedule,
        id: TransferId,
        reason: CompletionStatus,
    ) -> Option<Finished> {
        let xfer = s.transfers.get(id)?;
        let (pipe_id, head, done) = (xfer.pipe, xfer.head, xfer.is_terminal());
        let pipe = s.pipes.get(pipe_id)?;
        let (ed_h, teardown) = (pipe.ed, pipe.closing);

        let mut finished = None;
        if !done {
            let headp = s
                .arena
                .eds
                .scope(&self.host, ed_h)
                .map_or(0, |scope| scope.read_u32(ED_HEADP));
            let current = headp & ed::HEADMASK;

            // Walk the nodes still owned by the transfer. If the ED points
            // into them, move it past the transfer; otherwise splice the
            // transfer out behind the node that links to it.
            match head {
                Some(ChainHead::Td(first)) => {
                    let pred = s.index.tds.lookup(&s.arena.tds, current).and_then(|start| {
                        predecessor(&s.arena.tds, start, first, |n: &SoftTd| n.next)
                    });
                    let mut hit = false;
                    let mut p = Some(first);
                    while let Some(cur) = p {
                        match s.arena.tds.get(cur) {
                            Some(node) if node.transfer == Some(id) => {
                                hit |= s.arena.tds.phys(cur) == Some(current);
                                p = node.next;
                                free_td(&mut s.arena.tds, &mut s.index.tds, cur);
                            }
                            _ => break,
                        }
                    }
                    let resume = p.and_then(|n| s.arena.tds.phys(n));
                    if hit {
                        self.move_head(s, ed_h, headp, resume);
                    } else if let Some(pred) = pred {
                        if let Some(node) = s.arena.tds.get_mut(pred) {
                            node.next = p;
                        }
                        if let Some(scope) = s.arena.tds.scope(&self.host, pred) {
                            scope.write_u32(TD_NEXTTD, resume.unwrap_or(0));
                        }
                    } else {
                        log::warn!("OHCI: no link into aborted transfer {:?}", id);
                    }
                }
                Some(ChainHead::Itd(first)) => {
                    let pred = s.index.itds.lookup(&s.arena.itds, current).and_then(|start| {
                        predecessor(&s.arena.itds, start, first, |n: &SoftItd| n.next)
                    });
                    let mut hit = false;
                    let mut p = Some(first);
                    while let Some(cur) = p {
                        match s.arena.itds.get(cur) {
                            Some(node) if node.transfer == Some(id) => {
                                hit |= s.arena.itds.phys(cur) == Some(current);
                                p = node.next;
                                free_itd(&mut s.arena.itds, &mut s.index.itds, cur);
                            }
                            _ => break,
                        }
                    }
                    let resume = p.and_then(|n| s.arena.itds.phys(n));
                    if hit {
                        self.move_head(s, ed_h, headp, resume);
                    } else if let Some(pred) = pred {
                        if let Some(node) = s.arena.itds.get_mut(pred) {
                            node.next = p;
                        }
                        if let Some(scope) = s.arena.itds.scope(&self.host, pred) {
                            scope.write_u32(ITD_NEXTITD, resume.unwrap_or(0));
                        }
                    } else {
                        log::warn!("OHCI: no link into aborted transfer {:?}", id);
                    }
                }
                None => {}
            }
            finished = self.retire(s, id, reason);
        }

        if let Some(pipe) = s.pipes.get_mut(pipe_id) {
            pipe.aborts = pipe.aborts.saturating_sub(1);
            if pipe.aborts == 0 && !teardown {
                ScheduleGraph::set_skip(&s.arena.eds, &self.host, ed_h, false);
            }
        }
        finished
    }

    /// Point the ED's head at `resume`, keeping the toggle carry
    fn move_head(&self, s: &Schedule, ed_h: EdHandle, headp: u32, resume: Option<u32>) {
        let Some(resume) = resume else {
            return;
        };
        if let Some(scope) = s.arena.eds.scope(&self.host, ed_h) {
            scope.write_u32(ED_HEADP, resume | (headp & ed::TOGGLECARRY));
        }
    }

    /// Wait for another thread's abort run on `id` to finish
    fn await_abort(&self, id: TransferId) -> Option<CompletionStatus> {
        loop {
            {
                let mut guard = self.sched.lock();
                let s = &mut *guard;
                match s.transfers.get(id) {
                    None => return None,
                    Some(x) if x.abort == AbortState::Active && x.is_terminal() => {
                        let outcome = x.outcome;
                        Self::leave(s, id);
                        return outcome;
                    }
                    Some(_) => {}
                }
            }
            self.host.wait_event();
        }
    }

    /// Synchronous wait used before the deferred task exists.
    ///
    /// Polls the controller once per millisecond; a transfer still running
    /// after `timeout_ms` is aborted with `TimedOut`.
    pub fn wait_for_completion(&self, id: TransferId, timeout_ms: u32) -> Option<CompletionStatus> {
        {
            let mut s = self.sched.lock();
            let xfer = s.transfers.get_mut(id)?;
            if xfer.is_terminal() {
                return xfer.outcome;
            }
            xfer.waiters += 1;
        }

        let mut status = None;
        for _ in 0..timeout_ms {
            self.host.delay_ms(1);
            if self.is_dying() {
                break;
            }
            self.poll();
            let s = self.sched.lock();
            if let Some(x) = s.transfers.get(id).filter(|x| x.is_terminal()) {
                status = x.outcome;
                break;
            }
        }
        if status.is_none() {
            log::warn!("OHCI: transfer {:?} timed out after {} ms", id, timeout_ms);
            status = self.abort_with(id, CompletionStatus::TimedOut);
        }

        let mut guard = self.sched.lock();
        Self::leave(&mut guard, id);
        status
    }

    /// Abort every transfer whose deadline has passed; returns how many
    pub fn expire_timeouts(&self) -> usize {
        let now = self.host.now_ms();
        let expired: Vec<TransferId> = {
            let s = self.sched.lock();
            s.transfers
                .keys()
                .into_iter()
                .filter(|&id| {
                    s.transfers.get(id).is_some_and(|x| {
                        !x.is_terminal()
                            && x.abort == AbortState::Active
                            && x.deadline.is_some_and(|d| d <= now)
                    })
                })
                .collect()
        };
        for &id in &expired {
            log::warn!("OHCI: transfer {:?} timed out", id);
            self.abort_with(id, CompletionStatus::TimedOut);
        }
        expired.len()
    }
}
